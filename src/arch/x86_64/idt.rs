/*
 * Interrupt Descriptor Table (IDT) Implementation
 *
 * Every one of the 256 vectors gets a 16-byte entry stub generated below.
 * The stubs normalize the stack (a dummy error code is pushed for vectors
 * where the CPU does not push one), load the vector number into EDI and jump
 * to a common path that saves the caller-saved registers and calls
 * `inmate_handle_trap`.
 *
 * Vectors 0-31 are processor exceptions: they are reported on the log and
 * the CPU is halted, since an inmate has nothing to recover into. Vectors
 * 32-255 are handed to `interrupts::handle_interrupt`, which runs the
 * registered handler and sends EOI.
 *
 * Stack on entry to `inmate_handle_trap` (frame pointer in RSI):
 *
 *   [rsi + 0x00] saved RDI
 *   [rsi + 0x08] error code (0 if the CPU pushed none)
 *   [rsi + 0x10] RIP, CS, RFLAGS, RSP, SS pushed by the CPU
 *
 * The common path never touches SSE state; handlers built for the
 * soft-float bare-metal target do not use it either.
 */

use core::arch::global_asm;
use core::fmt;

use lazy_static::lazy_static;
use x86_64::VirtAddr;
use x86_64::structures::idt::InterruptDescriptorTable;

use super::halt;

/// Size of one entry stub in `inmate_int_entry`.
const STUB_SIZE: u64 = 16;

/// Vectors whose exception pushes an error code (bit n set for vector n).
const ERROR_CODE_VECTORS: u32 = 0x6022_7d00;

global_asm!(
    ".pushsection .text",
    ".balign 16",
    ".global inmate_int_entry",
    "inmate_int_entry:",
    ".set vector, 0",
    ".rept 256",
    "    .balign 16",
    "    .if vector < 32",
    "        .if ((0x60227d00 >> vector) & 1) == 0",
    "            pushq $0",
    "        .endif",
    "    .else",
    "        pushq $0",
    "    .endif",
    "    pushq %rdi",
    "    movl $vector, %edi",
    "    jmp inmate_int_common",
    "    .set vector, vector + 1",
    ".endr",
    "",
    "inmate_int_common:",
    "    pushq %rax",
    "    pushq %rcx",
    "    pushq %rdx",
    "    pushq %rsi",
    "    pushq %r8",
    "    pushq %r9",
    "    pushq %r10",
    "    pushq %r11",
    "    leaq 64(%rsp), %rsi",
    "    subq $8, %rsp",
    "    cld",
    "    call {handler}",
    "    addq $8, %rsp",
    "    popq %r11",
    "    popq %r10",
    "    popq %r9",
    "    popq %r8",
    "    popq %rsi",
    "    popq %rdx",
    "    popq %rcx",
    "    popq %rax",
    "    popq %rdi",
    "    addq $8, %rsp",
    "    iretq",
    ".popsection",
    handler = sym inmate_handle_trap,
    options(att_syntax),
);

unsafe extern "C" {
    static inmate_int_entry: u8;
}

/// Register state saved by the entry stub and the CPU.
#[repr(C)]
pub struct TrapFrame {
    pub rdi: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl fmt::Debug for TrapFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrapFrame")
            .field("error_code", &format_args!("{:#x}", self.error_code))
            .field("rip", &format_args!("{:#x}", self.rip))
            .field("cs", &format_args!("{:#x}", self.cs))
            .field("rflags", &format_args!("{:#x}", self.rflags))
            .field("rsp", &format_args!("{:#x}", self.rsp))
            .finish()
    }
}

fn stub_address(vector: u8) -> VirtAddr {
    let base = VirtAddr::from_ptr(&raw const inmate_int_entry);
    base + vector as u64 * STUB_SIZE
}

macro_rules! install_stub {
    ($entry:expr, $vector:expr) => {
        // SAFETY: the stub for `$vector` matches the frame layout of this entry.
        unsafe {
            $entry.set_handler_addr(stub_address($vector));
        }
    };
}

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();

        install_stub!(idt.divide_error, 0);
        install_stub!(idt.debug, 1);
        install_stub!(idt.non_maskable_interrupt, 2);
        install_stub!(idt.breakpoint, 3);
        install_stub!(idt.overflow, 4);
        install_stub!(idt.bound_range_exceeded, 5);
        install_stub!(idt.invalid_opcode, 6);
        install_stub!(idt.device_not_available, 7);
        install_stub!(idt.double_fault, 8);
        install_stub!(idt.invalid_tss, 10);
        install_stub!(idt.segment_not_present, 11);
        install_stub!(idt.stack_segment_fault, 12);
        install_stub!(idt.general_protection_fault, 13);
        install_stub!(idt.page_fault, 14);
        install_stub!(idt.x87_floating_point, 16);
        install_stub!(idt.alignment_check, 17);
        install_stub!(idt.machine_check, 18);
        install_stub!(idt.simd_floating_point, 19);
        install_stub!(idt.virtualization, 20);
        install_stub!(idt.cp_protection_exception, 21);
        install_stub!(idt.hv_injection_exception, 28);
        install_stub!(idt.vmm_communication_exception, 29);
        install_stub!(idt.security_exception, 30);

        for vector in 32..=u8::MAX {
            install_stub!(idt[vector], vector);
        }

        idt
    };
}

/// Load the IDT on the calling CPU.
pub fn load() {
    log::info!("Loading IDT...");
    IDT.load();
    log::info!("IDT loaded successfully");
}

fn exception_name(vector: u32) -> &'static str {
    match vector {
        0 => "DIVIDE ERROR",
        1 => "DEBUG",
        2 => "NMI",
        3 => "BREAKPOINT",
        4 => "OVERFLOW",
        5 => "BOUND RANGE EXCEEDED",
        6 => "INVALID OPCODE",
        7 => "DEVICE NOT AVAILABLE",
        8 => "DOUBLE FAULT",
        10 => "INVALID TSS",
        11 => "SEGMENT NOT PRESENT",
        12 => "STACK SEGMENT FAULT",
        13 => "GENERAL PROTECTION FAULT",
        14 => "PAGE FAULT",
        16 => "x87 FLOATING POINT",
        17 => "ALIGNMENT CHECK",
        18 => "MACHINE CHECK",
        19 => "SIMD FLOATING POINT",
        20 => "VIRTUALIZATION",
        21 => "CONTROL PROTECTION",
        28 => "HYPERVISOR INJECTION",
        29 => "VMM COMMUNICATION",
        30 => "SECURITY EXCEPTION",
        _ => "RESERVED",
    }
}

extern "C" fn inmate_handle_trap(vector: u32, frame: &TrapFrame) {
    if vector >= crate::interrupts::FIRST_EXTERNAL_VECTOR {
        crate::interrupts::handle_interrupt(vector);
        return;
    }

    if vector < 32 && ERROR_CODE_VECTORS & (1 << vector) != 0 {
        log::error!(
            "EXCEPTION: {} (vector {}, error code {:#x})\n{:#?}",
            exception_name(vector),
            vector,
            frame.error_code,
            frame
        );
    } else {
        log::error!("EXCEPTION: {} (vector {})\n{:#?}", exception_name(vector), vector, frame);
    }
    if vector == 14 {
        log::error!("Faulting address: {:?}", x86_64::registers::control::Cr2::read());
    }
    halt();
}
