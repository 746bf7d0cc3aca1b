/*
 * x86_64 Architecture Support Module
 *
 * Submodules:
 * - pio: port I/O instructions and the `Io` register abstraction
 * - mmio: width-specific MMIO accessors (decoder-compatible 32-bit form)
 * - msr: RDMSR/WRMSR and the x2APIC register map
 * - idt: interrupt descriptor table and entry stubs (bare metal only)
 *
 * `X86` bundles the port, MSR and hypercall instructions into the `HwAccess`
 * capability used by the timer, interrupt and hypercall code.
 */

use core::arch::asm;

use crate::hw::HwAccess;

#[cfg(target_os = "none")]
pub mod idt;
pub mod mmio;
pub mod msr;
pub mod pio;

pub use mmio::{
    Mmio, mmio_read8, mmio_read16, mmio_read32, mmio_read64, mmio_write8, mmio_write16,
    mmio_write32, mmio_write64,
};
pub use msr::{X2APIC_ID, cpu_id, read_msr, write_msr};
pub use pio::{Io, Pio, ReadOnly, inb, inl, outb};

/// The processor the inmate is running on.
#[derive(Copy, Clone, Debug, Default)]
pub struct X86;

impl HwAccess for X86 {
    #[inline(always)]
    fn inb(&self, port: u16) -> u8 {
        inb(port)
    }

    #[inline(always)]
    fn outb(&self, value: u8, port: u16) {
        outb(value, port)
    }

    #[inline(always)]
    fn inl(&self, port: u16) -> u32 {
        inl(port)
    }

    #[inline(always)]
    fn read_msr(&self, msr: u32) -> u64 {
        read_msr(msr)
    }

    #[inline(always)]
    fn write_msr(&self, msr: u32, value: u64) {
        write_msr(msr, value)
    }

    fn hypercall(&self, code: u64, arg1: u64, arg2: u64) -> u64 {
        crate::hypercall::raw_hypercall(code, arg1, arg2)
    }

    #[inline(always)]
    fn relax(&self) {
        cpu_relax();
    }
}

/// `pause` plus a compiler barrier, for polling loops.
#[inline(always)]
pub fn cpu_relax() {
    unsafe { asm!("pause", options(nostack, preserves_flags)) };
}

/// Stop this CPU for good.
pub fn halt() -> ! {
    ::x86_64::instructions::interrupts::disable();
    loop {
        ::x86_64::instructions::hlt();
    }
}
