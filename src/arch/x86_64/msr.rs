//! Model Specific Registers
//!
//! Raw RDMSR/WRMSR wrappers and the x2APIC registers the inmate uses. The
//! register numbers come from the x86 crate's `msr` module under the short
//! names of the local APIC documentation.

use core::arch::asm;

pub use x86::msr::{
    IA32_X2APIC_APICID as X2APIC_ID, IA32_X2APIC_CUR_COUNT as X2APIC_TMCCT,
    IA32_X2APIC_DIV_CONF as X2APIC_TDCR, IA32_X2APIC_EOI as X2APIC_EOI,
    IA32_X2APIC_INIT_COUNT as X2APIC_TMICT, IA32_X2APIC_LVT_TIMER as X2APIC_LVTT,
};

/// Value written to `X2APIC_EOI` to acknowledge the in-service interrupt.
pub const APIC_EOI_ACK: u64 = 0;

/// Read 64 bits from an MSR.
///
/// RDMSR returns the value split across EDX (high) and EAX (low).
#[inline(always)]
pub fn read_msr(msr: u32) -> u64 {
    let (high, low): (u32, u32);
    unsafe {
        asm!("rdmsr", out("eax") low, out("edx") high, in("ecx") msr, options(nostack, preserves_flags));
    }
    ((high as u64) << 32) | (low as u64)
}

/// Write 64 bits to an MSR.
///
/// Acts as a compiler memory barrier: writes such as EOI or the timer count
/// must not be reordered with surrounding memory accesses.
#[inline(always)]
pub fn write_msr(msr: u32, value: u64) {
    let low = value as u32;
    let high = (value >> 32) as u32;
    unsafe {
        asm!("wrmsr", in("ecx") msr, in("eax") low, in("edx") high, options(nostack, preserves_flags));
    }
}

/// Logical CPU identifier of the caller, read from the x2APIC ID register.
///
/// Not cached; every call reads the register again.
#[inline]
pub fn cpu_id() -> u32 {
    read_msr(X2APIC_ID) as u32
}
