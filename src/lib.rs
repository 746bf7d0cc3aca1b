/*
 * Inmate Runtime Library
 *
 * Support layer for guest programs ("inmates") that run directly on the
 * CPUs, memory and devices a partitioning hypervisor assigned to their
 * cell, without an operating system underneath.
 *
 * Layers, bottom up:
 * - types: exact-width integers and the fixed physical layout
 * - arch::x86_64: port I/O, MMIO, MSRs, IDT entry stubs
 * - hw: the `HwAccess` capability the higher layers are written against
 * - memory: layout table, heap and identity mapping
 * - interrupts: vector to handler dispatch
 * - timer: PM timer time base and the x2APIC one-shot timer
 * - comm_region: the page shared with the hypervisor
 * - hypercall, console, logger: hypervisor calls and log output
 * - rt: entry point and panic handler (bare-metal builds only)
 *
 * Host builds compile everything except `rt` and the IDT against std so the
 * unit tests can run there.
 */

#![cfg_attr(not(test), no_std)]

#[cfg(target_os = "none")]
extern crate rlibc;

pub mod arch;
pub mod comm_region;
pub mod console;
pub mod hw;
pub mod hypercall;
pub mod interrupts;
pub mod logger;
pub mod memory;
#[cfg(target_os = "none")]
pub mod rt;
pub mod timer;
pub mod types;

pub use arch::x86_64::{
    X86, cpu_id, cpu_relax, inb, inl, mmio_read8, mmio_read16, mmio_read32, mmio_read64,
    mmio_write8, mmio_write16, mmio_write32, mmio_write64, outb, read_msr, write_msr,
};
pub use comm_region::{CommRegion, CommRegionHandle, comm_region};
pub use hw::HwAccess;
pub use interrupts::{IntError, IntHandler, int_init, int_set_handler};
pub use memory::{AllocError, MapError, MapType, alloc, map_range};
pub use timer::{TimerError, apic_timer_init, apic_timer_set, delay_us, pm_timer_read};
pub use types::{
    COMM_REGION_BASE, FSEGMENT_BASE, HEAP_BASE, HUGE_PAGE_MASK, HUGE_PAGE_SIZE, INMATE_CS32,
    INMATE_CS64, INMATE_DS32, NS_PER_MSEC, NS_PER_SEC, PAGE_MASK, PAGE_SIZE,
};
