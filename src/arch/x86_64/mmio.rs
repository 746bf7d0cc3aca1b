/*
 * Memory-Mapped I/O Access
 *
 * Width-specific volatile accessors for device registers. Accesses to
 * emulated devices trap into the hypervisor, which decodes the faulting
 * instruction to find the access width, the register operand and the
 * direction. Its decoder only understands a restricted set of encodings.
 *
 * The 32-bit accessors are therefore written as inline assembly that emits
 * exactly one `mov` between a general purpose register and a memory operand
 * addressed by a single base register (no index, no displacement, no
 * immediate). Do not turn them into `read_volatile`/`write_volatile`: the
 * compiler is then free to fold the address computation into the
 * instruction and the trap can no longer be emulated.
 *
 * The 8, 16 and 64-bit variants are plain volatile accesses.
 */

use core::arch::asm;
use core::marker::PhantomData;

use super::pio::Io;

/// Read a byte from a device register.
///
/// # Safety
/// `address` must point to a mapped byte register or to valid memory.
#[inline(always)]
pub unsafe fn mmio_read8(address: *const u8) -> u8 {
    unsafe { core::ptr::read_volatile(address) }
}

/// Read a word from a device register.
///
/// # Safety
/// `address` must be mapped and 2-byte aligned.
#[inline(always)]
pub unsafe fn mmio_read16(address: *const u16) -> u16 {
    unsafe { core::ptr::read_volatile(address) }
}

// The 32-bit accessors pin the address to RDI and the value to EAX. Other
// base registers do not encode as plain `[reg]`: RBP and R13 need a zero
// displacement byte, RSP and R12 need a SIB byte, and R8-R15 add a REX
// prefix. The hypervisor's decoder only accepts the plain form.
macro_rules! mmio_read32_insn {
    () => {
        "mov eax, dword ptr [rdi]"
    };
}

macro_rules! mmio_write32_insn {
    () => {
        "mov dword ptr [rdi], eax"
    };
}

/// Read a doubleword from a device register.
///
/// Hypervisor decoder contract: emits exactly `mov eax, [rdi]` (8b 07).
///
/// # Safety
/// `address` must be mapped and 4-byte aligned.
#[inline(always)]
pub unsafe fn mmio_read32(address: *const u32) -> u32 {
    let value: u32;
    unsafe {
        asm!(
            mmio_read32_insn!(),
            in("rdi") address,
            out("eax") value,
            options(nostack, preserves_flags, readonly),
        );
    }
    value
}

/// Read a quadword from a device register.
///
/// # Safety
/// `address` must be mapped and 8-byte aligned.
#[inline(always)]
pub unsafe fn mmio_read64(address: *const u64) -> u64 {
    unsafe { core::ptr::read_volatile(address) }
}

/// # Safety
/// `address` must point to a mapped byte register or to valid memory.
#[inline(always)]
pub unsafe fn mmio_write8(address: *mut u8, value: u8) {
    unsafe { core::ptr::write_volatile(address, value) }
}

/// # Safety
/// `address` must be mapped and 2-byte aligned.
#[inline(always)]
pub unsafe fn mmio_write16(address: *mut u16, value: u16) {
    unsafe { core::ptr::write_volatile(address, value) }
}

/// Write a doubleword to a device register.
///
/// Hypervisor decoder contract: emits exactly `mov [rdi], eax` (89 07).
///
/// # Safety
/// `address` must be mapped and 4-byte aligned.
#[inline(always)]
pub unsafe fn mmio_write32(address: *mut u32, value: u32) {
    unsafe {
        asm!(
            mmio_write32_insn!(),
            in("rdi") address,
            in("eax") value,
            options(nostack, preserves_flags),
        );
    }
}

/// # Safety
/// `address` must be mapped and 8-byte aligned.
#[inline(always)]
pub unsafe fn mmio_write64(address: *mut u64, value: u64) {
    unsafe { core::ptr::write_volatile(address, value) }
}

/// A single memory-mapped register of width `T`.
#[derive(Copy, Clone)]
pub struct Mmio<T> {
    address: usize,
    value: PhantomData<T>,
}

impl<T> Mmio<T> {
    /// # Safety
    /// `address` must stay mapped and suitably aligned for as long as the
    /// register is used.
    pub const unsafe fn new(address: usize) -> Self {
        Mmio {
            address,
            value: PhantomData,
        }
    }

    pub const fn address(&self) -> usize {
        self.address
    }
}

impl Io for Mmio<u8> {
    type Value = u8;

    fn read(&self) -> u8 {
        unsafe { mmio_read8(self.address as *const u8) }
    }

    fn write(&mut self, value: u8) {
        unsafe { mmio_write8(self.address as *mut u8, value) }
    }
}

impl Io for Mmio<u16> {
    type Value = u16;

    fn read(&self) -> u16 {
        unsafe { mmio_read16(self.address as *const u16) }
    }

    fn write(&mut self, value: u16) {
        unsafe { mmio_write16(self.address as *mut u16, value) }
    }
}

impl Io for Mmio<u32> {
    type Value = u32;

    fn read(&self) -> u32 {
        unsafe { mmio_read32(self.address as *const u32) }
    }

    fn write(&mut self, value: u32) {
        unsafe { mmio_write32(self.address as *mut u32, value) }
    }
}

impl Io for Mmio<u64> {
    type Value = u64;

    fn read(&self) -> u64 {
        unsafe { mmio_read64(self.address as *const u64) }
    }

    fn write(&mut self, value: u64) {
        unsafe { mmio_write64(self.address as *mut u64, value) }
    }
}
