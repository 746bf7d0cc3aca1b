/*
 * Port I/O (PIO) Implementation
 *
 * This module provides the x86 port I/O primitives (IN/OUT). The free
 * functions are the inmate API; `Pio<T>` wraps a single port behind the `Io`
 * trait for drivers such as the console UART.
 *
 * Port I/O is never emulated through memory, so none of these accesses are
 * subject to the hypervisor's MMIO decoder. An access to a port that is not
 * assigned to the cell is trapped and handled by the hypervisor (usually by
 * stopping the cell); this layer does not try to detect it.
 */

use core::{arch::asm, marker::PhantomData};
use core::ops::{BitAnd, BitOr, Not};

/// A device register of a fixed width, reached by port or by address.
pub trait Io {
    type Value: Copy + PartialEq + BitAnd<Output = Self::Value> + BitOr<Output = Self::Value> + Not<Output = Self::Value>;

    fn read(&self) -> Self::Value;

    fn write(&mut self, value: Self::Value);

    /// True if every bit of `flags` is set in the register.
    #[inline(always)]
    fn readf(&self, flags: Self::Value) -> bool {
        (self.read() & flags) == flags
    }

    /// Read-modify-write that sets `flags` if `set`, clears them otherwise.
    #[inline(always)]
    fn writef(&mut self, flags: Self::Value, set: bool) {
        let current = self.read();
        self.write(if set { current | flags } else { current & !flags });
    }
}

/// Register that must never be written, such as a status register.
pub struct ReadOnly<I> {
    inner: I,
}

impl<I> ReadOnly<I> {
    pub const fn new(inner: I) -> ReadOnly<I> {
        ReadOnly { inner }
    }
}

impl<I: Io> ReadOnly<I> {
    #[inline(always)]
    pub fn read(&self) -> I::Value {
        self.inner.read()
    }
}

/// One I/O port accessed with `T`-sized IN/OUT.
#[derive(Copy, Clone)]
pub struct Pio<T> {
    port: u16,
    value: PhantomData<T>,
}

impl<T> Pio<T> {
    /// Create a new PIO instance for `port`.
    pub const fn new(port: u16) -> Self {
        Pio::<T> {
            port,
            value: PhantomData,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }
}

impl Io for Pio<u8> {
    type Value = u8;

    #[inline(always)]
    fn read(&self) -> u8 {
        inb(self.port)
    }

    #[inline(always)]
    fn write(&mut self, value: u8) {
        outb(value, self.port)
    }
}

impl Io for Pio<u16> {
    type Value = u16;

    #[inline(always)]
    fn read(&self) -> u16 {
        let value: u16;
        unsafe {
            asm!("in ax, dx", in("dx") self.port, out("ax") value, options(nostack, preserves_flags));
        }
        value
    }

    #[inline(always)]
    fn write(&mut self, value: u16) {
        unsafe {
            asm!("out dx, ax", in("dx") self.port, in("ax") value, options(nostack, preserves_flags));
        }
    }
}

impl Io for Pio<u32> {
    type Value = u32;

    #[inline(always)]
    fn read(&self) -> u32 {
        inl(self.port)
    }

    #[inline(always)]
    fn write(&mut self, value: u32) {
        unsafe {
            asm!("out dx, eax", in("dx") self.port, in("eax") value, options(nostack, preserves_flags));
        }
    }
}

/// Write one byte to an I/O port.
#[inline(always)]
pub fn outb(value: u8, port: u16) {
    unsafe {
        asm!("out dx, al", in("dx") port, in("al") value, options(nostack, preserves_flags));
    }
}

/// Read one byte from an I/O port.
#[inline(always)]
pub fn inb(port: u16) -> u8 {
    let value: u8;
    unsafe {
        asm!("in al, dx", in("dx") port, out("al") value, options(nostack, preserves_flags));
    }
    value
}

/// Read a doubleword from an I/O port.
#[inline(always)]
pub fn inl(port: u16) -> u32 {
    let value: u32;
    unsafe {
        asm!("in eax, dx", in("dx") port, out("eax") value, options(nostack, preserves_flags));
    }
    value
}
