/*
 * Console Output
 *
 * Byte sinks for log output. An inmate either owns a 16550 UART (usually
 * COM1, passed through by the cell configuration) or, if the cell may use
 * it, writes through the hypervisor debug console one hypercall per byte.
 *
 * The active console lives behind a spin lock. On bare metal the lock is
 * taken with interrupts disabled so that an interrupt handler that logs
 * cannot spin on a lock held by the code it interrupted.
 */

use core::fmt::{self, Write};

use spin::Mutex;

use crate::arch::x86_64::X86;
use crate::arch::x86_64::pio::Pio;
use crate::hw::HwAccess;
use crate::hypercall::Hypercall;

pub mod uart_16550;

pub use uart_16550::SerialPort;

/// Base port of the first legacy serial port.
pub const COM1_BASE: u16 = 0x3f8;

/// Output through the `DebugConsolePutc` hypercall.
pub struct HypervisorConsole<H: HwAccess> {
    hw: H,
}

impl<H: HwAccess> HypervisorConsole<H> {
    pub const fn new(hw: H) -> Self {
        Self { hw }
    }

    pub fn putc(&self, byte: u8) {
        // Console output has no error path on the hypervisor side.
        let _ = self.hw.hypercall(Hypercall::DebugConsolePutc.code(), byte as u64, 0);
    }
}

impl<H: HwAccess> fmt::Write for HypervisorConsole<H> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            self.putc(byte);
        }
        Ok(())
    }
}

pub enum Console {
    Uart(SerialPort<Pio<u8>>),
    Hypervisor(HypervisorConsole<X86>),
}

impl Console {
    /// Initialize the UART at `base` and use it as console.
    pub fn uart(base: u16) -> Self {
        let mut port = SerialPort::new(base);
        port.init();
        Console::Uart(port)
    }

    pub const fn hypervisor() -> Self {
        Console::Hypervisor(HypervisorConsole::new(X86))
    }
}

impl fmt::Write for Console {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        match self {
            Console::Uart(port) => port.write_str(s),
            Console::Hypervisor(console) => console.write_str(s),
        }
    }
}

static CONSOLE: Mutex<Option<Console>> = Mutex::new(None);

/// Make `console` the target of `print`.
pub fn init(console: Console) {
    with_console(|slot| *slot = Some(console));
}

pub fn is_initialized() -> bool {
    with_console(|slot| slot.is_some())
}

/// Write formatted output to the console. Dropped if there is none yet.
pub fn print(args: fmt::Arguments<'_>) -> fmt::Result {
    with_console(|slot| match slot {
        Some(console) => console.write_fmt(args),
        None => Ok(()),
    })
}

#[cfg(target_os = "none")]
fn with_console<R>(f: impl FnOnce(&mut Option<Console>) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut CONSOLE.lock()))
}

#[cfg(not(target_os = "none"))]
fn with_console<R>(f: impl FnOnce(&mut Option<Console>) -> R) -> R {
    f(&mut CONSOLE.lock())
}
