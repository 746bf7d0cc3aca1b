/*
 * Inmate Logging
 *
 * Backend for the `log` facade. Records are printed as `[LEVEL] message`
 * lines on the console selected at initialization, either a 16550 UART or
 * the hypervisor debug console.
 *
 * Records logged before `init` are discarded.
 */

use core::fmt::{self, Write};

use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};

use crate::comm_region::comm_region;
use crate::console::{self, COM1_BASE, Console};

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSink {
    /// 16550 UART at the given base port.
    Uart(u16),
    /// `DebugConsolePutc` hypercall.
    Hypervisor,
}

impl LogSink {
    /// The sink actually usable: the hypervisor console only when the cell
    /// may use it, COM1 otherwise.
    pub fn resolve(self, debug_console_permitted: bool) -> LogSink {
        match self {
            LogSink::Hypervisor if !debug_console_permitted => LogSink::Uart(COM1_BASE),
            sink => sink,
        }
    }
}

/// Logger settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub sink: LogSink,
    pub level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        let sink = if cfg!(feature = "hypervisor-console") {
            LogSink::Hypervisor
        } else {
            LogSink::Uart(COM1_BASE)
        };
        Config {
            sink,
            level: LevelFilter::Info,
        }
    }
}

struct InmateLogger;

impl log::Log for InmateLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = console::print(format_args!("{}", Line(record.level(), record.args())));
        }
    }

    fn flush(&self) {}
}

/// One formatted log line, newline included.
struct Line<'a>(Level, &'a fmt::Arguments<'a>);

impl fmt::Display for Line<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "[{}] {}", self.0, self.1)
    }
}

/// Write one record in the log line format to `out`.
pub fn write_record<W: Write>(out: &mut W, level: Level, args: &fmt::Arguments<'_>) -> fmt::Result {
    write!(out, "{}", Line(level, args))
}

static LOGGER: InmateLogger = InmateLogger;

/// Bring up the console for `config.sink` and install the logger.
///
/// The hypervisor sink falls back to COM1 when the communication region
/// does not grant the debug console. Fails if another logger is already
/// installed; the console is switched to the new sink either way.
pub fn init(config: Config) -> Result<(), SetLoggerError> {
    let sink = config.sink.resolve(comm_region().debug_console_permitted());
    let console = match sink {
        LogSink::Uart(base) => Console::uart(base),
        LogSink::Hypervisor => Console::hypervisor(),
    };
    console::init(console);

    log::set_logger(&LOGGER).map(|()| log::set_max_level(config.level))?;
    if sink != config.sink {
        log::warn!("Hypervisor debug console not permitted, logging to {:?}", sink);
    }
    log::info!("Logger initialized ({:?}, level {})", sink, config.level);
    Ok(())
}
