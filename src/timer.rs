/*
 * Timers
 *
 * Two clocks are available to an inmate:
 *
 * - The ACPI PM timer, a free-running 24-bit counter at 3.579545 MHz whose
 *   I/O port the hypervisor publishes in the communication region. It is
 *   the time base: `pm_timer_read` turns it into nanoseconds and extends it
 *   past the 24-bit wrap (about 4.7 s) by counting wraps per CPU.
 * - The x2APIC timer of the local CPU, used for deadlines. Its frequency is
 *   unknown, so `apic_timer_init` measures it against the PM timer over
 *   100 ms before programming the vector.
 *
 * Wrap detection only works when the PM timer is read at least once per
 * wrap period on each CPU.
 */

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use spin::Mutex;

use crate::arch::x86_64::X86;
use crate::arch::x86_64::msr::{X2APIC_ID, X2APIC_LVTT, X2APIC_TDCR, X2APIC_TMCCT, X2APIC_TMICT};
use crate::comm_region::comm_region;
use crate::hw::HwAccess;
use crate::types::{NS_PER_MSEC, NS_PER_SEC};

/// Number of CPUs with lock-free PM timer wrap tracking. Further CPUs share
/// one locked state.
pub const MAX_CPUS: usize = 64;

pub const PM_TIMER_HZ: u64 = 3_579_545;
const PM_TIMER_MASK: u32 = 0x00ff_ffff;
/// Time covered by one full turn of the 24-bit counter.
pub const PM_TIMER_OVERFLOW_NS: u64 = (PM_TIMER_MASK as u64 + 1) * NS_PER_SEC / PM_TIMER_HZ;

/// TDCR encoding for "divide by 16".
const APIC_DIVIDE_BY_16: u64 = 0b0011;
const APIC_DIVISOR: u64 = 16;
/// Dividers usable for deadlines as (divisor, TDCR encoding), finest first.
/// None is finer than the calibration divider.
const APIC_DIVIDERS: [(u64, u64); 4] = [
    (16, APIC_DIVIDE_BY_16),
    (32, 0b1000),
    (64, 0b1001),
    (128, 0b1010),
];
const APIC_CALIBRATION_NS: u64 = 100 * NS_PER_MSEC;
const APIC_MAX_COUNT: u64 = 0xffff_ffff;
/// LVT vector field; the remaining bits select one-shot, unmasked.
const LVT_VECTOR_MASK: u32 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerError {
    /// `apic_timer_init` has not run on this cell.
    NotCalibrated,
    /// The timeout exceeds the 32-bit counter even at the largest divider.
    OutOfRange,
}

impl fmt::Display for TimerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerError::NotCalibrated => write!(f, "APIC timer is not calibrated"),
            TimerError::OutOfRange => write!(f, "timeout exceeds the APIC timer range"),
        }
    }
}

const SLOT_FREE: u32 = u32::MAX;

/// Wrap tracking of one CPU.
struct WrapState {
    cpu: AtomicU32,
    last: AtomicU64,
    overflows: AtomicU64,
}

impl WrapState {
    const fn new() -> Self {
        Self {
            cpu: AtomicU32::new(SLOT_FREE),
            last: AtomicU64::new(0),
            overflows: AtomicU64::new(0),
        }
    }
}

/// Extend a 24-bit reading in nanoseconds, given the previous reading and
/// the accumulated wrap offset. Returns the new offset.
fn extend(now: u64, last: u64, overflows: u64) -> u64 {
    if now < last {
        overflows + PM_TIMER_OVERFLOW_NS
    } else {
        overflows
    }
}

/// PM timer reader with per-CPU wrap extension.
///
/// The first `MAX_CPUS` CPUs to read the timer each claim a slot keyed by
/// their x2APIC id and only ever touch that slot, so the slots need
/// atomicity against interrupts but no lock. CPUs that find every slot
/// taken share one state and read the port under its lock.
pub struct PmTimer {
    cpus: [WrapState; MAX_CPUS],
    shared: Mutex<(u64, u64)>,
}

impl PmTimer {
    pub const fn new() -> Self {
        Self {
            cpus: [const { WrapState::new() }; MAX_CPUS],
            shared: Mutex::new((0, 0)),
        }
    }

    /// Slot owned by `cpu`, claiming a free one on first use.
    fn slot(&self, cpu: u32) -> Option<&WrapState> {
        for state in &self.cpus {
            match state.cpu.compare_exchange(SLOT_FREE, cpu, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(state),
                Err(owner) if owner == cpu => return Some(state),
                Err(_) => {}
            }
        }
        None
    }

    fn sample<H: HwAccess>(hw: &H, port: u16) -> u64 {
        let raw = (hw.inl(port) & PM_TIMER_MASK) as u64;
        raw * NS_PER_SEC / PM_TIMER_HZ
    }

    /// Nanoseconds since an arbitrary point, monotonic per CPU.
    pub fn read<H: HwAccess>(&self, hw: &H, port: u16) -> u64 {
        // x2APIC ids are 32 bits wide.
        let cpu = hw.read_msr(X2APIC_ID) as u32;

        let Some(state) = self.slot(cpu) else {
            return with_shared(&self.shared, |(last, overflows)| {
                let now = Self::sample(hw, port);
                *overflows = extend(now, *last, *overflows);
                *last = now;
                now + *overflows
            });
        };

        let now = Self::sample(hw, port);
        let last = state.last.load(Ordering::Relaxed);
        let overflows = if now < last {
            state.overflows.fetch_add(PM_TIMER_OVERFLOW_NS, Ordering::Relaxed) + PM_TIMER_OVERFLOW_NS
        } else {
            state.overflows.load(Ordering::Relaxed)
        };
        state.last.store(now, Ordering::Relaxed);

        now + overflows
    }
}

impl Default for PmTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "none")]
fn with_shared<R>(shared: &Mutex<(u64, u64)>, f: impl FnOnce(&mut (u64, u64)) -> R) -> R {
    x86_64::instructions::interrupts::without_interrupts(|| f(&mut shared.lock()))
}

#[cfg(not(target_os = "none"))]
fn with_shared<R>(shared: &Mutex<(u64, u64)>, f: impl FnOnce(&mut (u64, u64)) -> R) -> R {
    f(&mut shared.lock())
}

/// Divider and initial count for one deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    pub divisor: u64,
    /// Value for TDCR.
    pub divide_config: u64,
    /// Value for TMICT.
    pub count: u64,
}

/// Calibrated x2APIC timer of the local CPU.
pub struct ApicTimer {
    divided_freq: AtomicU64,
}

impl ApicTimer {
    pub const fn new() -> Self {
        Self {
            divided_freq: AtomicU64::new(0),
        }
    }

    /// Measure the timer against `now` (nanoseconds) and route it to
    /// `vector` in one-shot mode. Returns the undivided frequency in Hz.
    pub fn calibrate<H, F>(&self, hw: &H, vector: u32, mut now: F) -> u64
    where
        H: HwAccess,
        F: FnMut() -> u64,
    {
        hw.write_msr(X2APIC_TDCR, APIC_DIVIDE_BY_16);

        let start = now();
        hw.write_msr(X2APIC_TMICT, APIC_MAX_COUNT);
        while now().wrapping_sub(start) < APIC_CALIBRATION_NS {
            hw.relax();
        }
        let end = now();
        let remaining = hw.read_msr(X2APIC_TMCCT) & APIC_MAX_COUNT;

        let divided_freq = (APIC_MAX_COUNT - remaining) * NS_PER_SEC / (end - start);
        self.divided_freq.store(divided_freq, Ordering::Relaxed);

        hw.write_msr(X2APIC_TMICT, 0);
        hw.write_msr(X2APIC_LVTT, (vector & LVT_VECTOR_MASK) as u64);

        divided_freq * APIC_DIVISOR
    }

    /// Counter ticks per second behind the calibration divider, 0 before
    /// calibration.
    pub fn divided_frequency(&self) -> u64 {
        self.divided_freq.load(Ordering::Relaxed)
    }

    /// Finest divider whose initial count expires no earlier than
    /// `timeout_ns` from now. The count is at least 1.
    pub fn deadline(&self, timeout_ns: u64) -> Result<Deadline, TimerError> {
        let divided_freq = self.divided_frequency();
        if divided_freq == 0 {
            return Err(TimerError::NotCalibrated);
        }
        let input_freq = divided_freq as u128 * APIC_DIVISOR as u128;

        APIC_DIVIDERS
            .iter()
            .map(|&(divisor, divide_config)| {
                let count = (timeout_ns as u128 * input_freq)
                    .div_ceil(divisor as u128 * NS_PER_SEC as u128)
                    .max(1);
                (divisor, divide_config, count)
            })
            .find(|&(_, _, count)| count <= APIC_MAX_COUNT as u128)
            .map(|(divisor, divide_config, count)| Deadline {
                divisor,
                divide_config,
                count: count as u64,
            })
            .ok_or(TimerError::OutOfRange)
    }

    /// Arm the timer to fire once after `timeout_ns`. Replaces any pending
    /// deadline. On error the timer is left untouched.
    pub fn set<H: HwAccess>(&self, hw: &H, timeout_ns: u64) -> Result<(), TimerError> {
        let deadline = self.deadline(timeout_ns)?;
        hw.write_msr(X2APIC_TDCR, deadline.divide_config);
        hw.write_msr(X2APIC_TMICT, deadline.count);
        Ok(())
    }
}

impl Default for ApicTimer {
    fn default() -> Self {
        Self::new()
    }
}

static PM_TIMER: PmTimer = PmTimer::new();
static APIC_TIMER: ApicTimer = ApicTimer::new();

/// Current PM timer time in nanoseconds.
pub fn pm_timer_read() -> u64 {
    PM_TIMER.read(&X86, comm_region().pm_timer_address())
}

/// Calibrate the local APIC timer and bind it to `vector`.
///
/// Takes 100 ms. Returns the APIC timer frequency in Hz.
pub fn apic_timer_init(vector: u32) -> u64 {
    log::info!("Calibrating APIC timer...");
    let freq = APIC_TIMER.calibrate(&X86, vector, pm_timer_read);
    log::debug!(
        "APIC timer: {} kHz, vector {}",
        freq / 1000,
        vector & LVT_VECTOR_MASK
    );
    freq
}

/// Fire the APIC timer interrupt once, `timeout_ns` from now.
///
/// # Arguments
///
/// * `timeout_ns` - Delay until the interrupt, in nanoseconds
///
/// # Returns
///
/// `Ok(())` once the timer is armed. The interrupt never arrives early: the
/// count is rounded up and the divider is raised for long timeouts.
///
/// # Errors
///
/// `NotCalibrated` before `apic_timer_init`, `OutOfRange` when the timeout
/// does not fit even at divide-by-128. The timer is not touched then.
pub fn apic_timer_set(timeout_ns: u64) -> Result<(), TimerError> {
    APIC_TIMER.set(&X86, timeout_ns).inspect_err(|err| {
        log::warn!("APIC timer not armed for {} ns: {}", timeout_ns, err);
    })
}

/// Busy-wait on `now` for at least `us` microseconds.
pub fn delay_us_with<H, F>(hw: &H, us: u64, mut now: F)
where
    H: HwAccess,
    F: FnMut() -> u64,
{
    let target = us.saturating_mul(1000);
    let start = now();
    while now().wrapping_sub(start) < target {
        hw.relax();
    }
}

/// Busy-wait for at least `us` microseconds, measured with the PM timer.
pub fn delay_us(us: u64) {
    delay_us_with(&X86, us, pm_timer_read);
}
