/*
 * Interrupt Vector Dispatch
 *
 * Maps interrupt vectors to plain `fn()` handlers. The IDT built by
 * `arch::x86_64::idt` routes every external vector (32-255) to a common
 * entry stub, which calls `handle_interrupt` with the vector number; this
 * module looks the handler up, runs it and acknowledges the local APIC.
 *
 * State machine:
 * - uninitialized: `int_set_handler` is refused
 * - initialized (after `int_init`): every vector runs the default handler
 *   until a handler is registered for it
 *
 * Registration is last-write-wins. Slots are atomics, so a handler can be
 * (re)registered on one CPU while another CPU takes interrupts, and the
 * interrupt path never has to take a lock that the interrupted code holds.
 */

use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::arch::x86_64::msr::{APIC_EOI_ACK, X2APIC_EOI};
use crate::hw::HwAccess;

/// Interrupt handler, called with interrupts disabled.
pub type IntHandler = fn();

/// Number of architectural vectors.
pub const NUM_VECTORS: usize = 256;

/// Vectors below this are processor exceptions and cannot be claimed.
pub const FIRST_EXTERNAL_VECTOR: u32 = 32;

/// Vector the local APIC delivers spurious interrupts on.
pub const SPURIOUS_VECTOR: u32 = 0xff;

/// Slot value meaning "run the default handler".
const DEFAULT_SLOT: usize = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntError {
    /// `int_init` has not run yet.
    NotInitialized,
    /// The vector is a processor exception.
    ReservedVector(u32),
    /// The vector does not exist.
    InvalidVector(u32),
}

impl fmt::Display for IntError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntError::NotInitialized => write!(f, "interrupt dispatch not initialized"),
            IntError::ReservedVector(v) => write!(f, "vector {} is reserved for exceptions", v),
            IntError::InvalidVector(v) => write!(f, "vector {} out of range", v),
        }
    }
}

/// Outcome of dispatching one vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A registered handler ran.
    Handled,
    /// Nothing was registered; the default handler ran.
    Default,
}

/// Vector to handler mapping.
pub struct VectorTable {
    slots: [AtomicUsize; NUM_VECTORS],
    initialized: AtomicBool,
    unhandled: AtomicU64,
}

impl VectorTable {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicUsize::new(DEFAULT_SLOT) }; NUM_VECTORS],
            initialized: AtomicBool::new(false),
            unhandled: AtomicU64::new(0),
        }
    }

    /// Point every vector at the default handler and accept registrations.
    pub fn init(&self) {
        for slot in self.slots.iter() {
            slot.store(DEFAULT_SLOT, Ordering::Relaxed);
        }
        self.unhandled.store(0, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Install `handler` for `vector`, replacing any previous handler.
    pub fn set_handler(&self, vector: u32, handler: IntHandler) -> Result<(), IntError> {
        if !self.is_initialized() {
            return Err(IntError::NotInitialized);
        }
        if vector as usize >= NUM_VECTORS {
            return Err(IntError::InvalidVector(vector));
        }
        if vector < FIRST_EXTERNAL_VECTOR {
            return Err(IntError::ReservedVector(vector));
        }

        self.slots[vector as usize].store(handler as usize, Ordering::Release);
        Ok(())
    }

    /// The handler currently registered for `vector`, if any.
    pub fn handler(&self, vector: u32) -> Option<IntHandler> {
        let raw = self.slots.get(vector as usize)?.load(Ordering::Acquire);
        if raw == DEFAULT_SLOT {
            return None;
        }
        // SAFETY: non-default slots are only ever written from an `IntHandler`.
        Some(unsafe { core::mem::transmute::<usize, IntHandler>(raw) })
    }

    /// Run the handler for `vector`, or the default handler.
    pub fn dispatch(&self, vector: u32) -> Dispatch {
        match self.handler(vector) {
            Some(handler) => {
                handler();
                Dispatch::Handled
            }
            None => {
                self.default_handler(vector);
                Dispatch::Default
            }
        }
    }

    /// Dispatch and then signal end-of-interrupt to the local APIC.
    ///
    /// The spurious vector is not in service at the APIC and gets no EOI.
    pub fn dispatch_and_ack<H: HwAccess>(&self, vector: u32, hw: &H) -> Dispatch {
        let outcome = self.dispatch(vector);
        if vector != SPURIOUS_VECTOR {
            hw.write_msr(X2APIC_EOI, APIC_EOI_ACK);
        }
        outcome
    }

    /// Number of interrupts that arrived on a vector without a handler.
    pub fn unhandled_count(&self) -> u64 {
        self.unhandled.load(Ordering::Relaxed)
    }

    fn default_handler(&self, vector: u32) {
        let count = self.unhandled.fetch_add(1, Ordering::Relaxed) + 1;
        log::warn!("Unhandled interrupt on vector {} (total {})", vector, count);
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        Self::new()
    }
}

/// The table consulted by the interrupt entry path.
static VECTORS: VectorTable = VectorTable::new();

/// Reset the vector table and load the IDT.
///
/// Calling it again drops every registered handler.
pub fn int_init() {
    log::info!("Initializing interrupt dispatch...");
    VECTORS.init();

    #[cfg(target_os = "none")]
    crate::arch::x86_64::idt::load();

    log::info!("Interrupt dispatch initialized");
}

/// Register `handler` for `vector`. The last registration wins.
pub fn int_set_handler(vector: u32, handler: IntHandler) -> Result<(), IntError> {
    VECTORS.set_handler(vector, handler)?;
    log::debug!("Handler installed for vector {}", vector);
    Ok(())
}

/// Number of interrupts taken on vectors without a handler since `int_init`.
pub fn unhandled_interrupts() -> u64 {
    VECTORS.unhandled_count()
}

/// Called from the common entry stub for every external vector.
#[cfg(target_os = "none")]
pub(crate) fn handle_interrupt(vector: u32) {
    VECTORS.dispatch_and_ack(vector, &crate::arch::x86_64::X86);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::fake::FakeHw;

    static FIRST: AtomicUsize = AtomicUsize::new(0);
    static SECOND: AtomicUsize = AtomicUsize::new(0);
    static ACKED_TARGET: AtomicUsize = AtomicUsize::new(0);

    fn first_handler() {
        FIRST.fetch_add(1, Ordering::SeqCst);
    }

    fn second_handler() {
        SECOND.fetch_add(1, Ordering::SeqCst);
    }

    fn ack_handler() {
        ACKED_TARGET.fetch_add(1, Ordering::SeqCst);
    }

    fn noop() {}

    #[test]
    fn test_set_handler_requires_init() {
        let table = VectorTable::new();
        assert_eq!(table.set_handler(40, noop), Err(IntError::NotInitialized));

        table.init();
        assert_eq!(table.set_handler(40, noop), Ok(()));
    }

    #[test]
    fn test_last_registration_wins() {
        let table = VectorTable::new();
        table.init();

        table.set_handler(48, first_handler).unwrap();
        table.set_handler(48, second_handler).unwrap();

        assert_eq!(table.dispatch(48), Dispatch::Handled);
        assert_eq!(FIRST.load(Ordering::SeqCst), 0);
        assert_eq!(SECOND.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregistered_vector_runs_default() {
        let table = VectorTable::new();
        table.init();

        assert!(table.handler(100).is_none());
        assert_eq!(table.dispatch(100), Dispatch::Default);
        assert_eq!(table.dispatch(255), Dispatch::Default);
        assert_eq!(table.unhandled_count(), 2);
    }

    #[test]
    fn test_exception_and_out_of_range_vectors_rejected() {
        let table = VectorTable::new();
        table.init();

        assert_eq!(table.set_handler(14, noop), Err(IntError::ReservedVector(14)));
        assert_eq!(table.set_handler(256, noop), Err(IntError::InvalidVector(256)));
        assert_eq!(table.set_handler(32, noop), Ok(()));
        assert_eq!(table.set_handler(255, noop), Ok(()));
    }

    #[test]
    fn test_init_drops_previous_handlers() {
        let table = VectorTable::new();
        table.init();
        table.set_handler(33, noop).unwrap();

        table.init();
        assert!(table.handler(33).is_none());
        assert_eq!(table.unhandled_count(), 0);
    }

    #[test]
    fn test_dispatch_acknowledges_apic_after_handler() {
        let table = VectorTable::new();
        table.init();
        table.set_handler(34, ack_handler).unwrap();

        let hw = FakeHw::new();
        assert_eq!(table.dispatch_and_ack(34, &hw), Dispatch::Handled);
        assert_eq!(ACKED_TARGET.load(Ordering::SeqCst), 1);
        assert_eq!(hw.writes_to(X2APIC_EOI), vec![APIC_EOI_ACK]);

        // Unclaimed vectors are acknowledged too, or the APIC stays blocked.
        assert_eq!(table.dispatch_and_ack(99, &hw), Dispatch::Default);
        assert_eq!(hw.writes_to(X2APIC_EOI).len(), 2);
    }

    #[test]
    fn test_spurious_vector_is_not_acknowledged() {
        let table = VectorTable::new();
        table.init();

        let hw = FakeHw::new();
        assert_eq!(table.dispatch_and_ack(SPURIOUS_VECTOR, &hw), Dispatch::Default);
        assert!(hw.writes_to(X2APIC_EOI).is_empty());
    }
}
