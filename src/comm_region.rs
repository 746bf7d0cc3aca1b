/*
 * Communication Region
 *
 * One page at COMM_REGION_BASE shared with the hypervisor. The hypervisor
 * fills in the platform information before the inmate starts and uses the
 * message fields to ask the cell to shut down or to announce
 * reconfigurations; the inmate answers through `reply_from_cell` and
 * reports its state through `cell_state`.
 *
 * The hypervisor may write any field at any time, so every access goes
 * through `Volatile`. There is no locking and no version check.
 */

use core::sync::atomic::{Ordering, compiler_fence};

use volatile::Volatile;

use crate::types::COMM_REGION_BASE;

/// Expected contents of `signature`.
pub const COMM_REGION_SIGNATURE: [u8; 6] = *b"JHCOMM";
pub const COMM_REGION_ABI_REVISION: u16 = 1;

// Messages to the cell
pub const MSG_NONE: u32 = 0;
pub const MSG_SHUTDOWN_REQUEST: u32 = 1;
pub const MSG_RECONFIG_COMPLETED: u32 = 2;

// Replies from the cell
pub const MSG_UNKNOWN: u32 = 1;
pub const MSG_REQUEST_DENIED: u32 = 2;
pub const MSG_REQUEST_APPROVED: u32 = 3;
pub const MSG_RECEIVED: u32 = 4;

// Cell states
pub const CELL_RUNNING: u32 = 0;
pub const CELL_RUNNING_LOCKED: u32 = 1;
pub const CELL_SHUT_DOWN: u32 = 2;
pub const CELL_FAILED: u32 = 3;

/// The cell may use the hypervisor debug console.
pub const COMM_FLAG_DBGCON_PERMITTED: u32 = 0x0001;

/// Layout of the shared page as defined by the hypervisor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CommRegion {
    pub signature: [u8; 6],
    pub revision: u16,
    pub cell_state: u32,
    pub msg_to_cell: u32,
    pub reply_from_cell: u32,
    pub flags: u32,
    pub pm_timer_address: u16,
    pub num_cpus: u16,
    pub tsc_khz: u32,
    pub apic_khz: u32,
}

const _: () = {
    use core::mem::{offset_of, size_of};
    assert!(offset_of!(CommRegion, revision) == 6);
    assert!(offset_of!(CommRegion, cell_state) == 8);
    assert!(offset_of!(CommRegion, msg_to_cell) == 12);
    assert!(offset_of!(CommRegion, reply_from_cell) == 16);
    assert!(offset_of!(CommRegion, flags) == 20);
    assert!(offset_of!(CommRegion, pm_timer_address) == 24);
    assert!(offset_of!(CommRegion, num_cpus) == 26);
    assert!(offset_of!(CommRegion, tsc_khz) == 28);
    assert!(offset_of!(CommRegion, apic_khz) == 32);
    assert!(size_of::<CommRegion>() == 36);
};

macro_rules! read_field {
    ($handle:expr, $field:ident) => {
        // SAFETY: the handle points at a live region (see `CommRegionHandle::new`).
        Volatile::new_read_only(unsafe { &(*$handle.ptr).$field }).read()
    };
}

macro_rules! write_field {
    ($handle:expr, $field:ident, $value:expr) => {
        // SAFETY: as for `read_field`.
        Volatile::new(unsafe { &mut (*$handle.ptr).$field }).write($value)
    };
}

/// Typed view of a communication region.
#[derive(Debug, Clone, Copy)]
pub struct CommRegionHandle {
    ptr: *mut CommRegion,
}

// The region is designed for concurrent access by every CPU of the cell and
// the hypervisor; each field access is a single volatile operation.
unsafe impl Send for CommRegionHandle {}
unsafe impl Sync for CommRegionHandle {}

impl CommRegionHandle {
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of a `CommRegion` for as
    /// long as the handle or any copy of it is used.
    pub const unsafe fn new(ptr: *mut CommRegion) -> Self {
        Self { ptr }
    }

    pub fn signature(&self) -> [u8; 6] {
        read_field!(self, signature)
    }

    pub fn revision(&self) -> u16 {
        read_field!(self, revision)
    }

    /// Whether the hypervisor has populated the region.
    pub fn is_valid(&self) -> bool {
        self.signature() == COMM_REGION_SIGNATURE
    }

    pub fn cell_state(&self) -> u32 {
        read_field!(self, cell_state)
    }

    pub fn set_cell_state(&self, state: u32) {
        write_field!(self, cell_state, state);
    }

    /// The message currently pending for this cell, `MSG_NONE` if none.
    pub fn poll_message(&self) -> u32 {
        read_field!(self, msg_to_cell)
    }

    pub fn reply(&self) -> u32 {
        read_field!(self, reply_from_cell)
    }

    /// Consume the pending message and answer it.
    ///
    /// The message slot is cleared before the reply becomes visible, so the
    /// hypervisor never sees a reply next to the message it answers.
    pub fn send_reply(&self, reply: u32) {
        write_field!(self, msg_to_cell, MSG_NONE);
        compiler_fence(Ordering::SeqCst);
        write_field!(self, reply_from_cell, reply);
    }

    pub fn flags(&self) -> u32 {
        read_field!(self, flags)
    }

    pub fn debug_console_permitted(&self) -> bool {
        self.flags() & COMM_FLAG_DBGCON_PERMITTED != 0
    }

    /// I/O port of the ACPI PM timer.
    pub fn pm_timer_address(&self) -> u16 {
        read_field!(self, pm_timer_address)
    }

    pub fn num_cpus(&self) -> u16 {
        read_field!(self, num_cpus)
    }

    pub fn tsc_khz(&self) -> u32 {
        read_field!(self, tsc_khz)
    }

    pub fn apic_khz(&self) -> u32 {
        read_field!(self, apic_khz)
    }

    /// Copy of the whole region, field by field.
    pub fn snapshot(&self) -> CommRegion {
        CommRegion {
            signature: self.signature(),
            revision: self.revision(),
            cell_state: self.cell_state(),
            msg_to_cell: self.poll_message(),
            reply_from_cell: self.reply(),
            flags: self.flags(),
            pm_timer_address: self.pm_timer_address(),
            num_cpus: self.num_cpus(),
            tsc_khz: self.tsc_khz(),
            apic_khz: self.apic_khz(),
        }
    }
}

/// The communication region of this cell.
pub fn comm_region() -> CommRegionHandle {
    // SAFETY: the hypervisor maps the region at COMM_REGION_BASE for the
    // whole life of the cell.
    unsafe { CommRegionHandle::new(COMM_REGION_BASE as usize as *mut CommRegion) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated() -> Box<CommRegion> {
        Box::new(CommRegion {
            signature: COMM_REGION_SIGNATURE,
            revision: COMM_REGION_ABI_REVISION,
            flags: COMM_FLAG_DBGCON_PERMITTED,
            pm_timer_address: 0x408,
            num_cpus: 2,
            tsc_khz: 2_400_000,
            apic_khz: 100_000,
            ..CommRegion::default()
        })
    }

    #[test]
    fn test_fields_read_through_handle() {
        let mut region = populated();
        let handle = unsafe { CommRegionHandle::new(&mut *region) };

        assert!(handle.is_valid());
        assert_eq!(handle.revision(), 1);
        assert_eq!(handle.pm_timer_address(), 0x408);
        assert_eq!(handle.num_cpus(), 2);
        assert_eq!(handle.tsc_khz(), 2_400_000);
        assert_eq!(handle.apic_khz(), 100_000);
        assert!(handle.debug_console_permitted());
    }

    #[test]
    fn test_unpopulated_region_is_invalid() {
        let mut region = CommRegion::default();
        let handle = unsafe { CommRegionHandle::new(&mut region) };
        assert!(!handle.is_valid());
        assert!(!handle.debug_console_permitted());
    }

    #[test]
    fn test_reply_clears_message() {
        let mut region = populated();
        let handle = unsafe { CommRegionHandle::new(&mut *region) };

        region.msg_to_cell = MSG_SHUTDOWN_REQUEST;
        assert_eq!(handle.poll_message(), MSG_SHUTDOWN_REQUEST);

        handle.send_reply(MSG_REQUEST_APPROVED);
        assert_eq!(handle.poll_message(), MSG_NONE);
        assert_eq!(handle.reply(), MSG_REQUEST_APPROVED);
    }

    #[test]
    fn test_cell_state_written_to_shared_memory() {
        let mut region = populated();
        let handle = unsafe { CommRegionHandle::new(&mut *region) };

        handle.set_cell_state(CELL_SHUT_DOWN);
        assert_eq!(region.cell_state, CELL_SHUT_DOWN);
        assert_eq!(handle.snapshot().cell_state, CELL_SHUT_DOWN);
    }

    #[test]
    fn test_region_sits_at_fixed_base() {
        assert_eq!(comm_region().ptr as u64, COMM_REGION_BASE);
    }
}
