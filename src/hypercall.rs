/*
 * Hypercalls
 *
 * Calling convention: code in RAX, arguments in RDI and RSI, result in RAX.
 * Negative results are errno values. Intel CPUs trap with VMCALL, AMD CPUs
 * with VMMCALL; the vendor is read from CPUID on first use.
 */

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

use x86::cpuid::CpuId;

use crate::arch::x86_64::X86;
use crate::hw::HwAccess;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Hypercall {
    Disable = 0,
    CellCreate = 1,
    CellStart = 2,
    CellSetLoadable = 3,
    CellDestroy = 4,
    HypervisorGetInfo = 5,
    CellGetState = 6,
    CpuGetInfo = 7,
    DebugConsolePutc = 8,
}

impl Hypercall {
    pub const fn code(self) -> u64 {
        self as u64
    }
}

/// Selectors for `Hypercall::HypervisorGetInfo`.
pub const INFO_MEM_POOL_SIZE: u64 = 0;
pub const INFO_MEM_POOL_USED: u64 = 1;
pub const INFO_REMAP_POOL_SIZE: u64 = 2;
pub const INFO_REMAP_POOL_USED: u64 = 3;
pub const INFO_NUM_CELLS: u64 = 4;

/// Selectors for `Hypercall::CpuGetInfo`.
pub const CPU_INFO_STATE: u64 = 0;
pub const CPU_INFO_STAT_BASE: u64 = 1000;

/// Errno returned by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallError(pub i64);

impl HypercallError {
    pub const EPERM: i64 = 1;
    pub const ENOENT: i64 = 2;
    pub const ENOMEM: i64 = 12;
    pub const EBUSY: i64 = 16;
    pub const EINVAL: i64 = 22;
    pub const ENOSYS: i64 = 38;
}

impl fmt::Display for HypercallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.0 {
            Self::EPERM => "operation not permitted",
            Self::ENOENT => "no such entry",
            Self::ENOMEM => "out of memory",
            Self::EBUSY => "busy",
            Self::EINVAL => "invalid argument",
            Self::ENOSYS => "not implemented",
            _ => "unknown error",
        };
        write!(f, "hypercall failed: {} ({})", name, self.0)
    }
}

/// Split a raw RAX result into value and errno.
///
/// `i64::MIN` has no positive counterpart and is passed through as is.
pub fn decode_result(raw: u64) -> Result<u64, HypercallError> {
    let signed = raw as i64;
    if signed < 0 {
        Err(HypercallError(signed.wrapping_neg()))
    } else {
        Ok(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Intel,
    /// Anything that is not Intel uses the AMD instruction.
    Amd,
}

impl Vendor {
    pub fn from_vendor_string(vendor: &str) -> Self {
        if vendor == "GenuineIntel" {
            Vendor::Intel
        } else {
            Vendor::Amd
        }
    }
}

const VENDOR_UNKNOWN: u8 = 0;
const VENDOR_INTEL: u8 = 1;
const VENDOR_AMD: u8 = 2;

static VENDOR: AtomicU8 = AtomicU8::new(VENDOR_UNKNOWN);

/// CPU vendor, detected once and cached.
pub fn vendor() -> Vendor {
    match VENDOR.load(Ordering::Relaxed) {
        VENDOR_INTEL => Vendor::Intel,
        VENDOR_AMD => Vendor::Amd,
        _ => {
            let vendor = CpuId::new()
                .get_vendor_info()
                .map(|info| Vendor::from_vendor_string(info.as_str()))
                .unwrap_or(Vendor::Amd);
            let raw = match vendor {
                Vendor::Intel => VENDOR_INTEL,
                Vendor::Amd => VENDOR_AMD,
            };
            VENDOR.store(raw, Ordering::Relaxed);
            vendor
        }
    }
}

/// Trap into the hypervisor. Returns RAX unmodified.
///
/// Clobbers memory from the compiler's point of view: the hypervisor may
/// read or write guest memory named by the arguments.
pub fn raw_hypercall(code: u64, arg1: u64, arg2: u64) -> u64 {
    let result: u64;
    unsafe {
        match vendor() {
            Vendor::Intel => core::arch::asm!(
                "vmcall",
                inlateout("rax") code => result,
                in("rdi") arg1,
                in("rsi") arg2,
                options(nostack),
            ),
            Vendor::Amd => core::arch::asm!(
                "vmmcall",
                inlateout("rax") code => result,
                in("rdi") arg1,
                in("rsi") arg2,
                options(nostack),
            ),
        }
    }
    result
}

/// Issue `call` through `hw` and decode the result.
pub fn hypercall_with<H: HwAccess>(
    hw: &H,
    call: Hypercall,
    arg1: u64,
    arg2: u64,
) -> Result<u64, HypercallError> {
    decode_result(hw.hypercall(call.code(), arg1, arg2))
}

pub fn hypercall(call: Hypercall, arg1: u64, arg2: u64) -> Result<u64, HypercallError> {
    hypercall_with(&X86, call, arg1, arg2)
}

/// Emit one byte on the hypervisor debug console.
///
/// Only has an effect if the cell configuration permits it, see
/// `CommRegionHandle::debug_console_permitted`.
pub fn debug_console_putc(byte: u8) {
    // The hypervisor does not report errors for console output.
    let _ = hypercall(Hypercall::DebugConsolePutc, byte as u64, 0);
}

/// State of another cell, as `comm_region::CELL_*`.
pub fn cell_get_state(cell_id: u64) -> Result<u64, HypercallError> {
    hypercall(Hypercall::CellGetState, cell_id, 0)
}

pub fn hypervisor_get_info(selector: u64) -> Result<u64, HypercallError> {
    hypercall(Hypercall::HypervisorGetInfo, selector, 0)
}

pub fn cpu_get_info(cpu: u64, selector: u64) -> Result<u64, HypercallError> {
    hypercall(Hypercall::CpuGetInfo, cpu, selector)
}
