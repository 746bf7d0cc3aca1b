/*
 * Inmate Startup
 *
 * `_start` is entered in 64-bit mode on the boot CPU by the mode-switch
 * header that the loader places at the reset vector. It moves to a static
 * stack and brings up the runtime in order:
 *
 *   1. logger and console (`Config::default()`)
 *   2. layout validation
 *   3. heap, over a static area checked to lie below the f-segment
 *   4. interrupt dispatch
 *
 * and then calls the application's `inmate_main`. When that returns the
 * cell reports itself shut down and the CPU halts.
 */

use core::panic::PanicInfo;

use crate::arch::x86_64::halt;
use crate::comm_region::{CELL_FAILED, CELL_SHUT_DOWN, comm_region};
use crate::interrupts::int_init;
use crate::logger::{self, Config};
use crate::memory::{LAYOUT, heap, heap_area, validate_layout};

const STACK_SIZE: usize = 64 * 1024;
const HEAP_AREA_SIZE: usize = 256 * 1024;

#[repr(C, align(16))]
pub struct AlignedStack([u8; STACK_SIZE]);

#[unsafe(no_mangle)]
pub static mut INMATE_STACK: AlignedStack = AlignedStack([0; STACK_SIZE]);

/// Backing store of the heap. Page tables are carved from it, hence the
/// page alignment.
#[repr(C, align(4096))]
struct HeapArea([u8; HEAP_AREA_SIZE]);

static mut INMATE_HEAP_AREA: HeapArea = HeapArea([0; HEAP_AREA_SIZE]);

unsafe extern "C" {
    /// Application entry point, provided by the inmate.
    fn inmate_main();
}

#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    core::arch::naked_asm!(
        "lea rsp, [rip + {stack} + {stack_size}]",
        "xor ebp, ebp",
        "call {startup}",
        "2:",
        "hlt",
        "jmp 2b",
        stack = sym INMATE_STACK,
        stack_size = const STACK_SIZE,
        startup = sym inmate_startup,
    );
}

extern "C" fn inmate_startup() -> ! {
    // Nothing to report to if this fails; keep going silently.
    let _ = logger::init(Config::default());
    log::info!("Inmate starting on CPU {}", crate::cpu_id());

    if let Err(err) = validate_layout(&LAYOUT) {
        log::error!("Invalid memory layout: {}", err);
        fail();
    }

    let base = (&raw mut INMATE_HEAP_AREA) as usize as u64;
    let area = match heap_area(base, HEAP_AREA_SIZE as u64) {
        Ok(area) => area,
        Err(err) => {
            log::error!("Heap area at 0x{:x} unusable: {}", base, err);
            fail();
        }
    };
    // SAFETY: the area is a static nothing else refers to, and startup runs
    // once.
    let heap = unsafe { heap::init_heap(area.base as usize as *mut u8, area.size as usize) };
    if let Err(err) = heap {
        log::error!("Heap setup failed: {}", err);
        fail();
    }

    int_init();

    unsafe { inmate_main() };

    log::info!("inmate_main returned, shutting down");
    comm_region().set_cell_state(CELL_SHUT_DOWN);
    halt();
}

fn fail() -> ! {
    comm_region().set_cell_state(CELL_FAILED);
    halt();
}

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    x86_64::instructions::interrupts::disable();

    if let Some(location) = info.location() {
        log::error!(
            "PANIC at {}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        );
    } else {
        log::error!("PANIC: {}", info.message());
    }

    fail();
}
