/*
 * Inmate Heap
 *
 * First-fit heap from linked_list_allocator laid over the heap region of the
 * physical layout. Memory handed out by `alloc` is never returned: inmates
 * allocate page tables and device buffers once during bring-up and keep
 * them for their whole lifetime.
 */

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

use linked_list_allocator::Heap;
use spin::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No free block large enough for the request.
    OutOfMemory,
    /// Alignment is zero or not a power of two.
    InvalidAlignment,
    /// The heap has not been given any memory yet.
    Uninitialized,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory => write!(f, "heap exhausted"),
            AllocError::InvalidAlignment => write!(f, "alignment is not a power of two"),
            AllocError::Uninitialized => write!(f, "heap not initialized"),
        }
    }
}

/// Smallest range linked_list_allocator can keep its bookkeeping in.
const MIN_HEAP_SIZE: usize = 4 * core::mem::size_of::<usize>();

pub struct InmateHeap {
    heap: Heap,
    initialized: bool,
}

impl InmateHeap {
    pub const fn empty() -> Self {
        Self {
            heap: Heap::empty(),
            initialized: false,
        }
    }

    /// Hand `[bottom, bottom + size)` to the heap.
    ///
    /// Ranges too small to hold the allocator metadata leave the heap
    /// uninitialized.
    ///
    /// # Safety
    ///
    /// The range must be valid, writable, unused by anything else and live
    /// for the rest of the program. The heap must not have been initialized
    /// before.
    pub unsafe fn init(&mut self, bottom: *mut u8, size: usize) {
        if size < MIN_HEAP_SIZE {
            log::error!("Heap range of {} bytes is too small", size);
            return;
        }
        unsafe { self.heap.init(bottom, size) };
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Carve out `size` bytes aligned to `align`.
    pub fn alloc(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        if !self.initialized {
            return Err(AllocError::Uninitialized);
        }
        let layout =
            Layout::from_size_align(size.max(1), align).map_err(|_| AllocError::InvalidAlignment)?;
        self.heap
            .allocate_first_fit(layout)
            .map_err(|_| AllocError::OutOfMemory)
    }

    pub fn size(&self) -> usize {
        self.heap.size()
    }

    pub fn used(&self) -> usize {
        self.heap.used()
    }

    pub fn free(&self) -> usize {
        self.heap.free()
    }
}

impl Default for InmateHeap {
    fn default() -> Self {
        Self::empty()
    }
}

static HEAP: Mutex<InmateHeap> = Mutex::new(InmateHeap::empty());

/// Give the global heap its memory.
///
/// # Safety
///
/// Same contract as [`InmateHeap::init`]; must run once, before any `alloc`.
pub unsafe fn init_heap(bottom: *mut u8, size: usize) -> Result<(), AllocError> {
    log::info!("Initializing heap...");
    log::info!(
        "Heap range: 0x{:x} - 0x{:x} ({} KiB)",
        bottom as usize,
        (bottom as usize).wrapping_add(size).wrapping_sub(1),
        size / 1024
    );

    let mut heap = HEAP.lock();
    unsafe { heap.init(bottom, size) };
    if !heap.is_initialized() {
        return Err(AllocError::Uninitialized);
    }

    log::info!("Heap initialized successfully");
    Ok(())
}

/// Allocate `size` bytes aligned to `align` from the global heap.
///
/// # Arguments
///
/// * `size` - Number of bytes; 0 is rounded up to the smallest block
/// * `align` - Required alignment, a power of two
///
/// # Returns
///
/// Pointer to the block. The memory is not zeroed and is never freed.
///
/// # Errors
///
/// `Uninitialized` before `init_heap`, `InvalidAlignment` for an alignment
/// that is not a power of two, `OutOfMemory` when no block fits.
pub fn alloc(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    HEAP.lock().alloc(size, align)
}

/// Bytes currently handed out by the global heap.
pub fn heap_used() -> usize {
    HEAP.lock().used()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap_over(buffer: &mut Vec<u64>) -> InmateHeap {
        let mut heap = InmateHeap::empty();
        unsafe { heap.init(buffer.as_mut_ptr() as *mut u8, buffer.len() * 8) };
        heap
    }

    #[test]
    fn test_alloc_before_init() {
        let mut heap = InmateHeap::empty();
        assert_eq!(heap.alloc(16, 8), Err(AllocError::Uninitialized));
    }

    #[test]
    fn test_too_small_range_stays_uninitialized() {
        let mut buffer = [0u64; 1];
        let mut heap = InmateHeap::empty();
        unsafe { heap.init(buffer.as_mut_ptr() as *mut u8, 8) };
        assert!(!heap.is_initialized());
        assert_eq!(heap.alloc(1, 1), Err(AllocError::Uninitialized));
    }

    #[test]
    fn test_alignment_is_honoured() {
        let mut buffer = vec![0u64; 4096];
        let mut heap = heap_over(&mut buffer);

        for align in [1usize, 8, 64, 256, 4096] {
            let ptr = heap.alloc(24, align).unwrap();
            assert_eq!(ptr.as_ptr() as usize % align, 0, "align {}", align);
        }
    }

    #[test]
    fn test_allocations_do_not_overlap() {
        let mut buffer = vec![0u64; 1024];
        let mut heap = heap_over(&mut buffer);

        let mut blocks: Vec<(usize, usize)> = Vec::new();
        for size in [1usize, 7, 32, 100, 512] {
            let start = heap.alloc(size, 8).unwrap().as_ptr() as usize;
            for &(other, other_size) in &blocks {
                assert!(start + size <= other || other + other_size <= start);
            }
            blocks.push((start, size));
        }

        let bottom = buffer.as_ptr() as usize;
        for &(start, size) in &blocks {
            assert!(start >= bottom && start + size <= bottom + 8192);
        }
    }

    #[test]
    fn test_exhaustion_reported() {
        let mut buffer = vec![0u64; 64];
        let mut heap = heap_over(&mut buffer);

        assert!(heap.alloc(256, 8).is_ok());
        assert_eq!(heap.alloc(4096, 8), Err(AllocError::OutOfMemory));
        assert!(heap.used() >= 256);
        assert!(heap.free() < heap.size());
    }

    #[test]
    fn test_invalid_alignment_rejected() {
        let mut buffer = vec![0u64; 64];
        let mut heap = heap_over(&mut buffer);

        assert_eq!(heap.alloc(16, 0), Err(AllocError::InvalidAlignment));
        assert_eq!(heap.alloc(16, 24), Err(AllocError::InvalidAlignment));
    }

    #[test]
    fn test_zero_size_gets_distinct_blocks() {
        let mut buffer = vec![0u64; 64];
        let mut heap = heap_over(&mut buffer);

        let a = heap.alloc(0, 8).unwrap();
        let b = heap.alloc(0, 8).unwrap();
        assert_ne!(a, b);
        assert!(heap.used() > 0);
    }
}
