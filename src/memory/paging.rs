/*
 * Identity Mapping
 *
 * The inmate runs on the flat identity map the loader built. `map_range`
 * extends it with 2 MiB pages so device windows and extra RAM become
 * reachable, optionally uncached.
 *
 * Page tables are reached through their physical address, which equals
 * their virtual address under the identity map. Missing PDPT and PD tables
 * come from the inmate heap.
 */

use core::fmt;
use core::ptr::NonNull;

use x86_64::{
    PhysAddr, VirtAddr,
    instructions::tlb,
    registers::control::Cr3,
    structures::paging::{PageTable, PageTableFlags, page_table::PageTableEntry},
};

use super::heap::{self, AllocError};
use crate::types::{HUGE_PAGE_MASK, HUGE_PAGE_SIZE, PAGE_MASK, PAGE_SIZE};

/// Cache attribute of a new mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapType {
    Cached,
    /// Sets PCD, for device memory.
    Uncached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// Start or size is not a multiple of the page size.
    Misaligned,
    /// Nothing to map.
    EmptyRange,
    /// The range wraps or leaves the canonical address space.
    OutOfRange,
    /// A 1 GiB page already covers the range.
    Conflict(u64),
    /// No heap memory left for a page table.
    OutOfMemory,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Misaligned => write!(f, "range is not page aligned"),
            MapError::EmptyRange => write!(f, "range is empty"),
            MapError::OutOfRange => write!(f, "range is outside the addressable space"),
            MapError::Conflict(addr) => write!(f, "0x{:x} is covered by a 1 GiB page", addr),
            MapError::OutOfMemory => write!(f, "no memory for page tables"),
        }
    }
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        MapError::OutOfMemory
    }
}

impl MapType {
    fn leaf_flags(self) -> PageTableFlags {
        let flags = PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE;
        match self {
            MapType::Cached => flags,
            MapType::Uncached => flags | PageTableFlags::NO_CACHE,
        }
    }
}

/// Huge-page aligned bounds covering `[start, start + size)`.
fn huge_bounds(start: u64, size: u64) -> Result<(u64, u64), MapError> {
    if size == 0 {
        return Err(MapError::EmptyRange);
    }
    if start & !PAGE_MASK != 0 || size & !PAGE_MASK != 0 {
        return Err(MapError::Misaligned);
    }

    let end = start
        .checked_add(size)
        .and_then(|end| end.checked_add(HUGE_PAGE_SIZE - 1))
        .map(|end| end & HUGE_PAGE_MASK)
        .ok_or(MapError::OutOfRange)?;
    if VirtAddr::try_new(end - 1).is_err() || PhysAddr::try_new(end - 1).is_err() {
        return Err(MapError::OutOfRange);
    }

    Ok((start & HUGE_PAGE_MASK, end))
}

/// Follow `entry` to the next table, creating an empty one if needed.
///
/// # Safety
///
/// `entry` must belong to an identity-mapped page table hierarchy.
unsafe fn next_table<'a, F>(
    entry: &'a mut PageTableEntry,
    addr: u64,
    alloc_table: &mut F,
) -> Result<&'a mut PageTable, MapError>
where
    F: FnMut() -> Result<NonNull<u8>, AllocError>,
{
    let flags = entry.flags();
    if !flags.contains(PageTableFlags::PRESENT) {
        let table = alloc_table()?.as_ptr() as *mut PageTable;
        unsafe { table.write(PageTable::new()) };
        entry.set_addr(
            PhysAddr::new(table as u64),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
    } else if flags.contains(PageTableFlags::HUGE_PAGE) {
        return Err(MapError::Conflict(addr));
    }

    Ok(unsafe { &mut *(entry.addr().as_u64() as *mut PageTable) })
}

/// PD covering `addr`, creating the PDPT and PD on the way if missing.
///
/// # Safety
///
/// As for `map_range_in`.
unsafe fn pd_for<'a, F>(
    root: *mut PageTable,
    addr: u64,
    alloc_table: &mut F,
) -> Result<&'a mut PageTable, MapError>
where
    F: FnMut() -> Result<NonNull<u8>, AllocError>,
{
    let virt = VirtAddr::new(addr);
    let pml4 = unsafe { &mut *root };
    let pdpt = unsafe { next_table(&mut pml4[virt.p4_index()], addr, alloc_table)? };
    unsafe { next_table(&mut pdpt[virt.p3_index()], addr, alloc_table) }
}

/// Identity-map `[start, start + size)` below the PML4 at `root`.
///
/// Returns the huge-page aligned range that was actually written. All
/// intermediate tables are created and checked before the first leaf entry
/// changes, so on error no existing translation has been touched. Tables
/// created before the error stay linked in, empty.
///
/// # Safety
///
/// `root` must point to a valid PML4 whose tables are identity mapped, and
/// `alloc_table` must return page-aligned, page-sized blocks that are not
/// used for anything else.
pub unsafe fn map_range_in<F>(
    root: *mut PageTable,
    start: u64,
    size: u64,
    map_type: MapType,
    mut alloc_table: F,
) -> Result<(u64, u64), MapError>
where
    F: FnMut() -> Result<NonNull<u8>, AllocError>,
{
    let (first, end) = huge_bounds(start, size)?;
    let flags = map_type.leaf_flags();

    let mut addr = first;
    while addr < end {
        unsafe { pd_for(root, addr, &mut alloc_table)? };
        addr += HUGE_PAGE_SIZE;
    }

    let mut addr = first;
    while addr < end {
        let pd = unsafe { pd_for(root, addr, &mut alloc_table)? };
        pd[VirtAddr::new(addr).p2_index()].set_addr(PhysAddr::new(addr), flags);
        addr += HUGE_PAGE_SIZE;
    }

    Ok((first, end))
}

/// Identity-map `[start, start + size)` in the active address space.
///
/// # Arguments
///
/// * `start` - First physical address, page aligned
/// * `size` - Length in bytes, page aligned and non-zero
/// * `map_type` - Cache attribute for every 2 MiB page of the range
///
/// # Returns
///
/// `Ok(())` once the range, widened to 2 MiB boundaries, is mapped and its
/// TLB entries are flushed. Existing 2 MiB entries are overwritten.
///
/// # Errors
///
/// `Misaligned`, `EmptyRange` and `OutOfRange` for a bad range,
/// `Conflict` when a 1 GiB page covers part of it and `OutOfMemory` when the
/// heap cannot supply a page table. On error no existing mapping changed.
pub fn map_range(start: u64, size: u64, map_type: MapType) -> Result<(), MapError> {
    let (frame, _) = Cr3::read();
    let root = frame.start_address().as_u64() as *mut PageTable;

    // SAFETY: CR3 holds the identity-mapped tables set up by the loader, and
    // heap blocks are never reused.
    let (first, end) = unsafe {
        map_range_in(root, start, size, map_type, || {
            heap::alloc(PAGE_SIZE as usize, PAGE_SIZE as usize)
        })?
    };

    let mut addr = first;
    while addr < end {
        tlb::flush(VirtAddr::new(addr));
        addr += HUGE_PAGE_SIZE;
    }

    log::debug!(
        "Mapped 0x{:x} - 0x{:x} ({:?})",
        first,
        end - 1,
        map_type
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InmateHeap;

    const GIB: u64 = 1 << 30;

    /// Page table memory for one test, carved from a host buffer.
    struct Tables {
        _buffer: Vec<u64>,
        heap: InmateHeap,
        root: *mut PageTable,
    }

    impl Tables {
        fn new(pages: usize) -> Self {
            let len = (pages + 2) * PAGE_SIZE as usize;
            let mut buffer = vec![0u64; len / 8];
            let mut heap = InmateHeap::empty();
            unsafe { heap.init(buffer.as_mut_ptr() as *mut u8, len) };
            let root = heap.alloc(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
            let root = root.as_ptr() as *mut PageTable;
            unsafe { root.write(PageTable::new()) };
            Self { _buffer: buffer, heap, root }
        }

        fn map(&mut self, start: u64, size: u64, map_type: MapType) -> Result<(u64, u64), MapError> {
            let heap = &mut self.heap;
            unsafe {
                map_range_in(self.root, start, size, map_type, || {
                    heap.alloc(PAGE_SIZE as usize, PAGE_SIZE as usize)
                })
            }
        }

        /// The PD entry translating `addr`, if the walk gets that far.
        fn leaf(&self, addr: u64) -> Option<PageTableEntry> {
            let virt = VirtAddr::new(addr);
            let mut table = unsafe { &*self.root };
            for index in [virt.p4_index(), virt.p3_index()] {
                let entry = &table[index];
                if !entry.flags().contains(PageTableFlags::PRESENT) {
                    return None;
                }
                table = unsafe { &*(entry.addr().as_u64() as *const PageTable) };
            }
            Some(table[virt.p2_index()].clone())
        }

        fn tables_used(&self) -> usize {
            self.heap.used() / PAGE_SIZE as usize
        }
    }

    #[test]
    fn test_misaligned_and_empty_ranges_rejected() {
        let mut tables = Tables::new(4);
        assert_eq!(tables.map(0x1000_0800, 0x1000, MapType::Cached), Err(MapError::Misaligned));
        assert_eq!(tables.map(0x1000_0000, 0x800, MapType::Cached), Err(MapError::Misaligned));
        assert_eq!(tables.map(0x1000_0000, 0, MapType::Cached), Err(MapError::EmptyRange));
        assert_eq!(
            tables.map(u64::MAX & PAGE_MASK, PAGE_SIZE, MapType::Cached),
            Err(MapError::OutOfRange)
        );
        assert_eq!(tables.tables_used(), 1);
    }

    #[test]
    fn test_cached_mapping_flags() {
        let mut tables = Tables::new(4);
        tables.map(0x4000_0000, HUGE_PAGE_SIZE, MapType::Cached).unwrap();

        let leaf = tables.leaf(0x4000_0000).unwrap();
        assert_eq!(leaf.addr().as_u64(), 0x4000_0000);
        assert_eq!(
            leaf.flags(),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE | PageTableFlags::HUGE_PAGE
        );
    }

    #[test]
    fn test_uncached_mapping_sets_pcd() {
        let mut tables = Tables::new(4);
        tables.map(0xfee0_0000, PAGE_SIZE, MapType::Uncached).unwrap();

        let leaf = tables.leaf(0xfee0_0000).unwrap();
        assert!(leaf.flags().contains(PageTableFlags::NO_CACHE));
        assert!(leaf.flags().contains(PageTableFlags::HUGE_PAGE));
    }

    #[test]
    fn test_range_widened_to_huge_pages() {
        let mut tables = Tables::new(4);
        let covered = tables.map(0x20_1000, 0x1000, MapType::Cached).unwrap();
        assert_eq!(covered, (0x20_0000, 0x40_0000));

        assert_eq!(tables.leaf(0x20_0000).unwrap().addr().as_u64(), 0x20_0000);
        assert!(tables.leaf(0x40_0000).unwrap().is_unused());
        assert!(tables.leaf(0x0).unwrap().is_unused());
    }

    #[test]
    fn test_intermediate_tables_shared() {
        let mut tables = Tables::new(4);
        tables.map(0x8000_0000, 4 * HUGE_PAGE_SIZE, MapType::Cached).unwrap();
        // root + one PDPT + one PD
        assert_eq!(tables.tables_used(), 3);
        for i in 0..4 {
            let addr = 0x8000_0000 + i * HUGE_PAGE_SIZE;
            assert_eq!(tables.leaf(addr).unwrap().addr().as_u64(), addr);
        }

        // Crossing a 1 GiB boundary needs one more PD.
        tables.map(GIB - HUGE_PAGE_SIZE, 2 * HUGE_PAGE_SIZE, MapType::Cached).unwrap();
        assert_eq!(tables.tables_used(), 5);
    }

    #[test]
    fn test_remap_updates_existing_entry() {
        let mut tables = Tables::new(4);
        tables.map(0x6000_0000, HUGE_PAGE_SIZE, MapType::Cached).unwrap();
        let used = tables.tables_used();

        tables.map(0x6000_0000, HUGE_PAGE_SIZE, MapType::Uncached).unwrap();
        assert_eq!(tables.tables_used(), used);
        assert!(tables.leaf(0x6000_0000).unwrap().flags().contains(PageTableFlags::NO_CACHE));
    }

    #[test]
    fn test_gigabyte_page_conflict() {
        let mut tables = Tables::new(4);
        let pml4 = unsafe { &mut *tables.root };
        let pdpt = tables.heap.alloc(PAGE_SIZE as usize, PAGE_SIZE as usize).unwrap();
        let pdpt = pdpt.as_ptr() as *mut PageTable;
        unsafe { pdpt.write(PageTable::new()) };
        pml4[0].set_addr(
            PhysAddr::new(pdpt as u64),
            PageTableFlags::PRESENT | PageTableFlags::WRITABLE,
        );
        (unsafe { &mut *pdpt })[1].set_addr(
            PhysAddr::new(GIB),
            PageTableFlags::PRESENT | PageTableFlags::HUGE_PAGE,
        );

        assert_eq!(
            tables.map(GIB, HUGE_PAGE_SIZE, MapType::Cached),
            Err(MapError::Conflict(GIB))
        );
    }

    #[test]
    fn test_table_allocation_failure() {
        let mut tables = Tables::new(0);
        // Slack in the buffer may fit one table but never both.
        assert_eq!(
            tables.map(0x4000_0000, HUGE_PAGE_SIZE, MapType::Cached),
            Err(MapError::OutOfMemory)
        );
    }

    #[test]
    fn test_failed_remap_leaves_existing_entries() {
        let mut tables = Tables::new(4);
        tables.map(GIB - HUGE_PAGE_SIZE, HUGE_PAGE_SIZE, MapType::Cached).unwrap();
        while tables.heap.alloc(PAGE_SIZE as usize, PAGE_SIZE as usize).is_ok() {}

        // The second 2 MiB page needs a new PD the heap cannot supply.
        assert_eq!(
            tables.map(GIB - HUGE_PAGE_SIZE, 2 * HUGE_PAGE_SIZE, MapType::Uncached),
            Err(MapError::OutOfMemory)
        );
        let leaf = tables.leaf(GIB - HUGE_PAGE_SIZE).unwrap();
        assert_eq!(leaf.addr().as_u64(), GIB - HUGE_PAGE_SIZE);
        assert!(!leaf.flags().contains(PageTableFlags::NO_CACHE));
    }
}
