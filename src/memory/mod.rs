/*
 * Memory Layout and Management
 *
 * High-level module that ties together:
 *  - The fixed physical layout shared with the hypervisor (this file)
 *  - Heap allocation for the inmate (heap)
 *  - Identity mapping with cache attributes (paging)
 *
 * The layout is expressed as a table instead of scattered literals so it can
 * be checked for overlap once at startup.
 */

pub mod heap;
pub mod paging;

use core::fmt;

use crate::types::{COMM_REGION_BASE, FSEGMENT_BASE, HEAP_BASE, PAGE_SIZE};

pub use heap::{AllocError, InmateHeap, alloc};
pub use paging::{MapError, MapType, map_range};

/// One named region of guest-physical memory.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryRegion {
    pub name: &'static str,
    pub base: u64,
    pub size: u64,
}

impl MemoryRegion {
    pub const fn new(name: &'static str, base: u64, size: u64) -> Self {
        Self { name, base, size }
    }

    /// Exclusive end address, `None` if the region wraps the address space.
    pub fn end(&self) -> Option<u64> {
        self.base.checked_add(self.size)
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && self.end().is_none_or(|end| addr < end)
    }

    /// Whether `other` lies entirely inside this region.
    pub fn encloses(&self, other: &MemoryRegion) -> bool {
        match (self.end(), other.end()) {
            (Some(end), Some(other_end)) => other.base >= self.base && other_end <= end,
            _ => false,
        }
    }

    fn overlaps(&self, other: &MemoryRegion) -> bool {
        let (Some(a_end), Some(b_end)) = (self.end(), other.end()) else {
            return true;
        };
        self.size != 0 && other.size != 0 && self.base < b_end && other.base < a_end
    }
}

pub const HEAP_REGION: MemoryRegion =
    MemoryRegion::new("heap", HEAP_BASE, FSEGMENT_BASE - HEAP_BASE);
pub const FSEGMENT_REGION: MemoryRegion =
    MemoryRegion::new("f-segment", FSEGMENT_BASE, COMM_REGION_BASE - FSEGMENT_BASE);
pub const COMM_REGION: MemoryRegion =
    MemoryRegion::new("comm-region", COMM_REGION_BASE, PAGE_SIZE);

/// The static physical layout of an inmate.
pub const LAYOUT: [MemoryRegion; 3] = [HEAP_REGION, FSEGMENT_REGION, COMM_REGION];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// Two regions share at least one byte.
    Overlap(&'static str, &'static str),
    /// A region runs past the end of the address space.
    Wraps(&'static str),
    /// The first region is empty or not inside the second.
    Outside(&'static str, &'static str),
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LayoutError::Overlap(a, b) => write!(f, "memory regions {} and {} overlap", a, b),
            LayoutError::Wraps(name) => write!(f, "memory region {} wraps the address space", name),
            LayoutError::Outside(inner, outer) => {
                write!(f, "memory region {} is not inside {}", inner, outer)
            }
        }
    }
}

/// Check that no two regions of `layout` overlap.
pub fn validate_layout(layout: &[MemoryRegion]) -> Result<(), LayoutError> {
    for (i, region) in layout.iter().enumerate() {
        if region.end().is_none() {
            return Err(LayoutError::Wraps(region.name));
        }
        for other in &layout[i + 1..] {
            if region.overlaps(other) {
                return Err(LayoutError::Overlap(region.name, other.name));
            }
        }
    }
    Ok(())
}

/// Region of the heap backing store at `[base, base + size)`.
///
/// The store must be non-empty and inside `HEAP_REGION`, so the heap can
/// never grow into the f-segment or the communication region.
pub fn heap_area(base: u64, size: u64) -> Result<MemoryRegion, LayoutError> {
    let area = MemoryRegion::new("heap-area", base, size);
    if size == 0 || !HEAP_REGION.encloses(&area) {
        return Err(LayoutError::Outside(area.name, HEAP_REGION.name));
    }
    Ok(area)
}

/// Find the layout region containing `addr`.
pub fn region_of(addr: u64) -> Option<&'static MemoryRegion> {
    LAYOUT.iter().find(|region| region.contains(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout_is_valid() {
        assert_eq!(validate_layout(&LAYOUT), Ok(()));
        assert_eq!(HEAP_REGION.end(), Some(FSEGMENT_BASE));
        assert_eq!(FSEGMENT_REGION.end(), Some(COMM_REGION_BASE));
    }

    #[test]
    fn test_overlap_detected() {
        let layout = [
            MemoryRegion::new("a", 0x1000, 0x2000),
            MemoryRegion::new("b", 0x4000, 0x1000),
            MemoryRegion::new("c", 0x2fff, 0x10),
        ];
        assert_eq!(validate_layout(&layout), Err(LayoutError::Overlap("a", "c")));
    }

    #[test]
    fn test_adjacent_regions_do_not_overlap() {
        let layout = [
            MemoryRegion::new("a", 0x1000, 0x1000),
            MemoryRegion::new("b", 0x2000, 0x1000),
        ];
        assert_eq!(validate_layout(&layout), Ok(()));
    }

    #[test]
    fn test_wrapping_region_rejected() {
        let layout = [MemoryRegion::new("top", u64::MAX - 0xfff, 0x2000)];
        assert_eq!(validate_layout(&layout), Err(LayoutError::Wraps("top")));
    }

    #[test]
    fn test_region_lookup() {
        assert_eq!(region_of(0x1234).map(|r| r.name), Some("heap"));
        assert_eq!(region_of(0xf_0000).map(|r| r.name), Some("f-segment"));
        assert_eq!(region_of(0x10_0fff).map(|r| r.name), Some("comm-region"));
        assert!(region_of(0x10_1000).is_none());
    }

    #[test]
    fn test_heap_area_must_stay_below_fsegment() {
        let area = heap_area(0x2_0000, 0x4_0000).unwrap();
        assert_eq!(area.end(), Some(0x6_0000));
        assert_eq!(heap_area(0xe_0000, 0x1_0000).map(|a| a.base), Ok(0xe_0000));

        let outside = Err(LayoutError::Outside("heap-area", "heap"));
        assert_eq!(heap_area(0xe_0000, 0x1_1000), outside);
        assert_eq!(heap_area(COMM_REGION_BASE, PAGE_SIZE), outside);
        assert_eq!(heap_area(0x2_0000, 0), outside);
        assert_eq!(heap_area(u64::MAX, 2), outside);
    }
}
