/*
 * Primitive Types and Fixed Constants
 *
 * Exact-width integer aliases and the compile-time constants shared between
 * the inmate and the hypervisor: physical layout bases, segment selectors,
 * time units and page geometry.
 *
 * Every value in here is part of the contract with the hypervisor or with
 * the loader and must not depend on the build target, with the single
 * exception of the huge page size, which follows the paging mode.
 */

#![allow(non_camel_case_types)]

pub type s8 = i8;
pub type u8 = core::primitive::u8;
pub type s16 = i16;
pub type u16 = core::primitive::u16;
pub type s32 = i32;
pub type u32 = core::primitive::u32;
pub type s64 = i64;
pub type u64 = core::primitive::u64;

pub type __s8 = s8;
pub type __u8 = u8;
pub type __s16 = s16;
pub type __u16 = u16;
pub type __s32 = s32;
pub type __u32 = u32;
pub type __s64 = s64;
pub type __u64 = u64;

/// Start of the guest-owned heap region
pub const HEAP_BASE: u64 = 0x00_0000;
/// Reserved auxiliary segment below the communication region
pub const FSEGMENT_BASE: u64 = 0x0f_0000;
/// Shared control structure populated by the hypervisor
pub const COMM_REGION_BASE: u64 = 0x10_0000;

/// 32-bit code segment selector used during mode transitions
pub const INMATE_CS32: u16 = 0x8;
/// 64-bit code segment selector
pub const INMATE_CS64: u16 = 0x10;
/// 32-bit data segment selector
pub const INMATE_DS32: u16 = 0x18;

pub const NS_PER_MSEC: u64 = 1_000_000;
pub const NS_PER_SEC: u64 = 1_000_000_000;

pub const PAGE_SIZE: u64 = 4 * 1024;
#[cfg(target_pointer_width = "64")]
pub const HUGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;
#[cfg(not(target_pointer_width = "64"))]
pub const HUGE_PAGE_SIZE: u64 = 4 * 1024 * 1024;

pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);
pub const HUGE_PAGE_MASK: u64 = !(HUGE_PAGE_SIZE - 1);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_widths() {
        assert_eq!(core::mem::size_of::<s8>(), 1);
        assert_eq!(core::mem::size_of::<u16>(), 2);
        assert_eq!(core::mem::size_of::<s32>(), 4);
        assert_eq!(core::mem::size_of::<u64>(), 8);
        assert_eq!(core::mem::size_of::<__s64>(), 8);
        assert!(s8::MIN < 0 && s64::MIN < 0);
    }

    #[test]
    fn test_page_mask_clears_low_12_bits() {
        assert_eq!(0xdead_beefu64 & PAGE_MASK, 0xdead_b000);
        assert_eq!(PAGE_MASK.trailing_zeros(), 12);
        assert_eq!(!PAGE_MASK, 0xfff);
    }

    #[test]
    fn test_huge_page_mask_matches_word_width() {
        #[cfg(target_pointer_width = "64")]
        {
            assert_eq!(HUGE_PAGE_MASK.trailing_zeros(), 21);
            assert_eq!(0x1234_5678u64 & HUGE_PAGE_MASK, 0x1220_0000);
        }
        #[cfg(not(target_pointer_width = "64"))]
        {
            assert_eq!(HUGE_PAGE_MASK.trailing_zeros(), 22);
            assert_eq!(0x1234_5678u64 & HUGE_PAGE_MASK, 0x1200_0000);
        }
        assert_eq!(HUGE_PAGE_MASK.count_ones(), 64 - HUGE_PAGE_MASK.trailing_zeros());
    }

    #[test]
    fn test_layout_bases_are_ordered() {
        assert!(HEAP_BASE < FSEGMENT_BASE);
        assert!(FSEGMENT_BASE < COMM_REGION_BASE);
        assert_eq!(COMM_REGION_BASE & !PAGE_MASK, 0);
    }
}
