//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses and 4 KiB page bases used
//! by the physical allocator, the page-table walker and the scheduler.
//!
//! ## Overview
//!
//! Two principal address types prevent mixing address spaces at compile time
//! while remaining zero-cost wrappers around `u64`:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`VirtualAddress`] / [`VirtualPage`] | Page-table translated memory. |
//! | [`PhysicalAddress`] / [`PhysicalPage`] | Physical frames or MMIO. |
//!
//! The page types additionally guarantee 4 KiB alignment by construction, and
//! [`PageCount`] carries whole-page extents (sizes round *up* into it).
//!
//! This kernel maps everything with 4 KiB granularity, so unlike the usual
//! generic designs there is no page-size parameter: one shift, one mask.
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert!(va.is_canonical());
//! assert!(va.is_kernel_half());
//!
//! let page = VirtualPage::containing(va);
//! assert_eq!(page.base().as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.page_offset(), 0x234);
//! ```
//!
//! ## Design Notes
//!
//! - All types are `#[repr(transparent)]`, `Copy`, `Eq`, `Ord` and `Hash`,
//!   usable as map keys and across FFI.
//! - The four radix indices of the 4-level walk are exposed on
//!   [`VirtualAddress`] so the walker never open-codes shift/mask pairs.
//! - The canonical-hole and higher-half predicates live here because they are
//!   architectural facts, not kernel policy.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod count;
mod physical;
mod virt;

pub use count::PageCount;
pub use physical::{PhysicalAddress, PhysicalPage, PhysicalPageRange};
pub use virt::{KERNEL_HALF_BASE, VirtualAddress, VirtualPage, VirtualPageRange};

/// Size of one page in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// log2([`PAGE_SIZE`]); the number of low offset bits.
pub const PAGE_SHIFT: u32 = 12;

/// Mask selecting the in-page offset bits.
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(1 << PAGE_SHIFT == PAGE_SIZE);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_base_and_offset() {
        let a = VirtualAddress::new(0x1234_5678_9ABC);
        let p = VirtualPage::containing(a);
        assert_eq!(p.base().as_u64() & PAGE_OFFSET_MASK, 0);
        assert_eq!(a.page_offset(), a.as_u64() & PAGE_OFFSET_MASK);
        assert_eq!(p.base().as_u64() + a.page_offset(), a.as_u64());
    }

    #[test]
    fn canonical_form() {
        assert!(VirtualAddress::new(0).is_canonical());
        assert!(VirtualAddress::new(0x0000_7FFF_FFFF_FFFF).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
        assert!(VirtualAddress::new(0xFFFF_FFFF_FFFF_FFFF).is_canonical());
        assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
        assert!(!VirtualAddress::new(0x1234_0000_0000_0000).is_canonical());
    }

    #[test]
    fn half_space_split() {
        assert!(VirtualAddress::new(0x7FFF_FFFF_F000).is_user_half());
        assert!(!VirtualAddress::new(0x7FFF_FFFF_F000).is_kernel_half());
        assert!(VirtualAddress::new(KERNEL_HALF_BASE).is_kernel_half());
        assert!(VirtualAddress::new(0xFFFF_FFFF_8000_0000).is_kernel_half());
    }

    #[test]
    fn walk_indices() {
        // 0o777_776_775_774_0123 in radix-9 pieces.
        let va = VirtualAddress::new(
            (0x1FF << 39) | (0x1FE << 30) | (0x1FD << 21) | (0x1FC << 12) | 0x123,
        );
        assert_eq!(va.pml4_index(), 0x1FF);
        assert_eq!(va.pdpt_index(), 0x1FE);
        assert_eq!(va.pd_index(), 0x1FD);
        assert_eq!(va.pt_index(), 0x1FC);
        assert_eq!(va.page_offset(), 0x123);
    }

    #[test]
    fn count_spans_round_up() {
        assert_eq!(PageCount::spanning(0).as_u64(), 0);
        assert_eq!(PageCount::spanning(1).as_u64(), 1);
        assert_eq!(PageCount::spanning(PAGE_SIZE).as_u64(), 1);
        assert_eq!(PageCount::spanning(PAGE_SIZE + 1).as_u64(), 2);
        assert_eq!(PageCount::spanning(3 * PAGE_SIZE).bytes(), 3 * PAGE_SIZE);
    }

    #[test]
    fn physical_page_arithmetic() {
        let p = PhysicalPage::from_base(PhysicalAddress::new(0x10_0000)).unwrap();
        assert_eq!(p.add_pages(3).base().as_u64(), 0x10_3000);
        assert!(PhysicalPage::from_base(PhysicalAddress::new(0x10_0001)).is_none());

        assert_eq!(p.range(PageCount::new(3)).count(), 3);
        let last = p.range(PageCount::new(3)).last().unwrap();
        assert_eq!(last.base().as_u64(), 0x10_2000);
    }
}
