//! # Virtual Memory Management
//!
//! Four-level x86-64 paging behind per-process address spaces.
//!
//! ## What you get
//! - An [`AddressSpace`] over one PML4 root: range allocation (lazy or
//!   eager), freeing, protection changes, cross-space copies, and
//!   file-backed ranges.
//! - A [`PageTableWalker`] that materializes, widens, and reclaims table
//!   chains.
//! - The leaf-entry codec ([`LeafState`] / [`PageEntryBits`]), the single
//!   place where software meaning is marshalled into hardware bits.
//! - Page-fault resolution ([`resolve_fault`]) committing reserved pages on
//!   first touch.
//! - The [`PhysMapper`] and [`FrameSource`] seams, re-exported from
//!   `kernel-pmm`, which let all of the above run against an in-memory
//!   arena in host tests.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each canonical 48-bit virtual address divides into five fields:
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The four index fields select entries in four levels of page tables, each
//! holding 512 entries of 8 bytes; the offset selects the byte inside the
//! final 4 KiB page:
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//! ```
//!
//! Managed ranges always walk down to 4 KiB leaves. The 2 MiB and 1 GiB
//! large-page forms exist only for the boot-time direct map and the kernel
//! image, written through [`PageTableWalker::map_huge`].
//!
//! ## Page lifecycle
//!
//! Allocation by default only *reserves*: the leaf entry records the
//! intended protection but stays invisible to the CPU. The first touch
//! faults, and [`resolve_fault`] commits the page with a zeroed frame or
//! with content read from its [`MappingSource`]. Freeing returns committed
//! frames to the allocator and reclaims table chains that became entirely
//! empty.
//!
//! ## The shared kernel half
//!
//! The kernel root pre-populates all 256 upper PML4 slots with empty PDPTs.
//! Process roots copy those 256 entries once at creation and from then on
//! see every kernel mapping without further synchronization, because
//! upper-half PML4 entries never change after boot. Upper-half tables are
//! never reclaimed through an individual space.
//!
//! ## Concurrency
//!
//! No type in this crate carries a lock and nothing here issues TLB
//! maintenance. The kernel serializes access per space and invalidates
//! affected pages after mutating a live mapping; host tests run
//! single-threaded.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod error;
mod fault;
mod page_entry;
mod protection;
mod space;
mod walker;

#[cfg(test)]
pub(crate) mod test_support;

pub use crate::error::VmError;
pub use crate::fault::{
    BackingStore, FatalKind, FaultCode, FaultVerdict, PageFault, USER_FAULT_EXIT_CODE,
    resolve_fault,
};
pub use crate::page_entry::{LeafState, PageEntryBits, PageTable};
pub use crate::protection::{AccessOrigin, CommitPolicy, Protection, ProtectionQuery};
pub use crate::space::{AddressSpace, MappingSource, SECTOR_SIZE};
pub use crate::walker::{HugeSize, PageTableWalker};

pub use kernel_pmm::{DirectMapper, FrameSource, OutOfMemory, PhysMapper};

/// Re-export the memory layout constants as info module.
pub use kernel_info::memory as info;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{TestFrames, TestPhys};
    use kernel_info::memory::USER_ALLOC_FLOOR;
    use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage, VirtualAddress};

    /// Backing store that must never be consulted.
    struct NoStore;

    impl BackingStore for NoStore {
        fn read_file(&mut self, _file: u64, _offset: u64, _buf: &mut [u8]) -> bool {
            panic!("unexpected file read");
        }

        fn read_sectors(&mut self, _device: u64, _lba: u64, _buf: &mut [u8]) -> bool {
            panic!("unexpected sector read");
        }
    }

    fn fresh_space<'p>(
        phys: &'p TestPhys,
        frames: &mut TestFrames<'_>,
    ) -> AddressSpace<&'p TestPhys> {
        let root = frames.alloc_frame().unwrap();
        unsafe { PageTableWalker::new(phys).table(root) }.zero();
        unsafe { AddressSpace::from_root(root, phys) }
    }

    fn frame_of(space: &AddressSpace<&TestPhys>, va: VirtualAddress) -> PhysicalPage {
        match space.walker().leaf_state(space.root(), va) {
            LeafState::Committed { frame, .. } => frame,
            other => panic!("expected a committed page at {va}, got {other:?}"),
        }
    }

    #[test]
    fn gigabyte_reservation_consumes_no_backing_frames() {
        let phys = TestPhys::with_frames(600);
        let mut frames = phys.frame_source(600);
        let mut space = fresh_space(&phys, &mut frames);

        let before = frames.free_count();
        let va = space
            .allocate(
                None,
                1 << 30,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Lazy,
                &mut frames,
            )
            .unwrap();
        assert_eq!(va.as_u64(), USER_ALLOC_FLOOR);

        // one PDPT, two PDs (the range crosses a 1 GiB boundary) and 512
        // PTs, but not a single frame of backing
        assert_eq!(before - frames.free_count(), 515);
        assert_eq!(
            space.query(va),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );

        // the first touch commits exactly one page
        let touch = VirtualAddress::new(va.as_u64() + 123 * PAGE_SIZE + 77);
        let before = frames.free_count();
        let fault = PageFault::from_error_code(touch, 0b110);
        assert_eq!(
            resolve_fault(&space, fault, &mut frames, &mut NoStore),
            FaultVerdict::ResolvedZeroFill
        );
        assert_eq!(before - frames.free_count(), 1);

        let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(frame_of(&space, touch).base()) };
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(
            space.query(VirtualAddress::new(touch.as_u64() + PAGE_SIZE)),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );
    }

    #[test]
    fn freed_ranges_are_reusable_and_read_zero() {
        let phys = TestPhys::with_frames(64);
        let mut frames = phys.frame_source(64);
        let mut space = fresh_space(&phys, &mut frames);

        let len = 16 * PAGE_SIZE;
        let va = space
            .allocate(
                None,
                len,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Eager,
                &mut frames,
            )
            .unwrap();
        for page in 0..16 {
            let at = VirtualAddress::new(va.as_u64() + page * PAGE_SIZE);
            let bytes: &mut [u8; 4096] =
                unsafe { phys.phys_to_mut(frame_of(&space, at).base()) };
            bytes.fill(0xEE);
        }

        space.free(va, len, AccessOrigin::User, &mut frames).unwrap();

        // the scan hands the same range out again; the recycled frames must
        // not leak the old contents
        let again = space
            .allocate(
                None,
                len,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Eager,
                &mut frames,
            )
            .unwrap();
        assert_eq!(again, va);
        for page in 0..16 {
            let at = VirtualAddress::new(again.as_u64() + page * PAGE_SIZE);
            let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(frame_of(&space, at).base()) };
            assert!(bytes.iter().all(|&b| b == 0), "stale bytes in page {page}");
        }
    }
}
