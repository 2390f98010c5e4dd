use crate::{OutOfMemory, PhysMapper};
use kernel_memory_addresses::{PageCount, PhysicalAddress, PhysicalPage};

/// Node of the intrusive free list, stored in the first page of the free
/// range it describes.
///
/// Links are physical addresses of neighboring nodes; `0` marks a list end.
/// Page 0 is never part of the list, so the sentinel is unambiguous.
#[repr(C)]
struct FreeRangeNode {
    prev: u64,
    next: u64,
    page_count: u64,
}

/// First-fit allocator over a doubly-linked list of free physical page ranges.
///
/// - `allocate` scans head to tail and carves the requested pages off the
///   **tail end** of the first range that is large enough. The node page is
///   therefore the last page of its range to be handed out; a range that
///   empties is unlinked.
/// - `free` appends the returned range at the list tail as a fresh node.
///   Adjacent free ranges are **not** coalesced. Long-running systems pay for
///   that with fragmentation and a node count that never shrinks; callers
///   that need large contiguous runs should allocate them early.
///
/// All node accesses go through the [`PhysMapper`], so the allocator works
/// identically over the kernel's direct map and over a test arena.
pub struct PhysicalAllocator<M> {
    mapper: M,
    /// First node, or NULL when the list is empty.
    head: PhysicalAddress,
    /// Last node, or NULL when the list is empty.
    tail: PhysicalAddress,
    node_count: u64,
    free_pages: PageCount,
    total_pages: PageCount,
}

impl<M: PhysMapper> PhysicalAllocator<M> {
    /// An allocator with an empty free list. Feed it memory with
    /// [`add_region`](Self::add_region).
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            head: PhysicalAddress::NULL,
            tail: PhysicalAddress::NULL,
            node_count: 0,
            free_pages: PageCount::ZERO,
            total_pages: PageCount::ZERO,
        }
    }

    /// Donate a contiguous range of usable RAM to the allocator.
    ///
    /// Called once per usable memory-map region during boot. A region
    /// starting at page 0 is trimmed by one page so the NULL link sentinel
    /// stays unambiguous. A zero-page region is ignored.
    ///
    /// # Safety
    /// The range must be RAM that nothing else references, and it must be
    /// reachable read-write through the mapper.
    pub unsafe fn add_region(&mut self, first: PhysicalPage, count: PageCount) {
        let (first, count) = if first.number() == 0 {
            match count.checked_sub(PageCount::ONE) {
                Some(rest) => (first.add_pages(1), rest),
                None => return,
            }
        } else {
            (first, count)
        };
        if count.is_zero() {
            return;
        }

        log::debug!(
            "pmm: free range {:?} + {} pages",
            first.base(),
            count.as_u64()
        );
        unsafe { self.push_tail(first.base(), count.as_u64()) };
        self.free_pages += count;
        self.total_pages += count;
    }

    /// Allocate `count` contiguous pages.
    ///
    /// First-fit over the free list; the chosen range shrinks from its tail
    /// end. Zero-page requests are a caller bug and are rejected.
    ///
    /// # Errors
    /// [`OutOfMemory`] when no single free range can satisfy the request,
    /// even if the total free page count would suffice.
    pub fn allocate(&mut self, count: PageCount) -> Result<PhysicalPage, OutOfMemory> {
        debug_assert!(!count.is_zero(), "zero-page allocation");
        if count.is_zero() {
            return Err(OutOfMemory);
        }

        let needed = count.as_u64();
        let mut cur = self.head;
        while !cur.is_null() {
            let (avail, next) = {
                let node = unsafe { self.node(cur) };
                (node.page_count, node.next)
            };
            if avail >= needed {
                let first = PhysicalPage::containing(cur);
                let remaining = avail - needed;
                if remaining == 0 {
                    unsafe { self.unlink(cur) };
                } else {
                    unsafe { self.node(cur) }.page_count = remaining;
                }
                self.free_pages -= count;
                return Ok(first.add_pages(remaining));
            }
            cur = PhysicalAddress::new(next);
        }

        let free = self.free_pages.as_u64();
        let nodes = self.node_count;
        log::warn!("pmm: allocation of {needed} pages failed ({free} pages free in {nodes} nodes)");
        Err(OutOfMemory)
    }

    /// Allocate a single page, the common case for paging structures.
    ///
    /// # Errors
    /// [`OutOfMemory`] when no page is free.
    #[inline]
    pub fn allocate_one(&mut self) -> Result<PhysicalPage, OutOfMemory> {
        self.allocate(PageCount::ONE)
    }

    /// Return `count` pages starting at `first` to the free list.
    ///
    /// The range becomes a new node at the list tail; it is never merged
    /// with its physical neighbors. Freeing zero pages is a no-op.
    ///
    /// # Safety
    /// The range must have come from [`allocate`](Self::allocate) (or
    /// [`add_region`](Self::add_region) ownership handed back) and must no
    /// longer be referenced by any mapping or pointer.
    pub unsafe fn free(&mut self, first: PhysicalPage, count: PageCount) {
        if count.is_zero() {
            return;
        }
        debug_assert!(first.number() != 0, "page 0 in free list");
        unsafe { self.push_tail(first.base(), count.as_u64()) };
        self.free_pages += count;
    }

    /// Pages currently on the free list.
    #[must_use]
    pub const fn free_pages(&self) -> PageCount {
        self.free_pages
    }

    /// Total pages ever donated via [`add_region`](Self::add_region).
    ///
    /// `total_pages - free_pages` is exactly the number of outstanding
    /// allocated pages.
    #[must_use]
    pub const fn total_pages(&self) -> PageCount {
        self.total_pages
    }

    /// Number of free-list nodes. Grows with fragmentation.
    #[must_use]
    pub const fn node_count(&self) -> u64 {
        self.node_count
    }

    /// # Safety
    /// `at` must be the base address of a live free-list node.
    unsafe fn node<'a>(&self, at: PhysicalAddress) -> &'a mut FreeRangeNode {
        unsafe { self.mapper.phys_to_mut(at) }
    }

    /// Write a fresh node at `at` and append it at the list tail.
    ///
    /// # Safety
    /// `at` must be the writable, page-aligned base of an unreferenced range
    /// of `pages` pages.
    unsafe fn push_tail(&mut self, at: PhysicalAddress, pages: u64) {
        debug_assert!(at.is_page_aligned());
        let node = unsafe { self.node(at) };
        node.prev = self.tail.as_u64();
        node.next = 0;
        node.page_count = pages;

        if self.tail.is_null() {
            self.head = at;
        } else {
            unsafe { self.node(self.tail) }.next = at.as_u64();
        }
        self.tail = at;
        self.node_count += 1;
    }

    /// # Safety
    /// `at` must be a live node in this list.
    unsafe fn unlink(&mut self, at: PhysicalAddress) {
        let (prev, next) = {
            let node = unsafe { self.node(at) };
            (node.prev, node.next)
        };
        if prev == 0 {
            self.head = PhysicalAddress::new(next);
        } else {
            unsafe { self.node(PhysicalAddress::new(prev)) }.next = next;
        }
        if next == 0 {
            self.tail = PhysicalAddress::new(prev);
        } else {
            unsafe { self.node(PhysicalAddress::new(next)) }.prev = prev;
        }
        self.node_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameSource, OutOfMemory};
    use kernel_memory_addresses::PAGE_SIZE;

    /// Test physical addresses start past the low megabyte like real RAM.
    const ARENA_BASE: u64 = 0x10_0000;

    #[repr(align(4096))]
    struct Aligned4K(core::cell::UnsafeCell<[u8; PAGE_SIZE as usize]>);

    /// Simulated physical memory: a run of 4 KiB frames starting at
    /// [`ARENA_BASE`]. Plays the role the HHDM plays in the kernel.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Aligned4K(core::cell::UnsafeCell::new([0u8; PAGE_SIZE as usize])));
            }
            Self { frames }
        }

        fn page(&self, idx: u64) -> PhysicalPage {
            PhysicalPage::containing(PhysicalAddress::new(ARENA_BASE + idx * PAGE_SIZE))
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let off = pa.as_u64() - ARENA_BASE;
            debug_assert_eq!(off & (PAGE_SIZE - 1), 0, "node access must be page-aligned");
            let idx = (off / PAGE_SIZE) as usize;
            let ptr = self.frames[idx].0.get();
            unsafe { &mut *ptr.cast::<T>() }
        }
    }

    fn allocator<'a>(phys: &'a TestPhys, regions: &[(u64, u64)]) -> PhysicalAllocator<&'a TestPhys> {
        let mut pmm = PhysicalAllocator::new(phys);
        for &(first, count) in regions {
            unsafe { pmm.add_region(phys.page(first), PageCount::new(count)) };
        }
        pmm
    }

    #[test]
    fn first_fit_scans_head_to_tail() {
        let phys = TestPhys::with_frames(64);
        let mut pmm = allocator(&phys, &[(0, 8), (16, 32)]);

        // both regions could satisfy this; the earlier-added one must win
        let got = pmm.allocate(PageCount::new(4)).unwrap();
        assert_eq!(got, phys.page(4), "expected tail end of the first region");
        assert_eq!(pmm.free_pages().as_u64(), 8 + 32 - 4);
    }

    #[test]
    fn carves_from_the_tail_end_so_the_node_page_goes_last() {
        let phys = TestPhys::with_frames(8);
        let mut pmm = allocator(&phys, &[(0, 8)]);

        assert_eq!(pmm.allocate(PageCount::ONE).unwrap(), phys.page(7));
        assert_eq!(pmm.allocate(PageCount::ONE).unwrap(), phys.page(6));
        // the node page itself was never handed out
        assert_eq!(pmm.node_count(), 1);
    }

    #[test]
    fn exact_fit_unlinks_the_node() {
        let phys = TestPhys::with_frames(32);
        let mut pmm = allocator(&phys, &[(0, 8), (16, 8)]);
        assert_eq!(pmm.node_count(), 2);

        // drains the first region completely, including its node page
        let got = pmm.allocate(PageCount::new(8)).unwrap();
        assert_eq!(got, phys.page(0));
        assert_eq!(pmm.node_count(), 1);

        // the surviving region still serves requests
        let got = pmm.allocate(PageCount::new(8)).unwrap();
        assert_eq!(got, phys.page(16));
        assert_eq!(pmm.node_count(), 0);
        assert!(pmm.free_pages().is_zero());
    }

    #[test]
    fn ranges_too_small_are_skipped() {
        let phys = TestPhys::with_frames(32);
        let mut pmm = allocator(&phys, &[(0, 2), (8, 16)]);

        let got = pmm.allocate(PageCount::new(4)).unwrap();
        assert_eq!(got, phys.page(8 + 12), "must come from the second region");
    }

    #[test]
    fn freed_range_is_reusable() {
        let phys = TestPhys::with_frames(16);
        let mut pmm = allocator(&phys, &[(0, 16)]);

        let got = pmm.allocate(PageCount::new(16)).unwrap();
        assert_eq!(pmm.node_count(), 0);

        unsafe { pmm.free(got, PageCount::new(16)) };
        assert_eq!(pmm.node_count(), 1);
        assert_eq!(pmm.free_pages().as_u64(), 16);

        // the same request can be satisfied again
        assert_eq!(pmm.allocate(PageCount::new(16)).unwrap(), got);
    }

    #[test]
    fn conservation_holds_across_mixed_operations() {
        let phys = TestPhys::with_frames(64);
        let mut pmm = allocator(&phys, &[(0, 24), (32, 24)]);
        let total = pmm.total_pages().as_u64();

        let mut outstanding: Vec<(PhysicalPage, u64)> = Vec::new();
        let mut held = 0u64;
        for &n in &[3u64, 8, 1, 5, 2] {
            let p = pmm.allocate(PageCount::new(n)).unwrap();
            outstanding.push((p, n));
            held += n;
            assert_eq!(pmm.free_pages().as_u64() + held, total);
        }
        while let Some((p, n)) = outstanding.pop() {
            unsafe { pmm.free(p, PageCount::new(n)) };
            held -= n;
            assert_eq!(pmm.free_pages().as_u64() + held, total);
        }
        assert_eq!(pmm.free_pages(), pmm.total_pages());
    }

    #[test]
    fn node_count_never_shrinks_across_alloc_free_pairs() {
        // Without coalescing, every free appends a node while allocations
        // only shave existing ones. Node count must be monotone.
        let phys = TestPhys::with_frames(64);
        let mut pmm = allocator(&phys, &[(0, 64)]);

        let mut last = pmm.node_count();
        for _ in 0..10 {
            let p = pmm.allocate(PageCount::new(3)).unwrap();
            unsafe { pmm.free(p, PageCount::new(3)) };
            let now = pmm.node_count();
            assert!(now >= last, "node count shrank from {last} to {now}");
            last = now;
        }
        assert_eq!(pmm.free_pages().as_u64(), 64);
    }

    #[test]
    fn exhaustion_is_an_error_and_preserves_state() {
        let phys = TestPhys::with_frames(4);
        let mut pmm = allocator(&phys, &[(0, 4)]);

        assert_eq!(pmm.allocate(PageCount::new(8)), Err(OutOfMemory));
        assert_eq!(pmm.free_pages().as_u64(), 4);
        assert_eq!(pmm.node_count(), 1);

        // a satisfiable request still works afterwards
        assert!(pmm.allocate(PageCount::new(4)).is_ok());
    }

    #[test]
    fn no_single_range_large_enough_fails_despite_total() {
        let phys = TestPhys::with_frames(32);
        let mut pmm = allocator(&phys, &[(0, 4), (8, 4)]);

        // 8 pages free in total, but split 4+4
        assert_eq!(pmm.allocate(PageCount::new(6)), Err(OutOfMemory));
    }

    #[test]
    fn frame_source_roundtrip() {
        let phys = TestPhys::with_frames(8);
        let mut pmm = allocator(&phys, &[(0, 8)]);

        let a = pmm.alloc_frame().unwrap();
        let b = pmm.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(pmm.free_pages().as_u64(), 6);

        unsafe {
            pmm.free_frame(a);
            pmm.free_frame(b);
        }
        assert_eq!(pmm.free_pages().as_u64(), 8);
    }

    #[test]
    fn region_at_page_zero_is_trimmed() {
        // Build a dedicated arena whose first frame really is physical 0.
        struct ZeroPhys {
            frames: Vec<Aligned4K>,
        }
        impl PhysMapper for ZeroPhys {
            unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
                let idx = (pa.as_u64() / PAGE_SIZE) as usize;
                let ptr = self.frames[idx].0.get();
                unsafe { &mut *ptr.cast::<T>() }
            }
        }
        let phys = ZeroPhys {
            frames: (0..4)
                .map(|_| Aligned4K(core::cell::UnsafeCell::new([0u8; PAGE_SIZE as usize])))
                .collect(),
        };

        let mut pmm = PhysicalAllocator::new(&phys);
        unsafe {
            pmm.add_region(
                PhysicalPage::containing(PhysicalAddress::new(0)),
                PageCount::new(4),
            );
        }
        // page 0 must not enter the list
        assert_eq!(pmm.total_pages().as_u64(), 3);
        let got = pmm.allocate(PageCount::new(3)).unwrap();
        assert_eq!(got.number(), 1);
    }

    #[test]
    fn zero_sized_operations_do_nothing() {
        let phys = TestPhys::with_frames(8);
        let mut pmm = allocator(&phys, &[(0, 8)]);

        unsafe { pmm.add_region(phys.page(4), PageCount::ZERO) };
        unsafe { pmm.free(phys.page(4), PageCount::ZERO) };
        assert_eq!(pmm.total_pages().as_u64(), 8);
        assert_eq!(pmm.free_pages().as_u64(), 8);
        assert_eq!(pmm.node_count(), 1);
    }
}
