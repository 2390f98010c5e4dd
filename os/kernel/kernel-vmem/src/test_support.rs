//! Host-side physical memory arena shared by the test modules.
//!
//! The arena is identity mapped: a frame's physical address *is* the host
//! address of its backing cell, so [`PhysMapper`] is a pointer cast and the
//! page-table code under test runs unmodified.

use core::cell::UnsafeCell;

use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
use kernel_pmm::{FrameSource, OutOfMemory, PhysMapper};

#[repr(C, align(4096))]
struct Aligned4K(UnsafeCell<[u8; 4096]>);

/// Fixed pool of zeroed 4 KiB cells standing in for physical memory.
///
/// The pool is allocated once and never grows, so cell addresses stay stable
/// for the lifetime of the arena.
pub(crate) struct TestPhys {
    pool: Vec<Aligned4K>,
}

impl TestPhys {
    pub(crate) fn with_frames(count: usize) -> Self {
        let mut pool = Vec::with_capacity(count);
        pool.resize_with(count, || Aligned4K(UnsafeCell::new([0; 4096])));
        Self { pool }
    }

    fn frame(&self, index: usize) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(self.pool[index].0.get() as u64))
    }

    /// Frame source drawing from this arena, capped at `limit` live frames.
    ///
    /// The cap makes exhaustion reproducible: a test can pick the exact
    /// allocation at which [`OutOfMemory`] strikes.
    pub(crate) fn frame_source(&self, limit: usize) -> TestFrames<'_> {
        assert!(limit <= self.pool.len(), "cap exceeds the arena");
        TestFrames {
            phys: self,
            next: 0,
            limit,
            recycled: Vec::new(),
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}

/// [`FrameSource`] over a [`TestPhys`] arena.
///
/// Freed frames go onto a last-in-first-out list and are handed out again
/// before any untouched cell. Recycled frames keep their old contents, which
/// lets tests catch code that forgets to re-zero.
pub(crate) struct TestFrames<'a> {
    phys: &'a TestPhys,
    next: usize,
    limit: usize,
    recycled: Vec<PhysicalPage>,
}

impl TestFrames<'_> {
    pub(crate) fn free_count(&self) -> usize {
        self.limit - self.next + self.recycled.len()
    }
}

impl FrameSource for TestFrames<'_> {
    fn alloc_frame(&mut self) -> Result<PhysicalPage, OutOfMemory> {
        if let Some(page) = self.recycled.pop() {
            return Ok(page);
        }
        if self.next == self.limit {
            return Err(OutOfMemory);
        }
        let page = self.phys.frame(self.next);
        self.next += 1;
        Ok(page)
    }

    unsafe fn free_frame(&mut self, page: PhysicalPage) {
        self.recycled.push(page);
    }
}
