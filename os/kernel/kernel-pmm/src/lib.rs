//! # Physical Memory Management
//!
//! A free-list allocator for physical page ranges plus the two seams the rest
//! of the memory stack is built on: [`PhysMapper`] (how physical memory is
//! reached from the current address space) and [`FrameSource`] (where 4 KiB
//! frames come from).
//!
//! ## Free-list layout
//!
//! The allocator keeps a doubly-linked list of free ranges. Each list node is
//! *intrusive*: it lives in the first page of the free range it describes, so
//! the allocator needs no heap of its own.
//!
//! ```text
//!  head ──► ┌────────────┐  next  ┌────────────┐  next  ┌────────────┐
//!           │ node @ P₀  │ ─────► │ node @ P₁  │ ─────► │ node @ P₂  │ ─► ∅
//!   ∅ ◄──── │ pages: 64  │ ◄───── │ pages: 512 │ ◄───── │ pages: 16  │ ◄── tail
//!           └────────────┘  prev  └────────────┘  prev  └────────────┘
//!           free range #0         free range #1         free range #2
//! ```
//!
//! Allocation is first-fit, scanning head to tail, and carves pages off the
//! **tail end** of the chosen range so the node page itself is the last page
//! handed out. Freed ranges are appended at the list tail as fresh nodes;
//! adjacent free ranges are never coalesced, so the node count can only grow
//! over the life of the system (see [`PhysicalAllocator`]).
//!
//! ## Concurrency
//!
//! The allocator itself is single-threaded state. The kernel wraps the one
//! global instance in an interrupt-safe spin lock; keeping the lock outside
//! the crate is what makes the allocator testable on the host.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod free_list;
mod mapper;

pub use free_list::PhysicalAllocator;
pub use mapper::{DirectMapper, PhysMapper, zero_page};

use kernel_memory_addresses::PhysicalPage;

/// Physical memory is exhausted: no free range can satisfy the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("out of physical memory")]
pub struct OutOfMemory;

/// Source of single 4 KiB physical frames.
///
/// Page-table code and the fault resolver pull frames through this trait so
/// they can run against a simulated arena in host tests and against the real
/// [`PhysicalAllocator`] in the kernel.
pub trait FrameSource {
    /// Allocate one 4 KiB frame.
    ///
    /// # Errors
    /// [`OutOfMemory`] when no frame is available.
    fn alloc_frame(&mut self) -> Result<PhysicalPage, OutOfMemory>;

    /// Return one frame previously obtained from [`alloc_frame`](Self::alloc_frame).
    ///
    /// # Safety
    /// The frame must no longer be referenced by any mapping or pointer.
    unsafe fn free_frame(&mut self, page: PhysicalPage);
}

impl<M: PhysMapper> FrameSource for PhysicalAllocator<M> {
    fn alloc_frame(&mut self) -> Result<PhysicalPage, OutOfMemory> {
        self.allocate_one()
    }

    unsafe fn free_frame(&mut self, page: PhysicalPage) {
        unsafe { self.free(page, kernel_memory_addresses::PageCount::ONE) }
    }
}
