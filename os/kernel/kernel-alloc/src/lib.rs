//! # Kernel Heap
//!
//! A first-fit, address-ordered free-list byte allocator behind
//! [`GlobalAlloc`]. The kernel installs one [`KernelHeap`] as its
//! `#[global_allocator]` and donates an eagerly committed virtual region to
//! it during bring-up; until then every allocation fails with a null
//! pointer, so nothing heap-backed may run before that point.
//!
//! ## Layout
//!
//! Free blocks carry an intrusive header and are kept sorted by address so
//! neighbors merge on every insert:
//!
//! ```text
//!  head ──► ┌──────────────┐  next  ┌──────────────┐  next
//!           │ block @ A    │ ─────► │ block @ B    │ ─────► ∅
//!           │ len: 4096    │        │ len: 64 KiB  │
//!           └──────────────┘        └──────────────┘
//!           A + 4096 < B, else the two would have coalesced
//! ```
//!
//! Allocations reserve a header-sized slot below the returned pointer;
//! `dealloc` rebuilds the block header in place from it. The allocator
//! never asks for more memory on its own, the kernel grows it explicitly
//! through [`KernelHeap::grow`].
//!
//! ## Concurrency
//!
//! All list surgery runs under one spin lock. Interrupt handlers must not
//! allocate; the lock does not mask interrupts.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod free_list;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

use kernel_memory_addresses::VirtualAddress;
use kernel_sync::SpinLock;

use crate::free_list::FreeList;

/// The kernel's lock-wrapped heap.
///
/// Declared as a static, installed with `#[global_allocator]`, grown once
/// the virtual memory layer can commit pages.
pub struct KernelHeap {
    inner: SpinLock<FreeList>,
}

impl KernelHeap {
    /// An empty heap; allocations fail until [`grow`](Self::grow) runs.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: SpinLock::new(FreeList::new()),
        }
    }

    /// Donates `[start, start + len)` to the heap.
    ///
    /// May be called again later to extend it; regions need not be
    /// contiguous.
    ///
    /// # Safety
    /// The range must be mapped, writable, exclusive to this heap for the
    /// rest of the kernel's lifetime, and `start` must be at least
    /// 8-byte aligned.
    pub unsafe fn grow(&self, start: VirtualAddress, len: usize) {
        self.inner
            .with_lock(|list| unsafe { list.seed(start.as_u64() as usize, len) });
    }

    /// Total free bytes, block headers included.
    pub fn free_bytes(&self) -> usize {
        self.inner.with_lock(|list| list.free_bytes())
    }
}

impl Default for KernelHeap {
    fn default() -> Self {
        Self::empty()
    }
}

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.inner
            .with_lock(|list| list.allocate(layout.size(), layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        self.inner
            .with_lock(|list| unsafe { list.free(ptr, layout.size()) });
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let p = unsafe { self.alloc(layout) };
        if !p.is_null() {
            unsafe { ptr::write_bytes(p, 0, layout.size()) };
        }
        p
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(4096))]
    struct Arena([u8; 16 * 1024]);

    #[test]
    fn global_alloc_round_trip() {
        let arena = Box::new(Arena([0; 16 * 1024]));
        let heap = KernelHeap::empty();

        let layout = Layout::from_size_align(256, 32).unwrap();
        assert!(unsafe { heap.alloc(layout) }.is_null());

        let start = VirtualAddress::from_ptr(core::ptr::from_ref(&arena.0));
        unsafe { heap.grow(start, 16 * 1024) };
        assert_eq!(heap.free_bytes(), 16 * 1024);

        let p = unsafe { heap.alloc_zeroed(layout) };
        assert!(!p.is_null());
        assert_eq!(p as usize % 32, 0);
        assert!(unsafe { *p } == 0 && unsafe { *p.add(255) } == 0);

        unsafe { heap.dealloc(p, layout) };
        assert_eq!(heap.free_bytes(), 16 * 1024);
    }
}
