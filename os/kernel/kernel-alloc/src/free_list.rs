//! Address-ordered free list over raw byte regions.

use core::ptr::{self, null_mut};

/// Header at the start of every free block.
///
/// ```text
/// +---------------------+------------------------------+
/// | FreeBlock (header)  |  free bytes up to `len`      |
/// +---------------------+------------------------------+
/// ^ block address       ^ block address + HDR
/// ```
///
/// `len` counts the whole block, header included, so a block ends at
/// `addr + len` and two blocks coalesce exactly when one ends where the
/// next begins. The list is kept sorted by address for that check.
#[repr(C)]
struct FreeBlock {
    /// Total block length in bytes, header included.
    len: usize,
    /// Next free block, or null at the list end.
    next: *mut FreeBlock,
}

/// Bytes reserved below every returned pointer.
///
/// `free` rebuilds a [`FreeBlock`] in this slot, so an allocation at `p`
/// owns `[p - HDR, p + size)` and alignment padding in front of the slot
/// is either returned to the list or written off when smaller than a
/// header.
const HDR: usize = size_of::<FreeBlock>();

/// Align `addr` upwards to `align` (a power of two).
const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

/// First-fit byte allocator with split and coalesce.
///
/// Starts empty; [`seed`](Self::seed) donates regions. An empty list makes
/// every allocation fail with a null pointer, which is also the behavior
/// before the kernel has committed heap pages.
///
/// # Invariants
/// - Free blocks are sorted by address, non-overlapping, and at least
///   `HDR` bytes long.
/// - `head` is a sentinel node describing no memory; the first real block
///   hangs off `head.next`.
pub(crate) struct FreeList {
    head: FreeBlock,
}

// SAFETY: the raw block pointers are only touched while the heap lock in
// `lib.rs` is held.
unsafe impl Send for FreeList {}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: FreeBlock {
                len: 0,
                next: null_mut(),
            },
        }
    }

    /// Donates `[start, start + len)` to the allocator.
    ///
    /// Regions too small for a header are ignored.
    ///
    /// # Safety
    /// The range must be valid, writable, exclusive to the allocator for
    /// its remaining lifetime, and `start` must be aligned for
    /// [`FreeBlock`].
    pub(crate) unsafe fn seed(&mut self, start: usize, len: usize) {
        // A ragged tail byte can never carry a header; drop it.
        unsafe { self.insert(start, len & !(align_of::<FreeBlock>() - 1)) };
    }

    /// First-fit allocation of `size` bytes at `align`.
    ///
    /// Returns the aligned payload pointer, or null when no block fits.
    pub(crate) fn allocate(&mut self, size: usize, align: usize) -> *mut u8 {
        // Rounding the size keeps every carve-off header-aligned.
        let size = align_up(size.max(1), align_of::<FreeBlock>());
        let align = align.max(align_of::<FreeBlock>());
        let mut prev: *mut FreeBlock = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let base = current as usize;
            let end = base + unsafe { (*current).len };
            let payload = align_up(base + HDR, align);
            let payload_end = payload.saturating_add(size);
            if payload_end <= end {
                unsafe {
                    // Unlink, then return the cut-offs around the
                    // allocation. Tail first so the head insert walks a
                    // shorter list.
                    (*prev).next = (*current).next;
                    let tail = end - payload_end;
                    if tail >= HDR {
                        self.insert(payload_end, tail);
                    }
                    let lead = payload - HDR - base;
                    if lead >= HDR {
                        self.insert(base, lead);
                    }
                }
                return payload as *mut u8;
            }
            prev = current;
            current = unsafe { (*current).next };
        }
        null_mut()
    }

    /// Returns an allocation to the list.
    ///
    /// # Safety
    /// `ptr` must come from [`allocate`](Self::allocate) on this list and
    /// `size` must be the size it was allocated with.
    pub(crate) unsafe fn free(&mut self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }
        // Mirror the rounding `allocate` applied; the header slot below
        // the pointer is part of the allocation.
        let size = align_up(size.max(1), align_of::<FreeBlock>());
        unsafe { self.insert(ptr as usize - HDR, size + HDR) };
    }

    /// Total free bytes, headers included.
    pub(crate) fn free_bytes(&self) -> usize {
        let mut total = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            total += unsafe { (*current).len };
            current = unsafe { (*current).next };
        }
        total
    }

    /// Number of free blocks; a fully coalesced single-seed heap has one.
    pub(crate) fn fragments(&self) -> usize {
        let mut n = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            n += 1;
            current = unsafe { (*current).next };
        }
        n
    }

    /// Inserts `[addr, addr + len)` sorted by address and merges it with
    /// adjacent neighbors.
    ///
    /// # Safety
    /// The range must be valid, writable, free, header-aligned memory.
    unsafe fn insert(&mut self, addr: usize, len: usize) {
        if len < HDR {
            return;
        }
        let mut prev: *mut FreeBlock = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }
        let block = addr as *mut FreeBlock;
        unsafe {
            ptr::write(block, FreeBlock { len, next: current });
            (*prev).next = block;
            self.coalesce(prev);
        }
    }

    /// Merges the block after `prev` with its direct neighbors where they
    /// touch.
    ///
    /// # Safety
    /// `prev` must be a node of this list, the sentinel included.
    unsafe fn coalesce(&mut self, prev: *mut FreeBlock) {
        let current = unsafe { (*prev).next };
        if current.is_null() {
            return;
        }
        unsafe {
            let next = (*current).next;
            if !next.is_null() && current as usize + (*current).len == next as usize {
                (*current).len += (*next).len;
                (*current).next = (*next).next;
            }
            if !ptr::eq(prev, &raw const self.head)
                && prev as usize + (*prev).len == current as usize
            {
                (*prev).len += (*current).len;
                (*prev).next = (*current).next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARENA: usize = 64 * 1024;

    #[repr(align(4096))]
    struct Aligned(#[allow(dead_code)] [u8; ARENA]);

    /// A seeded list over heap-backed storage. The box is returned so the
    /// arena outlives the list borrowing it.
    fn seeded() -> (FreeList, Box<Aligned>, usize) {
        let arena = Box::new(Aligned([0; ARENA]));
        let start = core::ptr::from_ref(&arena.0).cast::<u8>() as usize;
        let mut list = FreeList::new();
        unsafe { list.seed(start, ARENA) };
        (list, arena, start)
    }

    #[test]
    fn seed_makes_one_block() {
        let (list, _arena, _) = seeded();
        assert_eq!(list.free_bytes(), ARENA);
        assert_eq!(list.fragments(), 1);
    }

    #[test]
    fn empty_list_allocates_nothing() {
        let mut list = FreeList::new();
        assert!(list.allocate(16, 8).is_null());
        assert_eq!(list.free_bytes(), 0);
    }

    #[test]
    fn allocation_is_aligned_and_accounted() {
        let (mut list, _arena, _) = seeded();
        for align in [8usize, 16, 64, 256, 4096] {
            let p = list.allocate(100, align);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0, "align {align}");
        }
        assert!(list.free_bytes() < ARENA);
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        let (mut list, _arena, _) = seeded();
        let a = list.allocate(100, 8);
        let b = list.allocate(3000, 64);
        let c = list.allocate(17, 8);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        // Free out of order so every merge direction is exercised.
        unsafe {
            list.free(b, 3000);
            list.free(a, 100);
            list.free(c, 17);
        }
        assert_eq!(list.free_bytes(), ARENA);
        assert_eq!(list.fragments(), 1);
    }

    #[test]
    fn oversize_request_returns_null() {
        let (mut list, _arena, _) = seeded();
        assert!(list.allocate(ARENA + 1, 8).is_null());
        // The failed attempt must not damage the list.
        assert_eq!(list.free_bytes(), ARENA);
    }

    #[test]
    fn freed_space_is_reused() {
        let (mut list, _arena, _) = seeded();
        let first = list.allocate(ARENA / 2, 16);
        assert!(!first.is_null());
        assert!(list.allocate(ARENA / 2, 16).is_null());
        unsafe { list.free(first, ARENA / 2) };
        let again = list.allocate(ARENA / 2, 16);
        assert_eq!(again, first);
    }

    #[test]
    fn zero_size_rounds_up_and_frees_cleanly() {
        let (mut list, _arena, _) = seeded();
        let p = list.allocate(0, 8);
        assert!(!p.is_null());
        unsafe { list.free(p, 0) };
        assert_eq!(list.free_bytes(), ARENA);
        assert_eq!(list.fragments(), 1);
    }

    #[test]
    fn second_seed_extends_the_heap() {
        let (mut list, _arena, _) = seeded();
        let extra = Box::new(Aligned([0; ARENA]));
        let start = core::ptr::from_ref(&extra.0).cast::<u8>() as usize;
        unsafe { list.seed(start, ARENA) };
        assert_eq!(list.free_bytes(), 2 * ARENA);
    }
}
