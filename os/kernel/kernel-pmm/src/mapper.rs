use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// Converts physical addresses to usable pointers in the current virtual
/// address space, e.g. via an identity map or a higher-half direct map (HHDM).
///
/// The allocator dereferences free-list nodes through this trait and the
/// page-table code reaches table frames through it. Host tests substitute an
/// in-memory arena.
///
/// # Safety
/// - `pa` must be mapped writable in the current page tables for `&mut T`.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain valid
///   for `'a`.
/// - Type `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a *physical* address to a usable mutable reference in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<M: PhysMapper> PhysMapper for &M {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { (*self).phys_to_mut(pa) }
    }
}

/// The kernel's fixed-offset mapper: `va = base + pa`.
///
/// Valid once the direct map covers all physical memory the kernel will
/// touch. The base is passed in rather than read from a constant so loader
/// code with an identity map (base 0) can reuse the same type.
#[derive(Copy, Clone, Debug)]
pub struct DirectMapper {
    base: u64,
}

impl DirectMapper {
    #[must_use]
    pub const fn new(base: u64) -> Self {
        Self { base }
    }
}

impl PhysMapper for DirectMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = self.base.wrapping_add(pa.as_u64());
        unsafe { &mut *(va as *mut T) }
    }
}

/// Zero an entire 4 KiB frame through the mapper.
///
/// Freshly committed pages are always zeroed before they become visible to
/// a user program, so stale physical contents never leak across processes.
///
/// # Safety
/// The frame must be mapped writable through `mapper` and not concurrently
/// accessed.
pub unsafe fn zero_page<M: PhysMapper>(mapper: &M, page: PhysicalPage) {
    let bytes: &mut [u8; 4096] = unsafe { mapper.phys_to_mut(page.base()) };
    bytes.fill(0);
}
