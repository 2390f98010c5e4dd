use crate::{PAGE_OFFSET_MASK, PAGE_SIZE, PageCount};
use core::fmt;

/// First address of the canonical higher half.
///
/// With 48-bit virtual addresses, bits 63..47 must repeat bit 47; the valid
/// space therefore splits into a user half below `0x0000_8000_0000_0000` and
/// a kernel half from this constant upward. Privilege checks in the virtual
/// allocator key off this boundary.
pub const KERNEL_HALF_BASE: u64 = 0xFFFF_8000_0000_0000;

/// A raw 64-bit virtual address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether bits 63..47 correctly sign-extend bit 47.
    ///
    /// The hardware faults on non-canonical accesses anyway, but the virtual
    /// allocator rejects them up front with a typed error instead.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    pub const fn is_canonical(self) -> bool {
        (((self.0 as i64) << 16) >> 16) as u64 == self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_kernel_half(self) -> bool {
        self.0 >= KERNEL_HALF_BASE
    }

    #[inline]
    #[must_use]
    pub const fn is_user_half(self) -> bool {
        self.0 < KERNEL_HALF_BASE
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & PAGE_OFFSET_MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down_to_page(self) -> Self {
        Self(self.0 & !PAGE_OFFSET_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }

    /// Byte offset within the containing page.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_OFFSET_MASK
    }

    /// Index into the level-4 table (bits 47..39).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pml4_index(self) -> usize {
        ((self.0 >> 39) & 0x1FF) as usize
    }

    /// Index into the level-3 table (bits 38..30).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pdpt_index(self) -> usize {
        ((self.0 >> 30) & 0x1FF) as usize
    }

    /// Index into the level-2 table (bits 29..21).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pd_index(self) -> usize {
        ((self.0 >> 21) & 0x1FF) as usize
    }

    /// Index into the level-1 table (bits 20..12).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pt_index(self) -> usize {
        ((self.0 >> 12) & 0x1FF) as usize
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The page-aligned base of one virtual 4 KiB page.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage(u64);

impl VirtualPage {
    #[inline]
    #[must_use]
    pub const fn from_base(base: VirtualAddress) -> Option<Self> {
        if base.is_page_aligned() {
            Some(Self(base.0))
        } else {
            None
        }
    }

    /// The page containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: VirtualAddress) -> Self {
        Self(addr.align_down_to_page().0)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress(self.0)
    }

    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }

    /// The address `offset` bytes into this page.
    #[inline]
    #[must_use]
    pub const fn address_at(self, offset: u64) -> VirtualAddress {
        debug_assert!(offset < PAGE_SIZE);
        VirtualAddress(self.0 + offset)
    }

    /// Iterator over `count` consecutive pages starting at `self`.
    #[inline]
    #[must_use]
    pub const fn range(self, count: PageCount) -> VirtualPageRange {
        VirtualPageRange {
            next: self.0,
            end: self.0 + count.bytes(),
        }
    }
}

impl fmt::Debug for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage({:#018x})", self.0)
    }
}

impl fmt::Display for VirtualPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Iterator over a run of consecutive virtual pages.
#[derive(Copy, Clone, Debug)]
pub struct VirtualPageRange {
    next: u64,
    end: u64,
}

impl Iterator for VirtualPageRange {
    type Item = VirtualPage;

    fn next(&mut self) -> Option<VirtualPage> {
        if self.next >= self.end {
            return None;
        }
        let page = VirtualPage(self.next);
        self.next += PAGE_SIZE;
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from((self.end - self.next) / PAGE_SIZE).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for VirtualPageRange {}
