use crate::{PAGE_OFFSET_MASK, PAGE_SHIFT, PAGE_SIZE, PageCount};
use core::fmt;
use core::ops::Add;

/// A raw 64-bit physical address.
///
/// Physical addresses are never dereferenced directly; the kernel reaches
/// physical memory through the higher-half direct map (see the `PhysMapper`
/// trait in `kernel-pmm`).
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    pub const NULL: Self = Self(0);

    #[inline]
    #[must_use]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
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

    /// Rounds up to the next page boundary. `None` on wrap-around.
    #[inline]
    #[must_use]
    pub const fn align_up_to_page(self) -> Option<Self> {
        match self.0.checked_add(PAGE_OFFSET_MASK) {
            Some(v) => Some(Self(v & !PAGE_OFFSET_MASK)),
            None => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, bytes: u64) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalAddress({:#018x})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// The page-aligned base of one physical 4 KiB frame.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage(u64);

impl PhysicalPage {
    /// Wraps `base` if it is page-aligned.
    #[inline]
    #[must_use]
    pub const fn from_base(base: PhysicalAddress) -> Option<Self> {
        if base.is_page_aligned() {
            Some(Self(base.0))
        } else {
            None
        }
    }

    /// The frame containing `addr` (aligns down).
    #[inline]
    #[must_use]
    pub const fn containing(addr: PhysicalAddress) -> Self {
        Self(addr.align_down_to_page().0)
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0)
    }

    /// Frame number, i.e. the base shifted down by [`PAGE_SHIFT`].
    #[inline]
    #[must_use]
    pub const fn number(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn add_pages(self, n: u64) -> Self {
        Self(self.0 + n * PAGE_SIZE)
    }

    /// The address `offset` bytes into this frame. Debug-asserts the offset
    /// stays inside the page.
    #[inline]
    #[must_use]
    pub const fn address_at(self, offset: u64) -> PhysicalAddress {
        debug_assert!(offset < PAGE_SIZE);
        PhysicalAddress(self.0 + offset)
    }

    /// Iterator over `count` consecutive frames starting at `self`.
    #[inline]
    #[must_use]
    pub const fn range(self, count: PageCount) -> PhysicalPageRange {
        PhysicalPageRange {
            next: self.0,
            end: self.0 + count.bytes(),
        }
    }
}

impl fmt::Debug for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage({:#018x})", self.0)
    }
}

impl fmt::Display for PhysicalPage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// Iterator over a run of consecutive physical frames.
#[derive(Copy, Clone, Debug)]
pub struct PhysicalPageRange {
    next: u64,
    end: u64,
}

impl Iterator for PhysicalPageRange {
    type Item = PhysicalPage;

    fn next(&mut self) -> Option<PhysicalPage> {
        if self.next >= self.end {
            return None;
        }
        let page = PhysicalPage(self.next);
        self.next += PAGE_SIZE;
        Some(page)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = usize::try_from((self.end - self.next) / PAGE_SIZE).unwrap_or(usize::MAX);
        (n, Some(n))
    }
}

impl ExactSizeIterator for PhysicalPageRange {}
