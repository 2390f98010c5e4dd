//! Per-process virtual address spaces.
//!
//! An [`AddressSpace`] wraps one PML4 root and implements the allocation
//! policy on top of the [`PageTableWalker`]: range allocation (lazy by
//! default, eager on request), freeing with conservative table reclamation,
//! protection changes, cross-space copies, and file-backed regions whose
//! content arrives through the page-fault path.
//!
//! The type carries no lock. Callers serialize access per space; every
//! mutation of table memory goes through the direct map, so `&self` methods
//! that commit pages are still writes and fall under that rule.
//!
//! The upper half of every space is shared: the kernel root pre-populates
//! all 256 upper PML4 slots with (initially empty) PDPTs, and process roots
//! copy those PML4 entries verbatim. Upper-half PML4 entries therefore never
//! change after boot, and upper-half tables are never reclaimed through an
//! individual space.

use crate::error::VmError;
use crate::page_entry::{LeafState, PageEntryBits, PageTable};
use crate::protection::{AccessOrigin, CommitPolicy, Protection, ProtectionQuery};
use crate::walker::PageTableWalker;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::memory::{
    KERNEL_ALLOC_CEILING, KERNEL_ALLOC_FLOOR, USER_ALLOC_CEILING, USER_ALLOC_FLOOR,
};
use kernel_memory_addresses::{
    PAGE_SIZE, PageCount, PhysicalPage, VirtualAddress, VirtualPage,
};
use kernel_pmm::{FrameSource, OutOfMemory, PhysMapper, zero_page};

/// Disk sector granularity assumed by [`MappingSource::Device`] regions.
pub const SECTOR_SIZE: u64 = 512;

const SPAN_L4: u64 = 1 << 39;
const SPAN_L3: u64 = 1 << 30;
const SPAN_L2: u64 = 1 << 21;

/// Where the content of a file-backed region comes from.
///
/// Handles are opaque to this crate; the page-fault side resolves them
/// against the VFS or the block layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MappingSource {
    /// A byte range of an open file.
    File { file: u64, offset: u64 },
    /// Raw disk sectors, for loaders that bypass the file layer.
    Device { device: u64, lba: u64 },
}

impl MappingSource {
    /// The same source shifted `bytes` further into the backing object.
    #[must_use]
    pub const fn advanced(self, bytes: u64) -> Self {
        match self {
            Self::File { file, offset } => Self::File {
                file,
                offset: offset + bytes,
            },
            Self::Device { device, lba } => {
                debug_assert!(bytes % SECTOR_SIZE == 0);
                Self::Device {
                    device,
                    lba: lba + bytes / SECTOR_SIZE,
                }
            }
        }
    }
}

/// One file-backed run of pages, keyed in the region map by its base.
struct FileRegion {
    len: u64,
    source: MappingSource,
}

/// One virtual address space: a PML4 root plus the file-region map.
pub struct AddressSpace<M> {
    root: PhysicalPage,
    walker: PageTableWalker<M>,
    file_map: BTreeMap<u64, FileRegion>,
}

impl<M: PhysMapper> AddressSpace<M> {
    /// Adopt an existing PML4 root.
    ///
    /// # Safety
    /// `root` must be a valid, zero-initialized or well-formed PML4 that
    /// this space owns exclusively, reachable through `mapper`.
    #[must_use]
    pub const unsafe fn from_root(root: PhysicalPage, mapper: M) -> Self {
        Self {
            root,
            walker: PageTableWalker::new(mapper),
            file_map: BTreeMap::new(),
        }
    }

    /// Build the kernel's own address space.
    ///
    /// All 256 upper-half PML4 slots are populated with empty PDPTs up
    /// front, so later kernel mappings never edit a PML4 entry and process
    /// roots can share the upper half by copying the 256 entries once.
    ///
    /// # Errors
    /// [`OutOfMemory`] if the root or one of the PDPTs cannot be allocated;
    /// everything allocated up to that point is returned to `frames`.
    pub fn new_kernel_root<F: FrameSource>(mapper: M, frames: &mut F) -> Result<Self, OutOfMemory> {
        let walker = PageTableWalker::new(mapper);
        let root = frames.alloc_frame()?;
        // SAFETY: fresh frame becoming the PML4.
        let l4 = unsafe { walker.table(root) };
        l4.zero();

        for slot in PageTable::LEN / 2..PageTable::LEN {
            match frames.alloc_frame() {
                Ok(pdpt) => {
                    // SAFETY: fresh frame becoming a PDPT.
                    unsafe { walker.table(pdpt) }.zero();
                    l4.set(slot, PageEntryBits::link(pdpt, false));
                }
                Err(oom) => {
                    for prev in PageTable::LEN / 2..slot {
                        let page = PhysicalPage::containing(l4.get(prev).physical_address());
                        // SAFETY: empty tables created just above.
                        unsafe { frames.free_frame(page) };
                    }
                    // SAFETY: nothing references the root yet.
                    unsafe { frames.free_frame(root) };
                    return Err(oom);
                }
            }
        }
        log::debug!("kernel address space root at {}", root.base());
        Ok(Self {
            root,
            walker,
            file_map: BTreeMap::new(),
        })
    }

    /// A fresh process space: empty lower half, upper half shared with this
    /// space by copying its upper 256 PML4 entries.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no frame is available for the new root.
    pub fn new_process_space<F: FrameSource>(&self, frames: &mut F) -> Result<Self, OutOfMemory>
    where
        M: Clone,
    {
        let root = frames.alloc_frame()?;
        let walker = PageTableWalker::new(self.walker.mapper().clone());
        // SAFETY: fresh frame becoming the PML4; self.root is live.
        let dst = unsafe { walker.table(root) };
        let src = unsafe { self.walker.table(self.root) };
        dst.zero();
        for slot in PageTable::LEN / 2..PageTable::LEN {
            dst.set(slot, src.get(slot));
        }
        log::debug!("process address space root at {}", root.base());
        Ok(Self {
            root,
            walker,
            file_map: BTreeMap::new(),
        })
    }

    /// The PML4 frame, in the form CR3 wants it.
    #[must_use]
    pub const fn root(&self) -> PhysicalPage {
        self.root
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        self.walker.mapper()
    }

    pub(crate) const fn walker(&self) -> &PageTableWalker<M> {
        &self.walker
    }

    /// Allocate a range of `size` bytes.
    ///
    /// With `base` given, the exact range is claimed; otherwise the lower
    /// (for [`AccessOrigin::User`]) or upper (for [`AccessOrigin::Kernel`])
    /// allocation window is scanned first-fit. Under [`CommitPolicy::Lazy`]
    /// the pages are only reserved and materialize on first touch; under
    /// [`CommitPolicy::Eager`] every page is backed by a zeroed frame before
    /// the call returns. A failure part way through is rolled back in full.
    ///
    /// `size` is rounded up to whole pages. A zero `size` is a no-op that
    /// reports success. Returns the base of the allocated range.
    ///
    /// # Errors
    /// * [`VmError::BaseAddressUsed`] if an explicit range overlaps an
    ///   existing mapping or reservation.
    /// * [`VmError::InvalidParameter`] for a null or non-canonical base.
    /// * [`VmError::AccessDenied`] if a user-origin request touches the
    ///   kernel half.
    /// * [`VmError::OutOfMemory`] if frames or address space run out.
    pub fn allocate<F: FrameSource>(
        &mut self,
        base: Option<VirtualAddress>,
        size: u64,
        protection: Protection,
        origin: AccessOrigin,
        policy: CommitPolicy,
        frames: &mut F,
    ) -> Result<VirtualAddress, VmError> {
        if size == 0 {
            return Ok(base.unwrap_or(VirtualAddress::NULL));
        }
        let protection = match origin {
            AccessOrigin::User => protection.with_user(true),
            AccessOrigin::Kernel => protection,
        };
        let (first, count) = match base {
            Some(base) => {
                check_range(base, size, origin)?;
                let first = VirtualPage::containing(base);
                let count = PageCount::spanning(base.page_offset() + size);
                for page in first.range(count) {
                    if self.walker.leaf_state(self.root, page.base()) != LeafState::Unmapped {
                        return Err(VmError::BaseAddressUsed);
                    }
                }
                (first, count)
            }
            None => {
                let count = PageCount::spanning(size);
                let first = self
                    .find_free_range(origin, count)
                    .ok_or(VmError::OutOfMemory(OutOfMemory))?;
                (first, count)
            }
        };

        let mut done = 0;
        for page in first.range(count) {
            if let Err(oom) = self.populate_one(page, protection, policy, frames) {
                // one extra page so a chain built just before the failure is
                // reclaimed as well
                self.wipe_range(first, PageCount::new(done + 1), frames);
                return Err(oom.into());
            }
            done += 1;
        }
        Ok(first.base())
    }

    /// Write one leaf according to the commit policy.
    fn populate_one<F: FrameSource>(
        &mut self,
        page: VirtualPage,
        protection: Protection,
        policy: CommitPolicy,
        frames: &mut F,
    ) -> Result<(), OutOfMemory> {
        let va = page.base();
        let pt_page =
            self.walker
                .ensure_leaf_chain(self.root, va, frames, protection.user())?;
        let state = match policy {
            CommitPolicy::Lazy => LeafState::LazyReserved { protection },
            CommitPolicy::Eager => {
                let frame = frames.alloc_frame()?;
                // SAFETY: fresh frame, zeroed before it becomes visible.
                unsafe { zero_page(self.walker.mapper(), frame) };
                LeafState::Committed { frame, protection }
            }
        };
        // SAFETY: PT resolved by ensure_leaf_chain above.
        unsafe { self.walker.table(pt_page) }.set(va.pt_index(), state.encode());
        Ok(())
    }

    /// Release a range of `size` bytes starting at `base`.
    ///
    /// Committed frames are returned to `frames`, reservations are dropped,
    /// file associations for the range are removed, and lower-half tables
    /// that became entirely empty are reclaimed. Pages of the range that are
    /// not mapped are skipped, so freeing twice is harmless.
    ///
    /// # Errors
    /// * [`VmError::InvalidParameter`] for a null or non-canonical base.
    /// * [`VmError::AccessDenied`] if a user-origin request touches the
    ///   kernel half.
    pub fn free<F: FrameSource>(
        &mut self,
        base: VirtualAddress,
        size: u64,
        origin: AccessOrigin,
        frames: &mut F,
    ) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        check_range(base, size, origin)?;
        let first = VirtualPage::containing(base);
        let count = PageCount::spanning(base.page_offset() + size);
        self.wipe_range(first, count, frames);
        self.drop_file_regions(first, count);
        Ok(())
    }

    /// Clear every leaf of the range, returning committed frames, and
    /// reclaim emptied lower-half tables.
    fn wipe_range<F: FrameSource>(&mut self, first: VirtualPage, count: PageCount, frames: &mut F) {
        let mut left = count.as_u64();
        for page in first.range(count) {
            left -= 1;
            let va = page.base();
            let Some(pt_page) = self.walker.leaf_table_page(self.root, va) else {
                continue;
            };
            // SAFETY: PT of the resolved chain.
            let pt = unsafe { self.walker.table(pt_page) };
            match LeafState::decode(pt.get(va.pt_index())) {
                LeafState::Committed { frame, .. } => {
                    pt.set(va.pt_index(), PageEntryBits::new());
                    // SAFETY: the last mapping of this frame is gone.
                    unsafe { frames.free_frame(frame) };
                }
                LeafState::LazyReserved { .. } => pt.set(va.pt_index(), PageEntryBits::new()),
                LeafState::Unmapped => {}
            }
            // One reclaim attempt per touched PT. Upper-half tables are
            // shared between spaces and stay.
            if va.is_user_half() && (va.pt_index() == PageTable::LEN - 1 || left == 0) {
                self.walker.reclaim_empty_tables(self.root, va, frames);
            }
        }
    }

    /// Change the protection of every mapped page in the range.
    ///
    /// Committed pages are rewritten in place; lazy reservations carry the
    /// new protection to their eventual commit. Unmapped pages are skipped.
    ///
    /// # Errors
    /// * [`VmError::InvalidParameter`] for a null or non-canonical base.
    /// * [`VmError::AccessDenied`] if a user-origin request touches the
    ///   kernel half.
    pub fn protect(
        &mut self,
        base: VirtualAddress,
        size: u64,
        protection: Protection,
        origin: AccessOrigin,
    ) -> Result<(), VmError> {
        if size == 0 {
            return Ok(());
        }
        check_range(base, size, origin)?;
        let protection = match origin {
            AccessOrigin::User => protection.with_user(true),
            AccessOrigin::Kernel => protection,
        };
        let first = VirtualPage::containing(base);
        let count = PageCount::spanning(base.page_offset() + size);
        for page in first.range(count) {
            let va = page.base();
            let Some(pt_page) = self.walker.leaf_table_page(self.root, va) else {
                continue;
            };
            // SAFETY: PT of the resolved chain.
            let pt = unsafe { self.walker.table(pt_page) };
            let state = match LeafState::decode(pt.get(va.pt_index())) {
                LeafState::Committed { frame, .. } => LeafState::Committed { frame, protection },
                LeafState::LazyReserved { .. } => LeafState::LazyReserved { protection },
                LeafState::Unmapped => continue,
            };
            pt.set(va.pt_index(), state.encode());
            if protection.user() {
                self.walker.widen_user_path(self.root, va);
            }
        }
        Ok(())
    }

    /// The mapping state of the page containing `va`.
    #[must_use]
    pub fn query(&self, va: VirtualAddress) -> ProtectionQuery {
        match self.walker.leaf_state(self.root, va) {
            LeafState::Unmapped => ProtectionQuery::Unmapped,
            LeafState::LazyReserved { protection } => ProtectionQuery::Reserved(protection),
            LeafState::Committed { protection, .. } => ProtectionQuery::Committed(protection),
        }
    }

    /// Copy `len` bytes from `src_va` in `src` to `dest_va` in `dest`.
    ///
    /// The spaces may be distinct or the same; overlapping same-space ranges
    /// behave like a memmove. Lazily reserved source pages read as zeros and
    /// stay uncommitted; lazily reserved destination pages are committed on
    /// the spot. Writes go through the physical frame, so destination
    /// protection does not restrict the copy.
    ///
    /// # Errors
    /// * [`VmError::MemcpySourceFault`] if a source page is unmapped.
    /// * [`VmError::MemcpyDestinationFault`] if a destination page is
    ///   unmapped.
    /// * [`VmError::InvalidParameter`] for null or non-canonical ranges.
    /// * [`VmError::OutOfMemory`] if committing a destination page fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn copy<F: FrameSource>(
        dest: &Self,
        dest_va: VirtualAddress,
        src: &Self,
        src_va: VirtualAddress,
        len: u64,
        frames: &mut F,
    ) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        check_range(src_va, len, AccessOrigin::Kernel)?;
        check_range(dest_va, len, AccessOrigin::Kernel)?;

        let mut moved = 0;
        while moved < len {
            let s = VirtualAddress::new(src_va.as_u64() + moved);
            let d = VirtualAddress::new(dest_va.as_u64() + moved);
            let chunk = (len - moved)
                .min(PAGE_SIZE - s.page_offset())
                .min(PAGE_SIZE - d.page_offset());

            let src_frame = match src.walker.leaf_state(src.root, s) {
                LeafState::Committed { frame, .. } => Some(frame),
                // reads as zeros without committing
                LeafState::LazyReserved { .. } => None,
                LeafState::Unmapped => return Err(VmError::MemcpySourceFault),
            };
            let dest_frame = match dest.walker.leaf_state(dest.root, d) {
                LeafState::Committed { frame, .. } => frame,
                LeafState::LazyReserved { .. } => dest.commit_zero_filled(d, frames)?,
                LeafState::Unmapped => return Err(VmError::MemcpyDestinationFault),
            };

            // SAFETY: committed frames, offsets stay inside one page.
            let dst_ptr = core::ptr::from_mut::<u8>(unsafe {
                dest.walker
                    .mapper()
                    .phys_to_mut(dest_frame.address_at(d.page_offset()))
            });
            match src_frame {
                Some(frame) => {
                    // SAFETY: as above.
                    let src_ptr = core::ptr::from_ref::<u8>(unsafe {
                        src.walker
                            .mapper()
                            .phys_to_mut(frame.address_at(s.page_offset()))
                    });
                    // SAFETY: both sides checked; copy handles overlap.
                    unsafe { core::ptr::copy(src_ptr, dst_ptr, chunk as usize) };
                }
                // SAFETY: as above.
                None => unsafe { core::ptr::write_bytes(dst_ptr, 0, chunk as usize) },
            }
            moved += chunk;
        }
        Ok(())
    }

    /// Reserve a range whose pages are filled from `source` on first touch.
    ///
    /// The mapping is always lazy; the fault path reads the backing object.
    /// An explicit `base` must be page-aligned, since the source offset is
    /// tied to page boundaries.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate), and [`VmError::InvalidParameter`]
    /// for a zero `size` or an unaligned explicit `base`.
    pub fn map_file<F: FrameSource>(
        &mut self,
        base: Option<VirtualAddress>,
        size: u64,
        protection: Protection,
        origin: AccessOrigin,
        source: MappingSource,
        frames: &mut F,
    ) -> Result<VirtualAddress, VmError> {
        if size == 0 {
            return Err(VmError::InvalidParameter);
        }
        if let Some(base) = base
            && !base.is_page_aligned()
        {
            return Err(VmError::InvalidParameter);
        }
        let va = self.allocate(base, size, protection, origin, CommitPolicy::Lazy, frames)?;
        let len = PageCount::spanning(size).bytes();
        self.file_map.insert(va.as_u64(), FileRegion { len, source });
        Ok(va)
    }

    /// The backing source for the page containing `va`, already advanced to
    /// that page's position in the region.
    #[must_use]
    pub fn file_backing(&self, va: VirtualAddress) -> Option<MappingSource> {
        let page = VirtualPage::containing(va).base().as_u64();
        let (&base, region) = self.file_map.range(..=page).next_back()?;
        if page < base + region.len {
            Some(region.source.advanced(page - base))
        } else {
            None
        }
    }

    /// Commit one lazily reserved page with a zero-filled frame, keeping
    /// the protection stashed at reservation time. Returns the frame.
    ///
    /// The leaf for `va` must currently be lazily reserved.
    ///
    /// # Errors
    /// [`OutOfMemory`] if no frame is available.
    pub fn commit_zero_filled<F: FrameSource>(
        &self,
        va: VirtualAddress,
        frames: &mut F,
    ) -> Result<PhysicalPage, OutOfMemory> {
        let frame = frames.alloc_frame()?;
        // SAFETY: fresh frame, zeroed before it becomes visible.
        unsafe { zero_page(self.walker.mapper(), frame) };
        self.install_committed(VirtualPage::containing(va), frame);
        Ok(frame)
    }

    /// Swap a lazy reservation for a committed mapping of `frame`.
    ///
    /// The caller has fully populated `frame`; the leaf must currently be
    /// lazily reserved.
    pub(crate) fn install_committed(&self, page: VirtualPage, frame: PhysicalPage) {
        let va = page.base();
        let Some(pt_page) = self.walker.leaf_table_page(self.root, va) else {
            debug_assert!(false, "commit without a reservation chain");
            return;
        };
        // SAFETY: PT of the resolved chain.
        let pt = unsafe { self.walker.table(pt_page) };
        match LeafState::decode(pt.get(va.pt_index())) {
            LeafState::LazyReserved { protection } => {
                pt.set(va.pt_index(), LeafState::Committed { frame, protection }.encode());
            }
            LeafState::Committed { .. } | LeafState::Unmapped => {
                debug_assert!(false, "commit on a page that is not reserved");
            }
        }
    }

    /// Tear down the entire lower half: every committed frame, every table,
    /// every file association. Used when the owning process exits. The root
    /// itself stays valid and keeps the shared upper half.
    pub fn release_user_half<F: FrameSource>(&mut self, frames: &mut F) {
        // SAFETY: root is a live PML4; each deeper table is read from a
        // present link before use.
        let l4 = unsafe { self.walker.table(self.root) };
        for i4 in 0..PageTable::LEN / 2 {
            let e4 = l4.get(i4);
            if !e4.present() {
                continue;
            }
            let pdpt_page = PhysicalPage::containing(e4.physical_address());
            let pdpt = unsafe { self.walker.table(pdpt_page) };
            for i3 in 0..PageTable::LEN {
                let e3 = pdpt.get(i3);
                if !e3.present() {
                    continue;
                }
                debug_assert!(!e3.large_page(), "huge page in the lower half");
                let pd_page = PhysicalPage::containing(e3.physical_address());
                let pd = unsafe { self.walker.table(pd_page) };
                for i2 in 0..PageTable::LEN {
                    let e2 = pd.get(i2);
                    if !e2.present() {
                        continue;
                    }
                    debug_assert!(!e2.large_page(), "huge page in the lower half");
                    let pt_page = PhysicalPage::containing(e2.physical_address());
                    let pt = unsafe { self.walker.table(pt_page) };
                    for i1 in 0..PageTable::LEN {
                        if let LeafState::Committed { frame, .. } = LeafState::decode(pt.get(i1)) {
                            // SAFETY: the only mapping of the frame is about
                            // to disappear with its table.
                            unsafe { frames.free_frame(frame) };
                        }
                    }
                    // SAFETY: tables of the lower half belong to this space
                    // alone.
                    unsafe { frames.free_frame(pt_page) };
                }
                // SAFETY: as above.
                unsafe { frames.free_frame(pd_page) };
            }
            // SAFETY: as above.
            unsafe { frames.free_frame(pdpt_page) };
            l4.set(i4, PageEntryBits::new());
        }
        self.file_map.clear();
        log::debug!("released lower half of space rooted at {}", self.root.base());
    }

    /// First-fit scan of the allocation window for `origin`.
    ///
    /// Absent intermediate tables let the scan skip whole 512 GiB, 1 GiB,
    /// or 2 MiB strides at once.
    fn find_free_range(&self, origin: AccessOrigin, count: PageCount) -> Option<VirtualPage> {
        let (floor, ceiling) = match origin {
            AccessOrigin::User => (USER_ALLOC_FLOOR, USER_ALLOC_CEILING),
            AccessOrigin::Kernel => (KERNEL_ALLOC_FLOOR, KERNEL_ALLOC_CEILING),
        };
        let needed = count.bytes();
        let mut start = floor;
        let mut cursor = floor;
        loop {
            if start.checked_add(needed)? > ceiling {
                log::warn!(
                    "no free virtual range of {count} pages in the {origin:?} window"
                );
                return None;
            }
            if cursor - start >= needed {
                return Some(VirtualPage::containing(VirtualAddress::new(start)));
            }

            let va = VirtualAddress::new(cursor);
            // SAFETY: the root and present links below it.
            let e4 = unsafe { self.walker.table(self.root) }.get(va.pml4_index());
            if !e4.present() {
                cursor = next_boundary(cursor, SPAN_L4)?;
                continue;
            }
            let l3 = unsafe {
                self.walker
                    .table(PhysicalPage::containing(e4.physical_address()))
            };
            let e3 = l3.get(va.pdpt_index());
            if !e3.present() {
                cursor = next_boundary(cursor, SPAN_L3)?;
                continue;
            }
            if e3.large_page() {
                cursor = next_boundary(cursor, SPAN_L3)?;
                start = cursor;
                continue;
            }
            let l2 = unsafe {
                self.walker
                    .table(PhysicalPage::containing(e3.physical_address()))
            };
            let e2 = l2.get(va.pd_index());
            if !e2.present() {
                cursor = next_boundary(cursor, SPAN_L2)?;
                continue;
            }
            if e2.large_page() {
                cursor = next_boundary(cursor, SPAN_L2)?;
                start = cursor;
                continue;
            }
            let l1 = unsafe {
                self.walker
                    .table(PhysicalPage::containing(e2.physical_address()))
            };
            let occupied = !l1.get(va.pt_index()).is_unused();
            cursor = cursor.checked_add(PAGE_SIZE)?;
            if occupied {
                start = cursor;
            }
        }
    }

    /// Remove file associations overlapping the range, splitting regions
    /// that stick out on either side.
    fn drop_file_regions(&mut self, first: VirtualPage, count: PageCount) {
        let start = first.base().as_u64();
        let end = start.saturating_add(count.bytes());
        // Regions are disjoint, so walking down from the last region below
        // `end` visits exactly the overlapping ones.
        let hits: Vec<u64> = self
            .file_map
            .range(..end)
            .rev()
            .take_while(|entry| *entry.0 + entry.1.len > start)
            .map(|entry| *entry.0)
            .collect();
        for base in hits {
            let Some(region) = self.file_map.remove(&base) else {
                continue;
            };
            if base < start {
                self.file_map.insert(
                    base,
                    FileRegion {
                        len: start - base,
                        source: region.source,
                    },
                );
            }
            let region_end = base + region.len;
            if region_end > end {
                self.file_map.insert(
                    end,
                    FileRegion {
                        len: region_end - end,
                        source: region.source.advanced(end - base),
                    },
                );
            }
        }
    }
}

/// Next multiple of `span` above `at`, `None` on address overflow.
const fn next_boundary(at: u64, span: u64) -> Option<u64> {
    (at & !(span - 1)).checked_add(span)
}

/// Sanity checks shared by every ranged operation.
fn check_range(base: VirtualAddress, bytes: u64, origin: AccessOrigin) -> Result<(), VmError> {
    if base.is_null() || !base.is_canonical() {
        return Err(VmError::InvalidParameter);
    }
    let last = base
        .checked_add(bytes - 1)
        .filter(|last| last.is_canonical())
        .ok_or(VmError::InvalidParameter)?;
    // a range may not straddle the non-canonical hole
    if base.is_user_half() != last.is_user_half() {
        return Err(VmError::InvalidParameter);
    }
    if !origin.may_touch(base) || !origin.may_touch(last) {
        return Err(VmError::AccessDenied);
    }
    Ok(())
}
