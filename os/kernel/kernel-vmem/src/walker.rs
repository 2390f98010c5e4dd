//! Four-level page-table navigation.
//!
//! The walker owns no policy: it resolves, materializes, and reclaims the
//! table chain for a virtual address, always reaching physical table frames
//! through the [`PhysMapper`] direct map and pulling fresh frames from a
//! [`FrameSource`]. Policy (protection, laziness, privilege checks) lives in
//! [`AddressSpace`](crate::AddressSpace).
//!
//! Nothing here issues TLB maintenance; callers that modify an active
//! address space must invalidate affected pages themselves.

use crate::Protection;
use crate::page_entry::{LeafState, PageEntryBits, PageTable};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_pmm::{FrameSource, OutOfMemory, PhysMapper};

/// Leaf size for the boot-time huge mappings.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HugeSize {
    /// 2 MiB leaf written at the PD level.
    TwoMiB,
    /// 1 GiB leaf written at the PDPT level.
    OneGiB,
}

impl HugeSize {
    const fn bytes(self) -> u64 {
        match self {
            Self::TwoMiB => 1 << 21,
            Self::OneGiB => 1 << 30,
        }
    }
}

/// Navigates the PML4 → PDPT → PD → PT chain of one address space.
pub struct PageTableWalker<M> {
    mapper: M,
}

impl<M: PhysMapper> PageTableWalker<M> {
    pub const fn new(mapper: M) -> Self {
        Self { mapper }
    }

    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// View a physical frame as a page table.
    ///
    /// # Safety
    /// `page` must hold a live page table of the walked hierarchy (or a
    /// frame being initialized as one), reachable through the direct map.
    /// The returned lifetime is unconstrained; the address-space lock above
    /// this layer keeps access exclusive.
    pub(crate) unsafe fn table<'a>(&self, page: PhysicalPage) -> &'a mut PageTable {
        // SAFETY: forwarded to the caller.
        unsafe { self.mapper.phys_to_mut(page.base()) }
    }

    /// Software state of the leaf entry for `va`, [`LeafState::Unmapped`] if
    /// any level of the chain is absent.
    #[must_use]
    pub fn leaf_state(&self, root: PhysicalPage, va: VirtualAddress) -> LeafState {
        match self.leaf_table_page(root, va) {
            // SAFETY: just resolved as the PT of this chain.
            Some(pt) => LeafState::decode(unsafe { self.table(pt) }.get(va.pt_index())),
            None => LeafState::Unmapped,
        }
    }

    /// The frame of the PT holding the leaf entry for `va`, if the whole
    /// chain exists.
    #[must_use]
    pub fn leaf_table_page(
        &self,
        root: PhysicalPage,
        va: VirtualAddress,
    ) -> Option<PhysicalPage> {
        let mut page = root;
        for slot in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            // SAFETY: `page` is the root or was read from a present link.
            let entry = unsafe { self.table(page) }.get(slot);
            if !entry.present() {
                return None;
            }
            // Huge leaves exist only in the boot direct map, which managed
            // ranges never overlap.
            debug_assert!(!entry.large_page(), "huge page inside a managed range");
            page = PhysicalPage::containing(entry.physical_address());
        }
        Some(page)
    }

    /// Walk down to the PT for `va`, allocating, zeroing, and linking any
    /// missing intermediate table. Returns the PT frame.
    ///
    /// `user` decides whether fresh links (and the existing links on the
    /// path) permit user-mode access; the US bit is ANDed across the walk,
    /// so a user leaf is unreachable unless every link on the path allows
    /// it. Existing links are only ever widened, never narrowed.
    ///
    /// On allocation failure the address space is left exactly as it was:
    /// freshly linked tables are unlinked and returned to `frames`, and
    /// widening is applied only once the whole chain exists.
    ///
    /// # Errors
    /// [`OutOfMemory`] if a missing table could not be allocated.
    pub fn ensure_leaf_chain<F: FrameSource>(
        &self,
        root: PhysicalPage,
        va: VirtualAddress,
        frames: &mut F,
        user: bool,
    ) -> Result<PhysicalPage, OutOfMemory> {
        // (parent table frame, slot, fresh child frame)
        let mut fresh: [Option<(PhysicalPage, usize, PhysicalPage)>; 3] = [None; 3];
        // (table frame, slot) of an existing link lacking the user bit
        let mut widen: [Option<(PhysicalPage, usize)>; 3] = [None; 3];

        let mut page = root;
        for (depth, slot) in [va.pml4_index(), va.pdpt_index(), va.pd_index()]
            .into_iter()
            .enumerate()
        {
            // SAFETY: `page` is the root, a present link, or a fresh table.
            let table = unsafe { self.table(page) };
            let entry = table.get(slot);
            page = if entry.present() {
                debug_assert!(!entry.large_page(), "huge page inside a managed range");
                if user && !entry.user_access() {
                    widen[depth] = Some((page, slot));
                }
                PhysicalPage::containing(entry.physical_address())
            } else {
                match frames.alloc_frame() {
                    Ok(frame) => {
                        // SAFETY: fresh frame about to become a table.
                        unsafe { self.table(frame) }.zero();
                        table.set(slot, PageEntryBits::link(frame, user));
                        fresh[depth] = Some((page, slot, frame));
                        frame
                    }
                    Err(oom) => {
                        self.unwind_fresh(&fresh, frames);
                        return Err(oom);
                    }
                }
            };
        }

        for (table, slot) in widen.into_iter().flatten() {
            // SAFETY: recorded from a present link during the walk above.
            let t = unsafe { self.table(table) };
            let e = t.get(slot);
            t.set(slot, e.with_user_access(true));
        }
        Ok(page)
    }

    /// Set the US bit on every present link of the chain for `va`.
    ///
    /// Used when a protection change turns an existing mapping
    /// user-accessible after its chain was built for kernel-only leaves.
    pub fn widen_user_path(&self, root: PhysicalPage, va: VirtualAddress) {
        let mut page = root;
        for slot in [va.pml4_index(), va.pdpt_index(), va.pd_index()] {
            // SAFETY: `page` is the root or was read from a present link.
            let table = unsafe { self.table(page) };
            let entry = table.get(slot);
            if !entry.present() {
                return;
            }
            if !entry.user_access() {
                table.set(slot, entry.with_user_access(true));
            }
            page = PhysicalPage::containing(entry.physical_address());
        }
    }

    /// Unlink and free tables created by a partially completed
    /// [`ensure_leaf_chain`](Self::ensure_leaf_chain), deepest first.
    fn unwind_fresh<F: FrameSource>(
        &self,
        fresh: &[Option<(PhysicalPage, usize, PhysicalPage)>; 3],
        frames: &mut F,
    ) {
        for &(parent, slot, frame) in fresh.iter().rev().flatten() {
            // SAFETY: recorded as a live parent table during the walk.
            unsafe { self.table(parent) }.set(slot, PageEntryBits::new());
            // SAFETY: the table was created during this walk, is empty, and
            // has just been unlinked.
            unsafe { frames.free_frame(frame) };
        }
    }

    /// Release now-empty tables on the chain for `va`, deepest level first.
    ///
    /// A table is reclaimed only when all 512 of its entries are zero, so a
    /// sibling leaf or reservation anywhere in the table keeps the whole
    /// chain alive. The PML4 root itself is never released here.
    ///
    /// Callers restrict this to the private lower half; kernel-half tables
    /// are shared across every address space and must never be reclaimed
    /// from one of them.
    pub fn reclaim_empty_tables<F: FrameSource>(
        &self,
        root: PhysicalPage,
        va: VirtualAddress,
        frames: &mut F,
    ) {
        // SAFETY: root is a live PML4.
        let l4 = unsafe { self.table(root) };
        let e4 = l4.get(va.pml4_index());
        if !e4.present() {
            return;
        }
        let pdpt_page = PhysicalPage::containing(e4.physical_address());

        // SAFETY: present links resolved just above, in each case below.
        let l3 = unsafe { self.table(pdpt_page) };
        let e3 = l3.get(va.pdpt_index());
        if !e3.present() || e3.large_page() {
            return;
        }
        let pd_page = PhysicalPage::containing(e3.physical_address());

        let l2 = unsafe { self.table(pd_page) };
        let e2 = l2.get(va.pd_index());
        if !e2.present() || e2.large_page() {
            return;
        }
        let pt_page = PhysicalPage::containing(e2.physical_address());

        if !unsafe { self.table(pt_page) }.is_empty() {
            return;
        }
        l2.set(va.pd_index(), PageEntryBits::new());
        // SAFETY: the table is all-zero and no longer linked.
        unsafe { frames.free_frame(pt_page) };

        if !l2.is_empty() {
            return;
        }
        l3.set(va.pdpt_index(), PageEntryBits::new());
        // SAFETY: as above.
        unsafe { frames.free_frame(pd_page) };

        if !l3.is_empty() {
            return;
        }
        l4.set(va.pml4_index(), PageEntryBits::new());
        // SAFETY: as above.
        unsafe { frames.free_frame(pdpt_page) };
    }

    /// Install a huge leaf for the boot-time direct map or the kernel image.
    ///
    /// Intermediate tables are materialized as needed. Boot mappings are
    /// supervisor-only; `global` keeps them in the TLB across CR3 reloads.
    ///
    /// # Errors
    /// [`OutOfMemory`] if an intermediate table could not be allocated.
    pub fn map_huge<F: FrameSource>(
        &self,
        root: PhysicalPage,
        va: VirtualAddress,
        pa: PhysicalPage,
        size: HugeSize,
        protection: Protection,
        global: bool,
        frames: &mut F,
    ) -> Result<(), OutOfMemory> {
        debug_assert!(va.as_u64() % size.bytes() == 0, "unaligned huge va");
        debug_assert!(pa.base().as_u64() % size.bytes() == 0, "unaligned huge pa");

        let mut leaf = PageEntryBits::new()
            .with_present(true)
            .with_large_page(true)
            .with_writable(protection.writable())
            .with_cache_disabled(protection.cache_disabled())
            .with_no_execute(!protection.executable())
            .with_global_translation(global);
        leaf.set_physical_address(pa.base());

        let mut page = root;
        let (links, slot) = match size {
            HugeSize::OneGiB => (&[va.pml4_index()][..], va.pdpt_index()),
            HugeSize::TwoMiB => (&[va.pml4_index(), va.pdpt_index()][..], va.pd_index()),
        };
        for &link_slot in links {
            // SAFETY: the root or a present link read in an earlier round.
            let table = unsafe { self.table(page) };
            let entry = table.get(link_slot);
            page = if entry.present() {
                PhysicalPage::containing(entry.physical_address())
            } else {
                let frame = frames.alloc_frame()?;
                // SAFETY: fresh frame about to become a table.
                unsafe { self.table(frame) }.zero();
                table.set(link_slot, PageEntryBits::link(frame, false));
                frame
            };
        }
        // SAFETY: resolved or created as a table frame just above.
        unsafe { self.table(page) }.set(slot, leaf);
        Ok(())
    }
}
