//! Memory bring-up and the kernel's global memory state.
//!
//! Boot order matters here. The loader parks us on its own page tables,
//! which carry the kernel image and a direct map of at least the first
//! GiB at [`HHDM_BASE`]. Using a small static frame pool inside the
//! kernel image, [`init`] builds the real kernel address space (full
//! direct map, kernel image remap, trampoline identity map), switches
//! CR3, and only then seeds the physical allocator from the boot memory
//! map and commits a heap region. From that point every allocation goes
//! through the globals below.
//!
//! Lock order: address-space lock before the frame allocator, never the
//! reverse.

use crate::storage::KernelStore;
use alloc::collections::btree_map::BTreeMap;
use kernel_info::boot::{KernelBootInfo, MemoryRegion, MemoryRegionKind};
use kernel_info::memory::{HHDM_BASE, KERNEL_BASE, KERNEL_STACK_SIZE, PHYS_LOAD};
use kernel_memory_addresses::{
    PAGE_SIZE, PageCount, PhysicalAddress, PhysicalPage, VirtualAddress,
};
use kernel_pmm::{DirectMapper, FrameSource, OutOfMemory, PhysicalAllocator};
use kernel_registers::cr4::Cr4;
use kernel_registers::efer::Efer;
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use kernel_sched::ProcessId;
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::{
    AccessOrigin, AddressSpace, CommitPolicy, FaultVerdict, HugeSize, PageEntryBits, PageFault,
    PageTable, PageTableWalker, PhysMapper, Protection, VmError, resolve_fault,
};
use log::info;

/// Physical base of the AP trampoline; also the SIPI vector page.
pub const TRAMPOLINE_PHYS: u64 = 0x8000;

/// Bytes donated to the kernel heap during bring-up.
const HEAP_SIZE: u64 = 4 * 1024 * 1024;

static FRAMES: SpinLock<PhysicalAllocator<DirectMapper>> =
    SpinLock::new(PhysicalAllocator::new(DirectMapper::new(HHDM_BASE)));

static KERNEL_SPACE: SyncOnceCell<SpinLock<AddressSpace<DirectMapper>>> = SyncOnceCell::new();

/// Address spaces of live processes, keyed by packed [`ProcessId`]. The
/// scheduler holds the root only; the space itself lives here.
static PROCESS_SPACES: SpinLock<BTreeMap<u64, AddressSpace<DirectMapper>>> =
    SpinLock::new(BTreeMap::new());

/// Boot-time frame source: a bump pointer over a static pool inside the
/// kernel image. Only the address-space build draws from it; the frames
/// become page tables and are never returned.
struct BootFrames {
    next: u64,
    end: u64,
}

const BOOT_POOL_BYTES: usize = 384 * PAGE_SIZE as usize;

#[repr(align(4096))]
struct BootPool([u8; BOOT_POOL_BYTES]);

#[unsafe(link_section = ".bss.boot")]
static mut BOOT_POOL: BootPool = BootPool([0; BOOT_POOL_BYTES]);

impl BootFrames {
    fn new() -> Self {
        // The linker places the image at KERNEL_BASE, loaded at PHYS_LOAD.
        let va = &raw mut BOOT_POOL as u64;
        let pa = PHYS_LOAD + (va - KERNEL_BASE);
        Self {
            next: pa,
            end: pa + BOOT_POOL_BYTES as u64,
        }
    }
}

impl FrameSource for BootFrames {
    fn alloc_frame(&mut self) -> Result<PhysicalPage, OutOfMemory> {
        if self.next + PAGE_SIZE > self.end {
            return Err(OutOfMemory);
        }
        let page = PhysicalPage::containing(PhysicalAddress::new(self.next));
        self.next += PAGE_SIZE;
        Ok(page)
    }

    unsafe fn free_frame(&mut self, _page: PhysicalPage) {
        // Rollback during boot would mean the pool was sized wrong;
        // leaking a frame of it is the least of the problems then.
    }
}

/// The boot memory map, read through the direct map.
///
/// # Safety
/// `boot_info` must be the loader-provided structure and its region
/// array must be covered by the active direct map.
pub unsafe fn regions(boot_info: &KernelBootInfo) -> &'static [MemoryRegion] {
    let ptr = (HHDM_BASE + boot_info.mmap.regions_ptr) as *const MemoryRegion;
    unsafe { core::slice::from_raw_parts(ptr, boot_info.mmap.regions_len as usize) }
}

/// Builds the kernel address space, switches onto it, then brings up the
/// physical allocator and the heap.
///
/// # Safety
/// Single-threaded boot path, interrupts masked, loader page tables
/// still active. Must run exactly once.
pub unsafe fn init(boot_info: &KernelBootInfo) {
    unsafe {
        enable_paging_features();

        let mut boot_frames = BootFrames::new();
        let mapper = DirectMapper::new(HHDM_BASE);
        let space = AddressSpace::new_kernel_root(mapper, &mut boot_frames)
            .expect("boot frame pool exhausted building the kernel root");
        let root = space.root();
        let walker = PageTableWalker::new(mapper);

        let map = regions(boot_info);
        map_direct_map(&walker, root, map, &mut boot_frames);
        map_kernel_image(&walker, root, map, &mut boot_frames);

        // Identity-map the low 2 MiB: the AP trampoline at
        // TRAMPOLINE_PHYS runs there while it switches onto this root.
        walker
            .map_huge(
                root,
                VirtualAddress::NULL,
                PhysicalPage::containing(PhysicalAddress::NULL),
                HugeSize::TwoMiB,
                Protection::KERNEL_CODE.with_writable(true),
                false,
                &mut boot_frames,
            )
            .expect("boot frame pool exhausted mapping the trampoline");

        switch_to_root(root);
        info!("kernel address space live, root {}", root.base());

        let _ = KERNEL_SPACE.get_or_init(move || SpinLock::new(space));

        seed_physical_allocator(map);
        seed_heap();
    }
}

/// NXE before the first NX page-table entry, OSFXSR before the first
/// `fxsave`, PGE so the kernel half survives CR3 reloads.
unsafe fn enable_paging_features() {
    unsafe {
        Efer::load_unsafe().with_nxe(true).store_unsafe();
        Cr4::load_unsafe()
            .with_osfxsr(true)
            .with_osxmmexcpt(true)
            .with_pge(true)
            .store_unsafe();
    }
}

/// Covers all of physical memory with global 1 GiB pages at [`HHDM_BASE`].
unsafe fn map_direct_map(
    walker: &PageTableWalker<DirectMapper>,
    root: PhysicalPage,
    map: &[MemoryRegion],
    frames: &mut BootFrames,
) {
    const GIB: u64 = 1 << 30;
    let top = map.iter().map(MemoryRegion::end).max().unwrap_or(GIB);
    let mut offset = 0;
    while offset < top {
        walker
            .map_huge(
                root,
                VirtualAddress::new(HHDM_BASE + offset),
                PhysicalPage::containing(PhysicalAddress::new(offset)),
                HugeSize::OneGiB,
                Protection::KERNEL_DATA,
                true,
                frames,
            )
            .expect("boot frame pool exhausted mapping the direct map");
        offset += GIB;
    }
    info!("direct map: {} GiB at {HHDM_BASE:#x}", offset >> 30);
}

/// Remaps the kernel image at [`KERNEL_BASE`] with 4 KiB global pages.
unsafe fn map_kernel_image(
    walker: &PageTableWalker<DirectMapper>,
    root: PhysicalPage,
    map: &[MemoryRegion],
    frames: &mut BootFrames,
) {
    for region in map
        .iter()
        .filter(|r| r.kind == MemoryRegionKind::KernelImage)
    {
        let pages = PageCount::spanning(region.length);
        let first = PhysicalPage::containing(PhysicalAddress::new(region.base));
        for (index, page) in first.range(pages).enumerate() {
            let va = VirtualAddress::new(
                KERNEL_BASE + (region.base - PHYS_LOAD) + index as u64 * PAGE_SIZE,
            );
            let pt = walker
                .ensure_leaf_chain(root, va, frames, false)
                .expect("boot frame pool exhausted mapping the kernel image");
            let mut leaf = PageEntryBits::new()
                .with_present(true)
                .with_writable(true)
                .with_global_translation(true);
            leaf.set_physical_address(page.base());
            // SAFETY: `pt` is the PT frame for `va`, reachable through
            // the direct map.
            let table: &mut PageTable = unsafe { walker.mapper().phys_to_mut(pt.base()) };
            table.set(va.pt_index(), leaf);
        }
    }
}

/// Loads `root` into CR3.
///
/// # Safety
/// The root must map the executing code, the current stack, and the
/// direct map.
pub unsafe fn switch_to_root(root: PhysicalPage) {
    unsafe {
        kernel_registers::cr3::Cr3::from_pml4_phys(root.base(), false, false).store_unsafe();
    }
}

unsafe fn seed_physical_allocator(map: &[MemoryRegion]) {
    let mut frames = FRAMES.lock();
    let mut total = 0u64;
    for region in map.iter().filter(|r| r.is_usable()) {
        let first = PhysicalPage::containing(PhysicalAddress::new(region.base));
        let count = PageCount::spanning(region.length);
        // SAFETY: usable regions are RAM, unreferenced, and now reachable
        // through the fresh direct map.
        unsafe { frames.add_region(first, count) };
        total += count.as_u64();
    }
    info!(
        "physical allocator: {total} frames ({} MiB) across {} regions",
        total * PAGE_SIZE >> 20,
        map.iter().filter(|r| r.is_usable()).count()
    );
}

unsafe fn seed_heap() {
    let start = with_kernel_space(|space, frames| {
        space.allocate(
            None,
            HEAP_SIZE,
            Protection::KERNEL_DATA,
            AccessOrigin::Kernel,
            CommitPolicy::Eager,
            frames,
        )
    })
    .expect("no memory for the kernel heap");
    // SAFETY: the region was just committed, is writable, and is handed
    // to the heap exclusively.
    unsafe { crate::HEAP.grow(start, HEAP_SIZE as usize) };
    info!("kernel heap: {} KiB at {start}", HEAP_SIZE >> 10);
}

/// Runs `f` against the kernel address space and the frame allocator.
///
/// # Panics
/// Before [`init`] completed.
pub fn with_kernel_space<R>(
    f: impl FnOnce(&mut AddressSpace<DirectMapper>, &mut PhysicalAllocator<DirectMapper>) -> R,
) -> R {
    let space = KERNEL_SPACE.get().expect("memory layer not initialized");
    let mut space = space.lock();
    let mut frames = FRAMES.lock();
    f(&mut space, &mut frames)
}

/// Runs `f` against a process address space, or returns `None` for a
/// process that no longer has one.
pub fn with_process_space<R>(
    process: ProcessId,
    f: impl FnOnce(&mut AddressSpace<DirectMapper>, &mut PhysicalAllocator<DirectMapper>) -> R,
) -> Option<R> {
    let mut spaces = PROCESS_SPACES.lock();
    let space = spaces.get_mut(&process.pack())?;
    let mut frames = FRAMES.lock();
    Some(f(space, &mut frames))
}

/// Copies `len` bytes from a kernel virtual address into a process's
/// space, committing lazy destination pages along the way. Returns
/// `None` for an unknown process.
///
/// Lock order: kernel space, then the process table, then frames.
pub fn copy_to_process(
    process: ProcessId,
    dest: VirtualAddress,
    src: VirtualAddress,
    len: u64,
) -> Option<Result<(), VmError>> {
    let kernel = KERNEL_SPACE.get().expect("memory layer not initialized");
    let kernel = kernel.lock();
    let mut spaces = PROCESS_SPACES.lock();
    let space = spaces.get_mut(&process.pack())?;
    let mut frames = FRAMES.lock();
    Some(AddressSpace::copy(
        space,
        dest,
        &kernel,
        src,
        len,
        &mut *frames,
    ))
}

/// Clones the kernel upper half into a fresh process space.
///
/// # Errors
/// [`OutOfMemory`] when no frame is available for the root.
pub fn create_process_space() -> Result<AddressSpace<DirectMapper>, OutOfMemory> {
    let space = KERNEL_SPACE.get().expect("memory layer not initialized");
    let space = space.lock();
    let mut frames = FRAMES.lock();
    space.new_process_space(&mut *frames)
}

/// Records `space` as belonging to `process` so faults and teardown can
/// find it.
pub fn adopt_process_space(process: ProcessId, space: AddressSpace<DirectMapper>) {
    PROCESS_SPACES.lock().insert(process.pack(), space);
}

/// Frees everything a dead process's space still holds: every committed
/// lower-half frame, the paging structures below the root, and finally
/// the root itself.
pub fn destroy_process_space(process: ProcessId, root: PhysicalPage) {
    let space = PROCESS_SPACES.lock().remove(&process.pack());
    let mut frames = FRAMES.lock();
    if let Some(mut space) = space {
        debug_assert!(space.root() == root);
        space.release_user_half(&mut *frames);
    }
    // SAFETY: no thread of the process can run again; nothing references
    // the root.
    unsafe { frames.free_frame(root) };
}

/// Root of the kernel address space.
///
/// # Panics
/// Before [`init`] completed.
#[must_use]
pub fn kernel_root() -> PhysicalPage {
    with_kernel_space(|space, _| space.root())
}

/// Number of free frames, for diagnostics.
#[must_use]
pub fn free_frames() -> u64 {
    FRAMES.lock().free_pages().as_u64()
}

/// Allocates an eagerly committed kernel stack and returns its top.
///
/// # Errors
/// Forwards allocation failure.
pub fn alloc_kernel_stack() -> Result<VirtualAddress, VmError> {
    let base = with_kernel_space(|space, frames| {
        space.allocate(
            None,
            KERNEL_STACK_SIZE as u64,
            Protection::KERNEL_DATA,
            AccessOrigin::Kernel,
            CommitPolicy::Eager,
            frames,
        )
    })?;
    Ok(VirtualAddress::new(base.as_u64() + KERNEL_STACK_SIZE as u64))
}

/// Resolves a page fault against the space that owns the address: the
/// process's for lower-half faults while a process is current, the
/// kernel's otherwise.
pub fn handle_fault(fault: PageFault, current: Option<ProcessId>) -> FaultVerdict {
    let mut store = KernelStore;
    if fault.address.is_user_half() {
        if let Some(process) = current {
            if let Some(verdict) = with_process_space(process, |space, frames| {
                resolve_fault(space, fault, frames, &mut store)
            }) {
                return verdict;
            }
        }
        return FaultVerdict::Fatal(kernel_vmem::FatalKind::NotMapped);
    }
    with_kernel_space(|space, frames| resolve_fault(space, fault, frames, &mut store))
}

/// Flushes one page translation on the executing core.
#[inline]
pub fn invlpg(address: VirtualAddress) {
    unsafe {
        core::arch::asm!(
            "invlpg [{}]",
            in(reg) address.as_u64(),
            options(nostack, preserves_flags)
        );
    }
}
