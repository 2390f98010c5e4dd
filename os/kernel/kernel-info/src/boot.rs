//! # Kernel Boot Information

/// Kernel entry function pointer.
///
/// # ABI
/// The ABI is pinned to `sysv64` so the loader and the kernel agree on the
/// calling convention regardless of how either side was compiled.
pub type KernelEntryFn = extern "sysv64" fn(*const KernelBootInfo) -> !;

/// Information the kernel needs right after the loader hands over control.
/// Keep this `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.
#[repr(C)]
#[derive(Clone)]
pub struct KernelBootInfo {
    /// Physical memory map, already parsed by the loader.
    pub mmap: MemoryMapInfo,

    /// RSDP (ACPI 2.0+) physical address, or 0 if not provided.
    pub rsdp_addr: u64,

    /// Number of logical processors the loader discovered, or 0 when the
    /// kernel should enumerate them from ACPI itself.
    pub cpu_count: u32,

    /// Reserved, must be zero.
    pub _reserved: u32,
}

/// The loader-normalized physical memory map.
///
/// The loader converts whatever firmware format it booted from into a flat
/// array of [`MemoryRegion`] entries so the kernel never parses firmware
/// tables for memory discovery.
#[repr(C)]
#[derive(Clone)]
pub struct MemoryMapInfo {
    /// Physical address of the first [`MemoryRegion`] entry.
    /// The array must live in a region the kernel can reach via its boot
    /// mappings.
    pub regions_ptr: u64,

    /// Number of [`MemoryRegion`] entries.
    pub regions_len: u64,
}

/// One contiguous physical memory region.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryRegion {
    /// Physical start address. Page aligned.
    pub base: u64,

    /// Region length in bytes. A multiple of the page size.
    pub length: u64,

    /// What the region holds.
    pub kind: MemoryRegionKind,

    /// Reserved, must be zero.
    pub _reserved: u32,
}

/// Classification of a [`MemoryRegion`].
/// Plain `#[repr(u32)]` so the value survives the ABI boundary.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the kernel may hand to its allocators.
    Usable = 0,
    /// Firmware or device memory the kernel must never touch.
    Reserved = 1,
    /// ACPI tables. Reclaimable once the kernel has consumed them.
    AcpiReclaimable = 2,
    /// The loaded kernel image. Never reclaimed.
    KernelImage = 3,
    /// The boot info structures themselves, including the region array.
    /// Reclaimable once the kernel has copied what it needs.
    BootInfo = 4,
}

impl MemoryRegion {
    /// Exclusive end address of the region.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Whether the kernel may feed this region to the physical allocator.
    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryRegionKind::Usable)
    }
}
