//! # Memory Layout

/// First virtual address of the kernel half. Everything below is userspace,
/// everything at or above is shared kernel territory.
pub const USERSPACE_END: u64 = 0xffff_8000_0000_0000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the loader places the kernel bytes in *physical* memory (LMA)
/// before paging.
///
/// # Kernel Build
/// This information is sourced in the kernel's `build.rs` to configure
/// the linker.
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// Lowest virtual address handed out when a userspace allocation does not
/// request a base. Keeps the null page and the first few megabytes unmapped
/// so wild small-integer dereferences fault.
pub const USER_ALLOC_FLOOR: u64 = 0x40_0000; // 4 MiB

/// One past the highest userspace address the allocator will hand out.
/// This is the end of the canonical low half; the gap up to
/// [`USERSPACE_END`] is non-canonical and unusable.
pub const USER_ALLOC_CEILING: u64 = 0x0000_8000_0000_0000;

/// Lowest virtual address handed out for kernel-side allocations without a
/// requested base. Sits above the kernel image so the scan never collides
/// with text or data.
pub const KERNEL_ALLOC_FLOOR: u64 = 0xffff_ffff_9000_0000;

/// One past the highest kernel-side allocation address. The sixteen pages
/// below the top of the address space stay unmapped, which also keeps scan
/// arithmetic clear of `u64` wraparound.
pub const KERNEL_ALLOC_CEILING: u64 = 0xffff_ffff_ffff_0000;

/// The size of each kernel stack, including the stacks of kernel threads.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Scheduler timer tick rate in Hz. One tick is one millisecond.
pub const SCHEDULER_HZ: u64 = 1000;

/// Upper bound on the number of logical processors the kernel will start.
/// Sized so a CPU affinity set fits in a single `u128`.
pub const MAX_CPUS: usize = 128;

const _: () = {
    assert!(USERSPACE_END == kernel_memory_addresses::KERNEL_HALF_BASE);
    assert!(KERNEL_STACK_SIZE.is_multiple_of(4096));
    assert!(HHDM_BASE >= USERSPACE_END);
    assert!(KERNEL_BASE > HHDM_BASE);
    assert!(KERNEL_ALLOC_FLOOR > KERNEL_BASE);
    assert!(USER_ALLOC_FLOOR < USER_ALLOC_CEILING);
    assert!(USER_ALLOC_CEILING <= USERSPACE_END);
    assert!(KERNEL_ALLOC_FLOOR < KERNEL_ALLOC_CEILING);
    assert!(USER_ALLOC_FLOOR.is_multiple_of(4096));
    assert!(USER_ALLOC_CEILING.is_multiple_of(4096));
    assert!(KERNEL_ALLOC_FLOOR.is_multiple_of(4096));
    assert!(KERNEL_ALLOC_CEILING.is_multiple_of(4096));
    assert!(MAX_CPUS <= 128);
};
