//! The few CPUID leaves the kernel actually asks about.
//!
//! Leaf 01h answers whether x2APIC mode exists; leaves 15h and 16h feed
//! the TSC frequency estimate. Everything is read through one raw
//! [`cpuid`] wrapper that preserves `rbx` for the LLVM register
//! allocator.

use bitfield_struct::bitfield;

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct CpuidResult {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

/// Executes `cpuid` for `leaf`/`subleaf`.
///
/// # Safety
/// CPL 0 with the instruction available; querying a leaf above the
/// reported maximum returns the highest basic leaf's data, so gate on
/// [`max_basic_leaf`] first.
#[inline]
pub unsafe fn cpuid(leaf: u32, subleaf: u32) -> CpuidResult {
    let mut eax = leaf;
    let mut ecx = subleaf;
    let ebx: u32;
    let edx: u32;
    unsafe {
        core::arch::asm!(
            "push rbx",
            "cpuid",
            "mov {ebx_out:e}, ebx",
            "pop rbx",
            ebx_out = lateout(reg) ebx,
            inlateout("eax") eax,
            inlateout("ecx") ecx,
            lateout("edx") edx,
            options(nomem, preserves_flags),
        );
    }
    CpuidResult { eax, ebx, ecx, edx }
}

/// Highest supported basic leaf, from `cpuid(0)`.
///
/// # Safety
/// CPL 0 with `cpuid` available.
#[inline]
pub unsafe fn max_basic_leaf() -> u32 {
    unsafe { cpuid(0, 0) }.eax
}

/// Feature bits of leaf 01h ECX; only the one flag this kernel checks.
#[bitfield(u32)]
pub struct Leaf01Ecx {
    #[bits(21)]
    __: u32,
    /// x2APIC mode (MSR-based local APIC access) is implemented.
    pub x2apic: bool,
    #[bits(10)]
    __: u32,
}

/// Whether the CPU supports x2APIC mode.
///
/// # Safety
/// CPL 0 with `cpuid` available.
#[must_use]
pub unsafe fn has_x2apic() -> bool {
    unsafe { Leaf01Ecx::from_bits(cpuid(0x01, 0).ecx) }.x2apic()
}

/// TSC frequency from leaf 15h: `crystal_hz * numerator / denominator`.
/// `None` when any of the three is unreported; guessing crystal
/// frequencies is less robust than falling through to the next method.
///
/// # Safety
/// CPL 0 with `cpuid` available.
#[must_use]
pub unsafe fn tsc_hz_from_leaf_15h() -> Option<u64> {
    if unsafe { max_basic_leaf() } < 0x15 {
        return None;
    }
    let r = unsafe { cpuid(0x15, 0) };
    let (denominator, numerator, crystal_hz) = (r.eax, r.ebx, r.ecx);
    if denominator == 0 || numerator == 0 || crystal_hz == 0 {
        return None;
    }
    Some(u64::from(crystal_hz) * u64::from(numerator) / u64::from(denominator))
}

/// Base frequency from leaf 16h, treating base MHz as TSC MHz. True on
/// invariant-TSC parts and good enough under KVM/QEMU.
///
/// # Safety
/// CPL 0 with `cpuid` available.
#[must_use]
pub unsafe fn tsc_hz_from_leaf_16h() -> Option<u64> {
    if unsafe { max_basic_leaf() } < 0x16 {
        return None;
    }
    let base_mhz = unsafe { cpuid(0x16, 0) }.eax & 0xFFFF;
    if base_mhz == 0 {
        return None;
    }
    Some(u64::from(base_mhz) * 1_000_000)
}
