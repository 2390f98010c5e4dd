//! Model-specific registers, and the GS base pair in particular.
//!
//! The GS segment is the per-CPU anchor in 64-bit mode: its base lives in
//! `IA32_GS_BASE` (0xC000_0101) and the alternate base in
//! `IA32_KERNEL_GS_BASE` (0xC000_0102). `swapgs` exchanges the two, which
//! is how an interrupt arriving from ring 3 regains the kernel's per-CPU
//! pointer without touching memory.
//!
//! See Intel SDM Vol. 3, "FS and GS Base Address Registers".

mod ia32_gs_base;
mod ia32_kernel_gs_base;

pub use ia32_gs_base::Ia32GsBaseMsr;
pub use ia32_kernel_gs_base::Ia32KernelGsBaseMsr;

/// A model-specific register, identified by the architectural index
/// `rdmsr`/`wrmsr` take in `ecx`.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msr(pub u32);

impl Msr {
    const fn new(index: u32) -> Self {
        Self(index)
    }

    /// The raw MSR index.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Writes a 64-bit value to this register.
    ///
    /// # Safety
    /// - `wrmsr` is privileged; executing it outside CPL 0 raises #GP(0),
    ///   as does writing a reserved or read-only index.
    /// - The written semantics are the caller's problem: changing the GS
    ///   base under code that is using `gs:` references races.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    #[doc(alias = "write_model_specific_register")]
    pub unsafe fn store_raw(self, val: u64) {
        let lo = (val & 0xFFFF_FFFF) as u32;
        let hi = (val >> 32) as u32;
        let msr = self.raw();
        unsafe {
            core::arch::asm!(
            "wrmsr",
            in("ecx") msr,
            in("eax") lo,
            in("edx") hi,
            options(nostack, preserves_flags)
            );
        }
    }

    /// Reads the 64-bit value of this register.
    ///
    /// # Safety
    /// `rdmsr` is privileged and faults on invalid indices; CPL 0 only.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    #[doc(alias = "read_model_specific_register")]
    pub unsafe fn load_raw(self) -> u64 {
        let lo: u32;
        let hi: u32;
        let ecx = self.raw();
        unsafe {
            core::arch::asm!(
            "rdmsr",
            in("ecx") ecx,
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags)
            );
        }
        (u64::from(hi) << 32) | u64::from(lo)
    }
}

/// Whether `addr` is canonical: bits 63..48 copies of bit 47. The CPU
/// refuses non-canonical GS bases with #GP.
#[inline(always)]
#[allow(clippy::inline_always)]
pub const fn is_canonical_gs_base(addr: u64) -> bool {
    let sign = (addr >> 47) & 1;
    (addr >> 48) == if sign == 0 { 0 } else { 0xFFFF }
}
