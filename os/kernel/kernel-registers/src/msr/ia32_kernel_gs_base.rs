//! Provides the [`Ia32KernelGsBaseMsr`] type.

use crate::msr::{Msr, is_canonical_gs_base};
use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use core::ptr::NonNull;

/// The *alternate* GS base that `swapgs` exchanges with the active one.
/// Index 0xC000_0102.
///
/// Kernel convention: while running in ring 0 the active base points at
/// per-CPU state and this register parks the user value; interrupt entry
/// from ring 3 runs `swapgs` to flip the pair.
#[bitfield(u64, order = Lsb)]
pub struct Ia32KernelGsBaseMsr {
    #[bits(64)]
    pub ptr: u64,
}

impl Ia32KernelGsBaseMsr {
    pub const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;
    pub const MSR: Msr = Msr::new(Self::IA32_KERNEL_GS_BASE);

    /// Points the post-`swapgs` GS base at `base`.
    #[inline(always)]
    #[allow(clippy::inline_always)]
    #[must_use]
    pub fn with_kernel_gs_base<T>(self, base: NonNull<T>) -> Self {
        let addr = base.as_ptr() as u64;
        debug_assert!(
            is_canonical_gs_base(addr),
            "non-canonical KERNEL_GS base: {addr:#x}"
        );
        self.with_ptr(addr)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Ia32KernelGsBaseMsr {
    #[inline(always)]
    #[allow(clippy::inline_always)]
    unsafe fn load_unsafe() -> Self {
        let msr = unsafe { Self::MSR.load_raw() };
        Self::from_bits(msr)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Ia32KernelGsBaseMsr {
    #[inline(always)]
    #[allow(clippy::inline_always)]
    unsafe fn store_unsafe(self) {
        unsafe { Self::MSR.store_raw(self.into_bits()) }
    }
}
