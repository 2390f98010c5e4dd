//! GS base plumbing for the per-CPU block.
//!
//! Both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` are pointed at the same
//! per-CPU block: with no syscall layer there is no userland GS to
//! preserve, and identical bases make any `swapgs` a no-op instead of a
//! correctness hazard in early interrupt paths.

use crate::per_cpu::PerCpu;
use core::ptr::NonNull;
use kernel_registers::msr::{Ia32GsBaseMsr, Ia32KernelGsBaseMsr};
use kernel_registers::{LoadRegisterUnsafe, StoreRegisterUnsafe};

/// Installs `percpu` as this core's GS anchor.
///
/// # Safety
/// CPL 0. `percpu` must outlive the core; nothing may be using `gs:`
/// references concurrently.
pub unsafe fn init_gs_bases(percpu: &PerCpu) {
    let base = NonNull::from(percpu);
    unsafe {
        Ia32GsBaseMsr::new().with_gs_base(base).store_unsafe();
        Ia32KernelGsBaseMsr::new()
            .with_kernel_gs_base(base)
            .store_unsafe();
    }
}

/// The per-CPU pointer of the executing core, or null before
/// [`init_gs_bases`] ran here.
#[inline]
#[must_use]
pub fn gs_base_ptr() -> *mut PerCpu {
    // SAFETY: reading IA32_GS_BASE is side-effect free at CPL 0.
    let base = unsafe { Ia32GsBaseMsr::load_unsafe() };
    base.ptr() as *mut PerCpu
}
