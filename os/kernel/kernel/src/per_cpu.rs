//! Per-core state, anchored through the GS base.
//!
//! Every core owns one [`PerCpu`] block out of a static pool. During
//! bring-up the core writes the block's address into both GS base MSRs
//! (see [`crate::msr::init_gs_bases`]); from then on [`PerCpu::current`]
//! is a single MSR read away, valid in any context including ISRs.

use crate::gdt::Gdt;
use crate::msr::gs_base_ptr;
use crate::tss::Tss64;
use kernel_info::memory::MAX_CPUS;
use kernel_sched::{CpuId, FpuArea, ThreadContext};

/// One core's private block.
///
/// Cache-line aligned so neighbouring cores never share a line. Fields
/// are only ever written by the owning core, with interrupts masked
/// where an ISR could observe a half-written value.
#[repr(C, align(64))]
pub struct PerCpu {
    /// Scheduler identity of this core.
    pub cpu: CpuId,

    /// Local APIC id, the hardware-side name of the core.
    pub apic_id: u32,

    /// LAPIC timer reload value that yields the scheduler frequency on
    /// this core; used to re-arm after masking.
    pub timer_initial: u32,

    /// This core's TSS. `rsp0` is rewritten on every context switch.
    pub tss: Tss64,

    /// This core's GDT, referencing [`Self::tss`].
    pub gdt: Gdt,

    /// `fxsave` target while an ISR decides whether the interrupted
    /// context will be kept.
    pub fpu_scratch: FpuArea,

    /// Context of the incoming thread, copied out of the scheduler while
    /// its lock is still held. The restore path reads from here after
    /// the lock has been dropped, so it must not live on any stack.
    pub staging: ThreadContext,
}

impl PerCpu {
    const fn new() -> Self {
        Self {
            cpu: CpuId::BOOT,
            apic_id: 0,
            timer_initial: 0,
            tss: Tss64::new(),
            gdt: Gdt::new(),
            fpu_scratch: FpuArea::zeroed(),
            staging: ThreadContext {
                frame: kernel_sched::SavedFrame::zeroed(),
                fpu: FpuArea::zeroed(),
            },
        }
    }

    /// The block of the executing core.
    ///
    /// Valid once [`crate::msr::init_gs_bases`] ran on this core.
    #[inline]
    #[must_use]
    pub fn current() -> &'static Self {
        let ptr = gs_base_ptr();
        debug_assert!(!ptr.is_null(), "per-CPU block not installed");
        unsafe { &*ptr }
    }

    /// Mutable access to the executing core's block.
    ///
    /// # Safety
    /// The caller must be the only code touching the block: either
    /// interrupts are masked or the touched fields are never read by an
    /// ISR.
    #[inline]
    #[must_use]
    pub unsafe fn current_mut() -> &'static mut Self {
        let ptr = gs_base_ptr();
        debug_assert!(!ptr.is_null(), "per-CPU block not installed");
        unsafe { &mut *ptr }
    }
}

static mut PER_CPU_BLOCKS: [PerCpu; MAX_CPUS] = [const { PerCpu::new() }; MAX_CPUS];

/// The statically reserved block for core `index`.
///
/// # Safety
/// Each index must be claimed by exactly one core; the returned
/// reference is only valid on that core after it installed its GS base.
#[must_use]
pub unsafe fn block(index: usize) -> &'static mut PerCpu {
    debug_assert!(index < MAX_CPUS);
    unsafe { &mut (*(&raw mut PER_CPU_BLOCKS))[index] }
}
