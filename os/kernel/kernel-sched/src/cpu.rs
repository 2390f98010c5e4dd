//! Per-core scheduler state.

use core::fmt;

/// Logical processor index, dense from zero in registration order.
///
/// This is the scheduler's own numbering, not the APIC id; the two are tied
/// together by [`CpuLocal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// The bootstrap processor registers first.
    pub const BOOT: Self = Self(0);

    #[must_use]
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Scheduler-side state of one core.
///
/// The architecture half of per-core state (GS base, TSS, interrupt stacks)
/// stays with the kernel binary; it stores the [`CpuId`] in its per-core
/// block and presents it on every call into the scheduler.
#[derive(Debug)]
pub struct CpuLocal {
    id: CpuId,
    apic_id: u32,
    /// Arena slot of the thread now on this core, if any.
    pub(crate) current: Option<u32>,
    /// Arena slot of this core's idle thread.
    pub(crate) idle: u32,
    /// Set once the core has finished its architecture bring-up and started
    /// scheduling. Reschedule broadcasts skip offline cores.
    online: bool,
}

impl CpuLocal {
    pub(crate) const fn new(id: CpuId, apic_id: u32, idle: u32) -> Self {
        Self {
            id,
            apic_id,
            current: None,
            idle,
            online: false,
        }
    }

    #[must_use]
    pub const fn id(&self) -> CpuId {
        self.id
    }

    /// Local APIC id, the IPI destination for this core.
    #[must_use]
    pub const fn apic_id(&self) -> u32 {
        self.apic_id
    }

    #[must_use]
    pub const fn is_online(&self) -> bool {
        self.online
    }

    pub(crate) fn set_online(&mut self) {
        self.online = true;
    }
}
