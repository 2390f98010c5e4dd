//! Thread identity, run state, and the saved execution context.

use core::fmt;

use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

use crate::arena::Handle;
use crate::cpu::CpuId;
use crate::process::ProcessId;

/// Stable thread identity: arena slot plus generation.
///
/// Ids stay valid across the thread's whole life including the dead-but-not-
/// reaped window; after reaping they miss with
/// [`NoSuchObject`](crate::ScheduleError::NoSuchObject).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub(crate) Handle);

impl ThreadId {
    /// Packs the id into one word, e.g. for an atomic owner field.
    #[must_use]
    pub const fn pack(self) -> u64 {
        self.0.pack()
    }

    /// Inverse of [`Self::pack`].
    #[must_use]
    pub const fn unpack(word: u64) -> Self {
        Self(Handle::unpack(word))
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority class.
///
/// The numeric value doubles as the quota: how many scheduling slots a
/// thread of the class may consume within one fairness epoch. A saturated
/// class yields to the next lower one until a global reset opens the next
/// epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Priority {
    /// Per-core fallback; runs when nothing else is eligible.
    Idle = 1,
    Low = 2,
    Normal = 4,
    High = 8,
}

impl Priority {
    /// Scheduling slots granted per fairness epoch.
    #[must_use]
    pub const fn quota(self) -> u32 {
        self as u32
    }

    /// Highest-first order in which the run lists are scanned.
    pub(crate) const SCAN: [Self; 4] = [Self::High, Self::Normal, Self::Low, Self::Idle];

    /// Index of this class's run list.
    pub(crate) const fn list_index(self) -> usize {
        match self {
            Self::Idle => 0,
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
        }
    }
}

/// Thread run-state word.
///
/// `runnable` holds for the whole life of a schedulable thread; the other
/// bits qualify it. A thread is eligible for selection when `runnable` is
/// set and `dead`, `paused`, and `blocked` are all clear.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct ThreadStatus {
    /// Terminated; the slot lingers for status queries until reaped.
    pub dead: bool,

    /// Participates in scheduling.
    pub runnable: bool,

    /// Waiting on a block condition, which is polled every scheduling pass.
    pub blocked: bool,

    /// Excluded from selection until explicitly resumed.
    pub paused: bool,

    /// Executing a signal handler. Maintained by the signal delivery layer;
    /// the scheduler itself ignores it.
    pub in_signal: bool,

    /// On a core right now. Set for at most one core at a time, which keeps
    /// a thread from being picked by two cores in parallel.
    pub running: bool,

    #[bits(26)]
    __: u32,
}

/// Set of cores a thread may be scheduled on, one bit per [`CpuId`] index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityMask(u128);

impl AffinityMask {
    /// Every core.
    pub const ALL: Self = Self(u128::MAX);

    /// Only the given core.
    #[must_use]
    pub const fn only(cpu: CpuId) -> Self {
        Self(1u128 << cpu.index())
    }

    /// Whether the mask admits the given core.
    #[must_use]
    pub const fn allows(self, cpu: CpuId) -> bool {
        self.0 & (1u128 << cpu.index()) != 0
    }
}

const _: () = assert!(kernel_info::memory::MAX_CPUS <= 128);

/// General-purpose registers plus the interrupt return words, in stack
/// layout order.
///
/// The interrupt stubs push `rax` first and `r15` last, so `r15` sits at
/// the lowest address, followed by `rip`/`cs`/`rflags`/`rsp`/`ss` as the
/// CPU pushed them on entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SavedFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl SavedFrame {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }
}

/// 512-byte `fxsave` image. The 16-byte alignment is an architectural
/// requirement of `fxsave`/`fxrstor`.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct FpuArea([u8; 512]);

impl FpuArea {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; 512])
    }

    #[must_use]
    pub const fn as_ptr(&self) -> *const u8 {
        self.0.as_ptr()
    }

    #[must_use]
    pub const fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr()
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for FpuArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FpuArea { .. }")
    }
}

/// `RFLAGS` image for a fresh thread: the always-one bit plus `IF`.
const RFLAGS_INTERRUPTS_ENABLED: u64 = 0x202;

/// Everything restored when a thread takes a core.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadContext {
    /// Saved register file; restored last, ending in an interrupt return.
    pub frame: SavedFrame,
    /// Floating-point and SSE state.
    pub fpu: FpuArea,
}

impl ThreadContext {
    /// Context for a thread that has never run: the entry point in `rip`,
    /// its argument in `rdi` per the SysV convention, interrupts enabled.
    ///
    /// `rsp` lands one word below `stack_top`, in the slot a `call` would
    /// have used for the return address; the entry function must never
    /// return. `cs` and `ss` start as zero and are filled in by the glue
    /// that knows the GDT layout.
    #[must_use]
    pub fn starting_at(
        entry: VirtualAddress,
        stack_top: VirtualAddress,
        argument: u64,
    ) -> Self {
        let mut context = Self::default();
        context.frame.rip = entry.as_u64();
        context.frame.rsp = stack_top.as_u64() - 8;
        context.frame.rdi = argument;
        context.frame.rflags = RFLAGS_INTERRUPTS_ENABLED;
        context
    }
}

/// Wake predicate polled by the scheduler. Arguments are the stored
/// userdata word and the current tick count.
pub type UnblockFn = fn(u64, u64) -> bool;

/// What a blocked thread is waiting for.
///
/// The scheduler re-evaluates the condition on every scheduling pass
/// (polled, not event-driven) and clears the thread's blocked state once it
/// reports ready or the wake tick passes.
#[derive(Debug, Clone, Copy)]
pub struct BlockCondition {
    predicate: UnblockFn,
    userdata: u64,
    wake_tick: Option<u64>,
}

impl BlockCondition {
    #[must_use]
    pub const fn new(predicate: UnblockFn, userdata: u64, wake_tick: Option<u64>) -> Self {
        Self {
            predicate,
            userdata,
            wake_tick,
        }
    }

    pub(crate) fn satisfied(&self, now: u64) -> bool {
        self.wake_tick.is_some_and(|tick| now >= tick) || (self.predicate)(self.userdata, now)
    }
}

/// Parameters for [`Scheduler::create_thread`](crate::Scheduler::create_thread).
#[derive(Debug, Clone, Copy)]
pub struct NewThread {
    /// Initial register state; see [`ThreadContext::starting_at`].
    pub context: ThreadContext,
    pub priority: Priority,
    /// Cores the thread may run on. Must admit at least one registered core.
    pub affinity: AffinityMask,
    /// Owning process, or `None` for a kernel thread running on the shared
    /// kernel address space.
    pub process: Option<ProcessId>,
    /// Loaded into `TSS.RSP0` while the thread is current.
    pub kernel_stack_top: VirtualAddress,
    /// Start in the paused state and wait for an explicit resume.
    pub start_paused: bool,
}

/// One schedulable thread.
///
/// All fields are mutated under the caller's scheduler lock; `context` is
/// additionally only written by the core the thread last ran on, with
/// interrupts disabled.
///
/// Every live thread is linked into exactly one priority run list through
/// `queue_prev`/`queue_next`; death unlinks it permanently.
#[derive(Debug)]
pub(crate) struct Thread {
    pub(crate) status: ThreadStatus,
    pub(crate) priority: Priority,
    /// Slots consumed in the current fairness epoch.
    pub(crate) iterations: u32,
    pub(crate) affinity: AffinityMask,
    pub(crate) process: Option<ProcessId>,
    pub(crate) exit_code: u32,
    pub(crate) kernel_stack_top: VirtualAddress,
    pub(crate) context: ThreadContext,
    pub(crate) block: Option<BlockCondition>,
    pub(crate) queue_prev: Option<u32>,
    pub(crate) queue_next: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_word_starts_clear() {
        let status = ThreadStatus::new().with_runnable(true);
        assert!(status.runnable());
        assert!(!status.dead());
        assert!(!status.blocked());
        assert!(!status.paused());
        assert!(!status.running());
    }

    #[test]
    fn quotas_follow_the_class_order() {
        assert_eq!(Priority::Idle.quota(), 1);
        assert_eq!(Priority::Low.quota(), 2);
        assert_eq!(Priority::Normal.quota(), 4);
        assert_eq!(Priority::High.quota(), 8);
        assert!(Priority::High > Priority::Normal);
    }

    #[test]
    fn affinity_only_admits_one_core() {
        let mask = AffinityMask::only(CpuId::new(3));
        assert!(mask.allows(CpuId::new(3)));
        assert!(!mask.allows(CpuId::new(0)));
        assert!(AffinityMask::ALL.allows(CpuId::new(127)));
    }

    #[test]
    fn fresh_context_enters_with_interrupts_enabled() {
        let context = ThreadContext::starting_at(
            VirtualAddress::new(0xffff_ffff_8000_1000),
            VirtualAddress::new(0xffff_ffff_9000_8000),
            0xdead_beef,
        );
        assert_eq!(context.frame.rip, 0xffff_ffff_8000_1000);
        assert_eq!(context.frame.rsp, 0xffff_ffff_9000_7ff8);
        assert_eq!(context.frame.rdi, 0xdead_beef);
        assert_eq!(context.frame.rflags & 0x200, 0x200);
        assert_eq!(context.frame.cs, 0);
    }

    #[test]
    fn conditions_fire_on_predicate_or_wake_tick() {
        fn never(_userdata: u64, _now: u64) -> bool {
            false
        }
        fn at_seven(_userdata: u64, now: u64) -> bool {
            now == 7
        }

        let timed = BlockCondition::new(never, 0, Some(10));
        assert!(!timed.satisfied(9));
        assert!(timed.satisfied(10));
        assert!(timed.satisfied(11));

        let polled = BlockCondition::new(at_seven, 0, None);
        assert!(!polled.satisfied(6));
        assert!(polled.satisfied(7));
    }
}
