//! Scheduling glue: the global [`Scheduler`] instance behind its spin
//! lock, and the paths that turn its decisions into hardware state.
//!
//! The delicate part is enacting a [`Switch`]. The moment `schedule`
//! returns, the outgoing thread is re-pickable by every other core, so
//! its stack must not be touched again. The switch context is therefore
//! copied into this core's [`PerCpu::staging`] buffer and `TSS.RSP0`
//! updated while the scheduler lock is still held; after the lock drops
//! only registers and per-CPU memory are used until `restore_context`
//! takes over.

use alloc::vec::Vec;

use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_pmm::OutOfMemory;
use kernel_sched::{
    AffinityMask, BlockCondition, CpuId, NewThread, Priority, ProcessId, SavedFrame,
    ScheduleError, ScheduleReason, Scheduler, Switch, ThreadId, WaitSupport,
};
use kernel_sync::{SpinLock, SyncOnceCell};
use kernel_vmem::VmError;
use log::warn;
use thiserror::Error;

use crate::context::{self, restore_context};
use crate::interrupts::reschedule::RESCHEDULE_VECTOR;
use crate::per_cpu::PerCpu;
use crate::{apic, vmem};

static SCHEDULER: SyncOnceCell<SpinLock<Scheduler>> = SyncOnceCell::new();

/// Processes whose threads are dead but whose address space still awaits
/// teardown. Drained by [`reap_exited`]. Only ever taken while holding
/// the scheduler lock or nothing.
static PENDING_REAP: SpinLock<Vec<ProcessId>> = SpinLock::new(Vec::new());

/// Failures when bringing a new thread or process into existence.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SpawnError {
    /// No memory for a kernel stack or an address-space root.
    #[error("out of memory")]
    OutOfMemory,

    /// The scheduler rejected the thread.
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

impl From<VmError> for SpawnError {
    fn from(_: VmError) -> Self {
        Self::OutOfMemory
    }
}

impl From<OutOfMemory> for SpawnError {
    fn from(_: OutOfMemory) -> Self {
        Self::OutOfMemory
    }
}

/// Creates the scheduler. The memory layer must be up; the kernel root
/// is what kernel threads load into CR3.
pub fn init(kernel_root: PhysicalPage) {
    let _ = SCHEDULER.get_or_init(|| SpinLock::new(Scheduler::new(kernel_root)));
}

fn scheduler() -> &'static SpinLock<Scheduler> {
    SCHEDULER.get().expect("scheduler not initialized")
}

fn current_cpu() -> CpuId {
    PerCpu::current().cpu
}

/// Registers the executing core and its freshly allocated idle thread.
/// The core stays offline until [`mark_online`].
pub fn register_core(apic_id: u32) -> CpuId {
    let idle_stack = vmem::alloc_kernel_stack().expect("no memory for an idle stack");
    let idle_context = context::kernel_thread_context(idle_loop, idle_stack, 0);
    scheduler()
        .with_lock(|sched| sched.register_cpu(apic_id, idle_context, idle_stack))
        .expect("core limit reached")
}

/// Turns the executing boot or AP bring-up flow into a schedulable
/// thread, so the first preemption has somewhere to file its context.
pub fn adopt_boot_flow(cpu: CpuId, priority: Priority, kernel_stack_top: VirtualAddress) -> ThreadId {
    scheduler()
        .with_lock(|sched| sched.adopt_current(cpu, priority, kernel_stack_top))
        .expect("core already runs a thread")
}

/// Marks the core ready for selection.
pub fn mark_online(cpu: CpuId) {
    scheduler()
        .with_lock(|sched| sched.mark_online(cpu))
        .expect("core not registered");
}

/// Spawns a kernel thread on the shared kernel address space.
///
/// # Errors
/// [`SpawnError::OutOfMemory`] when no kernel stack can be committed,
/// otherwise whatever the scheduler rejects.
pub fn spawn_kernel_thread(
    entry: extern "C" fn(u64) -> !,
    argument: u64,
    priority: Priority,
) -> Result<ThreadId, SpawnError> {
    let stack_top = vmem::alloc_kernel_stack()?;
    let context = context::kernel_thread_context(entry, stack_top, argument);
    let id = scheduler().with_lock(|sched| {
        sched.create_thread(NewThread {
            context,
            priority,
            affinity: AffinityMask::ALL,
            process: None,
            kernel_stack_top: stack_top,
            start_paused: false,
        })
    })?;
    Ok(id)
}

/// Creates an empty process: a fresh lower half over the shared kernel
/// upper half, with no threads yet.
///
/// # Errors
/// [`SpawnError::OutOfMemory`] when no root frame is available.
pub fn create_process() -> Result<ProcessId, SpawnError> {
    let space = vmem::create_process_space()?;
    let root = space.root();
    let process = scheduler().with_lock(|sched| sched.create_process(root));
    vmem::adopt_process_space(process, space);
    Ok(process)
}

/// Spawns a ring-3 thread inside `process`. `entry` and `stack_top` are
/// user-half addresses; the kernel stack for its traps is allocated
/// here.
///
/// # Errors
/// [`SpawnError::OutOfMemory`] for the kernel stack, or the scheduler's
/// rejection (e.g. a stale process id).
pub fn spawn_user_thread(
    process: ProcessId,
    entry: VirtualAddress,
    stack_top: VirtualAddress,
    argument: u64,
    priority: Priority,
) -> Result<ThreadId, SpawnError> {
    let kernel_stack_top = vmem::alloc_kernel_stack()?;
    let context = context::user_thread_context(entry, stack_top, argument);
    let id = scheduler().with_lock(|sched| {
        sched.create_thread(NewThread {
            context,
            priority,
            affinity: AffinityMask::ALL,
            process: Some(process),
            kernel_stack_top,
            start_paused: false,
        })
    })?;
    Ok(id)
}

/// One scheduling pass for this core, called from the timer and
/// reschedule ISRs with `frame` pointing at the interrupted context on
/// the stack. Returns normally when the incumbent keeps the core; when a
/// switch happens this never returns.
pub fn preempt(frame: &SavedFrame, reason: ScheduleReason) {
    // SAFETY: called with interrupts masked; nothing else touches this
    // core's block.
    let percpu = unsafe { PerCpu::current_mut() };
    // SAFETY: CR4.OSFXSR was set during bring-up.
    unsafe { context::fxsave(&mut percpu.fpu_scratch) };
    let mut pending = None;
    {
        let mut sched = scheduler().lock();
        if let Some(switch) = sched.schedule(percpu.cpu, reason, Some((frame, &percpu.fpu_scratch)))
        {
            pending = Some(stage(percpu, &switch));
        }
    }
    // The restore never returns, so the EOI has to happen first.
    // SAFETY: we are inside an APIC-delivered handler.
    unsafe { apic::eoi() };
    if let Some(cr3) = pending {
        // SAFETY: staging holds the incoming context, RSP0 is set, the
        // scheduler already records the thread as running here.
        unsafe { restore_context(&raw const percpu.staging, cr3) };
    }
}

/// Copies the switch into stable per-CPU memory and points `TSS.RSP0` at
/// the incoming thread's kernel stack. Must run under the scheduler
/// lock. Returns the CR3 argument for [`restore_context`].
fn stage(percpu: &mut PerCpu, switch: &Switch) -> u64 {
    percpu.tss.rsp0 = switch.kernel_stack_top;
    percpu.staging = switch.context;
    switch.cr3.map_or(0, |root| root.base().as_u64())
}

/// Process owning the thread on this core, if any.
pub fn current_process() -> Option<ProcessId> {
    scheduler().with_lock(|sched| sched.current_process(current_cpu()))
}

/// Kills the process owning the thread on this core (if any), then exits
/// the thread and hands the core to whatever runs next. Used by the
/// page-fault path for unresolvable user faults; exceptions owe no EOI,
/// so none is sent.
pub fn kill_current_process(exit_code: u32) -> ! {
    // SAFETY: interrupts are masked inside the handler.
    let percpu = unsafe { PerCpu::current_mut() };
    let cr3;
    {
        let mut sched = scheduler().lock();
        if let Some(process) = sched.current_process(percpu.cpu) {
            match sched.terminate_process(process, exit_code) {
                Ok(()) => PENDING_REAP.lock().push(process),
                Err(error) => warn!("terminating {process} failed: {error}"),
            }
        }
        let switch = sched
            .exit_current(percpu.cpu, exit_code)
            .expect("fault outside any thread");
        cr3 = stage(percpu, &switch);
    }
    // Sibling threads on other cores die at their next scheduling point.
    // SAFETY: x2APIC is enabled on this core; staging holds the incoming
    // context and RSP0 is set.
    unsafe {
        apic::broadcast_ipi(RESCHEDULE_VECTOR);
        restore_context(&raw const percpu.staging, cr3)
    }
}

/// Tears down the address spaces of fully-dead processes. A process
/// whose last thread still sits on a remote core stays queued for the
/// next round.
pub fn reap_exited() {
    let pending = core::mem::take(&mut *PENDING_REAP.lock());
    for process in pending {
        let result = scheduler().with_lock(|sched| sched.destroy_process(process));
        match result {
            Ok(root) => vmem::destroy_process_space(process, root),
            // A member thread is still current somewhere.
            Err(_) => PENDING_REAP.lock().push(process),
        }
    }
}

/// Parks the calling thread for at least `ticks` scheduler ticks.
pub fn sleep_ticks(ticks: u64) {
    fn never(_: u64, _: u64) -> bool {
        false
    }
    {
        let mut sched = scheduler().lock();
        let wake = sched.ticks().saturating_add(ticks);
        let _ = sched.block_current(current_cpu(), BlockCondition::new(never, 0, Some(wake)));
    }
    request_reschedule();
}

/// Asks this core for a scheduling pass via a self-IPI. With interrupts
/// enabled it fires before this function returns.
pub fn request_reschedule() {
    let apic_id = PerCpu::current().apic_id;
    // SAFETY: x2APIC is enabled on this core.
    unsafe { apic::send_ipi(apic_id, RESCHEDULE_VECTOR) };
}

/// Forces a scheduling pass on every core, e.g. after a wakeup or a
/// process-wide termination.
pub fn reschedule_all_cores() {
    // SAFETY: x2APIC is enabled on this core.
    unsafe { apic::broadcast_ipi(RESCHEDULE_VECTOR) };
    request_reschedule();
}

/// Parks every other core in its NMI handler. Used by panic; the cores
/// never come back.
pub fn stop_other_cores() {
    // SAFETY: NMI delivery needs no target-side setup.
    unsafe { apic::broadcast_nmi() };
}

/// [`WaitSupport`] over the global scheduler, for blocking
/// [`kernel_sched::Mutex`] acquisition from kernel threads.
pub struct SchedulerWait;

impl WaitSupport for SchedulerWait {
    fn current_thread(&self) -> Option<ThreadId> {
        scheduler().with_lock(|sched| sched.current_thread(current_cpu()))
    }

    fn now(&self) -> u64 {
        scheduler().with_lock(|sched| sched.ticks())
    }

    fn wait(&mut self, condition: BlockCondition) {
        scheduler().with_lock(|sched| {
            let _ = sched.block_current(current_cpu(), condition);
        });
        request_reschedule();
    }
}

/// Per-core fallback thread: halt until the next interrupt, forever.
pub extern "C" fn idle_loop(_: u64) -> ! {
    loop {
        // SAFETY: sti;hlt is the canonical idle; the core wakes on the
        // next timer tick or IPI.
        unsafe {
            core::arch::asm!("sti", "hlt", options(nomem, nostack, preserves_flags));
        }
    }
}
