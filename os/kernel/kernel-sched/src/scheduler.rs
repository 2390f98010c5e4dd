//! The scheduling core: thread and process tables, selection, and the
//! context-switch contract.
//!
//! One [`Scheduler`] instance serves every core. It carries no lock of its
//! own; the kernel wraps it in its interrupt-safe spin lock and calls in
//! from the timer ISR, the reschedule vector, and the thread API. Keeping
//! the lock outside is also what lets the whole state machine run in host
//! tests.
//!
//! ## Selection
//!
//! Run lists are scanned from `High` down to `Idle`, each tail-to-head. A
//! thread is eligible when it is runnable, not dead, paused, or blocked,
//! not on another core, admitted by its affinity mask, and below its
//! priority's slot quota. The first eligible thread wins and its
//! `iterations` counter advances, switch or no switch. When a full sweep
//! finds nothing, every counter resets and one more sweep runs: that reset
//! opens the next fairness epoch. Within an epoch a saturated class yields
//! downward; across epochs strict priority holds.
//!
//! Blocked threads are not parked on wait queues; their wake conditions are
//! re-evaluated at the top of every pass. The cost is O(blocked) per pass,
//! which this kernel accepts in exchange for having no wake-up plumbing.

use alloc::vec::Vec;

use kernel_info::memory::MAX_CPUS;
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use log::{debug, info};

use crate::arena::Arena;
use crate::cpu::{CpuId, CpuLocal};
use crate::error::ScheduleError;
use crate::process::{Process, ProcessId};
use crate::queue::RunQueues;
use crate::thread::{
    AffinityMask, BlockCondition, FpuArea, NewThread, Priority, SavedFrame, Thread, ThreadContext,
    ThreadId, ThreadStatus,
};

/// Why the scheduler was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleReason {
    /// Periodic timer interrupt; advances the global tick count.
    Timer,
    /// Explicit reschedule request (software vector or IPI); no tick.
    Requested,
}

/// Hand-over instructions for the architecture glue.
///
/// Enact in order: load `cr3` if present, point `TSS.RSP0` at
/// `kernel_stack_top`, then restore `context` and return into the thread.
#[derive(Debug, Clone, Copy)]
#[must_use = "scheduler state already reflects the switch; it has to be enacted"]
pub struct Switch {
    /// The thread taking the core.
    pub thread: ThreadId,
    /// Register and FPU state to restore.
    pub context: ThreadContext,
    /// Page-table root to load, present only when it differs from the
    /// outgoing thread's root.
    pub cr3: Option<PhysicalPage>,
    /// Stack for privilege-level transitions while the thread runs.
    pub kernel_stack_top: VirtualAddress,
}

/// Shared scheduling state for all cores.
pub struct Scheduler {
    threads: Arena<Thread>,
    processes: Arena<Process>,
    queues: RunQueues,
    cpus: Vec<CpuLocal>,
    /// Root of the shared kernel address space; the CR3 of every thread
    /// that has no owning process.
    kernel_root: PhysicalPage,
    /// Timer interrupts observed across all cores.
    ticks: u64,
}

impl Scheduler {
    #[must_use]
    pub const fn new(kernel_root: PhysicalPage) -> Self {
        Self {
            threads: Arena::new(),
            processes: Arena::new(),
            queues: RunQueues::new(),
            cpus: Vec::new(),
            kernel_root,
            ticks: 0,
        }
    }

    /// Registers a core together with its idle thread.
    ///
    /// The idle context should run a halt loop; it is the fallback when
    /// nothing else is eligible. Cores start offline and report in through
    /// [`Self::mark_online`] once their architecture state is ready.
    ///
    /// # Errors
    /// [`ScheduleError::InvalidParameter`] when the core limit is reached.
    #[allow(clippy::cast_possible_truncation)]
    pub fn register_cpu(
        &mut self,
        apic_id: u32,
        idle_context: ThreadContext,
        idle_stack_top: VirtualAddress,
    ) -> Result<CpuId, ScheduleError> {
        if self.cpus.len() >= MAX_CPUS {
            return Err(ScheduleError::InvalidParameter);
        }
        let id = CpuId::new(self.cpus.len() as u32);
        let idle = self.spawn(Thread {
            status: ThreadStatus::new().with_runnable(true),
            priority: Priority::Idle,
            iterations: 0,
            affinity: AffinityMask::only(id),
            process: None,
            exit_code: 0,
            kernel_stack_top: idle_stack_top,
            context: idle_context,
            block: None,
            queue_prev: None,
            queue_next: None,
        });
        self.cpus.push(CpuLocal::new(id, apic_id, idle.0.index()));
        debug!("{id} registered, apic id {apic_id}, idle thread {idle}");
        Ok(id)
    }

    /// Marks a registered core ready to schedule.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for an unregistered id.
    pub fn mark_online(&mut self, cpu: CpuId) -> Result<(), ScheduleError> {
        let local = self
            .cpus
            .get_mut(cpu.as_usize())
            .ok_or(ScheduleError::NoSuchObject)?;
        local.set_online();
        info!("{cpu} online");
        Ok(())
    }

    /// Turns the flow currently executing on `cpu` into a thread.
    ///
    /// Used once per core during bring-up, before its first scheduling
    /// pass. The context starts empty and is captured at the first
    /// preemption.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for an unregistered core,
    /// [`ScheduleError::InvalidParameter`] when the core already runs a
    /// thread.
    pub fn adopt_current(
        &mut self,
        cpu: CpuId,
        priority: Priority,
        kernel_stack_top: VirtualAddress,
    ) -> Result<ThreadId, ScheduleError> {
        let local = self
            .cpus
            .get(cpu.as_usize())
            .ok_or(ScheduleError::NoSuchObject)?;
        if local.current.is_some() {
            return Err(ScheduleError::InvalidParameter);
        }
        let id = self.spawn(Thread {
            status: ThreadStatus::new().with_runnable(true).with_running(true),
            priority,
            iterations: 0,
            affinity: AffinityMask::only(cpu),
            process: None,
            exit_code: 0,
            kernel_stack_top,
            context: ThreadContext::default(),
            block: None,
            queue_prev: None,
            queue_next: None,
        });
        self.cpus[cpu.as_usize()].current = Some(id.0.index());
        debug!("{cpu} adopted its boot flow as thread {id}");
        Ok(id)
    }

    /// Creates a thread ready for selection.
    ///
    /// # Errors
    /// - [`ScheduleError::InvalidParameter`] when the affinity mask admits
    ///   no registered core.
    /// - [`ScheduleError::NoSuchObject`] when `process` names no live
    ///   process.
    pub fn create_thread(&mut self, new: NewThread) -> Result<ThreadId, ScheduleError> {
        if !self.cpus.iter().any(|cpu| new.affinity.allows(cpu.id())) {
            return Err(ScheduleError::InvalidParameter);
        }
        if let Some(process) = new.process
            && self.processes.get(process.0).is_none()
        {
            return Err(ScheduleError::NoSuchObject);
        }
        let id = self.spawn(Thread {
            status: ThreadStatus::new()
                .with_runnable(true)
                .with_paused(new.start_paused),
            priority: new.priority,
            iterations: 0,
            affinity: new.affinity,
            process: new.process,
            exit_code: 0,
            kernel_stack_top: new.kernel_stack_top,
            context: new.context,
            block: None,
            queue_prev: None,
            queue_next: None,
        });
        if let Some(process) = new.process
            && let Some(record) = self.processes.get_mut(process.0)
        {
            record.threads.push(id);
        }
        debug!("thread {id} created, {:?} priority", new.priority);
        Ok(id)
    }

    fn spawn(&mut self, thread: Thread) -> ThreadId {
        let handle = self.threads.insert(thread);
        self.queues.push(&mut self.threads, handle.index());
        ThreadId(handle)
    }

    /// Number of threads in the table, dead-but-unreaped included.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.threads.len()
    }

    /// Live status word of a thread.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    pub fn thread_status(&self, id: ThreadId) -> Result<ThreadStatus, ScheduleError> {
        self.threads
            .get(id.0)
            .map(|thread| thread.status)
            .ok_or(ScheduleError::NoSuchObject)
    }

    /// Exit code, once the thread has died. `None` while it lives.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    pub fn thread_exit_code(&self, id: ThreadId) -> Result<Option<u32>, ScheduleError> {
        let thread = self.threads.get(id.0).ok_or(ScheduleError::NoSuchObject)?;
        Ok(thread.status.dead().then_some(thread.exit_code))
    }

    /// The thread currently on `cpu`, if it has one.
    #[must_use]
    pub fn current_thread(&self, cpu: CpuId) -> Option<ThreadId> {
        let index = self.cpus.get(cpu.as_usize())?.current?;
        Some(ThreadId(self.threads.handle_at(index)))
    }

    /// Process owning the thread currently on `cpu`, if any.
    #[must_use]
    pub fn current_process(&self, cpu: CpuId) -> Option<ProcessId> {
        let index = self.cpus.get(cpu.as_usize())?.current?;
        self.threads.at(index).process
    }

    /// Global tick count; the time base for mutex timeouts.
    #[must_use]
    pub const fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Registered cores in id order.
    pub fn cpus(&self) -> impl Iterator<Item = &CpuLocal> {
        self.cpus.iter()
    }

    fn live_thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, ScheduleError> {
        let thread = self
            .threads
            .get_mut(id.0)
            .ok_or(ScheduleError::NoSuchObject)?;
        if thread.status.dead() {
            return Err(ScheduleError::ThreadDead);
        }
        Ok(thread)
    }

    /// Excludes the thread from selection until [`Self::resume`].
    ///
    /// A thread on another core keeps running until that core's next
    /// scheduling point; follow up with a reschedule request there.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] / [`ScheduleError::ThreadDead`].
    pub fn pause(&mut self, id: ThreadId) -> Result<(), ScheduleError> {
        self.live_thread_mut(id)?.status.set_paused(true);
        Ok(())
    }

    /// Clears a pause; the thread is eligible again at the next pass.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] / [`ScheduleError::ThreadDead`].
    pub fn resume(&mut self, id: ThreadId) -> Result<(), ScheduleError> {
        self.live_thread_mut(id)?.status.set_paused(false);
        Ok(())
    }

    /// Moves the thread to another priority class.
    ///
    /// It re-queues at the tail of the new class's list and keeps its
    /// accumulated `iterations` until the next epoch.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] / [`ScheduleError::ThreadDead`].
    pub fn set_priority(&mut self, id: ThreadId, priority: Priority) -> Result<(), ScheduleError> {
        if self.live_thread_mut(id)?.priority == priority {
            return Ok(());
        }
        let index = id.0.index();
        self.queues.unlink(&mut self.threads, index);
        self.threads.at_mut(index).priority = priority;
        self.queues.push(&mut self.threads, index);
        Ok(())
    }

    /// Marks the thread dead and removes it from its run list.
    ///
    /// The slot stays queryable (status, exit code) until [`Self::reap`].
    /// A target on some core dies at that core's next scheduling point;
    /// when the target is the caller's own thread, use
    /// [`Self::exit_current`] instead, which also picks the successor.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] / [`ScheduleError::ThreadDead`], and
    /// [`ScheduleError::InvalidParameter`] for an idle thread.
    pub fn terminate(&mut self, id: ThreadId, exit_code: u32) -> Result<(), ScheduleError> {
        self.live_thread_mut(id)?;
        let index = id.0.index();
        if self.cpus.iter().any(|local| local.idle == index) {
            return Err(ScheduleError::InvalidParameter);
        }
        self.queues.unlink(&mut self.threads, index);
        let thread = self.threads.at_mut(index);
        thread.status.set_dead(true);
        thread.status.set_runnable(false);
        thread.status.set_blocked(false);
        thread.block = None;
        thread.exit_code = exit_code;
        debug!("thread {id} terminated, exit code {exit_code:#x}");
        Ok(())
    }

    /// Frees a dead thread's slot and detaches it from its process.
    ///
    /// # Errors
    /// - [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    /// - [`ScheduleError::InvalidParameter`] while the thread is not dead
    ///   yet or still sits on a core.
    pub fn reap(&mut self, id: ThreadId) -> Result<(), ScheduleError> {
        let thread = self.threads.get(id.0).ok_or(ScheduleError::NoSuchObject)?;
        if !thread.status.dead() || thread.status.running() {
            return Err(ScheduleError::InvalidParameter);
        }
        let process = thread.process;
        self.threads.remove(id.0);
        if let Some(process) = process
            && let Some(record) = self.processes.get_mut(process.0)
        {
            record.threads.retain(|&thread| thread != id);
        }
        Ok(())
    }

    /// Parks the thread running on `cpu` until `condition` reports ready.
    ///
    /// The condition is re-evaluated on every scheduling pass. The caller
    /// must follow up with a reschedule request; until that fires the
    /// thread keeps its core.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] when the core has no current thread.
    pub fn block_current(
        &mut self,
        cpu: CpuId,
        condition: BlockCondition,
    ) -> Result<(), ScheduleError> {
        let index = self
            .cpus
            .get(cpu.as_usize())
            .and_then(|local| local.current)
            .ok_or(ScheduleError::NoSuchObject)?;
        let thread = self.threads.at_mut(index);
        thread.status.set_blocked(true);
        thread.block = Some(condition);
        Ok(())
    }

    /// Terminates the thread on `cpu` and picks what runs instead.
    ///
    /// The returned switch never resumes the exiting thread; enact it and
    /// do not return into the caller's flow.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] when the core has no current thread,
    /// [`ScheduleError::InvalidParameter`] when it is the idle thread.
    ///
    /// # Panics
    /// When the pass after the termination produces no switch. A dead
    /// thread is never re-selected, so that state is unreachable with
    /// intact run lists.
    pub fn exit_current(&mut self, cpu: CpuId, exit_code: u32) -> Result<Switch, ScheduleError> {
        let current = self
            .current_thread(cpu)
            .ok_or(ScheduleError::NoSuchObject)?;
        self.terminate(current, exit_code)?;
        match self.schedule(cpu, ScheduleReason::Requested, None) {
            Some(switch) => Ok(switch),
            // The current thread is dead and dead threads are never
            // re-selected, so a switch always results.
            None => unreachable!("a dead thread cannot stay current"),
        }
    }

    /// One scheduling pass for `cpu`, from the timer ISR or a reschedule
    /// request.
    ///
    /// `saved` is the interrupted context to file into the outgoing thread;
    /// pass `None` when the core has no current thread or its context must
    /// not be kept (exit). Returns `None` when the incumbent keeps the
    /// core.
    pub fn schedule(
        &mut self,
        cpu: CpuId,
        reason: ScheduleReason,
        saved: Option<(&SavedFrame, &FpuArea)>,
    ) -> Option<Switch> {
        if reason == ScheduleReason::Timer {
            self.ticks += 1;
        }
        let local = self.cpus.get(cpu.as_usize())?;
        let current = local.current;

        if let (Some(index), Some((frame, fpu))) = (current, saved) {
            let thread = self.threads.at_mut(index);
            thread.context.frame = *frame;
            thread.context.fpu = *fpu;
        }

        self.poll_blocked();

        let next = self
            .pick(cpu)
            .unwrap_or_else(|| self.cpus[cpu.as_usize()].idle);
        if Some(next) == current {
            return None;
        }

        let previous_root = current.map_or(self.kernel_root, |index| self.space_root(index));
        if let Some(index) = current {
            self.threads.at_mut(index).status.set_running(false);
        }
        let incoming = self.threads.at_mut(next);
        incoming.status.set_running(true);
        let context = incoming.context;
        let kernel_stack_top = incoming.kernel_stack_top;
        let next_root = self.space_root(next);
        let thread = ThreadId(self.threads.handle_at(next));
        self.cpus[cpu.as_usize()].current = Some(next);

        Some(Switch {
            thread,
            context,
            cr3: (next_root != previous_root).then_some(next_root),
            kernel_stack_top,
        })
    }

    /// Re-evaluates every blocked thread's wake condition.
    fn poll_blocked(&mut self) {
        let now = self.ticks;
        for priority in Priority::SCAN {
            let mut cursor = self.queues.tail(priority);
            while let Some(index) = cursor {
                cursor = self.threads.at(index).queue_prev;
                let thread = self.threads.at_mut(index);
                if thread.status.blocked()
                    && thread
                        .block
                        .as_ref()
                        .is_some_and(|condition| condition.satisfied(now))
                {
                    thread.status.set_blocked(false);
                    thread.block = None;
                }
            }
        }
    }

    /// The highest-priority eligible thread, or `None` when even a reset
    /// sweep finds nothing.
    fn pick(&mut self, cpu: CpuId) -> Option<u32> {
        let current = self.cpus[cpu.as_usize()].current;
        for sweep in 0..2 {
            for priority in Priority::SCAN {
                let mut cursor = self.queues.tail(priority);
                while let Some(index) = cursor {
                    cursor = self.threads.at(index).queue_prev;
                    if self.eligible(index, cpu, current) {
                        self.threads.at_mut(index).iterations += 1;
                        return Some(index);
                    }
                }
            }
            if sweep == 0 {
                self.reset_iterations();
            }
        }
        None
    }

    fn eligible(&self, index: u32, cpu: CpuId, current: Option<u32>) -> bool {
        let thread = self.threads.at(index);
        let status = thread.status;
        status.runnable()
            && !status.dead()
            && !status.paused()
            && !status.blocked()
            && (!status.running() || current == Some(index))
            && thread.affinity.allows(cpu)
            && thread.iterations < thread.priority.quota()
    }

    /// Opens the next fairness epoch.
    fn reset_iterations(&mut self) {
        for thread in self.threads.iter_mut() {
            thread.iterations = 0;
        }
    }

    fn space_root(&self, index: u32) -> PhysicalPage {
        self.threads
            .at(index)
            .process
            .and_then(|process| self.processes.get(process.0))
            .map_or(self.kernel_root, |record| record.root)
    }

    /// Registers a process over the root of its address space.
    pub fn create_process(&mut self, root: PhysicalPage) -> ProcessId {
        let id = ProcessId(self.processes.insert(Process {
            root,
            threads: Vec::new(),
            exit_code: None,
        }));
        info!("process {id} created, address space root {root}");
        id
    }

    /// Address-space root of a process.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    pub fn process_root(&self, id: ProcessId) -> Result<PhysicalPage, ScheduleError> {
        self.processes
            .get(id.0)
            .map(|record| record.root)
            .ok_or(ScheduleError::NoSuchObject)
    }

    /// Exit code, once the process has been terminated.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    pub fn process_exit_code(&self, id: ProcessId) -> Result<Option<u32>, ScheduleError> {
        self.processes
            .get(id.0)
            .map(|record| record.exit_code)
            .ok_or(ScheduleError::NoSuchObject)
    }

    /// Terminates every thread of the process and records its exit code.
    ///
    /// Threads currently on a core die at that core's next scheduling
    /// point; broadcast a reschedule after this returns.
    /// [`Self::destroy_process`] completes the teardown once none of them
    /// remains on a core.
    ///
    /// # Errors
    /// [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    pub fn terminate_process(&mut self, id: ProcessId, exit_code: u32) -> Result<(), ScheduleError> {
        let record = self
            .processes
            .get_mut(id.0)
            .ok_or(ScheduleError::NoSuchObject)?;
        record.exit_code = Some(exit_code);
        let threads = record.threads.clone();
        for thread in threads {
            match self.terminate(thread, exit_code) {
                // Individually-terminated members are fine.
                Ok(()) | Err(ScheduleError::ThreadDead) => {}
                Err(error) => return Err(error),
            }
        }
        info!("process {id} terminated, exit code {exit_code:#x}");
        Ok(())
    }

    /// Removes a fully-dead process and hands back its address-space root
    /// for the caller to tear down.
    ///
    /// Detaches and reaps all member threads first.
    ///
    /// # Errors
    /// - [`ScheduleError::NoSuchObject`] for a stale or unknown id.
    /// - [`ScheduleError::InvalidParameter`] while any member thread is
    ///   alive or still on a core.
    pub fn destroy_process(&mut self, id: ProcessId) -> Result<PhysicalPage, ScheduleError> {
        let record = self.processes.get(id.0).ok_or(ScheduleError::NoSuchObject)?;
        for &thread in &record.threads {
            let entry = self.threads.get(thread.0).ok_or(ScheduleError::NoSuchObject)?;
            if !entry.status.dead() || entry.status.running() {
                return Err(ScheduleError::InvalidParameter);
            }
        }
        let record = self
            .processes
            .remove(id.0)
            .ok_or(ScheduleError::NoSuchObject)?;
        for thread in record.threads {
            self.threads.remove(thread.0);
        }
        Ok(record.root)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicBool, Ordering};

    use kernel_memory_addresses::PhysicalAddress;

    use super::*;

    fn root(frame: u64) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(frame * 0x1000))
    }

    fn stack(slot: u64) -> VirtualAddress {
        VirtualAddress::new(0xffff_ffff_9100_0000 + slot * 0x8000)
    }

    /// Scheduler over `cores` online cores, kernel root `root(1)`.
    fn boot(cores: u32) -> Scheduler {
        let mut sched = Scheduler::new(root(1));
        for n in 0..cores {
            let cpu = sched
                .register_cpu(n, ThreadContext::default(), stack(u64::from(n)))
                .unwrap();
            sched.mark_online(cpu).unwrap();
        }
        sched
    }

    fn spawn(sched: &mut Scheduler, priority: Priority, affinity: AffinityMask) -> ThreadId {
        sched
            .create_thread(NewThread {
                context: ThreadContext::default(),
                priority,
                affinity,
                process: None,
                kernel_stack_top: stack(99),
                start_paused: false,
            })
            .unwrap()
    }

    fn member(sched: &mut Scheduler, process: ProcessId) -> ThreadId {
        sched
            .create_thread(NewThread {
                context: ThreadContext::default(),
                priority: Priority::Normal,
                affinity: AffinityMask::ALL,
                process: Some(process),
                kernel_stack_top: stack(50),
                start_paused: false,
            })
            .unwrap()
    }

    /// One timer slot on `cpu`; reports who holds the core afterwards.
    fn slot(sched: &mut Scheduler, cpu: CpuId) -> ThreadId {
        let _ = sched.schedule(cpu, ScheduleReason::Timer, None);
        sched.current_thread(cpu).unwrap()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn flag_raised(userdata: u64, _now: u64) -> bool {
        // SAFETY: the tests park on flags that outlive the scheduler.
        let flag = unsafe { &*(userdata as usize as *const AtomicBool) };
        flag.load(Ordering::Acquire)
    }

    fn never(_userdata: u64, _now: u64) -> bool {
        false
    }

    #[test]
    fn cores_fall_back_to_their_idle_thread() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;

        let switch = sched.schedule(cpu, ScheduleReason::Timer, None).unwrap();
        assert_eq!(sched.current_thread(cpu), Some(switch.thread));
        assert!(switch.cr3.is_none());
        assert!(sched.thread_status(switch.thread).unwrap().running());

        // the idle thread keeps the core without a new switch, across the
        // epoch reset its one-slot quota forces
        assert!(sched.schedule(cpu, ScheduleReason::Timer, None).is_none());
        assert!(sched.schedule(cpu, ScheduleReason::Timer, None).is_none());
        assert_eq!(sched.ticks(), 3);
    }

    #[test]
    fn new_threads_preempt_the_idle_loop() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let idle = slot(&mut sched, cpu);

        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        let switch = sched.schedule(cpu, ScheduleReason::Timer, None).unwrap();
        assert_eq!(switch.thread, worker);
        assert_eq!(switch.kernel_stack_top, stack(99));
        assert!(sched.thread_status(worker).unwrap().running());
        assert!(!sched.thread_status(idle).unwrap().running());
    }

    #[test]
    fn higher_classes_win_until_their_quota_expires() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let normal = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        let high = spawn(&mut sched, Priority::High, AffinityMask::ALL);

        for _ in 0..8 {
            assert_eq!(slot(&mut sched, cpu), high);
        }
        assert_eq!(slot(&mut sched, cpu), normal);
    }

    #[test]
    fn pausing_removes_a_thread_from_selection() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        assert_eq!(slot(&mut sched, cpu), worker);

        sched.pause(worker).unwrap();
        let idle = slot(&mut sched, cpu);
        assert_ne!(idle, worker);
        assert_eq!(slot(&mut sched, cpu), idle);

        sched.resume(worker).unwrap();
        assert_eq!(slot(&mut sched, cpu), worker);
    }

    #[test]
    fn threads_can_start_paused() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let worker = sched
            .create_thread(NewThread {
                context: ThreadContext::default(),
                priority: Priority::High,
                affinity: AffinityMask::ALL,
                process: None,
                kernel_stack_top: stack(3),
                start_paused: true,
            })
            .unwrap();

        assert_ne!(slot(&mut sched, cpu), worker);
        sched.resume(worker).unwrap();
        assert_eq!(slot(&mut sched, cpu), worker);
    }

    #[test]
    fn reprioritized_threads_requeue_in_their_new_class() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let first = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        let second = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);

        // within a class the most recently queued thread is scanned first
        assert_eq!(slot(&mut sched, cpu), second);

        sched.set_priority(first, Priority::High).unwrap();
        assert_eq!(slot(&mut sched, cpu), first);
        // a same-class move is a no-op
        sched.set_priority(first, Priority::High).unwrap();
        assert_eq!(slot(&mut sched, cpu), first);
    }

    #[test]
    fn termination_and_reaping_free_the_slot() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        assert_eq!(slot(&mut sched, cpu), worker);
        assert_eq!(sched.thread_exit_code(worker), Ok(None));

        sched.terminate(worker, 3).unwrap();
        assert_eq!(sched.terminate(worker, 4), Err(ScheduleError::ThreadDead));
        // still on the core until its next scheduling point
        assert_eq!(sched.reap(worker), Err(ScheduleError::InvalidParameter));

        assert_ne!(slot(&mut sched, cpu), worker);
        assert_eq!(sched.thread_exit_code(worker), Ok(Some(3)));
        sched.reap(worker).unwrap();
        assert_eq!(sched.thread_status(worker), Err(ScheduleError::NoSuchObject));
        assert_eq!(sched.thread_count(), 1);
    }

    #[test]
    fn idle_threads_cannot_be_terminated() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let idle = slot(&mut sched, cpu);
        assert_eq!(
            sched.terminate(idle, 0),
            Err(ScheduleError::InvalidParameter)
        );
    }

    #[test]
    fn exit_current_hands_the_core_over() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let idle = slot(&mut sched, cpu);
        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        assert_eq!(slot(&mut sched, cpu), worker);

        let switch = sched.exit_current(cpu, 7).unwrap();
        assert_eq!(switch.thread, idle);
        assert_eq!(sched.current_thread(cpu), Some(idle));
        assert_eq!(sched.thread_exit_code(worker), Ok(Some(7)));
        sched.reap(worker).unwrap();

        // the idle thread may not exit
        assert!(matches!(
            sched.exit_current(cpu, 0),
            Err(ScheduleError::InvalidParameter)
        ));
    }

    #[test]
    fn affinity_pins_threads_to_their_core() {
        let mut sched = boot(2);
        let cpu0 = CpuId::BOOT;
        let cpu1 = CpuId::new(1);
        let pinned = spawn(&mut sched, Priority::High, AffinityMask::only(cpu1));

        assert_ne!(slot(&mut sched, cpu0), pinned);
        assert_eq!(slot(&mut sched, cpu1), pinned);
    }

    #[test]
    fn a_thread_runs_on_one_core_at_a_time() {
        let mut sched = boot(2);
        let cpu0 = CpuId::BOOT;
        let cpu1 = CpuId::new(1);
        let worker = spawn(&mut sched, Priority::High, AffinityMask::ALL);

        assert_eq!(slot(&mut sched, cpu0), worker);
        assert_ne!(slot(&mut sched, cpu1), worker);
        // its own core may keep it
        assert_eq!(slot(&mut sched, cpu0), worker);
    }

    #[test]
    fn blocked_threads_wake_when_their_predicate_fires() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        assert_eq!(slot(&mut sched, cpu), worker);

        let flag = AtomicBool::new(false);
        let condition = BlockCondition::new(flag_raised, core::ptr::from_ref(&flag) as u64, None);
        sched.block_current(cpu, condition).unwrap();
        assert!(sched.thread_status(worker).unwrap().blocked());

        let idle = slot(&mut sched, cpu);
        assert_ne!(idle, worker);
        assert_eq!(slot(&mut sched, cpu), idle);

        flag.store(true, Ordering::Release);
        assert_eq!(slot(&mut sched, cpu), worker);
        assert!(!sched.thread_status(worker).unwrap().blocked());
    }

    #[test]
    fn blocked_threads_wake_at_their_tick() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let worker = spawn(&mut sched, Priority::Normal, AffinityMask::ALL);
        assert_eq!(slot(&mut sched, cpu), worker);

        let wake = sched.ticks() + 3;
        sched
            .block_current(cpu, BlockCondition::new(never, 0, Some(wake)))
            .unwrap();
        let idle = slot(&mut sched, cpu);
        assert_ne!(idle, worker);
        assert_eq!(slot(&mut sched, cpu), idle);
        assert_eq!(slot(&mut sched, cpu), worker);
        assert_eq!(sched.ticks(), wake);
    }

    #[test]
    fn blocking_needs_a_current_thread() {
        let mut sched = boot(1);
        assert!(matches!(
            sched.block_current(CpuId::BOOT, BlockCondition::new(never, 0, None)),
            Err(ScheduleError::NoSuchObject)
        ));
    }

    #[test]
    fn creation_validates_affinity_and_process() {
        let mut sched = boot(1);
        let unpinnable = NewThread {
            context: ThreadContext::default(),
            priority: Priority::Normal,
            affinity: AffinityMask::only(CpuId::new(5)),
            process: None,
            kernel_stack_top: stack(1),
            start_paused: false,
        };
        assert!(matches!(
            sched.create_thread(unpinnable),
            Err(ScheduleError::InvalidParameter)
        ));

        let gone = sched.create_process(root(2));
        sched.destroy_process(gone).unwrap();
        let orphan = NewThread {
            process: Some(gone),
            affinity: AffinityMask::ALL,
            ..unpinnable
        };
        assert!(matches!(
            sched.create_thread(orphan),
            Err(ScheduleError::NoSuchObject)
        ));
    }

    #[test]
    fn cr3_loads_only_across_address_spaces() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let user_root = root(2);
        let process = sched.create_process(user_root);
        assert_eq!(sched.process_root(process), Ok(user_root));

        let in_process = member(&mut sched, process);
        let in_kernel = spawn(&mut sched, Priority::Low, AffinityMask::ALL);

        // kernel half into the user space
        let switch = sched.schedule(cpu, ScheduleReason::Timer, None).unwrap();
        assert_eq!(switch.thread, in_process);
        assert_eq!(switch.cr3, Some(user_root));
        assert_eq!(sched.current_process(cpu), Some(process));

        // user space back into the kernel root
        sched.pause(in_process).unwrap();
        let switch = sched.schedule(cpu, ScheduleReason::Timer, None).unwrap();
        assert_eq!(switch.thread, in_kernel);
        assert_eq!(switch.cr3, Some(root(1)));
        assert_eq!(sched.current_process(cpu), None);

        // kernel thread to idle stays in the kernel root
        sched.pause(in_kernel).unwrap();
        let switch = sched.schedule(cpu, ScheduleReason::Timer, None).unwrap();
        assert!(switch.cr3.is_none());
    }

    #[test]
    fn adopted_flows_capture_their_context_at_preemption() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let boot_thread = sched.adopt_current(cpu, Priority::Normal, stack(7)).unwrap();
        assert_eq!(sched.current_thread(cpu), Some(boot_thread));
        assert!(matches!(
            sched.adopt_current(cpu, Priority::Normal, stack(7)),
            Err(ScheduleError::InvalidParameter)
        ));

        // the first preemption files the interrupted frame
        let frame = SavedFrame {
            rip: 0xffff_ffff_8000_1234,
            rsp: stack(7).as_u64() - 64,
            ..SavedFrame::default()
        };
        let fpu = FpuArea::zeroed();
        assert!(
            sched
                .schedule(cpu, ScheduleReason::Timer, Some((&frame, &fpu)))
                .is_none()
        );

        // a High arrival takes the core; switching back restores the frame
        let urgent = spawn(&mut sched, Priority::High, AffinityMask::ALL);
        let switch = sched
            .schedule(cpu, ScheduleReason::Timer, Some((&frame, &fpu)))
            .unwrap();
        assert_eq!(switch.thread, urgent);
        assert!(switch.cr3.is_none());

        sched.pause(urgent).unwrap();
        let saved = (&SavedFrame::default(), &FpuArea::zeroed());
        let switch = sched
            .schedule(cpu, ScheduleReason::Timer, Some(saved))
            .unwrap();
        assert_eq!(switch.thread, boot_thread);
        assert_eq!(switch.context.frame, frame);
    }

    #[test]
    fn process_teardown_waits_for_members_to_leave_their_cores() {
        let mut sched = boot(1);
        let cpu = CpuId::BOOT;
        let process = sched.create_process(root(2));
        let first = member(&mut sched, process);
        let second = member(&mut sched, process);
        assert_eq!(slot(&mut sched, cpu), second);

        sched.terminate(first, 1).unwrap();
        sched.terminate_process(process, 9).unwrap();
        assert_eq!(sched.process_exit_code(process), Ok(Some(9)));
        assert_eq!(sched.thread_exit_code(second), Ok(Some(9)));
        // the individually-terminated member keeps its own code
        assert_eq!(sched.thread_exit_code(first), Ok(Some(1)));

        // `second` still sits on the core
        assert_eq!(
            sched.destroy_process(process),
            Err(ScheduleError::InvalidParameter)
        );
        let _ = sched.schedule(cpu, ScheduleReason::Requested, None);
        assert_eq!(sched.destroy_process(process), Ok(root(2)));
        assert_eq!(sched.process_root(process), Err(ScheduleError::NoSuchObject));
        assert_eq!(sched.thread_status(second), Err(ScheduleError::NoSuchObject));
        assert_eq!(sched.thread_count(), 1);
    }

    #[test]
    fn core_registrations_stop_at_the_limit() {
        let mut sched = Scheduler::new(root(1));
        for n in 0..u32::try_from(MAX_CPUS).unwrap() {
            sched
                .register_cpu(n, ThreadContext::default(), stack(u64::from(n)))
                .unwrap();
        }
        assert!(matches!(
            sched.register_cpu(999, ThreadContext::default(), stack(0)),
            Err(ScheduleError::InvalidParameter)
        ));
        assert_eq!(sched.cpus().count(), MAX_CPUS);
        assert!(matches!(
            sched.mark_online(CpuId::new(200)),
            Err(ScheduleError::NoSuchObject)
        ));
    }
}
