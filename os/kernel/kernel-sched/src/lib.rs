//! # Threads, Processes, and the Scheduler
//!
//! Preemptive priority scheduling over an arena of kernel-managed threads.
//!
//! ## What you get
//! - A [`Scheduler`] owning every thread, process, and per-core slot:
//!   creation, [adoption](Scheduler::adopt_current) of the boot flows into
//!   thread form, pause and resume, termination and reaping, and the
//!   [`schedule`](Scheduler::schedule) decision itself, which yields a
//!   [`Switch`] for the interrupt glue to enact.
//! - Thread state as plain data: the [`SavedFrame`] and [`FpuArea`] a trap
//!   captures, composed into a [`ThreadContext`], plus the packed
//!   [`ThreadStatus`] word and [`AffinityMask`].
//! - Polled blocking through [`BlockCondition`], and a blocking [`Mutex`]
//!   built on it behind the [`WaitSupport`] seam.
//!
//! ## Selection model
//!
//! Four priority classes, each a doubly linked run list threaded through
//! the thread arena:
//!
//! ```text
//! High(8)  →  Normal(4)  →  Low(2)  →  Idle(1)
//! ```
//!
//! The numeric value is the class quota: the number of scheduling slots a
//! thread may consume before it must wait for the next epoch. Classes are
//! scanned High first, each list tail to head, and the first eligible
//! thread wins, so a runnable High thread always beats Normal until its
//! quota runs out. When no thread is eligible anywhere, every counter
//! resets and the scan repeats; with one runnable thread per class an
//! epoch is therefore 8 High, 4 Normal, 2 Low and 1 Idle slot. Every core
//! registers a dedicated idle thread that serves as the fallback when even
//! the reset scan finds nothing to run.
//!
//! ## Blocking
//!
//! Blocked threads stay on their run lists. Each scheduling pass first
//! polls every parked [`BlockCondition`] and clears those that hold, then
//! selects. Wakeups are level-triggered with no wait queues to maintain,
//! at a per-tick cost linear in the number of blocked threads.
//!
//! ## Concurrency
//!
//! The scheduler itself carries no lock. The kernel wraps it in its spin
//! lock and calls in with interrupts off; host tests drive it directly.
//! Time is the global [`ticks`](Scheduler::ticks) counter, advanced by
//! every timer-driven pass on any core.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod arena;
mod cpu;
mod error;
mod mutex;
mod process;
mod queue;
mod scheduler;
mod thread;

pub use crate::cpu::{CpuId, CpuLocal};
pub use crate::error::{MutexError, ScheduleError};
pub use crate::mutex::{Mutex, WaitSupport};
pub use crate::process::ProcessId;
pub use crate::scheduler::{ScheduleReason, Scheduler, Switch};
pub use crate::thread::{
    AffinityMask, BlockCondition, FpuArea, NewThread, Priority, SavedFrame, ThreadContext,
    ThreadId, ThreadStatus, UnblockFn,
};
