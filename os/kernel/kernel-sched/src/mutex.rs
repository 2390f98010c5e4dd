//! Blocking mutex composed with the scheduler's polled wait states.
//!
//! Acquisition is a compare-exchange; a contended `lock` gives the core
//! away through [`WaitSupport::wait`] instead of burning it. In the kernel
//! that parks the thread with a condition watching the lock word; before
//! the scheduler exists an implementation that merely spins is enough, and
//! the same code degenerates gracefully.
//!
//! The lock keeps no waiter queue. Released waiters re-compete on their
//! next pass, which matches the scheduler's polled blocking design.

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::error::MutexError;
use crate::thread::{BlockCondition, ThreadId};

/// Value of the packed owner word while nobody holds the lock. No real
/// [`ThreadId`] packs to this.
const NO_OWNER: u64 = u64::MAX;

/// Spin/block hybrid lock with recorded ownership.
///
/// The holder's [`ThreadId`] is recorded at acquisition so a non-owner
/// `unlock` can be refused. Once [abandoned](Self::abandon) the lock never
/// locks again and waiters fail out; because waiters poll the lock words
/// by address, the mutex storage must outlive every thread parked on it.
#[derive(Debug)]
pub struct Mutex {
    locked: AtomicBool,
    abandoned: AtomicBool,
    /// Packed id of the holder, [`NO_OWNER`] when free or when the lock
    /// was taken before the scheduler existed.
    owner: AtomicU64,
}

/// Environment the mutex waits through.
///
/// The kernel implements this over its scheduler lock and reschedule
/// vector; host tests drive it directly.
pub trait WaitSupport {
    /// Identity of the executing thread; `None` before the scheduler runs.
    fn current_thread(&self) -> Option<ThreadId>;

    /// Global scheduler tick count.
    fn now(&self) -> u64;

    /// Gives the core away until the condition may hold, or just briefly.
    fn wait(&mut self, condition: BlockCondition);
}

impl Mutex {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            abandoned: AtomicBool::new(false),
            owner: AtomicU64::new(NO_OWNER),
        }
    }

    /// Single acquisition attempt.
    ///
    /// Re-acquiring a lock the caller already holds is a no-op success, not
    /// a deadlock.
    ///
    /// # Errors
    /// - [`MutexError::Abandoned`] once the lock has been abandoned.
    /// - [`MutexError::Locked`] while another thread holds it.
    pub fn try_lock(&self, current: Option<ThreadId>) -> Result<(), MutexError> {
        if self.abandoned.load(Ordering::Acquire) {
            return Err(MutexError::Abandoned);
        }
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let owner = current.map_or(NO_OWNER, ThreadId::pack);
            self.owner.store(owner, Ordering::Release);
            return Ok(());
        }
        if let Some(current) = current
            && self.owner.load(Ordering::Acquire) == current.pack()
        {
            return Ok(());
        }
        Err(MutexError::Locked)
    }

    /// Acquires the lock, waiting while it is contended.
    ///
    /// `timeout` bounds the wait in scheduler ticks; `None` waits without
    /// bound, accepting the liveness risk documented for polled blocking.
    ///
    /// # Errors
    /// - [`MutexError::Timeout`] when the deadline passes first.
    /// - [`MutexError::Abandoned`] when the lock is abandoned meanwhile.
    pub fn lock<W: WaitSupport>(
        &self,
        support: &mut W,
        timeout: Option<u64>,
    ) -> Result<(), MutexError> {
        let deadline = timeout.map(|ticks| support.now().saturating_add(ticks));
        loop {
            match self.try_lock(support.current_thread()) {
                Ok(()) => return Ok(()),
                Err(MutexError::Abandoned) => return Err(MutexError::Abandoned),
                Err(_) => {}
            }
            if deadline.is_some_and(|deadline| support.now() >= deadline) {
                return Err(MutexError::Timeout);
            }
            // SAFETY: `self` outlives the wait; this frame borrows it until
            // the thread resumes and the loop retries.
            let condition = unsafe { self.block_condition(deadline) };
            support.wait(condition);
        }
    }

    /// Releases the lock. Parked waiters notice on their next poll; there
    /// is no direct hand-off.
    ///
    /// # Errors
    /// [`MutexError::AccessDenied`] when ownership was recorded for a
    /// different thread. The lock state is unchanged in that case.
    pub fn unlock(&self, current: Option<ThreadId>) -> Result<(), MutexError> {
        let owner = self.owner.load(Ordering::Acquire);
        if owner != NO_OWNER && current.is_none_or(|current| current.pack() != owner) {
            return Err(MutexError::AccessDenied);
        }
        self.owner.store(NO_OWNER, Ordering::Release);
        self.locked.store(false, Ordering::Release);
        Ok(())
    }

    /// Whether the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Tells every waiter the lock is going away.
    ///
    /// Waiters fail their acquire with [`MutexError::Abandoned`]; the flag
    /// never clears. The storage must stay valid until all of them have
    /// observed it. Dropping the mutex abandons it implicitly.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::Release);
    }

    /// Wake condition for a thread parking on this lock: ready when the
    /// lock is observed free or abandoned, or at `wake_tick`.
    ///
    /// # Safety
    /// The condition captures the mutex by address and the scheduler polls
    /// it from arbitrary cores. The mutex must outlive every thread parked
    /// through the returned condition.
    #[must_use]
    pub unsafe fn block_condition(&self, wake_tick: Option<u64>) -> BlockCondition {
        BlockCondition::new(Self::poll_ready, core::ptr::from_ref(self) as u64, wake_tick)
    }

    /// [`UnblockFn`](crate::UnblockFn) over a packed `*const Mutex`.
    #[allow(clippy::cast_possible_truncation)]
    fn poll_ready(userdata: u64, _now: u64) -> bool {
        // SAFETY: `block_condition` requires the mutex to outlive the wait.
        let mutex = unsafe { &*(userdata as usize as *const Self) };
        !mutex.locked.load(Ordering::Acquire) || mutex.abandoned.load(Ordering::Acquire)
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        self.abandon();
    }
}
