use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A cell that is written at most once and readable from any context after.
///
/// Used for kernel statics that need runtime construction (allocator state,
/// scheduler tables) where `static mut` would be unsound. Losers of the
/// initialization race spin until the winner publishes, so `get_or_init`
/// must not be called re-entrantly from an interrupt handler that could
/// preempt the initializer on the same CPU.
pub struct SyncOnceCell<T> {
    /// [`UNINIT`] -> [`INITING`] -> [`READY`], never backwards.
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if already initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        (self.state.load(Ordering::Acquire) == READY)
            // SAFETY: READY guarantees the write is done
            .then(|| unsafe { self.value_ref() })
    }

    /// Initialize at most once and return `&T`.
    ///
    /// Exactly one caller runs `init`; concurrent callers spin until the
    /// value is published.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let v = init();
            unsafe {
                (*self.value.get()).write(v);
            }
            // Publish the value before marking READY.
            self.state.store(READY, Ordering::Release);
            // SAFETY: just wrote it
            return unsafe { self.value_ref() };
        }

        self.wait_ready()
    }

    /// Spins until another initializer reaches READY.
    fn wait_ready(&self) -> &T {
        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY
        unsafe { self.value_ref() }
    }

    /// # Safety
    /// Caller must have observed `READY` with acquire ordering.
    unsafe fn value_ref(&self) -> &T {
        unsafe { &*(*self.value.get()).as_ptr() }
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}
