//! Interrupt-state control and interrupt-safe locking.
//!
//! A spin lock taken from both thread context and an interrupt handler
//! deadlocks if the handler fires while the thread holds the lock on the
//! same CPU. [`SpinLock::lock_irq`] closes that window by disabling
//! interrupts for the lifetime of the guard.

use crate::{SpinLock, SpinLockGuard};
use core::ops::{Deref, DerefMut};

/// `IF` flag in `RFLAGS`: interrupts enabled when set.
const RFLAGS_IF: u64 = 1 << 9;

/// Disables hardware interrupts (`cli`).
///
/// # Privilege
///
/// Must only be called in contexts where `cli` is permitted, i.e. ring 0.
#[inline]
pub fn cli_stop_interrupts() {
    unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
}

/// Enables hardware interrupts (`sti`).
///
/// # Privilege
///
/// Must only be called in contexts where `sti` is permitted, i.e. ring 0.
#[inline]
pub fn sti_enable_interrupts() {
    unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit. If interrupts were enabled it
/// executes `cli`; on drop it executes `sti` only if they were previously
/// enabled, preserving the original state. Guards nest correctly because the
/// inner guard observes `IF=0` and restores nothing.
///
/// # Privilege
///
/// Requires ring 0. The `pushfq` itself is harmless in user mode but the
/// paired `cli`/`sti` are not.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the
    /// prior state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = (rflags() & RFLAGS_IF) != 0;
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}

/// A [`SpinLockGuard`] that also holds interrupts disabled.
///
/// Created via [`SpinLock::lock_irq`]. The interrupt state is saved and
/// interrupts are disabled *before* the lock is taken, and both are undone
/// in reverse order on drop. Field order matters: the lock guard drops
/// first, then interrupts are restored.
pub struct IrqSpinGuard<'a, T> {
    guard: SpinLockGuard<'a, T>,
    _irq: IrqGuard,
}

impl<T> SpinLock<T> {
    /// Acquires the lock with interrupts disabled for the guard's lifetime.
    ///
    /// Any lock shared with an interrupt handler must be taken this way in
    /// thread context; handlers themselves may use plain [`SpinLock::lock`]
    /// since they already run with interrupts masked.
    #[inline]
    pub fn lock_irq(&self) -> IrqSpinGuard<'_, T> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqSpinGuard { guard, _irq: irq }
    }
}

impl<T> Deref for IrqSpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for IrqSpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
