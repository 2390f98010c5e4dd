//! # Kernel synchronization primitives
//!
//! Small building blocks used below the scheduler: a TATAS spin lock, an
//! interrupt-state guard, and a once cell for lazily initialized statics.
//! Everything here is safe to use before the scheduler exists; blocking
//! primitives that park threads live with the scheduler instead.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod spin_lock;
mod sync_once_cell;

pub use irq::{IrqGuard, IrqSpinGuard};
pub use spin_lock::{SpinLock, SpinLockGuard};
pub use sync_once_cell::SyncOnceCell;
