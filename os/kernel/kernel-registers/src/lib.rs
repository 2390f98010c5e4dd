//! # Typed x86-64 Registers
//!
//! Bitfield models of the control and model-specific registers the kernel
//! reads or writes, plus the two trait pairs through which every access
//! flows. The types themselves are plain data and test anywhere; the
//! `asm` feature adds the privileged `mov`/`rdmsr`/`wrmsr` accessors,
//! which only make sense in ring 0.
//!
//! Loads and stores are split into safe and unsafe flavors because some
//! registers (RFLAGS) are readable from any ring while others trap
//! outside CPL 0. A register implements the safe pair only when the
//! access itself can never fault; the blanket impls let generic code ask
//! for the unsafe pair regardless.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

#[cfg(feature = "cr3")]
pub mod cr3;

#[cfg(feature = "cr4")]
pub mod cr4;

#[cfg(feature = "efer")]
pub mod efer;

#[cfg(feature = "msr")]
pub mod msr;

#[cfg(feature = "rflags")]
pub mod rflags;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn store_unsafe(self);
}

pub trait LoadRegister {
    /// # Safety
    /// It is generally safe to load this register even from user mode.
    fn load() -> Self;
}

pub trait StoreRegister {
    /// # Safety
    /// It is generally safe to store this register even from user mode.
    fn store(self);
}

impl<T> LoadRegisterUnsafe for T
where
    T: LoadRegister,
{
    #[inline]
    unsafe fn load_unsafe() -> Self {
        <Self as LoadRegister>::load()
    }
}

impl<T> StoreRegisterUnsafe for T
where
    T: StoreRegister,
{
    #[inline]
    unsafe fn store_unsafe(self) {
        <Self as StoreRegister>::store(self);
    }
}
