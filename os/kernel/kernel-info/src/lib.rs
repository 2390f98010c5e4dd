//! # Kernel Configuration and Boot Interface
//!
//! This crate defines the memory layout constants, system-wide tunables, and
//! boot interface contracts that govern the kernel's initialization and
//! runtime operation. It is the authoritative source for configuration shared
//! between the loader, the kernel binary, and the kernel subsystem crates,
//! preventing configuration drift between components that must agree exactly.
//!
//! ## Architecture
//!
//! The crate is organized into two modules:
//!
//! ### Boot Information ([`boot`])
//! Defines the loader-to-kernel handoff interface:
//! * **Kernel Entry Point**: Function signature and calling convention
//! * **Boot Data Structures**: Normalized memory map, ACPI root pointer, CPU count
//! * **ABI Stability**: C-compatible structures with fixed-size integers
//!
//! ### Memory Layout ([`memory`])
//! Establishes the kernel's virtual memory architecture:
//! * **Address Space Layout**: User/kernel split and allocation scan floors
//! * **Higher Half Design**: Kernel execution at high virtual addresses
//! * **Physical Memory Mapping**: HHDM (Higher Half Direct Mapping) base
//! * **Tunables**: Stack size, scheduler tick rate, CPU ceiling
//!
//! ## Virtual Memory Architecture
//!
//! The kernel employs a higher-half design:
//!
//! ```text
//! Virtual Address Space Layout (64-bit):
//!
//! 0x0000_0000_0000_0000 ┌─────────────────────────────────┐
//!                       │      (null guard, unmapped)     │
//! USER_ALLOC_FLOOR      ├─────────────────────────────────┤ 0x0000_0000_0040_0000
//!                       │         User Space              │
//!                       │    (per-process, lower half)    │
//! USERSPACE_END         ├─────────────────────────────────┤ 0xffff_8000_0000_0000
//! HHDM_BASE             ├─────────────────────────────────┤ 0xffff_8880_0000_0000
//!                       │   Higher Half Direct Mapping    │
//!                       │   (Physical Memory Access)      │
//! KERNEL_BASE           ├─────────────────────────────────┤ 0xffff_ffff_8000_0000
//!                       │       Kernel Text & Data        │
//! KERNEL_ALLOC_FLOOR    ├─────────────────────────────────┤ 0xffff_ffff_9000_0000
//!                       │   Kernel Dynamic Allocations    │
//! 0xFFFF_FFFF_FFFF_FFFF └─────────────────────────────────┘
//! ```
//!
//! The kernel half (everything at or above `USERSPACE_END`) is shared by all
//! address spaces; the lower half is private to each process.
//!
//! ## Boot Protocol
//!
//! The loader parses whatever firmware handed it (memory map, ACPI pointers)
//! into the fixed [`boot::KernelBootInfo`] layout and calls the kernel entry
//! point with a single pointer to it:
//!
//! ```rust
//! # use kernel_info::boot::KernelBootInfo;
//! pub type KernelEntryFn = extern "sysv64" fn(*const KernelBootInfo) -> !;
//! ```
//!
//! The kernel assumes control permanently; there is no return path.
//!
//! ## Configuration Management
//!
//! All layout values are `const` and validated by `const _: ()` assertions,
//! so an edit that breaks an ordering or alignment constraint fails the build
//! instead of producing a kernel that faults at boot. The kernel's `build.rs`
//! additionally sources [`memory::KERNEL_BASE`] and [`memory::PHYS_LOAD`] to
//! configure the linker script.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
