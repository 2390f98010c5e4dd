//! # ACPI Table Discovery
//!
//! Minimal ACPI parsing for bring-up: walk from the firmware-provided RSDP
//! to the root table, then into the MADT to enumerate local APICs. That is
//! everything SMP start needs; no AML, no runtime ACPI.
//!
//! ## Table chain
//!
//! ```text
//! firmware handoff (RSDP address)
//!     ↓
//! RSDP / XSDP          "RSD PTR ", checksummed        [rsdp]
//!     ↓
//! RSDT or XSDT         32- or 64-bit entry pointers   [rsdp]
//!     ↓
//! MADT ("APIC")        local APIC + x2APIC entries    [madt]
//! ```
//!
//! ## Physical access
//!
//! Firmware tables live at physical addresses the parser cannot touch
//! directly. [`PhysMapRo`] abstracts the mapping; the kernel implements it
//! over its direct map, host tests over plain byte buffers.
//!
//! ## Trust model
//!
//! Firmware data is validated, not trusted: every table must carry its
//! signature and a zero byte-sum before any field is read, lengths are
//! bounds-checked, and malformed tables make parsing return `None` rather
//! than wander off.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

pub mod madt;
pub mod rsdp;
#[cfg(test)]
mod tests_support;

/// Map a physical region and return a *read-only* byte slice for its contents.
/// You provide the implementation (identity map, kmap, etc.).
pub trait PhysMapRo {
    /// # Safety
    /// The implementor must ensure the returned slice is valid for `len` bytes.
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8];
}

/// ACPI byte-sum; a valid table sums to zero over its full length.
fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |a, &b| a.wrapping_add(b))
}
