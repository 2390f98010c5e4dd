use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// CR4: paging and protection feature toggles.
///
/// The bits the kernel actually flips live here (`PGE`, `OSFXSR`,
/// `SMEP`, `SMAP`); the rest are carried so a raw dump stays readable.
#[bitfield(u64, order = Lsb)]
pub struct Cr4 {
    /// Bit 0, VME: Virtual-8086 mode extensions.
    pub vme: bool,

    /// Bit 1, PVI: protected-mode virtual interrupts.
    pub pvi: bool,

    /// Bit 2, TSD: RDTSC/RDTSCP restricted to CPL 0.
    pub tsd: bool,

    /// Bit 3, DE: debugging extensions.
    pub de: bool,

    /// Bit 4, PSE: page size extensions (32-bit paging only).
    pub pse: bool,

    /// Bit 5, PAE: physical address extension.
    ///
    /// Always set in long mode.
    pub pae: bool,

    /// Bit 6, MCE: machine-check enable.
    pub mce: bool,

    /// Bit 7, PGE: global pages survive CR3 writes.
    pub pge: bool,

    /// Bit 8, PCE: RDPMC allowed outside CPL 0.
    pub pce: bool,

    /// Bit 9, OSFXSR: FXSAVE/FXRSTOR and SSE enabled.
    pub osfxsr: bool,

    /// Bit 10, OSXMMEXCPT: unmasked SIMD FP exceptions delivered as #XM.
    pub osxmmexcpt: bool,

    /// Bit 11, UMIP: SGDT/SIDT and friends faulted outside CPL 0.
    pub umip: bool,

    /// Bit 12, LA57: 5-level paging.
    pub la57: bool,

    /// Bit 13, VMXE: VMX enable.
    pub vmxe: bool,

    /// Bit 14, SMXE: SMX enable.
    pub smxe: bool,

    /// Bit 15, reserved, must be zero.
    #[bits(access = RO)]
    pub reserved0: bool,

    /// Bit 16, FSGSBASE: {RD,WR}{FS,GS}BASE allowed in CPL > 0.
    pub fsgsbase: bool,

    /// Bit 17, PCIDE: process-context identifiers.
    pub pcide: bool,

    /// Bit 18, OSXSAVE: XSAVE/XRSTOR and XCR0 enabled.
    pub osxsave: bool,

    /// Bit 19, reserved, must be zero.
    #[bits(access = RO)]
    pub reserved1: bool,

    /// Bit 20, SMEP: supervisor execution of user pages faults.
    pub smep: bool,

    /// Bit 21, SMAP: supervisor access to user pages faults unless AC set.
    pub smap: bool,

    /// Bit 22, PKE: protection keys.
    pub pke: bool,

    /// Bits 23-63, reserved.
    #[bits(41, access = RO)]
    pub reserved2: u64,
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr4 {
    unsafe fn load_unsafe() -> Self {
        let cr4: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr4)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr4 {
    unsafe fn store_unsafe(self) {
        let cr4 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) cr4, options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_bits_match_the_manual() {
        let cr4 = Cr4::new().with_smep(true).with_smap(true).with_pge(true);
        assert_eq!(cr4.into_bits(), (1 << 20) | (1 << 21) | (1 << 7));
    }
}
