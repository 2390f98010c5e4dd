use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;

/// EFER (MSR `0xC000_0080`): long mode and NX control.
///
/// The loader leaves `LME`/`LMA` set; the kernel reads this register to
/// confirm the state it inherited and to verify `NXE` before handing
/// no-execute mappings to the paging code.
#[bitfield(u64, order = Lsb)]
#[derive(Eq, PartialEq)]
pub struct Efer {
    /// Bit 0, SCE: SYSCALL/SYSRET enable.
    pub sce: bool,

    /// Bit 1, DPE: data prefetch enable (AMD K6 only).
    pub dpe: bool,

    /// Bit 2, SEWBED: speculative EWBE# disable (AMD K6 only).
    pub sewbed: bool,

    /// Bit 3, GEWBED: global EWBE# disable (AMD K6 only).
    pub gewbed: bool,

    /// Bit 4, L2D: L2 cache disable (AMD K6 only).
    pub l2d: bool,

    /// Bits 5-7, reserved, must be written as zero.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 8, LME: long mode enable.
    pub lme: bool,

    /// Bit 9, reserved.
    #[bits(access = RO)]
    pub reserved1: bool,

    /// Bit 10, LMA: long mode active.
    ///
    /// Read-only in effect; set by the CPU once paging enables long mode.
    pub lma: bool,

    /// Bit 11, NXE: no-execute bit honored in page tables.
    pub nxe: bool,

    /// Bit 12, SVME: secure virtual machine enable (AMD).
    pub svme: bool,

    /// Bit 13, LMSLE: long mode segment limit enable.
    pub lmsle: bool,

    /// Bit 14, FFXSR: fast FXSAVE/FXRSTOR.
    pub ffxsr: bool,

    /// Bit 15, TCE: translation cache extension.
    pub tce: bool,

    /// Bit 16, reserved.
    pub reserved2: bool,

    /// Bit 17, MCOMMIT: MCOMMIT instruction enable (AMD).
    pub mcommit: bool,

    /// Bit 18, INTWB: interruptible WBINVD/WBNOINVD enable (AMD).
    pub intwb: bool,

    /// Bit 19, reserved.
    pub reserved3: bool,

    /// Bit 20, UAIE: upper address ignore enable.
    pub uaie: bool,

    /// Bit 21, AIBRSE: automatic IBRS enable.
    pub aibrse: bool,

    /// Bits 22-63, reserved.
    #[bits(42, access = RO)]
    pub reserved4: u64,
}

impl Efer {
    /// MSR index of EFER.
    pub const MSR_EFER: u32 = 0xC000_0080;
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Efer {
    unsafe fn load_unsafe() -> Self {
        let (lo, hi): (u32, u32);
        unsafe {
            core::arch::asm!(
                "rdmsr",
                in("ecx") Self::MSR_EFER,
                out("eax") lo,
                out("edx") hi,
                options(nomem, preserves_flags)
            );
        }
        let efer = u64::from(hi) << 32 | u64::from(lo);
        Self::from_bits(efer)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Efer {
    unsafe fn store_unsafe(self) {
        let efer = self.into_bits();
        let lo = efer as u32;
        let hi = (efer >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "wrmsr",
                in("ecx") Self::MSR_EFER,
                in("eax") lo,
                in("edx") hi,
                options(nomem, preserves_flags)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_mode_and_nx_bits_match_the_manual() {
        let efer = Efer::new().with_lme(true).with_lma(true).with_nxe(true);
        assert_eq!(efer.into_bits(), (1 << 8) | (1 << 10) | (1 << 11));
    }
}
