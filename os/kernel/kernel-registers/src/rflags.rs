#[cfg(feature = "asm")]
use crate::LoadRegister;
use bitfield_struct::bitfield;

/// RFLAGS as seen in 64-bit mode.
///
/// Bits that are architecturally fixed are modeled with
/// `#[bits(default = ..)]` and no setter, so a value built from
/// [`Rflags::new`] is already a legal image for an `iretq` frame.
#[bitfield(u64, order = Lsb)]
pub struct Rflags {
    /// Bit 0, CF: carry.
    pub cf_carry: bool,

    /// Bit 1, always reads as 1.
    #[bits(default = true)]
    _always1: bool,

    /// Bit 2, PF: parity.
    pub pf_parity: bool,

    /// Bit 3, reserved, zero.
    #[bits(default = false)]
    _rsvd3: bool,

    /// Bit 4, AF: auxiliary carry.
    pub af_adjust: bool,

    /// Bit 5, reserved, zero.
    #[bits(default = false)]
    _rsvd5: bool,

    /// Bit 6, ZF: zero.
    pub zf_zero: bool,

    /// Bit 7, SF: sign.
    pub sf_sign: bool,

    /// Bit 8, TF: single-step trap.
    pub tf_trap: bool,

    /// Bit 9, IF: maskable interrupts enabled.
    pub if_interrupt_enable: bool,

    /// Bit 10, DF: string operations go downward.
    pub df_direction: bool,

    /// Bit 11, OF: overflow.
    pub of_overflow: bool,

    /// Bits 12-13, IOPL: I/O privilege level.
    #[bits(2)]
    pub iopl: u8,

    /// Bit 14, NT: nested task.
    pub nt_nested: bool,

    /// Bit 15, reserved, zero.
    #[bits(default = false)]
    _rsvd15: bool,

    /// Bit 16, RF: resume, suppresses one instruction breakpoint.
    pub rf_resume: bool,

    /// Bit 17, VM: virtual-8086, zero in 64-bit mode.
    #[bits(default = false)]
    _vm: bool,

    /// Bit 18, AC: alignment check; also the SMAP override.
    pub ac_alignment_check: bool,

    /// Bit 19, VIF: virtual interrupt flag.
    pub vif_virtual_interrupt: bool,

    /// Bit 20, VIP: virtual interrupt pending.
    pub vip_virtual_interrupt_pending: bool,

    /// Bit 21, ID: CPUID toggle.
    pub id_cpuid: bool,

    /// Bits 22-63, reserved, zero.
    #[bits(42, default = false)]
    _reserved_rest: u64,
}

#[cfg(feature = "asm")]
impl LoadRegister for Rflags {
    fn load() -> Self {
        let rflags: u64;
        unsafe {
            core::arch::asm!(
                "pushfq",
                "pop {}",
                out(reg) rflags,
                options(nomem, preserves_flags)
            );
        }
        Self::from_bits(rflags)
    }
}
