//! 64-bit Task State Segment.
//!
//! Long mode no longer task-switches through the TSS, but the CPU still
//! reads it on every ring transition: `rsp0` becomes the stack when an
//! interrupt arrives from CPL 3, and a non-zero IST index in an IDT gate
//! selects one of `ist1..ist7` unconditionally. The scheduler rewrites
//! `rsp0` on every context switch so each thread traps onto its own
//! kernel stack.

use kernel_memory_addresses::VirtualAddress;

/// The 64-bit TSS layout per Intel SDM Vol. 3A, §8.7.
///
/// `packed` because the architecture places the 64-bit stack pointers on
/// 4-byte boundaries. All reserved fields must stay zero.
#[repr(C, packed)]
pub struct Tss64 {
    _reserved0: u32,

    /// Stack loaded on a transition to CPL 0. The context switch keeps
    /// this pointing at the top of the current thread's kernel stack.
    pub rsp0: VirtualAddress,
    /// CPL 1 stack; unused, rings 1 and 2 never run.
    pub rsp1: VirtualAddress,
    /// CPL 2 stack; unused.
    pub rsp2: VirtualAddress,

    _reserved1: u64,

    /// Interrupt Stack Table. Slot 1 backs the NMI gate so a core can be
    /// stopped even when its kernel stack is the thing that broke.
    pub ist1: VirtualAddress,
    pub ist2: VirtualAddress,
    pub ist3: VirtualAddress,
    pub ist4: VirtualAddress,
    pub ist5: VirtualAddress,
    pub ist6: VirtualAddress,
    pub ist7: VirtualAddress,

    _reserved2: u64,
    _reserved3: u16,

    /// Offset of the I/O permission bitmap; the size of the TSS means
    /// "no bitmap", denying all user port I/O.
    pub iopb_offset: u16,
}

impl Tss64 {
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new() -> Self {
        Self {
            _reserved0: 0,
            rsp0: VirtualAddress::NULL,
            rsp1: VirtualAddress::NULL,
            rsp2: VirtualAddress::NULL,
            _reserved1: 0,
            ist1: VirtualAddress::NULL,
            ist2: VirtualAddress::NULL,
            ist3: VirtualAddress::NULL,
            ist4: VirtualAddress::NULL,
            ist5: VirtualAddress::NULL,
            ist6: VirtualAddress::NULL,
            ist7: VirtualAddress::NULL,
            _reserved2: 0,
            _reserved3: 0,
            iopb_offset: size_of::<Self>() as u16,
        }
    }
}

impl Default for Tss64 {
    fn default() -> Self {
        Self::new()
    }
}

// The architectural size of the 64-bit TSS.
const _: () = assert!(size_of::<Tss64>() == 104);

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[test]
    fn architectural_field_offsets() {
        assert_eq!(offset_of!(Tss64, rsp0), 4);
        assert_eq!(offset_of!(Tss64, ist1), 36);
        assert_eq!(offset_of!(Tss64, iopb_offset), 102);
    }

    #[test]
    fn fresh_tss_disables_the_io_bitmap() {
        let tss = Tss64::new();
        assert_eq!({ tss.iopb_offset }, 104);
    }
}
