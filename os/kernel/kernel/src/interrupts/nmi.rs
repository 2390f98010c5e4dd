//! NMI: the all-stop vector.
//!
//! The panic path broadcasts an NMI to park every other core; the
//! handler never returns. IST 1 gives it a known-good stack even when
//! the interrupted flow had a corrupt one.

use core::arch::naked_asm;

pub const NMI_VECTOR: u8 = 0x02;

pub fn install(idt: &mut crate::interrupts::Idt) {
    idt[usize::from(NMI_VECTOR)]
        .set_handler(nmi_stub)
        .selector(crate::gdt::KERNEL_CS)
        .present(true)
        .ist(1)
        .gate_interrupt();
}

#[unsafe(naked)]
extern "C" fn nmi_stub() {
    naked_asm!(
        "cli",
        "2:",
        "hlt",
        "jmp 2b",
    )
}
