//! Spurious-interrupt vector, programmed into the APIC SVR.
//!
//! Spurious deliveries carry no in-service bit, so the handler must not
//! EOI. There is nothing to do at all.

use core::arch::naked_asm;

pub const SPURIOUS_INTERRUPT_VECTOR: u8 = 0xFF;

pub fn install(idt: &mut crate::interrupts::Idt) {
    idt[usize::from(SPURIOUS_INTERRUPT_VECTOR)]
        .set_handler(spurious_stub)
        .selector(crate::gdt::KERNEL_CS)
        .present(true)
        .gate_interrupt();
}

#[unsafe(naked)]
extern "C" fn spurious_stub() {
    naked_asm!("iretq")
}
