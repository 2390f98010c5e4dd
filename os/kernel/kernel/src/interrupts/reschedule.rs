//! Reschedule request vector, reached by self-IPI or cross-core IPI.
//!
//! Same shape as the timer path but files the pass as
//! [`ScheduleReason::Requested`], so it never advances the tick count.

use core::arch::naked_asm;

use kernel_sched::{SavedFrame, ScheduleReason};

pub const RESCHEDULE_VECTOR: u8 = 0xE1;

pub fn install(idt: &mut crate::interrupts::Idt) {
    idt[usize::from(RESCHEDULE_VECTOR)]
        .set_handler(reschedule_stub)
        .selector(crate::gdt::KERNEL_CS)
        .present(true)
        .gate_interrupt();
}

extern "C" fn on_reschedule(frame: *const SavedFrame) {
    // SAFETY: the stub passes its own stack frame; it lives until the
    // stub's iretq.
    let frame = unsafe { &*frame };
    crate::sched::preempt(frame, ScheduleReason::Requested);
}

#[unsafe(naked)]
extern "C" fn reschedule_stub() {
    naked_asm!(
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        "mov rdi, rsp",
        "cld",
        "call {handler}",
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        "iretq",
        handler = sym on_reschedule,
    )
}
