//! Local APIC timer: the periodic scheduling tick.
//!
//! The stub pushes the fifteen GPRs on top of the CPU's interrupt frame,
//! which makes `rsp` point at a complete [`SavedFrame`], and hands that
//! to the scheduler. When the scheduler picks someone else the call
//! never returns; otherwise the stub pops everything back and resumes
//! the interrupted thread.

use core::arch::naked_asm;

use kernel_sched::{SavedFrame, ScheduleReason};

pub const LAPIC_TIMER_VECTOR: u8 = 0xE0;

pub fn install(idt: &mut crate::interrupts::Idt) {
    idt[usize::from(LAPIC_TIMER_VECTOR)]
        .set_handler(timer_stub)
        .selector(crate::gdt::KERNEL_CS)
        .present(true)
        .gate_interrupt();
}

extern "C" fn on_timer(frame: *const SavedFrame) {
    // SAFETY: the stub passes its own stack frame; it lives until the
    // stub's iretq.
    let frame = unsafe { &*frame };
    crate::sched::preempt(frame, ScheduleReason::Timer);
}

#[unsafe(naked)]
extern "C" fn timer_stub() {
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
        handler = sym on_timer,
    )
}
