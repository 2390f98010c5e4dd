//! Page-fault entry: the hardware side of demand paging.
//!
//! Unlike the scheduling vectors the CPU pushes an error code here, so
//! the stack is not a plain `SavedFrame`; [`FaultFrame`] mirrors the
//! actual layout. Resolvable faults invalidate the TLB entry and retry
//! the instruction. An unresolvable user-mode fault kills the process;
//! an unresolvable kernel-mode fault is a kernel bug and panics.

use core::arch::naked_asm;

use kernel_memory_addresses::VirtualAddress;
use kernel_vmem::{FatalKind, FaultVerdict, PageFault, USER_FAULT_EXIT_CODE};
use log::warn;

pub const PAGE_FAULT_VECTOR: u8 = 0x0E;

pub fn install(idt: &mut crate::interrupts::Idt) {
    idt[usize::from(PAGE_FAULT_VECTOR)]
        .set_handler(page_fault_stub)
        .selector(crate::gdt::KERNEL_CS)
        .present(true)
        .gate_interrupt();
}

/// What the stub's pushes plus the CPU's frame leave on the stack.
#[repr(C)]
struct FaultFrame {
    r15: u64,
    r14: u64,
    r13: u64,
    r12: u64,
    r11: u64,
    r10: u64,
    r9: u64,
    r8: u64,
    rbp: u64,
    rdi: u64,
    rsi: u64,
    rdx: u64,
    rcx: u64,
    rbx: u64,
    rax: u64,
    error_code: u64,
    rip: u64,
    cs: u64,
    rflags: u64,
    rsp: u64,
    ss: u64,
}

extern "C" fn on_page_fault(frame: *const FaultFrame, cr2: u64) {
    // SAFETY: the stub passes its own stack frame; it lives until the
    // stub's iretq.
    let frame = unsafe { &*frame };
    let address = VirtualAddress::new(cr2);
    let fault = PageFault::from_error_code(address, frame.error_code);
    let current = crate::sched::current_process();

    match crate::vmem::handle_fault(fault, current) {
        FaultVerdict::ResolvedZeroFill | FaultVerdict::ResolvedFileRead | FaultVerdict::Retry => {
            crate::vmem::invlpg(address);
        }
        FaultVerdict::Fatal(kind) if fault.user => {
            warn!(
                "killing process {current:?}: unresolvable user fault at {address} ({kind:?}), rip {rip:#x}",
                rip = frame.rip
            );
            crate::sched::kill_current_process(USER_FAULT_EXIT_CODE);
        }
        FaultVerdict::Fatal(kind) => {
            kernel_fault_panic(frame, address, kind);
        }
    }
}

fn kernel_fault_panic(frame: &FaultFrame, address: VirtualAddress, kind: FatalKind) -> ! {
    panic!(
        "kernel page fault at {address} ({kind:?})\n\
         rip={rip:#018x} cs={cs:#06x} rflags={rflags:#010x}\n\
         rsp={rsp:#018x} ss={ss:#06x} error={error:#x}",
        rip = frame.rip,
        cs = frame.cs,
        rflags = frame.rflags,
        rsp = frame.rsp,
        ss = frame.ss,
        error = frame.error_code,
    );
}

#[unsafe(naked)]
extern "C" fn page_fault_stub() {
    // The error code sits between the pushed GPRs and the CPU frame;
    // the pushes below place rsp exactly at a FaultFrame. The extra
    // rsp adjustment around the call keeps the SysV 16-byte alignment
    // that the five-word frames get for free.
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
        "mov rsi, cr2",
        "cld",
        "sub rsp, 8",
        "call {handler}",
        "add rsp, 8",
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
        // Drop the error code.
        "add rsp, 8",
        "iretq",
        handler = sym on_page_fault,
    )
}
