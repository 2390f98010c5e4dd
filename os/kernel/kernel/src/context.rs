//! Context save and restore glue.
//!
//! A thread's saved state is exactly what the interrupt stubs push: the
//! fifteen GPRs in [`SavedFrame`] order followed by the CPU's interrupt
//! return words, plus a 512-byte `fxsave` image. Restoring is therefore
//! `fxrstor`, point `rsp` at the frame, fifteen pops, `iretq` — the same
//! path resumes kernel threads, user threads, and threads that never ran
//! before.

use crate::gdt::{KERNEL_CS, KERNEL_DS, USER_CS, USER_DS};
use core::arch::naked_asm;
use kernel_memory_addresses::VirtualAddress;
use kernel_sched::{FpuArea, SavedFrame, ThreadContext};

// The restore path hard-codes these offsets.
const _: () = {
    assert!(size_of::<SavedFrame>() == 160);
    assert!(core::mem::offset_of!(ThreadContext, frame) == 0);
    assert!(core::mem::offset_of!(ThreadContext, fpu) == 160);
};

/// Initial context for a kernel thread: ring-0 selectors, entry in
/// `rip`, the argument in `rdi`.
#[must_use]
pub fn kernel_thread_context(
    entry: extern "C" fn(u64) -> !,
    stack_top: VirtualAddress,
    argument: u64,
) -> ThreadContext {
    let mut context =
        ThreadContext::starting_at(VirtualAddress::new(entry as usize as u64), stack_top, argument);
    context.frame.cs = u64::from(KERNEL_CS);
    context.frame.ss = u64::from(KERNEL_DS);
    context
}

/// Initial context for a user thread: RPL-3 selectors, so the `iretq` of
/// the first switch drops straight to CPL 3.
#[must_use]
pub fn user_thread_context(
    entry: VirtualAddress,
    stack_top: VirtualAddress,
    argument: u64,
) -> ThreadContext {
    let mut context = ThreadContext::starting_at(entry, stack_top, argument);
    context.frame.cs = u64::from(USER_CS);
    context.frame.ss = u64::from(USER_DS);
    context
}

/// Captures the executing core's FPU/SSE state.
///
/// # Safety
/// CPL 0 with CR4.OSFXSR set.
#[inline]
pub unsafe fn fxsave(area: &mut FpuArea) {
    unsafe {
        core::arch::asm!(
            "fxsave64 [{}]",
            in(reg) area.as_mut_ptr(),
            options(nostack, preserves_flags)
        );
    }
}

/// Resumes `context`, optionally switching CR3 first (`cr3` zero means
/// keep the current root). Never returns; ends in `iretq`.
///
/// The context must live in memory that stays valid while `rsp` points
/// into it — per-CPU staging, never a stack that another core could be
/// running on.
///
/// # Safety
/// CPL 0, interrupts masked. `TSS.RSP0` must already name the incoming
/// thread's kernel stack, and the frame's selectors must exist in the
/// live GDT.
#[unsafe(naked)]
pub unsafe extern "C" fn restore_context(context: *const ThreadContext, cr3: u64) -> ! {
    naked_asm!(
        "test rsi, rsi",
        "jz 2f",
        "mov cr3, rsi",
        "2:",
        "fxrstor64 [rdi + 160]",
        // The saved frame becomes the stack: fifteen pops, then the CPU
        // unwinds rip/cs/rflags/rsp/ss itself.
        "mov rsp, rdi",
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
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn entry(_: u64) -> ! {
        unreachable!()
    }

    #[test]
    fn kernel_context_uses_ring0_selectors() {
        let top = VirtualAddress::new(0xFFFF_FFFF_9000_8000);
        let context = kernel_thread_context(entry, top, 7);
        assert_eq!(context.frame.cs, u64::from(KERNEL_CS));
        assert_eq!(context.frame.ss, u64::from(KERNEL_DS));
        assert_eq!(context.frame.rdi, 7);
        assert_eq!(context.frame.rsp, top.as_u64() - 8);
        assert_eq!(context.frame.rflags & 0x200, 0x200);
    }

    #[test]
    fn user_context_uses_rpl3_selectors() {
        let context = user_thread_context(
            VirtualAddress::new(0x40_1000),
            VirtualAddress::new(0x50_0000),
            0,
        );
        assert_eq!(context.frame.cs & 3, 3);
        assert_eq!(context.frame.ss & 3, 3);
    }
}
