//! A hand-assembled ring-3 process.
//!
//! There is no program loader yet, so a few bytes of machine code stand
//! in for one. The payload walks the lifecycle end to end: its first
//! stack writes land on lazily reserved pages and get demand-committed,
//! the final null read is unresolvable and kills the process, and the
//! housekeeping thread then reaps the address space.

use kernel_memory_addresses::VirtualAddress;
use kernel_sched::Priority;
use kernel_vmem::{AccessOrigin, CommitPolicy, Protection, VmError};
use log::info;

use crate::sched::{self, SpawnError};
use crate::vmem;

/// ```asm
/// sub  rsp, 0x2000      ; cross a page boundary on the lazy stack
/// xor  eax, eax
/// mov  [rsp], rax       ; demand-commit the deep stack page
/// mov  rax, [rax]       ; null read: unresolvable, process is killed
/// ```
const PAYLOAD: [u8; 16] = [
    0x48, 0x81, 0xEC, 0x00, 0x20, 0x00, 0x00, // sub rsp, 0x2000
    0x31, 0xC0, // xor eax, eax
    0x48, 0x89, 0x04, 0x24, // mov [rsp], rax
    0x48, 0x8B, 0x00, // mov rax, [rax]
];

const USER_STACK_SIZE: u64 = 64 * 1024;

/// Builds and starts the demo process.
///
/// # Errors
/// [`SpawnError::OutOfMemory`] when the space or its pages cannot be
/// allocated.
pub fn spawn() -> Result<(), SpawnError> {
    let process = sched::create_process()?;

    let placed = vmem::with_process_space(process, |space, frames| {
        let code = space.allocate(
            None,
            PAYLOAD.len() as u64,
            Protection::USER_CODE,
            AccessOrigin::User,
            CommitPolicy::Eager,
            frames,
        )?;
        let stack = space.allocate(
            None,
            USER_STACK_SIZE,
            Protection::USER_DATA,
            AccessOrigin::User,
            CommitPolicy::Lazy,
            frames,
        )?;
        Ok::<_, VmError>((code, stack))
    })
    .expect("process space just registered");
    let (code, stack) = placed?;

    vmem::copy_to_process(
        process,
        code,
        VirtualAddress::from_ptr(PAYLOAD.as_ptr()),
        PAYLOAD.len() as u64,
    )
    .expect("process space just registered")?;

    let stack_top = VirtualAddress::new(stack.as_u64() + USER_STACK_SIZE);
    let thread = sched::spawn_user_thread(process, code, stack_top, 0, Priority::Low)?;
    info!("user demo: {process}, thread {thread}, entry {code}");
    Ok(())
}
