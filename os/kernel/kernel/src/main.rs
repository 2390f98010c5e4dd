//! # Kernel Entry Point
//!
//! Bring-up order matters and is easy to get wrong, so `kernel_entry`
//! reads as the checklist: logging, then the address space (which
//! switches CR3 and feeds the allocators), then the BSP's per-CPU state,
//! GDT/TSS and IDT, the x2APIC, the scheduler, the timer, and finally
//! the other cores. Once interrupts open up the boot flow demotes itself
//! to the housekeeping thread.

#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]
#![allow(unsafe_code)]

extern crate alloc;

mod apic;
mod context;
mod cpuid;
mod gdt;
mod interrupts;
mod msr;
mod per_cpu;
mod ports;
mod sched;
mod smp;
mod storage;
mod tracing;
mod tsc;
mod tss;
mod user_demo;
mod vmem;

use kernel_alloc::KernelHeap;

/// The kernel heap. Empty until [`vmem::init`] donates its first region;
/// nothing heap-backed may run before that.
#[cfg_attr(target_os = "none", global_allocator)]
static HEAP: KernelHeap = KernelHeap::empty();

#[cfg(target_os = "none")]
mod boot {
    use core::sync::atomic::{AtomicBool, Ordering};

    use kernel_info::boot::KernelBootInfo;
    use kernel_info::memory::SCHEDULER_HZ;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_sched::{Mutex, Priority, WaitSupport};
    use log::{debug, error, info, warn};

    use crate::sched::SchedulerWait;
    use crate::{apic, gdt, interrupts, msr, per_cpu, sched, smp, tracing, tsc, vmem};

    const BOOT_STACK_SIZE: usize = 64 * 1024;

    #[repr(align(16))]
    struct Aligned<const N: usize>([u8; N]);

    /// The BSP's boot stack, used until the flow is adopted as a thread
    /// and kept as that thread's kernel stack afterwards.
    #[unsafe(link_section = ".bss.boot")]
    static mut BOOT_STACK: Aligned<BOOT_STACK_SIZE> = Aligned([0; BOOT_STACK_SIZE]);

    /// Set once the BSP's x2APIC is enabled; before that the panic path
    /// must not touch APIC MSRs.
    static APIC_LIVE: AtomicBool = AtomicBool::new(false);

    /// Ticks between housekeeping rounds: one second.
    const HOUSEKEEPING_TICKS: u64 = SCHEDULER_HZ;

    /// Ticks between heartbeats: five seconds.
    const HEARTBEAT_TICKS: u64 = 5 * SCHEDULER_HZ;

    /// The loader jumps here with the boot info pointer in `rdi` per the
    /// `sysv64` entry contract. Naked so the first instructions run on
    /// the loader's stack only long enough to install our own.
    #[unsafe(no_mangle)]
    #[unsafe(naked)]
    pub extern "sysv64" fn _start(_boot_info: *const KernelBootInfo) -> ! {
        core::arch::naked_asm!(
            "cli",
            "lea rax, [rip + {stack}]",
            "add rax, {size}",
            "and rax, -16",
            "mov rsp, rax",
            "xor ebp, ebp",
            // A call, not a jump: entry expects rsp % 16 == 8.
            "call {entry}",
            "2:",
            "cli",
            "hlt",
            "jmp 2b",
            stack = sym BOOT_STACK,
            size = const BOOT_STACK_SIZE,
            entry = sym kernel_entry,
        )
    }

    fn boot_stack_top() -> VirtualAddress {
        let base = (&raw const BOOT_STACK) as u64;
        VirtualAddress::new((base + BOOT_STACK_SIZE as u64) & !0xF)
    }

    extern "C" fn kernel_entry(boot_info: *const KernelBootInfo) -> ! {
        tracing::init();
        info!("kernel starting");
        // SAFETY: the loader passes a valid structure, reachable through
        // its boot mappings and later through the direct map.
        let boot_info = unsafe { &*boot_info };
        tracing::trace_boot_info(boot_info);

        // SAFETY: single-threaded boot path, interrupts masked, called
        // exactly once.
        unsafe { vmem::init(boot_info) };
        tracing::log_ctrl_bits();
        // SAFETY: the direct map now covers the loader's region array.
        tracing::trace_memory_map(unsafe { vmem::regions(boot_info) });

        let stack_top = boot_stack_top();
        let nmi_stack_top = vmem::alloc_kernel_stack().expect("no memory for the BSP NMI stack");

        // SAFETY: index 0 is the BSP's block; nothing else runs yet.
        let percpu = unsafe { per_cpu::block(0) };
        // SAFETY: CPL 0, the block is static, interrupts stay masked
        // until the scheduler is ready.
        unsafe {
            msr::init_gs_bases(percpu);
            gdt::init_gdt_and_tss(percpu, stack_top, nmi_stack_top);
            interrupts::init_and_load();
        }
        // SAFETY: CPL 0; the IDT covers the spurious vector.
        let apic_id = unsafe { apic::enable_and_read_id() };
        percpu.apic_id = apic_id;
        APIC_LIVE.store(true, Ordering::SeqCst);

        // SAFETY: CPL 0; falls back to PIT calibration when CPUID is mute.
        let tsc_hz = unsafe { tsc::estimate_tsc_hz() };
        info!("TSC at ~{} MHz", tsc_hz / 1_000_000);

        let kernel_root = vmem::kernel_root();
        sched::init(kernel_root);
        let cpu = sched::register_core(apic_id);
        percpu.cpu = cpu;
        sched::adopt_boot_flow(cpu, Priority::Normal, stack_top);
        sched::mark_online(cpu);

        // SAFETY: the timer gate is installed; interrupts are still
        // masked, so the first tick waits for the sti below.
        let timer_initial = unsafe { apic::start_scheduler_timer(tsc_hz) };
        percpu.timer_initial = timer_initial;

        // SAFETY: boot info is live and the trampoline page is reserved.
        unsafe { smp::start_aps(boot_info, kernel_root, tsc_hz, timer_initial) };

        for worker in 0..2 {
            sched::spawn_kernel_thread(heartbeat, worker, Priority::Normal)
                .expect("spawning a heartbeat thread");
        }
        if let Err(error) = crate::user_demo::spawn() {
            warn!("user demo did not start: {error}");
        }

        kernel_sync::irq::sti_enable_interrupts();
        info!("boot complete, entering housekeeping");
        loop {
            sched::reap_exited();
            sched::sleep_ticks(HOUSEKEEPING_TICKS);
        }
    }

    static HEARTBEAT_LOCK: Mutex = Mutex::new();
    static mut HEARTBEATS: u64 = 0;

    /// Periodic liveness report. Two of these run concurrently and
    /// serialize on the blocking mutex.
    extern "C" fn heartbeat(worker: u64) -> ! {
        let mut wait = SchedulerWait;
        loop {
            sched::sleep_ticks(HEARTBEAT_TICKS);
            if HEARTBEAT_LOCK.lock(&mut wait, Some(SCHEDULER_HZ)).is_err() {
                continue;
            }
            // SAFETY: guarded by HEARTBEAT_LOCK.
            let count = unsafe {
                let beats = &raw mut HEARTBEATS;
                *beats += 1;
                *beats
            };
            debug!(
                "worker {worker}: heartbeat {count}, {} frames free, {} heap bytes free",
                vmem::free_frames(),
                crate::HEAP.free_bytes()
            );
            let _ = HEARTBEAT_LOCK.unlock(wait.current_thread());
        }
    }

    #[panic_handler]
    fn panic(info: &core::panic::PanicInfo) -> ! {
        error!("kernel panic: {info}");
        if APIC_LIVE.load(Ordering::SeqCst) {
            sched::stop_other_cores();
        }
        loop {
            // SAFETY: parking the core is all that is left to do.
            unsafe {
                core::arch::asm!("cli", "hlt", options(nomem, nostack, preserves_flags));
            }
        }
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    // The kernel only runs on bare metal; the host build exists for
    // `cargo test`.
}
