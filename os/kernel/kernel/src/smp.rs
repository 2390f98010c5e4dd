//! Application-processor bring-up.
//!
//! APs wake in 16-bit real mode at a SIPI vector, so a tiny trampoline
//! is copied to [`vmem::TRAMPOLINE_PHYS`] in identity-mapped low memory.
//! It switches straight from real mode to long mode (PAE and LME before
//! the single CR0 write that sets PE and PG together, as the SDM
//! permits), loads a stack and jumps into [`ap_entry`].
//!
//! Everything the trampoline cannot carry position-independently lives
//! in a mailbox at fixed offsets inside the trampoline page, patched by
//! the BSP through the direct map before each INIT-SIPI-SIPI. Cores are
//! started one at a time with a ready handshake, so a single handoff
//! slot suffices.

use core::arch::global_asm;
use core::sync::atomic::{AtomicBool, Ordering};

use kernel_acpi::PhysMapRo;
use kernel_acpi::madt::Madt;
use kernel_acpi::rsdp::AcpiRoots;
use kernel_info::boot::KernelBootInfo;
use kernel_info::memory::{HHDM_BASE, MAX_CPUS};
use kernel_memory_addresses::{PhysicalPage, VirtualAddress};
use kernel_sched::Priority;
use kernel_sync::SpinLock;
use log::{info, warn};

use crate::per_cpu::PerCpu;
use crate::vmem::TRAMPOLINE_PHYS;
use crate::{apic, gdt, interrupts, msr, per_cpu, sched, vmem};

// Mailbox slots, offsets from the trampoline base.
const MAILBOX_CR3: u64 = 8;
const MAILBOX_RSP: u64 = 16;
const MAILBOX_ENTRY: u64 = 24;
const MAILBOX_ARG: u64 = 32;

global_asm!(
    r#"
.balign 16
.global ap_trampoline_start
.global ap_trampoline_end
ap_trampoline_start:
.code16
    jmp 3f

    // Mailbox: cr3, stack top, entry, argument. Offsets 8/16/24/32.
    .balign 8
    .quad 0
    .quad 0
    .quad 0
    .quad 0

3:
    cli
    cld
    xor ax, ax
    mov ds, ax

    lgdt [0x8000 + ap_gdtr_offset]

    // CR4.PAE | CR4.PGE
    mov eax, cr4
    or eax, 0xA0
    mov cr4, eax

    mov eax, dword ptr [0x8008]
    mov cr3, eax

    // EFER.LME | EFER.NXE
    mov ecx, 0xC0000080
    rdmsr
    or eax, 0x900
    wrmsr

    // CR0.PG | CR0.PE in one write: real mode to long mode directly.
    mov eax, cr0
    or eax, 0x80000001
    mov cr0, eax

    // Far jump with a 32-bit offset into the 64-bit code segment.
    .byte 0x66, 0xEA
    .long 0x8000 + (5f - ap_trampoline_start)
    .word 0x08

.code64
5:
    mov ax, 0x10
    mov ds, ax
    mov es, ax
    mov ss, ax
    mov rsp, qword ptr [0x8010]
    mov rax, qword ptr [0x8018]
    mov rdi, qword ptr [0x8020]
    xor ebp, ebp
    jmp rax

    // Minimal flat GDT; each core replaces it with its own in ap_entry.
    .balign 8
9:
    .word (8f - 7f) - 1
    .long 0x8000 + (7f - ap_trampoline_start)
    .balign 8
7:
    .quad 0
    .quad 0x00209A0000000000
    .quad 0x0000920000000000
8:
ap_trampoline_end:
.equ ap_gdtr_offset, 9b - ap_trampoline_start
.code64
"#
);

unsafe extern "C" {
    static ap_trampoline_start: u8;
    static ap_trampoline_end: u8;
}

/// What the BSP leaves for the AP currently being started.
struct Handoff {
    stack_top: VirtualAddress,
    nmi_stack_top: VirtualAddress,
    timer_initial: u32,
}

static HANDOFF: SpinLock<Option<Handoff>> = SpinLock::new(None);
static AP_READY: AtomicBool = AtomicBool::new(false);

/// Reads ACPI tables through the direct map.
struct HhdmAcpiMapper;

impl PhysMapRo for HhdmAcpiMapper {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        // SAFETY: per the caller's contract the region is real physical
        // memory, which the direct map covers.
        unsafe { core::slice::from_raw_parts((HHDM_BASE + paddr) as *const u8, len) }
    }
}

/// Copies the trampoline into its page and stores the shared CR3.
unsafe fn install_trampoline(kernel_root: PhysicalPage) {
    // SAFETY: the symbols bound the blob emitted above; only their
    // addresses are taken.
    let (start, end) = unsafe {
        (
            (&raw const ap_trampoline_start) as u64,
            (&raw const ap_trampoline_end) as u64,
        )
    };
    let len = (end - start) as usize;
    assert!(len <= 0xF00, "trampoline outgrew its page");

    let dst = (HHDM_BASE + TRAMPOLINE_PHYS) as *mut u8;
    // SAFETY: the trampoline page is reserved low memory, identity-mapped
    // in the kernel root and covered by the direct map.
    unsafe {
        core::ptr::copy_nonoverlapping(start as *const u8, dst, len);
        mailbox_write(MAILBOX_CR3, kernel_root.base().as_u64());
    }
}

unsafe fn mailbox_write(offset: u64, value: u64) {
    // SAFETY: within the trampoline page; volatile because an AP reads
    // it outside the Rust memory model.
    unsafe {
        ((HHDM_BASE + TRAMPOLINE_PHYS + offset) as *mut u64).write_volatile(value);
    }
}

/// Enumerates processors from the MADT and starts every enabled AP,
/// one at a time. `timer_initial` is the BSP-calibrated LAPIC reload
/// value each AP arms for itself.
pub unsafe fn start_aps(
    boot_info: &KernelBootInfo,
    kernel_root: PhysicalPage,
    tsc_hz: u64,
    timer_initial: u32,
) {
    if boot_info.rsdp_addr == 0 {
        warn!("no RSDP from the loader; staying single-core");
        return;
    }
    let mapper = HhdmAcpiMapper;
    // SAFETY: the RSDP address comes from firmware via the loader and the
    // direct map reaches all of physical memory.
    let Some(roots) = (unsafe { AcpiRoots::parse(&mapper, boot_info.rsdp_addr) }) else {
        warn!("invalid RSDP; staying single-core");
        return;
    };
    // SAFETY: same mapping argument as above.
    let Some(madt) = (unsafe { Madt::parse(&mapper, &roots) }) else {
        warn!("no MADT; staying single-core");
        return;
    };

    // SAFETY: the trampoline page is unused and the root is the live one.
    unsafe { install_trampoline(kernel_root) };

    let bsp_apic_id = PerCpu::current().apic_id;
    let mut index = 1usize;
    for cpu in &madt.cpus {
        if !cpu.enabled || cpu.apic_id == bsp_apic_id {
            continue;
        }
        if index >= MAX_CPUS {
            warn!("ignoring APIC id {:#x}: core limit reached", cpu.apic_id);
            continue;
        }
        // SAFETY: sequential bring-up; the previous AP has taken its
        // handoff before the next one is prepared.
        if unsafe { start_one(cpu.apic_id, index, tsc_hz, timer_initial) } {
            index += 1;
        }
    }
    info!("{index} core(s) online");
}

/// Starts a single AP and waits for its ready signal. Returns whether
/// the core came up.
unsafe fn start_one(apic_id: u32, index: usize, tsc_hz: u64, timer_initial: u32) -> bool {
    let Ok(stack_top) = vmem::alloc_kernel_stack() else {
        warn!("no stack for APIC id {apic_id:#x}; skipping");
        return false;
    };
    let Ok(nmi_stack_top) = vmem::alloc_kernel_stack() else {
        warn!("no NMI stack for APIC id {apic_id:#x}; skipping");
        return false;
    };

    *HANDOFF.lock() = Some(Handoff {
        stack_top,
        nmi_stack_top,
        timer_initial,
    });
    AP_READY.store(false, Ordering::SeqCst);

    // SAFETY: the trampoline is installed; the AP is not running yet.
    unsafe {
        mailbox_write(MAILBOX_RSP, stack_top.as_u64());
        mailbox_write(MAILBOX_ENTRY, ap_entry as usize as u64);
        mailbox_write(MAILBOX_ARG, index as u64);
        #[allow(clippy::cast_possible_truncation)]
        apic::start_ap(apic_id, (TRAMPOLINE_PHYS >> 12) as u8, tsc_hz);
    }

    // Generous deadline; QEMU APs are up within a few milliseconds.
    for _ in 0..1000 {
        if AP_READY.load(Ordering::SeqCst) {
            return true;
        }
        apic::spin_us(1000, tsc_hz);
    }
    warn!("APIC id {apic_id:#x} did not report in; continuing without it");
    false
}

/// First Rust code on an AP, entered from the trampoline on the stack
/// the BSP provided, interrupts masked.
extern "C" fn ap_entry(index: u64) -> ! {
    let handoff = HANDOFF
        .lock()
        .take()
        .expect("AP started without a handoff");

    // SAFETY: the BSP hands each AP a distinct index; nothing else
    // touches this block.
    let percpu = unsafe { per_cpu::block(index as usize) };
    // SAFETY: the block is static and this core owns it from here on.
    unsafe {
        msr::init_gs_bases(percpu);
        gdt::init_gdt_and_tss(percpu, handoff.stack_top, handoff.nmi_stack_top);
        interrupts::init_and_load();
    }
    // SAFETY: CPL 0, IA32_APIC_BASE is per-core.
    let apic_id = unsafe { apic::enable_and_read_id() };
    percpu.apic_id = apic_id;
    percpu.timer_initial = handoff.timer_initial;

    let cpu = sched::register_core(apic_id);
    percpu.cpu = cpu;
    // The bring-up flow itself keeps running as a low-priority thread;
    // all it ever does after this point is halt.
    sched::adopt_boot_flow(cpu, Priority::Low, handoff.stack_top);
    sched::mark_online(cpu);

    // SAFETY: the IDT gate for the timer vector is live.
    unsafe { apic::arm_timer(handoff.timer_initial) };
    AP_READY.store(true, Ordering::SeqCst);

    sched::idle_loop(0)
}
