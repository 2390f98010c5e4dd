//! Boot-time diagnostics on the QEMU debug console.

use kernel_info::boot::{KernelBootInfo, MemoryRegion};
use kernel_qemu::QemuLogger;
use log::{LevelFilter, info};

/// Installs the QEMU console logger. Call once, before the first log
/// record fires; a second call is a silent no-op so panics during early
/// boot cannot recurse into it.
pub fn init() {
    let _ = QemuLogger::init(LevelFilter::Trace);
}

pub fn trace_boot_info(boot_info: &KernelBootInfo) {
    info!(
        concat!(
            "Boot Info in Kernel:\n",
            "  BI ptr      = {bi:#018x}\n",
            "  regions ptr = {regions_ptr:#018x}, len = {regions_len}\n",
            "  RSDP addr   = {rsdp_addr:#x}, CPU count hint = {cpu_count}"
        ),
        bi = core::ptr::from_ref(boot_info) as usize,
        regions_ptr = boot_info.mmap.regions_ptr,
        regions_len = boot_info.mmap.regions_len,
        rsdp_addr = boot_info.rsdp_addr,
        cpu_count = boot_info.cpu_count,
    );
}

pub fn trace_memory_map(regions: &[MemoryRegion]) {
    let mut usable = 0u64;
    for region in regions {
        info!(
            "  {:#014x}..{:#014x}  {:?}",
            region.base,
            region.end(),
            region.kind
        );
        if region.is_usable() {
            usable += region.length;
        }
    }
    info!("{} MiB usable RAM", usable >> 20);
}

pub fn log_ctrl_bits() {
    unsafe {
        let cr4: u64;
        core::arch::asm!("mov {}, cr4", out(reg) cr4, options(nostack, preserves_flags));
        let lo: u32;
        let hi: u32;
        core::arch::asm!(
            "rdmsr",
            in("ecx") 0xC000_0080u32,
            out("eax") lo,
            out("edx") hi,
            options(nostack, preserves_flags)
        );
        let efer = (u64::from(hi) << 32) | u64::from(lo);
        info!(
            "CR4={cr4:016x} (PGE={} OSFXSR={}) EFER={efer:016x} (NXE={})",
            (cr4 >> 7) & 1,
            (cr4 >> 9) & 1,
            (efer >> 11) & 1
        );
    }
}
