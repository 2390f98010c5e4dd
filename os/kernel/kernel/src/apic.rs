//! Local APIC in x2APIC mode.
//!
//! x2APIC replaces the MMIO register window with MSRs, which removes the
//! need to map the LAPIC page and makes every access a single
//! `rdmsr`/`wrmsr`. The kernel requires x2APIC and panics without it;
//! the xAPIC compatibility path is not carried.
//!
//! This module owns the scheduler's interrupt sources: the periodic LVT
//! timer (calibrated against the TSC), the reschedule IPI, the NMI
//! broadcast behind `stop_cpus`, and the INIT-SIPI-SIPI sequence that
//! wakes application processors.

use crate::cpuid::has_x2apic;
use crate::interrupts::spurious::SPURIOUS_INTERRUPT_VECTOR;
use crate::interrupts::timer::LAPIC_TIMER_VECTOR;
use crate::tsc::rdtsc;
use kernel_info::memory::SCHEDULER_HZ;
use kernel_registers::msr::Msr;
use log::{debug, info};

const IA32_APIC_BASE: Msr = Msr(0x1B);
const APIC_GLOBAL_ENABLE: u64 = 1 << 11;
const APIC_X2_MODE: u64 = 1 << 10;

const X2APIC_ID: Msr = Msr(0x802);
const X2APIC_EOI: Msr = Msr(0x80B);
const X2APIC_SVR: Msr = Msr(0x80F);
const X2APIC_ICR: Msr = Msr(0x830);
const X2APIC_LVT_TIMER: Msr = Msr(0x832);
const X2APIC_TIMER_INITCNT: Msr = Msr(0x838);
const X2APIC_TIMER_CURRCNT: Msr = Msr(0x839);
const X2APIC_TIMER_DIVCONF: Msr = Msr(0x83E);

const LVT_MASKED: u64 = 1 << 16;
const LVT_PERIODIC: u64 = 1 << 17;

/// LAPIC divide configuration encodings.
mod divider {
    pub const DIV_16: u32 = 0b0011;
    /// Decrements per LAPIC clock at [`DIV_16`].
    pub const DIV_16_FACTOR: u64 = 16;
}

/// Enables x2APIC mode on the executing core and returns its APIC id.
///
/// # Safety
/// CPL 0. Panics if the CPU lacks x2APIC.
pub unsafe fn enable_and_read_id() -> u32 {
    unsafe {
        assert!(has_x2apic(), "x2APIC not supported on this CPU/VM");

        let base = IA32_APIC_BASE.load_raw() | APIC_GLOBAL_ENABLE | APIC_X2_MODE;
        IA32_APIC_BASE.store_raw(base);
        debug_assert!(
            IA32_APIC_BASE.load_raw() & APIC_X2_MODE != 0,
            "x2APIC mode did not latch"
        );

        // Software-enable through the spurious vector register.
        X2APIC_SVR.store_raw((1 << 8) | u64::from(SPURIOUS_INTERRUPT_VECTOR));

        apic_id()
    }
}

/// APIC id of the executing core.
#[inline]
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn apic_id() -> u32 {
    // SAFETY: x2APIC id reads are side-effect free once the mode is on.
    unsafe { X2APIC_ID.load_raw() as u32 }
}

/// Signals end-of-interrupt for the in-service vector.
///
/// # Safety
/// Only from an ISR whose vector was delivered by the LAPIC.
#[inline]
pub unsafe fn eoi() {
    unsafe { X2APIC_EOI.store_raw(0) };
}

/// Measures the LAPIC timer frequency against a TSC window and arms the
/// periodic scheduler tick at [`SCHEDULER_HZ`]. Returns the reload value
/// so the core can re-arm after masking.
///
/// # Safety
/// CPL 0, interrupts masked, the timer gate already installed.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn start_scheduler_timer(tsc_hz: u64) -> u32 {
    let lapic_hz = unsafe { calibrate_lapic_hz(tsc_hz, 50_000) };
    let initial = ((lapic_hz / divider::DIV_16_FACTOR) / SCHEDULER_HZ).max(1) as u32;
    info!("LAPIC timer: {lapic_hz} Hz, reload {initial} for {SCHEDULER_HZ} Hz tick");

    unsafe { arm_timer(initial) };
    initial
}

/// Programs the LVT timer periodic at `initial` decrements per fire.
///
/// # Safety
/// CPL 0 with the timer gate installed.
pub unsafe fn arm_timer(initial: u32) {
    unsafe {
        X2APIC_LVT_TIMER.store_raw(u64::from(LAPIC_TIMER_VECTOR) | LVT_PERIODIC | LVT_MASKED);
        X2APIC_TIMER_DIVCONF.store_raw(u64::from(divider::DIV_16));
        X2APIC_TIMER_INITCNT.store_raw(u64::from(initial));
        mask_timer(false);
    }
}

/// Masks or unmasks timer delivery without touching the count.
///
/// # Safety
/// CPL 0.
pub unsafe fn mask_timer(mask: bool) {
    unsafe {
        let mut lvt = X2APIC_LVT_TIMER.load_raw();
        if mask {
            lvt |= LVT_MASKED;
        } else {
            lvt &= !LVT_MASKED;
        }
        X2APIC_LVT_TIMER.store_raw(lvt);
    }
}

/// Counts LAPIC timer decrements across a `window_us` TSC busy-wait.
#[allow(clippy::cast_possible_truncation)]
unsafe fn calibrate_lapic_hz(tsc_hz: u64, window_us: u64) -> u64 {
    unsafe {
        // Count down from max, masked; the vector never fires.
        X2APIC_TIMER_DIVCONF.store_raw(u64::from(divider::DIV_16));
        X2APIC_LVT_TIMER.store_raw(LVT_MASKED | u64::from(SPURIOUS_INTERRUPT_VECTOR));
        X2APIC_TIMER_INITCNT.store_raw(0xFFFF_FFFF);

        let start = rdtsc();
        let target = start + (tsc_hz / 1_000_000) * window_us;
        while rdtsc() < target {
            core::hint::spin_loop();
        }

        let current = X2APIC_TIMER_CURRCNT.load_raw() as u32;
        X2APIC_TIMER_INITCNT.store_raw(0);

        let elapsed = 0xFFFF_FFFF_u64 - u64::from(current);
        let decrements_per_sec = elapsed * 1_000_000 / window_us;
        decrements_per_sec * divider::DIV_16_FACTOR
    }
}

// Interrupt command register fields (Intel SDM Vol. 3A, §10.12.9).
const ICR_DELIVERY_FIXED: u64 = 0b000 << 8;
const ICR_DELIVERY_NMI: u64 = 0b100 << 8;
const ICR_DELIVERY_INIT: u64 = 0b101 << 8;
const ICR_DELIVERY_STARTUP: u64 = 0b110 << 8;
const ICR_LEVEL_ASSERT: u64 = 1 << 14;
const ICR_ALL_EXCLUDING_SELF: u64 = 0b11 << 18;

#[inline]
unsafe fn write_icr(destination: u32, flags: u64) {
    // In x2APIC mode the ICR is one 64-bit MSR write; no delivery-status
    // polling is architected or needed.
    unsafe { X2APIC_ICR.store_raw((u64::from(destination) << 32) | flags) };
}

/// Sends a fixed-vector IPI to the core with `apic_id`.
///
/// # Safety
/// CPL 0; the target must have the vector's gate installed.
pub unsafe fn send_ipi(apic_id: u32, vector: u8) {
    unsafe { write_icr(apic_id, ICR_DELIVERY_FIXED | ICR_LEVEL_ASSERT | u64::from(vector)) };
}

/// Sends a fixed-vector IPI to every core except the sender.
///
/// # Safety
/// CPL 0; all online cores must have the vector's gate installed.
pub unsafe fn broadcast_ipi(vector: u8) {
    unsafe {
        write_icr(
            0,
            ICR_DELIVERY_FIXED | ICR_LEVEL_ASSERT | ICR_ALL_EXCLUDING_SELF | u64::from(vector),
        );
    }
}

/// Delivers an NMI to every core except the sender. Unmaskable; the
/// landing site is the NMI gate regardless of the receivers' IF.
///
/// # Safety
/// CPL 0. Receivers park forever; only for panic and shutdown paths.
pub unsafe fn broadcast_nmi() {
    unsafe { write_icr(0, ICR_DELIVERY_NMI | ICR_LEVEL_ASSERT | ICR_ALL_EXCLUDING_SELF) };
}

/// Runs INIT-SIPI-SIPI against one application processor.
///
/// `start_page` is the physical 4 KiB page number of the real-mode
/// trampoline (vector byte of the SIPI). Delays follow the MP spec
/// ballpark: 10 ms after INIT, 200 µs after each SIPI, implemented as
/// TSC busy-waits.
///
/// # Safety
/// CPL 0; the trampoline must be in place before the first SIPI.
pub unsafe fn start_ap(apic_id: u32, start_page: u8, tsc_hz: u64) {
    unsafe {
        write_icr(apic_id, ICR_DELIVERY_INIT | ICR_LEVEL_ASSERT);
        spin_us(10_000, tsc_hz);
        for _ in 0..2 {
            write_icr(
                apic_id,
                ICR_DELIVERY_STARTUP | ICR_LEVEL_ASSERT | u64::from(start_page),
            );
            spin_us(200, tsc_hz);
        }
    }
    debug!("INIT-SIPI-SIPI sent to APIC id {apic_id:#x}");
}

/// TSC busy-wait for about `us` microseconds.
pub fn spin_us(us: u64, tsc_hz: u64) {
    let target = rdtsc() + (tsc_hz / 1_000_000).max(1) * us;
    while rdtsc() < target {
        core::hint::spin_loop();
    }
}
