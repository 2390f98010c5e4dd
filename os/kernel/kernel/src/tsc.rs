//! TSC frequency estimation for LAPIC timer calibration.
//!
//! The timer calibration in [`crate::apic`] measures LAPIC ticks against
//! a TSC window, so the TSC frequency must be known first. Detection
//! order: CPUID leaf 15h (exact crystal ratio), CPUID leaf 16h (base
//! frequency, usually right under KVM), PIT measurement (universal
//! fallback).

use crate::cpuid::{tsc_hz_from_leaf_15h, tsc_hz_from_leaf_16h};
use crate::ports::{inb, outb};

/// Reads the TSC, fenced so earlier loads cannot be reordered past it.
#[inline]
#[must_use]
pub fn rdtsc() -> u64 {
    let lo: u32;
    let hi: u32;
    unsafe {
        core::arch::asm!(
            "lfence",
            "rdtsc",
            out("eax") lo,
            out("edx") hi,
            options(nomem, nostack, preserves_flags),
        );
    }
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Best-effort TSC frequency in Hz.
///
/// # Safety
/// CPL 0; call with interrupts masked so the PIT fallback window is not
/// stretched by handler time.
pub unsafe fn estimate_tsc_hz() -> u64 {
    unsafe {
        if let Some(hz) = tsc_hz_from_leaf_15h() {
            return hz;
        }
        if let Some(hz) = tsc_hz_from_leaf_16h() {
            return hz;
        }
        pit_measure_tsc_hz(50_000)
    }
}

const PIT_CH0_DATA: u16 = 0x40;
const PIT_CMD: u16 = 0x43;
const PIT_INPUT_HZ: u64 = 1_193_182;

/// Measures the TSC delta across a PIT countdown of roughly `window_us`
/// microseconds. PIT channel 0 runs in mode 2 (rate generator) and is
/// polled via latch commands, so no IRQ 0 wiring is needed.
#[allow(clippy::cast_possible_truncation)]
unsafe fn pit_measure_tsc_hz(window_us: u64) -> u64 {
    let desired_ticks = (PIT_INPUT_HZ * window_us).div_ceil(1_000_000);
    let reload = desired_ticks.clamp(1, 0xFFFF) as u16;

    // Channel 0, lobyte/hibyte access, mode 2, binary.
    unsafe {
        outb(PIT_CMD, 0b0011_0100);
        outb(PIT_CH0_DATA, (reload & 0x00FF) as u8);
        outb(PIT_CH0_DATA, (reload >> 8) as u8);
    }

    let t0 = rdtsc();
    unsafe { busy_wait_pit_wrap(reload) };
    let t1 = rdtsc();

    let delta = t1.saturating_sub(t0);
    if window_us == 0 {
        return 0;
    }
    delta.saturating_mul(1_000_000) / window_us
}

/// Spins until the mode-2 counter wraps, i.e. one reload period elapsed.
unsafe fn busy_wait_pit_wrap(reload: u16) {
    let mut last = unsafe { read_pit_counter() };
    loop {
        let current = unsafe { read_pit_counter() };
        // The counter reloads on terminal count; a jump upward or a
        // value near either end means the period is over.
        if current > last || current <= 2 || current >= reload.saturating_sub(2) {
            break;
        }
        last = current;
        core::hint::spin_loop();
    }
}

#[inline]
unsafe fn read_pit_counter() -> u16 {
    unsafe {
        // Latch channel 0, then read low and high count bytes.
        outb(PIT_CMD, 0b0000_0000);
        let lo = u16::from(inb(PIT_CH0_DATA));
        let hi = u16::from(inb(PIT_CH0_DATA));
        (hi << 8) | lo
    }
}
