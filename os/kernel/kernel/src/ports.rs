//! Legacy I/O port access.
//!
//! The x86 port space is separate from physical memory and reachable only
//! through `in`/`out`. The kernel touches it in exactly two places: PIT
//! programming during TSC calibration and the QEMU debug console.

/// Writes one byte to an I/O port.
///
/// # Safety
///
/// Requires CPL 0 (or I/O permission for `port`), and `port` must belong
/// to the intended device: a stray write can wedge a device or the
/// machine. `out` orders against other port I/O but is not a memory
/// fence.
#[inline]
pub unsafe fn outb(port: u16, val: u8) {
    unsafe {
        core::arch::asm!("out dx, al", in("dx") port, in("al") val, options(nomem, nostack, preserves_flags));
    }
}

/// Reads one byte from an I/O port.
///
/// # Safety
///
/// Same rules as [`outb`]: CPL 0 or I/O permission, and the port must be
/// a readable register of a present device.
#[inline]
pub unsafe fn inb(port: u16) -> u8 {
    let v: u8;
    unsafe {
        core::arch::asm!("in al, dx", in("dx") port, out("al") v, options(nomem, nostack, preserves_flags));
    }
    v
}
