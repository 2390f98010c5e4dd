//! Debug output over QEMU's debug console.
//!
//! QEMU's `-debugcon` device captures every byte written to I/O port
//! `0x402` and forwards it to the host, which makes it the earliest
//! usable output channel: it works before paging, before the heap, and
//! before any device driver exists.
//!
//! ```text
//! log::info! ──► QemuLogger ──► QemuSink ──► out 0x402 ──► host stdio
//! qemu_trace! ─────────────────────┘
//! ```
//!
//! [`QemuLogger`] plugs the channel into the `log` crate; [`qemu_trace!`]
//! bypasses the logger for raw output from paths where the logger itself
//! is suspect (early boot, panic).
//!
//! With the `enabled` feature off, both compile to nothing. The port
//! write is harmless on real hardware, where `0x402` is typically
//! unclaimed, but there is no reason to pay for it outside the emulator.
//!
//! ```rust,no_run
//! use kernel_qemu::QemuLogger;
//! use log::LevelFilter;
//!
//! QemuLogger::init(LevelFilter::Trace).expect("no logger installed yet");
//! log::info!("hello from the guest");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod logger;

pub use logger::QemuLogger;

#[cfg(feature = "enabled")]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt::{self, Write};

    /// QEMU's debug console port.
    const QEMU_DEBUG_PORT: u16 = 0x402;

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn dbg_putc(c: u8) {
        unsafe { outb(QEMU_DEBUG_PORT, c) }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    unsafe fn outb(port: u16, val: u8) {
        unsafe {
            core::arch::asm!(
                "out dx, al",
                in("dx") port,
                in("al") val,
                options(nomem, preserves_flags)
            );
        }
    }

    /// Unbuffered `fmt::Write` over the debug port.
    pub struct QemuSink;

    impl Write for QemuSink {
        #[inline]
        fn write_str(&mut self, s: &str) -> fmt::Result {
            for b in s.bytes() {
                dbg_putc(b);
            }
            Ok(())
        }

        #[inline]
        fn write_char(&mut self, c: char) -> fmt::Result {
            // UTF-8 encode without allocation.
            let mut buf = [0u8; 4];
            let s = c.encode_utf8(&mut buf);
            self.write_str(s)
        }
    }

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(args: fmt::Arguments) {
        // Best-effort; the sink cannot fail anyway.
        let _ = fmt::write(&mut QemuSink, args);
    }
}

#[cfg(not(feature = "enabled"))]
#[doc(hidden)]
pub mod qemu_fmt {
    use core::fmt;

    #[doc(hidden)]
    #[inline(always)]
    #[allow(clippy::inline_always)]
    pub fn qemu_write(_: fmt::Arguments) {}
}

/// Writes directly to the debug console, skipping the `log` pipeline.
///
/// `format_args!` keeps this allocation-free, so it is safe to use from
/// panic and fault paths.
#[macro_export]
macro_rules! qemu_trace {
    ($($arg:tt)*) => {{
        $crate::qemu_fmt::qemu_write(core::format_args!($($arg)*));
    }};
}
