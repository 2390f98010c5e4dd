//! Injects the linker script for bare-metal targets. Host builds (tests)
//! link normally.

use kernel_info::memory::{KERNEL_BASE, PHYS_LOAD};

fn main() {
    println!("cargo:rerun-if-changed=kernel.ld");
    let target_os = std::env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if target_os != "none" {
        return;
    }
    let dir = std::env::var("CARGO_MANIFEST_DIR").expect("cargo sets CARGO_MANIFEST_DIR");
    println!("cargo:rustc-link-arg=-T{dir}/kernel.ld");
    // The script and the kernel share one source of truth for the layout.
    println!("cargo:rustc-link-arg=--defsym=KERNEL_BASE={KERNEL_BASE:#x}");
    println!("cargo:rustc-link-arg=--defsym=PHYS_LOAD={PHYS_LOAD:#x}");
}
