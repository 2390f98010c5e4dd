//! Shared test double: firmware tables in a plain buffer.

use crate::PhysMapRo;

/// A span of "physical" memory holding hand-built ACPI tables.
pub(crate) struct TestFirmware {
    base: u64,
    bytes: Vec<u8>,
}

impl TestFirmware {
    pub(crate) fn at(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    pub(crate) fn base(&self) -> u64 {
        self.base
    }
}

impl PhysMapRo for TestFirmware {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        let off = usize::try_from(paddr - self.base).unwrap();
        assert!(
            off + len <= self.bytes.len(),
            "table read past the end of the firmware buffer"
        );
        // The buffer outlives every parse in a test body.
        unsafe { core::slice::from_raw_parts(self.bytes.as_ptr().add(off), len) }
    }
}
