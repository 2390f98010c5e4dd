//! Root System Description Pointer: the firmware handoff into ACPI.
//!
//! The RSDP is the one structure whose address the bootloader passes in;
//! everything else is reached through it. ACPI 1.0 ships a 20-byte variant
//! pointing at the RSDT; revision 2 extends it to 36 bytes with a 64-bit
//! XSDT pointer and a second checksum over the extension.

use log::trace;

use crate::{PhysMapRo, sum};

/// "RSD PTR " with the trailing space the specification insists on.
const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";

/// Length of the ACPI 1.0 structure and of the region its checksum covers.
const RSDP_V1_LEN: usize = 20;

/// Minimum length of the revision-2 structure.
const RSDP_V2_LEN: usize = 36;

/// Byte offsets into the RSDP.
const OFF_CHECKSUM_REGION: usize = 0;
const OFF_REVISION: usize = 15;
const OFF_RSDT_ADDR: usize = 16;
const OFF_LENGTH: usize = 20;
const OFF_XSDT_ADDR: usize = 24;

/// Validated root-table addresses extracted from the RSDP.
///
/// Prefer the XSDT when both are present; the RSDT is the 32-bit legacy
/// path kept for ACPI 1.0 firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcpiRoots {
    /// Physical address of the RSDT, if the firmware provides one.
    pub rsdt_addr: Option<u64>,
    /// Physical address of the XSDT; revision 2 and later only.
    pub xsdt_addr: Option<u64>,
}

impl AcpiRoots {
    /// Parses and validates the RSDP at `rsdp_addr`.
    ///
    /// Returns `None` when the signature or any applicable checksum fails,
    /// or when a revision-2 structure declares a nonsensical length.
    ///
    /// # Safety
    /// `rsdp_addr` must be the firmware-provided RSDP address, reachable
    /// through `mapper` for at least the structure's declared length.
    pub unsafe fn parse(mapper: &impl PhysMapRo, rsdp_addr: u64) -> Option<Self> {
        let head = unsafe { mapper.map_ro(rsdp_addr, RSDP_V1_LEN) };
        if head[..8] != RSDP_SIGNATURE {
            return None;
        }
        if sum(&head[OFF_CHECKSUM_REGION..RSDP_V1_LEN]) != 0 {
            return None;
        }

        let revision = head[OFF_REVISION];
        let rsdt_addr = u64::from(u32::from_le_bytes(
            head[OFF_RSDT_ADDR..OFF_RSDT_ADDR + 4].try_into().ok()?,
        ));
        let rsdt_addr = (rsdt_addr != 0).then_some(rsdt_addr);

        if revision < 2 {
            trace!("ACPI 1.0 RSDP, rsdt {rsdt_addr:#x?}");
            return Some(Self {
                rsdt_addr,
                xsdt_addr: None,
            });
        }

        // Revision 2: the structure carries its own length and a second
        // checksum covering all of it.
        let body = unsafe { mapper.map_ro(rsdp_addr, RSDP_V2_LEN) };
        let length = u32::from_le_bytes(body[OFF_LENGTH..OFF_LENGTH + 4].try_into().ok()?) as usize;
        if length < RSDP_V2_LEN {
            return None;
        }
        let full = unsafe { mapper.map_ro(rsdp_addr, length) };
        if sum(full) != 0 {
            return None;
        }
        let xsdt_addr = u64::from_le_bytes(body[OFF_XSDT_ADDR..OFF_XSDT_ADDR + 8].try_into().ok()?);
        let xsdt_addr = (xsdt_addr != 0).then_some(xsdt_addr);
        trace!("ACPI rev {revision} RSDP, rsdt {rsdt_addr:#x?}, xsdt {xsdt_addr:#x?}");

        Some(Self {
            rsdt_addr,
            xsdt_addr,
        })
    }
}
