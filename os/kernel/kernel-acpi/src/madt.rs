//! Multiple APIC Description Table: which processors exist.
//!
//! The MADT ("APIC") lists one entry per interrupt controller. Only the
//! processor entries matter here: type 0 carries an 8-bit local APIC id,
//! type 9 its x2APIC widening with 32-bit ids. Everything else (I/O APICs,
//! source overrides, NMI routing) is skipped over by length.

use alloc::vec::Vec;

use log::trace;

use crate::rsdp::AcpiRoots;
use crate::{PhysMapRo, sum};

/// Common system description table header length; the signature sits at
/// offset 0 and the full table length at offset 4.
const SDT_HEADER_LEN: usize = 36;
const SDT_OFF_LENGTH: usize = 4;

const MADT_SIGNATURE: [u8; 4] = *b"APIC";

/// MADT-specific fields right after the common header.
const MADT_OFF_LAPIC_ADDR: usize = SDT_HEADER_LEN;
const MADT_OFF_ENTRIES: usize = SDT_HEADER_LEN + 8;

/// Interrupt controller entry types carrying processors.
const ENTRY_LOCAL_APIC: u8 = 0;
const ENTRY_LOCAL_X2APIC: u8 = 9;

/// Entry flag bit 0: the processor is present and usable.
const FLAG_ENABLED: u32 = 1;

/// One processor's local APIC as the firmware reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalApic {
    /// APIC id, the IPI destination for this processor.
    pub apic_id: u32,
    /// Clear for sockets that are present but not usable.
    pub enabled: bool,
}

/// Parsed processor inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Madt {
    /// Physical MMIO base of the local APIC (xAPIC mode; x2APIC uses MSRs).
    pub lapic_phys: u64,
    /// Every processor entry, bootstrap processor included, in table order.
    pub cpus: Vec<LocalApic>,
}

impl Madt {
    /// Locates and parses the MADT below the given roots.
    ///
    /// The XSDT is preferred; the RSDT is the 32-bit fallback. Returns
    /// `None` when no valid MADT is reachable.
    ///
    /// # Safety
    /// The root tables and everything they point at must be reachable
    /// through `mapper`.
    pub unsafe fn parse(mapper: &impl PhysMapRo, roots: &AcpiRoots) -> Option<Self> {
        let table = unsafe { find_madt(mapper, roots) }?;
        Some(parse_entries(table))
    }
}

/// Maps a table's header, validates its length and checksum, and returns
/// the full table bytes.
unsafe fn checked_table(mapper: &impl PhysMapRo, addr: u64) -> Option<&'static [u8]> {
    let head = unsafe { mapper.map_ro(addr, SDT_HEADER_LEN) };
    let length =
        u32::from_le_bytes(head[SDT_OFF_LENGTH..SDT_OFF_LENGTH + 4].try_into().ok()?) as usize;
    if length < SDT_HEADER_LEN {
        return None;
    }
    let full = unsafe { mapper.map_ro(addr, length) };
    (sum(full) == 0).then_some(full)
}

/// Walks the root table for the "APIC" signature.
unsafe fn find_madt(mapper: &impl PhysMapRo, roots: &AcpiRoots) -> Option<&'static [u8]> {
    // (root address, pointer width) in preference order.
    let candidates = [
        (roots.xsdt_addr, size_of::<u64>()),
        (roots.rsdt_addr, size_of::<u32>()),
    ];
    for (root_addr, width) in candidates {
        let Some(root_addr) = root_addr else {
            continue;
        };
        let Some(root) = (unsafe { checked_table(mapper, root_addr) }) else {
            continue;
        };
        for entry in root[SDT_HEADER_LEN..].chunks_exact(width) {
            let addr = if width == size_of::<u64>() {
                u64::from_le_bytes(entry.try_into().ok()?)
            } else {
                u64::from(u32::from_le_bytes(entry.try_into().ok()?))
            };
            let Some(table) = (unsafe { checked_table(mapper, addr) }) else {
                continue;
            };
            if table[..4] == MADT_SIGNATURE {
                trace!("MADT at {addr:#x}, {} bytes", table.len());
                return Some(table);
            }
        }
    }
    None
}

/// Walks the variable-length entry list of a validated MADT.
fn parse_entries(table: &[u8]) -> Madt {
    let lapic_phys = u64::from(u32::from_le_bytes(
        table[MADT_OFF_LAPIC_ADDR..MADT_OFF_LAPIC_ADDR + 4]
            .try_into()
            .unwrap_or_default(),
    ));
    let mut cpus: Vec<LocalApic> = Vec::new();
    let mut push = |apic_id: u32, flags: u32| {
        // Firmware may list a processor both ways; the first entry wins.
        if cpus.iter().all(|cpu| cpu.apic_id != apic_id) {
            cpus.push(LocalApic {
                apic_id,
                enabled: flags & FLAG_ENABLED != 0,
            });
        }
    };

    let mut off = MADT_OFF_ENTRIES;
    while off + 2 <= table.len() {
        let kind = table[off];
        let len = table[off + 1] as usize;
        if len < 2 || off + len > table.len() {
            break;
        }
        let entry = &table[off..off + len];
        match kind {
            ENTRY_LOCAL_APIC if len >= 8 => {
                let flags = u32::from_le_bytes(entry[4..8].try_into().unwrap_or_default());
                push(u32::from(entry[3]), flags);
            }
            ENTRY_LOCAL_X2APIC if len >= 12 => {
                let apic_id = u32::from_le_bytes(entry[4..8].try_into().unwrap_or_default());
                let flags = u32::from_le_bytes(entry[8..12].try_into().unwrap_or_default());
                push(apic_id, flags);
            }
            _ => {}
        }
        off += len;
    }
    Madt { lapic_phys, cpus }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::TestFirmware;

    const BASE: u64 = 0x7FE0_0000;
    const XSDT_OFF: usize = 0x100;
    const MADT_OFF: usize = 0x200;

    /// Builds a table: common header with `sig`, then `payload`, length and
    /// checksum fixed up.
    fn table(sig: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0u8; SDT_HEADER_LEN];
        bytes[..4].copy_from_slice(sig);
        bytes.extend_from_slice(payload);
        let len = u32::try_from(bytes.len()).unwrap();
        bytes[SDT_OFF_LENGTH..SDT_OFF_LENGTH + 4].copy_from_slice(&len.to_le_bytes());
        let fix = sum(&bytes);
        bytes[9] = bytes[9].wrapping_sub(fix);
        bytes
    }

    fn lapic_entry(apic_id: u8, enabled: bool) -> Vec<u8> {
        let mut entry = vec![ENTRY_LOCAL_APIC, 8, 0, apic_id];
        entry.extend_from_slice(&u32::from(enabled).to_le_bytes());
        entry
    }

    fn x2apic_entry(apic_id: u32, enabled: bool) -> Vec<u8> {
        let mut entry = vec![ENTRY_LOCAL_X2APIC, 16, 0, 0];
        entry.extend_from_slice(&apic_id.to_le_bytes());
        entry.extend_from_slice(&u32::from(enabled).to_le_bytes());
        entry.extend_from_slice(&0u32.to_le_bytes());
        entry
    }

    /// Lays out an XSDT (pointing at `MADT_OFF`) plus the given MADT in one
    /// firmware buffer.
    fn firmware(madt: &[u8]) -> (TestFirmware, AcpiRoots) {
        let xsdt = table(b"XSDT", &(BASE + MADT_OFF as u64).to_le_bytes());
        let mut bytes = vec![0u8; 0x400];
        bytes[XSDT_OFF..XSDT_OFF + xsdt.len()].copy_from_slice(&xsdt);
        bytes[MADT_OFF..MADT_OFF + madt.len()].copy_from_slice(madt);
        let roots = AcpiRoots {
            rsdt_addr: None,
            xsdt_addr: Some(BASE + XSDT_OFF as u64),
        };
        (TestFirmware::at(BASE, bytes), roots)
    }

    fn madt_with(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        for entry in entries {
            payload.extend_from_slice(entry);
        }
        table(&MADT_SIGNATURE, &payload)
    }

    #[test]
    fn enumerates_processors_through_xsdt() {
        let madt = madt_with(&[
            lapic_entry(0, true),
            lapic_entry(1, true),
            lapic_entry(2, false),
            x2apic_entry(300, true),
        ]);
        let (fw, roots) = firmware(&madt);
        let parsed = unsafe { Madt::parse(&fw, &roots) }.unwrap();
        assert_eq!(parsed.lapic_phys, 0xFEE0_0000);
        assert_eq!(parsed.cpus.len(), 4);
        assert_eq!(
            parsed.cpus[2],
            LocalApic {
                apic_id: 2,
                enabled: false
            }
        );
        assert_eq!(
            parsed.cpus[3],
            LocalApic {
                apic_id: 300,
                enabled: true
            }
        );
    }

    #[test]
    fn rsdt_fallback_reaches_the_madt() {
        let madt = madt_with(&[lapic_entry(0, true)]);
        let rsdt = table(b"RSDT", &u32::try_from(BASE + MADT_OFF as u64).unwrap().to_le_bytes());
        let mut bytes = vec![0u8; 0x400];
        bytes[XSDT_OFF..XSDT_OFF + rsdt.len()].copy_from_slice(&rsdt);
        bytes[MADT_OFF..MADT_OFF + madt.len()].copy_from_slice(&madt);
        let fw = TestFirmware::at(BASE, bytes);
        let roots = AcpiRoots {
            rsdt_addr: Some(BASE + XSDT_OFF as u64),
            xsdt_addr: None,
        };
        let parsed = unsafe { Madt::parse(&fw, &roots) }.unwrap();
        assert_eq!(parsed.cpus.len(), 1);
    }

    #[test]
    fn duplicate_listings_collapse() {
        let madt = madt_with(&[lapic_entry(1, true), x2apic_entry(1, true)]);
        let (fw, roots) = firmware(&madt);
        let parsed = unsafe { Madt::parse(&fw, &roots) }.unwrap();
        assert_eq!(parsed.cpus.len(), 1);
    }

    #[test]
    fn absent_madt_is_none() {
        let other = table(b"HPET", &[0u8; 8]);
        let (fw, roots) = firmware(&other);
        assert_eq!(unsafe { Madt::parse(&fw, &roots) }, None);
    }

    #[test]
    fn corrupt_madt_is_none() {
        let mut madt = madt_with(&[lapic_entry(0, true)]);
        let last = madt.len() - 1;
        madt[last] ^= 0xFF;
        let (fw, roots) = firmware(&madt);
        assert_eq!(unsafe { Madt::parse(&fw, &roots) }, None);
    }

    #[test]
    fn truncated_entry_stops_the_walk() {
        // A declared entry length of 1 can never be valid; parsing must
        // stop without running past the table.
        let mut payload = Vec::new();
        payload.extend_from_slice(&0xFEE0_0000u32.to_le_bytes());
        payload.extend_from_slice(&1u32.to_le_bytes());
        payload.extend_from_slice(&lapic_entry(0, true));
        payload.extend_from_slice(&[ENTRY_LOCAL_APIC, 1]);
        let madt = table(&MADT_SIGNATURE, &payload);
        let (fw, roots) = firmware(&madt);
        let parsed = unsafe { Madt::parse(&fw, &roots) }.unwrap();
        assert_eq!(parsed.cpus.len(), 1);
    }
}
