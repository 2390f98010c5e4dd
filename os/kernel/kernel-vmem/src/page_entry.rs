//! Hardware page-table entries and the software view layered on top.
//!
//! [`PageEntryBits`] is the raw 64-bit entry shared by all four paging
//! levels. [`LeafState`] is the only software meaning a managed leaf entry
//! can carry, and [`LeafState::encode`] / [`LeafState::decode`] are the
//! single place where that meaning is marshalled to and from raw bits.
//! Everything above this module works in terms of [`LeafState`] and
//! [`Protection`](crate::Protection), never bit positions.

use crate::Protection;
use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

/// A single 64-bit x86-64 page table entry in its raw bitfield form.
///
/// Models the common superset of fields across all four levels (PML4E,
/// PDPTE, PDE, PTE).
///
/// ### Bit layout
///
/// | Bits      | Name / Mnemonic   | Meaning |
/// |-----------|-------------------|----------|
/// | 0         | `P` (present)     | Valid entry if set |
/// | 1         | `RW`              | Writable if set |
/// | 2         | `US`              | User-mode accessible if set |
/// | 3         | `PWT`             | Write-through caching |
/// | 4         | `PCD`             | Disable caching |
/// | 5         | `A`               | Accessed |
/// | 6         | `D`               | Dirty (leaf only) |
/// | 7         | `PS`              | Large page flag |
/// | 8         | `G`               | Global (leaf only) |
/// | 9–11      | OS avail low      | Reserved for OS use |
/// | 12–51     | `addr`            | Physical frame bits [51:12] |
/// | 52–58     | OS avail high     | Reserved for OS use |
/// | 59–62     | `PKU` / OS use    | Protection key or OS use |
/// | 63        | `NX`              | Execute disable |
///
/// The OS-available ranges carry the lazy-reservation marker and the stashed
/// protection flags; see [`LeafState`] for the encoding.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageEntryBits {
    /// Present (P, bit 0). Clear means the CPU faults on access.
    pub present: bool,

    /// Writable (RW, bit 1).
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Set to allow user-mode access.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6). Set by the CPU on first write, leaf only.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// Valid in PDPTE (1 GiB leaf) and PDE (2 MiB leaf). Must stay clear in
    /// PML4E and PTE. Managed ranges use 4 KiB pages exclusively; large
    /// pages appear only in the boot-time direct map.
    pub large_page: bool,

    /// Global (G, bit 8). TLB entry survives CR3 reloads, leaf only.
    pub global_translation: bool,

    /// OS-available (bits 9..=11). Carries the lazy-reservation marker.
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical address bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58). Carries stashed [`Protection`] flags for
    /// reserved-but-uncommitted leaf entries.
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection Key (PKU, bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntryBits {
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        // store bits [51:12]
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// A non-leaf entry linking `table` into its parent.
    ///
    /// Intermediate links are always present and writable; effective
    /// permissions are decided at the leaf. `user` must be set for any
    /// subtree that will ever hold user-accessible leaves, since the US bit
    /// is ANDed across the walk.
    #[inline]
    #[must_use]
    pub const fn link(table: PhysicalPage, user: bool) -> Self {
        let mut e = Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(user);
        e.set_physical_address(table.base());
        e
    }

    /// Whether the entry is all zeroes, i.e. carries no mapping and no
    /// reservation.
    #[inline]
    #[must_use]
    pub const fn is_unused(&self) -> bool {
        self.into_bits() == 0
    }
}

/// Marker in `os_available_low` distinguishing a lazy reservation from a
/// plain unmapped entry. Both have `present=0`.
const LAZY_MARKER: u8 = 0b001;

/// Software meaning of a managed 4 KiB leaf entry.
///
/// The hardware `present` bit and the OS-available marker bits partition
/// leaf entries into exactly three states. The stashed protection of a
/// [`LeafState::LazyReserved`] entry records what the page must commit with
/// when it is first touched.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LeafState {
    /// No mapping and no reservation.
    Unmapped,
    /// Backed by a physical frame, visible to the CPU.
    Committed {
        frame: PhysicalPage,
        protection: Protection,
    },
    /// Reserved with intended protection, not yet backed. The CPU faults on
    /// access; the fault path commits the page.
    LazyReserved { protection: Protection },
}

impl LeafState {
    /// Marshal to the raw hardware layout.
    #[must_use]
    pub const fn encode(self) -> PageEntryBits {
        match self {
            Self::Unmapped => PageEntryBits::new(),
            Self::Committed { frame, protection } => {
                let mut e = PageEntryBits::new()
                    .with_present(true)
                    .with_writable(protection.writable())
                    .with_user_access(protection.user())
                    .with_cache_disabled(protection.cache_disabled())
                    .with_no_execute(!protection.executable());
                e.set_physical_address(frame.base());
                e
            }
            Self::LazyReserved { protection } => PageEntryBits::new()
                .with_os_available_low(LAZY_MARKER)
                .with_os_available_high(protection.into_bits() & 0x7F),
        }
    }

    /// Recover the software meaning from raw bits.
    #[must_use]
    pub const fn decode(e: PageEntryBits) -> Self {
        if e.present() {
            Self::Committed {
                frame: PhysicalPage::containing(e.physical_address()),
                protection: Protection::new()
                    .with_writable(e.writable())
                    .with_user(e.user_access())
                    .with_cache_disabled(e.cache_disabled())
                    .with_executable(!e.no_execute()),
            }
        } else if e.os_available_low() & LAZY_MARKER != 0 {
            Self::LazyReserved {
                protection: Protection::from_bits(e.os_available_high()),
            }
        } else {
            Self::Unmapped
        }
    }

    /// The protection this leaf carries, if any.
    #[must_use]
    pub const fn protection(self) -> Option<Protection> {
        match self {
            Self::Unmapped => None,
            Self::Committed { protection, .. } | Self::LazyReserved { protection } => {
                Some(protection)
            }
        }
    }
}

/// One 4 KiB paging structure: 512 entries, used at every level of the walk.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; 512],
}

const _: () = assert!(core::mem::size_of::<PageTable>() == 4096);

impl PageTable {
    /// Entries per table.
    pub const LEN: usize = 512;

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageEntryBits {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageEntryBits) {
        self.entries[index] = entry;
    }

    /// Clear every entry. Fresh table frames must pass through this before
    /// they are linked, since frames come back from the allocator with stale
    /// contents.
    #[inline]
    pub fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); 512];
    }

    /// Whether no entry carries a mapping or reservation.
    ///
    /// This is the conservative reclamation test: a table is released only
    /// when all 512 entries are literally zero.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(PageEntryBits::is_unused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lazy_reservation_is_invisible_to_the_cpu_but_not_to_us() {
        let prot = Protection::USER_DATA;
        let bits = LeafState::LazyReserved { protection: prot }.encode();

        // the CPU must fault on any access
        assert!(!bits.present());
        // but the entry is not unused, so allocation scans skip it
        assert!(!bits.is_unused());

        match LeafState::decode(bits) {
            LeafState::LazyReserved { protection } => assert_eq!(protection, prot),
            other => panic!("decoded as {other:?}"),
        }
    }

    #[test]
    fn committed_entry_translates_protection_to_hardware_bits() {
        let frame = PhysicalPage::containing(PhysicalAddress::new(0x5555_0000));
        let bits = LeafState::Committed {
            frame,
            protection: Protection::USER_CODE,
        }
        .encode();

        assert!(bits.present());
        assert!(!bits.writable());
        assert!(bits.user_access());
        assert!(!bits.no_execute(), "executable page must not be NX");
        assert_eq!(bits.physical_address(), frame.base());
        assert!(!bits.large_page());
    }

    #[test]
    fn unmapped_is_all_zero() {
        assert_eq!(LeafState::Unmapped.encode().into_bits(), 0);
        assert_eq!(LeafState::decode(PageEntryBits::new()), LeafState::Unmapped);
    }

    #[test]
    fn accessed_and_dirty_do_not_change_the_decoded_state() {
        // the CPU sets A/D behind our back; decoding must be stable
        let frame = PhysicalPage::containing(PhysicalAddress::new(0x30_0000));
        let state = LeafState::Committed {
            frame,
            protection: Protection::KERNEL_DATA,
        };
        let touched = state.encode().with_accessed(true).with_dirty(true);
        assert_eq!(LeafState::decode(touched), state);
    }

    #[test]
    fn empty_table_detection() {
        let mut t = PageTable {
            entries: [PageEntryBits::new(); 512],
        };
        assert!(t.is_empty());

        // a lazy reservation must keep the table alive
        t.set(
            17,
            LeafState::LazyReserved {
                protection: Protection::KERNEL_DATA,
            }
            .encode(),
        );
        assert!(!t.is_empty());

        t.set(17, PageEntryBits::new());
        assert!(t.is_empty());
    }
}
