use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3: the PML4 base register (4-level paging, PCID disabled).
///
/// Writing it switches the address space and flushes non-global TLB
/// entries, which is the entirety of a context switch's paging side.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0-2, reserved, must be zero.
    #[bits(3)]
    pub reserved0: u8,

    /// Bit 3, PWT: write-through caching for PML4 accesses.
    pub pwt: bool,

    /// Bit 4, PCD: cache disable for PML4 accesses.
    pub pcd: bool,

    /// Bits 5-11, reserved, must be zero.
    #[bits(7)]
    pub reserved1: u8,

    /// Bits 12-51: physical base of the PML4, shifted right by 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52-63, reserved.
    #[bits(12)]
    pub reserved2: u16,
}

impl Cr3 {
    /// Builds a CR3 value for a 4 KiB-aligned PML4 base.
    #[must_use]
    pub fn from_pml4_phys(pml4_phys: PhysicalAddress, pwt: bool, pcd: bool) -> Self {
        debug_assert_eq!(
            pml4_phys.as_u64() & 0xFFF,
            0,
            "PML4 base must be 4K-aligned"
        );
        let mut cr3 = Self::new();
        cr3.set_pwt(pwt);
        cr3.set_pcd(pcd);
        cr3.set_pml4_base_4k(pml4_phys.as_u64() >> 12);
        cr3
    }

    /// The full physical address of the PML4 base.
    #[must_use]
    pub fn pml4_phys(&self) -> PhysicalAddress {
        let bits = self.into_bits();
        debug_assert_eq!(bits >> 52, 0, "CR3 has nonzero high bits: {bits:#018x}");

        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

#[cfg(feature = "asm")]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(feature = "asm")]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
