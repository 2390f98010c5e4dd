//! Interrupt Descriptor Table with a small fluent gate builder.
//!
//! ```ignore
//! idt[vector]
//!     .set_handler(handler)
//!     .selector(KERNEL_CS)
//!     .present(true)
//!     .gate_interrupt();
//! unsafe { idt.load() };
//! ```
//!
//! Interrupt gates clear IF on entry; every gate here is an interrupt
//! gate because all handlers run with interrupts masked until `iretq`.
//! The NMI gate additionally routes through IST 1 so a stop request
//! lands on an intact stack no matter what the core was doing.

pub mod nmi;
pub mod page_fault;
pub mod reschedule;
pub mod spurious;
pub mod timer;

use bitfield_struct::bitfield;
use core::ops::{Index, IndexMut};
use kernel_sync::SyncOnceCell;

/// The IST and attribute bytes of a gate: IST index in the low byte,
/// `P | DPL(2) | S | type(4)` in the high byte.
#[bitfield(u16)]
pub struct GateAttributes {
    #[bits(3)]
    ist: u8,
    #[bits(5)]
    __: u8,
    #[bits(4)]
    typ: u8,
    s: bool,
    #[bits(2)]
    dpl: u8,
    present: bool,
}

/// One 16-byte gate descriptor.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdtEntry {
    offset_lo: u16,
    selector: u16,
    attributes: u16,
    offset_mid: u16,
    offset_hi: u32,
    _zero: u32,
}

impl IdtEntry {
    const MISSING: Self = Self {
        offset_lo: 0,
        selector: 0,
        attributes: 0,
        offset_mid: 0,
        offset_hi: 0,
        _zero: 0,
    };

    /// Stores the handler address and returns a builder over this entry.
    /// The gate stays non-present until the builder says otherwise.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set_handler(&mut self, handler: extern "C" fn()) -> IdtEntryBuilder<'_> {
        let address = handler as usize as u64;
        self.offset_lo = (address & 0xFFFF) as u16;
        self.offset_mid = ((address >> 16) & 0xFFFF) as u16;
        self.offset_hi = (address >> 32) as u32;
        self.attributes = GateAttributes::new().with_typ(0xE).into_bits();
        IdtEntryBuilder { entry: self }
    }
}

/// Fluent builder over one [`IdtEntry`].
pub struct IdtEntryBuilder<'a> {
    entry: &'a mut IdtEntry,
}

impl IdtEntryBuilder<'_> {
    /// Code segment selector the handler runs under.
    pub const fn selector(self, selector: u16) -> Self {
        self.entry.selector = selector;
        self
    }

    /// Marks the gate valid.
    pub const fn present(self, present: bool) -> Self {
        let bits = GateAttributes::from_bits(self.entry.attributes).with_present(present);
        self.entry.attributes = bits.into_bits();
        self
    }

    /// Privilege required to reach the gate via software `int`.
    pub fn dpl(self, dpl: u8) -> Self {
        debug_assert!(dpl <= 3);
        let bits = GateAttributes::from_bits(self.entry.attributes).with_dpl(dpl);
        self.entry.attributes = bits.into_bits();
        self
    }

    /// Routes delivery through TSS IST slot `index` (1..=7; 0 disables).
    pub fn ist(self, index: u8) -> Self {
        debug_assert!(index <= 7);
        let bits = GateAttributes::from_bits(self.entry.attributes).with_ist(index);
        self.entry.attributes = bits.into_bits();
        self
    }

    /// Interrupt gate: IF cleared on entry.
    pub const fn gate_interrupt(self) -> Self {
        let bits = GateAttributes::from_bits(self.entry.attributes)
            .with_typ(0xE)
            .with_s(false);
        self.entry.attributes = bits.into_bits();
        self
    }
}

/// The 256-entry table. One instance serves every core; each core loads
/// it into its own IDTR during bring-up.
#[repr(C, align(16))]
pub struct Idt {
    entries: [IdtEntry; 256],
}

impl Idt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: [IdtEntry::MISSING; 256],
        }
    }

    /// Loads this table into the executing core's IDTR.
    ///
    /// # Safety
    /// CPL 0; every present gate must point at a live handler, and gates
    /// reachable from CPL 3 need a valid `TSS.RSP0` on this core.
    pub unsafe fn load(&'static self) {
        #[repr(C, packed)]
        struct Idtr {
            limit: u16,
            base: u64,
        }
        #[allow(clippy::cast_possible_truncation)]
        let idtr = Idtr {
            limit: (size_of::<Self>() - 1) as u16,
            base: core::ptr::from_ref(self) as u64,
        };
        unsafe {
            core::arch::asm!(
                "lidt [{}]",
                in(reg) &raw const idtr,
                options(nostack, preserves_flags, readonly)
            );
        }
    }
}

impl Default for Idt {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for Idt {
    type Output = IdtEntry;
    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl IndexMut<usize> for Idt {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

const _: () = {
    assert!(size_of::<IdtEntry>() == 16);
    assert!(align_of::<Idt>() == 16);
};

static IDT: SyncOnceCell<Idt> = SyncOnceCell::new();

/// Builds the shared gate table on first call, then loads it into the
/// executing core's IDTR. Every core calls this during bring-up.
///
/// # Safety
/// CPL 0 with interrupts masked; this core's GDT and TSS must already
/// be live since the gates reference [`crate::gdt::KERNEL_CS`].
pub unsafe fn init_and_load() {
    let idt = IDT.get_or_init(|| {
        let mut idt = Idt::new();
        page_fault::install(&mut idt);
        nmi::install(&mut idt);
        timer::install(&mut idt);
        reschedule::install(&mut idt);
        spurious::install(&mut idt);
        idt
    });
    unsafe { idt.load() };
}
