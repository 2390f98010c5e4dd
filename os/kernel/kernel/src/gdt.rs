//! Global Descriptor Table and TSS wiring for long mode.
//!
//! Segmentation is mostly vestigial in 64-bit mode, but selectors still
//! carry the privilege level and the TSS still provides the ring-0 stack
//! on traps from user mode. Every core owns one GDT and one TSS inside
//! its per-CPU block; `iretq` frames for user threads use the RPL-3
//! selectors below.
//!
//! ## Layout
//! Index | Selector | Meaning
//! ------|----------|--------
//! 0     | 0x00     | Null
//! 1     | 0x08     | Kernel code (64-bit, DPL=0)
//! 2     | 0x10     | Kernel data (DPL=0)
//! 3     | 0x1b     | User data (DPL=3, RPL=3)
//! 4     | 0x23     | User code (64-bit, DPL=3, RPL=3)
//! 5/6   | 0x28     | TSS (16-byte system descriptor)

use crate::per_cpu::PerCpu;
use crate::tss::Tss64;
use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Kernel code selector, loaded into CS and stamped into every IDT gate.
pub const KERNEL_CS: u16 = 1 << 3;
/// Kernel data selector for DS/ES/SS and kernel-thread `iretq` frames.
pub const KERNEL_DS: u16 = 2 << 3;
/// User data selector with RPL 3.
pub const USER_DS: u16 = (3 << 3) | 3;
/// User code selector with RPL 3.
pub const USER_CS: u16 = (4 << 3) | 3;
/// TSS selector for `ltr`.
pub const TSS_SEL: u16 = 5 << 3;

const _: () = {
    assert!(KERNEL_CS == 0x08);
    assert!(KERNEL_DS == 0x10);
    assert!(USER_DS == 0x1b);
    assert!(USER_CS == 0x23);
    assert!(TSS_SEL == 0x28);
    // SYSRET-style layout: user data one slot before user code. Nothing
    // here uses SYSRET, but keeping the conventional order costs nothing.
    assert!(USER_CS & !3 == (USER_DS & !3) + 8);
};

/// One 8-byte code/data descriptor. Base and limit are ignored in long
/// mode; only type, DPL, P and L matter.
#[bitfield(u64)]
pub struct SegmentDescriptor {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    #[bits(4)]
    typ: u8,
    s: bool,
    #[bits(2)]
    dpl: u8,
    present: bool,
    #[bits(4)]
    limit_hi: u8,
    avl: bool,
    long: bool,
    db: bool,
    granularity: bool,
    base_hi: u8,
}

impl SegmentDescriptor {
    /// 64-bit code descriptor: execute+read, L=1, DB=0.
    const fn code(dpl: u8) -> Self {
        Self::new()
            .with_typ(0b1010)
            .with_s(true)
            .with_dpl(dpl & 3)
            .with_present(true)
            .with_long(true)
    }

    /// Data/stack descriptor: read+write, L=0.
    const fn data(dpl: u8) -> Self {
        Self::new()
            .with_typ(0b0010)
            .with_s(true)
            .with_dpl(dpl & 3)
            .with_present(true)
    }
}

/// Low half of the 16-byte TSS system descriptor (type 0x9, S=0).
#[bitfield(u64)]
struct TssDescriptorLow {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    #[bits(4)]
    typ: u8,
    s: bool,
    #[bits(2)]
    dpl: u8,
    present: bool,
    #[bits(4)]
    limit_hi: u8,
    avl: bool,
    zero1: bool,
    zero2: bool,
    granularity: bool,
    base_hi: u8,
}

/// High half: bits 63:32 of the base, upper word reserved zero.
#[bitfield(u64)]
struct TssDescriptorHigh {
    base_upper: u32,
    __: u32,
}

/// 64-bit Available TSS descriptor spanning two GDT slots.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct TssDescriptor {
    low: TssDescriptorLow,
    high: TssDescriptorHigh,
}

impl TssDescriptor {
    #[allow(clippy::cast_possible_truncation)]
    const fn describing(base: VirtualAddress, limit: u32) -> Self {
        let base = base.as_u64();
        Self {
            low: TssDescriptorLow::new()
                .with_limit_lo((limit & 0xFFFF) as u16)
                .with_limit_hi(((limit >> 16) & 0xF) as u8)
                .with_base_lo((base & 0xFFFF) as u16)
                .with_base_mid(((base >> 16) & 0xFF) as u8)
                .with_base_hi(((base >> 24) & 0xFF) as u8)
                .with_typ(0x9)
                .with_present(true),
            high: TssDescriptorHigh::new().with_base_upper((base >> 32) as u32),
        }
    }

    const fn null() -> Self {
        Self {
            low: TssDescriptorLow::new(),
            high: TssDescriptorHigh::new(),
        }
    }
}

/// The per-core descriptor table, slots in the documented layout.
#[repr(C, align(8))]
pub struct Gdt {
    null: SegmentDescriptor,
    kernel_code: SegmentDescriptor,
    kernel_data: SegmentDescriptor,
    user_data: SegmentDescriptor,
    user_code: SegmentDescriptor,
    tss: TssDescriptor,
}

impl Gdt {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            null: SegmentDescriptor::new(),
            kernel_code: SegmentDescriptor::code(0),
            kernel_data: SegmentDescriptor::data(0),
            user_data: SegmentDescriptor::data(3),
            user_code: SegmentDescriptor::code(3),
            tss: TssDescriptor::null(),
        }
    }
}

impl Default for Gdt {
    fn default() -> Self {
        Self::new()
    }
}

const _: () = {
    assert!(size_of::<SegmentDescriptor>() == 8);
    assert!(size_of::<TssDescriptor>() == 16);
    assert!(size_of::<Gdt>() == 7 * 8);
};

/// Operand of `lgdt`: limit plus the linear base of the table.
#[repr(C, packed)]
struct GdtPointer {
    limit: u16,
    base: u64,
}

/// Builds and activates the GDT and TSS of one core.
///
/// Points `TSS.RSP0` at `kernel_stack_top` and `IST1` at `nmi_stack_top`,
/// executes `lgdt`, reloads the data segments and CS, then `ltr`. Runs
/// once per core during bring-up, interrupts masked.
///
/// # Safety
/// CPL 0 with paging up; `percpu` must stay resident for the lifetime of
/// the core. No interrupt may be delivered while the segments are
/// half-switched.
#[allow(clippy::cast_possible_truncation)]
pub unsafe fn init_gdt_and_tss(
    percpu: &mut PerCpu,
    kernel_stack_top: VirtualAddress,
    nmi_stack_top: VirtualAddress,
) {
    percpu.tss = Tss64::new();
    percpu.tss.rsp0 = kernel_stack_top;
    percpu.tss.ist1 = nmi_stack_top;

    let tss_base = VirtualAddress::from_ptr(&raw const percpu.tss);
    percpu.gdt = Gdt::new();
    percpu.gdt.tss = TssDescriptor::describing(tss_base, (size_of::<Tss64>() - 1) as u32);

    let pointer = GdtPointer {
        limit: (size_of::<Gdt>() - 1) as u16,
        base: core::ptr::from_ref(&percpu.gdt) as u64,
    };

    unsafe {
        core::arch::asm!(
            "lgdt [{ptr}]",
            ptr = in(reg) &raw const pointer,
            options(readonly, nostack, preserves_flags)
        );

        core::arch::asm!(
            "mov ds, {sel:x}",
            "mov es, {sel:x}",
            "mov ss, {sel:x}",
            sel = in(reg) KERNEL_DS,
            options(nostack, preserves_flags)
        );

        // CS cannot be moved into directly; far-return through the new
        // descriptor instead.
        core::arch::asm!(
            "push {cs}",
            "lea rax, [rip + 2f]",
            "push rax",
            "retfq",
            "2:",
            cs = in(reg) u64::from(KERNEL_CS),
            out("rax") _,
            options(nostack)
        );

        core::arch::asm!("ltr {sel:x}", sel = in(reg) TSS_SEL, options(nostack, preserves_flags));
    }
}
