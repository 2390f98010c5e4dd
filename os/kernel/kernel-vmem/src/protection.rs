use bitfield_struct::bitfield;
use kernel_memory_addresses::VirtualAddress;

/// Caller-facing page protection, independent of the hardware entry layout.
///
/// This is what the allocation and protection calls accept and what
/// [`get_protection`](crate::AddressSpace::get_protection) reports back. It
/// is translated to and from the hardware bit positions in exactly one place
/// (the leaf-entry codec), so nothing else in the kernel reasons about raw
/// entry bits.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Protection {
    /// Writes allowed. Clear means read-only; a write faults.
    pub writable: bool,
    /// Instruction fetches allowed. Clear becomes NX in hardware.
    pub executable: bool,
    /// Accessible from user mode (CPL 3).
    pub user: bool,
    /// Bypass the cache, for device memory.
    pub cache_disabled: bool,
    #[bits(4)]
    __: u8,
}

impl Protection {
    /// Kernel read-write data.
    pub const KERNEL_DATA: Self = Self::new().with_writable(true);

    /// Kernel read-only, executable.
    pub const KERNEL_CODE: Self = Self::new().with_executable(true);

    /// User read-write data, no execute.
    pub const USER_DATA: Self = Self::new().with_user(true).with_writable(true);

    /// User read-only, executable.
    pub const USER_CODE: Self = Self::new().with_user(true).with_executable(true);
}

/// Who is asking for an address-space operation.
///
/// Syscall entry points pass [`AccessOrigin::User`]; kernel-internal callers
/// pass [`AccessOrigin::Kernel`]. User-originated operations touching the
/// kernel half fail with `AccessDenied` before any state changes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessOrigin {
    User,
    Kernel,
}

impl AccessOrigin {
    /// Whether this origin may operate on `va` at all.
    #[must_use]
    pub fn may_touch(self, va: VirtualAddress) -> bool {
        match self {
            Self::Kernel => true,
            Self::User => va.is_user_half(),
        }
    }
}

/// When physical backing for an allocation is produced.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Reserve only: pages commit on first touch via the fault path and read
    /// as zero. The default.
    Lazy,
    /// Back every page with a zeroed frame immediately. Required for memory
    /// handed to devices or accessed with interrupts disabled, where a page
    /// fault would be fatal.
    Eager,
}

/// Per-page answer from a protection query.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtectionQuery {
    /// Nothing at this page, not even a reservation.
    Unmapped,
    /// Reserved but not yet backed; the flags it will commit with.
    Reserved(Protection),
    /// Present in hardware with these flags.
    Committed(Protection),
}

impl ProtectionQuery {
    /// The effective protection, if the page is allocated at all.
    #[must_use]
    pub const fn protection(self) -> Option<Protection> {
        match self {
            Self::Unmapped => None,
            Self::Reserved(p) | Self::Committed(p) => Some(p),
        }
    }
}
