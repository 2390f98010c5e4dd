use kernel_pmm::OutOfMemory;

/// Errors surfaced by address-space operations.
///
/// These are recoverable and returned to the caller (ultimately the syscall
/// layer). Structural page-table corruption is not represented here; that is
/// a kernel bug and panics at the detection site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No physical memory, or no free virtual range large enough.
    #[error(transparent)]
    OutOfMemory(#[from] OutOfMemory),

    /// An explicitly requested base range overlaps an existing allocation.
    #[error("base address already in use")]
    BaseAddressUsed,

    /// Malformed request, e.g. a non-canonical or null base address.
    #[error("invalid parameter")]
    InvalidParameter,

    /// A user-originated operation touched the kernel half.
    #[error("access denied")]
    AccessDenied,

    /// Cross-space copy found the source range unmapped.
    #[error("copy source not mapped")]
    MemcpySourceFault,

    /// Cross-space copy found the destination range unmapped. Copies write
    /// through the physical frame, so destination protection is not checked.
    #[error("copy destination not mapped")]
    MemcpyDestinationFault,
}
