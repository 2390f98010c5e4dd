//! Process records: address-space ownership and thread membership.
//!
//! A process here is only what the scheduler needs to know about one: the
//! root of its address space (the CR3 switch decision), the threads that
//! run in it (teardown detaches them first), and its exit code. Handle
//! tables, consoles, and signal dispatch live with the syscall layer.

use core::fmt;

use alloc::vec::Vec;
use kernel_memory_addresses::PhysicalPage;

use crate::arena::Handle;
use crate::thread::ThreadId;

/// Stable process identity: arena slot plus generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessId(pub(crate) Handle);

impl ProcessId {
    /// Packs the id into one word, e.g. as a map key outside the scheduler.
    #[must_use]
    pub const fn pack(self) -> u64 {
        self.0.pack()
    }

    /// Inverse of [`Self::pack`].
    #[must_use]
    pub const fn unpack(word: u64) -> Self {
        Self(Handle::unpack(word))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub(crate) struct Process {
    /// PML4 root of the process's address space. Loaded into CR3 whenever
    /// one of its threads takes a core.
    pub(crate) root: PhysicalPage,
    /// Threads owning a back-reference to this process. Maintained by
    /// create/reap; never holds an id that would miss the thread table.
    pub(crate) threads: Vec<ThreadId>,
    /// Recorded by process termination; threads that die with the process
    /// individually carry the same code.
    pub(crate) exit_code: Option<u32>,
}
