//! Page-fault resolution.
//!
//! The interrupt stub decodes CR2 and the hardware error code into a
//! [`PageFault`] and hands it here together with the faulting thread's
//! address space. The resolver is pure policy: it inspects the leaf state,
//! validates the attempted access against the stashed protection, and
//! commits the page (zero-filled or read from its backing source) or
//! declares the fault fatal. What "fatal" means is the caller's business:
//! a user process is killed with [`USER_FAULT_EXIT_CODE`], a kernel-mode
//! fault brings the machine down.
//!
//! The caller must hold the space's lock across the call and invalidate the
//! faulting page's TLB entry before returning from the interrupt.

use crate::protection::{AccessOrigin, Protection, ProtectionQuery};
use crate::space::{AddressSpace, MappingSource};
use bitfield_struct::bitfield;
use kernel_memory_addresses::{VirtualAddress, VirtualPage};
use kernel_pmm::{FrameSource, PhysMapper};

/// Exit code assigned to a user process killed by an unresolvable fault.
pub const USER_FAULT_EXIT_CODE: u32 = 0xFFFF_FFF1;

/// Hardware page-fault error code, as pushed by the CPU.
#[bitfield(u64)]
pub struct FaultCode {
    /// Clear when the fault hit a non-present entry.
    pub present: bool,
    /// Set for writes, clear for reads.
    pub write: bool,
    /// Set when the access came from ring 3.
    pub user: bool,
    /// A reserved bit was set in a paging structure.
    pub reserved_bit: bool,
    /// Set when the access was an instruction fetch.
    pub instruction_fetch: bool,
    #[bits(59)]
    __: u64,
}

/// One decoded page-fault event.
#[derive(Copy, Clone, Debug)]
pub struct PageFault {
    /// The faulting address, from CR2.
    pub address: VirtualAddress,
    pub write: bool,
    pub user: bool,
    pub instruction_fetch: bool,
    /// Whether the translation existed (protection fault) or not.
    pub present: bool,
}

impl PageFault {
    /// Decode CR2 plus the pushed error code.
    #[must_use]
    pub const fn from_error_code(address: VirtualAddress, code: u64) -> Self {
        let code = FaultCode::from_bits(code);
        Self {
            address,
            write: code.write(),
            user: code.user(),
            instruction_fetch: code.instruction_fetch(),
            present: code.present(),
        }
    }

    #[must_use]
    pub const fn origin(&self) -> AccessOrigin {
        if self.user {
            AccessOrigin::User
        } else {
            AccessOrigin::Kernel
        }
    }

    /// Whether `protection` allows the attempted access.
    #[must_use]
    pub const fn permitted_by(&self, protection: Protection) -> bool {
        if self.user && !protection.user() {
            return false;
        }
        if self.write && !protection.writable() {
            return false;
        }
        if self.instruction_fetch && !protection.executable() {
            return false;
        }
        true
    }
}

/// Outcome of [`resolve_fault`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FaultVerdict {
    /// A reservation was committed with a zero-filled frame; retry the
    /// access.
    ResolvedZeroFill,
    /// A file-backed reservation was committed with its content; retry the
    /// access.
    ResolvedFileRead,
    /// The mapping already satisfies the access. Another CPU resolved the
    /// fault first or this CPU holds a stale TLB entry; invalidate and
    /// retry.
    Retry,
    /// Unresolvable. Kill the user process or panic the kernel.
    Fatal(FatalKind),
}

/// Why a fault could not be resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FatalKind {
    /// Neither mapped nor reserved.
    NotMapped,
    /// The page exists but forbids the attempted access.
    ProtectionViolation,
    /// The backing store failed to deliver the page content.
    FileReadFailed,
    /// No physical frame was available to commit the page.
    OutOfMemory,
}

/// Content delivery for file-backed reservations.
///
/// Implemented by the VFS / block layer glue in the kernel proper; tests
/// substitute in-memory stores. Both methods fill all of `buf` (objects
/// shorter than the request zero-fill the tail) and report plain success,
/// since the fault path collapses every failure into
/// [`FatalKind::FileReadFailed`].
pub trait BackingStore {
    fn read_file(&mut self, file: u64, offset: u64, buf: &mut [u8]) -> bool;
    fn read_sectors(&mut self, device: u64, lba: u64, buf: &mut [u8]) -> bool;
}

/// Resolve one page fault against `space`.
///
/// Permission checks come first: an access the stashed protection forbids
/// is fatal even though the page was never committed, so a process cannot
/// grow writable pages out of a read-only reservation by faulting on it.
pub fn resolve_fault<M, F, B>(
    space: &AddressSpace<M>,
    fault: PageFault,
    frames: &mut F,
    store: &mut B,
) -> FaultVerdict
where
    M: PhysMapper,
    F: FrameSource,
    B: BackingStore,
{
    match space.query(fault.address) {
        ProtectionQuery::Unmapped => FaultVerdict::Fatal(FatalKind::NotMapped),
        ProtectionQuery::Committed(protection) => {
            if fault.permitted_by(protection) {
                FaultVerdict::Retry
            } else {
                FaultVerdict::Fatal(FatalKind::ProtectionViolation)
            }
        }
        ProtectionQuery::Reserved(protection) => {
            if !fault.permitted_by(protection) {
                return FaultVerdict::Fatal(FatalKind::ProtectionViolation);
            }
            match space.file_backing(fault.address) {
                None => match space.commit_zero_filled(fault.address, frames) {
                    Ok(_) => FaultVerdict::ResolvedZeroFill,
                    Err(_) => FaultVerdict::Fatal(FatalKind::OutOfMemory),
                },
                Some(source) => commit_from_store(space, fault.address, source, frames, store),
            }
        }
    }
}

/// Pull page content from the backing store into a fresh frame, then make
/// the frame visible. The read happens before the leaf is rewritten, so a
/// failed read leaves the reservation untouched.
fn commit_from_store<M, F, B>(
    space: &AddressSpace<M>,
    address: VirtualAddress,
    source: MappingSource,
    frames: &mut F,
    store: &mut B,
) -> FaultVerdict
where
    M: PhysMapper,
    F: FrameSource,
    B: BackingStore,
{
    let Ok(frame) = frames.alloc_frame() else {
        return FaultVerdict::Fatal(FatalKind::OutOfMemory);
    };
    // SAFETY: fresh frame, not visible in any mapping yet.
    let buf: &mut [u8; 4096] = unsafe { space.mapper().phys_to_mut(frame.base()) };
    let ok = match source {
        MappingSource::File { file, offset } => store.read_file(file, offset, buf),
        MappingSource::Device { device, lba } => store.read_sectors(device, lba, buf),
    };
    if !ok {
        log::warn!("backing read for page at {address} failed ({source:?})");
        // SAFETY: the frame never became visible.
        unsafe { frames.free_frame(frame) };
        return FaultVerdict::Fatal(FatalKind::FileReadFailed);
    }
    space.install_committed(VirtualPage::containing(address), frame);
    FaultVerdict::ResolvedFileRead
}

#[cfg(test)]
#[allow(clippy::cast_possible_truncation)]
mod tests {
    use super::*;
    use crate::protection::CommitPolicy;
    use crate::space::SECTOR_SIZE;
    use crate::test_support::{TestFrames, TestPhys};
    use crate::walker::PageTableWalker;
    use kernel_memory_addresses::{PAGE_SIZE, PhysicalPage};

    /// Byte the store writes at absolute offset `n` of any object.
    fn pattern(n: u64) -> u8 {
        (n % 253) as u8
    }

    /// In-memory backing store; `fail` makes every read report failure.
    struct TestStore {
        fail: bool,
    }

    impl BackingStore for TestStore {
        fn read_file(&mut self, _file: u64, offset: u64, buf: &mut [u8]) -> bool {
            if self.fail {
                return false;
            }
            for (i, b) in buf.iter_mut().enumerate() {
                *b = pattern(offset + i as u64);
            }
            true
        }

        fn read_sectors(&mut self, _device: u64, lba: u64, buf: &mut [u8]) -> bool {
            if self.fail {
                return false;
            }
            for (i, b) in buf.iter_mut().enumerate() {
                *b = pattern(lba * SECTOR_SIZE + i as u64);
            }
            true
        }
    }

    fn fresh_space<'p>(
        phys: &'p TestPhys,
        frames: &mut TestFrames<'_>,
    ) -> AddressSpace<&'p TestPhys> {
        let root = frames.alloc_frame().unwrap();
        unsafe { PageTableWalker::new(phys).table(root) }.zero();
        unsafe { AddressSpace::from_root(root, phys) }
    }

    fn user_write(address: VirtualAddress) -> PageFault {
        PageFault {
            address,
            write: true,
            user: true,
            instruction_fetch: false,
            present: false,
        }
    }

    fn frame_of(space: &AddressSpace<&TestPhys>, va: VirtualAddress) -> PhysicalPage {
        match space.walker().leaf_state(space.root(), va) {
            crate::page_entry::LeafState::Committed { frame, .. } => frame,
            other => panic!("expected a committed page, got {other:?}"),
        }
    }

    #[test]
    fn error_code_decoding_matches_the_architecture() {
        let va = VirtualAddress::new(0xDEAD_B000);
        // user write to a non-present page
        let fault = PageFault::from_error_code(va, 0b110);
        assert!(fault.write && fault.user && !fault.present && !fault.instruction_fetch);
        // kernel instruction fetch hitting a present page
        let fault = PageFault::from_error_code(va, 0b1_0001);
        assert!(fault.present && fault.instruction_fetch && !fault.user && !fault.write);
        assert_eq!(fault.origin(), AccessOrigin::Kernel);
    }

    #[test]
    fn first_touch_commits_a_zeroed_page() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        let va = space
            .allocate(
                None,
                2 * PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Lazy,
                &mut frames,
            )
            .unwrap();

        let before = frames.free_count();
        let touch = VirtualAddress::new(va.as_u64() + PAGE_SIZE + 0x123);
        let verdict = resolve_fault(&space, user_write(touch), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::ResolvedZeroFill);

        // exactly one frame was consumed, and only the touched page moved
        assert_eq!(before - frames.free_count(), 1);
        assert_eq!(
            space.query(touch),
            ProtectionQuery::Committed(Protection::USER_DATA)
        );
        assert_eq!(
            space.query(va),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );

        let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(frame_of(&space, touch).base()) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn forbidden_access_to_a_reservation_is_fatal_and_commits_nothing() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        // user-readable but not writable, not executable
        let readonly = Protection::new().with_user(true);
        let va = space
            .allocate(
                None,
                PAGE_SIZE,
                readonly,
                AccessOrigin::User,
                CommitPolicy::Lazy,
                &mut frames,
            )
            .unwrap();

        let before = frames.free_count();
        let verdict = resolve_fault(&space, user_write(va), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::ProtectionViolation));

        let fetch = PageFault {
            address: va,
            write: false,
            user: true,
            instruction_fetch: true,
            present: false,
        };
        let verdict = resolve_fault(&space, fetch, &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::ProtectionViolation));

        // failed checks must not commit the page
        assert_eq!(frames.free_count(), before);
        assert_eq!(space.query(va), ProtectionQuery::Reserved(readonly));
    }

    #[test]
    fn user_access_to_a_kernel_only_reservation_is_fatal() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        // the kernel parks a supervisor-only reservation in the lower half
        let base = VirtualAddress::new(0x5000_0000);
        space
            .allocate(
                Some(base),
                PAGE_SIZE,
                Protection::KERNEL_DATA,
                AccessOrigin::Kernel,
                CommitPolicy::Lazy,
                &mut frames,
            )
            .unwrap();

        let verdict = resolve_fault(&space, user_write(base), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::ProtectionViolation));
    }

    #[test]
    fn unmapped_addresses_are_fatal() {
        let phys = TestPhys::with_frames(16);
        let mut frames = phys.frame_source(16);
        let mut store = TestStore { fail: false };
        let space = fresh_space(&phys, &mut frames);

        let verdict = resolve_fault(
            &space,
            user_write(VirtualAddress::new(0x41_4000)),
            &mut frames,
            &mut store,
        );
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::NotMapped));
    }

    #[test]
    fn faults_on_committed_pages_retry_or_die_by_protection() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        let va = space
            .allocate(
                None,
                PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Eager,
                &mut frames,
            )
            .unwrap();

        // permitted access on an already-committed page: stale TLB, retry
        let verdict = resolve_fault(&space, user_write(va), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Retry);

        space
            .protect(va, PAGE_SIZE, Protection::new().with_user(true), AccessOrigin::User)
            .unwrap();
        let verdict = resolve_fault(&space, user_write(va), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::ProtectionViolation));
    }

    #[test]
    fn file_backed_pages_fill_from_their_source() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        let va = space
            .map_file(
                None,
                3 * PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                MappingSource::File {
                    file: 9,
                    offset: 0x3000,
                },
                &mut frames,
            )
            .unwrap();

        // touch the middle page; its content must come from offset + 1 page
        let touch = VirtualAddress::new(va.as_u64() + PAGE_SIZE + 7);
        let verdict = resolve_fault(&space, user_write(touch), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::ResolvedFileRead);

        let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(frame_of(&space, touch).base()) };
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(*b, pattern(0x3000 + PAGE_SIZE + i as u64), "byte {i}");
        }
        // untouched neighbors stay reserved
        assert_eq!(
            space.query(va),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );
    }

    #[test]
    fn device_backed_pages_fill_from_their_sectors() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        let va = space
            .map_file(
                None,
                2 * PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                MappingSource::Device { device: 1, lba: 80 },
                &mut frames,
            )
            .unwrap();

        let touch = VirtualAddress::new(va.as_u64() + PAGE_SIZE);
        let verdict = resolve_fault(&space, user_write(touch), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::ResolvedFileRead);

        let bytes: &[u8; 4096] = unsafe { phys.phys_to_mut(frame_of(&space, touch).base()) };
        let sector_base = (80 + PAGE_SIZE / SECTOR_SIZE) * SECTOR_SIZE;
        for (i, b) in bytes.iter().enumerate() {
            assert_eq!(*b, pattern(sector_base + i as u64), "byte {i}");
        }
    }

    #[test]
    fn failed_backing_reads_are_fatal_and_leak_nothing() {
        let phys = TestPhys::with_frames(32);
        let mut frames = phys.frame_source(32);
        let mut store = TestStore { fail: true };
        let mut space = fresh_space(&phys, &mut frames);

        let va = space
            .map_file(
                None,
                PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                MappingSource::File { file: 2, offset: 0 },
                &mut frames,
            )
            .unwrap();

        let before = frames.free_count();
        let verdict = resolve_fault(&space, user_write(va), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::FileReadFailed));
        assert_eq!(frames.free_count(), before);
        assert_eq!(
            space.query(va),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );
    }

    #[test]
    fn commit_without_frames_is_fatal() {
        let phys = TestPhys::with_frames(16);
        let mut frames = phys.frame_source(4);
        let mut store = TestStore { fail: false };
        let mut space = fresh_space(&phys, &mut frames);

        // root + chain eat the whole budget
        let va = space
            .allocate(
                None,
                PAGE_SIZE,
                Protection::USER_DATA,
                AccessOrigin::User,
                CommitPolicy::Lazy,
                &mut frames,
            )
            .unwrap();
        assert_eq!(frames.free_count(), 0);

        let verdict = resolve_fault(&space, user_write(va), &mut frames, &mut store);
        assert_eq!(verdict, FaultVerdict::Fatal(FatalKind::OutOfMemory));
        assert_eq!(
            space.query(va),
            ProtectionQuery::Reserved(Protection::USER_DATA)
        );
    }
}
