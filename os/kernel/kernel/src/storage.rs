//! Driver hooks behind the fault resolver's backing store.
//!
//! File systems and block drivers live outside this kernel core, so the
//! fault path reaches them through registered function pointers. A
//! fault on a file-backed page fails as not-resolvable until a driver
//! registers; mapping files before that point is a configuration error,
//! not a crash.

use kernel_sync::SpinLock;
use kernel_vmem::BackingStore;
use log::warn;

/// Reads `buffer.len()` bytes at `offset` of the file identified by
/// `file`. Returns false on short reads or unknown ids.
pub type ReadFileFn = fn(file: u64, offset: u64, buffer: &mut [u8]) -> bool;

/// Reads whole sectors starting at `lba` from the device identified by
/// `device`.
pub type ReadSectorsFn = fn(device: u64, lba: u64, buffer: &mut [u8]) -> bool;

struct Drivers {
    read_file: Option<ReadFileFn>,
    read_sectors: Option<ReadSectorsFn>,
}

static DRIVERS: SpinLock<Drivers> = SpinLock::new(Drivers {
    read_file: None,
    read_sectors: None,
});

/// Registers the file-read entry point. Later registrations replace
/// earlier ones.
pub fn register_read_file(f: ReadFileFn) {
    DRIVERS.lock().read_file = Some(f);
}

/// Registers the sector-read entry point.
pub fn register_read_sectors(f: ReadSectorsFn) {
    DRIVERS.lock().read_sectors = Some(f);
}

/// The [`BackingStore`] handed to the fault resolver.
pub struct KernelStore;

impl BackingStore for KernelStore {
    fn read_file(&mut self, file: u64, offset: u64, buf: &mut [u8]) -> bool {
        let Some(read) = DRIVERS.lock().read_file else {
            warn!("file-backed fault with no file driver registered");
            return false;
        };
        read(file, offset, buf)
    }

    fn read_sectors(&mut self, device: u64, lba: u64, buf: &mut [u8]) -> bool {
        let Some(read) = DRIVERS.lock().read_sectors else {
            warn!("sector-backed fault with no block driver registered");
            return false;
        };
        read(device, lba, buf)
    }
}
