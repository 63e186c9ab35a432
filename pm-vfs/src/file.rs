use core::sync::atomic::AtomicU32;
use std::path::Path;

use tracing::{debug, warn};

use crate::lock::Locker;
use crate::shm::{SharedIndexRegion, SlotRef};
use crate::store::PageStore;
use crate::vfs::VfsFile;
use crate::{FileKind, LockLevel, ShmLockOp, SyncFlags, VfsError};

/// A file opened through [`crate::PmemVfs`].
///
/// Database files carry the shared index of their log; it is only mapped once the host engine
/// asks for a slot.
pub struct PmemFile {
    kind: FileKind,
    store: PageStore,
    shm: Option<SharedIndexRegion>,
    locker: Locker,
    sector_size: u32,
}

impl PmemFile {
    pub(crate) fn new(
        kind: FileKind,
        store: PageStore,
        shm: Option<SharedIndexRegion>,
        locker: Locker,
        sector_size: u32,
    ) -> Self {
        PmemFile {
            kind,
            store,
            shm,
            locker,
            sector_size,
        }
    }

    pub fn kind(&self) -> FileKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn shm(&self) -> Option<&SharedIndexRegion> {
        self.shm.as_ref()
    }

    pub fn shm_mut(&mut self) -> Option<&mut SharedIndexRegion> {
        self.shm.as_mut()
    }

    pub fn lock_level(&self) -> LockLevel {
        self.locker.level()
    }

    /// Look at bytes of the file straight in the mapping, see [`PageStore::fetch`].
    pub fn fetch<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.store.fetch(offset, len, f)
    }

    fn shm_or_unsupported(&mut self) -> Result<&mut SharedIndexRegion, VfsError> {
        self.shm
            .as_mut()
            .ok_or(VfsError::Unsupported("shared index mappings of non-database files"))
    }
}

impl VfsFile for PmemFile {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), VfsError> {
        self.store.read(offset, buf)
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), VfsError> {
        self.store.write(offset, data)
    }

    fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        self.store.truncate(size)
    }

    fn sync(&mut self, flags: SyncFlags) -> Result<(), VfsError> {
        self.store.sync(flags)
    }

    fn file_size(&self) -> Result<u64, VfsError> {
        if self.store.is_closed() {
            return Err(VfsError::Closed);
        }

        Ok(self.store.file_size())
    }

    fn lock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        self.locker.lock(level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        self.locker.unlock(level)
    }

    fn check_reserved_lock(&self) -> Result<bool, VfsError> {
        Ok(self.locker.check_reserved())
    }

    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn shm_map(
        &mut self,
        index: usize,
        slot_size: usize,
        extend: bool,
    ) -> Result<Option<SlotRef>, VfsError> {
        self.shm_or_unsupported()?.map_slot(index, slot_size, extend)
    }

    fn shm_slot(&self, slot: SlotRef) -> Option<&[AtomicU32]> {
        self.shm.as_ref()?.slot(slot)
    }

    fn shm_lock(&mut self, offset: usize, n: usize, op: ShmLockOp) -> Result<(), VfsError> {
        self.locker.shm_lock(offset, n, op)
    }

    fn shm_barrier(&self) {
        let Some(shm) = &self.shm else {
            return;
        };

        if let Err(err) = shm.barrier() {
            warn!(path = %shm.path().display(), %err, "shared index barrier failed to flush");
        }
    }

    fn shm_unmap(&mut self, delete: bool) -> Result<(), VfsError> {
        match &mut self.shm {
            Some(shm) => shm.unmap(delete),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> Result<(), VfsError> {
        if self.store.is_closed() {
            return Ok(());
        }

        self.locker.release();
        let shm = match &mut self.shm {
            Some(shm) => shm.unmap(false),
            None => Ok(()),
        };

        let store = self.store.close();
        debug!(path = %self.path().display(), kind = ?self.kind, "closed file");
        store.and(shm)
    }
}

impl Drop for PmemFile {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path().display(), %err, "failed to close file on drop");
        }
    }
}
