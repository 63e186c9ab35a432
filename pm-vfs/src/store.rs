use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use pm_region::{DurabilityPolicy, MappedRegion, Medium, RegionOptions, Role};
use tracing::{debug, trace, warn};

use crate::{IoOp, SyncFlags, VfsError};

/// One mapping of a file, shared by every store open on it.
pub type SharedRegion = Arc<RwLock<MappedRegion>>;

/// The regions of every database and log file opened through one provider, by path.
///
/// A second open of a path attaches to the live region instead of mapping the file again, so
/// handles see each other's writes and agree on the used length. The file is only trimmed once
/// the last of them closes.
#[derive(Default)]
pub struct OpenRegions {
    paths: Mutex<HashMap<PathBuf, Weak<RwLock<MappedRegion>>>>,
}

/// A database or log file held in a [`MappedRegion`].
///
/// Writes go straight into the mapping. Whether and when they are flushed is decided by the
/// [`DurabilityPolicy`] of the store's [`Role`]: log writes are durable when `write` returns,
/// data writes once `sync` returns.
pub struct PageStore {
    /// `None` once closed.
    region: Option<SharedRegion>,
    regions: Arc<OpenRegions>,
    path: PathBuf,
    medium: Medium,
    role: Role,
    stats: FlushStats,
}

/// Flushes a store has performed, by cause.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Range flushes directly after a write.
    pub write_flushes: u64,
    /// Whole region flushes on an explicit sync.
    pub sync_flushes: u64,
    /// Explicit syncs with nothing to do.
    pub noop_syncs: u64,
}

impl OpenRegions {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> MutexGuard<'_, HashMap<PathBuf, Weak<RwLock<MappedRegion>>>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a store on `path`, attaching to its region if another store has it open.
    pub fn open(
        self: &Arc<Self>,
        path: &Path,
        role: Role,
        options: RegionOptions,
    ) -> Result<PageStore, VfsError> {
        let mut paths = self.paths();

        let region = match paths.get(path).and_then(Weak::upgrade) {
            Some(region) => {
                trace!(path = %path.display(), "attached to open region");
                region
            }
            None => {
                let region = MappedRegion::open(path, options)
                    .map_err(|err| VfsError::region(IoOp::Open, err))?;
                let region = Arc::new(RwLock::new(region));
                paths.insert(path.to_owned(), Arc::downgrade(&region));
                region
            }
        };

        drop(paths);
        Ok(PageStore::attach(Arc::clone(self), path, region, role))
    }

    /// Drop one store's hold on `region`, closing it if that was the last.
    fn release(&self, path: &Path, region: SharedRegion) -> Result<(), VfsError> {
        // Held until the region is closed, so no open maps the file while it is trimmed.
        let mut paths = self.paths();

        let Some(region) = Arc::into_inner(region) else {
            trace!(path = %path.display(), "region still in use");
            return Ok(());
        };

        if paths.get(path).is_some_and(|live| live.strong_count() == 0) {
            paths.remove(path);
        }

        let mut region = region.into_inner().unwrap_or_else(PoisonError::into_inner);
        region.close().map_err(|err| VfsError::region(IoOp::Close, err))
    }

    /// The number of paths with an open region.
    pub fn len(&self) -> usize {
        self.paths()
            .values()
            .filter(|live| live.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PageStore {
    /// Open a store of its own, not shared with any other.
    pub fn open(path: &Path, role: Role, options: RegionOptions) -> Result<Self, VfsError> {
        Arc::new(OpenRegions::new()).open(path, role, options)
    }

    fn attach(regions: Arc<OpenRegions>, path: &Path, region: SharedRegion, role: Role) -> Self {
        let medium = {
            let guard = region.read().unwrap_or_else(PoisonError::into_inner);
            debug!(
                path = %path.display(),
                ?role,
                medium = ?guard.medium(),
                capacity = guard.capacity(),
                used = guard.used_len(),
                handles = Arc::strong_count(&region),
                "opened store"
            );
            guard.medium()
        };

        PageStore {
            region: Some(region),
            regions,
            path: path.to_owned(),
            medium,
            role,
            stats: FlushStats::default(),
        }
    }

    fn region(&self) -> Result<RwLockReadGuard<'_, MappedRegion>, VfsError> {
        let region = self.region.as_ref().ok_or(VfsError::Closed)?;
        Ok(region.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn region_mut(&self) -> Result<RwLockWriteGuard<'_, MappedRegion>, VfsError> {
        let region = self.region.as_ref().ok_or(VfsError::Closed)?;
        Ok(region.write().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// Mapped bytes, zero once closed.
    pub fn capacity(&self) -> usize {
        self.region().map_or(0, |region| region.capacity())
    }

    /// How often the shared region was remapped to grow.
    pub fn remaps(&self) -> u64 {
        self.region().map_or(0, |region| region.remaps())
    }

    pub fn stats(&self) -> FlushStats {
        self.stats
    }

    fn policy(&self) -> DurabilityPolicy {
        DurabilityPolicy::new(self.medium, self.role)
    }

    /// Fill `buf` from `offset`. Bytes past the file size read as zero and fail the read.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), VfsError> {
        self.region()?
            .read_at(offset, buf)
            .map_err(|err| VfsError::region(IoOp::Read, err))
    }

    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), VfsError> {
        let policy = self.policy();
        let mut region = self.region_mut()?;
        let range = region
            .write_at(offset, data)
            .map_err(|err| VfsError::region(IoOp::Write, err))?;

        if let Some(flush) = policy.after_write(range) {
            region
                .flush(&flush)
                .map_err(|err| VfsError::region(IoOp::Write, err))?;
            drop(region);
            self.stats.write_flushes += 1;
        }

        Ok(())
    }

    /// Make every write so far durable.
    ///
    /// The flags are accepted for the host engine's sake; a full sync and a data-only sync flush
    /// the same bytes.
    pub fn sync(&mut self, flags: SyncFlags) -> Result<(), VfsError> {
        let region = self.region()?;

        let Some(flush) = self.policy().on_sync(region.used_len()) else {
            trace!(path = %self.path.display(), ?flags, "sync of log is a no-op");
            drop(region);
            self.stats.noop_syncs += 1;
            return Ok(());
        };

        trace!(path = %self.path.display(), ?flags, ?flush, "sync");
        region
            .flush(&flush)
            .map_err(|err| VfsError::region(IoOp::Sync, err))?;
        drop(region);
        self.stats.sync_flushes += 1;
        Ok(())
    }

    /// The number of valid bytes, never the mapped capacity. Zero once closed.
    pub fn file_size(&self) -> u64 {
        self.region().map_or(0, |region| region.used_len() as u64)
    }

    /// Accepted and ignored, the file keeps its size.
    pub fn truncate(&mut self, size: u64) -> Result<(), VfsError> {
        trace!(
            path = %self.path.display(),
            size,
            used = self.file_size(),
            "ignoring truncate"
        );
        Ok(())
    }

    /// Look at `len` bytes at `offset` directly in the mapping.
    ///
    /// `None` unless the whole range lies within the file size. Writes through other handles of
    /// the file wait until `f` returns.
    pub fn fetch<R>(&self, offset: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let region = self.region().ok()?;
        let start = usize::try_from(offset).ok()?;
        let end = start.checked_add(len)?;
        region.used_bytes().get(start..end).map(f)
    }

    /// Detach from the region. The last store to close it unmaps and shrinks the file to its
    /// size. Idempotent.
    pub fn close(&mut self) -> Result<(), VfsError> {
        match self.region.take() {
            Some(region) => self.regions.release(&self.path, region),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.region.is_none()
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), %err, "failed to close store on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_region::{Mapper, MediumDetect};

    fn open(dir: &Path, name: &str, role: Role, initial_capacity: usize) -> PageStore {
        let options = RegionOptions::new(Mapper::new(MediumDetect::Emulated))
            .with_initial_capacity(initial_capacity);
        PageStore::open(&dir.join(name), role, options).unwrap()
    }

    #[test]
    fn log_flushes_per_write_and_ignores_sync() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = open(dir.path(), "x.db-wal", Role::Log, 4096);

        log.write(0, b"frame-one").unwrap();
        log.write(9, b"frame-two").unwrap();
        log.sync(SyncFlags::default()).unwrap();

        assert_eq!(
            log.stats(),
            FlushStats {
                write_flushes: 2,
                sync_flushes: 0,
                noop_syncs: 1,
            }
        );
    }

    #[test]
    fn data_flushes_on_sync_only() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path(), "x.db", Role::Data, 4096);

        db.write(0, &[1; 4096]).unwrap();
        db.write(4096, &[2; 4096]).unwrap();
        assert_eq!(db.stats().write_flushes, 0);

        db.sync(SyncFlags { full: true, data_only: false }).unwrap();
        assert_eq!(db.stats().sync_flushes, 1);
    }

    #[test]
    fn truncate_keeps_the_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path(), "x.db", Role::Data, 4096);

        db.write(0, &[7; 100]).unwrap();
        db.truncate(10).unwrap();
        assert_eq!(db.file_size(), 100);

        let mut buf = [0; 100];
        db.read(0, &mut buf).unwrap();
        assert_eq!(buf, [7; 100]);
    }

    #[test]
    fn fetch_is_bounded_by_the_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path(), "x.db", Role::Data, 4096);
        db.write(0, b"0123456789").unwrap();

        assert_eq!(db.fetch(2, 3, <[u8]>::to_vec), Some(b"234".to_vec()));
        assert_eq!(db.fetch(0, 10, <[u8]>::len), Some(10));
        assert_eq!(db.fetch(8, 3, <[u8]>::len), None);
        assert_eq!(db.fetch(u64::MAX, 1, <[u8]>::len), None);
    }

    #[test]
    fn short_read_is_reported_and_zero_filled() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path(), "x.db", Role::Data, 4096);
        db.write(0, b"abc").unwrap();

        let mut buf = [0xff; 5];
        let err = db.read(1, &mut buf).unwrap_err();
        assert!(matches!(err, VfsError::ShortRead { offset: 1, len: 5, used: 3 }));
        assert_eq!(err.code(), crate::codes::IOERR_SHORT_READ);
        assert_eq!(&buf, b"bc\0\0\0");
    }

    #[test]
    fn closed_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = open(dir.path(), "x.db", Role::Data, 4096);
        db.close().unwrap();
        db.close().unwrap();

        assert!(db.is_closed());
        assert!(matches!(db.write(0, b"x"), Err(VfsError::Closed)));
        assert!(matches!(db.sync(SyncFlags::default()), Err(VfsError::Closed)));
    }

    #[test]
    fn stores_of_one_path_share_a_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.db");
        let regions = Arc::new(OpenRegions::new());
        let options = || {
            RegionOptions::new(Mapper::new(MediumDetect::Emulated)).with_initial_capacity(8192)
        };

        let mut a = regions.open(&path, Role::Data, options()).unwrap();
        let mut b = regions.open(&path, Role::Data, options()).unwrap();
        assert_eq!(regions.len(), 1);

        a.write(60_000, b"AAAA").unwrap();
        assert_eq!(b.file_size(), 60_004);
        b.write(10_000, b"BBBB").unwrap();
        assert_eq!(a.fetch(10_000, 4, <[u8]>::to_vec), Some(b"BBBB".to_vec()));

        b.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len() as usize, a.capacity());
        let mut buf = [0; 4];
        a.read(60_000, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAA");

        a.close().unwrap();
        assert!(regions.is_empty());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 60_004);
    }
}
