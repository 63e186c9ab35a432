use core::sync::atomic::AtomicU32;
use std::ffi::CString;
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use pm_region::{Mapper, RegionOptions};
use tracing::{debug, trace};

use crate::config::{LockingMode, VfsConfig};
use crate::file::PmemFile;
use crate::lock::{LockTable, Locker};
use crate::paths::{self, FullPath};
use crate::shm::{SharedIndexRegion, SlotRef};
use crate::store::OpenRegions;
use crate::{
    AccessMode, FileKind, IoOp, LockLevel, OpenFlags, ShmLockOp, SyncFlags, VfsError,
};

/// An open file, as the host engine drives it.
pub trait VfsFile: Send {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), VfsError>;
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), VfsError>;
    fn truncate(&mut self, size: u64) -> Result<(), VfsError>;
    fn sync(&mut self, flags: SyncFlags) -> Result<(), VfsError>;
    fn file_size(&self) -> Result<u64, VfsError>;

    fn lock(&mut self, level: LockLevel) -> Result<(), VfsError>;
    fn unlock(&mut self, level: LockLevel) -> Result<(), VfsError>;
    fn check_reserved_lock(&self) -> Result<bool, VfsError>;

    /// No file controls are understood by default.
    fn file_control(&mut self, _op: i32) -> Result<(), VfsError> {
        Err(VfsError::NotFound)
    }

    fn sector_size(&self) -> u32;

    fn device_characteristics(&self) -> u32 {
        0
    }

    fn shm_map(
        &mut self,
        index: usize,
        slot_size: usize,
        extend: bool,
    ) -> Result<Option<SlotRef>, VfsError>;
    /// Resolve a slot returned by [`VfsFile::shm_map`] to memory.
    fn shm_slot(&self, slot: SlotRef) -> Option<&[AtomicU32]>;
    fn shm_lock(&mut self, offset: usize, n: usize, op: ShmLockOp) -> Result<(), VfsError>;
    fn shm_barrier(&self);
    fn shm_unmap(&mut self, delete: bool) -> Result<(), VfsError>;

    fn close(&mut self) -> Result<(), VfsError>;
}

/// A storage provider, the file system as the host engine sees it.
pub trait Vfs: Send + Sync {
    fn name(&self) -> &str;
    fn max_pathname(&self) -> usize;

    /// Open `path`. Providers without temporary file support reject `None`.
    fn open(&self, path: Option<&Path>, flags: OpenFlags) -> Result<Box<dyn VfsFile>, VfsError>;
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<(), VfsError>;
    fn access(&self, path: &Path, mode: AccessMode) -> Result<bool, VfsError>;
    fn full_pathname(&self, path: &Path) -> Result<FullPath, VfsError>;

    fn dl_open(&self, _path: &Path) -> Result<(), VfsError> {
        Err(VfsError::Unsupported("loadable extensions"))
    }

    fn dl_error(&self) -> String {
        "Loadable extensions are not supported".to_owned()
    }

    fn dl_sym(&self, _symbol: &str) -> Result<(), VfsError> {
        Err(VfsError::Unsupported("loadable extensions"))
    }

    fn dl_close(&self) {}

    /// Fill `buf` with random bytes. Returns how many bytes were filled.
    fn randomness(&self, buf: &mut [u8]) -> usize;
    /// Sleep at least `duration`, returning the time actually requested from the OS.
    fn sleep(&self, duration: Duration) -> Duration;
    /// The current time as a Julian day number.
    fn current_time(&self) -> f64;
    /// The current time in milliseconds since the Julian epoch.
    fn current_time_millis(&self) -> i64;
    fn last_error(&self) -> i32;
}

/// The persistent memory storage provider.
pub struct PmemVfs {
    config: VfsConfig,
    mapper: Mapper,
    locks: Arc<LockTable>,
    regions: Arc<OpenRegions>,
}

/// Noon in Greenwich on November 24, 4714 B.C., relative to the Unix epoch, in milliseconds.
const UNIX_EPOCH_JULIAN_MS: i64 = 24_405_875 * 8_640_000;

impl PmemVfs {
    pub fn new(config: VfsConfig) -> Result<Self, VfsError> {
        config.validate()?;
        let mapper = Mapper::new(config.medium);

        debug!(
            name = %config.name,
            pm_dir = ?config.pm_dir,
            medium = ?config.medium,
            locking = ?config.locking,
            "created provider"
        );

        Ok(PmemVfs {
            config,
            mapper,
            locks: Arc::new(LockTable::new()),
            regions: Arc::new(OpenRegions::new()),
        })
    }

    /// A provider configured from the environment, see [`VfsConfig::from_env`].
    pub fn from_env() -> Result<Self, VfsError> {
        Self::new(VfsConfig::from_env()?)
    }

    /// Use a custom mapper, for instance one with an injected vtable.
    pub fn with_mapper(config: VfsConfig, mapper: Mapper) -> Result<Self, VfsError> {
        Ok(PmemVfs {
            mapper,
            ..Self::new(config)?
        })
    }

    pub fn config(&self) -> &VfsConfig {
        &self.config
    }

    pub fn lock_table(&self) -> &Arc<LockTable> {
        &self.locks
    }

    /// Regions of the database and log files open through this provider.
    pub fn open_regions(&self) -> &Arc<OpenRegions> {
        &self.regions
    }

    fn region_options(&self) -> Result<RegionOptions, VfsError> {
        Ok(RegionOptions::new(self.mapper.clone())
            .with_initial_capacity(self.config.initial_capacity)
            .with_growth(self.config.growth()?))
    }

    /// Where a file of `kind` opened as `path` actually lives.
    pub fn resolve(&self, path: &Path, kind: FileKind) -> PathBuf {
        let pm_dir = self.config.pm_dir.as_deref();
        if kind == FileKind::Wal || paths::is_pm_resident(path) {
            paths::relocate(path, pm_dir)
        } else {
            path.to_owned()
        }
    }

    /// Open a file, returning the concrete handle.
    pub fn open_file(&self, path: Option<&Path>, flags: OpenFlags) -> Result<PmemFile, VfsError> {
        let (Some(path), Some(role)) = (path, flags.kind.role()) else {
            return Err(VfsError::Unsupported("temporary files"));
        };

        if flags.delete_on_close {
            return Err(VfsError::Unsupported("temporary files"));
        }

        let real = self.resolve(path, flags.kind);
        if !flags.create && !real.exists() {
            return Err(VfsError::CantOpen {
                path: real,
                reason: "file does not exist",
            });
        }

        let store = self.regions.open(&real, role, self.region_options()?)?;

        let shm = (flags.kind == FileKind::MainDb).then(|| -> Result<_, VfsError> {
            let shm_path = paths::shm_path(path, self.config.pm_dir.as_deref());
            Ok(SharedIndexRegion::new(
                shm_path,
                self.region_options()?,
                self.config.shm_base_size,
            ))
        });

        let locker = match self.config.locking {
            LockingMode::Noop => Locker::Noop,
            LockingMode::InProcess => Locker::in_process(Arc::clone(&self.locks), &real),
        };

        debug!(
            path = %real.display(),
            kind = ?flags.kind,
            medium = ?store.medium(),
            "opened file"
        );

        Ok(PmemFile::new(
            flags.kind,
            store,
            shm.transpose()?,
            locker,
            self.config.sector_size,
        ))
    }
}

impl Vfs for PmemVfs {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn max_pathname(&self) -> usize {
        self.config.max_pathname
    }

    fn open(&self, path: Option<&Path>, flags: OpenFlags) -> Result<Box<dyn VfsFile>, VfsError> {
        Ok(Box::new(self.open_file(path, flags)?))
    }

    /// Unlink `path`. A missing file is not an error.
    fn delete(&self, path: &Path, sync_dir: bool) -> Result<(), VfsError> {
        let real = self.resolve(path, FileKind::MainDb);

        match std::fs::remove_file(&real) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(VfsError::io(IoOp::Delete, real, source)),
        }

        debug!(path = %real.display(), sync_dir, "deleted file");

        let dir = match real.parent() {
            Some(dir) if sync_dir && !dir.as_os_str().is_empty() => dir,
            _ => return Ok(()),
        };

        File::open(dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|source| VfsError::io(IoOp::DirSync, dir, source))
    }

    fn access(&self, path: &Path, mode: AccessMode) -> Result<bool, VfsError> {
        let real = self.resolve(path, FileKind::MainDb);

        if mode == AccessMode::Exists {
            return Ok(match std::fs::metadata(&real) {
                Ok(meta) => !meta.is_file() || meta.len() > 0,
                Err(_) => false,
            });
        }

        let bits = match mode {
            AccessMode::ReadWrite => libc::R_OK | libc::W_OK,
            _ => libc::R_OK,
        };

        let c_path = CString::new(real.as_os_str().as_bytes()).map_err(|_| VfsError::CantOpen {
            path: real.clone(),
            reason: "path contains a nul byte",
        })?;

        Ok(unsafe { libc::access(c_path.as_ptr(), bits) } == 0)
    }

    fn full_pathname(&self, path: &Path) -> Result<FullPath, VfsError> {
        paths::full_pathname(path, self.config.max_pathname)
    }

    fn randomness(&self, buf: &mut [u8]) -> usize {
        let filled = File::open("/dev/urandom").and_then(|mut dev| dev.read_exact(buf));
        if filled.is_ok() {
            return buf.len();
        }

        trace!("no /dev/urandom, seeding randomness from time and pid");
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |now| now.as_nanos() as u64);
        let seed = now ^ (u64::from(std::process::id()) << 32);

        for (chunk, i) in buf.chunks_mut(8).zip(0u64..) {
            let word = splitmix(seed.wrapping_add(i));
            chunk.copy_from_slice(&word.to_ne_bytes()[..chunk.len()]);
        }

        buf.len()
    }

    fn sleep(&self, duration: Duration) -> Duration {
        std::thread::sleep(duration);
        duration
    }

    fn current_time(&self) -> f64 {
        self.current_time_millis() as f64 / 86_400_000.0
    }

    fn current_time_millis(&self) -> i64 {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |now| now.as_millis() as i64);
        UNIX_EPOCH_JULIAN_MS + since_epoch
    }

    fn last_error(&self) -> i32 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    }
}

fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e37_79b9_7f4a_7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    x ^ (x >> 31)
}
