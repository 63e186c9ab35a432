//! A storage provider that keeps database and write-ahead log files in persistent memory.
//!
//! The host engine opens files through a [`Vfs`] and drives them through [`VfsFile`]. Here every
//! file is a [`PageStore`], one growable mapping of the backing file, and durability comes from
//! flushing that mapping instead of `write(2)` and `fsync(2)`:
//!
//! - log writes are flushed before they return, so syncing the log is free;
//! - database writes are flushed together when the engine syncs.
//!
//! The shared index the engine keeps next to its log is a [`SharedIndexRegion`], mapped from a
//! file as well and handed out in slots.
//!
//! ## Locking
//!
//! By default nothing is locked. That is only correct as long as a single connection uses each
//! database, which is the deployment this provider was built for. Set
//! [`LockingMode::InProcess`] to have connections of one process exclude each other.
//!
//! ## Usage
//!
//! ```no_run
//! use pm_vfs::{OpenFlags, PmemVfs, Vfs, VfsConfig, VfsFile};
//! use std::path::Path;
//!
//! let vfs = PmemVfs::new(VfsConfig::from_env()?)?;
//! let mut wal = vfs.open(Some(Path::new("/mnt/pmem0/bench.db-wal")), OpenFlags::wal())?;
//! wal.write(0, b"commit record")?;
//! // Already durable, nothing to sync.
//! # Ok::<(), pm_vfs::VfsError>(())
//! ```
pub mod config;
mod error;
mod file;
mod flags;
pub mod lock;
pub mod paths;
mod registry;
mod shm;
mod store;
mod vfs;

pub use config::{ConfigError, LockingMode, VfsConfig, VfsConfigBuilder};
pub use error::{codes, IoOp, VfsError};
pub use file::PmemFile;
pub use flags::{AccessMode, FileKind, LockLevel, OpenFlags, ShmLockOp, SyncFlags, SHM_NLOCK};
pub use paths::FullPath;
pub use registry::VfsRegistry;
pub use shm::{SharedIndexRegion, ShmState, SlotRef};
pub use store::{FlushStats, OpenRegions, PageStore, SharedRegion};
pub use vfs::{PmemVfs, Vfs, VfsFile};

pub use pm_region::{Medium, MediumDetect, Role};

#[cfg(test)]
mod tests;
