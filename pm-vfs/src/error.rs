use core::fmt;
use std::io;
use std::path::PathBuf;

use pm_region::RegionError;

use crate::config::ConfigError;

/// Result codes of the host engine's storage-provider contract.
///
/// Extended codes carry the primary code in their low byte.
pub mod codes {
    pub const OK: i32 = 0;
    pub const ERROR: i32 = 1;
    pub const BUSY: i32 = 5;
    pub const NOMEM: i32 = 7;
    pub const IOERR: i32 = 10;
    pub const NOTFOUND: i32 = 12;
    pub const CANTOPEN: i32 = 14;
    pub const MISUSE: i32 = 21;

    pub const IOERR_READ: i32 = IOERR | (1 << 8);
    pub const IOERR_SHORT_READ: i32 = IOERR | (2 << 8);
    pub const IOERR_WRITE: i32 = IOERR | (3 << 8);
    pub const IOERR_FSYNC: i32 = IOERR | (4 << 8);
    pub const IOERR_DIR_FSYNC: i32 = IOERR | (5 << 8);
    pub const IOERR_TRUNCATE: i32 = IOERR | (6 << 8);
    pub const IOERR_FSTAT: i32 = IOERR | (7 << 8);
    pub const IOERR_DELETE: i32 = IOERR | (10 << 8);
    pub const IOERR_CLOSE: i32 = IOERR | (16 << 8);
    pub const IOERR_SHMOPEN: i32 = IOERR | (18 << 8);
    pub const IOERR_SHMSIZE: i32 = IOERR | (19 << 8);
    pub const IOERR_SHMLOCK: i32 = IOERR | (20 << 8);
    pub const IOERR_SHMMAP: i32 = IOERR | (21 << 8);
    pub const IOERR_MMAP: i32 = IOERR | (24 << 8);
}

/// The file system operation an I/O error occurred in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IoOp {
    Open,
    Read,
    Write,
    Sync,
    Stat,
    Delete,
    DirSync,
    Close,
    ShmOpen,
    ShmMap,
    ShmUnmap,
}

#[derive(Debug, thiserror::Error)]
pub enum VfsError {
    #[error("{op} of {} failed: {source}", .path.display())]
    Io {
        op: IoOp,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("out of memory")]
    OutOfMemory(#[source] RegionError),
    #[error("read of {len} bytes at offset {offset} beyond the file size {used}")]
    ShortRead { offset: u64, len: usize, used: usize },
    #[error("{0} are not supported")]
    Unsupported(&'static str),
    /// A file control opcode this provider does not implement.
    #[error("unknown file control")]
    NotFound,
    #[error("the lock is held by another connection")]
    Busy,
    #[error("can not open {}: {reason}", .path.display())]
    CantOpen { path: PathBuf, reason: &'static str },
    #[error("slot size {requested} differs from the established slot size {established}")]
    SlotSize { requested: usize, established: usize },
    #[error("slot size {0} is not a positive multiple of 4 bytes")]
    SlotAlignment(usize),
    #[error("{n} shared lock slots at {offset} are outside of the {slots} lock slots")]
    Range { offset: usize, n: usize, slots: usize },
    #[error("the file handle is closed")]
    Closed,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl VfsError {
    /// Attribute a region failure to the operation that caused it.
    pub fn region(op: IoOp, err: RegionError) -> Self {
        match err {
            RegionError::Io { path, source } => VfsError::Io { op, path, source },
            RegionError::ShortRead { offset, len, used } => {
                VfsError::ShortRead { offset, len, used }
            }
            RegionError::Closed => VfsError::Closed,
            err @ (RegionError::OutOfMemory { .. } | RegionError::Capacity(_)) => {
                VfsError::OutOfMemory(err)
            }
        }
    }

    pub(crate) fn io(op: IoOp, path: impl Into<PathBuf>, source: io::Error) -> Self {
        VfsError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// The result code the host engine expects for this error.
    pub fn code(&self) -> i32 {
        match self {
            VfsError::Io { op, .. } => op.code(),
            VfsError::OutOfMemory(_) => codes::NOMEM,
            VfsError::ShortRead { .. } => codes::IOERR_SHORT_READ,
            VfsError::Unsupported(_) => codes::IOERR,
            VfsError::NotFound => codes::NOTFOUND,
            VfsError::Busy => codes::BUSY,
            VfsError::CantOpen { .. } => codes::CANTOPEN,
            VfsError::SlotSize { .. } | VfsError::SlotAlignment(_) => codes::IOERR_SHMSIZE,
            VfsError::Range { .. } => codes::IOERR_SHMLOCK,
            VfsError::Closed => codes::MISUSE,
            VfsError::Config(_) => codes::ERROR,
        }
    }
}

impl IoOp {
    pub fn code(self) -> i32 {
        match self {
            IoOp::Open => codes::CANTOPEN,
            IoOp::Read => codes::IOERR_READ,
            IoOp::Write => codes::IOERR_WRITE,
            IoOp::Sync => codes::IOERR_FSYNC,
            IoOp::Stat => codes::IOERR_FSTAT,
            IoOp::Delete => codes::IOERR_DELETE,
            IoOp::DirSync => codes::IOERR_DIR_FSYNC,
            IoOp::Close => codes::IOERR_CLOSE,
            IoOp::ShmOpen => codes::IOERR_SHMOPEN,
            IoOp::ShmMap => codes::IOERR_SHMMAP,
            IoOp::ShmUnmap => codes::IOERR_MMAP,
        }
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IoOp::Open => "open",
            IoOp::Read => "read",
            IoOp::Write => "write",
            IoOp::Sync => "sync",
            IoOp::Stat => "stat",
            IoOp::Delete => "delete",
            IoOp::DirSync => "directory sync",
            IoOp::Close => "close",
            IoOp::ShmOpen => "shared index open",
            IoOp::ShmMap => "shared index map",
            IoOp::ShmUnmap => "shared index unmap",
        })
    }
}

#[test]
fn codes_keep_their_primary() {
    use codes::*;

    for code in [
        IOERR_READ,
        IOERR_SHORT_READ,
        IOERR_DELETE,
        IOERR_DIR_FSYNC,
        IOERR_SHMMAP,
    ] {
        assert_eq!(code & 0xff, IOERR);
    }

    assert_eq!(IOERR_SHORT_READ, 522);
    assert_eq!(IOERR_DELETE, 2570);
}

#[test]
fn region_errors_map_onto_the_taxonomy() {
    let short = VfsError::region(
        IoOp::Read,
        RegionError::ShortRead {
            offset: 10,
            len: 1,
            used: 10,
        },
    );
    assert_eq!(short.code(), codes::IOERR_SHORT_READ);

    let io = VfsError::region(
        IoOp::Write,
        RegionError::Io {
            path: "x.db".into(),
            source: io::Error::from_raw_os_error(libc::ENOSPC),
        },
    );
    assert_eq!(io.code(), codes::IOERR_WRITE);

    let oom = VfsError::region(
        IoOp::Write,
        RegionError::Capacity(pm_region::GrowthError::Overflow { requested: 0 }),
    );
    assert_eq!(oom.code(), codes::NOMEM);
}
