//! Typed versions of the flag words exchanged with the host engine.
use pm_region::Role;

/// What the host engine intends to use an opened file for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileKind {
    MainDb,
    MainJournal,
    Wal,
    TempDb,
    TempJournal,
    SubJournal,
    SuperJournal,
    TransientDb,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenFlags {
    pub kind: FileKind,
    pub read_only: bool,
    pub create: bool,
    pub exclusive: bool,
    pub delete_on_close: bool,
}

/// The question asked by an access check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessMode {
    /// The file exists and is not an empty regular file.
    Exists,
    ReadWrite,
    Read,
}

/// The five file lock levels, in increasing strength.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockLevel {
    #[default]
    None,
    Shared,
    Reserved,
    Pending,
    Exclusive,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncFlags {
    pub full: bool,
    pub data_only: bool,
}

/// A lock request on slots of the shared index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShmLockOp {
    LockShared,
    LockExclusive,
    UnlockShared,
    UnlockExclusive,
}

/// The number of lock slots of a shared index.
pub const SHM_NLOCK: usize = 8;

mod bits {
    pub const OPEN_READONLY: u32 = 0x0000_0001;
    pub const OPEN_READWRITE: u32 = 0x0000_0002;
    pub const OPEN_CREATE: u32 = 0x0000_0004;
    pub const OPEN_DELETEONCLOSE: u32 = 0x0000_0008;
    pub const OPEN_EXCLUSIVE: u32 = 0x0000_0010;
    pub const OPEN_MAIN_DB: u32 = 0x0000_0100;
    pub const OPEN_TEMP_DB: u32 = 0x0000_0200;
    pub const OPEN_TRANSIENT_DB: u32 = 0x0000_0400;
    pub const OPEN_MAIN_JOURNAL: u32 = 0x0000_0800;
    pub const OPEN_TEMP_JOURNAL: u32 = 0x0000_1000;
    pub const OPEN_SUBJOURNAL: u32 = 0x0000_2000;
    pub const OPEN_SUPER_JOURNAL: u32 = 0x0000_4000;
    pub const OPEN_WAL: u32 = 0x0008_0000;

    pub const ACCESS_EXISTS: i32 = 0;
    pub const ACCESS_READWRITE: i32 = 1;
    pub const ACCESS_READ: i32 = 2;

    pub const SYNC_NORMAL: i32 = 0x02;
    pub const SYNC_FULL: i32 = 0x03;
    pub const SYNC_DATAONLY: i32 = 0x10;

    pub const SHM_UNLOCK: i32 = 1;
    pub const SHM_LOCK: i32 = 2;
    pub const SHM_SHARED: i32 = 4;
    pub const SHM_EXCLUSIVE: i32 = 8;
}

const KINDS: [(u32, FileKind); 8] = [
    (bits::OPEN_MAIN_DB, FileKind::MainDb),
    (bits::OPEN_MAIN_JOURNAL, FileKind::MainJournal),
    (bits::OPEN_WAL, FileKind::Wal),
    (bits::OPEN_TEMP_DB, FileKind::TempDb),
    (bits::OPEN_TEMP_JOURNAL, FileKind::TempJournal),
    (bits::OPEN_SUBJOURNAL, FileKind::SubJournal),
    (bits::OPEN_SUPER_JOURNAL, FileKind::SuperJournal),
    (bits::OPEN_TRANSIENT_DB, FileKind::TransientDb),
];

impl FileKind {
    /// The durability role of this kind, `None` for files that never outlive their handle.
    pub fn role(self) -> Option<Role> {
        match self {
            FileKind::Wal => Some(Role::Log),
            FileKind::MainDb | FileKind::MainJournal | FileKind::SuperJournal => Some(Role::Data),
            FileKind::TempDb
            | FileKind::TempJournal
            | FileKind::SubJournal
            | FileKind::TransientDb => None,
        }
    }

    pub fn is_temporary(self) -> bool {
        self.role().is_none()
    }
}

impl OpenFlags {
    /// Open read-write, creating the file if missing.
    pub fn new(kind: FileKind) -> Self {
        OpenFlags {
            kind,
            read_only: false,
            create: true,
            exclusive: false,
            delete_on_close: false,
        }
    }

    pub fn main_db() -> Self {
        Self::new(FileKind::MainDb)
    }

    pub fn wal() -> Self {
        Self::new(FileKind::Wal)
    }

    pub fn with_create(self, create: bool) -> Self {
        OpenFlags { create, ..self }
    }

    pub fn with_read_only(self, read_only: bool) -> Self {
        OpenFlags { read_only, ..self }
    }

    /// Decode an open flag word. `None` if it names no file kind.
    pub fn from_bits(flags: u32) -> Option<Self> {
        let &(_, kind) = KINDS.iter().find(|(bit, _)| flags & bit != 0)?;
        let read_only = flags & bits::OPEN_READWRITE == 0 && flags & bits::OPEN_READONLY != 0;

        Some(OpenFlags {
            kind,
            read_only,
            create: flags & bits::OPEN_CREATE != 0,
            exclusive: flags & bits::OPEN_EXCLUSIVE != 0,
            delete_on_close: flags & bits::OPEN_DELETEONCLOSE != 0,
        })
    }

    pub fn bits(&self) -> u32 {
        let kind = KINDS
            .iter()
            .find(|(_, kind)| *kind == self.kind)
            .map_or(0, |&(bit, _)| bit);

        let access = if self.read_only {
            bits::OPEN_READONLY
        } else {
            bits::OPEN_READWRITE
        };

        let mut flags = kind | access;
        for (set, bit) in [
            (self.create, bits::OPEN_CREATE),
            (self.exclusive, bits::OPEN_EXCLUSIVE),
            (self.delete_on_close, bits::OPEN_DELETEONCLOSE),
        ] {
            if set {
                flags |= bit;
            }
        }

        flags
    }
}

impl AccessMode {
    pub fn from_raw(mode: i32) -> Option<Self> {
        match mode {
            bits::ACCESS_EXISTS => Some(AccessMode::Exists),
            bits::ACCESS_READWRITE => Some(AccessMode::ReadWrite),
            bits::ACCESS_READ => Some(AccessMode::Read),
            _ => None,
        }
    }
}

impl LockLevel {
    pub fn from_raw(level: i32) -> Option<Self> {
        Some(match level {
            0 => LockLevel::None,
            1 => LockLevel::Shared,
            2 => LockLevel::Reserved,
            3 => LockLevel::Pending,
            4 => LockLevel::Exclusive,
            _ => return None,
        })
    }
}

impl SyncFlags {
    pub fn from_raw(flags: i32) -> Self {
        SyncFlags {
            full: flags & 0x0f == bits::SYNC_FULL,
            data_only: flags & bits::SYNC_DATAONLY != 0,
        }
    }

    pub fn raw(&self) -> i32 {
        let base = if self.full {
            bits::SYNC_FULL
        } else {
            bits::SYNC_NORMAL
        };

        if self.data_only {
            base | bits::SYNC_DATAONLY
        } else {
            base
        }
    }
}

impl ShmLockOp {
    pub fn from_raw(flags: i32) -> Option<Self> {
        let lock = flags & (bits::SHM_LOCK | bits::SHM_UNLOCK);
        let kind = flags & (bits::SHM_SHARED | bits::SHM_EXCLUSIVE);

        Some(match (lock, kind) {
            (bits::SHM_LOCK, bits::SHM_SHARED) => ShmLockOp::LockShared,
            (bits::SHM_LOCK, bits::SHM_EXCLUSIVE) => ShmLockOp::LockExclusive,
            (bits::SHM_UNLOCK, bits::SHM_SHARED) => ShmLockOp::UnlockShared,
            (bits::SHM_UNLOCK, bits::SHM_EXCLUSIVE) => ShmLockOp::UnlockExclusive,
            _ => return None,
        })
    }

    pub fn is_unlock(self) -> bool {
        matches!(self, ShmLockOp::UnlockShared | ShmLockOp::UnlockExclusive)
    }
}

#[test]
fn open_flags_from_host_words() {
    let main = OpenFlags::from_bits(0x0000_0106).unwrap();
    assert_eq!(main, OpenFlags::main_db());
    assert_eq!(main.bits(), 0x0000_0106);

    let wal = OpenFlags::from_bits(0x0008_0006).unwrap();
    assert_eq!(wal.kind, FileKind::Wal);
    assert_eq!(wal.kind.role(), Some(Role::Log));

    let temp = OpenFlags::from_bits(0x0000_021e).unwrap();
    assert_eq!(temp.kind, FileKind::TempDb);
    assert!(temp.delete_on_close);
    assert!(temp.kind.is_temporary());

    let read_only = OpenFlags::from_bits(0x0000_0101).unwrap();
    assert!(read_only.read_only);
    assert!(!read_only.create);

    assert_eq!(OpenFlags::from_bits(0x0000_0006), None);
}

#[test]
fn lock_words() {
    assert!(LockLevel::Exclusive > LockLevel::Reserved);
    assert_eq!(LockLevel::from_raw(2), Some(LockLevel::Reserved));
    assert_eq!(LockLevel::from_raw(5), None);

    assert_eq!(ShmLockOp::from_raw(2 | 8), Some(ShmLockOp::LockExclusive));
    assert_eq!(ShmLockOp::from_raw(1 | 4), Some(ShmLockOp::UnlockShared));
    assert_eq!(ShmLockOp::from_raw(3 | 4), None);

    let sync = SyncFlags::from_raw(0x13);
    assert!(sync.full && sync.data_only);
    assert_eq!(sync.raw(), 0x13);
    assert_eq!(SyncFlags::from_raw(0x02), SyncFlags::default());
}
