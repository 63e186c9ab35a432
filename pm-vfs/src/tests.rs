use core::sync::atomic::Ordering;
use std::path::Path;
use std::time::Duration;

use crate::{
    codes, AccessMode, FileKind, LockLevel, LockingMode, MediumDetect, OpenFlags, PmemVfs,
    ShmLockOp, SyncFlags, Vfs, VfsConfig, VfsConfigBuilder, VfsError, VfsFile,
};

fn with_vfs(f: impl FnOnce(&Path, PmemVfs)) {
    with_config(VfsConfig::builder(), f)
}

fn with_config(builder: VfsConfigBuilder, f: impl FnOnce(&Path, PmemVfs)) {
    let dir = tempfile::tempdir().unwrap();
    let config = builder.medium(MediumDetect::Emulated).build().unwrap();
    f(dir.path(), PmemVfs::new(config).unwrap());
}

#[test]
fn temporary_files_are_unsupported() {
    with_vfs(|dir, vfs| {
        let err = vfs.open(None, OpenFlags::main_db()).err().unwrap();
        assert!(matches!(err, VfsError::Unsupported("temporary files")));

        let temp = OpenFlags::new(FileKind::TempJournal);
        let err = vfs.open(Some(&dir.join("t")), temp).err().unwrap();
        assert!(matches!(err, VfsError::Unsupported(_)));
        assert_eq!(err.code(), codes::IOERR);
    });
}

#[test]
fn missing_file_without_create() {
    with_vfs(|dir, vfs| {
        let flags = OpenFlags::main_db().with_create(false);
        let err = vfs.open(Some(&dir.join("gone.db")), flags).err().unwrap();
        assert_eq!(err.code(), codes::CANTOPEN);
    });
}

#[test]
fn file_contract_defaults() {
    with_vfs(|dir, vfs| {
        let mut file = vfs.open(Some(&dir.join("x.db")), OpenFlags::main_db()).unwrap();

        assert!(matches!(file.file_control(14), Err(VfsError::NotFound)));
        assert_eq!(file.sector_size(), 4096);
        assert_eq!(file.device_characteristics(), 0);
        assert_eq!(file.file_size().unwrap(), 0);

        // No-op locking grants everything and reports nothing held.
        file.lock(LockLevel::Exclusive).unwrap();
        assert!(!file.check_reserved_lock().unwrap());
        file.shm_lock(0, 8, ShmLockOp::LockExclusive).unwrap();
        file.unlock(LockLevel::None).unwrap();

        file.close().unwrap();
        file.close().unwrap();
        assert!(matches!(file.file_size(), Err(VfsError::Closed)));
    });
}

#[test]
fn logs_live_in_the_pm_directory() {
    let pm = tempfile::tempdir().unwrap();
    let builder = VfsConfig::builder().pm_dir(pm.path());

    with_config(builder, |dir, vfs| {
        let db = dir.join("bench.db");
        let wal = dir.join("bench.db-wal");

        let mut file = vfs.open_file(Some(&db), OpenFlags::main_db()).unwrap();
        file.write(0, b"page").unwrap();
        assert_eq!(file.path(), db);
        assert_eq!(file.shm().unwrap().path(), pm.path().join("bench.db-shm"));

        let mut log = vfs.open_file(Some(&wal), OpenFlags::wal()).unwrap();
        log.write(0, b"frame").unwrap();
        assert_eq!(log.path(), pm.path().join("bench.db-wal"));
        drop(log);

        assert!(pm.path().join("bench.db-wal").exists());
        assert!(!wal.exists());
        assert!(vfs.access(&wal, AccessMode::Exists).unwrap());

        vfs.delete(&wal, true).unwrap();
        assert!(!pm.path().join("bench.db-wal").exists());
    });
}

#[test]
fn delete_and_access() {
    with_vfs(|dir, vfs| {
        let path = dir.join("x.db");
        assert!(!vfs.access(&path, AccessMode::Exists).unwrap());
        vfs.delete(&path, true).unwrap();

        // Empty regular files do not count as existing.
        std::fs::write(&path, []).unwrap();
        assert!(!vfs.access(&path, AccessMode::Exists).unwrap());
        assert!(vfs.access(&path, AccessMode::ReadWrite).unwrap());
        assert!(vfs.access(dir, AccessMode::Exists).unwrap());

        std::fs::write(&path, b"x").unwrap();
        assert!(vfs.access(&path, AccessMode::Exists).unwrap());

        vfs.delete(&path, true).unwrap();
        assert!(!path.exists());
    });
}

#[test]
fn in_process_locking_excludes_handles() {
    let builder = VfsConfig::builder().locking(LockingMode::InProcess);

    with_config(builder, |dir, vfs| {
        let path = dir.join("x.db");
        let mut a = vfs.open(Some(&path), OpenFlags::main_db()).unwrap();
        let mut b = vfs.open(Some(&path), OpenFlags::main_db()).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        a.lock(LockLevel::Exclusive).unwrap();

        let err = b.lock(LockLevel::Shared).unwrap_err();
        assert_eq!(err.code(), codes::BUSY);
        assert!(b.check_reserved_lock().unwrap());

        a.shm_lock(0, 1, ShmLockOp::LockExclusive).unwrap();
        assert!(b.shm_lock(0, 1, ShmLockOp::LockShared).is_err());
        assert!(matches!(
            b.shm_lock(4, 5, ShmLockOp::LockShared),
            Err(VfsError::Range { .. })
        ));

        a.close().unwrap();
        b.lock(LockLevel::Shared).unwrap();
        b.shm_lock(0, 1, ShmLockOp::LockShared).unwrap();
        drop(b);

        assert!(vfs.lock_table().is_empty());
    });
}

#[test]
fn shared_index_through_the_file() {
    with_vfs(|dir, vfs| {
        let mut db = vfs.open(Some(&dir.join("x.db")), OpenFlags::main_db()).unwrap();
        assert_eq!(db.shm_map(0, 32768, false).unwrap(), None);

        let slot = db.shm_map(0, 32768, true).unwrap().unwrap();
        db.shm_slot(slot).unwrap()[0].store(7, Ordering::Release);
        db.shm_barrier();

        let again = db.shm_map(0, 32768, false).unwrap().unwrap();
        assert_eq!(again, slot);
        assert_eq!(db.shm_slot(again).unwrap()[0].load(Ordering::Acquire), 7);

        db.shm_unmap(true).unwrap();
        assert!(db.shm_slot(slot).is_none());
        assert!(!dir.join("x.db-shm").exists());

        // Only database files have a shared index.
        let mut wal = vfs.open(Some(&dir.join("x.db-wal")), OpenFlags::wal()).unwrap();
        assert!(matches!(
            wal.shm_map(0, 32768, true),
            Err(VfsError::Unsupported(_))
        ));
        wal.shm_barrier();
        wal.shm_unmap(true).unwrap();
    });
}

#[test]
fn sync_of_the_database() {
    with_vfs(|dir, vfs| {
        let mut db = vfs.open_file(Some(&dir.join("x.db")), OpenFlags::main_db()).unwrap();
        db.write(0, &[3; 8192]).unwrap();
        db.sync(SyncFlags::default()).unwrap();
        assert_eq!(db.store().stats().sync_flushes, 1);
        assert_eq!(db.fetch(8191, 1, |page| page[0]), Some(3));
    });
}

#[test]
fn system_services() {
    with_vfs(|dir, vfs| {
        assert_eq!(vfs.name(), "pmem");
        assert_eq!(vfs.max_pathname(), 512);
        assert!(matches!(
            vfs.dl_open(Path::new("libext.so")),
            Err(VfsError::Unsupported("loadable extensions"))
        ));
        assert!(vfs.dl_sym("init").is_err());
        assert!(vfs.dl_error().contains("not supported"));

        let mut a = [0u8; 37];
        let mut b = [0u8; 37];
        assert_eq!(vfs.randomness(&mut a), 37);
        vfs.randomness(&mut b);
        assert_ne!(a, b);

        let slept = vfs.sleep(Duration::from_micros(10));
        assert!(slept >= Duration::from_micros(10));

        // Some day after 2020-01-01.
        assert!(vfs.current_time() > 2_458_849.5);
        let millis = vfs.current_time_millis();
        assert!((millis as f64 / 86_400_000.0 - vfs.current_time()).abs() < 1.0);

        let full = vfs.full_pathname(&dir.join("./x.db")).unwrap();
        assert!(full.path.is_absolute());
    });
}

#[test]
fn handles_of_one_file_share_its_mapping() {
    let builder = VfsConfig::builder()
        .locking(LockingMode::InProcess)
        .initial_capacity(8192);

    with_config(builder, |dir, vfs| {
        let path = dir.join("x.db");
        let mut a = vfs.open(Some(&path), OpenFlags::main_db()).unwrap();
        let mut b = vfs.open(Some(&path), OpenFlags::main_db()).unwrap();

        a.write(60_000, b"AAAA").unwrap();
        assert_eq!(b.file_size().unwrap(), 60_004);
        b.write(10_000, b"BBBB").unwrap();
        b.close().unwrap();

        let mut buf = [0; 4];
        a.read(60_000, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAA");
        a.read(10_000, &mut buf).unwrap();
        assert_eq!(&buf, b"BBBB");
        assert!(!vfs.open_regions().is_empty());

        drop(a);
        assert!(vfs.open_regions().is_empty());
        let stored = std::fs::read(&path).unwrap();
        assert_eq!(stored.len(), 60_004);
        assert_eq!(&stored[10_000..10_004], b"BBBB");
        assert_eq!(&stored[60_000..], b"AAAA");
    });
}
