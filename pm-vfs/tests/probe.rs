#![cfg(all(target_family = "unix", feature = "pm-probe"))]
use assert_cmd::Command;

fn probe() -> Command {
    let mut cmd = Command::cargo_bin("pm-probe").unwrap();
    cmd.env("PMEM_IS_PMEM_FORCE", "0")
        .env_remove("PMEM_VFS_DIR")
        .env_remove("PMEM_VFS_INITIAL_CAPACITY")
        .env_remove("PMEM_VFS_LOCKING");
    cmd
}

#[test]
fn writes_and_dumps_a_log() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probe.db-wal");

    let assert = probe()
        .arg(&path)
        .args(["--kind", "wal", "--write", "hello pmem", "--dump", "10"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("medium: Emulated"), "{stdout}");
    assert!(stdout.contains("flushes: 1 after writes"), "{stdout}");
    assert!(stdout.contains("hello pmem"), "{stdout}");

    assert_eq!(std::fs::read(&path).unwrap(), b"hello pmem");
}

#[test]
fn syncs_a_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("probe.db");

    let assert = probe()
        .arg(&path)
        .args(["--write", "page", "--offset", "4", "--sync"])
        .assert()
        .success();

    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    assert!(stdout.contains("1 on sync"), "{stdout}");
    assert_eq!(std::fs::read(&path).unwrap(), b"\0\0\0\0page");
}

#[test]
fn reports_bad_configuration() {
    let dir = tempfile::tempdir().unwrap();

    probe()
        .env("PMEM_VFS_LOCKING", "flock")
        .arg(dir.path().join("x.db"))
        .assert()
        .failure();
}
