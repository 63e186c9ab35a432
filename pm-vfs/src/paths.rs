//! Where files live.
//!
//! The log and the shared index of a database are named by fixed suffixes of the database path.
//! With a configured persistent memory directory, both are placed there instead of next to the
//! database. Full path names are resolved the way the host engine expects them: absolute, free
//! of `.` and `..`, with symbolic links followed.
use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::{IoOp, VfsError};

pub const WAL_SUFFIX: &str = "-wal";
pub const SHM_SUFFIX: &str = "-shm";
pub const JOURNAL_SUFFIX: &str = "-journal";

/// Links followed while resolving a single path before giving up.
pub const MAX_SYMLINKS: u32 = 100;

/// A resolved path name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FullPath {
    pub path: PathBuf,
    /// Whether resolution went through at least one symbolic link.
    pub followed_symlink: bool,
}

/// Append `suffix` to the file name of `path`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Move `path` into `pm_dir`, keeping its file name.
pub fn relocate(path: &Path, pm_dir: Option<&Path>) -> PathBuf {
    match (pm_dir, path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path.to_owned(),
    }
}

/// Whether `path` names a log or shared index, by its suffix.
pub fn is_pm_resident(path: &Path) -> bool {
    path.file_name()
        .and_then(OsStr::to_str)
        .map_or(false, |name| {
            name.ends_with(WAL_SUFFIX) || name.ends_with(SHM_SUFFIX)
        })
}

/// The shared index belonging to the database at `db`.
pub fn shm_path(db: &Path, pm_dir: Option<&Path>) -> PathBuf {
    relocate(&with_suffix(db, SHM_SUFFIX), pm_dir)
}

/// Resolve `path` against the working directory and normalize it.
pub fn full_pathname(path: &Path, max_pathname: usize) -> Result<FullPath, VfsError> {
    let mut resolver = Resolver {
        out: PathBuf::from("/"),
        symlinks: 0,
    };

    if path.is_relative() {
        let cwd = std::env::current_dir()
            .map_err(|source| VfsError::io(IoOp::Stat, ".", source))?;
        resolver.append_all(&cwd)?;
    }

    resolver.append_all(path)?;

    if resolver.out.as_os_str().len() >= max_pathname {
        return Err(VfsError::CantOpen {
            path: resolver.out,
            reason: "path name too long",
        });
    }

    Ok(FullPath {
        path: resolver.out,
        followed_symlink: resolver.symlinks > 0,
    })
}

struct Resolver {
    out: PathBuf,
    symlinks: u32,
}

impl Resolver {
    fn append_all(&mut self, path: &Path) -> Result<(), VfsError> {
        for component in path.components() {
            match component {
                Component::RootDir => self.out = PathBuf::from("/"),
                Component::CurDir | Component::Prefix(_) => {}
                Component::ParentDir => {
                    if !self.out.pop() {
                        return Err(VfsError::CantOpen {
                            path: path.to_owned(),
                            reason: "path leaves the root directory",
                        });
                    }
                }
                Component::Normal(name) => self.append_one(name)?,
            }
        }

        Ok(())
    }

    fn append_one(&mut self, name: &OsStr) -> Result<(), VfsError> {
        self.out.push(name);

        let meta = match std::fs::symlink_metadata(&self.out) {
            Ok(meta) => meta,
            // The remainder is created later, or never.
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => return Err(VfsError::io(IoOp::Stat, &self.out, source)),
        };

        if !meta.file_type().is_symlink() {
            return Ok(());
        }

        self.symlinks += 1;
        if self.symlinks > MAX_SYMLINKS {
            return Err(VfsError::CantOpen {
                path: self.out.clone(),
                reason: "too many levels of symbolic links",
            });
        }

        let target = std::fs::read_link(&self.out)
            .map_err(|source| VfsError::io(IoOp::Stat, &self.out, source))?;
        self.out.pop();
        self.append_all(&target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_names() {
        let db = Path::new("/data/bench/database.db");
        assert_eq!(
            with_suffix(db, WAL_SUFFIX),
            Path::new("/data/bench/database.db-wal")
        );
        assert_eq!(shm_path(db, None), Path::new("/data/bench/database.db-shm"));
        assert_eq!(
            shm_path(db, Some(Path::new("/mnt/pmem0"))),
            Path::new("/mnt/pmem0/database.db-shm")
        );

        assert!(is_pm_resident(Path::new("/x/database.db-wal")));
        assert!(is_pm_resident(Path::new("database.db-shm")));
        assert!(!is_pm_resident(Path::new("/x/database.db")));
        assert!(!is_pm_resident(Path::new("/x/database.db-journal")));
    }

    #[test]
    fn normalizes_dots() {
        let full = full_pathname(Path::new("/tmp/./a/../b.db"), 512).unwrap();
        assert_eq!(full.path, Path::new("/tmp/b.db"));

        let full = full_pathname(Path::new("b.db"), 512).unwrap();
        assert!(full.path.is_absolute());
        assert!(full.path.ends_with("b.db"));

        assert!(full_pathname(Path::new("/.."), 512).is_err());
    }

    #[test]
    fn follows_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        let real = dir.join("real");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink("real", dir.join("link")).unwrap();

        let full = full_pathname(&dir.join("link").join("x.db"), 512).unwrap();
        assert_eq!(full.path, real.join("x.db"));
        assert!(full.followed_symlink);

        let full = full_pathname(&real.join("x.db"), 512).unwrap();
        assert!(!full.followed_symlink);
    }

    #[test]
    fn symlink_loops_are_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().canonicalize().unwrap();
        std::os::unix::fs::symlink("loop", dir.join("loop")).unwrap();

        let err = full_pathname(&dir.join("loop"), 512).unwrap_err();
        assert!(matches!(err, VfsError::CantOpen { .. }));
    }

    #[test]
    fn long_paths_are_rejected() {
        let long = "/a".repeat(300);
        let err = full_pathname(Path::new(&long), 512).unwrap_err();
        assert!(matches!(err, VfsError::CantOpen { .. }));
    }
}
