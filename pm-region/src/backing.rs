//! Owns the backing file of a region, with known size.
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

/// An open backing file, with all information about its size.
#[derive(Debug)]
pub struct Backing {
    file: File,
    path: PathBuf,
    /// The length of the file, as of open, our last resize or the last refresh.
    len: u64,
    /// Whether the file did not exist before we opened it.
    created: bool,
}

impl Backing {
    /// Open `path` for reading and writing, creating an empty file if it is missing.
    pub fn open_or_create(path: &Path) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true).mode(0o666);

        let (file, created) = match options.open(path) {
            Ok(file) => (file, false),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                (options.create(true).open(path)?, true)
            }
            Err(err) => return Err(err),
        };

        let mut backing = Backing::from_file(file, path)?;
        backing.created = created;
        Ok(backing)
    }

    /// Wrap an already open file.
    ///
    /// The file must be opened for reading and writing. The path is only used for diagnostics and
    /// for deletion by the owner.
    pub fn from_file(file: File, path: &Path) -> io::Result<Self> {
        let len = file.metadata()?.len();
        Ok(Backing {
            file,
            path: path.to_owned(),
            len,
            created: false,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    /// Re-read the length from the file system.
    ///
    /// Other handles of the same file may have resized it since we last looked.
    pub fn refresh_len(&mut self) -> io::Result<u64> {
        self.len = self.file.metadata()?.len();
        Ok(self.len)
    }

    /// Make the file at least `len` bytes long. Never shrinks it.
    ///
    /// A mapping must never reach past the end of the file, including mappings of other handles.
    pub fn extend_to(&mut self, len: u64) -> io::Result<()> {
        if self.refresh_len()? >= len {
            return Ok(());
        }

        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Shrink or grow the file to exactly `len` bytes.
    ///
    /// Only valid once no mapping of the file reaches past `len`.
    pub fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }
}

impl AsRawFd for Backing {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

#[test]
fn creates_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fresh.db");

    let backing = Backing::open_or_create(&path).unwrap();
    assert!(backing.is_created());
    assert!(backing.is_empty());
    drop(backing);

    std::fs::write(&path, b"0123").unwrap();
    let backing = Backing::open_or_create(&path).unwrap();
    assert!(!backing.is_created());
    assert_eq!(backing.len(), 4);
}

#[test]
fn missing_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("no-such-dir").join("file.db");
    let err = Backing::open_or_create(&path).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::NotFound);
}

#[test]
fn extend_never_shrinks() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let mut first = Backing::open_or_create(&path).unwrap();
    let mut second = Backing::open_or_create(&path).unwrap();

    first.extend_to(60_000).unwrap();
    assert_eq!(second.len(), 0);

    // The second handle still believes the file is empty.
    second.extend_to(16_384).unwrap();
    assert_eq!(second.len(), 60_000);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 60_000);

    second.extend_to(70_000).unwrap();
    assert_eq!(first.refresh_len().unwrap(), 70_000);
}
