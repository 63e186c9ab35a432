use core::ops::Range;
use core::ptr::NonNull;
use core::sync::atomic::AtomicU32;
use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use crate::{Backing, Flush, GrowthError, GrowthPolicy, MapError, Mapped, Mapper, Medium};

/// Parameters of a [`MappedRegion`].
#[derive(Clone)]
pub struct RegionOptions {
    /// Capacity mapped for a file that is new or empty.
    pub initial_capacity: usize,
    pub growth: GrowthPolicy,
    pub mapper: Mapper,
    /// Shrink the backing file to the used length when the region is closed.
    pub trim_on_close: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RegionError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("can not map {requested} bytes: {source}")]
    OutOfMemory {
        requested: usize,
        #[source]
        source: MapError,
    },
    #[error("read of {len} bytes at offset {offset} beyond the used length {used}")]
    ShortRead { offset: u64, len: usize, used: usize },
    #[error("the region is closed")]
    Closed,
    #[error(transparent)]
    Capacity(#[from] GrowthError),
}

/// One shared mapping of one backing file.
///
/// The mapping has a capacity, the number of mapped bytes, and a used length, the number of bytes
/// that are logically valid. Readers observe the used length as the size of the file. The
/// capacity only ever changes through the [`GrowthPolicy`], the used length only ever grows.
pub struct MappedRegion {
    backing: Backing,
    /// The mapping itself. It is important that we never return a reference to it that outlives a
    /// borrow of `self`: growth moves it, and we unmap it on `Drop`.
    mapped: Option<Mapped>,
    used: usize,
    medium: Medium,
    options: RegionOptions,
    remaps: u64,
    closed: bool,
}

// Safety: the mapping is exclusively owned, all mutation goes through `&mut self`.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl RegionOptions {
    /// 8 KiB, a couple of database pages.
    pub const DEFAULT_INITIAL_CAPACITY: usize = 1 << 13;

    pub fn new(mapper: Mapper) -> Self {
        RegionOptions {
            initial_capacity: Self::DEFAULT_INITIAL_CAPACITY,
            growth: GrowthPolicy::default(),
            mapper,
            trim_on_close: true,
        }
    }

    pub fn with_initial_capacity(self, initial_capacity: usize) -> Self {
        RegionOptions {
            initial_capacity,
            ..self
        }
    }

    pub fn with_growth(self, growth: GrowthPolicy) -> Self {
        RegionOptions { growth, ..self }
    }

    pub fn with_trim_on_close(self, trim_on_close: bool) -> Self {
        RegionOptions {
            trim_on_close,
            ..self
        }
    }
}

impl Default for RegionOptions {
    fn default() -> Self {
        RegionOptions::new(Mapper::default())
    }
}

impl MappedRegion {
    /// Open or create the file at `path` and map it.
    ///
    /// An existing file is mapped with its on-disk length, all of which counts as used. A new or
    /// empty file is mapped with the initial capacity and nothing used.
    pub fn open(path: &Path, options: RegionOptions) -> Result<Self, RegionError> {
        let backing = Backing::open_or_create(path).map_err(|source| RegionError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::with_backing(backing, options)
    }

    /// Map an already open file, see [`MappedRegion::open`].
    pub fn from_file(file: File, path: &Path, options: RegionOptions) -> Result<Self, RegionError> {
        let backing = Backing::from_file(file, path).map_err(|source| RegionError::Io {
            path: path.to_owned(),
            source,
        })?;

        Self::with_backing(backing, options)
    }

    fn with_backing(backing: Backing, options: RegionOptions) -> Result<Self, RegionError> {
        let on_disk = usize::try_from(backing.len())
            .map_err(|_| GrowthError::Overflow { requested: usize::MAX })?;

        let (capacity, used) = if on_disk > 0 {
            (options.growth.align(on_disk)?, on_disk)
        } else {
            (options.growth.align(options.initial_capacity)?, 0)
        };

        let medium = match options.mapper.detect() {
            crate::MediumDetect::Persistent => Medium::Persistent,
            _ => Medium::Emulated,
        };

        let mut region = MappedRegion {
            backing,
            mapped: None,
            used,
            medium,
            options,
            remaps: 0,
            closed: false,
        };

        if capacity > 0 {
            region.map_to(capacity)?;
        }

        debug!(
            path = %region.path().display(),
            capacity = region.capacity(),
            used = region.used,
            medium = ?region.medium,
            created = region.backing.is_created(),
            "mapped region"
        );

        Ok(region)
    }

    pub fn path(&self) -> &Path {
        self.backing.path()
    }

    pub fn backing(&self) -> &Backing {
        &self.backing
    }

    /// The number of mapped bytes.
    pub fn capacity(&self) -> usize {
        self.mapped.map_or(0, |mapped| mapped.len)
    }

    /// The number of logically valid bytes.
    pub fn used_len(&self) -> usize {
        self.used
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    /// How often the region was mapped anew to grow.
    pub fn remaps(&self) -> u64 {
        self.remaps
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Grow the mapping until it covers at least `min` bytes.
    ///
    /// All previously written bytes are preserved. The mapping may move.
    pub fn ensure_capacity(&mut self, min: usize) -> Result<(), RegionError> {
        if self.closed {
            return Err(RegionError::Closed);
        }

        let Some(growth) = self.options.growth.grow(self.capacity(), min)? else {
            return Ok(());
        };

        trace!(
            path = %self.path().display(),
            from = self.capacity(),
            to = growth.capacity,
            steps = growth.steps,
            "growing region"
        );

        self.map_to(growth.capacity)?;
        self.remaps += 1;
        Ok(())
    }

    /// Replace the mapping with one of `capacity` bytes.
    fn map_to(&mut self, capacity: usize) -> Result<(), RegionError> {
        // Never map past the end of the file, touching such pages faults.
        let path = self.path().to_owned();
        self.backing
            .extend_to(capacity as u64)
            .map_err(|source| RegionError::Io { path, source })?;

        let fd = self.backing.as_raw_fd();
        // The old mapping stays valid until the new one is in place, both view the same file.
        let new = self
            .options
            .mapper
            .map(fd, capacity)
            .map_err(|source| {
                if source.is_exhaustion() {
                    RegionError::OutOfMemory {
                        requested: capacity,
                        source,
                    }
                } else {
                    RegionError::Io {
                        path: self.path().to_owned(),
                        source: source.into_io(),
                    }
                }
            })?;

        self.medium = new.medium;
        if let Some(old) = self.mapped.replace(new) {
            // Safety: views borrow `self` mutably or immutably, neither is alive during `&mut`.
            if let Err(err) = unsafe { self.options.mapper.unmap(old) } {
                warn!(path = %self.path().display(), %err, "failed to unmap replaced view");
            }
        }

        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`.
    ///
    /// Reads are bounded by the used length, not the capacity. A read reaching past the used
    /// length copies the readable prefix, zero-fills the rest of `buf` and fails with
    /// [`RegionError::ShortRead`].
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), RegionError> {
        if self.closed {
            return Err(RegionError::Closed);
        }

        let readable = usize::try_from(offset)
            .ok()
            .and_then(|start| self.used_bytes().get(start..))
            .unwrap_or(&[]);

        let n = readable.len().min(buf.len());
        buf[..n].copy_from_slice(&readable[..n]);

        // An empty read still has to start within the used length.
        if n == buf.len() && offset <= self.used as u64 {
            return Ok(());
        }

        buf[n..].fill(0);
        Err(RegionError::ShortRead {
            offset,
            len: buf.len(),
            used: self.used,
        })
    }

    /// Write `data` at `offset`, growing the mapping first if necessary.
    ///
    /// Returns the byte range that was stored, for the caller to flush.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<Range<usize>, RegionError> {
        if self.closed {
            return Err(RegionError::Closed);
        }

        let overflow = GrowthError::Overflow {
            requested: usize::MAX,
        };
        let start = usize::try_from(offset).map_err(|_| overflow)?;
        let end = start.checked_add(data.len()).ok_or(overflow)?;

        if data.is_empty() {
            return Ok(start..start);
        }

        self.ensure_capacity(end)?;
        self.bytes_mut()[start..end].copy_from_slice(data);
        self.used = self.used.max(end);

        Ok(start..end)
    }

    /// Extend the used length, as if `len` bytes had been written.
    ///
    /// Bounded by the capacity. Never shrinks.
    pub fn mark_used(&mut self, len: usize) {
        self.used = self.used.max(len.min(self.capacity()));
    }

    /// Perform a flush decided by a [`crate::DurabilityPolicy`].
    ///
    /// The range is clipped to the capacity.
    pub fn flush(&self, flush: &Flush) -> Result<(), RegionError> {
        let Some(mapped) = self.mapped else {
            return Ok(());
        };

        let range = flush.range();
        let end = range.end.min(mapped.len);
        let start = range.start.min(end);

        trace!(path = %self.path().display(), ?flush, "flushing region");

        // Safety: `start..end` lies within the live mapping.
        unsafe {
            let ptr = mapped.ptr.as_ptr().add(start);
            self.options.mapper.flush(ptr, end - start, flush.medium())
        }
        .map_err(|err| RegionError::Io {
            path: self.path().to_owned(),
            source: err.into_io(),
        })
    }

    /// Flush all mapped bytes with the primitive of the current medium.
    pub fn flush_all(&self) -> Result<(), RegionError> {
        let range = 0..self.capacity();
        let flush = match self.medium {
            Medium::Persistent => Flush::Persist(range),
            Medium::Emulated => Flush::Sync(range),
        };

        self.flush(&flush)
    }

    /// All mapped bytes, including those beyond the used length.
    pub fn bytes(&self) -> &[u8] {
        match self.mapped {
            // Safety: the mapping is live while `self` is borrowed.
            Some(Mapped { ptr, len, .. }) => unsafe {
                core::slice::from_raw_parts(ptr.as_ptr(), len)
            },
            None => &[],
        }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        match self.mapped {
            // Safety: the mapping is live and exclusively borrowed.
            Some(Mapped { ptr, len, .. }) => unsafe {
                core::slice::from_raw_parts_mut(ptr.as_ptr(), len)
            },
            None => &mut [],
        }
    }

    /// The logically valid bytes.
    pub fn used_bytes(&self) -> &[u8] {
        &self.bytes()[..self.used]
    }

    /// View a range of the mapping as atomic words.
    ///
    /// Returns `None` if the range is not word aligned or not mapped.
    pub fn atomics(&self, range: Range<usize>) -> Option<&[AtomicU32]> {
        const WORD: usize = core::mem::size_of::<AtomicU32>();

        let bytes = self.bytes().get(range)?;
        if bytes.len() % WORD != 0 || bytes.as_ptr() as usize % WORD != 0 {
            return None;
        }

        let ptr = NonNull::from(bytes).cast::<AtomicU32>();
        // Safety: aligned, in bounds, and the memory is initialized: file mappings read as zero
        // where never written. The mapping is shared, so we may not hand out `&[u32]`.
        Some(unsafe { core::slice::from_raw_parts(ptr.as_ptr(), bytes.len() / WORD) })
    }

    /// Unmap the region. Idempotent.
    ///
    /// With `trim_on_close`, the backing file is shrunk to the used length, so that a reopen maps
    /// exactly the valid bytes. No other mapping of the file may be live at that point.
    pub fn close(&mut self) -> Result<(), RegionError> {
        if self.closed {
            return Ok(());
        }

        self.closed = true;
        let mut result = Ok(());

        if let Some(mapped) = self.mapped.take() {
            // Safety: we are the sole owner, no views are borrowed during `&mut self`.
            if let Err(source) = unsafe { self.options.mapper.unmap(mapped) } {
                result = Err(RegionError::Io {
                    path: self.path().to_owned(),
                    source: source.into_io(),
                });
            }
        }

        if self.options.trim_on_close {
            let path = self.path().to_owned();
            let used = self.used as u64;
            let trimmed = match self.backing.refresh_len() {
                Ok(len) if len > used => self.backing.set_len(used),
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };

            if let Err(source) = trimmed {
                result = result.and(Err(RegionError::Io { path, source }));
            }
        }

        debug!(path = %self.path().display(), used = self.used, "closed region");
        result
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(%err, "failed to close region on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MediumDetect;

    fn options(initial_capacity: usize) -> RegionOptions {
        RegionOptions::new(Mapper::new(MediumDetect::Emulated))
            .with_initial_capacity(initial_capacity)
    }

    #[test]
    fn new_file_maps_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let region = MappedRegion::open(&dir.path().join("new.db"), options(8192)).unwrap();

        assert_eq!(region.capacity(), 8192);
        assert_eq!(region.used_len(), 0);
        assert!(region.backing().is_created());
    }

    #[test]
    fn existing_file_maps_its_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.db");
        std::fs::write(&path, [7u8; 100]).unwrap();

        let region = MappedRegion::open(&path, options(8192)).unwrap();
        assert_eq!(region.capacity(), 100);
        assert_eq!(region.used_len(), 100);
        assert_eq!(region.used_bytes(), &[7u8; 100][..]);
    }

    #[test]
    fn empty_existing_file_maps_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.db");
        std::fs::write(&path, []).unwrap();

        let region = MappedRegion::open(&path, options(4096)).unwrap();
        assert_eq!(region.capacity(), 4096);
        assert_eq!(region.used_len(), 0);
    }

    #[test]
    fn write_past_capacity_grows_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("grow.db"), options(4)).unwrap();
        assert_eq!(region.capacity(), 4);

        const DATA: &[u8] = b"0123456789";
        assert_eq!(region.write_at(0, DATA).unwrap(), 0..10);
        assert_eq!(region.remaps(), 1);
        assert!(region.capacity() >= 10);
        assert_eq!(region.used_len(), 10);

        let mut buf = [0; 10];
        region.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, DATA);
    }

    #[test]
    fn growth_preserves_earlier_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("keep.db"), options(16)).unwrap();

        region.write_at(0, b"head").unwrap();
        region.write_at(1 << 16, b"tail").unwrap();

        let mut buf = [0; 4];
        region.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"head");
        region.read_at(1 << 16, &mut buf).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn capacity_and_used_are_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("mono.db"), options(8)).unwrap();

        let writes: &[(u64, usize)] = &[(0, 3), (100, 20), (5, 1), (4000, 100), (10, 10)];
        let (mut capacity, mut used) = (region.capacity(), region.used_len());

        for &(offset, len) in writes {
            region.write_at(offset, &vec![0xa5; len]).unwrap();
            assert!(region.capacity() >= capacity);
            assert!(region.used_len() >= used);
            assert!(region.capacity() >= region.used_len());
            capacity = region.capacity();
            used = region.used_len();
        }

        assert_eq!(used, 4100);
    }

    #[test]
    fn short_read_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("short.db"), options(64)).unwrap();
        region.write_at(0, b"abcdef").unwrap();

        let used = region.used_len() as u64;
        let mut one = [0xff; 1];
        region.read_at(used - 1, &mut one).unwrap();
        assert_eq!(&one, b"f");

        // Physically mapped, but not logically valid.
        let err = region.read_at(used, &mut one).unwrap_err();
        assert!(matches!(err, RegionError::ShortRead { used: 6, .. }));
        assert_eq!(one, [0]);

        // Empty reads are bounded by the used length as well.
        region.read_at(used, &mut []).unwrap();
        assert!(matches!(
            region.read_at(used + 1, &mut []),
            Err(RegionError::ShortRead { len: 0, .. })
        ));
    }

    #[test]
    fn growth_never_shrinks_a_file_extended_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.db");
        let mut first = MappedRegion::open(&path, options(8192)).unwrap();
        let mut second = MappedRegion::open(&path, options(8192)).unwrap();

        first.write_at(60_000, b"AAAA").unwrap();
        second.write_at(10_000, b"BBBB").unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() >= 60_004);

        // Still backed by the file, both ranges are visible through the first mapping.
        assert_eq!(&first.bytes()[60_000..60_004], b"AAAA");
        assert_eq!(&first.bytes()[10_000..10_004], b"BBBB");
    }

    #[test]
    fn short_read_copies_the_readable_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("prefix.db"), options(64)).unwrap();
        region.write_at(0, b"abcd").unwrap();

        let mut buf = [0xff; 6];
        assert!(region.read_at(2, &mut buf).is_err());
        assert_eq!(&buf, b"cd\0\0\0\0");

        let mut buf = [0xff; 2];
        assert!(region.read_at(u64::MAX, &mut buf).is_err());
        assert_eq!(buf, [0, 0]);
    }

    #[test]
    fn close_is_idempotent_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("close.db");
        let mut region = MappedRegion::open(&path, options(8192)).unwrap();

        region.write_at(0, b"hello").unwrap();
        region.close().unwrap();
        region.close().unwrap();

        assert!(region.is_closed());
        assert_eq!(region.capacity(), 0);
        assert!(matches!(
            region.read_at(0, &mut [0; 1]),
            Err(RegionError::Closed)
        ));
        assert!(matches!(
            region.write_at(0, b"x"),
            Err(RegionError::Closed)
        ));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn mark_used_is_bounded_by_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("mark.db"), options(64)).unwrap();

        region.mark_used(32);
        assert_eq!(region.used_len(), 32);
        region.mark_used(16);
        assert_eq!(region.used_len(), 32);
        region.mark_used(1 << 20);
        assert_eq!(region.used_len(), 64);
    }

    #[test]
    fn atomic_views_need_alignment() {
        let dir = tempfile::tempdir().unwrap();
        let region = MappedRegion::open(&dir.path().join("atomics.db"), options(64)).unwrap();

        assert_eq!(region.atomics(0..64).map(<[_]>::len), Some(16));
        assert!(region.atomics(1..5).is_none());
        assert!(region.atomics(0..6).is_none());
        assert!(region.atomics(0..128).is_none());
    }

    #[test]
    fn flush_clips_to_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mut region = MappedRegion::open(&dir.path().join("flush.db"), options(64)).unwrap();
        region.write_at(0, b"data").unwrap();

        region.flush(&Flush::Sync(0..1 << 20)).unwrap();
        region.flush(&Flush::Persist(2..4)).unwrap();
        region.flush_all().unwrap();
    }
}
