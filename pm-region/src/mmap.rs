use core::ffi::{c_int, c_void};
use core::ptr::NonNull;
use std::sync::Arc;

/// A table of OS functions used to establish, flush and tear down mappings.
///
/// A default table is provided by [`Mapper::new`]. Tests and exotic platforms can supply their
/// own functions instead of hooking the libc symbols.
pub struct VTable {
    /// Simplified `mmap`: always a fresh address, always at offset zero of `file`.
    pub mmap: fn(len: usize, prot: c_int, flags: c_int, file: c_int) -> *mut c_void,
    pub munmap: fn(*mut c_void, usize) -> c_int,
    /// Synchronous write-back of a page aligned range.
    pub msync: fn(*mut c_void, usize) -> c_int,
    /// Make a range durable on a mapping granted with `map_sync`.
    pub persist: fn(*const c_void, usize) -> c_int,
    pub errno: fn() -> c_int,

    pub page_size: usize,
    pub prot_read: c_int,
    pub prot_write: c_int,
    pub map_shared: c_int,
    /// Flags requesting a synchronous (DAX) mapping, if the platform has them.
    pub map_sync: Option<c_int>,
    /// Errors of a `map_sync` attempt that mean "not persistent memory" rather than failure.
    pub map_sync_unsupported: [c_int; 2],
    pub map_failed: *mut c_void,
}

// Safety: `map_failed` is a sentinel only ever compared by value, never dereferenced.
unsafe impl Send for VTable {}
unsafe impl Sync for VTable {}

/// The kind of memory a mapping ended up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Medium {
    /// Direct access to persistent memory; stores become durable by flushing cache lines.
    Persistent,
    /// Page cache backed; stores become durable by `msync`.
    Emulated,
}

/// How a [`Mapper`] decides the [`Medium`] of new mappings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MediumDetect {
    /// Attempt a synchronous mapping and fall back to a plain shared one.
    #[default]
    Detect,
    /// Map shared and treat the result as persistent memory.
    Persistent,
    /// Map shared and treat the result as page cache backed.
    Emulated,
}

#[derive(Clone)]
pub struct Mapper {
    inner: Arc<Inner>,
}

/// A live mapping as returned by [`Mapper::map`].
///
/// Carries no ownership; the caller is responsible for passing it back to [`Mapper::unmap`].
#[derive(Clone, Copy, Debug)]
pub struct Mapped {
    pub ptr: NonNull<u8>,
    pub len: usize,
    pub medium: Medium,
}

/// An OS error code reported by the mapping vtable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("mapping call failed with errno {0}")]
pub struct MapError(pub(crate) c_int);

struct Inner {
    vtable: VTable,
    detect: MediumDetect,
}

#[cfg(target_os = "linux")]
const MAP_SHARED_VALIDATE: c_int = 0x03;
#[cfg(target_os = "linux")]
const MAP_SYNC: c_int = 0x80000;

impl Mapper {
    /// Create a `Mapper` from a customized vtable.
    ///
    /// # Safety
    ///
    /// The VTable must contain functions that implement the `mmap`, `munmap` and `msync`
    /// interfaces, and a `persist` that is valid for any range inside a live mapping.
    pub unsafe fn new_unchecked(vtable: VTable, detect: MediumDetect) -> Self {
        Mapper {
            inner: Arc::new(Inner { vtable, detect }),
        }
    }

    pub fn new(detect: MediumDetect) -> Self {
        fn _mmap(len: usize, prot: c_int, flags: c_int, file: c_int) -> *mut c_void {
            unsafe { libc::mmap(core::ptr::null_mut(), len, prot, flags, file, 0) }
        }

        fn _munmap(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::munmap(addr, len) }
        }

        fn _msync(addr: *mut c_void, len: usize) -> c_int {
            unsafe { libc::msync(addr, len, libc::MS_SYNC) }
        }

        fn _errno() -> c_int {
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
        }

        #[cfg(target_arch = "x86_64")]
        fn _persist(addr: *const c_void, len: usize) -> c_int {
            use core::arch::x86_64::{_mm_clflush, _mm_sfence};
            const CACHE_LINE: usize = 64;

            let start = addr as usize & !(CACHE_LINE - 1);
            let end = addr as usize + len;

            // Safety: every flushed line overlaps the caller's range, which lies in a live
            // mapping. `clflush` is part of SSE2 and thus of every x86_64 target.
            unsafe {
                for line in (start..end).step_by(CACHE_LINE) {
                    _mm_clflush(line as *const u8);
                }
                _mm_sfence();
            }

            0
        }

        // Without a cache line flush instruction we can only write back through the kernel.
        #[cfg(not(target_arch = "x86_64"))]
        fn _persist(addr: *const c_void, len: usize) -> c_int {
            let page = page_size();
            let start = addr as usize & !(page - 1);
            let len = len + (addr as usize - start);
            unsafe { libc::msync(start as *mut c_void, len, libc::MS_SYNC) }
        }

        fn page_size() -> usize {
            match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                n if n > 0 => n as usize,
                _ => 4096,
            }
        }

        #[cfg(target_os = "linux")]
        let map_sync = Some(MAP_SHARED_VALIDATE | MAP_SYNC);
        #[cfg(not(target_os = "linux"))]
        let map_sync = None;

        unsafe {
            Self::new_unchecked(
                VTable {
                    mmap: _mmap,
                    munmap: _munmap,
                    msync: _msync,
                    persist: _persist,
                    errno: _errno,
                    page_size: page_size(),
                    prot_read: libc::PROT_READ,
                    prot_write: libc::PROT_WRITE,
                    map_shared: libc::MAP_SHARED,
                    map_sync,
                    map_sync_unsupported: [libc::EOPNOTSUPP, libc::EINVAL],
                    map_failed: libc::MAP_FAILED,
                },
                detect,
            )
        }
    }

    pub fn detect(&self) -> MediumDetect {
        self.inner.detect
    }

    /// Map `len` bytes of `file`, shared and writable.
    pub fn map(&self, file: c_int, len: usize) -> Result<Mapped, MapError> {
        let vtable = &self.inner.vtable;

        if len == 0 {
            return Err(MapError(libc::EINVAL));
        }

        if let (MediumDetect::Detect, Some(flags)) = (self.inner.detect, vtable.map_sync) {
            match self.map_with(file, len, flags) {
                Ok(ptr) => {
                    return Ok(Mapped {
                        ptr,
                        len,
                        medium: Medium::Persistent,
                    })
                }
                Err(MapError(errno)) if vtable.map_sync_unsupported.contains(&errno) => {}
                Err(err) => return Err(err),
            }
        }

        let ptr = self.map_with(file, len, vtable.map_shared)?;
        let medium = match self.inner.detect {
            MediumDetect::Persistent => Medium::Persistent,
            MediumDetect::Detect | MediumDetect::Emulated => Medium::Emulated,
        };

        Ok(Mapped { ptr, len, medium })
    }

    fn map_with(&self, file: c_int, len: usize, flags: c_int) -> Result<NonNull<u8>, MapError> {
        let vtable = &self.inner.vtable;
        let prot = vtable.prot_read | vtable.prot_write;
        let ptr = (vtable.mmap)(len, prot, flags, file);

        if ptr == vtable.map_failed {
            return Err(MapError((vtable.errno)()));
        }

        NonNull::new(ptr as *mut u8).ok_or(MapError(libc::EFAULT))
    }

    /// Tear down a mapping.
    ///
    /// # Safety
    ///
    /// `mapped` must have been returned by this mapper and no reference into it may be alive.
    pub unsafe fn unmap(&self, mapped: Mapped) -> Result<(), MapError> {
        let vtable = &self.inner.vtable;
        if (vtable.munmap)(mapped.ptr.as_ptr() as *mut c_void, mapped.len) != 0 {
            return Err(MapError((vtable.errno)()));
        }

        Ok(())
    }

    /// Make `len` bytes at `ptr` durable, with the primitive appropriate for `medium`.
    ///
    /// # Safety
    ///
    /// The range must lie within a live mapping of this mapper.
    pub unsafe fn flush(&self, ptr: *const u8, len: usize, medium: Medium) -> Result<(), MapError> {
        let vtable = &self.inner.vtable;

        if len == 0 {
            return Ok(());
        }

        let ret = match medium {
            Medium::Persistent => (vtable.persist)(ptr as *const c_void, len),
            Medium::Emulated => {
                // `msync` wants a page aligned start address.
                let start = ptr as usize & !(vtable.page_size - 1);
                let len = len + (ptr as usize - start);
                (vtable.msync)(start as *mut c_void, len)
            }
        };

        if ret != 0 {
            return Err(MapError((vtable.errno)()));
        }

        Ok(())
    }
}

impl Default for Mapper {
    fn default() -> Self {
        Mapper::new(MediumDetect::Detect)
    }
}

impl MapError {
    pub fn errno(&self) -> c_int {
        self.0
    }

    /// Whether the failure is an exhaustion of memory or address space.
    pub fn is_exhaustion(&self) -> bool {
        matches!(self.0, libc::ENOMEM | libc::EOVERFLOW | libc::EAGAIN)
    }

    pub fn into_io(self) -> std::io::Error {
        std::io::Error::from_raw_os_error(self.0)
    }
}
