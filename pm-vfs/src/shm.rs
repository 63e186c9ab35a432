//! The shared index, emulated with a mapped file.
//!
//! The host engine addresses its crash-recovery index in slots of a size it picks on the first
//! request. The index is one [`MappedRegion`] whose capacity is always a whole number of slots;
//! it is allocated lazily and grown with the same policy as every other region.
//!
//! Slots are handed out as [`SlotRef`], a handle and an offset. A handle is resolved to memory
//! only when it is used, through a borrow of the region, so no reference into the mapping can
//! survive a growth that moves it.
use core::sync::atomic::{fence, AtomicU32, Ordering};
use std::io;
use std::path::{Path, PathBuf};

use pm_region::{GrowthError, MappedRegion, Medium, RegionError, RegionOptions};
use tracing::{debug, trace};

use crate::{IoOp, VfsError};

/// A slot of the shared index, resolved with [`SharedIndexRegion::slot`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotRef {
    index: usize,
    offset: usize,
    len: usize,
}

/// The externally visible states of a [`SharedIndexRegion`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShmState {
    Unallocated,
    Allocated,
    Unmapped,
}

pub struct SharedIndexRegion {
    path: PathBuf,
    options: RegionOptions,
    base_size: usize,
    state: State,
}

enum State {
    Unallocated,
    Allocated {
        region: MappedRegion,
        slot_size: usize,
    },
    Unmapped,
}

const WORD: usize = core::mem::size_of::<AtomicU32>();

impl SlotRef {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Byte offset of the slot in the shared index.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self) -> core::ops::Range<usize> {
        self.offset..self.offset + self.len
    }
}

impl SharedIndexRegion {
    /// Describe the shared index at `path`; nothing is opened until a slot is requested.
    ///
    /// A new index file is mapped with `base_size` bytes, rounded up to whole slots.
    pub fn new(path: PathBuf, options: RegionOptions, base_size: usize) -> Self {
        SharedIndexRegion {
            path,
            options: options.with_trim_on_close(false),
            base_size,
            state: State::Unallocated,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> ShmState {
        match self.state {
            State::Unallocated => ShmState::Unallocated,
            State::Allocated { .. } => ShmState::Allocated,
            State::Unmapped => ShmState::Unmapped,
        }
    }

    /// The slot size fixed by the first request, if any.
    pub fn slot_size(&self) -> Option<usize> {
        match self.state {
            State::Allocated { slot_size, .. } => Some(slot_size),
            _ => None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.region().map_or(0, MappedRegion::capacity)
    }

    pub fn medium(&self) -> Option<Medium> {
        self.region().map(MappedRegion::medium)
    }

    fn region(&self) -> Option<&MappedRegion> {
        match &self.state {
            State::Allocated { region, .. } => Some(region),
            _ => None,
        }
    }

    /// Map slot `index` of `slot_size` bytes.
    ///
    /// Without `extend`, a slot that is not mapped yet is reported as `None`, and the host engine
    /// rebuilds the index instead. With `extend`, the index is allocated if missing and grown
    /// until it covers the slot.
    pub fn map_slot(
        &mut self,
        index: usize,
        slot_size: usize,
        extend: bool,
    ) -> Result<Option<SlotRef>, VfsError> {
        if slot_size == 0 || slot_size % WORD != 0 {
            return Err(VfsError::SlotAlignment(slot_size));
        }

        if let Some(established) = self.slot_size() {
            if established != slot_size {
                return Err(VfsError::SlotSize {
                    requested: slot_size,
                    established,
                });
            }
        }

        let required = index
            .checked_add(1)
            .and_then(|n| n.checked_mul(slot_size))
            .ok_or_else(|| {
                VfsError::OutOfMemory(RegionError::Capacity(GrowthError::Overflow {
                    requested: usize::MAX,
                }))
            })?;

        if !matches!(self.state, State::Allocated { .. }) {
            if !extend {
                return Ok(None);
            }

            let region = self.open_region(slot_size)?;
            self.state = State::Allocated { region, slot_size };
        }

        let State::Allocated { region, .. } = &mut self.state else {
            return Ok(None);
        };

        if region.capacity() < required {
            if !extend {
                return Ok(None);
            }

            let from = region.capacity();
            region
                .ensure_capacity(required)
                .map_err(|err| VfsError::region(IoOp::ShmMap, err))?;
            debug!(
                path = %self.path.display(),
                from,
                to = region.capacity(),
                "grew shared index"
            );
        }

        region.mark_used(required);

        Ok(Some(SlotRef {
            index,
            offset: required - slot_size,
            len: slot_size,
        }))
    }

    fn open_region(&self, slot_size: usize) -> Result<MappedRegion, VfsError> {
        let growth = self
            .options
            .growth
            .with_granule(slot_size)
            .map_err(|err| VfsError::OutOfMemory(RegionError::Capacity(err)))?;

        let options = self
            .options
            .clone()
            .with_initial_capacity(self.base_size)
            .with_growth(growth);

        let region = MappedRegion::open(&self.path, options)
            .map_err(|err| VfsError::region(IoOp::ShmOpen, err))?;

        debug!(
            path = %self.path.display(),
            slot_size,
            capacity = region.capacity(),
            medium = ?region.medium(),
            "allocated shared index"
        );

        Ok(region)
    }

    /// Resolve a slot to its words.
    ///
    /// `None` if the index was unmapped since the slot was handed out.
    pub fn slot(&self, slot: SlotRef) -> Option<&[AtomicU32]> {
        self.region()?.atomics(slot.range())
    }

    pub fn slot_bytes(&self, slot: SlotRef) -> Option<&[u8]> {
        self.region()?.bytes().get(slot.range())
    }

    pub fn slot_bytes_mut(&mut self, slot: SlotRef) -> Option<&mut [u8]> {
        match &mut self.state {
            State::Allocated { region, .. } => region.bytes_mut().get_mut(slot.range()),
            _ => None,
        }
    }

    /// Order all earlier loads and stores before all later ones, and flush the whole index.
    pub fn barrier(&self) -> Result<(), VfsError> {
        fence(Ordering::SeqCst);

        let Some(region) = self.region() else {
            return Ok(());
        };

        trace!(
            path = %self.path.display(),
            capacity = region.capacity(),
            "shared index barrier"
        );
        region
            .flush_all()
            .map_err(|err| VfsError::region(IoOp::ShmMap, err))
    }

    /// Unmap the index, and delete its file if `delete`.
    ///
    /// Slots handed out before resolve to `None` afterwards. A later request with `extend` maps
    /// the index again.
    pub fn unmap(&mut self, delete: bool) -> Result<(), VfsError> {
        if !matches!(self.state, State::Allocated { .. }) {
            return Ok(());
        }

        let State::Allocated { mut region, .. } =
            std::mem::replace(&mut self.state, State::Unmapped)
        else {
            return Ok(());
        };

        let closed = region
            .close()
            .map_err(|err| VfsError::region(IoOp::ShmUnmap, err));

        if delete {
            match std::fs::remove_file(&self.path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(VfsError::io(IoOp::Delete, &self.path, source)),
            }
        }

        debug!(path = %self.path.display(), delete, "unmapped shared index");
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pm_region::{Mapper, MediumDetect};

    const SLOT: usize = 32 * 1024;

    fn shm(dir: &Path) -> SharedIndexRegion {
        let options = RegionOptions::new(Mapper::new(MediumDetect::Emulated));
        SharedIndexRegion::new(dir.join("x.db-shm"), options, 1 << 15)
    }

    #[test]
    fn unallocated_without_extend_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = shm(dir.path());

        assert_eq!(shm.map_slot(0, SLOT, false).unwrap(), None);
        assert_eq!(shm.state(), ShmState::Unallocated);
        assert!(!shm.path().exists());
    }

    #[test]
    fn extend_allocates_and_grows_in_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = shm(dir.path());

        let first = shm.map_slot(0, SLOT, true).unwrap().unwrap();
        assert_eq!(shm.state(), ShmState::Allocated);
        assert_eq!(first.offset(), 0);
        assert_eq!(shm.capacity(), SLOT);

        let third = shm.map_slot(2, SLOT, true).unwrap().unwrap();
        assert_eq!(third.offset(), 2 * SLOT);
        assert!(shm.capacity() >= 3 * SLOT);
        assert_eq!(shm.capacity() % SLOT, 0);

        // Not mapped yet, and not to be mapped.
        assert_eq!(shm.map_slot(9, SLOT, false).unwrap(), None);
    }

    #[test]
    fn slot_size_is_fixed_by_the_first_request() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = shm(dir.path());

        shm.map_slot(0, SLOT, true).unwrap();
        assert!(matches!(
            shm.map_slot(0, SLOT / 2, true),
            Err(VfsError::SlotSize { requested, established: SLOT }) if requested == SLOT / 2
        ));
        assert!(matches!(
            shm.map_slot(0, 7, true),
            Err(VfsError::SlotAlignment(7))
        ));
    }

    #[test]
    fn slots_resolve_to_words() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = shm(dir.path());

        let slot = shm.map_slot(1, 64, true).unwrap().unwrap();
        let words = shm.slot(slot).unwrap();
        assert_eq!(words.len(), 16);

        words[3].store(0xfeed, Ordering::Release);
        let bytes = shm.slot_bytes(slot).unwrap();
        assert_eq!(&bytes[12..16], &0xfeed_u32.to_ne_bytes());
        shm.barrier().unwrap();
    }

    #[test]
    fn unmap_invalidates_handles() {
        let dir = tempfile::tempdir().unwrap();
        let mut shm = shm(dir.path());

        let slot = shm.map_slot(0, SLOT, true).unwrap().unwrap();
        shm.unmap(false).unwrap();
        assert_eq!(shm.state(), ShmState::Unmapped);
        assert!(shm.slot(slot).is_none());
        assert!(shm.path().exists());

        // The index survives an unmap without delete.
        shm.map_slot(0, SLOT, true).unwrap();
        assert_eq!(shm.state(), ShmState::Allocated);

        shm.unmap(true).unwrap();
        shm.unmap(true).unwrap();
        assert!(!shm.path().exists());
        shm.barrier().unwrap();
    }
}
