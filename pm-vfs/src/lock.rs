//! File and shared index locks.
//!
//! Two implementations stand behind one [`Locker`]. The no-op one grants every request, which is
//! only correct while a single connection uses a database. The in-process one tracks holders in a
//! [`LockTable`] keyed by path, so connections of the same process exclude each other.
use std::collections::HashMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::{LockLevel, ShmLockOp, VfsError, SHM_NLOCK};

/// Lock holders of every path opened through one provider.
#[derive(Debug, Default)]
pub struct LockTable {
    paths: Mutex<HashMap<PathBuf, PathLocks>>,
    owners: AtomicU64,
}

/// The lock strategy of one file handle.
#[derive(Debug)]
pub enum Locker {
    Noop,
    InProcess(InProcessLock),
}

/// A handle's view of a [`LockTable`] entry.
#[derive(Debug)]
pub struct InProcessLock {
    table: Arc<LockTable>,
    path: PathBuf,
    owner: u64,
    level: LockLevel,
    /// Bit `i` is set while we hold shared index slot `i` shared.
    shm_shared: u8,
    shm_exclusive: u8,
}

#[derive(Debug, Default)]
struct PathLocks {
    /// Handles holding at least a shared lock.
    shared: usize,
    reserved: Option<u64>,
    pending: Option<u64>,
    exclusive: Option<u64>,
    shm: [ShmSlot; SHM_NLOCK],
}

#[derive(Clone, Copy, Debug, Default)]
struct ShmSlot {
    shared: usize,
    exclusive: Option<u64>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn paths(&self) -> MutexGuard<'_, HashMap<PathBuf, PathLocks>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of paths with any lock held.
    pub fn len(&self) -> usize {
        self.paths().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Locker {
    pub fn in_process(table: Arc<LockTable>, path: &Path) -> Self {
        let owner = table.owners.fetch_add(1, Ordering::Relaxed);
        Locker::InProcess(InProcessLock {
            table,
            path: path.to_owned(),
            owner,
            level: LockLevel::None,
            shm_shared: 0,
            shm_exclusive: 0,
        })
    }

    /// The level this handle holds. Always `None` without real locking.
    pub fn level(&self) -> LockLevel {
        match self {
            Locker::Noop => LockLevel::None,
            Locker::InProcess(lock) => lock.level,
        }
    }

    pub fn lock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        match self {
            Locker::Noop => Ok(()),
            Locker::InProcess(lock) => lock.lock(level),
        }
    }

    pub fn unlock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        match self {
            Locker::Noop => Ok(()),
            Locker::InProcess(lock) => {
                lock.unlock(level);
                Ok(())
            }
        }
    }

    /// Whether any handle holds a reserved or stronger lock on the file.
    pub fn check_reserved(&self) -> bool {
        match self {
            Locker::Noop => false,
            Locker::InProcess(lock) => lock.check_reserved(),
        }
    }

    pub fn shm_lock(&mut self, offset: usize, n: usize, op: ShmLockOp) -> Result<(), VfsError> {
        match self {
            Locker::Noop => Ok(()),
            Locker::InProcess(lock) => lock.shm_lock(offset, n, op),
        }
    }

    /// Give up everything held, as on close.
    pub fn release(&mut self) {
        if let Locker::InProcess(lock) = self {
            lock.shm_unlock_all();
            lock.unlock(LockLevel::None);
        }
    }
}

impl InProcessLock {
    fn entry<'t>(
        paths: &'t mut MutexGuard<'_, HashMap<PathBuf, PathLocks>>,
        path: &Path,
    ) -> &'t mut PathLocks {
        paths.entry(path.to_owned()).or_default()
    }

    fn lock(&mut self, level: LockLevel) -> Result<(), VfsError> {
        if self.level >= level {
            return Ok(());
        }

        let table = Arc::clone(&self.table);
        let mut paths = table.paths();
        let entry = Self::entry(&mut paths, &self.path);
        let me = Some(self.owner);
        let other = |holder: Option<u64>| holder.is_some() && holder != me;

        match level {
            LockLevel::None => {}
            LockLevel::Shared => {
                if other(entry.pending) || other(entry.exclusive) {
                    return Err(VfsError::Busy);
                }

                entry.shared += 1;
            }
            LockLevel::Reserved => {
                debug_assert!(self.level >= LockLevel::Shared);
                if other(entry.reserved) {
                    return Err(VfsError::Busy);
                }

                entry.reserved = me;
            }
            LockLevel::Pending | LockLevel::Exclusive => {
                if other(entry.pending) || other(entry.exclusive) {
                    return Err(VfsError::Busy);
                }

                // New readers are kept out while we wait for the current ones to leave.
                entry.pending = me;
                self.level = self.level.max(LockLevel::Pending);

                if level == LockLevel::Exclusive {
                    if entry.shared > 1 {
                        return Err(VfsError::Busy);
                    }

                    entry.exclusive = me;
                }
            }
        }

        trace!(
            path = %self.path.display(),
            owner = self.owner,
            from = ?self.level,
            to = ?level,
            "lock"
        );
        self.level = level;
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) {
        if self.level <= level {
            return;
        }

        let table = Arc::clone(&self.table);
        let mut paths = table.paths();
        let entry = Self::entry(&mut paths, &self.path);
        let me = Some(self.owner);

        if self.level > LockLevel::Shared {
            for holder in [&mut entry.reserved, &mut entry.pending, &mut entry.exclusive] {
                if *holder == me {
                    *holder = None;
                }
            }
        }

        if level == LockLevel::None {
            entry.shared = entry.shared.saturating_sub(1);
        }

        trace!(
            path = %self.path.display(),
            owner = self.owner,
            from = ?self.level,
            to = ?level,
            "unlock"
        );
        self.level = level;

        if entry.is_idle() {
            paths.remove(&self.path);
        }
    }

    fn check_reserved(&self) -> bool {
        let paths = self.table.paths();
        paths.get(&self.path).map_or(false, |entry| {
            entry.reserved.is_some() || entry.pending.is_some() || entry.exclusive.is_some()
        })
    }

    fn shm_lock(&mut self, offset: usize, n: usize, op: ShmLockOp) -> Result<(), VfsError> {
        let end = offset.checked_add(n).filter(|&end| n > 0 && end <= SHM_NLOCK);
        let Some(end) = end else {
            return Err(VfsError::Range {
                offset,
                n,
                slots: SHM_NLOCK,
            });
        };

        let mask = (offset..end).fold(0u8, |mask, i| mask | 1 << i);
        let table = Arc::clone(&self.table);
        let mut paths = table.paths();
        let entry = Self::entry(&mut paths, &self.path);
        let me = Some(self.owner);

        match op {
            ShmLockOp::UnlockShared | ShmLockOp::UnlockExclusive => {
                self.release_shm(entry, offset..end);
            }
            ShmLockOp::LockShared => {
                let slots = &mut entry.shm[offset..end];
                let busy = slots
                    .iter()
                    .any(|slot| slot.exclusive.is_some() && slot.exclusive != me);
                if busy {
                    return Err(VfsError::Busy);
                }

                for (i, slot) in (offset..end).zip(slots) {
                    if self.shm_shared & 1 << i == 0 {
                        slot.shared += 1;
                    }
                }

                self.shm_shared |= mask;
            }
            ShmLockOp::LockExclusive => {
                let slots = &mut entry.shm[offset..end];
                let busy = (offset..end).zip(slots.iter()).any(|(i, slot)| {
                    let ours = usize::from(self.shm_shared & 1 << i != 0);
                    (slot.exclusive.is_some() && slot.exclusive != me) || slot.shared > ours
                });

                if busy {
                    return Err(VfsError::Busy);
                }

                for slot in slots {
                    slot.exclusive = me;
                }

                self.shm_exclusive |= mask;
            }
        }

        trace!(path = %self.path.display(), owner = self.owner, offset, n, ?op, "shm lock");

        if entry.is_idle() {
            paths.remove(&self.path);
        }

        Ok(())
    }

    fn shm_unlock_all(&mut self) {
        if self.shm_shared | self.shm_exclusive == 0 {
            return;
        }

        let table = Arc::clone(&self.table);
        let mut paths = table.paths();
        let entry = Self::entry(&mut paths, &self.path);
        self.release_shm(entry, 0..SHM_NLOCK);

        if entry.is_idle() {
            paths.remove(&self.path);
        }
    }

    /// Give up our shared and exclusive holds on `slots`.
    fn release_shm(&mut self, entry: &mut PathLocks, slots: Range<usize>) {
        let me = Some(self.owner);

        for i in slots {
            let slot = &mut entry.shm[i];
            if self.shm_shared & 1 << i != 0 {
                slot.shared -= 1;
            }
            if slot.exclusive == me {
                slot.exclusive = None;
            }

            self.shm_shared &= !(1 << i);
            self.shm_exclusive &= !(1 << i);
        }
    }
}

impl Drop for InProcessLock {
    fn drop(&mut self) {
        self.shm_unlock_all();
        self.unlock(LockLevel::None);
    }
}

impl PathLocks {
    fn is_idle(&self) -> bool {
        self.shared == 0
            && self.reserved.is_none()
            && self.pending.is_none()
            && self.exclusive.is_none()
            && self
                .shm
                .iter()
                .all(|slot| slot.shared == 0 && slot.exclusive.is_none())
    }
}
