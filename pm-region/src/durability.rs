//! When stores into a region have to be made durable.
use core::ops::Range;

use crate::Medium;

/// The part a file plays for the host engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Pages of the database itself, durable once the engine syncs.
    Data,
    /// The write-ahead log, durable as soon as a write returns.
    Log,
}

/// A flush to perform on a byte range of a region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Flush {
    /// Flush cache lines, the region is on persistent memory.
    Persist(Range<usize>),
    /// Write back pages through the kernel, the region is page cache backed.
    Sync(Range<usize>),
}

/// Decides per write and per explicit sync what must be flushed.
///
/// The log is the commit path: every write to it is flushed before the write returns, which makes
/// an explicit sync of the log a no-op. Data writes are never flushed individually; a sync flushes
/// everything up to the used length at once. That is the conventional write/fsync split, and lets
/// the engine batch page writes before paying for durability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DurabilityPolicy {
    medium: Medium,
    role: Role,
}

impl DurabilityPolicy {
    pub fn new(medium: Medium, role: Role) -> Self {
        DurabilityPolicy { medium, role }
    }

    pub fn medium(&self) -> Medium {
        self.medium
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The flush owed by a write that just stored `range`.
    pub fn after_write(&self, range: Range<usize>) -> Option<Flush> {
        match self.role {
            Role::Log => Some(self.flush(range)),
            Role::Data => None,
        }
    }

    /// The flush owed by an explicit sync of a region with `used` valid bytes.
    pub fn on_sync(&self, used: usize) -> Option<Flush> {
        match self.role {
            Role::Log => None,
            Role::Data => Some(self.flush(0..used)),
        }
    }

    /// A flush of `range` with the primitive of this medium.
    pub fn flush(&self, range: Range<usize>) -> Flush {
        match self.medium {
            Medium::Persistent => Flush::Persist(range),
            Medium::Emulated => Flush::Sync(range),
        }
    }
}

impl Flush {
    pub fn range(&self) -> &Range<usize> {
        match self {
            Flush::Persist(range) | Flush::Sync(range) => range,
        }
    }

    pub fn medium(&self) -> Medium {
        match self {
            Flush::Persist(_) => Medium::Persistent,
            Flush::Sync(_) => Medium::Emulated,
        }
    }
}

#[test]
fn log_flushes_every_write() {
    let pm = DurabilityPolicy::new(Medium::Persistent, Role::Log);
    assert_eq!(pm.after_write(8..24), Some(Flush::Persist(8..24)));
    assert_eq!(pm.on_sync(4096), None);

    let emulated = DurabilityPolicy::new(Medium::Emulated, Role::Log);
    assert_eq!(emulated.after_write(8..24), Some(Flush::Sync(8..24)));
    assert_eq!(emulated.on_sync(4096), None);
}

#[test]
fn data_defers_to_sync() {
    let pm = DurabilityPolicy::new(Medium::Persistent, Role::Data);
    assert_eq!(pm.after_write(0..4096), None);
    assert_eq!(pm.on_sync(8192), Some(Flush::Persist(0..8192)));

    let emulated = DurabilityPolicy::new(Medium::Emulated, Role::Data);
    assert_eq!(emulated.after_write(0..4096), None);
    assert_eq!(emulated.on_sync(8192), Some(Flush::Sync(0..8192)));
}
