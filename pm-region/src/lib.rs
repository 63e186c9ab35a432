//! Growable file mappings for byte-addressable persistent memory.
//!
//! A [`MappedRegion`] owns exactly one shared mapping of one backing file. Stores go straight
//! into the mapping; there is no write buffer and no `write(2)` call anywhere on the data path.
//! What a store does *not* get for free is ordering with respect to a crash. That part is the
//! [`DurabilityPolicy`]: it decides, per write and per explicit sync, which byte range must be
//! flushed and with which primitive.
//!
//! ## Two media
//!
//! The mapping vtable first asks the kernel for a synchronous DAX mapping (`MAP_SYNC`). When the
//! file system grants it, the file lives on true persistent memory and a range becomes durable by
//! flushing its cache lines. Otherwise the mapping is backed by the page cache and the same range
//! has to be written back with `msync`. Callers only ever see a [`Medium`]; the difference is
//! resolved inside [`MappedRegion::flush`].
//!
//! ## Growth relocates
//!
//! Growing a region maps the file anew and unmaps the old view, so the base address may change.
//! Nothing here hands out raw pointers. Views are borrowed from the region, and every call that
//! may grow takes `&mut self`, which rules out holding a view across a remap.
mod backing;
mod durability;
mod growth;
mod mmap;
mod region;

pub use backing::Backing;
pub use durability::{DurabilityPolicy, Flush, Role};
pub use growth::{Growth, GrowthError, GrowthPolicy};
pub use mmap::{MapError, Mapped, Mapper, Medium, MediumDetect, VTable};
pub use region::{MappedRegion, RegionError, RegionOptions};
