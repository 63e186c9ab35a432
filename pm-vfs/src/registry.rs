use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use crate::Vfs;

/// Named storage providers, with one default.
///
/// Mirrors the host engine's provider list: the default is the first entry, registering a name
/// again replaces the earlier provider of that name.
#[derive(Default)]
pub struct VfsRegistry {
    entries: RwLock<Vec<Arc<dyn Vfs>>>,
}

impl VfsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry of this process.
    pub fn global() -> &'static VfsRegistry {
        static GLOBAL: OnceLock<VfsRegistry> = OnceLock::new();
        GLOBAL.get_or_init(VfsRegistry::new)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<dyn Vfs>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<dyn Vfs>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `vfs`, as the new default if `make_default` or if it is the first one.
    pub fn register(&self, vfs: Arc<dyn Vfs>, make_default: bool) {
        let mut entries = self.write();

        if let Some(pos) = entries.iter().position(|e| e.name() == vfs.name()) {
            warn!(name = vfs.name(), "replacing registered provider");
            entries.remove(pos);
        }

        debug!(name = vfs.name(), make_default, "registered provider");
        if make_default || entries.is_empty() {
            entries.insert(0, vfs);
        } else {
            entries.insert(1, vfs);
        }
    }

    /// Remove the provider called `name`. The next one in line becomes the default.
    pub fn unregister(&self, name: &str) -> Option<Arc<dyn Vfs>> {
        let mut entries = self.write();
        let pos = entries.iter().position(|e| e.name() == name)?;
        debug!(name, "unregistered provider");
        Some(entries.remove(pos))
    }

    /// The provider called `name`, or the default for `None`.
    pub fn find(&self, name: Option<&str>) -> Option<Arc<dyn Vfs>> {
        let entries = self.read();
        match name {
            None => entries.first().cloned(),
            Some(name) => entries.iter().find(|e| e.name() == name).cloned(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.read().iter().map(|e| e.name().to_owned()).collect()
    }
}
