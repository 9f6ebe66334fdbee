//! # Live-loader registry.
//!
//! Every [`Loader`] created in a [`Context`](crate::Context) is recorded here
//! by weak reference. The registry also allocates loader ids, so ids are
//! unique per context rather than per process.
//!
//! ## Rules
//! - The registry never keeps a loader alive.
//! - Dead entries are pruned on every registration and on every listing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::loader::{Loader, LoaderId};

/// Registry of live loaders.
pub struct Registry {
    next_id: AtomicU64,
    loaders: Mutex<Vec<(LoaderId, Weak<Loader>)>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            loaders: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(LoaderId, Weak<Loader>)>> {
        self.loaders.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn allocate_id(&self) -> LoaderId {
        LoaderId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register(&self, loader: &Arc<Loader>) {
        let mut loaders = self.lock();
        loaders.retain(|(_, weak)| weak.strong_count() > 0);
        loaders.push((loader.id(), Arc::downgrade(loader)));
    }

    /// Returns the number of recorded entries, dead or alive.
    #[cfg(test)]
    fn entries(&self) -> usize {
        self.lock().len()
    }

    /// Returns every live loader, in creation order.
    pub fn live(&self) -> Vec<Arc<Loader>> {
        let mut loaders = self.lock();
        loaders.retain(|(_, weak)| weak.strong_count() > 0);
        loaders.iter().filter_map(|(_, weak)| weak.upgrade()).collect()
    }

    /// Finds a live loader by id.
    pub fn get(&self, id: LoaderId) -> Option<Arc<Loader>> {
        self.lock()
            .iter()
            .find(|(lid, _)| *lid == id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Finds the first live loader with the given name.
    pub fn find(&self, name: &str) -> Option<Arc<Loader>> {
        self.live().into_iter().find(|l| l.name() == name)
    }

    /// Returns the number of live loaders.
    pub fn len(&self) -> usize {
        self.live().len()
    }

    /// Returns `true` if no loader is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use crate::core::{Context, EngineConfig};
    use crate::loader::{Loader, LoaderSpec};

    #[test]
    fn test_lookup_by_id_and_name() {
        let ctx = Context::builder(EngineConfig::default()).build();
        let a = Loader::new(&ctx, LoaderSpec::new("analytics"));
        let b = Loader::new(&ctx, LoaderSpec::new("pixel"));
        let reg = ctx.registry();

        assert_eq!(reg.len(), 2);
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.get(b.id()).map(|l| l.name().to_string()), Some("pixel".into()));
        assert_eq!(reg.find("analytics").map(|l| l.id()), Some(a.id()));
        assert!(reg.find("missing").is_none());

        let names: Vec<String> = reg.live().iter().map(|l| l.name().to_string()).collect();
        assert_eq!(names, vec!["analytics", "pixel"]);
    }

    #[test]
    fn test_dropped_loaders_are_pruned() {
        let ctx = Context::builder(EngineConfig::default()).build();
        let reg = ctx.registry();
        let keep = Loader::new(&ctx, LoaderSpec::new("keep"));

        for i in 0..16 {
            let gone = Loader::new(&ctx, LoaderSpec::new(format!("short-{i}")));
            let id = gone.id();
            drop(gone);
            assert!(reg.get(id).is_none());
        }
        // Each registration sweeps the entry left by the previous drop.
        assert_eq!(reg.entries(), 2);
        assert_eq!(reg.len(), 1);
        assert!(!reg.is_empty());

        drop(keep);
        assert!(reg.is_empty());
        assert_eq!(reg.entries(), 0);
    }
}
