//
// src/proxy/pool.rs
//
use std::sync::Arc;

use arc_swap::ArcSwap;
use uuid::Uuid;

use super::backend::Backend;

/// Ordered, append-only collection of backends.
///
/// Stored as an `ArcSwap<Vec<Arc<Backend>>>` so that order is preserved
/// across reads — round-robin fairness depends on a stable sequence,
/// which an unordered map cannot provide. `snapshot()` is a cheap,
/// lock-free `load_full()`; a concurrent `add` swaps in a new `Vec`
/// without ever exposing a partially-built one.
#[derive(Clone)]
pub struct BackendPool {
    backends: Arc<ArcSwap<Vec<Arc<Backend>>>>,
}

impl BackendPool {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends: Arc::new(ArcSwap::from_pointee(backends)),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    /// Appends a backend. No de-duplication by URL — id uniqueness is
    /// sufficient.
    pub fn add(&self, backend: Arc<Backend>) {
        let mut next = (**self.backends.load()).clone();
        next.push(backend);
        self.backends.store(Arc::new(next));
    }

    pub fn get(&self, id: Uuid) -> Option<Arc<Backend>> {
        self.backends.load().iter().find(|b| b.id == id).cloned()
    }

    /// A stable view of the current sequence for a selection pass.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    pub fn len(&self) -> usize {
        self.backends.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
