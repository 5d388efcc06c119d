//!
//! photowall image registry
//! ------------------------
//! The in-memory ordered list of currently known public image references.
//! Insertion order is discovery order, URLs are unique by exact string match,
//! and entries are append-only (nothing ever removes a single entry; the whole
//! list can be replaced from a fresh provider listing on (re)authentication).
//!
//! The registry is the single piece of shared mutable state in the process.
//! All mutation goes through an internal mutex so concurrent upload and
//! refresh requests cannot violate the uniqueness invariant.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One published photo: the provider-assigned opaque file id plus the URL
/// clients render. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub url: String,
}

impl ImageRef {
    pub fn new<S: Into<String>>(id: S, url: S) -> Self {
        ImageRef { id: id.into(), url: url.into() }
    }
}

/// Ordered, URL-unique collection of [`ImageRef`] values.
///
/// This type cannot fail; all failure happens in the collaborators that
/// produce `ImageRef` values. State is not persisted and resets on restart.
#[derive(Debug, Default)]
pub struct ImageRegistry {
    entries: Mutex<Vec<ImageRef>>,
}

impl ImageRegistry {
    pub fn new() -> Self {
        ImageRegistry { entries: Mutex::new(Vec::new()) }
    }

    /// Snapshot of the current contents in insertion order.
    pub fn list(&self) -> Vec<ImageRef> {
        self.entries.lock().clone()
    }

    /// URL projection of [`list`](Self::list), used by the listing endpoint.
    pub fn urls(&self) -> Vec<String> {
        self.entries.lock().iter().map(|r| r.url.clone()).collect()
    }

    /// Add `candidate` unless an entry with the same URL already exists.
    /// Returns whether it was added. An added entry is visible to subsequent
    /// `list()` calls immediately.
    pub fn append_if_absent(&self, candidate: ImageRef) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|r| r.url == candidate.url) {
            return false;
        }
        entries.push(candidate);
        true
    }

    /// Number of entries, for health reporting.
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Replace the whole list from a fresh provider listing, preserving the
    /// order of `refs` and dropping duplicate URLs within it.
    pub fn replace_all(&self, refs: Vec<ImageRef>) {
        let mut deduped: Vec<ImageRef> = Vec::with_capacity(refs.len());
        for r in refs {
            if !deduped.iter().any(|d| d.url == r.url) {
                deduped.push(r);
            }
        }
        *self.entries.lock() = deduped;
    }
}

/// Cheaply cloneable handle to the process-wide registry, injected into every
/// handler instead of a module-level global.
#[derive(Debug, Clone, Default)]
pub struct SharedRegistry(pub Arc<ImageRegistry>);

impl SharedRegistry {
    pub fn new() -> Self {
        SharedRegistry(Arc::new(ImageRegistry::new()))
    }
}

impl std::ops::Deref for SharedRegistry {
    type Target = ImageRegistry;
    fn deref(&self) -> &ImageRegistry { &self.0 }
}
