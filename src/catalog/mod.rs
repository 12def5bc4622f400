//! Catalog - process-wide identity/attribute store
//!
//! ## Responsibilities
//!
//! - OID allocation per namespace (with optional hole compaction)
//! - Flat `(OID, field) -> value` attributes
//! - Reverse lookups (controller by device id, owner of a door)
//!
//! ## Design
//!
//! - Readers take an `Arc<Snapshot>` and never block writers for longer
//!   than a pointer swap
//! - Writers hold the exclusive section only for the map mutation itself
//! - Addressing bugs (writes outside a namespace, duplicate instances) panic

pub mod fields;
mod oid;
mod snapshot;

pub use oid::{Namespace, Oid};
pub use snapshot::{Snapshot, Value};

use std::sync::{Arc, PoisonError, RwLock};

/// Shared, thread-safe catalog
#[derive(Debug)]
pub struct Catalog {
    inner: RwLock<Arc<Snapshot>>,
}

impl Catalog {
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            inner: RwLock::new(Arc::new(snapshot)),
        }
    }

    /// Current consistent view
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps in a snapshot prepared off the live state
    pub fn replace(&self, snapshot: Snapshot) {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(snapshot);
    }
}
