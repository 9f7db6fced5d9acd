use std::collections::BTreeMap;
use std::sync::Arc;

use crate::site::SiteId;
use crate::state::SyncState;

/// Errors surfaced by a state store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt state for {site}: {message}")]
    Corrupt { site: SiteId, message: String },
}

/// Persistent mapping from site id to its sync history.
///
/// Only the orchestrator writes; every write replaces one site's record
/// atomically.
pub trait StateStore: Send + Sync {
    /// Snapshot of every stored record.
    fn load_all(&self) -> Result<BTreeMap<SiteId, SyncState>, StateError>;

    fn get(&self, id: &SiteId) -> Result<Option<SyncState>, StateError>;

    /// Replace the record for `id`.
    fn put(&self, id: &SiteId, state: &SyncState) -> Result<(), StateError>;

    /// Create an empty record for `id` unless one exists.
    fn ensure(&self, id: &SiteId) -> Result<(), StateError>;

    /// Drop every record whose id is not in `keep`. Returns how many went.
    fn retain(&self, keep: &[SiteId]) -> Result<usize, StateError>;
}

impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    fn load_all(&self) -> Result<BTreeMap<SiteId, SyncState>, StateError> {
        (**self).load_all()
    }

    fn get(&self, id: &SiteId) -> Result<Option<SyncState>, StateError> {
        (**self).get(id)
    }

    fn put(&self, id: &SiteId, state: &SyncState) -> Result<(), StateError> {
        (**self).put(id, state)
    }

    fn ensure(&self, id: &SiteId) -> Result<(), StateError> {
        (**self).ensure(id)
    }

    fn retain(&self, keep: &[SiteId]) -> Result<usize, StateError> {
        (**self).retain(keep)
    }
}
