//! Intent store: the persistence contract the lifecycle controller runs against.
//!
//! Writes use optimistic concurrency: an update carrying a stale `resourceVersion`
//! fails with [`StoreError::Conflict`] instead of overwriting a concurrent change.

#![forbid(unsafe_code)]

use std::sync::Arc;

use intent_admission::AdmissionError;
use intent_core::{IntentDeployment, ObjectKey};
use tokio::sync::mpsc;

mod memory;
pub mod faults;

pub use memory::MemoryStore;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("conflict: {0} was modified concurrently")]
    Conflict(ObjectKey),
    #[error("invalid: {0}")]
    Invalid(String),
    /// Stored data could not be decoded (e.g. an unknown phase literal).
    #[error("corrupt: {0}")]
    Corrupt(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl From<AdmissionError> for StoreError {
    fn from(e: AdmissionError) -> Self {
        StoreError::Invalid(e.to_string())
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
}

/// Change notification keyed by namespace/name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub key: ObjectKey,
    pub kind: ChangeKind,
    pub generation: i64,
    /// Only `status` moved; spec and generation are unchanged.
    pub status_only: bool,
}

impl Change {
    pub fn applied(key: ObjectKey, generation: i64, status_only: bool) -> Self {
        Self { key, kind: ChangeKind::Applied, generation, status_only }
    }

    pub fn deleted(key: ObjectKey, generation: i64) -> Self {
        Self { key, kind: ChangeKind::Deleted, generation, status_only: false }
    }
}

pub type ChangeRx = mpsc::UnboundedReceiver<Change>;

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment>;

    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment>;

    /// Replace spec and metadata. The stored status is kept.
    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment>;

    /// Replace status only, checked against `metadata.resourceVersion`.
    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment>;

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()>;

    /// Subscribe to changes. Existing objects are replayed as `Applied` first.
    async fn watch(&self) -> StoreResult<ChangeRx>;
}

#[async_trait::async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment> {
        (**self).get(key).await
    }

    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        (**self).create(obj).await
    }

    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        (**self).update(obj).await
    }

    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        (**self).update_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        (**self).delete(key).await
    }

    async fn watch(&self) -> StoreResult<ChangeRx> {
        (**self).watch().await
    }
}
