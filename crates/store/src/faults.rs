//! Fault-injecting store wrapper for exercising conflict handling.

use std::sync::atomic::{AtomicU32, Ordering};

use intent_core::{IntentDeployment, ObjectKey};

use crate::{ChangeRx, Store, StoreError, StoreResult};

/// Wraps a store and fails the next `n` status writes with `Conflict`.
pub struct ConflictingStore<S> {
    inner: S,
    remaining: AtomicU32,
    injected: AtomicU32,
}

impl<S: Store> ConflictingStore<S> {
    pub fn new(inner: S, conflicts: u32) -> Self {
        Self { inner, remaining: AtomicU32::new(conflicts), injected: AtomicU32::new(0) }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Conflicts returned so far.
    pub fn injected(&self) -> u32 {
        self.injected.load(Ordering::SeqCst)
    }

    fn take(&self) -> bool {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl<S: Store> Store for ConflictingStore<S> {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment> {
        self.inner.get(key).await
    }

    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        self.inner.create(obj).await
    }

    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        self.inner.update(obj).await
    }

    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        if self.take() {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Conflict(ObjectKey::of(&obj)));
        }
        self.inner.update_status(obj).await
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn watch(&self) -> StoreResult<ChangeRx> {
        self.inner.watch().await
    }
}
