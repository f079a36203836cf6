//! In-process store with resource versions, generation tracking and an admission hook.

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use intent_admission::{Operation, Validator};
use intent_core::{IntentDeployment, ObjectKey};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{Change, ChangeRx, Store, StoreError, StoreResult};

#[derive(Default)]
struct Inner {
    objects: FxHashMap<ObjectKey, IntentDeployment>,
    version: u64,
    subscribers: Vec<mpsc::UnboundedSender<Change>>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version = self.version.saturating_add(1);
        self.version.to_string()
    }

    fn notify(&mut self, change: Change) {
        self.subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn current(&self, key: &ObjectKey) -> StoreResult<&IntentDeployment> {
        self.objects.get(key).ok_or_else(|| StoreError::NotFound(key.clone()))
    }
}

/// Stale `resourceVersion` check. A write without a version is unconditional.
fn check_version(key: &ObjectKey, current: &IntentDeployment, incoming: &IntentDeployment) -> StoreResult<()> {
    match incoming.metadata.resource_version.as_deref() {
        Some(rv) if Some(rv) != current.metadata.resource_version.as_deref() => {
            debug!(key = %key, incoming = %rv, "store: stale resourceVersion");
            Err(StoreError::Conflict(key.clone()))
        }
        _ => Ok(()),
    }
}

/// In-memory [`Store`]. Every create/update/delete passes through the admission validator.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    validator: Validator,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |g| g.objects.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| StoreError::Backend("memory store lock poisoned".into()))
    }
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment> {
        self.lock()?.current(key).cloned()
    }

    async fn create(&self, mut obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        if obj.metadata.name.as_deref().map_or(true, str::is_empty) {
            return Err(StoreError::Invalid("metadata.name is required".into()));
        }
        let key = ObjectKey::of(&obj);
        for w in self.validator.validate(Operation::Create, None, Some(&obj))? {
            warn!(key = %key, warning = %w, "store: admission warning");
        }
        let mut g = self.lock()?;
        if g.objects.contains_key(&key) {
            return Err(StoreError::Conflict(key));
        }
        obj.metadata.namespace = Some(key.namespace.clone());
        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        obj.metadata.generation = Some(1);
        obj.metadata.creation_timestamp = Some(Time(Utc::now()));
        obj.metadata.resource_version = Some(g.next_version());
        g.objects.insert(key.clone(), obj.clone());
        debug!(key = %key, "store: created");
        g.notify(Change::applied(key, 1, false));
        Ok(obj)
    }

    async fn update(&self, mut obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        let key = ObjectKey::of(&obj);
        let mut g = self.lock()?;
        let current = g.current(&key)?;
        check_version(&key, current, &obj)?;
        for w in self.validator.validate(Operation::Update, Some(current), Some(&obj))? {
            warn!(key = %key, warning = %w, "store: admission warning");
        }
        let mut generation = current.generation();
        if current.spec != obj.spec {
            generation += 1;
        }
        obj.metadata.namespace = Some(key.namespace.clone());
        obj.metadata.uid = current.metadata.uid.clone();
        obj.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        obj.metadata.generation = Some(generation);
        obj.status = current.status.clone();
        obj.metadata.resource_version = Some(g.next_version());
        g.objects.insert(key.clone(), obj.clone());
        debug!(key = %key, generation, "store: updated");
        g.notify(Change::applied(key, generation, false));
        Ok(obj)
    }

    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        let key = ObjectKey::of(&obj);
        let mut g = self.lock()?;
        let current = g.current(&key)?;
        check_version(&key, current, &obj)?;
        let mut next = current.clone();
        next.status = obj.status;
        next.metadata.resource_version = Some(g.next_version());
        let generation = next.generation();
        g.objects.insert(key.clone(), next.clone());
        debug!(key = %key, phase = ?next.phase(), "store: status updated");
        g.notify(Change::applied(key, generation, true));
        Ok(next)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        let mut g = self.lock()?;
        let current = g.current(key)?;
        self.validator.validate(Operation::Delete, Some(current), None)?;
        let generation = current.generation();
        g.objects.remove(key);
        debug!(key = %key, "store: deleted");
        g.notify(Change::deleted(key.clone(), generation));
        Ok(())
    }

    async fn watch(&self) -> StoreResult<ChangeRx> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut g = self.lock()?;
        let mut existing: Vec<_> = g.objects.iter().map(|(k, o)| (k.clone(), o.generation())).collect();
        existing.sort();
        for (key, generation) in existing {
            let _ = tx.send(Change::applied(key, generation, false));
        }
        g.subscribers.push(tx);
        Ok(rx)
    }
}
