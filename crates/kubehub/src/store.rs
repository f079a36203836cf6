//! Store implementation over the Kubernetes API.

use futures::StreamExt;
use intent_core::{IntentDeployment, ObjectKey};
use intent_store::{Change, ChangeRx, Store, StoreError, StoreResult};
use kube::api::{Api, DeleteParams, PostParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Store backed by the cluster. `resourceVersion` conflicts surface as `Conflict`;
/// objects that fail to decode (e.g. an unknown phase) as `Corrupt`.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    /// Watch scope; `None` watches every namespace.
    namespace: Option<String>,
}

fn map_err(key: &ObjectKey, e: kube::Error) -> StoreError {
    match e {
        kube::Error::Api(r) => match r.code {
            404 => StoreError::NotFound(key.clone()),
            409 => StoreError::Conflict(key.clone()),
            400 | 422 => StoreError::Invalid(r.message),
            403 if r.message.contains("admission webhook") => StoreError::Invalid(r.message),
            _ => StoreError::Backend(format!("{} ({}): {}", r.reason, r.code, r.message)),
        },
        kube::Error::SerdeError(e) => StoreError::Corrupt(format!("{key}: {e}")),
        other => StoreError::Backend(other.to_string()),
    }
}

impl KubeStore {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn api(&self, namespace: &str) -> Api<IntentDeployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn scoped_api(&self) -> Api<IntentDeployment> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait::async_trait]
impl Store for KubeStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment> {
        self.api(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| map_err(key, e))?
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        let key = ObjectKey::of(&obj);
        self.api(&key.namespace).create(&PostParams::default(), &obj).await.map_err(|e| map_err(&key, e))
    }

    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        let key = ObjectKey::of(&obj);
        self.api(&key.namespace)
            .replace(&key.name, &PostParams::default(), &obj)
            .await
            .map_err(|e| map_err(&key, e))
    }

    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        let key = ObjectKey::of(&obj);
        let body = serde_json::to_vec(&obj).map_err(|e| StoreError::Invalid(format!("{key}: {e}")))?;
        self.api(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| map_err(&key, e))
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.api(&key.namespace)
            .delete(&key.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err(key, e))
    }

    async fn watch(&self) -> StoreResult<ChangeRx> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(self.scoped_api(), tx));
        Ok(rx)
    }
}

async fn pump(api: Api<IntentDeployment>, tx: mpsc::UnboundedSender<Change>) {
    let mut seen = FxHashMap::default();
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!("kube watch started");
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(error = %e, "kube watch error; backing off");
                continue;
            }
        };
        for c in translate(&mut seen, ev) {
            if tx.send(c).is_err() {
                debug!("kube watch receiver dropped");
                return;
            }
        }
    }
    warn!("kube watch stream ended");
}

/// Map watcher events to changes. `seen` holds the last generation per object so
/// status-only updates can be flagged; a relist replays every object and emits
/// deletions for objects that disappeared while disconnected.
fn translate(seen: &mut FxHashMap<ObjectKey, i64>, ev: Event<IntentDeployment>) -> Vec<Change> {
    match ev {
        Event::Applied(o) => {
            let key = ObjectKey::of(&o);
            let generation = o.generation();
            let status_only = seen.insert(key.clone(), generation) == Some(generation);
            vec![Change::applied(key, generation, status_only)]
        }
        Event::Deleted(o) => {
            let key = ObjectKey::of(&o);
            seen.remove(&key);
            vec![Change::deleted(key, o.generation())]
        }
        Event::Restarted(list) => {
            debug!(count = list.len(), "kube watch relisted");
            let mut live = FxHashMap::default();
            let mut out = Vec::with_capacity(list.len());
            for o in &list {
                let key = ObjectKey::of(o);
                live.insert(key.clone(), o.generation());
                out.push(Change::applied(key, o.generation(), false));
            }
            for (key, generation) in seen.drain() {
                if !live.contains_key(&key) {
                    out.push(Change::deleted(key, generation));
                }
            }
            *seen = live;
            out
        }
    }
}
