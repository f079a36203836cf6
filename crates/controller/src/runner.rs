//! Level-triggered reconcile loop over store changes and per-object requeue timers.
//!
//! At most one reconcile runs per object; a change that lands while one is in flight
//! marks the object dirty and it runs again right after. Deleting an object cancels its
//! timer and drops any queued work.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use intent_core::{ObjectKey, Requeue};
use intent_store::{Change, ChangeKind, Store, StoreError};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::lifecycle::{LifecycleController, ReconcileError};
use crate::queue::WorkQueue;

type Done = (ObjectKey, Result<Requeue, ReconcileError>);

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub struct Runner<S> {
    controller: Arc<LifecycleController<S>>,
}

struct Timer {
    seq: u64,
    handle: JoinHandle<()>,
}

/// Loop state, owned by a single `drive` call.
struct State {
    queue: WorkQueue,
    in_flight: FxHashSet<ObjectKey>,
    dirty: FxHashSet<ObjectKey>,
    /// In flight when deleted; their requeue requests are discarded.
    tombstones: FxHashSet<ObjectKey>,
    timers: FxHashMap<ObjectKey, Timer>,
    seq: u64,
    fired_tx: mpsc::UnboundedSender<(ObjectKey, u64)>,
}

impl State {
    fn on_change(&mut self, c: Change) {
        match c.kind {
            ChangeKind::Deleted => {
                debug!(key = %c.key, "runner: deleted; cancelling pending work");
                self.cancel_timer(&c.key);
                self.queue.remove(&c.key);
                self.dirty.remove(&c.key);
                if self.in_flight.contains(&c.key) {
                    self.tombstones.insert(c.key);
                }
            }
            ChangeKind::Applied if c.status_only => {}
            ChangeKind::Applied => {
                self.tombstones.remove(&c.key);
                self.enqueue(c.key);
            }
        }
    }

    fn enqueue(&mut self, key: ObjectKey) {
        if self.in_flight.contains(&key) {
            self.dirty.insert(key);
        } else {
            self.queue.push(key);
        }
    }

    fn schedule(&mut self, key: ObjectKey, after: Duration) {
        self.cancel_timer(&key);
        self.seq += 1;
        let seq = self.seq;
        let tx = self.fired_tx.clone();
        let k = key.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send((k, seq));
        });
        self.timers.insert(key, Timer { seq, handle });
    }

    fn cancel_timer(&mut self, key: &ObjectKey) {
        if let Some(t) = self.timers.remove(key) {
            t.handle.abort();
        }
    }

    fn on_fired(&mut self, key: ObjectKey, seq: u64) {
        // a replaced timer may have fired before it was aborted
        if self.timers.get(&key).map_or(true, |t| t.seq != seq) {
            return;
        }
        self.timers.remove(&key);
        self.enqueue(key);
    }

    fn on_done(&mut self, key: ObjectKey, res: Result<Requeue, ReconcileError>, backoff: Duration) {
        self.in_flight.remove(&key);
        let requeue = match res {
            Ok(r) => r,
            Err(e) => {
                warn!(key = %key, error = %e, "runner: reconcile failed; backing off");
                Requeue::After(backoff)
            }
        };
        if self.tombstones.remove(&key) {
            return;
        }
        if self.dirty.remove(&key) {
            self.queue.push(key);
            return;
        }
        match requeue.delay() {
            Some(d) => self.schedule(key, d),
            None => self.cancel_timer(&key),
        }
    }

    fn shutdown(&mut self) {
        for (_, t) in self.timers.drain() {
            t.handle.abort();
        }
    }
}

impl<S: Store + 'static> Runner<S> {
    pub fn new(controller: Arc<LifecycleController<S>>) -> Self {
        Self { controller }
    }

    /// Run until `shutdown` is cancelled or the change stream ends.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), StoreError> {
        self.drive(Some(shutdown), false).await
    }

    /// Run until no queued work, in-flight reconcile or pending timer remains.
    pub async fn run_until_idle(&self) -> Result<(), StoreError> {
        self.drive(None, true).await
    }

    async fn drive(&self, shutdown: Option<CancellationToken>, stop_when_idle: bool) -> Result<(), StoreError> {
        let cfg = self.controller.config();
        let concurrency = cfg.concurrency.max(1);
        let backoff = cfg.error_backoff;
        let shutdown = shutdown.unwrap_or_default();

        let mut changes = self.controller.store().watch().await?;
        let (fired_tx, mut fired_rx) = mpsc::unbounded_channel();
        let mut st = State {
            queue: WorkQueue::new(),
            in_flight: FxHashSet::default(),
            dirty: FxHashSet::default(),
            tombstones: FxHashSet::default(),
            timers: FxHashMap::default(),
            seq: 0,
            fired_tx,
        };
        let mut tasks: JoinSet<Done> = JoinSet::new();
        let mut changes_open = true;
        info!(concurrency, "runner: started");

        loop {
            while let Ok(c) = changes.try_recv() {
                st.on_change(c);
            }
            while let Ok((key, seq)) = fired_rx.try_recv() {
                st.on_fired(key, seq);
            }
            while tasks.len() < concurrency {
                let Some(key) = st.queue.pop() else { break };
                st.in_flight.insert(key.clone());
                let ctl = Arc::clone(&self.controller);
                tasks.spawn(async move {
                    // a panicking reconcile must still hand its key back
                    let res = match AssertUnwindSafe(ctl.reconcile(&key)).catch_unwind().await {
                        Ok(res) => res,
                        Err(payload) => {
                            Err(ReconcileError::Panicked { key: key.clone(), detail: panic_detail(payload.as_ref()) })
                        }
                    };
                    (key, res)
                });
            }
            if stop_when_idle && tasks.is_empty() && st.queue.is_empty() && st.timers.is_empty() {
                debug!("runner: idle");
                break;
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("runner: shutdown requested");
                    break;
                }
                maybe = changes.recv(), if changes_open => match maybe {
                    Some(c) => st.on_change(c),
                    None => {
                        warn!("runner: change stream closed");
                        changes_open = false;
                        if !stop_when_idle {
                            break;
                        }
                    }
                },
                Some((key, seq)) = fired_rx.recv() => st.on_fired(key, seq),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => match joined {
                    Ok((key, res)) => st.on_done(key, res, backoff),
                    Err(e) => error!(error = %e, "runner: reconcile task aborted"),
                },
            }
        }

        st.shutdown();
        tasks.abort_all();
        info!("runner: stopped");
        Ok(())
    }
}
