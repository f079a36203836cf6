//! Lifecycle controller.
//!
//! A reconcile reads the object, runs the side effect of its current phase, and writes
//! the resulting transition plus any step outputs as one status update. Collaborator
//! failures become transitions (retry or `Failed`); only store trouble and corrupt state
//! surface as [`ReconcileError`].

use std::collections::BTreeMap;
use std::future::Future;
use std::time::{Duration, Instant};

use chrono::Utc;
use intent_core::conditions::{self, ConditionStatus};
use intent_core::lifecycle::ROLLBACK_RETRY_DELAY;
use intent_core::{
    DeliveryStatus, IntentDeployment, IntentDeploymentSpec, IntentDeploymentStatus, ObjectKey, Phase, Requeue,
    RollbackStatus, SiteState, SiteStatus, SyncState, Transition, TransitionKind, ValidationResult,
};
use intent_store::{Store, StoreError};
use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use crate::config::ControllerConfig;
use crate::pipeline::{DeliveryReceipt, Pipeline, RollbackRequest, StepError, StepResult};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("corrupt state for {key}: {detail}")]
    Corrupt { key: ObjectKey, detail: String },
    #[error("{key}: status write lost {attempts} races in a row")]
    ConflictsExhausted { key: ObjectKey, attempts: u32 },
    #[error("{key}: reconcile panicked: {detail}")]
    Panicked { key: ObjectKey, detail: String },
}

/// Step outputs written next to the transition.
#[derive(Debug, Clone, PartialEq)]
enum Edit {
    Manifests(String),
    Delivered { receipt: DeliveryReceipt, sites: Vec<String> },
    Synced(BTreeMap<String, SiteStatus>),
    SyncFailed(BTreeMap<String, SiteStatus>),
    Validation(Vec<ValidationResult>),
    RollbackStarted { reason: String },
    RollbackAttemptFailed { exhausted: bool },
    RolledBack { restored: Option<String>, clear_artifacts: bool },
}

impl Edit {
    fn apply(&self, status: &mut IntentDeploymentStatus) {
        match self {
            Edit::Manifests(m) => status.compiled_manifests = Some(m.clone()),
            Edit::Delivered { receipt, sites } => {
                let prior = status.delivery_status.as_ref().and_then(|d| d.git_commit.clone());
                status.delivery_status = Some(DeliveryStatus {
                    git_commit: Some(receipt.commit.clone()),
                    previous_commit: receipt.previous_commit.clone().or(prior),
                    sync_state: SyncState::Syncing,
                    sites: sites.iter().map(|s| (s.clone(), SiteStatus::default())).collect(),
                });
            }
            Edit::Synced(sites) | Edit::SyncFailed(sites) => {
                let ds = status.delivery_status.get_or_insert_with(DeliveryStatus::default);
                ds.sites = sites.clone();
                ds.sync_state = if matches!(self, Edit::Synced(_)) { SyncState::Synced } else { SyncState::Failed };
            }
            Edit::Validation(results) => status.validation_results = results.clone(),
            Edit::RollbackStarted { reason } => {
                let attempts = status.rollback_attempts();
                let previous_commit = status.delivery_status.as_ref().and_then(|d| d.previous_commit.clone());
                status.rollback_status =
                    Some(RollbackStatus { active: true, reason: reason.clone(), previous_commit, attempts });
            }
            Edit::RollbackAttemptFailed { exhausted } => {
                let rb = status.rollback_status.get_or_insert_with(RollbackStatus::default);
                rb.attempts = rb.attempts.saturating_add(1);
                rb.active = !exhausted;
            }
            Edit::RolledBack { restored, clear_artifacts } => {
                if let Some(rb) = status.rollback_status.as_mut() {
                    rb.active = false;
                }
                if let Some(commit) = restored {
                    let ds = status.delivery_status.get_or_insert_with(DeliveryStatus::default);
                    ds.git_commit = Some(commit.clone());
                    ds.sync_state = SyncState::Synced;
                }
                if *clear_artifacts {
                    status.compiled_manifests = None;
                    status.validation_results.clear();
                }
            }
        }
    }
}

/// The outcome of one phase: a transition and the outputs that go with it.
#[derive(Debug, Clone)]
struct Step {
    transition: Transition,
    edits: Vec<Edit>,
}

impl From<Transition> for Step {
    fn from(transition: Transition) -> Self {
        Self { transition, edits: Vec::new() }
    }
}

impl Step {
    fn edit(mut self, e: Edit) -> Self {
        self.edits.push(e);
        self
    }

    fn apply(&self, status: &mut IntentDeploymentStatus, generation: i64) {
        for e in &self.edits {
            e.apply(status);
        }
        self.transition.apply(status, generation, Utc::now());
    }
}

fn phase_label(p: Option<Phase>) -> &'static str {
    p.map_or("Uninitialized", Phase::as_str)
}

fn rollback_allowed(spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> bool {
    spec.rollback_config
        .as_ref()
        .map_or(false, |rb| rb.auto_rollback && status.rollback_attempts() < rb.max_attempts())
}

async fn bounded<T>(step: &str, limit: Duration, fut: impl Future<Output = StepResult<T>>) -> StepResult<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res,
        Err(_) => Err(StepError::timeout(step, limit)),
    }
}

pub struct LifecycleController<S> {
    store: S,
    pipeline: Pipeline,
    config: ControllerConfig,
}

impl<S: Store> LifecycleController<S> {
    pub fn new(store: S, pipeline: Pipeline, config: ControllerConfig) -> Self {
        Self { store, pipeline, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Advance `key` by at most one phase and say when to look again.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let started = Instant::now();
        let res = self.reconcile_once(key).await;
        histogram!("intent_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        res
    }

    async fn reconcile_once(&self, key: &ObjectKey) -> Result<Requeue, ReconcileError> {
        let Some(obj) = self.fetch(key).await? else {
            debug!(key = %key, "reconcile: object gone");
            return Ok(Requeue::Never);
        };
        let phase = obj.phase();
        counter!("intent_reconcile_total", 1u64, "phase" => phase_label(phase));
        debug!(key = %key, phase = phase_label(phase), "reconcile: start");
        match self.step(key, &obj).await {
            Some(step) => self.commit(key, obj, step).await,
            None => Ok(Requeue::Never),
        }
    }

    async fn fetch(&self, key: &ObjectKey) -> Result<Option<IntentDeployment>, ReconcileError> {
        match self.store.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(StoreError::Corrupt(detail)) => {
                error!(key = %key, detail = %detail, "reconcile: stored state is corrupt");
                Err(ReconcileError::Corrupt { key: key.clone(), detail })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// `None` means the object is idle: terminal phases perform no write.
    async fn step(&self, key: &ObjectKey, obj: &IntentDeployment) -> Option<Step> {
        let spec = &obj.spec;
        let status = obj.status.clone().unwrap_or_default();
        let step = match obj.phase() {
            None => Transition::initialize().into(),
            Some(Phase::Pending) => Transition::start_compiling().into(),
            Some(Phase::Compiling) => self.compile(key, spec, &status).await,
            Some(Phase::Rendering) => self.render(key, spec, &status).await,
            Some(Phase::Delivering) => self.deliver(key, spec, &status).await,
            Some(Phase::Reconciling) => self.wait_for_sync(key, spec, &status).await,
            Some(Phase::Verifying) => self.verify(key, spec, &status).await,
            Some(Phase::Succeeded) => return None,
            Some(Phase::Failed) => {
                if !rollback_allowed(spec, &status) {
                    return None;
                }
                let reason = status.message.clone();
                info!(key = %key, reason = %reason, "reconcile: starting rollback");
                Step::from(Transition::start_rollback(&reason)).edit(Edit::RollbackStarted { reason })
            }
            Some(Phase::RollingBack) => self.rollback(key, spec, &status).await,
        };
        Some(step)
    }

    async fn compile(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        let cc = spec.compile_config.clone().unwrap_or_default();
        let (limit, _) = cc.render_timeout();
        match bounded("compile", limit, self.pipeline.compiler.compile(key, &spec.intent, &cc)).await {
            Ok(manifests) => Step::from(Transition::compiled()).edit(Edit::Manifests(manifests)),
            Err(e) => self.step_failed(key, Phase::Compiling, spec, status, e),
        }
    }

    async fn render(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        let cc = spec.compile_config.clone().unwrap_or_default();
        let Some(manifests) = status.compiled_manifests.as_deref() else {
            let e = StepError::permanent("no compiled manifests to render");
            return self.step_failed(key, Phase::Rendering, spec, status, e);
        };
        let (limit, _) = cc.render_timeout();
        match bounded("render", limit, self.pipeline.renderer.render(key, manifests, &cc)).await {
            Ok(rendered) => Step::from(Transition::rendered(cc.engine.as_str())).edit(Edit::Manifests(rendered)),
            Err(e) => self.step_failed(key, Phase::Rendering, spec, status, e),
        }
    }

    async fn deliver(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        let dc = spec.delivery_config.clone().unwrap_or_default();
        let target = match spec.target_site() {
            Ok(t) => t,
            Err(e) => return self.step_failed(key, Phase::Delivering, spec, status, StepError::permanent(e.to_string())),
        };
        let Some(manifests) = status.compiled_manifests.as_deref() else {
            let e = StepError::permanent("no rendered manifests to deliver");
            return self.step_failed(key, Phase::Delivering, spec, status, e);
        };
        let (limit, _) = dc.sync_wait_timeout();
        match bounded("deliver", limit, self.pipeline.delivery.deliver(key, manifests, &dc)).await {
            Ok(receipt) => {
                let sites = target.sites().iter().map(|s| s.to_string()).collect();
                Step::from(Transition::delivered(&receipt.commit)).edit(Edit::Delivered { receipt, sites })
            }
            Err(e) => self.step_failed(key, Phase::Delivering, spec, status, e),
        }
    }

    async fn wait_for_sync(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        let dc = spec.delivery_config.clone().unwrap_or_default();
        let Some(commit) = status.delivery_status.as_ref().and_then(|d| d.git_commit.clone()) else {
            let e = StepError::permanent("no delivered commit to wait for");
            return self.step_failed(key, Phase::Reconciling, spec, status, e);
        };
        let (limit, _) = dc.sync_wait_timeout();
        match bounded("wait-for-sync", limit, self.pipeline.delivery.wait_for_sync(key, &commit, &dc)).await {
            Ok(sites) => {
                let failed: Vec<String> = sites
                    .iter()
                    .filter(|(_, s)| s.state == SiteState::Failed)
                    .map(|(name, s)| if s.message.is_empty() { name.clone() } else { format!("{name} ({})", s.message) })
                    .collect();
                if failed.is_empty() {
                    Step::from(Transition::synced()).edit(Edit::Synced(sites))
                } else {
                    let e = StepError::permanent(format!("sync failed on {}", failed.join(", ")));
                    self.step_failed(key, Phase::Reconciling, spec, status, e).edit(Edit::SyncFailed(sites))
                }
            }
            Err(e) => self.step_failed(key, Phase::Reconciling, spec, status, e),
        }
    }

    async fn verify(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        if !spec.gates_enabled() {
            return Transition::verified("Gates disabled; verification skipped").into();
        }
        let gc = spec.gates_config.clone().unwrap_or_default();
        let ds = status.delivery_status.clone().unwrap_or_default();
        match bounded("gates", self.config.gate_timeout, self.pipeline.gates.run_gates(key, &gc, &ds)).await {
            Ok(report) if report.overall_pass => {
                let summary = format!("All {} gate checks passed", report.results.len());
                Step::from(Transition::verified(&summary)).edit(Edit::Validation(report.results))
            }
            Ok(report) => {
                let failed: Vec<&str> = report.failed_checks().map(|r| r.name.as_str()).collect();
                let detail = format!("Gate checks failed: {}", failed.join(", "));
                info!(key = %key, failed = %failed.join(","), "reconcile: gates did not pass");
                counter!("intent_step_failures_total", 1u64, "phase" => Phase::Verifying.as_str(), "kind" => "gate");
                let t = Transition::failed(Phase::Verifying, "GateFailed", detail.clone(), rollback_allowed(spec, status))
                    .with_condition(conditions::VERIFIED, ConditionStatus::False, "GateFailed", detail);
                Step::from(t).edit(Edit::Validation(report.results))
            }
            Err(e) => self.step_failed(key, Phase::Verifying, spec, status, e),
        }
    }

    async fn rollback(&self, key: &ObjectKey, spec: &IntentDeploymentSpec, status: &IntentDeploymentStatus) -> Step {
        let dc = spec.delivery_config.clone().unwrap_or_default();
        let ds = status.delivery_status.clone().unwrap_or_default();
        let restore_commit = status
            .rollback_status
            .as_ref()
            .and_then(|r| r.previous_commit.clone())
            .or_else(|| ds.previous_commit.clone());
        let sites = spec
            .target_site()
            .map(|t| t.sites().iter().map(|s| s.to_string()).collect())
            .unwrap_or_default();
        let request = RollbackRequest { failed_commit: ds.git_commit.clone(), restore_commit, sites };
        let (limit, _) = dc.sync_wait_timeout();
        match bounded("rollback", limit, self.pipeline.delivery.rollback(key, &request, &dc)).await {
            Ok(restored) => {
                let restored = restored.or(request.restore_commit);
                let clear_artifacts = spec.rollback_config.as_ref().map_or(false, |rb| !rb.retain_failed_artifacts);
                info!(key = %key, restored = ?restored, "reconcile: rollback complete");
                Step::from(Transition::rolled_back(restored.as_deref())).edit(Edit::RolledBack { restored, clear_artifacts })
            }
            Err(e) => {
                counter!("intent_step_failures_total", 1u64, "phase" => Phase::RollingBack.as_str(), "kind" => e.kind.as_str());
                let max = spec.rollback_config.as_ref().map_or(1, |rb| rb.max_attempts());
                let attempt = status.rollback_attempts().saturating_add(1);
                if attempt < max {
                    warn!(key = %key, attempt, max, error = %e, "reconcile: rollback attempt failed, retrying");
                    Step::from(Transition::retry(Phase::RollingBack, attempt, max, &e.message, ROLLBACK_RETRY_DELAY))
                        .edit(Edit::RollbackAttemptFailed { exhausted: false })
                } else {
                    warn!(key = %key, attempt, error = %e, "reconcile: rollback attempts exhausted");
                    let detail = format!("Rollback failed after {attempt} attempts: {e}");
                    Step::from(Transition::failed(Phase::RollingBack, "RollbackFailed", detail, false))
                        .edit(Edit::RollbackAttemptFailed { exhausted: true })
                }
            }
        }
    }

    /// Retry transient failures in place until the attempt budget is spent.
    fn step_failed(
        &self,
        key: &ObjectKey,
        phase: Phase,
        spec: &IntentDeploymentSpec,
        status: &IntentDeploymentStatus,
        err: StepError,
    ) -> Step {
        counter!("intent_step_failures_total", 1u64, "phase" => phase.as_str(), "kind" => err.kind.as_str());
        let max = self.config.max_step_attempts.max(1);
        let attempt = status.phase_attempts.saturating_add(1);
        if err.is_transient() && attempt < max {
            warn!(key = %key, phase = %phase, attempt, max, error = %err, "reconcile: transient failure, retrying");
            return Transition::retry(phase, attempt, max, &err.message, self.config.step_retry_delay).into();
        }
        let detail = if err.is_transient() {
            format!("{phase} failed after {attempt} attempts: {err}")
        } else {
            format!("{phase} failed: {err}")
        };
        let rollback = rollback_allowed(spec, status);
        warn!(key = %key, phase = %phase, error = %err, rollback, "reconcile: step failed");
        Transition::failed(phase, "StepFailed", detail, rollback).into()
    }

    /// Persist the step. On a conflict the outcome is reapplied to a fresh read as long
    /// as neither the phase nor the spec generation moved in between; otherwise it is
    /// dropped and the phase runs again against the current object.
    async fn commit(&self, key: &ObjectKey, mut obj: IntentDeployment, step: Step) -> Result<Requeue, ReconcileError> {
        let computed_for = obj.generation();
        let mut conflicts = 0u32;
        loop {
            let generation = obj.generation();
            let mut status = obj.status.take().unwrap_or_default();
            step.apply(&mut status, generation);
            obj.status = Some(status);
            match self.store.update_status(obj).await {
                Ok(_) => {
                    self.record(key, &step.transition);
                    return Ok(step.transition.requeue);
                }
                Err(StoreError::Conflict(_)) => {
                    counter!("intent_status_conflicts_total", 1u64);
                    conflicts += 1;
                    if conflicts > self.config.conflict_retries {
                        warn!(key = %key, conflicts, "reconcile: giving up after repeated status conflicts");
                        return Err(ReconcileError::ConflictsExhausted { key: key.clone(), attempts: conflicts });
                    }
                    let Some(fresh) = self.fetch(key).await? else {
                        return Ok(Requeue::Never);
                    };
                    if fresh.phase() != step.transition.from {
                        debug!(
                            key = %key,
                            expected = phase_label(step.transition.from),
                            found = phase_label(fresh.phase()),
                            "reconcile: phase moved concurrently; dropping outcome"
                        );
                        return Ok(Requeue::IMMEDIATE);
                    }
                    if fresh.generation() != computed_for {
                        debug!(
                            key = %key,
                            computed_for,
                            found = fresh.generation(),
                            "reconcile: spec changed during the step; dropping outcome"
                        );
                        return Ok(Requeue::IMMEDIATE);
                    }
                    debug!(key = %key, conflicts, "reconcile: status conflict, reapplying on fresh read");
                    obj = fresh;
                }
                Err(StoreError::NotFound(_)) => return Ok(Requeue::Never),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn record(&self, key: &ObjectKey, t: &Transition) {
        let from = phase_label(t.from);
        counter!("intent_phase_transitions_total", 1u64, "from" => from, "to" => t.next.as_str());
        match t.kind {
            TransitionKind::Retry => debug!(key = %key, phase = %t.next, "reconcile: retry scheduled"),
            TransitionKind::Advance | TransitionKind::Fail => info!(
                key = %key,
                from,
                to = %t.next,
                requeue = ?t.requeue.delay(),
                message = %t.message,
                "reconcile: transition"
            ),
        }
    }
}
