//! Phase transition table.
//!
//! Every edge of the lifecycle is a named constructor on [`Transition`]. A transition
//! carries the next phase, the status message, at least one condition update and the
//! requeue request, and is applied to a status in one go so a write never carries a
//! phase without its conditions.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::conditions::{self, ConditionStatus};
use crate::phase::Phase;
use crate::types::IntentDeploymentStatus;

/// Delay between `Pending` and `Compiling`.
pub const SHORT_DELAY: Duration = Duration::from_secs(2);
/// Delay after every other forward edge.
pub const STEP_DELAY: Duration = Duration::from_secs(5);
/// Fixed backpressure before (re)trying a rollback.
pub const ROLLBACK_RETRY_DELAY: Duration = Duration::from_secs(5);

/// What the controller asks of its scheduler after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Idle until the next external trigger.
    Never,
    After(Duration),
}

impl Requeue {
    pub const IMMEDIATE: Requeue = Requeue::After(Duration::ZERO);

    pub fn delay(self) -> Option<Duration> {
        match self {
            Requeue::Never => None,
            Requeue::After(d) => Some(d),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionKind {
    /// Forward edge (including `Failed -> RollingBack`).
    Advance,
    /// Same phase again after a transient failure.
    Retry,
    /// Edge into `Failed`.
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConditionUpdate {
    pub type_: &'static str,
    pub status: ConditionStatus,
    pub reason: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub from: Option<Phase>,
    pub next: Phase,
    pub kind: TransitionKind,
    pub message: String,
    pub conditions: Vec<ConditionUpdate>,
    pub requeue: Requeue,
}

impl Transition {
    fn new(from: Option<Phase>, next: Phase, kind: TransitionKind, message: impl Into<String>, requeue: Requeue) -> Self {
        Self { from, next, kind, message: message.into(), conditions: Vec::new(), requeue }
    }

    pub fn with_condition(
        mut self,
        type_: &'static str,
        status: ConditionStatus,
        reason: &'static str,
        message: impl Into<String>,
    ) -> Self {
        self.conditions.push(ConditionUpdate { type_, status, reason, message: message.into() });
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// `"" -> Pending`
    pub fn initialize() -> Self {
        Self::new(None, Phase::Pending, TransitionKind::Advance, "Intent deployment initialized", Requeue::IMMEDIATE)
            .with_condition(conditions::READY, ConditionStatus::False, "Initializing", "Intent deployment is initializing")
    }

    /// `Pending -> Compiling`
    pub fn start_compiling() -> Self {
        Self::new(
            Some(Phase::Pending),
            Phase::Compiling,
            TransitionKind::Advance,
            "Starting intent compilation",
            Requeue::After(SHORT_DELAY),
        )
        .with_condition(conditions::COMPILING, ConditionStatus::True, "InProgress", "Compiling intent to KRM")
    }

    /// `Compiling -> Rendering`
    pub fn compiled() -> Self {
        Self::new(
            Some(Phase::Compiling),
            Phase::Rendering,
            TransitionKind::Advance,
            "Intent compiled; rendering manifests",
            Requeue::After(STEP_DELAY),
        )
        .with_condition(conditions::COMPILING, ConditionStatus::False, "Complete", "Intent compiled to KRM")
    }

    /// `Rendering -> Delivering`
    pub fn rendered(engine: &str) -> Self {
        Self::new(
            Some(Phase::Rendering),
            Phase::Delivering,
            TransitionKind::Advance,
            "Manifests rendered; delivering to GitOps",
            Requeue::After(STEP_DELAY),
        )
        .with_condition(conditions::RENDERED, ConditionStatus::True, "Complete", format!("Manifests rendered with {engine}"))
    }

    /// `Delivering -> Reconciling`
    pub fn delivered(commit: &str) -> Self {
        Self::new(
            Some(Phase::Delivering),
            Phase::Reconciling,
            TransitionKind::Advance,
            "GitOps reconciliation in progress",
            Requeue::After(STEP_DELAY),
        )
        .with_condition(conditions::GITOPS_SYNC, ConditionStatus::True, "Syncing", format!("Waiting for Config Sync of {commit}"))
    }

    /// `Reconciling -> Verifying`
    pub fn synced() -> Self {
        Self::new(
            Some(Phase::Reconciling),
            Phase::Verifying,
            TransitionKind::Advance,
            "Verifying deployment against SLOs",
            Requeue::After(STEP_DELAY),
        )
        .with_condition(conditions::RECONCILED, ConditionStatus::True, "Complete", "GitOps sync completed")
    }

    /// `Verifying -> Succeeded`
    pub fn verified(summary: &str) -> Self {
        Self::new(
            Some(Phase::Verifying),
            Phase::Succeeded,
            TransitionKind::Advance,
            "Deployment verified and succeeded",
            Requeue::Never,
        )
        .with_condition(conditions::VERIFIED, ConditionStatus::True, "Passed", summary)
        .with_condition(conditions::READY, ConditionStatus::True, "Succeeded", summary)
    }

    /// `Failed -> RollingBack`
    pub fn start_rollback(reason: &str) -> Self {
        Self::new(
            Some(Phase::Failed),
            Phase::RollingBack,
            TransitionKind::Advance,
            "Rolling back to last known-good delivery",
            Requeue::After(ROLLBACK_RETRY_DELAY),
        )
        .with_condition(conditions::ROLLED_BACK, ConditionStatus::Unknown, "InProgress", format!("Rolling back: {reason}"))
    }

    /// `RollingBack -> Succeeded`
    pub fn rolled_back(restored: Option<&str>) -> Self {
        let detail = match restored {
            Some(commit) => format!("Rollback completed; restored {commit}"),
            None => "Rollback completed; no prior delivery to restore".to_string(),
        };
        Self::new(Some(Phase::RollingBack), Phase::Succeeded, TransitionKind::Advance, detail.clone(), Requeue::Never)
            .with_condition(conditions::ROLLED_BACK, ConditionStatus::True, "Complete", detail.clone())
            .with_condition(conditions::FAILED, ConditionStatus::False, "RolledBack", detail.clone())
            .with_condition(conditions::READY, ConditionStatus::True, "RolledBack", detail)
    }

    /// `<from> -> Failed`. Requeues only when a rollback will pick the failure up.
    pub fn failed(from: Phase, reason: &'static str, detail: impl Into<String>, rollback_follows: bool) -> Self {
        let detail = detail.into();
        let requeue = if rollback_follows { Requeue::After(ROLLBACK_RETRY_DELAY) } else { Requeue::Never };
        Self::new(Some(from), Phase::Failed, TransitionKind::Fail, detail.clone(), requeue)
            .with_condition(conditions::FAILED, ConditionStatus::True, reason, detail.clone())
            .with_condition(conditions::READY, ConditionStatus::False, reason, detail)
    }

    /// `<phase> -> <phase>` after a transient failure.
    pub fn retry(phase: Phase, attempt: u32, max: u32, error: &str, delay: Duration) -> Self {
        let detail = format!("{phase} attempt {attempt}/{max} failed, retrying: {error}");
        Self::new(Some(phase), phase, TransitionKind::Retry, detail.clone(), Requeue::After(delay))
            .with_condition(conditions::READY, ConditionStatus::False, "Retrying", detail)
    }

    /// Write phase, message, conditions and generation bookkeeping in one step.
    pub fn apply(&self, status: &mut IntentDeploymentStatus, generation: i64, now: DateTime<Utc>) {
        match self.kind {
            TransitionKind::Retry => status.phase_attempts = status.phase_attempts.saturating_add(1),
            TransitionKind::Advance | TransitionKind::Fail => status.phase_attempts = 0,
        }
        status.phase = Some(self.next);
        status.message = self.message.clone();
        for c in &self.conditions {
            status.conditions.set_at(c.type_, c.status, c.reason, &c.message, now);
        }
        status.observed_generation = status.observed_generation.max(generation);
        status.last_update_time = Some(now);
    }
}
