//! External collaborators the lifecycle delegates to.
//!
//! Each phase's side effect is one call on one of these traits. The controller bounds
//! every call with a timeout; implementations only report what happened.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use intent_core::{CompileConfig, DeliveryConfig, DeliveryStatus, GatesConfig, ObjectKey, SiteStatus, ValidationResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepErrorKind {
    /// Worth retrying in the same phase (timeouts, unreachable backends).
    Transient,
    Permanent,
}

impl StepErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StepErrorKind::Transient => "transient",
            StepErrorKind::Permanent => "permanent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Transient, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { kind: StepErrorKind::Permanent, message: message.into() }
    }

    pub fn timeout(step: &str, limit: Duration) -> Self {
        Self::transient(format!("{step} timed out after {}s", limit.as_secs_f64()))
    }

    pub fn is_transient(&self) -> bool {
        self.kind == StepErrorKind::Transient
    }
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type StepResult<T> = Result<T, StepError>;

/// Outcome of pushing manifests to the GitOps repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub commit: String,
    /// Repository head before this push, if any.
    #[serde(default)]
    pub previous_commit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackRequest {
    pub failed_commit: Option<String>,
    pub restore_commit: Option<String>,
    pub sites: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub results: Vec<ValidationResult>,
    pub overall_pass: bool,
}

impl GateReport {
    pub fn failed_checks(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

#[async_trait::async_trait]
pub trait Compiler: Send + Sync {
    /// Turn intent text into a KRM manifest bundle.
    async fn compile(&self, key: &ObjectKey, intent: &str, config: &CompileConfig) -> StepResult<String>;
}

#[async_trait::async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, key: &ObjectKey, manifests: &str, config: &CompileConfig) -> StepResult<String>;
}

#[async_trait::async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, key: &ObjectKey, manifests: &str, config: &DeliveryConfig) -> StepResult<DeliveryReceipt>;

    /// Per-site sync state for a delivered commit.
    async fn wait_for_sync(
        &self,
        key: &ObjectKey,
        commit: &str,
        config: &DeliveryConfig,
    ) -> StepResult<BTreeMap<String, SiteStatus>>;

    /// Restore the last known-good delivery. Returns the commit now live, if any.
    async fn rollback(&self, key: &ObjectKey, request: &RollbackRequest, config: &DeliveryConfig) -> StepResult<Option<String>>;
}

#[async_trait::async_trait]
pub trait Gates: Send + Sync {
    async fn run_gates(&self, key: &ObjectKey, config: &GatesConfig, delivery: &DeliveryStatus) -> StepResult<GateReport>;
}

/// The full set of collaborators one controller uses.
#[derive(Clone)]
pub struct Pipeline {
    pub compiler: Arc<dyn Compiler>,
    pub renderer: Arc<dyn Renderer>,
    pub delivery: Arc<dyn Delivery>,
    pub gates: Arc<dyn Gates>,
}

impl Pipeline {
    /// One implementation serving every stage.
    pub fn uniform<P>(p: Arc<P>) -> Self
    where
        P: Compiler + Renderer + Delivery + Gates + 'static,
    {
        Self { compiler: p.clone(), renderer: p.clone(), delivery: p.clone(), gates: p }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}
