//! The IntentDeployment custom resource.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::conditions::{ConditionStatus, Conditions};
use crate::duration::{self, DurationError};
use crate::phase::Phase;
use crate::{InvalidTargetSite, TargetSite};

pub const DEFAULT_RENDER_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Desired deployment: opaque intent text plus optional stage configuration.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(group = "tna.tna.ai", version = "v1alpha1", kind = "IntentDeployment", namespaced)]
#[kube(status = "IntentDeploymentStatus", shortname = "intd", derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct IntentDeploymentSpec {
    /// Natural-language or structured intent, interpreted by the compiler.
    pub intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile_config: Option<CompileConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_config: Option<DeliveryConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gates_config: Option<GatesConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_config: Option<RollbackConfig>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    #[default]
    Kpt,
    Kustomize,
    Helm,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Kpt => "kpt",
            Engine::Kustomize => "kustomize",
            Engine::Helm => "helm",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CompileConfig {
    #[serde(default)]
    pub engine: Engine,
    /// Upper bound for compile and render steps (default 5m).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_timeout: Option<String>,
}

impl CompileConfig {
    pub fn render_timeout(&self) -> (Duration, Option<DurationError>) {
        duration::resolve(self.render_timeout.as_deref(), DEFAULT_RENDER_TIMEOUT)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryConfig {
    /// edge1 | edge2 | both (default both)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_site: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_repo: Option<String>,
    /// How long to wait for sync acknowledgement (default 10m).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_wait_timeout: Option<String>,
}

impl DeliveryConfig {
    pub fn target_site(&self) -> Result<TargetSite, InvalidTargetSite> {
        TargetSite::parse_opt(self.target_site.as_deref())
    }

    pub fn sync_wait_timeout(&self) -> (Duration, Option<DurationError>) {
        duration::resolve(self.sync_wait_timeout.as_deref(), DEFAULT_SYNC_WAIT_TIMEOUT)
    }
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GatesConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum acceptable metrics keyed by metric name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub slo_thresholds: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_check_script: Option<String>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self { enabled: true, slo_thresholds: BTreeMap::new(), post_check_script: None }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackConfig {
    #[serde(default = "default_true")]
    pub auto_rollback: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_true")]
    pub retain_failed_artifacts: bool,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self { auto_rollback: true, max_retries: DEFAULT_MAX_RETRIES, retain_failed_artifacts: true }
    }
}

impl RollbackConfig {
    /// Rollback attempts allowed; `maxRetries: 0` still permits one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SyncState {
    #[default]
    Pending,
    Syncing,
    Synced,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum SiteState {
    #[default]
    Pending,
    Deploying,
    Deployed,
    Failed,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SiteStatus {
    #[serde(default)]
    pub state: SiteState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// GitOps delivery record, written by Delivering and Reconciling.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_commit: Option<String>,
    /// Last known-good commit before this delivery; the rollback target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_commit: Option<String>,
    #[serde(default)]
    pub sync_state: SyncState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sites: BTreeMap<String, SiteStatus>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub name: String,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RollbackStatus {
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_commit: Option<String>,
    /// Failed rollback attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Observed state. Written only by the lifecycle controller.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IntentDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "crate::phase::deserialize_opt")]
    #[schemars(with = "Option<Phase>")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiled_manifests: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivery_status: Option<DeliveryStatus>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation_results: Vec<ValidationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_status: Option<RollbackStatus>,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_generation: i64,
    /// Transient failures consumed in the current phase.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub phase_attempts: u32,
}

impl IntentDeploymentStatus {
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        self.conditions.set(type_, status, reason, message);
    }

    pub fn rollback_attempts(&self) -> u32 {
        self.rollback_status.as_ref().map_or(0, |r| r.attempts)
    }
}

impl IntentDeploymentSpec {
    pub fn target_site(&self) -> Result<TargetSite, InvalidTargetSite> {
        match &self.delivery_config {
            Some(dc) => dc.target_site(),
            None => Ok(TargetSite::default()),
        }
    }

    /// Gates run only when configured and enabled.
    pub fn gates_enabled(&self) -> bool {
        self.gates_config.as_ref().map_or(false, |g| g.enabled)
    }
}

impl IntentDeployment {
    pub fn phase(&self) -> Option<Phase> {
        self.status.as_ref().and_then(|s| s.phase)
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn observed_generation(&self) -> i64 {
        self.status.as_ref().map_or(0, |s| s.observed_generation)
    }

    /// Condition ledger upsert on the resource's status.
    pub fn set_condition(&mut self, type_: &str, status: ConditionStatus, reason: &str, message: &str) {
        self.status
            .get_or_insert_with(IntentDeploymentStatus::default)
            .set_condition(type_, status, reason, message);
    }
}
