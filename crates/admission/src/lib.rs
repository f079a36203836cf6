//! Admission validation for IntentDeployment.
//!
//! The hosting mechanism (webhook server, in-memory store hook, CLI) calls
//! [`Validator::validate`] with the operation and the old/new objects. The validator
//! never mutates what it is given; besides the verdict it only emits audit logs.

#![forbid(unsafe_code)]

use std::fmt;

use intent_core::{duration::DurationError, IntentDeployment, IntentDeploymentSpec, InvalidTargetSite, Phase};
use metrics::counter;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{info, warn};

/// Non-fatal findings returned alongside an accepted object.
pub type Warnings = SmallVec<[String; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("spec.intent cannot be empty")]
    EmptyIntent,
    #[error(transparent)]
    InvalidTargetSite(#[from] InvalidTargetSite),
    #[error("cannot modify intent after deployment has started")]
    IntentFrozen,
    #[error("{0} requires the {1} object")]
    MissingObject(Operation, &'static str),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Single entry point used by whatever serves admission requests.
    pub fn validate(
        &self,
        op: Operation,
        old: Option<&IntentDeployment>,
        new: Option<&IntentDeployment>,
    ) -> Result<Warnings, AdmissionError> {
        let res = match op {
            Operation::Create => {
                let new = new.ok_or(AdmissionError::MissingObject(op, "new"))?;
                self.validate_create(new)
            }
            Operation::Update => {
                let old = old.ok_or(AdmissionError::MissingObject(op, "old"))?;
                let new = new.ok_or(AdmissionError::MissingObject(op, "new"))?;
                self.validate_update(old, new)
            }
            Operation::Delete => {
                let obj = old.or(new).ok_or(AdmissionError::MissingObject(op, "old"))?;
                self.validate_delete(obj)
            }
        };
        if res.is_err() {
            counter!("intent_admission_rejections_total", 1u64, "operation" => op.to_string());
        }
        res
    }

    pub fn validate_create(&self, obj: &IntentDeployment) -> Result<Warnings, AdmissionError> {
        let name = obj.metadata.name.as_deref().unwrap_or("");
        info!(name = %name, "validate create");
        if obj.spec.intent.is_empty() {
            warn!(name = %name, "rejecting create: empty intent");
            return Err(AdmissionError::EmptyIntent);
        }
        if let Some(dc) = &obj.spec.delivery_config {
            if let Err(e) = dc.target_site() {
                warn!(name = %name, error = %e, "rejecting create: invalid target site");
                return Err(e.into());
            }
        }
        Ok(spec_warnings(&obj.spec))
    }

    /// Intent text is frozen once the old object has left the initial phase;
    /// every other spec change is accepted at any phase.
    pub fn validate_update(&self, old: &IntentDeployment, new: &IntentDeployment) -> Result<Warnings, AdmissionError> {
        let name = new.metadata.name.as_deref().unwrap_or("");
        let phase = old.phase();
        info!(name = %name, phase = ?phase, "validate update");
        if intent_frozen(phase) && new.spec.intent != old.spec.intent {
            warn!(name = %name, phase = ?phase, "rejecting update: intent is frozen");
            return Err(AdmissionError::IntentFrozen);
        }
        let mut warnings = spec_warnings(&new.spec);
        if new.spec.intent.is_empty() {
            warnings.push("spec.intent is empty".to_string());
        }
        if let Some(Err(e)) = new.spec.delivery_config.as_ref().map(|dc| dc.target_site()) {
            warnings.push(format!("{e}; delivery will fail"));
        }
        Ok(warnings)
    }

    /// Deletion is permitted at any phase.
    pub fn validate_delete(&self, obj: &IntentDeployment) -> Result<Warnings, AdmissionError> {
        info!(name = %obj.metadata.name.as_deref().unwrap_or(""), phase = ?obj.phase(), "validate delete");
        Ok(Warnings::new())
    }
}

fn intent_frozen(phase: Option<Phase>) -> bool {
    matches!(phase, Some(p) if p != Phase::INITIAL)
}

fn spec_warnings(spec: &IntentDeploymentSpec) -> Warnings {
    let mut out = Warnings::new();
    let mut push_duration = |field: &str, err: Option<DurationError>| {
        if let Some(e) = err {
            out.push(format!("{field}: {e}; using default"));
        }
    };
    if let Some(cc) = &spec.compile_config {
        push_duration("spec.compileConfig.renderTimeout", cc.render_timeout().1);
    }
    if let Some(dc) = &spec.delivery_config {
        push_duration("spec.deliveryConfig.syncWaitTimeout", dc.sync_wait_timeout().1);
    }
    if let Some(g) = &spec.gates_config {
        if g.enabled && g.slo_thresholds.is_empty() && g.post_check_script.is_none() {
            out.push("spec.gatesConfig is enabled without sloThresholds or postCheckScript".to_string());
        }
    }
    if let Some(rb) = &spec.rollback_config {
        if rb.auto_rollback && rb.max_retries == 0 {
            out.push("spec.rollbackConfig.maxRetries is 0; one rollback attempt will still be made".to_string());
        }
    }
    out
}
