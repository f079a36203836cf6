//! Simulated collaborators for the embedded pipeline mode and for tests.
//!
//! Deterministic: compile wraps the intent in a ConfigMap, render annotates it with the
//! engine, delivery hands out sequential commits, sync reports every target site
//! deployed and gates check every configured threshold. Faults can be injected per
//! phase and every call is recorded.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use intent_core::{
    CompileConfig, DeliveryConfig, DeliveryStatus, GatesConfig, ObjectKey, Phase, SiteState, SiteStatus,
    ValidationResult,
};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::pipeline::{
    Compiler, Delivery, DeliveryReceipt, GateReport, Gates, Renderer, RollbackRequest, StepError, StepErrorKind,
    StepResult,
};

pub const RENDERED_BY_ANNOTATION: &str = "tna.tna.ai/rendered-by";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimCall {
    pub key: ObjectKey,
    /// Phase whose side effect made the call.
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy)]
struct Fault {
    kind: StepErrorKind,
    remaining: u32,
}

#[derive(Default)]
struct SimState {
    faults: FxHashMap<Phase, Fault>,
    fail_gates: bool,
    commits: u64,
    head: Option<String>,
    calls: Vec<SimCall>,
}

#[derive(Default)]
pub struct SimPipeline {
    state: Mutex<SimState>,
    latency: Duration,
}

impl SimPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the side effect of `phase` the next `times` calls.
    pub fn fail(self, phase: Phase, kind: StepErrorKind, times: u32) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.faults.insert(phase, Fault { kind, remaining: times });
        }
        self
    }

    /// Make every gate check report a failure.
    pub fn fail_gates(self, on: bool) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.fail_gates = on;
        }
        self
    }

    /// Seed the repository head, i.e. an earlier known-good delivery.
    pub fn with_head(self, commit: impl Into<String>) -> Self {
        if let Ok(mut s) = self.state.lock() {
            s.head = Some(commit.into());
        }
        self
    }

    /// Artificial delay added to every call.
    pub fn latency(mut self, d: Duration) -> Self {
        self.latency = d;
        self
    }

    pub fn calls(&self) -> Vec<SimCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, phase: Phase) -> usize {
        self.calls().iter().filter(|c| c.phase == phase).count()
    }

    pub fn head(&self) -> Option<String> {
        self.state.lock().ok().and_then(|s| s.head.clone())
    }

    fn lock(&self) -> StepResult<MutexGuard<'_, SimState>> {
        self.state.lock().map_err(|_| StepError::permanent("simulator state poisoned"))
    }

    /// Record the call, wait out the latency and consume an injected fault.
    async fn enter(&self, key: &ObjectKey, phase: Phase) -> StepResult<()> {
        {
            let mut s = self.lock()?;
            s.calls.push(SimCall { key: key.clone(), phase });
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut s = self.lock()?;
        if let Some(f) = s.faults.get_mut(&phase) {
            if f.remaining > 0 {
                f.remaining -= 1;
                debug!(key = %key, phase = %phase, kind = %f.kind, "sim: injected fault");
                return Err(StepError { kind: f.kind, message: format!("simulated {} failure in {phase}", f.kind) });
            }
        }
        Ok(())
    }
}

fn target_sites(config: &DeliveryConfig) -> StepResult<&'static [&'static str]> {
    config.target_site().map(|t| t.sites()).map_err(|e| StepError::permanent(e.to_string()))
}

#[async_trait::async_trait]
impl Compiler for SimPipeline {
    async fn compile(&self, key: &ObjectKey, intent: &str, _config: &CompileConfig) -> StepResult<String> {
        self.enter(key, Phase::Compiling).await?;
        let bundle = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": format!("{}-intent", key.name), "namespace": key.namespace },
            "data": { "intent": intent },
        });
        serde_yaml::to_string(&bundle).map_err(|e| StepError::permanent(format!("encode manifests: {e}")))
    }
}

#[async_trait::async_trait]
impl Renderer for SimPipeline {
    async fn render(&self, key: &ObjectKey, manifests: &str, config: &CompileConfig) -> StepResult<String> {
        self.enter(key, Phase::Rendering).await?;
        let mut doc: serde_yaml::Value =
            serde_yaml::from_str(manifests).map_err(|e| StepError::permanent(format!("parse manifests: {e}")))?;
        let meta = doc
            .get_mut("metadata")
            .and_then(|m| m.as_mapping_mut())
            .ok_or_else(|| StepError::permanent("manifest has no metadata"))?;
        let annotations = meta
            .entry("annotations".into())
            .or_insert_with(|| serde_yaml::Value::Mapping(Default::default()));
        if let Some(a) = annotations.as_mapping_mut() {
            a.insert(RENDERED_BY_ANNOTATION.into(), config.engine.as_str().into());
        }
        serde_yaml::to_string(&doc).map_err(|e| StepError::permanent(format!("encode manifests: {e}")))
    }
}

#[async_trait::async_trait]
impl Delivery for SimPipeline {
    async fn deliver(&self, key: &ObjectKey, _manifests: &str, config: &DeliveryConfig) -> StepResult<DeliveryReceipt> {
        self.enter(key, Phase::Delivering).await?;
        target_sites(config)?;
        let mut s = self.lock()?;
        s.commits += 1;
        let commit = format!("sim-{:07}", s.commits);
        let previous_commit = s.head.replace(commit.clone());
        Ok(DeliveryReceipt { commit, previous_commit })
    }

    async fn wait_for_sync(
        &self,
        key: &ObjectKey,
        commit: &str,
        config: &DeliveryConfig,
    ) -> StepResult<BTreeMap<String, SiteStatus>> {
        self.enter(key, Phase::Reconciling).await?;
        let now = Utc::now();
        Ok(target_sites(config)?
            .iter()
            .map(|site| {
                let st = SiteStatus {
                    state: SiteState::Deployed,
                    message: format!("synced {commit}"),
                    last_sync_time: Some(now),
                };
                (site.to_string(), st)
            })
            .collect())
    }

    async fn rollback(&self, key: &ObjectKey, request: &RollbackRequest, _config: &DeliveryConfig) -> StepResult<Option<String>> {
        self.enter(key, Phase::RollingBack).await?;
        let mut s = self.lock()?;
        if let Some(c) = &request.restore_commit {
            s.head = Some(c.clone());
        }
        Ok(request.restore_commit.clone())
    }
}

#[async_trait::async_trait]
impl Gates for SimPipeline {
    async fn run_gates(&self, key: &ObjectKey, config: &GatesConfig, _delivery: &DeliveryStatus) -> StepResult<GateReport> {
        self.enter(key, Phase::Verifying).await?;
        let failing = self.lock()?.fail_gates;
        let mut results: Vec<ValidationResult> = config
            .slo_thresholds
            .iter()
            .map(|(metric, threshold)| ValidationResult {
                name: metric.clone(),
                passed: !failing,
                message: if failing {
                    format!("{metric} breached threshold {threshold}")
                } else {
                    format!("{metric} within threshold {threshold}")
                },
                metrics: BTreeMap::from([(metric.clone(), threshold.clone())]),
            })
            .collect();
        if let Some(script) = &config.post_check_script {
            results.push(ValidationResult {
                name: "post-check".into(),
                passed: !failing,
                message: format!("{script} exited {}", if failing { 1 } else { 0 }),
                metrics: BTreeMap::new(),
            });
        }
        if results.is_empty() {
            results.push(ValidationResult {
                name: "default".into(),
                passed: !failing,
                message: "no SLO thresholds configured".into(),
                metrics: BTreeMap::new(),
            });
        }
        let overall_pass = results.iter().all(|r| r.passed);
        Ok(GateReport { results, overall_pass })
    }
}
