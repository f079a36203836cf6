//! Controller and pipeline configuration, overridable from the environment.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::pipeline::Pipeline;
use crate::script::ScriptPipeline;
use crate::sim::SimPipeline;

pub const DEFAULT_SHELL_PIPELINE_ROOT: &str = "/opt/nephio-intent-to-o2-demo";
pub const DEFAULT_ARTIFACTS_ROOT: &str = "/var/run/operator-artifacts";

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    /// Attempts per phase before a transient failure escalates to `Failed`.
    pub max_step_attempts: u32,
    pub step_retry_delay: Duration,
    /// Bound for gate runs; the CRD carries no timeout for them.
    pub gate_timeout: Duration,
    /// Status-write conflicts tolerated within one reconcile.
    pub conflict_retries: u32,
    pub error_backoff: Duration,
    pub concurrency: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_step_attempts: 3,
            step_retry_delay: Duration::from_secs(5),
            gate_timeout: Duration::from_secs(300),
            conflict_retries: 3,
            error_backoff: Duration::from_secs(10),
            concurrency: 4,
        }
    }
}

impl ControllerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_step_attempts: env_or("INTENT_MAX_STEP_ATTEMPTS", d.max_step_attempts).max(1),
            step_retry_delay: Duration::from_secs(env_or("INTENT_STEP_RETRY_SECS", d.step_retry_delay.as_secs())),
            gate_timeout: Duration::from_secs(env_or("INTENT_GATE_TIMEOUT_SECS", d.gate_timeout.as_secs())),
            conflict_retries: env_or("INTENT_CONFLICT_RETRIES", d.conflict_retries),
            error_backoff: Duration::from_secs(env_or("INTENT_ERROR_BACKOFF_SECS", d.error_backoff.as_secs())),
            concurrency: env_or("INTENT_CONCURRENCY", d.concurrency).max(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PipelineMode {
    /// In-process simulated collaborators.
    #[default]
    Embedded,
    /// External stage scripts under the pipeline root.
    Standalone,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline mode {0:?} (expected embedded or standalone)")]
pub struct UnknownPipelineMode(pub String);

impl FromStr for PipelineMode {
    type Err = UnknownPipelineMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "embedded" => Ok(PipelineMode::Embedded),
            "standalone" => Ok(PipelineMode::Standalone),
            other => Err(UnknownPipelineMode(other.to_string())),
        }
    }
}

impl fmt::Display for PipelineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PipelineMode::Embedded => "embedded",
            PipelineMode::Standalone => "standalone",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineSettings {
    pub mode: PipelineMode,
    pub shell_root: PathBuf,
    pub artifacts_root: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            mode: PipelineMode::default(),
            shell_root: PathBuf::from(DEFAULT_SHELL_PIPELINE_ROOT),
            artifacts_root: PathBuf::from(DEFAULT_ARTIFACTS_ROOT),
        }
    }
}

impl PipelineSettings {
    /// `PIPELINE_MODE`, `SHELL_PIPELINE_ROOT`, `ARTIFACTS_ROOT`. An unknown mode
    /// falls back to embedded.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            mode: env_or("PIPELINE_MODE", d.mode),
            shell_root: std::env::var_os("SHELL_PIPELINE_ROOT").map(PathBuf::from).unwrap_or(d.shell_root),
            artifacts_root: std::env::var_os("ARTIFACTS_ROOT").map(PathBuf::from).unwrap_or(d.artifacts_root),
        }
    }

    pub fn build(&self) -> Pipeline {
        match self.mode {
            PipelineMode::Embedded => Pipeline::uniform(Arc::new(SimPipeline::new())),
            PipelineMode::Standalone => {
                Pipeline::uniform(Arc::new(ScriptPipeline::new(&self.shell_root, &self.artifacts_root)))
            }
        }
    }
}
