//! Script-backed collaborators for the standalone pipeline mode.
//!
//! Each stage is an executable under the pipeline root (`compile`, `render`, `deliver`,
//! `wait-sync`, `gates`, `rollback`). The payload goes in on stdin, parameters in the
//! environment. Exit 0 is success, [`EX_TEMPFAIL`] a transient failure and anything else
//! a permanent one. Structured results come back as JSON on stdout.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use intent_core::{CompileConfig, DeliveryConfig, DeliveryStatus, GatesConfig, ObjectKey, SiteStatus};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::pipeline::{
    Compiler, Delivery, DeliveryReceipt, GateReport, Gates, Renderer, RollbackRequest, StepError, StepResult,
};

/// sysexits.h `EX_TEMPFAIL`.
pub const EX_TEMPFAIL: i32 = 75;

#[derive(Debug, Clone)]
pub struct ScriptPipeline {
    root: PathBuf,
    artifacts: PathBuf,
}

#[derive(Deserialize)]
struct RollbackOutput {
    #[serde(default)]
    commit: Option<String>,
}

impl ScriptPipeline {
    pub fn new(root: impl AsRef<Path>, artifacts: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf(), artifacts: artifacts.as_ref().to_path_buf() }
    }

    fn artifacts_dir(&self, key: &ObjectKey) -> PathBuf {
        self.artifacts.join(&key.namespace).join(&key.name)
    }

    async fn run(&self, stage: &str, key: &ObjectKey, input: &[u8], env: &[(&str, String)]) -> StepResult<Vec<u8>> {
        let path = self.root.join(stage);
        let mut cmd = Command::new(&path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .env("INTENT_NAME", &key.name)
            .env("INTENT_NAMESPACE", &key.namespace)
            .env("ARTIFACTS_DIR", self.artifacts_dir(key));
        for (k, v) in env {
            cmd.env(k, v);
        }
        debug!(key = %key, stage, path = %path.display(), "script: spawn");
        let mut child = cmd
            .spawn()
            .map_err(|e| StepError::permanent(format!("{stage}: cannot run {}: {e}", path.display())))?;
        // Feed stdin while draining stdout so filter stages cannot fill the pipe and stall.
        let stdin = child.stdin.take();
        let feed = async move {
            let Some(mut stdin) = stdin else { return Ok(()) };
            match stdin.write_all(input).await {
                // a stage may exit without reading its input
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                res => res,
            }
            // dropping stdin closes the pipe
        };
        let (fed, out) = tokio::join!(feed, child.wait_with_output());
        let out = out.map_err(|e| StepError::transient(format!("{stage}: wait: {e}")))?;
        fed.map_err(|e| StepError::transient(format!("{stage}: write stdin: {e}")))?;
        let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
        match out.status.code() {
            Some(0) => Ok(out.stdout),
            Some(EX_TEMPFAIL) => Err(StepError::transient(format!("{stage}: {stderr}"))),
            Some(code) => Err(StepError::permanent(format!("{stage} exited {code}: {stderr}"))),
            None => Err(StepError::transient(format!("{stage} killed by signal"))),
        }
    }

    async fn run_text(&self, stage: &str, key: &ObjectKey, input: &[u8], env: &[(&str, String)]) -> StepResult<String> {
        let out = self.run(stage, key, input, env).await?;
        String::from_utf8(out).map_err(|e| StepError::permanent(format!("{stage}: non-utf8 output: {e}")))
    }

    async fn run_json<T: DeserializeOwned>(
        &self,
        stage: &str,
        key: &ObjectKey,
        input: &[u8],
        env: &[(&str, String)],
    ) -> StepResult<T> {
        let out = self.run(stage, key, input, env).await?;
        serde_json::from_slice(&out).map_err(|e| StepError::permanent(format!("{stage}: bad output: {e}")))
    }
}

fn delivery_env(config: &DeliveryConfig) -> Vec<(&'static str, String)> {
    let mut env = vec![("TARGET_SITE", config.target_site.clone().unwrap_or_else(|| "both".into()))];
    if let Some(repo) = &config.git_ops_repo {
        env.push(("GITOPS_REPO", repo.clone()));
    }
    env
}

fn encode<T: serde::Serialize>(stage: &str, v: &T) -> StepResult<Vec<u8>> {
    serde_json::to_vec(v).map_err(|e| StepError::permanent(format!("{stage}: encode input: {e}")))
}

#[async_trait::async_trait]
impl Compiler for ScriptPipeline {
    async fn compile(&self, key: &ObjectKey, intent: &str, config: &CompileConfig) -> StepResult<String> {
        self.run_text("compile", key, intent.as_bytes(), &[("INTENT_ENGINE", config.engine.as_str().into())]).await
    }
}

#[async_trait::async_trait]
impl Renderer for ScriptPipeline {
    async fn render(&self, key: &ObjectKey, manifests: &str, config: &CompileConfig) -> StepResult<String> {
        self.run_text("render", key, manifests.as_bytes(), &[("INTENT_ENGINE", config.engine.as_str().into())]).await
    }
}

#[async_trait::async_trait]
impl Delivery for ScriptPipeline {
    async fn deliver(&self, key: &ObjectKey, manifests: &str, config: &DeliveryConfig) -> StepResult<DeliveryReceipt> {
        self.run_json("deliver", key, manifests.as_bytes(), &delivery_env(config)).await
    }

    async fn wait_for_sync(
        &self,
        key: &ObjectKey,
        commit: &str,
        config: &DeliveryConfig,
    ) -> StepResult<BTreeMap<String, SiteStatus>> {
        let mut env = delivery_env(config);
        env.push(("GIT_COMMIT", commit.to_string()));
        if let Some(t) = &config.sync_wait_timeout {
            env.push(("SYNC_WAIT_TIMEOUT", t.clone()));
        }
        self.run_json("wait-sync", key, b"", &env).await
    }

    async fn rollback(&self, key: &ObjectKey, request: &RollbackRequest, config: &DeliveryConfig) -> StepResult<Option<String>> {
        let input = encode("rollback", request)?;
        let out: RollbackOutput = self.run_json("rollback", key, &input, &delivery_env(config)).await?;
        Ok(out.commit)
    }
}

#[async_trait::async_trait]
impl Gates for ScriptPipeline {
    async fn run_gates(&self, key: &ObjectKey, config: &GatesConfig, delivery: &DeliveryStatus) -> StepResult<GateReport> {
        let input = encode("gates", &serde_json::json!({ "config": config, "deliveryStatus": delivery }))?;
        self.run_json("gates", key, &input, &[]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn stage_dir(scripts: &[(&str, &str)]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("intent-script-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        for (name, body) in scripts {
            let p = dir.join(name);
            std::fs::write(&p, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&p, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    }

    fn key() -> ObjectKey {
        ObjectKey::new("default", "demo")
    }

    #[tokio::test]
    async fn compile_passes_intent_on_stdin() {
        let dir = stage_dir(&[("compile", r#"printf 'engine=%s name=%s\n' "$INTENT_ENGINE" "$INTENT_NAME"; cat"#)]);
        let p = ScriptPipeline::new(&dir, &dir);
        let out = p.compile(&key(), "hello", &CompileConfig::default()).await.unwrap();
        assert_eq!(out, "engine=kpt name=demo\nhello");
    }

    #[tokio::test]
    async fn exit_codes_map_to_error_kinds() {
        let dir = stage_dir(&[("compile", "echo busy >&2; exit 75"), ("render", "echo broken >&2; exit 2")]);
        let p = ScriptPipeline::new(&dir, &dir);
        let err = p.compile(&key(), "x", &CompileConfig::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.message.contains("busy"));
        let err = p.render(&key(), "x", &CompileConfig::default()).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("exited 2"));
    }

    #[tokio::test]
    async fn deliver_reads_json_receipt() {
        let dir = stage_dir(&[("deliver", r#"echo '{"commit":"abc","previousCommit":"old"}'"#)]);
        let p = ScriptPipeline::new(&dir, &dir);
        let r = p.deliver(&key(), "m", &DeliveryConfig::default()).await.unwrap();
        assert_eq!(r, DeliveryReceipt { commit: "abc".into(), previous_commit: Some("old".into()) });
    }

    #[tokio::test]
    async fn large_payloads_stream_through_filter_stages() {
        let dir = stage_dir(&[("render", "cat")]);
        let p = ScriptPipeline::new(&dir, &dir);
        let payload = "x".repeat(1 << 20);
        let out = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            p.render(&key(), &payload, &CompileConfig::default()),
        )
        .await
        .expect("render stalled")
        .unwrap();
        assert_eq!(out.len(), payload.len());
    }

    #[tokio::test]
    async fn missing_stage_is_permanent() {
        let dir = stage_dir(&[]);
        let p = ScriptPipeline::new(&dir, &dir);
        let err = p.compile(&key(), "x", &CompileConfig::default()).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
