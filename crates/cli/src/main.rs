use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use intent_admission::{Operation, Validator};
use intent_controller::{
    ControllerConfig, LifecycleController, Pipeline, PipelineMode, PipelineSettings, Runner, SimPipeline,
    StepErrorKind,
};
use intent_core::{IntentDeployment, IntentDeploymentStatus, ObjectKey, Phase};
use intent_kubehub::KubeStore;
use intent_store::{ChangeKind, MemoryStore, Store};
use serde::Serialize;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "intentctl", version, about = "IntentDeployment lifecycle tooling")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the IntentDeployment CustomResourceDefinition
    Crd,
    /// Run admission checks against a manifest
    Validate {
        /// Manifest to admit
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Stored object; validates an update from it to --file
        #[arg(long = "old")]
        old: Option<PathBuf>,
        /// Validate deletion of --file
        #[arg(long = "delete", action = ArgAction::SetTrue, conflicts_with = "old")]
        delete: bool,
    },
    /// Drive a manifest through the lifecycle in memory with simulated steps
    Simulate {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Phase whose step should fail
        #[arg(long = "fail-at")]
        fail_at: Option<Phase>,
        /// Fail --fail-at transiently this many times instead of permanently
        #[arg(long = "transient", default_value_t = 0)]
        transient: u32,
        /// Make every gate check fail
        #[arg(long = "fail-gates", action = ArgAction::SetTrue)]
        fail_gates: bool,
        /// Stop after this many reconciles
        #[arg(long = "max-steps", default_value_t = 64)]
        max_steps: usize,
    },
    /// Run the lifecycle controller against the cluster
    Run {
        /// embedded | standalone (default: PIPELINE_MODE or embedded)
        #[arg(long = "pipeline-mode")]
        pipeline_mode: Option<PipelineMode>,
        /// Script directory for standalone mode
        #[arg(long = "pipeline-root")]
        pipeline_root: Option<PathBuf>,
        #[arg(long = "artifacts-root")]
        artifacts_root: Option<PathBuf>,
        /// Objects reconciled in parallel
        #[arg(long = "concurrency")]
        concurrency: Option<usize>,
    },
    /// Print phase changes as they happen in the cluster
    Watch,
}

fn init_tracing() {
    let env = std::env::var("INTENT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("INTENT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid INTENT_METRICS_ADDR; expected host:port");
        }
    }
}

fn load(path: &Path) -> Result<IntentDeployment> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn phase_label(phase: Option<Phase>) -> &'static str {
    phase.map(Phase::as_str).unwrap_or("-")
}

#[derive(Serialize)]
struct Verdict<'a> {
    operation: Operation,
    allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
    warnings: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SimStep {
    step: usize,
    phase: Option<Phase>,
    message: String,
    /// Seconds until the next reconcile; absent once the object goes idle.
    requeue_after_secs: Option<f64>,
}

#[derive(Serialize)]
struct SimReport<'a> {
    name: &'a str,
    steps: &'a [SimStep],
    status: Option<&'a IntentDeploymentStatus>,
}

#[derive(Serialize)]
struct WatchLine<'a> {
    key: &'a ObjectKey,
    event: &'static str,
    phase: Option<Phase>,
    message: &'a str,
}

fn validate(out: Output, file: &Path, old: Option<&Path>, delete: bool) -> Result<()> {
    let new = load(file)?;
    let old = old.map(load).transpose()?;
    let (op, res) = match (delete, old) {
        (true, _) => (Operation::Delete, Validator::new().validate(Operation::Delete, Some(&new), None)),
        (false, Some(old)) => (Operation::Update, Validator::new().validate(Operation::Update, Some(&old), Some(&new))),
        (false, None) => (Operation::Create, Validator::new().validate(Operation::Create, None, Some(&new))),
    };
    let (warnings, reason) = match res {
        Ok(w) => (w.into_vec(), None),
        Err(e) => (Vec::new(), Some(e.to_string())),
    };
    match out {
        Output::Human => {
            for w in &warnings {
                println!("warning: {w}");
            }
            match &reason {
                None => println!("{op}: allowed"),
                Some(r) => println!("{op}: denied: {r}"),
            }
        }
        Output::Json => {
            let v = Verdict { operation: op, allowed: reason.is_none(), reason: reason.clone(), warnings: &warnings };
            println!("{}", serde_json::to_string_pretty(&v)?);
        }
    }
    if reason.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

async fn simulate(
    out: Output,
    file: &Path,
    fail_at: Option<Phase>,
    transient: u32,
    fail_gates: bool,
    max_steps: usize,
) -> Result<()> {
    let mut obj = load(file)?;
    if obj.metadata.namespace.is_none() {
        obj.metadata.namespace = Some("default".into());
    }
    let mut sim = SimPipeline::new().fail_gates(fail_gates);
    if let Some(phase) = fail_at {
        sim = match transient {
            0 => sim.fail(phase, StepErrorKind::Permanent, 1),
            n => sim.fail(phase, StepErrorKind::Transient, n),
        };
    }
    let store = Arc::new(MemoryStore::new());
    let created = store.create(obj).await?;
    let key = ObjectKey::of(&created);
    let ctl = LifecycleController::new(store.clone(), Pipeline::uniform(Arc::new(sim)), ControllerConfig::default());

    let mut steps = Vec::new();
    loop {
        if steps.len() >= max_steps {
            warn!(%key, max_steps, "simulation step limit reached");
            break;
        }
        let requeue = ctl.reconcile(&key).await?;
        let current = store.get(&key).await?;
        let status = current.status.as_ref();
        let step = SimStep {
            step: steps.len() + 1,
            phase: current.phase(),
            message: status.map(|s| s.message.clone()).unwrap_or_default(),
            requeue_after_secs: requeue.delay().map(|d| d.as_secs_f64()),
        };
        if out == Output::Human {
            let next = step.requeue_after_secs.map(|s| format!("+{s}s")).unwrap_or_else(|| "idle".into());
            println!("{:>3}  {:<12} {:<6} {}", step.step, phase_label(step.phase), next, step.message);
        }
        steps.push(step);
        if requeue.delay().is_none() {
            break;
        }
    }

    let last = store.get(&key).await?;
    match out {
        Output::Human => {
            if let Some(status) = &last.status {
                println!();
                println!("CONDITION    STATUS   REASON");
                for c in status.conditions.iter() {
                    println!("{:<12} {:<8} {}", c.type_, format!("{:?}", c.status), c.reason);
                }
            }
        }
        Output::Json => {
            let report = SimReport { name: &key.name, steps: &steps, status: last.status.as_ref() };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(())
}

async fn run(
    namespace: Option<String>,
    pipeline_mode: Option<PipelineMode>,
    pipeline_root: Option<PathBuf>,
    artifacts_root: Option<PathBuf>,
    concurrency: Option<usize>,
) -> Result<()> {
    let mut settings = PipelineSettings::from_env();
    if let Some(mode) = pipeline_mode {
        settings.mode = mode;
    }
    if let Some(root) = pipeline_root {
        settings.shell_root = root;
    }
    if let Some(root) = artifacts_root {
        settings.artifacts_root = root;
    }
    let mut config = ControllerConfig::from_env();
    if let Some(n) = concurrency {
        if n == 0 {
            bail!("--concurrency must be at least 1");
        }
        config.concurrency = n;
    }
    info!(mode = %settings.mode, ns = ?namespace, concurrency = config.concurrency, "starting lifecycle controller");

    let store = KubeStore::new(intent_kubehub::client().await?, namespace);
    let runner = Runner::new(Arc::new(LifecycleController::new(store, settings.build(), config)));
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; draining in-flight reconciles");
            }
            shutdown.cancel();
        }
    });
    runner.run(shutdown).await?;
    warn!("lifecycle controller stopped");
    Ok(())
}

async fn watch(out: Output, namespace: Option<String>) -> Result<()> {
    let store = KubeStore::new(intent_kubehub::client().await?, namespace);
    let mut changes = store.watch().await?;
    let mut last: BTreeMap<ObjectKey, (Option<Phase>, String)> = BTreeMap::new();
    loop {
        tokio::select! {
            change = changes.recv() => {
                let Some(change) = change else {
                    warn!("watch stream closed");
                    break;
                };
                let (event, phase, message) = match change.kind {
                    ChangeKind::Deleted => {
                        last.remove(&change.key);
                        ("deleted", None, String::new())
                    }
                    ChangeKind::Applied => {
                        let obj = match store.get(&change.key).await {
                            Ok(obj) => obj,
                            Err(e) if e.is_not_found() => continue,
                            Err(e) => {
                                warn!(key = %change.key, error = %e, "fetch failed");
                                continue;
                            }
                        };
                        let seen = (obj.phase(), obj.status.map(|s| s.message).unwrap_or_default());
                        if last.get(&change.key) == Some(&seen) {
                            continue;
                        }
                        last.insert(change.key.clone(), seen.clone());
                        ("phase", seen.0, seen.1)
                    }
                };
                match out {
                    Output::Human => match event {
                        "deleted" => println!("- {}", change.key),
                        _ => println!("{:<32} {:<12} {}", change.key.to_string(), phase_label(phase), message),
                    },
                    Output::Json => {
                        let line = WatchLine { key: &change.key, event, phase, message: &message };
                        println!("{}", serde_json::to_string(&line)?);
                    }
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down watch loop");
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Crd => print!("{}", intent_kubehub::crd_yaml()?),
        Commands::Validate { file, old, delete } => validate(cli.output, &file, old.as_deref(), delete)?,
        Commands::Simulate { file, fail_at, transient, fail_gates, max_steps } => {
            simulate(cli.output, &file, fail_at, transient, fail_gates, max_steps).await?
        }
        Commands::Run { pipeline_mode, pipeline_root, artifacts_root, concurrency } => {
            run(cli.namespace, pipeline_mode, pipeline_root, artifacts_root, concurrency).await?
        }
        Commands::Watch => watch(cli.output, cli.namespace).await?,
    }
    Ok(())
}
