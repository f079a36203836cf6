#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use intent_controller::{ControllerConfig, LifecycleController, Pipeline, ReconcileError, SimPipeline, StepErrorKind};
use intent_core::conditions::{self, ConditionStatus};
use intent_core::lifecycle::{SHORT_DELAY, STEP_DELAY};
use intent_core::{
    CompileConfig, DeliveryConfig, GatesConfig, IntentDeployment, IntentDeploymentSpec, IntentDeploymentStatus,
    ObjectKey, Phase, Requeue, RollbackConfig, SyncState,
};
use intent_store::faults::ConflictingStore;
use intent_store::{ChangeRx, MemoryStore, Store, StoreError, StoreResult};

fn spec(intent: &str) -> IntentDeploymentSpec {
    IntentDeploymentSpec { intent: intent.into(), ..Default::default() }
}

fn gated(mut s: IntentDeploymentSpec) -> IntentDeploymentSpec {
    s.gates_config = Some(GatesConfig {
        slo_thresholds: BTreeMap::from([("latency_p99".into(), "100ms".into())]),
        ..Default::default()
    });
    s
}

fn with_rollback(mut s: IntentDeploymentSpec, rb: RollbackConfig) -> IntentDeploymentSpec {
    s.rollback_config = Some(rb);
    s
}

fn obj(spec: IntentDeploymentSpec, phase: Option<Phase>) -> IntentDeployment {
    let mut o = IntentDeployment::new("test-intent", spec);
    o.metadata.namespace = Some("default".into());
    if phase.is_some() {
        o.status = Some(IntentDeploymentStatus { phase, ..Default::default() });
    }
    o
}

fn key() -> ObjectKey {
    ObjectKey::new("default", "test-intent")
}

fn controller<S: Store>(store: S, sim: Arc<SimPipeline>) -> LifecycleController<S> {
    LifecycleController::new(store, Pipeline::uniform(sim), ControllerConfig::default())
}

async fn status<S: Store>(ctl: &LifecycleController<S>) -> IntentDeploymentStatus {
    ctl.store().get(&key()).await.unwrap().status.unwrap_or_default()
}

fn assert_unique_conditions(st: &IntentDeploymentStatus) {
    let types: BTreeSet<_> = st.conditions.iter().map(|c| c.type_.as_str()).collect();
    assert_eq!(types.len(), st.conditions.len(), "duplicate condition types: {:?}", st.conditions);
}

/// Reconcile until the controller goes idle, returning the phase after each step.
async fn drive<S: Store>(ctl: &LifecycleController<S>) -> Vec<Phase> {
    let mut trail = Vec::new();
    let mut last_generation = 0;
    for _ in 0..32 {
        let requeue = ctl.reconcile(&key()).await.unwrap();
        let st = status(ctl).await;
        assert_unique_conditions(&st);
        assert!(st.observed_generation >= last_generation);
        last_generation = st.observed_generation;
        if let Some(p) = st.phase {
            if trail.last() != Some(&p) || requeue != Requeue::Never {
                trail.push(p);
            }
        }
        if requeue == Requeue::Never {
            return trail;
        }
    }
    panic!("lifecycle did not settle: {trail:?}");
}

#[tokio::test]
async fn first_reconciles_initialize_then_start_compiling() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec(r#"{"service":"x"}"#), None)).await.unwrap();
    let ctl = controller(store, Arc::new(SimPipeline::new()));

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::IMMEDIATE);
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::Pending));
    assert_eq!(st.message, "Intent deployment initialized");
    assert_eq!(st.conditions.get(conditions::READY).unwrap().status, ConditionStatus::False);

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(SHORT_DELAY));
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::Compiling));
    assert!(st.conditions.is_true(conditions::COMPILING));
    assert_eq!(st.observed_generation, 1);
}

#[tokio::test]
async fn failed_with_auto_rollback_starts_rolling_back() {
    let store = Arc::new(MemoryStore::new());
    let rb = RollbackConfig { auto_rollback: true, max_retries: 3, ..Default::default() };
    store.create(obj(with_rollback(spec("x"), rb), Some(Phase::Failed))).await.unwrap();
    let ctl = controller(store, Arc::new(SimPipeline::new()));

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(Duration::from_secs(5)));
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::RollingBack));
    assert!(st.rollback_status.as_ref().unwrap().active);
}

#[tokio::test]
async fn failed_without_auto_rollback_stays_put() {
    let store = Arc::new(MemoryStore::new());
    let rb = RollbackConfig { auto_rollback: false, ..Default::default() };
    let created = store.create(obj(with_rollback(spec("x"), rb), Some(Phase::Failed))).await.unwrap();
    let sim = Arc::new(SimPipeline::new());
    let ctl = controller(store, sim.clone());

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::Never);
    let now = ctl.store().get(&key()).await.unwrap();
    assert_eq!(now.phase(), Some(Phase::Failed));
    assert_eq!(now.metadata.resource_version, created.metadata.resource_version, "no status write expected");
    assert!(sim.calls().is_empty());
}

#[tokio::test]
async fn happy_path_reaches_succeeded() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(gated(spec(r#"{"service":"x"}"#)), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new());
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(
        trail,
        vec![
            Phase::Pending,
            Phase::Compiling,
            Phase::Rendering,
            Phase::Delivering,
            Phase::Reconciling,
            Phase::Verifying,
            Phase::Succeeded,
        ]
    );
    let st = status(&ctl).await;
    assert_eq!(st.message, "Deployment verified and succeeded");
    assert!(st.conditions.is_true(conditions::READY));
    assert!(st.conditions.is_true(conditions::VERIFIED));
    let ds = st.delivery_status.unwrap();
    assert_eq!(ds.sync_state, SyncState::Synced);
    assert_eq!(ds.sites.len(), 2);
    assert_eq!(st.validation_results.len(), 1);
    assert!(st.validation_results[0].passed);
    assert!(st.compiled_manifests.unwrap().contains("rendered-by"));
    for phase in [Phase::Compiling, Phase::Rendering, Phase::Delivering, Phase::Reconciling, Phase::Verifying] {
        assert_eq!(sim.calls_for(phase), 1, "{phase}");
    }
}

#[tokio::test]
async fn gates_disabled_skip_verification() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new());
    let ctl = controller(store, sim.clone());

    assert_eq!(drive(&ctl).await.last(), Some(&Phase::Succeeded));
    assert_eq!(sim.calls_for(Phase::Verifying), 0);
    assert!(status(&ctl).await.validation_results.is_empty());
}

#[tokio::test]
async fn terminal_phases_are_idle() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new());
    let ctl = controller(store, sim.clone());
    drive(&ctl).await;

    let before = ctl.store().get(&key()).await.unwrap();
    let calls = sim.calls().len();
    for _ in 0..3 {
        assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::Never);
    }
    let after = ctl.store().get(&key()).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(sim.calls().len(), calls);
}

#[tokio::test]
async fn gate_failure_routes_through_failed() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(gated(spec("x")), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new().fail_gates(true));
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(trail.last(), Some(&Phase::Failed));
    assert!(!trail.contains(&Phase::RollingBack));
    let st = status(&ctl).await;
    assert_eq!(st.conditions.get(conditions::FAILED).unwrap().reason, "GateFailed");
    assert_eq!(st.conditions.get(conditions::VERIFIED).unwrap().status, ConditionStatus::False);
    assert!(!st.validation_results[0].passed);
    assert!(st.message.contains("latency_p99"));
}

#[tokio::test]
async fn gate_failure_with_auto_rollback_recovers() {
    let store = Arc::new(MemoryStore::new());
    let rb = RollbackConfig { retain_failed_artifacts: false, ..Default::default() };
    store.create(obj(with_rollback(gated(spec("x")), rb), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new().with_head("known-good").fail_gates(true));
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(&trail[trail.len() - 4..], &[Phase::Verifying, Phase::Failed, Phase::RollingBack, Phase::Succeeded]);
    let st = status(&ctl).await;
    assert!(st.conditions.is_true(conditions::ROLLED_BACK));
    assert!(st.conditions.is_true(conditions::READY));
    assert!(!st.conditions.is_true(conditions::FAILED));
    let rbs = st.rollback_status.unwrap();
    assert!(!rbs.active);
    assert_eq!(rbs.previous_commit.as_deref(), Some("known-good"));
    assert_eq!(st.delivery_status.unwrap().git_commit.as_deref(), Some("known-good"));
    assert!(st.compiled_manifests.is_none());
    assert!(st.validation_results.is_empty());
    assert_eq!(sim.head().as_deref(), Some("known-good"));
}

#[tokio::test]
async fn failing_into_rollback_requeues_after_fixed_delay() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(with_rollback(gated(spec("x")), RollbackConfig::default()), Some(Phase::Verifying))).await.unwrap();
    let ctl = controller(store, Arc::new(SimPipeline::new().fail_gates(true)));
    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(Duration::from_secs(5)));
    assert_eq!(status(&ctl).await.phase, Some(Phase::Failed));
}

#[tokio::test]
async fn transient_failures_retry_in_place() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), Some(Phase::Compiling))).await.unwrap();
    let sim = Arc::new(SimPipeline::new().fail(Phase::Compiling, StepErrorKind::Transient, 2));
    let ctl = controller(store, sim.clone());

    for attempt in 1..=2 {
        assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(Duration::from_secs(5)));
        let st = status(&ctl).await;
        assert_eq!(st.phase, Some(Phase::Compiling));
        assert_eq!(st.phase_attempts, attempt);
        assert_eq!(st.conditions.get(conditions::READY).unwrap().reason, "Retrying");
    }
    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(STEP_DELAY));
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::Rendering));
    assert_eq!(st.phase_attempts, 0);
}

#[tokio::test]
async fn transient_failures_escalate_after_budget() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), Some(Phase::Compiling))).await.unwrap();
    let sim = Arc::new(SimPipeline::new().fail(Phase::Compiling, StepErrorKind::Transient, 10));
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(trail.last(), Some(&Phase::Failed));
    assert_eq!(sim.calls_for(Phase::Compiling), 3);
    let st = status(&ctl).await;
    assert_eq!(st.conditions.get(conditions::FAILED).unwrap().reason, "StepFailed");
    assert!(st.message.contains("after 3 attempts"), "{}", st.message);
}

#[tokio::test]
async fn permanent_failure_fails_immediately() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), None)).await.unwrap();
    let sim = Arc::new(SimPipeline::new().fail(Phase::Delivering, StepErrorKind::Permanent, 1));
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(trail.last(), Some(&Phase::Failed));
    assert_eq!(sim.calls_for(Phase::Delivering), 1);
    assert_eq!(sim.calls_for(Phase::Reconciling), 0);
}

#[tokio::test(start_paused = true)]
async fn collaborator_timeout_is_a_transient_failure() {
    let store = Arc::new(MemoryStore::new());
    let mut s = spec("x");
    s.compile_config = Some(CompileConfig { render_timeout: Some("1s".into()), ..Default::default() });
    store.create(obj(s, Some(Phase::Compiling))).await.unwrap();
    let ctl = controller(store, Arc::new(SimPipeline::new().latency(Duration::from_secs(600))));

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(Duration::from_secs(5)));
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::Compiling));
    assert!(st.message.contains("timed out"), "{}", st.message);
}

#[tokio::test]
async fn missing_object_is_a_no_op() {
    let ctl = controller(Arc::new(MemoryStore::new()), Arc::new(SimPipeline::new()));
    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::Never);
}

#[tokio::test]
async fn spec_change_bumps_observed_generation() {
    let store = Arc::new(MemoryStore::new());
    store.create(obj(spec("x"), None)).await.unwrap();
    let ctl = controller(store.clone(), Arc::new(SimPipeline::new()));
    ctl.reconcile(&key()).await.unwrap();
    ctl.reconcile(&key()).await.unwrap();

    let mut o = store.get(&key()).await.unwrap();
    o.spec.compile_config = Some(CompileConfig { render_timeout: Some("10m".into()), ..Default::default() });
    store.update(o).await.unwrap();
    ctl.reconcile(&key()).await.unwrap();
    assert_eq!(status(&ctl).await.observed_generation, 2);
}

#[tokio::test]
async fn status_conflicts_are_retried() {
    let store = Arc::new(ConflictingStore::new(MemoryStore::new(), 2));
    store.create(obj(spec("x"), None)).await.unwrap();
    let ctl = controller(store.clone(), Arc::new(SimPipeline::new()));

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::IMMEDIATE);
    assert_eq!(store.injected(), 2);
    assert_eq!(status(&ctl).await.phase, Some(Phase::Pending));
}

#[tokio::test]
async fn endless_conflicts_surface_as_errors() {
    let store = Arc::new(ConflictingStore::new(MemoryStore::new(), 100));
    store.create(obj(spec("x"), None)).await.unwrap();
    let ctl = controller(store.clone(), Arc::new(SimPipeline::new()));

    let err = ctl.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::ConflictsExhausted { attempts: 4, .. }), "{err}");
    assert_eq!(status(&ctl).await.phase, None);
}

/// What a concurrent writer does just before the first status write lands.
enum Race {
    MovePhase(Phase),
    Retarget(&'static str),
}

/// Loses the first status write to another writer.
struct RacingStore {
    inner: MemoryStore,
    race: Race,
    raced: AtomicBool,
}

impl RacingStore {
    fn new(race: Race) -> Self {
        Self { inner: MemoryStore::new(), race, raced: AtomicBool::new(false) }
    }
}

#[async_trait::async_trait]
impl Store for RacingStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<IntentDeployment> {
        self.inner.get(key).await
    }
    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        self.inner.create(obj).await
    }
    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        self.inner.update(obj).await
    }
    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        if !self.raced.swap(true, Ordering::SeqCst) {
            let k = ObjectKey::of(&obj);
            let mut other = self.inner.get(&k).await?;
            match self.race {
                Race::MovePhase(phase) => {
                    other.status = Some(IntentDeploymentStatus { phase: Some(phase), ..Default::default() });
                    self.inner.update_status(other).await?;
                }
                Race::Retarget(site) => {
                    other.spec.delivery_config =
                        Some(DeliveryConfig { target_site: Some(site.into()), ..Default::default() });
                    self.inner.update(other).await?;
                }
            }
            return Err(StoreError::Conflict(k));
        }
        self.inner.update_status(obj).await
    }
    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete(key).await
    }
    async fn watch(&self) -> StoreResult<ChangeRx> {
        self.inner.watch().await
    }
}

#[tokio::test]
async fn outcome_is_dropped_when_phase_moved_concurrently() {
    let store = Arc::new(RacingStore::new(Race::MovePhase(Phase::Compiling)));
    store.create(obj(spec("x"), None)).await.unwrap();
    let ctl = controller(store, Arc::new(SimPipeline::new()));

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::IMMEDIATE);
    assert_eq!(status(&ctl).await.phase, Some(Phase::Compiling));
}

#[tokio::test]
async fn spec_change_during_step_reruns_the_phase() {
    let store = Arc::new(RacingStore::new(Race::Retarget("edge2")));
    let mut o = obj(spec("x"), Some(Phase::Delivering));
    o.spec.delivery_config = Some(DeliveryConfig { target_site: Some("edge1".into()), ..Default::default() });
    if let Some(st) = o.status.as_mut() {
        st.compiled_manifests = Some("kind: ConfigMap\n".into());
    }
    store.create(o).await.unwrap();
    let sim = Arc::new(SimPipeline::new());
    let ctl = controller(store.clone(), sim.clone());

    // the edge1 delivery was computed for generation 1 and must not be recorded
    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::IMMEDIATE);
    let o = store.get(&key()).await.unwrap();
    assert_eq!(o.generation(), 2);
    let st = o.status.unwrap_or_default();
    assert_eq!(st.phase, Some(Phase::Delivering));
    assert!(st.delivery_status.is_none());
    assert!(st.observed_generation < 2);

    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::After(STEP_DELAY));
    let st = status(&ctl).await;
    assert_eq!(st.phase, Some(Phase::Reconciling));
    assert_eq!(st.observed_generation, 2);
    let sites: Vec<_> = st.delivery_status.unwrap().sites.into_keys().collect();
    assert_eq!(sites, vec!["edge2".to_string()]);
    assert_eq!(sim.calls_for(Phase::Delivering), 2);
}

#[tokio::test]
async fn rollback_gives_up_after_max_retries() {
    let store = Arc::new(MemoryStore::new());
    let rb = RollbackConfig { max_retries: 2, ..Default::default() };
    store.create(obj(with_rollback(spec("x"), rb), Some(Phase::Failed))).await.unwrap();
    let sim = Arc::new(SimPipeline::new().fail(Phase::RollingBack, StepErrorKind::Permanent, 10));
    let ctl = controller(store, sim.clone());

    let trail = drive(&ctl).await;
    assert_eq!(trail, vec![Phase::RollingBack, Phase::RollingBack, Phase::Failed]);
    assert_eq!(sim.calls_for(Phase::RollingBack), 2);
    let st = status(&ctl).await;
    assert_eq!(st.conditions.get(conditions::FAILED).unwrap().reason, "RollbackFailed");
    let rbs = st.rollback_status.unwrap();
    assert_eq!(rbs.attempts, 2);
    assert!(!rbs.active);
    assert_eq!(ctl.reconcile(&key()).await.unwrap(), Requeue::Never);
}

struct CorruptStore;

#[async_trait::async_trait]
impl Store for CorruptStore {
    async fn get(&self, _key: &ObjectKey) -> StoreResult<IntentDeployment> {
        Err(StoreError::Corrupt("unknown phase: \"Validating\"".into()))
    }
    async fn create(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        Ok(obj)
    }
    async fn update(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        Ok(obj)
    }
    async fn update_status(&self, obj: IntentDeployment) -> StoreResult<IntentDeployment> {
        Ok(obj)
    }
    async fn delete(&self, _key: &ObjectKey) -> StoreResult<()> {
        Ok(())
    }
    async fn watch(&self) -> StoreResult<ChangeRx> {
        Err(StoreError::Backend("no watch".into()))
    }
}

#[tokio::test]
async fn corrupt_phase_is_reported_loudly() {
    let ctl = controller(CorruptStore, Arc::new(SimPipeline::new()));
    let err = ctl.reconcile(&key()).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Corrupt { .. }));
    assert!(err.to_string().contains("Validating"));
}
