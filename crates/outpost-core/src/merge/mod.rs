//! The lifecycle merge engine.
//!
//! Transitions the running topology from its current configuration to a
//! resolved target atomically under the deployment's failure handling
//! policy: plan, snapshot, update-check vote, apply, then commit or
//! recover. Cancellation is observed at every checkpoint and unwinds with
//! rollback semantics regardless of policy.

pub mod plan;
pub mod update_check;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::cancel::CancelSignal;
use crate::component::recipe::BOOTSTRAP_STAGE;
use crate::deployment::{
    DeploymentDirectory, DeploymentDocument, DeploymentResult, DeploymentStatus,
    FailureHandlingPolicy, GroupRootsStore, PersistedDeployment, UpdatePolicyAction,
};
use crate::fs_safe::{atomic_write_json, bounded_read_json, FsSafeError, DEFAULT_MAX_FILE_SIZE};
use crate::lifecycle::{DeploymentStage, DEPENDENCIES_KEY, MAIN_SERVICE};
use crate::supervisor::Supervisor;

pub use plan::MergePlan;
pub use update_check::{DeferComponentUpdate, PreComponentUpdate, UpdateNotifier};

const SNAPSHOT_FILE: &str = "rollback.json";

/// Everything needed to restore the pre-deployment world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackSnapshot {
    /// The services configuration before the merge.
    pub services: Value,

    /// The group-to-roots map before the merge.
    pub group_roots: BTreeMap<String, BTreeMap<String, String>>,

    /// Versions that were running before the merge, by name.
    pub running: BTreeMap<String, String>,
}

impl RollbackSnapshot {
    /// Persist into a deployment's snapshot folder.
    ///
    /// # Errors
    ///
    /// Propagates atomic-write failures.
    pub fn save(&self, directory: &DeploymentDirectory) -> Result<(), FsSafeError> {
        atomic_write_json(&directory.snapshot_dir().join(SNAPSHOT_FILE), self)
    }

    /// Load from a deployment's snapshot folder, if present.
    ///
    /// # Errors
    ///
    /// Propagates read failures other than absence.
    pub fn load(directory: &DeploymentDirectory) -> Result<Option<Self>, FsSafeError> {
        let path = directory.snapshot_dir().join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }
        bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE).map(Some)
    }
}

/// One merge invocation.
pub struct MergeRequest<'a> {
    /// Deployment identifier.
    pub deployment_id: &'a str,

    /// The deployment document driving the merge.
    pub document: &'a DeploymentDocument,

    /// Target services map (the tree under the services key).
    pub target_services: &'a Value,

    /// Pinned roots the deployment's group converges to on success.
    pub target_roots: BTreeMap<String, String>,

    /// This deployment's scratch directory.
    pub directory: &'a DeploymentDirectory,

    /// Wall-clock deadline for the whole deployment.
    pub deadline: Instant,

    /// Snapshot from an earlier pass of the same deployment. A resumed
    /// bootstrap deployment rolls back to the original pre-deployment
    /// world, not to its own intermediate state.
    pub prior_snapshot: Option<RollbackSnapshot>,
}

/// Applies a resolved configuration to the running supervisor.
pub struct DeploymentMerger<'a> {
    supervisor: &'a mut Supervisor,
    groups: &'a mut GroupRootsStore,
    notifier: &'a UpdateNotifier,
    cancel: CancelSignal,
}

impl<'a> DeploymentMerger<'a> {
    /// Create a merger bound to the live supervisor and persisted stores.
    pub fn new(
        supervisor: &'a mut Supervisor,
        groups: &'a mut GroupRootsStore,
        notifier: &'a UpdateNotifier,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            supervisor,
            groups,
            notifier,
            cancel,
        }
    }

    /// Run the merge to a terminal [`DeploymentResult`].
    pub async fn merge(&mut self, request: &MergeRequest<'_>) -> DeploymentResult {
        let current = self.supervisor.services_config();
        let merge_plan = MergePlan::compute(&current, request.target_services);
        info!(
            deployment = request.deployment_id,
            added = merge_plan.added.len(),
            removed = merge_plan.removed.len(),
            updated = merge_plan.updated.len(),
            unchanged = merge_plan.unchanged.len(),
            bootstrap = merge_plan.bootstrap.len(),
            "merge planned"
        );

        let snapshot = request.prior_snapshot.clone().unwrap_or(RollbackSnapshot {
            services: current,
            group_roots: self.groups.map().clone(),
            running: self
                .supervisor
                .running_versions()
                .into_iter()
                .map(|(name, version)| (name, version.to_string()))
                .collect(),
        });
        if let Err(e) = with_io_retry(|| snapshot.save(request.directory)) {
            error!(deployment = request.deployment_id, error = %e, "failed to persist rollback snapshot");
            return DeploymentResult::failed(
                DeploymentStatus::FailedNoStateChange,
                format!("snapshot persistence failed: {e}"),
            );
        }

        if self.cancel.is_cancelled() {
            info!(deployment = request.deployment_id, "cancelled before apply");
            return self
                .unwind(&snapshot, &merge_plan, request, "deployment cancelled")
                .await;
        }

        if let Some(result) = self.update_check(&merge_plan, request, &snapshot).await {
            return result;
        }

        match self.apply(&merge_plan, request).await {
            Ok(()) => match self.commit(request) {
                Ok(result) => result,
                Err(detail) => self.recover(&snapshot, &merge_plan, request, &detail).await,
            },
            Err(failure) => match failure {
                ApplyFailure::Cancelled => {
                    self.unwind(&snapshot, &merge_plan, request, "deployment cancelled")
                        .await
                },
                ApplyFailure::Service(detail) => {
                    self.recover(&snapshot, &merge_plan, request, &detail).await
                },
            },
        }
    }

    /// Phase 3: publish pre-update events and honor deferral votes.
    /// Returns a terminal result only when cancellation lands mid-wait.
    async fn update_check(
        &mut self,
        merge_plan: &MergePlan,
        request: &MergeRequest<'_>,
        snapshot: &RollbackSnapshot,
    ) -> Option<DeploymentResult> {
        let policy = &request.document.component_update_policy;
        if policy.action == UpdatePolicyAction::SkipNotifyComponents {
            info!(deployment = request.deployment_id, "safety checks skipped by policy");
            return None;
        }

        let affected: Vec<String> = merge_plan
            .affected()
            .into_iter()
            .filter(|name| !policy.skip_notify_components.contains(name))
            .collect();
        if affected.is_empty() {
            return None;
        }

        let window = Duration::from_secs(policy.timeout_seconds);
        let votes = self
            .notifier
            .collect_deferrals(request.deployment_id, &affected, window)
            .await;
        if votes.is_empty() {
            return None;
        }

        let longest = votes.iter().map(|v| v.recheck_after_ms).max().unwrap_or(0);
        let until_deadline = request.deadline.saturating_duration_since(Instant::now());
        let wait = Duration::from_millis(longest).min(until_deadline);
        info!(
            deployment = request.deployment_id,
            deferrals = votes.len(),
            wait_ms = wait.as_millis() as u64,
            "components deferred the update, rescheduling merge"
        );

        if !self.cancellable_sleep(wait).await {
            info!(deployment = request.deployment_id, "cancelled during deferral wait");
            return Some(
                self.unwind(snapshot, merge_plan, request, "deployment cancelled")
                    .await,
            );
        }

        // rescheduled once; further deferrals are heard but no longer delay
        let _ = self
            .notifier
            .collect_deferrals(request.deployment_id, &affected, window)
            .await;
        None
    }

    /// Phase 4: stop, swap configuration, run bootstrap stages, start.
    async fn apply(
        &mut self,
        merge_plan: &MergePlan,
        request: &MergeRequest<'_>,
    ) -> Result<(), ApplyFailure> {
        // stop removed and to-update services in reverse dependency order
        let to_stop: BTreeSet<String> = merge_plan
            .affected()
            .into_iter()
            .filter(|name| {
                self.supervisor
                    .state_of(name)
                    .is_some_and(crate::lifecycle::ServiceState::is_active)
            })
            .collect();
        for name in self.supervisor.stop_order(&to_stop) {
            if self.cancel.is_cancelled() {
                return Err(ApplyFailure::Cancelled);
            }
            if let Err(first) = self.supervisor.stop_service(&name).await {
                warn!(service = %name, error = %first, "stop failed, retrying once");
                if let Err(second) = self.supervisor.stop_service(&name).await {
                    return Err(ApplyFailure::Service(format!(
                        "failed to stop '{name}': {second}"
                    )));
                }
            }
        }

        for name in &merge_plan.removed {
            self.supervisor.remove_service(name);
        }

        if merge_plan.requires_bootstrap() {
            self.run_bootstrap(merge_plan, request).await?;
        }

        // swap configuration before any restart
        for name in merge_plan.touched() {
            if let Some(config) = request.target_services.get(&name) {
                self.supervisor.upsert_service(&name, config.clone());
            }
        }
        self.supervisor
            .set_main_dependencies(main_dependencies(request.target_services));

        // start level by level: causal order follows the dependency DAG,
        // mutually independent services within a level start in parallel,
        // every level bounded by the deadline
        let to_start = merge_plan.touched();
        for batch in self.supervisor.start_batches(&to_start) {
            if self.cancel.is_cancelled() {
                return Err(ApplyFailure::Cancelled);
            }
            let remaining = request.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ApplyFailure::Service(format!(
                    "deployment deadline expired before starting: {}",
                    batch.join(", ")
                )));
            }

            match tokio::time::timeout(remaining, self.supervisor.start_services(&batch)).await {
                Ok(results) => {
                    for (name, outcome) in results {
                        match outcome {
                            Ok(state) if state.is_success() => {},
                            Ok(state) => {
                                return Err(ApplyFailure::Service(format!(
                                    "service '{name}' settled in state '{state}'"
                                )));
                            },
                            Err(e) => {
                                return Err(ApplyFailure::Service(format!(
                                    "service '{name}' failed to start: {e}"
                                )));
                            },
                        }
                    }
                },
                Err(_) => {
                    for name in &batch {
                        if self.supervisor.state_of(name)
                            == Some(crate::lifecycle::ServiceState::Starting)
                        {
                            self.supervisor
                                .mark_state(name, crate::lifecycle::ServiceState::Broken);
                        }
                    }
                    return Err(ApplyFailure::Service(format!(
                        "services did not settle before the deadline: {}",
                        batch.join(", ")
                    )));
                },
            }
        }

        Ok(())
    }

    /// Bootstrap-requiring updates persist their stage, swap configuration
    /// and run the bootstrap stage before activation.
    async fn run_bootstrap(
        &mut self,
        merge_plan: &MergePlan,
        request: &MergeRequest<'_>,
    ) -> Result<(), ApplyFailure> {
        self.persist_stage(request, DeploymentStage::Bootstrap);
        info!(
            deployment = request.deployment_id,
            components = merge_plan.bootstrap.len(),
            "running bootstrap stages"
        );

        for name in &merge_plan.bootstrap {
            if self.cancel.is_cancelled() {
                return Err(ApplyFailure::Cancelled);
            }
            if let Some(config) = request.target_services.get(name) {
                self.supervisor.upsert_service(name, config.clone());
            }
            if let Err(e) = self.supervisor.run_stage(name, BOOTSTRAP_STAGE).await {
                return Err(ApplyFailure::Service(format!(
                    "bootstrap stage of '{name}' failed: {e}"
                )));
            }
        }

        self.persist_stage(request, DeploymentStage::KernelActivation);
        Ok(())
    }

    fn persist_stage(&self, request: &MergeRequest<'_>, stage: DeploymentStage) {
        let record = PersistedDeployment {
            deployment_id: request.deployment_id.to_string(),
            document: request.document.clone(),
            target_services: request.target_services.clone(),
            target_roots: request.target_roots.clone(),
            stage,
        };
        if let Err(e) = with_io_retry(|| record.save(request.directory)) {
            warn!(deployment = request.deployment_id, error = %e, "failed to persist deployment stage");
        }
    }

    /// Phase 5 success path. The group map and the applied configuration
    /// land together or the whole merge recovers per policy.
    fn commit(&mut self, request: &MergeRequest<'_>) -> Result<DeploymentResult, String> {
        with_io_retry(|| {
            self.groups
                .set_group(&request.document.group_name, request.target_roots.clone())
        })
        .map_err(|e| format!("group roots persistence failed: {e}"))?;

        info!(deployment = request.deployment_id, "deployment committed");
        Ok(DeploymentResult::successful())
    }

    /// Roll the topology back to `snapshot` without running a forward
    /// merge first. Used when resuming a deployment persisted in the
    /// rollback stage.
    pub async fn rollback(
        &mut self,
        snapshot: &RollbackSnapshot,
        request: &MergeRequest<'_>,
        detail: &str,
    ) -> DeploymentResult {
        let current = self.supervisor.services_config();
        let merge_plan = MergePlan::compute(&current, request.target_services);
        self.unwind(snapshot, &merge_plan, request, detail).await
    }

    async fn recover(
        &mut self,
        snapshot: &RollbackSnapshot,
        merge_plan: &MergePlan,
        request: &MergeRequest<'_>,
        detail: &str,
    ) -> DeploymentResult {
        error!(deployment = request.deployment_id, detail, "deployment apply failed");
        match request.document.failure_handling_policy {
            FailureHandlingPolicy::DoNothing => DeploymentResult::failed(
                DeploymentStatus::FailedRollbackNotRequested,
                detail.to_string(),
            ),
            FailureHandlingPolicy::Rollback => {
                self.unwind(snapshot, merge_plan, request, detail).await
            },
        }
    }

    /// Restore the snapshot: stop everything the deployment touched,
    /// re-apply the previous configuration, restart what was running.
    async fn unwind(
        &mut self,
        snapshot: &RollbackSnapshot,
        merge_plan: &MergePlan,
        request: &MergeRequest<'_>,
        detail: &str,
    ) -> DeploymentResult {
        info!(deployment = request.deployment_id, "rolling back");
        if merge_plan.requires_bootstrap() {
            self.persist_stage(request, DeploymentStage::KernelRollback);
        }

        let touched = merge_plan.touched();
        for name in self.supervisor.stop_order(&touched) {
            if let Err(e) = self.supervisor.stop_service(&name).await {
                warn!(service = %name, error = %e, "stop during rollback failed");
            }
        }

        let previous = snapshot.services.as_object().cloned().unwrap_or_default();

        // services introduced by this deployment disappear again
        for name in &touched {
            if !previous.contains_key(name) {
                self.supervisor.remove_service(name);
            }
        }

        // restore every previous service subtree (re-adding removed ones)
        for (name, config) in &previous {
            if name != MAIN_SERVICE {
                self.supervisor.upsert_service(name, config.clone());
            }
        }
        self.supervisor
            .set_main_dependencies(main_dependencies(&snapshot.services));

        if let Err(e) = with_io_retry(|| self.groups.replace(snapshot.group_roots.clone())) {
            error!(deployment = request.deployment_id, error = %e, "failed to restore group roots");
            return DeploymentResult::failed(
                DeploymentStatus::FailedUnableToRollback,
                format!("{detail}; group roots restore failed: {e}"),
            );
        }

        // restart previously running versions that are no longer up;
        // untouched services still running keep running undisturbed
        let needs_start: BTreeSet<String> = snapshot
            .running
            .keys()
            .filter(|name| {
                !matches!(
                    self.supervisor.state_of(name),
                    Some(
                        crate::lifecycle::ServiceState::Running
                            | crate::lifecycle::ServiceState::Starting
                    )
                )
            })
            .cloned()
            .collect();

        let mut restored = true;
        for batch in self.supervisor.start_batches(&needs_start) {
            for (name, outcome) in self.supervisor.start_services(&batch).await {
                match outcome {
                    Ok(state) if state.is_success() => {},
                    Ok(state) => {
                        error!(service = %name, state = %state, "rollback restart did not succeed");
                        restored = false;
                    },
                    Err(e) => {
                        error!(service = %name, error = %e, "rollback restart failed");
                        restored = false;
                    },
                }
            }
        }

        if restored {
            DeploymentResult::failed(DeploymentStatus::FailedRollbackComplete, detail.to_string())
        } else {
            DeploymentResult::failed(
                DeploymentStatus::FailedUnableToRollback,
                format!("{detail}; rollback could not restore every service"),
            )
        }
    }

    /// Sleep in cancellation-checking steps. Returns `false` when
    /// cancellation interrupted the wait.
    async fn cancellable_sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return true;
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
        }
    }
}

enum ApplyFailure {
    Cancelled,
    Service(String),
}

/// Dependency names of the synthetic main entry (kind suffixes stripped).
fn main_dependencies(services: &Value) -> Vec<String> {
    services
        .get(MAIN_SERVICE)
        .and_then(|main| main.get(DEPENDENCIES_KEY))
        .and_then(Value::as_array)
        .map(|deps| {
            deps.iter()
                .filter_map(Value::as_str)
                .map(|entry| entry.split_once(':').map_or(entry, |(name, _)| name).to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn with_io_retry<T, E: std::fmt::Display>(
    mut op: impl FnMut() -> Result<T, E>,
) -> Result<T, E> {
    match op() {
        Ok(value) => Ok(value),
        Err(first) => {
            warn!(error = %first, "persistence failed, retrying once");
            op()
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::deployment::{ComponentUpdatePolicy, DeploymentDirectoryManager, RootComponentSpec};
    use crate::lifecycle::ServiceState;
    use crate::supervisor::{LaunchError, ServiceLauncher, ServiceSnapshot};

    /// Launcher scripted per service name: `Ok(state)` or failure.
    #[derive(Default)]
    struct ScriptedLauncher {
        outcomes: StdMutex<HashMap<String, ServiceState>>,
        started: StdMutex<Vec<String>>,
    }

    impl ScriptedLauncher {
        fn set_outcome(&self, name: &str, state: ServiceState) {
            self.outcomes
                .lock()
                .unwrap()
                .insert(name.to_string(), state);
        }

        fn started(&self) -> Vec<String> {
            self.started.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ServiceLauncher for ScriptedLauncher {
        async fn start(&self, service: &ServiceSnapshot) -> Result<ServiceState, LaunchError> {
            self.started.lock().unwrap().push(service.name.clone());
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .get(&service.name)
                .copied()
                .unwrap_or(ServiceState::Running))
        }

        async fn stop(&self, _service: &ServiceSnapshot) -> Result<(), LaunchError> {
            Ok(())
        }

        async fn run_stage(
            &self,
            _service: &ServiceSnapshot,
            _stage: &str,
        ) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    struct Fixture {
        _tmp: tempfile::TempDir,
        supervisor: Supervisor,
        groups: GroupRootsStore,
        notifier: UpdateNotifier,
        directory: crate::deployment::DeploymentDirectory,
        launcher: Arc<ScriptedLauncher>,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Arc::new(ScriptedLauncher::default());
        let supervisor = Supervisor::new(tmp.path(), Arc::clone(&launcher) as Arc<dyn ServiceLauncher>);
        let groups = GroupRootsStore::load(tmp.path()).unwrap();
        let directories = DeploymentDirectoryManager::open(tmp.path()).unwrap();
        let directory = directories.create_if_not_exists("merge-test").unwrap();
        Fixture {
            _tmp: tmp,
            supervisor,
            groups,
            notifier: UpdateNotifier::new(),
            directory,
            launcher,
        }
    }

    fn document(policy: FailureHandlingPolicy) -> DeploymentDocument {
        DeploymentDocument {
            group_name: "test-group".to_string(),
            timestamp: 1,
            root_components: [(
                "App".to_string(),
                RootComponentSpec {
                    version: semver::VersionReq::parse("=1.0.0").unwrap(),
                },
            )]
            .into(),
            component_configuration_updates: BTreeMap::new(),
            failure_handling_policy: policy,
            component_update_policy: ComponentUpdatePolicy {
                timeout_seconds: 1,
                ..ComponentUpdatePolicy::default()
            },
            configuration_arn: None,
        }
    }

    fn service(version: &str, deps: &[&str]) -> Value {
        json!({
            "version": version,
            "dependencies": deps,
            "lifecycle": {"run": "sleep 1000"},
            "configuration": {}
        })
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(300)
    }

    #[tokio::test]
    async fn test_successful_merge_commits_roots() {
        let mut fx = fixture();
        let doc = document(FailureHandlingPolicy::Rollback);
        let target = json!({
            "App": service("1.0.0", &["Lib"]),
            "Lib": service("1.0.0", &[]),
            "main": {"dependencies": ["App"]}
        });

        let mut merger = DeploymentMerger::new(
            &mut fx.supervisor,
            &mut fx.groups,
            &fx.notifier,
            CancelSignal::new(),
        );
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "d1",
                document: &doc,
                target_services: &target,
                target_roots: [("App".to_string(), "1.0.0".to_string())].into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        assert_eq!(result.status, DeploymentStatus::Successful);
        assert_eq!(fx.supervisor.state_of("App"), Some(ServiceState::Running));
        assert_eq!(fx.groups.roots_of("test-group")["App"], "1.0.0");

        // dependency starts before dependent
        let started = fx.launcher.started();
        assert_eq!(started, vec!["Lib".to_string(), "App".to_string()]);
    }

    #[tokio::test]
    async fn test_broken_service_rolls_back() {
        let mut fx = fixture();

        // seed a running topology
        fx.supervisor.upsert_service("App", service("1.0.0", &[]));
        fx.supervisor.start_service("App").await.unwrap();
        fx.groups
            .set_group("test-group", [("App".to_string(), "1.0.0".to_string())].into())
            .unwrap();

        fx.launcher.set_outcome("Breaking", ServiceState::Broken);

        let doc = document(FailureHandlingPolicy::Rollback);
        let target = json!({
            "App": service("1.0.0", &[]),
            "Breaking": service("1.0.0", &[]),
            "main": {"dependencies": ["App", "Breaking"]}
        });

        let mut merger = DeploymentMerger::new(
            &mut fx.supervisor,
            &mut fx.groups,
            &fx.notifier,
            CancelSignal::new(),
        );
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "d2",
                document: &doc,
                target_services: &target,
                target_roots: [
                    ("App".to_string(), "1.0.0".to_string()),
                    ("Breaking".to_string(), "1.0.0".to_string()),
                ]
                .into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        assert_eq!(result.status, DeploymentStatus::FailedRollbackComplete);
        assert!(fx.supervisor.get("Breaking").is_none());
        assert_eq!(fx.supervisor.state_of("App"), Some(ServiceState::Running));
        // group map restored to the pre-deployment pin set
        assert_eq!(
            fx.groups.roots_of("test-group"),
            BTreeMap::from([("App".to_string(), "1.0.0".to_string())])
        );
    }

    #[tokio::test]
    async fn test_do_nothing_leaves_partial_state() {
        let mut fx = fixture();
        fx.launcher.set_outcome("Breaking", ServiceState::Broken);

        let doc = document(FailureHandlingPolicy::DoNothing);
        let target = json!({
            "Breaking": service("1.0.0", &[]),
            "main": {"dependencies": ["Breaking"]}
        });

        let mut merger = DeploymentMerger::new(
            &mut fx.supervisor,
            &mut fx.groups,
            &fx.notifier,
            CancelSignal::new(),
        );
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "d3",
                document: &doc,
                target_services: &target,
                target_roots: [("Breaking".to_string(), "1.0.0".to_string())].into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        assert_eq!(result.status, DeploymentStatus::FailedRollbackNotRequested);
        assert_eq!(
            fx.supervisor.state_of("Breaking"),
            Some(ServiceState::Broken)
        );
    }

    #[tokio::test]
    async fn test_cancellation_during_deferral_aborts() {
        let mut fx = fixture();

        fx.supervisor.upsert_service("App", service("1.0.0", &[]));
        fx.supervisor.start_service("App").await.unwrap();

        // a subscriber that defers for a minute
        let mut events = fx.notifier.subscribe();
        let votes = fx.notifier.deferral_sender();
        tokio::spawn(async move {
            if let Ok(event) = events.recv().await {
                let _ = votes.send(DeferComponentUpdate {
                    deployment_id: event.deployment_id,
                    component: event.component,
                    recheck_after_ms: 60_000,
                });
            }
        });

        let cancel = CancelSignal::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let doc = document(FailureHandlingPolicy::DoNothing);
        let target = json!({
            "App": service("2.0.0", &[]),
            "main": {"dependencies": ["App"]}
        });

        let mut merger =
            DeploymentMerger::new(&mut fx.supervisor, &mut fx.groups, &fx.notifier, cancel);
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "d4",
                document: &doc,
                target_services: &target,
                target_roots: [("App".to_string(), "2.0.0".to_string())].into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        // cancellation unwinds with rollback semantics even under DO_NOTHING
        assert_eq!(result.status, DeploymentStatus::FailedRollbackComplete);
        let handle = fx.supervisor.get("App").unwrap();
        assert_eq!(handle.version, Some(semver::Version::new(1, 0, 0)));
        assert_eq!(handle.state, ServiceState::Running);
    }

    #[tokio::test]
    async fn test_skip_safety_checks_ignores_deferrals() {
        let mut fx = fixture();

        fx.supervisor.upsert_service("App", service("1.0.0", &[]));
        fx.supervisor.start_service("App").await.unwrap();

        // subscriber always defers
        let mut events = fx.notifier.subscribe();
        let votes = fx.notifier.deferral_sender();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                let _ = votes.send(DeferComponentUpdate {
                    deployment_id: event.deployment_id,
                    component: event.component,
                    recheck_after_ms: 60_000,
                });
            }
        });

        let mut doc = document(FailureHandlingPolicy::Rollback);
        doc.component_update_policy.action = UpdatePolicyAction::SkipNotifyComponents;
        let target = json!({
            "App": service("1.0.1", &[]),
            "main": {"dependencies": ["App"]}
        });

        let mut merger = DeploymentMerger::new(
            &mut fx.supervisor,
            &mut fx.groups,
            &fx.notifier,
            CancelSignal::new(),
        );
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "d5",
                document: &doc,
                target_services: &target,
                target_roots: [("App".to_string(), "1.0.1".to_string())].into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        assert_eq!(result.status, DeploymentStatus::Successful);
        assert_eq!(
            fx.supervisor.get("App").unwrap().version,
            Some(semver::Version::new(1, 0, 1))
        );
    }

    #[tokio::test]
    async fn test_bootstrap_stage_records_progress() {
        let mut fx = fixture();

        fx.supervisor.upsert_service(
            "App",
            json!({
                "version": "1.0.0",
                "dependencies": [],
                "lifecycle": {"run": "a", "bootstrap": "./boot.sh"},
                "configuration": {}
            }),
        );
        fx.supervisor.start_service("App").await.unwrap();

        let doc = document(FailureHandlingPolicy::Rollback);
        let target = json!({
            "App": {
                "version": "2.0.0",
                "dependencies": [],
                "lifecycle": {"run": "a", "bootstrap": "./boot.sh"},
                "configuration": {}
            },
            "main": {"dependencies": ["App"]}
        });

        let mut merger = DeploymentMerger::new(
            &mut fx.supervisor,
            &mut fx.groups,
            &fx.notifier,
            CancelSignal::new(),
        );
        let result = merger
            .merge(&MergeRequest {
                deployment_id: "boot-d",
                document: &doc,
                target_services: &target,
                target_roots: [("App".to_string(), "2.0.0".to_string())].into(),
                directory: &fx.directory,
                deadline: far_deadline(),
                prior_snapshot: None,
            })
            .await;

        assert_eq!(result.status, DeploymentStatus::Successful);
        let record = PersistedDeployment::load(&fx.directory).unwrap().unwrap();
        assert_eq!(record.stage, DeploymentStage::KernelActivation);
    }
}
