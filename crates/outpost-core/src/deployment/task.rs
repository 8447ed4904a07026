//! One deployment, end to end.
//!
//! Turns a deployment document into a terminal [`DeploymentResult`]:
//! dependency resolution across groups, preemptive store cleanup,
//! component fetch, configuration resolution, then the lifecycle merge.
//! Resolution and preparation failures never touch the live topology.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info};

use super::{
    DeploymentDocument, DeploymentResult, DeploymentStatus, GroupRootsStore, PersistedDeployment,
};
use crate::cancel::CancelSignal;
use crate::config_resolver::ConfigResolver;
use crate::deployment::DeploymentDirectoryManager;
use crate::lifecycle::{DeploymentStage, SERVICES_KEY};
use crate::merge::{DeploymentMerger, MergeRequest, RollbackSnapshot, UpdateNotifier};
use crate::resolver::{DependencyResolver, Requirement, ResolvedComponent};
use crate::store::{ArtifactSource, ComponentStore};
use crate::supervisor::Supervisor;

/// Mutable and shared collaborators a deployment runs against.
pub struct DeploymentContext<'a> {
    /// The live topology.
    pub supervisor: &'a mut Supervisor,

    /// The component store.
    pub store: &'a ComponentStore,

    /// Remote recipe/artifact provider.
    pub source: &'a dyn ArtifactSource,

    /// Persisted group root maps.
    pub groups: &'a mut GroupRootsStore,

    /// Per-deployment scratch directories.
    pub directories: &'a DeploymentDirectoryManager,

    /// Pre-update notification hub.
    pub notifier: &'a UpdateNotifier,
}

/// A queued deployment with its cancellation signal and deadline budget.
pub struct DeploymentTask {
    /// Deployment identifier (directory name, status key).
    pub deployment_id: String,

    /// The parsed document.
    pub document: DeploymentDocument,

    /// Cooperative cancellation signal.
    pub cancel: CancelSignal,

    /// Wall-clock budget for the whole deployment.
    pub timeout: Duration,
}

/// Execute one deployment to a terminal result.
pub async fn execute(ctx: &mut DeploymentContext<'_>, task: &DeploymentTask) -> DeploymentResult {
    let deployment_id = task.deployment_id.as_str();
    let document = &task.document;
    info!(
        deployment = deployment_id,
        group = %document.group_name,
        roots = document.root_components.len(),
        "deployment started"
    );

    let directory = match ctx.directories.create_if_not_exists(deployment_id) {
        Ok(directory) => directory,
        Err(e) => {
            error!(deployment = deployment_id, error = %e, "failed to allocate deployment directory");
            return DeploymentResult::failed(DeploymentStatus::FailedNoStateChange, e.to_string());
        },
    };

    // the document's roots supersede the group's previous pins; every
    // other group keeps contributing its own
    let mut requirements = ctx
        .groups
        .union_requirements(&[document.group_name.as_str()]);
    let mut root_names: std::collections::BTreeSet<String> = requirements.keys().cloned().collect();
    for (name, spec) in &document.root_components {
        root_names.insert(name.clone());
        requirements
            .entry(name.clone())
            .or_default()
            .push(Requirement::new(
                format!("group:{}", document.group_name),
                spec.version.clone(),
            ));
    }

    let running = ctx.supervisor.running_versions();
    let resolver = DependencyResolver::new(ctx.store, ctx.source, running.clone());
    let resolved = match resolver.resolve(&requirements).await {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(deployment = deployment_id, error = %e, "dependency resolution failed");
            return DeploymentResult::failed(DeploymentStatus::FailedNoStateChange, e.to_string());
        },
    };

    // preemptive cleanup bounds disk before new artifacts land: only the
    // running and target versions of each name survive
    let retain: HashSet<crate::component::ComponentIdentifier> = resolved
        .iter()
        .map(|component| component.id.clone())
        .chain(running.iter().map(|(name, version)| {
            crate::component::ComponentIdentifier::new(name.clone(), version.clone())
        }))
        .collect();
    ctx.store.prune(&retain);

    for component in &resolved {
        if task.cancel.is_cancelled() {
            return DeploymentResult::failed(
                DeploymentStatus::FailedNoStateChange,
                "deployment cancelled during preparation",
            );
        }
        if let Err(e) = ctx.store.ensure_present(&component.id, ctx.source).await {
            error!(deployment = deployment_id, component = %component.id, error = %e, "component preparation failed");
            return DeploymentResult::failed(DeploymentStatus::FailedNoStateChange, e.to_string());
        }
    }

    let current_services = ctx.supervisor.services_config();
    let builtins = ctx.supervisor.builtin_names();
    let config_resolver = ConfigResolver::new(ctx.store, ctx.supervisor.root_path());
    let resolved_config =
        config_resolver.resolve(&resolved, document, &root_names, &current_services, &builtins);
    let target_services = resolved_config
        .get(SERVICES_KEY)
        .cloned()
        .unwrap_or_default();

    let mut merger = DeploymentMerger::new(
        ctx.supervisor,
        ctx.groups,
        ctx.notifier,
        task.cancel.clone(),
    );
    let result = merger
        .merge(&MergeRequest {
            deployment_id,
            document,
            target_services: &target_services,
            target_roots: target_roots(document, &resolved),
            directory: &directory,
            deadline: Instant::now() + task.timeout,
            prior_snapshot: None,
        })
        .await;

    // scratch space of committed non-bootstrap deployments goes away;
    // bootstrap deployments keep theirs for resumption
    if result.status.is_successful()
        && PersistedDeployment::load(&directory)
            .ok()
            .flatten()
            .is_none()
    {
        ctx.directories.delete(deployment_id);
    }

    info!(deployment = deployment_id, status = %result.status, "deployment finished");
    result
}

/// Resume a deployment persisted mid-bootstrap: compare the post-restart
/// topology to the target and drive it to success or rollback.
pub async fn resume(
    ctx: &mut DeploymentContext<'_>,
    record: PersistedDeployment,
    timeout: Duration,
) -> DeploymentResult {
    let deployment_id = record.deployment_id.as_str();
    info!(deployment = deployment_id, stage = %record.stage, "resuming persisted deployment");

    let directory = match ctx.directories.create_if_not_exists(deployment_id) {
        Ok(directory) => directory,
        Err(e) => {
            return DeploymentResult::failed(DeploymentStatus::FailedNoStateChange, e.to_string());
        },
    };
    let prior_snapshot = RollbackSnapshot::load(&directory).ok().flatten();

    let mut merger = DeploymentMerger::new(
        ctx.supervisor,
        ctx.groups,
        ctx.notifier,
        CancelSignal::new(),
    );
    let request = MergeRequest {
        deployment_id,
        document: &record.document,
        target_services: &record.target_services,
        target_roots: record.target_roots.clone(),
        directory: &directory,
        deadline: Instant::now() + timeout,
        prior_snapshot,
    };

    let result = match record.stage {
        DeploymentStage::Default | DeploymentStage::Bootstrap | DeploymentStage::KernelActivation => {
            merger.merge(&request).await
        },
        DeploymentStage::KernelRollback => match &request.prior_snapshot {
            Some(snapshot) => {
                let snapshot = snapshot.clone();
                merger
                    .rollback(&snapshot, &request, "resumed in rollback stage")
                    .await
            },
            None => DeploymentResult::failed(
                DeploymentStatus::FailedUnableToRollback,
                "rollback stage persisted but no snapshot found",
            ),
        },
    };

    PersistedDeployment::clear(&directory);
    if result.status.is_successful() {
        ctx.directories.delete(deployment_id);
    }
    result
}

fn target_roots(
    document: &DeploymentDocument,
    resolved: &[ResolvedComponent],
) -> BTreeMap<String, String> {
    resolved
        .iter()
        .filter(|component| document.root_components.contains_key(&component.id.name))
        .map(|component| (component.id.name.clone(), component.id.version.to_string()))
        .collect()
}
