//! IPC request dispatch.
//!
//! Every handler is idempotent on its stated key. Streaming subscription
//! requests are routed by the server before reaching this module; a
//! `SubscribeToComponentUpdates` arriving here answers `Subscribed` and
//! the connection loop takes over.

use std::path::PathBuf;

use outpost_core::cancel::CancelSignal;
use outpost_core::ipc::{ComponentDetails, ErrorCode, IpcRequest, IpcResponse};
use outpost_core::lifecycle::MAIN_SERVICE;
use tracing::{info, warn};

use crate::orchestrator::{DeploymentQueue, QueuedDeployment};
use crate::state::SharedState;

/// Dispatch one request to its handler.
pub async fn dispatch(
    request: IpcRequest,
    state: &SharedState,
    queue: &DeploymentQueue,
) -> IpcResponse {
    match request {
        IpcRequest::GetComponentDetails { name } => get_component_details(state, &name).await,
        IpcRequest::ListComponents => list_components(state).await,
        IpcRequest::RestartComponent { name } => restart_component(state, &name).await,
        IpcRequest::StopComponent { name } => stop_component(state, &name).await,
        IpcRequest::UpdateRecipesAndArtifacts {
            recipe_dir,
            artifact_dir,
        } => update_recipes_and_artifacts(state, &recipe_dir, artifact_dir.as_deref()),
        IpcRequest::CreateLocalDeployment(request) => {
            create_local_deployment(state, queue, request).await
        },
        IpcRequest::GetLocalDeploymentStatus { deployment_id } => {
            get_local_deployment_status(state, &deployment_id).await
        },
        IpcRequest::ListLocalDeployments => {
            IpcResponse::LocalDeployments(state.deployment_records().await)
        },
        IpcRequest::SubscribeToComponentUpdates => IpcResponse::Subscribed,
        IpcRequest::DeferComponentUpdate(vote) => {
            // valid on a subscribed connection; accepting it here keeps
            // one-shot clients working too
            let _ = state.notifier.deferral_sender().send(vote);
            IpcResponse::Ok
        },
    }
}

async fn get_component_details(state: &SharedState, name: &str) -> IpcResponse {
    let topology = state.topology.read().await;
    match topology.supervisor.get(name) {
        Some(handle) if !handle.builtin => IpcResponse::ComponentDetails(details(handle)),
        _ => not_found(name),
    }
}

async fn list_components(state: &SharedState) -> IpcResponse {
    let topology = state.topology.read().await;
    let components = topology
        .supervisor
        .managed_names()
        .into_iter()
        .filter(|name| name != MAIN_SERVICE)
        .filter_map(|name| topology.supervisor.get(&name).map(details))
        .collect();
    IpcResponse::ComponentList(components)
}

async fn restart_component(state: &SharedState, name: &str) -> IpcResponse {
    let mut topology = state.topology.write().await;
    if topology.supervisor.get(name).is_none() {
        return not_found(name);
    }
    if let Err(e) = topology.supervisor.stop_service(name).await {
        return internal(format!("failed to stop '{name}': {e}"));
    }
    match topology.supervisor.start_service(name).await {
        Ok(settled_state) if settled_state.is_success() => {
            info!(component = name, "component restarted");
            IpcResponse::Ok
        },
        Ok(settled_state) => internal(format!("'{name}' settled in state '{settled_state}'")),
        Err(e) => internal(format!("failed to start '{name}': {e}")),
    }
}

async fn stop_component(state: &SharedState, name: &str) -> IpcResponse {
    let mut topology = state.topology.write().await;
    if topology.supervisor.get(name).is_none() {
        return not_found(name);
    }
    match topology.supervisor.stop_service(name).await {
        Ok(()) => {
            info!(component = name, "component stopped");
            IpcResponse::Ok
        },
        Err(e) => internal(format!("failed to stop '{name}': {e}")),
    }
}

fn update_recipes_and_artifacts(
    state: &SharedState,
    recipe_dir: &str,
    artifact_dir: Option<&str>,
) -> IpcResponse {
    let recipe_dir = PathBuf::from(recipe_dir);
    if !recipe_dir.is_dir() {
        return IpcResponse::Error {
            code: ErrorCode::InvalidRequest,
            message: format!("recipe directory {} does not exist", recipe_dir.display()),
        };
    }
    let artifact_dir = artifact_dir.map(PathBuf::from);
    match state.store.preload(&recipe_dir, artifact_dir.as_deref()) {
        Ok(loaded) => {
            info!(count = loaded.len(), "store preloaded over IPC");
            IpcResponse::Ok
        },
        Err(e) => internal(format!("store preload failed: {e}")),
    }
}

async fn create_local_deployment(
    state: &SharedState,
    queue: &DeploymentQueue,
    request: outpost_core::deployment::LocalOverrideRequest,
) -> IpcResponse {
    let group = request
        .group_name
        .clone()
        .unwrap_or_else(|| outpost_core::deployment::LOCAL_GROUP.to_string());

    let current_roots = {
        let topology = state.topology.read().await;
        topology.groups.roots_of(&group)
    };

    let document = request.into_document(&current_roots, chrono::Utc::now().timestamp_millis());
    let deployment_id = document.deployment_id();
    let cancel = CancelSignal::new();
    state.record_queued(&deployment_id, cancel.clone()).await;

    let queued = QueuedDeployment {
        deployment_id: deployment_id.clone(),
        document,
        cancel,
    };
    if queue.enqueue(queued).is_err() {
        warn!(deployment = %deployment_id, "deployment queue refused the task");
        return internal("deployment queue is not accepting tasks".to_string());
    }

    IpcResponse::LocalDeploymentQueued { deployment_id }
}

async fn get_local_deployment_status(state: &SharedState, deployment_id: &str) -> IpcResponse {
    match state.deployment_record(deployment_id).await {
        Some(record) => IpcResponse::LocalDeploymentStatus(record),
        None => IpcResponse::Error {
            code: ErrorCode::NotFound,
            message: format!("deployment '{deployment_id}' not found"),
        },
    }
}

fn details(handle: &outpost_core::supervisor::ServiceHandle) -> ComponentDetails {
    ComponentDetails {
        name: handle.name.clone(),
        version: handle.version.as_ref().map(ToString::to_string),
        state: handle.state,
        configuration: handle
            .config
            .get(outpost_core::lifecycle::CONFIGURATION_KEY)
            .cloned()
            .unwrap_or_default(),
    }
}

fn not_found(name: &str) -> IpcResponse {
    IpcResponse::Error {
        code: ErrorCode::NotFound,
        message: format!("component '{name}' not found"),
    }
}

fn internal(message: String) -> IpcResponse {
    IpcResponse::Error {
        code: ErrorCode::Internal,
        message,
    }
}
