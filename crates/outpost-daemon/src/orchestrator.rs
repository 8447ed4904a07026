//! The deployment lane.
//!
//! A single worker drains the deployment queue, so no two deployments
//! ever apply concurrently. Producers are the local CLI (through the IPC
//! server) and the cloud job intake. On startup, deployments persisted
//! mid-bootstrap are resumed before any new task is accepted.

use std::time::Duration;

use outpost_core::cancel::CancelSignal;
use outpost_core::deployment::task::{self, DeploymentContext, DeploymentTask};
use outpost_core::deployment::{DeploymentDocument, PersistedDeployment};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::state::SharedState;

/// Queue depth before producers see backpressure.
const QUEUE_CAPACITY: usize = 32;

/// A deployment accepted into the lane.
#[derive(Debug)]
pub struct QueuedDeployment {
    /// Deployment identifier.
    pub deployment_id: String,

    /// The parsed document.
    pub document: DeploymentDocument,

    /// Cancellation signal handed to the caller.
    pub cancel: CancelSignal,
}

/// Producer handle into the deployment lane.
#[derive(Clone)]
pub struct DeploymentQueue {
    tx: mpsc::Sender<QueuedDeployment>,
}

impl DeploymentQueue {
    /// Enqueue a deployment.
    ///
    /// # Errors
    ///
    /// Returns the deployment back when the lane has shut down or the
    /// queue is full.
    pub fn enqueue(&self, deployment: QueuedDeployment) -> Result<(), QueuedDeployment> {
        self.tx.try_send(deployment).map_err(|e| match e {
            mpsc::error::TrySendError::Full(d) | mpsc::error::TrySendError::Closed(d) => d,
        })
    }
}

/// The deployment lane: a queue handle plus the worker future.
pub struct DeploymentLane {
    /// Producer handle.
    pub queue: DeploymentQueue,
    rx: mpsc::Receiver<QueuedDeployment>,
    state: SharedState,
    deployment_timeout: Duration,
}

impl DeploymentLane {
    /// Create the lane over shared state.
    #[must_use]
    pub fn new(state: SharedState, deployment_timeout: Duration) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            queue: DeploymentQueue { tx },
            rx,
            state,
            deployment_timeout,
        }
    }

    /// Resume deployments persisted mid-bootstrap, then serve the queue
    /// until shutdown.
    pub async fn run(mut self) {
        self.resume_persisted().await;

        loop {
            if self.state.is_shutdown_requested() {
                info!("deployment lane shutting down");
                break;
            }

            let next = tokio::time::timeout(Duration::from_millis(250), self.rx.recv()).await;
            let Ok(message) = next else {
                continue;
            };
            let Some(deployment) = message else {
                break;
            };

            self.execute(deployment).await;
        }
    }

    async fn execute(&self, deployment: QueuedDeployment) {
        let QueuedDeployment {
            deployment_id,
            document,
            cancel,
        } = deployment;
        self.state.record_started(&deployment_id).await;

        let task = DeploymentTask {
            deployment_id: deployment_id.clone(),
            document,
            cancel,
            timeout: self.deployment_timeout,
        };

        let result = {
            let mut topology = self.state.topology.write().await;
            let topology = &mut *topology;
            let mut ctx = DeploymentContext {
                supervisor: &mut topology.supervisor,
                store: &self.state.store,
                source: &NoRemoteSource,
                groups: &mut topology.groups,
                directories: &self.state.directories,
                notifier: &self.state.notifier,
            };
            task::execute(&mut ctx, &task).await
        };

        info!(deployment = %deployment_id, status = %result.status, "deployment lane task finished");
        self.state.record_finished(&deployment_id, &result).await;
    }

    /// Scan the deployments directory for persisted in-progress stage
    /// records and drive each to a terminal state.
    async fn resume_persisted(&self) {
        for name in self.state.directories.list() {
            let directory = self.state.directories.directory_for(&name);
            let record = match PersistedDeployment::load(&directory) {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(e) => {
                    warn!(directory = %name, error = %e, "unreadable persisted deployment, skipping");
                    continue;
                },
            };

            info!(deployment = %record.deployment_id, stage = %record.stage, "resuming deployment");
            let deployment_id = record.deployment_id.clone();
            let result = {
                let mut topology = self.state.topology.write().await;
                let topology = &mut *topology;
                let mut ctx = DeploymentContext {
                    supervisor: &mut topology.supervisor,
                    store: &self.state.store,
                    source: &NoRemoteSource,
                    groups: &mut topology.groups,
                    directories: &self.state.directories,
                    notifier: &self.state.notifier,
                };
                task::resume(&mut ctx, record, self.deployment_timeout).await
            };

            if result.status.is_successful() {
                info!(deployment = %deployment_id, "resumed deployment committed");
            } else {
                error!(
                    deployment = %deployment_id,
                    status = %result.status,
                    detail = result.detail.as_deref().unwrap_or(""),
                    "resumed deployment did not commit"
                );
            }
        }
    }
}

/// Artifact source used when no cloud transport is wired in: everything
/// must already be in the store (preloaded locally).
struct NoRemoteSource;

#[async_trait::async_trait]
impl outpost_core::store::ArtifactSource for NoRemoteSource {
    async fn list_versions(
        &self,
        name: &str,
    ) -> Result<Vec<semver::Version>, outpost_core::store::FetchError> {
        Err(outpost_core::store::FetchError::ComponentNotFound(
            name.to_string(),
        ))
    }

    async fn fetch_recipe(
        &self,
        id: &outpost_core::component::ComponentIdentifier,
    ) -> Result<Vec<u8>, outpost_core::store::FetchError> {
        Err(outpost_core::store::FetchError::VersionNotFound(id.clone()))
    }

    async fn fetch_artifact(
        &self,
        id: &outpost_core::component::ComponentIdentifier,
        _artifact: &outpost_core::component::ArtifactDescriptor,
    ) -> Result<Vec<u8>, outpost_core::store::FetchError> {
        Err(outpost_core::store::FetchError::VersionNotFound(id.clone()))
    }
}
