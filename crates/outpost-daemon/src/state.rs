//! Shared daemon state.
//!
//! The live topology (supervisor plus group roots) sits behind one
//! `RwLock`: the deployment lane is its only writer, IPC handlers read
//! published snapshots. The component store, deployment directories and
//! the update notifier are internally synchronized and shared as-is.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use outpost_core::cancel::CancelSignal;
use outpost_core::deployment::{
    DeploymentDirectoryManager, DeploymentResult, GroupRootsStore,
};
use outpost_core::ipc::{LocalDeploymentRecord, LocalDeploymentState};
use outpost_core::merge::UpdateNotifier;
use outpost_core::store::ComponentStore;
use outpost_core::supervisor::Supervisor;
use tokio::sync::{Mutex, RwLock};

/// Shared daemon state handle.
pub type SharedState = Arc<DaemonStateHandle>;

/// The single-writer portion of daemon state: the running topology and
/// the persisted group map it commits together with.
pub struct Topology {
    /// The live supervisor.
    pub supervisor: Supervisor,

    /// Persisted group-to-roots map.
    pub groups: GroupRootsStore,
}

/// Handle to daemon state with interior mutability.
pub struct DaemonStateHandle {
    /// Supervisor root path.
    root: PathBuf,

    /// Topology behind the deployment-lane writer lock.
    pub topology: RwLock<Topology>,

    /// The component store.
    pub store: ComponentStore,

    /// Per-deployment scratch directories.
    pub directories: DeploymentDirectoryManager,

    /// Pre-update notification hub.
    pub notifier: UpdateNotifier,

    /// Local deployment history, newest last.
    records: Mutex<Vec<LocalDeploymentRecord>>,

    /// Cancellation signals of queued and in-flight deployments.
    cancels: Mutex<HashMap<String, CancelSignal>>,

    /// Shutdown flag (atomic for lock-free checking).
    shutdown: AtomicBool,

    /// Daemon start time.
    started_at: DateTime<Utc>,
}

impl DaemonStateHandle {
    /// Assemble daemon state over an opened root directory.
    #[must_use]
    pub fn new(
        root: &Path,
        supervisor: Supervisor,
        groups: GroupRootsStore,
        store: ComponentStore,
        directories: DeploymentDirectoryManager,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            topology: RwLock::new(Topology { supervisor, groups }),
            store,
            directories,
            notifier: UpdateNotifier::new(),
            records: Mutex::new(Vec::new()),
            cancels: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            started_at: Utc::now(),
        }
    }

    /// Supervisor root path.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Daemon start time.
    #[must_use]
    pub const fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request daemon shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Whether shutdown has been requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Record a freshly queued deployment.
    pub async fn record_queued(&self, deployment_id: &str, cancel: CancelSignal) {
        self.cancels
            .lock()
            .await
            .insert(deployment_id.to_string(), cancel);
        self.records.lock().await.push(LocalDeploymentRecord {
            deployment_id: deployment_id.to_string(),
            state: LocalDeploymentState::Queued,
            status: None,
            detail: None,
            created_at: Utc::now(),
        });
    }

    /// Mark a deployment in progress.
    pub async fn record_started(&self, deployment_id: &str) {
        self.update_record(deployment_id, |record| {
            record.state = LocalDeploymentState::InProgress;
        })
        .await;
    }

    /// Record a deployment's terminal result.
    pub async fn record_finished(&self, deployment_id: &str, result: &DeploymentResult) {
        self.cancels.lock().await.remove(deployment_id);
        self.update_record(deployment_id, |record| {
            record.state = if result.status.is_successful() {
                LocalDeploymentState::Succeeded
            } else {
                LocalDeploymentState::Failed
            };
            record.status = Some(result.status);
            record.detail = result.detail.clone();
        })
        .await;
    }

    /// Cancellation signal of a queued or running deployment.
    pub async fn cancel_signal(&self, deployment_id: &str) -> Option<CancelSignal> {
        self.cancels.lock().await.get(deployment_id).cloned()
    }

    /// One deployment record by id.
    pub async fn deployment_record(&self, deployment_id: &str) -> Option<LocalDeploymentRecord> {
        self.records
            .lock()
            .await
            .iter()
            .find(|record| record.deployment_id == deployment_id)
            .cloned()
    }

    /// Full deployment history, newest first.
    pub async fn deployment_records(&self) -> Vec<LocalDeploymentRecord> {
        let mut records = self.records.lock().await.clone();
        records.reverse();
        records
    }

    async fn update_record(
        &self,
        deployment_id: &str,
        update: impl FnOnce(&mut LocalDeploymentRecord),
    ) {
        let mut records = self.records.lock().await;
        if let Some(record) = records
            .iter_mut()
            .find(|record| record.deployment_id == deployment_id)
        {
            update(record);
        }
    }
}
