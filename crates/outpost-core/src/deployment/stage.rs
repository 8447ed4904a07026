//! Persisted deployment stage machine.
//!
//! Bootstrap-requiring deployments survive a supervisor restart: the
//! in-progress deployment (document, target configuration, stage) is
//! persisted under the deployment directory and resumed by the
//! orchestrator on startup before new tasks are accepted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::directory::DeploymentDirectory;
use super::DeploymentDocument;
use crate::fs_safe::{atomic_write_json, bounded_read_json, FsSafeError, DEFAULT_MAX_FILE_SIZE};
use crate::lifecycle::DeploymentStage;

const PENDING_FILE: &str = "pending.json";

/// The persisted form of an in-progress deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedDeployment {
    /// Deployment identifier.
    pub deployment_id: String,

    /// The original document.
    pub document: DeploymentDocument,

    /// The fully resolved target services configuration.
    pub target_services: Value,

    /// Pinned roots the deployment's group converges to.
    pub target_roots: std::collections::BTreeMap<String, String>,

    /// Stage reached so far.
    pub stage: DeploymentStage,
}

impl PersistedDeployment {
    /// Persist this record into the deployment's bootstrap folder.
    ///
    /// # Errors
    ///
    /// Propagates atomic-write failures.
    pub fn save(&self, dir: &DeploymentDirectory) -> Result<(), FsSafeError> {
        atomic_write_json(&dir.bootstrap_dir().join(PENDING_FILE), self)
    }

    /// Load the record from a deployment directory, if one is persisted.
    ///
    /// # Errors
    ///
    /// Propagates read failures other than absence.
    pub fn load(dir: &DeploymentDirectory) -> Result<Option<Self>, FsSafeError> {
        let path = dir.bootstrap_dir().join(PENDING_FILE);
        if !path.exists() {
            return Ok(None);
        }
        bounded_read_json(&path, DEFAULT_MAX_FILE_SIZE).map(Some)
    }

    /// Remove the persisted record. Best-effort.
    pub fn clear(dir: &DeploymentDirectory) {
        let path = dir.bootstrap_dir().join(PENDING_FILE);
        let _ = std::fs::remove_file(path);
    }
}
