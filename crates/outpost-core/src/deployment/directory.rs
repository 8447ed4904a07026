//! Per-deployment on-disk scratchpads.
//!
//! Each deployment owns `<root>/deployments/<sanitized-id>/` with
//! `snapshot/`, `bootstrap/` and `artifacts-staging/` subfolders. Creation
//! is idempotent; directories of committed non-bootstrap deployments are
//! deleted on commit.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

/// Errors from deployment directory management.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// I/O failure.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Operation description.
        context: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl DirectoryError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

const SNAPSHOT_DIR: &str = "snapshot";
const BOOTSTRAP_DIR: &str = "bootstrap";
const STAGING_DIR: &str = "artifacts-staging";

/// Handle to one deployment's directory tree.
#[derive(Debug, Clone)]
pub struct DeploymentDirectory {
    root: PathBuf,
}

impl DeploymentDirectory {
    /// Root of the deployment directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the rollback snapshot.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.root.join(SNAPSHOT_DIR)
    }

    /// Directory holding the persisted deployment stage record.
    #[must_use]
    pub fn bootstrap_dir(&self) -> PathBuf {
        self.root.join(BOOTSTRAP_DIR)
    }

    /// Staging area for artifacts mid-install.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }
}

/// Manager of `<root>/deployments`.
pub struct DeploymentDirectoryManager {
    deployments_root: PathBuf,
}

impl DeploymentDirectoryManager {
    /// Open (creating if needed) the deployments root.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Io`] when the root cannot be created.
    pub fn open(root: &Path) -> Result<Self, DirectoryError> {
        let deployments_root = root.join("deployments");
        fs::create_dir_all(&deployments_root).map_err(|e| {
            DirectoryError::io(format!("creating {}", deployments_root.display()), e)
        })?;
        Ok(Self { deployments_root })
    }

    /// Create the directory tree for `deployment_id`, returning the
    /// existing tree untouched when it is already there.
    ///
    /// # Errors
    ///
    /// [`DirectoryError::Io`] when a subfolder cannot be created.
    pub fn create_if_not_exists(
        &self,
        deployment_id: &str,
    ) -> Result<DeploymentDirectory, DirectoryError> {
        let root = self.deployments_root.join(sanitize(deployment_id));
        let dir = DeploymentDirectory { root };
        for sub in [dir.snapshot_dir(), dir.bootstrap_dir(), dir.staging_dir()] {
            fs::create_dir_all(&sub)
                .map_err(|e| DirectoryError::io(format!("creating {}", sub.display()), e))?;
        }
        debug!(deployment = deployment_id, "deployment directory ready");
        Ok(dir)
    }

    /// Delete the directory for `deployment_id`. Best-effort.
    pub fn delete(&self, deployment_id: &str) {
        let root = self.deployments_root.join(sanitize(deployment_id));
        if root.exists() {
            if let Err(e) = fs::remove_dir_all(&root) {
                warn!(deployment = deployment_id, error = %e, "failed to delete deployment directory");
            }
        }
    }

    /// Sanitized directory names currently present.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.deployments_root) else {
            return Vec::new();
        };
        entries
            .filter_map(Result::ok)
            .filter(|e| e.path().is_dir())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect()
    }

    /// Directory handle for an already-sanitized name from [`list`].
    ///
    /// [`list`]: Self::list
    #[must_use]
    pub fn directory_for(&self, sanitized: &str) -> DeploymentDirectory {
        DeploymentDirectory {
            root: self.deployments_root.join(sanitized),
        }
    }
}

/// Deployment ids are ARNs with `/` and `:` separators; flatten them into
/// a single path component.
fn sanitize(deployment_id: &str) -> String {
    deployment_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
