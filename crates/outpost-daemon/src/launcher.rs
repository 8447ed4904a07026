//! Shell-based service launcher.
//!
//! Lifecycle stage scripts run through `sh -c` with the supervisor root
//! as working directory. `install` and `startup` run to completion before
//! `run` is spawned as a long-lived child; a service with no `run` stage
//! settles as finished.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use outpost_core::lifecycle::ServiceState;
use outpost_core::supervisor::{LaunchError, ServiceLauncher, ServiceSnapshot};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Launches service lifecycle stages as shell commands.
#[derive(Default)]
pub struct ExecLauncher {
    children: Mutex<HashMap<String, Child>>,
}

impl ExecLauncher {
    /// Create a launcher with no running children.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn command(script: &str, service: &ServiceSnapshot) -> Command {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(script)
            .current_dir(&service.root_path)
            .env("OUTPOST_ROOT", &service.root_path)
            .env("OUTPOST_COMPONENT", &service.name)
            .stdin(Stdio::null());
        if let Some(version) = &service.version {
            command.env("OUTPOST_COMPONENT_VERSION", version.to_string());
        }
        command
    }

    async fn run_to_completion(
        script: &str,
        stage: &str,
        service: &ServiceSnapshot,
    ) -> Result<bool, LaunchError> {
        debug!(service = %service.name, stage, "running lifecycle stage");
        let status = Self::command(script, service)
            .status()
            .await
            .map_err(|source| LaunchError::Io {
                service: service.name.clone(),
                source,
            })?;
        Ok(status.success())
    }
}

#[async_trait]
impl ServiceLauncher for ExecLauncher {
    async fn start(&self, service: &ServiceSnapshot) -> Result<ServiceState, LaunchError> {
        for stage in ["install", "startup"] {
            if let Some(script) = service.stage_text(stage) {
                if !Self::run_to_completion(script, stage, service).await? {
                    warn!(service = %service.name, stage, "lifecycle stage exited non-zero");
                    return Ok(ServiceState::Broken);
                }
            }
        }

        let Some(run) = service.stage_text("run") else {
            return Ok(ServiceState::Finished);
        };

        let child = Self::command(run, service)
            .spawn()
            .map_err(|source| LaunchError::Io {
                service: service.name.clone(),
                source,
            })?;
        info!(service = %service.name, pid = child.id(), "service process spawned");
        self.children.lock().await.insert(service.name.clone(), child);
        Ok(ServiceState::Running)
    }

    async fn stop(&self, service: &ServiceSnapshot) -> Result<(), LaunchError> {
        if let Some(script) = service.stage_text("shutdown") {
            // shutdown scripts are advisory; the kill below is the backstop
            if let Err(e) = Self::run_to_completion(script, "shutdown", service).await {
                warn!(service = %service.name, error = %e, "shutdown stage failed");
            }
        }

        if let Some(mut child) = self.children.lock().await.remove(&service.name) {
            if let Err(e) = child.kill().await {
                warn!(service = %service.name, error = %e, "failed to kill service process");
            }
        }
        Ok(())
    }

    async fn run_stage(&self, service: &ServiceSnapshot, stage: &str) -> Result<(), LaunchError> {
        let Some(script) = service.stage_text(stage) else {
            return Ok(());
        };
        if Self::run_to_completion(script, stage, service).await? {
            Ok(())
        } else {
            Err(LaunchError::StageFailed {
                service: service.name.clone(),
                stage: stage.to_string(),
                message: "stage exited non-zero".to_string(),
            })
        }
    }
}
