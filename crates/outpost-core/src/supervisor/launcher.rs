//! The process-launching seam.
//!
//! Shell invocation and platform differences live outside the core. The
//! supervisor hands a [`ServiceSnapshot`] to a [`ServiceLauncher`] and
//! records the state the launcher reports back.

use std::path::PathBuf;

use async_trait::async_trait;
use semver::Version;
use serde_json::Value;

use crate::lifecycle::ServiceState;

/// Errors from the launcher.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// A lifecycle stage failed to execute.
    #[error("lifecycle stage '{stage}' of '{service}' failed: {message}")]
    StageFailed {
        /// Service name.
        service: String,
        /// Stage name.
        stage: String,
        /// Failure detail.
        message: String,
    },

    /// I/O failure while launching.
    #[error("I/O error launching '{service}': {source}")]
    Io {
        /// Service name.
        service: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Immutable view of a service the launcher acts on.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    /// Service name.
    pub name: String,

    /// Deployed version, when the service is a managed component.
    pub version: Option<Version>,

    /// Interpolated lifecycle stage map.
    pub lifecycle: Value,

    /// Resolved component configuration.
    pub configuration: Value,

    /// Supervisor root path.
    pub root_path: PathBuf,
}

impl ServiceSnapshot {
    /// The text of a lifecycle stage, when present as a script string or
    /// a step object with a `Script` key.
    #[must_use]
    pub fn stage_text(&self, stage: &str) -> Option<&str> {
        match self.lifecycle.get(stage)? {
            Value::String(s) => Some(s.as_str()),
            Value::Object(map) => map.get("Script").and_then(Value::as_str),
            _ => None,
        }
    }
}

/// Executes lifecycle stages for services.
///
/// `start` drives the service to a settled state and reports it: `Running`
/// for services with a long-lived `run` stage, `Finished` for run-to-
/// completion services, `Broken` when startup failed permanently.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Start (or restart) a service and report the settled state.
    async fn start(&self, service: &ServiceSnapshot) -> Result<ServiceState, LaunchError>;

    /// Stop a running service.
    async fn stop(&self, service: &ServiceSnapshot) -> Result<(), LaunchError>;

    /// Run a single lifecycle stage to completion (bootstrap, recover).
    async fn run_stage(&self, service: &ServiceSnapshot, stage: &str) -> Result<(), LaunchError>;
}

/// Launcher that performs no process work: services with a `run` stage
/// settle as `Running`, everything else as `Finished`.
///
/// Useful for tests and for dry topology manipulation.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateLauncher;

#[async_trait]
impl ServiceLauncher for ImmediateLauncher {
    async fn start(&self, service: &ServiceSnapshot) -> Result<ServiceState, LaunchError> {
        if service.stage_text("run").is_some() || service.stage_text("startup").is_some() {
            Ok(ServiceState::Running)
        } else {
            Ok(ServiceState::Finished)
        }
    }

    async fn stop(&self, _service: &ServiceSnapshot) -> Result<(), LaunchError> {
        Ok(())
    }

    async fn run_stage(&self, _service: &ServiceSnapshot, _stage: &str) -> Result<(), LaunchError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn snapshot(lifecycle: Value) -> ServiceSnapshot {
        ServiceSnapshot {
            name: "svc".to_string(),
            version: None,
            lifecycle,
            configuration: Value::Null,
            root_path: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn test_immediate_launcher_states() {
        let launcher = ImmediateLauncher;

        let running = launcher
            .start(&snapshot(json!({"run": "sleep 1000"})))
            .await
            .unwrap();
        assert_eq!(running, ServiceState::Running);

        let finished = launcher
            .start(&snapshot(json!({"install": "true"})))
            .await
            .unwrap();
        assert_eq!(finished, ServiceState::Finished);
    }

    #[test]
    fn test_stage_text_shapes() {
        let snap = snapshot(json!({
            "run": "echo run",
            "bootstrap": {"Script": "./boot.sh", "Timeout": 30},
            "weird": 7
        }));
        assert_eq!(snap.stage_text("run"), Some("echo run"));
        assert_eq!(snap.stage_text("bootstrap"), Some("./boot.sh"));
        assert_eq!(snap.stage_text("weird"), None);
        assert_eq!(snap.stage_text("absent"), None);
    }
}
