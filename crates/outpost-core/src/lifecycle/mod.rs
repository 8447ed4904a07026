//! Service and deployment lifecycle state machines, and the key names of
//! the services configuration namespace.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Top-level key holding every service's configuration.
pub const SERVICES_KEY: &str = "services";

/// Per-service key holding the (interpolated) lifecycle stage map.
pub const LIFECYCLE_KEY: &str = "lifecycle";

/// Per-service key holding the dependency list (`name` or `name:KIND`).
pub const DEPENDENCIES_KEY: &str = "dependencies";

/// Per-service key holding the deployed version.
pub const VERSION_KEY: &str = "version";

/// Per-service key holding the version deployed before the current one.
pub const PREV_VERSION_KEY: &str = "previousVersion";

/// Per-service key holding the resolved component configuration.
pub const CONFIGURATION_KEY: &str = "configuration";

/// Per-service key holding the component type.
pub const TYPE_KEY: &str = "componentType";

/// Name of the synthetic root service whose dependencies are the union of
/// root components and builtin auto-start services.
pub const MAIN_SERVICE: &str = "main";

/// Service state machine.
///
/// `New -> Installed -> Starting -> Running -> Stopping -> Finished`, with
/// `Broken` a sink reachable from any non-terminal state and `Errored` the
/// transient recoverable variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceState {
    /// Known to the supervisor, nothing run yet.
    New,

    /// Install stage completed.
    Installed,

    /// Startup in progress.
    Starting,

    /// Service is up.
    Running,

    /// Shutdown in progress.
    Stopping,

    /// Ran to completion (or was stopped).
    Finished,

    /// Failed transiently; eligible for restart.
    Errored,

    /// Failed permanently; requires a deployment to leave.
    Broken,
}

impl ServiceState {
    /// Success states for deployment evaluation.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Running | Self::Finished)
    }

    /// States in which the service occupies its name (at most one version
    /// of a name may be in such a state).
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(
            self,
            Self::New | Self::Installed | Self::Starting | Self::Running | Self::Stopping
        )
    }

    /// Whether the service has failed permanently.
    #[must_use]
    pub const fn is_broken(self) -> bool {
        matches!(self, Self::Broken)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::New => "new",
            Self::Installed => "installed",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Finished => "finished",
            Self::Errored => "errored",
            Self::Broken => "broken",
        };
        write!(f, "{text}")
    }
}

/// Stages a deployment moves through. Most deployments terminate inside
/// `Default`; bootstrap-requiring deployments persist their stage and
/// continue across a supervisor restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStage {
    /// Ordinary single-pass deployment.
    #[default]
    Default,

    /// Bootstrap lifecycle stages are executing.
    Bootstrap,

    /// Post-restart activation: verify the topology matches the target.
    KernelActivation,

    /// Post-restart rollback to the snapshot.
    KernelRollback,
}

impl fmt::Display for DeploymentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Default => "DEFAULT",
            Self::Bootstrap => "BOOTSTRAP",
            Self::KernelActivation => "KERNEL_ACTIVATION",
            Self::KernelRollback => "KERNEL_ROLLBACK",
        };
        write!(f, "{text}")
    }
}
