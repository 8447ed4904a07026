//! Deployment documents, policies and results.
//!
//! A deployment is a request to converge the device onto a new set of
//! components and configurations for one group. Documents arrive as JSON
//! from the cloud job intake or the local CLI.

pub mod directory;
pub mod groups;
pub mod stage;
pub mod task;

use std::collections::BTreeMap;

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use directory::{DeploymentDirectory, DeploymentDirectoryManager, DirectoryError};
pub use groups::{GroupRootsStore, GroupsError};
pub use stage::PersistedDeployment;
pub use task::{DeploymentContext, DeploymentTask};

/// Per-component configuration update: RESET pointers applied before a
/// deep MERGE.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationUpdate {
    /// RFC 6901 pointers to reset to recipe defaults (or remove).
    #[serde(default)]
    pub reset: Vec<String>,

    /// Tree deep-merged over the post-reset configuration.
    #[serde(default)]
    pub merge: Value,
}

/// What to do when a deployment fails mid-apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureHandlingPolicy {
    /// Leave the partially-applied state in place.
    DoNothing,

    /// Restore the pre-deployment snapshot.
    #[default]
    Rollback,
}

/// Whether pre-update safety checks run at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdatePolicyAction {
    /// Publish pre-update events and honor deferral votes.
    #[default]
    NotifyComponents,

    /// Skip safety checks entirely; deferral votes are ignored.
    SkipNotifyComponents,
}

/// Pre-update notification policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentUpdatePolicy {
    /// How long to wait for deferral votes, per round.
    #[serde(default = "default_update_timeout")]
    pub timeout_seconds: u64,

    /// Components exempt from the vote.
    #[serde(default)]
    pub skip_notify_components: Vec<String>,

    /// Whether the vote runs at all.
    #[serde(default)]
    pub action: UpdatePolicyAction,
}

const fn default_update_timeout() -> u64 {
    60
}

impl Default for ComponentUpdatePolicy {
    fn default() -> Self {
        Self {
            timeout_seconds: default_update_timeout(),
            skip_notify_components: Vec::new(),
            action: UpdatePolicyAction::default(),
        }
    }
}

/// Requested version constraint for one root component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RootComponentSpec {
    /// Version requirement. Exact versions pin (`=1.0.0` or `1.0.0`).
    #[serde(with = "crate::component::version_req_text")]
    pub version: VersionReq,
}

/// A deployment request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentDocument {
    /// Logical group the deployment targets.
    pub group_name: String,

    /// Monotonic within a group; tie-breaks replays.
    pub timestamp: i64,

    /// Root components requested by this deployment.
    #[serde(default)]
    pub root_components: BTreeMap<String, RootComponentSpec>,

    /// Root-only configuration updates.
    #[serde(default)]
    pub component_configuration_updates: BTreeMap<String, ConfigurationUpdate>,

    /// Failure handling policy.
    #[serde(default)]
    pub failure_handling_policy: FailureHandlingPolicy,

    /// Pre-update notification policy.
    #[serde(default)]
    pub component_update_policy: ComponentUpdatePolicy,

    /// Deployment identifier (configuration ARN analogue). Generated when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_arn: Option<String>,
}

impl DeploymentDocument {
    /// Parse a document from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns the underlying serde error for malformed documents.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// The deployment identifier, generating a fresh one when the document
    /// carries none.
    #[must_use]
    pub fn deployment_id(&self) -> String {
        self.configuration_arn
            .clone()
            .unwrap_or_else(|| format!("local-{}", uuid::Uuid::new_v4()))
    }
}

/// Terminal status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    /// Every target service reached a success state; state committed.
    Successful,

    /// The deployment failed before touching the live topology.
    FailedNoStateChange,

    /// Apply failed and the policy was `DO_NOTHING`.
    FailedRollbackNotRequested,

    /// Apply failed and the snapshot was restored.
    FailedRollbackComplete,

    /// Apply failed and restoring the snapshot also failed.
    FailedUnableToRollback,
}

impl DeploymentStatus {
    /// Whether this status represents a committed deployment.
    #[must_use]
    pub const fn is_successful(self) -> bool {
        matches!(self, Self::Successful)
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Successful => "SUCCESSFUL",
            Self::FailedNoStateChange => "FAILED_NO_STATE_CHANGE",
            Self::FailedRollbackNotRequested => "FAILED_ROLLBACK_NOT_REQUESTED",
            Self::FailedRollbackComplete => "FAILED_ROLLBACK_COMPLETE",
            Self::FailedUnableToRollback => "FAILED_UNABLE_TO_ROLLBACK",
        };
        write!(f, "{text}")
    }
}

/// Outcome of one deployment task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    /// Terminal status.
    pub status: DeploymentStatus,

    /// Human-readable failure detail, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl DeploymentResult {
    /// Successful result.
    #[must_use]
    pub const fn successful() -> Self {
        Self {
            status: DeploymentStatus::Successful,
            detail: None,
        }
    }

    /// Failed result with detail.
    #[must_use]
    pub fn failed(status: DeploymentStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
        }
    }
}

/// A local request to override the roots of one group: versions to pin or
/// add, names to drop, per-component configuration updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalOverrideRequest {
    /// Roots to add or re-pin, name to exact version.
    #[serde(default)]
    pub root_component_versions_to_add: BTreeMap<String, Version>,

    /// Roots to drop from the group.
    #[serde(default)]
    pub root_components_to_remove: Vec<String>,

    /// Configuration updates for root components.
    #[serde(default)]
    pub component_to_configuration: BTreeMap<String, ConfigurationUpdate>,

    /// Target group. Defaults to the local CLI group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,

    /// Failure handling policy for the produced deployment.
    #[serde(default)]
    pub failure_handling_policy: FailureHandlingPolicy,

    /// Pre-update notification policy for the produced deployment.
    #[serde(default)]
    pub component_update_policy: ComponentUpdatePolicy,
}

/// Group name used for deployments created by the local CLI.
pub const LOCAL_GROUP: &str = "LOCAL_DEPLOYMENT";

impl LocalOverrideRequest {
    /// Turn the override into a full deployment document, starting from the
    /// group's current pinned roots.
    #[must_use]
    pub fn into_document(
        self,
        current_roots: &BTreeMap<String, String>,
        timestamp: i64,
    ) -> DeploymentDocument {
        let group_name = self
            .group_name
            .unwrap_or_else(|| LOCAL_GROUP.to_string());

        let mut roots: BTreeMap<String, RootComponentSpec> = current_roots
            .iter()
            .filter(|(name, _)| !self.root_components_to_remove.contains(name))
            .filter_map(|(name, version)| {
                VersionReq::parse(&format!("={version}"))
                    .ok()
                    .map(|req| (name.clone(), RootComponentSpec { version: req }))
            })
            .collect();

        for (name, version) in self.root_component_versions_to_add {
            if let Ok(req) = VersionReq::parse(&format!("={version}")) {
                roots.insert(name, RootComponentSpec { version: req });
            }
        }

        DeploymentDocument {
            group_name,
            timestamp,
            root_components: roots,
            component_configuration_updates: self.component_to_configuration,
            failure_handling_policy: self.failure_handling_policy,
            component_update_policy: self.component_update_policy,
            configuration_arn: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_wire_document() {
        let doc = DeploymentDocument::from_json(
            serde_json::to_vec(&json!({
                "groupName": "thinggroup/edge",
                "timestamp": 17,
                "rootComponents": { "SimpleApp": { "version": "1.0.0" } },
                "componentConfigurationUpdates": {
                    "SimpleApp": {
                        "reset": ["/newSingleLevelKey"],
                        "merge": { "singleLevelKey": "updated" }
                    }
                },
                "failureHandlingPolicy": "ROLLBACK",
                "componentUpdatePolicy": {
                    "timeoutSeconds": 30,
                    "skipNotifyComponents": ["Quiet"]
                }
            }))
            .unwrap()
            .as_slice(),
        )
        .unwrap();

        assert_eq!(doc.group_name, "thinggroup/edge");
        assert!(doc.root_components["SimpleApp"]
            .version
            .matches(&Version::new(1, 0, 0)));
        assert_eq!(
            doc.component_configuration_updates["SimpleApp"].reset,
            vec!["/newSingleLevelKey"]
        );
        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::Rollback);
        assert_eq!(doc.component_update_policy.timeout_seconds, 30);
        assert_eq!(
            doc.component_update_policy.action,
            UpdatePolicyAction::NotifyComponents
        );
    }

    #[test]
    fn test_defaults_for_minimal_document() {
        let doc =
            DeploymentDocument::from_json(br#"{"groupName": "g", "timestamp": 1}"#).unwrap();
        assert!(doc.root_components.is_empty());
        assert_eq!(doc.failure_handling_policy, FailureHandlingPolicy::Rollback);
        assert_eq!(doc.component_update_policy.timeout_seconds, 60);
        assert!(doc.deployment_id().starts_with("local-"));
    }

    #[test]
    fn test_local_override_merges_and_removes_roots() {
        let current: BTreeMap<String, String> = [
            ("CustomerApp".to_string(), "1.0.0".to_string()),
            ("YellowSignal".to_string(), "1.0.0".to_string()),
        ]
        .into();

        let request = LocalOverrideRequest {
            root_component_versions_to_add: [("RedSignal".to_string(), Version::new(1, 0, 0))]
                .into(),
            root_components_to_remove: vec!["CustomerApp".to_string()],
            ..Default::default()
        };

        let doc = request.into_document(&current, 42);
        assert_eq!(doc.group_name, LOCAL_GROUP);
        let names: Vec<&str> = doc.root_components.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["RedSignal", "YellowSignal"]);
    }
}
