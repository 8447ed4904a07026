//! Local control-plane messages and wire framing.
//!
//! The daemon listens on a Unix socket; messages are length-prefixed
//! (4-byte big-endian) JSON frames. Every request is idempotent on its
//! stated key. A `SubscribeToComponentUpdates` request switches the
//! connection into streaming mode: the server pushes
//! [`PreComponentUpdate`] frames and accepts [`DeferComponentUpdate`]
//! frames until the peer disconnects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deployment::{DeploymentStatus, LocalOverrideRequest};
use crate::lifecycle::ServiceState;
use crate::merge::{DeferComponentUpdate, PreComponentUpdate};

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Requests accepted by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcRequest {
    /// Details of one component.
    GetComponentDetails {
        /// Component name.
        name: String,
    },

    /// All non-`main` components.
    ListComponents,

    /// Restart a component.
    RestartComponent {
        /// Component name.
        name: String,
    },

    /// Stop a component.
    StopComponent {
        /// Component name.
        name: String,
    },

    /// Preload the store from local recipe/artifact directories.
    UpdateRecipesAndArtifacts {
        /// Directory of recipe files.
        recipe_dir: String,
        /// Directory laid out `<name>/<version>/<files>`, when artifacts
        /// accompany the recipes.
        artifact_dir: Option<String>,
    },

    /// Queue a local deployment.
    CreateLocalDeployment(LocalOverrideRequest),

    /// Status of one queued or finished local deployment.
    GetLocalDeploymentStatus {
        /// Identifier returned by `CreateLocalDeployment`.
        deployment_id: String,
    },

    /// History of local deployments.
    ListLocalDeployments,

    /// Switch this connection into the lifecycle event stream.
    SubscribeToComponentUpdates,

    /// A deferral vote (valid on a subscribed connection).
    DeferComponentUpdate(DeferComponentUpdate),
}

/// Error codes carried by [`IpcResponse::Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No such component or deployment.
    NotFound,

    /// The request was malformed or arrived out of context.
    InvalidRequest,

    /// The operation failed inside the daemon.
    Internal,
}

/// State and configuration of one component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentDetails {
    /// Component name.
    pub name: String,

    /// Deployed version, when known.
    pub version: Option<String>,

    /// Current lifecycle state.
    pub state: ServiceState,

    /// Resolved component configuration.
    pub configuration: Value,
}

/// Lifecycle of a local deployment in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LocalDeploymentState {
    /// Accepted, not yet started.
    Queued,

    /// Currently applying.
    InProgress,

    /// Finished successfully.
    Succeeded,

    /// Finished unsuccessfully.
    Failed,
}

/// One entry of the local deployment history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalDeploymentRecord {
    /// Deployment identifier.
    pub deployment_id: String,

    /// Queue state.
    pub state: LocalDeploymentState,

    /// Terminal status, once finished.
    pub status: Option<DeploymentStatus>,

    /// Failure detail, when any.
    pub detail: Option<String>,

    /// When the deployment was accepted.
    pub created_at: DateTime<Utc>,
}

/// Responses and streamed events sent by the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum IpcResponse {
    /// Generic success.
    Ok,

    /// Details of one component.
    ComponentDetails(ComponentDetails),

    /// All non-`main` components.
    ComponentList(Vec<ComponentDetails>),

    /// Identifier of a freshly queued local deployment.
    LocalDeploymentQueued {
        /// The new deployment's identifier.
        deployment_id: String,
    },

    /// Status of one local deployment.
    LocalDeploymentStatus(LocalDeploymentRecord),

    /// Local deployment history, newest first.
    LocalDeployments(Vec<LocalDeploymentRecord>),

    /// The connection is now a lifecycle event stream.
    Subscribed,

    /// Streamed pre-update event.
    ComponentUpdateEvent(PreComponentUpdate),

    /// Request failed.
    Error {
        /// Machine-readable code.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
}

/// Frame a payload with its 4-byte big-endian length prefix.
#[must_use]
pub fn frame_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&u32::try_from(payload.len()).unwrap_or(u32::MAX).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

/// Parse a length prefix. Returns `None` for short buffers or lengths
/// beyond [`MAX_FRAME_SIZE`].
#[must_use]
pub fn parse_frame_length(buf: &[u8]) -> Option<usize> {
    let bytes: [u8; 4] = buf.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(bytes) as usize;
    (len <= MAX_FRAME_SIZE).then_some(len)
}
