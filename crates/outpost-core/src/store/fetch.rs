//! The artifact collaborator seam.
//!
//! Cloud transport, credentials and endpoints live outside the core; the
//! store and resolver only see this trait. Implementations must be safe to
//! call concurrently; the store serializes fetches per component identity
//! on its side.

use std::time::Duration;

use async_trait::async_trait;
use semver::Version;
use tracing::warn;

use crate::component::{ArtifactDescriptor, ComponentIdentifier};

/// Errors surfaced by an artifact source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// No version of the component exists at the source.
    #[error("component '{0}' not found at the artifact source")]
    ComponentNotFound(String),

    /// The requested version is unknown to the source.
    #[error("version {0} not available at the artifact source")]
    VersionNotFound(ComponentIdentifier),

    /// Download failed. Transient failures are retried by the store.
    #[error("download failed for {context}: {message}")]
    Download {
        /// What was being downloaded.
        context: String,
        /// Failure detail.
        message: String,
        /// Whether a retry may succeed.
        transient: bool,
    },
}

impl FetchError {
    /// Whether a retry of the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Download { transient: true, .. })
    }
}

/// Remote provider of recipes and artifacts.
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Versions of `name` available remotely, unordered.
    async fn list_versions(&self, name: &str) -> Result<Vec<Version>, FetchError>;

    /// Raw recipe bytes for an exact component version.
    async fn fetch_recipe(&self, id: &ComponentIdentifier) -> Result<Vec<u8>, FetchError>;

    /// Raw bytes of one declared artifact.
    async fn fetch_artifact(
        &self,
        id: &ComponentIdentifier,
        artifact: &ArtifactDescriptor,
    ) -> Result<Vec<u8>, FetchError>;
}

/// Bounded retry policy for transient download failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,

    /// Delay before the second attempt; doubles per retry.
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            initial_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails terminally, or attempts are
    /// exhausted.
    ///
    /// # Errors
    ///
    /// Returns the last [`FetchError`] once retries are exhausted, or the
    /// first non-transient error immediately.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, FetchError>>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    warn!(attempt, error = %err, "transient download failure, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                },
                Err(err) => return Err(err),
            }
        }
    }
}
