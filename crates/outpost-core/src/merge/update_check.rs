//! Pre-update notification and deferral voting.
//!
//! Before stopping or reconfiguring a component, the merge engine
//! publishes a `PreComponentUpdate` event and collects deferral votes for
//! a bounded window. Deferral is a cooperative hint, not a veto: the merge
//! is rescheduled once after the largest returned interval, then proceeds.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

/// Event published before a component is stopped or reconfigured.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PreComponentUpdate {
    /// Deployment about to touch the component.
    pub deployment_id: String,

    /// Component about to be updated.
    pub component: String,
}

/// A deferral vote from a running component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeferComponentUpdate {
    /// Deployment the vote responds to.
    pub deployment_id: String,

    /// Component voting to defer its own update.
    pub component: String,

    /// Requested postponement. Zero acknowledges immediately.
    pub recheck_after_ms: u64,
}

/// Channel hub between the merge engine and lifecycle subscribers.
///
/// Subscribers receive events through [`subscribe`]; they vote through the
/// sender returned by [`deferral_sender`]. The merge engine owns the
/// receiving half and drains it inside [`collect_deferrals`].
///
/// [`subscribe`]: UpdateNotifier::subscribe
/// [`deferral_sender`]: UpdateNotifier::deferral_sender
/// [`collect_deferrals`]: UpdateNotifier::collect_deferrals
pub struct UpdateNotifier {
    events: broadcast::Sender<PreComponentUpdate>,
    deferral_tx: mpsc::UnboundedSender<DeferComponentUpdate>,
    deferral_rx: Mutex<mpsc::UnboundedReceiver<DeferComponentUpdate>>,
}

impl Default for UpdateNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateNotifier {
    /// Create a notifier with no subscribers yet.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        let (deferral_tx, deferral_rx) = mpsc::unbounded_channel();
        Self {
            events,
            deferral_tx,
            deferral_rx: Mutex::new(deferral_rx),
        }
    }

    /// Subscribe to pre-update events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PreComponentUpdate> {
        self.events.subscribe()
    }

    /// Sender used by subscribers to vote a deferral.
    #[must_use]
    pub fn deferral_sender(&self) -> mpsc::UnboundedSender<DeferComponentUpdate> {
        self.deferral_tx.clone()
    }

    /// Whether anyone is listening for pre-update events.
    #[must_use]
    pub fn has_subscribers(&self) -> bool {
        self.events.receiver_count() > 0
    }

    /// Publish a `PreComponentUpdate` for every component and collect the
    /// deferral votes arriving within `window`.
    ///
    /// With no subscribers the vote is skipped entirely. Stale votes (for
    /// other deployments or components outside this update) are discarded.
    pub async fn collect_deferrals(
        &self,
        deployment_id: &str,
        components: &[String],
        window: Duration,
    ) -> Vec<DeferComponentUpdate> {
        if !self.has_subscribers() {
            debug!("no update-check subscribers, skipping vote");
            return Vec::new();
        }

        for component in components {
            let _ = self.events.send(PreComponentUpdate {
                deployment_id: deployment_id.to_string(),
                component: component.clone(),
            });
        }

        let mut votes = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        let mut rx = self.deferral_rx.lock().await;

        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(vote)) => {
                    if vote.deployment_id == deployment_id
                        && components.contains(&vote.component)
                        && vote.recheck_after_ms > 0
                    {
                        votes.push(vote);
                        // every notified component has voted; no need to
                        // wait out the rest of the window
                        if votes.len() >= components.len() {
                            break;
                        }
                    }
                },
                Ok(None) | Err(_) => break,
            }
        }

        votes
    }
}
