//! Error taxonomy and the fault channel
//!
//! Failures that reach a caller are returned as [`BridgeError`]. Failures that
//! happen on fire-and-forget paths (scheduled publishes, platform callbacks,
//! cleanup) never propagate, so they are logged and broadcast as [`Fault`]s
//! instead; subscribers (tests, a UI) can observe them via
//! `BridgeHandle::faults()`.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Connection to MQTT broker failed: {cause}")]
    Connectivity { cause: String },
    #[error("Not connected to MQTT")]
    NotConnected,
    #[error("Failed to publish to {topic}: {message}")]
    Publish { topic: String, message: String },
    #[error("Subscription to {family} notifications failed: {message}")]
    SubscriptionSetup { family: String, message: String },
    #[error("Unregistering {family} notifications failed: {message}")]
    Unsubscribe { family: String, message: String },
    #[error("Settings error: {0}")]
    Settings(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Bridge task is no longer running")]
    ActorGone,
}

impl BridgeError {
    pub fn connectivity(cause: impl Into<String>) -> Self {
        Self::Connectivity {
            cause: cause.into(),
        }
    }

    pub fn publish(topic: impl Into<String>, message: impl ToString) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Connectivity,
    /// Publishing while disconnected; expected, not an error.
    PublishSkipped,
    PublishFailed,
    SubscriptionSetup,
    Unsubscribe,
    Sampling,
    Settings,
}

#[derive(Debug, Clone, Serialize)]
pub struct Fault {
    pub kind: FaultKind,
    pub detail: String,
}

/// Log sink + broadcast sender for faults
#[derive(Debug, Clone)]
pub struct FaultReporter {
    tx: broadcast::Sender<Fault>,
}

impl FaultReporter {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(128);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Fault> {
        self.tx.subscribe()
    }

    pub fn report(&self, kind: FaultKind, detail: impl Into<String>) {
        let detail = detail.into();
        match kind {
            FaultKind::PublishSkipped => debug!(?kind, %detail, "publish skipped"),
            _ => warn!(?kind, %detail, "bridge fault"),
        }
        // nobody listening is fine
        let _ = self.tx.send(Fault { kind, detail });
    }
}

impl Default for FaultReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = BridgeError::connectivity("connection refused");
        assert_eq!(
            err.to_string(),
            "Connection to MQTT broker failed: connection refused"
        );
        assert_eq!(BridgeError::NotConnected.to_string(), "Not connected to MQTT");
    }

    #[tokio::test]
    async fn test_fault_broadcast() {
        let reporter = FaultReporter::new();
        let mut rx = reporter.subscribe();
        reporter.report(FaultKind::PublishFailed, "steamdeck/deck/telemetry/disk");

        let fault = rx.recv().await.unwrap();
        assert_eq!(fault.kind, FaultKind::PublishFailed);
        assert!(fault.detail.contains("telemetry/disk"));
    }

    #[test]
    fn test_report_without_subscribers() {
        FaultReporter::new().report(FaultKind::Sampling, "no battery");
    }
}
