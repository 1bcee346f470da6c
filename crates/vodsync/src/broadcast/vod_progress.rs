//! Pipeline progress broadcaster for live dashboards.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What just happened to a VOD.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Queued,
    Downloading,
    Downloaded,
    Correlated,
    Uploading,
    Uploaded,
    Retrying,
    Failed,
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressPhase::Queued => write!(f, "Queued"),
            ProgressPhase::Downloading => write!(f, "Downloading"),
            ProgressPhase::Downloaded => write!(f, "Downloaded"),
            ProgressPhase::Correlated => write!(f, "Chat correlated"),
            ProgressPhase::Uploading => write!(f, "Uploading"),
            ProgressPhase::Uploaded => write!(f, "Uploaded"),
            ProgressPhase::Retrying => write!(f, "Retrying"),
            ProgressPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Progress event for a VOD.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VodProgressEvent {
    #[serde(rename = "vodID")]
    pub vod_id: i64,
    pub phase: ProgressPhase,
    /// Human-readable description of the current activity.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    /// Bytes transferred so far in the current attempt.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl VodProgressEvent {
    pub fn new(vod_id: i64, phase: ProgressPhase, message: &str) -> Self {
        Self {
            vod_id,
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
            percent: None,
            bytes: None,
            total_bytes: None,
            retries: None,
            error: None,
        }
    }

    /// Byte-level transfer progress within a download or upload.
    pub fn transfer(vod_id: i64, phase: ProgressPhase, bytes: u64, total_bytes: Option<u64>) -> Self {
        let percent = total_bytes
            .filter(|t| *t > 0)
            .map(|t| (bytes as f64 / t as f64 * 100.0).min(100.0));
        Self {
            bytes: Some(bytes),
            total_bytes,
            percent,
            ..Self::new(vod_id, phase, &phase.to_string())
        }
    }

    pub fn retrying(vod_id: i64, retries: u32, error: &str) -> Self {
        Self {
            retries: Some(retries),
            error: Some(error.to_string()),
            ..Self::new(vod_id, ProgressPhase::Retrying, "Transient failure, backing off")
        }
    }

    pub fn failed(vod_id: i64, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(vod_id, ProgressPhase::Failed, "Processing failed")
        }
    }
}

/// Broadcasts VOD progress events to any number of subscribers.
#[derive(Clone)]
pub struct VodProgressBroadcaster {
    sender: Arc<broadcast::Sender<VodProgressEvent>>,
}

impl VodProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event. Having no subscribers is fine.
    pub fn send(&self, event: VodProgressEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VodProgressEvent> {
        self.sender.subscribe()
    }

    /// Starts tracking one VOD.
    pub fn track(&self, vod_id: i64) -> VodProgressTracker {
        VodProgressTracker {
            vod_id,
            sender: Arc::clone(&self.sender),
        }
    }
}

impl Default for VodProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Emits events for a single VOD.
#[derive(Clone)]
pub struct VodProgressTracker {
    vod_id: i64,
    sender: Arc<broadcast::Sender<VodProgressEvent>>,
}

impl VodProgressTracker {
    pub fn phase(&self, phase: ProgressPhase, message: &str) {
        let _ = self
            .sender
            .send(VodProgressEvent::new(self.vod_id, phase, message));
    }

    pub fn transfer(&self, phase: ProgressPhase, bytes: u64, total_bytes: Option<u64>) {
        let _ = self
            .sender
            .send(VodProgressEvent::transfer(self.vod_id, phase, bytes, total_bytes));
    }

    pub fn retrying(&self, retries: u32, error: &str) {
        let _ = self
            .sender
            .send(VodProgressEvent::retrying(self.vod_id, retries, error));
    }

    pub fn failed(&self, error: &str) {
        let _ = self.sender.send(VodProgressEvent::failed(self.vod_id, error));
    }
}
