//! Broadcast discovery.
//!
//! A [`BroadcastSource`] lists broadcasts that have ended; the
//! [`IngestScheduler`] turns the new ones into queued VODs.

pub mod helix;
pub mod scheduler;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::db::DatabaseError;

pub use helix::HelixSource;
pub use scheduler::{IngestReport, IngestScheduler};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Discovery request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Discovery API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Malformed discovery response: {0}")]
    Malformed(String),

    #[error("Discovery credentials unavailable: {0}")]
    Credentials(String),

    #[error("Failed to record discovered broadcast: {0}")]
    Database(#[from] DatabaseError),
}

/// A finished broadcast as reported by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct EndedBroadcast {
    pub source_vod_id: String,
    pub channel: String,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub duration_seconds: i64,
}

impl EndedBroadcast {
    pub fn ended_at(&self) -> DateTime<Utc> {
        self.started_at + Duration::seconds(self.duration_seconds)
    }
}

/// Metadata API listing a channel's ended broadcasts.
#[async_trait]
pub trait BroadcastSource: Send + Sync {
    /// Broadcasts that ended after `since` (all known ones when `None`).
    /// Broadcasts still live must not be returned.
    async fn ended_broadcasts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EndedBroadcast>, SourceError>;
}
