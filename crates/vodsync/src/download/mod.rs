//! Media acquisition.
//!
//! A [`MediaFetcher`] opens a (possibly ranged) byte stream for a VOD's
//! media; the [`DownloadWorker`] drives it through the
//! `queued -> downloading -> downloaded` part of the state machine.

pub mod http;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::db::vod_repo::Vod;
use crate::error::FailureKind;

pub use http::HttpMediaFetcher;
pub use worker::{DownloadSettings, DownloadWorker};

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Media request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Media server returned HTTP {status}")]
    Status { status: u16 },

    #[error("No media data received for {0:?}")]
    Stalled(Duration),

    #[error("Media file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected media response: {0}")]
    Protocol(String),

    #[error("Media body ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },

    #[error("No media URL configured (download.media_url_template is empty)")]
    NoMediaUrl,
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::Status { status } => classify_status(*status),
            FetchError::NoMediaUrl => FailureKind::Terminal,
            FetchError::Http(_)
            | FetchError::Stalled(_)
            | FetchError::Io(_)
            | FetchError::Protocol(_)
            | FetchError::Incomplete { .. } => FailureKind::Transient,
        }
    }
}

/// 5xx, request timeout and rate limiting are worth retrying. Any other
/// status (404/410 for a deleted VOD included) will not improve.
fn classify_status(status: u16) -> FailureKind {
    match status {
        408 | 429 | 500..=599 => FailureKind::Transient,
        _ => FailureKind::Terminal,
    }
}

/// How the server answered a request for bytes from an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyStart {
    /// The body continues at the requested offset.
    Resumed,
    /// The server ignored the range; the body starts at byte 0.
    Restarted,
    /// Nothing is left past the offset: the partial file is the whole media.
    Complete,
    /// The offset is beyond the media; the partial file cannot be trusted.
    Unsatisfiable,
}

pub struct MediaBody {
    pub start: BodyStart,
    /// Size of the complete media, when the server reported it.
    pub total_bytes: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl std::fmt::Debug for MediaBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaBody")
            .field("start", &self.start)
            .field("total_bytes", &self.total_bytes)
            .finish_non_exhaustive()
    }
}

/// Range-capable media download API.
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    /// Opens the media at `url`, asking for bytes from `offset` on when
    /// `offset > 0`.
    async fn open(&self, url: &str, offset: u64) -> Result<MediaBody, FetchError>;
}

/// Fills `{source_vod_id}` and `{vod_id}` in the media URL template.
pub fn render_media_url(template: &str, vod: &Vod) -> Result<String, FetchError> {
    if template.trim().is_empty() {
        return Err(FetchError::NoMediaUrl);
    }
    Ok(template
        .replace("{source_vod_id}", &vod.source_vod_id)
        .replace("{vod_id}", &vod.id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample_vod() -> Vod {
        Vod {
            id: 42,
            source_vod_id: "2001".to_string(),
            channel: "somechannel".to_string(),
            title: "Sunday".to_string(),
            broadcast_start: Utc.with_ymd_and_hms(2025, 10, 19, 10, 0, 0).unwrap(),
            duration_seconds: 3600,
            created_at: Utc.with_ymd_and_hms(2025, 10, 19, 11, 0, 0).unwrap(),
            processed: false,
            published_url: None,
        }
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(FetchError::Status { status: 503 }.kind(), FailureKind::Transient);
        assert_eq!(FetchError::Status { status: 429 }.kind(), FailureKind::Transient);
        assert_eq!(FetchError::Status { status: 408 }.kind(), FailureKind::Transient);
        assert_eq!(FetchError::Status { status: 404 }.kind(), FailureKind::Terminal);
        assert_eq!(FetchError::Status { status: 403 }.kind(), FailureKind::Terminal);
    }

    #[test]
    fn test_io_and_stall_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert_eq!(FetchError::from(io).kind(), FailureKind::Transient);
        assert_eq!(
            FetchError::Stalled(Duration::from_secs(60)).kind(),
            FailureKind::Transient
        );
        assert_eq!(
            FetchError::Incomplete { received: 1, expected: 2 }.kind(),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_render_media_url() {
        let url = render_media_url("https://media.example/{source_vod_id}/{vod_id}.mp4", &sample_vod())
            .unwrap();
        assert_eq!(url, "https://media.example/2001/42.mp4");
    }

    #[test]
    fn test_render_media_url_requires_template() {
        let err = render_media_url("  ", &sample_vod()).unwrap_err();
        assert!(matches!(err, FetchError::NoMediaUrl));
        assert_eq!(err.kind(), FailureKind::Terminal);
    }
}
