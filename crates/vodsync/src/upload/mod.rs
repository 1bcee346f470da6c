//! Publishing downloaded VODs to the video platform.
//!
//! A [`Publisher`] performs one upload attempt with a given access token;
//! the [`UploadWorker`] drives `downloaded -> uploading -> uploaded`,
//! obtaining tokens from the [`TokenManager`](crate::auth::TokenManager)
//! before every attempt.

pub mod resumable;
pub mod worker;

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;

use crate::broadcast::VodProgressTracker;
use crate::db::vod_repo::Vod;
use crate::error::FailureKind;

pub use resumable::ResumableUploader;
pub use worker::{UploadSettings, UploadWorker};

/// Platform limits on metadata length, in characters.
const MAX_TITLE_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 5000;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Upload API returned {status}{}: {body}", reason_suffix(.reason))]
    Status {
        status: u16,
        /// Machine-readable reason from the error payload, e.g. `quotaExceeded`.
        reason: Option<String>,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("Downloaded file '{0}' is missing")]
    MissingFile(PathBuf),

    #[error("Downloaded file '{0}' is empty")]
    EmptyFile(PathBuf),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Unexpected upload response: {0}")]
    Protocol(String),
}

impl PublishError {
    pub fn kind(&self) -> FailureKind {
        match self {
            PublishError::Status { status, reason, .. } => classify_status(*status, reason.as_deref()),
            PublishError::MissingFile(_) | PublishError::EmptyFile(_) => FailureKind::Terminal,
            PublishError::Http(_) | PublishError::Io { .. } | PublishError::Protocol(_) => {
                FailureKind::Transient
            }
        }
    }

    /// Minimum wait requested by the server before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PublishError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason
        .as_deref()
        .map(|r| format!(" ({})", r))
        .unwrap_or_default()
}

fn classify_status(status: u16, reason: Option<&str>) -> FailureKind {
    match status {
        408 | 429 | 500..=599 => FailureKind::Transient,
        401 => FailureKind::Auth,
        403 => match reason {
            Some("quotaExceeded" | "uploadLimitExceeded") => FailureKind::Terminal,
            Some("rateLimitExceeded" | "userRateLimitExceeded") => FailureKind::Transient,
            _ => FailureKind::Auth,
        },
        _ => FailureKind::Terminal,
    }
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Debug, Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

/// Pulls `error.errors[0].reason` out of a Google API error body.
pub fn error_reason(body: &str) -> Option<String> {
    let payload: ErrorPayload = serde_json::from_str(body).ok()?;
    payload.error.errors.into_iter().find_map(|e| e.reason)
}

/// Everything needed to publish one file.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub vod_id: i64,
    pub path: PathBuf,
    pub title: String,
    pub description: String,
    pub privacy_status: String,
    pub category_id: String,
}

/// Authenticated video upload API.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Uploads the file and returns the platform's video id.
    async fn publish(
        &self,
        request: &PublishRequest,
        access_token: &SecretString,
        tracker: &VodProgressTracker,
    ) -> Result<String, PublishError>;
}

/// Fills `{title}`, `{channel}`, `{date}` and `{source_vod_id}`.
pub fn render_template(template: &str, vod: &Vod) -> String {
    template
        .replace("{title}", &vod.title)
        .replace("{channel}", &vod.channel)
        .replace("{date}", &vod.broadcast_start.format("%Y-%m-%d").to_string())
        .replace("{source_vod_id}", &vod.source_vod_id)
}

pub(crate) fn truncate_chars(value: &str, max: usize) -> String {
    match value.char_indices().nth(max) {
        Some((idx, _)) => value[..idx].to_string(),
        None => value.to_string(),
    }
}

pub(crate) fn limit_title(title: &str) -> String {
    // Angle brackets are rejected in titles.
    let cleaned: String = title.chars().filter(|c| *c != '<' && *c != '>').collect();
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        return "Untitled broadcast".to_string();
    }
    truncate_chars(cleaned, MAX_TITLE_CHARS)
}

pub(crate) fn limit_description(description: &str) -> String {
    truncate_chars(description, MAX_DESCRIPTION_CHARS)
}
