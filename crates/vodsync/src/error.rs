use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VodsyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    #[error("Discovery error: {0}")]
    Source(#[from] crate::source::SourceError),

    #[error("Download error: {0}")]
    Fetch(#[from] crate::download::FetchError),

    #[error("Upload error: {0}")]
    Publish(#[from] crate::upload::PublishError),

    #[error("Authorization error: {0}")]
    Auth(#[from] crate::auth::AuthError),

    #[error("Replay error: {0}")]
    Stream(#[from] crate::replay::StreamError),

    #[error("Unknown VOD: {0}")]
    UnknownVod(i64),

    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Failed to parse config YAML: {0}")]
    ParseYaml(#[from] serde_yaml::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// How a failed unit of pipeline work should be treated.
///
/// Only `Transient` failures consume the retry budget; the other kinds
/// move the VOD straight to `failed` and are recorded in
/// `progress.failure_kind` so an operator can tell "re-run" apart from
/// "re-authorize".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network resets, 5xx, timeouts, rate limits.
    Transient,
    /// Missing or rejected credentials.
    Auth,
    /// Quota exhausted, malformed request, missing source media.
    Terminal,
    /// Transient failures that ran out of retry budget.
    Exhausted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transient => "transient",
            FailureKind::Auth => "auth",
            FailureKind::Terminal => "terminal",
            FailureKind::Exhausted => "exhausted",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureKind::Transient)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type Result<T> = std::result::Result<T, VodsyncError>;
