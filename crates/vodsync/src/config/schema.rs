use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level daemon configuration. Every section falls back to defaults,
/// so an empty file is a valid (if not very useful) config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub source: SourceConfig,
    pub download: DownloadConfig,
    pub upload: UploadConfig,
    pub oauth: OAuthConfig,
    pub backoff: BackoffConfig,
    pub workers: WorkersConfig,
    pub replay: ReplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Defaults to `~/.vodsync/data/vodsync.db`.
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path.clone().or_else(crate::db::default_database_path)
    }
}

/// Broadcast discovery (Twitch Helix).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Channel login name, used for logging and the watermark key.
    pub channel: String,
    /// Numeric broadcaster id queried for archives.
    pub user_id: String,
    pub api_base_url: String,
    /// App-access-token endpoint (client credentials grant).
    pub token_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub client_secret_file: Option<String>,
    pub client_secret_env: Option<String>,
    pub poll_interval_secs: u64,
    /// Maximum archives fetched per discovery pass.
    pub page_size: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            channel: String::new(),
            user_id: String::new(),
            api_base_url: "https://api.twitch.tv/helix".to_string(),
            token_url: "https://id.twitch.tv/oauth2/token".to_string(),
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            client_secret_env: None,
            poll_interval_secs: 300,
            page_size: 20,
        }
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Where partial and finished media files live.
    pub directory: PathBuf,
    /// Media URL with `{source_vod_id}` and/or `{vod_id}` placeholders.
    pub media_url_template: String,
    pub max_retries: u32,
    /// Minimum spacing between persisted progress writes.
    pub progress_interval_secs: u64,
    /// Abort an attempt when no bytes arrive for this long.
    pub chunk_timeout_secs: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            directory: dirs::home_dir()
                .map(|h| h.join(".vodsync").join("media"))
                .unwrap_or_else(|| PathBuf::from("media")),
            media_url_template: String::new(),
            max_retries: 5,
            progress_interval_secs: 2,
            chunk_timeout_secs: 60,
        }
    }
}

impl DownloadConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Key of the token in the token store.
    pub provider: String,
    /// Resumable upload session endpoint.
    pub upload_url: String,
    pub privacy_status: String,
    /// `{title}`, `{channel}`, `{date}` and `{source_vod_id}` are substituted.
    pub title_template: String,
    pub description_template: String,
    pub category_id: String,
    /// `{id}` is replaced by the platform video id.
    pub published_url_template: String,
    pub max_retries: u32,
    /// Refresh the access token when it expires within this window.
    pub refresh_margin_secs: u64,
    /// Must be a multiple of 256 KiB.
    pub chunk_size_bytes: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            provider: "youtube".to_string(),
            upload_url: "https://www.googleapis.com/upload/youtube/v3/videos".to_string(),
            privacy_status: "private".to_string(),
            title_template: "{title}".to_string(),
            description_template: "Broadcast by {channel} on {date}.".to_string(),
            category_id: "20".to_string(),
            published_url_template: "https://www.youtube.com/watch?v={id}".to_string(),
            max_retries: 5,
            refresh_margin_secs: 120,
            chunk_size_bytes: 8 * 1024 * 1024,
        }
    }
}

impl UploadConfig {
    pub fn refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.refresh_margin_secs.min(i64::MAX as u64) as i64)
    }
}

/// OAuth2 client for the upload platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub client_secret_file: Option<String>,
    pub client_secret_env: Option<String>,
    pub token_url: String,
    pub authorize_url: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: None,
            client_secret_file: None,
            client_secret_env: None,
            token_url: "https://oauth2.googleapis.com/token".to_string(),
            authorize_url: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            redirect_uri: "http://127.0.0.1:8080/oauth/callback".to_string(),
            scopes: vec!["https://www.googleapis.com/auth/youtube.upload".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub cap_secs: u64,
    /// Relative jitter in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_secs: 5,
            cap_secs: 300,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    /// How often idle workers look for claimable VODs.
    pub poll_interval_secs: u64,
    /// Lease length; an unrenewed claim becomes reclaimable after this.
    pub lease_secs: u64,
    /// Identity written into leases. Defaults to a random id per process.
    pub owner_id: Option<String>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            lease_secs: 120,
            owner_id: None,
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_secs.min(i64::MAX as u64) as i64)
    }

    pub fn resolved_owner_id(&self) -> String {
        self.owner_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| format!("vodsyncd-{}", uuid::Uuid::new_v4()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub bind: String,
    pub poll_interval_ms: u64,
    /// Events buffered per client.
    pub buffer_size: usize,
    /// How long a full buffer may stay full before the client is dropped.
    pub slow_client_timeout_ms: u64,
    pub keep_alive_secs: u64,
    /// Rows fetched per database read.
    pub page_size: u32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            poll_interval_ms: 1000,
            buffer_size: 256,
            slow_client_timeout_ms: 10_000,
            keep_alive_secs: 15,
            page_size: 500,
        }
    }
}

impl ReplayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn slow_client_timeout(&self) -> Duration {
        Duration::from_millis(self.slow_client_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directives; `RUST_LOG` wins when set.
    pub filter: Option<String>,
    pub json: bool,
}
