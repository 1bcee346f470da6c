//! Test harness for isolated pipeline runs.
//!
//! Every harness owns its own in-memory database and temp media directory,
//! and builds workers with millisecond backoff so retry scenarios finish
//! quickly.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use vodsync::auth::{OAuthClient, StoredToken, TokenManager, TokenStore};
use vodsync::db::chat_repo::{self, NewChatMessage};
use vodsync::db::progress_repo::{self, Progress, ProgressView};
use vodsync::db::vod_repo::{self, NewVod, Vod};
use vodsync::download::{DownloadSettings, DownloadWorker, MediaFetcher};
use vodsync::replay::{ReplayService, ReplaySettings};
use vodsync::source::{BroadcastSource, IngestScheduler};
use vodsync::upload::{Publisher, UploadSettings, UploadWorker};
use vodsync::{BackoffPolicy, ChatNotifier, Correlator, Database, VodProgressBroadcaster, WorkerOptions};

pub const PROVIDER: &str = "youtube";
pub const MAX_RETRIES: u32 = 5;

/// Broadcast start used by every scenario.
pub fn broadcast_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 19, 10, 0, 0).unwrap()
}

/// Isolated environment for integration tests.
pub struct TestHarness {
    temp_dir: TempDir,
    pub media_dir: PathBuf,
    pub db: Database,
    pub progress: VodProgressBroadcaster,
    pub notifier: ChatNotifier,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let media_dir = temp_dir.path().join("media");
        Self {
            temp_dir,
            media_dir,
            db: Database::open_in_memory().expect("Failed to create test database"),
            progress: VodProgressBroadcaster::default(),
            notifier: ChatNotifier::default(),
        }
    }

    pub fn insert_vod(&self, source_vod_id: &str) -> i64 {
        let vod = NewVod {
            source_vod_id: source_vod_id.to_string(),
            channel: "somechannel".to_string(),
            title: format!("Broadcast {}", source_vod_id),
            broadcast_start: broadcast_start(),
            duration_seconds: 3600,
        };
        vod_repo::insert_if_absent(&self.db, &vod, Utc::now())
            .expect("Failed to insert VOD")
            .expect("VOD already present")
    }

    pub fn insert_chat(&self, vod_id: i64, username: &str, abs_timestamp: &str) -> i64 {
        chat_repo::insert_message(
            &self.db,
            &NewChatMessage {
                vod_id,
                username: username.to_string(),
                message: format!("message from {}", username),
                abs_timestamp: abs_timestamp.to_string(),
                badges: "subscriber/12".to_string(),
                emotes: String::new(),
                color: Some("#FF4500".to_string()),
            },
        )
        .expect("Failed to insert chat message")
    }

    pub fn correlator(&self) -> Correlator {
        Correlator::new(self.db.clone(), self.notifier.clone(), self.progress.clone())
    }

    pub fn scheduler(&self, source: Arc<dyn BroadcastSource>) -> IngestScheduler {
        IngestScheduler::new(
            self.db.clone(),
            source,
            "somechannel",
            Duration::from_secs(60),
            self.progress.clone(),
        )
    }

    pub fn download_worker(&self, fetcher: Arc<dyn MediaFetcher>) -> DownloadWorker {
        DownloadWorker::new(
            self.db.clone(),
            fetcher,
            self.correlator(),
            self.progress.clone(),
            fast_backoff(),
            options("download-test"),
            DownloadSettings {
                directory: self.media_dir.clone(),
                media_url_template: "https://media.example/vods/{source_vod_id}.mp4".to_string(),
                max_retries: MAX_RETRIES,
                progress_interval: Duration::ZERO,
                chunk_timeout: Duration::from_secs(5),
            },
        )
    }

    pub fn upload_worker(&self, publisher: Arc<dyn Publisher>, tokens: TokenManager) -> UploadWorker {
        UploadWorker::new(
            self.db.clone(),
            publisher,
            Arc::new(tokens),
            self.correlator(),
            self.progress.clone(),
            fast_backoff(),
            options("upload-test"),
            UploadSettings {
                max_retries: MAX_RETRIES,
                title_template: "{title}".to_string(),
                description_template: "Recorded {date} on {channel}".to_string(),
                privacy_status: "unlisted".to_string(),
                category_id: "20".to_string(),
                published_url_template: "https://www.youtube.com/watch?v={id}".to_string(),
            },
        )
    }

    /// Seeds `store` with a token expiring at `expiry` and wraps it in a
    /// manager with a two minute refresh margin.
    pub async fn token_manager(
        &self,
        store: Arc<dyn TokenStore>,
        client: Arc<dyn OAuthClient>,
        expiry: DateTime<Utc>,
    ) -> TokenManager {
        let seed = StoredToken {
            access_token: "at-stored".to_string(),
            refresh_token: "rt-stored".to_string(),
            expiry,
            raw: String::new(),
        };
        store
            .upsert_token(PROVIDER, &seed.access_token, &seed.refresh_token, seed.expiry, &seed.raw)
            .await
            .expect("Failed to seed token");
        TokenManager::new(store, client, PROVIDER, chrono::Duration::seconds(120))
    }

    pub fn replay(&self, buffer_size: usize, page_size: u32) -> ReplayService {
        ReplayService::new(
            self.db.clone(),
            self.notifier.clone(),
            ReplaySettings {
                poll_interval: Duration::from_millis(20),
                buffer_size,
                page_size,
                slow_client_timeout: Duration::from_secs(5),
            },
        )
    }

    pub fn progress_row(&self, vod_id: i64) -> Progress {
        progress_repo::find(&self.db, vod_id)
            .expect("Failed to load progress")
            .expect("No progress row")
    }

    pub fn view(&self, vod_id: i64) -> ProgressView {
        progress_repo::view(&self.db, vod_id)
            .expect("Failed to load progress view")
            .expect("No progress view")
    }

    pub fn vod(&self, vod_id: i64) -> Vod {
        vod_repo::find_by_id(&self.db, vod_id)
            .expect("Failed to load VOD")
            .expect("No VOD")
    }

    /// Asserts that `processed` and `published_url` agree.
    pub fn assert_published_consistent(&self, vod_id: i64) {
        let vod = self.vod(vod_id);
        let has_url = vod.published_url.as_deref().map(|u| !u.is_empty()).unwrap_or(false);
        assert_eq!(
            vod.processed, has_url,
            "VOD {} processed={} but published_url={:?}",
            vod_id, vod.processed, vod.published_url
        );
    }
}

pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 0.0)
}

pub fn options(owner: &str) -> WorkerOptions {
    WorkerOptions {
        owner: owner.to_string(),
        lease: chrono::Duration::seconds(120),
        poll_interval: Duration::from_millis(10),
        batch_size: 8,
    }
}

pub fn never_cancelled() -> CancellationToken {
    CancellationToken::new()
}
