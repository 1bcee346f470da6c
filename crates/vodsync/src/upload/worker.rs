//! Upload stage: `downloaded -> uploading -> uploaded`.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::{limit_description, limit_title, render_template, PublishError, PublishRequest, Publisher};
use crate::auth::{AuthError, TokenManager};
use crate::backoff::BackoffPolicy;
use crate::broadcast::{ProgressPhase, VodProgressBroadcaster};
use crate::config::UploadConfig;
use crate::correlate::Correlator;
use crate::db::progress_repo::{self, Progress, Stage, VodState};
use crate::db::vod_repo::{self, Vod};
use crate::db::{Database, DatabaseError};
use crate::error::{FailureKind, Result, VodsyncError};
use crate::worker::{Attempts, Next, StageOutcome, StageProcessor, WorkerOptions};

/// Downloaded VODs re-correlated per sweep.
const SWEEP_LIMIT: u32 = 16;

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_retries: u32,
    pub title_template: String,
    pub description_template: String,
    pub privacy_status: String,
    pub category_id: String,
    /// `{id}` is replaced by the platform video id.
    pub published_url_template: String,
}

impl UploadSettings {
    pub fn from_config(config: &UploadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            title_template: config.title_template.clone(),
            description_template: config.description_template.clone(),
            privacy_status: config.privacy_status.clone(),
            category_id: config.category_id.clone(),
            published_url_template: config.published_url_template.clone(),
        }
    }

    pub fn published_url(&self, video_id: &str) -> String {
        self.published_url_template.replace("{id}", video_id)
    }

    fn request(&self, vod: &Vod, path: PathBuf) -> PublishRequest {
        PublishRequest {
            vod_id: vod.id,
            path,
            title: limit_title(&render_template(&self.title_template, vod)),
            description: limit_description(&render_template(&self.description_template, vod)),
            privacy_status: self.privacy_status.clone(),
            category_id: self.category_id.clone(),
        }
    }
}

pub struct UploadWorker {
    db: Database,
    publisher: Arc<dyn Publisher>,
    tokens: Arc<TokenManager>,
    correlator: Correlator,
    progress: VodProgressBroadcaster,
    backoff: BackoffPolicy,
    options: WorkerOptions,
    settings: UploadSettings,
}

impl UploadWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        publisher: Arc<dyn Publisher>,
        tokens: Arc<TokenManager>,
        correlator: Correlator,
        progress: VodProgressBroadcaster,
        backoff: BackoffPolicy,
        options: WorkerOptions,
        settings: UploadSettings,
    ) -> Self {
        Self {
            db,
            publisher,
            tokens,
            correlator,
            progress,
            backoff,
            options,
            settings,
        }
    }

    /// Polls and uploads until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        crate::worker::run_stage(self, &self.db, &self.options, shutdown).await
    }

    /// Processes whatever is claimable right now, after finishing any
    /// pending correlation.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        self.before_poll().await;
        crate::worker::poll_once(self, &self.db, &self.options, shutdown).await
    }

    /// Correlates chat the download stage left behind: VODs whose first
    /// pass did not finish (e.g. a crash right after the download) and
    /// messages recorded after that pass, which live replays are waiting
    /// for.
    async fn sweep_uncorrelated(&self) -> Result<()> {
        for vod_id in progress_repo::pending_correlation(&self.db, SWEEP_LIMIT)? {
            if let Err(e) = self.correlator.correlate(vod_id).await {
                log::warn!("VOD {} correlation sweep failed: {}", vod_id, e);
            }
        }
        Ok(())
    }

    /// Runs one publish call, keeping the lease alive while it is in
    /// flight.
    async fn attempt(
        &self,
        request: &PublishRequest,
        attempts: &Attempts<'_>,
        shutdown: &CancellationToken,
    ) -> Result<Attempted> {
        let token = match self.tokens.access_token(Utc::now()).await {
            Ok(token) => token,
            Err(e) => return Ok(Attempted::NoToken(e)),
        };
        let publish = self.publisher.publish(request, &token, attempts.tracker);
        tokio::pin!(publish);

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval());
        heartbeat.tick().await;
        loop {
            tokio::select! {
                result = &mut publish => {
                    return Ok(match result {
                        Ok(video_id) => Attempted::Published(video_id),
                        Err(e) => Attempted::Failed(e),
                    });
                }
                _ = shutdown.cancelled() => return Ok(Attempted::Interrupted),
                _ = heartbeat.tick() => {
                    let until = Utc::now() + self.options.lease;
                    if !progress_repo::renew_lease(&self.db, request.vod_id, &self.options.owner, until)? {
                        return Ok(Attempted::LeaseLost);
                    }
                }
            }
        }
    }

    async fn finish(&self, attempts: &Attempts<'_>, video_id: &str) -> Result<StageOutcome> {
        let url = self.settings.published_url(video_id);
        let vod_id = attempts.vod_id;
        match progress_repo::complete_upload(&self.db, vod_id, &self.options.owner, &url, Utc::now()) {
            Ok(true) => {
                log::info!("VOD {} uploading -> uploaded, published at {}", vod_id, url);
                attempts.tracker.phase(ProgressPhase::Uploaded, &url);
                Ok(StageOutcome::Completed(VodState::Uploaded))
            }
            Ok(false) => {
                log::warn!(
                    "VOD {} uploaded as {} but the lease was lost before recording it",
                    vod_id,
                    url
                );
                Ok(StageOutcome::LeaseLost)
            }
            Err(DatabaseError::Conflict(message)) => {
                Ok(attempts.fail(FailureKind::Terminal, &message)?)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// How one upload attempt ended.
enum Attempted {
    Published(String),
    Failed(PublishError),
    NoToken(AuthError),
    /// Shutdown interrupted the upload; the session is abandoned.
    Interrupted,
    LeaseLost,
}

#[async_trait]
impl StageProcessor for UploadWorker {
    fn stage(&self) -> Stage {
        Stage::Upload
    }

    async fn before_poll(&self) {
        if let Err(e) = self.sweep_uncorrelated().await {
            log::warn!("Correlation sweep failed: {}", e);
        }
    }

    async fn process(&self, claimed: Progress, shutdown: &CancellationToken) -> Result<StageOutcome> {
        let vod_id = claimed.vod_id;
        let vod = vod_repo::find_by_id(&self.db, vod_id)?.ok_or(VodsyncError::UnknownVod(vod_id))?;
        let tracker = self.progress.track(vod_id);
        let mut attempts = Attempts {
            db: &self.db,
            vod_id,
            stage: Stage::Upload,
            options: &self.options,
            max_retries: self.settings.max_retries,
            backoff: &self.backoff,
            tracker: &tracker,
            retries: claimed.retries,
        };

        let Some(path) = claimed.downloaded_path.clone() else {
            return Ok(attempts.fail(FailureKind::Terminal, "no downloaded file recorded")?);
        };
        let request = self.settings.request(&vod, PathBuf::from(path));
        tracker.phase(ProgressPhase::Uploading, "Upload started");

        loop {
            let (kind, message, retry_after) = match self.attempt(&request, &attempts, shutdown).await? {
                Attempted::Published(video_id) => return self.finish(&attempts, &video_id).await,
                Attempted::Failed(e) => (e.kind(), e.to_string(), e.retry_after()),
                Attempted::NoToken(e) => {
                    log::warn!("VOD {} has no usable access token: {}", vod_id, e);
                    (e.kind(), e.to_string(), None)
                }
                Attempted::Interrupted => return Ok(attempts.release()?),
                Attempted::LeaseLost => {
                    log::warn!("VOD {} lease lost mid-upload, abandoning", vod_id);
                    return Ok(StageOutcome::LeaseLost);
                }
            };

            match attempts.on_failure(kind, &message, retry_after, shutdown).await? {
                Next::Retry => continue,
                Next::Done(outcome) => return Ok(outcome),
            }
        }
    }
}
