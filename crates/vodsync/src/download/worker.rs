//! Download stage: `queued -> downloading -> downloaded`.
//!
//! Bytes go to `<dir>/<vod_id>.part` and are renamed to
//! `<dir>/<vod_id>.mp4` once complete. A partial file left behind by a
//! crash or shutdown is resumed with a range request on the next claim.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use super::{render_media_url, BodyStart, FetchError, MediaBody, MediaFetcher};
use crate::backoff::BackoffPolicy;
use crate::broadcast::{ProgressPhase, VodProgressBroadcaster, VodProgressTracker};
use crate::config::DownloadConfig;
use crate::correlate::Correlator;
use crate::db::progress_repo::{self, Progress, Stage, VodState};
use crate::db::vod_repo::{self, Vod};
use crate::db::Database;
use crate::error::{Result, VodsyncError};
use crate::worker::{Attempts, Next, StageOutcome, StageProcessor, WorkerOptions};

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub directory: PathBuf,
    pub media_url_template: String,
    pub max_retries: u32,
    pub progress_interval: Duration,
    pub chunk_timeout: Duration,
}

impl DownloadSettings {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            directory: PathBuf::from(crate::secrets::expand_home(&config.directory.to_string_lossy())),
            media_url_template: config.media_url_template.clone(),
            max_retries: config.max_retries,
            progress_interval: config.progress_interval(),
            chunk_timeout: config.chunk_timeout(),
        }
    }

    pub fn partial_path(&self, vod_id: i64) -> PathBuf {
        self.directory.join(format!("{}.part", vod_id))
    }

    pub fn final_path(&self, vod_id: i64) -> PathBuf {
        self.directory.join(format!("{}.mp4", vod_id))
    }
}

/// How one attempt ended, short of an error.
enum Attempted {
    Finished { path: PathBuf, total_bytes: u64 },
    Interrupted,
    LeaseLost,
}

pub struct DownloadWorker {
    db: Database,
    fetcher: Arc<dyn MediaFetcher>,
    correlator: Correlator,
    progress: VodProgressBroadcaster,
    backoff: BackoffPolicy,
    options: WorkerOptions,
    settings: DownloadSettings,
}

impl DownloadWorker {
    pub fn new(
        db: Database,
        fetcher: Arc<dyn MediaFetcher>,
        correlator: Correlator,
        progress: VodProgressBroadcaster,
        backoff: BackoffPolicy,
        options: WorkerOptions,
        settings: DownloadSettings,
    ) -> Self {
        Self {
            db,
            fetcher,
            correlator,
            progress,
            backoff,
            options,
            settings,
        }
    }

    pub fn options(&self) -> &WorkerOptions {
        &self.options
    }

    /// Polls and downloads until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        crate::worker::run_stage(self, &self.db, &self.options, shutdown).await
    }

    /// Processes whatever is claimable right now.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<usize> {
        crate::worker::poll_once(self, &self.db, &self.options, shutdown).await
    }

    async fn attempt(
        &self,
        vod: &Vod,
        url: &str,
        tracker: &VodProgressTracker,
        shutdown: &CancellationToken,
    ) -> Result<Attempted> {
        let final_path = self.settings.final_path(vod.id);
        let part_path = self.settings.partial_path(vod.id);
        fs::create_dir_all(&self.settings.directory)
            .await
            .map_err(|e| io_error(&self.settings.directory, e))?;

        // A previous attempt renamed the file but did not get to record it.
        if let Some(len) = file_len(&final_path).await {
            log::info!("VOD {} already on disk at {}", vod.id, final_path.display());
            return Ok(Attempted::Finished {
                path: final_path,
                total_bytes: len,
            });
        }

        let mut offset = file_len(&part_path).await.unwrap_or(0);
        let Some(mut body) = self.open_body(vod.id, url, offset).await? else {
            return Ok(Attempted::LeaseLost);
        };
        match body.start {
            BodyStart::Resumed => {
                if offset > 0 {
                    log::info!("VOD {} resuming download at byte {}", vod.id, offset);
                }
            }
            BodyStart::Restarted => offset = 0,
            BodyStart::Complete => {
                fs::rename(&part_path, &final_path)
                    .await
                    .map_err(|e| io_error(&final_path, e))?;
                return Ok(Attempted::Finished {
                    path: final_path,
                    total_bytes: offset,
                });
            }
            BodyStart::Unsatisfiable => {
                log::warn!(
                    "VOD {} partial file ({} bytes) does not match the media, starting over",
                    vod.id,
                    offset
                );
                fs::remove_file(&part_path)
                    .await
                    .map_err(|e| io_error(&part_path, e))?;
                offset = 0;
                body = match self.open_body(vod.id, url, 0).await? {
                    Some(body) => body,
                    None => return Ok(Attempted::LeaseLost),
                };
                if !matches!(body.start, BodyStart::Resumed | BodyStart::Restarted) {
                    return Err(FetchError::Protocol(
                        "server refused a request from byte 0".to_string(),
                    )
                    .into());
                }
            }
        }

        let mut file = if offset > 0 {
            OpenOptions::new().append(true).open(&part_path).await
        } else {
            fs::File::create(&part_path).await
        }
        .map_err(|e| io_error(&part_path, e))?;

        let total = body.total_bytes;
        let total_i64 = total.and_then(|t| i64::try_from(t).ok());
        let mut written = offset;
        let mut last_persisted = Instant::now();
        // Renewed on a timer so a slow chunk cannot outlive the lease.
        let mut heartbeat = self.heartbeat();
        let stall = tokio::time::sleep(self.settings.chunk_timeout);
        tokio::pin!(stall);

        loop {
            let chunk = tokio::select! {
                _ = shutdown.cancelled() => {
                    file.flush().await.map_err(|e| io_error(&part_path, e))?;
                    progress_repo::record_progress(
                        &self.db,
                        vod.id,
                        &self.options.owner,
                        percent(written, total),
                        total_i64,
                        Utc::now(),
                        self.options.lease,
                    )?;
                    return Ok(Attempted::Interrupted);
                }
                _ = &mut stall => {
                    file.flush().await.map_err(|e| io_error(&part_path, e))?;
                    return Err(FetchError::Stalled(self.settings.chunk_timeout).into());
                }
                _ = heartbeat.tick() => {
                    if !self.renew_lease(vod.id)? {
                        log::warn!("VOD {} lease lost while waiting for media, abandoning", vod.id);
                        return Ok(Attempted::LeaseLost);
                    }
                    continue;
                }
                next = body.chunks.next() => match next {
                    None => break,
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        file.flush().await.map_err(|e| io_error(&part_path, e))?;
                        return Err(e.into());
                    }
                },
            };
            stall
                .as_mut()
                .reset(tokio::time::Instant::now() + self.settings.chunk_timeout);

            file.write_all(&chunk).await.map_err(FetchError::Io)?;
            written += chunk.len() as u64;
            tracker.transfer(ProgressPhase::Downloading, written, total);

            if last_persisted.elapsed() >= self.settings.progress_interval {
                let held = progress_repo::record_progress(
                    &self.db,
                    vod.id,
                    &self.options.owner,
                    percent(written, total),
                    total_i64,
                    Utc::now(),
                    self.options.lease,
                )?;
                if !held {
                    log::warn!("VOD {} lease lost mid-download, abandoning", vod.id);
                    return Ok(Attempted::LeaseLost);
                }
                last_persisted = Instant::now();
            }
        }

        file.flush().await.map_err(FetchError::Io)?;
        file.sync_all().await.map_err(FetchError::Io)?;
        drop(file);

        if let Some(expected) = total {
            if written != expected {
                return Err(FetchError::Incomplete {
                    received: written,
                    expected,
                }
                .into());
            }
        }

        fs::rename(&part_path, &final_path)
            .await
            .map_err(|e| io_error(&final_path, e))?;
        Ok(Attempted::Finished {
            path: final_path,
            total_bytes: written,
        })
    }

    /// Opens the media body, renewing the lease while the request is in
    /// flight. `None` when the lease was lost.
    async fn open_body(&self, vod_id: i64, url: &str, offset: u64) -> Result<Option<MediaBody>> {
        let open = tokio::time::timeout(self.settings.chunk_timeout, self.fetcher.open(url, offset));
        tokio::pin!(open);
        let mut heartbeat = self.heartbeat();
        loop {
            tokio::select! {
                opened = &mut open => {
                    return match opened {
                        Ok(body) => Ok(Some(body?)),
                        Err(_) => Err(FetchError::Stalled(self.settings.chunk_timeout).into()),
                    };
                }
                _ = heartbeat.tick() => {
                    if !self.renew_lease(vod_id)? {
                        log::warn!("VOD {} lease lost while opening media, abandoning", vod_id);
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn heartbeat(&self) -> tokio::time::Interval {
        let period = self.options.heartbeat_interval();
        tokio::time::interval_at(tokio::time::Instant::now() + period, period)
    }

    fn renew_lease(&self, vod_id: i64) -> Result<bool> {
        let until = Utc::now() + self.options.lease;
        Ok(progress_repo::renew_lease(&self.db, vod_id, &self.options.owner, until)?)
    }

    async fn finish(
        &self,
        vod_id: i64,
        path: &Path,
        total_bytes: u64,
        tracker: &VodProgressTracker,
    ) -> Result<StageOutcome> {
        let path_str = path.to_string_lossy();
        let recorded = progress_repo::complete_download(
            &self.db,
            vod_id,
            &self.options.owner,
            &path_str,
            i64::try_from(total_bytes).ok(),
            Utc::now(),
        )?;
        if !recorded {
            return Ok(StageOutcome::LeaseLost);
        }
        log::info!(
            "VOD {} downloading -> downloaded ({} bytes at {})",
            vod_id,
            total_bytes,
            path_str
        );
        tracker.phase(ProgressPhase::Downloaded, "Download complete");

        // The upload stage's sweep retries this if it fails here.
        if let Err(e) = self.correlator.correlate(vod_id).await {
            log::warn!("VOD {} chat correlation deferred: {}", vod_id, e);
        }
        Ok(StageOutcome::Completed(VodState::Downloaded))
    }
}

#[async_trait]
impl StageProcessor for DownloadWorker {
    fn stage(&self) -> Stage {
        Stage::Download
    }

    async fn process(&self, claimed: Progress, shutdown: &CancellationToken) -> Result<StageOutcome> {
        let vod_id = claimed.vod_id;
        let vod = vod_repo::find_by_id(&self.db, vod_id)?.ok_or(VodsyncError::UnknownVod(vod_id))?;
        let tracker = self.progress.track(vod_id);
        let mut attempts = Attempts {
            db: &self.db,
            vod_id,
            stage: Stage::Download,
            options: &self.options,
            max_retries: self.settings.max_retries,
            backoff: &self.backoff,
            tracker: &tracker,
            retries: claimed.retries,
        };

        let url = match render_media_url(&self.settings.media_url_template, &vod) {
            Ok(url) => url,
            Err(e) => return Ok(attempts.fail(e.kind(), &e.to_string())?),
        };
        tracker.phase(ProgressPhase::Downloading, "Download started");

        loop {
            match self.attempt(&vod, &url, &tracker, shutdown).await {
                Ok(Attempted::Finished { path, total_bytes }) => {
                    return self.finish(vod_id, &path, total_bytes, &tracker).await;
                }
                Ok(Attempted::Interrupted) => return Ok(attempts.release()?),
                Ok(Attempted::LeaseLost) => return Ok(StageOutcome::LeaseLost),
                Err(VodsyncError::Fetch(e)) => {
                    match attempts.on_failure(e.kind(), &e.to_string(), None, shutdown).await? {
                        Next::Retry => continue,
                        Next::Done(outcome) => return Ok(outcome),
                    }
                }
                Err(VodsyncError::Io { path, source }) => {
                    let message = format!("{}: {}", path.display(), source);
                    match attempts
                        .on_failure(crate::error::FailureKind::Transient, &message, None, shutdown)
                        .await?
                    {
                        Next::Retry => continue,
                        Next::Done(outcome) => return Ok(outcome),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn percent(written: u64, total: Option<u64>) -> f64 {
    match total {
        Some(t) if t > 0 => (written as f64 / t as f64 * 100.0).min(100.0),
        _ => 0.0,
    }
}

async fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path)
        .await
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.len())
}

fn io_error(path: &Path, source: std::io::Error) -> VodsyncError {
    VodsyncError::Io {
        path: path.to_path_buf(),
        source,
    }
}
