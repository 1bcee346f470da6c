//! Claim loop shared by the download and upload stages.
//!
//! Each stage polls for claimable VODs, claims them one at a time under a
//! lease, and hands the claimed row to its [`StageProcessor`]. Failure
//! bookkeeping (retry budget, backoff, terminal failure) lives in
//! [`Attempts`] so both stages count retries the same way.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffPolicy;
use crate::broadcast::VodProgressTracker;
use crate::config::WorkersConfig;
use crate::db::progress_repo::{self, Progress, Stage, VodState};
use crate::db::{Database, DatabaseError};
use crate::error::{FailureKind, Result};

/// Identity and pacing of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Written into leases; must be unique per process.
    pub owner: String,
    pub lease: chrono::Duration,
    pub poll_interval: Duration,
    /// VODs examined per poll.
    pub batch_size: u32,
}

impl WorkerOptions {
    pub fn from_config(config: &WorkersConfig) -> Self {
        Self {
            owner: config.resolved_owner_id(),
            lease: config.lease(),
            poll_interval: config.poll_interval(),
            batch_size: 16,
        }
    }

    /// How often a busy worker renews its lease.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease / 3)
            .to_std()
            .unwrap_or(Duration::from_secs(30))
            .max(Duration::from_millis(10))
    }
}

/// What became of a claimed VOD.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    /// Advanced to the given state.
    Completed(VodState),
    /// Moved to `failed`.
    Failed(FailureKind),
    /// Shutdown interrupted the work; the lease was released.
    Released,
    /// Another worker took over the VOD.
    LeaseLost,
}

#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    /// Called before every poll.
    async fn before_poll(&self) {}

    /// Works on a VOD this worker has just claimed.
    async fn process(&self, claimed: Progress, shutdown: &CancellationToken) -> Result<StageOutcome>;
}

/// Claims and processes whatever is claimable right now. Returns how many
/// VODs were processed.
pub async fn poll_once<P: StageProcessor + ?Sized>(
    processor: &P,
    db: &Database,
    options: &WorkerOptions,
    shutdown: &CancellationToken,
) -> Result<usize> {
    let stage = processor.stage();
    let ids = progress_repo::candidates(db, stage, Utc::now(), options.batch_size)?;

    let mut processed = 0;
    for vod_id in ids {
        if shutdown.is_cancelled() {
            break;
        }
        let Some(claimed) =
            progress_repo::claim(db, vod_id, stage, &options.owner, Utc::now(), options.lease)?
        else {
            continue;
        };

        log::info!(
            "VOD {} claimed for {} by {} (retries so far: {})",
            vod_id,
            stage.as_str(),
            options.owner,
            claimed.retries
        );
        match processor.process(claimed, shutdown).await {
            Ok(outcome) => log::info!("VOD {} {} finished: {:?}", vod_id, stage.as_str(), outcome),
            Err(e) => log::error!(
                "VOD {} {} aborted, lease left to expire: {}",
                vod_id,
                stage.as_str(),
                e
            ),
        }
        processed += 1;
    }
    Ok(processed)
}

/// Polls until `shutdown` fires. In-flight work is checkpointed by the
/// processor before this returns.
pub async fn run_stage<P: StageProcessor + ?Sized>(
    processor: &P,
    db: &Database,
    options: &WorkerOptions,
    shutdown: CancellationToken,
) {
    let stage = processor.stage();
    log::info!("{} worker {} started", stage.as_str(), options.owner);

    while !shutdown.is_cancelled() {
        processor.before_poll().await;

        let worked = match poll_once(processor, db, options, &shutdown).await {
            Ok(n) => n > 0,
            Err(e) => {
                log::warn!("{} poll failed: {}", stage.as_str(), e);
                false
            }
        };
        if worked {
            continue;
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(options.poll_interval) => {}
        }
    }
    log::info!("{} worker {} stopped", stage.as_str(), options.owner);
}

/// Whether the caller should run another attempt.
#[derive(Debug, PartialEq)]
pub(crate) enum Next {
    Retry,
    Done(StageOutcome),
}

/// Retry accounting for one claimed VOD.
pub(crate) struct Attempts<'a> {
    pub db: &'a Database,
    pub vod_id: i64,
    pub stage: Stage,
    pub options: &'a WorkerOptions,
    pub max_retries: u32,
    pub backoff: &'a BackoffPolicy,
    pub tracker: &'a VodProgressTracker,
    /// Retries recorded so far, as last written by this worker.
    pub retries: u32,
}

impl Attempts<'_> {
    /// Handles a failed attempt.
    ///
    /// Non-retryable failures go straight to `failed`. Transient ones
    /// consume one retry and sleep for the backoff delay (at least
    /// `min_delay`), or go to `failed` as exhausted once the budget is
    /// spent.
    pub async fn on_failure(
        &mut self,
        kind: FailureKind,
        error: &str,
        min_delay: Option<Duration>,
        shutdown: &CancellationToken,
    ) -> std::result::Result<Next, DatabaseError> {
        if !kind.is_retryable() {
            return Ok(Next::Done(self.fail(kind, error)?));
        }
        if self.retries >= self.max_retries {
            return Ok(Next::Done(self.fail(FailureKind::Exhausted, error)?));
        }

        let owner = &self.options.owner;
        if !progress_repo::record_retry(
            self.db,
            self.vod_id,
            self.stage,
            owner,
            self.retries,
            error,
            Utc::now(),
        )? {
            return Ok(Next::Done(StageOutcome::LeaseLost));
        }
        self.retries += 1;

        let delay = self
            .backoff
            .delay(self.retries)
            .max(min_delay.unwrap_or_default());
        log::warn!(
            "VOD {} {} attempt failed: {}; retry {}/{} in {:?}",
            self.vod_id,
            self.stage.as_str(),
            error,
            self.retries,
            self.max_retries,
            delay
        );
        self.tracker.retrying(self.retries, error);

        // Keep the lease alive across the sleep.
        let hold = chrono::Duration::from_std(delay).unwrap_or(self.options.lease) + self.options.lease;
        if !progress_repo::renew_lease(self.db, self.vod_id, owner, Utc::now() + hold)? {
            return Ok(Next::Done(StageOutcome::LeaseLost));
        }

        tokio::select! {
            _ = shutdown.cancelled() => Ok(Next::Done(self.release()?)),
            _ = tokio::time::sleep(delay) => Ok(Next::Retry),
        }
    }

    /// Moves the VOD to `failed` without touching the retry count.
    pub fn fail(&self, kind: FailureKind, error: &str) -> std::result::Result<StageOutcome, DatabaseError> {
        let failed = progress_repo::fail(
            self.db,
            self.vod_id,
            self.stage,
            &self.options.owner,
            kind,
            error,
            Utc::now(),
        )?;
        if !failed {
            return Ok(StageOutcome::LeaseLost);
        }
        log::error!(
            "VOD {} {} failed ({}) after {} retries: {}",
            self.vod_id,
            self.stage.as_str(),
            kind,
            self.retries,
            error
        );
        self.tracker.failed(error);
        Ok(StageOutcome::Failed(kind))
    }

    /// Gives the VOD back without changing its state.
    pub fn release(&self) -> std::result::Result<StageOutcome, DatabaseError> {
        progress_repo::release(self.db, self.vod_id, &self.options.owner, Utc::now())?;
        log::info!(
            "VOD {} {} interrupted by shutdown, lease released",
            self.vod_id,
            self.stage.as_str()
        );
        Ok(StageOutcome::Released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::VodProgressBroadcaster;
    use crate::db::vod_repo::{self, NewVod};
    use chrono::TimeZone;

    fn options() -> WorkerOptions {
        WorkerOptions {
            owner: "test-worker".to_string(),
            lease: chrono::Duration::seconds(120),
            poll_interval: Duration::from_millis(10),
            batch_size: 8,
        }
    }

    fn seed(db: &Database) -> i64 {
        let vod = NewVod {
            source_vod_id: "v1".to_string(),
            channel: "somechannel".to_string(),
            title: "Stream".to_string(),
            broadcast_start: Utc.with_ymd_and_hms(2025, 10, 19, 10, 0, 0).unwrap(),
            duration_seconds: 60,
        };
        vod_repo::insert_if_absent(db, &vod, Utc::now()).unwrap().unwrap()
    }

    fn quick_backoff() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 0.0)
    }

    #[tokio::test]
    async fn test_transient_failures_consume_budget_then_exhaust() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db);
        let opts = options();
        progress_repo::claim(&db, id, Stage::Download, &opts.owner, Utc::now(), opts.lease)
            .unwrap()
            .unwrap();
        let backoff = quick_backoff();
        let broadcaster = VodProgressBroadcaster::default();
        let tracker = broadcaster.track(id);
        let shutdown = CancellationToken::new();

        let mut attempts = Attempts {
            db: &db,
            vod_id: id,
            stage: Stage::Download,
            options: &opts,
            max_retries: 2,
            backoff: &backoff,
            tracker: &tracker,
            retries: 0,
        };

        for _ in 0..2 {
            let next = attempts
                .on_failure(FailureKind::Transient, "reset", None, &shutdown)
                .await
                .unwrap();
            assert_eq!(next, Next::Retry);
        }
        let next = attempts
            .on_failure(FailureKind::Transient, "reset", None, &shutdown)
            .await
            .unwrap();
        assert_eq!(next, Next::Done(StageOutcome::Failed(FailureKind::Exhausted)));

        let p = progress_repo::find(&db, id).unwrap().unwrap();
        assert_eq!(p.state, VodState::Failed);
        assert_eq!(p.retries, 2);
        assert_eq!(p.failure_kind.as_deref(), Some("exhausted"));
    }

    #[tokio::test]
    async fn test_terminal_failure_skips_retry_budget() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db);
        let opts = options();
        progress_repo::claim(&db, id, Stage::Download, &opts.owner, Utc::now(), opts.lease)
            .unwrap()
            .unwrap();
        let backoff = quick_backoff();
        let broadcaster = VodProgressBroadcaster::default();
        let tracker = broadcaster.track(id);

        let mut attempts = Attempts {
            db: &db,
            vod_id: id,
            stage: Stage::Download,
            options: &opts,
            max_retries: 5,
            backoff: &backoff,
            tracker: &tracker,
            retries: 0,
        };
        let next = attempts
            .on_failure(FailureKind::Terminal, "404", None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(next, Next::Done(StageOutcome::Failed(FailureKind::Terminal)));
        assert_eq!(progress_repo::find(&db, id).unwrap().unwrap().retries, 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_releases_lease() {
        let db = Database::open_in_memory().unwrap();
        let id = seed(&db);
        let opts = options();
        progress_repo::claim(&db, id, Stage::Download, &opts.owner, Utc::now(), opts.lease)
            .unwrap()
            .unwrap();
        let backoff = BackoffPolicy::new(Duration::from_secs(60), Duration::from_secs(60), 0.0);
        let broadcaster = VodProgressBroadcaster::default();
        let tracker = broadcaster.track(id);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let mut attempts = Attempts {
            db: &db,
            vod_id: id,
            stage: Stage::Download,
            options: &opts,
            max_retries: 5,
            backoff: &backoff,
            tracker: &tracker,
            retries: 0,
        };
        let next = attempts
            .on_failure(FailureKind::Transient, "reset", None, &shutdown)
            .await
            .unwrap();
        assert_eq!(next, Next::Done(StageOutcome::Released));

        let p = progress_repo::find(&db, id).unwrap().unwrap();
        assert_eq!(p.state, VodState::Downloading);
        assert_eq!(p.retries, 1);
        assert!(p.lease_owner.is_none());
    }
}
