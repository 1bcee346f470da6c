//! Chat correlation: turning capture times into offsets from stream start.
//!
//! Runs once a VOD's download finishes. The whole batch is written in one
//! transaction together with `progress.correlated_at`, which is what lets
//! the upload stage claim the VOD.

use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::broadcast::{ChatNotifier, ProgressPhase, VodProgressBroadcaster, VodProgressEvent};
use crate::db::chat_repo::{self, Correlation};
use crate::db::{progress_repo, vod_repo, Database};
use crate::error::{Result, VodsyncError};

/// What one correlation run changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrelationReport {
    /// Messages that received a `rel_timestamp`.
    pub updated: usize,
    /// Messages captured before the recorded start, clamped to 0.
    pub clamped: usize,
    /// Messages whose capture time could not be parsed, stored as 0.
    pub unparseable: usize,
    /// Whether this run opened the upload gate.
    pub gate_opened: bool,
}

#[derive(Clone)]
pub struct Correlator {
    db: Database,
    notifier: ChatNotifier,
    progress: VodProgressBroadcaster,
    write_attempts: u32,
    retry_delay: Duration,
}

impl Correlator {
    pub fn new(db: Database, notifier: ChatNotifier, progress: VodProgressBroadcaster) -> Self {
        Self {
            db,
            notifier,
            progress,
            write_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Correlates every uncorrelated message of a VOD.
    ///
    /// Already-correlated messages are never touched, so running this
    /// again is a no-op. Database failures are retried a few times before
    /// giving up; the upload stage's sweep picks the VOD up again later.
    pub async fn correlate(&self, vod_id: i64) -> Result<CorrelationReport> {
        let mut attempt = 1;
        loop {
            match self.correlate_once(vod_id, Utc::now()) {
                Ok(report) => {
                    if report.updated > 0 {
                        log::info!(
                            "VOD {} chat correlated: {} message(s), {} clamped, {} unparseable",
                            vod_id,
                            report.updated,
                            report.clamped,
                            report.unparseable
                        );
                        self.notifier.notify(vod_id);
                    }
                    if report.gate_opened {
                        self.progress.send(VodProgressEvent::new(
                            vod_id,
                            ProgressPhase::Correlated,
                            &format!("{} chat message(s) correlated", report.updated),
                        ));
                    }
                    return Ok(report);
                }
                Err(VodsyncError::Database(e)) if attempt < self.write_attempts => {
                    log::warn!(
                        "VOD {} correlation write failed (attempt {}/{}): {}",
                        vod_id,
                        attempt,
                        self.write_attempts,
                        e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn correlate_once(&self, vod_id: i64, now: DateTime<Utc>) -> Result<CorrelationReport> {
        let report = self.db.with_tx(|tx| {
            let Some(vod) = vod_repo::find_by_id_in(tx, vod_id)? else {
                return Ok(None);
            };

            let mut report = CorrelationReport::default();
            let pending = chat_repo::uncorrelated(tx, vod_id)?;
            let correlations: Vec<Correlation> = pending
                .into_iter()
                .map(|(id, abs)| {
                    let (rel_timestamp, clock_skew) = match compute_offset(&abs, vod.broadcast_start) {
                        Some(rel) if rel < 0.0 => {
                            report.clamped += 1;
                            (0.0, true)
                        }
                        Some(rel) => (rel, false),
                        None => {
                            log::warn!(
                                "VOD {} chat message {} has unparseable timestamp '{}'",
                                vod_id,
                                id,
                                abs
                            );
                            report.unparseable += 1;
                            (0.0, true)
                        }
                    };
                    Correlation {
                        id,
                        rel_timestamp,
                        clock_skew,
                    }
                })
                .collect();

            report.updated = chat_repo::apply_correlation(tx, &correlations)?;
            report.gate_opened = progress_repo::mark_correlated(tx, vod_id, now)?;
            Ok(Some(report))
        })?;
        report.ok_or(VodsyncError::UnknownVod(vod_id))
    }
}

/// Seconds between `broadcast_start` and a capture time, negative when the
/// message predates the start. `None` if `abs_timestamp` cannot be parsed.
///
/// Accepts RFC3339, and naive `YYYY-MM-DD HH:MM:SS[.fff]` taken as UTC.
pub fn compute_offset(abs_timestamp: &str, broadcast_start: DateTime<Utc>) -> Option<f64> {
    let abs = parse_capture_time(abs_timestamp)?;
    let delta = abs - broadcast_start;
    Some(match delta.num_microseconds() {
        Some(us) => us as f64 / 1_000_000.0,
        None => delta.num_seconds() as f64,
    })
}

fn parse_capture_time(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
