//! Periodic discovery of ended broadcasts.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{BroadcastSource, SourceError};
use crate::broadcast::{ProgressPhase, VodProgressBroadcaster, VodProgressEvent};
use crate::db::vod_repo::{self, NewVod};
use crate::db::{ingest_repo, Database};

/// Outcome of one discovery pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
    /// Ended broadcasts reported by the source.
    pub discovered: usize,
    /// New VOD ids created in this pass.
    pub enqueued: Vec<i64>,
    /// Watermark after the pass.
    pub watermark: Option<DateTime<Utc>>,
}

/// Enqueues newly ended broadcasts on a fixed interval.
pub struct IngestScheduler {
    db: Database,
    source: Arc<dyn BroadcastSource>,
    channel: String,
    interval: Duration,
    progress: VodProgressBroadcaster,
}

impl IngestScheduler {
    pub fn new(
        db: Database,
        source: Arc<dyn BroadcastSource>,
        channel: &str,
        interval: Duration,
        progress: VodProgressBroadcaster,
    ) -> Self {
        Self {
            db,
            source,
            channel: channel.to_string(),
            interval,
            progress,
        }
    }

    /// Runs a single discovery pass.
    ///
    /// Inserts are idempotent on the source id, so a pass that fails half
    /// way is safe to repeat. The watermark only moves after every insert
    /// of the pass succeeded.
    pub async fn run_once(&self) -> Result<IngestReport, SourceError> {
        let since = ingest_repo::watermark(&self.db, &self.channel)?;
        let mut broadcasts = self.source.ended_broadcasts(since).await?;
        broadcasts.sort_by_key(|b| b.ended_at());

        let now = Utc::now();
        let mut report = IngestReport {
            discovered: broadcasts.len(),
            enqueued: Vec::new(),
            watermark: since,
        };

        for broadcast in &broadcasts {
            let new_vod = NewVod {
                source_vod_id: broadcast.source_vod_id.clone(),
                channel: broadcast.channel.clone(),
                title: broadcast.title.clone(),
                broadcast_start: broadcast.started_at,
                duration_seconds: broadcast.duration_seconds,
            };
            match vod_repo::insert_if_absent(&self.db, &new_vod, now)? {
                Some(id) => {
                    log::info!(
                        "Enqueued VOD {} (source {}, '{}')",
                        id,
                        broadcast.source_vod_id,
                        broadcast.title
                    );
                    self.progress.send(VodProgressEvent::new(
                        id,
                        ProgressPhase::Queued,
                        "Broadcast discovered",
                    ));
                    report.enqueued.push(id);
                }
                None => log::debug!("Broadcast {} already known", broadcast.source_vod_id),
            }
        }

        if let Some(latest) = broadcasts.last().map(|b| b.ended_at()) {
            if ingest_repo::advance_watermark(&self.db, &self.channel, latest, now)? {
                report.watermark = Some(latest);
            }
        }

        Ok(report)
    }

    /// Runs discovery every interval until `shutdown` fires. Failures are
    /// logged and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        log::info!(
            "Ingest scheduler started for {} (every {:?})",
            self.channel,
            self.interval
        );
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }

            match self.run_once().await {
                Ok(report) if !report.enqueued.is_empty() => {
                    log::info!("Discovery enqueued {} VOD(s)", report.enqueued.len());
                }
                Ok(_) => {}
                Err(e) => log::warn!("Discovery pass failed, retrying next tick: {}", e),
            }
        }
        log::info!("Ingest scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::progress_repo;
    use crate::source::EndedBroadcast;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Returns scripted results and records the `since` it was asked for.
    struct ScriptedSource {
        results: Mutex<Vec<Result<Vec<EndedBroadcast>, SourceError>>>,
        seen_since: Mutex<Vec<Option<DateTime<Utc>>>>,
    }

    impl ScriptedSource {
        fn new(results: Vec<Result<Vec<EndedBroadcast>, SourceError>>) -> Self {
            Self {
                results: Mutex::new(results),
                seen_since: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BroadcastSource for ScriptedSource {
        async fn ended_broadcasts(
            &self,
            since: Option<DateTime<Utc>>,
        ) -> Result<Vec<EndedBroadcast>, SourceError> {
            self.seen_since.lock().unwrap().push(since);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Ok(Vec::new())
            } else {
                results.remove(0)
            }
        }
    }

    fn broadcast(id: &str, hour: u32) -> EndedBroadcast {
        EndedBroadcast {
            source_vod_id: id.to_string(),
            channel: "somechannel".to_string(),
            title: format!("Stream {}", id),
            started_at: Utc.with_ymd_and_hms(2025, 10, 19, hour, 0, 0).unwrap(),
            duration_seconds: 3600,
        }
    }

    fn scheduler(db: &Database, source: Arc<ScriptedSource>) -> IngestScheduler {
        IngestScheduler::new(
            db.clone(),
            source,
            "somechannel",
            Duration::from_millis(10),
            VodProgressBroadcaster::default(),
        )
    }

    #[tokio::test]
    async fn test_run_once_enqueues_and_advances_watermark() {
        let db = Database::open_in_memory().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Ok(vec![
            broadcast("b2", 12),
            broadcast("b1", 8),
        ])]));
        let report = scheduler(&db, source).run_once().await.unwrap();

        assert_eq!(report.discovered, 2);
        assert_eq!(report.enqueued.len(), 2);
        assert_eq!(
            report.watermark,
            Some(Utc.with_ymd_and_hms(2025, 10, 19, 13, 0, 0).unwrap())
        );
        assert!(vod_repo::find_by_source_id(&db, "b1").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_repeated_discovery_does_not_duplicate() {
        let db = Database::open_in_memory().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Ok(vec![broadcast("b1", 8)]),
            Ok(vec![broadcast("b1", 8), broadcast("b2", 12)]),
        ]));
        let sched = scheduler(&db, source.clone());

        sched.run_once().await.unwrap();
        let second = sched.run_once().await.unwrap();

        assert_eq!(second.enqueued.len(), 1);
        assert_eq!(progress_repo::list_views(&db, 10).unwrap().len(), 2);
        let seen = source.seen_since.lock().unwrap();
        assert_eq!(seen[0], None);
        assert_eq!(
            seen[1],
            Some(Utc.with_ymd_and_hms(2025, 10, 19, 9, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_failed_pass_keeps_watermark() {
        let db = Database::open_in_memory().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Err(SourceError::Api {
            status: 503,
            body: "unavailable".to_string(),
        })]));
        let result = scheduler(&db, source).run_once().await;

        assert!(result.is_err());
        assert!(ingest_repo::watermark(&db, "somechannel").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let db = Database::open_in_memory().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Malformed("first tick fails".to_string())),
            Ok(vec![broadcast("b1", 8)]),
        ]));
        let sched = Arc::new(scheduler(&db, source));
        let shutdown = CancellationToken::new();

        let handle = {
            let sched = Arc::clone(&sched);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { sched.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        handle.await.unwrap();

        // The failing first tick did not stop the loop.
        assert!(vod_repo::find_by_source_id(&db, "b1").unwrap().is_some());
    }
}
