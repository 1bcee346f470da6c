//! End-to-end pipeline scenarios: discovery, download, correlation,
//! upload and replay, with every network collaborator scripted.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::harness::{broadcast_start, never_cancelled, PROVIDER};
use common::{FakeMediaServer, FakeOAuthClient, FakePublisher, FakeSource, TestHarness};

use vodsync::auth::{MemoryTokenStore, SqliteTokenStore, TokenStore};
use vodsync::db::progress_repo::{self, Stage, VodState};
use vodsync::replay::{Cursor, ReplayEvent};
use vodsync::source::EndedBroadcast;
use vodsync::upload::PublishError;

const MEDIA: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn hour_from_now() -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::hours(1)
}

async fn collect(mut rx: tokio::sync::mpsc::Receiver<ReplayEvent>) -> Vec<ReplayEvent> {
    let mut events = Vec::new();
    while let Some(event) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("replay stream stalled")
    {
        events.push(event);
    }
    events
}

fn rel_timestamps(events: &[ReplayEvent]) -> Vec<f64> {
    events
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Chat(m) => m.rel_timestamp,
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_broadcast_flows_from_discovery_to_replay() {
    let h = TestHarness::new();
    let source = FakeSource::new(vec![EndedBroadcast {
        source_vod_id: "v2001".to_string(),
        channel: "somechannel".to_string(),
        title: "Sunday speedrun".to_string(),
        started_at: broadcast_start(),
        duration_seconds: 3600,
    }]);

    let report = h.scheduler(Arc::new(source)).run_once().await.unwrap();
    assert_eq!(report.enqueued.len(), 1);
    let vod_id = report.enqueued[0];
    assert_eq!(h.progress_row(vod_id).state, VodState::Queued);
    h.assert_published_consistent(vod_id);

    // Chat captured while the broadcast was live.
    h.insert_chat(vod_id, "alice", "2025-10-19T10:05:00Z");
    h.insert_chat(vod_id, "bob", "2025-10-19T10:06:00.500Z");
    h.insert_chat(vod_id, "early", "2025-10-19T09:59:58Z");

    let media = Arc::new(FakeMediaServer::new(MEDIA, 0));
    assert_eq!(h.download_worker(media).run_once(&never_cancelled()).await.unwrap(), 1);

    let progress = h.progress_row(vod_id);
    assert_eq!(progress.state, VodState::Downloaded);
    assert_eq!(progress.percent, 100.0);
    assert!(progress.correlated_at.is_some());
    let path = progress.downloaded_path.clone().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), MEDIA);
    h.assert_published_consistent(vod_id);

    let publisher = Arc::new(FakePublisher::succeeding("dQw4w9WgXcQ"));
    let store = Arc::new(SqliteTokenStore::new(h.db.clone()));
    let tokens = h
        .token_manager(store, Arc::new(FakeOAuthClient::rejecting()), hour_from_now())
        .await;
    h.upload_worker(publisher.clone(), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let view = h.view(vod_id);
    assert_eq!(view.state, VodState::Uploaded);
    assert!(view.processed);
    assert_eq!(
        view.published_url.as_deref(),
        Some("https://www.youtube.com/watch?v=dQw4w9WgXcQ")
    );
    assert_eq!(publisher.tokens(), vec!["at-stored".to_string()]);
    h.assert_published_consistent(vod_id);

    let events = collect(h.replay(64, 100).open(vod_id, None, never_cancelled()).unwrap()).await;
    assert_eq!(rel_timestamps(&events), vec![0.0, 300.0, 360.5]);
    match &events[0] {
        ReplayEvent::Chat(m) => {
            assert_eq!(m.username, "early");
            assert!(m.clock_skew);
        }
        other => panic!("expected chat, got {:?}", other),
    }
    assert_eq!(events.last(), Some(&ReplayEvent::End));
}

#[tokio::test]
async fn test_chat_offset_from_broadcast_start() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("a1");
    h.insert_chat(vod_id, "viewer", "2025-10-19T10:05:00Z");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let messages = vodsync::db::chat_repo::list(&h.db, vod_id, None, 10).unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].rel_timestamp, Some(300.0));
    assert!(!messages[0].clock_skew);
}

#[tokio::test]
async fn test_download_recovers_from_two_transient_failures() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("b1");
    let media = Arc::new(FakeMediaServer::new(MEDIA, 2));

    h.download_worker(media.clone())
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let progress = h.progress_row(vod_id);
    assert_eq!(progress.state, VodState::Downloaded);
    assert_eq!(progress.retries, 2);
    assert_eq!(progress.percent, 100.0);
    assert_eq!(media.offsets(), vec![0, 0, 0]);
}

#[tokio::test]
async fn test_download_gives_up_after_retry_budget() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("b2");
    let media = Arc::new(FakeMediaServer::new(MEDIA, 100));

    h.download_worker(media.clone())
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let view = h.view(vod_id);
    assert_eq!(view.state, VodState::Failed);
    assert_eq!(view.retries, common::harness::MAX_RETRIES);
    assert_eq!(view.failure_kind.as_deref(), Some("exhausted"));
    assert_eq!(media.offsets().len(), common::harness::MAX_RETRIES as usize + 1);
}

#[tokio::test]
async fn test_download_resumes_partial_file_after_restart() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("b3");
    std::fs::create_dir_all(&h.media_dir).unwrap();
    std::fs::write(h.media_dir.join(format!("{}.part", vod_id)), &MEDIA[..10]).unwrap();
    let media = Arc::new(FakeMediaServer::new(MEDIA, 0));

    h.download_worker(media.clone())
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let progress = h.progress_row(vod_id);
    assert_eq!(progress.state, VodState::Downloaded);
    assert_eq!(progress.retries, 0);
    assert_eq!(media.offsets(), vec![10]);
    assert_eq!(std::fs::read(progress.downloaded_path.unwrap()).unwrap(), MEDIA);
}

#[tokio::test]
async fn test_expired_token_with_failed_refresh_never_uploads() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("c1");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let client = Arc::new(FakeOAuthClient::rejecting());
    let tokens = h
        .token_manager(
            Arc::new(MemoryTokenStore::new()),
            client.clone(),
            Utc::now() - chrono::Duration::minutes(1),
        )
        .await;
    let publisher = Arc::new(FakePublisher::succeeding("never"));
    h.upload_worker(publisher.clone(), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    assert_eq!(client.calls(), 1);
    assert_eq!(publisher.calls(), 0);
    let view = h.view(vod_id);
    assert_eq!(view.state, VodState::Failed);
    assert_eq!(view.failure_kind.as_deref(), Some("auth"));
    assert!(!view.processed);
    h.assert_published_consistent(vod_id);
}

#[tokio::test]
async fn test_refresh_before_upload_keeps_refresh_token() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("c2");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let store = Arc::new(SqliteTokenStore::new(h.db.clone()));
    let tokens = h
        .token_manager(
            store.clone(),
            Arc::new(FakeOAuthClient::granting("at-refreshed")),
            Utc::now() - chrono::Duration::minutes(1),
        )
        .await;
    let publisher = Arc::new(FakePublisher::succeeding("vid"));
    h.upload_worker(publisher.clone(), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    assert_eq!(publisher.tokens(), vec!["at-refreshed".to_string()]);
    let stored = store.get_token(PROVIDER).await.unwrap();
    assert_eq!(stored.access_token, "at-refreshed");
    assert_eq!(stored.refresh_token, "rt-stored");
    assert!(stored.expiry > Utc::now());
    assert_eq!(h.view(vod_id).state, VodState::Uploaded);
}

#[tokio::test]
async fn test_missing_token_fails_upload_as_auth() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("c3");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let tokens = vodsync::TokenManager::new(
        Arc::new(MemoryTokenStore::new()),
        Arc::new(FakeOAuthClient::granting("unused")),
        PROVIDER,
        chrono::Duration::seconds(120),
    );
    let publisher = Arc::new(FakePublisher::succeeding("never"));
    h.upload_worker(publisher.clone(), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    assert_eq!(publisher.calls(), 0);
    assert_eq!(h.view(vod_id).failure_kind.as_deref(), Some("auth"));
}

#[tokio::test]
async fn test_rate_limited_upload_is_retried() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("c4");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let publisher = Arc::new(FakePublisher::new(vec![
        Err(PublishError::Status {
            status: 429,
            reason: Some("rateLimitExceeded".to_string()),
            body: String::new(),
            retry_after: Some(Duration::from_millis(10)),
        }),
        Ok("second-try".to_string()),
    ]));
    let tokens = h
        .token_manager(
            Arc::new(MemoryTokenStore::new()),
            Arc::new(FakeOAuthClient::rejecting()),
            hour_from_now(),
        )
        .await;
    h.upload_worker(publisher.clone(), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    assert_eq!(publisher.calls(), 2);
    let view = h.view(vod_id);
    assert_eq!(view.state, VodState::Uploaded);
    assert_eq!(view.retries, 1);
    h.assert_published_consistent(vod_id);
}

#[tokio::test]
async fn test_replay_resumes_strictly_after_cursor() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("d1");
    h.insert_chat(vod_id, "a", "2025-10-19T10:05:00Z");
    h.insert_chat(vod_id, "b", "2025-10-19T10:06:00Z");
    h.insert_chat(vod_id, "c", "2025-10-19T10:07:00Z");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();
    progress_repo::claim(&h.db, vod_id, Stage::Upload, "w", Utc::now(), chrono::Duration::seconds(60))
        .unwrap()
        .unwrap();
    progress_repo::fail(
        &h.db,
        vod_id,
        Stage::Upload,
        "w",
        vodsync::FailureKind::Terminal,
        "quota",
        Utc::now(),
    )
    .unwrap();

    let cursor: Cursor = "300.0".parse().unwrap();
    let events = collect(h.replay(16, 2).open(vod_id, Some(cursor), never_cancelled()).unwrap()).await;

    assert_eq!(rel_timestamps(&events), vec![360.0, 420.0]);
    assert_eq!(events.last(), Some(&ReplayEvent::End));
}

#[tokio::test]
async fn test_replay_resume_is_gap_free_across_reconnects() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("d2");
    for second in [1, 2, 2, 2, 3, 5, 8] {
        h.insert_chat(vod_id, "u", &format!("2025-10-19T10:00:{:02}Z", second));
    }
    h.correlator().correlate(vod_id).await.unwrap();
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();
    progress_repo::claim(&h.db, vod_id, Stage::Upload, "w", Utc::now(), chrono::Duration::seconds(60))
        .unwrap()
        .unwrap();
    progress_repo::complete_upload(&h.db, vod_id, "w", "https://www.youtube.com/watch?v=z", Utc::now())
        .unwrap();

    let full = collect(h.replay(64, 3).open(vod_id, None, never_cancelled()).unwrap()).await;
    let all_ids: Vec<i64> = full
        .iter()
        .filter_map(|e| match e {
            ReplayEvent::Chat(m) => Some(m.id),
            _ => None,
        })
        .collect();
    assert_eq!(all_ids.len(), 7);

    // Reconnect after every prefix, using the compound cursor of the last
    // message seen; the suffix must be exactly what remains.
    for (seen, event) in full.iter().enumerate().take(all_ids.len()) {
        let ReplayEvent::Chat(last) = event else {
            panic!("expected chat event");
        };
        let cursor = Cursor::after(last).unwrap();
        let rest = collect(h.replay(64, 2).open(vod_id, Some(cursor), never_cancelled()).unwrap()).await;
        let rest_ids: Vec<i64> = rest
            .iter()
            .filter_map(|e| match e {
                ReplayEvent::Chat(m) => Some(m.id),
                _ => None,
            })
            .collect();
        assert_eq!(rest_ids, all_ids[seen + 1..].to_vec(), "resume after {}", cursor);
    }
}

#[tokio::test]
async fn test_only_one_claim_wins() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("race");
    let now = Utc::now();
    let lease = chrono::Duration::seconds(60);

    let winners: Vec<bool> = std::thread::scope(|scope| {
        let handles: Vec<_> = ["w1", "w2", "w3", "w4"]
            .into_iter()
            .map(|owner| {
                let db = h.db.clone();
                scope.spawn(move || {
                    progress_repo::claim(&db, vod_id, Stage::Download, owner, now, lease)
                        .unwrap()
                        .is_some()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(winners.iter().filter(|w| **w).count(), 1);
    assert_eq!(h.progress_row(vod_id).state, VodState::Downloading);
}

#[tokio::test]
async fn test_chat_recorded_after_correlation_reaches_live_replay() {
    let h = TestHarness::new();
    let vod_id = h.insert_vod("d3");
    h.insert_chat(vod_id, "early", "2025-10-19T10:01:00Z");
    h.download_worker(Arc::new(FakeMediaServer::new(MEDIA, 0)))
        .run_once(&never_cancelled())
        .await
        .unwrap();
    assert!(h.progress_row(vod_id).correlated_at.is_some());

    let rx = h.replay(16, 10).open(vod_id, None, never_cancelled()).unwrap();
    h.insert_chat(vod_id, "late", "2025-10-19T10:20:00Z");

    let tokens = h
        .token_manager(
            Arc::new(MemoryTokenStore::new()),
            Arc::new(FakeOAuthClient::granting("unused")),
            hour_from_now(),
        )
        .await;
    h.upload_worker(Arc::new(FakePublisher::succeeding("vid-d3")), tokens)
        .run_once(&never_cancelled())
        .await
        .unwrap();

    let events = collect(rx).await;
    assert_eq!(rel_timestamps(&events), vec![60.0, 1200.0]);
    assert_eq!(events.last(), Some(&ReplayEvent::End));
    assert_eq!(h.view(vod_id).state, VodState::Uploaded);
}
