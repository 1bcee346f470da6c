//! HTTP surface: progress and chat queries, chat replay and the live
//! progress feed.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::broadcast::VodProgressBroadcaster;
use crate::db::chat_repo::{self, ChatMessage};
use crate::db::progress_repo::{self, ProgressView};
use crate::db::Database;
use crate::replay::{Cursor, ReplayEvent, ReplayService, StreamError};

const DEFAULT_LIST_LIMIT: u64 = 100;
const MAX_CHAT_PAGE: u32 = 1000;

/// Shared state of every handler.
pub struct AppState {
    pub db: Database,
    pub replay: ReplayService,
    pub progress: VodProgressBroadcaster,
    pub keep_alive: Duration,
    /// Ends open streams when cancelled.
    pub shutdown: CancellationToken,
}

/// Logs an error with context and maps it to a status code.
pub trait LogErr<T> {
    fn log_500(self, context: &str) -> Result<T, StatusCode>;

    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, StatusCode> {
        self.map_err(|e| {
            log::error!("{}: {}", context, e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
    }

    fn log_status(self, context: &str, status: StatusCode) -> Result<T, StatusCode> {
        self.map_err(|e| {
            log::warn!("{}: {}", context, e);
            status
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/vods", get(list_vods))
        .route("/vods/{id}/progress", get(vod_progress))
        .route("/vods/{id}/chat", get(vod_chat))
        .route("/vods/{id}/chat/stream", get(chat_stream))
        .route("/progress/stream", get(progress_stream))
        .with_state(state)
}

/// Serves until `state.shutdown` fires, then waits for open connections,
/// which the shutdown also ends.
pub async fn serve(listener: tokio::net::TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let shutdown = state.shutdown.clone();
    if let Ok(addr) = listener.local_addr() {
        log::info!("HTTP surface listening on {}", addr);
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<u64>,
}

/// GET /vods - Every VOD with its progress, most recently updated first
async fn list_vods(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ProgressView>>, StatusCode> {
    let views = progress_repo::list_views(&state.db, query.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .log_500("Failed to list VODs")?;
    Ok(Json(views))
}

/// GET /vods/{id}/progress
async fn vod_progress(
    State(state): State<Arc<AppState>>,
    Path(vod_id): Path<i64>,
) -> Result<Json<ProgressView>, StatusCode> {
    progress_repo::view(&state.db, vod_id)
        .log_500("Failed to load progress")?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct ChatQuery {
    min_rel: Option<f64>,
    limit: Option<u32>,
}

/// GET /vods/{id}/chat - Correlated chat in playback order
async fn vod_chat(
    State(state): State<Arc<AppState>>,
    Path(vod_id): Path<i64>,
    Query(query): Query<ChatQuery>,
) -> Result<Json<Vec<ChatMessage>>, StatusCode> {
    if progress_repo::view(&state.db, vod_id)
        .log_500("Failed to load progress")?
        .is_none()
    {
        return Err(StatusCode::NOT_FOUND);
    }
    let limit = query.limit.unwrap_or(MAX_CHAT_PAGE).min(MAX_CHAT_PAGE);
    let messages = chat_repo::list(&state.db, vod_id, query.min_rel, limit)
        .log_500("Failed to load chat")?;
    Ok(Json(messages))
}

#[derive(Debug, Deserialize)]
struct StreamQuery {
    cursor: Option<String>,
}

/// GET /vods/{id}/chat/stream - Chat replay over SSE
///
/// The resume cursor comes from `?cursor=` or, failing that, from the
/// `Last-Event-ID` header a reconnecting `EventSource` sends.
async fn chat_stream(
    State(state): State<Arc<AppState>>,
    Path(vod_id): Path<i64>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, StatusCode> {
    let raw_cursor = query.cursor.or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let cursor = raw_cursor
        .filter(|c| !c.trim().is_empty())
        .map(|c| c.parse::<Cursor>())
        .transpose()
        .log_status("Rejected replay cursor", StatusCode::BAD_REQUEST)?;

    let mut rx = match state.replay.open(vod_id, cursor, state.shutdown.child_token()) {
        Ok(rx) => rx,
        Err(StreamError::UnknownVod(_)) => return Err(StatusCode::NOT_FOUND),
        Err(StreamError::InvalidCursor(c)) => {
            log::warn!("Rejected replay cursor '{}'", c);
            return Err(StatusCode::BAD_REQUEST);
        }
        Err(e) => {
            log::error!("Failed to open replay stream: {}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let last = !matches!(event, ReplayEvent::Chat(_));
            if let Some(sse) = replay_event(vod_id, event) {
                yield Ok(sse);
            }
            if last {
                break;
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive)))
}

fn replay_event(vod_id: i64, event: ReplayEvent) -> Option<Event> {
    match event {
        ReplayEvent::Chat(message) => {
            let id = Cursor::after(&message)?.to_string();
            match Event::default().event("chat").id(id).json_data(&message) {
                Ok(event) => Some(event),
                Err(e) => {
                    log::error!("VOD {} chat message {} not serializable: {}", vod_id, message.id, e);
                    None
                }
            }
        }
        ReplayEvent::End => Some(Event::default().event("end").data("{}")),
        ReplayEvent::Error(reason) => Some(
            Event::default()
                .event("error")
                .data(serde_json::json!({ "error": reason }).to_string()),
        ),
    }
}

/// GET /progress/stream - Live pipeline progress over SSE
async fn progress_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.progress.subscribe();
    let shutdown = state.shutdown.clone();

    let stream = async_stream::stream! {
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = rx.recv() => received,
            };
            match received {
                Ok(event) => match Event::default().event("progress").json_data(&event) {
                    Ok(sse) => yield Ok(sse),
                    Err(e) => log::error!("Progress event not serializable: {}", e),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("Progress stream lagged, skipped {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::new().interval(state.keep_alive))
}
