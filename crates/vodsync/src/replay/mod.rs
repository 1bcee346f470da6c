//! Synchronized chat replay.
//!
//! A replay stream delivers a VOD's correlated chat in playback order,
//! starting after an optional [`Cursor`]. Rows are read in pages; once the
//! backlog is drained the producer waits for a [`ChatNotifier`] wake-up or
//! the poll interval, whichever comes first. The stream ends with
//! [`ReplayEvent::End`] when the VOD is uploaded or failed and nothing is
//! left to send.
//!
//! Each client gets a bounded queue and the producer waits while it is
//! full. A client whose queue stays full for longer than
//! `slow_client_timeout` is sent [`ReplayEvent::Error`] and dropped.

mod cursor;

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::broadcast::ChatNotifier;
use crate::config::ReplayConfig;
use crate::db::chat_repo::{self, ChatMessage};
use crate::db::progress_repo::{self, VodState};
use crate::db::{Database, DatabaseError};

pub use cursor::Cursor;

/// Sent to a client that could not keep up.
pub const SLOW_CONSUMER: &str = "slow_consumer";

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("Invalid replay cursor '{0}'")]
    InvalidCursor(String),

    #[error("Unknown VOD {0}")]
    UnknownVod(i64),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// One item on a replay stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayEvent {
    Chat(ChatMessage),
    /// Everything was delivered and the VOD will not change any more.
    End,
    /// The stream stopped abnormally; nothing follows.
    Error(String),
}

#[derive(Debug, Clone)]
pub struct ReplaySettings {
    pub poll_interval: Duration,
    /// Events queued per client.
    pub buffer_size: usize,
    pub page_size: u32,
    pub slow_client_timeout: Duration,
}

impl ReplaySettings {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            buffer_size: config.buffer_size.max(1),
            page_size: config.page_size.max(1),
            slow_client_timeout: config.slow_client_timeout(),
        }
    }
}

#[derive(Clone)]
pub struct ReplayService {
    db: Database,
    notifier: ChatNotifier,
    settings: ReplaySettings,
}

impl ReplayService {
    pub fn new(db: Database, notifier: ChatNotifier, settings: ReplaySettings) -> Self {
        Self {
            db,
            notifier,
            settings,
        }
    }

    /// Opens a replay stream for a VOD.
    ///
    /// The producer task stops when the receiver is dropped, when
    /// `shutdown` fires, or after sending `End` or `Error`.
    pub fn open(
        &self,
        vod_id: i64,
        cursor: Option<Cursor>,
        shutdown: CancellationToken,
    ) -> Result<mpsc::Receiver<ReplayEvent>, StreamError> {
        if progress_repo::view(&self.db, vod_id)?.is_none() {
            return Err(StreamError::UnknownVod(vod_id));
        }

        let (tx, rx) = mpsc::channel(self.settings.buffer_size + 1);
        let last = tx.clone().try_reserve_owned().ok();
        let producer = Producer {
            db: self.db.clone(),
            settings: self.settings.clone(),
            vod_id,
            position: cursor,
            tx,
            last,
        };
        let wake = self.notifier.subscribe();
        tokio::spawn(producer.run(wake, shutdown));
        log::debug!(
            "Replay stream opened for VOD {} at {}",
            vod_id,
            cursor.map(|c| c.to_string()).unwrap_or_else(|| "start".to_string())
        );
        Ok(rx)
    }
}

/// Why a producer stopped sending.
enum Stop {
    Disconnected,
    SlowConsumer,
    Shutdown,
}

struct Producer {
    db: Database,
    settings: ReplaySettings,
    vod_id: i64,
    position: Option<Cursor>,
    tx: mpsc::Sender<ReplayEvent>,
    /// Slot held back for the closing `End` or `Error`.
    last: Option<mpsc::OwnedPermit<ReplayEvent>>,
}

impl Producer {
    async fn run(mut self, mut wake: broadcast::Receiver<i64>, shutdown: CancellationToken) {
        let mut wake_open = true;
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            // Read the state before the page: rows that become visible
            // after a terminal state was observed are still picked up by
            // the next page.
            let finished = match self.is_finished() {
                Ok(finished) => finished,
                Err(e) => return self.abort(&e),
            };
            let page = match self.next_page() {
                Ok(page) => page,
                Err(e) => return self.abort(&e),
            };
            let drained = page.len() < self.settings.page_size as usize;

            match self.deliver(page, &shutdown).await {
                Ok(()) => {}
                Err(Stop::Shutdown) => return,
                Err(Stop::Disconnected) => {
                    log::debug!("Replay client for VOD {} disconnected", self.vod_id);
                    return;
                }
                Err(Stop::SlowConsumer) => {
                    log::warn!(
                        "Replay client for VOD {} left {} events unread for {:?}, dropping it",
                        self.vod_id,
                        self.settings.buffer_size,
                        self.settings.slow_client_timeout
                    );
                    return self.close(ReplayEvent::Error(SLOW_CONSUMER.to_string()));
                }
            }

            if !drained {
                continue;
            }
            if finished {
                log::debug!("Replay stream for VOD {} complete", self.vod_id);
                return self.close(ReplayEvent::End);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = self.tx.closed() => return,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                woke = wake.recv(), if wake_open => match woke {
                    // Any wake-up triggers a re-read, even for another VOD.
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => wake_open = false,
                },
            }
        }
    }

    fn is_finished(&self) -> Result<bool, DatabaseError> {
        Ok(progress_repo::view(&self.db, self.vod_id)?
            .map(|v| v.processed || matches!(v.state, VodState::Uploaded | VodState::Failed))
            .unwrap_or(true))
    }

    fn next_page(&self) -> Result<Vec<ChatMessage>, DatabaseError> {
        chat_repo::page_after(
            &self.db,
            self.vod_id,
            self.position.map(|c| c.rel_timestamp),
            self.position.and_then(|c| c.id),
            self.settings.page_size,
        )
    }

    async fn deliver(
        &mut self,
        page: Vec<ChatMessage>,
        shutdown: &CancellationToken,
    ) -> Result<(), Stop> {
        let deadline = self.settings.slow_client_timeout;
        for message in page {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return Err(Stop::Shutdown),
                reserved = tokio::time::timeout(deadline, self.tx.reserve()) => match reserved {
                    Ok(Ok(permit)) => permit,
                    Ok(Err(_)) => return Err(Stop::Disconnected),
                    Err(_) => return Err(Stop::SlowConsumer),
                },
            };
            let next = Cursor::after(&message);
            permit.send(ReplayEvent::Chat(message));
            self.position = next.or(self.position);
        }
        Ok(())
    }

    fn close(&mut self, event: ReplayEvent) {
        if let Some(permit) = self.last.take() {
            permit.send(event);
        }
    }

    fn abort(&mut self, error: &DatabaseError) {
        log::error!("Replay stream for VOD {} failed: {}", self.vod_id, error);
        self.close(ReplayEvent::Error("internal error".to_string()));
    }
}
