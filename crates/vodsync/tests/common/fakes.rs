//! Scripted stand-ins for the network collaborators.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use vodsync::auth::{AuthError, OAuthClient, TokenGrant};
use vodsync::broadcast::VodProgressTracker;
use vodsync::download::{BodyStart, FetchError, MediaBody, MediaFetcher};
use vodsync::source::{BroadcastSource, EndedBroadcast, SourceError};
use vodsync::upload::{PublishError, PublishRequest, Publisher};

/// Reports a fixed set of ended broadcasts.
pub struct FakeSource {
    broadcasts: Vec<EndedBroadcast>,
}

impl FakeSource {
    pub fn new(broadcasts: Vec<EndedBroadcast>) -> Self {
        Self { broadcasts }
    }
}

#[async_trait]
impl BroadcastSource for FakeSource {
    async fn ended_broadcasts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EndedBroadcast>, SourceError> {
        Ok(self
            .broadcasts
            .iter()
            .filter(|b| since.map(|s| b.ended_at() > s).unwrap_or(true))
            .cloned()
            .collect())
    }
}

/// Serves one media file with range support, failing the first
/// `failures` requests with `503`.
pub struct FakeMediaServer {
    content: Vec<u8>,
    chunk_size: usize,
    failures: Mutex<u32>,
    offsets: Mutex<Vec<u64>>,
}

impl FakeMediaServer {
    pub fn new(content: &[u8], failures: u32) -> Self {
        Self {
            content: content.to_vec(),
            chunk_size: 4,
            failures: Mutex::new(failures),
            offsets: Mutex::new(Vec::new()),
        }
    }

    /// Offsets of every request, failed ones included.
    pub fn offsets(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaFetcher for FakeMediaServer {
    async fn open(&self, _url: &str, offset: u64) -> Result<MediaBody, FetchError> {
        self.offsets.lock().unwrap().push(offset);
        {
            let mut failures = self.failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(FetchError::Status { status: 503 });
            }
        }

        let total = self.content.len() as u64;
        let start = if offset == 0 {
            BodyStart::Restarted
        } else if offset == total {
            BodyStart::Complete
        } else {
            BodyStart::Resumed
        };
        let chunks: Vec<Result<Bytes, FetchError>> = self.content[offset as usize..]
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(MediaBody {
            start,
            total_bytes: Some(total),
            chunks: stream::iter(chunks).boxed(),
        })
    }
}

/// Upload API that answers from a script and records every call.
pub struct FakePublisher {
    replies: Mutex<VecDeque<Result<String, PublishError>>>,
    calls: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl FakePublisher {
    pub fn new(replies: Vec<Result<String, PublishError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn succeeding(video_id: &str) -> Self {
        Self::new(vec![Ok(video_id.to_string())])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Access tokens presented, in call order.
    pub fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        request: &PublishRequest,
        access_token: &SecretString,
        _tracker: &VodProgressTracker,
    ) -> Result<String, PublishError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap()
            .push(access_token.expose_secret().to_string());
        if !request.path.is_file() {
            return Err(PublishError::MissingFile(request.path.clone()));
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(PublishError::Protocol("unscripted call".to_string())))
    }
}

/// Token endpoint that either grants a fixed token or rejects.
pub struct FakeOAuthClient {
    grant: Option<TokenGrant>,
    calls: AtomicUsize,
}

impl FakeOAuthClient {
    /// Grants `access_token` without rotating the refresh token.
    pub fn granting(access_token: &str) -> Self {
        Self {
            grant: Some(TokenGrant {
                access_token: access_token.to_string(),
                refresh_token: None,
                expires_in: Some(3600),
                raw: format!(r#"{{"access_token":"{}","expires_in":3600}}"#, access_token),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            grant: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OAuthClient for FakeOAuthClient {
    async fn refresh(&self, _refresh_token: &str) -> Result<TokenGrant, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.grant {
            Some(grant) => Ok(grant.clone()),
            None => Err(AuthError::Rejected {
                status: 400,
                body: r#"{"error":"invalid_grant"}"#.to_string(),
            }),
        }
    }
}
