//! Token persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::AuthError;
use crate::db::{oauth_repo, Database, DatabaseError};

/// A provider's token as stored.
///
/// A missing token reads back as the default value: empty strings and the
/// Unix epoch as expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
    pub raw: String,
}

impl Default for StoredToken {
    fn default() -> Self {
        Self {
            access_token: String::new(),
            refresh_token: String::new(),
            expiry: DateTime::UNIX_EPOCH,
            raw: String::new(),
        }
    }
}

impl StoredToken {
    pub fn is_absent(&self) -> bool {
        self.access_token.is_empty() && self.refresh_token.is_empty()
    }
}

/// Persistence interface injected into the upload stage.
///
/// `upsert_token` with an empty `refresh_token` must keep the one already
/// stored.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn upsert_token(
        &self,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expiry: DateTime<Utc>,
        raw: &str,
    ) -> Result<(), AuthError>;

    async fn get_token(&self, provider: &str) -> Result<StoredToken, AuthError>;
}

/// `oauth_tokens` table backed store.
#[derive(Clone)]
pub struct SqliteTokenStore {
    db: Database,
}

impl SqliteTokenStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TokenStore for SqliteTokenStore {
    async fn upsert_token(
        &self,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expiry: DateTime<Utc>,
        raw: &str,
    ) -> Result<(), AuthError> {
        let now = Utc::now();
        oauth_repo::upsert(
            &self.db,
            &oauth_repo::OAuthTokenRow {
                provider: provider.to_string(),
                access_token: access_token.to_string(),
                refresh_token: refresh_token.to_string(),
                expiry,
                raw_payload: raw.to_string(),
                created_at: now,
                updated_at: now,
            },
        )?;
        Ok(())
    }

    async fn get_token(&self, provider: &str) -> Result<StoredToken, AuthError> {
        let row = oauth_repo::find(&self.db, provider)?;
        Ok(row
            .map(|r| StoredToken {
                access_token: r.access_token,
                refresh_token: r.refresh_token,
                expiry: r.expiry,
                raw: r.raw_payload,
            })
            .unwrap_or_default())
    }
}

/// In-process store for tests and one-shot tooling.
#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: Mutex<HashMap<String, StoredToken>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with one token.
    pub fn with_token(provider: &str, token: StoredToken) -> Self {
        let store = Self::new();
        if let Ok(mut tokens) = store.tokens.lock() {
            tokens.insert(provider.to_string(), token);
        }
        store
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn upsert_token(
        &self,
        provider: &str,
        access_token: &str,
        refresh_token: &str,
        expiry: DateTime<Utc>,
        raw: &str,
    ) -> Result<(), AuthError> {
        let mut tokens = self
            .tokens
            .lock()
            .map_err(|_| AuthError::Store(DatabaseError::LockPoisoned))?;
        let entry = tokens.entry(provider.to_string()).or_default();
        entry.access_token = access_token.to_string();
        if !refresh_token.is_empty() {
            entry.refresh_token = refresh_token.to_string();
        }
        entry.expiry = expiry;
        entry.raw = raw.to_string();
        Ok(())
    }

    async fn get_token(&self, provider: &str) -> Result<StoredToken, AuthError> {
        let tokens = self
            .tokens
            .lock()
            .map_err(|_| AuthError::Store(DatabaseError::LockPoisoned))?;
        Ok(tokens.get(provider).cloned().unwrap_or_default())
    }
}
