//! OAuth2 token lifecycle for the upload platform.
//!
//! - [`TokenStore`]: narrow persistence interface (`upsert_token` /
//!   `get_token`), backed by SQLite in production and by memory in tests.
//! - [`OAuthClient`]: the provider's token endpoint.
//! - [`TokenManager`]: hands out a valid access token, refreshing it when
//!   it is about to expire.

pub mod client;
pub mod manager;
pub mod store;

use crate::db::DatabaseError;
use crate::error::FailureKind;
use crate::secrets::SecretError;

pub use client::{HttpOAuthClient, OAuthClient, TokenGrant};
pub use manager::TokenManager;
pub use store::{MemoryTokenStore, SqliteTokenStore, StoredToken, TokenStore};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("No OAuth token stored for '{provider}'; run auth-url and auth-exchange first")]
    NoToken { provider: String },

    #[error("Stored OAuth token for '{provider}' cannot be refreshed (no refresh token)")]
    NoRefreshToken { provider: String },

    #[error("Token endpoint rejected the request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Token endpoint unavailable ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Malformed token response: {0}")]
    Malformed(String),

    #[error("OAuth client secret unavailable: {0}")]
    Secret(#[from] SecretError),

    #[error("Token store failed: {0}")]
    Store(#[from] DatabaseError),
}

impl AuthError {
    /// Everything that needs an operator to re-authorize is `Auth`; the
    /// rest may succeed on a later attempt.
    pub fn kind(&self) -> FailureKind {
        match self {
            AuthError::NoToken { .. }
            | AuthError::NoRefreshToken { .. }
            | AuthError::Rejected { .. }
            | AuthError::Secret(_) => FailureKind::Auth,
            AuthError::Server { .. }
            | AuthError::Http(_)
            | AuthError::Malformed(_)
            | AuthError::Store(_) => FailureKind::Transient,
        }
    }
}
