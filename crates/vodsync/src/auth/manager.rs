use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use secrecy::SecretString;
use tokio::sync::Mutex;

use super::{AuthError, OAuthClient, StoredToken, TokenGrant, TokenStore};

/// Lifetime assumed when the provider does not say.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Hands out access tokens for one provider, refreshing them ahead of
/// expiry.
pub struct TokenManager {
    store: Arc<dyn TokenStore>,
    client: Arc<dyn OAuthClient>,
    provider: String,
    refresh_margin: Duration,
    // Serializes refreshes within this process. Other processes may still
    // refresh concurrently; both results are valid tokens.
    refresh_lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn TokenStore>,
        client: Arc<dyn OAuthClient>,
        provider: &str,
        refresh_margin: Duration,
    ) -> Self {
        Self {
            store,
            client,
            provider: provider.to_string(),
            refresh_margin,
            refresh_lock: Mutex::new(()),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Returns an access token valid for at least the refresh margin.
    ///
    /// Refreshes when the stored token expires within the margin. The
    /// refreshed token is persisted before it is returned; a refresh
    /// response without a refresh token keeps the stored one.
    pub async fn access_token(&self, now: DateTime<Utc>) -> Result<SecretString, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let token = self.store.get_token(&self.provider).await?;
        if token.is_absent() {
            return Err(AuthError::NoToken {
                provider: self.provider.clone(),
            });
        }
        if !token.access_token.is_empty() && token.expiry - self.refresh_margin > now {
            return Ok(SecretString::from(token.access_token));
        }
        if token.refresh_token.is_empty() {
            return Err(AuthError::NoRefreshToken {
                provider: self.provider.clone(),
            });
        }

        log::info!(
            "Access token for {} expires at {}, refreshing",
            self.provider,
            token.expiry
        );
        let grant = self.client.refresh(&token.refresh_token).await?;
        let stored = self.persist(grant, &token.refresh_token, now).await?;
        log::info!("Access token for {} valid until {}", self.provider, stored.expiry);
        Ok(SecretString::from(stored.access_token))
    }

    /// Stores a grant from the authorization-code exchange.
    pub async fn store_grant(
        &self,
        grant: TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<StoredToken, AuthError> {
        let _guard = self.refresh_lock.lock().await;
        self.persist(grant, "", now).await
    }

    async fn persist(
        &self,
        grant: TokenGrant,
        fallback_refresh: &str,
        now: DateTime<Utc>,
    ) -> Result<StoredToken, AuthError> {
        let expiry = now + Duration::seconds(grant.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS));
        let refresh_token = grant
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(fallback_refresh);
        self.store
            .upsert_token(
                &self.provider,
                &grant.access_token,
                refresh_token,
                expiry,
                &grant.raw,
            )
            .await?;
        self.store.get_token(&self.provider).await
    }
}
