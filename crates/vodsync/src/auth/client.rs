//! OAuth2 token endpoint client (authorization code + refresh grants).

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::{Client, Url};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::AuthError;
use crate::config::OAuthConfig;
use crate::secrets::resolve_secret;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum length for sanitized error bodies to prevent log flooding.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Truncates a token endpoint error body before it reaches logs or errors.
fn sanitize_oauth_error_body(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
        Some((idx, _)) => format!("{}... (truncated)", &body[..idx]),
        None => body.to_string(),
    }
}

/// A successful token endpoint response.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Providers commonly omit this on refresh.
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when given.
    pub expires_in: Option<i64>,
    /// The response body as received.
    pub raw: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// The provider's token endpoint.
#[async_trait]
pub trait OAuthClient: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError>;
}

pub struct HttpOAuthClient {
    client: Client,
    client_id: String,
    client_secret: SecretString,
    token_url: String,
    authorize_url: String,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl HttpOAuthClient {
    pub fn from_config(config: &OAuthConfig) -> Result<Self, AuthError> {
        let client_secret = resolve_secret(
            config.client_secret.as_deref(),
            config.client_secret_file.as_deref(),
            config.client_secret_env.as_deref(),
        )?;
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            client_id: config.client_id.clone(),
            client_secret,
            token_url: config.token_url.clone(),
            authorize_url: config.authorize_url.clone(),
            redirect_uri: config.redirect_uri.clone(),
            scopes: config.scopes.clone(),
        })
    }

    /// Consent page URL for the authorization-code flow. Asks for offline
    /// access so the provider issues a refresh token.
    pub fn authorize_url(&self, state: &str) -> Result<String, AuthError> {
        let scope = self.scopes.join(" ");
        let url = Url::parse_with_params(
            &self.authorize_url,
            &[
                ("response_type", "code"),
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", self.redirect_uri.as_str()),
                ("scope", scope.as_str()),
                ("state", state),
                ("access_type", "offline"),
                ("prompt", "consent"),
            ],
        )
        .map_err(|e| AuthError::Malformed(format!("invalid authorize_url: {}", e)))?;
        Ok(url.to_string())
    }

    /// Exchanges an authorization code for the first token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, AuthError> {
        info!("Exchanging authorization code");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("grant_type", "authorization_code"),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenGrant, AuthError> {
        let response = self.client.post(&self.token_url).form(params).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            let sanitized_body = sanitize_oauth_error_body(&body);
            warn!("Token endpoint returned {}: {}", status, sanitized_body);
            return Err(classify_failure(status.as_u16(), sanitized_body));
        }

        parse_grant(&body)
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, AuthError> {
        debug!("Refreshing access token");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("refresh_token", refresh_token),
            ("grant_type", "refresh_token"),
        ];
        let grant = self.token_request(&params).await?;
        info!("Successfully refreshed access token");
        Ok(grant)
    }
}

fn classify_failure(status: u16, body: String) -> AuthError {
    match status {
        429 | 500..=599 => AuthError::Server { status, body },
        _ => AuthError::Rejected { status, body },
    }
}

fn parse_grant(body: &str) -> Result<TokenGrant, AuthError> {
    let response: TokenResponse = serde_json::from_str(body).map_err(|e| {
        AuthError::Malformed(format!(
            "{} in {}",
            e,
            sanitize_oauth_error_body(body)
        ))
    })?;
    if response.access_token.is_empty() {
        return Err(AuthError::Malformed("empty access_token".to_string()));
    }
    Ok(TokenGrant {
        access_token: response.access_token,
        refresh_token: response.refresh_token.filter(|t| !t.is_empty()),
        expires_in: response.expires_in,
        raw: body.to_string(),
    })
}
