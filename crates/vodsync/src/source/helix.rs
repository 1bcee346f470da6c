//! Twitch Helix discovery client.
//!
//! Lists the channel's archive videos and drops the one belonging to a
//! stream that is still live. Authenticates with an app access token
//! obtained through the client-credentials grant and cached until expiry.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::Mutex;

use super::{BroadcastSource, EndedBroadcast, SourceError};
use crate::config::SourceConfig;
use crate::secrets::resolve_secret;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_LENGTH: usize = 200;

#[derive(Debug, Deserialize)]
struct Page<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixVideo {
    id: String,
    #[serde(default)]
    stream_id: Option<String>,
    #[serde(default)]
    user_login: String,
    title: String,
    created_at: DateTime<Utc>,
    duration: String,
}

#[derive(Debug, Deserialize)]
struct HelixStream {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AppToken {
    access_token: String,
    expires_in: i64,
}

pub struct HelixSource {
    client: Client,
    api_base_url: String,
    token_url: String,
    client_id: String,
    client_secret: SecretString,
    user_id: String,
    channel: String,
    page_size: u32,
    app_token: Mutex<Option<(SecretString, DateTime<Utc>)>>,
}

impl HelixSource {
    pub fn from_config(config: &SourceConfig) -> Result<Self, SourceError> {
        if config.user_id.is_empty() || config.client_id.is_empty() {
            return Err(SourceError::Credentials(
                "source.user_id and source.client_id are required".to_string(),
            ));
        }
        let client_secret = resolve_secret(
            config.client_secret.as_deref(),
            config.client_secret_file.as_deref(),
            config.client_secret_env.as_deref(),
        )
        .map_err(|e| SourceError::Credentials(e.to_string()))?;

        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token_url: config.token_url.clone(),
            client_id: config.client_id.clone(),
            client_secret,
            user_id: config.user_id.clone(),
            channel: config.channel.clone(),
            page_size: config.page_size.clamp(1, 100),
            app_token: Mutex::new(None),
        })
    }

    async fn bearer(&self) -> Result<SecretString, SourceError> {
        let mut cached = self.app_token.lock().await;
        if let Some((token, expires_at)) = cached.as_ref() {
            if *expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Ok(token.clone());
            }
        }

        debug!("Requesting Helix app access token");
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.expose_secret()),
            ("grant_type", "client_credentials"),
        ];
        let response = self.client.post(&self.token_url).form(&params).send().await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status,
                body: truncate(&body),
            });
        }
        let token: AppToken = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;

        let secret = SecretString::from(token.access_token);
        *cached = Some((
            secret.clone(),
            Utc::now() + chrono::Duration::seconds(token.expires_in),
        ));
        Ok(secret)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, SourceError> {
        let token = self.bearer().await?;
        let response = self
            .client
            .get(format!("{}/{}", self.api_base_url, path))
            .header("Client-Id", &self.client_id)
            .bearer_auth(token.expose_secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            // Revoked or expired early; fetch a new one next time.
            *self.app_token.lock().await = None;
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Api {
                status: status.as_u16(),
                body: truncate(&body),
            });
        }
        let page: Page<T> = response
            .json()
            .await
            .map_err(|e| SourceError::Malformed(e.to_string()))?;
        Ok(page.data)
    }
}

#[async_trait]
impl BroadcastSource for HelixSource {
    async fn ended_broadcasts(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<EndedBroadcast>, SourceError> {
        let live: Vec<HelixStream> = self
            .get("streams", &[("user_id", self.user_id.clone())])
            .await?;
        let live_stream_id = live.into_iter().next().map(|s| s.id);

        let videos: Vec<HelixVideo> = self
            .get(
                "videos",
                &[
                    ("user_id", self.user_id.clone()),
                    ("type", "archive".to_string()),
                    ("first", self.page_size.to_string()),
                ],
            )
            .await?;

        let mut ended = Vec::new();
        for video in videos {
            if live_stream_id.is_some() && video.stream_id == live_stream_id {
                debug!("Skipping archive {} of the live stream", video.id);
                continue;
            }
            let Some(duration_seconds) = parse_helix_duration(&video.duration) else {
                return Err(SourceError::Malformed(format!(
                    "video {} has unparseable duration '{}'",
                    video.id, video.duration
                )));
            };
            let broadcast = EndedBroadcast {
                source_vod_id: video.id,
                channel: if video.user_login.is_empty() {
                    self.channel.clone()
                } else {
                    video.user_login
                },
                title: video.title,
                started_at: video.created_at,
                duration_seconds,
            };
            if since.is_some_and(|s| broadcast.ended_at() <= s) {
                continue;
            }
            ended.push(broadcast);
        }

        info!(
            "Helix reported {} ended broadcast(s) for {}",
            ended.len(),
            self.channel
        );
        Ok(ended)
    }
}

/// Parses Helix durations such as `3h8m33s`, `45m2s` or `12s`.
pub fn parse_helix_duration(value: &str) -> Option<i64> {
    let mut total = 0i64;
    let mut digits = String::new();
    for c in value.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let n: i64 = digits.parse().ok()?;
        digits.clear();
        total += match c {
            'h' => n * 3600,
            'm' => n * 60,
            's' => n,
            _ => return None,
        };
    }
    if !digits.is_empty() || value.is_empty() {
        return None;
    }
    Some(total)
}

fn truncate(body: &str) -> String {
    match body.char_indices().nth(MAX_ERROR_BODY_LENGTH) {
        Some((idx, _)) => format!("{}... (truncated)", &body[..idx]),
        None => body.to_string(),
    }
}
