//! YouTube Data API resumable upload.
//!
//! 1. `POST <upload_url>?uploadType=resumable&part=snippet,status` with the
//!    JSON metadata opens a session; its URI comes back in `Location`.
//! 2. The file is `PUT` to the session in chunks carrying `Content-Range`.
//!    `308` acknowledges a chunk (the `Range` header says how much the
//!    server has); `200`/`201` carries the created video resource.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

use super::{error_reason, PublishError, PublishRequest, Publisher};
use crate::broadcast::{ProgressPhase, VodProgressTracker};
use crate::config::UploadConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Chunk sizes must be multiples of this, except for the last chunk.
pub const CHUNK_GRANULARITY: u64 = 256 * 1024;

#[derive(Debug, Deserialize)]
struct VideoResource {
    id: String,
}

pub struct ResumableUploader {
    client: Client,
    upload_url: String,
    chunk_size: u64,
}

impl ResumableUploader {
    pub fn new(upload_url: &str, chunk_size: u64) -> Result<Self, PublishError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(CHUNK_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            upload_url: upload_url.to_string(),
            chunk_size: chunk_size.max(CHUNK_GRANULARITY) / CHUNK_GRANULARITY * CHUNK_GRANULARITY,
        })
    }

    pub fn from_config(config: &UploadConfig) -> Result<Self, PublishError> {
        Self::new(&config.upload_url, config.chunk_size_bytes)
    }

    async fn open_session(
        &self,
        request: &PublishRequest,
        access_token: &SecretString,
        total: u64,
    ) -> Result<String, PublishError> {
        let metadata = serde_json::json!({
            "snippet": {
                "title": request.title,
                "description": request.description,
                "categoryId": request.category_id,
            },
            "status": {
                "privacyStatus": request.privacy_status,
            },
        });

        let response = self
            .client
            .post(&self.upload_url)
            .query(&[("uploadType", "resumable"), ("part", "snippet,status")])
            .bearer_auth(access_token.expose_secret())
            .header("X-Upload-Content-Length", total.to_string())
            .header("X-Upload-Content-Type", "video/mp4")
            .json(&metadata)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| PublishError::Protocol("session response without Location".to_string()))
    }
}

#[async_trait]
impl Publisher for ResumableUploader {
    async fn publish(
        &self,
        request: &PublishRequest,
        access_token: &SecretString,
        tracker: &VodProgressTracker,
    ) -> Result<String, PublishError> {
        let total = file_size(&request.path).await?;
        let session = self.open_session(request, access_token, total).await?;
        log::debug!("VOD {} upload session opened ({} bytes)", request.vod_id, total);

        let mut file = File::open(&request.path)
            .await
            .map_err(|e| io_error(&request.path, e))?;
        let mut offset = 0u64;
        tracker.transfer(ProgressPhase::Uploading, 0, Some(total));

        while offset < total {
            let len = self.chunk_size.min(total - offset);
            let mut chunk = vec![0u8; len as usize];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_error(&request.path, e))?;
            file.read_exact(&mut chunk)
                .await
                .map_err(|e| io_error(&request.path, e))?;

            let response = self
                .client
                .put(&session)
                .bearer_auth(access_token.expose_secret())
                .header(CONTENT_TYPE, "video/mp4")
                .header(
                    CONTENT_RANGE,
                    format!("bytes {}-{}/{}", offset, offset + len - 1, total),
                )
                .body(chunk)
                .send()
                .await?;

            match response.status() {
                StatusCode::PERMANENT_REDIRECT => {
                    let acknowledged = response
                        .headers()
                        .get(RANGE)
                        .and_then(|v| v.to_str().ok())
                        .and_then(parse_acknowledged_range);
                    offset = acknowledged.unwrap_or(0);
                    tracker.transfer(ProgressPhase::Uploading, offset, Some(total));
                }
                StatusCode::OK | StatusCode::CREATED => {
                    tracker.transfer(ProgressPhase::Uploading, total, Some(total));
                    let video: VideoResource = response
                        .json()
                        .await
                        .map_err(|e| PublishError::Protocol(format!("unreadable video resource: {}", e)))?;
                    return Ok(video.id);
                }
                _ => return Err(status_error(response).await),
            }
        }

        Err(PublishError::Protocol(
            "server acknowledged every byte but never returned the video".to_string(),
        ))
    }
}

/// Next offset from a `308`'s `Range: bytes=0-<last>` header.
pub fn parse_acknowledged_range(value: &str) -> Option<u64> {
    let (first, last) = value.trim().strip_prefix("bytes=")?.split_once('-')?;
    if first.trim() != "0" {
        return None;
    }
    last.trim().parse::<u64>().ok().map(|last| last + 1)
}

async fn status_error(response: Response) -> PublishError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    PublishError::Status {
        status,
        reason: error_reason(&body),
        body: super::truncate_chars(&body, MAX_ERROR_BODY_LENGTH),
        retry_after,
    }
}

async fn file_size(path: &Path) -> Result<u64, PublishError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PublishError::MissingFile(path.to_path_buf()))
        }
        Err(e) => return Err(io_error(path, e)),
    };
    if !metadata.is_file() {
        return Err(PublishError::MissingFile(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(PublishError::EmptyFile(path.to_path_buf()));
    }
    Ok(metadata.len())
}

fn io_error(path: &Path, source: std::io::Error) -> PublishError {
    PublishError::Io {
        path: path.to_path_buf(),
        source,
    }
}
