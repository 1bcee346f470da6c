//! Media fetcher over plain HTTP with `Range` requests.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};

use super::{BodyStart, FetchError, MediaBody, MediaFetcher};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpMediaFetcher {
    client: Client,
}

impl HttpMediaFetcher {
    /// No overall request timeout: bodies are multi-gigabyte. Stalls are
    /// caught per chunk by the worker.
    pub fn new() -> Result<Self, FetchError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl MediaFetcher for HttpMediaFetcher {
    async fn open(&self, url: &str, offset: u64) -> Result<MediaBody, FetchError> {
        let mut request = self.client.get(url);
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        let response = request.send().await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let (start, total_bytes) = match status {
            StatusCode::PARTIAL_CONTENT => {
                let Some((Some(first), total)) = content_range else {
                    return Err(FetchError::Protocol(
                        "206 response without a usable Content-Range".to_string(),
                    ));
                };
                if first != offset {
                    return Err(FetchError::Protocol(format!(
                        "asked for bytes from {} but got bytes from {}",
                        offset, first
                    )));
                }
                (BodyStart::Resumed, total)
            }
            StatusCode::OK => {
                if offset > 0 {
                    log::info!("Server ignored range request for {}, restarting from 0", url);
                }
                (BodyStart::Restarted, response.content_length())
            }
            StatusCode::RANGE_NOT_SATISFIABLE if offset > 0 => {
                let total = content_range.and_then(|(_, total)| total);
                if total == Some(offset) {
                    (BodyStart::Complete, total)
                } else {
                    (BodyStart::Unsatisfiable, total)
                }
            }
            other => {
                return Err(FetchError::Status {
                    status: other.as_u16(),
                })
            }
        };

        let chunks = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Ok(MediaBody {
            start,
            total_bytes,
            chunks,
        })
    }
}

/// Parses `bytes <first>-<last>/<total>` and `bytes */<total>`.
///
/// Returns the first byte (absent for the `*` form) and the total size
/// (absent when the server sent `*`).
pub fn parse_content_range(value: &str) -> Option<(Option<u64>, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (range, total) = rest.split_once('/')?;
    let total = match total.trim() {
        "*" => None,
        t => Some(t.parse().ok()?),
    };
    let first = match range.trim() {
        "*" => None,
        r => {
            let (first, last) = r.split_once('-')?;
            let first: u64 = first.parse().ok()?;
            let last: u64 = last.parse().ok()?;
            if last < first {
                return None;
            }
            Some(first)
        }
    };
    Some((first, total))
}
