use std::fmt;
use std::str::FromStr;

use super::StreamError;
use crate::db::chat_repo::ChatMessage;

/// Resume position in a replay stream.
///
/// `300.5` resumes after every message at 300.5 seconds; `300.5:17`
/// resumes after message 17, which may leave later messages sharing the
/// same offset still to come.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cursor {
    pub rel_timestamp: f64,
    pub id: Option<i64>,
}

impl Cursor {
    /// Cursor positioned right after `message`. `None` for uncorrelated
    /// messages, which are never streamed.
    pub fn after(message: &ChatMessage) -> Option<Self> {
        message.rel_timestamp.map(|rel| Self {
            rel_timestamp: rel,
            id: Some(message.id),
        })
    }
}

impl FromStr for Cursor {
    type Err = StreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::InvalidCursor(value.to_string());
        let (rel, id) = match value.trim().split_once(':') {
            Some((rel, id)) => (rel, Some(id.trim().parse::<i64>().map_err(|_| invalid())?)),
            None => (value.trim(), None),
        };
        let rel_timestamp: f64 = rel.trim().parse().map_err(|_| invalid())?;
        if !rel_timestamp.is_finite() {
            return Err(invalid());
        }
        Ok(Self { rel_timestamp, id })
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}:{}", self.rel_timestamp, id),
            None => write!(f, "{}", self.rel_timestamp),
        }
    }
}
