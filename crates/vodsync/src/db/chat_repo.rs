//! Chat message repository: the `chat_messages` table.
//!
//! Rows are written by the live chat recorder with `rel_timestamp` unset,
//! filled in once by the correlator, and read in `(rel_timestamp, id)`
//! order by the query and replay surfaces.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::{Database, DatabaseError};

/// A captured chat message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    #[serde(rename = "vodID")]
    pub vod_id: i64,
    pub username: String,
    pub message: String,
    /// Capture time as written by the recorder (RFC3339).
    pub abs_timestamp: String,
    /// Seconds since broadcast start, `None` until correlated.
    pub rel_timestamp: Option<f64>,
    /// Set when `rel_timestamp` was clamped or could not be derived.
    pub clock_skew: bool,
    pub badges: String,
    pub emotes: String,
    pub color: Option<String>,
}

impl ChatMessage {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            vod_id: row.get("vod_id")?,
            username: row.get("username")?,
            message: row.get("message")?,
            abs_timestamp: row.get("abs_timestamp")?,
            rel_timestamp: row.get("rel_timestamp")?,
            clock_skew: row.get("clock_skew")?,
            badges: row.get("badges")?,
            emotes: row.get("emotes")?,
            color: row.get("color")?,
        })
    }
}

/// A message as handed over by the recorder.
#[derive(Debug, Clone)]
pub struct NewChatMessage {
    pub vod_id: i64,
    pub username: String,
    pub message: String,
    pub abs_timestamp: String,
    pub badges: String,
    pub emotes: String,
    pub color: Option<String>,
}

/// Result of correlating one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correlation {
    pub id: i64,
    pub rel_timestamp: f64,
    pub clock_skew: bool,
}

/// Inserts an uncorrelated message and returns its id.
pub fn insert_message(db: &Database, msg: &NewChatMessage) -> Result<i64, DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO chat_messages (vod_id, username, message, abs_timestamp,
             rel_timestamp, clock_skew, badges, emotes, color)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5, ?6, ?7)",
            params![
                msg.vod_id,
                msg.username,
                msg.message,
                msg.abs_timestamp,
                msg.badges,
                msg.emotes,
                msg.color,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    })
}

/// Uncorrelated `(id, abs_timestamp)` pairs of a VOD, in capture order.
pub(crate) fn uncorrelated(
    conn: &Connection,
    vod_id: i64,
) -> Result<Vec<(i64, String)>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, abs_timestamp FROM chat_messages
         WHERE vod_id = ?1 AND rel_timestamp IS NULL
         ORDER BY abs_timestamp ASC, id ASC",
    )?;
    let rows = stmt
        .query_map(params![vod_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes computed offsets. Rows that already carry one are left alone.
pub(crate) fn apply_correlation(
    conn: &Connection,
    correlations: &[Correlation],
) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare(
        "UPDATE chat_messages SET rel_timestamp = ?2, clock_skew = ?3
         WHERE id = ?1 AND rel_timestamp IS NULL",
    )?;
    let mut updated = 0;
    for c in correlations {
        updated += stmt.execute(params![c.id, c.rel_timestamp, c.clock_skew])?;
    }
    Ok(updated)
}

/// Number of messages of a VOD still waiting for correlation.
#[cfg(test)]
pub(crate) fn count_uncorrelated(db: &Database, vod_id: i64) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chat_messages WHERE vod_id = ?1 AND rel_timestamp IS NULL",
            params![vod_id],
            |r| r.get(0),
        )?;
        Ok(count as u64)
    })
}

/// Correlated messages of a VOD in playback order, optionally only those
/// at or after `min_rel` seconds.
pub fn list(
    db: &Database,
    vod_id: i64,
    min_rel: Option<f64>,
    limit: u32,
) -> Result<Vec<ChatMessage>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_messages
             WHERE vod_id = ?1 AND rel_timestamp IS NOT NULL
               AND (?2 IS NULL OR rel_timestamp >= ?2)
             ORDER BY rel_timestamp ASC, id ASC LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(params![vod_id, min_rel, limit], ChatMessage::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// The next page of correlated messages strictly after a position.
///
/// With `after_id` the position is the pair `(after_rel, after_id)`, so
/// rows sharing `after_rel` but with a larger id are still returned.
/// Without it every row at `after_rel` is skipped.
pub fn page_after(
    db: &Database,
    vod_id: i64,
    after_rel: Option<f64>,
    after_id: Option<i64>,
    limit: u32,
) -> Result<Vec<ChatMessage>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM chat_messages
             WHERE vod_id = ?1 AND rel_timestamp IS NOT NULL
               AND (?2 IS NULL
                    OR rel_timestamp > ?2
                    OR (?3 IS NOT NULL AND rel_timestamp = ?2 AND id > ?3))
             ORDER BY rel_timestamp ASC, id ASC LIMIT ?4",
        )?;
        let rows = stmt
            .query_map(
                params![vod_id, after_rel, after_id, limit],
                ChatMessage::from_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}
