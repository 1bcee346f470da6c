//! Discovery watermark per channel: the `ingest_state` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{format_ts, parse_ts, Database, DatabaseError};

/// End time of the newest broadcast already handled for `channel`.
pub fn watermark(db: &Database, channel: &str) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    db.with_conn(|conn| {
        let value: Option<String> = conn
            .query_row(
                "SELECT watermark FROM ingest_state WHERE channel = ?1",
                params![channel],
                |r| r.get(0),
            )
            .optional()?;
        value.map(|v| parse_ts("watermark", &v)).transpose()
    })
}

/// Advances the watermark. A value older than the stored one is ignored.
pub fn advance_watermark(
    db: &Database,
    channel: &str,
    watermark: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "INSERT INTO ingest_state (channel, watermark, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel) DO UPDATE SET watermark = ?2, updated_at = ?3
             WHERE ingest_state.watermark < ?2",
            params![channel, format_ts(watermark), format_ts(now)],
        )?;
        Ok(changed == 1)
    })
}
