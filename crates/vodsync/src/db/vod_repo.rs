//! VOD repository: the `vods` table plus its one-to-one `progress` row.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{format_ts, parse_ts, Database, DatabaseError};

/// A recorded broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vod {
    pub id: i64,
    #[serde(rename = "sourceVodID")]
    pub source_vod_id: String,
    pub channel: String,
    pub title: String,
    pub broadcast_start: DateTime<Utc>,
    pub duration_seconds: i64,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    #[serde(rename = "publishedURL")]
    pub published_url: Option<String>,
}

impl Vod {
    fn from_row(row: &Row<'_>) -> Result<Self, DatabaseError> {
        let broadcast_start: String = row.get("broadcast_start")?;
        let created_at: String = row.get("created_at")?;
        Ok(Self {
            id: row.get("id")?,
            source_vod_id: row.get("source_vod_id")?,
            channel: row.get("channel")?,
            title: row.get("title")?,
            broadcast_start: parse_ts("broadcast_start", &broadcast_start)?,
            duration_seconds: row.get("duration_seconds")?,
            created_at: parse_ts("created_at", &created_at)?,
            processed: row.get("processed")?,
            published_url: row.get("published_url")?,
        })
    }
}

/// Fields supplied by discovery when a broadcast is first seen.
#[derive(Debug, Clone)]
pub struct NewVod {
    pub source_vod_id: String,
    pub channel: String,
    pub title: String,
    pub broadcast_start: DateTime<Utc>,
    pub duration_seconds: i64,
}

/// Inserts a VOD and its `queued` progress row in one transaction.
///
/// Idempotent on `source_vod_id`: returns `None` when the broadcast is
/// already represented, leaving the existing rows untouched.
pub fn insert_if_absent(
    db: &Database,
    vod: &NewVod,
    now: DateTime<Utc>,
) -> Result<Option<i64>, DatabaseError> {
    db.with_tx(|tx| {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO vods (source_vod_id, channel, title, broadcast_start,
             duration_seconds, created_at, processed, published_url)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, NULL)",
            params![
                vod.source_vod_id,
                vod.channel,
                vod.title,
                format_ts(vod.broadcast_start),
                vod.duration_seconds,
                format_ts(now),
            ],
        )?;
        if inserted == 0 {
            return Ok(None);
        }

        let id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO progress (vod_id, state, percent, retries, updated_at)
             VALUES (?1, 'queued', 0, 0, ?2)",
            params![id, format_ts(now)],
        )?;
        Ok(Some(id))
    })
}

/// Finds a VOD by its ID.
pub fn find_by_id(db: &Database, id: i64) -> Result<Option<Vod>, DatabaseError> {
    db.with_conn(|conn| find_by_id_in(conn, id))
}

pub(crate) fn find_by_id_in(conn: &Connection, id: i64) -> Result<Option<Vod>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM vods WHERE id = ?1")?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(Vod::from_row(row)?)),
        None => Ok(None),
    }
}

/// Finds a VOD by the source platform's id.
pub fn find_by_source_id(db: &Database, source_vod_id: &str) -> Result<Option<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let id = conn
            .query_row(
                "SELECT id FROM vods WHERE source_vod_id = ?1",
                params![source_vod_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(id)
    })
}

/// Sets the terminal publishing fields together.
///
/// Must run inside the same transaction as the `uploading -> uploaded`
/// transition so `processed` and `published_url` are never observed apart.
pub(crate) fn mark_published(
    conn: &Connection,
    vod_id: i64,
    published_url: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE vods SET processed = 1, published_url = ?2 WHERE id = ?1 AND processed = 0",
        params![vod_id, published_url],
    )?;
    Ok(changed == 1)
}
