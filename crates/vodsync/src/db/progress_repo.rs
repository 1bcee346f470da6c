//! Progress repository: the per-VOD state machine record.
//!
//! Every state change is a single conditional `UPDATE` whose affected-row
//! count decides which worker won. A losing update returns `Ok(false)` (or
//! `Ok(None)` for claims); callers treat that as "someone else has it".

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use super::{format_ts, parse_ts, parse_ts_opt, vod_repo, Database, DatabaseError};
use crate::error::FailureKind;

/// Pipeline state of a VOD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VodState {
    Queued,
    Downloading,
    Downloaded,
    Uploading,
    Uploaded,
    Failed,
}

impl VodState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VodState::Queued => "queued",
            VodState::Downloading => "downloading",
            VodState::Downloaded => "downloaded",
            VodState::Uploading => "uploading",
            VodState::Uploaded => "uploaded",
            VodState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(VodState::Queued),
            "downloading" => Some(VodState::Downloading),
            "downloaded" => Some(VodState::Downloaded),
            "uploading" => Some(VodState::Uploading),
            "uploaded" => Some(VodState::Uploaded),
            "failed" => Some(VodState::Failed),
            _ => None,
        }
    }

    /// Whether no worker will ever move this VOD again on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(self, VodState::Uploaded | VodState::Failed)
    }
}

impl fmt::Display for VodState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two claimable stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Download,
    Upload,
}

impl Stage {
    /// State held while a worker owns the VOD for this stage.
    pub fn active(&self) -> VodState {
        match self {
            Stage::Download => VodState::Downloading,
            Stage::Upload => VodState::Uploading,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Upload => "upload",
        }
    }
}

/// A progress row.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub vod_id: i64,
    pub state: VodState,
    pub percent: f64,
    pub retries: u32,
    pub total_bytes: Option<i64>,
    pub downloaded_path: Option<String>,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub correlated_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Progress {
    fn from_row(row: &Row<'_>) -> Result<Self, DatabaseError> {
        let state: String = row.get("state")?;
        let updated_at: String = row.get("updated_at")?;
        Ok(Self {
            vod_id: row.get("vod_id")?,
            state: VodState::parse(&state).ok_or(DatabaseError::Corrupt {
                column: "state",
                value: state.clone(),
            })?,
            percent: row.get("percent")?,
            retries: row.get("retries")?,
            total_bytes: row.get("total_bytes")?,
            downloaded_path: row.get("downloaded_path")?,
            last_error: row.get("last_error")?,
            failure_kind: row.get("failure_kind")?,
            lease_owner: row.get("lease_owner")?,
            lease_expires_at: parse_ts_opt("lease_expires_at", row.get("lease_expires_at")?)?,
            correlated_at: parse_ts_opt("correlated_at", row.get("correlated_at")?)?,
            updated_at: parse_ts("updated_at", &updated_at)?,
        })
    }
}

/// Finds the progress row of a VOD.
pub fn find(db: &Database, vod_id: i64) -> Result<Option<Progress>, DatabaseError> {
    db.with_conn(|conn| find_in(conn, vod_id))
}

fn find_in(conn: &Connection, vod_id: i64) -> Result<Option<Progress>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM progress WHERE vod_id = ?1")?;
    let mut rows = stmt.query(params![vod_id])?;
    match rows.next()? {
        Some(row) => Ok(Some(Progress::from_row(row)?)),
        None => Ok(None),
    }
}

/// Moves a VOD from `expected` to `next` if and only if it is still in
/// `expected`. Clears any lease.
fn transition(
    conn: &Connection,
    vod_id: i64,
    expected: VodState,
    next: VodState,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE progress SET state = ?3, lease_owner = NULL, lease_expires_at = NULL,
         updated_at = ?4
         WHERE vod_id = ?1 AND state = ?2",
        params![vod_id, expected.as_str(), next.as_str(), format_ts(now)],
    )?;
    if changed == 0 {
        log::debug!(
            "VOD {} transition {} -> {} lost (state changed underneath)",
            vod_id,
            expected,
            next
        );
    }
    Ok(changed == 1)
}

/// Lists VOD ids a worker for `stage` could claim right now: rows waiting
/// in the stage's pending state, plus rows stuck in its active state whose
/// lease has expired or was released.
pub fn candidates(
    db: &Database,
    stage: Stage,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<i64>, DatabaseError> {
    let pending_filter = match stage {
        Stage::Download => "state = 'queued'",
        Stage::Upload => "(state = 'downloaded' AND correlated_at IS NOT NULL)",
    };
    let sql = format!(
        "SELECT vod_id FROM progress
         WHERE {} OR (state = ?1 AND (lease_expires_at IS NULL OR lease_expires_at < ?2))
         ORDER BY updated_at ASC, vod_id ASC LIMIT ?3",
        pending_filter
    );
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(
                params![stage.active().as_str(), format_ts(now), limit],
                |r| r.get(0),
            )?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    })
}

/// Claims a VOD for `stage` under a lease held by `owner`.
///
/// Either moves a pending row into the active state or takes over an
/// active row whose lease expired. Claiming the upload stage resets
/// `retries` so each stage gets its own retry budget. Returns the claimed
/// row, or `None` if another worker got there first.
pub fn claim(
    db: &Database,
    vod_id: i64,
    stage: Stage,
    owner: &str,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<Option<Progress>, DatabaseError> {
    let now_s = format_ts(now);
    let expires = format_ts(now + lease);
    let fresh_sql = match stage {
        Stage::Download => {
            "UPDATE progress SET state = 'downloading', lease_owner = ?2,
             lease_expires_at = ?3, updated_at = ?4
             WHERE vod_id = ?1 AND state = 'queued'"
        }
        Stage::Upload => {
            "UPDATE progress SET state = 'uploading', retries = 0, last_error = NULL,
             lease_owner = ?2, lease_expires_at = ?3, updated_at = ?4
             WHERE vod_id = ?1 AND state = 'downloaded' AND correlated_at IS NOT NULL"
        }
    };

    db.with_conn(|conn| {
        let mut changed = conn.execute(fresh_sql, params![vod_id, owner, expires, now_s])?;
        if changed == 0 {
            changed = conn.execute(
                "UPDATE progress SET lease_owner = ?2, lease_expires_at = ?3, updated_at = ?4
                 WHERE vod_id = ?1 AND state = ?5
                   AND (lease_expires_at IS NULL OR lease_expires_at < ?4)",
                params![vod_id, owner, expires, now_s, stage.active().as_str()],
            )?;
            if changed == 1 {
                log::info!(
                    "VOD {} reclaimed for {} by {} (previous lease expired or released)",
                    vod_id,
                    stage.as_str(),
                    owner
                );
            }
        }
        if changed == 0 {
            log::debug!("VOD {} already claimed for {}", vod_id, stage.as_str());
            return Ok(None);
        }
        find_in(conn, vod_id)
    })
}

/// Persists download progress and renews the lease.
///
/// `percent` never decreases: the stored value is `MAX(stored, percent)`.
pub fn record_progress(
    db: &Database,
    vod_id: i64,
    owner: &str,
    percent: f64,
    total_bytes: Option<i64>,
    now: DateTime<Utc>,
    lease: Duration,
) -> Result<bool, DatabaseError> {
    let percent = percent.clamp(0.0, 100.0);
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET percent = MAX(percent, ?3),
             total_bytes = COALESCE(?4, total_bytes),
             lease_expires_at = ?5, updated_at = ?6
             WHERE vod_id = ?1 AND lease_owner = ?2 AND state IN ('downloading', 'uploading')",
            params![
                vod_id,
                owner,
                percent,
                total_bytes,
                format_ts(now + lease),
                format_ts(now)
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Records a worker-reported transient failure before the next attempt.
///
/// Increments `retries` only if it still equals `seen_retries`, so a
/// failure is never counted twice. A download retry starts a new attempt
/// and therefore resets `percent` to 0 in the same statement.
pub fn record_retry(
    db: &Database,
    vod_id: i64,
    stage: Stage,
    owner: &str,
    seen_retries: u32,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET retries = retries + 1,
             percent = CASE WHEN state = 'downloading' THEN 0 ELSE percent END,
             last_error = ?5, updated_at = ?6
             WHERE vod_id = ?1 AND state = ?2 AND lease_owner = ?3 AND retries = ?4",
            params![
                vod_id,
                stage.active().as_str(),
                owner,
                seen_retries,
                error,
                format_ts(now)
            ],
        )?;
        Ok(changed == 1)
    })
}

/// Moves an active VOD to `failed`, recording why.
pub fn fail(
    db: &Database,
    vod_id: i64,
    stage: Stage,
    owner: &str,
    kind: FailureKind,
    error: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET state = 'failed', failure_kind = ?4, last_error = ?5,
             lease_owner = NULL, lease_expires_at = NULL, updated_at = ?6
             WHERE vod_id = ?1 AND state = ?2 AND lease_owner = ?3",
            params![
                vod_id,
                stage.active().as_str(),
                owner,
                kind.as_str(),
                error,
                format_ts(now)
            ],
        )?;
        Ok(changed == 1)
    })
}

/// `downloading -> downloaded`, storing the final path and `percent = 100`.
pub fn complete_download(
    db: &Database,
    vod_id: i64,
    owner: &str,
    path: &str,
    total_bytes: Option<i64>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET state = 'downloaded', percent = 100, downloaded_path = ?3,
             total_bytes = COALESCE(?4, total_bytes), last_error = NULL,
             lease_owner = NULL, lease_expires_at = NULL, updated_at = ?5
             WHERE vod_id = ?1 AND state = 'downloading' AND lease_owner = ?2",
            params![vod_id, owner, path, total_bytes, format_ts(now)],
        )?;
        Ok(changed == 1)
    })
}

/// `uploading -> uploaded` together with `processed = 1` and the published
/// URL on the VOD, in one transaction.
pub fn complete_upload(
    db: &Database,
    vod_id: i64,
    owner: &str,
    published_url: &str,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_tx(|tx| {
        let changed = tx.execute(
            "UPDATE progress SET state = 'uploaded', last_error = NULL,
             lease_owner = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE vod_id = ?1 AND state = 'uploading' AND lease_owner = ?2",
            params![vod_id, owner, format_ts(now)],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        if !vod_repo::mark_published(tx, vod_id, published_url)? {
            return Err(DatabaseError::Conflict(format!(
                "VOD {} was already marked processed",
                vod_id
            )));
        }
        Ok(true)
    })
}

/// Drops the lease without changing state so the next worker can resume
/// immediately. Used on graceful shutdown.
pub fn release(db: &Database, vod_id: i64, owner: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET lease_owner = NULL, lease_expires_at = NULL, updated_at = ?3
             WHERE vod_id = ?1 AND lease_owner = ?2",
            params![vod_id, owner, format_ts(now)],
        )?;
        Ok(changed == 1)
    })
}

/// Extends a held lease to `until` without touching anything else.
pub fn renew_lease(
    db: &Database,
    vod_id: i64,
    owner: &str,
    until: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE progress SET lease_expires_at = ?3
             WHERE vod_id = ?1 AND lease_owner = ?2",
            params![vod_id, owner, format_ts(until)],
        )?;
        Ok(changed == 1)
    })
}

/// Marks chat correlation as finished, unblocking the upload stage.
///
/// Only a VOD whose download finished can be marked; correlating chat
/// earlier (e.g. by hand) leaves the gate closed.
pub(crate) fn mark_correlated(
    conn: &Connection,
    vod_id: i64,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE progress SET correlated_at = ?2, updated_at = ?2
         WHERE vod_id = ?1 AND correlated_at IS NULL
           AND state IN ('downloaded', 'uploading', 'uploaded', 'failed')",
        params![vod_id, format_ts(now)],
    )?;
    Ok(changed == 1)
}

/// VODs with correlation work left: downloaded VODs whose first pass
/// never finished, and downloaded or published VODs that received chat
/// after it did.
pub fn pending_correlation(db: &Database, limit: u32) -> Result<Vec<i64>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT p.vod_id FROM progress p
             WHERE (p.state = 'downloaded' AND p.correlated_at IS NULL)
                OR (p.state IN ('downloaded', 'uploading', 'uploaded')
                    AND EXISTS (SELECT 1 FROM chat_messages c
                                WHERE c.vod_id = p.vod_id AND c.rel_timestamp IS NULL))
             ORDER BY p.updated_at ASC, p.vod_id ASC LIMIT ?1",
        )?;
        let ids = stmt
            .query_map(params![limit], |r| r.get(0))?
            .collect::<Result<Vec<i64>, _>>()?;
        Ok(ids)
    })
}

/// Manually re-enqueues a failed VOD.
///
/// Goes back to `downloaded` when the downloaded file is still on disk
/// (only the upload is retried), otherwise to `queued`. Returns the new
/// state, or `None` if the VOD is not in `failed`.
pub fn reenqueue(
    db: &Database,
    vod_id: i64,
    now: DateTime<Utc>,
) -> Result<Option<VodState>, DatabaseError> {
    db.with_tx(|tx| {
        let Some(progress) = find_in(tx, vod_id)? else {
            return Ok(None);
        };
        if progress.state != VodState::Failed {
            return Ok(None);
        }

        let has_file = progress
            .downloaded_path
            .as_deref()
            .map(|p| Path::new(p).is_file())
            .unwrap_or(false);
        let next = if has_file {
            VodState::Downloaded
        } else {
            VodState::Queued
        };

        if !transition(tx, vod_id, VodState::Failed, next, now)? {
            return Ok(None);
        }
        tx.execute(
            "UPDATE progress SET retries = 0, last_error = NULL, failure_kind = NULL,
             percent = CASE WHEN state = 'queued' THEN 0 ELSE percent END,
             downloaded_path = CASE WHEN state = 'queued' THEN NULL ELSE downloaded_path END
             WHERE vod_id = ?1",
            params![vod_id],
        )?;
        log::info!("VOD {} re-enqueued: failed -> {}", vod_id, next);
        Ok(Some(next))
    })
}

/// Dashboard view of one VOD's progress.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressView {
    #[serde(rename = "vodID")]
    pub vod_id: i64,
    pub state: VodState,
    pub percent: f64,
    pub retries: u32,
    pub total_bytes: Option<i64>,
    pub downloaded_path: Option<String>,
    pub processed: bool,
    #[serde(rename = "publishedURL")]
    pub published_url: Option<String>,
    pub progress_updated_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
}

const VIEW_SELECT: &str = "SELECT p.*, v.processed, v.published_url
     FROM progress p JOIN vods v ON v.id = p.vod_id";

fn view_from_row(row: &Row<'_>) -> Result<ProgressView, DatabaseError> {
    let progress = Progress::from_row(row)?;
    Ok(ProgressView {
        vod_id: progress.vod_id,
        state: progress.state,
        percent: progress.percent,
        retries: progress.retries,
        total_bytes: progress.total_bytes,
        downloaded_path: progress.downloaded_path,
        processed: row.get("processed")?,
        published_url: row.get("published_url")?,
        progress_updated_at: progress.updated_at,
        last_error: progress.last_error,
        failure_kind: progress.failure_kind,
    })
}

/// Loads the dashboard view for a VOD, `None` if the VOD is unknown.
pub fn view(db: &Database, vod_id: i64) -> Result<Option<ProgressView>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!("{} WHERE p.vod_id = ?1", VIEW_SELECT))?;
        let mut rows = stmt.query(params![vod_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(view_from_row(row)?)),
            None => Ok(None),
        }
    })
}

/// Loads views for every VOD, most recently updated first.
pub fn list_views(db: &Database, limit: u64) -> Result<Vec<ProgressView>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "{} ORDER BY p.updated_at DESC, p.vod_id DESC LIMIT ?1",
            VIEW_SELECT
        ))?;
        let mut rows = stmt.query(params![limit as i64])?;
        let mut views = Vec::new();
        while let Some(row) = rows.next()? {
            views.push(view_from_row(row)?);
        }
        Ok(views)
    })
}
