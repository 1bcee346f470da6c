//! OAuth token repository: CRUD operations for the `oauth_tokens` table.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{format_ts, parse_ts, Database, DatabaseError};

/// An OAuth token row. At most one per provider.
#[derive(Debug, Clone, PartialEq)]
pub struct OAuthTokenRow {
    pub provider: String,
    pub access_token: String,
    /// Empty when the provider never issued one.
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
    /// Provider response as received, for provider-specific fields.
    pub raw_payload: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Inserts or replaces the token of a provider.
///
/// An empty `refresh_token` never overwrites a stored one.
pub fn upsert(db: &Database, row: &OAuthTokenRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO oauth_tokens (provider, access_token, refresh_token, expiry,
             raw_payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(provider) DO UPDATE SET
               access_token = ?2,
               refresh_token = CASE WHEN ?3 = '' THEN oauth_tokens.refresh_token ELSE ?3 END,
               expiry = ?4,
               raw_payload = ?5,
               updated_at = ?7",
            params![
                row.provider,
                row.access_token,
                row.refresh_token,
                format_ts(row.expiry),
                row.raw_payload,
                format_ts(row.created_at),
                format_ts(row.updated_at),
            ],
        )?;
        Ok(())
    })
}

/// Finds the token of a provider.
pub fn find(db: &Database, provider: &str) -> Result<Option<OAuthTokenRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT provider, access_token, refresh_token, expiry, raw_payload,
             created_at, updated_at
             FROM oauth_tokens WHERE provider = ?1",
        )?;
        let mut rows = stmt.query(params![provider])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };
        let expiry: String = row.get(3)?;
        let created_at: String = row.get(5)?;
        let updated_at: String = row.get(6)?;
        Ok(Some(OAuthTokenRow {
            provider: row.get(0)?,
            access_token: row.get(1)?,
            refresh_token: row.get(2)?,
            expiry: parse_ts("expiry", &expiry)?,
            raw_payload: row.get(4)?,
            created_at: parse_ts("created_at", &created_at)?,
            updated_at: parse_ts("updated_at", &updated_at)?,
        }))
    })
}
