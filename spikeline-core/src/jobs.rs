//! Job reservations for concurrent populate runs
//!
//! Several workers may run populate against the same database. Before
//! computing a key, a worker claims it by inserting a row into the shared
//! jobs table; the composite primary key (entity, key_hash) makes the
//! claim race-free. A row that ends in `error` status stays behind and
//! blocks retries until an operator clears it; `ignore` rows skip keys
//! permanently without computing them.

use std::collections::HashSet;

use chrono::NaiveDateTime;
use sqlx::Row;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hash::key_hash;
use crate::key::{EntityKey, TIMESTAMP_FORMAT};
use crate::store::{fetch_all_with_binds, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// A worker is (or was) computing this key
    Reserved,
    /// The computation failed; held until cleared
    Error,
    /// Operator marked the key as not-to-be-computed
    Ignore,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Reserved => "reserved",
            JobStatus::Error => "error",
            JobStatus::Ignore => "ignore",
        }
    }

    pub fn parse(s: &str) -> Option<JobStatus> {
        match s {
            "reserved" => Some(JobStatus::Reserved),
            "error" => Some(JobStatus::Error),
            "ignore" => Some(JobStatus::Ignore),
            _ => None,
        }
    }
}

/// One row of the jobs table
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub entity: String,
    pub key_hash: Uuid,
    pub status: JobStatus,
    /// Snapshot of the key at reservation time, for operators
    pub key: serde_json::Value,
    pub error_message: Option<String>,
    pub host: String,
    pub pid: i64,
    pub reserved_at: NaiveDateTime,
}

/// Claim tracking over the shared jobs table
#[derive(Clone)]
pub struct JobQueue {
    store: Store,
    host: String,
    pid: i64,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_default();
        let pid = std::process::id() as i64;
        JobQueue { store, host, pid }
    }

    /// Try to claim a key for computation. Returns false when any claim
    /// (reserved, error, or ignore) already exists.
    pub async fn reserve(&self, entity: &str, key: &EntityKey) -> Result<bool> {
        let sql = format!(
            "INSERT OR IGNORE INTO \"{}\" \
             (entity, key_hash, status, key, error_message, host, pid, reserved_at) \
             VALUES (?, ?, 'reserved', ?, NULL, ?, ?, ?)",
            self.store.jobs_table()
        );
        let result = sqlx::query(&sql)
            .bind(entity)
            .bind(key_hash(entity, key).to_string())
            .bind(key.to_json().to_string())
            .bind(&self.host)
            .bind(self.pid)
            .bind(now_text())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release a claim after successful computation
    pub async fn complete(&self, entity: &str, key: &EntityKey) -> Result<()> {
        self.delete_row(entity, &key_hash(entity, key)).await?;
        Ok(())
    }

    /// Convert a claim into a persistent error marker
    pub async fn error(&self, entity: &str, key: &EntityKey, message: &str) -> Result<()> {
        self.upsert_status(entity, key, JobStatus::Error, Some(message))
            .await
    }

    /// Mark a key to be skipped by future populate runs
    pub async fn ignore(&self, entity: &str, key: &EntityKey) -> Result<()> {
        self.upsert_status(entity, key, JobStatus::Ignore, None).await
    }

    async fn upsert_status(
        &self,
        entity: &str,
        key: &EntityKey,
        status: JobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let sql = format!(
            "INSERT INTO \"{}\" \
             (entity, key_hash, status, key, error_message, host, pid, reserved_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (entity, key_hash) DO UPDATE SET \
             status = excluded.status, error_message = excluded.error_message",
            self.store.jobs_table()
        );
        sqlx::query(&sql)
            .bind(entity)
            .bind(key_hash(entity, key).to_string())
            .bind(status.as_str())
            .bind(key.to_json().to_string())
            .bind(message)
            .bind(&self.host)
            .bind(self.pid)
            .bind(now_text())
            .execute(self.store.pool())
            .await?;
        Ok(())
    }

    /// Drop the claim row for a key, whatever its status. Returns whether
    /// a row existed.
    pub async fn clear(&self, entity: &str, key: &EntityKey) -> Result<bool> {
        self.delete_row(entity, &key_hash(entity, key)).await
    }

    async fn delete_row(&self, entity: &str, hash: &Uuid) -> Result<bool> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE entity = ? AND key_hash = ?",
            self.store.jobs_table()
        );
        let result = sqlx::query(&sql)
            .bind(entity)
            .bind(hash.to_string())
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop all error markers for an entity. Returns how many were cleared.
    pub async fn clear_errors(&self, entity: &str) -> Result<u64> {
        let sql = format!(
            "DELETE FROM \"{}\" WHERE entity = ? AND status = 'error'",
            self.store.jobs_table()
        );
        let result = sqlx::query(&sql)
            .bind(entity)
            .execute(self.store.pool())
            .await?;
        Ok(result.rows_affected())
    }

    /// Key hashes of every claim for an entity. Populate pre-filters its
    /// candidate list against this set; the reserve insert remains the
    /// authoritative check.
    pub async fn excluded_hashes(&self, entity: &str) -> Result<HashSet<Uuid>> {
        let sql = format!(
            "SELECT key_hash FROM \"{}\" WHERE entity = ?",
            self.store.jobs_table()
        );
        let rows = sqlx::query(&sql)
            .bind(entity)
            .fetch_all(self.store.pool())
            .await?;
        let mut hashes = HashSet::with_capacity(rows.len());
        for row in rows {
            let text: String = row.try_get("key_hash")?;
            let hash = Uuid::parse_str(&text)
                .map_err(|e| Error::Internal(format!("stored key_hash is malformed: {}", e)))?;
            hashes.insert(hash);
        }
        Ok(hashes)
    }

    /// All claims, optionally narrowed to one entity, oldest first
    pub async fn list(&self, entity: Option<&str>) -> Result<Vec<JobRecord>> {
        let mut sql = format!(
            "SELECT entity, key_hash, status, key, error_message, host, pid, reserved_at \
             FROM \"{}\"",
            self.store.jobs_table()
        );
        let mut binds = Vec::new();
        if let Some(entity) = entity {
            sql.push_str(" WHERE entity = ?");
            binds.push(crate::key::AttrValue::Text(entity.to_string()));
        }
        sql.push_str(" ORDER BY reserved_at, entity, key_hash");
        let rows = fetch_all_with_binds(self.store.pool(), &sql, &binds).await?;
        rows.iter().map(decode_job).collect()
    }

    /// Reservations older than the given age. A reservation left behind by
    /// a crashed worker never completes on its own; operators list these
    /// and clear them to let another worker pick the key up.
    pub async fn stale(&self, older_than: chrono::Duration) -> Result<Vec<JobRecord>> {
        let cutoff = (chrono::Utc::now().naive_utc() - older_than)
            .format(TIMESTAMP_FORMAT)
            .to_string();
        let sql = format!(
            "SELECT entity, key_hash, status, key, error_message, host, pid, reserved_at \
             FROM \"{}\" WHERE status = 'reserved' AND reserved_at < ? \
             ORDER BY reserved_at, entity, key_hash",
            self.store.jobs_table()
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(self.store.pool())
            .await?;
        rows.iter().map(decode_job).collect()
    }
}

fn now_text() -> String {
    chrono::Utc::now()
        .naive_utc()
        .format(TIMESTAMP_FORMAT)
        .to_string()
}

fn decode_job(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let hash_text: String = row.try_get("key_hash")?;
    let status_text: String = row.try_get("status")?;
    let key_text: String = row.try_get("key")?;
    let reserved_text: String = row.try_get("reserved_at")?;
    Ok(JobRecord {
        entity: row.try_get("entity")?,
        key_hash: Uuid::parse_str(&hash_text)
            .map_err(|e| Error::Internal(format!("stored key_hash is malformed: {}", e)))?,
        status: JobStatus::parse(&status_text)
            .ok_or_else(|| Error::Internal(format!("unknown job status '{}'", status_text)))?,
        key: serde_json::from_str(&key_text)
            .map_err(|e| Error::Internal(format!("stored job key is malformed: {}", e)))?,
        error_message: row.try_get("error_message")?,
        host: row.try_get("host")?,
        pid: row.try_get("pid")?,
        reserved_at: crate::store::rows::parse_timestamp("reserved_at", &reserved_text)?,
    })
}
