//! SQLite storage for reconstructed trades.
//!
//! One table per trade type (`FPMMBuy`, `FPMMSell`, `FPMMFundingAdded`,
//! `FPMMFundingRemoved`), keyed by `(transaction_hash, trade_type)`. The
//! full document is kept as JSON next to a few indexed columns.
//!
//! Upserts merge field by field: keys present in the incoming document
//! overwrite stored ones, keys absent from it are left untouched. Writing
//! the same record twice is a no-op.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Statement};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::document::fields;
use crate::document::StoredTrade;
use crate::types::{TradeKey, TradeType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("stored document is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("store connection lock poisoned")]
    Poisoned,
}

/// Query over one collection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TradeFilter {
    /// Exact transaction hash (compared lower-cased).
    pub transaction_hash: Option<String>,
    /// Exact FPMM address (compared lower-cased).
    pub fpmm_address: Option<String>,
    /// Only documents without an enriched block timestamp.
    pub missing_timestamp: bool,
    /// Only documents lacking at least one of these fields.
    pub missing_any_field: Vec<String>,
    pub limit: Option<usize>,
}

/// Write a single record could not complete.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedWrite {
    pub key: TradeKey,
    pub error: String,
}

/// Outcome counts of one [`TradeStore::bulk_upsert`] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UpsertSummary {
    /// Keys that did not exist before.
    pub inserted: usize,
    /// Existing keys, whether or not anything changed.
    pub matched: usize,
    /// Existing keys whose stored document changed.
    pub modified: usize,
    /// Records that could not be written; the rest of the batch still was.
    pub failed: Vec<FailedWrite>,
}

impl UpsertSummary {
    pub fn absorb(&mut self, other: UpsertSummary) {
        self.inserted += other.inserted;
        self.matched += other.matched;
        self.modified += other.modified;
        self.failed.extend(other.failed);
    }
}

/// Document store for trades.
pub trait TradeStore: Send + Sync {
    /// Documents of one collection matching `filter`, ordered by block then hash.
    fn find(&self, trade_type: TradeType, filter: &TradeFilter) -> Result<Vec<Value>, StoreError>;

    /// Merge-upserts `trades` into the collection of `trade_type`.
    ///
    /// Every record is attempted independently; per-record failures are
    /// reported in [`UpsertSummary::failed`] and do not abort the batch.
    fn bulk_upsert(
        &self,
        trade_type: TradeType,
        trades: &[StoredTrade],
    ) -> Result<UpsertSummary, StoreError>;

    /// Transaction hashes present in any collection.
    fn known_hashes(&self) -> Result<HashSet<String>, StoreError>;

    /// Sets `timestamp` and `date` on every document of the listed blocks
    /// that does not carry a timestamp yet. Returns the number of documents updated.
    fn set_block_timestamps(
        &self,
        trade_type: TradeType,
        timestamps: &[(u64, u64)],
    ) -> Result<usize, StoreError>;

    /// Number of documents in a collection.
    fn count(&self, trade_type: TradeType) -> Result<u64, StoreError>;
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Creates or opens a SQLite database with WAL mode enabled.
    ///
    /// # Errors
    /// Returns error if the database cannot be opened or migrations fail.
    pub fn new(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.run_migrations()?;
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        for trade_type in TradeType::ALL {
            let table = trade_type.collection();
            conn.execute_batch(&format!(
                "
                CREATE TABLE IF NOT EXISTS {table} (
                    transaction_hash TEXT NOT NULL,
                    trade_type TEXT NOT NULL,
                    fpmm_address TEXT NOT NULL,
                    block_number INTEGER NOT NULL,
                    block_timestamp INTEGER,
                    document TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (transaction_hash, trade_type)
                );
                CREATE INDEX IF NOT EXISTS idx_{table}_block ON {table}(block_number);
                CREATE INDEX IF NOT EXISTS idx_{table}_fpmm ON {table}(fpmm_address);
                "
            ))?;
        }
        Ok(())
    }
}

enum WriteOutcome {
    Inserted,
    Unchanged,
    Modified,
}

/// Shallow merge: incoming keys overwrite, absent keys survive.
fn merge_documents(existing: Value, incoming: &Value) -> Value {
    match (existing, incoming) {
        (Value::Object(mut stored), Value::Object(update)) => {
            for (key, value) in update {
                stored.insert(key.clone(), value.clone());
            }
            Value::Object(stored)
        }
        (_, replacement) => replacement.clone(),
    }
}

fn upsert_one(
    select: &mut Statement<'_>,
    insert: &mut Statement<'_>,
    update: &mut Statement<'_>,
    trade: &StoredTrade,
    now: &str,
) -> Result<WriteOutcome, StoreError> {
    let hash = trade.key.transaction_hash.to_ascii_lowercase();
    let kind = trade.key.trade_type.as_str();
    let existing: Option<String> = select
        .query_row(params![hash, kind], |row| row.get(0))
        .optional()?;

    match existing {
        None => {
            let body = serde_json::to_string(&trade.document)?;
            insert.execute(params![
                hash,
                kind,
                trade.fpmm_address,
                trade.block_number as i64,
                body,
                now
            ])?;
            Ok(WriteOutcome::Inserted)
        }
        Some(stored) => {
            let stored: Value = serde_json::from_str(&stored)?;
            let merged = merge_documents(stored.clone(), &trade.document);
            if merged == stored {
                return Ok(WriteOutcome::Unchanged);
            }
            let body = serde_json::to_string(&merged)?;
            update.execute(params![
                body,
                trade.fpmm_address,
                trade.block_number as i64,
                now,
                hash,
                kind
            ])?;
            Ok(WriteOutcome::Modified)
        }
    }
}

fn is_missing(document: &Value, field: &str) -> bool {
    document.get(field).map_or(true, Value::is_null)
}

fn date_string(timestamp: u64) -> Option<String> {
    let secs = i64::try_from(timestamp).ok()?;
    DateTime::<Utc>::from_timestamp(secs, 0).map(|dt| dt.format("%Y-%m-%d").to_string())
}

impl TradeStore for SqliteStore {
    fn find(&self, trade_type: TradeType, filter: &TradeFilter) -> Result<Vec<Value>, StoreError> {
        let table = trade_type.collection();
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();

        if let Some(hash) = &filter.transaction_hash {
            clauses.push("transaction_hash = ?");
            values.push(SqlValue::Text(hash.to_ascii_lowercase()));
        }
        if let Some(fpmm) = &filter.fpmm_address {
            clauses.push("fpmm_address = ?");
            values.push(SqlValue::Text(fpmm.to_ascii_lowercase()));
        }
        if filter.missing_timestamp {
            clauses.push("block_timestamp IS NULL");
        }

        let mut sql = format!("SELECT document FROM {table}");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY block_number, transaction_hash");

        let conn = self.lock()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(values.iter()), |row| {
            row.get::<_, String>(0)
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let document: Value = serde_json::from_str(&row?)?;
            if !filter.missing_any_field.is_empty()
                && !filter
                    .missing_any_field
                    .iter()
                    .any(|field| is_missing(&document, field))
            {
                continue;
            }
            documents.push(document);
            if filter.limit.is_some_and(|limit| documents.len() >= limit) {
                break;
            }
        }
        Ok(documents)
    }

    fn bulk_upsert(
        &self,
        trade_type: TradeType,
        trades: &[StoredTrade],
    ) -> Result<UpsertSummary, StoreError> {
        let table = trade_type.collection();
        let now = Utc::now().to_rfc3339();
        let mut summary = UpsertSummary::default();

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut select = tx.prepare(&format!(
                "SELECT document FROM {table} WHERE transaction_hash = ?1 AND trade_type = ?2"
            ))?;
            let mut insert = tx.prepare(&format!(
                "INSERT INTO {table} (
                    transaction_hash, trade_type, fpmm_address, block_number, document, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            ))?;
            let mut update = tx.prepare(&format!(
                "UPDATE {table}
                 SET document = ?1, fpmm_address = ?2, block_number = ?3, updated_at = ?4
                 WHERE transaction_hash = ?5 AND trade_type = ?6"
            ))?;

            for trade in trades {
                if trade.key.trade_type != trade_type {
                    summary.failed.push(FailedWrite {
                        key: trade.key.clone(),
                        error: format!("record of type {} sent to {table}", trade.key.trade_type),
                    });
                    continue;
                }
                match upsert_one(&mut select, &mut insert, &mut update, trade, &now) {
                    Ok(WriteOutcome::Inserted) => summary.inserted += 1,
                    Ok(WriteOutcome::Unchanged) => summary.matched += 1,
                    Ok(WriteOutcome::Modified) => {
                        summary.matched += 1;
                        summary.modified += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            tx_hash = %trade.key.transaction_hash,
                            collection = table,
                            error = %err,
                            "failed to write trade"
                        );
                        summary.failed.push(FailedWrite {
                            key: trade.key.clone(),
                            error: err.to_string(),
                        });
                    }
                }
            }
        }
        tx.commit()?;

        tracing::debug!(
            collection = table,
            inserted = summary.inserted,
            matched = summary.matched,
            modified = summary.modified,
            failed = summary.failed.len(),
            "bulk upsert complete"
        );
        Ok(summary)
    }

    fn known_hashes(&self) -> Result<HashSet<String>, StoreError> {
        let conn = self.lock()?;
        let mut hashes = HashSet::new();
        for trade_type in TradeType::ALL {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT transaction_hash FROM {}",
                trade_type.collection()
            ))?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                hashes.insert(row?);
            }
        }
        Ok(hashes)
    }

    fn set_block_timestamps(
        &self,
        trade_type: TradeType,
        timestamps: &[(u64, u64)],
    ) -> Result<usize, StoreError> {
        let table = trade_type.collection();
        let now = Utc::now().to_rfc3339();
        let mut updated = 0;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        {
            let mut select = tx.prepare(&format!(
                "SELECT transaction_hash, trade_type, document FROM {table}
                 WHERE block_number = ?1 AND block_timestamp IS NULL"
            ))?;
            let mut update = tx.prepare(&format!(
                "UPDATE {table} SET document = ?1, block_timestamp = ?2, updated_at = ?3
                 WHERE transaction_hash = ?4 AND trade_type = ?5"
            ))?;

            for &(block_number, timestamp) in timestamps {
                let rows = select
                    .query_map(params![block_number as i64], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;

                for (hash, kind, body) in rows {
                    let mut document: Value = serde_json::from_str(&body)?;
                    if let Some(map) = document.as_object_mut() {
                        map.insert(fields::TIMESTAMP.to_string(), Value::from(timestamp));
                        if let Some(date) = date_string(timestamp) {
                            map.insert(fields::DATE.to_string(), Value::String(date));
                        }
                    }
                    let body = serde_json::to_string(&document)?;
                    updated += update.execute(params![body, timestamp as i64, now, hash, kind])?;
                }
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    fn count(&self, trade_type: TradeType) -> Result<u64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", trade_type.collection()),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }
}

/// Returns a copy of `document` with only the listed top-level fields.
pub fn project(document: &Value, keep: &[&str]) -> Value {
    let mut projected = Map::new();
    if let Some(map) = document.as_object() {
        for key in keep {
            if let Some(value) = map.get(*key) {
                projected.insert((*key).to_string(), value.clone());
            }
        }
    }
    Value::Object(projected)
}
