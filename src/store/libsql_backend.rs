//! libSQL backend — async `ConversationStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ConversationStore, TurnRecord};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so stored timestamps sort lexicographically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn row_to_turn(row: &libsql::Row) -> Result<TurnRecord, DatabaseError> {
    let column = |e: libsql::Error| DatabaseError::Serialization(format!("turn row: {e}"));
    let timestamp: String = row.get(5).map_err(column)?;
    let metadata: String = row.get(6).map_err(column)?;
    Ok(TurnRecord {
        id: row.get(0).map_err(column)?,
        contact_id: row.get(1).map_err(column)?,
        text: row.get(2).map_err(column)?,
        is_from_bot: row.get::<i64>(3).map_err(column)? != 0,
        message_type: row.get(4).map_err(column)?,
        timestamp: parse_datetime(&timestamp),
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| DatabaseError::Serialization(format!("turn metadata: {e}")))?,
    })
}

// ── ConversationStore implementation ────────────────────────────────

#[async_trait]
impl ConversationStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn save_turn(&self, turn: &TurnRecord) -> Result<bool, DatabaseError> {
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO conversation_turns (id, contact_id, text, is_from_bot, message_type, timestamp, metadata)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (id) DO NOTHING",
                params![
                    turn.id.as_str(),
                    turn.contact_id.as_str(),
                    turn.text.as_str(),
                    i64::from(turn.is_from_bot),
                    turn.message_type.as_str(),
                    format_datetime(&turn.timestamp),
                    turn.metadata.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_turn: {e}")))?;

        if inserted == 0 {
            debug!(id = %turn.id, "Turn already stored");
        }
        Ok(inserted > 0)
    }

    async fn list_turns(
        &self,
        contact_id: &str,
        limit: usize,
    ) -> Result<Vec<TurnRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, contact_id, text, is_from_bot, message_type, timestamp, metadata
                 FROM conversation_turns
                 WHERE contact_id = ?1
                 ORDER BY timestamp ASC, is_from_bot ASC
                 LIMIT ?2",
                params![contact_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_turns: {e}")))?;

        let mut turns = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_turns: {e}")))?
        {
            turns.push(row_to_turn(&row)?);
        }
        Ok(turns)
    }

    async fn count_turns(&self, contact_id: &str) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM conversation_turns WHERE contact_id = ?1",
                params![contact_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_turns: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count_turns: {e}")))?;
        match row {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_turns: {e}")))?;
                Ok(count.max(0) as usize)
            }
            None => Ok(0),
        }
    }
}
