//! Schema migrations for the libSQL backend.
//!
//! Every step runs in its own transaction together with its `_migrations`
//! row, so a failed step leaves neither half-applied DDL nor a version
//! record behind.

use libsql::Connection;
use tracing::info;

use crate::error::DatabaseError;

struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only; a shipped step is never edited.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "conversation_turns",
        sql: r#"
            CREATE TABLE IF NOT EXISTS conversation_turns (
                id TEXT PRIMARY KEY,
                contact_id TEXT NOT NULL,
                text TEXT NOT NULL,
                is_from_bot INTEGER NOT NULL,
                message_type TEXT NOT NULL DEFAULT 'text',
                timestamp TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_turns_contact_timeline
                ON conversation_turns(contact_id, timestamp, is_from_bot);
        "#,
    },
    Migration {
        version: 2,
        name: "turn_metadata",
        sql: r#"
            ALTER TABLE conversation_turns ADD COLUMN metadata TEXT NOT NULL DEFAULT '{}';
        "#,
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    apply(conn, MIGRATIONS).await
}

async fn apply(conn: &Connection, steps: &[Migration]) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("_migrations: {e}")))?;

    let mut version = schema_version(conn).await?;
    for step in steps.iter().filter(move |s| s.version > version) {
        let failed = |e: libsql::Error| {
            DatabaseError::Migration(format!("V{} {}: {e}", step.version, step.name))
        };

        let tx = conn.transaction().await.map_err(failed)?;
        let written = async {
            tx.execute_batch(step.sql).await?;
            tx.execute(
                "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
                libsql::params![step.version, step.name],
            )
            .await
        }
        .await;
        if let Err(e) = written {
            tx.rollback().await.ok();
            return Err(failed(e));
        }
        tx.commit().await.map_err(failed)?;

        info!(version = step.version, name = step.name, "Migration applied");
        version = step.version;
    }

    info!(version, "Schema up to date");
    Ok(())
}

/// Highest applied version; 0 on a fresh database.
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Migration(format!("schema version: {e}"));

    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(read)?;
    match rows.next().await.map_err(read)? {
        Some(row) => row.get::<i64>(0).map_err(read),
        None => Ok(0),
    }
}
