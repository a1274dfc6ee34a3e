//! SQLite-backed session store.

mod expiry;
mod sessions;
mod versions;

use chrono::{DateTime, SecondsFormat, Utc};
use pairgate_core::{
    config::{shellexpand, MemoryConfig},
    error::PairgateError,
    link::{LinkMode, SessionFile, SessionRecord, SessionStatus},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// A freshly captured credential set, ready to persist.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub key: String,
    pub session_id: String,
    pub mode: LinkMode,
    pub credentials: serde_json::Value,
    pub files: Vec<SessionFile>,
}

/// Persistent session store backed by SQLite.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

/// Raw `sessions` row, in `SESSION_COLUMNS` order.
type SessionRow = (
    String,
    String,
    String,
    String,
    String,
    String,
    i64,
    String,
    String,
    Option<String>,
);

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SESSION_COLUMNS: &str = "key, session_id, mode, credentials, files_json, status, version, \
     created_at, updated_at, expires_at";

impl Store {
    /// Create a new store, running migrations on first use.
    pub async fn new(config: &MemoryConfig) -> Result<Self, PairgateError> {
        Self::open(&shellexpand(&config.db_path)).await
    }

    /// Open (or create) the database at an already-expanded path.
    pub async fn open(db_path: &str) -> Result<Self, PairgateError> {
        // Ensure parent directory exists.
        if let Some(parent) = std::path::Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| PairgateError::Memory(format!("failed to create data dir: {e}")))?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{db_path}"))
            .map_err(|e| PairgateError::Memory(format!("invalid db path: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| PairgateError::Memory(format!("failed to connect to sqlite: {e}")))?;

        Self::run_migrations(&pool).await?;

        info!("Session store initialized at {db_path}");

        Ok(Self { pool })
    }

    /// Begin a transaction that holds the write lock from its first statement.
    ///
    /// A deferred transaction that reads before writing cannot upgrade its
    /// snapshot once another connection has committed, and fails with
    /// `SQLITE_BUSY` instead of waiting.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, PairgateError> {
        self.pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(|e| PairgateError::Memory(format!("begin failed: {e}")))
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(pool: &SqlitePool) -> Result<(), PairgateError> {
        for migration in &[
            include_str!("../migrations/001_init.sql"),
            include_str!("../migrations/002_link_audit.sql"),
        ] {
            sqlx::raw_sql(migration)
                .execute(pool)
                .await
                .map_err(|e| PairgateError::Memory(format!("migration failed: {e}")))?;
        }
        Ok(())
    }

    /// Get the database file size in bytes.
    pub async fn db_size(&self) -> Result<u64, PairgateError> {
        let (page_count,): (i64,) = sqlx::query_as("PRAGMA page_count")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PairgateError::Memory(format!("pragma failed: {e}")))?;

        let (page_size,): (i64,) = sqlx::query_as("PRAGMA page_size")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PairgateError::Memory(format!("pragma failed: {e}")))?;

        Ok((page_count * page_size) as u64)
    }

    /// Delete every session, version, and audit row. Returns sessions removed.
    pub async fn reset(&self) -> Result<u64, PairgateError> {
        let mut tx = self.begin_write().await?;

        let removed = sqlx::query("DELETE FROM sessions")
            .execute(&mut *tx)
            .await
            .map_err(|e| PairgateError::Memory(format!("reset sessions failed: {e}")))?
            .rows_affected();
        for table in ["session_versions", "link_audit"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("reset {table} failed: {e}")))?;
        }

        tx.commit()
            .await
            .map_err(|e| PairgateError::Memory(format!("commit failed: {e}")))?;
        Ok(removed)
    }
}

/// Timestamps are stored as fixed-width RFC 3339 UTC text so they sort lexically.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, PairgateError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PairgateError::Memory(format!("bad timestamp '{value}': {e}")))
}

fn parse_files(json: &str) -> Result<Vec<SessionFile>, PairgateError> {
    serde_json::from_str(json)
        .map_err(|e| PairgateError::Memory(format!("bad file manifest: {e}")))
}

fn session_from_row(row: SessionRow) -> Result<SessionRecord, PairgateError> {
    let (
        key,
        session_id,
        mode,
        credentials,
        files_json,
        status,
        version,
        created_at,
        updated_at,
        expires_at,
    ) = row;

    Ok(SessionRecord {
        key,
        session_id,
        mode: mode.parse().map_err(PairgateError::Memory)?,
        credentials: serde_json::from_str(&credentials)
            .map_err(|e| PairgateError::Memory(format!("bad credentials document: {e}")))?,
        files: parse_files(&files_json)?,
        status: status.parse::<SessionStatus>().map_err(PairgateError::Memory)?,
        version,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use pairgate_core::link::FileKind;

    /// A store in a fresh temp directory. Keep the guard alive for the test.
    pub async fn temp_store() -> (Store, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        (store, dir)
    }

    pub fn new_session(key: &str, session_id: &str) -> NewSession {
        NewSession {
            key: key.to_string(),
            session_id: session_id.to_string(),
            mode: LinkMode::Pair,
            credentials: serde_json::json!({
                "creds.json": {"me": {"id": format!("{key}:1@s.whatsapp.net")}}
            }),
            files: vec![SessionFile {
                name: "creds.json".into(),
                kind: FileKind::Creds,
                size: 48,
            }],
        }
    }
}
