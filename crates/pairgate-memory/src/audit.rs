//! Audit log — records the outcome of every link attempt.

use pairgate_core::{error::PairgateError, link::LinkMode};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

/// An entry to write to the audit log.
pub struct AuditEntry {
    pub attempt_id: String,
    pub key: Option<String>,
    pub mode: LinkMode,
    pub outcome: AuditOutcome,
    pub detail: Option<String>,
    pub retries: u32,
    pub duration_ms: Option<i64>,
}

/// How a link attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    Persisted,
    Skipped,
    Failed,
    TimedOut,
    Cancelled,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Persisted => "persisted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Audit logger backed by SQLite.
#[derive(Clone)]
pub struct AuditLogger {
    pool: SqlitePool,
}

impl AuditLogger {
    /// Create a new audit logger sharing the given pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Write an entry to the audit log.
    pub async fn log(&self, entry: &AuditEntry) -> Result<(), PairgateError> {
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO link_audit \
             (id, attempt_id, key, mode, outcome, detail, retries, duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&entry.attempt_id)
        .bind(&entry.key)
        .bind(entry.mode.as_str())
        .bind(entry.outcome.as_str())
        .bind(&entry.detail)
        .bind(entry.retries as i64)
        .bind(entry.duration_ms)
        .execute(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("audit log write failed: {e}")))?;

        debug!(
            "audit: {} {} [{}] {}",
            entry.mode,
            entry.key.as_deref().unwrap_or("-"),
            entry.outcome.as_str(),
            truncate(entry.detail.as_deref().unwrap_or(""), 80)
        );

        Ok(())
    }

    /// Recent outcomes, newest first: `(attempt_id, key, mode, outcome, detail, created_at)`.
    #[allow(clippy::type_complexity)]
    pub async fn recent(
        &self,
        limit: i64,
    ) -> Result<
        Vec<(
            String,
            Option<String>,
            String,
            String,
            Option<String>,
            String,
        )>,
        PairgateError,
    > {
        sqlx::query_as(
            "SELECT attempt_id, key, mode, outcome, detail, created_at FROM link_audit \
             ORDER BY created_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("query failed: {e}")))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
