//! Session records: single-document upsert keyed on the phone number.
//!
//! Every successful link for a key overwrites the `sessions` row in place and
//! appends a `session_versions` row, inside one transaction. A failed write
//! leaves the previous record untouched, so there is never more than one
//! active record per key.

use super::{session_from_row, ts, NewSession, SessionRow, Store, SESSION_COLUMNS};
use chrono::{DateTime, Duration, Utc};
use pairgate_core::{
    error::PairgateError,
    link::{SessionFile, SessionRecord, SessionStatus},
};
use tracing::debug;
use uuid::Uuid;

impl Store {
    /// Persist a captured credential set as the active record for its key.
    ///
    /// Re-persisting the same `session_id` updates that version in place
    /// instead of creating a new one.
    pub async fn upsert_session(
        &self,
        new: &NewSession,
        ttl_days: i64,
        now: DateTime<Utc>,
    ) -> Result<SessionRecord, PairgateError> {
        let credentials = serde_json::to_string(&new.credentials)?;
        let files_json = serde_json::to_string(&new.files)?;
        let now_s = ts(now);
        let expires_s = ts(now + Duration::days(ttl_days));

        let mut tx = self.begin_write().await?;

        let current: Option<(i64, String)> =
            sqlx::query_as("SELECT version, session_id FROM sessions WHERE key = ?")
                .bind(&new.key)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("query failed: {e}")))?;

        match current {
            Some((version, session_id)) if session_id == new.session_id => {
                sqlx::query(
                    "UPDATE sessions SET credentials = ?, files_json = ?, status = 'active', \
                     updated_at = ?, expires_at = ? WHERE key = ?",
                )
                .bind(&credentials)
                .bind(&files_json)
                .bind(&now_s)
                .bind(&expires_s)
                .bind(&new.key)
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("update session failed: {e}")))?;

                sqlx::query(
                    "UPDATE session_versions SET credentials = ?, files_json = ? \
                     WHERE key = ? AND version = ?",
                )
                .bind(&credentials)
                .bind(&files_json)
                .bind(&new.key)
                .bind(version)
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("update version failed: {e}")))?;
            }
            _ => {
                let (latest,): (i64,) = sqlx::query_as(
                    "SELECT COALESCE(MAX(version), 0) FROM session_versions WHERE key = ?",
                )
                .bind(&new.key)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("query failed: {e}")))?;
                let version = latest.max(current.map(|(v, _)| v).unwrap_or(0)) + 1;

                sqlx::query(
                    "INSERT INTO session_versions \
                     (id, key, version, session_id, mode, credentials, files_json, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&new.key)
                .bind(version)
                .bind(&new.session_id)
                .bind(new.mode.as_str())
                .bind(&credentials)
                .bind(&files_json)
                .bind(&now_s)
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("insert version failed: {e}")))?;

                sqlx::query(
                    "INSERT INTO sessions \
                     (key, session_id, mode, credentials, files_json, status, version, \
                      created_at, updated_at, expires_at) \
                     VALUES (?, ?, ?, ?, ?, 'active', ?, ?, ?, ?) \
                     ON CONFLICT(key) DO UPDATE SET \
                     session_id = excluded.session_id, mode = excluded.mode, \
                     credentials = excluded.credentials, files_json = excluded.files_json, \
                     status = 'active', version = excluded.version, \
                     updated_at = excluded.updated_at, expires_at = excluded.expires_at",
                )
                .bind(&new.key)
                .bind(&new.session_id)
                .bind(new.mode.as_str())
                .bind(&credentials)
                .bind(&files_json)
                .bind(version)
                .bind(&now_s)
                .bind(&now_s)
                .bind(&expires_s)
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("upsert session failed: {e}")))?;

                debug!("session {} stored as version {version}", new.key);
            }
        }

        tx.commit()
            .await
            .map_err(|e| PairgateError::Memory(format!("commit failed: {e}")))?;

        self.find_session(&new.key)
            .await?
            .ok_or_else(|| PairgateError::Memory(format!("session {} vanished", new.key)))
    }

    /// Refresh the credentials of the record written by `session_id`.
    ///
    /// Returns false when a newer link has replaced that record since.
    pub async fn refresh_credentials(
        &self,
        key: &str,
        session_id: &str,
        credentials: &serde_json::Value,
        files: &[SessionFile],
        now: DateTime<Utc>,
    ) -> Result<bool, PairgateError> {
        let credentials = serde_json::to_string(credentials)?;
        let files_json = serde_json::to_string(files)?;

        let mut tx = self.begin_write().await?;

        let result = sqlx::query(
            "UPDATE sessions SET credentials = ?, files_json = ?, updated_at = ? \
             WHERE key = ? AND session_id = ?",
        )
        .bind(&credentials)
        .bind(&files_json)
        .bind(ts(now))
        .bind(key)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| PairgateError::Memory(format!("refresh credentials failed: {e}")))?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            "UPDATE session_versions SET credentials = ?, files_json = ? \
             WHERE key = ? AND session_id = ?",
        )
        .bind(&credentials)
        .bind(&files_json)
        .bind(key)
        .bind(session_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| PairgateError::Memory(format!("refresh version failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| PairgateError::Memory(format!("commit failed: {e}")))?;
        Ok(true)
    }

    /// The active, unexpired session for a key.
    pub async fn get_session(
        &self,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRecord>, PairgateError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE key = ? AND status = 'active' AND (expires_at IS NULL OR expires_at > ?)"
        ))
        .bind(key)
        .bind(ts(now))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("get_session failed: {e}")))?;

        row.map(session_from_row).transpose()
    }

    /// The record for a key regardless of status.
    pub async fn find_session(&self, key: &str) -> Result<Option<SessionRecord>, PairgateError> {
        let row: Option<SessionRow> = sqlx::query_as(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("find_session failed: {e}")))?;

        row.map(session_from_row).transpose()
    }

    /// All sessions, newest first, optionally filtered by status.
    pub async fn list_sessions(
        &self,
        status: Option<SessionStatus>,
    ) -> Result<Vec<SessionRecord>, PairgateError> {
        let rows: Vec<SessionRow> = match status {
            Some(s) => {
                sqlx::query_as(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE status = ? \
                     ORDER BY updated_at DESC"
                ))
                .bind(s.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY updated_at DESC"
                ))
                .fetch_all(&self.pool)
                .await
            }
        }
        .map_err(|e| PairgateError::Memory(format!("list_sessions failed: {e}")))?;

        rows.into_iter().map(session_from_row).collect()
    }

    /// Number of sessions with the given status.
    pub async fn count_sessions(&self, status: SessionStatus) -> Result<i64, PairgateError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM sessions WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PairgateError::Memory(format!("query failed: {e}")))?;
        Ok(count)
    }

    /// Set the status of a key's record.
    pub async fn update_status(
        &self,
        key: &str,
        status: SessionStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, PairgateError> {
        let result = sqlx::query("UPDATE sessions SET status = ?, updated_at = ? WHERE key = ?")
            .bind(status.as_str())
            .bind(ts(now))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| PairgateError::Memory(format!("update_status failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete a key's record together with its version history.
    pub async fn delete_session(&self, key: &str) -> Result<bool, PairgateError> {
        let mut tx = self.begin_write().await?;

        sqlx::query("DELETE FROM session_versions WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| PairgateError::Memory(format!("delete versions failed: {e}")))?;

        let result = sqlx::query("DELETE FROM sessions WHERE key = ?")
            .bind(key)
            .execute(&mut *tx)
            .await
            .map_err(|e| PairgateError::Memory(format!("delete session failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| PairgateError::Memory(format!("commit failed: {e}")))?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn test_first_persist_is_active_version_one() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();

        let record = store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();

        assert_eq!(record.key, "15551234567");
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.version, 1);
        assert_eq!(
            record.credentials["creds.json"]["me"]["id"],
            "15551234567:1@s.whatsapp.net"
        );
        let expires = record.expires_at.unwrap();
        assert_eq!((expires - now).num_days(), 90);
    }

    #[tokio::test]
    async fn test_second_link_supersedes_first() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();

        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();
        let second = store
            .upsert_session(
                &new_session("15551234567", "pair_b"),
                90,
                now + Duration::seconds(10),
            )
            .await
            .unwrap();

        assert_eq!(second.session_id, "pair_b");
        assert_eq!(second.version, 2);
        assert_eq!(store.count_sessions(SessionStatus::Active).await.unwrap(), 1);
        assert_eq!(store.list_sessions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_same_attempt_persist_is_idempotent() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        let new = new_session("15551234567", "pair_a");

        store.upsert_session(&new, 90, now).await.unwrap();
        let again = store.upsert_session(&new, 90, now).await.unwrap();

        assert_eq!(again.version, 1);
        assert_eq!(store.list_versions("15551234567").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_reactivates_inactive_record() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();
        assert!(store
            .update_status("15551234567", SessionStatus::Inactive, now)
            .await
            .unwrap());
        assert!(store.get_session("15551234567", now).await.unwrap().is_none());

        let record = store
            .upsert_session(&new_session("15551234567", "pair_b"), 90, now)
            .await
            .unwrap();
        assert_eq!(record.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_get_session_skips_expired() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 1, now)
            .await
            .unwrap();

        assert!(store.get_session("15551234567", now).await.unwrap().is_some());
        let later = now + Duration::days(2);
        assert!(store.get_session("15551234567", later).await.unwrap().is_none());
        // Still visible to admin lookups.
        assert!(store.find_session("15551234567").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_refresh_only_touches_own_attempt() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();

        let updated = serde_json::json!({"creds.json": {"me": {"id": "x"}, "registered": true}});
        assert!(store
            .refresh_credentials("15551234567", "pair_a", &updated, &[], now)
            .await
            .unwrap());
        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(record.credentials["creds.json"]["registered"], true);

        assert!(!store
            .refresh_credentials("15551234567", "pair_old", &updated, &[], now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_refresh_failure_leaves_both_rows_unchanged() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_version_update BEFORE UPDATE ON session_versions \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let updated = serde_json::json!({"creds.json": {"registered": true}});
        assert!(store
            .refresh_credentials("15551234567", "pair_a", &updated, &[], now)
            .await
            .is_err());

        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(
            record.credentials["creds.json"]["me"]["id"],
            "15551234567:1@s.whatsapp.net"
        );
        assert!(record.credentials["creds.json"]["registered"].is_null());
    }

    #[tokio::test]
    async fn test_failed_link_never_replaces_active_record() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();
        // The history row goes in first; rejecting the upsert that follows
        // must roll it back too.
        sqlx::query(
            "CREATE TRIGGER reject_session_update BEFORE UPDATE ON sessions \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(store.pool())
        .await
        .unwrap();

        assert!(store
            .upsert_session(&new_session("15551234567", "pair_b"), 90, now)
            .await
            .is_err());

        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(record.session_id, "pair_a");
        assert_eq!(record.version, 1);
        let versions = store.list_versions("15551234567").await.unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].session_id, "pair_a");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_links_for_different_keys_all_persist() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();

        let mut tasks = tokio::task::JoinSet::new();
        for round in 0..5 {
            for n in 0..8 {
                let store = store.clone();
                tasks.spawn(async move {
                    let key = format!("1555{round}{n:06}");
                    let session_id = format!("pair_{key}");
                    store
                        .upsert_session(&new_session(&key, &session_id), 90, now)
                        .await
                });
            }
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        assert_eq!(store.count_sessions(SessionStatus::Active).await.unwrap(), 40);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_links_for_one_key_get_distinct_versions() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();

        let mut tasks = tokio::task::JoinSet::new();
        for n in 0..8 {
            let store = store.clone();
            tasks.spawn(async move {
                store
                    .upsert_session(&new_session("15551234567", &format!("pair_{n}")), 90, now)
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }

        let mut versions: Vec<i64> = store
            .list_versions("15551234567")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        versions.sort();
        assert_eq!(versions, (1..=8).collect::<Vec<_>>());
        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(record.version, 8);
        assert_eq!(store.count_sessions(SessionStatus::Active).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_session_removes_history() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();

        assert!(store.delete_session("15551234567").await.unwrap());
        assert!(!store.delete_session("15551234567").await.unwrap());
        assert!(store.list_versions("15551234567").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_sessions_by_status() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "pair_a"), 90, now)
            .await
            .unwrap();
        store
            .upsert_session(&new_session("447911123456", "pair_b"), 90, now)
            .await
            .unwrap();
        store
            .update_status("447911123456", SessionStatus::Inactive, now)
            .await
            .unwrap();

        let active = store
            .list_sessions(Some(SessionStatus::Active))
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key, "15551234567");
    }
}
