//! Append-only version history and retention.

use super::{parse_files, parse_ts, Store};
use pairgate_core::{error::PairgateError, link::SessionVersion};

impl Store {
    /// Version history for a key, newest first.
    pub async fn list_versions(&self, key: &str) -> Result<Vec<SessionVersion>, PairgateError> {
        let rows: Vec<VersionRow> = sqlx::query_as(
            "SELECT key, version, session_id, mode, files_json, created_at \
             FROM session_versions WHERE key = ? ORDER BY version DESC",
        )
        .bind(key)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("list_versions failed: {e}")))?;

        rows.into_iter().map(version_from_row).collect()
    }

    /// Credentials document captured by one version.
    pub async fn version_credentials(
        &self,
        key: &str,
        version: i64,
    ) -> Result<Option<serde_json::Value>, PairgateError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT credentials FROM session_versions WHERE key = ? AND version = ?",
        )
        .bind(key)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("query failed: {e}")))?;

        row.map(|(json,)| {
            serde_json::from_str(&json)
                .map_err(|e| PairgateError::Memory(format!("bad credentials document: {e}")))
        })
        .transpose()
    }

    /// Keep only the `keep` most recent versions of a key. Returns rows deleted.
    pub async fn prune_versions(&self, key: &str, keep: i64) -> Result<u64, PairgateError> {
        let result = sqlx::query(
            "DELETE FROM session_versions WHERE key = ? AND version NOT IN \
             (SELECT version FROM session_versions WHERE key = ? ORDER BY version DESC LIMIT ?)",
        )
        .bind(key)
        .bind(key)
        .bind(keep.max(1))
        .execute(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("prune_versions failed: {e}")))?;

        Ok(result.rows_affected())
    }
}

type VersionRow = (String, i64, String, String, String, String);

fn version_from_row(row: VersionRow) -> Result<SessionVersion, PairgateError> {
    let (key, version, session_id, mode, files_json, created_at) = row;
    Ok(SessionVersion {
        key,
        version,
        session_id,
        mode: mode.parse().map_err(PairgateError::Memory)?,
        files: parse_files(&files_json)?,
        created_at: parse_ts(&created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_versions_newest_first() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        for (i, sid) in ["pair_a", "pair_b", "pair_c"].iter().enumerate() {
            store
                .upsert_session(
                    &new_session("15551234567", sid),
                    90,
                    now + Duration::seconds(i as i64),
                )
                .await
                .unwrap();
        }

        let versions = store.list_versions("15551234567").await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![3, 2, 1]);
        assert_eq!(versions[0].session_id, "pair_c");
        assert_eq!(versions[0].files[0].name, "creds.json");
    }

    #[tokio::test]
    async fn test_prune_keeps_most_recent() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        for sid in ["a", "b", "c", "d"] {
            store
                .upsert_session(&new_session("15551234567", sid), 90, now)
                .await
                .unwrap();
        }

        assert_eq!(store.prune_versions("15551234567", 2).await.unwrap(), 2);
        let numbers: Vec<i64> = store
            .list_versions("15551234567")
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, vec![4, 3]);

        // Pruned versions no longer collide with the next link.
        let record = store
            .upsert_session(&new_session("15551234567", "e"), 90, now)
            .await
            .unwrap();
        assert_eq!(record.version, 5);
    }

    #[tokio::test]
    async fn test_version_credentials_lookup() {
        let (store, _dir) = temp_store().await;
        store
            .upsert_session(&new_session("15551234567", "a"), 90, Utc::now())
            .await
            .unwrap();

        let creds = store
            .version_credentials("15551234567", 1)
            .await
            .unwrap()
            .unwrap();
        assert!(creds.get("creds.json").is_some());
        assert!(store
            .version_credentials("15551234567", 9)
            .await
            .unwrap()
            .is_none());
    }
}
