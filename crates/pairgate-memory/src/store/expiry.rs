//! Session expiry: mark past-due records, then purge them after a grace period.

use super::{ts, Store};
use chrono::{DateTime, Utc};
use pairgate_core::error::PairgateError;

impl Store {
    /// Mark every record whose `expires_at` has passed as `expired`.
    pub async fn mark_expired(&self, now: DateTime<Utc>) -> Result<u64, PairgateError> {
        let now_s = ts(now);
        let result = sqlx::query(
            "UPDATE sessions SET status = 'expired', updated_at = ? \
             WHERE status != 'expired' AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(&now_s)
        .bind(&now_s)
        .execute(&self.pool)
        .await
        .map_err(|e| PairgateError::Memory(format!("mark_expired failed: {e}")))?;

        Ok(result.rows_affected())
    }

    /// Delete expired records (and their history) that expired before `cutoff`.
    pub async fn purge_expired(&self, cutoff: DateTime<Utc>) -> Result<u64, PairgateError> {
        let cutoff_s = ts(cutoff);
        let mut tx = self.begin_write().await?;

        sqlx::query(
            "DELETE FROM session_versions WHERE key IN \
             (SELECT key FROM sessions WHERE status = 'expired' AND expires_at <= ?)",
        )
        .bind(&cutoff_s)
        .execute(&mut *tx)
        .await
        .map_err(|e| PairgateError::Memory(format!("purge versions failed: {e}")))?;

        let result =
            sqlx::query("DELETE FROM sessions WHERE status = 'expired' AND expires_at <= ?")
                .bind(&cutoff_s)
                .execute(&mut *tx)
                .await
                .map_err(|e| PairgateError::Memory(format!("purge sessions failed: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| PairgateError::Memory(format!("commit failed: {e}")))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use chrono::{Duration, Utc};
    use pairgate_core::link::SessionStatus;

    #[tokio::test]
    async fn test_mark_then_purge() {
        let (store, _dir) = temp_store().await;
        let now = Utc::now();
        store
            .upsert_session(&new_session("15551234567", "a"), 1, now)
            .await
            .unwrap();
        store
            .upsert_session(&new_session("447911123456", "b"), 30, now)
            .await
            .unwrap();

        let later = now + Duration::days(2);
        assert_eq!(store.mark_expired(later).await.unwrap(), 1);
        // Marking again is a no-op.
        assert_eq!(store.mark_expired(later).await.unwrap(), 0);

        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Expired);

        // Within the grace period nothing is purged.
        assert_eq!(store.purge_expired(now).await.unwrap(), 0);
        assert_eq!(store.purge_expired(later).await.unwrap(), 1);
        assert!(store.find_session("15551234567").await.unwrap().is_none());
        assert!(store.list_versions("15551234567").await.unwrap().is_empty());
        assert!(store.find_session("447911123456").await.unwrap().is_some());
    }
}
