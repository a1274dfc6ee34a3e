//! Background expiry sweep over persisted sessions.

use chrono::{DateTime, Duration, Utc};
use pairgate_core::{config::MemoryConfig, error::PairgateError};
use pairgate_memory::Store;
use tokio::sync::watch;
use tracing::{error, info};

/// Mark overdue sessions expired and purge the ones past the grace period.
///
/// Returns `(marked, purged)`.
pub async fn sweep_once(
    store: &Store,
    config: &MemoryConfig,
    now: DateTime<Utc>,
) -> Result<(u64, u64), PairgateError> {
    let marked = store.mark_expired(now).await?;
    let purged = store
        .purge_expired(now - Duration::days(config.expired_grace_days))
        .await?;
    Ok((marked, purged))
}

/// Run [`sweep_once`] every `sweep_interval_secs` until shutdown fires.
pub async fn sweep_loop(store: Store, config: MemoryConfig, mut shutdown: watch::Receiver<bool>) {
    let period = std::time::Duration::from_secs(config.sweep_interval_secs.max(1));
    let mut interval = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.changed() => break,
        }

        match sweep_once(&store, &config, Utc::now()).await {
            Ok((0, 0)) => {}
            Ok((marked, purged)) => {
                info!("session sweep: {marked} expired, {purged} purged")
            }
            Err(e) => error!("session sweep failed: {e}"),
        }
    }
}
