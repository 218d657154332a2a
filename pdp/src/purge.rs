use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::store::PgAllowListStore;

/// Background sweep deleting allow-list rows that expired longer ago than
/// `retention`. Recently-expired rows stay so decisions can report
/// ACCESS_EXPIRED instead of treating the field as unknown.
pub fn spawn(
    pool: PgPool,
    interval: Duration,
    retention: chrono::Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let store = PgAllowListStore::new(pool);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let cutoff = Utc::now() - retention;
            match store.purge_expired(cutoff).await {
                Ok(0) => {}
                Ok(purged) => {
                    metrics::counter!("pdp_allowlist_purged_total").increment(purged);
                    tracing::info!(purged, %cutoff, "purged expired allow-list entries");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "allow-list purge failed");
                }
            }
        }
    })
}
