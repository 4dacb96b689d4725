//! Periodic purge of history older than the retention horizon.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{error, info};

use crate::db::{bounded, HistoryStore};
use crate::error::StoreError;
use crate::state::{ActivityLog, EventKind, Health};

/// One purge pass. Returns rows removed.
pub async fn purge_once(
    store: &dyn HistoryStore,
    retention_days: i64,
    timeout: Duration,
    now: OffsetDateTime,
) -> Result<u64, StoreError> {
    let cutoff = now - time::Duration::days(retention_days);
    bounded(timeout, store.purge_older_than(cutoff)).await
}

/// Run the purge loop forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    store: Arc<dyn HistoryStore>,
    health: Arc<Health>,
    log: Arc<ActivityLog>,
    retention_days: i64,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    info!(
        retention_days,
        interval_secs = interval.as_secs(),
        "retention task started"
    );

    loop {
        ticker.tick().await;

        match purge_once(store.as_ref(), retention_days, timeout, OffsetDateTime::now_utc()).await {
            Ok(0) => health.set_store_connected(true),
            Ok(n) => {
                health.set_store_connected(true);
                info!(removed = n, "retention: purged old telemetry");
                log.record(EventKind::System, format!("purged {n} record(s) older than {retention_days} days"));
            }
            Err(e) => {
                health.set_store_connected(false);
                error!("retention: purge failed: {e}");
                log.record(EventKind::Error, format!("history purge failed ({e})"));
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
