//! Ingestion pipeline.
//!
//! ```text
//! RECEIVED ──validate──▶ VALIDATED ──▶ CACHED ──▶ BROADCAST ──▶ PERSISTED
//!     │
//!     └──────────────▶ REJECTED (no side effects)
//! ```
//!
//! Each stage after validation is isolated: a failed broadcast does not stop
//! persistence, and a failed write does not undo the cache update or the
//! broadcast. Messages are handled one at a time by [`run`], so the cache
//! and the history store see them in transport order.

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broadcast::{BroadcastSink, TELEMETRY_EVENT};
use crate::db::{bounded, HistoryStore};
use crate::state::{ActivityLog, EventKind, Health, StateCache};
use crate::telemetry;

/// Longest raw-payload excerpt written to the log on rejection.
const MAX_LOGGED_PAYLOAD: usize = 256;

/// One message as handed over by the transport link.
#[derive(Debug)]
pub struct Inbound {
    pub device_id: String,
    pub payload: Vec<u8>,
}

/// Terminal state of one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Rejected,
    /// Cached and broadcast, but the history write failed.
    NotPersisted,
    Persisted,
}

#[derive(Clone)]
pub struct Pipeline {
    cache: Arc<StateCache>,
    sink: BroadcastSink,
    store: Arc<dyn HistoryStore>,
    health: Arc<Health>,
    log: Arc<ActivityLog>,
    write_timeout: Duration,
}

fn preview(payload: &[u8]) -> String {
    let end = payload.len().min(MAX_LOGGED_PAYLOAD);
    let mut s = String::from_utf8_lossy(&payload[..end]).into_owned();
    if payload.len() > end {
        s.push_str("...");
    }
    s
}

impl Pipeline {
    pub fn new(
        cache: Arc<StateCache>,
        sink: BroadcastSink,
        store: Arc<dyn HistoryStore>,
        health: Arc<Health>,
        log: Arc<ActivityLog>,
        write_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            sink,
            store,
            health,
            log,
            write_timeout,
        }
    }

    /// Take one message through every stage. Never fails; the outcome is
    /// returned for observability.
    pub async fn ingest(&self, device_id: &str, payload: &[u8]) -> Outcome {
        let received_at = OffsetDateTime::now_utc();

        // ── Validate ────────────────────────────────────────────────
        let record = match telemetry::parse(payload, received_at) {
            Ok(r) => r,
            Err(e) => {
                warn!(
                    device = %device_id,
                    reason = %e,
                    payload = %preview(payload),
                    "telemetry rejected"
                );
                self.log
                    .record(EventKind::Error, format!("{device_id}: rejected telemetry ({e})"));
                return Outcome::Rejected;
            }
        };

        // ── Cache ───────────────────────────────────────────────────
        self.cache.set(device_id, record.clone());
        self.health.touch(received_at);

        // ── Broadcast (best effort) ─────────────────────────────────
        match self.sink.push_to_all(TELEMETRY_EVENT, device_id, &record) {
            Ok(viewers) => debug!(device = %device_id, viewers, "telemetry broadcast"),
            Err(e) => warn!(device = %device_id, "broadcast failed: {e}"),
        }

        self.log.record(
            EventKind::Telemetry,
            format!(
                "{device_id}: soil {:.0}% hum {:.0}% pump {}{}",
                record.soil_pct,
                record.humidity,
                if record.pump_on { "ON" } else { "OFF" },
                if record.manual { " (manual)" } else { "" }
            ),
        );

        // ── Persist (best effort, bounded) ──────────────────────────
        match bounded(self.write_timeout, self.store.append(device_id, &record)).await {
            Ok(()) => {
                self.health.set_store_connected(true);
                Outcome::Persisted
            }
            Err(e) => {
                self.health.set_store_connected(false);
                error!(device = %device_id, "history write failed: {e}");
                self.log
                    .record(EventKind::Error, format!("{device_id}: history write failed ({e})"));
                Outcome::NotPersisted
            }
        }
    }

    /// Drain the inbound queue one message at a time until the sender side
    /// is dropped.
    pub async fn run(self, mut rx: mpsc::Receiver<Inbound>) {
        info!("ingestion pipeline started");
        while let Some(msg) = rx.recv().await {
            self.ingest(&msg.device_id, &msg.payload).await;
        }
        info!("ingestion pipeline stopped");
    }
}

// ===========================================================================
// Tests
// ===========================================================================
