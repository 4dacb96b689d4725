//! In-memory, process-scoped state: the last-known telemetry per device,
//! link/store health for the health surface, and a short activity log for
//! the dashboard. Nothing here is persisted; a restart repopulates it from
//! the next inbound message.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Instant;
use time::OffsetDateTime;

use crate::telemetry::TelemetryRecord;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Last-known-state cache
// ---------------------------------------------------------------------------

/// Most recent valid record per device identifier.
///
/// Only the ingestion pipeline writes; viewers read on connect.
#[derive(Default)]
pub struct StateCache {
    latest: RwLock<HashMap<String, TelemetryRecord>>,
}

impl StateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, device_id: &str) -> Option<TelemetryRecord> {
        let map = self.latest.read().unwrap_or_else(|e| e.into_inner());
        map.get(device_id).cloned()
    }

    pub fn set(&self, device_id: &str, record: TelemetryRecord) {
        let mut map = self.latest.write().unwrap_or_else(|e| e.into_inner());
        map.insert(device_id.to_string(), record);
    }
}

// ---------------------------------------------------------------------------
// Health surface
// ---------------------------------------------------------------------------

pub struct Health {
    started_at: Instant,
    transport_connected: AtomicBool,
    store_connected: AtomicBool,
    last_message_at: Mutex<Option<OffsetDateTime>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub transport_connected: bool,
    pub store_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_message_at: Option<OffsetDateTime>,
    pub uptime_secs: u64,
}

impl Health {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            transport_connected: AtomicBool::new(false),
            store_connected: AtomicBool::new(false),
            last_message_at: Mutex::new(None),
        }
    }

    pub fn transport_connected(&self) -> bool {
        self.transport_connected.load(Ordering::SeqCst)
    }

    pub fn set_transport_connected(&self, connected: bool) {
        self.transport_connected.store(connected, Ordering::SeqCst);
    }

    pub fn set_store_connected(&self, connected: bool) {
        self.store_connected.store(connected, Ordering::SeqCst);
    }

    /// Stamp receipt of a valid telemetry message.
    pub fn touch(&self, at: OffsetDateTime) {
        *self.last_message_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
    }

    pub fn report(&self) -> HealthReport {
        HealthReport {
            transport_connected: self.transport_connected(),
            store_connected: self.store_connected.load(Ordering::SeqCst),
            last_message_at: *self.last_message_at.lock().unwrap_or_else(|e| e.into_inner()),
            uptime_secs: self.started_at.elapsed().as_secs(),
        }
    }
}

impl Default for Health {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Activity log
// ---------------------------------------------------------------------------

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Pump,
    Error,
    System,
}

#[derive(Default)]
pub struct ActivityLog {
    events: Mutex<VecDeque<SystemEvent>>,
}

impl ActivityLog {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn record(&self, kind: EventKind, detail: impl Into<String>) {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail: detail.into(),
        });
    }

    /// Newest first.
    pub fn recent(&self) -> Vec<SystemEvent> {
        let events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.iter().rev().cloned().collect()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(soil_pct: f64, at: OffsetDateTime) -> TelemetryRecord {
        TelemetryRecord {
            soil_raw: 500.0,
            soil_pct,
            soil_temp: 0.0,
            air_temp: 0.0,
            humidity: 50.0,
            pump_on: false,
            manual: false,
            pump_life: 0.0,
            timestamp: at,
        }
    }

    #[test]
    fn cache_starts_empty() {
        assert!(StateCache::new().get("garden-1").is_none());
    }

    #[test]
    fn cache_returns_last_of_n_records() {
        let cache = StateCache::new();
        let t0 = OffsetDateTime::now_utc();
        for i in 0..10 {
            cache.set("garden-1", record(i as f64, t0 + Duration::seconds(i)));
        }
        let got = cache.get("garden-1").unwrap();
        assert_eq!(got.soil_pct, 9.0);
        assert_eq!(got.timestamp, t0 + Duration::seconds(9));
    }

    #[test]
    fn cache_is_keyed_by_device() {
        let cache = StateCache::new();
        let now = OffsetDateTime::now_utc();
        cache.set("a", record(10.0, now));
        cache.set("b", record(20.0, now));
        assert_eq!(cache.get("a").unwrap().soil_pct, 10.0);
        assert_eq!(cache.get("b").unwrap().soil_pct, 20.0);
        assert!(cache.get("c").is_none());
    }

    #[test]
    fn health_defaults_to_disconnected() {
        let report = Health::new().report();
        assert!(!report.transport_connected);
        assert!(!report.store_connected);
        assert!(report.last_message_at.is_none());
    }

    #[test]
    fn health_tracks_flags_and_last_message() {
        let health = Health::new();
        let at = OffsetDateTime::now_utc();
        health.set_transport_connected(true);
        health.set_store_connected(true);
        health.touch(at);
        let report = health.report();
        assert!(report.transport_connected);
        assert!(report.store_connected);
        assert_eq!(report.last_message_at, Some(at));
    }

    #[test]
    fn health_report_serializes_camel_case() {
        let json = serde_json::to_value(Health::new().report()).unwrap();
        assert_eq!(json["transportConnected"], false);
        assert_eq!(json["storeConnected"], false);
        assert!(json["lastMessageAt"].is_null());
    }

    #[test]
    fn activity_log_is_bounded_and_newest_first() {
        let log = ActivityLog::new();
        for i in 0..(MAX_EVENTS + 5) {
            log.record(EventKind::System, format!("event {i}"));
        }
        let recent = log.recent();
        assert_eq!(recent.len(), MAX_EVENTS);
        assert_eq!(recent[0].detail, format!("event {}", MAX_EVENTS + 4));
        assert_eq!(recent.last().unwrap().detail, "event 5");
    }
}
