//! Operator commands: translate `ON` / `OFF` / `AUTO` into a command-topic
//! publish and manage the per-device auto-off timer.
//!
//! ## Auto-off timer
//!
//! ```text
//!            ON(d>0)                    fires after min(d, cap)
//! (none) ─────────────▶ Pending ───────────────────────────────▶ publish PUMP_OFF, (none)
//!                        │  ▲
//!                        │  └── ON(d>0): cancel + reschedule
//!                        └───── OFF / AUTO: cancel ──────────▶ (none)
//! ```
//!
//! At most one timer is pending per device. A timer only removes its own
//! registry entry, so a replaced timer can never clear its successor.
//! Commands for one device are serialized from publish through the timer
//! update, and a firing timer takes the same lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::CommandError;

/// Hard upper bound on an auto-off delay, whatever the caller asked for.
pub const MAX_AUTO_OFF_SECS: u64 = 3600;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    On,
    Off,
    Auto,
}

impl PumpAction {
    /// Literal payload published on the command topic.
    pub fn wire(self) -> &'static str {
        match self {
            PumpAction::On => "PUMP_ON",
            PumpAction::Off => "PUMP_OFF",
            PumpAction::Auto => "AUTO",
        }
    }
}

impl FromStr for PumpAction {
    type Err = CommandError;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ON" => Ok(PumpAction::On),
            "OFF" => Ok(PumpAction::Off),
            "AUTO" => Ok(PumpAction::Auto),
            _ => Err(CommandError::InvalidAction(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound transport seam
// ---------------------------------------------------------------------------

/// Publishes a command payload for one device (at-least-once).
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish_command(&self, device_id: &str, payload: &'static str) -> Result<(), CommandError>;
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

struct PendingTimer {
    id: u64,
    handle: JoinHandle<()>,
}

type TimerRegistry = Arc<Mutex<HashMap<String, PendingTimer>>>;
type DeviceLock = Arc<tokio::sync::Mutex<()>>;

#[derive(Clone)]
pub struct CommandDispatcher {
    publisher: Arc<dyn CommandPublisher>,
    timers: TimerRegistry,
    device_locks: Arc<Mutex<HashMap<String, DeviceLock>>>,
    next_id: Arc<AtomicU64>,
    max_auto_off: Duration,
}

impl CommandDispatcher {
    pub fn new(publisher: Arc<dyn CommandPublisher>, max_auto_off_secs: u64) -> Self {
        Self {
            publisher,
            timers: Arc::new(Mutex::new(HashMap::new())),
            device_locks: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            max_auto_off: Duration::from_secs(max_auto_off_secs.clamp(1, MAX_AUTO_OFF_SECS)),
        }
    }

    /// Publish the command and update the auto-off timer. Returns the
    /// literal payload that was sent. Does not wait for the device.
    ///
    /// Nothing is published and no timer changes on failure.
    pub async fn issue_command(
        &self,
        device_id: &str,
        action: &str,
        duration_secs: Option<f64>,
    ) -> Result<&'static str, CommandError> {
        let action: PumpAction = action.parse()?;
        let payload = action.wire();

        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        self.publisher.publish_command(device_id, payload).await?;

        match action {
            PumpAction::On => {
                if let Some(delay) = duration_secs.and_then(|d| self.auto_off_delay(d)) {
                    self.schedule_auto_off(device_id, delay, Arc::clone(&lock));
                }
            }
            PumpAction::Off | PumpAction::Auto => {
                if self.cancel(device_id) {
                    info!(device = %device_id, action = payload, "auto-off timer cancelled");
                }
            }
        }

        info!(device = %device_id, command = payload, ?duration_secs, "command issued");
        Ok(payload)
    }

    /// Positive durations are capped; anything else means "no timer".
    fn auto_off_delay(&self, secs: f64) -> Option<Duration> {
        if !(secs.is_finite() && secs > 0.0) {
            return None;
        }
        // Cap in f64: from_secs_f64 panics past u64::MAX seconds.
        Some(Duration::from_secs_f64(secs.min(self.max_auto_off.as_secs_f64())))
    }

    fn device_lock(&self, device_id: &str) -> DeviceLock {
        let mut locks = self.device_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(device_id.to_string()).or_default())
    }

    /// Caller holds `device_lock`.
    fn schedule_auto_off(&self, device_id: &str, delay: Duration, device_lock: DeviceLock) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let device = device_id.to_string();
        let timers = Arc::clone(&self.timers);
        let publisher = Arc::clone(&self.publisher);

        // Lock before spawning: the task must not look itself up before
        // its entry is inserted.
        let mut registry = self.timers.lock().unwrap_or_else(|e| e.into_inner());

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _guard = device_lock.lock().await;

            {
                let mut registry = timers.lock().unwrap_or_else(|e| e.into_inner());
                match registry.get(&device) {
                    Some(t) if t.id == id => {
                        registry.remove(&device);
                    }
                    // Replaced or cancelled while we were waking up.
                    _ => return,
                }
            }

            match publisher.publish_command(&device, PumpAction::Off.wire()).await {
                Ok(()) => info!(device = %device, "auto-off fired: PUMP_OFF sent"),
                Err(e) => error!(device = %device, "auto-off publish failed: {e}"),
            }
        });

        if let Some(old) = registry.insert(device_id.to_string(), PendingTimer { id, handle }) {
            old.handle.abort();
            info!(device = %device_id, "auto-off timer replaced");
        }
        info!(device = %device_id, delay_secs = delay.as_secs_f64(), "auto-off scheduled");
    }

    /// Cancel the device's pending timer. Returns whether one existed.
    pub fn cancel(&self, device_id: &str) -> bool {
        let mut registry = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        match registry.remove(device_id) {
            Some(t) => {
                t.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every pending timer. Called on shutdown, before the
    /// transport goes away.
    pub fn cancel_all(&self) -> usize {
        let mut registry = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let n = registry.len();
        for (device, t) in registry.drain() {
            t.handle.abort();
            warn!(device = %device, "auto-off timer cancelled on shutdown");
        }
        n
    }

    pub fn has_pending(&self, device_id: &str) -> bool {
        let registry = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        registry.contains_key(device_id)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
