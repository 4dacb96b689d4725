//! Fan-out of live events to connected viewers.
//!
//! Every viewer holds a [`broadcast::Receiver`]; a send is fire-and-forget
//! and a viewer that falls behind simply loses the oldest frames.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::BroadcastError;
use crate::state::StateCache;

/// Frames buffered per viewer before it starts lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Event name for telemetry frames.
pub const TELEMETRY_EVENT: &str = "telemetry";

#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<String>,
}

#[derive(Serialize)]
struct Frame<'a, T: Serialize> {
    event: &'a str,
    device: &'a str,
    data: &'a T,
}

/// Encode one viewer frame: `{"event":..,"device":..,"data":..}`.
pub fn encode<T: Serialize>(event: &str, device: &str, data: &T) -> Result<String, BroadcastError> {
    serde_json::to_string(&Frame {
        event,
        device,
        data,
    })
    .map_err(|e| BroadcastError(e.to_string()))
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Register a new viewer.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    pub fn viewer_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Push one event to every connected viewer. Returns how many viewers
    /// it was queued for; zero viewers is not an error.
    pub fn push_to_all<T: Serialize>(
        &self,
        event: &str,
        device: &str,
        data: &T,
    ) -> Result<usize, BroadcastError> {
        let frame = encode(event, device, data)?;
        Ok(self.tx.send(frame).unwrap_or(0))
    }

    /// The one-off frame a newly joined viewer gets: the cached record for
    /// `device`, or nothing while the cache is still empty.
    ///
    /// Callers must [`subscribe`](Self::subscribe) before calling this so
    /// that no update between the two can be missed.
    pub fn catch_up(&self, cache: &StateCache, device: &str) -> Option<String> {
        let record = cache.get(device)?;
        match encode(TELEMETRY_EVENT, device, &record) {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!(device = %device, "catch-up encode failed: {e}");
                None
            }
        }
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
