//! MQTT transport link.
//!
//! Owns the rumqttc event loop: subscribes to the device's telemetry topic
//! after every `CONNACK`, forwards matching publishes to the ingestion
//! queue untouched, and keeps the `transport_connected` health flag
//! current. rumqttc reconnects on the next `poll()` after an error; the
//! delay between attempts is our own capped exponential backoff.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::commands::CommandPublisher;
use crate::config::{device_from_topic, topic_for, MqttConfig};
use crate::error::CommandError;
use crate::pipeline::Inbound;
use crate::state::{ActivityLog, EventKind, Health};

/// Outgoing requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 20;

/// Inbound telemetry messages buffered ahead of the pipeline.
pub const INBOUND_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// Reconnect policy
// ---------------------------------------------------------------------------

/// Capped exponential backoff: `initial`, `2*initial`, ... up to `max`.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.max);
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Connection setup
// ---------------------------------------------------------------------------

pub fn mqtt_options(cfg: &MqttConfig) -> MqttOptions {
    let mut options = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
    options.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
    options.set_clean_session(true);
    if let Some(user) = &cfg.username {
        options.set_credentials(user.clone(), cfg.password.clone().unwrap_or_default());
    }
    options
}

/// Build the client handle and its (not yet polled) event loop.
pub fn connect(cfg: &MqttConfig) -> (AsyncClient, EventLoop) {
    AsyncClient::new(mqtt_options(cfg), REQUEST_CAPACITY)
}

// ---------------------------------------------------------------------------
// Outbound: command publishing
// ---------------------------------------------------------------------------

pub struct MqttPublisher {
    client: AsyncClient,
    command_topic: String,
    health: Arc<Health>,
    timeout: Duration,
}

impl MqttPublisher {
    pub fn new(client: AsyncClient, command_topic: String, health: Arc<Health>, timeout: Duration) -> Self {
        Self {
            client,
            command_topic,
            health,
            timeout,
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttPublisher {
    async fn publish_command(&self, device_id: &str, payload: &'static str) -> Result<(), CommandError> {
        if !self.health.transport_connected() {
            return Err(CommandError::TransportUnavailable("broker not connected".into()));
        }

        let topic = topic_for(&self.command_topic, device_id);
        let publish = self.client.publish(&topic, QoS::AtLeastOnce, false, payload);
        match tokio::time::timeout(self.timeout, publish).await {
            Ok(Ok(())) => {
                debug!(%topic, payload, "command published");
                Ok(())
            }
            Ok(Err(e)) => Err(CommandError::TransportUnavailable(e.to_string())),
            Err(_) => Err(CommandError::TransportUnavailable(format!(
                "publish timed out after {} ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound: event loop
// ---------------------------------------------------------------------------

pub struct TransportLink {
    client: AsyncClient,
    eventloop: EventLoop,
    device_id: String,
    telemetry_template: String,
    health: Arc<Health>,
    log: Arc<ActivityLog>,
    inbound: mpsc::Sender<Inbound>,
    backoff: Backoff,
}

impl TransportLink {
    pub fn new(
        client: AsyncClient,
        eventloop: EventLoop,
        cfg: &MqttConfig,
        device_id: &str,
        health: Arc<Health>,
        log: Arc<ActivityLog>,
        inbound: mpsc::Sender<Inbound>,
    ) -> Self {
        Self {
            client,
            eventloop,
            device_id: device_id.to_string(),
            telemetry_template: cfg.telemetry_topic.clone(),
            health,
            log,
            inbound,
            backoff: Backoff::new(
                Duration::from_millis(cfg.backoff_initial_ms),
                Duration::from_millis(cfg.backoff_max_ms),
            ),
        }
    }

    fn telemetry_topic(&self) -> String {
        topic_for(&self.telemetry_template, &self.device_id)
    }

    /// Device id for a telemetry publish, or `None` if the topic is not
    /// ours (e.g. overlapping subscriptions on a shared broker).
    fn route<'a>(&self, topic: &'a str) -> Option<&'a str> {
        device_from_topic(&self.telemetry_template, topic).filter(|d| *d == self.device_id)
    }

    /// Build the queue entry for a publish, or `None` if it is not ours.
    fn inbound_for(&self, topic: &str, payload: Vec<u8>) -> Option<Inbound> {
        let Some(device_id) = self.route(topic) else {
            debug!(%topic, "ignoring publish on unexpected topic");
            return None;
        };
        Some(Inbound {
            device_id: device_id.to_string(),
            payload,
        })
    }

    /// Only the sender is borrowed across the await; the event loop is
    /// not `Sync`, so holding `&self` would make `run` non-`Send`.
    async fn forward(inbound: &mpsc::Sender<Inbound>, msg: Inbound) {
        if inbound.send(msg).await.is_err() {
            error!("ingestion pipeline is gone; dropping telemetry");
        }
    }

    fn on_connected(&mut self) {
        self.backoff.reset();
        self.health.set_transport_connected(true);

        // try_subscribe: the request channel is drained by this very loop,
        // so an awaiting subscribe could deadlock when it is full.
        let topic = self.telemetry_topic();
        match self.client.try_subscribe(&topic, QoS::AtLeastOnce) {
            Ok(()) => info!(%topic, "mqtt connected, subscribing"),
            Err(e) => error!(%topic, "mqtt subscribe failed: {e}"),
        }
        self.log.record(EventKind::System, "mqtt connected");
    }

    fn on_disconnected(&mut self, reason: &str) {
        let was_connected = self.health.transport_connected();
        self.health.set_transport_connected(false);
        if was_connected {
            self.log.record(EventKind::Error, format!("mqtt disconnected: {reason}"));
        }
    }

    /// Poll forever. Connection errors never end the loop.
    pub async fn run(mut self) {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    if let Some(msg) = self.inbound_for(&p.topic, p.payload.to_vec()) {
                        Self::forward(&self.inbound, msg).await;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => self.on_connected(),
                Ok(Event::Incoming(Packet::SubAck(_))) => {
                    debug!("mqtt subscription acknowledged");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt broker sent disconnect");
                    self.on_disconnected("broker disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    self.on_disconnected(&e.to_string());
                    let delay = self.backoff.next_delay();
                    warn!(
                        retry_in_ms = delay.as_millis() as u64,
                        "mqtt error: {e}. reconnecting..."
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
