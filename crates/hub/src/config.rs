//! TOML config file loading, environment overrides and validation.
//!
//! Every field has a default, so a missing file simply means "run with the
//! defaults". Environment variables win over the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::commands::MAX_AUTO_OFF_SECS;

/// Placeholder substituted with the device id in topic templates.
pub const DEVICE_PLACEHOLDER: &str = "{device}";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub mqtt: MqttConfig,
    pub store: StoreConfig,
    pub web: WebConfig,
    pub commands: CommandsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub telemetry_topic: String,
    pub command_topic: String,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub publish_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub url: String,
    pub retention_days: i64,
    pub purge_interval_secs: u64,
    pub write_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandsConfig {
    pub max_auto_off_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "garden-1".into(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "greenlink-hub".into(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            telemetry_topic: "greenlink/{device}/telemetry".into(),
            command_topic: "greenlink/{device}/command".into(),
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            publish_timeout_ms: 3_000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:greenlink.db?mode=rwc".into(),
            retention_days: 60,
            purge_interval_secs: 3600,
            write_timeout_ms: 5_000,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            max_auto_off_secs: MAX_AUTO_OFF_SECS,
        }
    }
}

impl MqttConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl StoreConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.device.id.trim().is_empty() {
            errors.push("device.id is empty".into());
        } else if self.device.id.contains(['/', '+', '#']) {
            errors.push(format!(
                "device.id '{}' must not contain MQTT topic characters (/ + #)",
                self.device.id
            ));
        }

        self.validate_mqtt(&mut errors);
        self.validate_store(&mut errors);

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }
        if self.web.tls_cert.is_some() != self.web.tls_key.is_some() {
            errors.push("web.tls_cert and web.tls_key must be set together".into());
        }

        if !(1..=MAX_AUTO_OFF_SECS).contains(&self.commands.max_auto_off_secs) {
            errors.push(format!(
                "commands.max_auto_off_secs {} out of range [1, {MAX_AUTO_OFF_SECS}]",
                self.commands.max_auto_off_secs
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;

        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password set without mqtt.username".into());
        }
        if m.keep_alive_secs < 5 {
            errors.push(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                m.keep_alive_secs
            ));
        }

        // ── Topics ──────────────────────────────────────────
        for (name, topic) in [
            ("telemetry_topic", &m.telemetry_topic),
            ("command_topic", &m.command_topic),
        ] {
            if !topic.contains(DEVICE_PLACEHOLDER) {
                errors.push(format!(
                    "mqtt.{name} '{topic}' must contain {DEVICE_PLACEHOLDER}"
                ));
            }
            if topic.contains(['+', '#']) {
                errors.push(format!("mqtt.{name} '{topic}' must not contain wildcards"));
            }
        }
        if m.telemetry_topic == m.command_topic {
            errors.push("mqtt.telemetry_topic and mqtt.command_topic must differ".into());
        }

        // ── Reconnect / publish timing ──────────────────────
        if m.backoff_initial_ms == 0 {
            errors.push("mqtt.backoff_initial_ms must be positive".into());
        }
        if m.backoff_initial_ms > m.backoff_max_ms {
            errors.push(format!(
                "mqtt.backoff_initial_ms ({}) exceeds mqtt.backoff_max_ms ({})",
                m.backoff_initial_ms, m.backoff_max_ms
            ));
        }
        if m.publish_timeout_ms == 0 {
            errors.push("mqtt.publish_timeout_ms must be positive".into());
        }
    }

    fn validate_store(&self, errors: &mut Vec<String>) {
        let s = &self.store;

        if !s.url.starts_with("sqlite:") {
            errors.push(format!("store.url '{}' must start with sqlite:", s.url));
        }
        if s.retention_days < 1 {
            errors.push(format!(
                "store.retention_days must be at least 1, got {}",
                s.retention_days
            ));
        }
        if s.purge_interval_secs == 0 {
            errors.push("store.purge_interval_secs must be positive".into());
        }
        if s.write_timeout_ms == 0 {
            errors.push("store.write_timeout_ms must be positive".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply overrides from a variable lookup (`std::env::var` in main).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = get("MQTT_PORT") {
            self.mqtt.port = v
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = get("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = get("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = get("DB_URL") {
            self.store.url = v;
        }
        if let Some(v) = get("WEB_PORT") {
            self.web.port = v
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v}"))?;
        }
        if let Some(v) = get("DEVICE_ID") {
            self.device.id = v;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Substitute the device id into a topic template.
pub fn topic_for(template: &str, device_id: &str) -> String {
    template.replace(DEVICE_PLACEHOLDER, device_id)
}

/// Extract the device id from `topic` if it matches `template`.
pub fn device_from_topic<'a>(template: &str, topic: &'a str) -> Option<&'a str> {
    let (prefix, suffix) = template.split_once(DEVICE_PLACEHOLDER)?;
    let device = topic.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if device.is_empty() || device.contains('/') {
        None
    } else {
        Some(device)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, apply environment overrides and validate. A missing file
/// yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    load_with(path, |k| std::env::var(k).ok())
}

fn load_with<F>(path: &str, env: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config: Config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
    } else {
        tracing::warn!(path, "config file not found, using defaults");
        Config::default()
    };

    config.apply_env(env)?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
