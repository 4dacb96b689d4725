mod sim;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sim::{Command, DeviceSim, Scenario, Telemetry};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn telemetry_topic(device_id: &str) -> String {
    format!("greenlink/{device_id}/telemetry")
}

fn command_topic(device_id: &str) -> String {
    format!("greenlink/{device_id}/command")
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let device_id = env::var("DEVICE_ID").unwrap_or_else(|_| "garden-1".to_string());
    let sample_every_s: u64 = env_or("SAMPLE_EVERY_S", 30).max(1);
    let diurnal_period_s: f64 = env_or("DIURNAL_PERIOD_S", 600.0);
    let scenario = Scenario::from_str_lossy(&env::var("SIM_SCENARIO").unwrap_or_default());

    let mut mqttoptions = MqttOptions::new(format!("greenlink-node-{device_id}"), broker.clone(), port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let (Ok(user), Ok(pass)) = (env::var("MQTT_USERNAME"), env::var("MQTT_PASSWORD")) {
        mqttoptions.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<Command>(8);

    let cmd_topic = command_topic(&device_id);
    let sub_client = client.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("node connected to mqtt");
                    if let Err(e) = sub_client.try_subscribe(&cmd_topic, QoS::AtLeastOnce) {
                        warn!("subscribe to {cmd_topic} failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == cmd_topic => {
                    match Command::parse(&p.payload) {
                        Some(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        None => warn!(
                            payload = %String::from_utf8_lossy(&p.payload),
                            "ignoring unknown command"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    let topic = telemetry_topic(&device_id);
    info!(%broker, port, %topic, %scenario, sample_every_s, "simulated device publishing");

    let mut device = DeviceSim::new(scenario, diurnal_period_s);
    let started = Instant::now();
    let mut last_step = started;
    let mut ticker = interval(Duration::from_secs(sample_every_s));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                info!(?cmd, "command received");
                device.apply(cmd);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }

        // Every tick and every command produces a fresh report so the hub
        // sees pump changes without waiting a full sample period.
        let now = Instant::now();
        let reading = device.step(
            (now - last_step).as_secs_f64(),
            (now - started).as_secs_f64(),
        );
        last_step = now;
        publish(&client, &topic, &reading).await?;
    }

    if let Err(e) = client.disconnect().await {
        debug!("disconnect failed: {e}");
    }
    Ok(())
}

async fn publish(client: &AsyncClient, topic: &str, reading: &Telemetry) -> Result<()> {
    let payload = serde_json::to_vec(reading).context("failed to encode telemetry")?;
    match client.publish(topic, QoS::AtLeastOnce, false, payload).await {
        Ok(()) => debug!(
            s_pct = reading.s_pct,
            pump = reading.pump,
            "published telemetry"
        ),
        Err(e) => warn!("publish error: {e}"),
    }
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
