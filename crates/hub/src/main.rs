mod broadcast;
mod commands;
mod config;
mod db;
mod error;
mod link;
mod pipeline;
mod retention;
mod state;
mod telemetry;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use broadcast::BroadcastSink;
use commands::CommandDispatcher;
use db::{Db, HistoryStore};
use link::{MqttPublisher, TransportLink, INBOUND_CAPACITY};
use pipeline::Pipeline;
use state::{ActivityLog, EventKind, Health, StateCache};

const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let device_id = cfg.device.id.clone();
    info!(device = %device_id, broker = %cfg.mqtt.host, port = cfg.mqtt.port, "greenlink hub starting");

    // ── Database ────────────────────────────────────────────────────
    // A store that cannot be opened is fatal; later outages are not.
    let db = Db::connect(&cfg.store.url)
        .await
        .with_context(|| format!("failed to open history store at {}", cfg.store.url))?;
    db.migrate().await.context("failed to migrate history store")?;
    let store: Arc<dyn HistoryStore> = Arc::new(db);

    // ── Shared state ────────────────────────────────────────────────
    let health = Arc::new(Health::new());
    health.set_store_connected(true);
    let cache = Arc::new(StateCache::new());
    let log = Arc::new(ActivityLog::new());
    let sink = BroadcastSink::new();
    log.record(EventKind::System, "hub started");

    // ── Transport ───────────────────────────────────────────────────
    let (client, eventloop) = link::connect(&cfg.mqtt);
    let publisher = Arc::new(MqttPublisher::new(
        client.clone(),
        cfg.mqtt.command_topic.clone(),
        Arc::clone(&health),
        cfg.mqtt.publish_timeout(),
    ));
    let commands = CommandDispatcher::new(publisher, cfg.commands.max_auto_off_secs);

    // ── Ingestion worker ────────────────────────────────────────────
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let pipeline = Pipeline::new(
        Arc::clone(&cache),
        sink.clone(),
        Arc::clone(&store),
        Arc::clone(&health),
        Arc::clone(&log),
        cfg.store.write_timeout(),
    );
    tokio::spawn(pipeline.run(inbound_rx));

    // ── Retention ───────────────────────────────────────────────────
    tokio::spawn(retention::run(
        Arc::clone(&store),
        Arc::clone(&health),
        Arc::clone(&log),
        cfg.store.retention_days,
        Duration::from_secs(cfg.store.purge_interval_secs),
        cfg.store.write_timeout(),
    ));

    // ── Web server ──────────────────────────────────────────────────
    let web_state = web::AppState {
        device_id: device_id.clone(),
        cache,
        sink,
        store,
        health: Arc::clone(&health),
        log: Arc::clone(&log),
        commands: commands.clone(),
        query_timeout: cfg.store.write_timeout(),
    };
    let web_cfg = cfg.web.clone();
    tokio::spawn(async move {
        if let Err(e) = web::serve(web_state, web_cfg).await {
            error!("web server stopped: {e:#}");
        }
    });

    // ── Link loop ───────────────────────────────────────────────────
    let link = TransportLink::new(
        client.clone(),
        eventloop,
        &cfg.mqtt,
        &device_id,
        Arc::clone(&health),
        Arc::clone(&log),
        inbound_tx,
    );

    let mut link_task = tokio::spawn(link.run());

    tokio::select! {
        _ = &mut link_task => {
            warn!("transport link exited");
        }
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                error!("failed to listen for shutdown signal: {e}");
            }
            info!("shutdown requested");
        }
    }

    let cancelled = commands.cancel_all();
    if cancelled > 0 {
        info!(cancelled, "pending auto-off timers cancelled");
    }
    if let Err(e) = client.disconnect().await {
        warn!("mqtt disconnect failed: {e}");
    }
    // Let the event loop flush the DISCONNECT before it is torn down.
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    link_task.abort();
    info!("greenlink hub stopped");
    Ok(())
}
