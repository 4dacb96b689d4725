//! HTTP surface: dashboard, health, history, pump commands and the live
//! WebSocket viewer channel.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::broadcast::BroadcastSink;
use crate::commands::CommandDispatcher;
use crate::config::WebConfig;
use crate::db::{bounded, HistoryStore};
use crate::error::CommandError;
use crate::state::{ActivityLog, EventKind, Health, HealthReport, StateCache, SystemEvent};
use crate::telemetry::TelemetryRecord;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Default history window when `from` is omitted.
const DEFAULT_WINDOW_SECS: i64 = 24 * 3600;
const DEFAULT_BUCKET_SECS: u64 = 3600;

#[derive(Clone)]
pub struct AppState {
    pub device_id: String,
    pub cache: Arc<StateCache>,
    pub sink: BroadcastSink,
    pub store: Arc<dyn HistoryStore>,
    pub health: Arc<Health>,
    pub log: Arc<ActivityLog>,
    pub commands: CommandDispatcher,
    pub query_timeout: Duration,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/api/status", get(api_status))
        .route("/api/latest", get(api_latest))
        .route("/api/history", get(api_history))
        .route("/api/history/buckets", get(api_buckets))
        .route("/api/pump", post(api_pump))
        .route("/ws", get(ws_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

/// 200 when both the broker and the store are reachable, 503 otherwise.
/// The store is pinged on every call.
async fn health(State(state): State<AppState>) -> impl IntoResponse {
    match bounded(state.query_timeout, state.store.ping()).await {
        Ok(()) => state.health.set_store_connected(true),
        Err(e) => {
            warn!("store ping failed: {e}");
            state.health.set_store_connected(false);
        }
    }
    let report = state.health.report();
    let code = if report.transport_connected && report.store_connected {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(report))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    device_id: String,
    health: HealthReport,
    latest: Option<TelemetryRecord>,
    viewers: usize,
    auto_off_pending: bool,
    events: Vec<SystemEvent>,
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        health: state.health.report(),
        latest: state.cache.get(&state.device_id),
        viewers: state.sink.viewer_count(),
        auto_off_pending: state.commands.has_pending(&state.device_id),
        events: state.log.recent(),
        device_id: state.device_id,
    })
}

async fn api_latest(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cache.get(&state.device_id))
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct HistoryParams {
    /// Unix seconds.
    from: Option<i64>,
    /// Unix seconds.
    to: Option<i64>,
    bucket_secs: Option<u64>,
}

fn error_response(code: StatusCode, msg: impl Into<String>) -> Response {
    (code, Json(json!({ "ok": false, "error": msg.into() }))).into_response()
}

impl HistoryParams {
    fn window(&self) -> Result<(OffsetDateTime, OffsetDateTime), Response> {
        let to = match self.to {
            Some(s) => OffsetDateTime::from_unix_timestamp(s)
                .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("bad 'to': {e}")))?,
            None => OffsetDateTime::now_utc(),
        };
        let from = match self.from {
            Some(s) => OffsetDateTime::from_unix_timestamp(s)
                .map_err(|e| error_response(StatusCode::BAD_REQUEST, format!("bad 'from': {e}")))?,
            None => to
                .checked_sub(time::Duration::seconds(DEFAULT_WINDOW_SECS))
                .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "'to' is too early"))?,
        };
        if from > to {
            return Err(error_response(StatusCode::BAD_REQUEST, "'from' is after 'to'"));
        }
        Ok((from, to))
    }
}

async fn api_history(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let (from, to) = match params.window() {
        Ok(w) => w,
        Err(resp) => return resp,
    };
    let query = state.store.query_range(&state.device_id, from, to);
    match bounded(state.query_timeout, query).await {
        Ok(records) => Json(records).into_response(),
        Err(e) => {
            warn!("history query failed: {e}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn api_buckets(State(state): State<AppState>, Query(params): Query<HistoryParams>) -> Response {
    let (from, to) = match params.window() {
        Ok(w) => w,
        Err(resp) => return resp,
    };
    let bucket_secs = params.bucket_secs.unwrap_or(DEFAULT_BUCKET_SECS);
    if bucket_secs == 0 {
        return error_response(StatusCode::BAD_REQUEST, "bucket_secs must be positive");
    }
    let query = state.store.query_bucketed(
        &state.device_id,
        from,
        to,
        Duration::from_secs(bucket_secs),
    );
    match bounded(state.query_timeout, query).await {
        Ok(buckets) => Json(buckets).into_response(),
        Err(e) => {
            warn!("bucketed history query failed: {e}");
            error_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct PumpRequest {
    action: String,
    /// Seconds until an automatic PUMP_OFF (ON only).
    duration: Option<f64>,
}

async fn api_pump(State(state): State<AppState>, Json(req): Json<PumpRequest>) -> Response {
    match state
        .commands
        .issue_command(&state.device_id, &req.action, req.duration)
        .await
    {
        Ok(command) => {
            state.log.record(
                EventKind::Pump,
                match req.duration {
                    Some(d) if command == "PUMP_ON" && d > 0.0 => format!("{command} (auto-off {d:.0}s)"),
                    _ => command.to_string(),
                },
            );
            Json(json!({ "ok": true, "command": command })).into_response()
        }
        Err(e) => {
            state.log.record(EventKind::Error, format!("pump command failed: {e}"));
            let code = match e {
                CommandError::InvalidAction(_) => StatusCode::BAD_REQUEST,
                CommandError::TransportUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            };
            error_response(code, e.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Live viewers
// ---------------------------------------------------------------------------

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| viewer(socket, state))
}

async fn viewer(mut socket: WebSocket, state: AppState) {
    // Subscribe before reading the cache so nothing published in between
    // is missed; at worst the viewer sees one value twice.
    let mut rx = state.sink.subscribe();
    info!(viewers = state.sink.viewer_count(), "viewer connected");

    if let Some(frame) = state.sink.catch_up(&state.cache, &state.device_id) {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    // Viewers are read-only; pings are answered by axum.
                    Some(Ok(_)) => {}
                }
            }
            frame = rx.recv() => {
                match frame {
                    Ok(frame) => {
                        if socket.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "slow viewer dropped frames");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    info!("viewer disconnected");
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, cfg: WebConfig) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.port));
    let app = router(state);

    #[cfg(feature = "tls")]
    if let (Some(cert), Some(key)) = (&cfg.tls_cert, &cfg.tls_key) {
        let tls = axum_server::tls_rustls::RustlsConfig::from_pem_file(cert, key).await?;
        info!("web ui listening on https://{addr}");
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await?;
        return Ok(());
    }

    #[cfg(not(feature = "tls"))]
    if cfg.tls_cert.is_some() {
        warn!("tls_cert configured but built without the `tls` feature; serving plain http");
    }

    let listener = TcpListener::bind(addr).await?;
    info!("web ui listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::tests::FakePublisher;
    use crate::pipeline::tests::FakeStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::atomic::Ordering;
    use crate::broadcast::TELEMETRY_EVENT;
    use futures::StreamExt;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
    use tower::ServiceExt;

    struct Fixture {
        state: AppState,
        store: Arc<FakeStore>,
        publisher: Arc<FakePublisher>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(FakeStore::default());
        let publisher = FakePublisher::new();
        let state = AppState {
            device_id: "garden-1".into(),
            cache: Arc::new(StateCache::new()),
            sink: BroadcastSink::new(),
            store: store.clone(),
            health: Arc::new(Health::new()),
            log: Arc::new(ActivityLog::new()),
            commands: CommandDispatcher::new(publisher.clone(), 3600),
            query_timeout: Duration::from_secs(1),
        };
        Fixture {
            state,
            store,
            publisher,
        }
    }

    fn record(at: OffsetDateTime, soil_pct: f64) -> TelemetryRecord {
        TelemetryRecord {
            soil_raw: 512.0,
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

    async fn get(state: &AppState, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = router(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn post_pump(state: &AppState, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
        let resp = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/pump")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    // -- Index / health -----------------------------------------------------

    #[tokio::test]
    async fn index_serves_html() {
        let resp = router(fixture().state)
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );
    }

    #[tokio::test]
    async fn health_is_503_until_connected() {
        let f = fixture();
        let (status, body) = get(&f.state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["transportConnected"], false);
        assert!(body["lastMessageAt"].is_null());

        f.state.health.set_transport_connected(true);
        let (status, body) = get(&f.state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storeConnected"], true);
    }

    #[tokio::test]
    async fn health_reports_store_outage() {
        let f = fixture();
        f.state.health.set_transport_connected(true);
        f.store.fail.store(true, Ordering::SeqCst);
        let (status, body) = get(&f.state, "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["storeConnected"], false);
        assert_eq!(body["transportConnected"], true);
    }

    #[tokio::test]
    async fn latest_is_null_then_record() {
        let f = fixture();
        let (_, body) = get(&f.state, "/api/latest").await;
        assert!(body.is_null());

        f.state
            .cache
            .set("garden-1", record(OffsetDateTime::now_utc(), 37.0));
        let (status, body) = get(&f.state, "/api/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["soilPct"], 37.0);
    }

    #[tokio::test]
    async fn status_includes_health_and_events() {
        let f = fixture();
        f.state.log.record(EventKind::System, "hub started");
        let (status, body) = get(&f.state, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["deviceId"], "garden-1");
        assert_eq!(body["autoOffPending"], false);
        assert_eq!(body["events"][0]["detail"], "hub started");
        assert_eq!(body["health"]["transportConnected"], false);
    }

    // -- History ------------------------------------------------------------

    #[tokio::test]
    async fn history_returns_window() {
        let f = fixture();
        let t0 = OffsetDateTime::from_unix_timestamp(1_800_000_000).unwrap();
        for (i, pct) in [10.0, 20.0, 30.0].into_iter().enumerate() {
            f.store
                .append("garden-1", &record(t0 + time::Duration::minutes(i as i64), pct))
                .await
                .unwrap();
        }

        let uri = format!(
            "/api/history?from={}&to={}",
            t0.unix_timestamp() + 30,
            t0.unix_timestamp() + 180
        );
        let (status, body) = get(&f.state, &uri).await;
        assert_eq!(status, StatusCode::OK);
        let pcts: Vec<f64> = body
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["soilPct"].as_f64().unwrap())
            .collect();
        assert_eq!(pcts, vec![20.0, 30.0]);
    }

    #[tokio::test]
    async fn history_rejects_inverted_window() {
        let f = fixture();
        let (status, body) = get(&f.state, "/api/history?from=200&to=100").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn history_store_failure_is_503() {
        let f = fixture();
        f.store.fail.store(true, Ordering::SeqCst);
        let (status, body) = get(&f.state, "/api/history").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("unavailable"));
    }

    #[tokio::test]
    async fn history_default_window_before_min_date_is_400() {
        let f = fixture();
        let min = OffsetDateTime::new_utc(time::Date::MIN, time::Time::MIDNIGHT);
        let uri = format!("/api/history?to={}", min.unix_timestamp());
        let (status, body) = get(&f.state, &uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn buckets_reject_zero_size() {
        let f = fixture();
        let (status, _) = get(&f.state, "/api/history/buckets?bucket_secs=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, body) = get(&f.state, "/api/history/buckets").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    // -- Pump commands ------------------------------------------------------

    #[tokio::test]
    async fn pump_on_with_duration() {
        let f = fixture();
        let (status, body) = post_pump(&f.state, json!({"action": "ON", "duration": 120})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "command": "PUMP_ON"}));
        assert_eq!(f.publisher.payloads(), vec!["PUMP_ON"]);
        assert!(f.state.commands.has_pending("garden-1"));
        f.state.commands.cancel_all();
    }

    #[tokio::test]
    async fn pump_invalid_action_is_400() {
        let f = fixture();
        let (status, body) = post_pump(&f.state, json!({"action": "FOO"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["ok"], false);
        assert!(f.publisher.payloads().is_empty());
    }

    #[tokio::test]
    async fn pump_transport_down_is_503() {
        let f = fixture();
        f.publisher.connected.store(false, Ordering::SeqCst);
        let (status, body) = post_pump(&f.state, json!({"action": "OFF"})).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body["error"].as_str().unwrap().contains("transport unavailable"));
    }

    // -- Live viewers -------------------------------------------------------

    type Viewer = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

    async fn connect_viewer(state: AppState) -> Viewer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
        ws
    }

    async fn next_frame(ws: &mut Viewer) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("no frame within 5s")
            .unwrap()
            .unwrap();
        serde_json::from_str(msg.to_text().unwrap()).unwrap()
    }

    async fn wait_for_viewers(sink: &BroadcastSink, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.viewer_count() < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("viewer never subscribed");
    }

    #[tokio::test]
    async fn ws_viewer_gets_catch_up_then_live_updates() {
        let f = fixture();
        let now = OffsetDateTime::now_utc();
        f.state.cache.set("garden-1", record(now, 41.0));

        let mut ws = connect_viewer(f.state.clone()).await;
        let first = next_frame(&mut ws).await;
        assert_eq!(first["event"], "telemetry");
        assert_eq!(first["device"], "garden-1");
        assert_eq!(first["data"]["soilPct"], 41.0);

        // Subscribed before the catch-up was sent.
        assert_eq!(f.state.sink.viewer_count(), 1);
        f.state
            .sink
            .push_to_all(TELEMETRY_EVENT, "garden-1", &record(now, 42.0))
            .unwrap();
        let second = next_frame(&mut ws).await;
        assert_eq!(second["data"]["soilPct"], 42.0);
    }

    #[tokio::test]
    async fn ws_viewer_with_empty_cache_gets_no_catch_up() {
        let f = fixture();
        let mut ws = connect_viewer(f.state.clone()).await;
        wait_for_viewers(&f.state.sink, 1).await;

        f.state
            .sink
            .push_to_all(TELEMETRY_EVENT, "garden-1", &record(OffsetDateTime::now_utc(), 55.0))
            .unwrap();
        let first = next_frame(&mut ws).await;
        assert_eq!(first["data"]["soilPct"], 55.0);
    }
}
