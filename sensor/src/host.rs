use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Notify};
use tracing::{info, warn};

use sensornode_common::{
    addressing::AddressConfig,
    api::DEFAULT_LOG_ENTRIES,
    authorize,
    config::UpstreamConfig,
    render_metrics_text,
    report::upstream_url,
    watchdog::RestartFn,
    ConfigPersistence, ConfigView, Credentials, DeviceStats, LinkDriver, LinkStatus, NameAdvertiser,
    NodeConfig, NodeConfigUpdate, NodeError, NodeParts, NodeResult, NodeRuntime, Reading,
    RuntimeTiming, SensorProbe, SharedConfig, SystemClock, TaskActionRequest, TaskId,
    TracingSink, Uplink,
};

const DEFAULT_HTTP_PORT: u16 = 8090;
const SIMULATED_ASSOCIATION: Duration = Duration::from_millis(800);
const UPLINK_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TASK_TIMEOUT_MS: u32 = 30_000;
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone)]
struct AppState {
    runtime: Arc<NodeRuntime>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct OkBody {
    ok: bool,
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    max: Option<usize>,
}

#[derive(Debug, Serialize)]
struct ConfigUpdateResponse {
    #[serde(rename = "linkChanged")]
    link_changed: bool,
    config: ConfigView,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = Arc::new(ConfigStore::new());
    let mut defaults = NodeConfig::default();
    apply_env_overrides(&mut defaults);

    let mut config = store
        .load()
        .unwrap_or_else(|err| {
            warn!("failed to load config from store: {err}");
            None
        })
        .unwrap_or_else(|| defaults.clone());
    apply_env_overrides(&mut config);

    let runtime = NodeRuntime::new(NodeParts {
        clock: Arc::new(SystemClock::new()),
        config: SharedConfig::new(config),
        factory_defaults: defaults,
        persistence: store,
        log_sink: Box::new(TracingSink),
        stats: Arc::new(HostStats),
        link_driver: Box::new(SimulatedLink::default()),
        advertiser: Box::new(LoggedAdvertiser),
        sensor: Box::new(SimulatedSensor::default()),
        uplink: Box::new(HttpUplink::default()),
        timing: RuntimeTiming {
            network_stack_size: 256 * 1024,
            sensor_stack_size: 256 * 1024,
            ..RuntimeTiming::default()
        },
    });
    runtime.start().context("failed to start node runtime")?;

    let app = control_plane(runtime.clone());

    let port = std::env::var("NODE_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_HTTP_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let restart_server = Arc::new(Notify::new());
    spawn_health_check(port);

    let stopping = Arc::new(AtomicBool::new(false));
    while !stopping.load(Ordering::Relaxed) {
        let restart: RestartFn = {
            let notify = restart_server.clone();
            Arc::new(move || notify.notify_one())
        };
        runtime.watchdog().register_with_owner(
            TaskId::HttpServer,
            TaskId::HttpServer.name(),
            restart,
            HTTP_TASK_TIMEOUT_MS,
            None,
        );

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind control plane at {addr}"))?;
        info!("sensor node control plane listening on http://{addr}");

        let shutdown = {
            let stopping = stopping.clone();
            let restart_server = restart_server.clone();
            async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => stopping.store(true, Ordering::Relaxed),
                    _ = restart_server.notified() => info!("control plane restarting"),
                }
            }
        };
        axum::serve(listener, app.clone())
            .with_graceful_shutdown(shutdown)
            .await
            .context("control plane server failed")?;
    }

    runtime.watchdog().unregister_task(TaskId::HttpServer);
    runtime.shutdown();
    info!("sensor node stopped");
    Ok(())
}

fn control_plane(runtime: Arc<NodeRuntime>) -> Router {
    let state = AppState { runtime };
    Router::new()
        .route("/api/health", get(handle_health))
        .route("/api/status", get(handle_get_status))
        .route("/api/metrics", get(handle_get_metrics))
        .route("/metrics", get(handle_get_metrics_text))
        .route("/api/logs", get(handle_get_logs))
        .route("/api/logs/clear", post(handle_clear_logs))
        .route("/api/tasks", get(handle_get_tasks).post(handle_task_action))
        .route("/api/read", get(handle_read_now))
        .route("/api/config", get(handle_get_config).put(handle_put_config))
        .route("/api/config/save", post(handle_save_config))
        .route("/api/config/discard", post(handle_discard_config))
        .route("/api/config/factory-reset", post(handle_factory_reset))
        .layer(middleware::from_fn_with_state(state.clone(), heartbeat_on_response))
        .with_state(state)
}

/// The `http-server` watchdog slot is fed only by requests that were actually served.
async fn heartbeat_on_response(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    state.runtime.watchdog().heartbeat(TaskId::HttpServer);
    response
}

/// Requests `/api/health` over loopback so an idle control plane still proves it serves.
fn spawn_health_check(port: u16) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(HEALTH_CHECK_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!("control plane health check disabled: {err}");
                return;
            }
        };
        let url = format!("http://127.0.0.1:{port}/api/health");
        let mut interval = tokio::time::interval(HEALTH_CHECK_PERIOD);
        loop {
            interval.tick().await;
            if let Err(err) = client.get(&url).send().await {
                warn!("control plane health check failed: {err}");
            }
        }
    });
}

fn apply_env_overrides(config: &mut NodeConfig) {
    if let Ok(location) = std::env::var("DEVICE_LOCATION") {
        config.device_location = location;
    }
    if let Ok(ssid) = std::env::var("WIFI_SSID") {
        config.network.wifi_ssid = ssid;
    }
    if let Ok(pass) = std::env::var("WIFI_PASS") {
        config.network.wifi_pass = pass;
    }
    if let Ok(host) = std::env::var("UPSTREAM_HOST") {
        config.upstream.server_host = host;
    }
    if let Some(port) = std::env::var("UPSTREAM_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        config.upstream.server_port = port;
    }
    if let Ok(key) = std::env::var("UPSTREAM_API_KEY") {
        config.upstream.api_key = key;
    }
}

async fn handle_health() -> impl IntoResponse {
    Json(OkBody { ok: true })
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.status_view())
}

async fn handle_get_metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.metrics_snapshot())
}

async fn handle_get_metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    let body = render_metrics_text(&state.runtime.metrics_snapshot().samples());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

async fn handle_get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    Json(
        state
            .runtime
            .logs_view(query.max.unwrap_or(DEFAULT_LOG_ENTRIES)),
    )
}

async fn handle_clear_logs(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    state.runtime.clear_logs();
    Json(OkBody { ok: true }).into_response()
}

async fn handle_get_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.watchdog().task_views())
}

async fn handle_task_action(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TaskActionRequest>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.runtime.task_action(&request) {
        Ok(reply) => Json(reply).into_response(),
        Err(err) => error_response(status_for(&err), &err.to_string()),
    }
}

async fn handle_read_now(State(state): State<AppState>) -> Response {
    let runtime = state.runtime.clone();
    match tokio::task::spawn_blocking(move || runtime.read_now()).await {
        Ok(view) => Json(view).into_response(),
        Err(err) => {
            warn!("sensor read task failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Sensor read failed")
        }
    }
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.runtime.config_view())
}

async fn handle_put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(update): Json<NodeConfigUpdate>,
) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    if update.post_interval_sec == Some(0) {
        return error_response(StatusCode::BAD_REQUEST, "post_interval_sec must be at least 1");
    }
    if update.server_port == Some(0) {
        return error_response(StatusCode::BAD_REQUEST, "server_port must be between 1 and 65535");
    }

    let outcome = state.runtime.apply_config_update(update);
    Json(ConfigUpdateResponse {
        link_changed: outcome.link_changed,
        config: state.runtime.config_view(),
    })
    .into_response()
}

async fn handle_save_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.runtime.save_config() {
        Ok(()) => Json(state.runtime.config_view()).into_response(),
        Err(err) => {
            warn!("failed to persist config: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to persist config")
        }
    }
}

async fn handle_discard_config(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.runtime.discard_config() {
        Ok(_) => Json(state.runtime.config_view()).into_response(),
        Err(err) => {
            warn!("failed to reload config: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to reload config")
        }
    }
}

async fn handle_factory_reset(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(denied) = check_auth(&state, &headers) {
        return denied;
    }
    match state.runtime.factory_reset() {
        Ok(_) => Json(state.runtime.config_view()).into_response(),
        Err(err) => {
            warn!("factory reset failed: {err}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Factory reset failed")
        }
    }
}

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let api_key = state
        .runtime
        .config()
        .read(|config| config.upstream.api_key.clone());
    let supplied = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if authorize(&api_key, supplied) {
        Ok(())
    } else {
        Err(error_response(StatusCode::UNAUTHORIZED, "Missing or invalid API key"))
    }
}

fn status_for(err: &NodeError) -> StatusCode {
    match err {
        NodeError::UnknownTask(_) => StatusCode::NOT_FOUND,
        NodeError::UnknownTaskAction(_) => StatusCode::BAD_REQUEST,
        NodeError::TaskNotRegistered(_) | NodeError::ActionRefused { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

/// JSON config file under `$SENSORNODE_DATA_DIR`.
struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    fn new() -> Self {
        let data_dir = std::env::var("SENSORNODE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.sensornode"));

        Self {
            path: data_dir.join("config.json"),
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn storage_error(err: impl std::fmt::Display) -> NodeError {
    NodeError::Storage(err.to_string())
}

impl ConfigPersistence for ConfigStore {
    fn load(&self) -> NodeResult<Option<NodeConfig>> {
        let _guard = self.guard();
        match std::fs::read(&self.path) {
            Ok(raw) => serde_json::from_slice(&raw)
                .map(Some)
                .map_err(storage_error),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(storage_error(err)),
        }
    }

    fn save(&self, config: &NodeConfig) -> NodeResult<()> {
        let _guard = self.guard();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(storage_error)?;
        }
        let payload = serde_json::to_vec_pretty(config).map_err(storage_error)?;
        std::fs::write(&self.path, payload).map_err(storage_error)
    }

    fn erase(&self) -> NodeResult<()> {
        let _guard = self.guard();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(storage_error(err)),
        }
    }
}

struct HostStats;

impl DeviceStats for HostStats {
    fn heap_free_bytes(&self) -> u32 {
        0
    }

    fn heap_min_free_bytes(&self) -> u32 {
        0
    }
}

/// Station that associates a moment after every connect call.
#[derive(Default)]
struct SimulatedLink {
    associating_since: Option<Instant>,
}

impl LinkDriver for SimulatedLink {
    fn status(&self) -> LinkStatus {
        match self.associating_since {
            Some(since) if since.elapsed() >= SIMULATED_ASSOCIATION => LinkStatus::Connected,
            _ => LinkStatus::Disconnected,
        }
    }

    fn connect(&mut self, credentials: &Credentials) -> NodeResult<()> {
        info!("simulated link associating with `{}`", credentials.ssid);
        self.associating_since = Some(Instant::now());
        Ok(())
    }

    fn disconnect(&mut self) {
        self.associating_since = None;
    }

    fn rssi_dbm(&self) -> Option<i32> {
        Some(-55)
    }

    fn set_hostname(&mut self, hostname: &str) -> NodeResult<()> {
        info!("simulated link hostname {hostname}");
        Ok(())
    }

    fn configure_addressing(&mut self, address: &AddressConfig) -> NodeResult<()> {
        info!("simulated link addressing {address:?}");
        Ok(())
    }
}

struct LoggedAdvertiser;

impl NameAdvertiser for LoggedAdvertiser {
    fn start(&mut self, name: &str) -> NodeResult<()> {
        info!("mdns is not available on host builds; would advertise {name}.local");
        Ok(())
    }

    fn stop(&mut self) {}
}

#[derive(Default)]
struct SimulatedSensor {
    tick: u64,
}

impl SensorProbe for SimulatedSensor {
    fn read(&mut self) -> NodeResult<Reading> {
        self.tick = self.tick.saturating_add(1);
        Ok(Reading {
            temperature_c: 20.0 + (self.tick % 8) as f32 * 0.15,
            humidity_pct: 42.0 + (self.tick % 6) as f32 * 0.5,
        })
    }
}

/// Blocking `reqwest` clients, built on first use from the sensor task thread.
#[derive(Default)]
struct HttpUplink {
    verified: Option<reqwest::blocking::Client>,
    insecure: Option<reqwest::blocking::Client>,
}

fn upstream_error(err: reqwest::Error) -> NodeError {
    NodeError::Upstream(err.to_string())
}

impl HttpUplink {
    fn client(&mut self, accept_invalid_certs: bool) -> NodeResult<&reqwest::blocking::Client> {
        let slot = if accept_invalid_certs {
            &mut self.insecure
        } else {
            &mut self.verified
        };
        let client = match slot.take() {
            Some(client) => client,
            None => reqwest::blocking::Client::builder()
                .timeout(UPLINK_TIMEOUT)
                .danger_accept_invalid_certs(accept_invalid_certs)
                .build()
                .map_err(upstream_error)?,
        };
        Ok(slot.insert(client))
    }
}

impl Uplink for HttpUplink {
    fn post_json(&mut self, upstream: &UpstreamConfig, body: &[u8]) -> NodeResult<u16> {
        let client = self.client(upstream.use_tls && upstream.https_insecure)?;
        let mut request = client
            .post(upstream_url(upstream))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body.to_vec());
        if !upstream.api_key.is_empty() {
            request = request.bearer_auth(&upstream.api_key);
        }

        let response = request.send().map_err(upstream_error)?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use pretty_assertions::assert_eq;
    use sensornode_common::ManualClock;

    use super::*;

    struct TestServer {
        addr: SocketAddr,
        _runtime: tokio::runtime::Runtime,
    }

    fn serve(app: Router) -> TestServer {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let listener = runtime
            .block_on(TcpListener::bind("127.0.0.1:0"))
            .unwrap();
        let addr = listener.local_addr().unwrap();
        runtime.spawn(async move { axum::serve(listener, app).await });
        TestServer {
            addr,
            _runtime: runtime,
        }
    }

    type Posts = Arc<Mutex<Vec<(Option<String>, String)>>>;

    async fn capture(State(posts): State<Posts>, headers: HeaderMap, body: String) -> StatusCode {
        let authorization = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        posts.lock().unwrap().push((authorization, body));
        StatusCode::CREATED
    }

    fn collector() -> (TestServer, Posts) {
        let posts = Posts::default();
        let app = Router::new()
            .route("/ingest", post(capture))
            .with_state(posts.clone());
        (serve(app), posts)
    }

    fn upstream_at(addr: SocketAddr, api_key: &str) -> UpstreamConfig {
        UpstreamConfig {
            server_host: addr.ip().to_string(),
            server_port: addr.port(),
            server_path: "ingest".into(),
            api_key: api_key.into(),
            ..UpstreamConfig::default()
        }
    }

    #[test]
    fn uplink_posts_json_with_bearer_key() {
        let (server, posts) = collector();
        let mut uplink = HttpUplink::default();

        let status = uplink
            .post_json(&upstream_at(server.addr, "k3y"), br#"{"location":"lab"}"#)
            .unwrap();
        assert_eq!(status, 201);
        assert_eq!(
            *posts.lock().unwrap(),
            vec![(
                Some("Bearer k3y".to_string()),
                r#"{"location":"lab"}"#.to_string()
            )]
        );

        uplink
            .post_json(&upstream_at(server.addr, ""), b"{}")
            .unwrap();
        assert_eq!(posts.lock().unwrap()[1].0, None);
    }

    #[test]
    fn uplink_refuses_api_key_with_line_breaks() {
        let (server, posts) = collector();
        let mut uplink = HttpUplink::default();

        let result = uplink.post_json(
            &upstream_at(server.addr, "k3y\r\nX-Forged: 1"),
            br#"{"location":"lab"}"#,
        );
        assert!(matches!(result, Err(NodeError::Upstream(_))));
        assert!(posts.lock().unwrap().is_empty());
    }

    fn idle_runtime(clock: Arc<ManualClock>) -> Arc<NodeRuntime> {
        NodeRuntime::new(NodeParts {
            clock,
            config: SharedConfig::new(NodeConfig::default()),
            factory_defaults: NodeConfig::default(),
            persistence: Arc::new(ConfigStore::new()),
            log_sink: Box::new(TracingSink),
            stats: Arc::new(HostStats),
            link_driver: Box::new(SimulatedLink::default()),
            advertiser: Box::new(LoggedAdvertiser),
            sensor: Box::new(SimulatedSensor::default()),
            uplink: Box::new(HttpUplink::default()),
            timing: RuntimeTiming::default(),
        })
    }

    #[test]
    fn only_served_requests_feed_the_server_slot() {
        let clock = Arc::new(ManualClock::new());
        let runtime = idle_runtime(clock.clone());
        let restarts = Arc::new(AtomicUsize::new(0));
        let restart: RestartFn = {
            let restarts = restarts.clone();
            Arc::new(move || {
                restarts.fetch_add(1, Ordering::SeqCst);
            })
        };
        runtime.watchdog().register_with_owner(
            TaskId::HttpServer,
            TaskId::HttpServer.name(),
            restart,
            HTTP_TASK_TIMEOUT_MS,
            None,
        );
        let server = serve(control_plane(runtime.clone()));
        let past_timeout = Duration::from_millis(u64::from(HTTP_TASK_TIMEOUT_MS) + 1_000);

        clock.advance(past_timeout);
        let response =
            reqwest::blocking::get(format!("http://{}/api/health", server.addr)).unwrap();
        assert_eq!(response.status().as_u16(), 200);
        assert_eq!(runtime.watchdog().check(), 0);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        clock.advance(past_timeout);
        assert_eq!(runtime.watchdog().check(), 1);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }
}
