use core::convert::TryInto;
use std::{
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use dht_sensor::dht22;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, IOPin, InputOutput, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::prelude::Peripherals,
    http::{
        client::{Configuration as HttpClientConfiguration, EspHttpConnection},
        server::{Configuration as HttpConfiguration, EspHttpServer},
    },
    ipv4::{
        ClientConfiguration as IpClientConfiguration, ClientSettings as IpClientSettings,
        Configuration as IpConfiguration, Mask, Subnet,
    },
    log::EspLogger,
    mdns::EspMdns,
    netif::{EspNetif, NetifConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::EspWifi,
};
use log::{info, warn};
use serde::Serialize;

use sensornode_common::{
    addressing::AddressConfig,
    api::DEFAULT_LOG_ENTRIES,
    authorize,
    config::UpstreamConfig,
    log_ring::LogEntry,
    render_metrics_text,
    report::upstream_url,
    watchdog::RestartFn,
    ConfigPersistence, Credentials, DeviceStats, LinkDriver, LinkStatus, LogLevel, LogSink,
    NameAdvertiser, NodeConfig, NodeConfigUpdate, NodeError, NodeParts, NodeResult, NodeRuntime,
    Reading, RuntimeTiming, SensorProbe, SharedConfig, SystemClock, TaskActionRequest, TaskId,
    Uplink,
};

const NVS_NAMESPACE: &str = "sensornode";
const NVS_CONFIG_KEY: &str = "config_json";

const DHT22_PIN: i32 = 4;

const MAX_HTTP_BODY: usize = 4096;
const UPLINK_TIMEOUT: Duration = Duration::from_secs(10);
const HTTP_TASK_TIMEOUT_MS: u32 = 30_000;
const HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(5);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(3);
const HEALTH_URL: &str = "http://127.0.0.1/api/health";
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const DHT_RECOVERY_DELAY: Duration = Duration::from_millis(1_200);

type Request<'r, 'c> =
    esp_idf_svc::http::server::Request<&'r mut esp_idf_svc::http::server::EspHttpConnection<'c>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = Arc::new(NvsStore {
        partition: nvs_partition.clone(),
        lock: Mutex::new(()),
    });

    let mut defaults = NodeConfig::default();
    ensure_wifi_defaults(&mut defaults);
    let config = store
        .load()
        .unwrap_or_else(|err| {
            warn!("failed to load config from NVS: {err}");
            None
        })
        .unwrap_or_else(|| defaults.clone());

    let Peripherals { modem, pins, .. } = Peripherals::take()?;
    let sensor = Dht22Probe::new(pins.gpio4.downgrade()).context("failed to initialize DHT22")?;
    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition))?;
    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;

    let runtime = NodeRuntime::new(NodeParts {
        clock: Arc::new(SystemClock::new()),
        config: SharedConfig::new(config),
        factory_defaults: defaults,
        persistence: store,
        log_sink: Box::new(EspLogSink),
        stats: Arc::new(EspStats),
        link_driver: Box::new(StationDriver {
            wifi,
            hostname: None,
            power_save_disabled: false,
        }),
        advertiser: Box::new(MdnsAdvertiser { mdns: None }),
        sensor: Box::new(sensor),
        uplink: Box::new(HttpUplink),
        timing: RuntimeTiming::default(),
    });
    runtime.start().context("failed to start node runtime")?;

    let server = Arc::new(Mutex::new(None));
    install_http_server(&runtime, &server)?;

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    add_current_task_to_watchdog()?;

    loop {
        feed_watchdog();
        if let Err(err) = check_control_plane() {
            warn!("control plane health check failed: {err:#}");
        }
        thread::sleep(HEALTH_CHECK_PERIOD);
    }
}

type ServerSlot = Arc<Mutex<Option<EspHttpServer<'static>>>>;

/// Starts the control plane and registers it for supervision. A restart rebuilds the
/// server from a helper thread, since the request that triggers it runs on the server.
fn install_http_server(runtime: &Arc<NodeRuntime>, slot: &ServerSlot) -> anyhow::Result<()> {
    let server = create_http_server(runtime.clone())?;
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);

    let restart: RestartFn = {
        let runtime = Arc::downgrade(runtime);
        let slot = slot.clone();
        Arc::new(move || {
            let Some(runtime) = runtime.upgrade() else {
                return;
            };
            let slot = slot.clone();
            let spawned = thread::Builder::new()
                .name("http-restart".into())
                .stack_size(8 * 1024)
                .spawn(move || {
                    thread::sleep(Duration::from_millis(300));
                    slot.lock().unwrap_or_else(PoisonError::into_inner).take();
                    if let Err(err) = install_http_server(&runtime, &slot) {
                        warn!("control plane restart failed: {err:#}");
                    }
                });
            if let Err(err) = spawned {
                warn!("failed to spawn control plane restart: {err}");
            }
        })
    };
    runtime.watchdog().register_with_owner(
        TaskId::HttpServer,
        TaskId::HttpServer.name(),
        restart,
        HTTP_TASK_TIMEOUT_MS,
        None,
    );
    info!("control plane listening on port 80");
    Ok(())
}

fn create_http_server(runtime: Arc<NodeRuntime>) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        max_uri_handlers: 16,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    // The `http-server` watchdog slot is fed only from a served request.
    {
        let runtime = runtime.clone();
        server.fn_handler("/api/health", Method::Get, move |req| {
            runtime.watchdog().heartbeat(TaskId::HttpServer);
            write_json(req, &serde_json::json!({ "ok": true }))
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            write_json(req, &runtime.status_view())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/metrics", Method::Get, move |req| {
            write_json(req, &runtime.metrics_snapshot())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/metrics", Method::Get, move |req| {
            let body = render_metrics_text(&runtime.metrics_snapshot().samples());
            req.into_response(
                200,
                Some("OK"),
                &[("Content-Type", "text/plain; version=0.0.4; charset=utf-8")],
            )?
            .write_all(body.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/logs", Method::Get, move |req| {
            let max = query_param(req.uri(), "max")
                .and_then(|value| value.parse::<usize>().ok())
                .unwrap_or(DEFAULT_LOG_ENTRIES);
            write_json(req, &runtime.logs_view(max))
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/logs/clear", Method::Post, move |req| {
            if !is_authorized(&runtime, &req) {
                return write_error(req, 401, "Missing or invalid API key");
            }
            runtime.clear_logs();
            write_json(req, &serde_json::json!({ "ok": true }))
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/tasks", Method::Get, move |req| {
            write_json(req, &runtime.watchdog().task_views())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/tasks", Method::Post, move |mut req| {
            if !is_authorized(&runtime, &req) {
                return write_error(req, 401, "Missing or invalid API key");
            }
            let body = read_request_body(&mut req)?;
            let request: TaskActionRequest =
                serde_json::from_slice(&body).context("invalid task action payload")?;
            match runtime.task_action(&request) {
                Ok(reply) => write_json(req, &reply),
                Err(err) => write_error(req, status_for(&err), &err.to_string()),
            }
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/read", Method::Get, move |req| {
            write_json(req, &runtime.read_now())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            write_json(req, &runtime.config_view())
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler::<anyhow::Error, _>("/api/config", Method::Put, move |mut req| {
            if !is_authorized(&runtime, &req) {
                return write_error(req, 401, "Missing or invalid API key");
            }
            let body = read_request_body(&mut req)?;
            let update: NodeConfigUpdate =
                serde_json::from_slice(&body).context("invalid config payload")?;
            if update.post_interval_sec == Some(0) {
                return write_error(req, 400, "post_interval_sec must be at least 1");
            }
            if update.server_port == Some(0) {
                return write_error(req, 400, "server_port must be between 1 and 65535");
            }

            let outcome = runtime.apply_config_update(update);
            let payload = serde_json::json!({
                "linkChanged": outcome.link_changed,
                "config": runtime.config_view(),
            });
            write_json(req, &payload)
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/config/save", Method::Post, move |req| {
            if !is_authorized(&runtime, &req) {
                return write_error(req, 401, "Missing or invalid API key");
            }
            match runtime.save_config() {
                Ok(()) => write_json(req, &runtime.config_view()),
                Err(err) => {
                    warn!("failed to persist config: {err}");
                    write_error(req, 500, "Failed to persist config")
                }
            }
        })?;
    }

    {
        let runtime = runtime.clone();
        server.fn_handler("/api/config/discard", Method::Post, move |req| {
            if !is_authorized(&runtime, &req) {
                return write_error(req, 401, "Missing or invalid API key");
            }
            match runtime.discard_config() {
                Ok(_) => write_json(req, &runtime.config_view()),
                Err(err) => {
                    warn!("failed to reload config: {err}");
                    write_error(req, 500, "Failed to reload config")
                }
            }
        })?;
    }

    server.fn_handler("/api/config/factory-reset", Method::Post, move |req| {
        if !is_authorized(&runtime, &req) {
            return write_error(req, 401, "Missing or invalid API key");
        }
        match runtime.factory_reset() {
            Ok(_) => write_json(req, &runtime.config_view()),
            Err(err) => {
                warn!("factory reset failed: {err}");
                write_error(req, 500, "Factory reset failed")
            }
        }
    })?;

    Ok(server)
}

/// Requests `/api/health` over loopback so an idle control plane still proves it serves.
fn check_control_plane() -> anyhow::Result<()> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(HEALTH_CHECK_TIMEOUT),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let response = client
        .request(Method::Get, HEALTH_URL, &[("Connection", "close")])?
        .submit()?;
    match response.status() {
        200 => Ok(()),
        status => Err(anyhow!("health check returned {status}")),
    }
}

fn is_authorized(runtime: &NodeRuntime, req: &Request<'_, '_>) -> bool {
    let api_key = runtime
        .config()
        .read(|config| config.upstream.api_key.clone());
    authorize(&api_key, req.header("Authorization"))
}

fn status_for(err: &NodeError) -> u16 {
    match err {
        NodeError::UnknownTask(_) => 404,
        NodeError::UnknownTaskAction(_) => 400,
        NodeError::TaskNotRegistered(_) | NodeError::ActionRefused { .. } => 409,
        _ => 500,
    }
}

fn query_param<'a>(uri: &'a str, name: &str) -> Option<&'a str> {
    let (_, query) = uri.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == name).then_some(value)
    })
}

fn read_request_body(req: &mut Request<'_, '_>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(req: Request<'_, '_>, payload: &T) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(req: Request<'_, '_>, status_code: u16, message: &str) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn ensure_wifi_defaults(config: &mut NodeConfig) {
    if config.network.wifi_ssid.is_empty() {
        config.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if config.network.wifi_pass.is_empty() {
        config.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }
}

/// Mirrors the node log to the ESP-IDF console.
struct EspLogSink;

impl LogSink for EspLogSink {
    fn mirror(&self, entry: &LogEntry) {
        match entry.level {
            LogLevel::Error => log::error!("[{}] {}", entry.timestamp_ms, entry.message),
            LogLevel::Warn => log::warn!("[{}] {}", entry.timestamp_ms, entry.message),
            LogLevel::Info => log::info!("[{}] {}", entry.timestamp_ms, entry.message),
            LogLevel::Debug => log::debug!("[{}] {}", entry.timestamp_ms, entry.message),
        }
    }
}

struct EspStats;

impl DeviceStats for EspStats {
    fn heap_free_bytes(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_free_heap_size() }
    }

    fn heap_min_free_bytes(&self) -> u32 {
        unsafe { esp_idf_svc::sys::esp_get_minimum_free_heap_size() }
    }

    fn stack_headroom_bytes(&self) -> Option<u32> {
        // ESP-IDF reports the high-water mark in bytes.
        Some(unsafe { esp_idf_svc::sys::uxTaskGetStackHighWaterMark(core::ptr::null_mut()) })
    }
}

struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Mutex<()>,
}

fn storage_error(err: impl core::fmt::Display) -> NodeError {
    NodeError::Storage(err.to_string())
}

impl NvsStore {
    fn open(&self) -> NodeResult<EspNvs<esp_idf_svc::nvs::NvsDefault>> {
        EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true).map_err(storage_error)
    }
}

impl ConfigPersistence for NvsStore {
    fn load(&self) -> NodeResult<Option<NodeConfig>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let nvs = self.open()?;
        let mut buffer = vec![0_u8; MAX_HTTP_BODY];

        match nvs.get_str(NVS_CONFIG_KEY, &mut buffer).map_err(storage_error)? {
            Some(value) => serde_json::from_str(value).map(Some).map_err(storage_error),
            None => Ok(None),
        }
    }

    fn save(&self, config: &NodeConfig) -> NodeResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        let payload = serde_json::to_string(config).map_err(storage_error)?;
        nvs.set_str(NVS_CONFIG_KEY, &payload).map_err(storage_error)
    }

    fn erase(&self) -> NodeResult<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut nvs = self.open()?;
        nvs.remove(NVS_CONFIG_KEY).map_err(storage_error)?;
        Ok(())
    }
}

fn link_error(err: impl core::fmt::Display) -> NodeError {
    NodeError::Link(err.to_string())
}

/// Non-blocking Wi-Fi station. `connect` only starts association.
struct StationDriver {
    wifi: EspWifi<'static>,
    hostname: Option<String>,
    power_save_disabled: bool,
}

impl LinkDriver for StationDriver {
    fn status(&self) -> LinkStatus {
        let associated = self.wifi.is_connected().unwrap_or(false);
        let netif_up = self.wifi.sta_netif().is_up().unwrap_or(false);
        if associated && netif_up {
            LinkStatus::Connected
        } else {
            LinkStatus::Disconnected
        }
    }

    fn connect(&mut self, credentials: &Credentials) -> NodeResult<()> {
        let auth_method = if credentials.password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: credentials
                    .ssid
                    .as_str()
                    .try_into()
                    .map_err(|_| NodeError::Link("wifi ssid too long".into()))?,
                password: credentials
                    .password
                    .as_str()
                    .try_into()
                    .map_err(|_| NodeError::Link("wifi password too long".into()))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(link_error)?;

        if !self.wifi.is_started().map_err(link_error)? {
            self.wifi.start().map_err(link_error)?;
        }
        if !self.power_save_disabled {
            disable_wifi_power_save();
            self.power_save_disabled = true;
        }
        self.wifi.connect().map_err(link_error)
    }

    fn disconnect(&mut self) {
        if self.wifi.is_started().unwrap_or(false) {
            let _ = self.wifi.disconnect();
        }
    }

    fn rssi_dbm(&self) -> Option<i32> {
        let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
        let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
        (rc == esp_idf_svc::sys::ESP_OK).then_some(i32::from(ap_info.rssi))
    }

    fn set_hostname(&mut self, hostname: &str) -> NodeResult<()> {
        self.wifi
            .sta_netif_mut()
            .set_hostname(hostname)
            .map_err(link_error)?;
        self.hostname = Some(hostname.to_string());
        Ok(())
    }

    fn configure_addressing(&mut self, address: &AddressConfig) -> NodeResult<()> {
        let mut conf = NetifConfiguration::wifi_default_client();
        if let AddressConfig::Static(address) = address {
            conf.key = "WIFI_STA_STATIC"
                .try_into()
                .map_err(|_| NodeError::Link("netif key too long".into()))?;
            conf.ip_configuration = Some(IpConfiguration::Client(IpClientConfiguration::Fixed(
                IpClientSettings {
                    ip: address.ip,
                    subnet: Subnet {
                        gateway: address.gateway,
                        mask: Mask(address.prefix_len()),
                    },
                    dns: Some(address.dns1),
                    secondary_dns: Some(address.dns2),
                },
            )));
        }

        let netif = EspNetif::new_with_conf(&conf).map_err(link_error)?;
        self.wifi.swap_netif_sta(netif).map_err(link_error)?;

        // A fresh netif starts with the default hostname.
        if let Some(hostname) = self.hostname.clone() {
            self.set_hostname(&hostname)?;
        }
        Ok(())
    }
}

struct MdnsAdvertiser {
    mdns: Option<EspMdns>,
}

fn advertise_error(err: impl core::fmt::Display) -> NodeError {
    NodeError::Advertise(err.to_string())
}

impl NameAdvertiser for MdnsAdvertiser {
    fn start(&mut self, name: &str) -> NodeResult<()> {
        self.mdns = None;
        let mut mdns = EspMdns::take().map_err(advertise_error)?;
        mdns.set_hostname(name).map_err(advertise_error)?;
        mdns.set_instance_name(name).map_err(advertise_error)?;
        mdns.add_service(None, "_http", "_tcp", 80, &[])
            .map_err(advertise_error)?;
        self.mdns = Some(mdns);
        Ok(())
    }

    fn stop(&mut self) {
        self.mdns = None;
    }
}

struct Dht22Probe {
    pin: PinDriver<'static, AnyIOPin, InputOutput>,
    delay: Ets,
}

impl Dht22Probe {
    fn new(pin: AnyIOPin) -> anyhow::Result<Self> {
        let mut pin = PinDriver::input_output_od(pin)?;
        pin.set_pull(Pull::Up)?;
        pin.set_high()?;
        Ok(Self { pin, delay: Ets })
    }

    /// Releases the bus and gives the sensor time to settle after a failed transaction.
    fn recover(&mut self) {
        if let Err(err) = self.pin.set_high() {
            warn!("failed to release DHT22 line on GPIO{DHT22_PIN}: {err:?}");
        }
        thread::sleep(DHT_RECOVERY_DELAY);
    }
}

impl SensorProbe for Dht22Probe {
    fn read(&mut self) -> NodeResult<Reading> {
        self.pin
            .set_high()
            .map_err(|err| NodeError::Sensor(format!("GPIO{DHT22_PIN}: {err:?}")))?;

        match dht22::blocking::read(&mut self.delay, &mut self.pin) {
            Ok(reading) => {
                let reading = Reading {
                    temperature_c: reading.temperature,
                    humidity_pct: reading.relative_humidity,
                };
                if !(-40.0..=80.0).contains(&reading.temperature_c)
                    || !(0.0..=100.0).contains(&reading.humidity_pct)
                {
                    return Err(NodeError::Sensor(format!(
                        "implausible reading {:.1} C {:.1} %",
                        reading.temperature_c, reading.humidity_pct
                    )));
                }
                Ok(reading)
            }
            Err(err) => {
                self.recover();
                Err(NodeError::Sensor(format!("DHT22 on GPIO{DHT22_PIN}: {err:?}")))
            }
        }
    }
}

/// One `EspHttpConnection` per post, closed after the reply status is read.
struct HttpUplink;

fn upstream_error(err: impl core::fmt::Debug) -> NodeError {
    NodeError::Upstream(format!("{err:?}"))
}

impl Uplink for HttpUplink {
    fn post_json(&mut self, upstream: &UpstreamConfig, body: &[u8]) -> NodeResult<u16> {
        let url = upstream_url(upstream);

        let http_conf = HttpClientConfiguration {
            timeout: Some(UPLINK_TIMEOUT),
            crt_bundle_attach: if upstream.use_tls && !upstream.https_insecure {
                Some(esp_idf_svc::sys::esp_crt_bundle_attach)
            } else {
                None
            },
            ..Default::default()
        };
        let mut client =
            HttpClient::wrap(EspHttpConnection::new(&http_conf).map_err(upstream_error)?);

        let content_length = body.len().to_string();
        let authorization = format!("Bearer {}", upstream.api_key);
        let mut headers = vec![
            ("Content-Type", "application/json"),
            ("Content-Length", content_length.as_str()),
            ("Connection", "close"),
        ];
        if !upstream.api_key.is_empty() {
            headers.push(("Authorization", authorization.as_str()));
        }

        let mut request = client
            .request(Method::Post, &url, &headers)
            .map_err(upstream_error)?;
        request.write_all(body).map_err(upstream_error)?;
        request.flush().map_err(upstream_error)?;
        let response = request.submit().map_err(upstream_error)?;
        Ok(response.status())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}
