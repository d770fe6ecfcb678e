use std::{
    sync::{
        atomic::{AtomicBool, AtomicI32, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::Serialize;

use crate::{
    addressing::{advertised_name, station_hostname, AddressConfig},
    backoff::Backoff,
    clock::Tick,
    config::{NodeConfig, SharedConfig},
    error::NodeResult,
    log_ring::LogRing,
    metrics::{Metrics, RSSI_DISCONNECTED_DBM},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Connected,
    Disconnected,
}

/// Station interface. `connect` only starts an association; completion is observed
/// through `status`.
pub trait LinkDriver: Send {
    fn status(&self) -> LinkStatus;
    fn connect(&mut self, credentials: &Credentials) -> NodeResult<()>;
    fn disconnect(&mut self);
    fn rssi_dbm(&self) -> Option<i32>;
    fn set_hostname(&mut self, hostname: &str) -> NodeResult<()>;
    fn configure_addressing(&mut self, address: &AddressConfig) -> NodeResult<()>;
}

/// Local discovery service (mDNS).
pub trait NameAdvertiser: Send {
    fn start(&mut self, name: &str) -> NodeResult<()>;
    fn stop(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Default)]
struct ReconnectFlags {
    requested: bool,
    immediate: bool,
}

/// Cross-task reconnect request. Any thread may set it; the link task consumes it.
#[derive(Debug, Clone, Default)]
pub struct ReconnectHandle {
    flags: Arc<Mutex<ReconnectFlags>>,
}

impl ReconnectHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self, immediate: bool) {
        let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        flags.requested = true;
        if immediate {
            flags.immediate = true;
        }
    }

    /// Reads and clears the pending request. `Some(immediate)` when one was pending.
    pub fn take(&self) -> Option<bool> {
        let mut flags = self.flags.lock().unwrap_or_else(PoisonError::into_inner);
        if !flags.requested {
            return None;
        }
        let immediate = flags.immediate;
        *flags = ReconnectFlags::default();
        Some(immediate)
    }
}

/// Link liveness published for readers outside the link task.
#[derive(Debug)]
pub struct LinkSignal {
    up: AtomicBool,
    rssi_dbm: AtomicI32,
}

impl Default for LinkSignal {
    fn default() -> Self {
        Self {
            up: AtomicBool::new(false),
            rssi_dbm: AtomicI32::new(RSSI_DISCONNECTED_DBM),
        }
    }
}

impl LinkSignal {
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    pub fn rssi_dbm(&self) -> Option<i32> {
        if !self.is_up() {
            return None;
        }
        Some(self.rssi_dbm.load(Ordering::Relaxed))
    }

    fn publish(&self, up: bool, rssi_dbm: Option<i32>) {
        self.rssi_dbm
            .store(rssi_dbm.unwrap_or(RSSI_DISCONNECTED_DBM), Ordering::Relaxed);
        self.up.store(up, Ordering::Release);
    }
}

pub struct LinkManager {
    driver: Box<dyn LinkDriver>,
    advertiser: Box<dyn NameAdvertiser>,
    config: SharedConfig,
    metrics: Arc<Metrics>,
    log: Arc<LogRing>,
    reconnect: ReconnectHandle,
    signal: Arc<LinkSignal>,

    state: LinkState,
    was_connected: bool,
    next_attempt: Option<Tick>,
    backoff: Backoff,
    attempt_counter: u32,
    applied_hostname: Option<String>,
    applied_address: Option<AddressConfig>,
    address_warning: Option<String>,
    advertised: Option<String>,
    advertise_failed_for: Option<String>,
}

impl LinkManager {
    pub fn new(
        driver: Box<dyn LinkDriver>,
        advertiser: Box<dyn NameAdvertiser>,
        config: SharedConfig,
        metrics: Arc<Metrics>,
        log: Arc<LogRing>,
    ) -> Self {
        Self {
            driver,
            advertiser,
            config,
            metrics,
            log,
            reconnect: ReconnectHandle::new(),
            signal: Arc::new(LinkSignal::default()),
            state: LinkState::Disconnected,
            was_connected: false,
            next_attempt: None,
            backoff: Backoff::default(),
            attempt_counter: 0,
            applied_hostname: None,
            applied_address: None,
            address_warning: None,
            advertised: None,
            advertise_failed_for: None,
        }
    }

    pub fn reconnect_handle(&self) -> ReconnectHandle {
        self.reconnect.clone()
    }

    pub fn signal(&self) -> Arc<LinkSignal> {
        self.signal.clone()
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn current_backoff(&self) -> Duration {
        self.backoff.current()
    }

    pub fn next_attempt_deadline(&self) -> Option<Tick> {
        self.next_attempt
    }

    pub fn attempt_counter(&self) -> u32 {
        self.attempt_counter
    }

    pub fn init(&mut self) {
        self.stop_advertisement();
        self.driver.disconnect();
        self.state = LinkState::Disconnected;
        self.was_connected = false;
        self.next_attempt = None;
        self.backoff.reset();
        self.attempt_counter = 0;
        self.applied_hostname = None;
        self.applied_address = None;
        self.address_warning = None;
        self.signal.publish(false, None);
        self.reconnect.request(true);
    }

    /// Drives the link one step. Never blocks on association.
    pub fn step(&mut self, now: Tick) {
        let config = self.config.snapshot();

        if self.driver.status() == LinkStatus::Connected {
            if !self.was_connected {
                self.was_connected = true;
                self.state = LinkState::Connected;
                self.backoff.reset();
                self.next_attempt = None;
                self.log.info(format_args!(
                    "wifi connected after {} attempt(s)",
                    self.attempt_counter
                ));
                self.metrics.record_wifi_connected();
            }
            self.signal.publish(true, self.driver.rssi_dbm());
            self.ensure_advertisement(&config);
            return;
        }

        if self.was_connected {
            self.was_connected = false;
            self.state = LinkState::Disconnected;
            self.next_attempt = None;
            self.log
                .warn(format_args!("wifi link lost; scheduling reconnect"));
            self.metrics.record_wifi_disconnected();
            self.signal.publish(false, None);
        }

        self.stop_advertisement();

        let request = self.reconnect.take();
        if request == Some(true) {
            self.backoff.reset();
            self.next_attempt = None;
        }

        if request.is_none() {
            if let Some(deadline) = self.next_attempt {
                if now < deadline {
                    return;
                }
            }
        }

        let used = self.backoff.current();
        let reason = if request.is_some() { "requested" } else { "retry" };
        self.start_attempt(&config, reason);
        self.metrics.record_wifi_attempt(
            self.attempt_counter,
            u64::try_from(used.as_millis()).unwrap_or(u64::MAX),
        );
        self.next_attempt = Some(now + used);
        self.backoff.advance();
    }

    fn start_attempt(&mut self, config: &NodeConfig, reason: &str) {
        let ssid = config.network.wifi_ssid.trim();
        if ssid.is_empty() {
            self.log.warn(format_args!(
                "wifi ssid not configured; skipping connection attempt"
            ));
            self.state = LinkState::Disconnected;
            return;
        }

        self.apply_station_config(config);

        self.attempt_counter = self.attempt_counter.wrapping_add(1);
        self.log.info(format_args!(
            "wifi connecting to `{ssid}` (attempt #{}, {reason})",
            self.attempt_counter
        ));

        let credentials = Credentials {
            ssid: ssid.to_string(),
            password: config.network.wifi_pass.trim().to_string(),
        };
        self.driver.disconnect();
        match self.driver.connect(&credentials) {
            Ok(()) => self.state = LinkState::Connecting,
            Err(err) => {
                self.state = LinkState::Disconnected;
                self.log.warn(format_args!("wifi connect failed to start: {err}"));
            }
        }
    }

    fn apply_station_config(&mut self, config: &NodeConfig) {
        let hostname = station_hostname(&config.network, &config.device_location);
        if self.applied_hostname.as_deref() != Some(hostname.as_str()) {
            match self.driver.set_hostname(&hostname) {
                Ok(()) => {
                    self.log.info(format_args!("wifi hostname set to {hostname}"));
                    self.applied_hostname = Some(hostname);
                }
                Err(err) => self
                    .log
                    .warn(format_args!("failed to set hostname {hostname}: {err}")),
            }
        }

        let desired = match AddressConfig::from_network(&config.network) {
            Ok(address) => {
                self.address_warning = None;
                address
            }
            Err(err) => {
                let message = err.to_string();
                if self.address_warning.as_deref() != Some(message.as_str()) {
                    self.log.warn(format_args!(
                        "static IP config invalid ({message}); falling back to DHCP"
                    ));
                    self.address_warning = Some(message);
                }
                AddressConfig::Dhcp
            }
        };

        if self.applied_address == Some(desired) {
            return;
        }
        match self.driver.configure_addressing(&desired) {
            Ok(()) => {
                match desired {
                    AddressConfig::Static(address) => self.log.info(format_args!(
                        "wifi applying static IP {} gateway {} netmask {}",
                        address.ip, address.gateway, address.subnet
                    )),
                    AddressConfig::Dhcp if self.applied_address.is_some_and(|a| a.is_static()) => {
                        self.log.info(format_args!("wifi returning to DHCP"))
                    }
                    AddressConfig::Dhcp => {}
                }
                self.applied_address = Some(desired);
            }
            Err(err) => self
                .log
                .warn(format_args!("failed to apply station addressing: {err}")),
        }
    }

    fn ensure_advertisement(&mut self, config: &NodeConfig) {
        let station = self
            .applied_hostname
            .clone()
            .unwrap_or_else(|| station_hostname(&config.network, &config.device_location));
        let name = advertised_name(&config.network, &station);

        if self.advertised.as_deref() == Some(name.as_str())
            || self.advertise_failed_for.as_deref() == Some(name.as_str())
        {
            return;
        }

        if self.advertised.take().is_some() {
            self.advertiser.stop();
        }

        match self.advertiser.start(&name) {
            Ok(()) => {
                self.log.info(format_args!("mdns advertised as {name}.local"));
                self.advertised = Some(name);
                self.advertise_failed_for = None;
            }
            Err(err) => {
                self.log
                    .warn(format_args!("mdns failed to start for {name}: {err}"));
                self.advertise_failed_for = Some(name);
            }
        }
    }

    fn stop_advertisement(&mut self) {
        self.advertise_failed_for = None;
        if self.advertised.take().is_some() {
            self.advertiser.stop();
            self.log.info(format_args!("mdns stopped"));
        }
    }
}
