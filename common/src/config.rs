use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::{error::NodeResult, log_ring::LogLevel};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub hostname: String,
    pub mdns_hostname: String,
    pub use_static_ip: bool,
    pub static_ip: String,
    pub gateway: String,
    pub subnet: String,
    pub dns1: String,
    pub dns2: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            hostname: String::new(),
            mdns_hostname: String::new(),
            use_static_ip: false,
            static_ip: String::new(),
            gateway: String::new(),
            subnet: String::new(),
            dns1: String::new(),
            dns2: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub server_host: String,
    pub server_port: u16,
    pub server_path: String,
    pub api_key: String,
    pub use_tls: bool,
    pub https_insecure: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            server_host: "192.168.1.100".to_string(),
            server_port: 8080,
            server_path: "/temperature".to_string(),
            api_key: String::new(),
            use_tls: false,
            https_insecure: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CadenceConfig {
    pub post_interval_sec: u32,
    pub align_to_boundary: bool,
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            post_interval_sec: 60,
            align_to_boundary: true,
        }
    }
}

impl CadenceConfig {
    pub fn sanitize(&mut self) {
        self.post_interval_sec = self.post_interval_sec.max(1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device_location: String,
    pub network: NetworkConfig,
    pub upstream: UpstreamConfig,
    pub cadence: CadenceConfig,
    pub log_level: LogLevel,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_location: "sensor-node".to_string(),
            network: NetworkConfig::default(),
            upstream: UpstreamConfig::default(),
            cadence: CadenceConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

/// Partial update; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigUpdate {
    pub device_location: Option<String>,
    pub wifi_ssid: Option<String>,
    pub wifi_pass: Option<String>,
    pub hostname: Option<String>,
    pub mdns_hostname: Option<String>,
    pub use_static_ip: Option<bool>,
    pub static_ip: Option<String>,
    pub gateway: Option<String>,
    pub subnet: Option<String>,
    pub dns1: Option<String>,
    pub dns2: Option<String>,
    pub server_host: Option<String>,
    pub server_port: Option<u16>,
    pub server_path: Option<String>,
    pub api_key: Option<String>,
    pub use_tls: Option<bool>,
    pub https_insecure: Option<bool>,
    pub post_interval_sec: Option<u32>,
    pub align_to_boundary: Option<bool>,
    pub log_level: Option<LogLevel>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Credentials or station addressing changed; the link should reconnect.
    pub link_changed: bool,
}

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.cadence.sanitize();
    }

    pub fn apply_update(&mut self, update: NodeConfigUpdate) -> UpdateOutcome {
        let previous = self.network.clone();

        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }

        set(&mut self.device_location, update.device_location);
        set(&mut self.network.wifi_ssid, update.wifi_ssid);
        set(&mut self.network.wifi_pass, update.wifi_pass);
        set(&mut self.network.hostname, update.hostname);
        set(&mut self.network.mdns_hostname, update.mdns_hostname);
        set(&mut self.network.use_static_ip, update.use_static_ip);
        set(&mut self.network.static_ip, update.static_ip);
        set(&mut self.network.gateway, update.gateway);
        set(&mut self.network.subnet, update.subnet);
        set(&mut self.network.dns1, update.dns1);
        set(&mut self.network.dns2, update.dns2);
        set(&mut self.upstream.server_host, update.server_host);
        set(&mut self.upstream.server_port, update.server_port);
        set(&mut self.upstream.server_path, update.server_path);
        set(&mut self.upstream.api_key, update.api_key);
        set(&mut self.upstream.use_tls, update.use_tls);
        set(&mut self.upstream.https_insecure, update.https_insecure);
        set(&mut self.cadence.post_interval_sec, update.post_interval_sec);
        set(&mut self.cadence.align_to_boundary, update.align_to_boundary);
        set(&mut self.log_level, update.log_level);
        self.sanitize();

        UpdateOutcome {
            link_changed: link_restart_required(&previous, &self.network),
        }
    }
}

fn link_restart_required(previous: &NetworkConfig, current: &NetworkConfig) -> bool {
    previous.wifi_ssid != current.wifi_ssid
        || previous.wifi_pass != current.wifi_pass
        || previous.use_static_ip != current.use_static_ip
        || previous.static_ip != current.static_ip
        || previous.gateway != current.gateway
        || previous.subnet != current.subnet
        || previous.dns1 != current.dns1
        || previous.dns2 != current.dns2
}

/// Durable backing for [`NodeConfig`].
pub trait ConfigPersistence: Send + Sync {
    /// `None` when nothing has been saved yet.
    fn load(&self) -> NodeResult<Option<NodeConfig>>;
    fn save(&self, config: &NodeConfig) -> NodeResult<()>;
    fn erase(&self) -> NodeResult<()>;
}

/// Secrets replaced by a marker, for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigView {
    #[serde(flatten)]
    pub config: NodeConfig,
    pub persisted: bool,
}

pub const SECRET_MASK: &str = "********";

impl ConfigView {
    pub fn new(mut config: NodeConfig, persisted: bool) -> Self {
        for secret in [&mut config.network.wifi_pass, &mut config.upstream.api_key] {
            if !secret.is_empty() {
                *secret = SECRET_MASK.to_string();
            }
        }
        Self { config, persisted }
    }
}

/// Configuration provider shared by every task; readers always get a fresh copy.
#[derive(Debug, Clone, Default)]
pub struct SharedConfig {
    inner: Arc<RwLock<NodeConfig>>,
}

impl SharedConfig {
    pub fn new(mut config: NodeConfig) -> Self {
        config.sanitize();
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    pub fn snapshot(&self) -> NodeConfig {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&NodeConfig) -> R) -> R {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn apply(&self, update: NodeConfigUpdate) -> UpdateOutcome {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply_update(update)
    }

    /// Swaps in a whole configuration, reporting link changes like [`Self::apply`].
    pub fn replace(&self, mut config: NodeConfig) -> UpdateOutcome {
        config.sanitize();
        let mut current = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let link_changed = link_restart_required(&current.network, &config.network);
        *current = config;
        UpdateOutcome { link_changed }
    }
}
