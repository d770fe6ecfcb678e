use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::clock::Clock;

/// Reported signal strength while the link is down.
pub const RSSI_DISCONNECTED_DBM: i32 = -127;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostKind {
    Reading,
    Error,
}

/// Live device readings gathered outside the metrics lock.
pub trait Environment: Send + Sync {
    fn heap_free_bytes(&self) -> u32;
    fn heap_min_free_bytes(&self) -> u32;
    fn link_connected(&self) -> bool;
    fn rssi_dbm(&self) -> Option<i32>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PostStats {
    pub total: u32,
    pub failed: u32,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    #[serde(rename = "lastMs")]
    pub last_ms: u64,
    #[serde(rename = "lastSuccessMs")]
    pub last_success_ms: u64,
}

impl PostStats {
    fn record(&mut self, success: bool, now_ms: u64) {
        self.total = self.total.wrapping_add(1);
        self.last_ms = now_ms;
        if success {
            self.consecutive_failures = 0;
            self.last_success_ms = now_ms;
        } else {
            self.failed = self.failed.wrapping_add(1);
            self.consecutive_failures = self.consecutive_failures.wrapping_add(1);
        }
    }
}

// Counters wrap silently at u32::MAX.
#[derive(Debug, Clone, Copy, Default)]
struct MetricsData {
    sensor_read_total: u32,
    sensor_read_success: u32,
    sensor_read_failed: u32,
    sensor_read_consecutive_failures: u32,
    last_sensor_read_ms: u64,
    last_sensor_read_success_ms: u64,
    last_temperature_c: Option<f32>,
    last_humidity_pct: Option<f32>,

    post_reading: PostStats,
    post_error: PostStats,

    wifi_connect_attempts: u32,
    wifi_reconnect_events: u32,
    wifi_last_attempt_ms: u64,
    wifi_last_connected_ms: u64,
    wifi_last_disconnected_ms: u64,
    wifi_current_backoff_ms: u64,
    wifi_current_attempt_number: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub sensor_read_total: u32,
    pub sensor_read_success: u32,
    pub sensor_read_failed: u32,
    pub sensor_read_consecutive_failures: u32,
    pub last_sensor_read_ms: u64,
    pub last_sensor_read_success_ms: u64,
    pub last_temperature_c: Option<f32>,
    pub last_humidity_pct: Option<f32>,

    pub post_reading: PostStats,
    pub post_error: PostStats,

    pub uptime_ms: u64,
    pub heap_free_bytes: u32,
    pub heap_min_bytes: u32,
    pub wifi_rssi_dbm: i32,
    pub wifi_connected: bool,
    pub wifi_connect_attempts: u32,
    pub wifi_reconnect_events: u32,
    pub wifi_last_attempt_ms: u64,
    pub wifi_last_connected_ms: u64,
    pub wifi_last_disconnected_ms: u64,
    pub wifi_current_backoff_ms: u64,
    pub wifi_connection_duration_ms: u64,
    pub wifi_current_attempt_number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: &'static str,
    pub kind: MetricKind,
    pub value: f64,
}

impl MetricsSnapshot {
    /// Flattens the snapshot into named samples. Names are stable across releases.
    pub fn samples(&self) -> Vec<MetricSample> {
        use MetricKind::{Counter, Gauge};

        let optional = |value: Option<f32>| value.map_or(f64::NAN, f64::from);
        let flag = |value: bool| if value { 1.0 } else { 0.0 };

        let rows: [(&'static str, MetricKind, f64); 31] = [
            ("sensor_read_total", Counter, self.sensor_read_total.into()),
            ("sensor_read_success_total", Counter, self.sensor_read_success.into()),
            ("sensor_read_failed_total", Counter, self.sensor_read_failed.into()),
            (
                "sensor_read_consecutive_failures",
                Gauge,
                self.sensor_read_consecutive_failures.into(),
            ),
            ("sensor_last_read_ms", Gauge, self.last_sensor_read_ms as f64),
            (
                "sensor_last_read_success_ms",
                Gauge,
                self.last_sensor_read_success_ms as f64,
            ),
            ("sensor_temperature_celsius", Gauge, optional(self.last_temperature_c)),
            ("sensor_humidity_percent", Gauge, optional(self.last_humidity_pct)),
            ("post_reading_total", Counter, self.post_reading.total.into()),
            ("post_reading_failed_total", Counter, self.post_reading.failed.into()),
            (
                "post_reading_consecutive_failures",
                Gauge,
                self.post_reading.consecutive_failures.into(),
            ),
            ("post_reading_last_ms", Gauge, self.post_reading.last_ms as f64),
            (
                "post_reading_last_success_ms",
                Gauge,
                self.post_reading.last_success_ms as f64,
            ),
            ("post_error_total", Counter, self.post_error.total.into()),
            ("post_error_failed_total", Counter, self.post_error.failed.into()),
            (
                "post_error_consecutive_failures",
                Gauge,
                self.post_error.consecutive_failures.into(),
            ),
            ("post_error_last_ms", Gauge, self.post_error.last_ms as f64),
            (
                "post_error_last_success_ms",
                Gauge,
                self.post_error.last_success_ms as f64,
            ),
            ("uptime_ms", Gauge, self.uptime_ms as f64),
            ("heap_free_bytes", Gauge, self.heap_free_bytes.into()),
            ("heap_min_free_bytes", Gauge, self.heap_min_bytes.into()),
            ("wifi_rssi_dbm", Gauge, self.wifi_rssi_dbm.into()),
            ("wifi_connected", Gauge, flag(self.wifi_connected)),
            ("wifi_connect_attempts_total", Counter, self.wifi_connect_attempts.into()),
            ("wifi_reconnect_events_total", Counter, self.wifi_reconnect_events.into()),
            ("wifi_last_attempt_ms", Gauge, self.wifi_last_attempt_ms as f64),
            ("wifi_last_connected_ms", Gauge, self.wifi_last_connected_ms as f64),
            (
                "wifi_last_disconnected_ms",
                Gauge,
                self.wifi_last_disconnected_ms as f64,
            ),
            ("wifi_current_backoff_ms", Gauge, self.wifi_current_backoff_ms as f64),
            (
                "wifi_connection_duration_ms",
                Gauge,
                self.wifi_connection_duration_ms as f64,
            ),
            (
                "wifi_current_attempt_number",
                Gauge,
                self.wifi_current_attempt_number.into(),
            ),
        ];

        rows.into_iter()
            .map(|(name, kind, value)| MetricSample { name, kind, value })
            .collect()
    }
}

/// Shared counters and gauges. The lock is held only for field updates and the bulk copy.
pub struct Metrics {
    data: Mutex<MetricsData>,
    clock: Arc<dyn Clock>,
}

impl Metrics {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            data: Mutex::new(MetricsData::default()),
            clock,
        }
    }

    fn update(&self, f: impl FnOnce(&mut MetricsData, u64)) {
        let now_ms = self.clock.now().as_millis();
        let mut data = self.data.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut data, now_ms);
    }

    pub fn record_sensor_read(&self, success: bool, temperature_c: f32, humidity_pct: f32) {
        self.update(|data, now_ms| {
            data.sensor_read_total = data.sensor_read_total.wrapping_add(1);
            data.last_sensor_read_ms = now_ms;
            if success {
                data.sensor_read_success = data.sensor_read_success.wrapping_add(1);
                data.sensor_read_consecutive_failures = 0;
                data.last_sensor_read_success_ms = now_ms;
                data.last_temperature_c = Some(temperature_c);
                data.last_humidity_pct = Some(humidity_pct);
            } else {
                data.sensor_read_failed = data.sensor_read_failed.wrapping_add(1);
                data.sensor_read_consecutive_failures =
                    data.sensor_read_consecutive_failures.wrapping_add(1);
            }
        });
    }

    pub fn record_post_result(&self, kind: PostKind, success: bool) {
        self.update(|data, now_ms| match kind {
            PostKind::Reading => data.post_reading.record(success, now_ms),
            PostKind::Error => data.post_error.record(success, now_ms),
        });
    }

    pub fn record_wifi_attempt(&self, attempt_number: u32, backoff_ms: u64) {
        self.update(|data, now_ms| {
            data.wifi_connect_attempts = data.wifi_connect_attempts.wrapping_add(1);
            data.wifi_current_attempt_number = attempt_number;
            data.wifi_last_attempt_ms = now_ms;
            data.wifi_current_backoff_ms = backoff_ms;
        });
    }

    pub fn record_wifi_connected(&self) {
        self.update(|data, now_ms| {
            data.wifi_last_connected_ms = now_ms;
            data.wifi_current_backoff_ms = 0;
            data.wifi_current_attempt_number = 0;
        });
    }

    pub fn record_wifi_disconnected(&self) {
        self.update(|data, now_ms| {
            data.wifi_reconnect_events = data.wifi_reconnect_events.wrapping_add(1);
            data.wifi_last_disconnected_ms = now_ms;
        });
    }

    pub fn snapshot(&self, env: &dyn Environment) -> MetricsSnapshot {
        let data = *self.data.lock().unwrap_or_else(PoisonError::into_inner);

        let uptime_ms = self.clock.now().as_millis();
        let wifi_connected = env.link_connected();
        let wifi_rssi_dbm = if wifi_connected {
            env.rssi_dbm().unwrap_or(RSSI_DISCONNECTED_DBM)
        } else {
            RSSI_DISCONNECTED_DBM
        };
        let wifi_connection_duration_ms = if wifi_connected && data.wifi_last_connected_ms != 0 {
            uptime_ms.saturating_sub(data.wifi_last_connected_ms)
        } else {
            0
        };

        MetricsSnapshot {
            sensor_read_total: data.sensor_read_total,
            sensor_read_success: data.sensor_read_success,
            sensor_read_failed: data.sensor_read_failed,
            sensor_read_consecutive_failures: data.sensor_read_consecutive_failures,
            last_sensor_read_ms: data.last_sensor_read_ms,
            last_sensor_read_success_ms: data.last_sensor_read_success_ms,
            last_temperature_c: data.last_temperature_c,
            last_humidity_pct: data.last_humidity_pct,
            post_reading: data.post_reading,
            post_error: data.post_error,
            uptime_ms,
            heap_free_bytes: env.heap_free_bytes(),
            heap_min_bytes: env.heap_min_free_bytes(),
            wifi_rssi_dbm,
            wifi_connected,
            wifi_connect_attempts: data.wifi_connect_attempts,
            wifi_reconnect_events: data.wifi_reconnect_events,
            wifi_last_attempt_ms: data.wifi_last_attempt_ms,
            wifi_last_connected_ms: data.wifi_last_connected_ms,
            wifi_last_disconnected_ms: data.wifi_last_disconnected_ms,
            wifi_current_backoff_ms: data.wifi_current_backoff_ms,
            wifi_connection_duration_ms,
            wifi_current_attempt_number: data.wifi_current_attempt_number,
        }
    }
}
