use serde::Serialize;

use crate::{
    config::{NodeConfig, UpstreamConfig},
    error::{NodeError, NodeResult},
    log_ring::LogRing,
    metrics::{Metrics, PostKind},
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

pub trait SensorProbe: Send {
    fn read(&mut self) -> NodeResult<Reading>;
}

/// Outbound JSON POST. Returns the HTTP status code of the collector's reply.
pub trait Uplink: Send {
    fn post_json(&mut self, upstream: &UpstreamConfig, body: &[u8]) -> NodeResult<u16>;
}

#[derive(Debug, Serialize)]
pub struct ReadingPayload<'a> {
    pub location: &'a str,
    pub temperature_c: f32,
    pub humidity_pct: f32,
}

#[derive(Debug, Serialize)]
pub struct ErrorPayload<'a> {
    pub location: &'a str,
    pub error: &'a str,
}

fn round2(value: f32) -> f32 {
    (value * 100.0).round() / 100.0
}

/// Reads the sensor once and reports the reading, or the read error, upstream.
/// Returns `true` only when a reading was delivered.
pub fn run_report_cycle(
    sensor: &mut dyn SensorProbe,
    uplink: &mut dyn Uplink,
    config: &NodeConfig,
    metrics: &Metrics,
    log: &LogRing,
) -> bool {
    match sensor.read() {
        Ok(reading) => {
            metrics.record_sensor_read(true, reading.temperature_c, reading.humidity_pct);
            log.info(format_args!(
                "reading {:.2} C {:.2} %",
                reading.temperature_c, reading.humidity_pct
            ));
            let payload = ReadingPayload {
                location: &config.device_location,
                temperature_c: round2(reading.temperature_c),
                humidity_pct: round2(reading.humidity_pct),
            };
            post(uplink, config, metrics, log, PostKind::Reading, &payload)
        }
        Err(err) => {
            metrics.record_sensor_read(false, f32::NAN, f32::NAN);
            let message = err.to_string();
            log.warn(format_args!("{message}"));
            let payload = ErrorPayload {
                location: &config.device_location,
                error: &message,
            };
            post(uplink, config, metrics, log, PostKind::Error, &payload);
            false
        }
    }
}

fn post<T: Serialize>(
    uplink: &mut dyn Uplink,
    config: &NodeConfig,
    metrics: &Metrics,
    log: &LogRing,
    kind: PostKind,
    payload: &T,
) -> bool {
    let result = serde_json::to_vec(payload)
        .map_err(|err| NodeError::Upstream(err.to_string()))
        .and_then(|body| uplink.post_json(&config.upstream, &body));

    let success = match result {
        Ok(status) if (200..300).contains(&status) => {
            log.debug(format_args!("upstream accepted post ({status})"));
            true
        }
        Ok(status) => {
            log.warn(format_args!("upstream rejected post with status {status}"));
            false
        }
        Err(err) => {
            log.warn(format_args!("{err}"));
            false
        }
    };
    metrics.record_post_result(kind, success);
    success
}

/// Collector endpoint, `http` or `https` per `use_tls`.
pub fn upstream_url(upstream: &UpstreamConfig) -> String {
    let scheme = if upstream.use_tls { "https" } else { "http" };
    format!(
        "{scheme}://{}:{}{}",
        upstream.server_host.trim(),
        upstream.server_port,
        request_path(&upstream.server_path)
    )
}

pub fn request_path(path: &str) -> String {
    let path = path.trim();
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        log_ring::NullSink,
        metrics::Environment,
    };

    struct ScriptedSensor(Vec<NodeResult<Reading>>);

    impl SensorProbe for ScriptedSensor {
        fn read(&mut self) -> NodeResult<Reading> {
            self.0.remove(0)
        }
    }

    #[derive(Default)]
    struct RecordingUplink {
        bodies: Vec<String>,
        status: u16,
    }

    impl Uplink for RecordingUplink {
        fn post_json(&mut self, _upstream: &UpstreamConfig, body: &[u8]) -> NodeResult<u16> {
            self.bodies.push(String::from_utf8_lossy(body).into_owned());
            Ok(self.status)
        }
    }

    struct Offline;

    impl Uplink for Offline {
        fn post_json(&mut self, _upstream: &UpstreamConfig, _body: &[u8]) -> NodeResult<u16> {
            Err(NodeError::Upstream("connection refused".into()))
        }
    }

    struct NoEnv;

    impl Environment for NoEnv {
        fn heap_free_bytes(&self) -> u32 {
            0
        }

        fn heap_min_free_bytes(&self) -> u32 {
            0
        }

        fn link_connected(&self) -> bool {
            true
        }

        fn rssi_dbm(&self) -> Option<i32> {
            None
        }
    }

    fn fixture() -> (NodeConfig, Metrics, LogRing) {
        let clock = Arc::new(ManualClock::new());
        let config = NodeConfig {
            device_location: "attic".into(),
            ..Default::default()
        };
        (
            config,
            Metrics::new(clock.clone()),
            LogRing::new(clock, Box::new(NullSink)),
        )
    }

    #[test]
    fn reading_is_posted_as_json() {
        let (config, metrics, log) = fixture();
        let mut sensor = ScriptedSensor(vec![Ok(Reading {
            temperature_c: 21.504,
            humidity_pct: 40.25,
        })]);
        let mut uplink = RecordingUplink {
            status: 200,
            ..Default::default()
        };

        assert!(run_report_cycle(&mut sensor, &mut uplink, &config, &metrics, &log));
        assert_eq!(
            uplink.bodies,
            vec![r#"{"location":"attic","temperature_c":21.5,"humidity_pct":40.25}"#.to_string()]
        );

        let snap = metrics.snapshot(&NoEnv);
        assert_eq!(snap.sensor_read_success, 1);
        assert_eq!(snap.post_reading.total, 1);
        assert_eq!(snap.post_reading.failed, 0);
    }

    #[test]
    fn sensor_failure_posts_error_payload() {
        let (config, metrics, log) = fixture();
        let mut sensor = ScriptedSensor(vec![Err(NodeError::Sensor("checksum mismatch".into()))]);
        let mut uplink = RecordingUplink {
            status: 204,
            ..Default::default()
        };

        assert!(!run_report_cycle(&mut sensor, &mut uplink, &config, &metrics, &log));
        assert_eq!(
            uplink.bodies,
            vec![
                r#"{"location":"attic","error":"sensor read failed: checksum mismatch"}"#
                    .to_string()
            ]
        );

        let snap = metrics.snapshot(&NoEnv);
        assert_eq!(snap.sensor_read_consecutive_failures, 1);
        assert_eq!(snap.post_error.total, 1);
        assert_eq!(snap.post_error.consecutive_failures, 0);
        assert_eq!(snap.post_reading.total, 0);
    }

    #[test]
    fn upstream_failures_count_consecutively() {
        let (config, metrics, log) = fixture();
        let reading = Reading {
            temperature_c: 20.0,
            humidity_pct: 50.0,
        };
        let mut sensor = ScriptedSensor(vec![Ok(reading), Ok(reading)]);
        assert!(!run_report_cycle(&mut sensor, &mut Offline, &config, &metrics, &log));

        let mut rejecting = RecordingUplink {
            status: 500,
            ..Default::default()
        };
        assert!(!run_report_cycle(&mut sensor, &mut rejecting, &config, &metrics, &log));

        let snap = metrics.snapshot(&NoEnv);
        assert_eq!(snap.post_reading.consecutive_failures, 2);
        assert_eq!(snap.sensor_read_success, 2);
    }

    #[test]
    fn upstream_url_follows_tls_flag() {
        let upstream = UpstreamConfig {
            server_host: "collector.lan".into(),
            server_port: 8443,
            server_path: "ingest".into(),
            ..Default::default()
        };
        assert_eq!(upstream_url(&upstream), "http://collector.lan:8443/ingest");

        let upstream = UpstreamConfig {
            use_tls: true,
            server_path: " /v1/readings ".into(),
            ..upstream
        };
        assert_eq!(upstream_url(&upstream), "https://collector.lan:8443/v1/readings");
    }
}
