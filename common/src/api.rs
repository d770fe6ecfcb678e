use std::{fmt::Write as _, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    cadence::ScheduleState,
    error::{NodeError, NodeResult},
    link::LinkState,
    log_ring::{LogEntry, LogLevel},
    metrics::MetricSample,
    report::Reading,
    task::TaskId,
    watchdog::{TaskView, TaskWatchdog},
};

/// Prefix of every exported metric name.
pub const METRICS_PREFIX: &str = "sensornode_";

/// Default number of entries returned by the logs endpoint.
pub const DEFAULT_LOG_ENTRIES: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub location: String,
    #[serde(rename = "wifiConnected")]
    pub wifi_connected: bool,
    #[serde(rename = "linkState")]
    pub link_state: LinkState,
    #[serde(rename = "rssiDbm")]
    pub rssi_dbm: Option<i32>,
    #[serde(rename = "uptimeMs")]
    pub uptime_ms: u64,
    #[serde(rename = "heapFreeBytes")]
    pub heap_free_bytes: u32,
    #[serde(rename = "heapMinFreeBytes")]
    pub heap_min_free_bytes: u32,
    #[serde(rename = "timeSynced")]
    pub time_synced: bool,
    pub schedule: Option<ScheduleState>,
    pub tasks: Vec<TaskView>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogsView {
    pub level: LogLevel,
    pub entries: Vec<LogEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Restart,
    Suspend,
    Resume,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Restart => "restart",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }
}

impl FromStr for TaskAction {
    type Err = NodeError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        match text.trim().to_ascii_lowercase().as_str() {
            "restart" => Ok(Self::Restart),
            "suspend" => Ok(Self::Suspend),
            "resume" => Ok(Self::Resume),
            _ => Err(NodeError::UnknownTaskAction(text.to_string())),
        }
    }
}

/// Body of `POST /api/tasks`. Both fields are free text so unknown values surface as
/// [`NodeError`]s rather than deserialisation failures.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskActionRequest {
    pub name: String,
    pub action: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskActionReply {
    pub ok: bool,
    pub name: &'static str,
    pub action: TaskAction,
}

/// Routes a control-plane task action to the watchdog. The HTTP server task serves the
/// request itself, so it cannot be suspended from here.
pub fn apply_task_action(
    watchdog: &TaskWatchdog,
    request: &TaskActionRequest,
) -> NodeResult<TaskActionReply> {
    let id: TaskId = request.name.parse()?;
    let action: TaskAction = request.action.parse()?;

    match (id, action) {
        (TaskId::HttpServer, TaskAction::Suspend) => {
            return Err(NodeError::ActionRefused {
                task: id.name(),
                action: action.as_str(),
            })
        }
        (_, TaskAction::Restart) => watchdog.restart(id)?,
        (_, TaskAction::Suspend) => watchdog.suspend(id)?,
        (_, TaskAction::Resume) => watchdog.resume(id)?,
    }

    Ok(TaskActionReply {
        ok: true,
        name: id.name(),
        action,
    })
}

/// Result of an on-demand sensor read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingView {
    pub ok: bool,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReadingView {
    pub fn new(location: &str, result: NodeResult<Reading>) -> Self {
        match result {
            Ok(reading) => Self {
                ok: true,
                location: location.to_string(),
                temperature_c: Some(reading.temperature_c),
                humidity_pct: Some(reading.humidity_pct),
                error: None,
            },
            Err(err) => Self {
                ok: false,
                location: location.to_string(),
                temperature_c: None,
                humidity_pct: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Text exposition of metric samples, one `# TYPE` line per sample.
pub fn render_metrics_text(samples: &[MetricSample]) -> String {
    let mut out = String::with_capacity(samples.len() * 64);
    for sample in samples {
        let name = format!("{METRICS_PREFIX}{}", sample.name);
        let _ = writeln!(out, "# TYPE {name} {}", sample.kind.as_str());
        if sample.value.is_finite() {
            let _ = writeln!(out, "{name} {}", sample.value);
        } else {
            let _ = writeln!(out, "{name} NaN");
        }
    }
    out
}

/// Checks an `Authorization` header against the configured API key. An empty key
/// leaves the control plane open.
pub fn authorize(api_key: &str, header: Option<&str>) -> bool {
    if api_key.is_empty() {
        return true;
    }
    let Some(token) = header.and_then(|value| value.trim().strip_prefix("Bearer ")) else {
        return false;
    };
    constant_time_eq(token.trim().as_bytes(), api_key.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        clock::ManualClock,
        log_ring::{LogRing, NullSink},
        metrics::MetricKind,
        task::{RunState, TaskHandle},
        watchdog::RestartFn,
    };

    fn watchdog() -> TaskWatchdog {
        let clock = Arc::new(ManualClock::new());
        let log = Arc::new(LogRing::new(clock.clone(), Box::new(NullSink)));
        TaskWatchdog::new(clock, log)
    }

    fn request(name: &str, action: &str) -> TaskActionRequest {
        TaskActionRequest {
            name: name.into(),
            action: action.into(),
        }
    }

    #[test]
    fn task_actions_reach_the_registered_task() {
        let watchdog = watchdog();
        let restarts = Arc::new(AtomicUsize::new(0));
        let hits = restarts.clone();
        let restart: RestartFn = Arc::new(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });
        let owner = TaskHandle::detached("sensor");
        watchdog.register_with_owner(TaskId::Sensor, "sensor", restart, 30_000, Some(owner.clone()));

        let reply = apply_task_action(&watchdog, &request("sensor", "Suspend")).unwrap();
        assert_eq!(reply.action, TaskAction::Suspend);
        assert_eq!(owner.state(), RunState::Suspended);

        apply_task_action(&watchdog, &request("sensor", "resume")).unwrap();
        assert_eq!(owner.state(), RunState::Running);

        apply_task_action(&watchdog, &request("sensor", "restart")).unwrap();
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bad_task_requests_are_rejected() {
        let watchdog = watchdog();
        assert_eq!(
            apply_task_action(&watchdog, &request("mqtt", "restart")).unwrap_err(),
            NodeError::UnknownTask("mqtt".into())
        );
        assert_eq!(
            apply_task_action(&watchdog, &request("sensor", "kill")).unwrap_err(),
            NodeError::UnknownTaskAction("kill".into())
        );
        assert_eq!(
            apply_task_action(&watchdog, &request("network", "restart")).unwrap_err(),
            NodeError::TaskNotRegistered("network")
        );
        assert_eq!(
            apply_task_action(&watchdog, &request("http-server", "suspend")).unwrap_err(),
            NodeError::ActionRefused {
                task: "http-server",
                action: "suspend"
            }
        );
    }

    #[test]
    fn metrics_text_has_type_lines() {
        let samples = vec![
            MetricSample {
                name: "sensor_read_total",
                kind: MetricKind::Counter,
                value: 3.0,
            },
            MetricSample {
                name: "last_temperature_c",
                kind: MetricKind::Gauge,
                value: f64::NAN,
            },
        ];
        assert_eq!(
            render_metrics_text(&samples),
            "# TYPE sensornode_sensor_read_total counter\n\
             sensornode_sensor_read_total 3\n\
             # TYPE sensornode_last_temperature_c gauge\n\
             sensornode_last_temperature_c NaN\n"
        );
    }

    #[test]
    fn bearer_token_must_match_when_key_is_set() {
        assert!(authorize("", None));
        assert!(authorize("s3cret", Some("Bearer s3cret")));
        assert!(!authorize("s3cret", Some("Bearer s3cre")));
        assert!(!authorize("s3cret", Some("s3cret")));
        assert!(!authorize("s3cret", None));
    }

    #[test]
    fn reading_view_omits_absent_fields() {
        let ok = ReadingView::new(
            "attic",
            Ok(Reading {
                temperature_c: 21.5,
                humidity_pct: 40.0,
            }),
        );
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"ok":true,"location":"attic","temperature_c":21.5,"humidity_pct":40.0}"#
        );

        let failed = ReadingView::new("attic", Err(NodeError::Sensor("timeout".into())));
        assert_eq!(
            serde_json::to_string(&failed).unwrap(),
            r#"{"ok":false,"location":"attic","error":"sensor read failed: timeout"}"#
        );
    }
}
