pub mod addressing;
pub mod api;
pub mod backoff;
pub mod cadence;
pub mod clock;
pub mod config;
pub mod error;
pub mod link;
pub mod log_ring;
pub mod metrics;
pub mod report;
pub mod runtime;
pub mod task;
pub mod watchdog;

pub use api::{
    authorize, render_metrics_text, LogsView, ReadingView, StatusView, TaskAction,
    TaskActionRequest,
};
pub use cadence::{CadenceScheduler, ScheduleState};
pub use clock::{Clock, ManualClock, SystemClock, Tick};
pub use config::{ConfigPersistence, ConfigView, NodeConfig, NodeConfigUpdate, SharedConfig};
pub use error::{NodeError, NodeResult};
pub use link::{Credentials, LinkDriver, LinkStatus, NameAdvertiser};
pub use log_ring::{LogLevel, LogRing, LogSink, TracingSink};
pub use metrics::MetricsSnapshot;
pub use report::{Reading, SensorProbe, Uplink};
pub use runtime::{DeviceStats, NodeParts, NodeRuntime, RuntimeTiming};
pub use task::{RunState, TaskId};
