use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("invalid {field} address `{value}`")]
    InvalidAddress { field: &'static str, value: String },
    #[error("link driver error: {0}")]
    Link(String),
    #[error("name advertisement error: {0}")]
    Advertise(String),
    #[error("sensor read failed: {0}")]
    Sensor(String),
    #[error("upstream post failed: {0}")]
    Upstream(String),
    #[error("failed to spawn task `{name}`: {reason}")]
    Spawn { name: String, reason: String },
    #[error("unknown task `{0}`")]
    UnknownTask(String),
    #[error("task `{0}` is not registered")]
    TaskNotRegistered(&'static str),
    #[error("unknown task action `{0}`")]
    UnknownTaskAction(String),
    #[error("refusing to {action} task `{task}` from the control plane")]
    ActionRefused {
        task: &'static str,
        action: &'static str,
    },
    #[error("config storage error: {0}")]
    Storage(String),
    #[error("unknown log level `{0}`")]
    UnknownLogLevel(String),
}

pub type NodeResult<T> = Result<T, NodeError>;
