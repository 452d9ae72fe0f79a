use thiserror::Error;

/// All errors produced by axon-core.
#[derive(Debug, Error)]
pub enum AxonError {
    #[error("no builder registered for resource '{name}'")]
    UnknownResource { name: String },

    #[error("resource '{name}' requires unresolved capability '{capability}'")]
    DependencyMissing { name: String, capability: String },

    #[error("failed to build resource '{name}': {detail}")]
    LoadFailure { name: String, detail: String },

    #[error("build of resource '{name}' timed out")]
    BuildTimeout { name: String },

    #[error("no implementations registered for task '{task}'")]
    UnknownTask { task: String },

    #[error("task '{task}' failed on '{attempted}': {detail}")]
    ExecutionFailure {
        task: String,
        /// The implementation whose failure is being surfaced (the last one tried).
        attempted: String,
        detail: String,
        /// Detail of the first failure when a fallback was attempted and also failed.
        primary_detail: Option<String>,
    },

    #[error("telemetry snapshot unavailable: {0}")]
    TelemetryUnavailable(String),

    #[error("background tasks are already running")]
    AlreadyRunning,

    #[error("background tasks are not running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AxonError>;
