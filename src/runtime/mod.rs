mod docker;

pub use docker::DockerRuntime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Label carrying an operator-assigned stable identifier.
pub const LABEL_MONITOR_ID: &str = "monitoring.id";
/// Compose orchestrator labels used for identity derivation.
pub const LABEL_COMPOSE_PROJECT: &str = "com.docker.compose.project";
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("restart of {id} failed: {reason}")]
    RestartFailed { id: String, reason: String },
    #[error("probe timed out after {0}s")]
    ProbeTimeout(u64),
    #[error("probe failed: {0}")]
    ProbeFailure(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Exited,
    Dead,
    Created,
    Paused,
    Restarting,
    Unknown,
}

impl ContainerState {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "running" => Self::Running,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "created" => Self::Created,
            "paused" => Self::Paused,
            "restarting" => Self::Restarting,
            _ => Self::Unknown,
        }
    }
}

/// Native (Dockerfile HEALTHCHECK) health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeHealth {
    Healthy,
    Unhealthy,
    Starting,
    /// No health check configured.
    None,
}

/// Read-only snapshot of a container as observed from the runtime.
#[derive(Debug, Clone)]
pub struct Observation {
    pub runtime_id: String,
    pub short_id: String,
    /// Container name without the leading `/` the API prepends.
    pub name: String,
    pub labels: HashMap<String, String>,
    pub state: ContainerState,
    /// Exit code of the last run, when the container has stopped.
    pub exit_code: Option<i64>,
    pub health: NativeHealth,
    /// Runtime-reported restart count (informational only).
    pub restart_count: i64,
}

impl Observation {
    pub fn monitoring_id(&self) -> Option<&str> {
        self.labels.get(LABEL_MONITOR_ID).map(String::as_str)
    }

    pub fn compose_project(&self) -> Option<&str> {
        self.labels.get(LABEL_COMPOSE_PROJECT).map(String::as_str)
    }

    pub fn compose_service(&self) -> Option<&str> {
        self.labels.get(LABEL_COMPOSE_SERVICE).map(String::as_str)
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A container `start` event from the runtime's event stream.
#[derive(Debug, Clone)]
pub struct StartEvent {
    pub id: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub ts: DateTime<Utc>,
}

/// Narrow capability set the supervisor needs from a container runtime.
///
/// Everything above this trait is runtime-agnostic; only the Docker
/// implementation touches the SDK.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn list_containers(&self, all: bool) -> Result<Vec<Observation>>;

    async fn inspect(&self, id_or_name: &str) -> Result<Observation>;

    /// Restart a container, waiting up to `timeout_s` for the graceful stop.
    async fn restart(&self, id_or_name: &str, timeout_s: u64) -> Result<()>;

    /// Subscribe to container `start` events.
    ///
    /// The returned channel is fed by a dedicated task that owns the SDK's
    /// blocking stream and re-subscribes after errors. Consumers must never
    /// iterate the SDK stream directly on a scheduler worker.
    fn start_events(&self) -> mpsc::Receiver<StartEvent>;

    async fn probe_http(&self, endpoint: &str, expected_status: u16, timeout_s: u64)
        -> Result<()>;

    async fn probe_tcp(&self, host: &str, port: u16, timeout_s: u64) -> Result<()>;

    /// Run `argv` inside the container, returning the exit code.
    async fn probe_exec(&self, container_id: &str, argv: &[String], timeout_s: u64)
        -> Result<i64>;
}

pub fn short_id(full_id: &str) -> String {
    full_id[..12.min(full_id.len())].to_string()
}
