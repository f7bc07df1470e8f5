use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What happened to a supervised container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Restart,
    HealthFailed,
    Quarantine,
    AutoUnquarantine,
    AutoMonitor,
    ManualRestart,
    ManualUnquarantine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Success,
    Failure,
    Info,
}

/// One entry in the bounded event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub ts_utc: DateTime<Utc>,
    pub stable_id: String,
    /// Runtime id at the time of the event; containers get recreated, so
    /// this is a snapshot, not an identity.
    pub container_id: String,
    pub kind: EventKind,
    pub status: EventStatus,
    pub message: String,
    #[serde(default)]
    pub attempt_count: u32,
}

impl Event {
    pub fn new(
        kind: EventKind,
        status: EventStatus,
        stable_id: impl Into<String>,
        container_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            ts_utc: Utc::now(),
            stable_id: stable_id.into(),
            container_id: container_id.into(),
            kind,
            status,
            message: message.into(),
            attempt_count: 0,
        }
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }
}
