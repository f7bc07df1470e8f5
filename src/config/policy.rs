//! Dynamic supervision policy.
//!
//! Persisted as `config.json` in the data directory and mutable at runtime
//! through the store. Readers always go through the store's snapshot so
//! changes are visible on the next tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Backoff delays are never allowed to grow past this.
pub const BACKOFF_CEILING_SECS: u64 = 3600;

/// Headroom factor for the backoff-vs-window validation check.
const WINDOW_TOLERANCE: f64 = 1.2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub containers: ContainersConfig,
    #[serde(default)]
    pub restart: RestartConfig,
    #[serde(default)]
    pub filters: FilterConfig,
    #[serde(default)]
    pub ui: UiConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub custom_health_checks: HashMap<String, ProbeSpec>,
    #[serde(default)]
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// Containers carrying this `key=value` label opt in to supervision.
    #[serde(default = "default_opt_in_label")]
    pub opt_in_label: String,
    /// Supervise every container regardless of labels or selection.
    #[serde(default)]
    pub include_all: bool,
    /// Upper bound on concurrently processed containers per tick.
    #[serde(default = "default_worker_limit")]
    pub worker_limit: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            opt_in_label: default_opt_in_label(),
            include_all: false,
            worker_limit: default_worker_limit(),
        }
    }
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_opt_in_label() -> String {
    "autoheal=true".to_string()
}

fn default_worker_limit() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(32)
}

impl MonitorConfig {
    /// Split the opt-in label into key and value; a bare key means `=true`.
    pub fn opt_in_label_parts(&self) -> (&str, &str) {
        match self.opt_in_label.split_once('=') {
            Some((key, value)) => (key, value),
            None => (self.opt_in_label.as_str(), "true"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainersConfig {
    /// Stable ids explicitly selected for supervision.
    #[serde(default)]
    pub selected: Vec<String>,
    /// Stable ids excluded from supervision; wins over every selection path.
    #[serde(default)]
    pub excluded: Vec<String>,
    /// Legacy restart history embedded in old config files; migrated into
    /// the history store on load and no longer written.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub restart_counts: HashMap<String, Vec<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartMode {
    /// Restart only containers that exited non-zero.
    OnFailure,
    /// Restart only containers whose health checks report unhealthy.
    Health,
    /// Restart on either condition.
    Both,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    #[serde(default = "default_restart_mode")]
    pub mode: RestartMode,
    /// Minimum gap between two restart actions for the same container.
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Restarts allowed inside the window before quarantine.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Trailing span over which restart attempts are counted.
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default)]
    pub backoff: BackoffConfig,
    /// Leave containers alone when they exited with code 0.
    #[serde(default = "default_respect_manual_stop")]
    pub respect_manual_stop: bool,
    /// Graceful-stop timeout passed to the runtime on restart.
    #[serde(default = "default_stop_timeout_seconds")]
    pub stop_timeout_seconds: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            mode: default_restart_mode(),
            cooldown_seconds: default_cooldown_seconds(),
            max_restarts: default_max_restarts(),
            window_seconds: default_window_seconds(),
            backoff: BackoffConfig::default(),
            respect_manual_stop: default_respect_manual_stop(),
            stop_timeout_seconds: default_stop_timeout_seconds(),
        }
    }
}

fn default_restart_mode() -> RestartMode {
    RestartMode::Both
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_max_restarts() -> u32 {
    5
}

fn default_window_seconds() -> u64 {
    3600
}

fn default_respect_manual_stop() -> bool {
    true
}

fn default_stop_timeout_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_enabled")]
    pub enabled: bool,
    #[serde(default = "default_backoff_initial")]
    pub initial_seconds: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            enabled: default_backoff_enabled(),
            initial_seconds: default_backoff_initial(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_backoff_enabled() -> bool {
    true
}

fn default_backoff_initial() -> u64 {
    10
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FilterConfig {
    #[serde(default)]
    pub whitelist_names: Vec<String>,
    #[serde(default)]
    pub blacklist_names: Vec<String>,
    /// Label filters as `key=value` entries.
    #[serde(default)]
    pub whitelist_labels: Vec<String>,
    #[serde(default)]
    pub blacklist_labels: Vec<String>,
}

impl FilterConfig {
    /// Name patterns match exactly, or by prefix when ending with `*`.
    pub fn name_matches(patterns: &[String], name: &str) -> bool {
        patterns.iter().any(|p| match p.strip_suffix('*') {
            Some(prefix) => name.starts_with(prefix),
            None => p == name,
        })
    }

    /// Label filters match when the container carries the exact `key=value`
    /// pair, or any value for a bare `key`.
    pub fn label_matches(
        patterns: &[String],
        labels: &HashMap<String, String>,
    ) -> bool {
        patterns.iter().any(|p| match p.split_once('=') {
            Some((key, value)) => labels.get(key).map(String::as_str) == Some(value),
            None => labels.contains_key(p),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiConfig {
    /// Cap on the persisted event ring.
    #[serde(default = "default_max_log_entries")]
    pub max_log_entries: usize,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            max_log_entries: default_max_log_entries(),
        }
    }
}

fn default_max_log_entries() -> usize {
    50
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_true")]
    pub on_restart: bool,
    #[serde(default = "default_true")]
    pub on_quarantine: bool,
    #[serde(default = "default_true")]
    pub on_unquarantine: bool,
    #[serde(default)]
    pub on_enroll: bool,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            on_restart: true,
            on_quarantine: true,
            on_unquarantine: true,
            on_enroll: false,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    /// Log every per-container decision (including Nop) at DEBUG.
    #[serde(default)]
    pub log_decisions: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default)]
    pub enabled: bool,
    pub webhook_url: Option<String>,
    #[serde(default = "default_notify_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_notify_queue")]
    pub queue_size: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            timeout_seconds: default_notify_timeout(),
            queue_size: default_notify_queue(),
        }
    }
}

fn default_notify_timeout() -> u64 {
    5
}

fn default_notify_queue() -> usize {
    64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    Http,
    Tcp,
    Exec,
    #[default]
    None,
}

/// Custom health check bound to one stable id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSpec {
    #[serde(default)]
    pub kind: ProbeKind,
    /// Minimum gap between probe executions; 0 probes every tick.
    #[serde(default = "default_probe_interval")]
    pub interval_s: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_s: u64,
    #[serde(default = "default_probe_retries")]
    pub retries: u32,
    pub http: Option<HttpProbe>,
    pub tcp: Option<TcpProbe>,
    pub exec: Option<ExecProbe>,
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_probe_retries() -> u32 {
    3
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProbe {
    pub endpoint: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
}

fn default_expected_status() -> u16 {
    200
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpProbe {
    #[serde(default = "default_probe_host")]
    pub host: String,
    pub port: u16,
}

fn default_probe_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecProbe {
    pub argv: Vec<String>,
}

impl PolicyConfig {
    /// Validate the policy; an empty list means the config is acceptable.
    ///
    /// Beyond per-field sanity, this enforces that the restart window is wide
    /// enough for the quarantine quota to ever be reached: if attempts age
    /// out of the window faster than they accumulate, chronically failing
    /// containers loop forever instead of being quarantined.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.monitor.interval_seconds == 0 {
            errors.push("monitor.interval_seconds must be at least 1".to_string());
        }
        let (key, _) = self.monitor.opt_in_label_parts();
        if key.is_empty() {
            errors.push("monitor.opt_in_label must have a non-empty key".to_string());
        }
        if self.monitor.worker_limit == 0 {
            errors.push("monitor.worker_limit must be at least 1".to_string());
        }

        let restart = &self.restart;
        if restart.max_restarts == 0 {
            errors.push("restart.max_restarts must be at least 1".to_string());
        }
        if restart.backoff.multiplier < 1.0 {
            errors.push("restart.backoff.multiplier must be >= 1.0".to_string());
        }
        if restart.backoff.enabled && restart.backoff.initial_seconds == 0 {
            errors.push("restart.backoff.initial_seconds must be at least 1".to_string());
        }

        let pace = restart
            .cooldown_seconds
            .max(self.monitor.interval_seconds);
        let floor = restart.max_restarts as u64 * pace;
        if restart.window_seconds < floor {
            errors.push(format!(
                "restart.window_seconds ({}) must be >= max_restarts x max(cooldown, interval) ({})",
                restart.window_seconds, floor
            ));
        }

        if restart.backoff.enabled && restart.backoff.multiplier > 1.0 {
            let mut total = 0.0f64;
            let mut delay = restart.backoff.initial_seconds as f64;
            for _ in 0..restart.max_restarts {
                total += delay.min(BACKOFF_CEILING_SECS as f64)
                    + restart.cooldown_seconds as f64
                    + self.monitor.interval_seconds as f64;
                delay *= restart.backoff.multiplier;
            }
            let budget = restart.window_seconds as f64 * WINDOW_TOLERANCE;
            if total > budget {
                errors.push(format!(
                    "restart backoff schedule needs ~{:.0}s to reach max_restarts but the window allows only {:.0}s; attempts would age out before quarantine",
                    total, budget
                ));
            }
        }

        if self.ui.max_log_entries == 0 {
            errors.push("ui.max_log_entries must be at least 1".to_string());
        }

        if self.notifications.enabled && self.notifications.webhook_url.is_none() {
            errors.push("notifications.webhook_url is required when notifications are enabled".to_string());
        }

        for (id, probe) in &self.custom_health_checks {
            if probe.retries == 0 {
                errors.push(format!("custom_health_checks.{}: retries must be at least 1", id));
            }
            match probe.kind {
                ProbeKind::Http if probe.http.is_none() => {
                    errors.push(format!("custom_health_checks.{}: http section required", id));
                }
                ProbeKind::Tcp if probe.tcp.is_none() => {
                    errors.push(format!("custom_health_checks.{}: tcp section required", id));
                }
                ProbeKind::Exec => {
                    if probe.exec.as_ref().map_or(true, |e| e.argv.is_empty()) {
                        errors.push(format!(
                            "custom_health_checks.{}: exec.argv must not be empty",
                            id
                        ));
                    }
                }
                _ => {}
            }
        }

        errors
    }
}
