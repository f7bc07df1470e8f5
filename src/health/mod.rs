//! Health verdicts for observed containers.
//!
//! Combines the runtime's native health status with optional custom probes
//! (HTTP, TCP, or exec) configured per stable id. A custom probe gets a
//! retry budget per evaluation; one passing attempt is enough.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::{ProbeKind, ProbeSpec};
use crate::runtime::{ContainerRuntime, ContainerState, NativeHealth, Observation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy,
    /// Health check still warming up; no verdict yet.
    Starting,
    ExitedOk,
    ExitedFail,
    Unknown,
}

struct ProbeOutcome {
    at: Instant,
    passed: bool,
}

pub struct HealthEvaluator {
    runtime: Arc<dyn ContainerRuntime>,
    /// Last probe outcome per stable id, reused until the probe's interval
    /// elapses so slow probes don't run on every tick.
    probe_cache: DashMap<String, ProbeOutcome>,
}

impl HealthEvaluator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            runtime,
            probe_cache: DashMap::new(),
        }
    }

    pub async fn evaluate(
        &self,
        stable_id: &str,
        obs: &Observation,
        probe: Option<&ProbeSpec>,
    ) -> Verdict {
        match obs.state {
            ContainerState::Exited | ContainerState::Dead => {
                if obs.exit_code.unwrap_or(0) == 0 {
                    Verdict::ExitedOk
                } else {
                    Verdict::ExitedFail
                }
            }
            ContainerState::Created | ContainerState::Paused | ContainerState::Unknown => {
                Verdict::Unknown
            }
            ContainerState::Restarting => Verdict::Starting,
            ContainerState::Running => match obs.health {
                NativeHealth::Unhealthy => Verdict::Unhealthy,
                NativeHealth::Starting => Verdict::Starting,
                NativeHealth::Healthy | NativeHealth::None => match probe {
                    Some(spec) if spec.kind != ProbeKind::None => {
                        if self.probe_passed(stable_id, obs, spec).await {
                            Verdict::Healthy
                        } else {
                            Verdict::Unhealthy
                        }
                    }
                    _ => Verdict::Healthy,
                },
            },
        }
    }

    async fn probe_passed(&self, stable_id: &str, obs: &Observation, spec: &ProbeSpec) -> bool {
        if spec.interval_s > 0 {
            if let Some(cached) = self.probe_cache.get(stable_id) {
                if cached.at.elapsed().as_secs() < spec.interval_s {
                    return cached.passed;
                }
            }
        }

        let passed = self.run_probe(obs, spec).await;
        self.probe_cache.insert(
            stable_id.to_string(),
            ProbeOutcome {
                at: Instant::now(),
                passed,
            },
        );
        passed
    }

    async fn run_probe(&self, obs: &Observation, spec: &ProbeSpec) -> bool {
        for attempt in 1..=spec.retries.max(1) {
            let result = match spec.kind {
                ProbeKind::Http => match &spec.http {
                    Some(http) => self
                        .runtime
                        .probe_http(&http.endpoint, http.expected_status, spec.timeout_s)
                        .await
                        .map(|_| true),
                    None => {
                        warn!(container = %obs.name, "HTTP probe configured without endpoint");
                        return false;
                    }
                },
                ProbeKind::Tcp => match &spec.tcp {
                    Some(tcp) => self
                        .runtime
                        .probe_tcp(&tcp.host, tcp.port, spec.timeout_s)
                        .await
                        .map(|_| true),
                    None => {
                        warn!(container = %obs.name, "TCP probe configured without port");
                        return false;
                    }
                },
                ProbeKind::Exec => match &spec.exec {
                    Some(exec) => self
                        .runtime
                        .probe_exec(&obs.runtime_id, &exec.argv, spec.timeout_s)
                        .await
                        .map(|code| code == 0),
                    None => {
                        warn!(container = %obs.name, "Exec probe configured without argv");
                        return false;
                    }
                },
                ProbeKind::None => return true,
            };

            match result {
                Ok(true) => return true,
                Ok(false) => {
                    debug!(
                        container = %obs.name,
                        attempt,
                        retries = spec.retries,
                        "Probe attempt reported failure"
                    );
                }
                Err(e) => {
                    debug!(
                        container = %obs.name,
                        attempt,
                        retries = spec.retries,
                        error = %e,
                        "Probe attempt errored"
                    );
                }
            }
        }
        false
    }

    /// Drop the cached outcome, forcing the next evaluation to probe.
    pub fn invalidate(&self, stable_id: &str) {
        self.probe_cache.remove(stable_id);
    }
}
