//! Supervision loop.
//!
//! A single driver ticks on the configured interval. Each tick lists the
//! fleet, fans the containers out over a bounded worker pool, and for each
//! monitored container evaluates health, asks the decision rules for an
//! action, and actuates it against the runtime. Actions for one container
//! are serialized through a per-id lock; a tick never touches a container
//! whose previous action is still in flight.

use chrono::Utc;
use dashmap::DashMap;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::PolicyConfig;
use crate::engine::decision::{self, Action, DecisionContext};
use crate::health::HealthEvaluator;
use crate::identity;
use crate::notifications::Notifier;
use crate::runtime::{ContainerRuntime, Observation, RuntimeError};
use crate::store::{Event, EventKind, EventStatus, StateStore};

pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<StateStore>,
    health: HealthEvaluator,
    notifier: Notifier,
    /// One lock per stable id; holding it marks an action in flight.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

/// What one tick did, for cycle logging.
#[derive(Debug, Default)]
pub struct TickSummary {
    pub total: usize,
    pub monitored: usize,
    pub restarted: usize,
    pub quarantined: usize,
    pub released: usize,
    pub failures: usize,
}

enum Outcome {
    Ignored,
    Monitored,
    Restarted,
    RestartFailed,
    Quarantined,
    Released,
    /// Previous action for this id still in flight.
    Busy,
}

impl Supervisor {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<StateStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            health: HealthEvaluator::new(runtime.clone()),
            runtime,
            store,
            notifier,
            locks: DashMap::new(),
        }
    }

    /// Drive ticks until shutdown is signalled. The interval is re-read from
    /// the store every cycle so config changes apply on the next tick.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        {
            let policy = self.store.snapshot();
            info!(
                interval_secs = policy.monitor.interval_seconds,
                max_restarts = policy.restart.max_restarts,
                window_secs = policy.restart.window_seconds,
                workers = policy.monitor.worker_limit,
                "Supervisor started"
            );
        }

        let mut first_cycle = true;
        loop {
            let summary = self.tick().await;

            // One-time reconciliation report so operators see what the
            // supervisor took charge of.
            if first_cycle {
                first_cycle = false;
                info!(
                    containers = summary.total,
                    monitored = summary.monitored,
                    quarantined = self.store.quarantined_ids().len(),
                    "Initial reconciliation complete"
                );
            }

            if summary.restarted > 0
                || summary.quarantined > 0
                || summary.released > 0
                || summary.failures > 0
            {
                info!(
                    total = summary.total,
                    monitored = summary.monitored,
                    restarted = summary.restarted,
                    quarantined = summary.quarantined,
                    released = summary.released,
                    failures = summary.failures,
                    "Supervision cycle completed"
                );
            } else {
                debug!(
                    total = summary.total,
                    monitored = summary.monitored,
                    "Supervision cycle completed (all healthy)"
                );
            }

            let interval = self.store.snapshot().monitor.interval_seconds.max(1);
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("Supervisor stopped");
    }

    /// One supervision cycle over the whole fleet.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        if self.store.is_maintenance_active() {
            debug!("Maintenance mode active, skipping cycle");
            return summary;
        }

        let policy = self.store.snapshot();

        let containers = match self.runtime.list_containers(true).await {
            Ok(containers) => containers,
            Err(e) => {
                warn!(error = %e, "Failed to list containers, will retry next cycle");
                let event = Event::new(
                    EventKind::HealthFailed,
                    EventStatus::Failure,
                    "runtime",
                    "",
                    format!("container listing failed: {}", e),
                );
                if let Err(e) = self.store.append_event(event) {
                    error!(error = %e, "Failed to record runtime failure event");
                }
                summary.failures += 1;
                return summary;
            }
        };
        summary.total = containers.len();

        let outcomes: Vec<Outcome> = futures::stream::iter(containers)
            .map(|obs| self.process(obs, policy.clone()))
            .buffer_unordered(policy.monitor.worker_limit.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Outcome::Ignored => {}
                Outcome::Monitored | Outcome::Busy => summary.monitored += 1,
                Outcome::Restarted => {
                    summary.monitored += 1;
                    summary.restarted += 1;
                }
                Outcome::RestartFailed => {
                    summary.monitored += 1;
                    summary.failures += 1;
                }
                Outcome::Quarantined => {
                    summary.monitored += 1;
                    summary.quarantined += 1;
                }
                Outcome::Released => {
                    summary.monitored += 1;
                    summary.released += 1;
                }
            }
        }

        summary
    }

    async fn process(&self, obs: Observation, policy: Arc<PolicyConfig>) -> Outcome {
        let stable_id = identity::stable_id(&obs);

        if !decision::is_monitored(&obs, &stable_id, &policy) {
            return Outcome::Ignored;
        }

        let lock = self
            .locks
            .entry(stable_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let Ok(_guard) = lock.try_lock() else {
            debug!(container = %stable_id, "Action still in flight, skipping");
            return Outcome::Busy;
        };

        let probe = policy.custom_health_checks.get(&stable_id);
        let verdict = self.health.evaluate(&stable_id, &obs, probe).await;

        let now = Utc::now();
        let ctx = DecisionContext {
            maintenance: self.store.is_maintenance_active(),
            quarantined: self.store.is_quarantined(&stable_id),
            restarts_in_window: self
                .store
                .restart_count(&stable_id, policy.restart.window_seconds, now)
                as u32,
            last_restart: self.store.last_restart(&stable_id),
            now,
        };

        let action = decision::decide(&obs, verdict, &policy, &ctx);

        if policy.observability.log_decisions {
            debug!(
                container = %stable_id,
                verdict = ?verdict,
                action = ?action,
                attempts_in_window = ctx.restarts_in_window,
                "Decision"
            );
        }

        match action {
            Action::Nop => Outcome::Monitored,
            Action::Restart {
                reason,
                delay_secs,
                attempt,
            } => {
                self.execute_restart(&obs, &stable_id, &reason, delay_secs, attempt, &policy)
                    .await
            }
            Action::Quarantine => self.execute_quarantine(&obs, &stable_id, &ctx, &policy),
            Action::AutoUnquarantine => self.execute_release(&obs, &stable_id),
        }
    }

    async fn execute_restart(
        &self,
        obs: &Observation,
        stable_id: &str,
        reason: &str,
        delay_secs: u64,
        attempt: u32,
        policy: &PolicyConfig,
    ) -> Outcome {
        // The attempt is recorded at its scheduled time before the runtime
        // call; concurrent observers see it through the cooldown rule.
        let scheduled = Utc::now() + chrono::Duration::seconds(delay_secs as i64);
        if let Err(e) = self.store.record_restart(stable_id, scheduled) {
            error!(container = %stable_id, error = %e, "Failed to record restart attempt, aborting action");
            return Outcome::RestartFailed;
        }

        if delay_secs > 0 {
            debug!(
                container = %stable_id,
                delay_secs,
                "Delaying restart for backoff"
            );
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
        }

        info!(
            container = %stable_id,
            reason = %reason,
            attempt,
            max_attempts = policy.restart.max_restarts,
            "Restarting container"
        );

        match self
            .runtime
            .restart(&obs.runtime_id, policy.restart.stop_timeout_seconds)
            .await
        {
            Ok(()) => {
                self.record_event(
                    Event::new(
                        EventKind::Restart,
                        EventStatus::Success,
                        stable_id,
                        &obs.runtime_id,
                        format!("restarted: {}", reason),
                    )
                    .with_attempts(attempt),
                );
                Outcome::Restarted
            }
            Err(RuntimeError::NotFound(_)) => {
                // Vanished between list and act; the next cycle reconciles.
                info!(container = %stable_id, "Container gone before restart, skipping");
                Outcome::Monitored
            }
            Err(e) => {
                warn!(container = %stable_id, error = %e, "Restart failed");
                self.record_event(
                    Event::new(
                        EventKind::Restart,
                        EventStatus::Failure,
                        stable_id,
                        &obs.runtime_id,
                        format!("restart failed: {}", e),
                    )
                    .with_attempts(attempt),
                );
                Outcome::RestartFailed
            }
        }
    }

    fn execute_quarantine(
        &self,
        obs: &Observation,
        stable_id: &str,
        ctx: &DecisionContext,
        policy: &PolicyConfig,
    ) -> Outcome {
        match self.store.quarantine(stable_id) {
            Ok(true) => {
                warn!(
                    container = %stable_id,
                    attempts = ctx.restarts_in_window,
                    window_secs = policy.restart.window_seconds,
                    "Container exceeded restart quota, quarantining"
                );
                self.record_event(
                    Event::new(
                        EventKind::Quarantine,
                        EventStatus::Info,
                        stable_id,
                        &obs.runtime_id,
                        format!(
                            "exceeded {} restarts in {}s window",
                            policy.restart.max_restarts, policy.restart.window_seconds
                        ),
                    )
                    .with_attempts(ctx.restarts_in_window),
                );
                Outcome::Quarantined
            }
            Ok(false) => Outcome::Monitored,
            Err(e) => {
                error!(container = %stable_id, error = %e, "Failed to persist quarantine");
                Outcome::RestartFailed
            }
        }
    }

    fn execute_release(&self, obs: &Observation, stable_id: &str) -> Outcome {
        match self.store.unquarantine(stable_id) {
            Ok(true) => {
                info!(container = %stable_id, "Container recovered, releasing from quarantine");
                self.health.invalidate(stable_id);
                self.record_event(Event::new(
                    EventKind::AutoUnquarantine,
                    EventStatus::Info,
                    stable_id,
                    &obs.runtime_id,
                    "recovered while quarantined",
                ));
                Outcome::Released
            }
            Ok(false) => Outcome::Monitored,
            Err(e) => {
                error!(container = %stable_id, error = %e, "Failed to persist quarantine release");
                Outcome::RestartFailed
            }
        }
    }

    fn record_event(&self, event: Event) {
        self.notifier.notify(&event);
        if let Err(e) = self.store.append_event(event) {
            error!(error = %e, "Failed to append event");
        }
    }
}
