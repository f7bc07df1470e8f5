//! Policy decisions for supervised containers.
//!
//! Pure functions from {observation, verdict, policy, per-container history}
//! to an action. All I/O (probes, restarts, persistence) happens around this
//! module, which keeps every rule unit-testable.

use chrono::{DateTime, Utc};

use crate::config::{BackoffConfig, FilterConfig, PolicyConfig, RestartMode};
use crate::config::policy::BACKOFF_CEILING_SECS;
use crate::health::Verdict;
use crate::identity::is_full_container_id;
use crate::runtime::{ContainerState, Observation};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Nop,
    Restart {
        reason: String,
        /// Backoff delay to wait before invoking the runtime.
        delay_secs: u64,
        /// 1-based attempt number inside the current window.
        attempt: u32,
    },
    Quarantine,
    AutoUnquarantine,
}

/// Per-container facts the rules consult, assembled by the supervisor from
/// the store before each decision.
#[derive(Debug, Clone)]
pub struct DecisionContext {
    pub maintenance: bool,
    pub quarantined: bool,
    pub restarts_in_window: u32,
    /// Most recent recorded attempt; a deferred attempt carries its
    /// scheduled (future) time, which keeps the cooldown rule holding other
    /// ticks off while it is pending.
    pub last_restart: Option<DateTime<Utc>>,
    pub now: DateTime<Utc>,
}

/// Whether a container passes the selection filter.
///
/// Exclusion always wins: an excluded id is not monitored even when it
/// carries the opt-in label or matches a whitelist.
pub fn is_monitored(obs: &Observation, stable_id: &str, policy: &PolicyConfig) -> bool {
    let containers = &policy.containers;
    let filters = &policy.filters;

    if list_contains(&containers.excluded, stable_id, obs)
        || FilterConfig::name_matches(&filters.blacklist_names, &obs.name)
        || FilterConfig::label_matches(&filters.blacklist_labels, &obs.labels)
    {
        return false;
    }

    if list_contains(&containers.selected, stable_id, obs) || policy.monitor.include_all {
        return true;
    }

    let (key, value) = policy.monitor.opt_in_label_parts();
    if obs.label(key) == Some(value) {
        return true;
    }

    FilterConfig::name_matches(&filters.whitelist_names, &obs.name)
        || FilterConfig::label_matches(&filters.whitelist_labels, &obs.labels)
}

/// Selection lists hold stable ids, but entries written by old releases may
/// be full 64-hex container ids; those still match on the runtime id.
fn list_contains(list: &[String], stable_id: &str, obs: &Observation) -> bool {
    list.iter()
        .any(|entry| entry == stable_id || (is_full_container_id(entry) && *entry == obs.runtime_id))
}

/// Apply the rule chain; first match wins.
pub fn decide(
    obs: &Observation,
    verdict: Verdict,
    policy: &PolicyConfig,
    ctx: &DecisionContext,
) -> Action {
    // 1. Maintenance freezes everything.
    if ctx.maintenance {
        return Action::Nop;
    }

    // 2/3. Quarantined containers are only ever released, never restarted.
    if ctx.quarantined {
        if verdict == Verdict::Healthy && obs.state == ContainerState::Running {
            return Action::AutoUnquarantine;
        }
        return Action::Nop;
    }

    // 4. A clean exit is assumed to be a deliberate stop.
    if verdict == Verdict::ExitedOk && policy.restart.respect_manual_stop {
        return Action::Nop;
    }

    // 5. Cooldown, which also covers attempts still pending their backoff
    //    delay (their scheduled time is in the future).
    if let Some(last) = ctx.last_restart {
        let elapsed = ctx.now.signed_duration_since(last).num_seconds();
        if elapsed < policy.restart.cooldown_seconds as i64 {
            return Action::Nop;
        }
    }

    // 6. Mode gate.
    let triggered = match policy.restart.mode {
        RestartMode::OnFailure => verdict == Verdict::ExitedFail,
        RestartMode::Health => verdict == Verdict::Unhealthy,
        RestartMode::Both => {
            verdict == Verdict::ExitedFail || verdict == Verdict::Unhealthy
        }
    };
    if !triggered {
        return Action::Nop;
    }

    // 7. Window quota.
    let attempts = ctx.restarts_in_window;
    if attempts >= policy.restart.max_restarts {
        return Action::Quarantine;
    }

    Action::Restart {
        reason: restart_reason(verdict, obs),
        delay_secs: backoff_delay(&policy.restart.backoff, attempts),
        attempt: attempts + 1,
    }
}

fn restart_reason(verdict: Verdict, obs: &Observation) -> String {
    match verdict {
        Verdict::ExitedFail => match obs.exit_code {
            Some(code) => format!("exited with code {}", code),
            None => "exited with non-zero code".to_string(),
        },
        Verdict::Unhealthy => "health check failing".to_string(),
        other => format!("{:?}", other),
    }
}

/// Geometric backoff delay for the k-th attempt (0-based) in the window,
/// capped so a long failure streak can't push delays past an hour.
pub fn backoff_delay(backoff: &BackoffConfig, attempts_in_window: u32) -> u64 {
    if !backoff.enabled {
        return 0;
    }
    let delay = backoff.initial_seconds as f64
        * backoff.multiplier.powi(attempts_in_window.min(64) as i32);
    delay.min(BACKOFF_CEILING_SECS as f64) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::observation;
    use crate::runtime::NativeHealth;
    use chrono::Duration;

    fn base_policy() -> PolicyConfig {
        let mut policy = PolicyConfig::default();
        policy.monitor.include_all = true;
        policy.restart.backoff.enabled = false;
        policy
    }

    fn ctx(now: DateTime<Utc>) -> DecisionContext {
        DecisionContext {
            maintenance: false,
            quarantined: false,
            restarts_in_window: 0,
            last_restart: None,
            now,
        }
    }

    fn failed_container() -> Observation {
        let mut obs = observation("aaa", "web", ContainerState::Exited);
        obs.exit_code = Some(1);
        obs
    }

    #[test]
    fn test_failing_container_restarts_then_quarantines() {
        // interval=1s, cooldown=1s, max_restarts=2, window=60s, no backoff.
        let mut policy = base_policy();
        policy.monitor.interval_seconds = 1;
        policy.restart.mode = RestartMode::OnFailure;
        policy.restart.cooldown_seconds = 1;
        policy.restart.max_restarts = 2;
        policy.restart.window_seconds = 60;

        let obs = failed_container();
        let t0 = Utc::now();

        // t=0: first restart.
        let action = decide(&obs, Verdict::ExitedFail, &policy, &ctx(t0));
        assert!(matches!(action, Action::Restart { attempt: 1, delay_secs: 0, .. }));

        // t=1: cooldown satisfied, second restart.
        let mut c = ctx(t0 + Duration::seconds(1));
        c.restarts_in_window = 1;
        c.last_restart = Some(t0);
        let action = decide(&obs, Verdict::ExitedFail, &policy, &c);
        assert!(matches!(action, Action::Restart { attempt: 2, .. }));

        // t=2: quota reached, quarantine instead of a third restart.
        let mut c = ctx(t0 + Duration::seconds(2));
        c.restarts_in_window = 2;
        c.last_restart = Some(t0 + Duration::seconds(1));
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Quarantine);

        // t=3: quarantined now; still exited, nothing happens.
        let mut c = ctx(t0 + Duration::seconds(3));
        c.quarantined = true;
        c.restarts_in_window = 2;
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Nop);
    }

    #[test]
    fn test_auto_unquarantine_on_recovery() {
        let policy = base_policy();
        let mut obs = observation("aaa", "web", ContainerState::Running);
        obs.health = NativeHealth::Healthy;

        let mut c = ctx(Utc::now());
        c.quarantined = true;
        c.restarts_in_window = 2;

        assert_eq!(decide(&obs, Verdict::Healthy, &policy, &c), Action::AutoUnquarantine);
    }

    #[test]
    fn test_quarantined_but_not_running_stays_put() {
        let policy = base_policy();
        let obs = failed_container();

        let mut c = ctx(Utc::now());
        c.quarantined = true;
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Nop);
    }

    #[test]
    fn test_manual_stop_respected() {
        let mut policy = base_policy();
        policy.restart.mode = RestartMode::Both;
        policy.restart.respect_manual_stop = true;

        let mut obs = observation("aaa", "web", ContainerState::Exited);
        obs.exit_code = Some(0);

        assert_eq!(decide(&obs, Verdict::ExitedOk, &policy, &ctx(Utc::now())), Action::Nop);

        // Without the flag a clean exit still doesn't trigger: no mode
        // matches ExitedOk.
        policy.restart.respect_manual_stop = false;
        assert_eq!(decide(&obs, Verdict::ExitedOk, &policy, &ctx(Utc::now())), Action::Nop);
    }

    #[test]
    fn test_maintenance_gates_everything() {
        let policy = base_policy();
        let obs = failed_container();

        let mut c = ctx(Utc::now());
        c.maintenance = true;
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Nop);

        // Even auto-unquarantine is suppressed.
        let mut c = ctx(Utc::now());
        c.maintenance = true;
        c.quarantined = true;
        let running = observation("aaa", "web", ContainerState::Running);
        assert_eq!(decide(&running, Verdict::Healthy, &policy, &c), Action::Nop);
    }

    #[test]
    fn test_cooldown_blocks_and_pending_attempt_counts_as_recent() {
        let mut policy = base_policy();
        policy.restart.cooldown_seconds = 30;

        let obs = failed_container();
        let now = Utc::now();

        let mut c = ctx(now);
        c.last_restart = Some(now - Duration::seconds(10));
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Nop);

        // A deferred attempt recorded at its scheduled future time also
        // holds the cooldown.
        let mut c = ctx(now);
        c.last_restart = Some(now + Duration::seconds(20));
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &c), Action::Nop);

        let mut c = ctx(now);
        c.last_restart = Some(now - Duration::seconds(31));
        assert!(matches!(
            decide(&obs, Verdict::ExitedFail, &policy, &c),
            Action::Restart { .. }
        ));
    }

    #[test]
    fn test_mode_gates() {
        let obs = failed_container();
        let now = Utc::now();

        let mut policy = base_policy();
        policy.restart.mode = RestartMode::OnFailure;
        assert!(matches!(
            decide(&obs, Verdict::ExitedFail, &policy, &ctx(now)),
            Action::Restart { .. }
        ));
        assert_eq!(decide(&obs, Verdict::Unhealthy, &policy, &ctx(now)), Action::Nop);

        policy.restart.mode = RestartMode::Health;
        assert_eq!(decide(&obs, Verdict::ExitedFail, &policy, &ctx(now)), Action::Nop);
        assert!(matches!(
            decide(&obs, Verdict::Unhealthy, &policy, &ctx(now)),
            Action::Restart { .. }
        ));

        policy.restart.mode = RestartMode::Both;
        assert!(matches!(
            decide(&obs, Verdict::ExitedFail, &policy, &ctx(now)),
            Action::Restart { .. }
        ));
        assert!(matches!(
            decide(&obs, Verdict::Unhealthy, &policy, &ctx(now)),
            Action::Restart { .. }
        ));
    }

    #[test]
    fn test_starting_and_healthy_never_trigger() {
        let policy = base_policy();
        let obs = observation("aaa", "web", ContainerState::Running);
        let now = Utc::now();

        assert_eq!(decide(&obs, Verdict::Healthy, &policy, &ctx(now)), Action::Nop);
        assert_eq!(decide(&obs, Verdict::Starting, &policy, &ctx(now)), Action::Nop);
        assert_eq!(decide(&obs, Verdict::Unknown, &policy, &ctx(now)), Action::Nop);
    }

    #[test]
    fn test_backoff_delay_growth_and_cap() {
        let backoff = BackoffConfig {
            enabled: true,
            initial_seconds: 10,
            multiplier: 2.0,
        };
        assert_eq!(backoff_delay(&backoff, 0), 10);
        assert_eq!(backoff_delay(&backoff, 1), 20);
        assert_eq!(backoff_delay(&backoff, 2), 40);
        assert_eq!(backoff_delay(&backoff, 10), 3600); // capped

        let disabled = BackoffConfig {
            enabled: false,
            initial_seconds: 10,
            multiplier: 2.0,
        };
        assert_eq!(backoff_delay(&disabled, 3), 0);
    }

    #[test]
    fn test_restart_carries_backoff_delay() {
        let mut policy = base_policy();
        policy.restart.backoff = BackoffConfig {
            enabled: true,
            initial_seconds: 5,
            multiplier: 2.0,
        };

        let obs = failed_container();
        let mut c = ctx(Utc::now());
        c.restarts_in_window = 2;

        match decide(&obs, Verdict::ExitedFail, &policy, &c) {
            Action::Restart { delay_secs, attempt, .. } => {
                assert_eq!(delay_secs, 20); // 5 * 2^2
                assert_eq!(attempt, 3);
            }
            other => panic!("expected restart, got {:?}", other),
        }
    }

    #[test]
    fn test_selection_filter_paths() {
        let mut policy = PolicyConfig::default();
        let mut obs = observation("aaa", "web", ContainerState::Running);

        // Nothing selects it.
        assert!(!is_monitored(&obs, "web", &policy));

        // Explicit selection.
        policy.containers.selected.push("web".to_string());
        assert!(is_monitored(&obs, "web", &policy));

        // Opt-in label.
        policy.containers.selected.clear();
        obs.labels.insert("autoheal".to_string(), "true".to_string());
        assert!(is_monitored(&obs, "web", &policy));

        // include_all.
        obs.labels.clear();
        policy.monitor.include_all = true;
        assert!(is_monitored(&obs, "web", &policy));

        // Whitelist by name pattern.
        policy.monitor.include_all = false;
        policy.filters.whitelist_names.push("we*".to_string());
        assert!(is_monitored(&obs, "web", &policy));
    }

    #[test]
    fn test_exclusion_dominates_opt_in_label() {
        let mut policy = PolicyConfig::default();
        let mut obs = observation("aaa", "web", ContainerState::Running);
        obs.labels.insert("autoheal".to_string(), "true".to_string());

        policy.containers.excluded.push("web".to_string());
        assert!(!is_monitored(&obs, "web", &policy));

        // Blacklist wins over include_all too.
        policy.containers.excluded.clear();
        policy.monitor.include_all = true;
        policy.filters.blacklist_names.push("web".to_string());
        assert!(!is_monitored(&obs, "web", &policy));
    }

    #[test]
    fn test_legacy_full_id_entries_still_match() {
        let full_id = "f".repeat(64);
        let mut policy = PolicyConfig::default();
        policy.containers.selected.push(full_id.clone());

        let mut obs = observation("aaa", "web", ContainerState::Running);
        obs.runtime_id = full_id;
        assert!(is_monitored(&obs, "web", &policy));
    }
}
