//! Durable configuration and supervision state.
//!
//! The store is the single process-wide authority over policy config,
//! restart history, the quarantine set, the event log, and the maintenance
//! flag. All mutation happens under one write lock and is flushed to disk
//! before the mutating call returns; readers take a cheap atomic snapshot of
//! the config instead of holding the lock.
//!
//! State lives in five JSON files under the data directory, each written
//! atomically (temp file, fsync, rename).

mod events;

pub use events::{Event, EventKind, EventStatus};

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::PolicyConfig;
use crate::utils::atomic_write_json;

const CONFIG_FILE: &str = "config.json";
const EVENTS_FILE: &str = "events.json";
const HISTORY_FILE: &str = "restart_counts.json";
const QUARANTINE_FILE: &str = "quarantine.json";
const MAINTENANCE_FILE: &str = "maintenance.json";

/// History entries older than this are pruned even when the configured
/// window is shorter, bounding memory for long-lived ids.
const HISTORY_RETENTION_FLOOR_SECS: i64 = 24 * 3600;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to persist state: {0}")]
    Persistence(#[from] std::io::Error),
    #[error("configuration rejected: {}", .0.join("; "))]
    Validation(Vec<String>),
    #[error("invalid configuration document: {0}")]
    Malformed(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Maintenance {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
}

struct StoreInner {
    config: PolicyConfig,
    history: HashMap<String, Vec<DateTime<Utc>>>,
    quarantine: BTreeSet<String>,
    events: VecDeque<Event>,
    maintenance: Maintenance,
}

pub struct StateStore {
    data_dir: PathBuf,
    inner: Mutex<StoreInner>,
    /// Lock-free config snapshot for readers; refreshed on every config
    /// mutation so changes are visible on the next tick.
    view: ArcSwap<PolicyConfig>,
}

fn read_json_or<T: serde::de::DeserializeOwned + Default>(path: &Path) -> T {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!(path = %path.display(), error = %e, "Corrupt state file, starting fresh");
            T::default()
        }),
        Err(_) => {
            debug!(path = %path.display(), "No state file, starting fresh");
            T::default()
        }
    }
}

impl StateStore {
    /// Load all state from `data_dir`, creating the initial config file when
    /// none exists. Failing to write here means the directory is unusable
    /// and startup should abort.
    pub fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join(CONFIG_FILE);
        let had_config = config_path.exists();
        let config: PolicyConfig = read_json_or(&config_path);

        let history_path = data_dir.join(HISTORY_FILE);
        let mut history: HashMap<String, Vec<DateTime<Utc>>> = read_json_or(&history_path);

        // Old releases embedded restart history in the config file; migrate
        // it once when no dedicated history file exists yet.
        if !history_path.exists() && !config.containers.restart_counts.is_empty() {
            info!(
                entries = config.containers.restart_counts.len(),
                "Migrating legacy restart counts from config.json"
            );
            history = config.containers.restart_counts.clone();
            atomic_write_json(&history_path, &history)?;
        }

        let quarantine: Vec<String> = read_json_or(&data_dir.join(QUARANTINE_FILE));
        let events: Vec<Event> = read_json_or(&data_dir.join(EVENTS_FILE));
        let maintenance: Maintenance = read_json_or(&data_dir.join(MAINTENANCE_FILE));

        if !had_config {
            atomic_write_json(&config_path, &config)?;
        }

        let view = ArcSwap::from_pointee(config.clone());
        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            inner: Mutex::new(StoreInner {
                config,
                history,
                quarantine: quarantine.into_iter().collect(),
                events: events.into(),
                maintenance,
            }),
            view,
        })
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Immutable config snapshot for readers.
    pub fn snapshot(&self) -> Arc<PolicyConfig> {
        self.view.load_full()
    }

    /// Validate and replace the whole policy config atomically.
    pub fn update_config(&self, config: PolicyConfig) -> Result<()> {
        let errors = config.validate();
        if !errors.is_empty() {
            return Err(StoreError::Validation(errors));
        }

        let mut inner = self.inner.lock();
        atomic_write_json(&self.path(CONFIG_FILE), &config)?;
        inner.config = config.clone();
        self.view.store(Arc::new(config));
        Ok(())
    }

    /// Merge a JSON patch (RFC 7386 semantics) over the current config,
    /// validate the result, and persist it.
    pub fn apply_config_patch(&self, patch: serde_json::Value) -> Result<()> {
        let current = self.snapshot();
        let mut doc = serde_json::to_value(current.as_ref())
            .map_err(|e| StoreError::Malformed(e.to_string()))?;
        merge_json(&mut doc, patch);
        let merged: PolicyConfig =
            serde_json::from_value(doc).map_err(|e| StoreError::Malformed(e.to_string()))?;
        self.update_config(merged)
    }

    /// Record a restart attempt at `ts` (the scheduled time for deferred
    /// attempts). Written before the runtime call is made so concurrent
    /// observers see the pending attempt.
    pub fn record_restart(&self, stable_id: &str, ts: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut history = inner.history.clone();
        history.entry(stable_id.to_string()).or_default().push(ts);
        atomic_write_json(&self.path(HISTORY_FILE), &history)?;
        inner.history = history;
        Ok(())
    }

    /// Count restart attempts inside the trailing window, pruning entries
    /// older than `max(window, 24h)` opportunistically. Attempts recorded
    /// with a scheduled time slightly in the future still count.
    pub fn restart_count(&self, stable_id: &str, window_s: u64, now: DateTime<Utc>) -> usize {
        let mut inner = self.inner.lock();
        let retention = Duration::seconds((window_s as i64).max(HISTORY_RETENTION_FLOOR_SECS));
        let window = Duration::seconds(window_s as i64);

        match inner.history.get_mut(stable_id) {
            Some(entries) => {
                entries.retain(|ts| *ts > now - retention);
                entries.iter().filter(|ts| **ts > now - window).count()
            }
            None => 0,
        }
    }

    /// Most recent recorded restart attempt (may be in the near future for
    /// a deferred attempt).
    pub fn last_restart(&self, stable_id: &str) -> Option<DateTime<Utc>> {
        self.inner
            .lock()
            .history
            .get(stable_id)
            .and_then(|entries| entries.iter().max().copied())
    }

    /// Add a container to the quarantine set. Returns false when it was
    /// already quarantined.
    pub fn quarantine(&self, stable_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.quarantine.contains(stable_id) {
            return Ok(false);
        }
        let mut quarantine = inner.quarantine.clone();
        quarantine.insert(stable_id.to_string());
        atomic_write_json(&self.path(QUARANTINE_FILE), &quarantine)?;
        inner.quarantine = quarantine;
        Ok(true)
    }

    /// Remove a container from quarantine and clear its restart history so
    /// it re-enters supervision with a clean slate.
    pub fn unquarantine(&self, stable_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.quarantine.contains(stable_id) {
            return Ok(false);
        }

        let mut quarantine = inner.quarantine.clone();
        quarantine.remove(stable_id);
        let mut history = inner.history.clone();
        history.remove(stable_id);

        atomic_write_json(&self.path(QUARANTINE_FILE), &quarantine)?;
        atomic_write_json(&self.path(HISTORY_FILE), &history)?;

        inner.quarantine = quarantine;
        inner.history = history;
        Ok(true)
    }

    pub fn is_quarantined(&self, stable_id: &str) -> bool {
        self.inner.lock().quarantine.contains(stable_id)
    }

    pub fn quarantined_ids(&self) -> Vec<String> {
        self.inner.lock().quarantine.iter().cloned().collect()
    }

    /// Append to the bounded event log, evicting the oldest entries past
    /// the configured cap.
    pub fn append_event(&self, event: Event) -> Result<()> {
        let mut inner = self.inner.lock();
        let cap = inner.config.ui.max_log_entries.max(1);

        let mut events = inner.events.clone();
        events.push_back(event);
        while events.len() > cap {
            events.pop_front();
        }

        atomic_write_json(&self.path(EVENTS_FILE), &events.iter().collect::<Vec<_>>())?;
        inner.events = events;
        Ok(())
    }

    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().events.iter().cloned().collect()
    }

    pub fn clear_events(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        atomic_write_json(&self.path(EVENTS_FILE), &Vec::<Event>::new())?;
        inner.events.clear();
        Ok(())
    }

    pub fn set_maintenance(&self, active: bool, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        let maintenance = Maintenance {
            active,
            started_at: active.then_some(now),
        };
        atomic_write_json(&self.path(MAINTENANCE_FILE), &maintenance)?;
        inner.maintenance = maintenance;
        Ok(())
    }

    pub fn is_maintenance_active(&self) -> bool {
        self.inner.lock().maintenance.active
    }

    pub fn maintenance(&self) -> Maintenance {
        self.inner.lock().maintenance.clone()
    }

    /// Add a stable id to the selected list unless it is already selected
    /// or explicitly excluded. Returns true when newly added.
    pub fn select(&self, stable_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.config.containers.selected.iter().any(|s| s == stable_id)
            || inner.config.containers.excluded.iter().any(|s| s == stable_id)
        {
            return Ok(false);
        }

        let mut config = inner.config.clone();
        config.containers.selected.push(stable_id.to_string());
        atomic_write_json(&self.path(CONFIG_FILE), &config)?;
        inner.config = config.clone();
        self.view.store(Arc::new(config));
        Ok(true)
    }

    pub fn deselect(&self, stable_id: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        if !inner.config.containers.selected.iter().any(|s| s == stable_id) {
            return Ok(false);
        }

        let mut config = inner.config.clone();
        config.containers.selected.retain(|s| s != stable_id);
        atomic_write_json(&self.path(CONFIG_FILE), &config)?;
        inner.config = config.clone();
        self.view.store(Arc::new(config));
        Ok(true)
    }

    /// Flush every state file. Called once on shutdown.
    pub fn flush_all(&self) -> Result<()> {
        let inner = self.inner.lock();
        atomic_write_json(&self.path(CONFIG_FILE), &inner.config)?;
        atomic_write_json(&self.path(HISTORY_FILE), &inner.history)?;
        atomic_write_json(
            &self.path(QUARANTINE_FILE),
            &inner.quarantine.iter().collect::<Vec<_>>(),
        )?;
        atomic_write_json(&self.path(EVENTS_FILE), &inner.events.iter().collect::<Vec<_>>())?;
        atomic_write_json(&self.path(MAINTENANCE_FILE), &inner.maintenance)?;
        Ok(())
    }
}

/// RFC 7386 style merge: objects merge recursively, null deletes, anything
/// else replaces.
pub fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    use serde_json::Value;

    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    base_map.remove(&key);
                } else {
                    merge_json(base_map.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store(dir: &Path) -> StateStore {
        StateStore::load(dir).expect("load store")
    }

    #[test]
    fn test_initial_config_written() {
        let dir = tempfile::tempdir().expect("tempdir");
        let _ = store(dir.path());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_mutations_survive_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();
        {
            let s = store(dir.path());
            s.record_restart("web", now).expect("record");
            s.quarantine("db").expect("quarantine");
            s.set_maintenance(true, now).expect("maintenance");
            s.append_event(Event::new(
                EventKind::Restart,
                EventStatus::Success,
                "web",
                "abc",
                "restarted",
            ))
            .expect("event");
            s.select("proj_api").expect("select");
        }

        let s = store(dir.path());
        assert_eq!(s.restart_count("web", 3600, now), 1);
        assert!(s.is_quarantined("db"));
        assert!(s.is_maintenance_active());
        assert_eq!(s.events().len(), 1);
        assert!(s.snapshot().containers.selected.contains(&"proj_api".to_string()));
    }

    #[test]
    fn test_restart_count_window_and_pruning() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());
        let now = Utc::now();

        s.record_restart("web", now - Duration::seconds(90)).expect("old");
        s.record_restart("web", now - Duration::seconds(30)).expect("recent");
        s.record_restart("web", now - Duration::seconds(10)).expect("recent");
        // Ancient entry beyond the 24h retention floor disappears entirely.
        s.record_restart("web", now - Duration::seconds(200_000)).expect("ancient");

        assert_eq!(s.restart_count("web", 60, now), 2);
        // After pruning, the ancient entry is gone but the 90s-old one stays
        // (retention floor is 24h).
        assert_eq!(s.restart_count("web", 3600, now), 3);
    }

    #[test]
    fn test_pending_future_timestamp_counts() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());
        let now = Utc::now();

        s.record_restart("web", now + Duration::seconds(20)).expect("pending");
        assert_eq!(s.restart_count("web", 60, now), 1);
        assert!(s.last_restart("web").unwrap() > now);
    }

    #[test]
    fn test_unquarantine_clears_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());
        let now = Utc::now();

        s.record_restart("web", now).expect("record");
        s.quarantine("web").expect("quarantine");
        assert!(s.unquarantine("web").expect("unquarantine"));
        assert_eq!(s.restart_count("web", 3600, now), 0);
        assert!(!s.is_quarantined("web"));
        // Second release is a no-op.
        assert!(!s.unquarantine("web").expect("again"));
    }

    #[test]
    fn test_event_ring_bounded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());

        let mut config = PolicyConfig::default();
        config.ui.max_log_entries = 3;
        s.update_config(config).expect("config");

        for i in 0..5 {
            s.append_event(Event::new(
                EventKind::Restart,
                EventStatus::Success,
                format!("c{}", i),
                "id",
                "msg",
            ))
            .expect("append");
        }

        let events = s.events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].stable_id, "c2");
        assert_eq!(events[2].stable_id, "c4");
    }

    #[test]
    fn test_update_config_rejects_invalid() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());

        let mut config = PolicyConfig::default();
        config.restart.window_seconds = 1;

        let err = s.update_config(config).expect_err("must reject");
        assert!(matches!(err, StoreError::Validation(_)));
        // Current config unchanged.
        assert_eq!(s.snapshot().restart.window_seconds, 3600);
    }

    #[test]
    fn test_apply_config_patch_merges() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());

        s.apply_config_patch(json!({
            "monitor": { "include_all": true },
            "restart": { "cooldown_seconds": 15 }
        }))
        .expect("patch");

        let view = s.snapshot();
        assert!(view.monitor.include_all);
        assert_eq!(view.restart.cooldown_seconds, 15);
        // Untouched fields keep their values.
        assert_eq!(view.restart.max_restarts, 5);
    }

    #[test]
    fn test_select_is_idempotent_and_respects_exclusion() {
        let dir = tempfile::tempdir().expect("tempdir");
        let s = store(dir.path());

        assert!(s.select("web").expect("select"));
        assert!(!s.select("web").expect("select again"));

        s.apply_config_patch(json!({ "containers": { "excluded": ["db"] } }))
            .expect("exclude");
        assert!(!s.select("db").expect("select excluded"));
        assert!(!s.snapshot().containers.selected.contains(&"db".to_string()));
    }

    #[test]
    fn test_legacy_restart_counts_migrated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let now = Utc::now();

        let legacy = json!({
            "containers": {
                "selected": ["web"],
                "excluded": [],
                "restart_counts": { "web": [now.to_rfc3339()] }
            }
        });
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            serde_json::to_string_pretty(&legacy).unwrap(),
        )
        .expect("seed config");

        let s = store(dir.path());
        assert_eq!(s.restart_count("web", 3600, now + Duration::seconds(1)), 1);
        assert!(dir.path().join(HISTORY_FILE).exists());
    }

    #[test]
    fn test_corrupt_state_file_recovers() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join(QUARANTINE_FILE), "not json").expect("corrupt");

        let s = store(dir.path());
        assert!(s.quarantined_ids().is_empty());
    }

    #[test]
    fn test_merge_json_null_deletes() {
        let mut base = json!({"a": {"b": 1, "c": 2}, "d": 3});
        merge_json(&mut base, json!({"a": {"b": null}, "d": 4}));
        assert_eq!(base, json!({"a": {"c": 2}, "d": 4}));
    }
}
