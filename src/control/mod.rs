//! Operations backing the control plane.
//!
//! The HTTP layer and UI live outside this crate; these methods give them
//! everything they need: status, container listings with computed fields,
//! selection changes, config updates, events, manual actions, and
//! maintenance. Identifier arguments accept names, short ids, full ids, or
//! stable ids and are resolved before anything is stored.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::engine::is_monitored;
use crate::identity;
use crate::notifications::Notifier;
use crate::runtime::{ContainerRuntime, RuntimeError};
use crate::store::{Event, EventKind, EventStatus, Maintenance, StateStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, ControlError>;

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub total_containers: usize,
    pub monitored_containers: usize,
    pub quarantined_containers: usize,
    pub maintenance: Maintenance,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContainerView {
    pub stable_id: String,
    pub runtime_id: String,
    pub name: String,
    pub state: String,
    pub monitored: bool,
    pub quarantined: bool,
    pub recent_restarts: usize,
}

pub struct Controller {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<StateStore>,
    notifier: Notifier,
}

impl Controller {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<StateStore>,
        notifier: Notifier,
    ) -> Self {
        Self {
            runtime,
            store,
            notifier,
        }
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let policy = self.store.snapshot();
        let containers = self.runtime.list_containers(true).await?;

        let monitored = containers
            .iter()
            .filter(|obs| is_monitored(obs, &identity::stable_id(obs), &policy))
            .count();

        Ok(StatusReport {
            total_containers: containers.len(),
            monitored_containers: monitored,
            quarantined_containers: self.store.quarantined_ids().len(),
            maintenance: self.store.maintenance(),
        })
    }

    pub async fn list_containers(&self) -> Result<Vec<ContainerView>> {
        let policy = self.store.snapshot();
        let now = Utc::now();
        let window = policy.restart.window_seconds;

        let containers = self.runtime.list_containers(true).await?;
        Ok(containers
            .into_iter()
            .map(|obs| {
                let stable_id = identity::stable_id(&obs);
                ContainerView {
                    monitored: is_monitored(&obs, &stable_id, &policy),
                    quarantined: self.store.is_quarantined(&stable_id),
                    recent_restarts: self.store.restart_count(&stable_id, window, now),
                    state: format!("{:?}", obs.state).to_lowercase(),
                    runtime_id: obs.runtime_id,
                    name: obs.name,
                    stable_id,
                }
            })
            .collect())
    }

    /// Resolve `token` against the current fleet and add it to the selected
    /// set. Returns the stable id it resolved to.
    pub async fn select(&self, token: &str) -> Result<String> {
        let observations = self.runtime.list_containers(true).await?;
        let stable_id = identity::resolve(token, &observations);
        self.store.select(&stable_id)?;
        Ok(stable_id)
    }

    pub async fn deselect(&self, token: &str) -> Result<String> {
        let observations = self.runtime.list_containers(true).await?;
        let stable_id = identity::resolve(token, &observations);
        self.store.deselect(&stable_id)?;
        Ok(stable_id)
    }

    /// Merge a JSON patch over the current policy; rejected with a
    /// structured error list when validation fails.
    pub fn update_config(&self, patch: serde_json::Value) -> Result<()> {
        self.store.apply_config_patch(patch)?;
        info!("Configuration updated");
        Ok(())
    }

    /// Export the whole policy as one JSON document.
    pub fn export_config(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self.store.snapshot().as_ref())
            .map_err(|e| ControlError::Store(StoreError::Malformed(e.to_string())))
    }

    /// Replace the whole policy from an exported document.
    pub fn import_config(&self, doc: serde_json::Value) -> Result<()> {
        let config = serde_json::from_value(doc)
            .map_err(|e| ControlError::Store(StoreError::Malformed(e.to_string())))?;
        self.store.update_config(config)?;
        info!("Configuration imported");
        Ok(())
    }

    pub fn events(&self) -> Vec<Event> {
        self.store.events()
    }

    pub fn append_event(&self, event: Event) -> Result<()> {
        self.store.append_event(event)?;
        Ok(())
    }

    pub fn clear_events(&self) -> Result<()> {
        self.store.clear_events()?;
        Ok(())
    }

    /// Restart a container on operator request. Bypasses cooldown and
    /// backoff, but the attempt is still recorded so the window quota sees
    /// it.
    pub async fn restart(&self, token: &str) -> Result<String> {
        let observations = self.runtime.list_containers(true).await?;
        let stable_id = identity::resolve(token, &observations);

        let obs = observations
            .iter()
            .find(|o| identity::stable_id(o) == stable_id)
            .ok_or_else(|| ControlError::Runtime(RuntimeError::NotFound(token.to_string())))?;

        self.store.record_restart(&stable_id, Utc::now())?;

        let stop_timeout = self.store.snapshot().restart.stop_timeout_seconds;
        let result = self.runtime.restart(&obs.runtime_id, stop_timeout).await;

        let event = match &result {
            Ok(()) => {
                info!(container = %stable_id, "Manual restart completed");
                Event::new(
                    EventKind::ManualRestart,
                    EventStatus::Success,
                    &stable_id,
                    &obs.runtime_id,
                    "restarted on operator request",
                )
            }
            Err(e) => Event::new(
                EventKind::ManualRestart,
                EventStatus::Failure,
                &stable_id,
                &obs.runtime_id,
                format!("manual restart failed: {}", e),
            ),
        };
        self.notifier.notify(&event);
        self.store.append_event(event)?;

        result?;
        Ok(stable_id)
    }

    /// Release a container from quarantine on operator request, clearing
    /// its restart history.
    pub async fn unquarantine(&self, token: &str) -> Result<String> {
        let observations = self.runtime.list_containers(true).await.unwrap_or_default();
        let stable_id = identity::resolve(token, &observations);

        if self.store.unquarantine(&stable_id)? {
            info!(container = %stable_id, "Released from quarantine on operator request");
            let event = Event::new(
                EventKind::ManualUnquarantine,
                EventStatus::Info,
                &stable_id,
                "",
                "released from quarantine on operator request",
            );
            self.notifier.notify(&event);
            self.store.append_event(event)?;
        }
        Ok(stable_id)
    }

    pub fn set_maintenance(&self, active: bool) -> Result<()> {
        self.store.set_maintenance(active, Utc::now())?;
        info!(active, "Maintenance mode changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{observation, MockRuntime};
    use crate::runtime::{ContainerState, LABEL_COMPOSE_PROJECT, LABEL_COMPOSE_SERVICE};
    use chrono::Duration;
    use serde_json::json;
    use tokio_test::assert_ok;

    fn fixture() -> (tempfile::TempDir, Arc<MockRuntime>, Controller, Arc<StateStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(StateStore::load(dir.path()).expect("store"));
        let notifier = Notifier::spawn(store.clone());

        let mut web = observation("0123456789abcdef0123", "web-1", ContainerState::Running);
        web.labels
            .insert(LABEL_COMPOSE_PROJECT.to_string(), "proj".to_string());
        web.labels
            .insert(LABEL_COMPOSE_SERVICE.to_string(), "web".to_string());
        let db = observation("fedcba9876543210fedc", "db", ContainerState::Exited);

        let runtime = Arc::new(MockRuntime::new(vec![web, db]));
        let controller = Controller::new(runtime.clone(), store.clone(), notifier);
        (dir, runtime, controller, store)
    }

    #[tokio::test]
    async fn test_select_resolves_any_identifier() {
        let (_dir, _runtime, controller, store) = fixture();

        assert_eq!(controller.select("web-1").await.expect("by name"), "proj_web");
        assert_eq!(
            controller.select("0123456789ab").await.expect("by short id"),
            "proj_web"
        );

        // Both selects landed on the same normalized entry.
        assert_eq!(store.snapshot().containers.selected, vec!["proj_web".to_string()]);

        assert_eq!(controller.deselect("web-1").await.expect("deselect"), "proj_web");
        assert!(store.snapshot().containers.selected.is_empty());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (_dir, _runtime, controller, store) = fixture();
        store
            .apply_config_patch(json!({ "monitor": { "include_all": true } }))
            .expect("patch");
        store.quarantine("db").expect("quarantine");

        let status = controller.status().await.expect("status");
        assert_eq!(status.total_containers, 2);
        assert_eq!(status.monitored_containers, 2);
        assert_eq!(status.quarantined_containers, 1);
        assert!(!status.maintenance.active);
    }

    #[tokio::test]
    async fn test_list_containers_computed_fields() {
        let (_dir, _runtime, controller, store) = fixture();
        store.select("proj_web").expect("select");
        store
            .record_restart("proj_web", Utc::now() - Duration::seconds(10))
            .expect("history");

        let views = controller.list_containers().await.expect("list");
        let web = views.iter().find(|v| v.stable_id == "proj_web").expect("web");
        assert!(web.monitored);
        assert!(!web.quarantined);
        assert_eq!(web.recent_restarts, 1);
        assert_eq!(web.state, "running");

        let db = views.iter().find(|v| v.stable_id == "db").expect("db");
        assert!(!db.monitored);
    }

    #[tokio::test]
    async fn test_manual_restart_bypasses_cooldown_and_records() {
        let (_dir, runtime, controller, store) = fixture();

        // A fresh attempt would block the supervisor via cooldown; the
        // manual path restarts anyway.
        store.record_restart("proj_web", Utc::now()).expect("seed");

        let resolved = controller.restart("web-1").await.expect("restart");
        assert_eq!(resolved, "proj_web");
        assert_eq!(runtime.restart_calls(), vec!["0123456789abcdef0123".to_string()]);
        assert_eq!(store.restart_count("proj_web", 3600, Utc::now()), 2);

        let events = store.events();
        assert_eq!(events.last().unwrap().kind, EventKind::ManualRestart);
        assert_eq!(events.last().unwrap().status, EventStatus::Success);
    }

    #[tokio::test]
    async fn test_manual_restart_unknown_container() {
        let (_dir, _runtime, controller, _store) = fixture();
        let err = controller.restart("ghost").await.expect_err("must fail");
        assert!(matches!(
            err,
            ControlError::Runtime(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_manual_unquarantine_clears_history() {
        let (_dir, _runtime, controller, store) = fixture();
        store.record_restart("db", Utc::now()).expect("seed");
        store.quarantine("db").expect("seed");

        assert_ok!(controller.unquarantine("db").await);
        assert!(!store.is_quarantined("db"));
        assert_eq!(store.restart_count("db", 3600, Utc::now()), 0);
        assert_eq!(store.events().last().unwrap().kind, EventKind::ManualUnquarantine);
    }

    #[tokio::test]
    async fn test_config_export_import_roundtrip() {
        let (_dir, _runtime, controller, store) = fixture();
        store
            .apply_config_patch(json!({ "restart": { "cooldown_seconds": 42 } }))
            .expect("patch");

        let doc = controller.export_config().expect("export");
        assert_eq!(doc["restart"]["cooldown_seconds"], 42);

        // Import the exported document into a fresh store.
        let dir2 = tempfile::tempdir().expect("tempdir");
        let store2 = Arc::new(StateStore::load(dir2.path()).expect("store"));
        let notifier2 = Notifier::spawn(store2.clone());
        let controller2 = Controller::new(
            Arc::new(MockRuntime::new(vec![])),
            store2.clone(),
            notifier2,
        );
        assert_ok!(controller2.import_config(doc));
        assert_eq!(store2.snapshot().restart.cooldown_seconds, 42);
    }

    #[tokio::test]
    async fn test_import_rejects_invalid_document() {
        let (_dir, _runtime, controller, _store) = fixture();

        let mut doc = controller.export_config().expect("export");
        doc["restart"]["window_seconds"] = json!(1);

        let err = controller.import_config(doc).expect_err("must reject");
        assert!(matches!(
            err,
            ControlError::Store(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_maintenance_toggle() {
        let (_dir, _runtime, controller, store) = fixture();
        assert_ok!(controller.set_maintenance(true));
        assert!(store.is_maintenance_active());
        assert_ok!(controller.set_maintenance(false));
        assert!(!store.is_maintenance_active());
    }

    #[tokio::test]
    async fn test_append_and_clear_events() {
        let (_dir, _runtime, controller, _store) = fixture();
        assert_ok!(controller.append_event(Event::new(
            EventKind::Restart,
            EventStatus::Success,
            "x",
            "y",
            "z",
        )));
        assert_eq!(controller.events().len(), 1);
        assert_ok!(controller.clear_events());
        assert!(controller.events().is_empty());
    }
}
