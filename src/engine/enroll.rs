//! Automatic enrollment of newly started containers.
//!
//! A long-lived listener consumes the runtime's decoupled start-event
//! channel, independent of the tick driver. Containers carrying the opt-in
//! label are added to the selected set exactly once.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::identity;
use crate::notifications::Notifier;
use crate::runtime::{ContainerRuntime, RuntimeError, StartEvent};
use crate::store::{Event, EventKind, EventStatus, StateStore};

pub fn spawn_enroll_listener(
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<StateStore>,
    notifier: Notifier,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = runtime.start_events();

    tokio::spawn(async move {
        info!("Auto-enroll listener started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = events.recv() => match received {
                    Some(event) => {
                        handle_start_event(runtime.as_ref(), &store, &notifier, event).await;
                    }
                    None => {
                        warn!("Start-event channel closed, auto-enroll listener exiting");
                        break;
                    }
                }
            }
        }
        info!("Auto-enroll listener stopped");
    })
}

pub(crate) async fn handle_start_event(
    runtime: &dyn ContainerRuntime,
    store: &StateStore,
    notifier: &Notifier,
    event: StartEvent,
) {
    // The event's label set can be stale; inspect for the authoritative
    // observation before enrolling.
    let obs = match runtime.inspect(&event.id).await {
        Ok(obs) => obs,
        Err(RuntimeError::NotFound(_)) => {
            debug!(container = %event.name, "Started container already gone, skipping enrollment");
            return;
        }
        Err(e) => {
            warn!(container = %event.name, error = %e, "Failed to inspect started container");
            return;
        }
    };

    let policy = store.snapshot();
    let (key, value) = policy.monitor.opt_in_label_parts();
    if obs.label(key) != Some(value) {
        return;
    }

    let stable_id = identity::stable_id(&obs);
    match store.select(&stable_id) {
        Ok(true) => {
            info!(container = %stable_id, "Auto-enrolled container carrying opt-in label");
            let record = Event::new(
                EventKind::AutoMonitor,
                EventStatus::Info,
                &stable_id,
                &obs.runtime_id,
                format!("auto-enrolled on start ({}={})", key, value),
            );
            notifier.notify(&record);
            if let Err(e) = store.append_event(record) {
                error!(error = %e, "Failed to record enrollment event");
            }
        }
        // Already selected or explicitly excluded; replays are no-ops.
        Ok(false) => {
            debug!(container = %stable_id, "Start event for already-tracked container");
        }
        Err(e) => {
            error!(container = %stable_id, error = %e, "Failed to persist enrollment");
        }
    }
}
