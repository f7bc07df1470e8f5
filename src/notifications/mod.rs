//! Webhook notification fan-out.
//!
//! Supervision events are handed to a bounded queue and posted to the
//! configured webhook from a dedicated task. The queue never blocks the
//! supervisor: when it is full the notification is dropped and logged.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{Event, EventKind, EventStatus, StateStore};

/// Outbound webhook payload.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub kind: EventKind,
    pub status: EventStatus,
    pub container: String,
    pub container_id: String,
    pub message: String,
    pub attempt_count: u32,
    pub timestamp: String,
}

impl Notification {
    pub fn from_event(event: &Event) -> Self {
        Self {
            kind: event.kind,
            status: event.status,
            container: event.stable_id.clone(),
            container_id: event.container_id.clone(),
            message: event.message.clone(),
            attempt_count: event.attempt_count,
            timestamp: event.ts_utc.to_rfc3339(),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    /// Spawn the sender task. Alert routing and the webhook target are read
    /// from the store snapshot per notification, so config changes apply
    /// without a restart.
    pub fn spawn(store: Arc<StateStore>) -> Self {
        let queue_size = store.snapshot().notifications.queue_size.max(1);
        let (tx, mut rx) = mpsc::channel::<Notification>(queue_size);
        let client = reqwest::Client::new();

        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let config = store.snapshot();
                if !config.notifications.enabled {
                    continue;
                }
                if !wants(&config.alerts, notification.kind) {
                    continue;
                }
                let Some(url) = config.notifications.webhook_url.clone() else {
                    continue;
                };

                let timeout = Duration::from_secs(config.notifications.timeout_seconds.max(1));
                match client
                    .post(&url)
                    .timeout(timeout)
                    .json(&notification)
                    .send()
                    .await
                {
                    Ok(response) if response.status().is_success() => {
                        debug!(
                            kind = ?notification.kind,
                            container = %notification.container,
                            "Notification delivered"
                        );
                    }
                    Ok(response) => {
                        warn!(
                            status = %response.status(),
                            container = %notification.container,
                            "Webhook rejected notification"
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, container = %notification.container, "Webhook delivery failed");
                    }
                }
            }
        });

        Self { tx }
    }

    /// Enqueue a notification for the event. Never blocks; drops when the
    /// queue is full.
    pub fn notify(&self, event: &Event) {
        if let Err(e) = self.tx.try_send(Notification::from_event(event)) {
            debug!(container = %event.stable_id, error = %e, "Notification queue full, dropping");
        }
    }
}

fn wants(alerts: &crate::config::AlertConfig, kind: EventKind) -> bool {
    match kind {
        EventKind::Restart | EventKind::ManualRestart => alerts.on_restart,
        EventKind::Quarantine => alerts.on_quarantine,
        EventKind::AutoUnquarantine | EventKind::ManualUnquarantine => alerts.on_unquarantine,
        EventKind::AutoMonitor => alerts.on_enroll,
        EventKind::HealthFailed => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AlertConfig;

    #[test]
    fn test_alert_routing() {
        let alerts = AlertConfig::default();
        assert!(wants(&alerts, EventKind::Restart));
        assert!(wants(&alerts, EventKind::Quarantine));
        assert!(wants(&alerts, EventKind::ManualUnquarantine));
        assert!(!wants(&alerts, EventKind::AutoMonitor));
        assert!(!wants(&alerts, EventKind::HealthFailed));
    }

    #[test]
    fn test_payload_shape() {
        let event = Event::new(
            EventKind::Quarantine,
            EventStatus::Info,
            "proj_web",
            "abc123",
            "exceeded restart quota",
        )
        .with_attempts(5);

        let payload = serde_json::to_value(Notification::from_event(&event)).unwrap();
        assert_eq!(payload["kind"], "quarantine");
        assert_eq!(payload["container"], "proj_web");
        assert_eq!(payload["attempt_count"], 5);
    }

    #[tokio::test]
    async fn test_notify_never_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(StateStore::load(dir.path()).expect("store"));
        let notifier = Notifier::spawn(store);

        // Far more events than the queue holds; all calls return instantly.
        for i in 0..500 {
            let event = Event::new(
                EventKind::Restart,
                EventStatus::Success,
                format!("c{}", i),
                "id",
                "msg",
            );
            notifier.notify(&event);
        }
    }
}
