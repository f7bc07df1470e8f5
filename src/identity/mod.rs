//! Stable container identity.
//!
//! Containers are recreated on every image update, so tracking them by
//! runtime id loses all history. Identity is instead derived from labels and
//! names with a fixed priority, giving the same id across recreations.

use crate::runtime::Observation;

/// Derive the stable identifier for an observed container.
///
/// Priority: explicit `monitoring.id` label, then compose
/// `{project}_{service}`, then container name, then the short id as a last
/// resort for unlabeled, unnamed containers.
pub fn stable_id(obs: &Observation) -> String {
    if let Some(id) = obs.monitoring_id() {
        if !id.is_empty() {
            return id.to_string();
        }
    }

    if let (Some(project), Some(service)) = (obs.compose_project(), obs.compose_service()) {
        if !project.is_empty() && !service.is_empty() {
            return format!("{}_{}", project, service);
        }
    }

    let name = obs.name.trim_start_matches('/');
    if !name.is_empty() {
        return name.to_string();
    }

    obs.short_id.clone()
}

/// Resolve a user-supplied token (name, short id, full id, or already a
/// stable id) against the current fleet. Unknown tokens are echoed back so
/// records referring to containers that are currently gone stay valid.
pub fn resolve(token: &str, observations: &[Observation]) -> String {
    for obs in observations {
        let sid = stable_id(obs);
        if token == sid
            || token == obs.name
            || token == obs.short_id
            || token == obs.runtime_id
        {
            return sid;
        }
    }
    token.to_string()
}

/// Whether a stored key is a legacy full container id (64 hex chars).
pub fn is_full_container_id(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{
        ContainerState, NativeHealth, Observation, LABEL_COMPOSE_PROJECT, LABEL_COMPOSE_SERVICE,
        LABEL_MONITOR_ID,
    };
    use std::collections::HashMap;

    fn obs(runtime_id: &str, name: &str, labels: &[(&str, &str)]) -> Observation {
        Observation {
            runtime_id: runtime_id.to_string(),
            short_id: runtime_id[..12.min(runtime_id.len())].to_string(),
            name: name.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            state: ContainerState::Running,
            exit_code: None,
            health: NativeHealth::None,
            restart_count: 0,
        }
    }

    #[test]
    fn test_monitor_label_wins() {
        let o = obs(
            "aaa",
            "web",
            &[
                (LABEL_MONITOR_ID, "custom-id"),
                (LABEL_COMPOSE_PROJECT, "proj"),
                (LABEL_COMPOSE_SERVICE, "app"),
            ],
        );
        assert_eq!(stable_id(&o), "custom-id");
    }

    #[test]
    fn test_compose_labels_beat_name() {
        let o = obs(
            "aaa",
            "proj_app_1",
            &[(LABEL_COMPOSE_PROJECT, "proj"), (LABEL_COMPOSE_SERVICE, "app")],
        );
        assert_eq!(stable_id(&o), "proj_app");
    }

    #[test]
    fn test_partial_compose_labels_fall_through_to_name() {
        let o = obs("aaa", "web", &[(LABEL_COMPOSE_PROJECT, "proj")]);
        assert_eq!(stable_id(&o), "web");
    }

    #[test]
    fn test_name_then_short_id() {
        let o = obs("0123456789abcdef", "", &[]);
        assert_eq!(stable_id(&o), "0123456789ab");
    }

    #[test]
    fn test_identity_survives_recreation() {
        // Same labels, different runtime ids: the derived id must not change.
        let before = obs("aaa111", "web", &[(LABEL_MONITOR_ID, "svc")]);
        let after = obs("bbb222", "web-recreated", &[(LABEL_MONITOR_ID, "svc")]);
        assert_eq!(stable_id(&before), stable_id(&after));
    }

    #[test]
    fn test_resolve_by_name_short_id_and_full_id() {
        let fleet = vec![obs(
            "0123456789abcdef0123456789abcdef",
            "web",
            &[(LABEL_COMPOSE_PROJECT, "proj"), (LABEL_COMPOSE_SERVICE, "web")],
        )];

        assert_eq!(resolve("web", &fleet), "proj_web");
        assert_eq!(resolve("0123456789ab", &fleet), "proj_web");
        assert_eq!(resolve("0123456789abcdef0123456789abcdef", &fleet), "proj_web");
        assert_eq!(resolve("proj_web", &fleet), "proj_web");
    }

    #[test]
    fn test_resolve_echoes_unknown_token() {
        assert_eq!(resolve("ghost", &[]), "ghost");
    }

    #[test]
    fn test_is_full_container_id() {
        assert!(is_full_container_id(&"a".repeat(64)));
        assert!(!is_full_container_id(&"a".repeat(63)));
        assert!(!is_full_container_id(&"z".repeat(64)));
        assert!(!is_full_container_id("web"));
    }
}
