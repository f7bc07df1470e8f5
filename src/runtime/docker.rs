use async_trait::async_trait;
use bollard::container::{ListContainersOptions, RestartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::system::EventsOptions;
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    short_id, ContainerRuntime, ContainerState, NativeHealth, Observation, Result, RuntimeError,
    StartEvent,
};

/// Extra wait on top of the runtime's graceful-stop timeout before a restart
/// call is abandoned.
const RESTART_TIMEOUT_MARGIN_SECS: u64 = 10;

/// Reconnect backoff bounds for the event subscription.
const EVENT_BACKOFF_INITIAL_SECS: u64 = 1;
const EVENT_BACKOFF_MAX_SECS: u64 = 30;

pub struct DockerRuntime {
    client: Docker,
    http: reqwest::Client,
}

impl DockerRuntime {
    pub fn new(socket: &str) -> anyhow::Result<Self> {
        // Bare paths are unix sockets; everything else (tcp://, named
        // pipes, and all of Windows) is left to the SDK's own defaults.
        let client = match socket {
            s if !cfg!(windows)
                && !s.starts_with("tcp://")
                && !s.starts_with("npipe://") =>
            {
                Docker::connect_with_socket(s, 120, bollard::API_DEFAULT_VERSION)?
            }
            _ => Docker::connect_with_local_defaults()?,
        };

        Ok(Self {
            client,
            http: reqwest::Client::new(),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        self.client
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))
    }
}

fn map_api_error(subject: &str, e: bollard::errors::Error) -> RuntimeError {
    match e {
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        } => RuntimeError::NotFound(subject.to_string()),
        other => RuntimeError::Unavailable(other.to_string()),
    }
}

/// Parse an exit code out of a status line like `Exited (137) 5 minutes ago`.
fn exit_code_from_status(status: &str) -> Option<i64> {
    let rest = status.strip_prefix("Exited (")?;
    let close = rest.find(')')?;
    rest[..close].parse().ok()
}

/// Parse the health suffix Docker appends to status lines, e.g.
/// `Up 3 hours (healthy)` or `Up 2 seconds (health: starting)`.
fn health_from_status(status: &str) -> NativeHealth {
    if status.contains("(healthy)") {
        NativeHealth::Healthy
    } else if status.contains("(unhealthy)") {
        NativeHealth::Unhealthy
    } else if status.contains("(health: starting)") {
        NativeHealth::Starting
    } else {
        NativeHealth::None
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self, all: bool) -> Result<Vec<Observation>> {
        let options = ListContainersOptions::<String> {
            all,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        let mut result = Vec::with_capacity(containers.len());
        for container in containers {
            let full_id = container.id.unwrap_or_default();
            let name = container
                .names
                .and_then(|names| names.first().cloned())
                .unwrap_or_default()
                .trim_start_matches('/')
                .to_string();

            let state = container
                .state
                .as_deref()
                .map(ContainerState::parse)
                .unwrap_or(ContainerState::Unknown);

            let status = container.status.unwrap_or_default();
            let exit_code = match state {
                ContainerState::Exited | ContainerState::Dead => exit_code_from_status(&status),
                _ => None,
            };

            result.push(Observation {
                short_id: short_id(&full_id),
                runtime_id: full_id,
                name,
                labels: container.labels.unwrap_or_default(),
                state,
                exit_code,
                health: health_from_status(&status),
                restart_count: 0,
            });
        }

        Ok(result)
    }

    async fn inspect(&self, id_or_name: &str) -> Result<Observation> {
        let info = self
            .client
            .inspect_container(id_or_name, None)
            .await
            .map_err(|e| map_api_error(id_or_name, e))?;

        let full_id = info.id.unwrap_or_default();
        let name = info
            .name
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string();

        let labels = info
            .config
            .as_ref()
            .and_then(|c| c.labels.clone())
            .unwrap_or_default();

        let (state, exit_code, health) = match info.state.as_ref() {
            Some(s) => {
                let state = s
                    .status
                    .as_ref()
                    .map(|st| ContainerState::parse(&format!("{:?}", st)))
                    .unwrap_or(ContainerState::Unknown);

                let exit_code = match state {
                    ContainerState::Exited | ContainerState::Dead => s.exit_code,
                    _ => None,
                };

                let health = s
                    .health
                    .as_ref()
                    .and_then(|h| h.status.as_ref())
                    .map(|hs| match format!("{:?}", hs).to_lowercase().as_str() {
                        "healthy" => NativeHealth::Healthy,
                        "unhealthy" => NativeHealth::Unhealthy,
                        "starting" => NativeHealth::Starting,
                        _ => NativeHealth::None,
                    })
                    .unwrap_or(NativeHealth::None);

                (state, exit_code, health)
            }
            None => (ContainerState::Unknown, None, NativeHealth::None),
        };

        Ok(Observation {
            short_id: short_id(&full_id),
            runtime_id: full_id,
            name,
            labels,
            state,
            exit_code,
            health,
            restart_count: info.restart_count.unwrap_or(0),
        })
    }

    async fn restart(&self, id_or_name: &str, timeout_s: u64) -> Result<()> {
        let options = RestartContainerOptions {
            t: timeout_s as isize,
        };

        let call = self.client.restart_container(id_or_name, Some(options));
        let deadline = Duration::from_secs(timeout_s + RESTART_TIMEOUT_MARGIN_SECS);

        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            })) => Err(RuntimeError::NotFound(id_or_name.to_string())),
            Ok(Err(e)) => Err(RuntimeError::RestartFailed {
                id: id_or_name.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(RuntimeError::RestartFailed {
                id: id_or_name.to_string(),
                reason: format!("timed out after {}s", deadline.as_secs()),
            }),
        }
    }

    fn start_events(&self) -> mpsc::Receiver<StartEvent> {
        let (tx, rx) = mpsc::channel(64);
        let client = self.client.clone();

        // The SDK event stream is endless and blocking; it lives on its own
        // task and hands items over through the channel so the scheduler
        // never waits on it.
        tokio::spawn(async move {
            let mut backoff = EVENT_BACKOFF_INITIAL_SECS;

            loop {
                let mut filters = HashMap::new();
                filters.insert("type".to_string(), vec!["container".to_string()]);
                filters.insert("event".to_string(), vec!["start".to_string()]);

                let options = EventsOptions::<String> {
                    filters,
                    ..Default::default()
                };

                let mut stream = client.events(Some(options));

                loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            backoff = EVENT_BACKOFF_INITIAL_SECS;

                            let Some(actor) = event.actor else { continue };
                            let id = actor.id.unwrap_or_default();
                            if id.is_empty() {
                                continue;
                            }
                            let mut labels = actor.attributes.unwrap_or_default();
                            let name = labels.remove("name").unwrap_or_default();
                            labels.remove("image");

                            let start = StartEvent {
                                id,
                                name,
                                labels,
                                ts: Utc::now(),
                            };

                            if tx.send(start).await.is_err() {
                                // Subscriber went away; stop the task.
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "Docker event stream error, re-subscribing");
                            break;
                        }
                        None => {
                            tracing::warn!("Docker event stream ended, re-subscribing");
                            break;
                        }
                    }
                }

                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(EVENT_BACKOFF_MAX_SECS);
            }
        });

        rx
    }

    async fn probe_http(
        &self,
        endpoint: &str,
        expected_status: u16,
        timeout_s: u64,
    ) -> Result<()> {
        let response = self
            .http
            .get(endpoint)
            .timeout(Duration::from_secs(timeout_s))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RuntimeError::ProbeTimeout(timeout_s)
                } else {
                    RuntimeError::ProbeFailure(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status == expected_status {
            Ok(())
        } else {
            Err(RuntimeError::ProbeFailure(format!(
                "{} returned status {} (expected {})",
                endpoint, status, expected_status
            )))
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16, timeout_s: u64) -> Result<()> {
        let connect = tokio::net::TcpStream::connect((host, port));
        match tokio::time::timeout(Duration::from_secs(timeout_s), connect).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RuntimeError::ProbeFailure(format!(
                "{}:{} unreachable: {}",
                host, port, e
            ))),
            Err(_) => Err(RuntimeError::ProbeTimeout(timeout_s)),
        }
    }

    async fn probe_exec(
        &self,
        container_id: &str,
        argv: &[String],
        timeout_s: u64,
    ) -> Result<i64> {
        let run = async {
            let exec_options = CreateExecOptions::<String> {
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                cmd: Some(argv.to_vec()),
                ..Default::default()
            };

            let exec = self
                .client
                .create_exec(container_id, exec_options)
                .await
                .map_err(|e| map_api_error(container_id, e))?;

            let started = self
                .client
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| RuntimeError::ProbeFailure(e.to_string()))?;

            if let StartExecResults::Attached { mut output, .. } = started {
                // Drain output; only the exit code matters.
                while let Some(chunk) = output.next().await {
                    if let Err(e) = chunk {
                        tracing::debug!(container = %container_id, error = %e, "Exec probe output error");
                        break;
                    }
                }
            }

            let inspect = self
                .client
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| RuntimeError::ProbeFailure(e.to_string()))?;

            Ok(inspect.exit_code.unwrap_or(-1))
        };

        match tokio::time::timeout(Duration::from_secs(timeout_s), run).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::ProbeTimeout(timeout_s)),
        }
    }
}
