use super::ContainerRuntime;
use crate::error::RuntimeError;
use crate::types::{Container, EventAction, LifecycleEvent, PortMapping};
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::errors::Error as DockerError;
use bollard::models::ContainerInspectResponse;
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::mpsc;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects using `DOCKER_HOST` or the platform's default socket.
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn monitor(&self, event_tx: mpsc::Sender<LifecycleEvent>) -> Result<(), RuntimeError> {
        let opts = EventsOptions::<String> {
            filters: [
                ("type", ["container"].as_slice()),
                ("event", ["start", "unpause", "die", "kill"].as_slice()),
            ]
            .iter()
            .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
            .collect(),
            ..Default::default()
        };

        let mut stream = self.docker.events(Some(opts));

        info!("Listening for Docker events ...");
        while let Some(msg) = stream.next().await {
            let event = msg?;
            let Some(container_id) = event.actor.and_then(|a| a.id).filter(|id| !id.is_empty())
            else {
                continue;
            };
            let action = EventAction::parse(event.action.as_deref().unwrap_or_default());
            debug!("Container event: {:?} for {}", action, container_id);

            event_tx
                .send(LifecycleEvent {
                    container_id,
                    action,
                })
                .await
                .map_err(|_| RuntimeError::ChannelClosed)?;
        }

        warn!("Docker event stream ended");
        Ok(())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<Container>, RuntimeError> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(detail) => Ok(to_container(detail)),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_running(&self) -> Result<Vec<Container>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(opts)).await?;

        let mut containers = Vec::with_capacity(summaries.len());
        for id in summaries.into_iter().filter_map(|c| c.id) {
            // a container may exit between listing and inspection
            if let Some(container) = self.inspect(&id).await? {
                if container.running {
                    containers.push(container);
                }
            }
        }
        Ok(containers)
    }
}

/// Flattens Docker's inspect payload into the runtime-neutral model.
fn to_container(detail: ContainerInspectResponse) -> Option<Container> {
    let id = detail.id.filter(|id| !id.is_empty())?;
    let state = detail.state.unwrap_or_default();
    let config = detail.config.unwrap_or_default();
    let settings = detail.network_settings.unwrap_or_default();

    let mut ports: HashMap<String, Option<(Option<String>, Option<u16>)>> = HashMap::new();
    for key in config.exposed_ports.iter().flat_map(|p| p.keys()) {
        ports.entry(key.clone()).or_insert(None);
    }
    for (key, bindings) in settings.ports.unwrap_or_default() {
        let binding = bindings.and_then(|b| b.into_iter().next()).map(|b| {
            (
                b.host_ip,
                b.host_port.and_then(|p| p.parse::<u16>().ok()),
            )
        });
        let slot = ports.entry(key).or_insert(None);
        if binding.is_some() {
            *slot = binding;
        }
    }

    let ports = ports
        .into_iter()
        .filter_map(|(key, binding)| {
            let (exposed_port, protocol) = PortMapping::parse_key(&key)?;
            let (host_ip, host_port) = binding.unwrap_or((None, None));
            Some(PortMapping {
                exposed_port,
                protocol,
                host_ip,
                host_port,
            })
        })
        .collect();

    let mut networks: BTreeMap<String, String> = settings
        .networks
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(name, endpoint)| {
            let ip = endpoint
                .ip_address
                .filter(|ip| !ip.is_empty())
                .or(endpoint.global_ipv6_address.filter(|ip| !ip.is_empty()))?;
            Some((name, ip))
        })
        .collect();
    if networks.is_empty() {
        if let Some(ip) = settings.ip_address.filter(|ip| !ip.is_empty()) {
            networks.insert("default".into(), ip);
        }
    }

    Some(Container {
        id,
        name: detail
            .name
            .map(|n| n.trim_start_matches('/').to_string())
            .unwrap_or_default(),
        image: config.image.unwrap_or_default(),
        running: state.running.unwrap_or(false),
        exit_code: state.exit_code,
        labels: config.labels.unwrap_or_default(),
        env: config.env.unwrap_or_default(),
        ports,
        networks,
        network_mode: detail.host_config.and_then(|h| h.network_mode),
    })
}
