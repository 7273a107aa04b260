use super::{ContainerRuntime, WATCHED_EVENTS};
use crate::container::{ContainerDetail, ContainerEvent, Status};
use crate::error::RuntimeError;
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerInspectResponse, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures_util::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::collections::HashMap;
use std::net::IpAddr;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon using default settings
    /// (unix socket on Linux, `DOCKER_HOST` when set).
    pub fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()?;
        info!("Connected to the local Docker daemon");
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn list_containers(&self) -> Result<Vec<String>, RuntimeError> {
        let opts = ListContainersOptions::<String> {
            all: false,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerDetail, RuntimeError> {
        let detail = self.docker.inspect_container(id, None).await?;
        container_detail(detail)
    }

    fn events(&self, since: i64) -> BoxStream<'static, Result<ContainerEvent, RuntimeError>> {
        let opts = EventsOptions::<String> {
            since: Some(since.to_string()),
            until: None,
            filters: HashMap::from([
                ("type".to_string(), vec!["container".to_string()]),
                (
                    "event".to_string(),
                    WATCHED_EVENTS.iter().map(|s| s.to_string()).collect(),
                ),
            ]),
        };

        self.docker
            .events(Some(opts))
            .filter_map(|msg| async move {
                match msg {
                    Ok(event) => container_event(event).map(Ok),
                    Err(e) => Some(Err(RuntimeError::EventStream(e.to_string()))),
                }
            })
            .boxed()
    }
}

fn container_event(event: EventMessage) -> Option<ContainerEvent> {
    if event.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }
    let id = event.actor.and_then(|actor| actor.id).filter(|id| !id.is_empty())?;
    let action = event.action.unwrap_or_default();
    debug!("Container event: {} for {}", action, id);

    Some(ContainerEvent {
        observed_at: event.time,
        ..ContainerEvent::new(id, Status::parse(&action))
    })
}

fn container_detail(detail: ContainerInspectResponse) -> Result<ContainerDetail, RuntimeError> {
    let id = detail.id.ok_or(RuntimeError::MissingField("Id"))?;
    let name = detail
        .name
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let (env, labels) = detail
        .config
        .map(|c| (c.env.unwrap_or_default(), c.labels.unwrap_or_default()))
        .unwrap_or_default();

    let mut ip_addresses = Vec::new();
    let mut ports = Vec::new();
    if let Some(settings) = detail.network_settings {
        let mut candidates = vec![settings.ip_address, settings.global_ipv6_address];
        for (_, net) in settings.networks.unwrap_or_default() {
            candidates.push(net.ip_address);
            candidates.push(net.global_ipv6_address);
        }
        for ip in candidates.into_iter().flatten() {
            if let Ok(ip) = ip.parse::<IpAddr>() {
                if !ip_addresses.contains(&ip) {
                    ip_addresses.push(ip);
                }
            }
        }
        ports = settings.ports.unwrap_or_default().into_keys().collect();
        ports.sort();
    }

    Ok(ContainerDetail {
        id,
        name,
        ip_addresses,
        ports,
        env,
        labels,
    })
}
