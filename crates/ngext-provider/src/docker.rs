//! Docker host implementation using bollard

use crate::{
    open_in_browser, Container, ContainerHost, ContainerId, ExposedPort, FileTokenStore,
    PortProtocol, ProviderError, Result,
};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, PortTypeEnum};
use bollard::Docker;
use std::collections::HashMap;
use std::path::PathBuf;

/// Docker host backed by the engine API, with a file token store
pub struct DockerHost {
    client: Docker,
    tokens: FileTokenStore,
    exclude_label: String,
}

impl DockerHost {
    /// Connect to the Docker engine at `socket_path`
    pub async fn new(
        socket_path: &str,
        token_path: PathBuf,
        exclude_label: impl Into<String>,
    ) -> Result<Self> {
        let client = if socket_path.starts_with("unix://") || socket_path.starts_with('/') {
            let path = socket_path.trim_start_matches("unix://");
            Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?
        } else if socket_path.starts_with("http://") || socket_path.starts_with("https://") {
            Docker::connect_with_http(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?
        } else {
            // Named pipes on Windows, bare socket paths elsewhere
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| ProviderError::ConnectionError(e.to_string()))?
        };

        client
            .ping()
            .await
            .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;

        Ok(Self {
            client,
            tokens: FileTokenStore::new(token_path),
            exclude_label: exclude_label.into(),
        })
    }
}

#[async_trait]
impl ContainerHost for DockerHost {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        let options = ListContainersOptions::<String> {
            all: false,
            filters: HashMap::from([("status".to_string(), vec!["running".to_string()])]),
            ..Default::default()
        };

        let summaries = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| ProviderError::RuntimeError(e.to_string()))?;

        let mut containers: Vec<Container> = summaries
            .into_iter()
            .filter_map(|s| container_from_summary(s, &self.exclude_label))
            .collect();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(containers)
    }

    async fn open_external(&self, url: &str) -> Result<()> {
        open_in_browser(url)
    }

    async fn get_stored_auth_token(&self) -> Result<Option<String>> {
        self.tokens.get()
    }

    async fn set_stored_auth_token(&self, token: &str) -> Result<()> {
        self.tokens.set(token)
    }

    async fn clear_stored_auth_token(&self) -> Result<()> {
        self.tokens.clear()
    }
}

/// Map an engine container summary, skipping excluded and unidentified containers
pub(crate) fn container_from_summary(
    summary: ContainerSummary,
    exclude_label: &str,
) -> Option<Container> {
    let labels = summary.labels.unwrap_or_default();
    if !exclude_label.is_empty() && labels.contains_key(exclude_label) {
        return None;
    }

    let id = summary.id.filter(|id| !id.is_empty())?;

    // The engine reports one entry per bound address family; keep one per
    // (port, protocol) and prefer the entry that is published on the host.
    let mut by_port: HashMap<(u16, PortProtocol), ExposedPort> = HashMap::new();
    for p in summary.ports.unwrap_or_default() {
        let protocol = match p.typ {
            Some(PortTypeEnum::UDP) => PortProtocol::Udp,
            Some(PortTypeEnum::TCP) | None | Some(PortTypeEnum::EMPTY) => PortProtocol::Tcp,
            Some(_) => continue,
        };
        let entry = by_port
            .entry((p.private_port, protocol))
            .or_insert(ExposedPort {
                port: p.private_port,
                protocol,
                host_port: None,
            });
        if entry.host_port.is_none() {
            entry.host_port = p.public_port;
        }
    }
    let mut ports: Vec<ExposedPort> = by_port.into_values().collect();
    ports.sort_by_key(|p| (p.port, p.protocol));

    Some(Container {
        id: ContainerId::new(id),
        name: summary
            .names
            .and_then(|n| n.first().cloned())
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_string(),
        image: summary.image.unwrap_or_default(),
        ports,
        labels,
    })
}
