//! Live view of the containers eligible for tunneling
//!
//! The registry only mirrors what the host reports. Tunnel intent never comes
//! from container metadata; it lives in the endpoint store.

use crate::{
    CoreError, EndpointError, EndpointOptions, EndpointStatus, EndpointStore, Reconciler, Result,
};
use chrono::{DateTime, Utc};
use ngext_provider::{
    Container, ContainerHost, ContainerId, EndpointKey, ExposedPort, PortProtocol, ProviderError,
    TunnelSpec,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Difference between two container listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryDiff {
    /// First successful listing; nothing was "added"
    pub initial: bool,
    pub added: Vec<ContainerId>,
    pub removed: Vec<Container>,
    /// Still running but with a different port set
    pub changed: Vec<ContainerId>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        !self.initial && self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

/// One container port as displayed, merged with its tunnel state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRow {
    pub key: EndpointKey,
    pub container_name: String,
    pub image: String,
    pub port: u16,
    pub protocol: PortProtocol,
    pub host_port: Option<u16>,
    /// Only TCP ports can be tunneled
    pub tunnelable: bool,
    pub enabled: bool,
    pub options: EndpointOptions,
    pub status: EndpointStatus,
    pub url: Option<String>,
    pub error: Option<EndpointError>,
    pub busy: bool,
    /// The container is gone; the row stays until its tunnel is deleted
    pub orphan: bool,
}

#[derive(Debug, Default)]
pub struct ContainerRegistry {
    containers: Vec<Container>,
    loaded: bool,
    last_error: Option<String>,
    last_refresh: Option<DateTime<Utc>>,
}

impl ContainerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the container list from the host.
    ///
    /// On failure the previous list is kept and the error is remembered until
    /// the next successful refresh.
    pub async fn refresh(
        &mut self,
        host: &dyn ContainerHost,
    ) -> std::result::Result<RegistryDiff, ProviderError> {
        match host.list_containers().await {
            Ok(list) => {
                if self.last_error.take().is_some() {
                    tracing::info!("Container listing recovered");
                }
                Ok(self.apply(list))
            }
            Err(e) => {
                tracing::warn!("Failed to list containers, keeping previous list: {}", e);
                self.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Replace the list and report what changed
    pub fn apply(&mut self, mut list: Vec<Container>) -> RegistryDiff {
        list.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let previous: HashMap<&ContainerId, &Container> =
            self.containers.iter().map(|c| (&c.id, c)).collect();
        let current: HashSet<&ContainerId> = list.iter().map(|c| &c.id).collect();

        let mut diff = RegistryDiff {
            initial: !self.loaded,
            ..Default::default()
        };
        if self.loaded {
            for container in &list {
                match previous.get(&container.id) {
                    None => diff.added.push(container.id.clone()),
                    Some(old) if old.ports != container.ports => {
                        diff.changed.push(container.id.clone())
                    }
                    Some(_) => {}
                }
            }
            diff.removed = self
                .containers
                .iter()
                .filter(|c| !current.contains(&c.id))
                .cloned()
                .collect();
        }

        for c in &diff.removed {
            tracing::info!("Container {} ({}) is gone", c.name, c.id.short());
        }
        for id in &diff.added {
            tracing::debug!("Container {} appeared", id.short());
        }

        self.containers = list;
        self.loaded = true;
        self.last_refresh = Some(Utc::now());
        diff
    }

    /// Containers ordered by name
    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Error of the last failed refresh, cleared by the next success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    pub fn get(&self, id: &ContainerId) -> Option<&Container> {
        self.containers.iter().find(|c| &c.id == id)
    }

    /// Resolve a user-supplied container reference: exact name, exact id, or
    /// unique id prefix.
    pub fn find(&self, query: &str) -> Result<&Container> {
        find_container(&self.containers, query)
    }

    /// The tunnelable port `port` of container `id`
    pub fn tunnel_port(&self, key: &EndpointKey) -> Option<(&Container, &ExposedPort)> {
        let container = self.get(&key.container_id)?;
        container.port(key.port).map(|p| (container, p))
    }

    /// Display rows: every port of every container, then rows for tunnels
    /// whose container is gone but which are still being torn down.
    pub fn rows(&self, store: &EndpointStore, reconciler: &Reconciler) -> Vec<PortRow> {
        let mut rows = Vec::new();
        let mut seen = HashSet::new();

        for container in &self.containers {
            for port in &container.ports {
                let key = EndpointKey {
                    container_id: container.id.clone(),
                    port: port.port,
                };
                let config = store.get(&key);
                let tunnelable = port.is_tunnelable();
                let view = if tunnelable {
                    seen.insert(key.clone());
                    Some(reconciler.view(&key))
                } else {
                    None
                };

                rows.push(PortRow {
                    container_name: container.name.clone(),
                    image: container.image.clone(),
                    port: port.port,
                    protocol: port.protocol,
                    host_port: port.host_port,
                    tunnelable,
                    enabled: tunnelable && config.is_some_and(|c| c.enabled),
                    options: config.map(|c| c.options.clone()).unwrap_or_default(),
                    status: view.as_ref().map(|v| v.status).unwrap_or_default(),
                    url: view.as_ref().and_then(|v| v.url.clone()),
                    error: view.as_ref().and_then(|v| v.error.clone()),
                    busy: view.as_ref().is_some_and(|v| v.busy),
                    orphan: false,
                    key,
                });
            }
        }

        for view in reconciler.views() {
            if seen.contains(&view.key) {
                continue;
            }
            let config = store.get(&view.key);
            rows.push(PortRow {
                container_name: config
                    .map(|c| c.container_name.clone())
                    .unwrap_or_else(|| view.key.container_id.short().to_string()),
                image: String::new(),
                port: view.key.port,
                protocol: PortProtocol::Tcp,
                host_port: None,
                tunnelable: true,
                enabled: false,
                options: config.map(|c| c.options.clone()).unwrap_or_default(),
                status: view.status,
                url: view.url,
                error: view.error,
                busy: view.busy,
                orphan: true,
                key: view.key,
            });
        }

        rows
    }
}

/// Resolve `query` against `containers` by name, id or unique id prefix
pub fn find_container<'a>(containers: &'a [Container], query: &str) -> Result<&'a Container> {
    let query = query.trim().trim_start_matches('/');
    if query.is_empty() {
        return Err(CoreError::ContainerNotFound(query.to_string()));
    }
    if let Some(c) = containers
        .iter()
        .find(|c| c.name == query || c.id.0 == query)
    {
        return Ok(c);
    }

    let matches: Vec<&Container> = containers
        .iter()
        .filter(|c| c.id.0.starts_with(query))
        .collect();
    match matches.as_slice() {
        [] => Err(CoreError::ContainerNotFound(query.to_string())),
        [one] => Ok(*one),
        many => Err(CoreError::AmbiguousContainer(format!(
            "{} matches {}",
            query,
            many.iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

/// The tunnel that should exist for an enabled port.
///
/// Published ports are reached through the host; unpublished ones through the
/// container name on the Docker network.
pub fn derive_spec(
    container: &Container,
    port: &ExposedPort,
    options: &EndpointOptions,
    scheme: &str,
) -> TunnelSpec {
    let key = EndpointKey {
        container_id: container.id.clone(),
        port: port.port,
    };
    let upstream = match port.host_port {
        Some(host_port) => format!("localhost:{}", host_port),
        None => format!("{}:{}", container.name, port.port),
    };
    TunnelSpec {
        name: key.tunnel_name(),
        key,
        upstream,
        scheme: scheme.to_string(),
        pooling_enabled: options.pooling_enabled,
        description: options.description.clone(),
        metadata: options.metadata.clone(),
    }
}
