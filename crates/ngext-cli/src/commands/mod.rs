//! CLI command implementations

mod auth;
mod daemon;
mod endpoints;
mod manage;

use anyhow::{anyhow, bail, Result};
use ngext_config::GlobalConfig;
use ngext_core::{
    find_container, AuthState, CoreError, EndpointStore, ShellPaths, StatusSnapshot,
};
use ngext_provider::{ContainerHost, EndpointKey, TunnelService};
use std::sync::Arc;
use std::time::Duration;

pub use auth::*;
pub use daemon::*;
pub use endpoints::*;
pub use manage::*;

/// Everything a command needs: config, collaborators and the state files
pub struct CommandContext {
    pub config: GlobalConfig,
    pub host: Arc<dyn ContainerHost>,
    pub service: Arc<dyn TunnelService>,
    pub paths: ShellPaths,
}

impl CommandContext {
    pub fn new(
        config: GlobalConfig,
        host: Arc<dyn ContainerHost>,
        service: Arc<dyn TunnelService>,
        paths: ShellPaths,
    ) -> Self {
        Self {
            config,
            host,
            service,
            paths,
        }
    }

    fn load_store(&self) -> Result<EndpointStore> {
        Ok(EndpointStore::load_from(&self.paths.store)?)
    }

    /// The daemon's last snapshot, if it is still being refreshed
    fn live_snapshot(&self) -> Result<Option<StatusSnapshot>> {
        let snapshot = StatusSnapshot::load_from(&self.paths.status)?;
        let max_age = snapshot_max_age(&self.config);
        Ok(snapshot.filter(|s| s.is_fresh(chrono::Utc::now(), max_age)))
    }

    /// Fail unless a valid ngrok token is stored
    async fn require_setup(&self) -> Result<()> {
        let mut auth = AuthState::new(self.host.clone(), self.service.clone());
        let status = auth.check_auth().await?;
        if !status.is_setup {
            return Err(CoreError::NotSetup.into());
        }
        Ok(())
    }
}

/// A container port picked on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointTarget {
    pub key: EndpointKey,
    pub container_name: String,
}

/// A snapshot older than this means the daemon is gone
fn snapshot_max_age(config: &GlobalConfig) -> Duration {
    config.sync.poll_interval().max(config.sync.reload_interval()) * 3
}

/// Resolve `container` and `port` against the running containers.
///
/// Containers that are gone can still be resolved from the endpoint store so
/// their tunnels can be disabled.
pub async fn resolve_target(
    ctx: &CommandContext,
    container: &str,
    port: u16,
    allow_stored: bool,
) -> Result<EndpointTarget> {
    let containers = ctx.host.list_containers().await?;
    match find_container(&containers, container) {
        Ok(found) => {
            if found.port(port).is_some() {
                return Ok(EndpointTarget {
                    key: EndpointKey::new(found.id.0.clone(), port),
                    container_name: found.name.clone(),
                });
            }
            if found.ports.iter().any(|p| p.port == port) {
                return Err(CoreError::PortNotTunnelable {
                    container: found.name.clone(),
                    port,
                }
                .into());
            }
            Err(CoreError::PortNotFound {
                container: found.name.clone(),
                port,
            }
            .into())
        }
        Err(CoreError::ContainerNotFound(_)) if allow_stored => {
            resolve_stored(&ctx.load_store()?, container, port)
        }
        Err(e) => Err(e.into()),
    }
}

/// Match a stored endpoint by container name, id or id prefix
fn resolve_stored(store: &EndpointStore, container: &str, port: u16) -> Result<EndpointTarget> {
    let query = container.trim().trim_start_matches('/');
    let matches: Vec<_> = store
        .list()
        .into_iter()
        .filter(|c| c.port == port)
        .filter(|c| {
            c.container_name == query
                || (!query.is_empty() && c.container_id.starts_with(query))
        })
        .collect();

    match matches.as_slice() {
        [] => bail!("Container '{}' not found", container),
        [one] => Ok(EndpointTarget {
            key: one.key(),
            container_name: one.container_name.clone(),
        }),
        _ => Err(anyhow!(
            "Ambiguous container reference '{}', it matches {} stored endpoints",
            container,
            matches.len()
        )),
    }
}
