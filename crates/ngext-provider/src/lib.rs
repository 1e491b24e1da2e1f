//! Container host and tunnel service interfaces for ngext
//!
//! This crate provides the two external collaborators the sync core talks to:
//! - [`ContainerHost`]: container enumeration, secure token storage, URL opening
//! - [`TunnelService`]: token validation and tunnel create/update/delete
//!
//! plus their production implementations ([`DockerHost`], [`NgrokAgentService`]).

mod agent;
mod browser;
mod detect;
mod docker;
mod error;
mod ngrok;
mod token_store;
mod types;

pub use agent::AgentProcess;
pub use browser::open_in_browser;
pub use detect::detect_scheme_at;
pub use docker::DockerHost;
pub use error::*;
pub use ngrok::NgrokAgentService;
pub use token_store::FileTokenStore;
pub use types::*;

use async_trait::async_trait;
use ngext_config::GlobalConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Trait for the host running the containers (Docker Desktop, a plain engine)
#[async_trait]
pub trait ContainerHost: Send + Sync {
    /// List running containers eligible for tunneling
    async fn list_containers(&self) -> Result<Vec<Container>>;

    /// Open a URL in the user's browser
    async fn open_external(&self, url: &str) -> Result<()>;

    /// Read the stored ngrok auth token
    async fn get_stored_auth_token(&self) -> Result<Option<String>>;

    /// Persist the ngrok auth token, replacing any previous one
    async fn set_stored_auth_token(&self, token: &str) -> Result<()>;

    /// Forget the stored token
    async fn clear_stored_auth_token(&self) -> Result<()>;

    /// Detect the protocol a port speaks ("http", "https" or "tcp"); only
    /// ports published on the host can be checked
    async fn detect_scheme(&self, port: &ExposedPort) -> Option<String> {
        let host_port = port.host_port?;
        detect_scheme_at(&format!("127.0.0.1:{}", host_port), SCHEME_DETECT_TIMEOUT)
            .await
            .map(str::to_string)
    }
}

/// Upper bound on detecting one port's protocol
pub const SCHEME_DETECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Trait for the service that owns the public tunnels
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Check a token with the service
    async fn validate_token(&self, token: &str) -> std::result::Result<(), AuthError>;

    /// Create a tunnel for `spec`
    async fn create_tunnel(&self, spec: &TunnelSpec) -> std::result::Result<TunnelInfo, TunnelError>;

    /// Apply `spec` to an existing tunnel
    async fn update_tunnel(
        &self,
        id: &TunnelId,
        spec: &TunnelSpec,
    ) -> std::result::Result<TunnelInfo, TunnelError>;

    /// Delete a tunnel; deleting an unknown tunnel succeeds
    async fn delete_tunnel(&self, id: &TunnelId) -> std::result::Result<(), TunnelError>;
}

/// File name of the stored auth token inside the data directory
pub const AUTH_TOKEN_FILE: &str = "authtoken";

/// Create the Docker host from global config
pub async fn create_host(config: &GlobalConfig, data_dir: &Path) -> Result<Arc<dyn ContainerHost>> {
    let socket = &config.docker.socket;
    match DockerHost::new(
        socket,
        data_dir.join(AUTH_TOKEN_FILE),
        config.registry.exclude_label.clone(),
    )
    .await
    {
        Ok(host) => Ok(Arc::new(host)),
        Err(e) => {
            let socket_exists = Path::new(socket.trim_start_matches("unix://")).exists();
            Err(ProviderError::ConnectionError(format_connection_error(
                socket,
                socket_exists,
                &e,
            )))
        }
    }
}

/// Create the ngrok tunnel service from global config
pub fn create_tunnel_service(
    config: &GlobalConfig,
) -> std::result::Result<Arc<dyn TunnelService>, TunnelError> {
    let web_addr = config.ngrok.agent_web_addr().ok_or_else(|| {
        TunnelError::new(
            TunnelErrorKind::ValidationRejectedByService,
            format!("invalid ngrok agent API address '{}'", config.ngrok.agent_api),
        )
    })?;
    let agent = AgentProcess::new(
        config.ngrok.agent_binary.clone(),
        web_addr,
        config.sync.call_timeout(),
    );
    let service = NgrokAgentService::new(agent, config.ngrok.agent_api.clone(), config.sync.call_timeout())?;
    Ok(Arc::new(service))
}

/// Format a helpful connection error message with actionable instructions
fn format_connection_error(socket_path: &str, socket_exists: bool, underlying: &ProviderError) -> String {
    let mut msg = String::from("Cannot connect to Docker\n\n");

    if !socket_exists {
        msg.push_str(&format!(
            "The Docker API socket was not found at:\n  {}\n\n",
            socket_path
        ));
        msg.push_str("Start Docker Desktop, or set [docker] socket in the ngext config.\n");
    } else {
        msg.push_str(&format!(
            "The socket exists at {} but the daemon is not responding.\n\n",
            socket_path
        ));
        msg.push_str(&format!("Underlying error: {}\n", underlying));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_missing_socket() {
        let msg = format_connection_error(
            "/nonexistent/docker.sock",
            false,
            &ProviderError::Timeout,
        );
        assert!(msg.contains("/nonexistent/docker.sock"));
        assert!(msg.contains("Start Docker Desktop"));
    }

    #[test]
    fn test_connection_error_unresponsive_daemon() {
        let msg = format_connection_error(
            "/var/run/docker.sock",
            true,
            &ProviderError::ConnectionError("refused".to_string()),
        );
        assert!(msg.contains("not responding"));
        assert!(msg.contains("refused"));
    }

    #[test]
    fn test_create_tunnel_service_from_defaults() {
        let config = GlobalConfig::default();
        assert!(create_tunnel_service(&config).is_ok());
    }
}
