//! Error types for ngext-core

use crate::{AuthCheckError, AuthSetupError, ValidationErrors};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] ngext_config::ConfigError),

    #[error("Host error: {0}")]
    Provider(#[from] ngext_provider::ProviderError),

    #[error("{0}")]
    Validation(#[from] ValidationErrors),

    #[error("ngrok is not set up; run `ngext setup` first")]
    NotSetup,

    #[error("Auth setup failed: {0}")]
    AuthSetup(#[from] AuthSetupError),

    #[error("Auth check failed: {0}")]
    AuthCheck(#[from] AuthCheckError),

    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    #[error("Container name is ambiguous: {0}")]
    AmbiguousContainer(String),

    #[error("Container {container} does not expose port {port}")]
    PortNotFound { container: String, port: u16 },

    #[error("Port {port} of {container} is not a TCP port and cannot be tunneled")]
    PortNotTunnelable { container: String, port: u16 },

    #[error("Endpoint {0} has no active tunnel")]
    NotActive(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
