//! Error types for the container host and the tunnel service

use thiserror::Error;

/// Failures talking to the container host (listing, token storage)
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Failed to connect to container runtime: {0}")]
    ConnectionError(String),

    #[error("Container runtime error: {0}")]
    RuntimeError(String),

    #[error("Token storage error: {0}")]
    TokenStorage(String),

    #[error("Cannot open URL: {0}")]
    OpenUrl(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout waiting for operation")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Token validation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The service rejected the token (invalid, expired or revoked)
    #[error("Auth token rejected: {0}")]
    Invalid(String),

    /// The service could not be reached; nothing is known about the token
    #[error("Could not reach the auth service: {0}")]
    Transport(String),
}

/// Classification of tunnel service failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum TunnelErrorKind {
    AuthExpired,
    QuotaExceeded,
    NetworkError,
    ValidationRejectedByService,
    Unknown,
}

impl TunnelErrorKind {
    /// Whether a failure of this kind may go away on its own
    pub fn is_transient(self) -> bool {
        matches!(self, Self::NetworkError | Self::Unknown)
    }
}

impl std::fmt::Display for TunnelErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthExpired => write!(f, "auth expired"),
            Self::QuotaExceeded => write!(f, "quota exceeded"),
            Self::NetworkError => write!(f, "network error"),
            Self::ValidationRejectedByService => write!(f, "rejected by service"),
            Self::Unknown => write!(f, "unknown error"),
        }
    }
}

/// A classified tunnel service failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TunnelError {
    pub kind: TunnelErrorKind,
    pub message: String,
    /// A failed update already took the previous tunnel down
    pub previous_removed: bool,
}

impl TunnelError {
    pub fn new(kind: TunnelErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            previous_removed: false,
        }
    }

    /// Mark an update failure that happened after the old tunnel was stopped
    pub fn with_previous_removed(mut self) -> Self {
        self.previous_removed = true;
        self
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(TunnelErrorKind::NetworkError, message)
    }

    pub fn timeout() -> Self {
        Self::network("timed out waiting for the tunnel service")
    }
}
