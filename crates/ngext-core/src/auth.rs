//! ngrok auth state
//!
//! `AuthState` owns the process-wide "is ngrok set up" flag. It only becomes
//! true after the service confirmed a token, and only drops back to false when
//! the stored token disappears or the service rejects it.

use ngext_provider::{AuthError, ContainerHost, ProviderError, TunnelService};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub is_setup: bool,
    pub has_token: bool,
}

/// Auth could not be checked; the previous status still applies
#[derive(Error, Debug)]
pub enum AuthCheckError {
    #[error("cannot read stored token: {0}")]
    Host(#[from] ProviderError),

    #[error("cannot reach ngrok: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug)]
pub enum AuthSetupError {
    #[error("auth token is empty")]
    EmptyToken,

    #[error("ngrok rejected the token: {0}")]
    Rejected(String),

    #[error("cannot reach ngrok: {0}")]
    Unreachable(String),

    #[error("cannot store the token: {0}")]
    Storage(#[from] ProviderError),
}

pub struct AuthState {
    host: Arc<dyn ContainerHost>,
    service: Arc<dyn TunnelService>,
    status: AuthStatus,
    last_error: Option<String>,
    /// Token the service last accepted
    validated: Option<String>,
}

impl AuthState {
    pub fn new(host: Arc<dyn ContainerHost>, service: Arc<dyn TunnelService>) -> Self {
        Self {
            host,
            service,
            status: AuthStatus::default(),
            last_error: None,
            validated: None,
        }
    }

    pub fn status(&self) -> AuthStatus {
        self.status
    }

    pub fn is_setup(&self) -> bool {
        self.status.is_setup
    }

    /// Message of the last failed check or setup, cleared on success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Re-read the stored token and validate it with the service.
    ///
    /// A transport failure leaves the current status untouched and returns
    /// the error; a missing or rejected token flips `is_setup` to false.
    pub async fn check_auth(&mut self) -> Result<AuthStatus, AuthCheckError> {
        let token = match self.host.get_stored_auth_token().await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Auth check could not read the stored token: {}", e);
                self.last_error = Some(e.to_string());
                return Err(e.into());
            }
        };

        let Some(token) = token else {
            if self.status.is_setup {
                tracing::info!("Stored auth token is gone, returning to setup");
            }
            self.status = AuthStatus {
                is_setup: false,
                has_token: false,
            };
            self.last_error = None;
            self.validated = None;
            return Ok(self.status);
        };

        match self.service.validate_token(&token).await {
            Ok(()) => {
                self.status = AuthStatus {
                    is_setup: true,
                    has_token: true,
                };
                self.last_error = None;
                self.validated = Some(token);
            }
            Err(AuthError::Invalid(msg)) => {
                tracing::warn!("Stored auth token was rejected: {}", msg);
                self.validated = None;
                self.status = AuthStatus {
                    is_setup: false,
                    has_token: true,
                };
                self.last_error = Some(format!("ngrok rejected the stored token: {}", msg));
            }
            Err(AuthError::Transport(msg)) => {
                tracing::warn!("Auth check failed, keeping last known status: {}", msg);
                self.last_error = Some(msg.clone());
                return Err(AuthCheckError::Unreachable(msg));
            }
        }

        Ok(self.status)
    }

    /// Validate `token`, store it, and mark auth as set up.
    pub async fn complete_setup(&mut self, token: &str) -> Result<(), AuthSetupError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthSetupError::EmptyToken);
        }

        if self.status.is_setup {
            let stored = self.host.get_stored_auth_token().await?;
            if stored.as_deref() == Some(token) {
                tracing::debug!("Auth token already set up, nothing to do");
                return Ok(());
            }
        }

        match self.service.validate_token(token).await {
            Ok(()) => {}
            Err(AuthError::Invalid(msg)) => {
                self.last_error = Some(msg.clone());
                return Err(AuthSetupError::Rejected(msg));
            }
            Err(AuthError::Transport(msg)) => {
                self.last_error = Some(msg.clone());
                return Err(AuthSetupError::Unreachable(msg));
            }
        }

        self.host.set_stored_auth_token(token).await?;
        self.status = AuthStatus {
            is_setup: true,
            has_token: true,
        };
        self.last_error = None;
        self.validated = Some(token.to_string());
        tracing::info!("ngrok auth token configured");
        Ok(())
    }

    /// Forget the stored token (explicit sign-out)
    pub async fn reset(&mut self) -> Result<(), ProviderError> {
        self.host.clear_stored_auth_token().await?;
        self.status = AuthStatus::default();
        self.last_error = None;
        self.validated = None;
        Ok(())
    }

    /// Whether the stored token is no longer the one the service accepted.
    ///
    /// Only reads local storage; a read failure counts as unchanged.
    pub async fn token_changed(&self) -> bool {
        match self.host.get_stored_auth_token().await {
            Ok(stored) => stored != self.validated,
            Err(e) => {
                tracing::debug!("Could not read the stored token: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockCall, MockHost, MockTunnelService};

    fn auth_with(host: &Arc<MockHost>, service: &Arc<MockTunnelService>) -> AuthState {
        AuthState::new(host.clone(), service.clone())
    }

    #[tokio::test]
    async fn test_check_without_token_is_not_setup() {
        let host = Arc::new(MockHost::new());
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);

        let status = auth.check_auth().await.unwrap();
        assert!(!status.is_setup);
        assert!(!status.has_token);
        // No token, nothing to validate
        assert!(service.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_check_with_valid_token() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);

        assert!(auth.check_auth().await.unwrap().is_setup);
        assert!(service.was_called(&MockCall::ValidateToken {
            token: "tok".to_string()
        }));
    }

    #[tokio::test]
    async fn test_transport_failure_keeps_last_status() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        auth.check_auth().await.unwrap();
        assert!(auth.is_setup());

        service.set_validate_result(Err(AuthError::Transport("dns failure".to_string())));
        let err = auth.check_auth().await.unwrap_err();
        assert!(matches!(err, AuthCheckError::Unreachable(_)));
        assert!(auth.is_setup(), "transport errors must not clear setup");
        assert_eq!(auth.last_error(), Some("dns failure"));
    }

    #[tokio::test]
    async fn test_revoked_token_flips_back() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        auth.check_auth().await.unwrap();

        service.set_validate_result(Err(AuthError::Invalid("revoked".to_string())));
        let status = auth.check_auth().await.unwrap();
        assert!(!status.is_setup);
        assert!(status.has_token);
    }

    #[tokio::test]
    async fn test_host_failure_keeps_last_status() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        auth.check_auth().await.unwrap();

        host.set_token_read_error(Some("keychain locked".to_string()));
        assert!(matches!(
            auth.check_auth().await,
            Err(AuthCheckError::Host(_))
        ));
        assert!(auth.is_setup());
    }

    #[tokio::test]
    async fn test_setup_stores_token_on_success() {
        let host = Arc::new(MockHost::new());
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);

        auth.complete_setup("  tok  ").await.unwrap();
        assert!(auth.is_setup());
        assert_eq!(host.stored_token().as_deref(), Some("tok"));
        assert_eq!(host.token_writes(), 1);
    }

    #[tokio::test]
    async fn test_setup_rejected_token_not_stored() {
        let host = Arc::new(MockHost::new());
        let service = Arc::new(MockTunnelService::new());
        service.set_validate_result(Err(AuthError::Invalid("bad token".to_string())));
        let mut auth = auth_with(&host, &service);

        let err = auth.complete_setup("tok").await.unwrap_err();
        assert!(matches!(err, AuthSetupError::Rejected(_)));
        assert!(!auth.is_setup());
        assert_eq!(host.stored_token(), None);
        assert_eq!(host.token_writes(), 0);
    }

    #[tokio::test]
    async fn test_setup_empty_token() {
        let host = Arc::new(MockHost::new());
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        assert!(matches!(
            auth.complete_setup("   ").await,
            Err(AuthSetupError::EmptyToken)
        ));
        assert!(service.get_calls().is_empty());
    }

    #[tokio::test]
    async fn test_setup_same_token_is_noop() {
        let host = Arc::new(MockHost::new());
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);

        auth.complete_setup("tok").await.unwrap();
        let calls_after_first = service.get_calls().len();

        auth.complete_setup("tok").await.unwrap();
        assert!(auth.is_setup());
        assert_eq!(host.token_writes(), 1, "no duplicate token write");
        assert_eq!(service.get_calls().len(), calls_after_first);
    }

    #[tokio::test]
    async fn test_reset_clears_token() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        auth.check_auth().await.unwrap();

        auth.reset().await.unwrap();
        assert!(!auth.is_setup());
        assert_eq!(host.stored_token(), None);
    }

    #[tokio::test]
    async fn test_token_changed_tracks_storage() {
        let host = Arc::new(MockHost::new().with_token("tok"));
        let service = Arc::new(MockTunnelService::new());
        let mut auth = auth_with(&host, &service);
        assert!(auth.token_changed().await, "nothing validated yet");

        auth.check_auth().await.unwrap();
        assert!(!auth.token_changed().await);
        let validations = service.get_calls().len();

        host.remove_token();
        assert!(auth.token_changed().await);
        // Only local storage was read
        assert_eq!(service.get_calls().len(), validations);

        host.set_token_read_error(Some("keychain locked".to_string()));
        assert!(!auth.token_changed().await);
    }
}
