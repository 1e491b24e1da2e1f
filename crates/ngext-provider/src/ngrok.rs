//! Tunnel service backed by the ngrok agent's local API
//!
//! The agent is supervised by [`AgentProcess`]: tokens are checked by opening
//! a session with them, and tunnels are started and stopped through
//! `/api/tunnels` on the agent this process runs. The agent has no in-place
//! update, so an update replaces the tunnel definition under the same name.

use crate::agent::{AgentProcess, StartError};
use crate::{
    AuthError, TunnelError, TunnelErrorKind, TunnelId, TunnelInfo, TunnelService, TunnelSpec,
    TunnelStatus,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub struct NgrokAgentService {
    client: reqwest::Client,
    agent_api: String,
    agent: AgentProcess,
}

/// Tunnel definition accepted by `POST /api/tunnels`
#[derive(Debug, Serialize)]
struct StartTunnelRequest<'a> {
    name: &'a str,
    proto: &'a str,
    addr: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    description: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    metadata: &'a str,
    pooling_enabled: bool,
}

fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

#[derive(Debug, Deserialize)]
struct AgentTunnel {
    name: String,
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct AgentErrorBody {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: Option<serde_json::Value>,
}

impl NgrokAgentService {
    /// Service talking to `agent_api`, where `agent` serves its local API
    pub fn new(
        agent: AgentProcess,
        agent_api: impl Into<String>,
        timeout: Duration,
    ) -> std::result::Result<Self, TunnelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TunnelError::new(TunnelErrorKind::Unknown, e.to_string()))?;
        Ok(Self {
            client,
            agent_api: agent_api.into().trim_end_matches('/').to_string(),
            agent,
        })
    }

    fn tunnels_url(&self) -> String {
        format!("{}/api/tunnels", self.agent_api)
    }

    async fn ensure_agent(&self) -> std::result::Result<(), TunnelError> {
        self.agent.ensure_serving().await.map_err(|e| match e {
            StartError::Rejected(msg) => TunnelError::new(TunnelErrorKind::AuthExpired, msg),
            StartError::Failed(msg) => TunnelError::network(msg),
        })
    }

    async fn start(&self, spec: &TunnelSpec) -> std::result::Result<TunnelInfo, TunnelError> {
        self.ensure_agent().await?;
        let (proto, addr) = start_request(spec);
        let body = StartTunnelRequest {
            name: &spec.name,
            proto,
            addr: &addr,
            description: &spec.description,
            metadata: &spec.metadata,
            pooling_enabled: spec.pooling_enabled,
        };

        let resp = self
            .client
            .post(self.tunnels_url())
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }

        let tunnel: AgentTunnel = resp.json().await.map_err(request_error)?;
        tracing::debug!("Agent started tunnel {} at {}", tunnel.name, tunnel.public_url);
        Ok(TunnelInfo {
            id: TunnelId::new(tunnel.name),
            url: tunnel.public_url,
            status: TunnelStatus::Active,
        })
    }

    async fn stop(&self, id: &TunnelId) -> std::result::Result<(), TunnelError> {
        // Tunnels live and die with the agent that started them
        if !self.agent.is_serving().await {
            tracing::debug!("No ngrok agent running, tunnel {} is already gone", id);
            return Ok(());
        }
        let resp = self
            .client
            .delete(format!("{}/{}", self.tunnels_url(), id.0))
            .send()
            .await
            .map_err(request_error)?;

        let status = resp.status();
        // Already gone counts as deleted
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(classify_failure(status, &text))
    }
}

#[async_trait]
impl TunnelService for NgrokAgentService {
    async fn validate_token(&self, token: &str) -> std::result::Result<(), AuthError> {
        self.agent.check_token(token).await
    }

    async fn create_tunnel(&self, spec: &TunnelSpec) -> std::result::Result<TunnelInfo, TunnelError> {
        self.start(spec).await
    }

    async fn update_tunnel(
        &self,
        id: &TunnelId,
        spec: &TunnelSpec,
    ) -> std::result::Result<TunnelInfo, TunnelError> {
        self.stop(id).await?;
        self.start(spec)
            .await
            .map_err(TunnelError::with_previous_removed)
    }

    async fn delete_tunnel(&self, id: &TunnelId) -> std::result::Result<(), TunnelError> {
        self.stop(id).await
    }
}

/// Agent protocol and address for a spec; https upstreams are named explicitly
fn start_request(spec: &TunnelSpec) -> (&'static str, String) {
    match spec.scheme.as_str() {
        "tcp" => ("tcp", spec.upstream.clone()),
        "https" => ("http", format!("https://{}", spec.upstream)),
        _ => ("http", spec.upstream.clone()),
    }
}

fn request_error(e: reqwest::Error) -> TunnelError {
    if e.is_timeout() {
        TunnelError::timeout()
    } else if e.is_connect() {
        TunnelError::network(format!("ngrok agent unreachable: {}", e))
    } else if e.is_decode() {
        TunnelError::new(TunnelErrorKind::Unknown, format!("bad agent response: {}", e))
    } else {
        TunnelError::network(e.to_string())
    }
}

fn error_message(body: &str) -> String {
    match serde_json::from_str::<AgentErrorBody>(body) {
        Ok(err) => match err.details.as_ref().and_then(|d| d.get("err")).and_then(|e| e.as_str()) {
            Some(detail) if !detail.is_empty() => format!("{}: {}", err.msg, detail),
            _ => err.msg,
        },
        Err(_) => body.trim().to_string(),
    }
}

/// Classify a non-success agent response
pub(crate) fn classify_failure(status: StatusCode, body: &str) -> TunnelError {
    let message = error_message(body);
    let lowered = message.to_lowercase();

    // ngrok reports account limits and auth problems with ERR_NGROK codes,
    // sometimes behind a generic 4xx/5xx
    let kind = if lowered.contains("err_ngrok_4018")
        || lowered.contains("err_ngrok_105")
        || lowered.contains("authtoken")
    {
        TunnelErrorKind::AuthExpired
    } else if lowered.contains("err_ngrok_108") || lowered.contains("limit") {
        TunnelErrorKind::QuotaExceeded
    } else {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TunnelErrorKind::AuthExpired,
            StatusCode::PAYMENT_REQUIRED | StatusCode::TOO_MANY_REQUESTS => {
                TunnelErrorKind::QuotaExceeded
            }
            StatusCode::BAD_REQUEST
            | StatusCode::NOT_FOUND
            | StatusCode::CONFLICT
            | StatusCode::UNPROCESSABLE_ENTITY => TunnelErrorKind::ValidationRejectedByService,
            StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => TunnelErrorKind::NetworkError,
            _ => TunnelErrorKind::Unknown,
        }
    };

    let message = if message.is_empty() {
        format!("agent returned {}", status)
    } else {
        message
    };
    TunnelError::new(kind, message)
}
