//! Common types shared by the host, the tunnel service and the core

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Container ID wrapper
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(pub String);

impl ContainerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn short(&self) -> &str {
        if self.0.len() > 12 {
            &self.0[..12]
        } else {
            &self.0
        }
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Transport protocol of an exposed port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for PortProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// A port exposed by a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExposedPort {
    /// Port inside the container
    pub port: u16,
    pub protocol: PortProtocol,
    /// Port published on the host, if any
    pub host_port: Option<u16>,
}

impl ExposedPort {
    pub fn tcp(port: u16) -> Self {
        Self {
            port,
            protocol: PortProtocol::Tcp,
            host_port: None,
        }
    }

    /// ngrok only forwards stream traffic
    pub fn is_tunnelable(&self) -> bool {
        self.protocol == PortProtocol::Tcp
    }
}

/// A running container as reported by the host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub name: String,
    pub image: String,
    /// Ordered by (port, protocol)
    pub ports: Vec<ExposedPort>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

impl Container {
    pub fn port(&self, port: u16) -> Option<&ExposedPort> {
        self.ports
            .iter()
            .find(|p| p.port == port && p.is_tunnelable())
    }
}

/// Stable identity of one logical tunnel: a container port
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    pub container_id: ContainerId,
    pub port: u16,
}

impl EndpointKey {
    pub fn new(container_id: impl Into<String>, port: u16) -> Self {
        Self {
            container_id: ContainerId::new(container_id),
            port,
        }
    }

    /// Tunnel name used with the tunnel service
    pub fn tunnel_name(&self) -> String {
        format!("ngext-{}-{}", self.container_id.short(), self.port)
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.container_id.short(), self.port)
    }
}

/// Tunnel configuration the reconciler wants to exist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelSpec {
    pub key: EndpointKey,
    /// Tunnel name, stable per key
    pub name: String,
    /// Upstream address (`host:port`)
    pub upstream: String,
    /// "http", "https" or "tcp"
    pub scheme: String,
    pub pooling_enabled: bool,
    pub description: String,
    pub metadata: String,
}

/// Tunnel ID as issued by the service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TunnelId(pub String);

impl TunnelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for TunnelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tunnel status as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    Starting,
    Active,
    Error,
    Stopped,
}

impl std::fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Active => write!(f, "active"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Service response for a created or updated tunnel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInfo {
    pub id: TunnelId,
    pub url: String,
    pub status: TunnelStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_key_display_and_name() {
        let key = EndpointKey::new("0123456789abcdef0123", 8080);
        assert_eq!(key.to_string(), "0123456789ab:8080");
        assert_eq!(key.tunnel_name(), "ngext-0123456789ab-8080");
    }

    #[test]
    fn test_container_port_lookup_skips_udp() {
        let container = Container {
            id: ContainerId::new("abc"),
            name: "dns".to_string(),
            image: "coredns".to_string(),
            ports: vec![
                ExposedPort {
                    port: 53,
                    protocol: PortProtocol::Udp,
                    host_port: Some(53),
                },
                ExposedPort::tcp(8080),
            ],
            labels: HashMap::new(),
        };
        assert!(container.port(53).is_none());
        assert_eq!(container.port(8080).map(|p| p.port), Some(8080));
    }
}
