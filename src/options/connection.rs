use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ConnectionMode {
    #[default]
    Direct,
    Gateway,
}

/// Settings of the direct (replica) transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectConnectionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_idle_endpoint_timeout_ms")]
    pub idle_endpoint_timeout_ms: u64,
    /// 0 = connections are never closed for idleness
    #[serde(default)]
    pub idle_connection_timeout_ms: u64,
    #[serde(default = "default_max_connections_per_endpoint")]
    pub max_connections_per_endpoint: u32,
    #[serde(default = "default_max_requests_per_connection")]
    pub max_requests_per_connection: u32,
    #[serde(default = "default_network_request_timeout_ms")]
    pub network_request_timeout_ms: u64,
}

impl Default for DirectConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            idle_endpoint_timeout_ms: default_idle_endpoint_timeout_ms(),
            idle_connection_timeout_ms: 0,
            max_connections_per_endpoint: default_max_connections_per_endpoint(),
            max_requests_per_connection: default_max_requests_per_connection(),
            network_request_timeout_ms: default_network_request_timeout_ms(),
        }
    }
}

/// Settings of the HTTP gateway transport.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct GatewayConnectionConfig {
    #[serde(default = "default_max_connection_pool_size")]
    pub max_connection_pool_size: u32,
    #[serde(default = "default_gateway_idle_connection_timeout_ms")]
    pub idle_connection_timeout_ms: u64,
    #[serde(default = "default_gateway_request_timeout_ms")]
    pub network_request_timeout_ms: u64,
}

impl Default for GatewayConnectionConfig {
    fn default() -> Self {
        Self {
            max_connection_pool_size: default_max_connection_pool_size(),
            idle_connection_timeout_ms: default_gateway_idle_connection_timeout_ms(),
            network_request_timeout_ms: default_gateway_request_timeout_ms(),
        }
    }
}

/// Transport settings of a client.
///
/// Built from a direct or a gateway configuration; the gateway settings are
/// kept in both cases because metadata requests always use the gateway.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectionPolicy {
    #[serde(default)]
    pub connection_mode: ConnectionMode,
    #[serde(default)]
    pub direct: DirectConnectionConfig,
    #[serde(default)]
    pub gateway: GatewayConnectionConfig,
    #[serde(default = "default_true")]
    pub endpoint_discovery_enabled: bool,
    #[serde(default = "default_true")]
    pub multiple_write_regions_enabled: bool,
    #[serde(default = "default_true")]
    pub read_requests_fallback_enabled: bool,
    #[serde(default)]
    pub preferred_regions: Vec<String>,
    #[serde(default)]
    pub excluded_regions: Vec<String>,
    #[serde(default)]
    pub user_agent_suffix: String,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl ConnectionPolicy {
    /// A fresh policy with direct mode defaults.
    pub fn default_policy() -> Self {
        Self::from_direct(DirectConnectionConfig::default())
    }

    pub fn from_direct(direct: DirectConnectionConfig) -> Self {
        Self {
            connection_mode: ConnectionMode::Direct,
            direct,
            gateway: GatewayConnectionConfig::default(),
            endpoint_discovery_enabled: true,
            multiple_write_regions_enabled: true,
            read_requests_fallback_enabled: true,
            preferred_regions: Vec::new(),
            excluded_regions: Vec::new(),
            user_agent_suffix: String::new(),
        }
    }

    pub fn from_gateway(gateway: GatewayConnectionConfig) -> Self {
        Self {
            connection_mode: ConnectionMode::Gateway,
            gateway,
            ..Self::from_direct(DirectConnectionConfig::default())
        }
    }

    pub fn with_preferred_regions(
        mut self,
        regions: Vec<String>,
    ) -> Self {
        self.preferred_regions = regions;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.direct.max_connections_per_endpoint == 0 || self.direct.max_requests_per_connection == 0 {
            return Err(Error::Config(ConfigError::Message(
                "direct connection limits must be greater than 0".into(),
            )));
        }
        if self.gateway.max_connection_pool_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "gateway max_connection_pool_size must be greater than 0".into(),
            )));
        }
        if let Some(region) = self
            .excluded_regions
            .iter()
            .find(|r| self.preferred_regions.contains(r))
        {
            return Err(Error::Config(ConfigError::Message(format!(
                "region {region} is both preferred and excluded"
            ))));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_idle_endpoint_timeout_ms() -> u64 {
    3_600_000
}
fn default_max_connections_per_endpoint() -> u32 {
    130
}
fn default_max_requests_per_connection() -> u32 {
    30
}
fn default_network_request_timeout_ms() -> u64 {
    5_000
}
fn default_max_connection_pool_size() -> u32 {
    1_000
}
fn default_gateway_idle_connection_timeout_ms() -> u64 {
    60_000
}
fn default_gateway_request_timeout_ms() -> u64 {
    60_000
}
