//! Registry server configuration.
//!
//! Loaded from YAML, for example:
//!
//! ```yaml
//! rpc_address: "tcp://*:5555"
//! publish_address: "tcp://*:5556"
//! advertise_host: "10.0.0.5"
//! application_timeout: 5s
//! server_timeout: 5s
//! full_sync_interval: 10s
//! join:
//!   rpc_address: "tcp://10.0.0.4:5555"
//!   publish_address: "tcp://10.0.0.4:5556"
//! ```

use crate::pool::PoolTiming;
use anyhow::{Context, Result};
use hsu_common::{Address, DEFAULT_RPC_PORT};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub mod validation;

/// Top-level registry server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Request/reply endpoint to bind.
    #[serde(default = "default_rpc_address")]
    pub rpc_address: Address,

    /// Publish endpoint to bind.
    #[serde(default = "default_publish_address")]
    pub publish_address: Address,

    /// Host name clients and peers should use to reach this server.
    /// Needed when binding a wildcard host on a multi-host deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Client silence after which an application is evicted.
    #[serde(default = "default_timeout", with = "hsu_common::duration_serde")]
    pub application_timeout: Duration,

    /// Peer silence after which a replica is evicted.
    #[serde(default = "default_timeout", with = "hsu_common::duration_serde")]
    pub server_timeout: Duration,

    #[serde(default = "default_full_sync_interval", with = "hsu_common::duration_serde")]
    pub full_sync_interval: Duration,

    /// Bound on every server-to-server round trip, including the join.
    #[serde(default = "default_request_timeout", with = "hsu_common::duration_serde")]
    pub request_timeout: Duration,

    #[serde(default = "default_reservation_ttl", with = "hsu_common::duration_serde")]
    pub reservation_ttl: Duration,

    #[serde(default = "default_max_proposal_rounds")]
    pub max_proposal_rounds: u32,

    /// Existing pool member to join at startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinConfig>,
}

/// Where to reach a member of the pool to join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinConfig {
    pub rpc_address: Address,
    pub publish_address: Address,
}

impl JoinConfig {
    /// Member reached on its RPC address, publishing on the next port.
    pub fn from_rpc(rpc_address: Address) -> Self {
        let publish_address = match rpc_address.port() {
            Some(port) => rpc_address.with_port(port.saturating_add(1)),
            None => rpc_address.clone(),
        };
        Self {
            rpc_address,
            publish_address,
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            rpc_address: default_rpc_address(),
            publish_address: default_publish_address(),
            advertise_host: None,
            application_timeout: default_timeout(),
            server_timeout: default_timeout(),
            full_sync_interval: default_full_sync_interval(),
            request_timeout: default_request_timeout(),
            reservation_ttl: default_reservation_ttl(),
            max_proposal_rounds: default_max_proposal_rounds(),
            join: None,
        }
    }
}

impl RegistryConfig {
    /// Binds both endpoints on `host` with OS-assigned ports.
    pub fn ephemeral(host: &str) -> Self {
        Self {
            rpc_address: Address::tcp_ephemeral(host),
            publish_address: Address::tcp_ephemeral(host),
            ..Self::default()
        }
    }

    /// Binds `host:rpc_port` and `host:rpc_port+1`.
    pub fn on_ports(host: &str, rpc_port: u16) -> Self {
        Self {
            rpc_address: Address::tcp(host, rpc_port),
            publish_address: Address::tcp(host, rpc_port.saturating_add(1)),
            ..Self::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        Self::load_from_string(&content)
    }

    /// Load configuration from a YAML string
    pub fn load_from_string(content: &str) -> Result<Self> {
        let config: RegistryConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }

    pub fn pool_timing(&self) -> PoolTiming {
        PoolTiming {
            server_timeout: self.server_timeout,
            full_sync_interval: self.full_sync_interval,
            reservation_ttl: self.reservation_ttl,
            max_proposal_rounds: self.max_proposal_rounds,
            ..PoolTiming::default()
        }
    }

    /// Heartbeat interval handed to clients: three beats per timeout window.
    pub fn heartbeat_interval(&self) -> Duration {
        self.application_timeout / 3
    }
}

fn default_rpc_address() -> Address {
    Address::tcp("*", DEFAULT_RPC_PORT)
}

fn default_publish_address() -> Address {
    Address::tcp("*", DEFAULT_RPC_PORT + 1)
}

fn default_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_full_sync_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_reservation_ttl() -> Duration {
    Duration::from_secs(10)
}

fn default_max_proposal_rounds() -> u32 {
    64
}
