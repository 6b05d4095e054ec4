//! Registry client configuration.

use anyhow::{anyhow, Context, Result};
use hsu_common::{Address, ServiceUid, DEFAULT_RPC_PORT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Host advertised in place of a wildcard bind when none is configured.
pub(crate) const LOOPBACK: &str = "127.0.0.1";

/// How a registered service binds its RPC and publish endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum ServiceBinding {
    /// TCP on `host`. With `first_port`, ports are tried upward from it;
    /// without, the OS picks them.
    Tcp {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_port: Option<u16>,
    },
    /// Unix domain sockets inside `dir`, named after the service uid.
    Ipc { dir: PathBuf },
    /// In-process endpoints; only reachable through the same ZeroMQ context.
    Inproc { prefix: String },
}

impl Default for ServiceBinding {
    fn default() -> Self {
        Self::Tcp {
            host: LOOPBACK.to_string(),
            first_port: None,
        }
    }
}

impl ServiceBinding {
    /// First RPC and publish endpoints to try for `uid`.
    pub fn endpoints(&self, uid: &ServiceUid) -> (Address, Address) {
        match self {
            Self::Tcp {
                host,
                first_port: Some(port),
            } => (
                Address::tcp(host.clone(), *port),
                Address::tcp(host.clone(), port.saturating_add(1)),
            ),
            Self::Tcp {
                host,
                first_port: None,
            } => (Address::tcp_ephemeral(host.clone()), Address::tcp_ephemeral(host.clone())),
            Self::Ipc { dir } => {
                let stem = file_stem(uid);
                (
                    Address::ipc(dir.join(format!("{}.rpc.sock", stem))),
                    Address::ipc(dir.join(format!("{}.pub.sock", stem))),
                )
            }
            Self::Inproc { prefix } => (
                Address::inproc(format!("{}/{}/rpc", prefix, uid)),
                Address::inproc(format!("{}/{}/pub", prefix, uid)),
            ),
        }
    }
}

/// Uid reduced to characters that are safe in a socket file name.
fn file_stem(uid: &ServiceUid) -> String {
    uid.as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Configuration of one [`RegistryClient`](crate::RegistryClient).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Registry to connect to first.
    #[serde(default = "default_registry_rpc")]
    pub registry_rpc: Address,

    #[serde(default = "default_registry_publish")]
    pub registry_publish: Address,

    #[serde(default)]
    pub binding: ServiceBinding,

    /// Host name other processes should use to reach this process's services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,

    /// Ports tried per endpoint when binding a fixed TCP port range.
    #[serde(default = "default_max_bind_attempts")]
    pub max_bind_attempts: u16,

    /// Bound on every registry round trip, heartbeats included.
    #[serde(default = "default_request_timeout", with = "hsu_common::duration_serde")]
    pub request_timeout: Duration,

    /// Timeout of [`ServiceProxy::call`](crate::ServiceProxy::call), in
    /// milliseconds. Zero or negative waits forever.
    #[serde(default = "default_call_timeout_ms")]
    pub default_call_timeout_ms: i64,

    /// Interval between reconciling live proxies against the registry.
    #[serde(default = "default_proxy_refresh_interval", with = "hsu_common::duration_serde")]
    pub proxy_refresh_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            registry_rpc: default_registry_rpc(),
            registry_publish: default_registry_publish(),
            binding: ServiceBinding::default(),
            advertise_host: None,
            max_bind_attempts: default_max_bind_attempts(),
            request_timeout: default_request_timeout(),
            default_call_timeout_ms: default_call_timeout_ms(),
            proxy_refresh_interval: default_proxy_refresh_interval(),
        }
    }
}

impl ClientConfig {
    /// Defaults pointed at a specific registry.
    pub fn for_registry(registry_rpc: Address, registry_publish: Address) -> Self {
        Self {
            registry_rpc,
            registry_publish,
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
        let config: ClientConfig =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registry_rpc.is_wildcard_host() || self.registry_publish.is_wildcard_host() {
            return Err(anyhow!(
                "Registry addresses must name a reachable host, got {} / {}",
                self.registry_rpc,
                self.registry_publish
            ));
        }

        if self.max_bind_attempts == 0 {
            return Err(anyhow!("Max bind attempts must be greater than 0"));
        }

        if self.request_timeout.is_zero() {
            return Err(anyhow!("Request timeout must be greater than 0"));
        }

        if self.proxy_refresh_interval.is_zero() {
            return Err(anyhow!("Proxy refresh interval must be greater than 0"));
        }

        match self.binding {
            ServiceBinding::Tcp { ref host, .. } if host.is_empty() => {
                Err(anyhow!("Service binding host cannot be empty"))
            }
            ServiceBinding::Inproc { ref prefix } if prefix.is_empty() => {
                Err(anyhow!("Inproc binding prefix cannot be empty"))
            }
            _ => Ok(()),
        }
    }
}

fn default_registry_rpc() -> Address {
    Address::tcp(LOOPBACK, DEFAULT_RPC_PORT)
}

fn default_registry_publish() -> Address {
    Address::tcp(LOOPBACK, DEFAULT_RPC_PORT + 1)
}

fn default_max_bind_attempts() -> u16 {
    32
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_call_timeout_ms() -> i64 {
    5000
}

fn default_proxy_refresh_interval() -> Duration {
    Duration::from_secs(10)
}
