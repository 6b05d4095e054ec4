//! Transport-qualified endpoint addresses.
//!
//! # Rust Learning Note
//!
//! An address is **configuration as data**: one enum variant per transport,
//! so code that binds or connects has to handle every transport the
//! messaging layer offers.
//!
//! ```rust
//! use hsu_common::Address;
//!
//! let addr: Address = "tcp://127.0.0.1:5555".parse().unwrap();
//! assert_eq!(addr.port(), Some(5555));
//! assert_eq!(addr.to_string(), "tcp://127.0.0.1:5555");
//! ```
//!
//! Formats:
//! - `tcp://host:port` - networked stream; `tcp://host:*` binds an ephemeral port
//! - `ipc:///path/to/socket` - local socket (Unix only)
//! - `inproc://name` - in-process, requires a shared `zmq::Context`

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default registry request/reply port.
pub const DEFAULT_RPC_PORT: u16 = 5555;

/// Transport part of an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Tcp,
    Ipc,
    Inproc,
}

/// Endpoint address understood by the messaging layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Address {
    /// Reliable networked stream. `port: None` means "any free port".
    Tcp { host: String, port: Option<u16> },

    /// Local socket file.
    Ipc(PathBuf),

    /// In-process endpoint.
    Inproc(String),
}

impl Address {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port: Some(port),
        }
    }

    /// TCP address whose port is picked by the OS at bind time.
    pub fn tcp_ephemeral(host: impl Into<String>) -> Self {
        Self::Tcp {
            host: host.into(),
            port: None,
        }
    }

    pub fn ipc(path: impl Into<PathBuf>) -> Self {
        Self::Ipc(path.into())
    }

    pub fn inproc(name: impl Into<String>) -> Self {
        Self::Inproc(name.into())
    }

    /// Default registry endpoints on `host`: RPC port 5555, publish port 5556.
    pub fn registry_defaults(host: &str) -> (Address, Address) {
        (
            Address::tcp(host, DEFAULT_RPC_PORT),
            Address::tcp(host, DEFAULT_RPC_PORT + 1),
        )
    }

    pub fn transport(&self) -> Transport {
        match self {
            Self::Tcp { .. } => Transport::Tcp,
            Self::Ipc(_) => Transport::Ipc,
            Self::Inproc(_) => Transport::Inproc,
        }
    }

    /// Whether this transport addresses endpoints by port.
    pub fn uses_ports(&self) -> bool {
        matches!(self, Self::Tcp { .. })
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
            _ => None,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Tcp { host, .. } => Some(host),
            _ => None,
        }
    }

    /// Same transport and host with a different port. Non-TCP addresses are
    /// returned unchanged.
    pub fn with_port(&self, port: u16) -> Self {
        match self {
            Self::Tcp { host, .. } => Self::tcp(host.clone(), port),
            other => other.clone(),
        }
    }

    /// Same endpoint reached through a different host name. Non-TCP
    /// addresses are returned unchanged.
    pub fn with_host(&self, new_host: &str) -> Self {
        match self {
            Self::Tcp { port, .. } => Self::Tcp {
                host: new_host.to_string(),
                port: *port,
            },
            other => other.clone(),
        }
    }

    /// True when the host is a bind-all wildcard that peers cannot connect to.
    pub fn is_wildcard_host(&self) -> bool {
        matches!(self, Self::Tcp { host, .. } if host == "*" || host == "0.0.0.0")
    }

    /// Parses a transport address from a string.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("tcp://") {
            let (host, port) = rest
                .rsplit_once(':')
                .ok_or_else(|| Error::validation(format!("TCP address needs a port: {}", s)))?;
            if host.is_empty() {
                return Err(Error::validation(format!("TCP address needs a host: {}", s)));
            }
            let port = match port {
                "*" => None,
                p => Some(
                    p.parse::<u16>()
                        .map_err(|_| Error::validation(format!("Invalid port in address: {}", s)))?,
                ),
            };
            Ok(Self::Tcp {
                host: host.to_string(),
                port,
            })
        } else if let Some(path) = s.strip_prefix("ipc://") {
            if path.is_empty() {
                return Err(Error::validation("ipc address needs a path"));
            }
            Ok(Self::Ipc(PathBuf::from(path)))
        } else if let Some(name) = s.strip_prefix("inproc://") {
            if name.is_empty() {
                return Err(Error::validation("inproc address needs a name"));
            }
            Ok(Self::Inproc(name.to_string()))
        } else {
            Err(Error::validation(format!("Invalid transport address: {}", s)))
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp {
                host,
                port: Some(port),
            } => write!(f, "tcp://{}:{}", host, port),
            Self::Tcp { host, port: None } => write!(f, "tcp://{}:*", host),
            Self::Ipc(path) => write!(f, "ipc://{}", path.display()),
            Self::Inproc(name) => write!(f, "inproc://{}", name),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Address::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Address::parse(&s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp() {
        let addr = Address::parse("tcp://localhost:5555").unwrap();
        assert_eq!(addr, Address::tcp("localhost", 5555));
        assert_eq!(addr.transport(), Transport::Tcp);
        assert!(addr.uses_ports());
    }

    #[test]
    fn test_parse_ephemeral_and_wildcard() {
        let addr = Address::parse("tcp://*:*").unwrap();
        assert_eq!(addr.port(), None);
        assert!(addr.is_wildcard_host());
        assert_eq!(addr.to_string(), "tcp://*:*");
        assert_eq!(addr.with_host("127.0.0.1").with_port(6000).to_string(), "tcp://127.0.0.1:6000");
    }

    #[test]
    fn test_parse_local_transports() {
        let addr = Address::parse("ipc:///tmp/hsu-registry.sock").unwrap();
        assert_eq!(addr, Address::ipc("/tmp/hsu-registry.sock"));
        assert!(!addr.uses_ports());

        let addr = Address::parse("inproc://registry").unwrap();
        assert_eq!(addr.to_string(), "inproc://registry");
        assert_eq!(addr.with_port(1), addr);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Address::parse("http://localhost:80").is_err());
        assert!(Address::parse("tcp://localhost").is_err());
        assert!(Address::parse("tcp://localhost:notaport").is_err());
        assert!(Address::parse("inproc://").is_err());
    }

    #[test]
    fn test_registry_defaults() {
        let (rpc, publish) = Address::registry_defaults("10.0.0.5");
        assert_eq!(rpc.port(), Some(5555));
        assert_eq!(publish.port(), Some(5556));
    }
}
