//! # HSU Service Registry
//!
//! Replicated service registry for the HSU framework.
//!
//! This crate provides:
//! - The service directory with liveness-based eviction
//! - Server pool membership and pool-wide id allocation
//! - The ZeroMQ registry server tying both to the wire protocol
//! - Standalone server executable (`hsu-registry`)

pub mod config;
pub mod directory;
pub mod endpoint;
pub mod peers;
pub mod pool;
pub mod reservation;
pub mod server;

// Re-export commonly used items
pub use config::{JoinConfig, RegistryConfig};
pub use directory::{ApplicationHandle, Directory, DirectoryEvent, MergeOutcome};
pub use pool::{InboundPool, PeerLink, PoolState, PoolTiming, ServerPool};
pub use server::RegistryServer;
