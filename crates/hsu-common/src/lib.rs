//! # HSU Common
//!
//! Types and plumbing shared by the registry server and its clients:
//! error taxonomy, identifiers, addresses, the dynamic [`Value`] type,
//! wire records and messages with their codec, and ZeroMQ socket helpers.

pub mod address;
pub mod duration_serde;
pub mod errors;
pub mod lifecycle;
pub mod records;
pub mod transport;
pub mod types;
pub mod value;
pub mod wire;

// Re-export commonly used items
pub use address::{Address, Transport, DEFAULT_RPC_PORT};
pub use errors::{Error, Result, ResultExt};
pub use lifecycle::StopHandle;
pub use records::{
    AlternateRegistry, DirectorySnapshot, ServerRecord, ServiceRecord, DEFAULT_SERVICE_TYPE,
    DEFAULT_SERVICE_VERSION,
};
pub use types::{ApplicationId, ServerId, ServiceUid};
pub use value::Value;
