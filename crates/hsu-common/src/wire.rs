//! Wire messages and their binary codec.
//!
//! # Rust Learning Note
//!
//! Every message family is a plain serde enum. The codec is `bincode` with
//! varint integer encoding, which writes an enum discriminant below 251 as a
//! single byte. So the first byte of every frame *is* the message tag, and a
//! nested enum (like [`PoolRequest`] inside [`RegistryRequest::ServerPool`])
//! contributes a second, sub-tag byte:
//!
//! ```text
//! RegistryRequest::Pulse { application: 9 }      => [05, 09]
//! RegistryRequest::ServerPool(ReserveServerUid)  => [06, 01, ...]
//! ```
//!
//! Variant order is therefore part of the protocol: append new variants,
//! never reorder.

use crate::errors::{Error, Result};
use crate::records::{AlternateRegistry, DirectorySnapshot, ServerRecord, ServiceRecord};
use crate::types::{ApplicationId, ServerId, ServiceUid};
use crate::value::Value;
use crate::Address;
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Largest frame the decoder will accept.
pub const MAX_FRAME_BYTES: u64 = 16 * 1024 * 1024;

/// Client to registry (and registry to registry) commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryRequest {
    RegisterApplication,
    RegisterService {
        application: ApplicationId,
        record: ServiceRecord,
    },
    UnregisterService {
        uid: ServiceUid,
    },
    FindByUid {
        uid: ServiceUid,
    },
    FindByType {
        service_type: String,
    },
    Pulse {
        application: ApplicationId,
    },
    ServerPool(PoolRequest),
}

impl RegistryRequest {
    /// Message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::RegisterApplication => "RegisterApplication",
            Self::RegisterService { .. } => "RegisterService",
            Self::UnregisterService { .. } => "UnregisterService",
            Self::FindByUid { .. } => "FindByUid",
            Self::FindByType { .. } => "FindByType",
            Self::Pulse { .. } => "Pulse",
            Self::ServerPool(pool) => pool.name(),
        }
    }
}

/// Server-to-server requests, carried inside [`RegistryRequest::ServerPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolRequest {
    /// A new server asks a member for a global id.
    RequestServerUid {
        /// Where the joiner can be reached.
        joiner_rpc: Address,
        joiner_publish: Address,
        /// How the joiner reached the member.
        member_rpc: Address,
        member_publish: Address,
    },
    /// Asks a peer to hold `proposal` for a joiner. `proposer` breaks ties
    /// between equal proposals in flight at once: the lower id wins.
    ReserveServerUid {
        proposal: ServerId,
        proposer: ServerId,
    },
    AddServer {
        server: ServerRecord,
    },
    ReserveApplicationId {
        proposal: ApplicationId,
        proposer: ServerId,
    },
}

impl PoolRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestServerUid { .. } => "RequestServerUid",
            Self::ReserveServerUid { .. } => "ReserveServerUid",
            Self::AddServer { .. } => "AddServer",
            Self::ReserveApplicationId { .. } => "ReserveApplicationId",
        }
    }
}

/// Reply to `RegisterApplication`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationGrant {
    pub application: ApplicationId,
    pub heartbeat_interval_ms: u64,
    /// Global id of the answering server, if it is pooled.
    pub server_id: Option<ServerId>,
    /// Every known replica, the answering server included.
    pub alternates: Vec<AlternateRegistry>,
}

/// Replies on the registry request/reply channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryReply {
    Application(ApplicationGrant),
    Accepted(bool),
    Service(Option<ServiceRecord>),
    /// `None` when no service of the type was ever seen.
    Services(Option<Vec<ServiceRecord>>),
    PulseAck {
        known: bool,
    },
    ServerUidGranted {
        server_id: ServerId,
        snapshot: DirectorySnapshot,
    },
    Ack,
}

/// Broadcasts on a registry's publish channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegistryEvent {
    ServiceRegistered(ServiceRecord),
    ServiceUnregistered(ServiceRecord),
    AlternateRegistryAvailable(AlternateRegistry),
    AlternateRegistryUnavailable(ServerId),
    ServerPool(PoolEvent),
}

/// Server-to-server gossip, carried inside [`RegistryEvent::ServerPool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PoolEvent {
    ServerPulse(ServerId),
    ServicePulse(ApplicationId),
    ServiceAdded {
        application: ApplicationId,
        record: ServiceRecord,
    },
    ServiceRemoved {
        uid: ServiceUid,
    },
    FullSync(DirectorySnapshot),
}

/// Client to service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceRequest {
    Call { method: String, args: Vec<Value> },
}

/// Service instance to client. A fault is an empty frame, not a variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceResponse {
    Result(Value),
}

/// An event raised by a service object and fanned out to proxies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub source: ServiceUid,
    pub payload: Value,
}

/// Broadcasts on a service instance's publish channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServiceBroadcast {
    Event(ServiceEvent),
}

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_FRAME_BYTES)
}

/// Encodes a message into one frame.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(message)?)
}

/// Decodes one frame. Empty frames, unknown tags and trailing bytes are errors.
pub fn decode<T: DeserializeOwned>(frame: &[u8]) -> Result<T> {
    if frame.is_empty() {
        return Err(Error::Protocol("empty frame".to_string()));
    }
    Ok(options().deserialize(frame)?)
}

/// Leading type tag of a frame, for diagnostics.
pub fn frame_tag(frame: &[u8]) -> Option<u8> {
    frame.first().copied()
}
