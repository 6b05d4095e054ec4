//! Records exchanged between registry servers and clients.

use crate::address::Address;
use crate::types::{ApplicationId, ServerId, ServiceUid};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Default type tag for services that don't declare one.
pub const DEFAULT_SERVICE_TYPE: &str = "Generic";

/// Default version tag for services that don't declare one.
pub const DEFAULT_SERVICE_VERSION: &str = "0.1";

/// One registered service instance.
///
/// Identity is the uid alone: two records with the same uid describe the
/// same instance even if its endpoints moved. Records are never edited in
/// place; re-registration replaces them wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub uid: ServiceUid,
    pub service_type: String,
    pub version: String,
    pub rpc_address: Address,
    pub publish_address: Address,
    /// Externally callable method names.
    pub methods: Vec<String>,
    /// Global id of the registry server that accepted the registration.
    /// `None` until a pooled server stamps it.
    pub origin: Option<ServerId>,
}

impl ServiceRecord {
    pub fn new(
        uid: impl Into<ServiceUid>,
        service_type: impl Into<String>,
        version: impl Into<String>,
        rpc_address: Address,
        publish_address: Address,
        methods: Vec<String>,
    ) -> Self {
        Self {
            uid: uid.into(),
            service_type: service_type.into(),
            version: version.into(),
            rpc_address,
            publish_address,
            methods,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: Option<ServerId>) -> Self {
        self.origin = origin;
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.iter().any(|m| m == name)
    }

    /// True when both records point at the same live endpoints.
    pub fn same_endpoints(&self, other: &ServiceRecord) -> bool {
        self.rpc_address == other.rpc_address && self.publish_address == other.publish_address
    }

    /// Ordering key used to settle two replicas that accepted the same uid
    /// independently: the lower key wins everywhere.
    pub fn precedence_key(&self) -> (u64, String) {
        (
            self.origin.map(ServerId::get).unwrap_or(u64::MAX),
            self.rpc_address.to_string(),
        )
    }
}

/// A registry server replica as seen on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server_id: ServerId,
    pub rpc_address: Address,
    pub publish_address: Address,
}

impl ServerRecord {
    pub fn new(server_id: ServerId, rpc_address: Address, publish_address: Address) -> Self {
        Self {
            server_id,
            rpc_address,
            publish_address,
        }
    }
}

/// Failover candidate advertised to clients.
pub type AlternateRegistry = ServerRecord;

/// Full copy of one server's directory and peer list.
///
/// Sent to a joining server and broadcast periodically so replicas that
/// missed gossip catch up.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectorySnapshot {
    pub sender: Option<ServerId>,
    pub services_by_uid: BTreeMap<ServiceUid, ServiceRecord>,
    pub services_by_type: BTreeMap<String, Vec<ServiceRecord>>,
    pub applications: BTreeMap<ApplicationId, Vec<ServiceUid>>,
    pub servers: Vec<ServerRecord>,
}

impl DirectorySnapshot {
    pub fn is_empty(&self) -> bool {
        self.services_by_uid.is_empty() && self.applications.is_empty() && self.servers.is_empty()
    }

    /// Reverse index from service uid to the application that owns it.
    pub fn owners(&self) -> BTreeMap<&ServiceUid, ApplicationId> {
        self.applications
            .iter()
            .flat_map(|(app, uids)| uids.iter().map(move |uid| (uid, *app)))
            .collect()
    }

    /// Every record in the snapshot once, whichever index it was found in.
    pub fn all_records(&self) -> BTreeMap<&ServiceUid, &ServiceRecord> {
        let mut all: BTreeMap<&ServiceUid, &ServiceRecord> =
            self.services_by_uid.iter().collect();
        for record in self.services_by_type.values().flatten() {
            all.entry(&record.uid).or_insert(record);
        }
        all
    }
}
