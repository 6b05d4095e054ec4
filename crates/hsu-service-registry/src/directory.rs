//! In-memory directory of registered services.
//!
//! # Rust Learning Note
//!
//! The directory is mutated only by the thread driving its server's
//! `update` loop, so it is a plain struct with `&mut self` methods: no
//! `Mutex`, no `DashMap`. The borrow checker enforces the single-writer rule
//! that a shared-memory design would have to enforce with locks.
//!
//! ## Indexes
//!
//! ```text
//! by_uid      uid  -> ServiceRecord
//! by_type     type -> {uid}
//! owners      uid  -> application
//! applications app -> ApplicationHandle { services, last_activity }
//! ```
//!
//! Every mutation keeps all four in step. Changes are queued as
//! [`DirectoryEvent`]s that the server drains and publishes.

use chrono::{DateTime, Utc};
use hsu_common::{ApplicationId, DirectorySnapshot, ServerId, ServerRecord, ServiceRecord, ServiceUid};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A change to the directory, queued for publication.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Registered(ServiceRecord),
    Removed(ServiceRecord),
}

/// One connected client process and the services it owns.
#[derive(Debug, Clone)]
pub struct ApplicationHandle {
    id: ApplicationId,
    services: Vec<ServiceUid>,
    last_activity: Instant,
    registered_at: DateTime<Utc>,
}

impl ApplicationHandle {
    fn new(id: ApplicationId, now: Instant) -> Self {
        Self {
            id,
            services: Vec::new(),
            last_activity: now,
            registered_at: Utc::now(),
        }
    }

    pub fn id(&self) -> ApplicationId {
        self.id
    }

    pub fn services(&self) -> &[ServiceUid] {
        &self.services
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn registered_at(&self) -> DateTime<Utc> {
        self.registered_at
    }

    fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) >= timeout
    }
}

/// Result of merging a remote snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    pub added: usize,
    pub replaced: usize,
    pub applications: usize,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.applications > 0
    }
}

/// Service directory with liveness-based eviction.
#[derive(Debug, Default)]
pub struct Directory {
    by_uid: BTreeMap<ServiceUid, ServiceRecord>,
    by_type: BTreeMap<String, BTreeSet<ServiceUid>>,
    owners: BTreeMap<ServiceUid, ApplicationId>,
    applications: BTreeMap<ApplicationId, ApplicationHandle>,
    /// Highest application id ever allocated or learned here.
    high_water: ApplicationId,
    events: Vec<DirectoryEvent>,
}

impl Directory {
    /// Creates a new empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh application id (standalone allocation) and starts
    /// its liveness clock.
    pub fn register_application(&mut self, now: Instant) -> ApplicationId {
        let id = self.highest_application_id().next();
        self.insert_application(id, now);
        id
    }

    /// Creates a handle for an id allocated elsewhere (pool allocation).
    /// Returns false if the handle already exists.
    pub fn insert_application(&mut self, id: ApplicationId, now: Instant) -> bool {
        if self.applications.contains_key(&id) {
            return false;
        }
        self.applications.insert(id, ApplicationHandle::new(id, now));
        self.high_water = self.high_water.max(id);
        debug!("Application {} registered", id);
        true
    }

    /// Highest application id this directory has handed out or seen.
    pub fn highest_application_id(&self) -> ApplicationId {
        let known = self
            .applications
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default();
        self.high_water.max(known)
    }

    pub fn has_application(&self, id: ApplicationId) -> bool {
        self.applications.contains_key(&id)
    }

    pub fn application(&self, id: ApplicationId) -> Option<&ApplicationHandle> {
        self.applications.get(&id)
    }

    pub fn application_count(&self) -> usize {
        self.applications.len()
    }

    /// Registers `record` under `application`.
    ///
    /// Returns false, leaving the existing record intact, if the uid is
    /// already taken. An unknown application id gets a fresh handle, so a
    /// client whose application timed out can register again.
    pub fn register(&mut self, application: ApplicationId, record: ServiceRecord, now: Instant) -> bool {
        if self.by_uid.contains_key(&record.uid) {
            debug!("Rejected duplicate registration of {}", record.uid);
            return false;
        }
        info!(
            "Registered service {} (type={}, app={})",
            record.uid, record.service_type, application
        );
        self.insert_record(application, record, now);
        true
    }

    /// Removes a service from every index. Returns false if the uid is unknown.
    pub fn unregister(&mut self, uid: &ServiceUid) -> bool {
        match self.remove_record(uid) {
            Some(record) => {
                info!("Unregistered service {} (type={})", record.uid, record.service_type);
                true
            }
            None => false,
        }
    }

    pub fn find_by_uid(&self, uid: &ServiceUid) -> Option<&ServiceRecord> {
        self.by_uid.get(uid)
    }

    /// All services of a type, possibly none.
    pub fn find_by_type(&self, service_type: &str) -> Vec<ServiceRecord> {
        self.by_type
            .get(service_type)
            .map(|uids| {
                uids.iter()
                    .filter_map(|uid| self.by_uid.get(uid))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Whether a service of this type was ever registered here.
    pub fn knows_type(&self, service_type: &str) -> bool {
        self.by_type.contains_key(service_type)
    }

    pub fn owner_of(&self, uid: &ServiceUid) -> Option<ApplicationId> {
        self.owners.get(uid).copied()
    }

    /// Refreshes an application's liveness. Returns false if it is unknown.
    pub fn touch(&mut self, application: ApplicationId, now: Instant) -> bool {
        match self.applications.get_mut(&application) {
            Some(handle) => {
                handle.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Evicts every application silent for at least `timeout`, unregistering
    /// all of its services. Returns the evicted ids.
    pub fn sweep_expired(&mut self, now: Instant, timeout: Duration) -> Vec<ApplicationId> {
        let expired: Vec<ApplicationId> = self
            .applications
            .values()
            .filter(|handle| handle.is_expired(now, timeout))
            .map(|handle| handle.id)
            .collect();

        for id in &expired {
            if let Some(handle) = self.applications.get(id) {
                let services = handle.services.clone();
                warn!(
                    "Application {} timed out, evicting {} service(s)",
                    id,
                    services.len()
                );
                for uid in &services {
                    self.remove_record(uid);
                }
            }
            self.applications.remove(id);
        }
        expired
    }

    /// Removes every service and application.
    pub fn unregister_all(&mut self) -> usize {
        let uids: Vec<ServiceUid> = self.by_uid.keys().cloned().collect();
        for uid in &uids {
            self.remove_record(uid);
        }
        self.applications.clear();
        uids.len()
    }

    /// Stamps records accepted before this server had a global id.
    pub fn claim_unowned(&mut self, origin: ServerId) -> usize {
        let mut claimed = 0;
        for record in self.by_uid.values_mut().filter(|r| r.origin.is_none()) {
            record.origin = Some(origin);
            claimed += 1;
        }
        claimed
    }

    pub fn len(&self) -> usize {
        self.by_uid.len()
    }

    /// True when no application or service is known.
    pub fn is_empty(&self) -> bool {
        self.by_uid.is_empty() && self.applications.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &ServiceRecord> {
        self.by_uid.values()
    }

    /// Full copy of the directory, for pool join and periodic sync.
    pub fn snapshot(&self, sender: Option<ServerId>, servers: Vec<ServerRecord>) -> DirectorySnapshot {
        let services_by_type = self
            .by_type
            .keys()
            .map(|service_type| (service_type.clone(), self.find_by_type(service_type)))
            .collect();
        let applications = self
            .applications
            .values()
            .map(|handle| (handle.id, handle.services.clone()))
            .collect();
        DirectorySnapshot {
            sender,
            services_by_uid: self.by_uid.clone(),
            services_by_type,
            applications,
            servers,
        }
    }

    /// Union merge of a remote snapshot.
    ///
    /// Unknown applications and services are added; local entries are never
    /// overwritten, except when the remote record for the same uid points at
    /// a different endpoint and wins on [`ServiceRecord::precedence_key`].
    /// That tie-break makes every replica converge on the same record after
    /// a double allocation. Applying the same snapshot twice is a no-op the
    /// second time.
    pub fn merge(&mut self, snapshot: &DirectorySnapshot, now: Instant) -> MergeOutcome {
        let mut outcome = MergeOutcome::default();

        for application in snapshot.applications.keys() {
            if self.insert_application(*application, now) {
                outcome.applications += 1;
            }
        }

        let owners = snapshot.owners();
        for (uid, remote) in snapshot.all_records() {
            let Some(owner) = owners.get(uid).copied() else {
                warn!("Snapshot record {} has no owning application, skipped", uid);
                continue;
            };
            match self.by_uid.get(uid) {
                None => {
                    self.insert_record(owner, remote.clone(), now);
                    outcome.added += 1;
                }
                Some(local) if local.same_endpoints(remote) => {}
                Some(local) if remote.precedence_key() < local.precedence_key() => {
                    warn!(
                        "Conflicting registrations for {}: keeping {} over {}",
                        uid, remote.rpc_address, local.rpc_address
                    );
                    self.remove_record(uid);
                    self.insert_record(owner, remote.clone(), now);
                    outcome.replaced += 1;
                }
                Some(_) => {}
            }
        }

        if outcome.changed() {
            info!(
                "Merged snapshot from {:?}: {} added, {} replaced, {} application(s)",
                snapshot.sender.map(|id| id.to_string()),
                outcome.added,
                outcome.replaced,
                outcome.applications
            );
        }
        outcome
    }

    /// Takes the queued change events.
    pub fn drain_events(&mut self) -> Vec<DirectoryEvent> {
        std::mem::take(&mut self.events)
    }

    fn insert_record(&mut self, application: ApplicationId, record: ServiceRecord, now: Instant) {
        let handle = self
            .applications
            .entry(application)
            .or_insert_with(|| ApplicationHandle::new(application, now));
        handle.last_activity = now;
        handle.services.push(record.uid.clone());
        self.high_water = self.high_water.max(application);

        self.by_type
            .entry(record.service_type.clone())
            .or_default()
            .insert(record.uid.clone());
        self.owners.insert(record.uid.clone(), application);
        self.by_uid.insert(record.uid.clone(), record.clone());
        self.events.push(DirectoryEvent::Registered(record));
    }

    fn remove_record(&mut self, uid: &ServiceUid) -> Option<ServiceRecord> {
        let record = self.by_uid.remove(uid)?;
        if let Some(uids) = self.by_type.get_mut(&record.service_type) {
            uids.remove(uid);
        }
        if let Some(application) = self.owners.remove(uid) {
            let now_empty = match self.applications.get_mut(&application) {
                Some(handle) => {
                    handle.services.retain(|owned| owned != uid);
                    handle.services.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.applications.remove(&application);
                debug!("Application {} has no services left, removed", application);
            }
        }
        self.events.push(DirectoryEvent::Removed(record.clone()));
        Some(record)
    }
}
