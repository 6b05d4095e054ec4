//! Registry client: the per-process handle services use to register,
//! discover and call each other.
//!
//! # Rust Learning Note
//!
//! ## One tick, four phases
//!
//! ```text
//! update():
//!   1. registry notifications  → alternates, live proxies
//!   2. inbound RPC requests    → local service objects
//!   3. queued object events    → each object's publish endpoint
//!   4. proxy event streams     → subscriber callbacks
//!   then heartbeat (with failover) and periodic proxy reconciliation
//! ```
//!
//! ## Failover
//!
//! Every `RegisterApplication` grant and every `AlternateRegistryAvailable`
//! notification feeds a map of alternate registries keyed by server id.
//! When a heartbeat fails, the client moves to the alternate with the
//! highest id other than the one that failed, reconnects both sockets and
//! retries the heartbeat there. Running out of alternates is the one fatal
//! error `update` returns.

use crate::config::{ClientConfig, LOOPBACK};
use crate::proxy::{ServiceProxy, WeakProxy};
use crate::service::{Bound, Dispatch, EventPublisher, RemoteService};
use hsu_common::wire::{
    self, ApplicationGrant, RegistryEvent, RegistryReply, RegistryRequest, ServiceBroadcast,
    ServiceEvent, ServiceRequest, ServiceResponse,
};
use hsu_common::{
    transport, Address, AlternateRegistry, ApplicationId, Error, Result, ServerId, ServiceRecord,
    ServiceUid, StopHandle, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Prefix of generated service uids. Callers may not use it.
pub const AUTO_UID_PREFIX: &str = "~auto-";

/// A registered local object with the endpoints it owns.
struct LocalService {
    record: ServiceRecord,
    object: Box<dyn Dispatch>,
    rpc: zmq::Socket,
    publish: zmq::Socket,
    events: mpsc::UnboundedReceiver<Value>,
}

/// The registry currently in use.
#[derive(Debug, Clone)]
struct ActiveRegistry {
    rpc: Address,
    publish: Address,
    server_id: Option<ServerId>,
}

/// Per-process registry handle.
pub struct RegistryClient {
    config: ClientConfig,
    context: zmq::Context,
    registry: ActiveRegistry,
    request: zmq::Socket,
    notifications: zmq::Socket,
    application: ApplicationId,
    heartbeat_interval: Duration,
    last_heartbeat: Instant,
    alternates: BTreeMap<ServerId, AlternateRegistry>,
    services: BTreeMap<ServiceUid, LocalService>,
    next_local_id: u64,
    proxies: Vec<WeakProxy>,
    last_refresh: Instant,
}

impl RegistryClient {
    /// Connects to the configured registry and registers this process as
    /// an application.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        Self::with_context(config, zmq::Context::new())
    }

    /// Like [`connect`](Self::connect), sharing an existing context (needed
    /// for `inproc` endpoints).
    pub fn with_context(config: ClientConfig, context: zmq::Context) -> Result<Self> {
        let registry = ActiveRegistry {
            rpc: config.registry_rpc.clone(),
            publish: config.registry_publish.clone(),
            server_id: None,
        };
        let (request, notifications) = open_registry_sockets(&context, &registry, config.request_timeout)?;
        let now = Instant::now();
        let mut client = Self {
            config,
            context,
            registry,
            request,
            notifications,
            application: ApplicationId::default(),
            heartbeat_interval: Duration::from_secs(1),
            last_heartbeat: now,
            alternates: BTreeMap::new(),
            services: BTreeMap::new(),
            next_local_id: 0,
            proxies: Vec::new(),
            last_refresh: now,
        };

        let grant = match client.request(&RegistryRequest::RegisterApplication)? {
            RegistryReply::Application(grant) => grant,
            other => return Err(unexpected("RegisterApplication", &other)),
        };
        client.accept_grant(grant);
        info!(
            "Connected to registry {} as application {}",
            client.registry.rpc, client.application
        );
        Ok(client)
    }

    fn accept_grant(&mut self, grant: ApplicationGrant) {
        self.application = grant.application;
        self.heartbeat_interval = Duration::from_millis(grant.heartbeat_interval_ms.max(1));
        self.registry.server_id = grant.server_id;
        for alternate in grant.alternates {
            self.alternates.insert(alternate.server_id, alternate);
        }
    }

    pub fn application(&self) -> ApplicationId {
        self.application
    }

    pub fn context(&self) -> &zmq::Context {
        &self.context
    }

    /// RPC address of the registry currently in use.
    pub fn registry_address(&self) -> &Address {
        &self.registry.rpc
    }

    /// Global id of the registry currently in use, if it is pooled.
    pub fn registry_server_id(&self) -> Option<ServerId> {
        self.registry.server_id
    }

    /// Known alternate registries in ascending id order.
    pub fn alternates(&self) -> Vec<AlternateRegistry> {
        self.alternates.values().cloned().collect()
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Record of a service registered through this client.
    pub fn local_service(&self, uid: &ServiceUid) -> Option<&ServiceRecord> {
        self.services.get(uid).map(|local| &local.record)
    }

    pub fn local_service_count(&self) -> usize {
        self.services.len()
    }

    /// Registers `object` under `uid`, or under a generated uid when none
    /// is given.
    ///
    /// Returns `Ok(None)` when the registration was refused: the uid is
    /// taken, uses the reserved prefix, or its endpoints could not be
    /// bound. Local state is untouched in that case.
    pub fn register<S: RemoteService>(&mut self, uid: Option<&str>, object: S) -> Result<Option<ServiceUid>> {
        let uid = match uid {
            Some(uid) if uid.starts_with(AUTO_UID_PREFIX) => {
                warn!("Service uid {} uses the reserved prefix {}", uid, AUTO_UID_PREFIX);
                return Ok(None);
            }
            Some(uid) => ServiceUid::new(uid),
            None => {
                self.next_local_id += 1;
                ServiceUid::new(format!(
                    "{}{}.{}",
                    AUTO_UID_PREFIX, self.application, self.next_local_id
                ))
            }
        };
        if self.services.contains_key(&uid) {
            debug!("Service {} is already registered locally", uid);
            return Ok(None);
        }

        let (rpc, publish, rpc_address, publish_address) = match self.bind_endpoints(&uid) {
            Ok(bound) => bound,
            Err(e) => {
                warn!("Could not bind endpoints for {}: {}", uid, e);
                return Ok(None);
            }
        };

        let (publisher, events) = EventPublisher::channel();
        let object: Box<dyn Dispatch> = Box::new(Bound::new(object, publisher));
        let record = ServiceRecord::new(
            uid.clone(),
            object.service_type(),
            object.version(),
            rpc_address,
            publish_address,
            object.method_names(),
        );

        let request = RegistryRequest::RegisterService {
            application: self.application,
            record: record.clone(),
        };
        match self.request(&request)? {
            RegistryReply::Accepted(true) => {}
            RegistryReply::Accepted(false) => {
                info!("Registry refused service {}: uid already registered", uid);
                return Ok(None);
            }
            other => return Err(unexpected("RegisterService", &other)),
        }

        info!(
            "Registered service {} (type={}) at {}",
            uid, record.service_type, record.rpc_address
        );
        self.services.insert(
            uid.clone(),
            LocalService {
                record,
                object,
                rpc,
                publish,
                events,
            },
        );
        Ok(Some(uid))
    }

    /// Binds the REP and PUB endpoints of a new service and resolves the
    /// addresses to advertise.
    fn bind_endpoints(&self, uid: &ServiceUid) -> Result<(zmq::Socket, zmq::Socket, Address, Address)> {
        let attempts = self.config.max_bind_attempts;
        let (rpc_endpoint, publish_endpoint) = self.config.binding.endpoints(uid);

        let rpc = transport::socket(&self.context, zmq::REP)?;
        let bound_rpc = transport::bind_with_retry(&rpc, &rpc_endpoint, attempts)?;

        // Fixed port ranges continue after the RPC port actually taken.
        let publish_endpoint = match (bound_rpc.port(), publish_endpoint.port()) {
            (Some(rpc_port), Some(_)) => publish_endpoint.with_port(rpc_port.saturating_add(1)),
            _ => publish_endpoint,
        };
        let publish = transport::socket(&self.context, zmq::PUB)?;
        let bound_publish = transport::bind_with_retry(&publish, &publish_endpoint, attempts)?;

        let advertise = self.config.advertise_host.as_deref();
        Ok((
            rpc,
            publish,
            reachable(&bound_rpc, advertise),
            reachable(&bound_publish, advertise),
        ))
    }

    /// Unregisters a service registered through this client and closes its
    /// endpoints. Returns false if the uid is not local.
    pub fn unregister(&mut self, uid: &ServiceUid) -> Result<bool> {
        let Some(local) = self.services.remove(uid) else {
            return Ok(false);
        };
        // Endpoints close with `local`, whatever the registry answers.
        drop(local);
        match self.request(&RegistryRequest::UnregisterService { uid: uid.clone() })? {
            RegistryReply::Accepted(removed) => {
                if !removed {
                    debug!("Registry no longer knew service {}", uid);
                }
                info!("Unregistered service {}", uid);
                Ok(true)
            }
            other => Err(unexpected("UnregisterService", &other)),
        }
    }

    pub fn find_by_uid(&self, uid: &ServiceUid) -> Result<Option<ServiceRecord>> {
        match self.request(&RegistryRequest::FindByUid { uid: uid.clone() })? {
            RegistryReply::Service(found) => Ok(found),
            other => Err(unexpected("FindByUid", &other)),
        }
    }

    /// Every registered instance of a type, possibly none.
    pub fn find_by_type(&self, service_type: &str) -> Result<Vec<ServiceRecord>> {
        let request = RegistryRequest::FindByType {
            service_type: service_type.to_string(),
        };
        match self.request(&request)? {
            RegistryReply::Services(found) => Ok(found.unwrap_or_default()),
            other => Err(unexpected("FindByType", &other)),
        }
    }

    /// Proxy on the instance registered under `uid`, if there is one.
    pub fn get_service_by_uid(&mut self, uid: &ServiceUid) -> Result<Option<ServiceProxy>> {
        let Some(record) = self.find_by_uid(uid)? else {
            return Ok(None);
        };
        let proxy = ServiceProxy::for_instance(&self.context, record, self.config.default_call_timeout_ms)?;
        self.proxies.push(proxy.downgrade());
        Ok(Some(proxy))
    }

    /// Load-balancing proxy on every instance of `service_type`. The proxy
    /// exists even when no instance is registered yet and fills up as
    /// instances register.
    pub fn get_service_by_type(&mut self, service_type: &str) -> Result<ServiceProxy> {
        let records = self.find_by_type(service_type)?;
        let proxy = ServiceProxy::for_type(
            &self.context,
            service_type,
            records,
            self.config.default_call_timeout_ms,
        )?;
        self.proxies.push(proxy.downgrade());
        Ok(proxy)
    }

    /// Runs one cooperative tick.
    ///
    /// Only losing every registry is returned as an error; other failures
    /// are logged and retried on the next tick.
    pub fn update(&mut self) -> Result<()> {
        self.process_notifications();
        self.process_requests();
        self.publish_events();
        self.receive_proxy_events();

        let now = Instant::now();
        if now.saturating_duration_since(self.last_heartbeat) >= self.heartbeat_interval {
            self.heartbeat()?;
            self.last_heartbeat = Instant::now();
        }
        if now.saturating_duration_since(self.last_refresh) >= self.config.proxy_refresh_interval {
            self.refresh_proxies();
            self.last_refresh = Instant::now();
        }
        Ok(())
    }

    /// Calls [`update`](Self::update) every `sleep` until `stop` is flipped.
    pub fn auto_update(&mut self, sleep: Duration, stop: &StopHandle) -> Result<()> {
        self.auto_update_with(sleep, stop, |_| {})
    }

    /// Like [`auto_update`](Self::auto_update), calling `idle` after every
    /// successful iteration so the host can do its own work on this thread.
    pub fn auto_update_with<F>(&mut self, sleep: Duration, stop: &StopHandle, mut idle: F) -> Result<()>
    where
        F: FnMut(&mut Self),
    {
        while !stop.is_stopped() {
            if let Err(e) = self.update() {
                error!("Registry client stopped: {}", e);
                return Err(e);
            }
            idle(self);
            if stop.is_stopped() {
                break;
            }
            std::thread::sleep(sleep);
        }
        Ok(())
    }

    /// Unregisters every local service and closes all endpoints.
    pub fn shutdown(mut self) {
        let uids: Vec<ServiceUid> = self.services.keys().cloned().collect();
        for uid in &uids {
            if let Err(e) = self.unregister(uid) {
                warn!("Unregistering {} during shutdown failed: {}", uid, e);
            }
        }
        info!("Registry client for application {} shut down", self.application);
    }

    fn process_notifications(&mut self) {
        let mut events = Vec::new();
        loop {
            match transport::try_recv(&self.notifications) {
                Ok(Some(frame)) => match wire::decode::<RegistryEvent>(&frame) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("Undecodable registry notification: {}", e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Receiving registry notifications failed: {}", e);
                    break;
                }
            }
        }
        if events.is_empty() {
            return;
        }

        let proxies = self.live_proxies();
        for event in events {
            match event {
                RegistryEvent::ServiceRegistered(record) => {
                    for proxy in &proxies {
                        if let Err(e) = proxy.add_service(record.clone()) {
                            warn!("Proxy could not connect to {}: {}", record.uid, e);
                        }
                    }
                }
                RegistryEvent::ServiceUnregistered(record) => {
                    for proxy in &proxies {
                        proxy.remove_service(&record);
                    }
                }
                RegistryEvent::AlternateRegistryAvailable(alternate) => {
                    debug!("Alternate registry {} at {}", alternate.server_id, alternate.rpc_address);
                    self.alternates.insert(alternate.server_id, alternate);
                }
                RegistryEvent::AlternateRegistryUnavailable(server_id) => {
                    debug!("Alternate registry {} gone", server_id);
                    self.alternates.remove(&server_id);
                }
                RegistryEvent::ServerPool(_) => {}
            }
        }
        // Removals are batched: each proxy rebuilds at most once per tick.
        for proxy in &proxies {
            if let Err(e) = proxy.flush_rebuild() {
                warn!("Rebuilding proxy for {} failed: {}", proxy.service_type(), e);
            }
        }
    }

    fn process_requests(&mut self) {
        for (uid, local) in self.services.iter_mut() {
            loop {
                let frame = match transport::try_recv(&local.rpc) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Receiving calls for {} failed: {}", uid, e);
                        break;
                    }
                };
                let reply = dispatch_call(uid, &local.record, local.object.as_mut(), &frame);
                if let Err(e) = local.rpc.send(reply, 0) {
                    warn!("Replying to a call on {} failed: {}", uid, e);
                }
            }
        }
    }

    fn publish_events(&mut self) {
        for (uid, local) in self.services.iter_mut() {
            while let Ok(payload) = local.events.try_recv() {
                let broadcast = ServiceBroadcast::Event(ServiceEvent {
                    source: uid.clone(),
                    payload,
                });
                match wire::encode(&broadcast) {
                    Ok(frame) => {
                        if let Err(e) = local.publish.send(frame, 0) {
                            warn!("Publishing an event of {} failed: {}", uid, e);
                        }
                    }
                    Err(e) => warn!("Could not encode an event of {}: {}", uid, e),
                }
            }
        }
    }

    fn receive_proxy_events(&mut self) {
        for proxy in self.live_proxies() {
            if let Err(e) = proxy.receive() {
                warn!("Receiving events for {} failed: {}", proxy.service_type(), e);
            }
        }
    }

    /// Upgrades the proxy list, forgetting proxies the caller dropped.
    fn live_proxies(&mut self) -> Vec<ServiceProxy> {
        let mut live = Vec::with_capacity(self.proxies.len());
        self.proxies.retain(|weak| match weak.upgrade() {
            Some(proxy) => {
                live.push(proxy);
                true
            }
            None => false,
        });
        live
    }

    /// Sends a heartbeat, failing over until one registry answers.
    fn heartbeat(&mut self) -> Result<()> {
        let mut failed = BTreeSet::new();
        loop {
            match self.request(&RegistryRequest::Pulse {
                application: self.application,
            }) {
                Ok(RegistryReply::PulseAck { known: true }) => return Ok(()),
                Ok(RegistryReply::PulseAck { known: false }) => {
                    // The registry drops an application with its last service.
                    if self.services.is_empty() {
                        debug!(
                            "Registry {} does not know application {}, nothing to re-register",
                            self.registry.rpc, self.application
                        );
                        return Ok(());
                    }
                    warn!(
                        "Registry {} does not know application {}, re-registering services",
                        self.registry.rpc, self.application
                    );
                    self.reassert_registrations();
                    return Ok(());
                }
                Ok(other) => return Err(unexpected("Pulse", &other)),
                Err(e) => {
                    warn!("Heartbeat to registry {} failed: {}", self.registry.rpc, e);
                    if let Some(id) = self.registry.server_id {
                        failed.insert(id);
                        self.alternates.remove(&id);
                    }
                    self.fail_over(&failed)?;
                }
            }
        }
    }

    /// Switches to the highest-id alternate not known to have failed.
    fn fail_over(&mut self, failed: &BTreeSet<ServerId>) -> Result<()> {
        let current = self.registry.rpc.clone();
        let candidate = self
            .alternates
            .values()
            .rev()
            .find(|alternate| !failed.contains(&alternate.server_id) && alternate.rpc_address != current)
            .cloned()
            .ok_or_else(|| Error::registry_unavailable(format!("{} failed and no alternate is known", current)))?;

        let registry = ActiveRegistry {
            rpc: candidate.rpc_address.clone(),
            publish: candidate.publish_address.clone(),
            server_id: Some(candidate.server_id),
        };
        let (request, notifications) =
            open_registry_sockets(&self.context, &registry, self.config.request_timeout)?;
        self.request = request;
        self.notifications = notifications;
        self.registry = registry;
        info!(
            "Failed over from {} to registry {} at {}",
            current, candidate.server_id, candidate.rpc_address
        );
        Ok(())
    }

    /// Registers every local service again under the same application id.
    fn reassert_registrations(&mut self) {
        let records: Vec<ServiceRecord> = self.services.values().map(|local| local.record.clone()).collect();
        for record in records {
            let uid = record.uid.clone();
            let request = RegistryRequest::RegisterService {
                application: self.application,
                record,
            };
            match self.request(&request) {
                Ok(RegistryReply::Accepted(true)) => debug!("Re-registered {}", uid),
                Ok(RegistryReply::Accepted(false)) => debug!("Registry already had {}", uid),
                Ok(other) => warn!("Unexpected reply re-registering {}: {:?}", uid, other),
                Err(e) => warn!("Re-registering {} failed: {}", uid, e),
            }
        }
    }

    /// Reconciles every live proxy with the registry's current view.
    fn refresh_proxies(&mut self) {
        for proxy in self.live_proxies() {
            let result = match proxy.uid() {
                Some(uid) => self.find_by_uid(&uid).map(|found| found.into_iter().collect()),
                None => self.find_by_type(&proxy.service_type()),
            };
            let current: Vec<ServiceRecord> = match result {
                Ok(records) => records,
                Err(e) => {
                    debug!("Proxy refresh skipped: {}", e);
                    return;
                }
            };
            let live: BTreeSet<&ServiceUid> = current.iter().map(|record| &record.uid).collect();
            for stale in proxy.instances().iter().filter(|record| !live.contains(&record.uid)) {
                proxy.remove_service(stale);
            }
            for record in current.iter().cloned() {
                if let Err(e) = proxy.add_service(record) {
                    warn!("Proxy refresh could not connect: {}", e);
                }
            }
            if let Err(e) = proxy.flush_rebuild() {
                warn!("Rebuilding proxy for {} failed: {}", proxy.service_type(), e);
            }
        }
    }

    fn request(&self, request: &RegistryRequest) -> Result<RegistryReply> {
        let frame = wire::encode(request)?;
        let reply = transport::round_trip(&self.request, &frame, self.config.request_timeout, request.name())?;
        wire::decode(&reply)
    }
}

fn open_registry_sockets(
    context: &zmq::Context,
    registry: &ActiveRegistry,
    timeout: Duration,
) -> Result<(zmq::Socket, zmq::Socket)> {
    let request = transport::request_socket(context, timeout)?;
    transport::connect(&request, &registry.rpc)?;
    let notifications = transport::subscribe_all(context)?;
    transport::connect(&notifications, &registry.publish)?;
    Ok((request, notifications))
}

/// Decodes and runs one inbound call. Anything that goes wrong becomes an
/// empty reply so the caller never hangs.
fn dispatch_call(uid: &ServiceUid, record: &ServiceRecord, object: &mut dyn Dispatch, frame: &[u8]) -> Vec<u8> {
    let ServiceRequest::Call { method, args } = match wire::decode::<ServiceRequest>(frame) {
        Ok(request) => request,
        Err(e) => {
            warn!("Protocol violation on {}: {}", uid, e);
            return Vec::new();
        }
    };
    if !record.has_method(&method) {
        warn!("Call to {} which {} does not expose", method, uid);
        return Vec::new();
    }
    match object.invoke(&method, args) {
        Ok(value) => wire::encode(&ServiceResponse::Result(value)).unwrap_or_else(|e| {
            warn!("Could not encode the result of {} on {}: {}", method, uid, e);
            Vec::new()
        }),
        Err(e) => {
            warn!("Call {} on {} failed: {}", method, uid, e);
            Vec::new()
        }
    }
}

/// Replaces a wildcard host with one other processes can reach.
fn reachable(address: &Address, advertise_host: Option<&str>) -> Address {
    match advertise_host {
        Some(host) => address.with_host(host),
        None if address.is_wildcard_host() => address.with_host(LOOPBACK),
        None => address.clone(),
    }
}

fn unexpected(operation: &str, reply: &RegistryReply) -> Error {
    Error::Protocol(format!("unexpected reply to {}: {:?}", operation, reply))
}
