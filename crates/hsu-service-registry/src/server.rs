//! Registry server: one ROUTER endpoint for requests, one PUB endpoint for
//! notifications, and the pool plumbing that keeps replicas in step.
//!
//! # Rust Learning Note
//!
//! ## Cooperative update loop
//!
//! The server owns its sockets and state outright and is driven by
//! [`RegistryServer::update`]. Nothing here is shared between threads, so
//! no field needs a lock:
//!
//! ```text
//! update():
//!   1. drain pool gossip from every peer subscription
//!   2. answer every pending request, parked ones first
//!   3. evict silent applications and silent peers
//!   4. send a server pulse / full sync when due
//! ```
//!
//! [`RegistryServer::auto_update`] just calls `update` until a
//! [`StopHandle`] is flipped, which is how the binary runs it on a
//! blocking thread while tokio waits for Ctrl+C.
//! [`RegistryServer::auto_update_with`] also hands the server to an idle
//! callback after every iteration.
//!
//! ## Waiting on peers
//!
//! Id allocation blocks on peer round trips. While it waits, the server
//! keeps reading its own endpoint through a [`ServingLink`]: reservation
//! proposals from other servers are answered on the spot, anything else is
//! parked and handled on the next pass.
//!
//! ## Failure handling
//!
//! A malformed or failing request gets an empty reply frame. Clients treat
//! an empty reply as a failed request.

use crate::config::RegistryConfig;
use crate::directory::{Directory, DirectoryEvent};
use crate::endpoint::RpcEndpoint;
use crate::peers::{PeerConnections, ServingLink};
use crate::pool::{PeerLink, ServerPool};
use hsu_common::wire::{
    self, ApplicationGrant, PoolEvent, PoolRequest, RegistryEvent, RegistryReply, RegistryRequest,
};
use hsu_common::{
    transport, Address, ApplicationId, DirectorySnapshot, Error, Result, ServerId, ServerRecord,
    ServiceRecord, StopHandle,
};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Host advertised in place of a wildcard bind when none is configured.
const LOOPBACK: &str = "127.0.0.1";

/// A registry server replica.
pub struct RegistryServer {
    config: RegistryConfig,
    context: zmq::Context,
    endpoint: RpcEndpoint,
    publish_socket: zmq::Socket,
    /// Endpoints clients and peers connect to.
    rpc_address: Address,
    publish_address: Address,
    directory: Directory,
    pool: ServerPool,
    peers: PeerConnections,
}

impl RegistryServer {
    /// Binds both endpoints on a fresh ZeroMQ context.
    pub fn bind(config: RegistryConfig) -> Result<Self> {
        Self::with_context(config, zmq::Context::new())
    }

    /// Binds both endpoints on an existing context (needed for `inproc`).
    pub fn with_context(config: RegistryConfig, context: zmq::Context) -> Result<Self> {
        let (endpoint, bound_rpc) = RpcEndpoint::bind(&context, &config.rpc_address)
            .map_err(|e| e.context(format!("bind registry RPC endpoint {}", config.rpc_address)))?;

        let publish_socket = transport::socket(&context, zmq::PUB)?;
        let bound_publish = transport::bind(&publish_socket, &config.publish_address).map_err(|e| {
            e.context(format!("bind registry publish endpoint {}", config.publish_address))
        })?;

        let rpc_address = advertised(&bound_rpc, config.advertise_host.as_deref());
        let publish_address = advertised(&bound_publish, config.advertise_host.as_deref());
        info!(
            "Registry listening: rpc={} publish={}",
            rpc_address, publish_address
        );

        let pool = ServerPool::new(config.pool_timing());
        let peers = PeerConnections::new(context.clone(), config.request_timeout);

        Ok(Self {
            config,
            context,
            endpoint,
            publish_socket,
            rpc_address,
            publish_address,
            directory: Directory::new(),
            pool,
            peers,
        })
    }

    pub fn rpc_address(&self) -> &Address {
        &self.rpc_address
    }

    pub fn publish_address(&self) -> &Address {
        &self.publish_address
    }

    /// Global id, once the server seeded or joined a pool.
    pub fn server_id(&self) -> Option<ServerId> {
        self.pool.own_id()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn pool(&self) -> &ServerPool {
        &self.pool
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Joins the pool that the server at `member_rpc` belongs to.
    ///
    /// Only a server that has never had an id and has no clients yet may
    /// join. On success the server has its global id, is connected to every
    /// replica and holds a copy of the pool's directory.
    pub fn join_pool(&mut self, member_rpc: &Address, member_publish: &Address) -> Result<ServerId> {
        if let Some(current) = self.pool.own_id() {
            return Err(Error::conflict(format!(
                "server already belongs to a pool as {}",
                current
            )));
        }
        if !self.directory.is_empty() {
            return Err(Error::conflict(
                "server already has clients and cannot join a pool",
            ));
        }

        info!("Joining server pool via {}", member_rpc);
        let request = RegistryRequest::ServerPool(PoolRequest::RequestServerUid {
            joiner_rpc: self.rpc_address.clone(),
            joiner_publish: self.publish_address.clone(),
            member_rpc: member_rpc.clone(),
            member_publish: member_publish.clone(),
        });
        let socket = transport::request_socket(&self.context, self.config.request_timeout)?;
        transport::connect(&socket, member_rpc)?;
        let frame = transport::round_trip(
            &socket,
            &wire::encode(&request)?,
            self.config.request_timeout,
            request.name(),
        )?;
        let (server_id, snapshot) = match wire::decode::<RegistryReply>(&frame)? {
            RegistryReply::ServerUidGranted {
                server_id,
                snapshot,
            } => (server_id, snapshot),
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected reply to RequestServerUid: {:?}",
                    other
                )))
            }
        };

        let now = Instant::now();
        let own = ServerRecord::new(server_id, self.rpc_address.clone(), self.publish_address.clone());
        self.pool.adopt(own.clone(), now)?;
        for record in self.pool.unknown_servers(&snapshot.servers) {
            self.add_peer(record, now)?;
        }
        for peer in self.pool.peer_ids() {
            let request = PoolRequest::AddServer {
                server: own.clone(),
            };
            let directory = &self.directory;
            let pool = &mut self.pool;
            let mut link = ServingLink::new(&self.peers, &mut self.endpoint);
            let reply = link.request(peer, request, &mut |inbound: &PoolRequest| {
                pool.answer(inbound, &|id| directory.has_application(id), now)
            });
            match reply {
                Ok(RegistryReply::Ack) => debug!("Peer {} acknowledged us", peer),
                Ok(other) => warn!("Peer {} answered AddServer with {:?}", peer, other),
                Err(e) => warn!("Peer {} did not answer AddServer: {}", peer, e),
            }
        }
        self.directory.merge(&snapshot, now);
        self.publish_directory_events();

        info!(
            "Joined server pool as {} ({} peer(s), {} service(s))",
            server_id,
            self.pool.peer_ids().len(),
            self.directory.len()
        );
        Ok(server_id)
    }

    /// Runs one cooperative iteration. Blocks only on peer round trips
    /// while allocating ids.
    pub fn update(&mut self) -> Result<()> {
        self.process_peer_events();
        self.process_requests()?;
        self.process_expiry();
        self.process_schedule();
        Ok(())
    }

    /// Calls [`update`](Self::update) until `stop` is flipped, waiting up to
    /// `tick` for a request between iterations.
    pub fn auto_update(&mut self, tick: Duration, stop: &StopHandle) {
        self.auto_update_with(tick, stop, |_| {});
    }

    /// Like [`auto_update`](Self::auto_update), calling `idle` after every
    /// iteration on the loop's own thread.
    pub fn auto_update_with<F>(&mut self, tick: Duration, stop: &StopHandle, mut idle: F)
    where
        F: FnMut(&mut Self),
    {
        let tick_ms = i64::try_from(tick.as_millis()).unwrap_or(i64::MAX).max(1);
        while !stop.is_stopped() {
            if let Err(e) = self.update() {
                error!("Registry update failed: {}", e);
            }
            idle(self);
            if stop.is_stopped() {
                break;
            }
            if let Err(e) = transport::wait_readable(self.endpoint.socket(), tick_ms) {
                error!("Registry poll failed: {}", e);
                std::thread::sleep(tick);
            }
        }
        debug!("Registry update loop stopped");
    }

    /// Unregisters every service, telling subscribers, and closes the sockets.
    pub fn shutdown(mut self) {
        let removed = self.directory.unregister_all();
        self.publish_directory_events();
        info!("Registry shut down, {} service(s) unregistered", removed);
    }

    fn process_peer_events(&mut self) {
        let now = Instant::now();
        for (peer, event) in self.peers.drain_events() {
            self.pool.touch_server(peer, now);
            let RegistryEvent::ServerPool(event) = event else {
                continue;
            };
            match event {
                PoolEvent::ServerPulse(_) => {}
                PoolEvent::ServicePulse(application) => {
                    self.directory.touch(application, now);
                }
                PoolEvent::ServiceAdded {
                    application,
                    record,
                } => {
                    self.directory.merge(&single_record(application, record), now);
                }
                PoolEvent::ServiceRemoved { uid } => {
                    self.directory.unregister(&uid);
                }
                PoolEvent::FullSync(snapshot) => {
                    self.directory.merge(&snapshot, now);
                    for record in self.pool.unknown_servers(&snapshot.servers) {
                        if let Err(e) = self.add_peer(record, now) {
                            warn!("Could not connect to server learned from {}: {}", peer, e);
                        }
                    }
                }
            }
        }
        self.publish_directory_events();
    }

    fn process_requests(&mut self) -> Result<()> {
        while let Some(inbound) = self.endpoint.next()? {
            let reply = match wire::decode::<RegistryRequest>(inbound.body()) {
                Ok(request) => {
                    let name = request.name();
                    match self.handle_request(request) {
                        Ok(reply) => wire::encode(&reply).unwrap_or_else(|e| {
                            error!("Could not encode reply to {}: {}", name, e);
                            Vec::new()
                        }),
                        Err(e) => {
                            warn!("Request {} failed: {}", name, e);
                            Vec::new()
                        }
                    }
                }
                Err(e) => {
                    warn!("Protocol violation, undecodable request: {}", e);
                    Vec::new()
                }
            };
            self.endpoint.reply(inbound, reply)?;
            self.publish_directory_events();
        }
        Ok(())
    }

    fn handle_request(&mut self, request: RegistryRequest) -> Result<RegistryReply> {
        let now = Instant::now();
        match request {
            RegistryRequest::RegisterApplication => {
                let floor = self.directory.highest_application_id();
                let directory = &self.directory;
                let mut link = ServingLink::new(&self.peers, &mut self.endpoint);
                let application = self.pool.allocate_application_id(
                    floor,
                    &mut link,
                    &|id| directory.has_application(id),
                    now,
                )?;
                self.directory.insert_application(application, now);
                Ok(RegistryReply::Application(ApplicationGrant {
                    application,
                    heartbeat_interval_ms: duration_millis(self.config.heartbeat_interval()),
                    server_id: self.pool.own_id(),
                    alternates: self.pool.servers(),
                }))
            }
            RegistryRequest::RegisterService {
                application,
                record,
            } => {
                let record = record.with_origin(self.pool.own_id());
                let accepted = self.directory.register(application, record.clone(), now);
                if accepted && self.pool.is_pooled() {
                    self.publish(&RegistryEvent::ServerPool(PoolEvent::ServiceAdded {
                        application,
                        record,
                    }));
                }
                Ok(RegistryReply::Accepted(accepted))
            }
            RegistryRequest::UnregisterService { uid } => {
                let removed = self.directory.unregister(&uid);
                if removed && self.pool.is_pooled() {
                    self.publish(&RegistryEvent::ServerPool(PoolEvent::ServiceRemoved { uid }));
                }
                Ok(RegistryReply::Accepted(removed))
            }
            RegistryRequest::FindByUid { uid } => {
                Ok(RegistryReply::Service(self.directory.find_by_uid(&uid).cloned()))
            }
            RegistryRequest::FindByType { service_type } => {
                let found = self
                    .directory
                    .knows_type(&service_type)
                    .then(|| self.directory.find_by_type(&service_type));
                Ok(RegistryReply::Services(found))
            }
            RegistryRequest::Pulse { application } => {
                let known = self.directory.touch(application, now);
                if !known {
                    debug!("Pulse from unknown application {}", application);
                } else if self.pool.is_pooled() {
                    self.publish(&RegistryEvent::ServerPool(PoolEvent::ServicePulse(application)));
                }
                Ok(RegistryReply::PulseAck { known })
            }
            RegistryRequest::ServerPool(request) => self.handle_pool_request(request, now),
        }
    }

    fn handle_pool_request(&mut self, request: PoolRequest, now: Instant) -> Result<RegistryReply> {
        match request {
            PoolRequest::RequestServerUid {
                joiner_rpc,
                member_rpc,
                member_publish,
                ..
            } => {
                info!("Server at {} asks to join the pool", joiner_rpc);
                // Without an explicit advertise host, the addresses the
                // joiner used to reach us are the best ones to hand out.
                let (rpc, publish) = match self.config.advertise_host {
                    Some(_) => (self.rpc_address.clone(), self.publish_address.clone()),
                    None => (member_rpc, member_publish),
                };
                if let Some(id) = self.pool.seed(rpc.clone(), publish.clone(), now)? {
                    self.rpc_address = rpc;
                    self.publish_address = publish;
                    let claimed = self.directory.claim_unowned(id);
                    debug!("Stamped {} existing service(s) with {}", claimed, id);
                }
                let directory = &self.directory;
                let mut link = ServingLink::new(&self.peers, &mut self.endpoint);
                let server_id = self.pool.allocate_server_id(
                    &mut link,
                    &|id| directory.has_application(id),
                    now,
                )?;
                let snapshot = self.directory.snapshot(self.pool.own_id(), self.pool.servers());
                Ok(RegistryReply::ServerUidGranted {
                    server_id,
                    snapshot,
                })
            }
            request @ (PoolRequest::ReserveServerUid { .. } | PoolRequest::ReserveApplicationId { .. }) => {
                let directory = &self.directory;
                self.pool
                    .answer(&request, &|id| directory.has_application(id), now)
                    .ok_or_else(|| Error::Protocol(format!("{} left unanswered", request.name())))
            }
            PoolRequest::AddServer { server } => {
                self.add_peer(server, now)?;
                Ok(RegistryReply::Ack)
            }
        }
    }

    fn process_expiry(&mut self) {
        let now = Instant::now();
        let evicted = self
            .directory
            .sweep_expired(now, self.config.application_timeout);
        if !evicted.is_empty() {
            self.publish_directory_events();
        }

        for peer in self.pool.expired_peers(now) {
            warn!("Server {} stopped responding, removing it from the pool", peer);
            self.pool.remove_server(peer);
            self.peers.disconnect(peer);
            self.publish(&RegistryEvent::AlternateRegistryUnavailable(peer));
        }

        self.pool.prune_reservations(now);
    }

    fn process_schedule(&mut self) {
        let now = Instant::now();
        let Some(own_id) = self.pool.own_id() else {
            return;
        };
        if self.pool.pulse_due(now) {
            self.publish(&RegistryEvent::ServerPool(PoolEvent::ServerPulse(own_id)));
            self.pool.mark_pulsed(now);
        }
        if self.pool.sync_due(now) {
            let snapshot = self.directory.snapshot(Some(own_id), self.pool.servers());
            self.publish(&RegistryEvent::ServerPool(PoolEvent::FullSync(snapshot)));
            self.pool.mark_synced(now);
        }
    }

    /// Lists and connects a peer, and tells local clients about the new
    /// alternate registry.
    fn add_peer(&mut self, record: ServerRecord, now: Instant) -> Result<()> {
        self.peers.connect(&record)?;
        if self.pool.add_server(record.clone(), now) {
            info!("Server {} joined the pool at {}", record.server_id, record.rpc_address);
            self.publish(&RegistryEvent::AlternateRegistryAvailable(record));
        }
        Ok(())
    }

    fn publish_directory_events(&mut self) {
        for event in self.directory.drain_events() {
            let event = match event {
                DirectoryEvent::Registered(record) => RegistryEvent::ServiceRegistered(record),
                DirectoryEvent::Removed(record) => RegistryEvent::ServiceUnregistered(record),
            };
            self.publish(&event);
        }
    }

    fn publish(&self, event: &RegistryEvent) {
        let frame = match wire::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Could not encode notification: {}", e);
                return;
            }
        };
        if let Err(e) = self.publish_socket.send(frame, 0) {
            warn!("Publishing notification failed: {}", e);
        }
    }
}

/// Resolves the address to hand out for a bound endpoint.
fn advertised(bound: &Address, advertise_host: Option<&str>) -> Address {
    match advertise_host {
        Some(host) => bound.with_host(host),
        None if bound.is_wildcard_host() => bound.with_host(LOOPBACK),
        None => bound.clone(),
    }
}

/// A snapshot holding one gossiped registration.
fn single_record(application: ApplicationId, record: ServiceRecord) -> DirectorySnapshot {
    let mut snapshot = DirectorySnapshot::default();
    snapshot
        .applications
        .insert(application, vec![record.uid.clone()]);
    snapshot
        .services_by_type
        .insert(record.service_type.clone(), vec![record.clone()]);
    snapshot.services_by_uid = BTreeMap::from([(record.uid.clone(), record)]);
    snapshot
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
