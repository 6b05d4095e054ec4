//! Server pool membership and pool-wide id allocation.
//!
//! # Rust Learning Note
//!
//! The pool is split into **state** ([`ServerPool`]) and **transport**
//! (anything implementing [`PeerLink`]). Allocation takes the link as a
//! `&mut dyn PeerLink` argument instead of owning sockets, so:
//!
//! - the registry server passes its ZeroMQ peer connections;
//! - tests pass an in-memory cluster and can interleave joins freely.
//!
//! ## Allocation
//!
//! ```text
//! candidate = max(own id, known ids, reserved ids) + 1
//! loop:
//!     reserve candidate locally, mark it in flight
//!     ask every known peer to reserve it
//!     all accepted and not yielded? -> done
//!     a peer said no                -> next candidate
//!     a peer did not answer         -> back off, next candidate
//! ```
//!
//! Two servers can have the same candidate in flight at once. Each one
//! answers the other's proposal while it waits (see [`PeerLink::request`]),
//! and the proposal from the lower server id wins. Silence never counts
//! as consent.
//!
//! Application ids use the same handshake with their own reservation set.

use crate::reservation::ReservationSet;
use hsu_common::wire::{PoolRequest, RegistryReply};
use hsu_common::{Address, ApplicationId, Error, Result, ServerId, ServerRecord};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Answers pool requests that arrive while this server waits on a peer.
/// `None` leaves the request for the regular update loop.
pub type InboundPool<'a> = dyn FnMut(&PoolRequest) -> Option<RegistryReply> + 'a;

/// Sends server-to-server requests on behalf of the pool.
pub trait PeerLink {
    /// Sends `request` to a known peer and waits for its reply.
    ///
    /// Requests other servers send to this one in the meantime go through
    /// `inbound`, so two servers waiting on each other both get answers.
    fn request(&mut self, peer: ServerId, request: PoolRequest, inbound: &mut InboundPool<'_>) -> Result<RegistryReply>;
}

/// Membership state of one registry server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// No peers known.
    Standalone,
    /// At least one peer known.
    Pooled,
}

/// Timing and retry knobs of the pool protocol.
#[derive(Debug, Clone)]
pub struct PoolTiming {
    /// Peer silence after which a peer is evicted.
    pub server_timeout: Duration,
    /// Interval between full snapshot broadcasts.
    pub full_sync_interval: Duration,
    /// Age after which an unconfirmed reservation is dropped.
    pub reservation_ttl: Duration,
    /// Proposals tried before allocation gives up.
    pub max_proposal_rounds: u32,
    /// Pause after a round a peer left unanswered; doubles per such round.
    pub retry_backoff: Duration,
    /// Unanswered rounds tolerated before allocation gives up.
    pub max_unanswered_rounds: u32,
}

impl PoolTiming {
    /// Heartbeats go out three times per timeout window.
    pub fn pulse_interval(&self) -> Duration {
        self.server_timeout / 3
    }
}

impl Default for PoolTiming {
    fn default() -> Self {
        Self {
            server_timeout: Duration::from_secs(5),
            full_sync_interval: Duration::from_secs(10),
            reservation_ttl: Duration::from_secs(10),
            max_proposal_rounds: 64,
            retry_backoff: Duration::from_millis(25),
            max_unanswered_rounds: 3,
        }
    }
}

/// A candidate this server is proposing right now.
#[derive(Debug, Clone, Copy)]
struct InFlight<T> {
    candidate: T,
    /// Set once a lower-id peer claimed the same candidate.
    yielded: bool,
}

impl<T> InFlight<T> {
    fn new(candidate: T) -> Self {
        Self {
            candidate,
            yielded: false,
        }
    }

    /// A peer proposes our candidate. The lower server id keeps it.
    fn contest(&mut self, proposer: ServerId, own_id: Option<ServerId>) -> bool {
        let proposer_wins = own_id.map_or(true, |own| proposer < own);
        if proposer_wins {
            self.yielded = true;
        }
        proposer_wins
    }
}

/// How the peers answered one proposal round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Rejected,
    Unanswered,
}

#[derive(Debug, Clone)]
struct PeerEntry {
    record: ServerRecord,
    last_seen: Instant,
}

/// Pool membership, liveness and id reservations of one server.
#[derive(Debug)]
pub struct ServerPool {
    timing: PoolTiming,
    own_id: Option<ServerId>,
    /// Every known replica, this server included once it has an id.
    servers: BTreeMap<ServerId, PeerEntry>,
    reserved_servers: ReservationSet<ServerId>,
    reserved_applications: ReservationSet<ApplicationId>,
    /// Highest application id allocated through this server.
    application_high_water: ApplicationId,
    server_flight: Option<InFlight<ServerId>>,
    application_flight: Option<InFlight<ApplicationId>>,
    last_pulse: Option<Instant>,
    last_sync: Option<Instant>,
    sync_requested: bool,
}

impl ServerPool {
    pub fn new(timing: PoolTiming) -> Self {
        Self {
            timing,
            own_id: None,
            servers: BTreeMap::new(),
            reserved_servers: ReservationSet::new(),
            reserved_applications: ReservationSet::new(),
            application_high_water: ApplicationId::default(),
            server_flight: None,
            application_flight: None,
            last_pulse: None,
            last_sync: None,
            sync_requested: false,
        }
    }

    pub fn timing(&self) -> &PoolTiming {
        &self.timing
    }

    pub fn own_id(&self) -> Option<ServerId> {
        self.own_id
    }

    pub fn own_record(&self) -> Option<&ServerRecord> {
        self.own_id
            .and_then(|id| self.servers.get(&id))
            .map(|entry| &entry.record)
    }

    pub fn state(&self) -> PoolState {
        if self.peer_ids().is_empty() {
            PoolState::Standalone
        } else {
            PoolState::Pooled
        }
    }

    pub fn is_pooled(&self) -> bool {
        self.state() == PoolState::Pooled
    }

    /// Sets this server's global id. An id is assigned at most once.
    pub fn assign_own_id(&mut self, id: ServerId) -> Result<()> {
        if let Some(current) = self.own_id {
            return Err(Error::ServerIdAlreadyAssigned {
                current,
                attempted: id,
            });
        }
        self.own_id = Some(id);
        self.reserved_servers.release(id);
        Ok(())
    }

    /// Takes `record.server_id` as this server's id and lists itself.
    pub fn adopt(&mut self, record: ServerRecord, now: Instant) -> Result<()> {
        self.assign_own_id(record.server_id)?;
        self.servers.insert(
            record.server_id,
            PeerEntry {
                record,
                last_seen: now,
            },
        );
        Ok(())
    }

    /// Makes this server #1 of a new pool if it has never had an id.
    ///
    /// Returns the id when seeding happened.
    pub fn seed(&mut self, rpc_address: Address, publish_address: Address, now: Instant) -> Result<Option<ServerId>> {
        if self.own_id.is_some() {
            return Ok(None);
        }
        self.adopt(
            ServerRecord::new(ServerId::FIRST, rpc_address, publish_address),
            now,
        )?;
        info!("Seeded a new server pool as {}", ServerId::FIRST);
        Ok(Some(ServerId::FIRST))
    }

    pub fn is_known(&self, id: ServerId) -> bool {
        self.servers.contains_key(&id)
    }

    /// Known peers, excluding this server, in ascending id order.
    pub fn peer_ids(&self) -> Vec<ServerId> {
        self.servers
            .keys()
            .copied()
            .filter(|id| Some(*id) != self.own_id)
            .collect()
    }

    /// Every known replica, this server included.
    pub fn servers(&self) -> Vec<ServerRecord> {
        self.servers.values().map(|entry| entry.record.clone()).collect()
    }

    fn next_server_candidate(&self) -> ServerId {
        let highest = [
            self.own_id,
            self.servers.keys().next_back().copied(),
            self.reserved_servers.max(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(ServerId::new(0));
        highest.next()
    }

    fn next_application_candidate(&self, floor: ApplicationId) -> ApplicationId {
        floor
            .max(self.application_high_water)
            .max(self.reserved_applications.max().unwrap_or_default())
            .next()
    }

    /// Id sent along with proposals. Without an own id there are no peers
    /// to send them to.
    fn proposer(&self) -> ServerId {
        self.own_id.unwrap_or(ServerId::new(0))
    }

    /// Allocates a global id for a joining server.
    ///
    /// `known_application` answers application reservations that arrive
    /// while a peer is being asked.
    pub fn allocate_server_id(
        &mut self,
        link: &mut dyn PeerLink,
        known_application: &dyn Fn(ApplicationId) -> bool,
        now: Instant,
    ) -> Result<ServerId> {
        let mut unanswered = 0;
        for _ in 0..self.timing.max_proposal_rounds {
            let candidate = self.next_server_candidate();
            self.reserved_servers.reserve(candidate, now);
            self.server_flight = Some(InFlight::new(candidate));
            let request = PoolRequest::ReserveServerUid {
                proposal: candidate,
                proposer: self.proposer(),
            };
            let verdict = self.broadcast_reservation(link, request, known_application, now);
            let yielded = self.server_flight.take().map_or(false, |flight| flight.yielded);
            match verdict {
                Verdict::Accepted if !yielded => {
                    info!("Allocated server id {}", candidate);
                    return Ok(candidate);
                }
                Verdict::Unanswered => {
                    unanswered += 1;
                    self.back_off(unanswered, "server id")?;
                }
                _ => debug!("Server id {} not granted, trying next", candidate),
            }
        }
        Err(Error::conflict(format!(
            "no server id accepted after {} proposals",
            self.timing.max_proposal_rounds
        )))
    }

    /// Peer side of server id allocation.
    pub fn reserve_server_id(&mut self, proposal: ServerId, proposer: ServerId, now: Instant) -> bool {
        if Some(proposal) == self.own_id || self.servers.contains_key(&proposal) {
            debug!("Rejecting server id proposal {}", proposal);
            return false;
        }
        if let Some(flight) = self.server_flight.as_mut().filter(|f| f.candidate == proposal) {
            let granted = flight.contest(proposer, self.own_id);
            debug!("Server {} proposed our candidate {}, granted: {}", proposer, proposal, granted);
            return granted;
        }
        if self.reserved_servers.contains(proposal) {
            debug!("Rejecting server id proposal {}", proposal);
            return false;
        }
        self.reserved_servers.reserve(proposal, now)
    }

    /// Allocates a pool-unique application id above `floor` (the highest id
    /// the local directory knows). `known_application` tells whether the
    /// local directory has an id. With no peers this never fails.
    pub fn allocate_application_id(
        &mut self,
        floor: ApplicationId,
        link: &mut dyn PeerLink,
        known_application: &dyn Fn(ApplicationId) -> bool,
        now: Instant,
    ) -> Result<ApplicationId> {
        let mut unanswered = 0;
        for _ in 0..self.timing.max_proposal_rounds {
            let candidate = self.next_application_candidate(floor);
            self.reserved_applications.reserve(candidate, now);
            self.application_flight = Some(InFlight::new(candidate));
            let request = PoolRequest::ReserveApplicationId {
                proposal: candidate,
                proposer: self.proposer(),
            };
            let verdict = self.broadcast_reservation(link, request, known_application, now);
            let yielded = self.application_flight.take().map_or(false, |flight| flight.yielded);
            match verdict {
                Verdict::Accepted if !yielded => {
                    self.application_high_water = candidate;
                    return Ok(candidate);
                }
                Verdict::Unanswered => {
                    unanswered += 1;
                    self.back_off(unanswered, "application id")?;
                }
                _ => debug!("Application id {} not granted, trying next", candidate),
            }
        }
        Err(Error::conflict(format!(
            "no application id accepted after {} proposals",
            self.timing.max_proposal_rounds
        )))
    }

    /// Peer side of application id allocation. `known_locally` says whether
    /// the local directory already has this application.
    pub fn reserve_application_id(
        &mut self,
        proposal: ApplicationId,
        proposer: ServerId,
        known_locally: bool,
        now: Instant,
    ) -> bool {
        if known_locally {
            debug!("Rejecting application id proposal {}", proposal);
            return false;
        }
        if let Some(flight) = self.application_flight.as_mut().filter(|f| f.candidate == proposal) {
            let granted = flight.contest(proposer, self.own_id);
            debug!("Server {} proposed our candidate {}, granted: {}", proposer, proposal, granted);
            return granted;
        }
        if self.reserved_applications.contains(proposal) {
            debug!("Rejecting application id proposal {}", proposal);
            return false;
        }
        self.reserved_applications.reserve(proposal, now)
    }

    /// Answers the pool requests that only need pool state: the two
    /// reservation handshakes. Anything else is `None`.
    pub fn answer(
        &mut self,
        request: &PoolRequest,
        known_application: &dyn Fn(ApplicationId) -> bool,
        now: Instant,
    ) -> Option<RegistryReply> {
        match request {
            PoolRequest::ReserveServerUid { proposal, proposer } => Some(RegistryReply::Accepted(
                self.reserve_server_id(*proposal, *proposer, now),
            )),
            PoolRequest::ReserveApplicationId { proposal, proposer } => {
                let known = known_application(*proposal);
                Some(RegistryReply::Accepted(
                    self.reserve_application_id(*proposal, *proposer, known, now),
                ))
            }
            PoolRequest::RequestServerUid { .. } | PoolRequest::AddServer { .. } => None,
        }
    }

    /// Asks every peer to reserve, stopping at the first refusal. A peer
    /// that doesn't answer in time refuses.
    fn broadcast_reservation(
        &mut self,
        link: &mut dyn PeerLink,
        request: PoolRequest,
        known_application: &dyn Fn(ApplicationId) -> bool,
        now: Instant,
    ) -> Verdict {
        for peer in self.peer_ids() {
            let reply = link.request(peer, request.clone(), &mut |inbound: &PoolRequest| {
                self.answer(inbound, known_application, now)
            });
            match reply {
                Ok(RegistryReply::Accepted(true)) => {}
                Ok(RegistryReply::Accepted(false)) => return Verdict::Rejected,
                Ok(other) => {
                    warn!("Peer {} answered {} with {:?}, counting it as a refusal", peer, request.name(), other);
                    return Verdict::Rejected;
                }
                Err(e) => {
                    warn!("Peer {} did not answer {}: {}", peer, request.name(), e);
                    return Verdict::Unanswered;
                }
            }
        }
        Verdict::Accepted
    }

    /// Waits before the next proposal after `unanswered` silent rounds, or
    /// gives up once there were too many.
    fn back_off(&self, unanswered: u32, what: &str) -> Result<()> {
        if unanswered >= self.timing.max_unanswered_rounds {
            return Err(Error::conflict(format!(
                "no {} allocated, peers left {} proposal(s) unanswered",
                what, unanswered
            )));
        }
        let delay = self
            .timing
            .retry_backoff
            .saturating_mul(1u32 << unanswered.saturating_sub(1).min(4));
        debug!("Peer silent, retrying {} allocation in {:?}", what, delay);
        std::thread::sleep(delay);
        Ok(())
    }

    /// Lists a peer. Returns false if it was already known (its liveness is
    /// refreshed instead) or is this server.
    pub fn add_server(&mut self, record: ServerRecord, now: Instant) -> bool {
        let id = record.server_id;
        if Some(id) == self.own_id {
            return false;
        }
        if let Some(entry) = self.servers.get_mut(&id) {
            entry.last_seen = now;
            return false;
        }
        self.reserved_servers.release(id);
        self.servers.insert(
            id,
            PeerEntry {
                record,
                last_seen: now,
            },
        );
        self.sync_requested = true;
        true
    }

    /// Unlists a peer. This server itself is never removed.
    pub fn remove_server(&mut self, id: ServerId) -> Option<ServerRecord> {
        if Some(id) == self.own_id {
            return None;
        }
        self.servers.remove(&id).map(|entry| entry.record)
    }

    /// Records activity from a peer. Returns false if it is unknown.
    pub fn touch_server(&mut self, id: ServerId, now: Instant) -> bool {
        match self.servers.get_mut(&id) {
            Some(entry) => {
                entry.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Peers silent for at least the server timeout.
    pub fn expired_peers(&self, now: Instant) -> Vec<ServerId> {
        self.servers
            .values()
            .filter(|entry| Some(entry.record.server_id) != self.own_id)
            .filter(|entry| now.saturating_duration_since(entry.last_seen) >= self.timing.server_timeout)
            .map(|entry| entry.record.server_id)
            .collect()
    }

    /// Records from a remote server list that aren't known here yet.
    pub fn unknown_servers(&self, records: &[ServerRecord]) -> Vec<ServerRecord> {
        records
            .iter()
            .filter(|record| Some(record.server_id) != self.own_id)
            .filter(|record| !self.servers.contains_key(&record.server_id))
            .cloned()
            .collect()
    }

    pub fn prune_reservations(&mut self, now: Instant) {
        let ttl = self.timing.reservation_ttl;
        let dropped = self.reserved_servers.prune(now, ttl) + self.reserved_applications.prune(now, ttl);
        if dropped > 0 {
            debug!("Dropped {} stale reservation(s)", dropped);
        }
    }

    pub fn pulse_due(&self, now: Instant) -> bool {
        self.is_pooled()
            && self
                .last_pulse
                .map_or(true, |at| now.saturating_duration_since(at) >= self.timing.pulse_interval())
    }

    pub fn mark_pulsed(&mut self, now: Instant) {
        self.last_pulse = Some(now);
    }

    pub fn sync_due(&self, now: Instant) -> bool {
        self.is_pooled()
            && (self.sync_requested
                || self
                    .last_sync
                    .map_or(true, |at| now.saturating_duration_since(at) >= self.timing.full_sync_interval))
    }

    pub fn mark_synced(&mut self, now: Instant) {
        self.last_sync = Some(now);
        self.sync_requested = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Peers that answer reservations from a fixed script.
    struct ScriptedLink {
        answers: BTreeMap<ServerId, Vec<Result<RegistryReply>>>,
        /// Requests other servers send us while we wait on a given peer.
        crossing: BTreeMap<ServerId, Vec<PoolRequest>>,
        /// What we answered to the crossing requests.
        answered: Vec<Option<RegistryReply>>,
        seen: Vec<(ServerId, PoolRequest)>,
    }

    impl ScriptedLink {
        fn new() -> Self {
            Self {
                answers: BTreeMap::new(),
                crossing: BTreeMap::new(),
                answered: Vec::new(),
                seen: Vec::new(),
            }
        }

        fn answer(mut self, peer: u64, replies: Vec<Result<RegistryReply>>) -> Self {
            self.answers.insert(ServerId::new(peer), replies);
            self
        }

        fn crossing(mut self, peer: u64, requests: Vec<PoolRequest>) -> Self {
            self.crossing.insert(ServerId::new(peer), requests);
            self
        }
    }

    impl PeerLink for ScriptedLink {
        fn request(
            &mut self,
            peer: ServerId,
            request: PoolRequest,
            inbound: &mut InboundPool<'_>,
        ) -> Result<RegistryReply> {
            if let Some(requests) = self.crossing.remove(&peer) {
                for crossing in &requests {
                    self.answered.push(inbound(crossing));
                }
            }
            self.seen.push((peer, request));
            let queue = self
                .answers
                .get_mut(&peer)
                .ok_or_else(|| Error::not_found(format!("peer {}", peer)))?;
            if queue.is_empty() {
                return Ok(RegistryReply::Accepted(true));
            }
            queue.remove(0)
        }
    }

    fn unknown(_: ApplicationId) -> bool {
        false
    }

    fn server(id: u64) -> ServerRecord {
        ServerRecord::new(
            ServerId::new(id),
            Address::tcp("127.0.0.1", 5000 + id as u16 * 2),
            Address::tcp("127.0.0.1", 5001 + id as u16 * 2),
        )
    }

    fn pool_with_peers(own: u64, peers: &[u64], now: Instant) -> ServerPool {
        let mut pool = ServerPool::new(PoolTiming {
            retry_backoff: Duration::from_millis(1),
            ..PoolTiming::default()
        });
        pool.adopt(server(own), now).unwrap();
        for peer in peers {
            pool.add_server(server(*peer), now);
        }
        pool
    }

    fn timed_out(operation: &str) -> Result<RegistryReply> {
        Err(Error::timeout(operation, 100))
    }

    #[test]
    fn test_seed_and_first_allocation() {
        let now = Instant::now();
        let mut pool = ServerPool::new(PoolTiming::default());
        assert_eq!(pool.state(), PoolState::Standalone);

        let seeded = pool
            .seed(Address::tcp("h", 5555), Address::tcp("h", 5556), now)
            .unwrap();
        assert_eq!(seeded, Some(ServerId::FIRST));
        assert_eq!(pool.own_record().unwrap().rpc_address, Address::tcp("h", 5555));

        let mut link = ScriptedLink::new();
        assert_eq!(pool.allocate_server_id(&mut link, &unknown, now).unwrap(), ServerId::new(2));
        assert!(link.seen.is_empty());

        // Reserved locally, so the next proposal skips it.
        assert_eq!(pool.allocate_server_id(&mut link, &unknown, now).unwrap(), ServerId::new(3));
        assert_eq!(pool.seed(Address::tcp("h", 1), Address::tcp("h", 2), now).unwrap(), None);
    }

    #[test]
    fn test_own_id_assigned_once() {
        let mut pool = ServerPool::new(PoolTiming::default());
        pool.assign_own_id(ServerId::new(4)).unwrap();
        let err = pool.assign_own_id(ServerId::new(5)).unwrap_err();
        assert!(matches!(
            err,
            Error::ServerIdAlreadyAssigned { current, attempted }
                if current == ServerId::new(4) && attempted == ServerId::new(5)
        ));
        assert_eq!(pool.own_id(), Some(ServerId::new(4)));
    }

    #[test]
    fn test_rejection_moves_to_next_candidate() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let mut link = ScriptedLink::new().answer(2, vec![Ok(RegistryReply::Accepted(false))]);

        let id = pool.allocate_server_id(&mut link, &unknown, now).unwrap();
        assert_eq!(id, ServerId::new(4));
        assert_eq!(link.seen.len(), 2);
        assert!(link.seen.iter().all(|(peer, _)| *peer == ServerId::new(2)));
        assert!(matches!(
            link.seen[0].1,
            PoolRequest::ReserveServerUid { proposer, .. } if proposer == ServerId::new(1)
        ));
    }

    #[test]
    fn test_silent_peer_counts_as_refusal() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2, 3], now);
        let mut link = ScriptedLink::new()
            .answer(2, vec![timed_out("ReserveServerUid")])
            .answer(3, vec![]);

        // Id 4 went unanswered by peer 2, so it is never handed out.
        assert_eq!(pool.allocate_server_id(&mut link, &unknown, now).unwrap(), ServerId::new(5));
        let asked_3: Vec<_> = link
            .seen
            .iter()
            .filter(|(peer, _)| *peer == ServerId::new(3))
            .collect();
        assert_eq!(asked_3.len(), 1);
    }

    #[test]
    fn test_unexpected_reply_counts_as_refusal() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let mut link = ScriptedLink::new().answer(2, vec![Ok(RegistryReply::Ack)]);
        let id = pool
            .allocate_application_id(ApplicationId::new(0), &mut link, &unknown, now)
            .unwrap();
        assert_eq!(id, ApplicationId::new(2));
    }

    #[test]
    fn test_allocation_gives_up_when_peers_stay_silent() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let silence = (0..5).map(|_| timed_out("ReserveApplicationId")).collect();
        let mut link = ScriptedLink::new().answer(2, silence);

        let err = pool
            .allocate_application_id(ApplicationId::new(0), &mut link, &unknown, now)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert_eq!(link.seen.len(), 3);
    }

    #[test]
    fn test_reserve_server_id_rules() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let peer = ServerId::new(2);
        assert!(!pool.reserve_server_id(ServerId::new(1), peer, now));
        assert!(!pool.reserve_server_id(ServerId::new(2), peer, now));
        assert!(pool.reserve_server_id(ServerId::new(3), peer, now));
        assert!(!pool.reserve_server_id(ServerId::new(3), peer, now));

        // Joining under the reserved id releases the reservation.
        assert!(pool.add_server(server(3), now));
        assert!(!pool.add_server(server(3), now));
        assert_eq!(pool.peer_ids(), vec![ServerId::new(2), ServerId::new(3)]);
    }

    #[test]
    fn test_application_ids_are_pool_unique() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let mut link = ScriptedLink::new().answer(
            2,
            vec![Ok(RegistryReply::Accepted(false)), Ok(RegistryReply::Accepted(true))],
        );
        let id = pool
            .allocate_application_id(ApplicationId::new(10), &mut link, &unknown, now)
            .unwrap();
        assert_eq!(id, ApplicationId::new(12));

        let next = pool
            .allocate_application_id(ApplicationId::new(0), &mut link, &unknown, now)
            .unwrap();
        assert!(next > id);

        let peer = ServerId::new(2);
        assert!(!pool.reserve_application_id(ApplicationId::new(50), peer, true, now));
        assert!(pool.reserve_application_id(ApplicationId::new(50), peer, false, now));
        assert!(!pool.reserve_application_id(ApplicationId::new(50), peer, false, now));
    }

    #[test]
    fn test_equal_candidates_lower_server_wins() {
        let now = Instant::now();
        let same = |proposer: u64| PoolRequest::ReserveApplicationId {
            proposal: ApplicationId::new(1),
            proposer: ServerId::new(proposer),
        };

        // Server 2 has candidate 1 in flight when server 1 proposes it too.
        let mut higher = pool_with_peers(2, &[1], now);
        let mut link = ScriptedLink::new().answer(1, vec![]).crossing(1, vec![same(1)]);
        let id = higher
            .allocate_application_id(ApplicationId::new(0), &mut link, &unknown, now)
            .unwrap();
        assert_eq!(link.answered, vec![Some(RegistryReply::Accepted(true))]);
        assert_eq!(id, ApplicationId::new(2));

        // Server 1 keeps candidate 1 against server 2.
        let mut lower = pool_with_peers(1, &[2], now);
        let mut link = ScriptedLink::new().answer(2, vec![]).crossing(2, vec![same(2)]);
        let id = lower
            .allocate_application_id(ApplicationId::new(0), &mut link, &unknown, now)
            .unwrap();
        assert_eq!(link.answered, vec![Some(RegistryReply::Accepted(false))]);
        assert_eq!(id, ApplicationId::new(1));
    }

    #[test]
    fn test_yielded_server_id_is_not_handed_out() {
        let now = Instant::now();
        // Peer 1 learned about us but we have not learned about it, so our
        // broadcast only reaches peer 3.
        let mut pool = pool_with_peers(2, &[3], now);
        let crossing = PoolRequest::ReserveServerUid {
            proposal: ServerId::new(4),
            proposer: ServerId::new(1),
        };
        let mut link = ScriptedLink::new().answer(3, vec![]).crossing(3, vec![crossing]);

        let id = pool.allocate_server_id(&mut link, &unknown, now).unwrap();
        assert_eq!(link.answered, vec![Some(RegistryReply::Accepted(true))]);
        assert_eq!(id, ServerId::new(5));
    }

    #[test]
    fn test_answer_handles_reservations_only() {
        let now = Instant::now();
        let mut pool = pool_with_peers(1, &[2], now);
        let known = |id: ApplicationId| id == ApplicationId::new(7);

        let reply = pool.answer(
            &PoolRequest::ReserveApplicationId {
                proposal: ApplicationId::new(7),
                proposer: ServerId::new(2),
            },
            &known,
            now,
        );
        assert_eq!(reply, Some(RegistryReply::Accepted(false)));

        let reply = pool.answer(
            &PoolRequest::ReserveServerUid {
                proposal: ServerId::new(3),
                proposer: ServerId::new(2),
            },
            &known,
            now,
        );
        assert_eq!(reply, Some(RegistryReply::Accepted(true)));

        let add = PoolRequest::AddServer { server: server(4) };
        assert_eq!(pool.answer(&add, &known, now), None);
    }

    #[test]
    fn test_peer_expiry_returns_to_standalone() {
        let t0 = Instant::now();
        let mut pool = pool_with_peers(1, &[2, 3], t0);
        assert!(pool.is_pooled());

        pool.touch_server(ServerId::new(3), t0 + Duration::from_secs(3));
        let expired = pool.expired_peers(t0 + Duration::from_secs(5));
        assert_eq!(expired, vec![ServerId::new(2)]);

        for id in [ServerId::new(2), ServerId::new(3)] {
            pool.remove_server(id);
        }
        assert_eq!(pool.state(), PoolState::Standalone);
        assert!(pool.remove_server(ServerId::new(1)).is_none());
        assert_eq!(pool.own_id(), Some(ServerId::new(1)));
    }

    #[test]
    fn test_pulse_and_sync_schedule() {
        let t0 = Instant::now();
        let mut standalone = ServerPool::new(PoolTiming::default());
        assert!(!standalone.pulse_due(t0));
        standalone.seed(Address::tcp("h", 1), Address::tcp("h", 2), t0).unwrap();
        assert!(!standalone.sync_due(t0));

        let mut pool = pool_with_peers(1, &[2], t0);
        assert!(pool.pulse_due(t0));
        pool.mark_pulsed(t0);
        assert!(!pool.pulse_due(t0 + Duration::from_millis(1000)));
        assert!(pool.pulse_due(t0 + Duration::from_millis(1700)));

        assert!(pool.sync_due(t0));
        pool.mark_synced(t0);
        assert!(!pool.sync_due(t0 + Duration::from_secs(9)));
        assert!(pool.sync_due(t0 + Duration::from_secs(10)));

        pool.mark_synced(t0);
        pool.add_server(server(3), t0);
        assert!(pool.sync_due(t0));
    }

    #[test]
    fn test_unknown_servers_filters_self_and_known() {
        let now = Instant::now();
        let pool = pool_with_peers(1, &[2], now);
        let fresh = pool.unknown_servers(&[server(1), server(2), server(3)]);
        assert_eq!(fresh, vec![server(3)]);
    }
}
