//! ZeroMQ connections to the other replicas of the pool.

use crate::endpoint::RpcEndpoint;
use crate::pool::{InboundPool, PeerLink};
use hsu_common::wire::{self, PoolRequest, RegistryEvent, RegistryReply, RegistryRequest};
use hsu_common::{transport, Error, Result, ServerId, ServerRecord};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

struct PeerSockets {
    record: ServerRecord,
    /// Pool requests to the peer's RPC endpoint.
    request: zmq::Socket,
    /// Everything the peer publishes; only pool gossip is acted on.
    events: zmq::Socket,
}

/// One request socket and one subscription per known peer.
///
/// Sockets are closed when the peer is disconnected or this value is dropped.
pub struct PeerConnections {
    context: zmq::Context,
    request_timeout: Duration,
    peers: BTreeMap<ServerId, PeerSockets>,
}

impl PeerConnections {
    pub fn new(context: zmq::Context, request_timeout: Duration) -> Self {
        Self {
            context,
            request_timeout,
            peers: BTreeMap::new(),
        }
    }

    /// Opens sockets to a peer. Reconnects if its addresses changed.
    pub fn connect(&mut self, record: &ServerRecord) -> Result<()> {
        if let Some(existing) = self.peers.get(&record.server_id) {
            if existing.record == *record {
                return Ok(());
            }
        }
        let request = transport::request_socket(&self.context, self.request_timeout)?;
        transport::connect(&request, &record.rpc_address)?;
        let events = transport::subscribe_all(&self.context)?;
        transport::connect(&events, &record.publish_address)?;

        debug!(
            "Connected to peer {} (rpc={}, publish={})",
            record.server_id, record.rpc_address, record.publish_address
        );
        self.peers.insert(
            record.server_id,
            PeerSockets {
                record: record.clone(),
                request,
                events,
            },
        );
        Ok(())
    }

    pub fn disconnect(&mut self, id: ServerId) -> bool {
        self.peers.remove(&id).is_some()
    }

    pub fn contains(&self, id: ServerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drains every peer subscription without blocking.
    pub fn drain_events(&mut self) -> Vec<(ServerId, RegistryEvent)> {
        let mut events = Vec::new();
        for (id, peer) in &self.peers {
            loop {
                match transport::try_recv(&peer.events) {
                    Ok(Some(frame)) => match wire::decode::<RegistryEvent>(&frame) {
                        Ok(event) => events.push((*id, event)),
                        Err(e) => warn!("Undecodable broadcast from peer {}: {}", id, e),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Receive from peer {} failed: {}", id, e);
                        break;
                    }
                }
            }
        }
        events
    }
}

/// Peer requests that keep the local RPC endpoint served while waiting.
///
/// A server blocked on a peer would otherwise leave that peer's own
/// proposals unanswered, and two servers allocating at once would each
/// wait out the other's timeout.
pub struct ServingLink<'a> {
    peers: &'a PeerConnections,
    endpoint: &'a mut RpcEndpoint,
}

impl<'a> ServingLink<'a> {
    pub fn new(peers: &'a PeerConnections, endpoint: &'a mut RpcEndpoint) -> Self {
        Self { peers, endpoint }
    }
}

impl PeerLink for ServingLink<'_> {
    fn request(
        &mut self,
        peer: ServerId,
        request: PoolRequest,
        inbound: &mut InboundPool<'_>,
    ) -> Result<RegistryReply> {
        let peers = self.peers;
        let sockets = peers
            .peers
            .get(&peer)
            .ok_or_else(|| Error::not_found(format!("connection to peer {}", peer)))?;
        let operation = request.name();
        let timeout = peers.request_timeout;
        let timed_out = || Error::timeout(operation, duration_millis(timeout) as u64);

        let frame = wire::encode(&RegistryRequest::ServerPool(request))?;
        match sockets.request.send(frame, 0) {
            Ok(()) => {}
            Err(zmq::Error::EAGAIN) => return Err(timed_out()),
            Err(e) => return Err(e.into()),
        }

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }
            let (reply_ready, inbound_ready) = {
                let mut items = [
                    sockets.request.as_poll_item(zmq::POLLIN),
                    self.endpoint.socket().as_poll_item(zmq::POLLIN),
                ];
                zmq::poll(&mut items, duration_millis(remaining).max(1))?;
                (items[0].is_readable(), items[1].is_readable())
            };
            if inbound_ready {
                self.endpoint.serve_pool_requests(inbound)?;
            }
            if reply_ready {
                return wire::decode(&sockets.request.recv_bytes(0)?);
            }
        }
    }
}

fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
