//! The registry's RPC endpoint: a ROUTER socket plus a backlog.
//!
//! Unlike REP, a ROUTER socket does not force one reply before the next
//! receive. While the server waits on a peer it can read every pending
//! request, answer the ones it can and park the rest for the next update.
//!
//! ```text
//! REQ client frame:  [body]
//! arriving at ROUTER: [identity, request id, "", body]
//!                     \__________ envelope ___/
//! ```
//!
//! Replies go out with the same envelope in front.

use crate::pool::InboundPool;
use hsu_common::wire::{self, RegistryRequest};
use hsu_common::{transport, Address, Result};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// A request received on the RPC endpoint, not yet answered.
#[derive(Debug)]
pub struct Inbound {
    envelope: Vec<Vec<u8>>,
    body: Vec<u8>,
}

impl Inbound {
    /// Splits a ROUTER message at its empty delimiter frame.
    fn from_frames(mut frames: Vec<Vec<u8>>) -> Option<Self> {
        let delimiter = frames.iter().position(|frame| frame.is_empty())?;
        let body = frames.drain(delimiter + 1..).next().unwrap_or_default();
        Some(Self {
            envelope: frames,
            body,
        })
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

pub struct RpcEndpoint {
    socket: zmq::Socket,
    backlog: VecDeque<Inbound>,
}

impl RpcEndpoint {
    /// Binds a ROUTER socket and returns it with the address actually bound.
    pub fn bind(context: &zmq::Context, address: &Address) -> Result<(Self, Address)> {
        let socket = transport::socket(context, zmq::ROUTER)?;
        let bound = transport::bind(&socket, address)?;
        Ok((
            Self {
                socket,
                backlog: VecDeque::new(),
            },
            bound,
        ))
    }

    pub fn socket(&self) -> &zmq::Socket {
        &self.socket
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Next request to handle: parked ones first, then the socket.
    pub fn next(&mut self) -> Result<Option<Inbound>> {
        if let Some(inbound) = self.backlog.pop_front() {
            return Ok(Some(inbound));
        }
        self.try_recv()
    }

    fn try_recv(&self) -> Result<Option<Inbound>> {
        loop {
            let frames = match self.socket.recv_multipart(zmq::DONTWAIT) {
                Ok(frames) => frames,
                Err(zmq::Error::EAGAIN) => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            match Inbound::from_frames(frames) {
                Some(inbound) => return Ok(Some(inbound)),
                None => warn!("Dropping RPC message without an envelope delimiter"),
            }
        }
    }

    /// Sends `body` back to whoever sent `inbound`.
    pub fn reply(&self, inbound: Inbound, body: Vec<u8>) -> Result<()> {
        let mut frames = inbound.envelope;
        frames.push(body);
        self.socket.send_multipart(frames, 0)?;
        Ok(())
    }

    /// Reads everything pending on the socket. Pool requests `answer` can
    /// handle are replied to at once; everything else is parked.
    pub fn serve_pool_requests(&mut self, answer: &mut InboundPool<'_>) -> Result<()> {
        while let Some(inbound) = self.try_recv()? {
            let reply = match wire::decode::<RegistryRequest>(inbound.body()) {
                Ok(RegistryRequest::ServerPool(request)) => answer(&request),
                _ => None,
            };
            match reply {
                Some(reply) => {
                    debug!("Answered a pool request while waiting on a peer");
                    self.reply(inbound, wire::encode(&reply)?)?;
                }
                None => self.backlog.push_back(inbound),
            }
        }
        Ok(())
    }
}
