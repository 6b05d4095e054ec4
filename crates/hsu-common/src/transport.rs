//! ZeroMQ socket helpers shared by servers, clients and proxies.
//!
//! Every socket here is created with linger 0 so that dropping its owner
//! never blocks on undelivered messages, and is released exactly once when
//! its owner drops it.

use crate::address::Address;
use crate::errors::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Creates a socket of `kind` with linger disabled.
pub fn socket(context: &zmq::Context, kind: zmq::SocketType) -> Result<zmq::Socket> {
    let socket = context.socket(kind)?;
    socket.set_linger(0)?;
    Ok(socket)
}

/// REQ socket that can send again after a timed-out request.
///
/// REQ_RELAXED lets the state machine skip a reply that never came;
/// REQ_CORRELATE discards a late reply to an abandoned request.
pub fn request_socket(context: &zmq::Context, timeout: Duration) -> Result<zmq::Socket> {
    let socket = socket(context, zmq::REQ)?;
    socket.set_req_relaxed(true)?;
    socket.set_req_correlate(true)?;
    socket.set_reconnect_ivl(100)?;
    socket.set_reconnect_ivl_max(2000)?;
    let millis = clamp_millis(timeout);
    socket.set_sndtimeo(millis)?;
    socket.set_rcvtimeo(millis)?;
    Ok(socket)
}

/// SUB socket that is not yet subscribed to anything.
pub fn subscriber(context: &zmq::Context) -> Result<zmq::Socket> {
    socket(context, zmq::SUB)
}

/// SUB socket subscribed to every message.
pub fn subscribe_all(context: &zmq::Context) -> Result<zmq::Socket> {
    let socket = subscriber(context)?;
    socket.set_subscribe(b"")?;
    Ok(socket)
}

pub fn connect(socket: &zmq::Socket, address: &Address) -> Result<()> {
    socket.connect(&address.to_string())?;
    Ok(())
}

/// Binds `socket` and returns the endpoint actually bound, with an
/// ephemeral `*` port resolved.
pub fn bind(socket: &zmq::Socket, address: &Address) -> Result<Address> {
    socket.bind(&address.to_string())?;
    let resolved = match socket.get_last_endpoint()? {
        Ok(endpoint) => Address::parse(&endpoint).unwrap_or_else(|_| address.clone()),
        Err(_) => address.clone(),
    };
    debug!("Bound {}", resolved);
    Ok(resolved)
}

/// Binds `socket`, walking upward from the address's port while the port is
/// taken, for at most `attempts` ports.
///
/// Addresses without a fixed port (ephemeral TCP, ipc, inproc) get a single
/// attempt.
pub fn bind_with_retry(socket: &zmq::Socket, address: &Address, attempts: u16) -> Result<Address> {
    let Some(first_port) = address.port() else {
        return bind(socket, address);
    };
    let attempts = attempts.max(1);
    let mut last_error = None;
    for offset in 0..attempts {
        let Some(port) = first_port.checked_add(offset) else {
            break;
        };
        match bind(socket, &address.with_port(port)) {
            Ok(bound) => return Ok(bound),
            Err(Error::Transport(zmq::Error::EADDRINUSE)) => {
                debug!("Port {} in use, trying next", port);
                last_error = Some(Error::Transport(zmq::Error::EADDRINUSE));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_error
        .unwrap_or_else(|| Error::validation(format!("no port available from {}", address)))
        .context(format!("bind {} ({} attempts)", address, attempts)))
}

/// Non-blocking receive. `Ok(None)` means nothing is pending.
pub fn try_recv(socket: &zmq::Socket) -> Result<Option<Vec<u8>>> {
    match socket.recv_bytes(zmq::DONTWAIT) {
        Ok(frame) => Ok(Some(frame)),
        Err(zmq::Error::EAGAIN) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Waits until `socket` has a message. A non-positive timeout waits forever.
pub fn wait_readable(socket: &zmq::Socket, timeout_ms: i64) -> Result<bool> {
    let timeout = if timeout_ms <= 0 { -1 } else { timeout_ms };
    Ok(socket.poll(zmq::POLLIN, timeout)? > 0)
}

/// One request/reply exchange on a REQ socket, bounded by `timeout`.
pub fn round_trip(
    socket: &zmq::Socket,
    frame: &[u8],
    timeout: Duration,
    operation: &str,
) -> Result<Vec<u8>> {
    let millis = clamp_millis(timeout);
    match socket.send(frame, 0) {
        Ok(()) => {}
        Err(zmq::Error::EAGAIN) => return Err(Error::timeout(operation, millis as u64)),
        Err(e) => return Err(e.into()),
    }
    if !wait_readable(socket, i64::from(millis))? {
        return Err(Error::timeout(operation, millis as u64));
    }
    Ok(socket.recv_bytes(0)?)
}

fn clamp_millis(timeout: Duration) -> i32 {
    i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ephemeral_bind_resolves_port() {
        let context = zmq::Context::new();
        let rep = socket(&context, zmq::REP).unwrap();
        let bound = bind(&rep, &Address::tcp_ephemeral("127.0.0.1")).unwrap();
        assert!(bound.port().is_some());
        assert_eq!(bound.host(), Some("127.0.0.1"));
    }

    #[test]
    fn test_bind_with_retry_skips_taken_port() {
        let context = zmq::Context::new();
        let first = socket(&context, zmq::PUB).unwrap();
        let taken = bind(&first, &Address::tcp_ephemeral("127.0.0.1")).unwrap();

        let second = socket(&context, zmq::PUB).unwrap();
        let bound = bind_with_retry(&second, &taken, 8).unwrap();
        assert_ne!(bound.port(), taken.port());
    }

    #[test]
    fn test_round_trip_and_timeout() {
        let context = zmq::Context::new();
        let dir = tempfile::tempdir().unwrap();
        let address = Address::ipc(dir.path().join("rt.sock"));

        let rep = socket(&context, zmq::REP).unwrap();
        let bound = bind(&rep, &address).unwrap();
        rep.set_rcvtimeo(1000).unwrap();
        let req = request_socket(&context, Duration::from_millis(200)).unwrap();
        connect(&req, &bound).unwrap();

        assert!(try_recv(&rep).unwrap().is_none());

        let handle = std::thread::spawn(move || {
            let frame = rep.recv_bytes(0).unwrap();
            rep.send(&frame[..], 0).unwrap();
            // Second request stays unanswered.
            let _ = rep.recv_bytes(0);
        });

        let reply = round_trip(&req, b"ping", Duration::from_millis(500), "echo").unwrap();
        assert_eq!(reply, b"ping");

        let err = round_trip(&req, b"again", Duration::from_millis(100), "echo").unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        handle.join().unwrap();
    }
}
