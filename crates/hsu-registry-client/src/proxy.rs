//! Client-side handle on one remote service instance or a group of
//! instances sharing a type.
//!
//! # Rust Learning Note
//!
//! ## Shared handle, single owner of the sockets
//!
//! ```text
//! ServiceProxy ──Arc──▶ Mutex<ProxyInner> ◀──Weak── RegistryClient
//!                         ├── REQ socket  (load-balanced calls)
//!                         └── SUB socket  (merged event stream)
//! ```
//!
//! The caller owns the proxy; the client that created it only keeps a
//! `Weak` so it can feed directory changes in. A dropped proxy simply
//! stops being upgraded, and its sockets close with the last `Arc`.
//!
//! ## Rebuilding instead of disconnecting
//!
//! Removing an instance means recreating both sockets and reconnecting to
//! the survivors. Removals only mark the proxy dirty; the rebuild happens
//! once, before the next call or receive, however many instances left.

use hsu_common::wire::{self, ServiceBroadcast, ServiceEvent, ServiceRequest, ServiceResponse};
use hsu_common::{transport, Error, Result, ServiceRecord, ServiceUid, Value};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Callback invoked for every event the proxy receives.
pub type Subscriber = Box<dyn FnMut(&ServiceEvent) + Send>;

/// Token returned by [`ServiceProxy::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    /// Exactly the instance with this uid.
    Single(ServiceUid),
    /// Every instance of the proxy's type.
    Group,
}

pub(crate) struct ProxyInner {
    context: zmq::Context,
    service_type: String,
    target: Target,
    instances: BTreeMap<ServiceUid, ServiceRecord>,
    request: zmq::Socket,
    events: zmq::Socket,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    subscriber_count: usize,
    next_subscription: u64,
    /// Subscriptions cancelled while their callbacks were out for dispatch.
    cancelled: Vec<SubscriptionId>,
    /// Ids whose callbacks `receive` is running outside the lock.
    in_dispatch: Vec<SubscriptionId>,
    rebuild_pending: bool,
    default_timeout_ms: i64,
}

impl ProxyInner {
    fn new(
        context: &zmq::Context,
        service_type: String,
        target: Target,
        records: Vec<ServiceRecord>,
        default_timeout_ms: i64,
    ) -> Result<Self> {
        let mut inner = Self {
            context: context.clone(),
            service_type,
            target,
            instances: BTreeMap::new(),
            request: request_socket(context)?,
            events: transport::subscriber(context)?,
            subscribers: Vec::new(),
            subscriber_count: 0,
            next_subscription: 0,
            cancelled: Vec::new(),
            in_dispatch: Vec::new(),
            rebuild_pending: false,
            default_timeout_ms,
        };
        for record in records {
            inner.add_service(record)?;
        }
        Ok(inner)
    }

    fn accepts(&self, record: &ServiceRecord) -> bool {
        if record.service_type != self.service_type {
            return false;
        }
        match self.target {
            Target::Single(ref uid) => *uid == record.uid,
            Target::Group => true,
        }
    }

    fn add_service(&mut self, record: ServiceRecord) -> Result<bool> {
        if !self.accepts(&record) {
            return Ok(false);
        }
        match self.instances.get(&record.uid) {
            Some(existing) if existing.same_endpoints(&record) => return Ok(false),
            Some(_) => {
                // Moved endpoints: the old connection has to go.
                debug!("Instance {} moved to {}", record.uid, record.rpc_address);
                self.instances.insert(record.uid.clone(), record);
                self.rebuild_pending = true;
                return Ok(true);
            }
            None => {}
        }
        if !self.rebuild_pending {
            transport::connect(&self.request, &record.rpc_address)?;
            transport::connect(&self.events, &record.publish_address)?;
        }
        debug!(
            "Proxy for {} added instance {} at {}",
            self.service_type, record.uid, record.rpc_address
        );
        self.instances.insert(record.uid.clone(), record);
        Ok(true)
    }

    fn remove_service(&mut self, uid: &ServiceUid) -> bool {
        if self.instances.remove(uid).is_none() {
            return false;
        }
        debug!("Proxy for {} dropped instance {}", self.service_type, uid);
        self.rebuild_pending = true;
        true
    }

    fn rebuild_connections(&mut self) -> Result<()> {
        let request = request_socket(&self.context)?;
        let events = transport::subscriber(&self.context)?;
        if self.subscriber_count > 0 {
            events.set_subscribe(b"")?;
        }
        for record in self.instances.values() {
            transport::connect(&request, &record.rpc_address)?;
            transport::connect(&events, &record.publish_address)?;
        }
        // Old sockets close here, on drop.
        self.request = request;
        self.events = events;
        self.rebuild_pending = false;
        debug!(
            "Rebuilt proxy connections for {} ({} instance(s))",
            self.service_type,
            self.instances.len()
        );
        Ok(())
    }

    fn flush_rebuild(&mut self) -> Result<()> {
        if self.rebuild_pending {
            self.rebuild_connections()?;
        }
        Ok(())
    }

    fn call(&mut self, method: &str, timeout_ms: i64, args: Vec<Value>) -> Result<Value> {
        if self.instances.is_empty() {
            return Err(Error::call_failed(method, "no service instances available"));
        }
        if let Some(missing) = self.instances.values().find(|record| !record.has_method(method)) {
            debug!("Instance {} does not expose {}", missing.uid, method);
            return Err(Error::method_not_callable(method, &self.service_type));
        }
        self.flush_rebuild()
            .map_err(|e| Error::call_failed(method, e.to_string()))?;

        let frame = wire::encode(&ServiceRequest::Call {
            method: method.to_string(),
            args,
        })?;
        let started = Instant::now();
        let send_timeout = if timeout_ms <= 0 {
            -1
        } else {
            i32::try_from(timeout_ms).unwrap_or(i32::MAX)
        };
        self.request
            .set_sndtimeo(send_timeout)
            .map_err(|e| Error::call_failed(method, e.to_string()))?;

        match self.request.send(frame, 0) {
            Ok(()) => {}
            Err(zmq::Error::EAGAIN) => return self.timed_out(method, timeout_ms),
            Err(e) => return Err(Error::call_failed(method, e.to_string())),
        }
        // The send may have used part of the budget.
        let wait_ms = if timeout_ms <= 0 {
            timeout_ms
        } else {
            let spent = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);
            timeout_ms.saturating_sub(spent).max(1)
        };
        match transport::wait_readable(&self.request, wait_ms) {
            Ok(true) => {}
            Ok(false) => return self.timed_out(method, timeout_ms),
            Err(e) => return Err(Error::call_failed(method, e.to_string())),
        }
        let reply = self
            .request
            .recv_bytes(0)
            .map_err(|e| Error::call_failed(method, e.to_string()))?;
        if reply.is_empty() {
            return Err(Error::call_failed(method, "remote invocation failed"));
        }
        match wire::decode::<ServiceResponse>(&reply) {
            Ok(ServiceResponse::Result(value)) => Ok(value),
            Err(e) => Err(Error::call_failed(method, e.to_string())),
        }
    }

    /// Recreates the sockets so the abandoned request cannot wedge the
    /// next call, then reports the timeout.
    fn timed_out(&mut self, method: &str, timeout_ms: i64) -> Result<Value> {
        warn!("Call {} on {} timed out after {}ms", method, self.service_type, timeout_ms);
        if let Err(e) = self.rebuild_connections() {
            warn!("Rebuilding proxy for {} failed: {}", self.service_type, e);
            self.rebuild_pending = true;
        }
        Err(Error::call_timeout(method, timeout_ms))
    }

    fn subscribe(&mut self, subscriber: Subscriber) -> Result<SubscriptionId> {
        if self.subscriber_count == 0 {
            self.events.set_subscribe(b"")?;
        }
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.subscribers.push((id, subscriber));
        self.subscriber_count += 1;
        Ok(id)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> Result<bool> {
        let before = self.subscribers.len();
        self.subscribers.retain(|(existing, _)| *existing != id);
        let removed = if self.subscribers.len() < before {
            true
        } else if self.in_dispatch.contains(&id) && !self.cancelled.contains(&id) {
            // The callback is out for dispatch; drop it when it comes back.
            self.cancelled.push(id);
            true
        } else {
            false
        };
        if !removed {
            return Ok(false);
        }
        self.subscriber_count = self.subscriber_count.saturating_sub(1);
        if self.subscriber_count == 0 {
            self.events.set_unsubscribe(b"")?;
        }
        Ok(true)
    }

    /// Non-blocking drain of the event socket.
    fn drain_events(&mut self) -> Vec<ServiceEvent> {
        let mut received = Vec::new();
        loop {
            match transport::try_recv(&self.events) {
                Ok(Some(frame)) => match wire::decode::<ServiceBroadcast>(&frame) {
                    Ok(ServiceBroadcast::Event(event)) => received.push(event),
                    Err(e) => warn!("Undecodable event for {}: {}", self.service_type, e),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Receiving events for {} failed: {}", self.service_type, e);
                    break;
                }
            }
        }
        received
    }
}

fn request_socket(context: &zmq::Context) -> Result<zmq::Socket> {
    let socket = transport::request_socket(context, Duration::from_secs(5))?;
    // Queue only on completed connections, so a send to a dead instance
    // waits out its timeout instead of vanishing into a pending pipe.
    socket.set_immediate(true)?;
    Ok(socket)
}

/// Handle on one remote instance (by uid) or every instance of a type.
///
/// Cloning yields another handle on the same proxy.
#[derive(Clone)]
pub struct ServiceProxy {
    inner: Arc<Mutex<ProxyInner>>,
}

impl fmt::Debug for ServiceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ServiceProxy")
            .field("service_type", &inner.service_type)
            .field("target", &inner.target)
            .field("instances", &inner.instances.len())
            .field("subscribers", &inner.subscriber_count)
            .finish()
    }
}

impl ServiceProxy {
    /// Proxy bound to exactly one instance.
    pub fn for_instance(context: &zmq::Context, record: ServiceRecord, default_timeout_ms: i64) -> Result<Self> {
        let target = Target::Single(record.uid.clone());
        let service_type = record.service_type.clone();
        Self::build(context, service_type, target, vec![record], default_timeout_ms)
    }

    /// Load-balancing proxy over every instance of `service_type`, starting
    /// with `records` (possibly none).
    pub fn for_type(
        context: &zmq::Context,
        service_type: impl Into<String>,
        records: Vec<ServiceRecord>,
        default_timeout_ms: i64,
    ) -> Result<Self> {
        Self::build(context, service_type.into(), Target::Group, records, default_timeout_ms)
    }

    fn build(
        context: &zmq::Context,
        service_type: String,
        target: Target,
        records: Vec<ServiceRecord>,
        default_timeout_ms: i64,
    ) -> Result<Self> {
        let inner = ProxyInner::new(context, service_type, target, records, default_timeout_ms)?;
        info!(
            "Created proxy for {} ({} instance(s))",
            inner.service_type,
            inner.instances.len()
        );
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub(crate) fn downgrade(&self) -> WeakProxy {
        WeakProxy {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn service_type(&self) -> String {
        self.inner.lock().service_type.clone()
    }

    /// The fixed uid of a single-instance proxy.
    pub fn uid(&self) -> Option<ServiceUid> {
        match self.inner.lock().target {
            Target::Single(ref uid) => Some(uid.clone()),
            Target::Group => None,
        }
    }

    pub fn is_group(&self) -> bool {
        self.inner.lock().target == Target::Group
    }

    pub fn instance_count(&self) -> usize {
        self.inner.lock().instances.len()
    }

    pub fn instances(&self) -> Vec<ServiceRecord> {
        self.inner.lock().instances.values().cloned().collect()
    }

    /// Adds a backing instance. Returns false if the record is of another
    /// type, is not this single proxy's uid, or is already known as is.
    pub fn add_service(&self, record: ServiceRecord) -> Result<bool> {
        self.inner.lock().add_service(record)
    }

    /// Drops a backing instance; sockets are rebuilt before the next use.
    pub fn remove_service(&self, record: &ServiceRecord) -> bool {
        self.inner.lock().remove_service(&record.uid)
    }

    /// Recreates both sockets and reconnects to the current instances.
    pub fn rebuild_connections(&self) -> Result<()> {
        self.inner.lock().rebuild_connections()
    }

    pub(crate) fn flush_rebuild(&self) -> Result<()> {
        self.inner.lock().flush_rebuild()
    }

    /// Calls `method` with the proxy's default timeout.
    pub fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let mut inner = self.inner.lock();
        let timeout_ms = inner.default_timeout_ms;
        inner.call(method, timeout_ms, args)
    }

    /// Calls `method` on one backing instance, waiting at most `timeout_ms`
    /// (forever if zero or negative).
    pub fn call_with_timeout(&self, method: &str, timeout_ms: i64, args: Vec<Value>) -> Result<Value> {
        self.inner.lock().call(method, timeout_ms, args)
    }

    /// Registers an event callback. The first subscriber turns the event
    /// subscription on.
    pub fn subscribe<F>(&self, callback: F) -> Result<SubscriptionId>
    where
        F: FnMut(&ServiceEvent) + Send + 'static,
    {
        self.inner.lock().subscribe(Box::new(callback))
    }

    /// Removes a callback. The last unsubscribe turns the event
    /// subscription off.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.lock().unsubscribe(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscriber_count
    }

    /// Delivers pending events to the subscribers in arrival order.
    /// Returns how many events were delivered.
    ///
    /// Callbacks run without the proxy locked, so they may call, subscribe
    /// or unsubscribe on this same proxy.
    pub fn receive(&self) -> Result<usize> {
        let (events, mut subscribers) = {
            let mut inner = self.inner.lock();
            inner.flush_rebuild()?;
            if inner.subscriber_count == 0 {
                return Ok(0);
            }
            let events = inner.drain_events();
            if events.is_empty() {
                return Ok(0);
            }
            let subscribers = std::mem::take(&mut inner.subscribers);
            inner.in_dispatch.extend(subscribers.iter().map(|(id, _)| *id));
            (events, subscribers)
        };

        for event in &events {
            for (id, callback) in subscribers.iter_mut() {
                if self.inner.lock().cancelled.contains(id) {
                    continue;
                }
                callback(event);
            }
        }

        let mut inner = self.inner.lock();
        inner
            .in_dispatch
            .retain(|id| !subscribers.iter().any(|(taken, _)| taken == id));
        let cancelled = std::mem::take(&mut inner.cancelled);
        subscribers.retain(|(id, _)| !cancelled.contains(id));
        let added = std::mem::take(&mut inner.subscribers);
        subscribers.extend(added);
        inner.subscribers = subscribers;
        Ok(events.len())
    }
}

/// Non-owning reference kept by the client that created the proxy.
#[derive(Clone)]
pub(crate) struct WeakProxy {
    inner: Weak<Mutex<ProxyInner>>,
}

impl WeakProxy {
    pub(crate) fn upgrade(&self) -> Option<ServiceProxy> {
        self.inner.upgrade().map(|inner| ServiceProxy { inner })
    }
}
