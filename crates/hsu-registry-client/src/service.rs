//! Local service objects and their method tables.
//!
//! # Rust Learning Note
//!
//! ## Dispatch by name without reflection
//!
//! A service implements [`RemoteService`] and lists its callable methods
//! once, when it is registered:
//!
//! ```rust
//! use hsu_common::Value;
//! use hsu_registry_client::{MethodTable, RemoteService};
//!
//! struct Echo {
//!     calls: i64,
//! }
//!
//! impl RemoteService for Echo {
//!     fn service_type(&self) -> &str {
//!         "Echo"
//!     }
//!
//!     fn methods(table: &mut MethodTable<Self>) {
//!         table
//!             .method("Echo", |_, args| Ok(args.into_iter().next().unwrap_or_default()))
//!             .method("Calls", |echo, _| {
//!                 echo.calls += 1;
//!                 Ok(Value::Int(echo.calls))
//!             });
//!     }
//! }
//! ```
//!
//! The table maps each wire name to a boxed closure taking `&mut Self`, so
//! an inbound call is one map lookup and one indirect call. The client
//! keeps every registered object behind the object-safe `Dispatch` trait,
//! which erases the concrete service type.

use hsu_common::{Value, DEFAULT_SERVICE_TYPE, DEFAULT_SERVICE_VERSION};
use std::collections::BTreeMap;
use thiserror::Error;
use tokio::sync::mpsc;

/// Failure of one inbound method invocation. Reported to the caller as an
/// empty reply.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvocationError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    #[error("Bad arguments to {method}: {reason}")]
    BadArguments { method: String, reason: String },

    #[error("Invocation failed: {0}")]
    Failed(String),
}

impl InvocationError {
    pub fn bad_arguments(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BadArguments {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

/// Boxed handler for one method of `S`.
pub type Handler<S> = Box<dyn Fn(&mut S, Vec<Value>) -> Result<Value, InvocationError> + Send>;

/// Externally callable methods of a service type.
pub struct MethodTable<S> {
    handlers: BTreeMap<String, Handler<S>>,
}

impl<S> Default for MethodTable<S> {
    fn default() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }
}

impl<S> MethodTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the handler for `name`.
    pub fn method<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut S, Vec<Value>) -> Result<Value, InvocationError> + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Method names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn invoke(&self, service: &mut S, name: &str, args: Vec<Value>) -> Result<Value, InvocationError> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| InvocationError::UnknownMethod(name.to_string()))?;
        handler(service, args)
    }
}

/// Returns argument `index` of a call to `method`.
pub fn arg<'a>(args: &'a [Value], index: usize, method: &str) -> Result<&'a Value, InvocationError> {
    args.get(index).ok_or_else(|| {
        InvocationError::bad_arguments(
            method,
            format!("expected at least {} argument(s), got {}", index + 1, args.len()),
        )
    })
}

/// Queues events raised by a service object for publication.
///
/// Events are published on the object's publish endpoint during the owning
/// client's next `update`. Cloning is cheap; all clones feed the same
/// endpoint.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: mpsc::UnboundedSender<Value>,
}

impl EventPublisher {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Queues `payload`. Returns false once the service was unregistered.
    pub fn publish(&self, payload: impl Into<Value>) -> bool {
        self.sender.send(payload.into()).is_ok()
    }
}

/// An object that can be registered with a [`RegistryClient`](crate::RegistryClient).
pub trait RemoteService: Send + 'static {
    /// Type tag used for discovery and proxy grouping.
    fn service_type(&self) -> &str {
        DEFAULT_SERVICE_TYPE
    }

    fn version(&self) -> &str {
        DEFAULT_SERVICE_VERSION
    }

    /// Fills in the externally callable methods.
    fn methods(table: &mut MethodTable<Self>)
    where
        Self: Sized;

    /// Called once at registration with the handle the object raises
    /// events through. Objects without events ignore it.
    fn attach_publisher(&mut self, _publisher: EventPublisher) {}
}

/// Type-erased registered object.
pub(crate) trait Dispatch: Send {
    fn service_type(&self) -> &str;
    fn version(&self) -> &str;
    fn method_names(&self) -> Vec<String>;
    fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, InvocationError>;
}

/// A service object bound to its method table.
pub(crate) struct Bound<S> {
    service: S,
    table: MethodTable<S>,
}

impl<S: RemoteService> Bound<S> {
    pub(crate) fn new(mut service: S, publisher: EventPublisher) -> Self {
        let mut table = MethodTable::new();
        S::methods(&mut table);
        service.attach_publisher(publisher);
        Self { service, table }
    }
}

impl<S: RemoteService> Dispatch for Bound<S> {
    fn service_type(&self) -> &str {
        self.service.service_type()
    }

    fn version(&self) -> &str {
        self.service.version()
    }

    fn method_names(&self) -> Vec<String> {
        self.table.names()
    }

    fn invoke(&mut self, name: &str, args: Vec<Value>) -> Result<Value, InvocationError> {
        self.table.invoke(&mut self.service, name, args)
    }
}
