//! Error types for the HSU service registry.
//!
//! # Rust Learning Note
//!
//! Rust doesn't have exceptions - it uses `Result<T, E>` for error handling.
//! The registry maps its failure taxonomy onto one enum:
//!
//! - **Not-found** never reaches this type on the happy path. Lookups return
//!   `Option`/`bool`/empty `Vec` instead, so the caller can't mistake a miss
//!   for a fault.
//! - **Conflict** is raised where an identifier is reused illegally.
//! - **Transport** faults wrap `zmq::Error` and codec failures.
//! - **RPC** faults carry the method name so the caller knows which call broke.
//!
//! ```rust
//! use hsu_common::{Error, Result};
//!
//! fn lookup() -> Result<()> {
//!     Err(Error::not_found("service echo-1"))
//! }
//!
//! fn caller() -> Result<()> {
//!     lookup()?;
//!     Ok(())
//! }
//! # assert!(caller().is_err());
//! ```

use crate::types::ServerId;
use thiserror::Error;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for registry, client and proxy operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A requested resource was not found.
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    /// Invalid input or configuration.
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// An identifier collided with one already in use.
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// The global server id of this replica was already assigned.
    #[error("Global server id already assigned: current={current}, attempted={attempted}")]
    ServerIdAlreadyAssigned {
        current: ServerId,
        attempted: ServerId,
    },

    /// A proxy was asked to call a method that not every backing instance exposes.
    #[error("RPC call {method} failed: method is not callable on service type {service_type}")]
    MethodNotCallable {
        method: String,
        service_type: String,
    },

    /// An RPC call got no reply within its timeout.
    #[error("RPC call {method} failed: Timeout ({timeout_ms}ms)")]
    CallTimeout { method: String, timeout_ms: i64 },

    /// An RPC call failed for any other reason.
    #[error("RPC call {method} failed: {reason}")]
    CallFailed { method: String, reason: String },

    /// A registry round-trip got no reply within its timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Every known registry is gone. Fatal for a client.
    #[error("No registry available: {reason}")]
    RegistryUnavailable { reason: String },

    /// Peer sent something we could not make sense of.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Messaging layer error.
    #[error("Transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// Encoding or decoding of a wire message failed.
    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// I/O error (wraps std::io::Error).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error with context.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        source: Box<Error>,
    },
}

impl Error {
    /// Creates a NotFound error.
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Creates a Validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a Conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict {
            message: message.into(),
        }
    }

    pub fn method_not_callable(method: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self::MethodNotCallable {
            method: method.into(),
            service_type: service_type.into(),
        }
    }

    pub fn call_timeout(method: impl Into<String>, timeout_ms: i64) -> Self {
        Self::CallTimeout {
            method: method.into(),
            timeout_ms,
        }
    }

    pub fn call_failed(method: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CallFailed {
            method: method.into(),
            reason: reason.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn registry_unavailable(reason: impl Into<String>) -> Self {
        Self::RegistryUnavailable {
            reason: reason.into(),
        }
    }

    /// True for faults that a caller may recover from by retrying against
    /// another endpoint (timeouts and messaging errors).
    pub fn is_transport(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout { .. } => true,
            Self::WithContext { source, .. } => source.is_transport(),
            _ => false,
        }
    }

    /// Adds context to an error.
    ///
    /// # Example
    /// ```
    /// use hsu_common::{Error, Result};
    ///
    /// fn inner() -> Result<()> {
    ///     Err(Error::not_found("service"))
    /// }
    ///
    /// fn outer() -> Result<()> {
    ///     inner().map_err(|e| e.context("Failed to resolve proxy"))
    /// }
    /// # assert!(outer().is_err());
    /// ```
    pub fn context(self, message: impl Into<String>) -> Self {
        Self::WithContext {
            message: message.into(),
            source: Box::new(self),
        }
    }
}

// Convenience methods for Result types
pub trait ResultExt<T> {
    /// Adds context to an error result.
    fn context(self, message: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(message))
    }
}
