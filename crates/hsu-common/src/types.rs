//! Identifier newtypes used throughout the registry.
//!
//! Wrapping raw strings and integers keeps a service uid from being passed
//! where an application id is expected, at zero runtime cost.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique id of one registered service instance.
///
/// # Example
/// ```
/// use hsu_common::ServiceUid;
///
/// let uid = ServiceUid::from("echo-1");
/// assert_eq!(uid.as_str(), "echo-1");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceUid(String);

impl ServiceUid {
    /// Creates a new ServiceUid from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the uid as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceUid {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServiceUid {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServiceUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-assigned id of one connected client process.
///
/// Application ids are unique across a registry pool, not only per server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplicationId(u64);

impl ApplicationId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The id immediately after this one.
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for ApplicationId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pool-wide id of one registry server replica.
///
/// Ids start at 1; a standalone server that has never been part of a pool
/// has no id at all (`Option<ServerId>::None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(u64);

impl ServerId {
    /// The id a server gives itself when it seeds a new pool.
    pub const FIRST: ServerId = ServerId(1);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl From<u64> for ServerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
