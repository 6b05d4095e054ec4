//! # HSU Registry Client
//!
//! Process-side access to the HSU service registry.
//!
//! This crate provides:
//! - [`RegistryClient`]: registers local service objects, discovers remote
//!   ones, heartbeats, and fails over to an alternate registry
//! - [`ServiceProxy`]: load-balanced calls and merged events across the
//!   instances of a service type
//! - [`RemoteService`] and [`MethodTable`]: how a local object declares
//!   its callable methods

pub mod client;
pub mod config;
pub mod proxy;
pub mod service;

// Re-export commonly used items
pub use client::{RegistryClient, AUTO_UID_PREFIX};
pub use config::{ClientConfig, ServiceBinding};
pub use proxy::{ServiceProxy, SubscriptionId};
pub use service::{arg, EventPublisher, InvocationError, MethodTable, RemoteService};
