//! Service registry for the gateway
//!
//! Backends announce themselves with a [`ServiceDescriptor`], keep their
//! entry alive with heartbeats, and disappear either by unregistering or by
//! missing heartbeats for longer than the expiry window. The gateway routes
//! from [`RegistryStore`] snapshots; backends embed a [`RegistryClient`].

pub mod client;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod protocol;
pub mod service;
pub mod store;
pub mod sweep;

pub use client::{ClientState, HttpRegistryApi, LocalRegistryApi, RegistryApi, RegistryClient};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ClientConfig, RegistryConfig};
pub use entry::{ServiceDescriptor, ServiceEntry, ServiceId};
pub use error::{ErrorCode, RegistryError, Result};
pub use protocol::{
    AckResponse, HeartbeatRequest, HeartbeatResponse, RegisterRequest, RegisterResponse,
    UnregisterRequest, UnregisterResponse,
};
pub use service::RegistrationService;
pub use store::{RegistrySnapshot, RegistryStore, RemovalListener, RemovalReason};
pub use sweep::ExpirySweeper;
