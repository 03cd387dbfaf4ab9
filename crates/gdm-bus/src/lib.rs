//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus collaborators: endpoint discovery and value access."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Interfaces the controller consumes from the system bus.
//!
//! The control loop only ever sees three capabilities: [`EndpointDirectory`]
//! to bind a logical [`Role`] to an endpoint, and [`ValueGateway`] to read or
//! write a single value at a path on that endpoint. Service naming heuristics
//! live in [`BusDirectory`]; [`InMemoryBus`] backs tests and simulation.

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

pub mod directory;
pub mod memory;

pub use directory::BusDirectory;
pub use gdm_common::Role;
pub use memory::{InMemoryBus, WriteRecord};

/// Shared result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Failures reported by bus collaborators. None of them are fatal to the
/// controller.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    /// The service is not (or no longer) present on the bus.
    #[error("service {0} is not on the bus")]
    ServiceUnknown(String),
    /// The service exists but does not publish the path.
    #[error("{service} has no item at {path}")]
    PathUnknown {
        /// Service name.
        service: String,
        /// Item path.
        path: String,
    },
    /// The service refused a write.
    #[error("{service}{path} rejected the write: {reason}")]
    Rejected {
        /// Service name.
        service: String,
        /// Item path.
        path: String,
        /// Reason given by the service.
        reason: String,
    },
    /// The call did not complete in time.
    #[error("bus call to {service}{path} timed out")]
    Timeout {
        /// Service name.
        service: String,
        /// Item path.
        path: String,
    },
    /// Any other transport-level failure.
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl BusError {
    /// Whether the error means the backing service has gone away.
    pub fn is_service_gone(&self) -> bool {
        matches!(self, BusError::ServiceUnknown(_))
    }
}

/// Opaque address of a resolved endpoint (a bus service name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointHandle(String);

impl EndpointHandle {
    /// Wrap a service name.
    pub fn new(service: impl Into<String>) -> Self {
        Self(service.into())
    }

    /// Service name behind the handle.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Read/write access to single values on resolved endpoints.
#[async_trait]
pub trait ValueGateway: Send + Sync {
    /// Read the value at `path`.
    async fn read(&self, endpoint: &EndpointHandle, path: &str) -> Result<Value>;

    /// Write `value` to `path`.
    async fn write(&self, endpoint: &EndpointHandle, path: &str, value: Value) -> Result<()>;
}

/// Enumeration of the service names currently on the bus.
#[async_trait]
pub trait ServiceListing: Send + Sync {
    /// List every service name currently registered.
    async fn list_services(&self) -> Result<Vec<String>>;
}

/// Resolves logical roles to endpoints.
#[async_trait]
pub trait EndpointDirectory: Send + Sync {
    /// Resolve `role`, or `None` if no backing service is available right now.
    async fn resolve(&self, role: Role) -> Option<EndpointHandle>;
}
