//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus collaborators: endpoint discovery and value access."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::trace;

use crate::{BusError, EndpointHandle, Result, ServiceListing, ValueGateway};

/// A write issued through the [`ValueGateway`] interface.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRecord {
    /// Target service.
    pub service: String,
    /// Target path.
    pub path: String,
    /// Value written.
    pub value: Value,
    /// When the write was accepted.
    pub at: DateTime<Utc>,
}

type ItemKey = (String, String);

#[derive(Debug, Default)]
struct BusInner {
    services: IndexMap<String, IndexMap<String, Value>>,
    failing_reads: HashSet<ItemKey>,
    failing_writes: HashSet<ItemKey>,
    journal: Vec<WriteRecord>,
}

/// In-memory bus that simulates services publishing items at paths.
///
/// Values set with [`InMemoryBus::set`] model an external actor and are not
/// journaled; only writes through [`ValueGateway::write`] are.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Mutex<BusInner>>,
}

impl InMemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bus pre-populated with `services`.
    pub fn from_services(services: IndexMap<String, IndexMap<String, Value>>) -> Self {
        let bus = Self::new();
        bus.inner.lock().services = services;
        bus
    }

    /// Register a service with its initial items, replacing any previous one.
    pub fn add_service<I, P>(&self, service: &str, items: I)
    where
        I: IntoIterator<Item = (P, Value)>,
        P: Into<String>,
    {
        let items = items
            .into_iter()
            .map(|(path, value)| (path.into(), value))
            .collect();
        self.inner.lock().services.insert(service.to_owned(), items);
    }

    /// Drop a service from the bus.
    pub fn remove_service(&self, service: &str) -> bool {
        self.inner.lock().services.shift_remove(service).is_some()
    }

    /// Set an item as an external actor would. Creates the service if needed.
    pub fn set(&self, service: &str, path: &str, value: Value) {
        self.inner
            .lock()
            .services
            .entry(service.to_owned())
            .or_default()
            .insert(path.to_owned(), value);
    }

    /// Current value of an item.
    pub fn get(&self, service: &str, path: &str) -> Option<Value> {
        self.inner
            .lock()
            .services
            .get(service)
            .and_then(|items| items.get(path))
            .cloned()
    }

    /// Make reads of an item time out (or stop doing so).
    pub fn fail_reads(&self, service: &str, path: &str, failing: bool) {
        let key = (service.to_owned(), path.to_owned());
        let mut inner = self.inner.lock();
        if failing {
            inner.failing_reads.insert(key);
        } else {
            inner.failing_reads.remove(&key);
        }
    }

    /// Make writes to an item be rejected (or stop doing so).
    pub fn fail_writes(&self, service: &str, path: &str, failing: bool) {
        let key = (service.to_owned(), path.to_owned());
        let mut inner = self.inner.lock();
        if failing {
            inner.failing_writes.insert(key);
        } else {
            inner.failing_writes.remove(&key);
        }
    }

    /// Every accepted gateway write, oldest first.
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.inner.lock().journal.clone()
    }

    /// Accepted gateway writes to one item.
    pub fn writes_to(&self, service: &str, path: &str) -> Vec<Value> {
        self.inner
            .lock()
            .journal
            .iter()
            .filter(|record| record.service == service && record.path == path)
            .map(|record| record.value.clone())
            .collect()
    }

    /// Forget the write journal.
    pub fn clear_writes(&self) {
        self.inner.lock().journal.clear();
    }
}

#[async_trait]
impl ValueGateway for InMemoryBus {
    async fn read(&self, endpoint: &EndpointHandle, path: &str) -> Result<Value> {
        let inner = self.inner.lock();
        let service = endpoint.as_str();
        let Some(items) = inner.services.get(service) else {
            return Err(BusError::ServiceUnknown(service.to_owned()));
        };
        if inner
            .failing_reads
            .contains(&(service.to_owned(), path.to_owned()))
        {
            return Err(BusError::Timeout {
                service: service.to_owned(),
                path: path.to_owned(),
            });
        }
        items.get(path).cloned().ok_or_else(|| BusError::PathUnknown {
            service: service.to_owned(),
            path: path.to_owned(),
        })
    }

    async fn write(&self, endpoint: &EndpointHandle, path: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock();
        let service = endpoint.as_str();
        let key = (service.to_owned(), path.to_owned());
        if inner.failing_writes.contains(&key) {
            return Err(BusError::Rejected {
                service: key.0,
                path: key.1,
                reason: "write refused".to_owned(),
            });
        }
        let Some(items) = inner.services.get_mut(service) else {
            return Err(BusError::ServiceUnknown(key.0));
        };
        let Some(slot) = items.get_mut(path) else {
            return Err(BusError::PathUnknown {
                service: key.0,
                path: key.1,
            });
        };
        *slot = value.clone();
        trace!(service, path, %value, "in-memory bus write");
        inner.journal.push(WriteRecord {
            service: key.0,
            path: key.1,
            value,
            at: Utc::now(),
        });
        Ok(())
    }
}

#[async_trait]
impl ServiceListing for InMemoryBus {
    async fn list_services(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().services.keys().cloned().collect())
    }
}
