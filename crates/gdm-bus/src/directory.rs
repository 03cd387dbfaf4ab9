//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus collaborators: endpoint discovery and value access."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use gdm_common::config::{DiscoveryConfig, RoleMatcher};
use serde_json::Value;
use tracing::debug;

use crate::{EndpointDirectory, EndpointHandle, Role, ServiceListing, ValueGateway};

/// Directory that binds roles by scanning service names on the bus.
///
/// For each role the first service whose name starts with the configured
/// prefix is taken; when keywords are configured the service must also
/// advertise a name (at one of the configured paths) containing a keyword.
#[derive(Debug)]
pub struct BusDirectory<B> {
    bus: Arc<B>,
    discovery: DiscoveryConfig,
}

impl<B> BusDirectory<B>
where
    B: ServiceListing + ValueGateway,
{
    /// Create a directory over `bus` with the given matching rules.
    pub fn new(bus: Arc<B>, discovery: DiscoveryConfig) -> Self {
        Self { bus, discovery }
    }

    async fn advertises_keyword(&self, service: &str, matcher: &RoleMatcher) -> bool {
        let endpoint = EndpointHandle::new(service);
        for path in &matcher.name_paths {
            match self.bus.read(&endpoint, path).await {
                Ok(Value::String(name)) => {
                    debug!(service, path = %path, name = %name, "checking advertised name");
                    if matcher.keywords.iter().any(|keyword| name.contains(keyword.as_str())) {
                        return true;
                    }
                }
                Ok(other) => {
                    debug!(service, path = %path, value = %other, "advertised name is not text");
                }
                Err(err) => {
                    debug!(service, path = %path, error = %err, "unable to read advertised name");
                }
            }
        }
        false
    }
}

#[async_trait]
impl<B> EndpointDirectory for BusDirectory<B>
where
    B: ServiceListing + ValueGateway,
{
    async fn resolve(&self, role: Role) -> Option<EndpointHandle> {
        let matcher = self.discovery.matcher(role);
        let services = match self.bus.list_services().await {
            Ok(services) => services,
            Err(err) => {
                debug!(%role, error = %err, "unable to list bus services");
                return None;
            }
        };

        for service in services
            .iter()
            .filter(|name| name.starts_with(matcher.prefix.as_str()))
        {
            if matcher.keywords.is_empty() || self.advertises_keyword(service, matcher).await {
                return Some(EndpointHandle::new(service.as_str()));
            }
        }
        None
    }
}
