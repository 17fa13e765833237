//! Delivery endpoints as reported by the content directory

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::manifest::AppId;

/// Network class of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    /// Public content delivery node
    Cdn,
    /// Cache appliance inside a local or ISP network
    Cache,
    /// Anything this client cannot talk to
    Unsupported,
}

/// A server able to serve manifest and chunk data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub kind: EndpointKind,
    pub cell_id: u32,
    /// Load reported by the directory; lower is better
    pub weighted_load: f32,
    /// Relative number of slots this endpoint gets in the pool
    pub entries: u32,
    /// Apps this endpoint may serve; empty means all
    pub allowed_app_ids: Vec<AppId>,
    /// Whether this endpoint can proxy requests for constrained clients
    pub relay_capable: bool,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, kind: EndpointKind) -> Self {
        Self {
            host: host.into(),
            port,
            kind,
            cell_id: 0,
            weighted_load: 0.0,
            entries: 1,
            allowed_app_ids: Vec::new(),
            relay_capable: false,
        }
    }

    /// Whether this endpoint may serve content for `app_id`
    pub fn is_eligible_for(&self, app_id: AppId) -> bool {
        self.allowed_app_ids.is_empty() || self.allowed_app_ids.contains(&app_id)
    }

    /// Whether this client can use the endpoint's network class
    pub fn is_usable(&self) -> bool {
        matches!(self.kind, EndpointKind::Cdn | EndpointKind::Cache)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        let mut endpoint = Endpoint::new("cache1.example.net", 80, EndpointKind::Cache);
        assert!(endpoint.is_eligible_for(730));

        endpoint.allowed_app_ids = vec![440];
        assert!(endpoint.is_eligible_for(440));
        assert!(!endpoint.is_eligible_for(730));
    }

    #[test]
    fn test_usable_network_class() {
        assert!(Endpoint::new("a", 80, EndpointKind::Cdn).is_usable());
        assert!(Endpoint::new("b", 80, EndpointKind::Cache).is_usable());
        assert!(!Endpoint::new("c", 80, EndpointKind::Unsupported).is_usable());
    }
}
