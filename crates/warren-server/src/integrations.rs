//! Capability interfaces for external collaborators
//!
//! Geolocation, identity provider, ingress proxy and extra-settings lookups
//! are consumed behind traits; the daemon wires real implementations, tests
//! plug in stubs.

use std::collections::HashMap;
use std::net::IpAddr;

use async_trait::async_trait;

use warren_core::error::Result;
use warren_core::netmap::NetworkMap;

/// Resolved location for a connection address.
#[derive(Debug, Clone, Default)]
pub struct GeoLocation {
    pub country_code: String,
    pub city_name: String,
    pub geo_name_id: u32,
}

/// GeoIP database lookup. Failures are warn-and-continue everywhere.
pub trait Geolocation: Send + Sync {
    fn lookup(&self, ip: IpAddr) -> Result<GeoLocation>;
}

/// Identity-provider directory data used by the hostname heuristic.
#[derive(Debug, Clone, Default)]
pub struct IdpUserData {
    pub email: String,
}

#[async_trait]
pub trait IdpManager: Send + Sync {
    async fn get_user_data_by_id(&self, account_id: &str, user_id: &str)
        -> Result<IdpUserData>;
}

/// Ingress proxy integration: per-peer overlay maps merged into broadcast
/// output, and the port-binding check that guards deletion.
#[async_trait]
pub trait ProxyController: Send + Sync {
    async fn get_proxy_network_maps(
        &self,
        account_id: &str,
    ) -> Result<HashMap<String, NetworkMap>>;

    async fn is_peer_in_ingress_ports(&self, account_id: &str, peer_id: &str) -> Result<bool>;
}

/// No proxy deployed: nothing overlays, nothing blocks deletion.
#[derive(Default)]
pub struct NoopProxyController;

#[async_trait]
impl ProxyController for NoopProxyController {
    async fn get_proxy_network_maps(
        &self,
        _account_id: &str,
    ) -> Result<HashMap<String, NetworkMap>> {
        Ok(HashMap::new())
    }

    async fn is_peer_in_ingress_ports(&self, _account_id: &str, _peer_id: &str) -> Result<bool> {
        Ok(false)
    }
}
