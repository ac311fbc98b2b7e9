//! Per-peer network map: the materialized view pushed to clients

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::ip::Cidr;
use crate::types::{PostureChecks, Protocol, RuleAction};

/// Interface configuration for the receiving peer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Mesh address with the subnet prefix, e.g. "100.64.3.7/16".
    pub address: String,
    pub fqdn: String,
    pub ssh_enabled: bool,
}

/// One remote peer visible to the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerConfig {
    pub pub_key: String,
    pub allowed_ips: Vec<String>,
    pub fqdn: String,
    pub ssh_pub_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleDirection {
    In,
    Out,
}

/// Flattened firewall rule as enforced on the receiving peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FirewallRule {
    pub peer_ip: String,
    pub direction: RuleDirection,
    pub action: RuleAction,
    pub protocol: Protocol,
    /// Empty string means any port.
    pub port: String,
}

/// Route advertised to the receiver through a network router peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,
    pub network: Cidr,
    /// Peer ID of the router carrying the traffic.
    pub peer_id: String,
    pub masquerade: bool,
    pub metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    pub name: String,
    pub record_type: String,
    pub class: String,
    pub ttl: u32,
    pub rdata: String,
}

/// Authoritative zone with one A record per peer label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomZone {
    pub domain: String,
    pub records: Vec<DnsRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    pub service_enable: bool,
    pub custom_zones: Vec<CustomZone>,
}

/// Everything a peer needs to participate in the mesh, versioned by the
/// account's network serial.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkMap {
    pub serial: u64,
    pub peer_config: Option<PeerConfig>,
    pub remote_peers: Vec<RemotePeerConfig>,
    /// Distinguishes "no visible peers" from "field not populated" on the
    /// wire; set on deletion to make the client drop all remote peers.
    pub remote_peers_is_empty: bool,
    pub firewall_rules: Vec<FirewallRule>,
    pub firewall_rules_is_empty: bool,
    pub routes: Vec<RouteConfig>,
    pub dns_config: DnsConfig,
}

impl NetworkMap {
    /// Map carrying only the serial: sent to peers pending approval and as
    /// the deletion tombstone.
    pub fn empty(serial: u64) -> Self {
        NetworkMap {
            serial,
            remote_peers_is_empty: true,
            firewall_rules_is_empty: true,
            ..Default::default()
        }
    }

    /// Merges an externally supplied overlay (the ingress-proxy map) into
    /// this one. Union semantics; the overlay wins when both sides carry a
    /// remote-peer entry for the same public key.
    pub fn merge(&mut self, overlay: NetworkMap) {
        let overlay_keys: HashSet<String> = overlay
            .remote_peers
            .iter()
            .map(|p| p.pub_key.clone())
            .collect();
        self.remote_peers
            .retain(|p| !overlay_keys.contains(&p.pub_key));
        self.remote_peers.extend(overlay.remote_peers);

        let existing: HashSet<FirewallRule> = self.firewall_rules.iter().cloned().collect();
        self.firewall_rules.extend(
            overlay
                .firewall_rules
                .into_iter()
                .filter(|r| !existing.contains(r)),
        );

        let route_ids: HashSet<String> = self.routes.iter().map(|r| r.id.clone()).collect();
        self.routes
            .extend(overlay.routes.into_iter().filter(|r| !route_ids.contains(&r.id)));

        self.dns_config
            .custom_zones
            .extend(overlay.dns_config.custom_zones);
        self.serial = self.serial.max(overlay.serial);
        self.remote_peers_is_empty = self.remote_peers.is_empty();
        self.firewall_rules_is_empty = self.firewall_rules.is_empty();
    }
}

/// Wire message pushed on a peer's update channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncResponse {
    pub peer_config: Option<PeerConfig>,
    pub network_map: NetworkMap,
    pub checks: Vec<PostureChecks>,
}

/// Channel payload: the wire message plus the map it was derived from.
#[derive(Debug, Clone)]
pub struct UpdateMessage {
    pub update: SyncResponse,
    pub network_map: NetworkMap,
}
