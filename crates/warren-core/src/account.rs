//! Immutable account snapshot and the per-peer network map builder
//!
//! The account is a deep object graph; a snapshot keeps every entity in a
//! table keyed by ID so nothing is cyclic and the whole value can sit
//! behind an `Arc` for the duration of one broadcast pass.

use std::collections::{HashMap, HashSet};

use crate::netmap::{
    CustomZone, DnsConfig, DnsRecord, FirewallRule, NetworkMap, PeerConfig, RemotePeerConfig,
    RouteConfig, RuleDirection,
};
use crate::types::{Group, Network, NetworkRouter, Peer, Policy, PostureChecks, Settings, User};

const DNS_RECORD_TTL: u32 = 300;

/// Point-in-time view of one account, materialized per broadcast.
#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub id: String,
    pub network: Network,
    pub settings: Settings,
    pub peers: HashMap<String, Peer>,
    pub groups: HashMap<String, Group>,
    pub policies: Vec<Policy>,
    pub routers: Vec<NetworkRouter>,
    pub posture_checks: Vec<PostureChecks>,
    pub users: HashMap<String, User>,
}

/// Index from group ID to the policies whose enabled rules mention it.
/// Owned values only, so the index can cross task boundaries.
pub type ResourcePoliciesMap = HashMap<String, Vec<usize>>;

/// Index from router-hosting peer ID to router positions.
pub type RoutersMap = HashMap<String, Vec<usize>>;

impl AccountSnapshot {
    pub fn get_peer(&self, peer_id: &str) -> Option<&Peer> {
        self.peers.get(peer_id)
    }

    /// IDs of the groups the peer belongs to.
    pub fn peer_group_ids(&self, peer_id: &str) -> Vec<String> {
        self.groups
            .values()
            .filter(|g| g.peers.iter().any(|p| p == peer_id))
            .map(|g| g.id.clone())
            .collect()
    }

    /// Builds the group-to-policy index consulted during visibility
    /// resolution. Computed once per broadcast, shared by all workers.
    pub fn resource_policies_map(&self) -> ResourcePoliciesMap {
        let mut map: ResourcePoliciesMap = HashMap::new();
        for (idx, policy) in self.policies.iter().enumerate() {
            if !policy.enabled {
                continue;
            }
            for rule in policy.rules.iter().filter(|r| r.enabled) {
                for group_id in rule.sources.iter().chain(rule.destinations.iter()) {
                    let entry = map.entry(group_id.clone()).or_default();
                    if !entry.contains(&idx) {
                        entry.push(idx);
                    }
                }
            }
        }
        map
    }

    /// Builds the peer-to-router index. Routers addressed through peer
    /// groups are resolved to their member peers here.
    pub fn routers_map(&self) -> RoutersMap {
        let mut map: RoutersMap = HashMap::new();
        for (idx, router) in self.routers.iter().enumerate() {
            if !router.enabled {
                continue;
            }
            if !router.peer.is_empty() {
                map.entry(router.peer.clone()).or_default().push(idx);
            }
            for group_id in &router.peer_groups {
                let Some(group) = self.groups.get(group_id) else {
                    continue;
                };
                for peer_id in &group.peers {
                    let entry = map.entry(peer_id.clone()).or_default();
                    if !entry.contains(&idx) {
                        entry.push(idx);
                    }
                }
            }
        }
        map
    }

    /// Authoritative zone with an A record per peer label, plus any extra
    /// labels the peer registered.
    pub fn peers_custom_zone(&self, dns_domain: &str) -> CustomZone {
        let mut zone = CustomZone {
            domain: format!("{dns_domain}."),
            records: Vec::with_capacity(self.peers.len()),
        };
        for peer in self.peers.values() {
            if peer.dns_label.is_empty() {
                tracing::warn!(peer = %peer.id, "peer has no DNS label, skipping zone record");
                continue;
            }
            let rdata = peer.ip.to_string();
            zone.records.push(a_record(
                format!("{}.{}.", peer.dns_label, dns_domain),
                rdata.clone(),
            ));
            for extra in &peer.extra_dns_labels {
                zone.records
                    .push(a_record(format!("{extra}.{dns_domain}."), rdata.clone()));
            }
        }
        zone.records.sort_by(|a, b| a.name.cmp(&b.name));
        zone
    }

    /// Peers visible to `peer_id` and the firewall rules governing those
    /// connections. Peer B is visible to peer A iff some enabled policy has
    /// an enabled rule connecting a group of A with a group of B in either
    /// direction, and both sides are approved. Rules compose by union,
    /// deduplicated on (peer, direction, action, protocol, port).
    pub fn peer_connection_resources(
        &self,
        peer_id: &str,
        approved: &HashSet<String>,
        resource_policies: &ResourcePoliciesMap,
    ) -> (Vec<&Peer>, Vec<FirewallRule>) {
        let mut visible: HashMap<&str, &Peer> = HashMap::new();
        let mut rules: HashSet<FirewallRule> = HashSet::new();

        let own_groups: HashSet<&str> = self
            .groups
            .values()
            .filter(|g| g.peers.iter().any(|p| p == peer_id))
            .map(|g| g.id.as_str())
            .collect();

        let mut policy_indices: Vec<usize> = own_groups
            .iter()
            .filter_map(|g| resource_policies.get(*g))
            .flatten()
            .copied()
            .collect();
        policy_indices.sort_unstable();
        policy_indices.dedup();

        let any_port = [String::new()];

        for idx in policy_indices {
            let policy = &self.policies[idx];
            for rule in policy.rules.iter().filter(|r| r.enabled) {
                let sources = self.group_peers(&rule.sources, approved);
                let destinations = self.group_peers(&rule.destinations, approved);

                let in_sources = sources.contains_key(peer_id);
                let in_destinations = destinations.contains_key(peer_id);
                if !in_sources && !in_destinations {
                    continue;
                }
                if !approved.contains(peer_id) {
                    continue;
                }

                let ports: &[String] = if rule.ports.is_empty() {
                    &any_port
                } else {
                    &rule.ports
                };

                if in_destinations {
                    for (id, peer) in &sources {
                        if *id == peer_id {
                            continue;
                        }
                        visible.insert(*id, *peer);
                        for port in ports {
                            rules.insert(FirewallRule {
                                peer_ip: peer.ip.to_string(),
                                direction: RuleDirection::In,
                                action: rule.action,
                                protocol: rule.protocol,
                                port: port.clone(),
                            });
                        }
                    }
                }
                if in_sources {
                    for (id, peer) in &destinations {
                        if *id == peer_id {
                            continue;
                        }
                        visible.insert(*id, *peer);
                        for port in ports {
                            rules.insert(FirewallRule {
                                peer_ip: peer.ip.to_string(),
                                direction: RuleDirection::Out,
                                action: rule.action,
                                protocol: rule.protocol,
                                port: port.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut peers: Vec<&Peer> = visible.into_values().collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        let mut rules: Vec<FirewallRule> = rules.into_iter().collect();
        rules.sort_by(|a, b| (&a.peer_ip, &a.port).cmp(&(&b.peer_ip, &b.port)));
        (peers, rules)
    }

    /// Pure map construction for one peer. Inputs beyond the snapshot are
    /// precomputed once per broadcast and shared across workers.
    pub fn build_peer_network_map(
        &self,
        peer_id: &str,
        dns_domain: &str,
        custom_zone: Option<&CustomZone>,
        approved: &HashSet<String>,
        resource_policies: &ResourcePoliciesMap,
        routers: &RoutersMap,
    ) -> NetworkMap {
        let serial = self.network.current_serial();
        let Some(peer) = self.peers.get(peer_id) else {
            return NetworkMap::empty(serial);
        };
        if !approved.contains(peer_id) {
            return NetworkMap::empty(serial);
        }

        let (visible, firewall_rules) =
            self.peer_connection_resources(peer_id, approved, resource_policies);

        let remote_peers: Vec<RemotePeerConfig> = visible
            .iter()
            .map(|p| RemotePeerConfig {
                pub_key: p.pub_key.clone(),
                allowed_ips: vec![format!("{}/32", p.ip)],
                fqdn: p.fqdn(dns_domain),
                ssh_pub_key: if p.ssh_enabled {
                    p.ssh_key.clone()
                } else {
                    String::new()
                },
            })
            .collect();

        // Routes the peer serves itself plus routes reachable through
        // visible router peers.
        let mut route_ids = HashSet::new();
        let mut routes = Vec::new();
        let mut add_routes_for = |host_id: &str| {
            if let Some(indices) = routers.get(host_id) {
                for &idx in indices {
                    let router = &self.routers[idx];
                    if route_ids.insert(router.id.clone()) {
                        routes.push(RouteConfig {
                            id: router.id.clone(),
                            network: router.network,
                            peer_id: host_id.to_string(),
                            masquerade: router.masquerade,
                            metric: router.metric,
                        });
                    }
                }
            }
        };
        add_routes_for(peer_id);
        for p in &visible {
            add_routes_for(&p.id);
        }

        let dns_config = DnsConfig {
            service_enable: custom_zone.is_some(),
            custom_zones: custom_zone.iter().map(|z| (*z).clone()).collect(),
        };

        let remote_peers_is_empty = remote_peers.is_empty();
        let firewall_rules_is_empty = firewall_rules.is_empty();
        NetworkMap {
            serial,
            peer_config: Some(PeerConfig {
                address: format!("{}/{}", peer.ip, self.network.cidr.prefix_len()),
                fqdn: peer.fqdn(dns_domain),
                ssh_enabled: peer.ssh_enabled,
            }),
            remote_peers,
            remote_peers_is_empty,
            firewall_rules,
            firewall_rules_is_empty,
            routes,
            dns_config,
        }
    }

    /// IDs of the posture-check bundles that apply to a peer: those carried
    /// by enabled policies whose enabled rules have a source group
    /// containing it.
    pub fn peer_posture_check_ids(&self, peer_id: &str) -> Vec<String> {
        let mut ids = Vec::new();
        for policy in &self.policies {
            if !policy.enabled || policy.source_posture_checks.is_empty() {
                continue;
            }
            let applies = policy.rules.iter().filter(|r| r.enabled).any(|rule| {
                rule.sources.iter().any(|gid| {
                    self.groups
                        .get(gid)
                        .is_some_and(|g| g.peers.iter().any(|p| p == peer_id))
                })
            });
            if applies {
                for id in &policy.source_posture_checks {
                    if !ids.contains(id) {
                        ids.push(id.clone());
                    }
                }
            }
        }
        ids
    }

    /// Resolved posture-check bundles for a peer.
    pub fn peer_posture_checks(&self, peer_id: &str) -> Vec<PostureChecks> {
        let ids = self.peer_posture_check_ids(peer_id);
        self.posture_checks
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect()
    }

    fn group_peers<'a>(
        &'a self,
        group_ids: &[String],
        approved: &HashSet<String>,
    ) -> HashMap<&'a str, &'a Peer> {
        let mut peers = HashMap::new();
        for gid in group_ids {
            let Some(group) = self.groups.get(gid) else {
                continue;
            };
            for pid in &group.peers {
                if !approved.contains(pid) {
                    continue;
                }
                if let Some(peer) = self.peers.get(pid) {
                    peers.insert(peer.id.as_str(), peer);
                }
            }
        }
        peers
    }
}

fn a_record(name: String, rdata: String) -> DnsRecord {
    DnsRecord {
        name,
        record_type: "A".into(),
        class: "IN".into(),
        ttl: DNS_RECORD_TTL,
        rdata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        PeerMeta, PeerStatus, Policy, PolicyRule, Protocol, RuleAction, Settings,
    };
    use chrono::{Duration, Utc};
    use std::net::Ipv4Addr;

    fn peer(id: &str, ip: [u8; 4]) -> Peer {
        Peer {
            id: id.into(),
            account_id: "acc".into(),
            pub_key: format!("{id}-key"),
            name: id.into(),
            dns_label: id.into(),
            ip: Ipv4Addr::from(ip),
            user_id: None,
            meta: PeerMeta::default(),
            status: PeerStatus::new(false, Utc::now()),
            ssh_enabled: false,
            ssh_key: String::new(),
            login_expiration_enabled: false,
            inactivity_expiration_enabled: false,
            ephemeral: false,
            created_at: Utc::now(),
            last_login: Utc::now(),
            location: Default::default(),
            extra_dns_labels: vec![],
            allow_extra_dns_labels: false,
        }
    }

    fn group(id: &str, peers: &[&str]) -> Group {
        Group {
            id: id.into(),
            account_id: "acc".into(),
            name: id.into(),
            peers: peers.iter().map(|p| p.to_string()).collect(),
        }
    }

    fn policy(id: &str, sources: &[&str], destinations: &[&str]) -> Policy {
        Policy {
            id: id.into(),
            account_id: "acc".into(),
            name: id.into(),
            enabled: true,
            rules: vec![PolicyRule {
                id: format!("{id}-r1"),
                enabled: true,
                sources: sources.iter().map(|s| s.to_string()).collect(),
                destinations: destinations.iter().map(|s| s.to_string()).collect(),
                protocol: Protocol::All,
                ports: vec![],
                action: RuleAction::Accept,
            }],
            source_posture_checks: vec![],
        }
    }

    fn snapshot() -> AccountSnapshot {
        AccountSnapshot {
            id: "acc".into(),
            network: Network {
                cidr: "100.64.0.0/16".parse().unwrap(),
                serial: 7,
            },
            settings: Settings {
                peer_login_expiration_enabled: false,
                peer_login_expiration: Duration::hours(24),
                peer_inactivity_expiration_enabled: false,
                peer_inactivity_expiration: Duration::hours(1),
                regular_users_view_blocked: false,
                dns_domain: None,
                extra: None,
            },
            peers: [
                ("a".to_string(), peer("a", [100, 64, 0, 1])),
                ("b".to_string(), peer("b", [100, 64, 0, 2])),
                ("c".to_string(), peer("c", [100, 64, 0, 3])),
            ]
            .into(),
            groups: [
                ("g-dev".to_string(), group("g-dev", &["a", "b"])),
                ("g-prod".to_string(), group("g-prod", &["c"])),
            ]
            .into(),
            policies: vec![policy("pol1", &["g-dev"], &["g-prod"])],
            routers: vec![],
            posture_checks: vec![],
            users: HashMap::new(),
        }
    }

    fn all_approved(snap: &AccountSnapshot) -> HashSet<String> {
        snap.peers.keys().cloned().collect()
    }

    #[test]
    fn visibility_follows_policy_groups() {
        let snap = snapshot();
        let approved = all_approved(&snap);
        let policies = snap.resource_policies_map();
        let routers = snap.routers_map();

        // a (source) sees c (destination), not b (same side only).
        let map = snap.build_peer_network_map("a", "mesh.example", None, &approved, &policies, &routers);
        let visible: Vec<&str> = map.remote_peers.iter().map(|p| p.pub_key.as_str()).collect();
        assert_eq!(visible, vec!["c-key"]);

        // c (destination) sees both sources.
        let map = snap.build_peer_network_map("c", "mesh.example", None, &approved, &policies, &routers);
        assert_eq!(map.remote_peers.len(), 2);
        assert_eq!(map.serial, 7);
    }

    #[test]
    fn unapproved_peers_are_invisible() {
        let snap = snapshot();
        let mut approved = all_approved(&snap);
        approved.remove("c");
        let policies = snap.resource_policies_map();
        let routers = snap.routers_map();

        let map = snap.build_peer_network_map("a", "mesh.example", None, &approved, &policies, &routers);
        assert!(map.remote_peers.is_empty());

        // An unapproved target gets only the serial.
        let map = snap.build_peer_network_map("c", "mesh.example", None, &approved, &policies, &routers);
        assert!(map.peer_config.is_none());
        assert!(map.remote_peers_is_empty);
    }

    #[test]
    fn disabled_policies_grant_nothing() {
        let mut snap = snapshot();
        snap.policies[0].enabled = false;
        let approved = all_approved(&snap);
        let policies = snap.resource_policies_map();
        let routers = snap.routers_map();

        let map = snap.build_peer_network_map("a", "mesh.example", None, &approved, &policies, &routers);
        assert!(map.remote_peers.is_empty());
        assert!(map.firewall_rules.is_empty());
    }

    #[test]
    fn firewall_rules_dedup_across_rules() {
        let mut snap = snapshot();
        // Second policy with an identical effective rule.
        snap.policies.push(policy("pol2", &["g-dev"], &["g-prod"]));
        let approved = all_approved(&snap);
        let policies = snap.resource_policies_map();

        let (_, rules) = snap.peer_connection_resources("c", &approved, &policies);
        // Two source peers, one In rule each, despite two policies.
        assert_eq!(rules.len(), 2);
        assert!(rules.iter().all(|r| r.direction == RuleDirection::In));
    }

    #[test]
    fn custom_zone_covers_all_peers_and_extra_labels() {
        let mut snap = snapshot();
        snap.peers.get_mut("a").unwrap().extra_dns_labels = vec!["web".into()];
        let zone = snap.peers_custom_zone("mesh.example");
        assert_eq!(zone.domain, "mesh.example.");
        assert_eq!(zone.records.len(), 4);
        assert!(zone
            .records
            .iter()
            .any(|r| r.name == "web.mesh.example." && r.rdata == "100.64.0.1"));
    }

    #[test]
    fn routes_come_from_own_and_visible_routers() {
        let mut snap = snapshot();
        snap.routers.push(NetworkRouter {
            id: "rt1".into(),
            account_id: "acc".into(),
            peer: "c".into(),
            peer_groups: vec![],
            network: "192.168.10.0/24".parse().unwrap(),
            masquerade: true,
            metric: 100,
            enabled: true,
        });
        let approved = all_approved(&snap);
        let policies = snap.resource_policies_map();
        let routers = snap.routers_map();

        // a sees c, so it learns c's route.
        let map = snap.build_peer_network_map("a", "mesh.example", None, &approved, &policies, &routers);
        assert_eq!(map.routes.len(), 1);
        assert_eq!(map.routes[0].peer_id, "c");

        // c serves the route itself.
        let map = snap.build_peer_network_map("c", "mesh.example", None, &approved, &policies, &routers);
        assert_eq!(map.routes.len(), 1);
    }

    #[test]
    fn posture_checks_resolve_via_source_groups() {
        let mut snap = snapshot();
        snap.policies[0].source_posture_checks = vec!["pc1".into()];
        snap.posture_checks.push(PostureChecks {
            id: "pc1".into(),
            account_id: "acc".into(),
            name: "os-check".into(),
            checks: serde_json::json!({"min_os": "14"}),
        });

        assert_eq!(snap.peer_posture_check_ids("a"), vec!["pc1".to_string()]);
        assert!(snap.peer_posture_check_ids("c").is_empty());
        assert_eq!(snap.peer_posture_checks("a").len(), 1);
    }
}
