//! Core types for the Warren control plane

use std::net::{IpAddr, Ipv4Addr};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::ip::Cidr;

/// Name of the implicit group every peer belongs to.
pub const ALL_GROUP_NAME: &str = "All";

/// Client-reported system metadata for a peer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMeta {
    pub hostname: String,
    pub os: String,
    pub os_version: String,
    pub kernel: String,
    pub platform: String,
    pub client_version: String,
    pub ui_version: String,
}

/// Connection state of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub connected: bool,
    pub last_seen: DateTime<Utc>,
    /// Set once the login expiration scheduler fires for this peer; cleared
    /// on the next successful connect.
    pub login_expired: bool,
}

impl PeerStatus {
    pub fn new(connected: bool, last_seen: DateTime<Utc>) -> Self {
        Self {
            connected,
            last_seen,
            login_expired: false,
        }
    }
}

/// Geolocation of the peer's last connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerLocation {
    pub connection_ip: Option<IpAddr>,
    pub country_code: String,
    pub city_name: String,
    pub geo_name_id: u32,
}

/// A host registered to an account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    /// Opaque identifier, unique across accounts.
    pub id: String,
    pub account_id: String,
    /// WireGuard public key. Globally unique: one machine, one registration.
    pub pub_key: String,
    pub name: String,
    /// DNS label, unique within the account.
    pub dns_label: String,
    /// Mesh address, unique within the account subnet.
    pub ip: Ipv4Addr,
    /// Registering user; `None` for setup-key peers.
    pub user_id: Option<String>,
    pub meta: PeerMeta,
    pub status: PeerStatus,
    pub ssh_enabled: bool,
    pub ssh_key: String,
    /// Only meaningful for SSO-added peers; setup-key peers never expire.
    pub login_expiration_enabled: bool,
    pub inactivity_expiration_enabled: bool,
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
    pub location: PeerLocation,
    pub extra_dns_labels: Vec<String>,
    pub allow_extra_dns_labels: bool,
}

impl Peer {
    /// True when the peer was registered through an interactive user login
    /// rather than a setup key. Only such peers are subject to login and
    /// inactivity expiration.
    pub fn added_with_sso_login(&self) -> bool {
        self.user_id.is_some()
    }

    /// Returns whether the login window has elapsed and how long remains
    /// (negative once past due). Always false for peers with the per-peer
    /// toggle off.
    pub fn login_expired(&self, expires_in: Duration) -> (bool, Duration) {
        let left = expires_in - (Utc::now() - self.last_login);
        (
            self.login_expiration_enabled && left <= Duration::zero(),
            left,
        )
    }

    /// Inactivity counterpart of [`Peer::login_expired`], measured from the
    /// moment the peer was last seen.
    pub fn session_expired(&self, expires_in: Duration) -> (bool, Duration) {
        let left = expires_in - (Utc::now() - self.status.last_seen);
        (
            self.inactivity_expiration_enabled && left <= Duration::zero(),
            left,
        )
    }

    /// Replaces metadata if the incoming snapshot differs. Returns whether
    /// anything changed, so callers can skip the store write.
    pub fn update_meta_if_new(&mut self, meta: PeerMeta) -> bool {
        if self.meta == meta {
            return false;
        }
        self.meta = meta;
        true
    }

    pub fn update_last_login(&mut self) {
        self.last_login = Utc::now();
    }

    pub fn fqdn(&self, dns_domain: &str) -> String {
        format!("{}.{}", self.dns_label, dns_domain)
    }

    /// Metadata attached to activity events about this peer.
    pub fn event_meta(&self, dns_domain: &str) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "fqdn": self.fqdn(dns_domain),
            "ip": self.ip.to_string(),
            "created_at": self.created_at.to_rfc3339(),
            "location_city_name": self.location.city_name,
            "location_country_code": self.location.country_code,
        })
    }
}

/// A named set of peers, the addressing unit for policies and routers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub peers: Vec<String>,
}

/// Hashes a setup-key secret the way it is stored: uppercased, SHA-256,
/// base64. Lookups compare hashes only.
pub fn hash_setup_key(secret: &str) -> String {
    let digest = Sha256::digest(secret.to_uppercase().as_bytes());
    BASE64.encode(digest)
}

/// Pre-shared secret authorizing new peer registrations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupKey {
    pub id: String,
    pub account_id: String,
    /// base64(sha256(uppercase(secret))); the plaintext is never stored.
    pub key_hash: String,
    pub name: String,
    pub auto_groups: Vec<String>,
    pub ephemeral: bool,
    pub allow_extra_dns_labels: bool,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    pub usage_limit: u32,
    pub used_times: u32,
}

impl SetupKey {
    pub fn is_valid(&self) -> bool {
        if self.revoked {
            return false;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at <= Utc::now() {
                return false;
            }
        }
        self.usage_limit == 0 || self.used_times < self.usage_limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Accept,
    Drop,
}

/// One firewall rule template inside a policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub id: String,
    pub enabled: bool,
    /// Source group IDs.
    pub sources: Vec<String>,
    /// Destination group IDs.
    pub destinations: Vec<String>,
    pub protocol: Protocol,
    /// Destination ports; empty means any.
    pub ports: Vec<String>,
    pub action: RuleAction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub enabled: bool,
    pub rules: Vec<PolicyRule>,
    /// Posture-check bundles evaluated against peers in the source groups.
    pub source_posture_checks: Vec<String>,
}

/// A peer that advertises reachability to an external network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRouter {
    pub id: String,
    pub account_id: String,
    /// Peer running the router; empty when `peer_groups` is used instead.
    pub peer: String,
    pub peer_groups: Vec<String>,
    pub network: Cidr,
    pub masquerade: bool,
    pub metric: u32,
    pub enabled: bool,
}

/// The account's mesh subnet together with its topology serial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    pub cidr: Cidr,
    /// Monotone counter bumped inside every topology-mutating transaction;
    /// clients use it to detect stale network maps.
    pub serial: u64,
}

impl Network {
    pub fn current_serial(&self) -> u64 {
        self.serial
    }
}

/// Per-account settings the peer manager consults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub peer_login_expiration_enabled: bool,
    pub peer_login_expiration: Duration,
    pub peer_inactivity_expiration_enabled: bool,
    pub peer_inactivity_expiration: Duration,
    pub regular_users_view_blocked: bool,
    pub dns_domain: Option<String>,
    /// Opaque extension blob handed to pluggable validators.
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub account_id: String,
    pub role: UserRole,
    pub blocked: bool,
    pub auto_groups: Vec<String>,
    pub last_login: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn is_admin_or_owner(&self) -> bool {
        matches!(self.role, UserRole::Owner | UserRole::Admin)
    }

    /// Regular users can be hidden from each other via account settings.
    pub fn is_restrictable(&self) -> bool {
        self.role == UserRole::User
    }
}

/// A named bundle of pre-admission checks referenced by policies. The
/// definitions are opaque to the peer manager; clients evaluate them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostureChecks {
    pub id: String,
    pub account_id: String,
    pub name: String,
    pub checks: serde_json::Value,
}

/// Placeholder properties for a peer about to be registered.
#[derive(Debug, Clone, Default)]
pub struct PeerTemplate {
    pub pub_key: String,
    pub meta: PeerMeta,
    pub ssh_key: String,
    pub connection_ip: Option<IpAddr>,
    pub extra_dns_labels: Vec<String>,
}

/// The mutable subset of a peer exposed to the management API.
#[derive(Debug, Clone)]
pub struct PeerUpdateRequest {
    pub id: String,
    pub name: String,
    pub ssh_enabled: bool,
    pub login_expiration_enabled: bool,
    pub inactivity_expiration_enabled: bool,
}

/// Login request forwarded from the management API.
#[derive(Debug, Clone, Default)]
pub struct PeerLogin {
    pub wireguard_pub_key: String,
    pub ssh_key: String,
    pub meta: PeerMeta,
    /// Present when the client authenticated with a JWT.
    pub user_id: Option<String>,
    /// Present when the client supplied a setup key.
    pub setup_key: Option<String>,
    pub connection_ip: Option<IpAddr>,
    pub extra_dns_labels: Vec<String>,
}

/// Periodic sync request from a connected peer.
#[derive(Debug, Clone, Default)]
pub struct PeerSync {
    pub wireguard_pub_key: String,
    pub meta: PeerMeta,
    /// Set by the transport when it knows other peers must be refreshed.
    pub update_account_peers: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_key_hash_is_case_insensitive() {
        assert_eq!(hash_setup_key("abc123"), hash_setup_key("ABC123"));
        assert_ne!(hash_setup_key("ABC123"), hash_setup_key("ABC124"));
    }

    #[test]
    fn setup_key_validity() {
        let mut key = SetupKey {
            id: "k1".into(),
            account_id: "a1".into(),
            key_hash: hash_setup_key("ABC123"),
            name: "default".into(),
            auto_groups: vec![],
            ephemeral: false,
            allow_extra_dns_labels: false,
            revoked: false,
            expires_at: None,
            usage_limit: 2,
            used_times: 0,
        };
        assert!(key.is_valid());

        key.used_times = 2;
        assert!(!key.is_valid());

        key.usage_limit = 0;
        assert!(key.is_valid());

        key.revoked = true;
        assert!(!key.is_valid());

        key.revoked = false;
        key.expires_at = Some(Utc::now() - Duration::hours(1));
        assert!(!key.is_valid());
    }

    #[test]
    fn sso_flag_follows_user_id() {
        let mut peer = test_peer();
        assert!(peer.added_with_sso_login());
        peer.user_id = None;
        assert!(!peer.added_with_sso_login());
    }

    #[test]
    fn login_expiry_window() {
        let mut peer = test_peer();
        peer.last_login = Utc::now() - Duration::hours(25);
        let (expired, left) = peer.login_expired(Duration::hours(24));
        assert!(expired);
        assert!(left < Duration::zero());

        peer.last_login = Utc::now();
        let (expired, _) = peer.login_expired(Duration::hours(24));
        assert!(!expired);
    }

    #[test]
    fn meta_update_reports_changes() {
        let mut peer = test_peer();
        let same = peer.meta.clone();
        assert!(!peer.update_meta_if_new(same));

        let mut changed = peer.meta.clone();
        changed.client_version = "0.5.1".into();
        assert!(peer.update_meta_if_new(changed));
        assert_eq!(peer.meta.client_version, "0.5.1");
    }

    fn test_peer() -> Peer {
        Peer {
            id: "p1".into(),
            account_id: "a1".into(),
            pub_key: "key".into(),
            name: "laptop-1".into(),
            dns_label: "laptop-1".into(),
            ip: Ipv4Addr::new(100, 64, 0, 5),
            user_id: Some("u1".into()),
            meta: PeerMeta {
                hostname: "laptop-1".into(),
                ..Default::default()
            },
            status: PeerStatus::new(false, Utc::now()),
            ssh_enabled: false,
            ssh_key: String::new(),
            login_expiration_enabled: true,
            inactivity_expiration_enabled: false,
            ephemeral: false,
            created_at: Utc::now(),
            last_login: Utc::now(),
            location: PeerLocation::default(),
            extra_dns_labels: vec![],
            allow_extra_dns_labels: false,
        }
    }
}
