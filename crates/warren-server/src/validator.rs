//! Pluggable peer validation
//!
//! The validator decides whether a peer may join the mesh at all, which
//! peers count as approved when network maps are built, and may rewrite a
//! peer at registration or update time. The default implementation admits
//! everyone; approval workflows and device-trust integrations replace it.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use warren_core::error::Result;
use warren_core::types::{Group, Peer};

#[async_trait]
pub trait PeerValidator: Send + Sync {
    /// Inspects a proposed peer update. Returns the effective update (the
    /// validator may normalize fields) and whether applying it requires the
    /// whole account to be re-broadcast.
    async fn validate_peer(
        &self,
        update: Peer,
        current: &Peer,
        user_id: &str,
        account_id: &str,
        dns_domain: &str,
        peer_groups: &[String],
        extra: Option<&serde_json::Value>,
    ) -> Result<(Peer, bool)>;

    /// Whether the peer is currently blocked (e.g. pending approval), and
    /// whether its validity flipped since the last check (which forces a
    /// broadcast so other peers drop or re-admit it).
    async fn is_not_valid_peer(
        &self,
        account_id: &str,
        peer: &Peer,
        peer_groups: &[String],
        extra: Option<&serde_json::Value>,
    ) -> Result<(bool, bool)>;

    /// The authoritative approved set used when building network maps.
    async fn get_validated_peers(
        &self,
        account_id: &str,
        groups: &HashMap<String, Group>,
        peers: &HashMap<String, Peer>,
        extra: Option<&serde_json::Value>,
    ) -> Result<HashSet<String>>;

    /// Lets the validator stamp fields at registration time.
    async fn prepare_peer(
        &self,
        account_id: &str,
        peer: Peer,
        auto_groups: &[String],
        extra: Option<&serde_json::Value>,
    ) -> Peer;

    /// Notification hook; fired inside the deletion transaction.
    async fn peer_deleted(
        &self,
        account_id: &str,
        peer_id: &str,
        extra: Option<&serde_json::Value>,
    ) -> Result<()>;
}

/// Open-enrollment validator: every registered peer is approved.
#[derive(Default)]
pub struct DefaultPeerValidator;

#[async_trait]
impl PeerValidator for DefaultPeerValidator {
    async fn validate_peer(
        &self,
        update: Peer,
        _current: &Peer,
        _user_id: &str,
        _account_id: &str,
        _dns_domain: &str,
        _peer_groups: &[String],
        _extra: Option<&serde_json::Value>,
    ) -> Result<(Peer, bool)> {
        Ok((update, false))
    }

    async fn is_not_valid_peer(
        &self,
        _account_id: &str,
        _peer: &Peer,
        _peer_groups: &[String],
        _extra: Option<&serde_json::Value>,
    ) -> Result<(bool, bool)> {
        Ok((false, false))
    }

    async fn get_validated_peers(
        &self,
        _account_id: &str,
        _groups: &HashMap<String, Group>,
        peers: &HashMap<String, Peer>,
        _extra: Option<&serde_json::Value>,
    ) -> Result<HashSet<String>> {
        Ok(peers.keys().cloned().collect())
    }

    async fn prepare_peer(
        &self,
        _account_id: &str,
        peer: Peer,
        _auto_groups: &[String],
        _extra: Option<&serde_json::Value>,
    ) -> Peer {
        peer
    }

    async fn peer_deleted(
        &self,
        _account_id: &str,
        _peer_id: &str,
        _extra: Option<&serde_json::Value>,
    ) -> Result<()> {
        Ok(())
    }
}
