//! Row operations for the store gateway
//!
//! Every function takes `&mut SqliteConnection` so the same code path
//! serves pool reads and in-transaction use.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;

use warren_core::account::AccountSnapshot;
use warren_core::error::{Error, Result};
use warren_core::ip::Cidr;
use warren_core::types::{
    Group, Network, NetworkRouter, Peer, PeerLocation, PeerMeta, PeerStatus, Policy,
    PostureChecks, Settings, SetupKey, User, UserRole, ALL_GROUP_NAME,
};

use crate::store::{store_err, LockingStrength};

#[derive(sqlx::FromRow)]
struct PeerRow {
    id: String,
    account_id: String,
    pub_key: String,
    name: String,
    dns_label: String,
    ip: String,
    user_id: Option<String>,
    meta: String,
    connected: bool,
    last_seen: String,
    login_expired: bool,
    ssh_enabled: bool,
    ssh_key: String,
    login_expiration_enabled: bool,
    inactivity_expiration_enabled: bool,
    ephemeral: bool,
    created_at: String,
    last_login: String,
    connection_ip: Option<String>,
    country_code: String,
    city_name: String,
    geo_name_id: i64,
    extra_dns_labels: String,
    allow_extra_dns_labels: bool,
}

const PEER_COLUMNS: &str = "id, account_id, pub_key, name, dns_label, ip, user_id, meta, \
     connected, last_seen, login_expired, ssh_enabled, ssh_key, \
     login_expiration_enabled, inactivity_expiration_enabled, ephemeral, \
     created_at, last_login, connection_ip, country_code, city_name, \
     geo_name_id, extra_dns_labels, allow_extra_dns_labels";

impl TryFrom<PeerRow> for Peer {
    type Error = Error;

    fn try_from(row: PeerRow) -> Result<Peer> {
        Ok(Peer {
            ip: row
                .ip
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::internal(format!("peer {} has bad ip: {e}", row.id)))?,
            meta: serde_json::from_str(&row.meta)
                .map_err(|e| Error::internal(format!("peer {} has bad meta: {e}", row.id)))?,
            status: PeerStatus {
                connected: row.connected,
                last_seen: parse_ts(&row.last_seen)?,
                login_expired: row.login_expired,
            },
            created_at: parse_ts(&row.created_at)?,
            last_login: parse_ts(&row.last_login)?,
            location: PeerLocation {
                connection_ip: row.connection_ip.and_then(|s| s.parse::<IpAddr>().ok()),
                country_code: row.country_code,
                city_name: row.city_name,
                geo_name_id: row.geo_name_id as u32,
            },
            extra_dns_labels: serde_json::from_str(&row.extra_dns_labels).unwrap_or_default(),
            id: row.id,
            account_id: row.account_id,
            pub_key: row.pub_key,
            name: row.name,
            dns_label: row.dns_label,
            user_id: row.user_id,
            ssh_enabled: row.ssh_enabled,
            ssh_key: row.ssh_key,
            login_expiration_enabled: row.login_expiration_enabled,
            inactivity_expiration_enabled: row.inactivity_expiration_enabled,
            ephemeral: row.ephemeral,
            allow_extra_dns_labels: row.allow_extra_dns_labels,
        })
    }
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|e| Error::internal(format!("bad timestamp {value:?}: {e}")))
}

// === Accounts ===

pub async fn get_account_network(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Network> {
    let row: Option<(String, i64)> = sqlx::query_as(&format!(
        "SELECT network_cidr, network_serial FROM accounts WHERE id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_optional(conn)
    .await
    .map_err(store_err)?;
    let (cidr, serial) =
        row.ok_or_else(|| Error::not_found(format!("account {account_id}")))?;
    Ok(Network {
        cidr: cidr.parse::<Cidr>()?,
        serial: serial as u64,
    })
}

pub async fn get_account_settings(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Settings> {
    let row: Option<(bool, i64, bool, i64, bool, Option<String>, Option<String>)> =
        sqlx::query_as(&format!(
            "SELECT peer_login_expiration_enabled, peer_login_expiration_secs, \
             peer_inactivity_expiration_enabled, peer_inactivity_expiration_secs, \
             regular_users_view_blocked, dns_domain, extra_settings \
             FROM accounts WHERE id = ?{}",
            strength.sql_suffix()
        ))
        .bind(account_id)
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    let (login_enabled, login_secs, inactivity_enabled, inactivity_secs, view_blocked, dns, extra) =
        row.ok_or_else(|| Error::not_found(format!("account {account_id}")))?;
    Ok(Settings {
        peer_login_expiration_enabled: login_enabled,
        peer_login_expiration: Duration::seconds(login_secs),
        peer_inactivity_expiration_enabled: inactivity_enabled,
        peer_inactivity_expiration: Duration::seconds(inactivity_secs),
        regular_users_view_blocked: view_blocked,
        dns_domain: dns,
        extra: extra.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

pub async fn increment_network_serial(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
) -> Result<()> {
    let result = sqlx::query("UPDATE accounts SET network_serial = network_serial + 1 WHERE id = ?")
        .bind(account_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("account {account_id}")));
    }
    Ok(())
}

// === Peers ===

pub async fn get_peer_by_id(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
    peer_id: &str,
) -> Result<Peer> {
    let row: Option<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE account_id = ? AND id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .bind(peer_id)
    .fetch_optional(conn)
    .await
    .map_err(store_err)?;
    row.ok_or_else(|| Error::not_found(format!("peer {peer_id}")))?
        .try_into()
}

pub async fn get_peer_by_pub_key(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    pub_key: &str,
) -> Result<Peer> {
    let row: Option<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE pub_key = ?{}",
        strength.sql_suffix()
    ))
    .bind(pub_key)
    .fetch_optional(conn)
    .await
    .map_err(store_err)?;
    row.ok_or_else(|| Error::not_found("peer by public key".to_string()))?
        .try_into()
}

pub async fn get_account_id_by_peer_pub_key(
    conn: &mut SqliteConnection,
    pub_key: &str,
) -> Result<String> {
    let id: Option<String> = sqlx::query_scalar("SELECT account_id FROM peers WHERE pub_key = ?")
        .bind(pub_key)
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    id.ok_or_else(|| Error::not_found("peer by public key".to_string()))
}

pub async fn get_account_id_by_peer_id(
    conn: &mut SqliteConnection,
    peer_id: &str,
) -> Result<String> {
    let id: Option<String> = sqlx::query_scalar("SELECT account_id FROM peers WHERE id = ?")
        .bind(peer_id)
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    id.ok_or_else(|| Error::not_found(format!("peer {peer_id}")))
}

pub async fn get_account_peers(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<Peer>> {
    let rows: Vec<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE account_id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    rows.into_iter().map(Peer::try_from).collect()
}

pub async fn get_user_peers(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
    user_id: &str,
) -> Result<Vec<Peer>> {
    let rows: Vec<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers WHERE account_id = ? AND user_id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .bind(user_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    rows.into_iter().map(Peer::try_from).collect()
}

/// Peers that can be subject to login expiration: SSO-added with the
/// per-peer toggle on.
pub async fn get_account_peers_with_expiration(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<Peer>> {
    let rows: Vec<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers \
         WHERE account_id = ? AND login_expiration_enabled = 1 AND user_id IS NOT NULL{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    rows.into_iter().map(Peer::try_from).collect()
}

/// Peers that can be subject to inactivity expiration.
pub async fn get_account_peers_with_inactivity(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<Peer>> {
    let rows: Vec<PeerRow> = sqlx::query_as(&format!(
        "SELECT {PEER_COLUMNS} FROM peers \
         WHERE account_id = ? AND inactivity_expiration_enabled = 1 AND user_id IS NOT NULL{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    rows.into_iter().map(Peer::try_from).collect()
}

pub async fn add_peer_to_account(conn: &mut SqliteConnection, peer: &Peer) -> Result<()> {
    sqlx::query(
        "INSERT INTO peers (id, account_id, pub_key, name, dns_label, ip, user_id, meta, \
         connected, last_seen, login_expired, ssh_enabled, ssh_key, \
         login_expiration_enabled, inactivity_expiration_enabled, ephemeral, \
         created_at, last_login, connection_ip, country_code, city_name, geo_name_id, \
         extra_dns_labels, allow_extra_dns_labels) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&peer.id)
    .bind(&peer.account_id)
    .bind(&peer.pub_key)
    .bind(&peer.name)
    .bind(&peer.dns_label)
    .bind(peer.ip.to_string())
    .bind(&peer.user_id)
    .bind(serde_json::to_string(&peer.meta).unwrap_or_else(|_| "{}".into()))
    .bind(peer.status.connected)
    .bind(peer.status.last_seen.to_rfc3339())
    .bind(peer.status.login_expired)
    .bind(peer.ssh_enabled)
    .bind(&peer.ssh_key)
    .bind(peer.login_expiration_enabled)
    .bind(peer.inactivity_expiration_enabled)
    .bind(peer.ephemeral)
    .bind(peer.created_at.to_rfc3339())
    .bind(peer.last_login.to_rfc3339())
    .bind(peer.location.connection_ip.map(|ip| ip.to_string()))
    .bind(&peer.location.country_code)
    .bind(&peer.location.city_name)
    .bind(peer.location.geo_name_id as i64)
    .bind(serde_json::to_string(&peer.extra_dns_labels).unwrap_or_else(|_| "[]".into()))
    .bind(peer.allow_extra_dns_labels)
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn save_peer(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
    peer: &Peer,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE peers SET name = ?, dns_label = ?, user_id = ?, meta = ?, \
         connected = ?, last_seen = ?, login_expired = ?, ssh_enabled = ?, ssh_key = ?, \
         login_expiration_enabled = ?, inactivity_expiration_enabled = ?, last_login = ?, \
         extra_dns_labels = ?, allow_extra_dns_labels = ? \
         WHERE account_id = ? AND id = ?",
    )
    .bind(&peer.name)
    .bind(&peer.dns_label)
    .bind(&peer.user_id)
    .bind(serde_json::to_string(&peer.meta).unwrap_or_else(|_| "{}".into()))
    .bind(peer.status.connected)
    .bind(peer.status.last_seen.to_rfc3339())
    .bind(peer.status.login_expired)
    .bind(peer.ssh_enabled)
    .bind(&peer.ssh_key)
    .bind(peer.login_expiration_enabled)
    .bind(peer.inactivity_expiration_enabled)
    .bind(peer.last_login.to_rfc3339())
    .bind(serde_json::to_string(&peer.extra_dns_labels).unwrap_or_else(|_| "[]".into()))
    .bind(peer.allow_extra_dns_labels)
    .bind(account_id)
    .bind(&peer.id)
    .execute(conn)
    .await
    .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("peer {}", peer.id)));
    }
    Ok(())
}

pub async fn save_peer_status(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
    peer_id: &str,
    status: &PeerStatus,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE peers SET connected = ?, last_seen = ?, login_expired = ? \
         WHERE account_id = ? AND id = ?",
    )
    .bind(status.connected)
    .bind(status.last_seen.to_rfc3339())
    .bind(status.login_expired)
    .bind(account_id)
    .bind(peer_id)
    .execute(conn)
    .await
    .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("peer {peer_id}")));
    }
    Ok(())
}

pub async fn save_peer_location(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
    peer: &Peer,
) -> Result<()> {
    sqlx::query(
        "UPDATE peers SET connection_ip = ?, country_code = ?, city_name = ?, geo_name_id = ? \
         WHERE account_id = ? AND id = ?",
    )
    .bind(peer.location.connection_ip.map(|ip| ip.to_string()))
    .bind(&peer.location.country_code)
    .bind(&peer.location.city_name)
    .bind(peer.location.geo_name_id as i64)
    .bind(account_id)
    .bind(&peer.id)
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn delete_peer(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
    peer_id: &str,
) -> Result<()> {
    let result = sqlx::query("DELETE FROM peers WHERE account_id = ? AND id = ?")
        .bind(account_id)
        .bind(peer_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("peer {peer_id}")));
    }
    Ok(())
}

/// Rename pre-check: does any peer already hold this label?
pub async fn get_peer_id_by_dns_label(
    conn: &mut SqliteConnection,
    account_id: &str,
    dns_label: &str,
) -> Result<Option<String>> {
    sqlx::query_scalar("SELECT id FROM peers WHERE account_id = ? AND dns_label = ?")
        .bind(account_id)
        .bind(dns_label)
        .fetch_optional(conn)
        .await
        .map_err(store_err)
}

// === Setup keys ===

pub async fn get_setup_key_by_secret(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    key_hash: &str,
) -> Result<SetupKey> {
    let row: Option<(String, String, String, String, bool, bool, bool, Option<String>, i64, i64)> =
        sqlx::query_as(&format!(
            "SELECT id, account_id, name, auto_groups, ephemeral, allow_extra_dns_labels, \
             revoked, expires_at, usage_limit, used_times FROM setup_keys WHERE key_hash = ?{}",
            strength.sql_suffix()
        ))
        .bind(key_hash)
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    let (id, account_id, name, auto_groups, ephemeral, allow_extra, revoked, expires_at, limit, used) =
        row.ok_or_else(|| Error::not_found("setup key".to_string()))?;
    Ok(SetupKey {
        id,
        account_id,
        key_hash: key_hash.to_string(),
        name,
        auto_groups: serde_json::from_str(&auto_groups).unwrap_or_default(),
        ephemeral,
        allow_extra_dns_labels: allow_extra,
        revoked,
        expires_at: expires_at.as_deref().map(parse_ts).transpose()?,
        usage_limit: limit as u32,
        used_times: used as u32,
    })
}

pub async fn increment_setup_key_usage(conn: &mut SqliteConnection, key_id: &str) -> Result<()> {
    let result = sqlx::query("UPDATE setup_keys SET used_times = used_times + 1 WHERE id = ?")
        .bind(key_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::not_found(format!("setup key {key_id}")));
    }
    Ok(())
}

// === Users ===

pub async fn get_user_by_id(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    user_id: &str,
) -> Result<User> {
    let row: Option<(String, String, String, bool, String, Option<String>)> =
        sqlx::query_as(&format!(
            "SELECT id, account_id, role, blocked, auto_groups, last_login \
             FROM users WHERE id = ?{}",
            strength.sql_suffix()
        ))
        .bind(user_id)
        .fetch_optional(conn)
        .await
        .map_err(store_err)?;
    let (id, account_id, role, blocked, auto_groups, last_login) =
        row.ok_or_else(|| Error::not_found(format!("user {user_id}")))?;
    Ok(User {
        id,
        account_id,
        role: parse_role(&role),
        blocked,
        auto_groups: serde_json::from_str(&auto_groups).unwrap_or_default(),
        last_login: last_login.as_deref().map(parse_ts).transpose()?,
    })
}

fn parse_role(role: &str) -> UserRole {
    match role {
        "owner" => UserRole::Owner,
        "admin" => UserRole::Admin,
        _ => UserRole::User,
    }
}

pub async fn save_user_last_login(
    conn: &mut SqliteConnection,
    account_id: &str,
    user_id: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("UPDATE users SET last_login = ? WHERE account_id = ? AND id = ?")
        .bind(at.to_rfc3339())
        .bind(account_id)
        .bind(user_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

// === Groups ===

pub async fn get_account_groups(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<Group>> {
    let rows: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT id, account_id, name FROM groups WHERE account_id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(store_err)?;

    let members: Vec<(String, String)> = sqlx::query_as(
        "SELECT gp.group_id, gp.peer_id FROM group_peers gp \
         JOIN groups g ON g.id = gp.group_id WHERE g.account_id = ?",
    )
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;

    let mut by_group: HashMap<String, Vec<String>> = HashMap::new();
    for (group_id, peer_id) in members {
        by_group.entry(group_id).or_default().push(peer_id);
    }

    Ok(rows
        .into_iter()
        .map(|(id, account_id, name)| Group {
            peers: by_group.remove(&id).unwrap_or_default(),
            id,
            account_id,
            name,
        })
        .collect())
}

pub async fn get_groups_by_ids(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
    group_ids: &[String],
) -> Result<HashMap<String, Group>> {
    let groups = get_account_groups(conn, strength, account_id).await?;
    Ok(groups
        .into_iter()
        .filter(|g| group_ids.contains(&g.id))
        .map(|g| (g.id.clone(), g))
        .collect())
}

pub async fn get_peer_group_ids(
    conn: &mut SqliteConnection,
    _strength: LockingStrength,
    account_id: &str,
    peer_id: &str,
) -> Result<Vec<String>> {
    sqlx::query_scalar(
        "SELECT gp.group_id FROM group_peers gp \
         JOIN groups g ON g.id = gp.group_id \
         WHERE g.account_id = ? AND gp.peer_id = ?",
    )
    .bind(account_id)
    .bind(peer_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)
}

pub async fn add_peer_to_group(
    conn: &mut SqliteConnection,
    account_id: &str,
    peer_id: &str,
    group_id: &str,
) -> Result<()> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO group_peers (group_id, peer_id) \
         SELECT id, ? FROM groups WHERE account_id = ? AND id = ?",
    )
    .bind(peer_id)
    .bind(account_id)
    .bind(group_id)
    .execute(conn)
    .await
    .map_err(store_err)?;
    if result.rows_affected() == 0 {
        tracing::debug!("group {group_id} not found in account {account_id}, skipping");
    }
    Ok(())
}

/// Every peer belongs to the implicit "All" group.
pub async fn add_peer_to_all_group(
    conn: &mut SqliteConnection,
    account_id: &str,
    peer_id: &str,
) -> Result<()> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO group_peers (group_id, peer_id) \
         SELECT id, ? FROM groups WHERE account_id = ? AND name = ?",
    )
    .bind(peer_id)
    .bind(account_id)
    .bind(ALL_GROUP_NAME)
    .execute(conn)
    .await
    .map_err(store_err)?;
    if result.rows_affected() == 0 {
        return Err(Error::internal(format!(
            "account {account_id} has no {ALL_GROUP_NAME} group"
        )));
    }
    Ok(())
}

pub async fn remove_peer_from_all_groups(
    conn: &mut SqliteConnection,
    peer_id: &str,
) -> Result<()> {
    sqlx::query("DELETE FROM group_peers WHERE peer_id = ?")
        .bind(peer_id)
        .execute(conn)
        .await
        .map_err(store_err)?;
    Ok(())
}

// === Policies, routers, posture checks ===

pub async fn get_account_policies(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<Policy>> {
    let rows: Vec<(String, String, String, bool, String, String)> = sqlx::query_as(&format!(
        "SELECT id, account_id, name, enabled, rules, source_posture_checks \
         FROM policies WHERE account_id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    rows.into_iter()
        .map(|(id, account_id, name, enabled, rules, checks)| {
            Ok(Policy {
                rules: serde_json::from_str(&rules)
                    .map_err(|e| Error::internal(format!("policy {id} has bad rules: {e}")))?,
                source_posture_checks: serde_json::from_str(&checks).unwrap_or_default(),
                id,
                account_id,
                name,
                enabled,
            })
        })
        .collect()
}

pub async fn get_network_routers_by_account_id(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<NetworkRouter>> {
    let rows: Vec<(String, String, String, String, String, bool, i64, bool)> =
        sqlx::query_as(&format!(
            "SELECT id, account_id, peer_id, peer_groups, network, masquerade, metric, enabled \
             FROM network_routers WHERE account_id = ?{}",
            strength.sql_suffix()
        ))
        .bind(account_id)
        .fetch_all(conn)
        .await
        .map_err(store_err)?;
    rows.into_iter()
        .map(
            |(id, account_id, peer, peer_groups, network, masquerade, metric, enabled)| {
                Ok(NetworkRouter {
                    network: network.parse::<Cidr>()?,
                    peer_groups: serde_json::from_str(&peer_groups).unwrap_or_default(),
                    id,
                    account_id,
                    peer,
                    masquerade,
                    metric: metric as u32,
                    enabled,
                })
            },
        )
        .collect()
}

pub async fn get_account_posture_checks(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
) -> Result<Vec<PostureChecks>> {
    let rows: Vec<(String, String, String, String)> = sqlx::query_as(&format!(
        "SELECT id, account_id, name, checks FROM posture_checks WHERE account_id = ?{}",
        strength.sql_suffix()
    ))
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    Ok(rows
        .into_iter()
        .map(|(id, account_id, name, checks)| PostureChecks {
            checks: serde_json::from_str(&checks).unwrap_or(serde_json::Value::Null),
            id,
            account_id,
            name,
        })
        .collect())
}

pub async fn get_posture_checks_by_ids(
    conn: &mut SqliteConnection,
    strength: LockingStrength,
    account_id: &str,
    ids: &[String],
) -> Result<Vec<PostureChecks>> {
    let all = get_account_posture_checks(conn, strength, account_id).await?;
    Ok(all.into_iter().filter(|c| ids.contains(&c.id)).collect())
}

// === Full account snapshot ===

/// Materializes the immutable view one broadcast pass works from.
pub async fn get_full_account(
    conn: &mut SqliteConnection,
    account_id: &str,
) -> Result<AccountSnapshot> {
    let network = get_account_network(conn, LockingStrength::None, account_id).await?;
    let settings = get_account_settings(conn, LockingStrength::None, account_id).await?;
    let peers = get_account_peers(conn, LockingStrength::None, account_id).await?;
    let groups = get_account_groups(conn, LockingStrength::None, account_id).await?;
    let policies = get_account_policies(conn, LockingStrength::None, account_id).await?;
    let routers = get_network_routers_by_account_id(conn, LockingStrength::None, account_id).await?;
    let posture_checks = get_account_posture_checks(conn, LockingStrength::None, account_id).await?;

    let user_rows: Vec<(String, String, String, bool, String, Option<String>)> = sqlx::query_as(
        "SELECT id, account_id, role, blocked, auto_groups, last_login \
         FROM users WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_all(conn)
    .await
    .map_err(store_err)?;
    let mut users = HashMap::new();
    for (id, account_id, role, blocked, auto_groups, last_login) in user_rows {
        users.insert(
            id.clone(),
            User {
                id,
                account_id,
                role: parse_role(&role),
                blocked,
                auto_groups: serde_json::from_str(&auto_groups).unwrap_or_default(),
                last_login: last_login.as_deref().map(parse_ts).transpose()?,
            },
        );
    }

    Ok(AccountSnapshot {
        id: account_id.to_string(),
        network,
        settings,
        peers: peers.into_iter().map(|p| (p.id.clone(), p)).collect(),
        groups: groups.into_iter().map(|g| (g.id.clone(), g)).collect(),
        policies,
        routers,
        posture_checks,
        users,
    })
}

// === Bootstrap / administrative writes ===

pub async fn save_account(
    conn: &mut SqliteConnection,
    account_id: &str,
    cidr: &Cidr,
    settings: &Settings,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO accounts (id, network_cidr, network_serial, dns_domain, \
         peer_login_expiration_enabled, peer_login_expiration_secs, \
         peer_inactivity_expiration_enabled, peer_inactivity_expiration_secs, \
         regular_users_view_blocked, extra_settings) \
         VALUES (?, ?, COALESCE((SELECT network_serial FROM accounts WHERE id = ?), 0), ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(account_id)
    .bind(cidr.to_string())
    .bind(account_id)
    .bind(&settings.dns_domain)
    .bind(settings.peer_login_expiration_enabled)
    .bind(settings.peer_login_expiration.num_seconds())
    .bind(settings.peer_inactivity_expiration_enabled)
    .bind(settings.peer_inactivity_expiration.num_seconds())
    .bind(settings.regular_users_view_blocked)
    .bind(settings.extra.as_ref().map(|v| v.to_string()))
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn save_user(conn: &mut SqliteConnection, user: &User) -> Result<()> {
    let role = match user.role {
        UserRole::Owner => "owner",
        UserRole::Admin => "admin",
        UserRole::User => "user",
    };
    sqlx::query(
        "INSERT OR REPLACE INTO users (id, account_id, role, blocked, auto_groups, last_login) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&user.id)
    .bind(&user.account_id)
    .bind(role)
    .bind(user.blocked)
    .bind(serde_json::to_string(&user.auto_groups).unwrap_or_else(|_| "[]".into()))
    .bind(user.last_login.map(|t| t.to_rfc3339()))
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn save_group(conn: &mut SqliteConnection, group: &Group) -> Result<()> {
    sqlx::query("INSERT OR REPLACE INTO groups (id, account_id, name) VALUES (?, ?, ?)")
        .bind(&group.id)
        .bind(&group.account_id)
        .bind(&group.name)
        .execute(&mut *conn)
        .await
        .map_err(store_err)?;
    for peer_id in &group.peers {
        sqlx::query("INSERT OR IGNORE INTO group_peers (group_id, peer_id) VALUES (?, ?)")
            .bind(&group.id)
            .bind(peer_id)
            .execute(&mut *conn)
            .await
            .map_err(store_err)?;
    }
    Ok(())
}

pub async fn save_setup_key(conn: &mut SqliteConnection, key: &SetupKey) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO setup_keys (id, account_id, key_hash, name, auto_groups, \
         ephemeral, allow_extra_dns_labels, revoked, expires_at, usage_limit, used_times) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&key.id)
    .bind(&key.account_id)
    .bind(&key.key_hash)
    .bind(&key.name)
    .bind(serde_json::to_string(&key.auto_groups).unwrap_or_else(|_| "[]".into()))
    .bind(key.ephemeral)
    .bind(key.allow_extra_dns_labels)
    .bind(key.revoked)
    .bind(key.expires_at.map(|t| t.to_rfc3339()))
    .bind(key.usage_limit as i64)
    .bind(key.used_times as i64)
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn save_policy(conn: &mut SqliteConnection, policy: &Policy) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO policies (id, account_id, name, enabled, rules, \
         source_posture_checks) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&policy.id)
    .bind(&policy.account_id)
    .bind(&policy.name)
    .bind(policy.enabled)
    .bind(serde_json::to_string(&policy.rules).unwrap_or_else(|_| "[]".into()))
    .bind(serde_json::to_string(&policy.source_posture_checks).unwrap_or_else(|_| "[]".into()))
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}

pub async fn save_network_router(
    conn: &mut SqliteConnection,
    router: &NetworkRouter,
) -> Result<()> {
    sqlx::query(
        "INSERT OR REPLACE INTO network_routers (id, account_id, peer_id, peer_groups, \
         network, masquerade, metric, enabled) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&router.id)
    .bind(&router.account_id)
    .bind(&router.peer)
    .bind(serde_json::to_string(&router.peer_groups).unwrap_or_else(|_| "[]".into()))
    .bind(router.network.to_string())
    .bind(router.masquerade)
    .bind(router.metric as i64)
    .bind(router.enabled)
    .execute(conn)
    .await
    .map_err(store_err)?;
    Ok(())
}
