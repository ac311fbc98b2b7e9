//! Test utilities

use std::sync::Arc;

use chrono::Duration;
use sqlx::sqlite::SqlitePoolOptions;

use warren_core::ip::Cidr;
use warren_core::keys::WgKeyPair;
use warren_core::types::{
    hash_setup_key, Group, PeerMeta, PeerTemplate, Policy, PolicyRule, Protocol, RuleAction,
    Settings, SetupKey, User, UserRole, ALL_GROUP_NAME,
};

use warren_server::integrations::{IdpManager, IdpUserData};
use warren_server::manager::{AccountPeerManager, ManagerOptions};
use warren_server::queries;
use warren_server::store::{migrate, Store};

pub const TEST_ACCOUNT: &str = "account-a";
pub const TEST_ADMIN: &str = "u1";
pub const TEST_SETUP_KEY: &str = "ABC123";

/// In-memory store with the default account fixture: a /16 mesh, an "All"
/// group, an admin user and one unlimited setup key.
pub async fn create_test_store() -> Arc<Store> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create test database");
    migrate(&pool).await.expect("Failed to run migrations");

    let store = Arc::new(Store::new(pool));
    seed_account(&store).await;
    store
}

pub async fn create_test_manager() -> (Arc<AccountPeerManager>, Arc<Store>) {
    create_test_manager_with(ManagerOptions::default()).await
}

pub async fn create_test_manager_with(
    opts: ManagerOptions,
) -> (Arc<AccountPeerManager>, Arc<Store>) {
    let store = create_test_store().await;
    let manager = AccountPeerManager::new(store.clone(), opts);
    (manager, store)
}

async fn seed_account(store: &Store) {
    let mut conn = store.acquire().await.unwrap();
    let cidr: Cidr = "100.64.0.0/16".parse().unwrap();
    let settings = Settings {
        peer_login_expiration_enabled: true,
        peer_login_expiration: Duration::hours(24),
        peer_inactivity_expiration_enabled: false,
        peer_inactivity_expiration: Duration::minutes(10),
        regular_users_view_blocked: false,
        dns_domain: None,
        extra: None,
    };
    queries::save_account(&mut conn, TEST_ACCOUNT, &cidr, &settings)
        .await
        .unwrap();

    queries::save_group(
        &mut conn,
        &Group {
            id: "grp-all".into(),
            account_id: TEST_ACCOUNT.into(),
            name: ALL_GROUP_NAME.into(),
            peers: vec![],
        },
    )
    .await
    .unwrap();

    queries::save_user(
        &mut conn,
        &User {
            id: TEST_ADMIN.into(),
            account_id: TEST_ACCOUNT.into(),
            role: UserRole::Admin,
            blocked: false,
            auto_groups: vec![],
            last_login: None,
        },
    )
    .await
    .unwrap();

    queries::save_setup_key(
        &mut conn,
        &SetupKey {
            id: "sk1".into(),
            account_id: TEST_ACCOUNT.into(),
            key_hash: hash_setup_key(TEST_SETUP_KEY),
            name: "default".into(),
            auto_groups: vec![],
            ephemeral: false,
            allow_extra_dns_labels: false,
            revoked: false,
            expires_at: None,
            usage_limit: 0,
            used_times: 0,
        },
    )
    .await
    .unwrap();
}

pub async fn seed_group(store: &Store, id: &str, name: &str) {
    let mut conn = store.acquire().await.unwrap();
    queries::save_group(
        &mut conn,
        &Group {
            id: id.into(),
            account_id: TEST_ACCOUNT.into(),
            name: name.into(),
            peers: vec![],
        },
    )
    .await
    .unwrap();
}

/// Policy connecting the "All" group to itself, which makes every peer an
/// active-group member and visible to every other.
pub async fn seed_all_to_all_policy(store: &Store) {
    let mut conn = store.acquire().await.unwrap();
    queries::save_policy(
        &mut conn,
        &Policy {
            id: "pol-all".into(),
            account_id: TEST_ACCOUNT.into(),
            name: "default".into(),
            enabled: true,
            rules: vec![PolicyRule {
                id: "pol-all-r1".into(),
                enabled: true,
                sources: vec!["grp-all".into()],
                destinations: vec!["grp-all".into()],
                protocol: Protocol::All,
                ports: vec![],
                action: RuleAction::Accept,
            }],
            source_posture_checks: vec![],
        },
    )
    .await
    .unwrap();
}

pub fn template(hostname: &str) -> PeerTemplate {
    PeerTemplate {
        pub_key: WgKeyPair::generate().public_key,
        meta: PeerMeta {
            hostname: hostname.into(),
            os: "linux".into(),
            os_version: "6.8".into(),
            kernel: "Linux".into(),
            platform: "x86_64".into(),
            client_version: "0.4.0".into(),
            ui_version: String::new(),
        },
        ssh_key: String::new(),
        connection_ip: None,
        extra_dns_labels: vec![],
    }
}

/// IdP stub returning a fixed email for every user.
pub struct StaticIdp {
    pub email: String,
}

#[async_trait::async_trait]
impl IdpManager for StaticIdp {
    async fn get_user_data_by_id(
        &self,
        _account_id: &str,
        _user_id: &str,
    ) -> warren_core::error::Result<IdpUserData> {
        Ok(IdpUserData {
            email: self.email.clone(),
        })
    }
}

/// Backdate a peer's last login, e.g. to put it past the expiration window.
pub async fn backdate_last_login(store: &Store, peer_id: &str, hours: i64) {
    let stamp = (chrono::Utc::now() - Duration::hours(hours)).to_rfc3339();
    sqlx::query("UPDATE peers SET last_login = ? WHERE id = ?")
        .bind(stamp)
        .bind(peer_id)
        .execute(store.pool())
        .await
        .unwrap();
}

pub async fn set_login_expired(store: &Store, peer_id: &str, expired: bool) {
    sqlx::query("UPDATE peers SET login_expired = ? WHERE id = ?")
        .bind(expired)
        .bind(peer_id)
        .execute(store.pool())
        .await
        .unwrap();
}
