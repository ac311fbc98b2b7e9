//! Integration tests for the peer lifecycle

use std::sync::Arc;

use warren_core::error::Error;
use warren_core::ip::Cidr;
use warren_core::types::{PeerLogin, PeerSync, PeerUpdateRequest};

use warren_server::audit::{Activity, ActivityLogger};
use warren_server::manager::ManagerOptions;
use warren_server::permissions::{Module, Operation};
use warren_server::queries;
use warren_server::store::LockingStrength;

mod common;
use common::*;

#[tokio::test]
async fn test_register_via_setup_key_then_sync() {
    let (manager, store) = create_test_manager().await;
    seed_group(&store, "grp-dev", "dev").await;

    // Attach the auto-group to the key.
    {
        let mut conn = store.acquire().await.unwrap();
        sqlx::query("UPDATE setup_keys SET auto_groups = '[\"grp-dev\"]' WHERE id = 'sk1'")
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    let serial_before = {
        let mut conn = store.acquire().await.unwrap();
        queries::get_account_network(&mut conn, LockingStrength::None, TEST_ACCOUNT)
            .await
            .unwrap()
            .serial
    };

    let tpl = template("laptop-1");
    let (peer, netmap, _checks) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, tpl)
        .await
        .expect("registration via setup key");

    let cidr: Cidr = "100.64.0.0/16".parse().unwrap();
    assert!(cidr.contains(peer.ip));
    assert_eq!(peer.dns_label, "laptop-1");
    assert_eq!(peer.name, "laptop-1");
    assert!(!peer.added_with_sso_login());
    assert!(!peer.login_expiration_enabled);

    let mut conn = store.acquire().await.unwrap();

    // Membership: "All" plus the key's auto-group.
    let mut groups =
        queries::get_peer_group_ids(&mut conn, LockingStrength::None, TEST_ACCOUNT, &peer.id)
            .await
            .unwrap();
    groups.sort();
    assert_eq!(groups, vec!["grp-all".to_string(), "grp-dev".to_string()]);

    // Usage counter and serial both moved inside the transaction.
    let key = queries::get_setup_key_by_secret(
        &mut conn,
        LockingStrength::None,
        &warren_core::types::hash_setup_key(TEST_SETUP_KEY),
    )
    .await
    .unwrap();
    assert_eq!(key.used_times, 1);

    let network = queries::get_account_network(&mut conn, LockingStrength::None, TEST_ACCOUNT)
        .await
        .unwrap();
    assert_eq!(network.serial, serial_before + 1);
    assert_eq!(netmap.serial, network.serial);

    // Activity event with the key's name in the metadata.
    let events = ActivityLogger::new(store.pool().clone())
        .query(TEST_ACCOUNT, 10)
        .await
        .unwrap();
    let (activity, _, target, meta) = &events[0];
    assert_eq!(*activity, Activity::PeerAddedWithSetupKey);
    assert_eq!(target, &peer.id);
    assert_eq!(meta["setup_key_name"], "default");

    // Sync returns the same map shape for the registered peer.
    let (synced, map, _) = manager
        .sync_peer(
            PeerSync {
                wireguard_pub_key: peer.pub_key.clone(),
                meta: peer.meta.clone(),
                update_account_peers: false,
            },
            TEST_ACCOUNT,
        )
        .await
        .expect("sync after registration");
    assert_eq!(synced.id, peer.id);
    let address = map.peer_config.expect("self config").address;
    assert_eq!(address, format!("{}/16", peer.ip));
}

#[tokio::test]
async fn test_duplicate_registration_of_same_pubkey() {
    let (manager, _store) = create_test_manager().await;

    let tpl = template("laptop-1");
    let pub_key = tpl.pub_key.clone();
    manager
        .add_peer(Some(TEST_SETUP_KEY), None, tpl)
        .await
        .unwrap();

    let mut dup = template("laptop-2");
    dup.pub_key = pub_key;
    let err = manager
        .add_peer(Some(TEST_SETUP_KEY), None, dup)
        .await
        .unwrap_err();
    match err {
        Error::PreconditionFailed(msg) => {
            assert_eq!(msg, "peer has been already registered");
        }
        other => panic!("expected PreconditionFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_registration_requires_some_credential() {
    let (manager, _store) = create_test_manager().await;
    let err = manager
        .add_peer(None, None, template("laptop-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));
}

#[tokio::test]
async fn test_iphone_hostname_rewrite() {
    let (manager, _store) = create_test_manager_with(ManagerOptions {
        idp: Some(Arc::new(StaticIdp {
            email: "alice@example.com".into(),
        })),
        ..Default::default()
    })
    .await;

    let (peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("iPhone"))
        .await
        .expect("registration via user");

    assert_eq!(peer.name, "iPhone-alice");
    assert_eq!(peer.dns_label, "iphone-alice");
    assert!(peer.added_with_sso_login());
    assert!(peer.login_expiration_enabled);
    assert!(peer.inactivity_expiration_enabled);
}

#[tokio::test]
async fn test_login_when_expired() {
    let (manager, store) = create_test_manager().await;

    let (peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-1"))
        .await
        .unwrap();
    backdate_last_login(&store, &peer.id, 25).await;

    // Bare probe (no JWT): rejected before any lock is taken.
    let err = manager
        .login_peer(PeerLogin {
            wireguard_pub_key: peer.pub_key.clone(),
            meta: peer.meta.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerLoginExpired));

    // With a matching authenticated user the login succeeds and stamps a
    // fresh last-login.
    let (logged_in, _, _) = manager
        .login_peer(PeerLogin {
            wireguard_pub_key: peer.pub_key.clone(),
            meta: peer.meta.clone(),
            user_id: Some(TEST_ADMIN.into()),
            ..Default::default()
        })
        .await
        .expect("re-login with user identity");
    assert!(!logged_in.status.login_expired);
    assert!(chrono::Utc::now() - logged_in.last_login < chrono::Duration::minutes(1));

    let events = ActivityLogger::new(store.pool().clone())
        .query(TEST_ACCOUNT, 10)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|(activity, _, _, _)| *activity == Activity::UserLoggedInPeer));
}

#[tokio::test]
async fn test_login_user_mismatch() {
    let (manager, store) = create_test_manager().await;
    {
        let mut conn = store.acquire().await.unwrap();
        queries::save_user(
            &mut conn,
            &warren_core::types::User {
                id: "u2".into(),
                account_id: TEST_ACCOUNT.into(),
                role: warren_core::types::UserRole::User,
                blocked: false,
                auto_groups: vec![],
                last_login: None,
            },
        )
        .await
        .unwrap();
    }

    let (peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-1"))
        .await
        .unwrap();

    let err = manager
        .login_peer(PeerLogin {
            wireguard_pub_key: peer.pub_key.clone(),
            meta: peer.meta.clone(),
            user_id: Some("u2".into()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerLoginMismatch));
}

#[tokio::test]
async fn test_login_is_idempotent() {
    let (manager, store) = create_test_manager().await;

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();

    let login = PeerLogin {
        wireguard_pub_key: peer.pub_key.clone(),
        meta: peer.meta.clone(),
        ssh_key: String::new(),
        ..Default::default()
    };
    let (first, _, _) = manager.login_peer(login.clone()).await.unwrap();
    let (second, _, _) = manager.login_peer(login).await.unwrap();

    assert_eq!(first.meta, second.meta);
    assert_eq!(first.last_login, second.last_login);
    assert_eq!(first.dns_label, second.dns_label);

    // No spurious lifecycle events from the repeat login.
    let events = ActivityLogger::new(store.pool().clone())
        .query(TEST_ACCOUNT, 10)
        .await
        .unwrap();
    assert_eq!(events.len(), 1); // the registration event only
}

#[tokio::test]
async fn test_sync_unknown_peer_is_not_registered() {
    let (manager, _store) = create_test_manager().await;
    let err = manager
        .sync_peer(
            PeerSync {
                wireguard_pub_key: "unknown-key".into(),
                ..Default::default()
            },
            TEST_ACCOUNT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerNotRegistered));
}

#[tokio::test]
async fn test_dns_label_collision_on_rename() {
    let (manager, store) = create_test_manager().await;

    let (peer_a, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop"))
        .await
        .unwrap();
    assert_eq!(peer_a.dns_label, "laptop");

    let (peer_b, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("pc-1"))
        .await
        .unwrap();

    let renamed = manager
        .update_peer(
            TEST_ACCOUNT,
            TEST_ADMIN,
            PeerUpdateRequest {
                id: peer_b.id.clone(),
                name: "laptop".into(),
                ssh_enabled: peer_b.ssh_enabled,
                login_expiration_enabled: peer_b.login_expiration_enabled,
                inactivity_expiration_enabled: peer_b.inactivity_expiration_enabled,
            },
        )
        .await
        .expect("rename");

    let octets = peer_b.ip.octets();
    assert_eq!(renamed.name, "laptop");
    assert_eq!(renamed.dns_label, format!("laptop-{}-{}", octets[2], octets[3]));

    let events = ActivityLogger::new(store.pool().clone())
        .query(TEST_ACCOUNT, 10)
        .await
        .unwrap();
    let renames = events
        .iter()
        .filter(|(activity, _, _, _)| *activity == Activity::PeerRenamed)
        .count();
    assert_eq!(renames, 1);
}

#[tokio::test]
async fn test_expiration_toggle_requires_sso_peer() {
    let (manager, _store) = create_test_manager().await;

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();

    let err = manager
        .update_peer(
            TEST_ACCOUNT,
            TEST_ADMIN,
            PeerUpdateRequest {
                id: peer.id.clone(),
                name: peer.name.clone(),
                ssh_enabled: false,
                login_expiration_enabled: true,
                inactivity_expiration_enabled: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_update_peer_requires_permission() {
    let (manager, store) = create_test_manager().await;
    {
        let mut conn = store.acquire().await.unwrap();
        queries::save_user(
            &mut conn,
            &warren_core::types::User {
                id: "u2".into(),
                account_id: TEST_ACCOUNT.into(),
                role: warren_core::types::UserRole::User,
                blocked: false,
                auto_groups: vec![],
                last_login: None,
            },
        )
        .await
        .unwrap();
    }

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();

    let err = manager
        .update_peer(
            TEST_ACCOUNT,
            "u2",
            PeerUpdateRequest {
                id: peer.id.clone(),
                name: "renamed".into(),
                ssh_enabled: false,
                login_expiration_enabled: false,
                inactivity_expiration_enabled: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionDenied));
}

#[tokio::test]
async fn test_permission_validator_rejects_foreign_users() {
    let (manager, _store) = create_test_manager().await;
    let err = manager
        .permissions()
        .validate_user_permissions("other-account", TEST_ADMIN, Module::Peers, Operation::Read)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PermissionValidation(_)));
}

#[tokio::test]
async fn test_delete_peer_round_trip() {
    let (manager, store) = create_test_manager().await;
    seed_all_to_all_policy(&store).await;

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();
    let mut rx = manager.peer_update_manager().create_channel(&peer.id).await;

    manager
        .delete_peer(TEST_ACCOUNT, &peer.id, TEST_ADMIN)
        .await
        .expect("delete");

    // Tombstone first, then the channel closes exactly once.
    let tombstone = rx.recv().await.expect("tombstone update");
    assert!(tombstone.network_map.remote_peers_is_empty);
    assert!(tombstone.network_map.remote_peers.is_empty());
    assert!(rx.recv().await.is_none());
    assert!(!manager.peer_update_manager().has_channel(&peer.id).await);

    // Same pubkey with no credentials: nothing to re-register with.
    let err = manager
        .login_peer(PeerLogin {
            wireguard_pub_key: peer.pub_key.clone(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unauthenticated(_)));

    // With a setup key the machine re-registers under a fresh peer ID.
    let (reborn, _, _) = manager
        .login_peer(PeerLogin {
            wireguard_pub_key: peer.pub_key.clone(),
            meta: peer.meta.clone(),
            setup_key: Some(TEST_SETUP_KEY.into()),
            ..Default::default()
        })
        .await
        .expect("re-registration");
    assert_ne!(reborn.id, peer.id);

    let events = ActivityLogger::new(store.pool().clone())
        .query(TEST_ACCOUNT, 10)
        .await
        .unwrap();
    assert!(events
        .iter()
        .any(|(activity, _, _, _)| *activity == Activity::PeerRemovedByUser));
}

#[tokio::test]
async fn test_delete_rejects_router_peers() {
    let (manager, store) = create_test_manager().await;

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("gw-1"))
        .await
        .unwrap();
    {
        let mut conn = store.acquire().await.unwrap();
        queries::save_network_router(
            &mut conn,
            &warren_core::types::NetworkRouter {
                id: "rt1".into(),
                account_id: TEST_ACCOUNT.into(),
                peer: peer.id.clone(),
                peer_groups: vec![],
                network: "192.168.10.0/24".parse().unwrap(),
                masquerade: true,
                metric: 100,
                enabled: true,
            },
        )
        .await
        .unwrap();
    }

    let err = manager
        .delete_peer(TEST_ACCOUNT, &peer.id, TEST_ADMIN)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_delete_peer_of_other_account() {
    let (manager, store) = create_test_manager().await;
    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();

    // Second account with its own admin.
    {
        let mut conn = store.acquire().await.unwrap();
        queries::save_account(
            &mut conn,
            "account-b",
            &"100.65.0.0/16".parse().unwrap(),
            &warren_core::types::Settings {
                peer_login_expiration_enabled: false,
                peer_login_expiration: chrono::Duration::hours(24),
                peer_inactivity_expiration_enabled: false,
                peer_inactivity_expiration: chrono::Duration::minutes(10),
                regular_users_view_blocked: false,
                dns_domain: None,
                extra: None,
            },
        )
        .await
        .unwrap();
        queries::save_user(
            &mut conn,
            &warren_core::types::User {
                id: "admin-b".into(),
                account_id: "account-b".into(),
                role: warren_core::types::UserRole::Admin,
                blocked: false,
                auto_groups: vec![],
                last_login: None,
            },
        )
        .await
        .unwrap();
    }

    let err = manager
        .delete_peer("account-b", &peer.id, "admin-b")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PeerNotPartOfAccount));
}

#[tokio::test]
async fn test_mark_peer_connected_clears_login_expired() {
    let (manager, store) = create_test_manager().await;
    seed_all_to_all_policy(&store).await;

    let (expired_peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-1"))
        .await
        .unwrap();
    let (observer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("watcher"))
        .await
        .unwrap();

    set_login_expired(&store, &expired_peer.id, true).await;
    let mut observer_rx = manager
        .peer_update_manager()
        .create_channel(&observer.id)
        .await;

    manager
        .mark_peer_connected(&expired_peer.pub_key, true, None, TEST_ACCOUNT)
        .await
        .expect("mark connected");

    let mut conn = store.acquire().await.unwrap();
    let refreshed =
        queries::get_peer_by_id(&mut conn, LockingStrength::None, TEST_ACCOUNT, &expired_peer.id)
            .await
            .unwrap();
    assert!(refreshed.status.connected);
    assert!(!refreshed.status.login_expired);
    drop(conn);

    // Other peers get told the reconnected peer is admissible again.
    let update = tokio::time::timeout(std::time::Duration::from_secs(2), observer_rx.recv())
        .await
        .expect("broadcast within deadline")
        .expect("update message");
    assert!(update
        .network_map
        .remote_peers
        .iter()
        .any(|p| p.pub_key == expired_peer.pub_key));
}

#[tokio::test]
async fn test_allocator_succeeds_under_label_contention() {
    let (manager, store) = create_test_manager().await;

    // Nine concurrent registrations with an identical hostname: exactly one
    // gets the plain label, the rest converge on IP-suffixed labels.
    let mut handles = Vec::new();
    for _ in 0..9 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .add_peer(Some(TEST_SETUP_KEY), None, template("host"))
                .await
        }));
    }

    let mut labels = Vec::new();
    for handle in handles {
        let (peer, _, _) = handle.await.unwrap().expect("registration succeeds");
        labels.push(peer.dns_label);
    }

    labels.sort();
    labels.dedup();
    assert_eq!(labels.len(), 9, "labels must be unique");
    assert!(labels.contains(&"host".to_string()));

    let mut conn = store.acquire().await.unwrap();
    let peers = queries::get_account_peers(&mut conn, LockingStrength::None, TEST_ACCOUNT)
        .await
        .unwrap();
    assert_eq!(peers.len(), 9);
}

#[tokio::test]
async fn test_get_peers_respects_view_block() {
    let (manager, store) = create_test_manager().await;
    {
        let mut conn = store.acquire().await.unwrap();
        queries::save_user(
            &mut conn,
            &warren_core::types::User {
                id: "u2".into(),
                account_id: TEST_ACCOUNT.into(),
                role: warren_core::types::UserRole::User,
                blocked: false,
                auto_groups: vec![],
                last_login: None,
            },
        )
        .await
        .unwrap();
        sqlx::query("UPDATE accounts SET regular_users_view_blocked = 1 WHERE id = ?")
            .bind(TEST_ACCOUNT)
            .execute(&mut *conn)
            .await
            .unwrap();
    }

    manager
        .add_peer(None, Some(TEST_ADMIN), template("admins-laptop"))
        .await
        .unwrap();
    manager
        .add_peer(None, Some("u2"), template("users-laptop"))
        .await
        .unwrap();

    // Admin sees all peers, the blocked regular user sees none.
    let admin_view = manager.get_peers(TEST_ACCOUNT, TEST_ADMIN).await.unwrap();
    assert_eq!(admin_view.len(), 2);

    let user_view = manager.get_peers(TEST_ACCOUNT, "u2").await.unwrap();
    assert!(user_view.is_empty());
}
