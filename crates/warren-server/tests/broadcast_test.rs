//! Integration tests for broadcasting, coalescing and expiration

use std::time::Duration;

use warren_server::manager::ManagerOptions;
use warren_server::queries;
use warren_server::store::LockingStrength;

mod common;
use common::*;

#[tokio::test]
async fn test_coalescing_burst() {
    let (manager, store) = create_test_manager_with(ManagerOptions {
        update_buffer_interval: Some(Duration::from_millis(50)),
        ..Default::default()
    })
    .await;
    seed_all_to_all_policy(&store).await;

    let (peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();
    let mut rx = manager.peer_update_manager().create_channel(&peer.id).await;

    // A hundred requests in one burst...
    for _ in 0..100 {
        manager.buffer_update_account_peers(TEST_ACCOUNT);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // ...collapse into one broadcast plus at most one follow-up.
    let mut received = 0;
    while rx.try_recv().is_ok() {
        received += 1;
    }
    assert!(
        (1..=2).contains(&received),
        "expected 1 or 2 broadcasts, got {received}"
    );
}

#[tokio::test]
async fn test_broadcast_skips_accounts_without_channels() {
    let (manager, store) = create_test_manager().await;
    seed_all_to_all_policy(&store).await;

    manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();

    // No channel registered: the pass short-circuits without errors.
    manager.update_account_peers(TEST_ACCOUNT).await;
}

#[tokio::test]
async fn test_broadcast_carries_current_serial_and_peers() {
    let (manager, store) = create_test_manager().await;
    seed_all_to_all_policy(&store).await;

    let (first, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-1"))
        .await
        .unwrap();
    let mut rx = manager.peer_update_manager().create_channel(&first.id).await;

    let (second, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-2"))
        .await
        .unwrap();

    // Registration of the second peer is broadcast to the first.
    let update = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("broadcast within deadline")
        .expect("update message");

    let mut conn = store.acquire().await.unwrap();
    let network = queries::get_account_network(&mut conn, LockingStrength::None, TEST_ACCOUNT)
        .await
        .unwrap();
    assert!(update.network_map.serial >= network.serial);
    assert!(update
        .network_map
        .remote_peers
        .iter()
        .any(|p| p.pub_key == second.pub_key));
    assert!(update
        .network_map
        .firewall_rules
        .iter()
        .any(|r| r.peer_ip == second.ip.to_string()));
}

#[tokio::test]
async fn test_login_expiration_scheduler_expires_only_sso_peers() {
    let (manager, store) = create_test_manager().await;
    seed_all_to_all_policy(&store).await;

    let (sso_peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-sso"))
        .await
        .unwrap();
    let (key_peer, _, _) = manager
        .add_peer(Some(TEST_SETUP_KEY), None, template("laptop-key"))
        .await
        .unwrap();

    // Both peers are past the 24h window and connected; only the SSO one
    // is a candidate.
    backdate_last_login(&store, &sso_peer.id, 25).await;
    backdate_last_login(&store, &key_peer.id, 25).await;
    sqlx::query("UPDATE peers SET connected = 1")
        .execute(store.pool())
        .await
        .unwrap();

    let mut sso_rx = manager
        .peer_update_manager()
        .create_channel(&sso_peer.id)
        .await;

    manager.schedule_peer_login_expiration(TEST_ACCOUNT);
    // Past-due expiry clamps to a one-second timer.
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let mut conn = store.acquire().await.unwrap();
    let sso_after =
        queries::get_peer_by_id(&mut conn, LockingStrength::None, TEST_ACCOUNT, &sso_peer.id)
            .await
            .unwrap();
    let key_after =
        queries::get_peer_by_id(&mut conn, LockingStrength::None, TEST_ACCOUNT, &key_peer.id)
            .await
            .unwrap();
    drop(conn);

    assert!(sso_after.status.login_expired, "SSO peer must expire");
    assert!(!sso_after.status.connected);
    assert!(
        !key_after.status.login_expired,
        "setup-key peers never login-expire"
    );

    // The expired peer's channel was closed.
    assert!(sso_rx.recv().await.is_none());
    assert!(!manager.peer_update_manager().has_channel(&sso_peer.id).await);
}

#[tokio::test]
async fn test_scheduler_cancel_stops_pending_timer() {
    let (manager, store) = create_test_manager().await;

    let (peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-1"))
        .await
        .unwrap();
    backdate_last_login(&store, &peer.id, 25).await;
    sqlx::query("UPDATE peers SET connected = 1")
        .execute(store.pool())
        .await
        .unwrap();

    manager.schedule_peer_login_expiration(TEST_ACCOUNT);
    // Cancel before the one-second clamp elapses.
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.cancel_peer_login_expiration(&[TEST_ACCOUNT.to_string()]);
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let mut conn = store.acquire().await.unwrap();
    let after = queries::get_peer_by_id(&mut conn, LockingStrength::None, TEST_ACCOUNT, &peer.id)
        .await
        .unwrap();
    assert!(!after.status.login_expired, "canceled timer must not fire");
}

#[tokio::test]
async fn test_inactivity_scheduler_expires_disconnected_peers() {
    let (manager, store) = create_test_manager().await;

    sqlx::query(
        "UPDATE accounts SET peer_inactivity_expiration_enabled = 1, \
         peer_inactivity_expiration_secs = 60 WHERE id = ?",
    )
    .bind(TEST_ACCOUNT)
    .execute(store.pool())
    .await
    .unwrap();

    let (peer, _, _) = manager
        .add_peer(None, Some(TEST_ADMIN), template("laptop-1"))
        .await
        .unwrap();

    // Disconnected for two minutes against a one-minute window.
    let stamp = (chrono::Utc::now() - chrono::Duration::minutes(2)).to_rfc3339();
    sqlx::query("UPDATE peers SET connected = 0, last_seen = ? WHERE id = ?")
        .bind(stamp)
        .bind(&peer.id)
        .execute(store.pool())
        .await
        .unwrap();

    manager.schedule_peer_inactivity_expiration(TEST_ACCOUNT);
    tokio::time::sleep(Duration::from_millis(1600)).await;

    let mut conn = store.acquire().await.unwrap();
    let after = queries::get_peer_by_id(&mut conn, LockingStrength::None, TEST_ACCOUNT, &peer.id)
        .await
        .unwrap();
    assert!(after.status.login_expired, "inactive peer must expire");
}
