//! Peer login and synchronization

use std::sync::Arc;

use sqlx::SqliteConnection;

use warren_core::error::{Error, Result};
use warren_core::netmap::NetworkMap;
use warren_core::types::{
    Peer, PeerLogin, PeerSync, PeerTemplate, PostureChecks, Settings, User,
};

use crate::audit::Activity;
use crate::manager::AccountPeerManager;
use crate::metrics;
use crate::posture;
use crate::queries;
use crate::store::LockingStrength;

impl AccountPeerManager {
    /// Logs a peer in, or registers it when the public key is unknown and
    /// the login carries credentials.
    ///
    /// Expired SSO peers without a fresh user identity are rejected before
    /// any account lock is taken: clients probe with a bare login on every
    /// reconnect, and those probes must not pile up on the lock.
    pub async fn login_peer(
        self: &Arc<Self>,
        login: PeerLogin,
    ) -> Result<(Peer, NetworkMap, Vec<PostureChecks>)> {
        let account_id = {
            let mut conn = self.store.acquire().await?;
            match queries::get_account_id_by_peer_pub_key(&mut conn, &login.wireguard_pub_key)
                .await
            {
                Ok(account_id) => account_id,
                Err(Error::NotFound(_)) => {
                    drop(conn);
                    return self.handle_peer_login_not_found(login).await;
                }
                Err(e) => {
                    tracing::error!(
                        "failed while logging in peer {}: {e}",
                        login.wireguard_pub_key
                    );
                    return Err(Error::internal("failed while logging in peer"));
                }
            }
        };

        // A login carrying a user ID means the client already went through
        // the SSO flow; the expiry pre-check only applies to bare probes.
        if login.user_id.is_none() {
            self.check_if_peer_needs_login_without_lock(&account_id, &login)
                .await?;
        }

        let _account_lock = self.store.acquire_read_lock_by_uid(&account_id).await;
        let peer_lock = self
            .store
            .acquire_write_lock_by_uid(&login.wireguard_pub_key)
            .await;

        let settings = {
            let mut conn = self.store.acquire().await?;
            queries::get_account_settings(&mut conn, LockingStrength::Share, &account_id).await?
        };

        let this = self.clone();
        let tx_account_id = account_id.clone();
        let tx_login = login.clone();
        let tx_settings = settings.clone();
        let (peer, requires_approval, status_changed, peer_updated, update_remote_peers, checks, stored) =
            self.store
                .execute_in_transaction(move |tx| {
                    Box::pin(async move {
                        let mut peer = queries::get_peer_by_pub_key(
                            tx,
                            LockingStrength::Update,
                            &tx_login.wireguard_pub_key,
                        )
                        .await?;

                        // Avoids store writes when nothing changed.
                        let mut should_store_peer = false;
                        let mut update_remote_peers = false;

                        if let Some(login_user_id) = &tx_login.user_id {
                            if peer.user_id.as_deref() != Some(login_user_id.as_str()) {
                                tracing::warn!(
                                    "user mismatch when logging in peer {}: peer user {:?}, login user {login_user_id}",
                                    peer.id,
                                    peer.user_id
                                );
                                return Err(Error::PeerLoginMismatch);
                            }

                            let changed = this
                                .handle_user_peer(tx, &mut peer, login_user_id, &tx_settings)
                                .await?;
                            if changed {
                                should_store_peer = true;
                                update_remote_peers = true;
                            }
                        }

                        let peer_groups = queries::get_peer_group_ids(
                            tx,
                            LockingStrength::Share,
                            &tx_account_id,
                            &peer.id,
                        )
                        .await?;
                        let (requires_approval, status_changed) = this
                            .validator
                            .is_not_valid_peer(
                                &tx_account_id,
                                &peer,
                                &peer_groups,
                                tx_settings.extra.as_ref(),
                            )
                            .await?;

                        let mut checks = Vec::new();
                        let peer_updated = peer.update_meta_if_new(tx_login.meta.clone());
                        if peer_updated {
                            metrics::count_peer_meta_update();
                            should_store_peer = true;
                            checks =
                                posture::get_peer_posture_checks(tx, &tx_account_id, &peer.id)
                                    .await?;
                        }

                        if peer.ssh_key != tx_login.ssh_key {
                            peer.ssh_key = tx_login.ssh_key.clone();
                            should_store_peer = true;
                        }

                        if !peer.allow_extra_dns_labels && !tx_login.extra_dns_labels.is_empty() {
                            return Err(Error::PreconditionFailed(
                                "couldn't login peer: setup key doesn't allow extra DNS labels"
                                    .into(),
                            ));
                        }

                        if should_store_peer {
                            queries::save_peer(
                                tx,
                                LockingStrength::Update,
                                &tx_account_id,
                                &peer,
                            )
                            .await?;
                        }

                        Ok((
                            peer,
                            requires_approval,
                            status_changed,
                            peer_updated,
                            update_remote_peers,
                            checks,
                            should_store_peer,
                        ))
                    })
                })
                .await?;

        // Broadcasting happens without the peer-key lock; holding it would
        // serialize unrelated logins behind the fan-out.
        drop(peer_lock);

        if stored {
            self.request_buffer.invalidate(&account_id);
        }

        // A true update_remote_peers means the expired peer re-authenticated.
        if update_remote_peers {
            if let Some(user_id) = &login.user_id {
                self.activity
                    .store_event(
                        user_id,
                        &peer.id,
                        &account_id,
                        Activity::UserLoggedInPeer,
                        peer.event_meta(&self.get_dns_domain(&settings)),
                    )
                    .await;
            }
        }

        if update_remote_peers || status_changed || (peer_updated && !checks.is_empty()) {
            self.buffer_update_account_peers(&account_id);
        }

        self.get_validated_peer_with_map(requires_approval, &account_id, peer)
            .await
    }

    /// Periodic synchronization: refreshes metadata and recomputes the
    /// peer's map. Like the inner login path, minus re-authentication and
    /// the SSH-key overwrite.
    pub async fn sync_peer(
        self: &Arc<Self>,
        sync: PeerSync,
        account_id: &str,
    ) -> Result<(Peer, NetworkMap, Vec<PostureChecks>)> {
        let settings = {
            let mut conn = self.store.acquire().await?;
            queries::get_account_settings(&mut conn, LockingStrength::Share, account_id).await?
        };

        let this = self.clone();
        let tx_account_id = account_id.to_string();
        let tx_sync = sync.clone();
        let tx_settings = settings.clone();
        let (peer, requires_approval, status_changed, peer_updated, checks, stored) = self
            .store
            .execute_in_transaction(move |tx| {
                Box::pin(async move {
                    let mut peer = match queries::get_peer_by_pub_key(
                        tx,
                        LockingStrength::Update,
                        &tx_sync.wireguard_pub_key,
                    )
                    .await
                    {
                        Ok(peer) => peer,
                        Err(Error::NotFound(_)) => return Err(Error::PeerNotRegistered),
                        Err(e) => return Err(e),
                    };

                    if let Some(user_id) = &peer.user_id {
                        let user =
                            queries::get_user_by_id(tx, LockingStrength::Share, user_id).await?;
                        check_if_peer_owner_is_blocked(&peer, &user)?;
                    }

                    if peer_login_expired(&peer, &tx_settings) {
                        return Err(Error::PeerLoginExpired);
                    }

                    let peer_groups = queries::get_peer_group_ids(
                        tx,
                        LockingStrength::Share,
                        &tx_account_id,
                        &peer.id,
                    )
                    .await?;
                    let (requires_approval, status_changed) = this
                        .validator
                        .is_not_valid_peer(
                            &tx_account_id,
                            &peer,
                            &peer_groups,
                            tx_settings.extra.as_ref(),
                        )
                        .await?;

                    let mut checks = Vec::new();
                    let peer_updated = peer.update_meta_if_new(tx_sync.meta.clone());
                    if peer_updated {
                        metrics::count_peer_meta_update();
                        tracing::trace!("peer {} metadata updated", peer.id);
                        queries::save_peer(tx, LockingStrength::Update, &tx_account_id, &peer)
                            .await?;
                        checks = posture::get_peer_posture_checks(tx, &tx_account_id, &peer.id)
                            .await?;
                    }

                    Ok((
                        peer,
                        requires_approval,
                        status_changed,
                        peer_updated,
                        checks,
                        peer_updated,
                    ))
                })
            })
            .await?;

        if stored {
            self.request_buffer.invalidate(account_id);
        }

        if status_changed || sync.update_account_peers || (peer_updated && !checks.is_empty()) {
            self.buffer_update_account_peers(account_id);
        }

        self.get_validated_peer_with_map(requires_approval, account_id, peer)
            .await
    }

    /// Unknown public key on login: register the peer if credentials came
    /// along, surface the lookup failure otherwise.
    async fn handle_peer_login_not_found(
        self: &Arc<Self>,
        login: PeerLogin,
    ) -> Result<(Peer, NetworkMap, Vec<PostureChecks>)> {
        let template = PeerTemplate {
            pub_key: login.wireguard_pub_key.clone(),
            meta: login.meta.clone(),
            ssh_key: login.ssh_key.clone(),
            connection_ip: login.connection_ip,
            extra_dns_labels: login.extra_dns_labels.clone(),
        };
        self.add_peer(login.setup_key.as_deref(), login.user_id.as_deref(), template)
            .await
    }

    /// Lock-free pre-check for bare login probes. Setup-key peers never
    /// expire, so they skip the settings read entirely.
    async fn check_if_peer_needs_login_without_lock(
        &self,
        account_id: &str,
        login: &PeerLogin,
    ) -> Result<()> {
        let mut conn = self.store.acquire().await?;
        let peer = queries::get_peer_by_pub_key(
            &mut conn,
            LockingStrength::Share,
            &login.wireguard_pub_key,
        )
        .await?;

        if !peer.added_with_sso_login() {
            return Ok(());
        }

        let settings =
            queries::get_account_settings(&mut conn, LockingStrength::Share, account_id).await?;
        if peer_login_expired(&peer, &settings) {
            return Err(Error::PeerLoginExpired);
        }
        Ok(())
    }

    /// User-attached login path: verifies the owner may log in and
    /// re-authenticates the peer when its login had expired. Returns
    /// whether the peer changed.
    async fn handle_user_peer(
        &self,
        tx: &mut SqliteConnection,
        peer: &mut Peer,
        login_user_id: &str,
        settings: &Settings,
    ) -> Result<bool> {
        let user = queries::get_user_by_id(tx, LockingStrength::Share, login_user_id).await?;
        check_if_peer_owner_is_blocked(peer, &user)?;

        if peer_login_expired(peer, settings) {
            self.handle_expired_peer(tx, &user, peer).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// The peer sat past its login window but the user authenticated again:
    /// stamp the new login time. The re-login event is recorded by the
    /// caller once the transaction commits.
    async fn handle_expired_peer(
        &self,
        tx: &mut SqliteConnection,
        user: &User,
        peer: &mut Peer,
    ) -> Result<()> {
        check_auth(user.id.as_str(), peer)?;
        // Reaching this point means JWT validation passed in the API layer.
        peer.update_last_login();
        peer.status.login_expired = false;
        queries::save_peer(tx, LockingStrength::Update, &peer.account_id, peer).await?;

        if let Err(e) =
            queries::save_user_last_login(tx, &user.account_id, &user.id, peer.last_login).await
        {
            tracing::debug!("failed to update user last login: {e}");
        }
        Ok(())
    }

    /// Final shape of every login/sync/registration reply. Peers pending
    /// approval get a map carrying nothing but the serial.
    pub(crate) async fn get_validated_peer_with_map(
        self: &Arc<Self>,
        requires_approval: bool,
        account_id: &str,
        peer: Peer,
    ) -> Result<(Peer, NetworkMap, Vec<PostureChecks>)> {
        if requires_approval {
            let mut conn = self.store.acquire().await?;
            let network =
                queries::get_account_network(&mut conn, LockingStrength::None, account_id).await?;
            return Ok((peer, NetworkMap::empty(network.current_serial()), Vec::new()));
        }

        let account = self
            .request_buffer
            .get_account_with_backpressure(account_id)
            .await?;
        let approved = self
            .validator
            .get_validated_peers(
                &account.id,
                &account.groups,
                &account.peers,
                account.settings.extra.as_ref(),
            )
            .await?;

        let checks = account.peer_posture_checks(&peer.id);
        let dns_domain = self.get_dns_domain(&account.settings);
        let custom_zone = account.peers_custom_zone(&dns_domain);
        let resource_policies = account.resource_policies_map();
        let routers = account.routers_map();

        let mut map = account.build_peer_network_map(
            &peer.id,
            &dns_domain,
            Some(&custom_zone),
            &approved,
            &resource_policies,
            &routers,
        );

        let proxy_maps = self.proxy.get_proxy_network_maps(account_id).await?;
        if let Some(proxy_map) = proxy_maps.get(&peer.id) {
            map.merge(proxy_map.clone());
        }

        Ok((peer, map, checks))
    }
}

/// A blocked user blocks logins of the peers they registered. Setup-key
/// peers have no owner and are unaffected.
fn check_if_peer_owner_is_blocked(peer: &Peer, user: &User) -> Result<()> {
    if peer.added_with_sso_login() && user.is_blocked() {
        return Err(Error::PermissionDenied);
    }
    Ok(())
}

fn check_auth(login_user_id: &str, peer: &Peer) -> Result<()> {
    if login_user_id.is_empty() {
        // No user ID means no JWT was provided.
        return Err(Error::PeerLoginExpired);
    }
    if peer.user_id.as_deref() != Some(login_user_id) {
        tracing::warn!(
            "user mismatch when logging in peer {}: peer user {:?}, login user {login_user_id}",
            peer.id,
            peer.user_id
        );
        return Err(Error::PeerLoginMismatch);
    }
    Ok(())
}

/// Whether the peer counts as login-expired right now: either the window
/// elapsed under account settings, or the scheduler already flagged it.
pub(crate) fn peer_login_expired(peer: &Peer, settings: &Settings) -> bool {
    let (expired, left) = peer.login_expired(settings.peer_login_expiration);
    let expired = settings.peer_login_expiration_enabled && expired;
    if expired || peer.status.login_expired {
        tracing::debug!("peer {} login expired {left} ago", peer.id);
        return true;
    }
    false
}
