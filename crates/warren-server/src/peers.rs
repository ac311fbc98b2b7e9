//! Peer lifecycle: registration, update, deletion and connection tracking

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use warren_core::dns::{parse_domain_label, peer_ip_dns_label, validate_domain_labels};
use warren_core::error::{Error, Result};
use warren_core::ip::allocate_random_peer_ip;
use warren_core::netmap::{NetworkMap, SyncResponse, UpdateMessage};
use warren_core::types::{
    hash_setup_key, Peer, PeerLocation, PeerStatus, PeerTemplate, PeerUpdateRequest,
    PostureChecks,
};

use crate::audit::{Activity, SYSTEM_INITIATOR};
use crate::manager::AccountPeerManager;
use crate::permissions::{Module, Operation};
use crate::queries;
use crate::store::LockingStrength;

/// Attempts at claiming a fresh (IP, DNS label) pair before giving up.
const MAX_ALLOCATION_ATTEMPTS: u32 = 10;

impl AccountPeerManager {
    /// Registers a new peer, authorized either by a valid setup key or an
    /// authenticated user (exactly one must be present).
    ///
    /// The address and DNS label are reserved by inserting the peer row;
    /// uniqueness collisions under contention retry with a fresh pair, up
    /// to ten attempts. The network serial is bumped in the same
    /// transaction as the insert.
    pub async fn add_peer(
        self: &Arc<Self>,
        setup_key: Option<&str>,
        user_id: Option<&str>,
        template: PeerTemplate,
    ) -> Result<(Peer, NetworkMap, Vec<PostureChecks>)> {
        let setup_key = setup_key.filter(|k| !k.is_empty());
        let user_id = user_id.filter(|u| !u.is_empty());
        if setup_key.is_none() && user_id.is_none() {
            return Err(Error::Unauthenticated(
                "no peer auth method provided, please use a setup key or interactive SSO login"
                    .into(),
            ));
        }
        let added_by_user = user_id.is_some();

        // The same machine registering twice is possible when a slow first
        // registration times out client-side and the peer retries.
        {
            let mut conn = self.store.acquire().await?;
            match queries::get_peer_by_pub_key(&mut conn, LockingStrength::None, &template.pub_key)
                .await
            {
                Ok(_) => {
                    return Err(Error::PreconditionFailed(
                        "peer has been already registered".into(),
                    ))
                }
                Err(Error::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let mut meta = template.meta.clone();
        let account_id;
        let groups_to_add;
        let mut ephemeral = false;
        let mut allow_extra_dns_labels = false;
        let mut setup_key_id = String::new();
        let mut setup_key_name = String::new();
        let activity;
        let initiator;
        let hashed_key = hash_setup_key(setup_key.unwrap_or_default());

        if let Some(user_id) = user_id {
            let mut conn = self.store.acquire().await?;
            let user = queries::get_user_by_id(&mut conn, LockingStrength::None, user_id)
                .await
                .map_err(|_| Error::not_found("failed adding new peer: user not found"))?;
            account_id = user.account_id;
            groups_to_add = user.auto_groups;
            activity = Activity::PeerAddedByUser;
            initiator = user_id.to_string();
        } else {
            let mut conn = self.store.acquire().await?;
            let key =
                queries::get_setup_key_by_secret(&mut conn, LockingStrength::None, &hashed_key)
                    .await
                    .map_err(|_| Error::not_found("couldn't add peer: setup key is invalid"))?;
            // Checked again under the update lock before usage increments.
            if !key.is_valid() {
                return Err(Error::not_found("couldn't add peer: setup key is invalid"));
            }
            if !key.allow_extra_dns_labels && !template.extra_dns_labels.is_empty() {
                return Err(Error::PreconditionFailed(
                    "couldn't add peer: setup key doesn't allow extra DNS labels".into(),
                ));
            }
            account_id = key.account_id;
            groups_to_add = key.auto_groups;
            ephemeral = key.ephemeral;
            allow_extra_dns_labels = key.allow_extra_dns_labels;
            setup_key_id = key.id;
            setup_key_name = key.name;
            activity = Activity::PeerAddedWithSetupKey;
            initiator = setup_key_id.clone();
        }

        // Apple mobile devices all report the same hostname; make them
        // distinguishable by the registering user's email local part.
        let lowered = meta.hostname.to_lowercase();
        if (lowered == "iphone" || lowered == "ipad") && user_id.is_some() {
            if let (Some(idp), Some(user_id)) = (&self.idp, user_id) {
                match idp.get_user_data_by_id(&account_id, user_id).await {
                    Ok(data) => {
                        let local_part = data.email.split('@').next().unwrap_or_default();
                        if !local_part.is_empty() {
                            meta.hostname = format!("{}-{}", meta.hostname, local_part);
                        }
                    }
                    Err(e) => {
                        tracing::warn!("failed to look up user data for hostname rewrite: {e}");
                    }
                }
            }
        }

        validate_domain_labels(&template.extra_dns_labels)?;

        let registration_time = Utc::now();
        let mut new_peer = Peer {
            id: Uuid::new_v4().to_string(),
            account_id: account_id.clone(),
            pub_key: template.pub_key.clone(),
            name: meta.hostname.clone(),
            dns_label: String::new(),
            ip: [0, 0, 0, 0].into(),
            user_id: user_id.map(|u| u.to_string()),
            meta: meta.clone(),
            status: PeerStatus::new(false, registration_time),
            ssh_enabled: false,
            ssh_key: template.ssh_key.clone(),
            login_expiration_enabled: added_by_user,
            inactivity_expiration_enabled: added_by_user,
            ephemeral,
            created_at: registration_time,
            last_login: registration_time,
            location: PeerLocation {
                connection_ip: template.connection_ip,
                ..Default::default()
            },
            extra_dns_labels: template.extra_dns_labels.clone(),
            allow_extra_dns_labels,
        };

        let settings = {
            let mut conn = self.store.acquire().await?;
            queries::get_account_settings(&mut conn, LockingStrength::None, &account_id).await?
        };

        if let (Some(geo), Some(connection_ip)) = (&self.geo, template.connection_ip) {
            match geo.lookup(connection_ip) {
                Ok(location) => {
                    new_peer.location.country_code = location.country_code;
                    new_peer.location.city_name = location.city_name;
                    new_peer.location.geo_name_id = location.geo_name_id;
                }
                Err(e) => {
                    tracing::warn!("failed to get location for new peer [{connection_ip}]: {e}");
                }
            }
        }

        new_peer = self
            .validator
            .prepare_peer(&account_id, new_peer, &groups_to_add, settings.extra.as_ref())
            .await;

        let network = {
            let mut conn = self.store.acquire().await?;
            queries::get_account_network(&mut conn, LockingStrength::None, &account_id).await?
        };

        let mut last_err = None;
        let mut registered = false;
        for attempt in 1..=MAX_ALLOCATION_ATTEMPTS {
            let free_ip = allocate_random_peer_ip(&network.cidr)?;
            // Ephemeral peers and retries go straight to the IP-suffixed
            // label; the plain hostname label gets one chance.
            let free_label = if ephemeral || attempt > 1 {
                peer_ip_dns_label(free_ip, &meta.hostname)?
            } else {
                parse_domain_label(&meta.hostname)?
            };
            new_peer.ip = free_ip;
            new_peer.dns_label = free_label.clone();

            let lock = self.store.acquire_write_lock_by_uid(&account_id).await;

            let peer_to_insert = new_peer.clone();
            let tx_account_id = account_id.clone();
            let tx_groups = groups_to_add.clone();
            let tx_user_id = user_id.map(|u| u.to_string());
            let tx_hashed_key = hashed_key.clone();
            let tx_setup_key_id = setup_key_id.clone();
            let result = self
                .store
                .execute_in_transaction(move |tx| {
                    Box::pin(async move {
                        queries::add_peer_to_account(tx, &peer_to_insert).await?;

                        for group_id in &tx_groups {
                            queries::add_peer_to_group(
                                tx,
                                &tx_account_id,
                                &peer_to_insert.id,
                                group_id,
                            )
                            .await?;
                        }
                        queries::add_peer_to_all_group(tx, &tx_account_id, &peer_to_insert.id)
                            .await?;

                        if let Some(user_id) = &tx_user_id {
                            if let Err(e) = queries::save_user_last_login(
                                tx,
                                &tx_account_id,
                                user_id,
                                peer_to_insert.last_login,
                            )
                            .await
                            {
                                tracing::debug!("failed to update user last login: {e}");
                            }
                        } else {
                            // Reload under the update lock: the key may have
                            // been revoked or exhausted since the fast-path
                            // check.
                            let key = queries::get_setup_key_by_secret(
                                tx,
                                LockingStrength::Update,
                                &tx_hashed_key,
                            )
                            .await?;
                            if !key.is_valid() {
                                return Err(Error::PreconditionFailed(
                                    "couldn't add peer: setup key is invalid".into(),
                                ));
                            }
                            queries::increment_setup_key_usage(tx, &tx_setup_key_id).await?;
                        }

                        queries::increment_network_serial(
                            tx,
                            LockingStrength::Update,
                            &tx_account_id,
                        )
                        .await?;

                        tracing::debug!(
                            "peer {} added to account {}",
                            peer_to_insert.id,
                            tx_account_id
                        );
                        Ok(())
                    })
                })
                .await;
            drop(lock);

            match result {
                Ok(()) => {
                    registered = true;
                    break;
                }
                Err(e) if e.is_unique_constraint() => {
                    tracing::trace!(
                        dns_label = %free_label,
                        ip = %free_ip,
                        "failed to add peer in attempt {attempt}, retrying: {e}"
                    );
                    last_err = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        if !registered {
            return Err(Error::internal(format!(
                "failed to add peer to database after {MAX_ALLOCATION_ATTEMPTS} attempts: {}",
                last_err.map(|e| e.to_string()).unwrap_or_default()
            )));
        }

        self.request_buffer.invalidate(&account_id);

        let update_account_peers = self
            .is_peer_in_active_group(&account_id, &new_peer.id)
            .await
            .unwrap_or(true);

        let dns_domain = self.get_dns_domain(&settings);
        let mut event_meta = new_peer.event_meta(&dns_domain);
        if !added_by_user {
            event_meta["setup_key_name"] = serde_json::Value::String(setup_key_name);
        }
        self.activity
            .store_event(&initiator, &new_peer.id, &account_id, activity, event_meta)
            .await;

        if update_account_peers {
            self.buffer_update_account_peers(&account_id);
        }

        self.get_validated_peer_with_map(false, &account_id, new_peer)
            .await
    }

    /// Updates the peer fields the API exposes: name, SSH toggle and the
    /// two expiration toggles. The expiration toggles only apply to
    /// SSO-added peers.
    pub async fn update_peer(
        self: &Arc<Self>,
        account_id: &str,
        user_id: &str,
        request: PeerUpdateRequest,
    ) -> Result<Peer> {
        let _lock = self.store.acquire_write_lock_by_uid(account_id).await;

        let allowed = self
            .permissions
            .validate_user_permissions(account_id, user_id, Module::Peers, Operation::Update)
            .await?;
        if !allowed {
            return Err(Error::PermissionDenied);
        }

        let this = self.clone();
        let tx_account_id = account_id.to_string();
        let tx_user_id = user_id.to_string();
        let (peer, settings, label_changed, ssh_changed, login_exp_changed, inactivity_changed, requires_peer_updates) = self
            .store
            .execute_in_transaction(move |tx| {
                Box::pin(async move {
                    let mut peer = queries::get_peer_by_id(
                        tx,
                        LockingStrength::Update,
                        &tx_account_id,
                        &request.id,
                    )
                    .await?;
                    let settings = queries::get_account_settings(
                        tx,
                        LockingStrength::Share,
                        &tx_account_id,
                    )
                    .await?;
                    let peer_groups = queries::get_peer_group_ids(
                        tx,
                        LockingStrength::Share,
                        &tx_account_id,
                        &request.id,
                    )
                    .await?;
                    let dns_domain = this.get_dns_domain(&settings);

                    let mut desired = peer.clone();
                    desired.name = request.name.clone();
                    desired.ssh_enabled = request.ssh_enabled;
                    desired.login_expiration_enabled = request.login_expiration_enabled;
                    desired.inactivity_expiration_enabled = request.inactivity_expiration_enabled;
                    let (desired, requires_peer_updates) = this
                        .validator
                        .validate_peer(
                            desired,
                            &peer,
                            &tx_user_id,
                            &tx_account_id,
                            &dns_domain,
                            &peer_groups,
                            settings.extra.as_ref(),
                        )
                        .await?;

                    let mut label_changed = false;
                    if peer.name != desired.name {
                        let mut new_label = match parse_domain_label(&desired.name) {
                            Ok(label) => {
                                let taken = queries::get_peer_id_by_dns_label(
                                    tx,
                                    &tx_account_id,
                                    &label,
                                )
                                .await?;
                                match taken {
                                    Some(_) => String::new(),
                                    None => label,
                                }
                            }
                            Err(_) => String::new(),
                        };
                        if new_label.is_empty() {
                            new_label = peer_ip_dns_label(peer.ip, &desired.name)?;
                        }
                        peer.name = desired.name.clone();
                        peer.dns_label = new_label;
                        label_changed = true;
                    }

                    let mut ssh_changed = false;
                    if peer.ssh_enabled != desired.ssh_enabled {
                        peer.ssh_enabled = desired.ssh_enabled;
                        ssh_changed = true;
                    }

                    let mut login_exp_changed = false;
                    if peer.login_expiration_enabled != desired.login_expiration_enabled {
                        if !peer.added_with_sso_login() {
                            return Err(Error::PreconditionFailed(
                                "this peer hasn't been added with the SSO login, therefore the login expiration can't be updated".into(),
                            ));
                        }
                        peer.login_expiration_enabled = desired.login_expiration_enabled;
                        login_exp_changed = true;
                    }

                    let mut inactivity_changed = false;
                    if peer.inactivity_expiration_enabled != desired.inactivity_expiration_enabled {
                        if !peer.added_with_sso_login() {
                            return Err(Error::PreconditionFailed(
                                "this peer hasn't been added with the SSO login, therefore the inactivity expiration can't be updated".into(),
                            ));
                        }
                        peer.inactivity_expiration_enabled = desired.inactivity_expiration_enabled;
                        inactivity_changed = true;
                    }

                    queries::save_peer(tx, LockingStrength::Update, &tx_account_id, &peer).await?;

                    Ok((
                        peer,
                        settings,
                        label_changed,
                        ssh_changed,
                        login_exp_changed,
                        inactivity_changed,
                        requires_peer_updates,
                    ))
                })
            })
            .await?;

        self.request_buffer.invalidate(account_id);
        let dns_domain = self.get_dns_domain(&settings);

        if ssh_changed {
            let event = if peer.ssh_enabled {
                Activity::PeerSshEnabled
            } else {
                Activity::PeerSshDisabled
            };
            self.activity
                .store_event(
                    user_id,
                    &peer.ip.to_string(),
                    account_id,
                    event,
                    peer.event_meta(&dns_domain),
                )
                .await;
        }

        if label_changed {
            self.activity
                .store_event(
                    user_id,
                    &peer.id,
                    account_id,
                    Activity::PeerRenamed,
                    peer.event_meta(&dns_domain),
                )
                .await;
        }

        if login_exp_changed {
            let event = if peer.login_expiration_enabled {
                Activity::PeerLoginExpirationEnabled
            } else {
                Activity::PeerLoginExpirationDisabled
            };
            self.activity
                .store_event(
                    user_id,
                    &peer.ip.to_string(),
                    account_id,
                    event,
                    peer.event_meta(&dns_domain),
                )
                .await;

            if peer.added_with_sso_login()
                && peer.login_expiration_enabled
                && settings.peer_login_expiration_enabled
            {
                self.login_expiry.cancel(&[account_id.to_string()]);
                self.schedule_peer_login_expiration(account_id);
            }
        }

        if inactivity_changed {
            let event = if peer.inactivity_expiration_enabled {
                Activity::PeerInactivityExpirationEnabled
            } else {
                Activity::PeerInactivityExpirationDisabled
            };
            self.activity
                .store_event(
                    user_id,
                    &peer.ip.to_string(),
                    account_id,
                    event,
                    peer.event_meta(&dns_domain),
                )
                .await;

            if peer.added_with_sso_login()
                && peer.inactivity_expiration_enabled
                && settings.peer_inactivity_expiration_enabled
            {
                self.schedule_peer_inactivity_expiration(account_id);
            }
        }

        if label_changed || requires_peer_updates {
            self.update_account_peers(account_id).await;
        } else if ssh_changed {
            self.update_account_peer(account_id, &peer.id).await;
        }

        Ok(peer)
    }

    /// Removes a peer from the account. Rejected while the peer is bound to
    /// ingress-proxy ports or serves as a network router.
    pub async fn delete_peer(
        self: &Arc<Self>,
        account_id: &str,
        peer_id: &str,
        user_id: &str,
    ) -> Result<()> {
        let _lock = self.store.acquire_write_lock_by_uid(account_id).await;

        let allowed = self
            .permissions
            .validate_user_permissions(account_id, user_id, Module::Peers, Operation::Delete)
            .await?;
        if !allowed {
            return Err(Error::PermissionDenied);
        }

        {
            let mut conn = self.store.acquire().await?;
            let peer_account_id = queries::get_account_id_by_peer_id(&mut conn, peer_id).await?;
            if peer_account_id != account_id {
                return Err(Error::PeerNotPartOfAccount);
            }
        }

        if self.proxy.is_peer_in_ingress_ports(account_id, peer_id).await? {
            return Err(Error::PreconditionFailed(format!(
                "peer is linked to ingress ports: {peer_id}"
            )));
        }

        let this = self.clone();
        let tx_account_id = account_id.to_string();
        let tx_peer_id = peer_id.to_string();
        let (peer, settings, serial, update_account_peers) = self
            .store
            .execute_in_transaction(move |tx| {
                Box::pin(async move {
                    let peer = queries::get_peer_by_id(
                        tx,
                        LockingStrength::Update,
                        &tx_account_id,
                        &tx_peer_id,
                    )
                    .await?;

                    let routers = queries::get_network_routers_by_account_id(
                        tx,
                        LockingStrength::Share,
                        &tx_account_id,
                    )
                    .await?;
                    if let Some(router) = routers.iter().find(|r| r.peer == tx_peer_id) {
                        return Err(Error::PreconditionFailed(format!(
                            "peer is linked to a network router: {}",
                            router.id
                        )));
                    }

                    let settings = queries::get_account_settings(
                        tx,
                        LockingStrength::Share,
                        &tx_account_id,
                    )
                    .await?;

                    let update_account_peers =
                        is_peer_in_active_group_tx(tx, &tx_account_id, &tx_peer_id).await?;

                    queries::remove_peer_from_all_groups(tx, &tx_peer_id).await?;
                    this.validator
                        .peer_deleted(&tx_account_id, &tx_peer_id, settings.extra.as_ref())
                        .await?;
                    queries::delete_peer(tx, LockingStrength::Update, &tx_account_id, &tx_peer_id)
                        .await?;
                    queries::increment_network_serial(
                        tx,
                        LockingStrength::Update,
                        &tx_account_id,
                    )
                    .await?;

                    let network = queries::get_account_network(
                        tx,
                        LockingStrength::None,
                        &tx_account_id,
                    )
                    .await?;

                    Ok((peer, settings, network.current_serial(), update_account_peers))
                })
            })
            .await?;

        self.request_buffer.invalidate(account_id);

        // Tombstone: an empty map instructs the client to drop all remote
        // peers, then its channel goes away.
        self.updates
            .send_update(
                peer_id,
                UpdateMessage {
                    update: SyncResponse {
                        peer_config: None,
                        network_map: NetworkMap::empty(serial),
                        checks: Vec::new(),
                    },
                    network_map: NetworkMap::empty(serial),
                },
            )
            .await;
        self.updates.close_channel(peer_id).await;

        let dns_domain = self.get_dns_domain(&settings);
        self.activity
            .store_event(
                user_id,
                peer_id,
                account_id,
                Activity::PeerRemovedByUser,
                peer.event_meta(&dns_domain),
            )
            .await;

        if update_account_peers && user_id != SYSTEM_INITIATOR {
            self.buffer_update_account_peers(account_id);
        }

        Ok(())
    }

    /// Marks a peer connected or disconnected, refreshing last-seen and
    /// location. Connecting clears a stale login-expired flag, which also
    /// triggers a broadcast so other peers re-admit the peer.
    pub async fn mark_peer_connected(
        self: &Arc<Self>,
        peer_pub_key: &str,
        connected: bool,
        real_ip: Option<IpAddr>,
        account_id: &str,
    ) -> Result<()> {
        let this = self.clone();
        let tx_account_id = account_id.to_string();
        let tx_pub_key = peer_pub_key.to_string();
        let (peer, was_login_expired) = self
            .store
            .execute_in_transaction(move |tx| {
                Box::pin(async move {
                    let mut peer =
                        queries::get_peer_by_pub_key(tx, LockingStrength::Update, &tx_pub_key)
                            .await?;
                    let was_login_expired = peer.status.login_expired;

                    peer.status.connected = connected;
                    peer.status.last_seen = Utc::now();
                    // A connected peer has, by definition, logged in.
                    if connected {
                        peer.status.login_expired = false;
                    }

                    if let (Some(geo), Some(real_ip)) = (&this.geo, real_ip) {
                        match geo.lookup(real_ip) {
                            Ok(location) => {
                                peer.location.connection_ip = Some(real_ip);
                                peer.location.country_code = location.country_code;
                                peer.location.city_name = location.city_name;
                                peer.location.geo_name_id = location.geo_name_id;
                                if let Err(e) = queries::save_peer_location(
                                    tx,
                                    LockingStrength::Update,
                                    &tx_account_id,
                                    &peer,
                                )
                                .await
                                {
                                    tracing::warn!(
                                        "could not store location for peer {}: {e}",
                                        peer.id
                                    );
                                }
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "failed to get location for peer {} [{real_ip}]: {e}",
                                    peer.id
                                );
                            }
                        }
                    }

                    tracing::trace!(
                        "saving peer status for peer {} connected: {connected}",
                        peer.id
                    );
                    queries::save_peer_status(
                        tx,
                        LockingStrength::Update,
                        &tx_account_id,
                        &peer.id,
                        &peer.status,
                    )
                    .await?;

                    Ok((peer, was_login_expired))
                })
            })
            .await?;

        self.request_buffer.invalidate(account_id);

        if peer.added_with_sso_login() {
            let settings = {
                let mut conn = self.store.acquire().await?;
                queries::get_account_settings(&mut conn, LockingStrength::Share, account_id)
                    .await?
            };
            if peer.login_expiration_enabled && settings.peer_login_expiration_enabled {
                self.schedule_peer_login_expiration(account_id);
            }
            if peer.inactivity_expiration_enabled && settings.peer_inactivity_expiration_enabled {
                self.schedule_peer_inactivity_expiration(account_id);
            }
        }

        if was_login_expired {
            // Other peers were told to drop the expired peer; let them know
            // the connection is allowed again.
            self.buffer_update_account_peers(account_id);
        }

        Ok(())
    }

    /// Returns one peer, enforcing read permission or ownership.
    pub async fn get_peer(
        self: &Arc<Self>,
        account_id: &str,
        peer_id: &str,
        user_id: &str,
    ) -> Result<Peer> {
        let peer = {
            let mut conn = self.store.acquire().await?;
            queries::get_peer_by_id(&mut conn, LockingStrength::Share, account_id, peer_id).await?
        };

        let allowed = self
            .permissions
            .validate_user_permissions(account_id, user_id, Module::Peers, Operation::Read)
            .await?;
        if allowed {
            return Ok(peer);
        }

        if peer.user_id.as_deref() == Some(user_id) {
            return Ok(peer);
        }

        // The user may still reach this peer through one of their own.
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
        let resource_policies = account.resource_policies_map();

        let mut conn = self.store.acquire().await?;
        let user_peers =
            queries::get_user_peers(&mut conn, LockingStrength::Share, account_id, user_id).await?;
        for own in &user_peers {
            let (visible, _) =
                account.peer_connection_resources(&own.id, &approved, &resource_policies);
            if visible.iter().any(|p| p.id == peer_id) {
                return Ok(peer);
            }
        }

        Err(Error::internal(format!(
            "user {user_id} has no access to peer {peer_id} under account {account_id}"
        )))
    }

    /// Lists account peers visible to the user: everything with read
    /// permission, otherwise the user's own peers plus whatever those can
    /// connect to (unless regular-user visibility is blocked entirely).
    pub async fn get_peers(
        self: &Arc<Self>,
        account_id: &str,
        user_id: &str,
    ) -> Result<Vec<Peer>> {
        let (user, account_peers, settings) = {
            let mut conn = self.store.acquire().await?;
            let user = queries::get_user_by_id(&mut conn, LockingStrength::Share, user_id).await?;
            let account_peers =
                queries::get_account_peers(&mut conn, LockingStrength::Share, account_id).await?;
            let settings =
                queries::get_account_settings(&mut conn, LockingStrength::Share, account_id)
                    .await?;
            (user, account_peers, settings)
        };

        let allowed = self
            .permissions
            .validate_user_permissions(account_id, user_id, Module::Peers, Operation::Read)
            .await?;
        if allowed {
            return Ok(account_peers);
        }

        if user.is_restrictable() && settings.regular_users_view_blocked {
            return Ok(Vec::new());
        }

        let own_peers: Vec<Peer> = account_peers
            .into_iter()
            .filter(|p| p.user_id.as_deref() == Some(user_id))
            .collect();

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
        let resource_policies = account.resource_policies_map();

        let mut result: HashMap<String, Peer> =
            own_peers.iter().map(|p| (p.id.clone(), p.clone())).collect();
        for own in &own_peers {
            let (visible, _) =
                account.peer_connection_resources(&own.id, &approved, &resource_policies);
            for p in visible {
                result.entry(p.id.clone()).or_insert_with(|| p.clone());
            }
        }

        Ok(result.into_values().collect())
    }

    /// Whether the peer belongs to a group referenced by an enabled policy
    /// rule or an enabled router. Deciding broadcasts: changes to peers in
    /// inactive groups concern nobody else.
    pub(crate) async fn is_peer_in_active_group(
        &self,
        account_id: &str,
        peer_id: &str,
    ) -> Result<bool> {
        let mut conn = self.store.acquire().await?;
        is_peer_in_active_group_tx(&mut conn, account_id, peer_id).await
    }
}

pub(crate) async fn is_peer_in_active_group_tx(
    conn: &mut sqlx::SqliteConnection,
    account_id: &str,
    peer_id: &str,
) -> Result<bool> {
    let peer_groups =
        queries::get_peer_group_ids(conn, LockingStrength::Share, account_id, peer_id).await?;
    if peer_groups.is_empty() {
        return Ok(false);
    }

    let policies =
        queries::get_account_policies(conn, LockingStrength::Share, account_id).await?;
    for policy in policies.iter().filter(|p| p.enabled) {
        for rule in policy.rules.iter().filter(|r| r.enabled) {
            if rule
                .sources
                .iter()
                .chain(rule.destinations.iter())
                .any(|g| peer_groups.contains(g))
            {
                return Ok(true);
            }
        }
    }

    let routers =
        queries::get_network_routers_by_account_id(conn, LockingStrength::Share, account_id)
            .await?;
    for router in routers.iter().filter(|r| r.enabled) {
        if router.peer_groups.iter().any(|g| peer_groups.contains(g)) {
            return Ok(true);
        }
    }

    Ok(false)
}
