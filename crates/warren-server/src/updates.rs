//! Update broadcasting: per-peer push channels, account-wide fan-out and
//! the coalescing scheduler that absorbs bursts of topology changes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinHandle;

use warren_core::netmap::{NetworkMap, SyncResponse, UpdateMessage};
use warren_core::types::PostureChecks;

use crate::manager::AccountPeerManager;
use crate::metrics;

/// Queue depth per peer channel. A slow consumer loses intermediate
/// updates rather than stalling the broadcast.
pub const CHANNEL_BUFFER_SIZE: usize = 100;

/// Upper bound on concurrent per-peer map builds within one broadcast.
const BROADCAST_WORKERS: usize = 10;

/// Registry of per-peer push channels. The transport layer creates a
/// channel when a peer's stream connects and drops the receiver when it
/// goes away; lifecycle code pushes updates and closes channels on
/// deletion or expiration.
pub struct PeerUpdateManager {
    channels: RwLock<HashMap<String, mpsc::Sender<UpdateMessage>>>,
}

impl PeerUpdateManager {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Creates (or replaces) the push channel for a peer and returns its
    /// receiving end. Replacing drops the previous sender, which closes the
    /// previous receiver.
    pub async fn create_channel(&self, peer_id: &str) -> mpsc::Receiver<UpdateMessage> {
        let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
        self.channels.write().await.insert(peer_id.to_string(), tx);
        rx
    }

    pub async fn has_channel(&self, peer_id: &str) -> bool {
        self.channels.read().await.contains_key(peer_id)
    }

    /// Enqueues an update. A full queue drops the message: the peer will
    /// converge on the next update, and stalling the broadcast for one slow
    /// consumer would starve every other peer.
    pub async fn send_update(&self, peer_id: &str, update: UpdateMessage) {
        let channels = self.channels.read().await;
        let Some(tx) = channels.get(peer_id) else {
            tracing::trace!("peer {peer_id} has no channel, dropping update");
            return;
        };
        match tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                metrics::count_broadcast_dropped_update();
                tracing::warn!("peer {peer_id} update channel is full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("peer {peer_id} update channel is closed");
            }
        }
    }

    pub async fn close_channel(&self, peer_id: &str) {
        if self.channels.write().await.remove(peer_id).is_some() {
            tracing::debug!("closed update channel of peer {peer_id}");
        }
    }

    pub async fn close_channels(&self, peer_ids: &[String]) {
        let mut channels = self.channels.write().await;
        for peer_id in peer_ids {
            channels.remove(peer_id);
        }
    }
}

impl Default for PeerUpdateManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Assembles the wire message for one peer from its freshly built map.
pub(crate) fn to_sync_response(map: &NetworkMap, checks: Vec<PostureChecks>) -> SyncResponse {
    SyncResponse {
        peer_config: map.peer_config.clone(),
        network_map: map.clone(),
        checks,
    }
}

/// Coalescing state for one account: at most one broadcast in flight,
/// bursts fold into a single follow-up after the buffer interval.
#[derive(Default)]
pub struct BufferUpdate {
    running: Arc<tokio::sync::Mutex<()>>,
    pending: AtomicBool,
    next: StdMutex<Option<JoinHandle<()>>>,
}

impl AccountPeerManager {
    /// Recomputes and pushes the network map of every connected peer of the
    /// account. Expensive: prefer [`Self::buffer_update_account_peers`] on
    /// mutation paths.
    pub async fn update_account_peers(self: &Arc<Self>, account_id: &str) {
        let global_start = Instant::now();

        let account = match self
            .request_buffer
            .get_account_with_backpressure(account_id)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                tracing::error!("failed to send out updates to peers, no account: {e}");
                return;
            }
        };

        let mut connected = Vec::new();
        for peer_id in account.peers.keys() {
            if self.updates.has_channel(peer_id).await {
                connected.push(peer_id.clone());
            }
        }
        if connected.is_empty() {
            return;
        }

        let approved = match self
            .validator
            .get_validated_peers(
                &account.id,
                &account.groups,
                &account.peers,
                account.settings.extra.as_ref(),
            )
            .await
        {
            Ok(approved) => Arc::new(approved),
            Err(e) => {
                tracing::error!("failed to send out updates to peers, validation failed: {e}");
                return;
            }
        };

        let proxy_maps = match self.proxy.get_proxy_network_maps(account_id).await {
            Ok(maps) => Arc::new(maps),
            Err(e) => {
                tracing::error!("failed to get proxy network maps: {e}");
                return;
            }
        };

        // Shared per-broadcast inputs, computed once.
        let dns_domain = Arc::new(self.get_dns_domain(&account.settings));
        let custom_zone = Arc::new(account.peers_custom_zone(&dns_domain));
        let resource_policies = Arc::new(account.resource_policies_map());
        let routers = Arc::new(account.routers_map());

        let semaphore = Arc::new(Semaphore::new(BROADCAST_WORKERS));
        let mut workers = Vec::with_capacity(connected.len());
        for peer_id in connected {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let this = Arc::clone(self);
            let account = account.clone();
            let approved = approved.clone();
            let proxy_maps = proxy_maps.clone();
            let dns_domain = dns_domain.clone();
            let custom_zone = custom_zone.clone();
            let resource_policies = resource_policies.clone();
            let routers = routers.clone();

            workers.push(tokio::spawn(async move {
                let _permit = permit;

                let start = Instant::now();
                let checks = account.peer_posture_checks(&peer_id);
                metrics::record_posture_checks_duration(start.elapsed());

                let start = Instant::now();
                let mut map = account.build_peer_network_map(
                    &peer_id,
                    &dns_domain,
                    Some(&custom_zone),
                    &approved,
                    &resource_policies,
                    &routers,
                );
                metrics::record_network_map_duration(start.elapsed());

                if let Some(proxy_map) = proxy_maps.get(&peer_id) {
                    map.merge(proxy_map.clone());
                }

                let start = Instant::now();
                let update = to_sync_response(&map, checks);
                metrics::record_sync_response_duration(start.elapsed());

                this.updates
                    .send_update(&peer_id, UpdateMessage {
                        update,
                        network_map: map,
                    })
                    .await;
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!("broadcast worker failed: {e}");
            }
        }
        metrics::record_update_account_peers_duration(global_start.elapsed());
    }

    /// Single-peer variant for changes that affect only that peer, like an
    /// SSH toggle.
    pub async fn update_account_peer(self: &Arc<Self>, account_id: &str, peer_id: &str) {
        if !self.updates.has_channel(peer_id).await {
            tracing::trace!("peer {peer_id} doesn't have a channel, skipping update");
            return;
        }

        let account = match self
            .request_buffer
            .get_account_with_backpressure(account_id)
            .await
        {
            Ok(account) => account,
            Err(e) => {
                tracing::error!("failed to send update to peer {peer_id}, no account: {e}");
                return;
            }
        };
        if account.get_peer(peer_id).is_none() {
            tracing::trace!("peer {peer_id} doesn't exist in account {account_id}");
            return;
        }

        let approved = match self
            .validator
            .get_validated_peers(
                &account.id,
                &account.groups,
                &account.peers,
                account.settings.extra.as_ref(),
            )
            .await
        {
            Ok(approved) => approved,
            Err(e) => {
                tracing::error!("failed to send update to peer {peer_id}, validation failed: {e}");
                return;
            }
        };

        let proxy_maps = match self.proxy.get_proxy_network_maps(account_id).await {
            Ok(maps) => maps,
            Err(e) => {
                tracing::error!("failed to get proxy network maps: {e}");
                return;
            }
        };

        let dns_domain = self.get_dns_domain(&account.settings);
        let custom_zone = account.peers_custom_zone(&dns_domain);
        let resource_policies = account.resource_policies_map();
        let routers = account.routers_map();

        let checks = account.peer_posture_checks(peer_id);
        let mut map = account.build_peer_network_map(
            peer_id,
            &dns_domain,
            Some(&custom_zone),
            &approved,
            &resource_policies,
            &routers,
        );
        if let Some(proxy_map) = proxy_maps.get(peer_id) {
            map.merge(proxy_map.clone());
        }

        let update = to_sync_response(&map, checks);
        self.updates
            .send_update(peer_id, UpdateMessage {
                update,
                network_map: map,
            })
            .await;
    }

    /// Coalescing entry point for mutation paths.
    ///
    /// At most one broadcast runs per account. Calls arriving while one is
    /// in flight set a pending flag; when the run finishes, a single
    /// follow-up is scheduled after the buffer interval, so N calls within
    /// one interval produce at most two broadcasts.
    pub fn buffer_update_account_peers(self: &Arc<Self>, account_id: &str) {
        let entry = {
            let mut buffers = self.update_buffers.lock().unwrap();
            buffers
                .entry(account_id.to_string())
                .or_default()
                .clone()
        };

        let Ok(running) = entry.running.clone().try_lock_owned() else {
            entry.pending.store(true, Ordering::SeqCst);
            return;
        };

        if let Some(next) = entry.next.lock().unwrap().take() {
            next.abort();
        }

        let this = Arc::clone(self);
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            let _running = running;
            this.update_account_peers(&account_id).await;

            if !entry.pending.swap(false, Ordering::SeqCst) {
                return;
            }
            let delay =
                Duration::from_millis(this.update_buffer_interval_ms.load(Ordering::Relaxed));
            let follow_up = Arc::clone(&this);
            let follow_up_id = account_id.clone();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                follow_up.update_account_peers(&follow_up_id).await;
            });
            *entry.next.lock().unwrap() = Some(handle);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_lifecycle() {
        let manager = PeerUpdateManager::new();
        assert!(!manager.has_channel("p1").await);

        let mut rx = manager.create_channel("p1").await;
        assert!(manager.has_channel("p1").await);

        manager
            .send_update(
                "p1",
                UpdateMessage {
                    update: SyncResponse::default(),
                    network_map: NetworkMap::empty(3),
                },
            )
            .await;
        let msg = rx.recv().await.expect("update delivered");
        assert_eq!(msg.network_map.serial, 3);

        manager.close_channel("p1").await;
        assert!(!manager.has_channel("p1").await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn replacing_a_channel_closes_the_old_receiver() {
        let manager = PeerUpdateManager::new();
        let mut old_rx = manager.create_channel("p1").await;
        let _new_rx = manager.create_channel("p1").await;
        assert!(old_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sends_to_unknown_peers_are_dropped() {
        let manager = PeerUpdateManager::new();
        manager
            .send_update(
                "ghost",
                UpdateMessage {
                    update: SyncResponse::default(),
                    network_map: NetworkMap::default(),
                },
            )
            .await;
    }
}
