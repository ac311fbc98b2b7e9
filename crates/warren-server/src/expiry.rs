//! Login and inactivity expiration scheduling
//!
//! Two independent per-account timers. Each computes the minimum remaining
//! lifetime among its candidate peers, sleeps, expires whoever is due,
//! broadcasts, and re-arms from the recomputed minimum. Rearming is
//! idempotent: scheduling an account that already has a timer replaces it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::BoxFuture;
use tokio::sync::mpsc;

use warren_core::error::Result;
use warren_core::types::{Peer, PeerStatus};

use crate::audit::{Activity, SYSTEM_INITIATOR};
use crate::manager::AccountPeerManager;
use crate::queries;
use crate::store::LockingStrength;

/// Backoff returned when the store fails mid-computation.
pub(crate) const PEER_SCHEDULER_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Per-ID cancelable timer tasks. The job returns the delay until its next
/// run and whether to keep running.
pub struct Scheduler {
    cancels: StdMutex<HashMap<String, mpsc::Sender<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancels: StdMutex::new(HashMap::new()),
        }
    }

    /// Stops pending timers for the given IDs. Missing IDs are ignored.
    pub fn cancel(&self, ids: &[String]) {
        let mut cancels = self.cancels.lock().unwrap();
        for id in ids {
            // Dropping the sender wakes the task, which then exits.
            cancels.remove(id);
        }
    }

    /// Arms (or re-arms) a timer. A previously scheduled job under the same
    /// ID is canceled first.
    pub fn schedule<F>(&self, after: Duration, id: String, job: F)
    where
        F: Fn() -> BoxFuture<'static, (Duration, bool)> + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<()>(1);
        self.cancels.lock().unwrap().insert(id, tx);

        tokio::spawn(async move {
            let mut wait = after;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {
                        let (next, reschedule) = job().await;
                        if !reschedule {
                            return;
                        }
                        wait = next;
                    }
                    _ = rx.recv() => {
                        // Canceled, or replaced by a newer schedule.
                        return;
                    }
                }
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountPeerManager {
    /// Arms the login expiration timer from the soonest-expiring connected
    /// peer. No-op when no peer qualifies.
    pub fn schedule_peer_login_expiration(self: &Arc<Self>, account_id: &str) {
        let this = Arc::clone(self);
        let id = account_id.to_string();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            let Some(next) = this.get_next_peer_expiration(&account_id).await else {
                return;
            };
            tracing::debug!(
                "scheduling peer login expiration for account {account_id} in {next:?}"
            );
            let job_this = Arc::clone(&this);
            this.login_expiry.schedule(next, id, move || {
                let this = Arc::clone(&job_this);
                let account_id = account_id.clone();
                Box::pin(async move {
                    if let Err(e) = this.expire_login_peers(&account_id).await {
                        tracing::error!("failed to expire peers of account {account_id}: {e}");
                    }
                    match this.get_next_peer_expiration(&account_id).await {
                        Some(next) => (next, true),
                        None => (Duration::ZERO, false),
                    }
                })
            });
        });
    }

    /// Inactivity counterpart of [`Self::schedule_peer_login_expiration`].
    pub fn schedule_peer_inactivity_expiration(self: &Arc<Self>, account_id: &str) {
        let this = Arc::clone(self);
        let id = account_id.to_string();
        let account_id = account_id.to_string();
        tokio::spawn(async move {
            let Some(next) = this.get_next_inactive_peer_expiration(&account_id).await else {
                return;
            };
            tracing::debug!(
                "scheduling peer inactivity expiration for account {account_id} in {next:?}"
            );
            let job_this = Arc::clone(&this);
            this.inactivity_expiry.schedule(next, id, move || {
                let this = Arc::clone(&job_this);
                let account_id = account_id.clone();
                Box::pin(async move {
                    if let Err(e) = this.expire_inactive_peers(&account_id).await {
                        tracing::error!(
                            "failed to expire inactive peers of account {account_id}: {e}"
                        );
                    }
                    match this.get_next_inactive_peer_expiration(&account_id).await {
                        Some(next) => (next, true),
                        None => (Duration::ZERO, false),
                    }
                })
            });
        });
    }

    /// Stops pending login-expiration timers, e.g. when account settings
    /// change.
    pub fn cancel_peer_login_expiration(&self, account_ids: &[String]) {
        self.login_expiry.cancel(account_ids);
    }

    pub fn cancel_peer_inactivity_expiration(&self, account_ids: &[String]) {
        self.inactivity_expiry.cancel(account_ids);
    }

    /// Minimum remaining login lifetime among connected, not yet expired
    /// peers. `None` when nothing qualifies; the retry interval on store
    /// failure so the scheduler backs off instead of dying.
    pub(crate) async fn get_next_peer_expiration(&self, account_id: &str) -> Option<Duration> {
        let result: Result<Option<chrono::Duration>> = async {
            let mut conn = self.store.acquire().await?;
            let peers = queries::get_account_peers_with_expiration(
                &mut conn,
                LockingStrength::Share,
                account_id,
            )
            .await?;
            if peers.is_empty() {
                return Ok(None);
            }
            let settings =
                queries::get_account_settings(&mut conn, LockingStrength::Share, account_id)
                    .await?;
            if !settings.peer_login_expiration_enabled {
                return Ok(None);
            }

            let mut next: Option<chrono::Duration> = None;
            for peer in &peers {
                // Disconnected peers re-authenticate when they reconnect.
                if peer.status.login_expired || !peer.status.connected {
                    continue;
                }
                let (_, left) = peer.login_expired(settings.peer_login_expiration);
                if next.map_or(true, |current| left < current) {
                    next = Some(left);
                }
            }
            Ok(next)
        }
        .await;

        match result {
            Ok(next) => next.map(clamp_to_schedule),
            Err(e) => {
                tracing::error!("failed to compute next peer expiration: {e}");
                Some(PEER_SCHEDULER_RETRY_INTERVAL)
            }
        }
    }

    /// Minimum remaining session lifetime among disconnected peers.
    pub(crate) async fn get_next_inactive_peer_expiration(
        &self,
        account_id: &str,
    ) -> Option<Duration> {
        let result: Result<Option<chrono::Duration>> = async {
            let mut conn = self.store.acquire().await?;
            let peers = queries::get_account_peers_with_inactivity(
                &mut conn,
                LockingStrength::Share,
                account_id,
            )
            .await?;
            if peers.is_empty() {
                return Ok(None);
            }
            let settings =
                queries::get_account_settings(&mut conn, LockingStrength::Share, account_id)
                    .await?;
            if !settings.peer_inactivity_expiration_enabled {
                return Ok(None);
            }

            let mut next: Option<chrono::Duration> = None;
            for peer in &peers {
                if peer.status.login_expired || peer.status.connected {
                    continue;
                }
                let (_, left) = peer.session_expired(settings.peer_inactivity_expiration);
                if next.map_or(true, |current| left < current) {
                    next = Some(left);
                }
            }
            Ok(next)
        }
        .await;

        match result {
            Ok(next) => next.map(clamp_to_schedule),
            Err(e) => {
                tracing::error!("failed to compute next inactivity expiration: {e}");
                Some(PEER_SCHEDULER_RETRY_INTERVAL)
            }
        }
    }

    /// Peers whose login window has fully elapsed. Setup-key peers are
    /// excluded by the candidate query already.
    pub(crate) async fn get_expired_peers(&self, account_id: &str) -> Result<Vec<Peer>> {
        let mut conn = self.store.acquire().await?;
        let peers = queries::get_account_peers_with_expiration(
            &mut conn,
            LockingStrength::Share,
            account_id,
        )
        .await?;
        let settings =
            queries::get_account_settings(&mut conn, LockingStrength::Share, account_id).await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.login_expired(settings.peer_login_expiration).0)
            .collect())
    }

    pub(crate) async fn get_inactive_peers(&self, account_id: &str) -> Result<Vec<Peer>> {
        let mut conn = self.store.acquire().await?;
        let peers = queries::get_account_peers_with_inactivity(
            &mut conn,
            LockingStrength::Share,
            account_id,
        )
        .await?;
        let settings =
            queries::get_account_settings(&mut conn, LockingStrength::Share, account_id).await?;
        Ok(peers
            .into_iter()
            .filter(|p| !p.status.connected && p.session_expired(settings.peer_inactivity_expiration).0)
            .collect())
    }

    pub(crate) async fn expire_login_peers(self: &Arc<Self>, account_id: &str) -> Result<()> {
        let peers = self.get_expired_peers(account_id).await?;
        self.expire_peers(account_id, peers, Activity::PeerLoginExpired)
            .await
    }

    pub(crate) async fn expire_inactive_peers(self: &Arc<Self>, account_id: &str) -> Result<()> {
        let peers = self.get_inactive_peers(account_id).await?;
        self.expire_peers(account_id, peers, Activity::PeerInactivityExpired)
            .await
    }

    /// Marks the given peers expired in one transaction, then closes their
    /// channels and broadcasts so the rest of the mesh drops them.
    async fn expire_peers(
        self: &Arc<Self>,
        account_id: &str,
        peers: Vec<Peer>,
        activity: Activity,
    ) -> Result<()> {
        if peers.is_empty() {
            return Ok(());
        }

        let account = account_id.to_string();
        let expired: Vec<Peer> = peers
            .iter()
            .filter(|p| !p.status.login_expired)
            .cloned()
            .collect();
        if expired.is_empty() {
            return Ok(());
        }

        let to_store = expired.clone();
        self.store
            .execute_in_transaction(move |tx| {
                Box::pin(async move {
                    for peer in &to_store {
                        let status = PeerStatus {
                            connected: false,
                            last_seen: Utc::now(),
                            login_expired: true,
                        };
                        queries::save_peer_status(
                            tx,
                            LockingStrength::Update,
                            &account,
                            &peer.id,
                            &status,
                        )
                        .await?;
                    }
                    Ok(())
                })
            })
            .await?;
        self.request_buffer.invalidate(account_id);

        let dns_domain = {
            let mut conn = self.store.acquire().await?;
            let settings =
                queries::get_account_settings(&mut conn, LockingStrength::Share, account_id)
                    .await?;
            self.get_dns_domain(&settings)
        };

        let peer_ids: Vec<String> = expired.iter().map(|p| p.id.clone()).collect();
        self.updates.close_channels(&peer_ids).await;
        for peer in &expired {
            tracing::info!("peer {} login expired", peer.id);
            self.activity
                .store_event(
                    SYSTEM_INITIATOR,
                    &peer.id,
                    account_id,
                    activity,
                    peer.event_meta(&dns_domain),
                )
                .await;
        }

        self.buffer_update_account_peers(account_id);
        Ok(())
    }
}

fn clamp_to_schedule(left: chrono::Duration) -> Duration {
    // Sub-second (or already past due) rounds up to one second so the
    // timer can always be armed.
    if left < chrono::Duration::seconds(1) {
        return Duration::from_secs(1);
    }
    left.to_std().unwrap_or(Duration::from_secs(1))
}
