//! Account peer manager: construction and shared plumbing

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use warren_core::types::Settings;

use crate::audit::ActivityLogger;
use crate::buffer::AccountRequestBuffer;
use crate::expiry::Scheduler;
use crate::integrations::{Geolocation, IdpManager, NoopProxyController, ProxyController};
use crate::permissions::PermissionsManager;
use crate::store::Store;
use crate::updates::{BufferUpdate, PeerUpdateManager};
use crate::validator::{DefaultPeerValidator, PeerValidator};

/// Zone peers are published under when the account has no custom domain.
pub const DEFAULT_DNS_DOMAIN: &str = "warren.mesh";

/// Follow-up delay for coalesced broadcasts.
pub const DEFAULT_UPDATE_BUFFER_INTERVAL: Duration = Duration::from_millis(500);

/// Registers, authenticates, expires and synchronizes peers within
/// accounts, and disseminates per-peer network maps when topology or
/// policies change. All public operations are safe for concurrent use.
pub struct AccountPeerManager {
    pub(crate) store: Arc<Store>,
    pub(crate) updates: Arc<PeerUpdateManager>,
    pub(crate) request_buffer: AccountRequestBuffer,
    pub(crate) permissions: PermissionsManager,
    pub(crate) validator: Arc<dyn PeerValidator>,
    pub(crate) geo: Option<Arc<dyn Geolocation>>,
    pub(crate) idp: Option<Arc<dyn IdpManager>>,
    pub(crate) proxy: Arc<dyn ProxyController>,
    pub(crate) activity: ActivityLogger,
    pub(crate) login_expiry: Scheduler,
    pub(crate) inactivity_expiry: Scheduler,
    pub(crate) update_buffers: StdMutex<HashMap<String, Arc<BufferUpdate>>>,
    pub(crate) update_buffer_interval_ms: AtomicU64,
    pub(crate) dns_domain: String,
}

/// Optional collaborators; tests and deployments override what they need.
#[derive(Default)]
pub struct ManagerOptions {
    pub validator: Option<Arc<dyn PeerValidator>>,
    pub geo: Option<Arc<dyn Geolocation>>,
    pub idp: Option<Arc<dyn IdpManager>>,
    pub proxy: Option<Arc<dyn ProxyController>>,
    pub dns_domain: Option<String>,
    pub update_buffer_interval: Option<Duration>,
}

impl AccountPeerManager {
    pub fn new(store: Arc<Store>, opts: ManagerOptions) -> Arc<Self> {
        let interval = opts
            .update_buffer_interval
            .unwrap_or(DEFAULT_UPDATE_BUFFER_INTERVAL);
        Arc::new(Self {
            updates: Arc::new(PeerUpdateManager::new()),
            request_buffer: AccountRequestBuffer::new(store.clone()),
            permissions: PermissionsManager::new(store.clone()),
            validator: opts
                .validator
                .unwrap_or_else(|| Arc::new(DefaultPeerValidator)),
            geo: opts.geo,
            idp: opts.idp,
            proxy: opts
                .proxy
                .unwrap_or_else(|| Arc::new(NoopProxyController)),
            activity: ActivityLogger::new(store.pool().clone()),
            login_expiry: Scheduler::new(),
            inactivity_expiry: Scheduler::new(),
            update_buffers: StdMutex::new(HashMap::new()),
            update_buffer_interval_ms: AtomicU64::new(interval.as_millis() as u64),
            dns_domain: opts
                .dns_domain
                .unwrap_or_else(|| DEFAULT_DNS_DOMAIN.to_string()),
            store,
        })
    }

    /// Channel registry shared with the transport layer: it creates a
    /// channel when a peer connects and drains it into the peer's stream.
    pub fn peer_update_manager(&self) -> Arc<PeerUpdateManager> {
        self.updates.clone()
    }

    pub fn permissions(&self) -> &PermissionsManager {
        &self.permissions
    }

    pub fn get_dns_domain(&self, settings: &Settings) -> String {
        settings
            .dns_domain
            .clone()
            .unwrap_or_else(|| self.dns_domain.clone())
    }
}
