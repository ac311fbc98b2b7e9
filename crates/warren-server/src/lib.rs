//! Warren Management Server
//!
//! Account-scoped peer lifecycle: registration, login, synchronization,
//! expiration and network-map dissemination. The gRPC/REST transport, the
//! signal and relay services and the on-peer tunnel live elsewhere and
//! consume this crate through [`manager::AccountPeerManager`] and the
//! capability traits in [`integrations`].

pub mod audit;
pub mod buffer;
pub mod expiry;
pub mod integrations;
pub mod locks;
pub mod login;
pub mod manager;
pub mod metrics;
pub mod peers;
pub mod permissions;
pub mod posture;
pub mod queries;
pub mod store;
pub mod updates;
pub mod validator;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing for binaries and tests. Honors `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "warren_server=debug,info".into()),
        ))
        .try_init()
        .ok();
}
