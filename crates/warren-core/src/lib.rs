//! Warren Core - shared domain types for the Warren mesh-VPN control plane

pub mod account;
pub mod dns;
pub mod error;
pub mod ip;
pub mod keys;
pub mod netmap;
pub mod types;

pub use account::*;
pub use error::*;
pub use netmap::*;
pub use types::*;
