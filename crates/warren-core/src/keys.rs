//! WireGuard key handling

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::{Error, Result};

/// Checks that a client-supplied WireGuard public key is well formed:
/// base64 that decodes to exactly 32 bytes.
pub fn validate_wireguard_key(key: &str) -> Result<()> {
    let decoded = BASE64
        .decode(key)
        .map_err(|_| Error::InvalidArgument("public key is not valid base64".into()))?;
    if decoded.len() != 32 {
        return Err(Error::InvalidArgument(
            "public key must decode to exactly 32 bytes".into(),
        ));
    }
    Ok(())
}

/// x25519 keypair in the base64 encoding WireGuard uses on the wire.
///
/// The control plane itself only ever sees public keys; generation lives
/// here for tooling and tests.
#[derive(Debug, Clone)]
pub struct WgKeyPair {
    pub private_key: String,
    pub public_key: String,
}

impl WgKeyPair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::thread_rng());
        let public = PublicKey::from(&secret);
        Self {
            private_key: BASE64.encode(secret.as_bytes()),
            public_key: BASE64.encode(public.as_bytes()),
        }
    }
}
