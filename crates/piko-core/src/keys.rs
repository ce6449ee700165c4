//! WireGuard key handling.
//!
//! Keys move through the system as base64 strings (the rendezvous API and
//! the discovery protocol both carry them that way); [`WgKey`] is the
//! decoded 32-byte form handed to the tunnel device.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

/// Errors that can arise when decoding key material.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("key is not valid base64: {0}")]
    Encoding(String),

    #[error("key is {0} bytes, expected 32")]
    Length(usize),
}

/// A decoded 32-byte WireGuard key (public or private).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct WgKey([u8; 32]);

impl WgKey {
    /// Decode a base64 key string.
    pub fn from_base64(key: &str) -> Result<Self, KeyError> {
        let bytes = STANDARD
            .decode(key)
            .map_err(|e| KeyError::Encoding(e.to_string()))?;

        let raw: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::Length(bytes.len()))?;

        Ok(Self(raw))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Keys are not secret-safe to print in full; the first bytes are
        // enough to correlate log lines.
        write!(f, "WgKey({}...)", &self.to_base64()[..8])
    }
}

impl std::fmt::Display for WgKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// A freshly generated WireGuard keypair, base64-encoded.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub private: String,
    pub public: String,
}

impl KeyPair {
    /// Generate a new X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);

        Self {
            private: STANDARD.encode(secret.to_bytes()),
            public: STANDARD.encode(public.as_bytes()),
        }
    }
}
