//! Key service collaborator boundary
//!
//! Named asymmetric keys back every roaming identity: the roaming key pins
//! the converged value's published name, the local key pins the device's
//! own event stream. Secret material stays inside the key service and only
//! leaves through `export`, which the pairing protocol ships to a joining
//! device.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::RoamResult;

/// Key algorithms the service can generate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyAlgorithm {
    /// Ed25519 signing keys; the `size` argument of `create` is ignored
    Ed25519,
}

/// Public view of a named key pair.
///
/// `id` is the key's public identity: the name the name service resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedKey {
    /// Human-readable name the key is registered under
    pub name: String,
    /// Public identity (base58 of the verifying key)
    pub id: String,
    /// Raw verifying key bytes
    pub public_key: [u8; 32],
}

impl NamedKey {
    /// Derive the public identity string for a verifying key
    pub fn identity_of(public_key: &[u8; 32]) -> String {
        bs58::encode(public_key).into_string()
    }
}

impl std::fmt::Display for NamedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, &hex::encode(&self.public_key[..4]))
    }
}

/// Named key management.
#[async_trait]
pub trait KeyService: Send + Sync {
    /// List all registered keys
    async fn list(&self) -> RoamResult<Vec<NamedKey>>;

    /// Generate a new key pair under `name`.
    ///
    /// Fails with [`crate::RoamError::Key`] if the name is already taken.
    /// `size` is only meaningful for algorithms with variable key sizes.
    async fn create(&self, name: &str, algorithm: KeyAlgorithm, size: u32)
        -> RoamResult<NamedKey>;

    /// Remove a key by name
    async fn remove(&self, name: &str) -> RoamResult<()>;

    /// Import exported key material, registering it under the exported name.
    ///
    /// Importing the same material twice is idempotent; importing different
    /// material under an existing name fails.
    async fn import(&self, bytes: &[u8]) -> RoamResult<NamedKey>;

    /// Export a key's material (including the secret) for transfer
    async fn export(&self, name: &str) -> RoamResult<Vec<u8>>;
}
