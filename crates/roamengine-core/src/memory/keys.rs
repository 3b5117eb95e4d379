//! In-memory key service

use std::collections::HashMap;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{RoamError, RoamResult};
use crate::keys::{KeyAlgorithm, KeyService, NamedKey};

/// Transfer format for exported key material.
#[derive(Serialize, Deserialize)]
struct ExportedKey {
    name: String,
    seed: [u8; 32],
}

/// Key service holding Ed25519 key pairs in memory.
///
/// Secrets never leave the service except through `export`.
#[derive(Default)]
pub struct MemoryKeyService {
    keys: Mutex<HashMap<String, SigningKey>>,
}

impl MemoryKeyService {
    /// Create an empty key service
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key by name without going through the async trait.
    /// Used by [`super::MemoryNameService`] to map key names to identities.
    pub fn lookup(&self, name: &str) -> Option<NamedKey> {
        self.keys
            .lock()
            .get(name)
            .map(|secret| Self::named(name, secret))
    }

    fn named(name: &str, secret: &SigningKey) -> NamedKey {
        let public_key = secret.verifying_key().to_bytes();
        NamedKey {
            name: name.to_string(),
            id: NamedKey::identity_of(&public_key),
            public_key,
        }
    }
}

#[async_trait]
impl KeyService for MemoryKeyService {
    async fn list(&self) -> RoamResult<Vec<NamedKey>> {
        let keys = self.keys.lock();
        let mut out: Vec<NamedKey> = keys
            .iter()
            .map(|(name, secret)| Self::named(name, secret))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn create(
        &self,
        name: &str,
        algorithm: KeyAlgorithm,
        _size: u32,
    ) -> RoamResult<NamedKey> {
        let KeyAlgorithm::Ed25519 = algorithm;

        let mut keys = self.keys.lock();
        if keys.contains_key(name) {
            return Err(RoamError::Key(format!("key '{}' already exists", name)));
        }

        // Seed via getrandom directly to avoid rand version conflicts
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| RoamError::Key(format!("entropy unavailable: {}", e)))?;
        let secret = SigningKey::from_bytes(&seed);

        let named = Self::named(name, &secret);
        info!(name, id = %named.id, "Created key");
        keys.insert(name.to_string(), secret);
        Ok(named)
    }

    async fn remove(&self, name: &str) -> RoamResult<()> {
        if self.keys.lock().remove(name).is_none() {
            return Err(RoamError::Key(format!("no key named '{}'", name)));
        }
        debug!(name, "Removed key");
        Ok(())
    }

    async fn import(&self, bytes: &[u8]) -> RoamResult<NamedKey> {
        let exported: ExportedKey = postcard::from_bytes(bytes)
            .map_err(|e| RoamError::Key(format!("invalid key material: {}", e)))?;
        let secret = SigningKey::from_bytes(&exported.seed);
        let named = Self::named(&exported.name, &secret);

        let mut keys = self.keys.lock();
        if let Some(existing) = keys.get(&exported.name) {
            if existing.verifying_key().to_bytes() == named.public_key {
                return Ok(named);
            }
            return Err(RoamError::Key(format!(
                "key '{}' already exists with a different identity",
                exported.name
            )));
        }

        info!(name = %exported.name, id = %named.id, "Imported key");
        keys.insert(exported.name, secret);
        Ok(named)
    }

    async fn export(&self, name: &str) -> RoamResult<Vec<u8>> {
        let keys = self.keys.lock();
        let secret = keys
            .get(name)
            .ok_or_else(|| RoamError::Key(format!("no key named '{}'", name)))?;
        let exported = ExportedKey {
            name: name.to_string(),
            seed: secret.to_bytes(),
        };
        postcard::to_stdvec(&exported)
            .map_err(|e| RoamError::Serialization(format!("Failed to encode key: {}", e)))
    }
}
