//! In-memory name service

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RoamError, RoamResult};
use crate::names::NameService;
use crate::types::Cid;

use super::MemoryKeyService;

struct NameRecord {
    cid: Cid,
    expires_at: DateTime<Utc>,
}

/// Shared resolution table for name records.
///
/// Devices publish through their own [`MemoryNameService`] but resolve
/// against the same registry, the way independent nodes see one global
/// name space. Clone to hand the same table to several services.
#[derive(Clone, Default)]
pub struct MemoryNameRegistry {
    records: Arc<Mutex<HashMap<String, NameRecord>>>,
}

impl MemoryNameRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }
}

/// Mutable pointer records over the identities of a [`MemoryKeyService`].
///
/// Publishing under a key name binds the key's public identity to a Cid
/// until the record's lifetime runs out. Only keys known to this service
/// can publish; any identity in the registry can be resolved.
pub struct MemoryNameService {
    keys: Arc<MemoryKeyService>,
    registry: MemoryNameRegistry,
}

impl MemoryNameService {
    /// Create a name service with a private registry
    pub fn new(keys: Arc<MemoryKeyService>) -> Self {
        Self::with_registry(keys, MemoryNameRegistry::new())
    }

    /// Create a name service over a shared registry
    pub fn with_registry(keys: Arc<MemoryKeyService>, registry: MemoryNameRegistry) -> Self {
        Self { keys, registry }
    }
}

#[async_trait]
impl NameService for MemoryNameService {
    async fn publish(&self, cid: &Cid, key_name: &str, lifetime: Duration) -> RoamResult<()> {
        let key = self
            .keys
            .lookup(key_name)
            .ok_or_else(|| RoamError::Name(format!("no key named '{}'", key_name)))?;

        let lifetime = chrono::Duration::from_std(lifetime)
            .map_err(|e| RoamError::Name(format!("lifetime out of range: {}", e)))?;
        let record = NameRecord {
            cid: *cid,
            expires_at: Utc::now() + lifetime,
        };

        debug!(name = %key.id, %cid, "Published name record");
        self.registry.records.lock().insert(key.id, record);
        Ok(())
    }

    async fn resolve(&self, name: &str, _recursive: bool, _no_cache: bool) -> RoamResult<Cid> {
        let records = self.registry.records.lock();
        let record = records
            .get(name)
            .ok_or_else(|| RoamError::NotFound(format!("name '{}' is not published", name)))?;
        if record.expires_at < Utc::now() {
            return Err(RoamError::NotFound(format!("name '{}' has expired", name)));
        }
        Ok(record.cid)
    }
}
