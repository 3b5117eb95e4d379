//! Shared fixtures for the integration suites
//!
//! Models a small network: one global content store and name registry,
//! per-device key services and repositories.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use roamengine_core::memory::{
    MemoryContentStore, MemoryKeyService, MemoryNameRegistry, MemoryNameService,
};
use roamengine_core::{
    Cid, EventStreamEntry, Repository, RoamError, RoamResult, RoamingValue,
};

/// Application value used across the suites: a map of named fields plus a
/// log of applied event ids, so both convergence and ordering are easy to
/// assert on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub fields: BTreeMap<String, String>,
    pub applied: Vec<String>,
    pub sources: BTreeSet<Cid>,
}

#[async_trait]
impl RoamingValue for Notebook {
    async fn apply_entry_update(
        &mut self,
        entry: &EventStreamEntry,
        payload: Bytes,
    ) -> RoamResult<()> {
        let text: String = postcard::from_bytes(&payload)
            .map_err(|e| RoamError::Serialization(e.to_string()))?;
        self.fields.insert(entry.event_id.clone(), text);
        self.applied.push(entry.event_id.clone());
        Ok(())
    }

    fn sources(&self) -> &BTreeSet<Cid> {
        &self.sources
    }

    fn set_sources(&mut self, sources: BTreeSet<Cid>) {
        self.sources = sources;
    }
}

/// Encode a value the way it goes over the store boundary
pub fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    postcard::to_stdvec(value).expect("encodable")
}

/// Opt-in test logging: `RUST_LOG=debug cargo test -- --nocapture`
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fixed timestamp helper
pub fn ts(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("valid timestamp")
}

/// The pieces every test network shares: content is global, names resolve
/// globally, keys are private per device.
pub struct Network {
    pub store: Arc<MemoryContentStore>,
    pub registry: MemoryNameRegistry,
}

impl Network {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryContentStore::new()),
            registry: MemoryNameRegistry::new(),
        }
    }

    /// Attach a new device with its own keys and repository
    pub fn device(&self) -> Device {
        let keys = Arc::new(MemoryKeyService::new());
        let names = Arc::new(MemoryNameService::with_registry(
            keys.clone(),
            self.registry.clone(),
        ));
        let repo = Repository::new(self.store.clone(), names.clone(), keys.clone());
        Device {
            store: self.store.clone(),
            keys,
            names,
            repo,
        }
    }
}

/// One device: private keys, shared content and name space.
pub struct Device {
    pub store: Arc<MemoryContentStore>,
    pub keys: Arc<MemoryKeyService>,
    pub names: Arc<MemoryNameService>,
    pub repo: Repository<Notebook>,
}

impl Device {
    /// A repository with a cold cache over the same collaborators, for
    /// forcing a fresh resolution on this device
    pub fn fresh_repo(&self) -> Repository<Notebook> {
        Repository::new(self.store.clone(), self.names.clone(), self.keys.clone())
    }
}
