//! In-memory content store

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RoamError, RoamResult};
use crate::store::ContentStore;
use crate::types::Cid;

/// Content-addressed blob store held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryContentStore {
    blobs: Mutex<HashMap<Cid, Bytes>>,
}

impl MemoryContentStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs
    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    /// Whether the store holds no blobs
    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(&self, bytes: Bytes) -> RoamResult<Cid> {
        let cid = Cid::from_content(&bytes);
        debug!(%cid, len = bytes.len(), "Storing blob");
        self.blobs.lock().insert(cid, bytes);
        Ok(cid)
    }

    async fn get(&self, cid: &Cid, _no_cache: bool) -> RoamResult<Bytes> {
        self.blobs
            .lock()
            .get(cid)
            .cloned()
            .ok_or_else(|| RoamError::NotFound(format!("blob {}", cid)))
    }
}
