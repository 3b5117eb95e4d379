//! Content store collaborator boundary
//!
//! The content store is an external collaborator: an addressed blob store
//! where every blob is retrievable under the hash of its bytes. The core
//! never talks to a concrete backend; it goes through this trait. An
//! in-memory implementation lives in [`crate::memory`].

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{RoamError, RoamResult};
use crate::types::Cid;

/// Addressed blob store.
///
/// `put` is idempotent: storing the same bytes twice yields the same Cid.
/// `get` fails with [`RoamError::NotFound`] when the Cid is unresolvable.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a blob and return its content identifier
    async fn put(&self, bytes: Bytes) -> RoamResult<Cid>;

    /// Fetch a blob by Cid. `no_cache` asks the implementation to bypass
    /// any local cache it keeps.
    async fn get(&self, cid: &Cid, no_cache: bool) -> RoamResult<Bytes>;
}

/// Typed store access layered over [`ContentStore`].
///
/// Values cross the store boundary as postcard blobs; the Cid of a value is
/// the Cid of its encoding.
#[async_trait]
pub trait ContentStoreExt: ContentStore {
    /// Serialize a value and store it
    async fn put_value<T>(&self, value: &T) -> RoamResult<Cid>
    where
        T: Serialize + Sync,
    {
        let bytes = postcard::to_stdvec(value)
            .map_err(|e| RoamError::Serialization(format!("Failed to encode value: {}", e)))?;
        self.put(Bytes::from(bytes)).await
    }

    /// Fetch a blob and decode it as `T`
    async fn get_value<T>(&self, cid: &Cid, no_cache: bool) -> RoamResult<T>
    where
        T: DeserializeOwned,
    {
        let bytes = self.get(cid, no_cache).await?;
        postcard::from_bytes(&bytes)
            .map_err(|e| RoamError::Serialization(format!("Failed to decode {}: {}", cid, e)))
    }
}

#[async_trait]
impl<S: ContentStore + ?Sized> ContentStoreExt for S {}
