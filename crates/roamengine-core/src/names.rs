//! Name service collaborator boundary
//!
//! The name service is the mutable-pointer layer over asymmetric key
//! identities: publishing binds the latest Cid to a named key, resolving
//! maps a key's public identity back to that Cid. Records may expire after
//! their publish lifetime.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::RoamResult;
use crate::types::Cid;

/// Default publish lifetime used by handlers and the pairing protocol.
pub const DEFAULT_PUBLISH_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Mutable name publish/resolve service.
#[async_trait]
pub trait NameService: Send + Sync {
    /// Publish `cid` as the current value of the key called `key_name`.
    /// The record stays resolvable for at least `lifetime`.
    async fn publish(&self, cid: &Cid, key_name: &str, lifetime: Duration) -> RoamResult<()>;

    /// Resolve a public identity to its latest published Cid.
    ///
    /// Fails with [`crate::RoamError::NotFound`] when the name was never
    /// published or its record expired. `recursive` and `no_cache` are
    /// hints for implementations that chain or cache records.
    async fn resolve(&self, name: &str, recursive: bool, no_cache: bool) -> RoamResult<Cid>;
}
