//! Roamengine Core Library
//!
//! Multi-device roaming objects over a content-addressed store.
//!
//! ## Overview
//!
//! Independent devices jointly own a single logical application object
//! while each device may append only to its own private event stream. The
//! converged "roaming" view is computed by replaying every device's
//! history in deterministic timestamp order: eventual consistency without
//! CRDTs or negotiated conflict resolution.
//!
//! ## Core Principles
//!
//! - **Single writer per stream**: only the private-key holder appends;
//!   cross-device concurrency resolves purely through replay
//! - **Content addressed**: entries are immutable blobs, so replay is a
//!   pure function of the entry set and timestamp order
//! - **Collaborators at the boundary**: the content store, name service,
//!   key service and pub/sub room are traits; in-memory backends ship in
//!   [`memory`]
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use roamengine_core::memory::{MemoryContentStore, MemoryKeyService, MemoryNameService};
//! use roamengine_core::Repository;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let keys = Arc::new(MemoryKeyService::new());
//!     let repo = Repository::new(
//!         Arc::new(MemoryContentStore::new()),
//!         Arc::new(MemoryNameService::new(keys.clone())),
//!         keys,
//!     );
//!
//!     let cancel = CancellationToken::new();
//!     let album = repo.create("photos", PhotoAlbum::default(), &cancel).await?;
//!
//!     let mut handler = album.lock().await;
//!     let target = handler.handler_id().clone();
//!     if let Some(writable) = handler.as_modifiable() {
//!         writable
//!             .append_new_entry(&target, "Rename", &"Summer 2026", None, &cancel)
//!             .await?;
//!         writable.publish_local(std::time::Duration::from_secs(86_400), &cancel).await?;
//!     }
//!
//!     Ok(())
//! }
//! ```

mod cancel;

pub mod config;
pub mod error;
pub mod handler;
pub mod keys;
pub mod memory;
pub mod names;
pub mod pairing;
pub mod repository;
pub mod resolver;
pub mod room;
pub mod store;
pub mod stream;
pub mod types;

// Re-exports
pub use config::{HandlerConfig, InstanceCache, Resolved, SharedHandler};
pub use error::{RoamError, RoamResult};
pub use handler::{
    advance_fan_out, HandlerCore, LocalStream, ModifiableHandler, ReadOnlyHandler, RoamingValue,
};
pub use keys::{KeyAlgorithm, KeyService, NamedKey};
pub use names::{NameService, DEFAULT_PUBLISH_LIFETIME};
pub use pairing::{KeyExchange, PairingOutcome, PairingPayload, PAIRING_VERSION};
pub use repository::{Repository, RepositoryEvent};
pub use resolver::{EventStreamResolver, ResolvedStreams};
pub use room::{PubSubRoom, RoomMessage};
pub use store::{ContentStore, ContentStoreExt};
pub use stream::{
    is_control_event, EventStream, EventStreamEntry, SourceRef, SOURCE_ADD, SOURCE_REMOVE,
};
pub use types::{Cid, RoamingId};
