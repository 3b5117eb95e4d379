//! In-memory collaborator implementations
//!
//! Backends for the four collaborator traits with no persistence and no
//! network, suitable for tests and for shells that want a self-contained
//! node. Data is lost when the process exits.

mod keys;
mod names;
mod room;
mod store;

pub use keys::MemoryKeyService;
pub use names::{MemoryNameRegistry, MemoryNameService};
pub use room::{MemoryRoom, MemoryRoomHub};
pub use store::MemoryContentStore;
