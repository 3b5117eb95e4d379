//! Error types for Roamengine

use thiserror::Error;

/// Main error type for Roamengine operations
#[derive(Error, Debug)]
pub enum RoamError {
    /// Invalid handler configuration (e.g. exactly one of the local/roaming
    /// key pair present). Raised before any collaborator I/O.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// A Cid or published name could not be resolved
    #[error("Not found: {0}")]
    NotFound(String),

    /// An event stream entry is malformed (missing or empty required field,
    /// undecodable blob). Indicates corrupted or incompatible data.
    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    /// The pairing transport reported an error; the exchange is aborted
    #[error("Pairing protocol error: {0}")]
    Protocol(String),

    /// A cancellation signal was observed mid-operation
    #[error("Operation cancelled")]
    Cancelled,

    /// Content store failure
    #[error("Store error: {0}")]
    Store(String),

    /// Name publish/resolve failure
    #[error("Name service error: {0}")]
    Name(String),

    /// Key service failure (create/import/export/remove)
    #[error("Key service error: {0}")]
    Key(String),

    /// Pub/sub room failure
    #[error("Room error: {0}")]
    Room(String),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias using RoamError
pub type RoamResult<T> = Result<T, RoamError>;
