//! Append-only event streams
//!
//! Each device owns exactly one writable stream per roaming object: an
//! ordered list of entry Cids it alone may extend. Everything else a device
//! sees arrives through sources (Cids of other devices' streams) merged
//! by the resolver. Streams and entries are content-addressed, so history
//! is immutable once published.
//!
//! ## Control entries
//!
//! Two reserved event ids mutate source membership from inside the data:
//!
//! - [`SOURCE_ADD`]: the entry's content decodes to a [`SourceRef`]; the
//!   referenced stream joins the merge set.
//! - [`SOURCE_REMOVE`]: the referenced stream is tombstoned. Its history
//!   stays in memory and a later add restores visibility without refetch.
//!
//! Control entries drive the crawl and never surface as application events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RoamError, RoamResult};
use crate::types::{Cid, RoamingId};

/// Event id of a source-add control entry
pub const SOURCE_ADD: &str = "source.add";

/// Event id of a source-remove control entry
pub const SOURCE_REMOVE: &str = "source.remove";

/// Whether an event id names a control entry
pub fn is_control_event(event_id: &str) -> bool {
    event_id == SOURCE_ADD || event_id == SOURCE_REMOVE
}

/// One device's append-only history for a roaming object.
///
/// `entries` holds the Cids of [`EventStreamEntry`] blobs in append order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStream {
    /// Human-readable label, conventionally the owning local key name
    pub label: String,
    /// Entry Cids in append order
    pub entries: Vec<Cid>,
}

impl EventStream {
    /// Create a new empty stream
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            entries: Vec::new(),
        }
    }

    /// Append an entry Cid
    pub fn append(&mut self, entry: Cid) {
        self.entries.push(entry);
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stream has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A single immutable event.
///
/// Entries are stored as postcard blobs; a blob that fails to decode or
/// decodes with an empty `target_id` or `event_id` is treated as corrupted
/// data ([`RoamError::MalformedEntry`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStreamEntry {
    /// Roaming object this entry belongs to
    pub target_id: RoamingId,
    /// Application event id, or one of the reserved control ids
    pub event_id: String,
    /// Creation time; replay order is ascending on this field
    pub timestamp_utc: DateTime<Utc>,
    /// Cid of the application payload (or [`SourceRef`] for control entries)
    pub content: Cid,
}

impl EventStreamEntry {
    /// Whether this entry carries a control event
    pub fn is_control(&self) -> bool {
        is_control_event(&self.event_id)
    }

    /// Check required fields, failing fast on corrupted data
    pub fn validate(&self) -> RoamResult<()> {
        if self.target_id.as_str().is_empty() {
            return Err(RoamError::MalformedEntry(
                "entry has an empty target id".to_string(),
            ));
        }
        if self.event_id.is_empty() {
            return Err(RoamError::MalformedEntry(
                "entry has an empty event id".to_string(),
            ));
        }
        Ok(())
    }

    /// Decode an entry blob, mapping any failure to [`RoamError::MalformedEntry`]
    pub fn decode(cid: &Cid, bytes: &[u8]) -> RoamResult<Self> {
        let entry: Self = postcard::from_bytes(bytes).map_err(|e| {
            RoamError::MalformedEntry(format!("entry {} failed to decode: {}", cid, e))
        })?;
        entry.validate()?;
        Ok(entry)
    }
}

/// Payload of a control entry: the stream it adds or removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    /// Cid of the referenced [`EventStream`] blob
    pub stream: Cid,
}
