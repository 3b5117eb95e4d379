//! Event stream resolver
//!
//! Merges a dynamic set of append-only streams into one deterministically
//! ordered entry sequence. The crawl starts from a handler's current
//! sources and follows membership changes encoded inside the streams
//! themselves: `source.add` entries pull further streams into the merge
//! set, `source.remove` entries tombstone them. A tombstone hides a
//! source's history without discarding it; a later add restores
//! visibility without refetching.
//!
//! Emission is ascending on `timestamp_utc`. Ties keep encounter order,
//! which is crawl-dependent; callers needing a stable tie-break must
//! impose one on top (known limitation).
//!
//! Every call to [`EventStreamResolver::resolve`] performs a fresh crawl;
//! the result is finite and re-computable, never resumable.

use std::collections::{BTreeSet, HashMap, VecDeque};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel::{checkpoint, guard};
use crate::error::{RoamError, RoamResult};
use crate::store::{ContentStore, ContentStoreExt};
use crate::stream::{EventStream, EventStreamEntry, SourceRef, SOURCE_ADD, SOURCE_REMOVE};
use crate::types::{Cid, RoamingId};

/// Outcome of one crawl: the merged emission plus the post-crawl
/// membership sets the caller writes back into its handler.
#[derive(Debug, Clone)]
pub struct ResolvedStreams {
    /// Non-control entries of all live sources, ascending by timestamp
    pub entries: Vec<EventStreamEntry>,
    /// Source set after applying all control events
    pub sources: BTreeSet<Cid>,
    /// Sources removed and not re-added during the crawl
    pub tombstoned: BTreeSet<Cid>,
}

/// Crawls and merges event streams out of a content store.
pub struct EventStreamResolver<'a> {
    store: &'a dyn ContentStore,
}

impl<'a> EventStreamResolver<'a> {
    /// Create a resolver over the given store
    pub fn new(store: &'a dyn ContentStore) -> Self {
        Self { store }
    }

    /// Crawl every stream reachable from `seeds` and merge their entries.
    ///
    /// Entries that fail to decode or miss required fields abort the crawl
    /// with [`RoamError::MalformedEntry`]. Entries targeting a different
    /// handler are skipped with a warning: streams may be shared between
    /// objects, so foreign entries are visible but not ours to replay.
    pub async fn resolve(
        &self,
        handler_id: &RoamingId,
        seeds: &BTreeSet<Cid>,
        cancel: &CancellationToken,
    ) -> RoamResult<ResolvedStreams> {
        let mut sources = seeds.clone();
        let mut tombstoned: BTreeSet<Cid> = BTreeSet::new();

        let mut queue: VecDeque<Cid> = seeds.iter().copied().collect();
        let mut queued: BTreeSet<Cid> = seeds.clone();

        // Collected entries per source (keyed alongside their own Cids so
        // emission can dedupe entries visible through overlapping stream
        // snapshots), plus encounter order for emission
        let mut collected: HashMap<Cid, Vec<(Cid, EventStreamEntry)>> = HashMap::new();
        let mut order: Vec<Cid> = Vec::new();

        while let Some(source) = queue.pop_front() {
            queued.remove(&source);
            if tombstoned.contains(&source) {
                debug!(%source, "Skipping tombstoned source");
                continue;
            }
            if collected.contains_key(&source) {
                continue;
            }
            checkpoint(cancel)?;

            let stream: EventStream =
                guard(cancel, self.store.get_value(&source, false)).await?;
            debug!(
                %source,
                label = %stream.label,
                entries = stream.entries.len(),
                "Crawling source stream"
            );

            let mut kept = Vec::new();
            for entry_cid in &stream.entries {
                let bytes = guard(cancel, self.store.get(entry_cid, false)).await?;
                let entry = EventStreamEntry::decode(entry_cid, &bytes)?;

                if entry.is_control() {
                    let referenced = self.resolve_source_ref(&entry, cancel).await?;
                    match entry.event_id.as_str() {
                        SOURCE_ADD => {
                            let restored = tombstoned.remove(&referenced);
                            let added = sources.insert(referenced);
                            if restored {
                                debug!(source = %referenced, "Restored tombstoned source");
                            } else if added {
                                debug!(source = %referenced, "Discovered new source");
                            }
                            if (restored || added)
                                && !collected.contains_key(&referenced)
                                && queued.insert(referenced)
                            {
                                queue.push_back(referenced);
                            }
                        }
                        SOURCE_REMOVE => {
                            sources.remove(&referenced);
                            tombstoned.insert(referenced);
                            debug!(source = %referenced, "Tombstoned source");
                        }
                        _ => {}
                    }
                    continue;
                }

                if entry.target_id != *handler_id {
                    warn!(
                        entry = %entry_cid,
                        target = %entry.target_id,
                        handler = %handler_id,
                        "Skipping entry targeting a different handler"
                    );
                    continue;
                }
                kept.push((*entry_cid, entry));
            }

            order.push(source);
            collected.insert(source, kept);
        }

        // An entry may be reachable through several sources (an older
        // snapshot of a stream is a prefix of a newer one); emit each
        // entry Cid once, from its first live encounter
        let mut emitted: BTreeSet<Cid> = BTreeSet::new();
        let mut entries: Vec<EventStreamEntry> = Vec::new();
        for source in &order {
            if tombstoned.contains(source) {
                continue;
            }
            if let Some(kept) = collected.get(source) {
                for (entry_cid, entry) in kept {
                    if emitted.insert(*entry_cid) {
                        entries.push(entry.clone());
                    }
                }
            }
        }
        // Stable sort: equal timestamps keep encounter order
        entries.sort_by_key(|e| e.timestamp_utc);

        debug!(
            handler = %handler_id,
            emitted = entries.len(),
            sources = sources.len(),
            tombstoned = tombstoned.len(),
            "Crawl complete"
        );
        Ok(ResolvedStreams {
            entries,
            sources,
            tombstoned,
        })
    }

    /// Fetch and decode the stream reference a control entry points at
    async fn resolve_source_ref(
        &self,
        entry: &EventStreamEntry,
        cancel: &CancellationToken,
    ) -> RoamResult<Cid> {
        let source_ref: SourceRef = guard(
            cancel,
            self.store.get_value::<SourceRef>(&entry.content, false),
        )
        .await
        .map_err(|e| match e {
            RoamError::Serialization(msg) => RoamError::MalformedEntry(msg),
            other => other,
        })?;
        Ok(source_ref.stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryContentStore;
    use bytes::Bytes;
    use chrono::DateTime;

    fn id(s: &str) -> RoamingId {
        RoamingId::new(s)
    }

    async fn put_payload(store: &MemoryContentStore, data: &[u8]) -> Cid {
        store.put(Bytes::copy_from_slice(data)).await.unwrap()
    }

    async fn put_entry(
        store: &MemoryContentStore,
        target: &str,
        event: &str,
        t: i64,
        content: Cid,
    ) -> Cid {
        let entry = EventStreamEntry {
            target_id: id(target),
            event_id: event.to_string(),
            timestamp_utc: DateTime::from_timestamp(t, 0).unwrap(),
            content,
        };
        store.put_value(&entry).await.unwrap()
    }

    async fn put_control(
        store: &MemoryContentStore,
        target: &str,
        event: &str,
        t: i64,
        referenced: Cid,
    ) -> Cid {
        let content = store.put_value(&SourceRef { stream: referenced }).await.unwrap();
        put_entry(store, target, event, t, content).await
    }

    async fn put_stream(store: &MemoryContentStore, label: &str, entries: Vec<Cid>) -> Cid {
        let stream = EventStream {
            label: label.to_string(),
            entries,
        };
        store.put_value(&stream).await.unwrap()
    }

    async fn resolve(
        store: &MemoryContentStore,
        handler: &str,
        seeds: &[Cid],
    ) -> RoamResult<ResolvedStreams> {
        let resolver = EventStreamResolver::new(store);
        let seeds: BTreeSet<Cid> = seeds.iter().copied().collect();
        resolver
            .resolve(&id(handler), &seeds, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn test_merge_orders_by_timestamp_across_sources() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let e1 = put_entry(&store, "obj", "First", 100, p).await;
        let e3 = put_entry(&store, "obj", "Third", 300, p).await;
        let a = put_stream(&store, "a", vec![e1, e3]).await;

        let e2 = put_entry(&store, "obj", "Second", 200, p).await;
        let b = put_stream(&store, "b", vec![e2]).await;

        let resolved = resolve(&store, "obj", &[a, b]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(events, vec!["First", "Second", "Third"]);
    }

    #[tokio::test]
    async fn test_source_add_discovers_new_stream() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let be = put_entry(&store, "obj", "FromB", 50, p).await;
        let b = put_stream(&store, "b", vec![be]).await;

        let add_b = put_control(&store, "obj", SOURCE_ADD, 10, b).await;
        let ae = put_entry(&store, "obj", "FromA", 100, p).await;
        let a = put_stream(&store, "a", vec![add_b, ae]).await;

        let resolved = resolve(&store, "obj", &[a]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(events, vec!["FromB", "FromA"]);
        assert!(resolved.sources.contains(&b));
    }

    #[tokio::test]
    async fn test_control_entries_never_emitted() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let be = put_entry(&store, "obj", "FromB", 50, p).await;
        let b = put_stream(&store, "b", vec![be]).await;
        let add_b = put_control(&store, "obj", SOURCE_ADD, 10, b).await;
        let a = put_stream(&store, "a", vec![add_b]).await;

        let resolved = resolve(&store, "obj", &[a]).await.unwrap();
        assert!(resolved.entries.iter().all(|e| !e.is_control()));
    }

    #[tokio::test]
    async fn test_source_remove_tombstones_history() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let be = put_entry(&store, "obj", "FromB", 50, p).await;
        let b = put_stream(&store, "b", vec![be]).await;

        let add_b = put_control(&store, "obj", SOURCE_ADD, 10, b).await;
        let remove_b = put_control(&store, "obj", SOURCE_REMOVE, 20, b).await;
        let a = put_stream(&store, "a", vec![add_b, remove_b]).await;

        let resolved = resolve(&store, "obj", &[a]).await.unwrap();
        assert!(resolved.entries.is_empty());
        assert!(!resolved.sources.contains(&b));
        assert!(resolved.tombstoned.contains(&b));
    }

    #[tokio::test]
    async fn test_readd_restores_visibility() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let be = put_entry(&store, "obj", "FromB", 50, p).await;
        let b = put_stream(&store, "b", vec![be]).await;

        let add_b = put_control(&store, "obj", SOURCE_ADD, 10, b).await;
        let remove_b = put_control(&store, "obj", SOURCE_REMOVE, 20, b).await;
        let readd_b = put_control(&store, "obj", SOURCE_ADD, 30, b).await;
        let a = put_stream(&store, "a", vec![add_b, remove_b, readd_b]).await;

        let resolved = resolve(&store, "obj", &[a]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(events, vec!["FromB"]);
        assert!(resolved.sources.contains(&b));
        assert!(resolved.tombstoned.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_target_skipped_not_fatal() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let ours = put_entry(&store, "obj", "Ours", 100, p).await;
        let theirs = put_entry(&store, "other", "Theirs", 50, p).await;
        let a = put_stream(&store, "a", vec![theirs, ours]).await;

        let resolved = resolve(&store, "obj", &[a]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(events, vec!["Ours"]);
    }

    #[tokio::test]
    async fn test_malformed_entry_aborts_crawl() {
        let store = MemoryContentStore::new();
        let garbage = store.put(Bytes::from_static(&[0xFF, 0x01, 0x02])).await.unwrap();
        let a = put_stream(&store, "a", vec![garbage]).await;

        let err = resolve(&store, "obj", &[a]).await.unwrap_err();
        assert!(matches!(err, RoamError::MalformedEntry(_)));
    }

    #[tokio::test]
    async fn test_missing_stream_is_not_found() {
        let store = MemoryContentStore::new();
        let ghost = Cid::from_content(b"not stored");
        let err = resolve(&store, "obj", &[ghost]).await.unwrap_err();
        assert!(matches!(err, RoamError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_add_does_not_duplicate_entries() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let be = put_entry(&store, "obj", "FromB", 50, p).await;
        let b = put_stream(&store, "b", vec![be]).await;

        let add1 = put_control(&store, "obj", SOURCE_ADD, 10, b).await;
        let add2 = put_control(&store, "obj", SOURCE_ADD, 20, b).await;
        let a = put_stream(&store, "a", vec![add1, add2]).await;

        let resolved = resolve(&store, "obj", &[a, b]).await.unwrap();
        let count = resolved
            .entries
            .iter()
            .filter(|e| e.event_id == "FromB")
            .count();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_overlapping_snapshots_emit_entries_once() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        // newer snapshot extends the older one; both are live sources
        let e1 = put_entry(&store, "obj", "One", 100, p).await;
        let e2 = put_entry(&store, "obj", "Two", 200, p).await;
        let older = put_stream(&store, "dev", vec![e1]).await;
        let newer = put_stream(&store, "dev", vec![e1, e2]).await;

        let resolved = resolve(&store, "obj", &[older, newer]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        assert_eq!(events, vec!["One", "Two"]);
    }

    #[tokio::test]
    async fn test_equal_timestamps_keep_encounter_order() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;

        let x = put_entry(&store, "obj", "X", 100, p).await;
        let a = put_stream(&store, "a", vec![x]).await;
        let y = put_entry(&store, "obj", "Y", 100, p).await;
        let b = put_stream(&store, "b", vec![y]).await;

        // a is seeded before b, so its tied entry is encountered first
        let resolved = resolve(&store, "obj", &[a, b]).await.unwrap();
        let events: Vec<&str> = resolved
            .entries
            .iter()
            .map(|e| e.event_id.as_str())
            .collect();
        if a < b {
            assert_eq!(events, vec!["X", "Y"]);
        } else {
            assert_eq!(events, vec!["Y", "X"]);
        }
    }

    #[tokio::test]
    async fn test_cancelled_crawl() {
        let store = MemoryContentStore::new();
        let p = put_payload(&store, b"p").await;
        let e = put_entry(&store, "obj", "E", 100, p).await;
        let a = put_stream(&store, "a", vec![e]).await;

        let resolver = EventStreamResolver::new(&store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let seeds: BTreeSet<Cid> = [a].into_iter().collect();
        let err = resolver
            .resolve(&id("obj"), &seeds, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RoamError::Cancelled));
    }
}
