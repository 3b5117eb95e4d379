//! Runtime handler state for roaming objects
//!
//! A handler is one participant's view of a roaming object: the object's
//! identity, the replay position, the live source set, and, when the
//! device holds the write keys, the device's own local stream. The
//! resolved shape (read-only or modifiable) is decided by
//! [`crate::config::HandlerConfig`]; both shapes share [`HandlerCore`].

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::guard;
use crate::error::{RoamError, RoamResult};
use crate::keys::NamedKey;
use crate::names::NameService;
use crate::store::{ContentStore, ContentStoreExt};
use crate::stream::{EventStream, EventStreamEntry, SourceRef, SOURCE_ADD, SOURCE_REMOVE};
use crate::types::{Cid, RoamingId};

/// All in-process appends serialize through this section so concurrent
/// writers cannot read the same local-stream snapshot and drop an update.
static APPEND_LOCK: Mutex<()> = Mutex::const_new(());

/// Application-defined converged state of a roaming object.
///
/// Implementations replay update payloads in the order the engine feeds
/// them and expose the last-known source set so it travels with the
/// published value.
#[async_trait]
pub trait RoamingValue: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Apply one replayed entry. `payload` is the stored content blob;
    /// implementations typically decode it with postcard.
    async fn apply_entry_update(
        &mut self,
        entry: &EventStreamEntry,
        payload: Bytes,
    ) -> RoamResult<()>;

    /// Last-known source set
    fn sources(&self) -> &BTreeSet<Cid>;

    /// Replace the last-known source set
    fn set_sources(&mut self, sources: BTreeSet<Cid>);
}

/// The device's own append-only stream together with its write key.
#[derive(Debug, Clone)]
pub struct LocalStream {
    /// Key whose identity the stream is published under
    pub key: NamedKey,
    /// In-memory stream state; visible to peers only after a publish
    pub stream: EventStream,
}

/// State shared by the read-only and modifiable handler shapes.
pub struct HandlerCore<V: RoamingValue> {
    handler_id: RoamingId,
    value: V,
    position: Option<EventStreamEntry>,
    sources: BTreeSet<Cid>,
    store: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
}

impl<V: RoamingValue> HandlerCore<V> {
    /// Assemble core state for a resolved handler
    pub fn new(
        handler_id: RoamingId,
        value: V,
        sources: BTreeSet<Cid>,
        store: Arc<dyn ContentStore>,
        names: Arc<dyn NameService>,
    ) -> Self {
        Self {
            handler_id,
            value,
            position: None,
            sources,
            store,
            names,
        }
    }

    /// The roaming object's identity
    pub fn handler_id(&self) -> &RoamingId {
        &self.handler_id
    }

    /// The converged application value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Mutable access to the application value
    pub fn value_mut(&mut self) -> &mut V {
        &mut self.value
    }

    /// Last entry fed through [`Self::advance_event_stream`]
    pub fn position(&self) -> Option<&EventStreamEntry> {
        self.position.as_ref()
    }

    /// Live source set
    pub fn sources(&self) -> &BTreeSet<Cid> {
        &self.sources
    }

    /// Replay one entry: resolve its content and, when the payload is
    /// present, apply it to the value; then advance the position.
    ///
    /// The caller feeds entries exactly once, in ascending time order;
    /// there is no internal de-duplication. A payload whose blob is gone
    /// is skipped (the position still advances); other store failures
    /// propagate.
    pub async fn advance_event_stream(
        &mut self,
        entry: &EventStreamEntry,
        cancel: &CancellationToken,
    ) -> RoamResult<()> {
        match guard(cancel, self.store.get(&entry.content, false)).await {
            Ok(payload) => {
                self.value.apply_entry_update(entry, payload).await?;
            }
            Err(RoamError::NotFound(_)) => {
                debug!(
                    handler = %self.handler_id,
                    event = %entry.event_id,
                    "Entry payload unresolvable, advancing past it"
                );
            }
            Err(e) => return Err(e),
        }
        self.position = Some(entry.clone());
        Ok(())
    }
}

/// Read-only view of a roaming object: the converged value without any
/// write keys. Never touches local state.
pub struct ReadOnlyHandler<V: RoamingValue> {
    pub(crate) core: HandlerCore<V>,
}

impl<V: RoamingValue> ReadOnlyHandler<V> {
    pub(crate) fn new(core: HandlerCore<V>) -> Self {
        Self { core }
    }

    /// Shared handler state
    pub fn core(&self) -> &HandlerCore<V> {
        &self.core
    }
}

/// Writable view of a roaming object: the converged value plus this
/// device's local stream and both write keys.
pub struct ModifiableHandler<V: RoamingValue> {
    pub(crate) core: HandlerCore<V>,
    roaming_key: NamedKey,
    local: LocalStream,
}

impl<V: RoamingValue> ModifiableHandler<V> {
    pub(crate) fn new(core: HandlerCore<V>, roaming_key: NamedKey, local: LocalStream) -> Self {
        Self {
            core,
            roaming_key,
            local,
        }
    }

    /// Shared handler state
    pub fn core(&self) -> &HandlerCore<V> {
        &self.core
    }

    /// Key the converged value is published under
    pub fn roaming_key(&self) -> &NamedKey {
        &self.roaming_key
    }

    /// This device's local stream
    pub fn local(&self) -> &LocalStream {
        &self.local
    }

    /// Content-address a payload and append a new entry to the in-memory
    /// local stream. Does not publish.
    ///
    /// `timestamp_utc` defaults to now. All store writes complete before
    /// the stream mutates, so cancellation never leaves a partial append.
    pub async fn append_new_entry<P>(
        &mut self,
        target_id: &RoamingId,
        event_id: &str,
        payload: &P,
        timestamp_utc: Option<DateTime<Utc>>,
        cancel: &CancellationToken,
    ) -> RoamResult<EventStreamEntry>
    where
        P: Serialize + Sync,
    {
        let _append = guard(cancel, async {
            Ok::<_, RoamError>(APPEND_LOCK.lock().await)
        })
        .await?;

        let content = guard(cancel, self.core.store.put_value(payload)).await?;
        let entry = EventStreamEntry {
            target_id: target_id.clone(),
            event_id: event_id.to_string(),
            timestamp_utc: timestamp_utc.unwrap_or_else(Utc::now),
            content,
        };
        let entry_cid = guard(cancel, self.core.store.put_value(&entry)).await?;

        self.local.stream.append(entry_cid);
        debug!(
            handler = %self.core.handler_id,
            event = %entry.event_id,
            entry = %entry_cid,
            "Appended entry to local stream"
        );
        Ok(entry)
    }

    /// Append a `source.add` control entry for `source` and register it in
    /// the live source set
    pub async fn append_source_add(
        &mut self,
        source: Cid,
        cancel: &CancellationToken,
    ) -> RoamResult<EventStreamEntry> {
        let target = self.core.handler_id.clone();
        let entry = self
            .append_new_entry(&target, SOURCE_ADD, &SourceRef { stream: source }, None, cancel)
            .await?;
        self.core.sources.insert(source);
        let sources = self.core.sources.clone();
        self.core.value.set_sources(sources);
        Ok(entry)
    }

    /// Append a `source.remove` control entry for `source` and drop it
    /// from the live source set
    pub async fn append_source_remove(
        &mut self,
        source: Cid,
        cancel: &CancellationToken,
    ) -> RoamResult<EventStreamEntry> {
        let target = self.core.handler_id.clone();
        let entry = self
            .append_new_entry(&target, SOURCE_REMOVE, &SourceRef { stream: source }, None, cancel)
            .await?;
        self.core.sources.remove(&source);
        let sources = self.core.sources.clone();
        self.core.value.set_sources(sources);
        Ok(entry)
    }

    /// Store the current local stream and publish its Cid under the local
    /// key. Peers see the stream only after this returns `Ok`.
    pub async fn publish_local(
        &self,
        lifetime: Duration,
        cancel: &CancellationToken,
    ) -> RoamResult<Cid> {
        let cid = guard(cancel, self.core.store.put_value(&self.local.stream)).await?;
        guard(
            cancel,
            self.core.names.publish(&cid, &self.local.key.name, lifetime),
        )
        .await?;
        debug!(handler = %self.core.handler_id, %cid, "Published local stream");
        Ok(cid)
    }

    /// Store the current roaming value and publish its Cid under the
    /// roaming key
    pub async fn publish_roaming(
        &self,
        lifetime: Duration,
        cancel: &CancellationToken,
    ) -> RoamResult<Cid> {
        let cid = guard(cancel, self.core.store.put_value(&self.core.value)).await?;
        guard(
            cancel,
            self.core.names.publish(&cid, &self.roaming_key.name, lifetime),
        )
        .await?;
        debug!(handler = %self.core.handler_id, %cid, "Published roaming value");
        Ok(cid)
    }
}

/// Apply one entry to several interested handler instances.
///
/// The advances run concurrently with no ordering guarantee relative to
/// each other; each handler applies the entry at most once (an instance
/// already positioned on the entry is skipped). The first failure is
/// returned after all advances settle.
pub async fn advance_fan_out<V: RoamingValue>(
    handlers: &[crate::config::SharedHandler<V>],
    entry: &EventStreamEntry,
    cancel: &CancellationToken,
) -> RoamResult<()> {
    let results = futures::future::join_all(handlers.iter().map(|shared| async move {
        let mut handler = shared.lock().await;
        if handler.position() == Some(entry) {
            debug!(handler = %handler.handler_id(), "Entry already applied, skipping");
            return Ok(());
        }
        handler.advance_event_stream(entry, cancel).await
    }))
    .await;
    for result in results {
        result?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyAlgorithm, KeyService};
    use crate::memory::{MemoryContentStore, MemoryKeyService, MemoryNameService};
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Notebook {
        fields: BTreeMap<String, String>,
        sources: BTreeSet<Cid>,
    }

    impl Notebook {
        fn new() -> Self {
            Self {
                fields: BTreeMap::new(),
                sources: BTreeSet::new(),
            }
        }
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
            Ok(())
        }

        fn sources(&self) -> &BTreeSet<Cid> {
            &self.sources
        }

        fn set_sources(&mut self, sources: BTreeSet<Cid>) {
            self.sources = sources;
        }
    }

    async fn make_handler(name: &str) -> (ModifiableHandler<Notebook>, Arc<MemoryContentStore>) {
        let store = Arc::new(MemoryContentStore::new());
        let keys = Arc::new(MemoryKeyService::new());
        let names: Arc<dyn NameService> = Arc::new(MemoryNameService::new(keys.clone()));

        let roaming_key = keys
            .create(&format!("{}/roaming", name), KeyAlgorithm::Ed25519, 0)
            .await
            .unwrap();
        let local_key = keys
            .create(&format!("{}/local", name), KeyAlgorithm::Ed25519, 0)
            .await
            .unwrap();

        let core = HandlerCore::new(
            RoamingId::new(roaming_key.id.clone()),
            Notebook::new(),
            BTreeSet::new(),
            store.clone() as Arc<dyn ContentStore>,
            names,
        );
        let local = LocalStream {
            key: local_key.clone(),
            stream: EventStream::new(local_key.name),
        };
        (ModifiableHandler::new(core, roaming_key, local), store)
    }

    #[tokio::test]
    async fn test_append_builds_stream_in_order() {
        let (mut handler, store) = make_handler("nb").await;
        let cancel = CancellationToken::new();
        let target = handler.core().handler_id().clone();

        let first = handler
            .append_new_entry(&target, "Title", &"one".to_string(), None, &cancel)
            .await
            .unwrap();
        handler
            .append_new_entry(&target, "Body", &"two".to_string(), None, &cancel)
            .await
            .unwrap();

        assert_eq!(handler.local().stream.len(), 2);
        let first_cid = handler.local().stream.entries[0];
        let loaded: EventStreamEntry = store.get_value(&first_cid, false).await.unwrap();
        assert_eq!(loaded, first);
    }

    #[tokio::test]
    async fn test_append_defaults_timestamp_to_now() {
        let (mut handler, _) = make_handler("nb").await;
        let cancel = CancellationToken::new();
        let target = handler.core().handler_id().clone();

        let before = Utc::now();
        let entry = handler
            .append_new_entry(&target, "Title", &"x".to_string(), None, &cancel)
            .await
            .unwrap();
        assert!(entry.timestamp_utc >= before);
        assert!(entry.timestamp_utc <= Utc::now());
    }

    #[tokio::test]
    async fn test_cancelled_append_leaves_stream_untouched() {
        let (mut handler, _) = make_handler("nb").await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let target = handler.core().handler_id().clone();

        let err = handler
            .append_new_entry(&target, "Title", &"x".to_string(), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RoamError::Cancelled));
        assert!(handler.local().stream.is_empty());
    }

    #[tokio::test]
    async fn test_advance_applies_payload_and_moves_position() {
        let (mut handler, store) = make_handler("nb").await;
        let cancel = CancellationToken::new();

        let content = store.put_value(&"renamed".to_string()).await.unwrap();
        let entry = EventStreamEntry {
            target_id: handler.core().handler_id().clone(),
            event_id: "Rename".to_string(),
            timestamp_utc: Utc::now(),
            content,
        };

        handler.core.advance_event_stream(&entry, &cancel).await.unwrap();
        assert_eq!(
            handler.core().value().fields.get("Rename"),
            Some(&"renamed".to_string())
        );
        assert_eq!(handler.core().position(), Some(&entry));
    }

    #[tokio::test]
    async fn test_advance_skips_missing_payload_but_advances() {
        let (mut handler, _) = make_handler("nb").await;
        let cancel = CancellationToken::new();

        let entry = EventStreamEntry {
            target_id: handler.core().handler_id().clone(),
            event_id: "Rename".to_string(),
            timestamp_utc: Utc::now(),
            content: Cid::from_content(b"missing"),
        };

        handler.core.advance_event_stream(&entry, &cancel).await.unwrap();
        assert!(handler.core().value().fields.is_empty());
        assert_eq!(handler.core().position(), Some(&entry));
    }

    #[tokio::test]
    async fn test_source_add_remove_track_live_set() {
        let (mut handler, _) = make_handler("nb").await;
        let cancel = CancellationToken::new();
        let source = Cid::from_content(b"other stream");

        handler.append_source_add(source, &cancel).await.unwrap();
        assert!(handler.core().sources().contains(&source));
        assert!(handler.core().value().sources().contains(&source));

        handler.append_source_remove(source, &cancel).await.unwrap();
        assert!(!handler.core().sources().contains(&source));
        assert_eq!(handler.local().stream.len(), 2);
    }

    #[tokio::test]
    async fn test_publish_local_then_resolve() {
        let (mut handler, store) = make_handler("nb").await;
        let cancel = CancellationToken::new();
        let target = handler.core().handler_id().clone();

        handler
            .append_new_entry(&target, "Title", &"x".to_string(), None, &cancel)
            .await
            .unwrap();
        let cid = handler
            .publish_local(Duration::from_secs(60), &cancel)
            .await
            .unwrap();

        let loaded: EventStream = store.get_value(&cid, false).await.unwrap();
        assert_eq!(loaded, handler.local().stream);
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let (handler, _) = make_handler("nb").await;
        let handler = Arc::new(Mutex::new(handler));
        let cancel = CancellationToken::new();

        let mut tasks = Vec::new();
        for i in 0..8 {
            let handler = handler.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                let mut h = handler.lock().await;
                let target = h.core().handler_id().clone();
                h.append_new_entry(
                    &target,
                    &format!("Event{}", i),
                    &i.to_string(),
                    None,
                    &cancel,
                )
                .await
                .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(handler.lock().await.local().stream.len(), 8);
    }
}
