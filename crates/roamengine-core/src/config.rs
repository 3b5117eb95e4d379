//! Handler configuration and resolution
//!
//! A [`HandlerConfig`] is the transient bag of everything known about a
//! roaming object before it is usable: identity, keys, cached value, local
//! stream, sources. Resolution inspects what is available and produces the
//! matching runtime shape:
//!
//! | roaming id | roaming key | local key | outcome |
//! |---|---|---|---|
//! | absent | absent | absent | new object, built through `Repository::create` |
//! | present | absent | absent | read-only |
//! | any | present | present | modifiable |
//! | any | exactly one | | invalid, fails before any I/O |
//!
//! The shape is a tagged variant, not a type hierarchy: callers match on
//! [`Resolved`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cancel::guard;
use crate::error::{RoamError, RoamResult};
use crate::handler::{
    HandlerCore, LocalStream, ModifiableHandler, ReadOnlyHandler, RoamingValue,
};
use crate::keys::NamedKey;
use crate::names::NameService;
use crate::resolver::EventStreamResolver;
use crate::store::{ContentStore, ContentStoreExt};
use crate::stream::{EventStream, EventStreamEntry};
use crate::types::{Cid, RoamingId};

/// A resolved handler shared between the repository cache and callers.
///
/// During resolution of mutually-referencing objects the instance may be
/// handed out while its own replay is still running; hold the reference
/// and lock it later rather than locking from inside an apply callback.
pub type SharedHandler<V> = Arc<Mutex<Resolved<V>>>;

/// Runtime shape of a resolved roaming object.
pub enum Resolved<V: RoamingValue> {
    /// Value only; no write keys, no local stream
    ReadOnly(ReadOnlyHandler<V>),
    /// Value plus this device's local stream and write keys
    Modifiable(ModifiableHandler<V>),
}

impl<V: RoamingValue + std::fmt::Debug> std::fmt::Debug for Resolved<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Resolved::ReadOnly(_) => "ReadOnly",
            Resolved::Modifiable(_) => "Modifiable",
        };
        f.debug_struct("Resolved")
            .field("variant", &variant)
            .field("handler_id", self.handler_id())
            .field("value", self.value())
            .finish()
    }
}

impl<V: RoamingValue> Resolved<V> {
    /// Shared handler state
    pub fn core(&self) -> &HandlerCore<V> {
        match self {
            Resolved::ReadOnly(h) => h.core(),
            Resolved::Modifiable(h) => h.core(),
        }
    }

    fn core_mut(&mut self) -> &mut HandlerCore<V> {
        match self {
            Resolved::ReadOnly(h) => &mut h.core,
            Resolved::Modifiable(h) => &mut h.core,
        }
    }

    /// The roaming object's identity
    pub fn handler_id(&self) -> &RoamingId {
        self.core().handler_id()
    }

    /// The converged application value
    pub fn value(&self) -> &V {
        self.core().value()
    }

    /// Last replayed entry
    pub fn position(&self) -> Option<&EventStreamEntry> {
        self.core().position()
    }

    /// Live source set
    pub fn sources(&self) -> &BTreeSet<Cid> {
        self.core().sources()
    }

    /// Whether this shape holds write keys
    pub fn is_modifiable(&self) -> bool {
        matches!(self, Resolved::Modifiable(_))
    }

    /// Writable view, if this shape has one
    pub fn as_modifiable(&mut self) -> Option<&mut ModifiableHandler<V>> {
        match self {
            Resolved::Modifiable(h) => Some(h),
            Resolved::ReadOnly(_) => None,
        }
    }

    /// Replay one entry (see [`HandlerCore::advance_event_stream`])
    pub async fn advance_event_stream(
        &mut self,
        entry: &EventStreamEntry,
        cancel: &CancellationToken,
    ) -> RoamResult<()> {
        self.core_mut().advance_event_stream(entry, cancel).await
    }
}

/// Memoized handler instances keyed by roaming id.
///
/// Owned by a repository; a hit short-circuits resolution entirely, which
/// is what lets mutually-referencing objects resolve without recursing
/// forever.
pub struct InstanceCache<V: RoamingValue> {
    inner: SyncMutex<HashMap<RoamingId, SharedHandler<V>>>,
}

impl<V: RoamingValue> InstanceCache<V> {
    /// Create an empty cache
    pub fn new() -> Self {
        Self {
            inner: SyncMutex::new(HashMap::new()),
        }
    }

    /// Look up a cached instance
    pub fn get(&self, id: &RoamingId) -> Option<SharedHandler<V>> {
        self.inner.lock().get(id).cloned()
    }

    /// Register an instance
    pub fn insert(&self, id: RoamingId, handler: SharedHandler<V>) {
        self.inner.lock().insert(id, handler);
    }

    /// Drop an instance
    pub fn remove(&self, id: &RoamingId) {
        self.inner.lock().remove(id);
    }

    /// Number of cached instances
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl<V: RoamingValue> Default for InstanceCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything known about a roaming object before resolution.
pub struct HandlerConfig<V: RoamingValue> {
    /// Roaming identity; derived from the roaming key when absent
    pub roaming_id: Option<RoamingId>,
    /// Converged value, when already known (seeds the first resolution)
    pub roaming_value: Option<V>,
    /// Key the value is published under; paired with `local_key`
    pub roaming_key: Option<NamedKey>,
    /// Key this device's stream is published under; paired with `roaming_key`
    pub local_key: Option<NamedKey>,
    /// This device's stream, when already known
    pub local_value: Option<EventStream>,
    /// Entries from the last crawl, memoized after resolution
    pub resolved_entries: Option<Vec<EventStreamEntry>>,
    /// Seed sources merged with the value's last-known set
    pub sources: BTreeSet<Cid>,
}

impl<V: RoamingValue> Default for HandlerConfig<V> {
    fn default() -> Self {
        Self {
            roaming_id: None,
            roaming_value: None,
            roaming_key: None,
            local_key: None,
            local_value: None,
            resolved_entries: None,
            sources: BTreeSet::new(),
        }
    }
}

impl<V: RoamingValue> HandlerConfig<V> {
    /// Config for a read-only view of a known identity
    pub fn read_only(roaming_id: RoamingId) -> Self {
        Self {
            roaming_id: Some(roaming_id),
            ..Self::default()
        }
    }

    /// Config for a modifiable view backed by a key pair
    pub fn modifiable(roaming_key: NamedKey, local_key: NamedKey) -> Self {
        Self {
            roaming_id: Some(RoamingId::new(roaming_key.id.clone())),
            roaming_key: Some(roaming_key),
            local_key: Some(local_key),
            ..Self::default()
        }
    }

    /// Resolve this config into a runtime handler.
    ///
    /// Key pairing is validated before any collaborator I/O. A cache hit
    /// returns the memoized instance untouched. The modifiable path crawls
    /// the combined sources and replays every emitted entry with
    /// `timestamp_utc` not after now.
    pub async fn resolve(
        &mut self,
        store: &Arc<dyn ContentStore>,
        names: &Arc<dyn NameService>,
        cache: Option<&InstanceCache<V>>,
        cancel: &CancellationToken,
    ) -> RoamResult<SharedHandler<V>> {
        // Fail fast on a half-configured key pair
        let key_pair = match (&self.roaming_key, &self.local_key) {
            (Some(roaming), Some(local)) => Some((roaming.clone(), local.clone())),
            (None, None) => None,
            (Some(_), None) => {
                return Err(RoamError::Configuration(
                    "roaming key present without a local key".to_string(),
                ))
            }
            (None, Some(_)) => {
                return Err(RoamError::Configuration(
                    "local key present without a roaming key".to_string(),
                ))
            }
        };

        let handler_id = match (&self.roaming_id, &key_pair) {
            (Some(id), _) => id.clone(),
            (None, Some((roaming, _))) => RoamingId::new(roaming.id.clone()),
            (None, None) => {
                return Err(RoamError::Configuration(
                    "config names no roaming identity; new objects are created \
                     through a repository with an explicit initial value"
                        .to_string(),
                ))
            }
        };

        if let Some(cache) = cache {
            if let Some(shared) = cache.get(&handler_id) {
                debug!(handler = %handler_id, "Instance cache hit");
                return Ok(shared);
            }
        }

        // Converged value: seed from the config or resolve by identity
        let value: V = match self.roaming_value.take() {
            Some(value) => value,
            None => {
                let cid =
                    guard(cancel, names.resolve(handler_id.as_str(), true, false)).await?;
                guard(cancel, store.get_value(&cid, false)).await?
            }
        };

        let Some((roaming_key, local_key)) = key_pair else {
            // Read-only: never attempt local resolution
            let mut sources = self.sources.clone();
            sources.extend(value.sources().iter().copied());
            let core = HandlerCore::new(
                handler_id.clone(),
                value,
                sources,
                store.clone(),
                names.clone(),
            );
            let shared: SharedHandler<V> =
                Arc::new(Mutex::new(Resolved::ReadOnly(ReadOnlyHandler::new(core))));
            if let Some(cache) = cache {
                cache.insert(handler_id.clone(), shared.clone());
            }
            debug!(handler = %handler_id, "Resolved read-only");
            return Ok(shared);
        };

        // Modifiable: local stream from the config or the name service
        let local_stream: EventStream = match self.local_value.take() {
            Some(stream) => stream,
            None => {
                let cid = guard(cancel, names.resolve(&local_key.id, true, false)).await?;
                guard(cancel, store.get_value(&cid, false)).await?
            }
        };

        let mut seeds = self.sources.clone();
        seeds.extend(value.sources().iter().copied());

        // The device's own stream is a source like any other: store its
        // current snapshot so the crawl replays our own history too
        let local_cid = guard(cancel, store.put_value(&local_stream)).await?;
        seeds.insert(local_cid);

        let resolver = EventStreamResolver::new(store.as_ref());
        let resolved = resolver.resolve(&handler_id, &seeds, cancel).await?;
        self.sources = resolved.sources.clone();
        self.resolved_entries = Some(resolved.entries.clone());

        let mut core = HandlerCore::new(
            handler_id.clone(),
            value,
            resolved.sources.clone(),
            store.clone(),
            names.clone(),
        );
        core.value_mut().set_sources(resolved.sources);

        let handler = ModifiableHandler::new(
            core,
            roaming_key,
            LocalStream {
                key: local_key,
                stream: local_stream,
            },
        );
        let shared: SharedHandler<V> = Arc::new(Mutex::new(Resolved::Modifiable(handler)));

        // Cache before replay so cyclic lookups terminate
        if let Some(cache) = cache {
            cache.insert(handler_id.clone(), shared.clone());
        }

        let now = Utc::now();
        {
            let mut locked = shared.lock().await;
            for entry in resolved.entries.iter().filter(|e| e.timestamp_utc <= now) {
                locked.advance_event_stream(entry, cancel).await?;
            }
        }
        debug!(
            handler = %handler_id,
            replayed = resolved.entries.len(),
            "Resolved modifiable"
        );
        Ok(shared)
    }
}
