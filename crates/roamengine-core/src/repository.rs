//! Repository: lifecycle for root roaming objects
//!
//! A repository owns the managed key pairs and configs of this node's own
//! root objects, plus the instance cache that hands every caller the same
//! shared handler per roaming id. Create/get/delete go through here;
//! non-root objects resolve through ephemeral configs assembled from the
//! key service.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cancel::guard;
use crate::config::{HandlerConfig, InstanceCache, SharedHandler};
use crate::error::{RoamError, RoamResult};
use crate::handler::RoamingValue;
use crate::keys::{KeyAlgorithm, KeyService};
use crate::names::NameService;
use crate::store::ContentStore;
use crate::stream::EventStream;
use crate::types::RoamingId;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Suffix of the key a roaming value is published under
pub const ROAMING_KEY_SUFFIX: &str = "/roaming";

/// Suffix of the key a device's local stream is published under
pub const LOCAL_KEY_SUFFIX: &str = "/local";

/// Derive the roaming key name for a base object name
pub fn roaming_key_name(base: &str) -> String {
    format!("{}{}", base, ROAMING_KEY_SUFFIX)
}

/// Derive the local key name for a base object name
pub fn local_key_name(base: &str) -> String {
    format!("{}{}", base, LOCAL_KEY_SUFFIX)
}

/// Given a roaming key name, derive the partner local key name
pub(crate) fn partner_local_key_name(roaming_name: &str) -> Option<String> {
    roaming_name
        .strip_suffix(ROAMING_KEY_SUFFIX)
        .map(local_key_name)
}

/// Change notification for the managed set.
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    /// Root objects were created
    ItemsAdded(Vec<RoamingId>),
    /// Root objects were deleted
    ItemsRemoved(Vec<RoamingId>),
}

/// Create/get/delete surface for root roaming objects.
pub struct Repository<V: RoamingValue> {
    store: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
    keys: Arc<dyn KeyService>,
    managed: SyncMutex<HashMap<RoamingId, HandlerConfig<V>>>,
    cache: InstanceCache<V>,
    event_tx: broadcast::Sender<RepositoryEvent>,
}

impl<V: RoamingValue> Repository<V> {
    /// Create a repository over the given collaborators
    pub fn new(
        store: Arc<dyn ContentStore>,
        names: Arc<dyn NameService>,
        keys: Arc<dyn KeyService>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            names,
            keys,
            managed: SyncMutex::new(HashMap::new()),
            cache: InstanceCache::new(),
            event_tx,
        }
    }

    /// Subscribe to managed-set change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.event_tx.subscribe()
    }

    /// The instance cache handlers are memoized in
    pub fn cache(&self) -> &InstanceCache<V> {
        &self.cache
    }

    /// Create a root object named `base`, seeded with the caller's initial
    /// value.
    ///
    /// Key names derive from `base`. When a managed config with both key
    /// names already exists the call is idempotent: the existing object is
    /// resolved and returned, no keys are generated and no notification
    /// fires. Otherwise a fresh roaming/local pair is generated, an empty
    /// local stream and `initial` seed the config, and `ItemsAdded` fires
    /// exactly once.
    pub async fn create(
        &self,
        base: &str,
        initial: V,
        cancel: &CancellationToken,
    ) -> RoamResult<SharedHandler<V>> {
        let roaming_name = roaming_key_name(base);
        let local_name = local_key_name(base);

        let existing = self.managed.lock().iter().find_map(|(id, config)| {
            let matches = config
                .roaming_key
                .as_ref()
                .is_some_and(|k| k.name == roaming_name)
                && config.local_key.as_ref().is_some_and(|k| k.name == local_name);
            matches.then(|| id.clone())
        });
        if let Some(id) = existing {
            debug!(%id, base, "Reusing managed config");
            return self.resolve_managed(&id, cancel).await;
        }

        let roaming_key = guard(
            cancel,
            self.keys.create(&roaming_name, KeyAlgorithm::Ed25519, 0),
        )
        .await?;
        let local_key = guard(
            cancel,
            self.keys.create(&local_name, KeyAlgorithm::Ed25519, 0),
        )
        .await?;
        let id = RoamingId::new(roaming_key.id.clone());

        let mut config = HandlerConfig::modifiable(roaming_key, local_key);
        config.roaming_value = Some(initial);
        config.local_value = Some(EventStream::new(&local_name));
        self.managed.lock().insert(id.clone(), config);

        let handler = self.resolve_managed(&id, cancel).await?;
        info!(%id, base, "Created root object");
        let _ = self
            .event_tx
            .send(RepositoryEvent::ItemsAdded(vec![id]));
        Ok(handler)
    }

    /// Resolve an object by roaming id.
    ///
    /// Checks the instance cache, then the managed configs, then assembles
    /// an ephemeral config from the key service: both keys found means
    /// modifiable, no keys means read-only, and a half-present pair
    /// surfaces the configuration error from resolution.
    pub async fn get(
        &self,
        id: &RoamingId,
        cancel: &CancellationToken,
    ) -> RoamResult<SharedHandler<V>> {
        if let Some(shared) = self.cache.get(id) {
            return Ok(shared);
        }
        if self.managed.lock().contains_key(id) {
            return self.resolve_managed(id, cancel).await;
        }

        let known = guard(cancel, self.keys.list()).await?;
        let roaming_key = known.iter().find(|k| k.id == id.as_str()).cloned();
        let mut config = match roaming_key {
            Some(roaming) => {
                let local = partner_local_key_name(&roaming.name)
                    .and_then(|name| known.iter().find(|k| k.name == name).cloned());
                HandlerConfig {
                    roaming_id: Some(id.clone()),
                    roaming_key: Some(roaming),
                    local_key: local,
                    ..HandlerConfig::default()
                }
            }
            None => HandlerConfig::read_only(id.clone()),
        };
        debug!(%id, "Resolving through ephemeral config");
        config
            .resolve(&self.store, &self.names, Some(&self.cache), cancel)
            .await
    }

    /// Delete a managed root object, removing both of its keys.
    pub async fn delete(&self, id: &RoamingId, cancel: &CancellationToken) -> RoamResult<()> {
        let config = self
            .managed
            .lock()
            .remove(id)
            .ok_or_else(|| RoamError::NotFound(format!("{} is not a managed object", id)))?;

        let result: RoamResult<()> = async {
            if let Some(roaming) = &config.roaming_key {
                guard(cancel, self.keys.remove(&roaming.name)).await?;
            }
            if let Some(local) = &config.local_key {
                guard(cancel, self.keys.remove(&local.name)).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            self.managed.lock().insert(id.clone(), config);
            return Err(e);
        }

        self.cache.remove(id);
        info!(%id, "Deleted root object");
        let _ = self
            .event_tx
            .send(RepositoryEvent::ItemsRemoved(vec![id.clone()]));
        Ok(())
    }

    /// Ids of this node's own managed root objects (never arbitrary
    /// resolvable ids)
    pub fn get_all(&self) -> Vec<RoamingId> {
        let mut ids: Vec<RoamingId> = self.managed.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolve a managed config, keeping its memoized state in the map
    async fn resolve_managed(
        &self,
        id: &RoamingId,
        cancel: &CancellationToken,
    ) -> RoamResult<SharedHandler<V>> {
        let mut config = self
            .managed
            .lock()
            .remove(id)
            .ok_or_else(|| RoamError::NotFound(format!("{} is not a managed object", id)))?;
        let result = config
            .resolve(&self.store, &self.names, Some(&self.cache), cancel)
            .await;
        self.managed.lock().insert(id.clone(), config);
        result
    }
}
