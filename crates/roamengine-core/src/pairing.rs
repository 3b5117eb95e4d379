//! Pairing: bootstrapping a new device into a roaming identity
//!
//! Two peers meet in a pub/sub room: the device that already owns the
//! object ("device") and the one being introduced ("joiner"). The exchange
//! runs two sequential phases with mirrored roles:
//!
//! 1. **Roaming key**: the device exports its roaming key material; the
//!    joiner imports it, resolves the value currently published under the
//!    original identity, and republishes that value under the imported key,
//!    becoming a co-publisher.
//! 2. **Local source**: the joiner creates its own local key and empty
//!    stream, publishes the stream, and announces its Cid; the device
//!    appends a `source.add` entry for it to its own local stream and
//!    republishes.
//!
//! Phase 2 never starts before phase 1 completed: the joiner's stream is
//! labeled and keyed off the identity learned in phase 1.
//!
//! Within each phase the receiver disables its heartbeat, listens, and
//! waits for the sender's join; the sender waits for the receiver's join
//! and publishes its payload exactly once. Both endpoints subscribe at
//! exchange start so a payload sent the moment presence is observed is
//! never dropped.
//!
//! Payloads carry exportable private key material; the room implementation
//! is expected to encrypt at the transport layer. A transport-level error
//! message aborts the exchange; cancellation removes any key registered
//! during the aborted run.

use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel::guard;
use crate::config::SharedHandler;
use crate::error::{RoamError, RoamResult};
use crate::handler::RoamingValue;
use crate::keys::{KeyAlgorithm, KeyService, NamedKey};
use crate::names::{NameService, DEFAULT_PUBLISH_LIFETIME};
use crate::repository::{local_key_name, partner_local_key_name};
use crate::room::{PubSubRoom, RoomMessage};
use crate::store::{ContentStore, ContentStoreExt};
use crate::stream::EventStream;
use crate::types::{Cid, RoamingId};

/// Wire version of the pairing payloads
pub const PAIRING_VERSION: u8 = 1;

/// Messages exchanged through the room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PairingPayload {
    /// Phase 1: exported roaming key material
    RoamingKey {
        /// Protocol version
        version: u8,
        /// Identity the key publishes under
        roaming_id: String,
        /// Key material as produced by `KeyService::export`
        key_material: Vec<u8>,
    },
    /// Phase 2: the joiner's freshly published local stream
    LocalSource {
        /// Protocol version
        version: u8,
        /// Identity the stream belongs to
        roaming_id: String,
        /// Cid of the joiner's local stream
        stream: Cid,
    },
    /// Transport-reported failure; fatal for the exchange
    Error {
        /// Human-readable reason
        message: String,
    },
}

impl PairingPayload {
    /// Encode for the wire
    pub fn encode(&self) -> RoamResult<Bytes> {
        let bytes = postcard::to_stdvec(self)
            .map_err(|e| RoamError::Serialization(format!("Failed to encode payload: {}", e)))?;
        Ok(Bytes::from(bytes))
    }

    /// Decode from the wire; anything undecodable is a protocol error
    pub fn decode(bytes: &[u8]) -> RoamResult<Self> {
        postcard::from_bytes(bytes)
            .map_err(|e| RoamError::Protocol(format!("undecodable pairing message: {}", e)))
    }
}

/// What the joiner holds after a completed exchange.
#[derive(Debug, Clone)]
pub struct PairingOutcome {
    /// Identity of the joined roaming object
    pub roaming_id: RoamingId,
    /// Imported roaming key; publishes under the original identity
    pub roaming_key: NamedKey,
    /// Freshly generated local key
    pub local_key: NamedKey,
    /// Cid of the published (empty) local stream
    pub local_stream: Cid,
}

/// Two-party key exchange over a pub/sub room.
pub struct KeyExchange<'a> {
    room: &'a dyn PubSubRoom,
    store: Arc<dyn ContentStore>,
    names: Arc<dyn NameService>,
    keys: Arc<dyn KeyService>,
}

impl<'a> KeyExchange<'a> {
    /// Create an exchange endpoint over the given room and collaborators
    pub fn new(
        room: &'a dyn PubSubRoom,
        store: Arc<dyn ContentStore>,
        names: Arc<dyn NameService>,
        keys: Arc<dyn KeyService>,
    ) -> Self {
        Self {
            room,
            store,
            names,
            keys,
        }
    }

    /// Run the exchange as the device that already owns the object.
    ///
    /// Sends the roaming key in phase 1, receives the joiner's stream Cid
    /// in phase 2, registers it as a source and republishes the local
    /// stream. Returns the joiner's stream Cid.
    pub async fn offer<V: RoamingValue>(
        &self,
        handler: &SharedHandler<V>,
        cancel: &CancellationToken,
    ) -> RoamResult<Cid> {
        let (roaming_key, roaming_id) = {
            let mut locked = handler.lock().await;
            let id = locked.handler_id().clone();
            let modifiable = locked.as_modifiable().ok_or_else(|| {
                RoamError::Configuration("pairing requires a modifiable handler".to_string())
            })?;
            (modifiable.roaming_key().clone(), id)
        };

        // Subscribe up front so the phase-2 payload can never be lost
        let mut rx = self.room.subscribe();
        let me = self.room.peer_id().to_string();

        // Phase 1: roaming key, this endpoint sending
        self.room.set_heartbeat_enabled(true);
        let joiner = self
            .room
            .wait_for_join(&|p: &str| p != me, cancel)
            .await?;
        debug!(peer = %joiner, "Joiner present, sending roaming key");

        let key_material = guard(cancel, self.keys.export(&roaming_key.name)).await?;
        let payload = PairingPayload::RoamingKey {
            version: PAIRING_VERSION,
            roaming_id: roaming_id.as_str().to_string(),
            key_material,
        };
        guard(cancel, self.room.publish(payload.encode()?)).await?;
        info!(%roaming_id, "Sent roaming key material");

        // Phase 2: local source, this endpoint receiving
        self.room.set_heartbeat_enabled(false);
        self.room
            .wait_for_join(&|p: &str| p != me, cancel)
            .await?;
        self.room.set_heartbeat_enabled(true);

        let stream = match self.recv_payload(&mut rx, cancel).await? {
            PairingPayload::LocalSource {
                version,
                roaming_id: announced,
                stream,
            } => {
                if version != PAIRING_VERSION {
                    return Err(RoamError::Protocol(format!(
                        "unsupported pairing version {}",
                        version
                    )));
                }
                if announced != roaming_id.as_str() {
                    return Err(RoamError::Protocol(format!(
                        "local source announced for foreign identity {}",
                        announced
                    )));
                }
                stream
            }
            _ => {
                return Err(RoamError::Protocol(
                    "expected a local source announcement".to_string(),
                ))
            }
        };

        {
            let mut locked = handler.lock().await;
            let modifiable = locked.as_modifiable().ok_or_else(|| {
                RoamError::Configuration("pairing requires a modifiable handler".to_string())
            })?;
            modifiable.append_source_add(stream, cancel).await?;
            modifiable
                .publish_local(DEFAULT_PUBLISH_LIFETIME, cancel)
                .await?;
        }
        info!(source = %stream, "Registered joiner as local source");
        Ok(stream)
    }

    /// Run the exchange as the joining device.
    ///
    /// Receives and imports the roaming key in phase 1, becomes a
    /// co-publisher of the current value, then creates and announces its
    /// own local stream in phase 2.
    ///
    /// Cancellation at any wait point removes the keys registered during
    /// the aborted run, leaving no partial registration.
    pub async fn join(&self, cancel: &CancellationToken) -> RoamResult<PairingOutcome> {
        let mut created: Vec<String> = Vec::new();
        match self.join_inner(&mut created, cancel).await {
            Ok(outcome) => Ok(outcome),
            Err(RoamError::Cancelled) => {
                for name in created {
                    if let Err(e) = self.keys.remove(&name).await {
                        warn!(key = %name, error = %e, "Cleanup of aborted pairing failed");
                    }
                }
                Err(RoamError::Cancelled)
            }
            Err(e) => Err(e),
        }
    }

    async fn join_inner(
        &self,
        created: &mut Vec<String>,
        cancel: &CancellationToken,
    ) -> RoamResult<PairingOutcome> {
        // Phase 1: roaming key, this endpoint receiving
        self.room.set_heartbeat_enabled(false);
        let mut rx = self.room.subscribe();
        let me = self.room.peer_id().to_string();

        let device = self
            .room
            .wait_for_join(&|p: &str| p != me, cancel)
            .await?;
        debug!(peer = %device, "Device present, announcing ourselves");
        self.room.set_heartbeat_enabled(true);

        let (roaming_id, key_material) = match self.recv_payload(&mut rx, cancel).await? {
            PairingPayload::RoamingKey {
                version,
                roaming_id,
                key_material,
            } => {
                if version != PAIRING_VERSION {
                    return Err(RoamError::Protocol(format!(
                        "unsupported pairing version {}",
                        version
                    )));
                }
                (RoamingId::new(roaming_id), key_material)
            }
            _ => {
                return Err(RoamError::Protocol(
                    "expected roaming key material".to_string(),
                ))
            }
        };

        let roaming_key = guard(cancel, self.keys.import(&key_material)).await?;
        created.push(roaming_key.name.clone());
        if roaming_key.id != roaming_id.as_str() {
            return Err(RoamError::Protocol(
                "imported key does not match the announced identity".to_string(),
            ));
        }

        // Become a co-publisher: fetch the value currently published under
        // the original identity and republish it under the imported key
        let value_cid = guard(
            cancel,
            self.names.resolve(roaming_id.as_str(), true, true),
        )
        .await?;
        guard(cancel, self.store.get(&value_cid, false)).await?;
        guard(
            cancel,
            self.names
                .publish(&value_cid, &roaming_key.name, DEFAULT_PUBLISH_LIFETIME),
        )
        .await?;
        info!(%roaming_id, "Imported roaming key and republished value");

        // Phase 2: local source, this endpoint sending
        let local_name = partner_local_key_name(&roaming_key.name)
            .unwrap_or_else(|| local_key_name(&roaming_key.name));
        let local_key = guard(
            cancel,
            self.keys.create(&local_name, KeyAlgorithm::Ed25519, 0),
        )
        .await?;
        created.push(local_key.name.clone());

        let stream = EventStream::new(&local_name);
        let local_stream = guard(cancel, self.store.put_value(&stream)).await?;
        guard(
            cancel,
            self.names
                .publish(&local_stream, &local_name, DEFAULT_PUBLISH_LIFETIME),
        )
        .await?;

        let device = self
            .room
            .wait_for_join(&|p: &str| p != me, cancel)
            .await?;
        debug!(peer = %device, "Device ready, announcing local stream");
        let payload = PairingPayload::LocalSource {
            version: PAIRING_VERSION,
            roaming_id: roaming_id.as_str().to_string(),
            stream: local_stream,
        };
        guard(cancel, self.room.publish(payload.encode()?)).await?;
        info!(stream = %local_stream, "Announced local stream");

        Ok(PairingOutcome {
            roaming_id,
            roaming_key,
            local_key,
            local_stream,
        })
    }

    /// Receive the next peer payload, surfacing in-band errors as fatal
    async fn recv_payload(
        &self,
        rx: &mut broadcast::Receiver<RoomMessage>,
        cancel: &CancellationToken,
    ) -> RoamResult<PairingPayload> {
        let me = self.room.peer_id().to_string();
        loop {
            let msg = guard(cancel, async {
                loop {
                    match rx.recv().await {
                        Ok(msg) => return Ok(msg),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Lagged behind on room messages");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(RoamError::Room("room channel closed".to_string()));
                        }
                    }
                }
            })
            .await?;

            if msg.sender == me {
                continue;
            }
            let payload = PairingPayload::decode(&msg.data)?;
            if let PairingPayload::Error { message } = payload {
                return Err(RoamError::Protocol(message));
            }
            return Ok(payload);
        }
    }
}
