//! In-memory pub/sub room
//!
//! A hub connects any number of endpoints in-process. Presence follows the
//! heartbeat flag: enabling the heartbeat makes the peer observable to
//! `wait_for_join`, disabling it withdraws presence. Delivery is
//! best-effort broadcast, matching the transport contract the pairing
//! protocol assumes.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::RngCore;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel::guard;
use crate::error::{RoamError, RoamResult};
use crate::room::{JoinPredicate, PubSubRoom, RoomMessage};

const CHANNEL_CAPACITY: usize = 256;

struct RoomShared {
    msg_tx: broadcast::Sender<RoomMessage>,
    join_tx: broadcast::Sender<String>,
    present: Mutex<HashSet<String>>,
}

/// A shared in-process room peers can attach to.
#[derive(Clone)]
pub struct MemoryRoomHub {
    shared: Arc<RoomShared>,
}

impl MemoryRoomHub {
    /// Create an empty hub
    pub fn new() -> Self {
        let (msg_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (join_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(RoomShared {
                msg_tx,
                join_tx,
                present: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Attach an endpoint under a random peer id. The heartbeat starts
    /// disabled; the peer is invisible until it is enabled.
    pub fn join(&self) -> MemoryRoom {
        let mut raw = [0u8; 8];
        rand::rng().fill_bytes(&mut raw);
        self.join_as(format!("peer_{}", bs58::encode(&raw).into_string()))
    }

    /// Attach an endpoint under an explicit peer id
    pub fn join_as(&self, peer_id: impl Into<String>) -> MemoryRoom {
        MemoryRoom {
            shared: self.shared.clone(),
            peer_id: peer_id.into(),
            heartbeat: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryRoomHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint of a [`MemoryRoomHub`].
pub struct MemoryRoom {
    shared: Arc<RoomShared>,
    peer_id: String,
    heartbeat: AtomicBool,
}

#[async_trait]
impl PubSubRoom for MemoryRoom {
    fn peer_id(&self) -> &str {
        &self.peer_id
    }

    async fn publish(&self, data: Bytes) -> RoamResult<()> {
        debug!(peer = %self.peer_id, len = data.len(), "Publishing to room");
        // Best-effort: a send with no live receivers is not an error
        let _ = self.shared.msg_tx.send(RoomMessage {
            sender: self.peer_id.clone(),
            data,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RoomMessage> {
        self.shared.msg_tx.subscribe()
    }

    fn set_heartbeat_enabled(&self, enabled: bool) {
        self.heartbeat.store(enabled, Ordering::SeqCst);
        let mut present = self.shared.present.lock();
        if enabled {
            if present.insert(self.peer_id.clone()) {
                debug!(peer = %self.peer_id, "Heartbeat enabled, announcing presence");
                let _ = self.shared.join_tx.send(self.peer_id.clone());
            }
        } else {
            present.remove(&self.peer_id);
        }
    }

    fn heartbeat_enabled(&self) -> bool {
        self.heartbeat.load(Ordering::SeqCst)
    }

    async fn wait_for_join(
        &self,
        predicate: JoinPredicate<'_>,
        cancel: &CancellationToken,
    ) -> RoamResult<String> {
        // Subscribe before scanning presence so a join between the scan and
        // the first recv is not lost
        let mut joins = self.shared.join_tx.subscribe();

        if let Some(peer) = self
            .shared
            .present
            .lock()
            .iter()
            .find(|p| predicate(p))
            .cloned()
        {
            return Ok(peer);
        }

        loop {
            let peer = guard(cancel, async {
                loop {
                    match joins.recv().await {
                        Ok(peer) => return Ok(peer),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(peer = %self.peer_id, skipped = n, "Lagged behind on join events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(RoamError::Room("join channel closed".to_string()));
                        }
                    }
                }
            })
            .await?;

            if predicate(&peer) {
                return Ok(peer);
            }
        }
    }
}
