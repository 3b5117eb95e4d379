//! Pub/sub room collaborator boundary
//!
//! The pairing protocol runs over a shared room with heartbeat-based join
//! detection and best-effort delivery. Payloads include exportable private
//! key material, so implementations are strongly encouraged to encrypt at
//! the transport layer; the core treats the room as a byte pipe.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::RoamResult;

/// A message delivered through the room.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    /// Peer id of the sender
    pub sender: String,
    /// Raw payload bytes
    pub data: Bytes,
}

/// Predicate over peer ids used by `wait_for_join`.
pub type JoinPredicate<'a> = &'a (dyn Fn(&str) -> bool + Send + Sync);

/// Best-effort pub/sub room with presence.
#[async_trait]
pub trait PubSubRoom: Send + Sync {
    /// This endpoint's peer id within the room
    fn peer_id(&self) -> &str;

    /// Broadcast bytes to every present peer
    async fn publish(&self, data: Bytes) -> RoamResult<()>;

    /// Subscribe to incoming messages. Each receiver sees messages sent
    /// after the call, including this endpoint's own broadcasts.
    fn subscribe(&self) -> broadcast::Receiver<RoomMessage>;

    /// Toggle this endpoint's heartbeat. Peers observe a join only while
    /// the heartbeat is enabled.
    fn set_heartbeat_enabled(&self, enabled: bool);

    /// Whether this endpoint currently announces presence
    fn heartbeat_enabled(&self) -> bool;

    /// Wait until a peer matching `predicate` is observed in the room,
    /// returning its peer id. Cancellable at any point.
    async fn wait_for_join(
        &self,
        predicate: JoinPredicate<'_>,
        cancel: &CancellationToken,
    ) -> RoamResult<String>;
}
