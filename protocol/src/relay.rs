//! Relay node interface.
//!
//! Relay nodes are rendezvous points only: peers register with them, ask
//! them who else is registered, and leave signaling messages in each
//! other's mailboxes. They never execute jobs or carry gossip.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Location, NodeId, PeerId, RelayNode, SignalEnvelope};

/// Outbound signaling through a relay node. Shared read-only by every
/// in-flight handshake.
#[async_trait]
pub trait RelayChannel: Send + Sync {
    async fn send(&self, node: &RelayNode, envelope: &SignalEnvelope) -> Result<()>;
}

// HTTP bodies shared by the relay server and its clients.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub uuid: PeerId,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub node_uuid: NodeId,
    pub peer_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIndex {
    pub node_uuid: NodeId,
    pub uuids: Vec<PeerId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupRequest {
    pub uuids: Vec<PeerId>,
}
