use chrono::{DateTime, Utc};
use meshwork_protocol::relay::{PeerIndex, RegisterRequest, RegisterResponse};
use meshwork_protocol::{MeshError, NodeId, NodePeerList, PeerAnnouncement, PeerId, RelayNode, SignalEnvelope};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::models::{PeerRecord, RelayStatus};

/// Peer directory and per-peer signaling mailboxes. Nothing is persisted:
/// peers re-register on their next poll after a restart.
pub struct RelayState {
    pub node_uuid: NodeId,
    pub auth_token: Option<String>,
    pub start_time: DateTime<Utc>,
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    mailboxes: RwLock<HashMap<PeerId, Vec<SignalEnvelope>>>,
}

impl RelayState {
    /// `public_host` and `port` are what peers dial; the node uuid is
    /// derived from them so every peer computes the same one.
    pub fn new(public_host: &str, port: u16, auth_token: Option<String>) -> meshwork_protocol::Result<Self> {
        Ok(Self {
            node_uuid: RelayNode::uuid_for(public_host, port)?,
            auth_token,
            start_time: Utc::now(),
            peers: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
        })
    }

    pub async fn register(&self, req: RegisterRequest) -> meshwork_protocol::Result<RegisterResponse> {
        if req.uuid.is_empty() {
            return Err(MeshError::invalid("register without peer uuid"));
        }
        let now = Utc::now();
        let mut peers = self.peers.write().await;
        match peers.get_mut(&req.uuid) {
            Some(record) => {
                record.location = req.location;
                record.last_seen = now;
            }
            None => {
                tracing::info!(peer = %req.uuid, "Peer registered");
                peers.insert(
                    req.uuid.clone(),
                    PeerRecord {
                        uuid: req.uuid,
                        location: req.location,
                        registered_at: now,
                        last_seen: now,
                    },
                );
            }
        }
        Ok(RegisterResponse {
            node_uuid: self.node_uuid.clone(),
            peer_count: peers.len(),
        })
    }

    pub async fn index(&self) -> PeerIndex {
        let mut uuids: Vec<PeerId> = self.peers.read().await.keys().cloned().collect();
        uuids.sort();
        PeerIndex {
            node_uuid: self.node_uuid.clone(),
            uuids,
        }
    }

    /// Announcements for the requested peers. Unknown uuids are skipped.
    pub async fn lookup(&self, uuids: &[PeerId]) -> NodePeerList {
        let peers = self.peers.read().await;
        let peers = uuids
            .iter()
            .filter_map(|uuid| peers.get(uuid))
            .map(|record| PeerAnnouncement {
                uuid: record.uuid.clone(),
                location: record.location,
                nodes: vec![self.node_uuid.clone()],
            })
            .collect();
        NodePeerList {
            node_uuid: self.node_uuid.clone(),
            peers,
        }
    }

    /// Queue a signal for its target. The target must be registered here.
    pub async fn push_signal(&self, envelope: SignalEnvelope) -> meshwork_protocol::Result<()> {
        envelope.validate()?;
        if envelope.node_uuid != self.node_uuid {
            return Err(MeshError::invalid(format!(
                "signal addressed to node {}",
                envelope.node_uuid
            )));
        }
        if !self.peers.read().await.contains_key(&envelope.target_peer_uuid) {
            return Err(MeshError::not_found(format!("peer {}", envelope.target_peer_uuid)));
        }
        tracing::debug!(
            kind = ?envelope.kind,
            from = %envelope.source_peer_uuid,
            to = %envelope.target_peer_uuid,
            "Signal queued"
        );
        self.mailboxes
            .write()
            .await
            .entry(envelope.target_peer_uuid.clone())
            .or_default()
            .push(envelope);
        Ok(())
    }

    /// Take everything queued for `peer`, oldest first. Polling counts as
    /// being seen.
    pub async fn drain(&self, peer: &str) -> Vec<SignalEnvelope> {
        if let Some(record) = self.peers.write().await.get_mut(peer) {
            record.last_seen = Utc::now();
        }
        self.mailboxes.write().await.remove(peer).unwrap_or_default()
    }

    /// Forget peers last seen before `now - timeout`, together with their
    /// mailboxes.
    pub async fn prune(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<PeerId> {
        let cutoff = now - timeout;
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|r| r.last_seen < cutoff)
            .map(|r| r.uuid.clone())
            .collect();
        if stale.is_empty() {
            return stale;
        }
        let mut mailboxes = self.mailboxes.write().await;
        for uuid in &stale {
            peers.remove(uuid);
            mailboxes.remove(uuid);
        }
        stale
    }

    pub async fn status(&self) -> RelayStatus {
        let peers = self.peers.read().await.len();
        let queued_signals = self.mailboxes.read().await.values().map(Vec::len).sum();
        RelayStatus {
            node_uuid: self.node_uuid.clone(),
            uptime_secs: (Utc::now() - self.start_time).num_seconds(),
            peers,
            queued_signals,
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}
