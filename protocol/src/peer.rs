use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::MeshSettings;
use crate::error::Result;
use crate::types::*;

/// Which side opened the direct channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionRole {
    Source,
    Target,
}

/// A peer known through at least one relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Peer {
    pub uuid: PeerId,
    pub location: Location,
    pub nodes: Vec<NodeId>,
    pub is_connected: bool,
    pub is_source: bool,
    pub is_target: bool,
    /// Kilometres from the local peer.
    pub distance: f64,
    /// Direct gossip endpoint, known once a handshake completed.
    pub endpoint: Option<String>,
    pub last_timeout: Option<DateTime<Utc>>,
}

impl Peer {
    fn from_announcement(announcement: &PeerAnnouncement) -> Self {
        Self {
            uuid: announcement.uuid.clone(),
            location: announcement.location,
            nodes: Vec::new(),
            is_connected: false,
            is_source: false,
            is_target: false,
            distance: 0.0,
            endpoint: None,
            last_timeout: None,
        }
    }

    pub fn add_nodes<'a>(&mut self, nodes: impl IntoIterator<Item = &'a NodeId>) {
        for node in nodes {
            if !self.nodes.contains(node) {
                self.nodes.push(node.clone());
            }
        }
    }

    /// Still inside the retry backoff after a failed connection attempt.
    pub fn is_backing_off(&self, now: DateTime<Utc>, retry: Duration) -> bool {
        match self.last_timeout {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|elapsed| elapsed < retry)
                .unwrap_or(true),
            None => false,
        }
    }
}

/// Distance metric between two positions.
pub trait GeoLocator: Send + Sync {
    fn distance_km(&self, a: &Location, b: &Location) -> f64;
}

/// Great-circle distance on a spherical earth.
pub struct Haversine;

impl Haversine {
    const EARTH_RADIUS_KM: f64 = 6371.0;
}

impl GeoLocator for Haversine {
    fn distance_km(&self, a: &Location, b: &Location) -> f64 {
        let d_lat = (b.lat - a.lat).to_radians();
        let d_long = (b.long - a.long).to_radians();
        let h = (d_lat / 2.0).sin().powi(2)
            + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_long / 2.0).sin().powi(2);
        2.0 * Self::EARTH_RADIUS_KM * h.sqrt().atan2((1.0 - h).sqrt())
    }
}

/// Direct channel to connected peers.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &Peer, message: &GossipMessage) -> Result<()>;
}

/// Known peers ranked by distance.
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<RwLock<Vec<Peer>>>,
    self_id: PeerId,
    location: Location,
    geo: Arc<dyn GeoLocator>,
    transport: Arc<dyn PeerTransport>,
    max_peers: usize,
    timeout_retry_time: Duration,
    rad_max: Duration,
}

impl PeerRegistry {
    pub fn new(
        self_id: PeerId,
        location: Location,
        settings: &MeshSettings,
        transport: Arc<dyn PeerTransport>,
    ) -> Self {
        Self::with_locator(self_id, location, settings, transport, Arc::new(Haversine))
    }

    pub fn with_locator(
        self_id: PeerId,
        location: Location,
        settings: &MeshSettings,
        transport: Arc<dyn PeerTransport>,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        Self {
            peers: Arc::new(RwLock::new(Vec::new())),
            self_id,
            location,
            geo,
            transport,
            max_peers: settings.max_peers,
            timeout_retry_time: settings.timeout_retry_time,
            rad_max: settings.rad_max,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn location(&self) -> Location {
        self.location
    }

    /// Merge peer data reported by relay nodes. Returns how many peers were
    /// new.
    pub async fn update(&self, lists: &[NodePeerList]) -> usize {
        let mut peers = self.peers.write().await;
        let mut discovered = 0;
        for list in lists {
            for announcement in &list.peers {
                if announcement.uuid == self.self_id || announcement.uuid.is_empty() {
                    continue;
                }
                let index = match peers.iter().position(|p| p.uuid == announcement.uuid) {
                    Some(i) => i,
                    None => {
                        tracing::info!(peer = %announcement.uuid, node = %list.node_uuid, "🌐 Discovered new peer");
                        discovered += 1;
                        peers.push(Peer::from_announcement(announcement));
                        peers.len() - 1
                    }
                };
                let peer = &mut peers[index];
                peer.location = announcement.location;
                peer.add_nodes(announcement.nodes.iter().chain(std::iter::once(&list.node_uuid)));
                peer.distance = self.geo.distance_km(&self.location, &peer.location);
            }
        }
        peers.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        discovered
    }

    /// The closest `max_peers` peers, skipping those whose last connection
    /// attempt timed out less than `timeout_retry_time` ago.
    pub async fn neighbour_peers(&self) -> Vec<Peer> {
        let now = Utc::now();
        let peers = self.peers.read().await;
        peers
            .iter()
            .filter(|p| !p.is_backing_off(now, self.timeout_retry_time))
            .take(self.max_peers)
            .cloned()
            .collect()
    }

    /// Send `message` to every connected peer except ourselves and
    /// `origin`, each after its own Random Assessment Delay. Returns the
    /// peers a send was scheduled for.
    pub async fn broadcast(&self, message: GossipMessage, origin: Option<&str>) -> Vec<PeerId> {
        let targets: Vec<Peer> = self
            .peers
            .read()
            .await
            .iter()
            .filter(|p| p.is_connected)
            .filter(|p| p.uuid != self.self_id && Some(p.uuid.as_str()) != origin)
            .cloned()
            .collect();

        let message = Arc::new(message);
        let rad_max_ms = self.rad_max.as_millis() as u64;
        let mut scheduled = Vec::with_capacity(targets.len());
        for peer in targets {
            let delay = if rad_max_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..rad_max_ms))
            };
            tracing::debug!(peer = %peer.uuid, kind = message.kind(), delay_ms = delay.as_millis() as u64, "Scheduling gossip send");
            scheduled.push(peer.uuid.clone());

            let registry = self.clone();
            let message = message.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = registry.transport.send(&peer, &message).await {
                    tracing::warn!(peer = %peer.uuid, error = %e, "Gossip send failed");
                    registry.mark_disconnected(&peer.uuid).await;
                }
            });
        }
        scheduled
    }

    /// Uuids in `external` we do not know yet (self excluded).
    pub async fn missing_peer_uuids(&self, external: &[PeerId]) -> Vec<PeerId> {
        let peers = self.peers.read().await;
        let known: HashSet<&str> = peers.iter().map(|p| p.uuid.as_str()).collect();
        let mut seen = HashSet::new();
        external
            .iter()
            .filter(|uuid| **uuid != self.self_id && !known.contains(uuid.as_str()))
            .filter(|uuid| seen.insert(uuid.as_str()))
            .cloned()
            .collect()
    }

    pub async fn get(&self, uuid: &str) -> Option<Peer> {
        self.peers.read().await.iter().find(|p| p.uuid == uuid).cloned()
    }

    /// All known peers, closest first.
    pub async fn all(&self) -> Vec<Peer> {
        self.peers.read().await.clone()
    }

    pub async fn connected(&self) -> Vec<Peer> {
        self.peers
            .read()
            .await
            .iter()
            .filter(|p| p.is_connected)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn nodes_of(&self, uuid: &str) -> Vec<NodeId> {
        self.get(uuid).await.map(|p| p.nodes).unwrap_or_default()
    }

    pub async fn mark_timed_out(&self, uuid: &str) {
        self.modify(uuid, |peer| {
            peer.last_timeout = Some(Utc::now());
            peer.is_connected = false;
            peer.is_source = false;
            peer.is_target = false;
        })
        .await;
    }

    pub async fn mark_connected(&self, uuid: &str, endpoint: String, role: ConnectionRole) {
        self.modify(uuid, |peer| {
            peer.is_connected = true;
            peer.is_source = role == ConnectionRole::Source;
            peer.is_target = role == ConnectionRole::Target;
            peer.endpoint = Some(endpoint);
            peer.last_timeout = None;
        })
        .await;
    }

    pub async fn mark_disconnected(&self, uuid: &str) {
        self.modify(uuid, |peer| {
            peer.is_connected = false;
            peer.is_source = false;
            peer.is_target = false;
            peer.endpoint = None;
        })
        .await;
    }

    async fn modify(&self, uuid: &str, f: impl FnOnce(&mut Peer)) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.iter_mut().find(|p| p.uuid == uuid) {
            f(peer);
        }
    }
}
