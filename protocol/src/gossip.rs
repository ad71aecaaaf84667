use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

use crate::config::MeshSettings;
use crate::error::{MeshError, Result};
use crate::ledger::{JobLedger, LedgerOutcome, ResultLedger};
use crate::negotiator::{ConnectionNegotiator, NegotiationState};
use crate::peer::{PeerRegistry, PeerTransport};
use crate::recent::RecentMessages;
use crate::relay::RelayChannel;
use crate::store::Store;
use crate::types::*;

/// Identity of the local peer.
#[derive(Debug, Clone)]
pub struct LocalPeer {
    pub uuid: PeerId,
    pub location: Location,
    /// Gossip endpoints other peers can reach us at, preferred first.
    pub endpoints: Vec<String>,
}

/// Coordination core of one meshwork peer.
///
/// Each GossipNode:
/// 1. Queues jobs produced locally or gossiped by neighbours
/// 2. Folds computed results into the result ledger until they validate
/// 3. Re-broadcasts anything new to its connected neighbours
/// 4. Opens direct channels to its closest peers through relay nodes
pub struct GossipNode {
    local: LocalPeer,
    settings: MeshSettings,
    pub peers: PeerRegistry,
    pub results: ResultLedger,
    jobs: Mutex<JobLedger>,
    nodes: RwLock<Vec<RelayNode>>,
    negotiations: Mutex<HashMap<PeerId, ConnectionNegotiator>>,
    relay: Arc<dyn RelayChannel>,
    recent: RecentMessages,
    job_produced: Notify,
}

impl GossipNode {
    pub fn new(
        local: LocalPeer,
        settings: MeshSettings,
        store: Arc<dyn Store>,
        transport: Arc<dyn PeerTransport>,
        relay: Arc<dyn RelayChannel>,
    ) -> Self {
        let peers = PeerRegistry::new(local.uuid.clone(), local.location, &settings, transport);
        Self {
            results: ResultLedger::new(store, &settings.results),
            jobs: Mutex::new(JobLedger::new(settings.jobs.max_lock_time)),
            recent: RecentMessages::new(settings.recent_message_capacity, settings.recent_message_ttl),
            nodes: RwLock::new(Vec::new()),
            negotiations: Mutex::new(HashMap::new()),
            job_produced: Notify::new(),
            peers,
            relay,
            local,
            settings,
        }
    }

    pub fn peer_id(&self) -> &str {
        &self.local.uuid
    }

    pub fn settings(&self) -> &MeshSettings {
        &self.settings
    }

    /// Signalled whenever a new job lands in the queue.
    pub fn job_produced(&self) -> &Notify {
        &self.job_produced
    }

    /// Load stored results and start periodic saving.
    pub async fn start(&self) -> Result<()> {
        let loaded = self.results.sync().await?;
        self.results.enable_auto_save(self.settings.auto_save_interval).await;
        tracing::info!(peer = %self.local.uuid, results = loaded, "Gossip node started");
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<usize> {
        self.results.disable_auto_save().await;
        self.results.flush().await
    }

    // -- jobs ---------------------------------------------------------------

    /// Queue a locally produced job and offer it to the mesh. Returns
    /// `None` when the same parameters are already queued.
    pub async fn submit_job(&self, parameters: Parameters) -> Result<Option<Job>> {
        if parameters.is_empty() {
            return Err(MeshError::invalid("job parameters are empty"));
        }
        let job = Job::new(parameters, self.local.uuid.clone())?;
        if !self.jobs.lock().await.add(job.clone()) {
            return Ok(None);
        }
        let message = GossipMessage::Job {
            origin: self.local.uuid.clone(),
            job: job.clone(),
        };
        self.recent.insert(message.message_id()?).await;
        tracing::info!(job = %job.uuid, "📋 Job submitted");
        self.job_produced.notify_one();
        self.peers.broadcast(message, None).await;
        Ok(Some(job))
    }

    pub async fn next_job(&self) -> Option<Job> {
        self.jobs.lock().await.next()
    }

    pub async fn complete_job(&self, uuid: &str) -> bool {
        self.jobs.lock().await.complete(uuid)
    }

    /// Put jobs whose lease ran out back in the queue.
    pub async fn requeue_expired(&self) -> usize {
        let n = self.jobs.lock().await.requeue_expired(Instant::now());
        if n > 0 {
            self.job_produced.notify_one();
        }
        n
    }

    pub async fn pending_jobs(&self) -> usize {
        self.jobs.lock().await.len()
    }

    // -- results ------------------------------------------------------------

    /// Record a result computed by one of our own execution units.
    pub async fn publish_result(&self, result: JobResult) -> Result<LedgerOutcome> {
        let message = GossipMessage::Result {
            origin: self.local.uuid.clone(),
            result: result.clone(),
        };
        self.recent.insert(message.message_id()?).await;
        let outcome = self.results.add(result).await?;
        if outcome.is_change() {
            self.peers.broadcast(message, None).await;
        }
        Ok(outcome)
    }

    // -- inbound gossip -----------------------------------------------------

    /// Handle a message from a directly connected peer. Returns whether it
    /// was new and got relayed onwards.
    pub async fn handle_message(&self, message: GossipMessage) -> Result<bool> {
        let from = message.origin().to_string();
        if from == self.local.uuid {
            return Ok(false);
        }
        if !self.recent.insert(message.message_id()?).await {
            tracing::debug!(from = %from, kind = message.kind(), "Duplicate gossip suppressed");
            return Ok(false);
        }

        match message {
            GossipMessage::Job { job, .. } => {
                if !job.has_valid_uuid() {
                    return Err(MeshError::invalid(format!(
                        "job {} does not match its parameters",
                        job.uuid
                    )));
                }
                if !self.jobs.lock().await.add(job.clone()) {
                    return Ok(false);
                }
                tracing::info!(job = %job.uuid, from = %from, "📋 Received job");
                self.job_produced.notify_one();
                let relayed = GossipMessage::Job {
                    origin: self.local.uuid.clone(),
                    job,
                };
                self.peers.broadcast(relayed, Some(&from)).await;
                Ok(true)
            }
            GossipMessage::Result { result, .. } => {
                let outcome = self.results.add(result.clone()).await?;
                if !outcome.is_change() {
                    return Ok(false);
                }
                tracing::debug!(result = %result.uuid, from = %from, ?outcome, "📊 Result received");
                let relayed = GossipMessage::Result {
                    origin: self.local.uuid.clone(),
                    result,
                };
                self.peers.broadcast(relayed, Some(&from)).await;
                Ok(true)
            }
        }
    }

    // -- relay nodes and peers ----------------------------------------------

    /// Register a relay node, replacing an older entry with the same uuid.
    pub async fn add_node(&self, node: RelayNode) {
        let mut nodes = self.nodes.write().await;
        match nodes.iter_mut().find(|n| n.uuid == node.uuid) {
            Some(existing) => *existing = node,
            None => nodes.push(node),
        }
    }

    pub async fn set_node_connected(&self, uuid: &str, connected: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.iter_mut().find(|n| n.uuid == uuid) {
            if node.is_connected != connected {
                tracing::info!(node = %uuid, connected, "Relay connectivity changed");
            }
            node.is_connected = connected;
        }
    }

    pub async fn nodes(&self) -> Vec<RelayNode> {
        self.nodes.read().await.clone()
    }

    pub async fn update_peers(&self, lists: &[NodePeerList]) -> usize {
        self.peers.update(lists).await
    }

    /// Peers a relay knows about that we have not heard of yet.
    pub async fn missing_peers(&self, external: &[PeerId]) -> Vec<PeerId> {
        self.peers.missing_peer_uuids(external).await
    }

    // -- handshakes ---------------------------------------------------------

    /// Start a handshake with every neighbour that is neither connected nor
    /// already negotiating. Returns how many offers went out.
    pub async fn connect_neighbours(&self) -> usize {
        let nodes = self.nodes().await;
        let mut started = 0;
        for peer in self.peers.neighbour_peers().await {
            if peer.is_connected {
                continue;
            }
            let shared: Vec<RelayNode> = nodes
                .iter()
                .filter(|n| peer.nodes.contains(&n.uuid))
                .cloned()
                .collect();

            // registered before the offer leaves, so an early answer finds it
            let mut negotiations = self.negotiations.lock().await;
            if negotiations.get(&peer.uuid).map(|n| n.is_pending()).unwrap_or(false) {
                continue;
            }
            negotiations.insert(
                peer.uuid.clone(),
                ConnectionNegotiator::new(
                    self.local.uuid.clone(),
                    peer.uuid.clone(),
                    self.primary_endpoint(),
                ),
            );
            let Some(negotiator) = negotiations.get_mut(&peer.uuid) else {
                continue;
            };
            match negotiator.initiate(&shared, self.relay.as_ref()).await {
                Ok(()) => {
                    if let Err(e) = negotiator
                        .send_candidates(self.alternative_endpoints(), &nodes, self.relay.as_ref())
                        .await
                    {
                        tracing::debug!(peer = %peer.uuid, error = %e, "Candidate trickle failed");
                    }
                    started += 1;
                }
                Err(e) => {
                    tracing::warn!(peer = %peer.uuid, error = %e, "Handshake could not start");
                    negotiations.remove(&peer.uuid);
                    drop(negotiations);
                    self.peers.mark_timed_out(&peer.uuid).await;
                }
            }
        }
        started
    }

    /// Dispatch a signaling message delivered by a relay node.
    pub async fn handle_signal(&self, envelope: SignalEnvelope) -> Result<()> {
        envelope.validate()?;
        if envelope.target_peer_uuid != self.local.uuid {
            return Err(MeshError::invalid(format!(
                "signal addressed to {}",
                envelope.target_peer_uuid
            )));
        }
        let remote = envelope.source_peer_uuid.clone();

        match envelope.kind {
            SignalKind::Offer => self.answer_offer(remote, &envelope).await,
            SignalKind::Answer => {
                let mut negotiations = self.negotiations.lock().await;
                let negotiator = negotiations
                    .get_mut(&remote)
                    .ok_or_else(|| MeshError::not_found(format!("handshake with {remote}")))?;
                negotiator.accept_answer(&envelope)?;
                self.mark_established(negotiator).await;
                Ok(())
            }
            SignalKind::Candidate => {
                let mut negotiations = self.negotiations.lock().await;
                let negotiator = negotiations
                    .get_mut(&remote)
                    .ok_or_else(|| MeshError::not_found(format!("handshake with {remote}")))?;
                negotiator.add_candidate(&envelope)?;
                Ok(())
            }
        }
    }

    async fn answer_offer(&self, remote: PeerId, envelope: &SignalEnvelope) -> Result<()> {
        if self.peers.get(&remote).await.is_none() {
            return Err(MeshError::not_found(format!("offer from unknown peer {remote}")));
        }
        {
            let negotiations = self.negotiations.lock().await;
            let ours_pending = negotiations
                .get(&remote)
                .map(|n| n.state() == NegotiationState::OfferSent)
                .unwrap_or(false);
            // both sides offered at once: the lower uuid keeps its offer
            if ours_pending && self.local.uuid < remote {
                tracing::debug!(peer = %remote, "Simultaneous offers, keeping ours");
                return Ok(());
            }
        }

        let nodes = self.nodes().await;
        let mut negotiator =
            ConnectionNegotiator::new(self.local.uuid.clone(), remote.clone(), self.primary_endpoint());
        if let Err(e) = negotiator.accept_offer(envelope, &nodes, self.relay.as_ref()).await {
            self.negotiations.lock().await.remove(&remote);
            self.peers.mark_timed_out(&remote).await;
            return Err(e);
        }
        self.mark_established(&negotiator).await;
        if let Err(e) = negotiator
            .send_candidates(self.alternative_endpoints(), &nodes, self.relay.as_ref())
            .await
        {
            tracing::debug!(peer = %remote, error = %e, "Candidate trickle failed");
        }
        self.negotiations.lock().await.insert(remote, negotiator);
        Ok(())
    }

    async fn mark_established(&self, negotiator: &ConnectionNegotiator) {
        match (negotiator.direct_endpoint(), negotiator.role()) {
            (Some(endpoint), Some(role)) => {
                self.peers
                    .mark_connected(negotiator.remote_peer(), endpoint.to_string(), role)
                    .await;
            }
            _ => tracing::warn!(peer = %negotiator.remote_peer(), "Handshake finished without a usable endpoint"),
        }
    }

    /// Drop handshakes that got no answer in time; their peers back off.
    pub async fn expire_negotiations(&self) -> Vec<PeerId> {
        let now = Instant::now();
        let timeout = self.settings.negotiation_timeout;
        let expired: Vec<PeerId> = {
            let mut negotiations = self.negotiations.lock().await;
            let expired: Vec<PeerId> = negotiations
                .iter()
                .filter(|(_, n)| n.is_expired(now, timeout))
                .map(|(uuid, _)| uuid.clone())
                .collect();
            for uuid in &expired {
                negotiations.remove(uuid);
            }
            expired
        };
        for uuid in &expired {
            tracing::warn!(peer = %uuid, "Handshake timed out");
            self.peers.mark_timed_out(uuid).await;
        }
        expired
    }

    pub async fn negotiation_state(&self, peer: &str) -> Option<NegotiationState> {
        self.negotiations.lock().await.get(peer).map(|n| n.state())
    }

    fn primary_endpoint(&self) -> String {
        self.local.endpoints.first().cloned().unwrap_or_default()
    }

    fn alternative_endpoints(&self) -> &[String] {
        self.local.endpoints.get(1..).unwrap_or(&[])
    }

    // -- status -------------------------------------------------------------

    pub async fn status(&self) -> MeshStatus {
        let peers = self.peers.all().await;
        let nodes = self.nodes().await;
        let (pending_jobs, leased_jobs) = {
            let jobs = self.jobs.lock().await;
            (jobs.len(), jobs.leased())
        };
        MeshStatus {
            peer_id: self.local.uuid.clone(),
            known_peers: peers.len(),
            connected_peers: peers.iter().filter(|p| p.is_connected).count(),
            relay_nodes: nodes.len(),
            connected_relays: nodes.iter().filter(|n| n.is_connected).count(),
            pending_jobs,
            leased_jobs,
            results: self.results.len().await,
            valid_results: self.results.valid_count().await,
            all_valid: self.results.all_valid().await,
        }
    }
}

/// Summary of one node's view of the mesh.
#[derive(Debug, Clone, Serialize)]
pub struct MeshStatus {
    pub peer_id: PeerId,
    pub known_peers: usize,
    pub connected_peers: usize,
    pub relay_nodes: usize,
    pub connected_relays: usize,
    pub pending_jobs: usize,
    pub leased_jobs: usize,
    pub results: usize,
    pub valid_results: usize,
    pub all_valid: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::{ConnectionRole, Peer};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Sink {
        sent: StdMutex<Vec<(PeerId, GossipMessage)>>,
    }

    #[async_trait]
    impl PeerTransport for Sink {
        async fn send(&self, peer: &Peer, message: &GossipMessage) -> Result<()> {
            self.sent.lock().unwrap().push((peer.uuid.clone(), message.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct Mailbox {
        sent: StdMutex<Vec<SignalEnvelope>>,
    }

    #[async_trait]
    impl RelayChannel for Mailbox {
        async fn send(&self, _node: &RelayNode, envelope: &SignalEnvelope) -> Result<()> {
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    struct Fixture {
        node: GossipNode,
        sink: Arc<Sink>,
        mailbox: Arc<Mailbox>,
    }

    fn fixture(uuid: &str) -> Fixture {
        let sink = Arc::new(Sink::default());
        let mailbox = Arc::new(Mailbox::default());
        let local = LocalPeer {
            uuid: uuid.into(),
            location: Location { lat: 52.5, long: 13.4 },
            endpoints: vec![format!("http://{uuid}:7435"), format!("http://{uuid}-lan:7435")],
        };
        let node = GossipNode::new(
            local,
            MeshSettings::default(),
            Arc::new(MemoryStore::new()),
            sink.clone(),
            mailbox.clone(),
        );
        Fixture { node, sink, mailbox }
    }

    fn params(v: serde_json::Value) -> Parameters {
        v.as_object().cloned().unwrap()
    }

    async fn add_connected_peers(node: &GossipNode, uuids: &[&str]) {
        let peers = uuids
            .iter()
            .map(|u| PeerAnnouncement {
                uuid: u.to_string(),
                location: Location { lat: 50.0, long: 10.0 },
                nodes: vec![],
            })
            .collect();
        node.update_peers(&[NodePeerList { node_uuid: "n".into(), peers }]).await;
        for u in uuids {
            node.peers
                .mark_connected(u, format!("http://{u}"), ConnectionRole::Source)
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn submitted_job_is_queued_once_and_broadcast() {
        let f = fixture("me");
        add_connected_peers(&f.node, &["a"]).await;

        let job = f.node.submit_job(params(json!({ "n": 1 }))).await.unwrap().unwrap();
        assert!(f.node.submit_job(params(json!({ "n": 1 }))).await.unwrap().is_none());
        assert_eq!(f.node.pending_jobs().await, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, GossipMessage::Job { job: j, .. } if j.uuid == job.uuid));
    }

    #[tokio::test]
    async fn empty_parameters_are_rejected() {
        let f = fixture("me");
        let err = f.node.submit_job(Parameters::new()).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_job_is_relayed_once_excluding_sender() {
        let f = fixture("me");
        add_connected_peers(&f.node, &["a", "b"]).await;
        let job = Job::new(params(json!({ "n": 2 })), "a").unwrap();
        let msg = GossipMessage::Job { origin: "a".into(), job: job.clone() };

        assert!(f.node.handle_message(msg.clone()).await.unwrap());
        assert!(!f.node.handle_message(msg).await.unwrap());
        assert_eq!(f.node.next_job().await.unwrap().uuid, job.uuid);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let sent = f.sink.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "b");
        assert_eq!(sent[0].1.origin(), "me");
    }

    #[tokio::test]
    async fn forged_job_uuid_is_rejected() {
        let f = fixture("me");
        let mut job = Job::new(params(json!({ "n": 2 })), "a").unwrap();
        job.uuid = "forged".into();
        let err = f
            .node
            .handle_message(GossipMessage::Job { origin: "a".into(), job })
            .await
            .unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput { .. }));
        assert_eq!(f.node.pending_jobs().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn results_fold_and_stop_relaying_once_valid() {
        let f = fixture("me");
        add_connected_peers(&f.node, &["a", "b", "c", "d"]).await;
        let job = Job::new(params(json!({ "n": 3 })), "a").unwrap();

        let mut accepted = 0;
        for peer in ["a", "b", "c", "d"] {
            let result = JobResult::for_job(&job, json!({ "ok": true }), peer).unwrap();
            let msg = GossipMessage::Result { origin: peer.into(), result };
            if f.node.handle_message(msg).await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 3);
        let uuid = JobResult::for_job(&job, json!(null), "x").unwrap().uuid;
        assert!(f.node.results.is_valid(&uuid).await);
    }

    #[tokio::test(start_paused = true)]
    async fn local_result_is_published() {
        let f = fixture("me");
        add_connected_peers(&f.node, &["a"]).await;
        let job = Job::new(params(json!({ "n": 4 })), "me").unwrap();
        let result = JobResult::for_job(&job, json!(16), "me").unwrap();

        assert_eq!(f.node.publish_result(result.clone()).await.unwrap(), LedgerOutcome::Created);
        // our own result coming back through the mesh is not counted again
        let echo = GossipMessage::Result { origin: "a".into(), result };
        assert!(!f.node.handle_message(echo).await.unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.sink.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn neighbour_without_shared_relay_backs_off() {
        let f = fixture("me");
        f.node
            .update_peers(&[NodePeerList {
                node_uuid: "elsewhere".into(),
                peers: vec![PeerAnnouncement {
                    uuid: "far".into(),
                    location: Location::default(),
                    nodes: vec![],
                }],
            }])
            .await;
        assert_eq!(f.node.connect_neighbours().await, 0);
        assert!(f.node.peers.get("far").await.unwrap().last_timeout.is_some());
        assert!(f.node.peers.neighbour_peers().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_offer_expires() {
        let f = fixture("me");
        let mut relay_node = RelayNode::new("relay", 7434).unwrap();
        relay_node.is_connected = true;
        f.node.add_node(relay_node.clone()).await;
        f.node
            .update_peers(&[NodePeerList {
                node_uuid: relay_node.uuid.clone(),
                peers: vec![PeerAnnouncement {
                    uuid: "quiet".into(),
                    location: Location::default(),
                    nodes: vec![],
                }],
            }])
            .await;

        assert_eq!(f.node.connect_neighbours().await, 1);
        assert_eq!(f.node.negotiation_state("quiet").await, Some(NegotiationState::OfferSent));
        // offer plus one trickled candidate
        assert_eq!(f.mailbox.sent.lock().unwrap().len(), 2);
        // still pending: no second offer
        assert_eq!(f.node.connect_neighbours().await, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(f.node.expire_negotiations().await, vec!["quiet".to_string()]);
        assert!(f.node.negotiation_state("quiet").await.is_none());
        assert!(f.node.peers.get("quiet").await.unwrap().last_timeout.is_some());
    }

    /// Relay whose sends stay in flight until the test opens the gate.
    struct SlowRelay {
        sent: StdMutex<Vec<SignalEnvelope>>,
        gate: tokio::sync::Semaphore,
    }

    impl SlowRelay {
        fn new() -> Self {
            Self {
                sent: StdMutex::new(Vec::new()),
                gate: tokio::sync::Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl RelayChannel for SlowRelay {
        async fn send(&self, _node: &RelayNode, envelope: &SignalEnvelope) -> Result<()> {
            self.sent.lock().unwrap().push(envelope.clone());
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn answer_arriving_during_offer_send_completes_handshake() {
        let relay = Arc::new(SlowRelay::new());
        let node = GossipNode::new(
            LocalPeer {
                uuid: "me".into(),
                location: Location::default(),
                endpoints: vec!["http://me:7435".into()],
            },
            MeshSettings::default(),
            Arc::new(MemoryStore::new()),
            Arc::new(Sink::default()),
            relay.clone(),
        );
        let mut relay_node = RelayNode::new("relay", 7434).unwrap();
        relay_node.is_connected = true;
        node.add_node(relay_node.clone()).await;
        node.update_peers(&[NodePeerList {
            node_uuid: relay_node.uuid.clone(),
            peers: vec![PeerAnnouncement {
                uuid: "fast".into(),
                location: Location::default(),
                nodes: vec![],
            }],
        }])
        .await;

        let answer = SignalEnvelope {
            kind: SignalKind::Answer,
            source_peer_uuid: "fast".into(),
            target_peer_uuid: "me".into(),
            node_uuid: relay_node.uuid.clone(),
            payload: json!({ "kind": "answer", "endpoint": "http://fast:7435" }),
        };
        let (started, answered) = tokio::join!(node.connect_neighbours(), async {
            while relay.sent.lock().unwrap().is_empty() {
                tokio::task::yield_now().await;
            }
            // the offer is on the wire, its send has not returned yet
            relay.gate.add_permits(8);
            node.handle_signal(answer).await
        });

        assert_eq!(started, 1);
        answered.unwrap();
        assert_eq!(node.negotiation_state("fast").await, Some(NegotiationState::Established));
        assert!(node.peers.get("fast").await.unwrap().is_connected);
    }

    #[tokio::test]
    async fn signal_for_someone_else_is_rejected() {
        let f = fixture("me");
        let envelope = SignalEnvelope {
            kind: SignalKind::Answer,
            source_peer_uuid: "a".into(),
            target_peer_uuid: "b".into(),
            node_uuid: "n".into(),
            payload: json!({}),
        };
        assert!(matches!(
            f.node.handle_signal(envelope).await,
            Err(MeshError::InvalidInput { .. })
        ));
    }

    #[tokio::test]
    async fn status_reports_counts() {
        let f = fixture("me");
        add_connected_peers(&f.node, &["a"]).await;
        f.node.submit_job(params(json!({ "n": 1 }))).await.unwrap();
        let status = f.node.status().await;
        assert_eq!(status.known_peers, 1);
        assert_eq!(status.connected_peers, 1);
        assert_eq!(status.pending_jobs, 1);
        assert!(!status.all_valid);
    }
}
