//! Direct channel establishment through a relay.
//!
//! ```text
//!  source                      relay                     target
//!    │ Idle                      │                        Idle │
//!    │── offer ─────────────────►│── offer ──────────────────►│ OfferReceived
//!    │ OfferSent                 │                            │
//!    │◄──────────────── answer ──│◄───────────────── answer ──│ AnswerSent
//!    │ AnswerReceived            │                            │ Established
//!    │ Established               │                            │
//!    │◄────────── candidates (any time, either direction) ───►│
//! ```
//!
//! The session description a peer hands over is the endpoint its gossip
//! server listens on; candidates are its alternative endpoints.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{MeshError, Result};
use crate::peer::ConnectionRole;
use crate::relay::RelayChannel;
use crate::types::{NodeId, PeerId, RelayNode, SignalEnvelope, SignalKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationState {
    Idle,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Established,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DescriptionKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: DescriptionKind,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub endpoint: String,
}

/// Handshake with one remote peer.
pub struct ConnectionNegotiator {
    local_peer: PeerId,
    remote_peer: PeerId,
    local_endpoint: String,
    role: Option<ConnectionRole>,
    state: NegotiationState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    remote_candidates: Vec<Candidate>,
    node: Option<NodeId>,
    started_at: Instant,
}

impl ConnectionNegotiator {
    pub fn new(local_peer: PeerId, remote_peer: PeerId, local_endpoint: String) -> Self {
        Self {
            local_peer,
            remote_peer,
            local_endpoint,
            role: None,
            state: NegotiationState::Idle,
            local_description: None,
            remote_description: None,
            remote_candidates: Vec::new(),
            node: None,
            started_at: Instant::now(),
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn role(&self) -> Option<ConnectionRole> {
        self.role
    }

    pub fn remote_peer(&self) -> &str {
        &self.remote_peer
    }

    /// Relay node carrying this handshake.
    pub fn node(&self) -> Option<&str> {
        self.node.as_deref()
    }

    pub fn is_established(&self) -> bool {
        self.state == NegotiationState::Established
    }

    /// Still waiting on the other side.
    pub fn is_pending(&self) -> bool {
        !matches!(self.state, NegotiationState::Established | NegotiationState::Failed)
    }

    pub fn is_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.is_pending() && now.saturating_duration_since(self.started_at) >= timeout
    }

    /// Endpoint to gossip with once established: the remote description,
    /// or the first candidate when the description carries none.
    pub fn direct_endpoint(&self) -> Option<&str> {
        self.remote_description
            .as_ref()
            .map(|d| d.endpoint.as_str())
            .filter(|e| !e.is_empty())
            .or_else(|| self.remote_candidates.first().map(|c| c.endpoint.as_str()))
    }

    /// Source side: send an offer through any connected relay shared with
    /// the remote peer (`shared_nodes`). Without one the attempt fails for
    /// good.
    pub async fn initiate(&mut self, shared_nodes: &[RelayNode], relay: &dyn RelayChannel) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(MeshError::invalid(format!(
                "cannot offer to {} in state {:?}",
                self.remote_peer, self.state
            )));
        }
        self.role = Some(ConnectionRole::Source);
        let Some(node) = shared_nodes.iter().find(|n| n.is_connected) else {
            return Err(self.fail("no connected relay shared with peer"));
        };
        self.node = Some(node.uuid.clone());

        let offer = SessionDescription {
            kind: DescriptionKind::Offer,
            endpoint: self.local_endpoint.clone(),
        };
        self.local_description = Some(offer.clone());
        let envelope = self.envelope(SignalKind::Offer, node, serde_json::to_value(&offer)?);
        if let Err(e) = relay.send(node, &envelope).await {
            self.transition(NegotiationState::Failed);
            return Err(e);
        }
        self.transition(NegotiationState::OfferSent);
        Ok(())
    }

    /// Target side: take the offer, answer through the relay it came from.
    pub async fn accept_offer(
        &mut self,
        envelope: &SignalEnvelope,
        nodes: &[RelayNode],
        relay: &dyn RelayChannel,
    ) -> Result<()> {
        if self.state != NegotiationState::Idle {
            return Err(MeshError::invalid(format!(
                "unexpected offer from {} in state {:?}",
                self.remote_peer, self.state
            )));
        }
        let offer: SessionDescription = parse_payload(envelope)?;
        if offer.kind != DescriptionKind::Offer {
            return Err(MeshError::invalid("offer payload is not an offer"));
        }
        self.role = Some(ConnectionRole::Target);
        self.remote_description = Some(offer);
        self.transition(NegotiationState::OfferReceived);

        let Some(node) = nodes
            .iter()
            .find(|n| n.uuid == envelope.node_uuid && n.is_connected)
        else {
            return Err(self.fail("relay that carried the offer is not connected"));
        };
        self.node = Some(node.uuid.clone());

        let answer = SessionDescription {
            kind: DescriptionKind::Answer,
            endpoint: self.local_endpoint.clone(),
        };
        self.local_description = Some(answer.clone());
        let reply = self.envelope(SignalKind::Answer, node, serde_json::to_value(&answer)?);
        if let Err(e) = relay.send(node, &reply).await {
            self.transition(NegotiationState::Failed);
            return Err(e);
        }
        self.transition(NegotiationState::AnswerSent);
        self.transition(NegotiationState::Established);
        Ok(())
    }

    /// Source side: the answer completes the handshake.
    pub fn accept_answer(&mut self, envelope: &SignalEnvelope) -> Result<()> {
        if self.state != NegotiationState::OfferSent {
            return Err(MeshError::invalid(format!(
                "unexpected answer from {} in state {:?}",
                self.remote_peer, self.state
            )));
        }
        let answer: SessionDescription = parse_payload(envelope)?;
        if answer.kind != DescriptionKind::Answer {
            return Err(MeshError::invalid("answer payload is not an answer"));
        }
        self.remote_description = Some(answer);
        self.transition(NegotiationState::AnswerReceived);
        self.transition(NegotiationState::Established);
        Ok(())
    }

    /// Record a remote candidate. Accepted in every state; returns whether
    /// it can still influence the connection.
    pub fn add_candidate(&mut self, envelope: &SignalEnvelope) -> Result<bool> {
        let candidate: Candidate = parse_payload(envelope)?;
        if !self.remote_candidates.contains(&candidate) {
            self.remote_candidates.push(candidate);
        }
        if self.is_established() {
            tracing::debug!(peer = %self.remote_peer, "Candidate after establishment has no effect");
            return Ok(false);
        }
        Ok(true)
    }

    /// Trickle our alternative endpoints through the handshake's relay.
    pub async fn send_candidates(
        &self,
        endpoints: &[String],
        nodes: &[RelayNode],
        relay: &dyn RelayChannel,
    ) -> Result<usize> {
        let Some(node) = self
            .node
            .as_ref()
            .and_then(|uuid| nodes.iter().find(|n| &n.uuid == uuid && n.is_connected))
        else {
            return Err(MeshError::Unreachable {
                peer: self.remote_peer.clone(),
                reason: "handshake relay is not connected".into(),
            });
        };
        for endpoint in endpoints {
            let candidate = Candidate {
                endpoint: endpoint.clone(),
            };
            let envelope = self.envelope(SignalKind::Candidate, node, serde_json::to_value(&candidate)?);
            relay.send(node, &envelope).await?;
        }
        Ok(endpoints.len())
    }

    fn envelope(&self, kind: SignalKind, node: &RelayNode, payload: serde_json::Value) -> SignalEnvelope {
        SignalEnvelope {
            kind,
            source_peer_uuid: self.local_peer.clone(),
            target_peer_uuid: self.remote_peer.clone(),
            node_uuid: node.uuid.clone(),
            payload,
        }
    }

    fn fail(&mut self, reason: &str) -> MeshError {
        self.transition(NegotiationState::Failed);
        MeshError::Unreachable {
            peer: self.remote_peer.clone(),
            reason: reason.into(),
        }
    }

    fn transition(&mut self, next: NegotiationState) {
        tracing::debug!(peer = %self.remote_peer, from = ?self.state, to = ?next, "Handshake transition");
        if next == NegotiationState::Established {
            tracing::info!(peer = %self.remote_peer, role = ?self.role, "🤝 Direct channel established");
        }
        self.state = next;
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(envelope: &SignalEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| MeshError::invalid(format!("malformed {:?} payload: {e}", envelope.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MailRelay {
        sent: Mutex<Vec<SignalEnvelope>>,
    }

    impl MailRelay {
        fn take(&self) -> Vec<SignalEnvelope> {
            std::mem::take(&mut *self.sent.lock().unwrap())
        }
    }

    #[async_trait]
    impl RelayChannel for MailRelay {
        async fn send(&self, node: &RelayNode, envelope: &SignalEnvelope) -> Result<()> {
            if !node.is_connected {
                return Err(MeshError::transport("relay down"));
            }
            self.sent.lock().unwrap().push(envelope.clone());
            Ok(())
        }
    }

    fn node(connected: bool) -> RelayNode {
        let mut n = RelayNode::new("relay.local", 7434).unwrap();
        n.is_connected = connected;
        n
    }

    fn pair() -> (ConnectionNegotiator, ConnectionNegotiator) {
        (
            ConnectionNegotiator::new("alice".into(), "bob".into(), "http://alice:7435".into()),
            ConnectionNegotiator::new("bob".into(), "alice".into(), "http://bob:7435".into()),
        )
    }

    #[tokio::test]
    async fn offer_answer_establishes_both_sides() {
        let relay = MailRelay::default();
        let nodes = vec![node(true)];
        let (mut source, mut target) = pair();

        source.initiate(&nodes, &relay).await.unwrap();
        assert_eq!(source.state(), NegotiationState::OfferSent);
        let offer = relay.take().pop().unwrap();
        assert_eq!(offer.kind, SignalKind::Offer);
        assert_eq!(offer.target_peer_uuid, "bob");

        target.accept_offer(&offer, &nodes, &relay).await.unwrap();
        assert_eq!(target.state(), NegotiationState::Established);
        assert_eq!(target.role(), Some(ConnectionRole::Target));
        assert_eq!(target.direct_endpoint(), Some("http://alice:7435"));

        let answer = relay.take().pop().unwrap();
        assert_eq!(answer.kind, SignalKind::Answer);
        assert_eq!(answer.node_uuid, offer.node_uuid);
        source.accept_answer(&answer).unwrap();
        assert!(source.is_established());
        assert_eq!(source.role(), Some(ConnectionRole::Source));
        assert_eq!(source.direct_endpoint(), Some("http://bob:7435"));
    }

    #[tokio::test]
    async fn no_connected_relay_fails_immediately() {
        let relay = MailRelay::default();
        let (mut source, _) = pair();
        let err = source.initiate(&[node(false)], &relay).await.unwrap_err();
        assert!(matches!(err, MeshError::Unreachable { .. }));
        assert_eq!(source.state(), NegotiationState::Failed);
        assert!(relay.take().is_empty());

        let (mut again, _) = pair();
        assert!(again.initiate(&[], &relay).await.is_err());
    }

    #[tokio::test]
    async fn answer_relay_gone_fails_target() {
        let relay = MailRelay::default();
        let (mut source, mut target) = pair();
        source.initiate(&[node(true)], &relay).await.unwrap();
        let offer = relay.take().pop().unwrap();

        let err = target.accept_offer(&offer, &[node(false)], &relay).await.unwrap_err();
        assert!(matches!(err, MeshError::Unreachable { .. }));
        assert_eq!(target.state(), NegotiationState::Failed);
    }

    #[tokio::test]
    async fn answer_without_offer_is_rejected() {
        let relay = MailRelay::default();
        let (mut source, mut target) = pair();
        source.initiate(&[node(true)], &relay).await.unwrap();
        let offer = relay.take().pop().unwrap();
        target.accept_offer(&offer, &[node(true)], &relay).await.unwrap();
        let answer = relay.take().pop().unwrap();

        let (mut stranger, _) = pair();
        assert!(stranger.accept_answer(&answer).is_err());
        assert_eq!(stranger.state(), NegotiationState::Idle);
    }

    #[tokio::test]
    async fn candidates_are_accepted_in_any_state() {
        let relay = MailRelay::default();
        let nodes = vec![node(true)];
        let (mut source, mut target) = pair();
        source.initiate(&nodes, &relay).await.unwrap();
        source
            .send_candidates(&["http://10.0.0.2:7435".into()], &nodes, &relay)
            .await
            .unwrap();
        let mut mail = relay.take();
        let candidate = mail.pop().unwrap();
        let offer = mail.pop().unwrap();
        assert_eq!(candidate.kind, SignalKind::Candidate);

        // before the offer has been processed
        assert!(target.add_candidate(&candidate).unwrap());
        target.accept_offer(&offer, &nodes, &relay).await.unwrap();
        // after establishment: kept, no effect
        assert!(!target.add_candidate(&candidate).unwrap());
        assert_eq!(target.direct_endpoint(), Some("http://alice:7435"));
    }

    #[tokio::test]
    async fn candidate_serves_as_endpoint_when_description_has_none() {
        let relay = MailRelay::default();
        let nodes = vec![node(true)];
        let mut source = ConnectionNegotiator::new("alice".into(), "bob".into(), String::new());
        let mut target = ConnectionNegotiator::new("bob".into(), "alice".into(), "http://bob".into());
        source.initiate(&nodes, &relay).await.unwrap();
        source
            .send_candidates(&["http://alice-alt".into()], &nodes, &relay)
            .await
            .unwrap();
        let mut mail = relay.take();
        let candidate = mail.pop().unwrap();
        let offer = mail.pop().unwrap();
        target.accept_offer(&offer, &nodes, &relay).await.unwrap();
        target.add_candidate(&candidate).unwrap();
        assert_eq!(target.direct_endpoint(), Some("http://alice-alt"));
    }

    #[tokio::test(start_paused = true)]
    async fn pending_handshake_expires() {
        let relay = MailRelay::default();
        let (mut source, _) = pair();
        source.initiate(&[node(true)], &relay).await.unwrap();
        assert!(!source.is_expired(Instant::now(), Duration::from_secs(30)));
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(source.is_expired(Instant::now(), Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn malformed_payload_is_invalid_input() {
        let relay = MailRelay::default();
        let (mut source, mut target) = pair();
        source.initiate(&[node(true)], &relay).await.unwrap();
        let mut offer = relay.take().pop().unwrap();
        offer.payload = serde_json::json!({ "nonsense": true });
        let err = target.accept_offer(&offer, &[node(true)], &relay).await.unwrap_err();
        assert!(matches!(err, MeshError::InvalidInput { .. }));
    }
}
