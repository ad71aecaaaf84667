use async_trait::async_trait;
use meshwork_protocol::relay::{LookupRequest, PeerIndex, RegisterRequest, RegisterResponse};
use meshwork_protocol::{GossipNode, MeshError, NodePeerList, RelayChannel, RelayNode, Result, SignalEnvelope};
use serde::de::DeserializeOwned;
use std::time::Duration;

/// HTTP client for relay nodes.
pub struct RelayClient {
    http: reqwest::Client,
    token: Option<String>,
    timeout: Duration,
}

/// What one relay round trip produced.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub discovered: usize,
    pub signals: usize,
}

impl RelayClient {
    pub fn new(token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, token, timeout })
    }

    fn url(node: &RelayNode, path: &str) -> String {
        format!("http://{}:{}{}", node.host, node.port, path)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {token}")),
            None => req,
        }
    }

    fn map_err(&self, operation: &str, e: reqwest::Error) -> MeshError {
        if e.is_timeout() {
            MeshError::Timeout {
                operation: operation.to_string(),
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            MeshError::transport(format!("{operation}: {e}"))
        }
    }

    async fn read<T: DeserializeOwned>(&self, operation: &str, resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MeshError::not_found(operation.to_string()));
        }
        if !status.is_success() {
            return Err(MeshError::transport(format!("{operation}: HTTP {status}")));
        }
        resp.json().await.map_err(|e| self.map_err(operation, e))
    }

    pub async fn register(&self, node: &RelayNode, request: &RegisterRequest) -> Result<RegisterResponse> {
        let op = "register";
        let resp = self
            .auth(self.http.post(Self::url(node, "/api/peers/register")))
            .json(request)
            .send()
            .await
            .map_err(|e| self.map_err(op, e))?;
        self.read(op, resp).await
    }

    pub async fn index(&self, node: &RelayNode) -> Result<PeerIndex> {
        let op = "peer index";
        let resp = self
            .auth(self.http.get(Self::url(node, "/api/peers/index")))
            .send()
            .await
            .map_err(|e| self.map_err(op, e))?;
        self.read(op, resp).await
    }

    pub async fn lookup(&self, node: &RelayNode, uuids: Vec<String>) -> Result<NodePeerList> {
        let op = "peer lookup";
        let resp = self
            .auth(self.http.post(Self::url(node, "/api/peers/lookup")))
            .json(&LookupRequest { uuids })
            .send()
            .await
            .map_err(|e| self.map_err(op, e))?;
        self.read(op, resp).await
    }

    /// Drain our signaling mailbox on `node`.
    pub async fn poll(&self, node: &RelayNode, peer: &str) -> Result<Vec<SignalEnvelope>> {
        let op = "signal poll";
        let resp = self
            .auth(self.http.get(Self::url(node, &format!("/api/signal/{peer}"))))
            .send()
            .await
            .map_err(|e| self.map_err(op, e))?;
        self.read(op, resp).await
    }

    /// One round trip with a relay: register, discover missing peers and
    /// hand queued signals to the mesh. Keeps the node's connectivity flag
    /// current.
    pub async fn sync_node(&self, mesh: &GossipNode, node: &RelayNode) -> Result<SyncReport> {
        let outcome = self.exchange(mesh, node).await;
        match &outcome {
            Ok(_) => mesh.set_node_connected(&node.uuid, true).await,
            Err(e) if e.is_transient() => {
                tracing::warn!(node = %node.uuid, host = %node.host, error = %e, "Relay unreachable");
                mesh.set_node_connected(&node.uuid, false).await;
            }
            Err(e) => tracing::warn!(node = %node.uuid, error = %e, "Relay sync failed"),
        }
        outcome
    }

    async fn exchange(&self, mesh: &GossipNode, node: &RelayNode) -> Result<SyncReport> {
        let request = RegisterRequest {
            uuid: mesh.peer_id().to_string(),
            location: mesh.peers.location(),
        };
        let registered = self.register(node, &request).await?;
        if registered.node_uuid != node.uuid {
            tracing::warn!(
                expected = %node.uuid,
                reported = %registered.node_uuid,
                "Relay reports a different node uuid"
            );
        }

        let mut report = SyncReport::default();
        let index = self.index(node).await?;
        let missing = mesh.missing_peers(&index.uuids).await;
        if !missing.is_empty() {
            let mut list = self.lookup(node, missing).await?;
            list.node_uuid = node.uuid.clone();
            report.discovered = mesh.update_peers(&[list]).await;
        }

        for envelope in self.poll(node, mesh.peer_id()).await? {
            report.signals += 1;
            let kind = envelope.kind;
            let from = envelope.source_peer_uuid.clone();
            if let Err(e) = mesh.handle_signal(envelope).await {
                tracing::warn!(peer = %from, ?kind, error = %e, "Signal rejected");
            }
        }
        Ok(report)
    }
}

#[async_trait]
impl RelayChannel for RelayClient {
    async fn send(&self, node: &RelayNode, envelope: &SignalEnvelope) -> Result<()> {
        let op = "signal send";
        let resp = self
            .auth(self.http.post(Self::url(node, "/api/signal")))
            .json(envelope)
            .send()
            .await
            .map_err(|e| self.map_err(op, e))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MeshError::Unreachable {
                peer: envelope.target_peer_uuid.clone(),
                reason: format!("not registered with node {}", node.uuid),
            });
        }
        if !status.is_success() {
            return Err(MeshError::transport(format!("{op}: HTTP {status}")));
        }
        Ok(())
    }
}
