use async_trait::async_trait;
use meshwork_protocol::{GossipMessage, MeshError, Peer, PeerTransport, Result};
use std::time::Duration;

/// Gossip delivery over HTTP: `POST {endpoint}/gossip`.
pub struct HttpTransport {
    http: reqwest::Client,
    token: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, token, timeout })
    }

    fn map_err(&self, operation: String, e: reqwest::Error) -> MeshError {
        if e.is_timeout() {
            MeshError::Timeout {
                operation,
                millis: self.timeout.as_millis() as u64,
            }
        } else {
            MeshError::transport(format!("{operation}: {e}"))
        }
    }
}

pub fn gossip_url(endpoint: &str) -> String {
    format!("{}/gossip", endpoint.trim_end_matches('/'))
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send(&self, peer: &Peer, message: &GossipMessage) -> Result<()> {
        let endpoint = peer.endpoint.as_deref().ok_or_else(|| MeshError::Unreachable {
            peer: peer.uuid.clone(),
            reason: "no direct endpoint".into(),
        })?;
        let mut req = self.http.post(gossip_url(endpoint)).json(message);
        if let Some(token) = &self.token {
            req = req.header("Authorization", format!("Bearer {token}"));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| self.map_err(format!("gossip to {}", peer.uuid), e))?;
        if !resp.status().is_success() {
            return Err(MeshError::transport(format!(
                "gossip to {} got HTTP {}",
                peer.uuid,
                resp.status()
            )));
        }
        Ok(())
    }
}
