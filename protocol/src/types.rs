use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::hash::content_hash;

/// Peer identifier. Peers are never addressed by anything else.
pub type PeerId = String;

/// Relay node identifier, `hash(host + port)`.
pub type NodeId = String;

/// Opaque job parameters as produced by a job author.
pub type Parameters = serde_json::Map<String, Value>;

/// A unit of work. Its uuid is the content hash of its parameters, so two
/// peers producing the same parameters produce the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub uuid: String,
    pub parameters: Parameters,
    pub peer_uuid: PeerId,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(default)]
    pub is_complete: bool,
}

impl Job {
    pub fn new(parameters: Parameters, peer_uuid: impl Into<PeerId>) -> Result<Self> {
        Ok(Self {
            uuid: content_hash(&parameters)?,
            parameters,
            peer_uuid: peer_uuid.into(),
            is_locked: false,
            is_complete: false,
        })
    }

    /// True when the uuid really is the hash of the parameters. Jobs from
    /// other peers are checked before they are queued.
    pub fn has_valid_uuid(&self) -> bool {
        content_hash(&self.parameters)
            .map(|h| h == self.uuid)
            .unwrap_or(false)
    }

    /// Names of input files the job needs before it can run.
    pub fn input_files(&self) -> Vec<String> {
        self.parameters
            .get("files")
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Uuid of a result this job consumes, if any.
    pub fn dependency(&self) -> Option<&str> {
        self.parameters.get("depends_on").and_then(Value::as_str)
    }
}

/// The output of one or more computations of the same job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub uuid: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_uuid: Option<String>,
    pub peer_uuid: PeerId,
    /// Independent computations folded into this result.
    pub iteration: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_valid: bool,
}

impl JobResult {
    /// Result of computing `job`. Every computation of the same job shares
    /// one uuid, which is what lets recomputations be counted.
    pub fn for_job(job: &Job, data: Value, peer_uuid: impl Into<PeerId>) -> Result<Self> {
        Ok(Self {
            uuid: content_hash(&job.uuid)?,
            data,
            job_uuid: Some(job.uuid.clone()),
            peer_uuid: peer_uuid.into(),
            iteration: 1,
            timestamp: Utc::now(),
            is_valid: false,
        })
    }

    /// Result not tied to a job; addressed by its payload.
    pub fn standalone(data: Value, peer_uuid: impl Into<PeerId>) -> Result<Self> {
        Ok(Self {
            uuid: content_hash(&data)?,
            data,
            job_uuid: None,
            peer_uuid: peer_uuid.into(),
            iteration: 1,
            timestamp: Utc::now(),
            is_valid: false,
        })
    }
}

/// Geographic position used to rank neighbours.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub long: f64,
}

/// What a relay node knows about one of its peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerAnnouncement {
    pub uuid: PeerId,
    pub location: Location,
    #[serde(default)]
    pub nodes: Vec<NodeId>,
}

/// Peer data as delivered by one relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePeerList {
    pub node_uuid: NodeId,
    pub peers: Vec<PeerAnnouncement>,
}

/// A rendezvous server used only for signaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNode {
    pub uuid: NodeId,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub is_connected: bool,
}

impl RelayNode {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        Ok(Self {
            uuid: Self::uuid_for(&host, port)?,
            host,
            port,
            is_connected: false,
        })
    }

    pub fn uuid_for(host: &str, port: u16) -> Result<NodeId> {
        content_hash(&format!("{host}{port}"))
    }
}

/// Messages gossiped between directly connected peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipMessage {
    Job { origin: PeerId, job: Job },
    Result { origin: PeerId, result: JobResult },
}

impl GossipMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Job { .. } => "job",
            Self::Result { .. } => "result",
        }
    }

    pub fn origin(&self) -> &str {
        match self {
            Self::Job { origin, .. } | Self::Result { origin, .. } => origin,
        }
    }

    /// Identity of this announcement for duplicate suppression.
    ///
    /// A job is identified by its uuid. A result is identified by the
    /// computation that produced it (uuid, computing peer, timestamp), so
    /// the same computation relayed along two paths is seen once while a
    /// second independent computation still counts.
    pub fn message_id(&self) -> Result<String> {
        match self {
            Self::Job { job, .. } => Ok(format!("job:{}", job.uuid)),
            Self::Result { result, .. } => {
                let id = content_hash(&(&result.uuid, &result.peer_uuid, result.timestamp))?;
                Ok(format!("result:{id}"))
            }
        }
    }
}

/// Handshake message types carried by relay nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalKind {
    #[serde(rename = "peer:offer")]
    Offer,
    #[serde(rename = "peer:answer")]
    Answer,
    #[serde(rename = "peer:candidate")]
    Candidate,
}

/// A signaling message in transit through a relay node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub kind: SignalKind,
    pub source_peer_uuid: PeerId,
    pub target_peer_uuid: PeerId,
    pub node_uuid: NodeId,
    pub payload: Value,
}

impl SignalEnvelope {
    pub fn validate(&self) -> Result<()> {
        if self.source_peer_uuid.is_empty() || self.target_peer_uuid.is_empty() {
            return Err(MeshError::invalid("signal without source or target peer"));
        }
        if self.source_peer_uuid == self.target_peer_uuid {
            return Err(MeshError::invalid("signal addressed to its own sender"));
        }
        Ok(())
    }
}
