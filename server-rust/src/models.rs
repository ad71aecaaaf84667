use chrono::{DateTime, Utc};
use meshwork_protocol::{Location, PeerId};
use serde::{Deserialize, Serialize};

/// A peer registered with this relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub uuid: PeerId,
    pub location: Location,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub node_uuid: String,
    pub uptime_secs: i64,
    pub peers: usize,
    pub queued_signals: usize,
    pub version: &'static str,
}
