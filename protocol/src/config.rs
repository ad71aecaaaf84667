use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings shared by every coordination component.
///
/// Passed by value into constructors; nothing reads settings from a
/// global.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshSettings {
    /// Number of execution units the worker pool starts.
    pub max_workers: usize,
    /// Neighbour fan-out cap.
    pub max_peers: usize,
    pub results: ResultSettings,
    pub jobs: JobSettings,
    /// How long a peer whose handshake timed out is skipped when picking
    /// neighbours.
    #[serde(with = "millis")]
    pub timeout_retry_time: Duration,
    /// Upper bound of the Random Assessment Delay applied to each
    /// re-broadcast.
    #[serde(with = "millis")]
    pub rad_max: Duration,
    #[serde(with = "millis")]
    pub auto_save_interval: Duration,
    /// A handshake still unanswered after this long is abandoned.
    #[serde(with = "millis")]
    pub negotiation_timeout: Duration,
    /// Bounded memory of gossip message ids already handled.
    pub recent_message_capacity: usize,
    #[serde(with = "millis")]
    pub recent_message_ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultSettings {
    pub validation: ValidationSettings,
    /// Number of valid results the active project expects. `-1` means
    /// unknown, so the project is never considered complete.
    pub expected: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    pub enabled: bool,
    /// Independent computations required before a result is trusted.
    pub iterations: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSettings {
    /// Lease on a dispatched job; unacknowledged jobs are re-queued after it.
    #[serde(with = "millis")]
    pub max_lock_time: Duration,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_peers: 2,
            results: ResultSettings::default(),
            jobs: JobSettings::default(),
            timeout_retry_time: Duration::from_millis(60_000),
            rad_max: Duration::from_millis(1_500),
            auto_save_interval: Duration::from_secs(60),
            negotiation_timeout: Duration::from_secs(30),
            recent_message_capacity: 4_096,
            recent_message_ttl: Duration::from_secs(600),
        }
    }
}

impl Default for ResultSettings {
    fn default() -> Self {
        Self {
            validation: ValidationSettings::default(),
            expected: -1,
        }
    }
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            iterations: 3,
        }
    }
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            max_lock_time: Duration::from_secs(600),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
