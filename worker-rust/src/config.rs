use meshwork_protocol::{Location, MeshSettings};
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub peer_id: String,
    pub location: Location,
    pub listen_addr: String,
    /// Gossip endpoints advertised to peers, preferred first.
    pub endpoints: Vec<String>,
    /// Relay nodes as `host:port`.
    pub relays: Vec<String>,
    pub auth_token: Option<String>,
    pub data_dir: PathBuf,
    pub files_dir: PathBuf,
    pub work_dir: PathBuf,
    pub program: String,
    pub program_args: Vec<String>,
    pub job_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub mesh: MeshSettings,
}

/// Split a relay address into host and port. A scheme prefix is ignored.
pub fn parse_relay(addr: &str) -> Option<(String, u16)> {
    let addr = addr
        .trim()
        .trim_start_matches("http://")
        .trim_end_matches('/');
    let (host, port) = addr.rsplit_once(':')?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
