//! Meshwork Protocol
//!
//! Every peer in a meshwork is both a producer and a consumer of work.
//! Peers find each other through relay nodes, open direct channels to
//! their closest neighbours and gossip jobs and results over them.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────┐  gossip   ┌──────┐  gossip   ┌──────┐
//!  │Peer A│◄─────────►│Peer B│◄─────────►│Peer C│
//!  └──────┘           └──────┘           └──────┘
//!     ▲  signaling       ▲                  ▲
//!     └──────────────┐   │   ┌──────────────┘
//!                  ┌─┴───┴───┴─┐
//!                  │ relay node │
//!                  └────────────┘
//! ```
//!
//! ## Discovery
//! - Peers register their location with one or more relay nodes
//! - Relay nodes report who else is registered
//! - Each peer keeps the `max_peers` closest peers as neighbours
//!
//! ## Job Distribution
//! - Jobs are identified by the hash of their parameters
//! - New jobs and results are re-broadcast after a random delay
//! - A result is valid once enough peers computed the same data

pub mod cache;
pub mod config;
pub mod error;
pub mod gossip;
pub mod hash;
pub mod ledger;
pub mod negotiator;
pub mod peer;
pub mod recent;
pub mod relay;
pub mod store;
pub mod types;

pub use cache::{AutoSave, CacheRecord, ValidationCache};
pub use config::MeshSettings;
pub use error::{MeshError, Result};
pub use gossip::{GossipNode, LocalPeer, MeshStatus};
pub use hash::content_hash;
pub use ledger::{JobLedger, LedgerOutcome, ResultLedger};
pub use negotiator::{ConnectionNegotiator, NegotiationState};
pub use peer::{ConnectionRole, Peer, PeerRegistry, PeerTransport};
pub use relay::RelayChannel;
pub use store::{MemoryStore, Store};
pub use types::*;
