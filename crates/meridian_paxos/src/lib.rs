//! Paxos module wiring.
//!
//! `multi_paxos` contains the sans-IO consensus engine, `quorum` the response
//! trackers, and `types` the shared message/config contracts. The engine is
//! driven by whoever owns the network: callers feed inbound messages in and
//! execute the returned actions (sends and in-order deliveries).

mod multi_paxos;
mod quorum;
mod types;

pub use multi_paxos::{Action, MultiPaxos};
pub use quorum::{AcceptanceTracker, QuorumState, QuorumTracker};
pub use types::{MemberId, PaxosConfig, PaxosMessage, SlotId, DEFAULT_LEADER_POSITION};
