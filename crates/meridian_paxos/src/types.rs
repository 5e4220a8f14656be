//! Shared types for the simulated multi-decree Paxos engine.

use serde::{Deserialize, Serialize};

/// Identifier of a Paxos group member. Members are machines, so this matches
/// the deployment's machine-id space.
pub type MemberId = u32;
/// Position in the totally ordered log of one Paxos instance.
pub type SlotId = u32;

/// Position of the distinguished leader within the member list.
pub const DEFAULT_LEADER_POSITION: usize = 0;

/// Membership and identity of one Paxos instance.
#[derive(Clone, Debug)]
pub struct PaxosConfig {
    /// Ordered member list; identical on every member.
    pub members: Vec<MemberId>,
    /// This member's id. Must appear in `members`.
    pub me: MemberId,
    /// Index into `members` of the distinguished proposer.
    pub leader_position: usize,
}

impl PaxosConfig {
    pub fn leader(&self) -> MemberId {
        self.members[self.leader_position]
    }

    pub fn quorum(&self) -> usize {
        self.members.len() / 2 + 1
    }
}

/// Protocol messages exchanged between members of one instance.
///
/// The deployment assumes a fixed leader and reliable in-order links, so no
/// ballot contests happen in practice; the ballot still travels with accepts
/// so a competing round is detectable rather than silently merged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaxosMessage {
    /// Ask the leader to order `value`. Forwarded by non-leader members.
    Propose { value: u64 },
    /// Leader asks a member to accept `value` at `slot`.
    Accept { ballot: u32, slot: SlotId, value: u64 },
    /// Member acknowledges an accept.
    Accepted { ballot: u32, slot: SlotId },
    /// Leader announces that `slot` is decided.
    Commit { slot: SlotId, value: u64 },
}
