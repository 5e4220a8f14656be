//! Sans-IO multi-decree Paxos with a distinguished leader.
//!
//! The engine owns no sockets or channels. Callers feed it inbound messages
//! via `handle` (or start a proposal via `propose`) and then perform the
//! returned `Action`s: protocol sends, and `Deliver` callbacks that surface
//! committed values in contiguous slot order. Because every member learns
//! commits itself, deliveries happen on all members, with `is_leader` set so
//! leader-only reactions stay possible.

use std::collections::{BTreeMap, HashMap};

use crate::quorum::AcceptanceTracker;
use crate::types::{MemberId, PaxosConfig, PaxosMessage, SlotId};

const BALLOT: u32 = 0;

/// Effect produced by the engine for the caller to execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Send `msg` to `to` on this instance's channel. `to` may be the local
    /// member; callers are expected to loop such sends back through `handle`.
    Send { to: MemberId, msg: PaxosMessage },
    /// `slot` is decided as `value`. Emitted in strictly increasing,
    /// contiguous slot order on every member.
    Deliver {
        slot: SlotId,
        value: u64,
        is_leader: bool,
    },
}

/// One member's state for one Paxos instance.
pub struct MultiPaxos {
    config: PaxosConfig,
    // Leader state.
    next_slot: SlotId,
    proposals: HashMap<SlotId, u64>,
    acceptances: HashMap<SlotId, AcceptanceTracker>,
    // Acceptor state.
    accepted: HashMap<SlotId, u64>,
    // Learner state.
    committed: BTreeMap<SlotId, u64>,
    next_deliver: SlotId,
}

impl MultiPaxos {
    pub fn new(config: PaxosConfig) -> Self {
        assert!(
            config.members.contains(&config.me),
            "member {} not in paxos group {:?}",
            config.me,
            config.members
        );
        Self {
            config,
            next_slot: 0,
            proposals: HashMap::new(),
            acceptances: HashMap::new(),
            accepted: HashMap::new(),
            committed: BTreeMap::new(),
            next_deliver: 0,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.config.leader() == self.config.me
    }

    /// Start ordering `value`. On a non-leader member this forwards the
    /// proposal to the leader.
    pub fn propose(&mut self, value: u64) -> Vec<Action> {
        if self.is_leader() {
            self.start_round(value)
        } else {
            vec![Action::Send {
                to: self.config.leader(),
                msg: PaxosMessage::Propose { value },
            }]
        }
    }

    /// Process one inbound protocol message.
    pub fn handle(&mut self, from: MemberId, msg: PaxosMessage) -> Vec<Action> {
        match msg {
            PaxosMessage::Propose { value } => {
                if !self.is_leader() {
                    tracing::warn!(from, value, "proposal sent to non-leader member; dropped");
                    return Vec::new();
                }
                self.start_round(value)
            }
            PaxosMessage::Accept { ballot, slot, value } => {
                if ballot != BALLOT {
                    tracing::warn!(from, ballot, slot, "accept with unexpected ballot; dropped");
                    return Vec::new();
                }
                self.accepted.insert(slot, value);
                vec![Action::Send {
                    to: from,
                    msg: PaxosMessage::Accepted { ballot, slot },
                }]
            }
            PaxosMessage::Accepted { ballot, slot } => {
                let Some(tracker) = self.acceptances.get_mut(&slot) else {
                    return Vec::new();
                };
                if tracker.ballot != ballot {
                    return Vec::new();
                }
                if !tracker.handle_response(from) {
                    return Vec::new();
                }
                let value = self.proposals[&slot];
                self.broadcast(PaxosMessage::Commit { slot, value })
            }
            PaxosMessage::Commit { slot, value } => {
                self.committed.insert(slot, value);
                self.drain_committed()
            }
        }
    }

    fn start_round(&mut self, value: u64) -> Vec<Action> {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.proposals.insert(slot, value);
        self.acceptances.insert(
            slot,
            AcceptanceTracker::new(self.config.members.len(), BALLOT, slot),
        );
        // The leader records its own acceptance through the same path as
        // everyone else: the Accept below includes a self-send.
        self.broadcast(PaxosMessage::Accept {
            ballot: BALLOT,
            slot,
            value,
        })
    }

    fn broadcast(&self, msg: PaxosMessage) -> Vec<Action> {
        self.config
            .members
            .iter()
            .map(|&to| Action::Send { to, msg })
            .collect()
    }

    fn drain_committed(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        while let Some(&value) = self.committed.get(&self.next_deliver) {
            actions.push(Action::Deliver {
                slot: self.next_deliver,
                value,
                is_leader: self.is_leader(),
            });
            self.committed.remove(&self.next_deliver);
            self.proposals.remove(&self.next_deliver);
            self.acceptances.remove(&self.next_deliver);
            self.accepted.remove(&self.next_deliver);
            self.next_deliver += 1;
        }
        actions
    }
}
