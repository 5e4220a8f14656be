//! Quorum trackers counting distinct responders for one decree.

use std::collections::HashSet;

use crate::types::{MemberId, SlotId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuorumState {
    Incomplete,
    QuorumReached,
    Complete,
}

/// Counts distinct responders toward a quorum of `num_members`.
///
/// Duplicate responses from the same member are ignored, so retransmits over
/// a flaky link cannot inflate the count.
#[derive(Debug)]
pub struct QuorumTracker {
    num_members: usize,
    quorum: usize,
    responded: HashSet<MemberId>,
    state: QuorumState,
}

impl QuorumTracker {
    pub fn new(num_members: usize) -> Self {
        Self {
            num_members,
            quorum: num_members / 2 + 1,
            responded: HashSet::new(),
            state: QuorumState::Incomplete,
        }
    }

    /// Record a response. Returns true exactly once: when the quorum is
    /// first reached.
    pub fn handle_response(&mut self, from: MemberId) -> bool {
        if !self.responded.insert(from) {
            return false;
        }
        match self.state {
            QuorumState::Incomplete if self.responded.len() >= self.quorum => {
                self.state = if self.responded.len() == self.num_members {
                    QuorumState::Complete
                } else {
                    QuorumState::QuorumReached
                };
                true
            }
            QuorumState::QuorumReached if self.responded.len() == self.num_members => {
                self.state = QuorumState::Complete;
                false
            }
            _ => false,
        }
    }

    pub fn state(&self) -> QuorumState {
        self.state
    }
}

/// Tracks acceptances for one `(ballot, slot)` pair.
#[derive(Debug)]
pub struct AcceptanceTracker {
    pub ballot: u32,
    pub slot: SlotId,
    inner: QuorumTracker,
}

impl AcceptanceTracker {
    pub fn new(num_members: usize, ballot: u32, slot: SlotId) -> Self {
        Self {
            ballot,
            slot,
            inner: QuorumTracker::new(num_members),
        }
    }

    pub fn handle_response(&mut self, from: MemberId) -> bool {
        self.inner.handle_response(from)
    }

    pub fn state(&self) -> QuorumState {
        self.inner.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_reached_once_then_complete() {
        let mut tracker = QuorumTracker::new(3);
        assert!(!tracker.handle_response(1));
        assert_eq!(tracker.state(), QuorumState::Incomplete);

        assert!(tracker.handle_response(2));
        assert_eq!(tracker.state(), QuorumState::QuorumReached);

        // Duplicate responder does not advance anything.
        assert!(!tracker.handle_response(2));
        assert_eq!(tracker.state(), QuorumState::QuorumReached);

        assert!(!tracker.handle_response(3));
        assert_eq!(tracker.state(), QuorumState::Complete);
    }

    #[test]
    fn single_member_instance_is_quorum_of_one() {
        let mut tracker = QuorumTracker::new(1);
        assert!(tracker.handle_response(7));
        assert_eq!(tracker.state(), QuorumState::Complete);
    }
}
