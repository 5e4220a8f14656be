//! Remaster verification.
//!
//! Checks that the master metadata a transaction carries still matches the
//! partition's lookup index. A counter ahead of the index means the shard
//! saw a remaster this partition has not applied yet, so it waits; a counter
//! behind the index means the forwarder read stale metadata and the shard
//! must abort. Wait queues are per-key FIFOs, so unblocking preserves
//! submission order.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::storage::LookupMasterIndex;
use crate::types::{Key, ReplicaId, TxnId};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerifyMasterResult {
    Valid,
    Waiting,
    Abort,
}

/// Identity of a lock-only shard: the transaction plus the home it locks
/// on behalf of.
pub type TxnShardId = (TxnId, i32);

#[derive(Debug, Default)]
pub struct RemasterOccurredResult {
    /// Shards whose counters now match, in submission order.
    pub unblocked: Vec<TxnShardId>,
    /// Shards whose counters fell behind the new index value.
    pub should_abort: Vec<TxnShardId>,
}

#[derive(Debug)]
struct WaitingShard {
    shard: TxnShardId,
    /// The counter the shard carried for the blocked key.
    counter: u64,
}

/// Per-partition remaster check with per-key wait queues.
pub struct RemasterManager {
    index: Arc<LookupMasterIndex>,
    blocked: HashMap<Key, VecDeque<WaitingShard>>,
}

impl RemasterManager {
    pub fn new(index: Arc<LookupMasterIndex>) -> Self {
        Self {
            index,
            blocked: HashMap::new(),
        }
    }

    /// Check one shard's metadata against the index. On `Waiting` the shard
    /// is queued on the first ahead-of-index key and will resurface from
    /// `remaster_occurred`.
    pub fn verify_master(
        &mut self,
        shard: TxnShardId,
        keys: impl Iterator<Item = (Key, ReplicaId, u64)>,
    ) -> VerifyMasterResult {
        let mut waiting_on: Option<(Key, u64)> = None;
        for (key, master, counter) in keys {
            let current = self.index.get_or_default(&key);
            if counter < current.counter {
                return VerifyMasterResult::Abort;
            }
            if counter > current.counter {
                waiting_on.get_or_insert((key, counter));
                continue;
            }
            // Counters equal: the master must agree, or the metadata was
            // fabricated rather than stale.
            if master != current.master {
                return VerifyMasterResult::Abort;
            }
        }

        match waiting_on {
            Some((key, counter)) => {
                self.blocked
                    .entry(key)
                    .or_default()
                    .push_back(WaitingShard { shard, counter });
                VerifyMasterResult::Waiting
            }
            None => VerifyMasterResult::Valid,
        }
    }

    /// A remaster of `key` committed with `counter`. Walk the key's wait
    /// queue: matching counters unblock, lower counters abort, higher
    /// counters keep waiting for a later remaster.
    pub fn remaster_occurred(&mut self, key: &Key, counter: u64) -> RemasterOccurredResult {
        let mut result = RemasterOccurredResult::default();
        let Some(queue) = self.blocked.get_mut(key) else {
            return result;
        };

        let mut still_waiting = VecDeque::new();
        for waiting in queue.drain(..) {
            if waiting.counter == counter {
                result.unblocked.push(waiting.shard);
            } else if waiting.counter < counter {
                result.should_abort.push(waiting.shard);
            } else {
                still_waiting.push_back(waiting);
            }
        }

        if still_waiting.is_empty() {
            self.blocked.remove(key);
        } else {
            *self.blocked.get_mut(key).unwrap() = still_waiting;
        }
        result
    }

    pub fn num_blocked(&self) -> usize {
        self.blocked.values().map(VecDeque::len).sum()
    }
}
