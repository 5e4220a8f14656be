//! Deterministic deadlock-resolving (DDR) lock manager.
//!
//! Locks are granted in the order transactions arrive from the local log,
//! on the composite key `(key, home replica)`. Only the tail of each lock
//! queue is recorded; releases do not erase tail entries, so any recorded
//! predecessor whose `txn_info` entry is gone is treated as already released.
//! Dependencies live in a waited-by graph with per-transaction counters.
//! Because every edge points from an earlier log position to a later one,
//! the graph is acyclic and no deadlock can form.

use std::collections::HashMap;

use serde_json::json;

use crate::stats;
use crate::transaction::KeyType;
use crate::types::{Key, ReplicaId, TxnId};

/// Composite lock key, string-joined so one table covers every home.
pub type KeyReplica = String;

pub fn make_key_replica(key: &Key, home: ReplicaId) -> KeyReplica {
    format!("{key}\u{1f}{home}")
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireLocksResult {
    Acquired,
    Waiting,
    Abort,
}

/// One lock request of a transaction shard: which `(key, home)` to lock and
/// in which mode.
#[derive(Clone, Debug)]
pub struct LockRequest {
    pub key_replica: KeyReplica,
    pub key_type: KeyType,
}

/// The scheduler-side view of a transaction handed to the lock manager.
#[derive(Clone, Debug)]
pub struct LockableShard {
    pub txn_id: TxnId,
    /// Total shards this transaction splits into at this partition.
    pub expected_parts: i32,
    pub requests: Vec<LockRequest>,
    /// Set when the remaster manager has already flagged an abort.
    pub aborting: bool,
}

impl LockableShard {
    /// Build the lock request list from a shard's local key set. Lock-only
    /// shards lock on behalf of their home; remaster shards therefore cover
    /// both the old and new `(key, replica)` pairs across their two shards.
    pub fn from_txn(txn: &crate::transaction::Transaction, expected_parts: i32) -> Self {
        let home = txn.home.max(0) as ReplicaId;
        let requests = txn
            .keys
            .iter()
            .map(|(key, entry)| LockRequest {
                key_replica: make_key_replica(key, home),
                key_type: entry.key_type,
            })
            .collect();
        Self {
            txn_id: txn.id,
            expected_parts,
            requests,
            aborting: txn.status == crate::transaction::TransactionStatus::Aborted,
        }
    }
}

/// Tail of one lock queue. Released transactions linger here until the tail
/// is overwritten; `txn_info` is the source of truth for liveness.
#[derive(Clone, Debug, Default)]
struct LockQueueTail {
    write_requester: Option<TxnId>,
    read_requesters: Vec<TxnId>,
}

impl LockQueueTail {
    /// Record a read request; the predecessor is the recorded writer.
    fn acquire_read_lock(&mut self, txn_id: TxnId) -> Option<TxnId> {
        self.read_requesters.push(txn_id);
        self.write_requester
    }

    /// Record a write request; predecessors are the recorded writer and all
    /// recorded readers, which the new writer supersedes.
    fn acquire_write_lock(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let mut predecessors = Vec::new();
        if let Some(writer) = self.write_requester {
            predecessors.push(writer);
        }
        predecessors.extend(self.read_requesters.iter().copied());
        self.write_requester = Some(txn_id);
        self.read_requesters.clear();
        predecessors
    }
}

#[derive(Clone, Debug)]
struct TxnInfo {
    waited_by: Vec<TxnId>,
    waiting_for_cnt: i32,
    pending_parts: i32,
}

impl TxnInfo {
    fn is_ready(&self) -> bool {
        self.waiting_for_cnt == 0 && self.pending_parts == 0
    }
}

/// Capability set every lock-manager variant exposes. The variant is chosen
/// by deployment configuration.
pub trait LockManager: Send {
    /// Count one arrived shard toward the transaction's expected total.
    /// Returns true when the transaction has all parts and all locks.
    fn accept_transaction(&mut self, shard: &LockableShard) -> bool;

    /// Request the shard's locks in log order.
    fn acquire_locks(&mut self, shard: &LockableShard) -> AcquireLocksResult;

    fn accept_txn_and_acquire_locks(&mut self, shard: &LockableShard) -> AcquireLocksResult;

    /// Release everything `txn_id` holds or waits for, returning the
    /// transactions that become ready because of it.
    fn release_locks(&mut self, txn_id: TxnId) -> Vec<TxnId>;

    fn stats(&self, level: u32) -> serde_json::Value;
}

/// Construct the configured lock-manager variant.
pub fn build_lock_manager(variant: &str) -> Box<dyn LockManager> {
    match variant {
        "ddr" => Box::new(DdrLockManager::new()),
        other => panic!("unknown lock manager variant: {other}"),
    }
}

#[derive(Default)]
pub struct DdrLockManager {
    lock_table: HashMap<KeyReplica, LockQueueTail>,
    txn_info: HashMap<TxnId, TxnInfo>,
}

impl DdrLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn info_entry(&mut self, shard: &LockableShard) -> &mut TxnInfo {
        self.txn_info.entry(shard.txn_id).or_insert_with(|| TxnInfo {
            waited_by: Vec::new(),
            waiting_for_cnt: 0,
            pending_parts: shard.expected_parts,
        })
    }
}

impl LockManager for DdrLockManager {
    fn accept_transaction(&mut self, shard: &LockableShard) -> bool {
        let info = self.info_entry(shard);
        info.pending_parts -= 1;
        info.is_ready()
    }

    fn acquire_locks(&mut self, shard: &LockableShard) -> AcquireLocksResult {
        if shard.aborting {
            return AcquireLocksResult::Abort;
        }
        assert!(
            self.txn_info.contains_key(&shard.txn_id),
            "lock acquisition for txn {} before it was accepted",
            shard.txn_id
        );

        let mut predecessors = Vec::new();
        for request in &shard.requests {
            let tail = self.lock_table.entry(request.key_replica.clone()).or_default();
            match request.key_type {
                KeyType::Read => {
                    if let Some(writer) = tail.acquire_read_lock(shard.txn_id) {
                        predecessors.push(writer);
                    }
                }
                KeyType::Write => {
                    predecessors.extend(tail.acquire_write_lock(shard.txn_id));
                }
            }
        }

        let mut new_waits = 0;
        for predecessor in predecessors {
            if predecessor == shard.txn_id {
                continue;
            }
            // A predecessor without txn_info has already released; the tail
            // entry is stale and must not create an edge.
            if let Some(info) = self.txn_info.get_mut(&predecessor) {
                info.waited_by.push(shard.txn_id);
                new_waits += 1;
            }
        }

        let info = self
            .txn_info
            .get_mut(&shard.txn_id)
            .expect("txn_info created by accept_transaction");
        info.waiting_for_cnt += new_waits;
        if info.is_ready() {
            AcquireLocksResult::Acquired
        } else {
            AcquireLocksResult::Waiting
        }
    }

    fn accept_txn_and_acquire_locks(&mut self, shard: &LockableShard) -> AcquireLocksResult {
        self.accept_transaction(shard);
        self.acquire_locks(shard)
    }

    fn release_locks(&mut self, txn_id: TxnId) -> Vec<TxnId> {
        let Some(info) = self.txn_info.remove(&txn_id) else {
            return Vec::new();
        };
        let mut newly_ready = Vec::new();
        for waiter in info.waited_by {
            if let Some(waiter_info) = self.txn_info.get_mut(&waiter) {
                waiter_info.waiting_for_cnt -= 1;
                if waiter_info.is_ready() && !newly_ready.contains(&waiter) {
                    newly_ready.push(waiter);
                }
            }
        }
        newly_ready
    }

    fn stats(&self, level: u32) -> serde_json::Value {
        let num_waiting = self
            .txn_info
            .values()
            .filter(|info| !info.is_ready())
            .count();
        let mut out = json!({
            (stats::NUM_ALL_TXNS): self.txn_info.len(),
            (stats::NUM_LOCKED_KEYS): self.lock_table.len(),
            (stats::NUM_TXNS_WAITING_FOR_LOCK): num_waiting,
            (stats::LOCK_TABLE_TYPE): "ddr",
        });
        if level >= 1 {
            let waits: HashMap<String, i32> = self
                .txn_info
                .iter()
                .map(|(id, info)| (id.to_string(), info.waiting_for_cnt))
                .collect();
            out[stats::NUM_LOCKS_WAITED_PER_TXN] = json!(waits);
            let graph: HashMap<String, Vec<TxnId>> = self
                .txn_info
                .iter()
                .map(|(id, info)| (id.to_string(), info.waited_by.clone()))
                .collect();
            out[stats::LOCK_WAITED_BY_GRAPH] = json!(graph);
        }
        if level >= 2 {
            let table: HashMap<String, serde_json::Value> = self
                .lock_table
                .iter()
                .take(stats::LOCK_TABLE_SIZE_LIMIT)
                .map(|(key, tail)| {
                    (
                        key.clone(),
                        json!({
                            "write_requester": tail.write_requester,
                            "read_requesters": tail.read_requesters,
                        }),
                    )
                })
                .collect();
            out[stats::LOCK_TABLE] = json!(table);
        }
        out
    }
}
