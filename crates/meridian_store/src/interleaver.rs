//! Local-log interleaving.
//!
//! `LocalLog` merges per-queue batch streams into one serial log: batch data
//! arrives tagged with its position in the origin queue (and may arrive out
//! of order), while slots arrive from the ordering layer. A batch is emitted
//! only when it is the head of the smallest pending slot's queue, so every
//! machine drains the same per-queue sequences.
//!
//! The `Interleaver` module wraps a `LocalLog`: it stores batch data,
//! propagates single-home orders from the local replica's Paxos to the same
//! partition in other replicas, splits multi-home batches into per-home
//! lock-only shards, and forwards transactions to the local scheduler.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};

use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::transaction::{
    generate_lock_only_txn, unbatch, Transaction, TransactionType, TxnEvent,
};
use crate::types::{
    Batch, BatchId, Envelope, ForwardBatch, ForwardTxn, LocalQueueOrder, Message, QueueId, Request,
    SlotId, MAX_NUM_MACHINES,
};

#[derive(Default)]
struct QueueState {
    next_position: u64,
    /// Batches that arrived ahead of their contiguous position.
    out_of_order: HashMap<u64, BatchId>,
    /// Batches released in position order, awaiting a slot.
    ready: VecDeque<BatchId>,
}

/// Merges per-queue batch id streams with the slot order into one serial
/// sequence of `(slot, batch_id)` pairs.
#[derive(Default)]
pub struct LocalLog {
    queues: HashMap<QueueId, QueueState>,
    pending_slots: BinaryHeap<Reverse<(SlotId, QueueId)>>,
}

impl LocalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch_id(&mut self, queue_id: QueueId, position: u64, batch_id: BatchId) {
        let queue = self.queues.entry(queue_id).or_default();
        queue.out_of_order.insert(position, batch_id);
        while let Some(batch_id) = queue.out_of_order.remove(&queue.next_position) {
            queue.ready.push_back(batch_id);
            queue.next_position += 1;
        }
    }

    pub fn add_slot(&mut self, slot_id: SlotId, queue_id: QueueId) {
        self.pending_slots.push(Reverse((slot_id, queue_id)));
    }

    /// Non-consuming check: is the head slot's queue ready to emit?
    pub fn has_next_batch(&self) -> bool {
        let Some(Reverse((_, queue_id))) = self.pending_slots.peek() else {
            return false;
        };
        self.queues
            .get(queue_id)
            .map(|queue| !queue.ready.is_empty())
            .unwrap_or(false)
    }

    /// Pop the head `(slot, batch_id)` pair. Callers must check
    /// `has_next_batch` first.
    pub fn next_batch(&mut self) -> (SlotId, BatchId) {
        assert!(self.has_next_batch(), "next_batch called with no ready batch");
        let Reverse((slot_id, queue_id)) = self.pending_slots.pop().unwrap();
        let batch_id = self
            .queues
            .get_mut(&queue_id)
            .and_then(|queue| queue.ready.pop_front())
            .unwrap();
        (slot_id, batch_id)
    }
}

/// The interleaver module of one machine.
pub struct Interleaver {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    local_log: LocalLog,
    batch_data: HashMap<BatchId, Batch>,
}

impl Interleaver {
    pub fn new(config: NodeConfig, sender: Sender, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            config,
            sender,
            rx,
            local_log: LocalLog::new(),
            batch_data: HashMap::new(),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(env) = self.rx.recv().await {
            self.handle(env);
        }
    }

    fn handle(&mut self, env: Envelope) {
        let Message::Request(request) = env.message else {
            return;
        };
        match request {
            Request::ForwardBatch(ForwardBatch::BatchData {
                batch,
                same_origin_position,
            }) => {
                let queue_id = if batch.batch_type == TransactionType::MultiHomeOrLockOnly {
                    self.config.mh_queue_id(self.config.local_replica())
                } else {
                    env.from as QueueId
                };
                self.local_log
                    .add_batch_id(queue_id, same_origin_position, batch.id);
                self.batch_data.insert(batch.id, batch);
            }
            Request::LocalQueueOrder(order) => {
                self.maybe_propagate_order(env.from, order);
                self.local_log.add_slot(order.slot, order.queue_id);
            }
            other => {
                tracing::warn!(?other, "interleaver received unexpected request");
                return;
            }
        }
        self.advance();
    }

    /// Single-home orders decided by the local replica's Paxos are forwarded
    /// once per partition to the same partition of every other replica.
    /// Orders arriving from another replica were already propagated at the
    /// origin, and multi-home orders are emitted per replica by its orderer.
    fn maybe_propagate_order(&self, from: crate::types::MachineId, order: LocalQueueOrder) {
        let is_single_home_queue = (order.queue_id as u64) < MAX_NUM_MACHINES;
        if !is_single_home_queue || self.config.replica_of(from) != self.config.local_replica() {
            return;
        }
        for replica in 0..self.config.num_replicas() {
            if replica == self.config.local_replica() {
                continue;
            }
            let target = self
                .config
                .make_machine_id(replica, self.config.local_partition());
            self.sender.send_request(
                Request::LocalQueueOrder(order),
                target,
                self.config.channels().interleaver,
            );
        }
    }

    fn advance(&mut self) {
        while self.local_log.has_next_batch() {
            let (slot, batch_id) = self.local_log.next_batch();
            let Some(batch) = self.batch_data.remove(&batch_id) else {
                panic!("batch {batch_id} was ready in the local log without data");
            };
            tracing::debug!(
                slot,
                batch_id,
                machine = self.config.local_machine_id(),
                "draining batch into scheduler"
            );
            let batch_type = batch.batch_type;
            for mut txn in unbatch(batch) {
                txn.record_event(TxnEvent::EnterInterleaver, self.config.local_machine_id());
                if batch_type == TransactionType::MultiHomeOrLockOnly {
                    self.forward_lock_only_shards(txn);
                } else {
                    self.forward_to_scheduler(txn);
                }
            }
        }
    }

    fn forward_lock_only_shards(&self, txn: Transaction) {
        for &replica in txn.involved_replicas.iter() {
            let shard = generate_lock_only_txn(&txn, replica);
            self.forward_to_scheduler(shard);
        }
    }

    fn forward_to_scheduler(&self, txn: Transaction) {
        self.sender
            .send_local(Request::ForwardTxn(ForwardTxn { txn }), self.config.channels().scheduler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_single_queue() {
        let mut log = LocalLog::new();
        log.add_batch_id(111, 0, 100);
        assert!(!log.has_next_batch());

        log.add_slot(0, 111);
        assert_eq!(log.next_batch(), (0, 100));

        log.add_batch_id(222, 0, 200);
        assert!(!log.has_next_batch());

        log.add_slot(1, 222);
        assert_eq!(log.next_batch(), (1, 200));

        assert!(!log.has_next_batch());
    }

    #[test]
    fn batches_come_first_across_queues() {
        let mut log = LocalLog::new();
        log.add_batch_id(222, 0, 100);
        log.add_batch_id(111, 0, 200);
        log.add_batch_id(333, 0, 300);
        log.add_batch_id(333, 1, 400);

        log.add_slot(0, 111);
        assert_eq!(log.next_batch(), (0, 200));
        log.add_slot(1, 333);
        assert_eq!(log.next_batch(), (1, 300));
        log.add_slot(2, 222);
        assert_eq!(log.next_batch(), (2, 100));
        log.add_slot(3, 333);
        assert_eq!(log.next_batch(), (3, 400));

        assert!(!log.has_next_batch());
    }

    #[test]
    fn slots_come_first() {
        let mut log = LocalLog::new();
        log.add_slot(2, 222);
        log.add_slot(1, 333);
        log.add_slot(3, 333);
        log.add_slot(0, 111);

        log.add_batch_id(111, 0, 200);
        assert_eq!(log.next_batch(), (0, 200));
        log.add_batch_id(333, 0, 300);
        assert_eq!(log.next_batch(), (1, 300));
        log.add_batch_id(222, 0, 100);
        assert_eq!(log.next_batch(), (2, 100));
        log.add_batch_id(333, 1, 400);
        assert_eq!(log.next_batch(), (3, 400));

        assert!(!log.has_next_batch());
    }

    #[test]
    fn same_origin_out_of_order_waits_for_position_zero() {
        let mut log = LocalLog::new();
        log.add_batch_id(111, 1, 200);
        log.add_batch_id(111, 2, 300);

        log.add_slot(0, 111);
        assert!(!log.has_next_batch());
        log.add_slot(1, 111);
        assert!(!log.has_next_batch());

        log.add_batch_id(111, 0, 100);
        log.add_slot(2, 111);
        assert!(log.has_next_batch());

        assert_eq!(log.next_batch(), (0, 100));
        assert_eq!(log.next_batch(), (1, 200));
        assert_eq!(log.next_batch(), (2, 300));
        assert!(!log.has_next_batch());
    }

    #[test]
    fn multiple_ready_batches_drain_in_slot_order() {
        let mut log = LocalLog::new();
        log.add_batch_id(111, 0, 300);
        log.add_batch_id(222, 0, 100);
        log.add_batch_id(333, 0, 400);
        log.add_batch_id(333, 1, 200);

        log.add_slot(3, 333);
        log.add_slot(1, 333);
        log.add_slot(2, 111);
        log.add_slot(0, 222);

        assert_eq!(log.next_batch(), (0, 100));
        assert_eq!(log.next_batch(), (1, 400));
        assert_eq!(log.next_batch(), (2, 300));
        assert_eq!(log.next_batch(), (3, 200));
        assert!(!log.has_next_batch());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        #[derive(Clone, Debug)]
        enum LogEvent {
            Batch {
                queue: QueueId,
                position: u64,
                batch_id: BatchId,
            },
            Slot {
                slot: SlotId,
                queue: QueueId,
            },
        }

        /// Build a consistent event set: each queue gets a contiguous run of
        /// positions, and slots assign the lanes round by round.
        fn event_set(queue_sizes: Vec<u8>) -> (Vec<LogEvent>, Vec<(SlotId, BatchId)>) {
            let mut events = Vec::new();
            let mut lane_turns = Vec::new();
            for (q, &size) in queue_sizes.iter().enumerate() {
                let queue = 100 + q as QueueId;
                for position in 0..size as u64 {
                    let batch_id = (queue as BatchId) * 1000 + position;
                    events.push(LogEvent::Batch {
                        queue,
                        position,
                        batch_id,
                    });
                    lane_turns.push(queue);
                }
            }
            // Deterministic slot assignment: queue turns in lane order.
            let mut expected = Vec::new();
            for (slot, &queue) in lane_turns.iter().enumerate() {
                events.push(LogEvent::Slot {
                    slot: slot as SlotId,
                    queue,
                });
                let position = lane_turns[..slot].iter().filter(|&&q| q == queue).count();
                expected.push((slot as SlotId, (queue as BatchId) * 1000 + position as BatchId));
            }
            (events, expected)
        }

        proptest! {
            /// For every interleaving of batch/slot arrivals, the emitted
            /// sequence is the same permutation: slots strictly increasing
            /// and per-queue positions in order.
            #[test]
            fn emission_is_invariant_under_arrival_order(
                queue_sizes in proptest::collection::vec(1u8..4, 1..4),
                seed in proptest::num::u64::ANY,
            ) {
                let (mut events, expected) = event_set(queue_sizes);

                // Shuffle deterministically from the seed.
                let mut state = seed;
                for i in (1..events.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    let j = (state >> 33) as usize % (i + 1);
                    events.swap(i, j);
                }

                let mut log = LocalLog::new();
                let mut emitted = Vec::new();
                for event in events {
                    match event {
                        LogEvent::Batch { queue, position, batch_id } => {
                            log.add_batch_id(queue, position, batch_id)
                        }
                        LogEvent::Slot { slot, queue } => log.add_slot(slot, queue),
                    }
                    while log.has_next_batch() {
                        emitted.push(log.next_batch());
                    }
                }

                prop_assert_eq!(emitted, expected);
            }
        }
    }
}
