//! Multi-home orderer.
//!
//! One orderer runs per replica, on the configured leader partition. It
//! batches multi-home transactions, replicates batch data to its peer
//! orderers, and proposes batch ids to the global Paxos spanning all
//! replicas. Once a batch is globally ordered, each replica's orderer feeds
//! the batch and a slot for the distinguished multi-home queue into its own
//! replica's interleavers, strictly in global-slot order.

use std::collections::{HashMap, VecDeque};

use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::transaction::{make_batch, Transaction, TransactionType, TxnEvent};
use crate::types::{
    Batch, BatchId, Envelope, ForwardBatch, ForwardTxn, LocalQueueOrder, Message, PaxosWire,
    Request, SlotId, MAX_NUM_MACHINES,
};

pub struct MultiHomeOrderer {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    buffer: Vec<Transaction>,
    batch_counter: u64,
    /// Replicated multi-home batch data, keyed by batch id.
    batch_data: HashMap<BatchId, Batch>,
    /// Globally decided orders not yet released (head-of-line: data may lag).
    pending_orders: VecDeque<(SlotId, BatchId)>,
    /// Position of the next multi-home batch in this replica's MH queue.
    next_position: u64,
}

impl MultiHomeOrderer {
    pub fn new(config: NodeConfig, sender: Sender, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            config,
            sender,
            rx,
            buffer: Vec::new(),
            batch_counter: 0,
            batch_data: HashMap::new(),
            pending_orders: VecDeque::new(),
            next_position: 0,
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.sequencer_batch_duration());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(env) => self.handle(env),
                    None => break,
                },
                _ = interval.tick() => self.flush(),
            }
        }
    }

    fn handle(&mut self, env: Envelope) {
        let Message::Request(request) = env.message else {
            return;
        };
        match request {
            Request::ForwardTxn(ForwardTxn { mut txn }) => {
                txn.record_event(TxnEvent::EnterOrderer, self.config.local_machine_id());
                self.buffer.push(txn);
            }
            Request::ForwardBatch(ForwardBatch::BatchData { batch, .. }) => {
                self.batch_data.insert(batch.id, batch);
                self.release_ordered_batches();
            }
            Request::ForwardBatch(ForwardBatch::BatchOrder { slot, batch_id }) => {
                self.pending_orders.push_back((slot, batch_id));
                self.release_ordered_batches();
            }
            other => tracing::warn!(?other, "orderer received unexpected request"),
        }
    }

    /// Close the open multi-home batch: replicate to peer orderers and
    /// propose the batch id to the global Paxos.
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let machine = self.config.local_machine_id();
        self.batch_counter += 1;
        let batch_id: BatchId = self.batch_counter * MAX_NUM_MACHINES + machine as BatchId;
        let txns = std::mem::take(&mut self.buffer);
        let batch = make_batch(batch_id, TransactionType::MultiHomeOrLockOnly, txns);
        tracing::debug!(batch_id, size = batch.txns.len(), machine, "multi-home batch closed");

        self.sender.broadcast_request(
            Request::ForwardBatch(ForwardBatch::BatchData {
                batch,
                same_origin_position: 0,
            }),
            &self.config.orderer_machines(),
            self.config.channels().multi_home_orderer,
        );
        self.sender.send_local(
            Request::Paxos(PaxosWire {
                msg: meridian_paxos::PaxosMessage::Propose { value: batch_id },
            }),
            self.config.channels().global_paxos,
        );
    }

    /// Feed globally ordered batches into this replica's interleavers.
    /// Orders are consumed strictly head-of-line so the MH queue's positions
    /// follow the global slot order even when batch data lags.
    fn release_ordered_batches(&mut self) {
        while let Some(&(slot, batch_id)) = self.pending_orders.front() {
            let Some(batch) = self.batch_data.remove(&batch_id) else {
                return;
            };
            self.pending_orders.pop_front();

            let local_machines = self.config.machines_of_replica(self.config.local_replica());
            self.sender.broadcast_request(
                Request::ForwardBatch(ForwardBatch::BatchData {
                    batch,
                    same_origin_position: self.next_position,
                }),
                &local_machines,
                self.config.channels().interleaver,
            );
            self.sender.broadcast_request(
                Request::LocalQueueOrder(LocalQueueOrder {
                    slot,
                    queue_id: self.config.mh_queue_id(self.config.local_replica()),
                }),
                &local_machines,
                self.config.channels().interleaver,
            );
            self.next_position += 1;
        }
    }
}
