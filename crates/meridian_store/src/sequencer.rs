//! Sequencer: assembles single-home transactions into per-machine batches.
//!
//! Every `sequencer_batch_duration` the open batch is closed, its data is
//! replicated to every machine of every replica, and this machine's lane is
//! proposed to the replica's local Paxos. The Paxos value names the queue;
//! pairing a committed slot with the queue's next batch happens in the
//! interleaver.

use std::time::Instant;

use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::stats;
use crate::transaction::{make_batch, Transaction, TransactionType, TxnEvent};
use crate::types::{
    BatchId, Envelope, ForwardBatch, ForwardTxn, Message, PaxosWire, Request, Response,
    StatsResponse, MAX_NUM_MACHINES,
};

pub struct Sequencer {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    buffer: Vec<Transaction>,
    batch_counter: u64,
    /// Position of the next batch within this machine's queue.
    next_position: u64,
    batch_started: Instant,
    stat_batch_sizes: Vec<usize>,
    stat_batch_durations_ms: Vec<f64>,
}

impl Sequencer {
    pub fn new(config: NodeConfig, sender: Sender, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            config,
            sender,
            rx,
            buffer: Vec::new(),
            batch_counter: 0,
            next_position: 0,
            batch_started: Instant::now(),
            stat_batch_sizes: Vec::new(),
            stat_batch_durations_ms: Vec::new(),
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
                txn.record_event(TxnEvent::EnterSequencer, self.config.local_machine_id());
                self.buffer.push(txn);
            }
            Request::Stats(stats_request) => {
                let response = Response::Stats(StatsResponse {
                    stats: self.stats(stats_request.level),
                });
                self.sender.send_response(response, env.from, env.from_channel);
            }
            other => tracing::warn!(?other, "sequencer received unexpected request"),
        }
    }

    /// Close the open batch: replicate its data everywhere and propose this
    /// machine's lane to the local Paxos.
    fn flush(&mut self) {
        if self.buffer.is_empty() {
            self.batch_started = Instant::now();
            return;
        }

        let machine = self.config.local_machine_id();
        self.batch_counter += 1;
        let batch_id: BatchId = self.batch_counter * MAX_NUM_MACHINES + machine as BatchId;
        let txns = std::mem::take(&mut self.buffer);

        self.stat_batch_sizes.push(txns.len());
        self.stat_batch_durations_ms
            .push(self.batch_started.elapsed().as_secs_f64() * 1e3);
        self.batch_started = Instant::now();

        let batch = make_batch(batch_id, TransactionType::SingleHome, txns);
        tracing::debug!(batch_id, size = batch.txns.len(), machine, "sequencer batch closed");

        let data = Request::ForwardBatch(ForwardBatch::BatchData {
            batch,
            same_origin_position: self.next_position,
        });
        self.next_position += 1;
        self.sender.broadcast_request(
            data,
            &self.config.all_machines(),
            self.config.channels().interleaver,
        );

        // The Paxos value is this machine's queue id; the interleaver pairs
        // the committed slot with the queue's next batch in position order.
        self.sender.send_local(
            Request::Paxos(PaxosWire {
                msg: meridian_paxos::PaxosMessage::Propose {
                    value: machine as u64,
                },
            }),
            self.config.channels().local_paxos,
        );
    }

    fn stats(&self, _level: u32) -> serde_json::Value {
        serde_json::json!({
            (stats::BATCH_SIZES): self.stat_batch_sizes,
            (stats::BATCH_DURATIONS_MS): self.stat_batch_durations_ms,
        })
    }
}
