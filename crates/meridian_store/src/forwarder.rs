//! Forwarder: collects master metadata for new transactions, classifies
//! them as single-home or multi-home, and routes them onward.
//!
//! Keys owned by the local partition are answered from the local lookup
//! index immediately; keys on other partitions are folded into per-partition
//! lookup batches flushed every `forwarder_batch_duration`. A transaction
//! leaves as soon as its metadata set is complete. Lost lookups are not
//! retried: the transaction stalls and surfaces as a client timeout.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::stats;
use crate::storage::LookupMasterIndex;
use crate::transaction::{
    generate_lock_only_txn, set_transaction_type, Transaction, TransactionType, TxnEvent,
};
use crate::types::{
    Envelope, ForwardTxn, LookupMasterRequest, LookupMasterResponse, Message, PartitionId,
    Request, Response, StatsResponse, TxnId,
};

#[derive(Default)]
struct PendingLookup {
    txn_ids: Vec<TxnId>,
    keys: Vec<crate::types::Key>,
}

pub struct Forwarder {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    lookup_index: Arc<LookupMasterIndex>,
    pending_transactions: HashMap<TxnId, Transaction>,
    /// Per-partition lookup batches accumulated between flushes.
    partitioned_lookups: HashMap<PartitionId, PendingLookup>,
    batch_started: Instant,
    stat_batch_sizes: Vec<usize>,
    stat_batch_durations_ms: Vec<f64>,
}

impl Forwarder {
    pub fn new(
        config: NodeConfig,
        sender: Sender,
        rx: mpsc::UnboundedReceiver<Envelope>,
        lookup_index: Arc<LookupMasterIndex>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            lookup_index,
            pending_transactions: HashMap::new(),
            partitioned_lookups: HashMap::new(),
            batch_started: Instant::now(),
            stat_batch_sizes: Vec::new(),
            stat_batch_durations_ms: Vec::new(),
        }
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.forwarder_batch_duration());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(env) => self.handle(env),
                    None => break,
                },
                _ = interval.tick() => self.flush_lookup_batches(),
            }
        }
    }

    fn handle(&mut self, env: Envelope) {
        match env.message {
            Message::Request(Request::ForwardTxn(ForwardTxn { txn })) => {
                self.process_forward_txn(txn)
            }
            Message::Request(Request::LookupMaster(request)) => {
                self.process_lookup_request(env.from, env.from_channel, request)
            }
            Message::Request(Request::Stats(stats_request)) => {
                let response = Response::Stats(StatsResponse {
                    stats: self.stats(stats_request.level),
                });
                self.sender.send_response(response, env.from, env.from_channel);
            }
            Message::Response(Response::LookupMaster(response)) => {
                self.process_lookup_response(response)
            }
            other => tracing::warn!(?other, "forwarder received unexpected message"),
        }
    }

    /// Admit a transaction: resolve local keys from the local index, batch
    /// lookups for remote keys, and dispatch once metadata is complete.
    fn process_forward_txn(&mut self, mut txn: Transaction) {
        txn.record_event(TxnEvent::EnterForwarder, self.config.local_machine_id());
        let local_partition = self.config.local_partition();

        let keys: Vec<_> = txn.keys.keys().cloned().collect();
        for key in keys {
            let partition = self.config.partition_of_key(&key);
            if partition == local_partition {
                let metadata = self.lookup_index.get_or_default(&key);
                if let Some(entry) = txn.keys.get_mut(&key) {
                    entry.metadata = Some(metadata);
                }
            } else {
                let pending = self.partitioned_lookups.entry(partition).or_default();
                if !pending.txn_ids.contains(&txn.id) {
                    pending.txn_ids.push(txn.id);
                }
                pending.keys.push(key);
            }
        }

        if set_transaction_type(&mut txn) == TransactionType::Unknown {
            self.pending_transactions.insert(txn.id, txn);
        } else {
            self.forward(txn);
        }
    }

    /// Answer a peer forwarder's metadata lookup from the local index.
    fn process_lookup_request(
        &mut self,
        from: crate::types::MachineId,
        from_channel: crate::types::Channel,
        request: LookupMasterRequest,
    ) {
        let mut metadata = BTreeMap::new();
        let mut new_keys = Vec::new();
        for key in request.keys {
            match self.lookup_index.get(&key) {
                Some(found) => {
                    metadata.insert(key, found);
                }
                None => new_keys.push(key),
            }
        }
        self.sender.send_response(
            Response::LookupMaster(LookupMasterResponse {
                txn_ids: request.txn_ids,
                metadata,
                new_keys,
            }),
            from,
            from_channel,
        );
    }

    fn process_lookup_response(&mut self, response: LookupMasterResponse) {
        for txn_id in &response.txn_ids {
            let Some(txn) = self.pending_transactions.get_mut(txn_id) else {
                continue;
            };
            for (key, entry) in txn.keys.iter_mut() {
                if entry.metadata.is_some() {
                    continue;
                }
                if let Some(found) = response.metadata.get(key) {
                    entry.metadata = Some(*found);
                } else if response.new_keys.contains(key) {
                    entry.metadata = Some(crate::types::Metadata::default());
                }
            }
            if set_transaction_type(txn) != TransactionType::Unknown {
                let txn = self.pending_transactions.remove(txn_id).unwrap();
                self.forward(txn);
            }
        }
    }

    /// Send every pending per-partition lookup batch to the same partition
    /// of the local replica.
    fn flush_lookup_batches(&mut self) {
        if self.partitioned_lookups.is_empty() {
            self.batch_started = Instant::now();
            return;
        }
        let lookups = std::mem::take(&mut self.partitioned_lookups);
        let total_keys: usize = lookups.values().map(|p| p.keys.len()).sum();
        self.stat_batch_sizes.push(total_keys);
        self.stat_batch_durations_ms
            .push(self.batch_started.elapsed().as_secs_f64() * 1e3);
        self.batch_started = Instant::now();

        for (partition, pending) in lookups {
            let target = self
                .config
                .make_machine_id(self.config.local_replica(), partition);
            self.sender.send_request(
                Request::LookupMaster(LookupMasterRequest {
                    txn_ids: pending.txn_ids,
                    keys: pending.keys,
                }),
                target,
                self.config.channels().forwarder,
            );
        }
    }

    /// Dispatch a classified transaction.
    fn forward(&mut self, mut txn: Transaction) {
        match txn.txn_type {
            TransactionType::SingleHome => {
                txn.record_event(
                    TxnEvent::ExitForwarderToSequencer,
                    self.config.local_machine_id(),
                );
                let home = txn.home as u32;
                let target = self
                    .config
                    .make_machine_id(home, self.config.local_partition());
                self.sender.send_request(
                    Request::ForwardTxn(ForwardTxn { txn }),
                    target,
                    self.config.channels().sequencer,
                );
            }
            TransactionType::MultiHomeOrLockOnly => {
                txn.record_event(
                    TxnEvent::ExitForwarderToOrderer,
                    self.config.local_machine_id(),
                );
                if self.config.config().bypass_mh_orderer {
                    // Skip global ordering: ship each home's lock-only shard
                    // straight to that home's sequencer.
                    for &replica in txn.involved_replicas.clone().iter() {
                        let shard = generate_lock_only_txn(&txn, replica);
                        let target = self
                            .config
                            .make_machine_id(replica, self.config.local_partition());
                        self.sender.send_request(
                            Request::ForwardTxn(ForwardTxn { txn: shard }),
                            target,
                            self.config.channels().sequencer,
                        );
                    }
                } else {
                    let target = self.config.make_machine_id(
                        self.config.local_replica(),
                        self.config
                            .config()
                            .leader_partition_for_multi_home_ordering,
                    );
                    self.sender.send_request(
                        Request::ForwardTxn(ForwardTxn { txn }),
                        target,
                        self.config.channels().multi_home_orderer,
                    );
                }
            }
            TransactionType::Unknown => {
                unreachable!("forward called on an unclassified transaction")
            }
        }
    }

    fn stats(&self, _level: u32) -> serde_json::Value {
        serde_json::json!({
            "num_pending_transactions": self.pending_transactions.len(),
            (stats::BATCH_SIZES): self.stat_batch_sizes,
            (stats::BATCH_DURATIONS_MS): self.stat_batch_durations_ms,
        })
    }
}
