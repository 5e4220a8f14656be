//! Scheduler: admission of transactions and lock-only shards from the local
//! log, remaster verification, deterministic lock acquisition, and dispatch
//! to the worker pool.
//!
//! The scheduler is the single owner of the lock manager and the remaster
//! manager; every decision below happens on its task in local-log order,
//! which is what makes the outcome identical on every machine. Holders merge
//! the full key set of all shards so the dispatched transaction carries the
//! remote keys the worker's read exchange will fill in, while locking and
//! remaster checks operate on the local-partition projection only.

use std::collections::{HashMap, HashSet};

use serde_json::json;
use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::lock_manager::{build_lock_manager, AcquireLocksResult, LockManager, LockableShard};
use crate::remaster_manager::{RemasterManager, RemasterOccurredResult, VerifyMasterResult};
use crate::stats;
use crate::transaction::{
    generate_partitioned_txn, merge_transaction, AbortReason, Transaction, TransactionStatus,
    TransactionType, TxnEvent,
};
use crate::types::{
    CompletedTransaction, Envelope, ForwardTxn, Message, RemoteReadResult, Request, Response,
    StatsResponse, TxnId,
};

struct TxnHolder {
    /// Merged view across shards: the full declared key set.
    txn: Transaction,
    expected_lo: i32,
    num_lo: i32,
    aborting: bool,
    done: bool,
    dispatched_to: Option<usize>,
}

impl TxnHolder {
    fn is_whole(&self) -> bool {
        self.num_lo >= self.expected_lo
    }
}

pub struct Scheduler {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    lock_manager: Box<dyn LockManager>,
    remaster_manager: RemasterManager,
    holders: HashMap<TxnId, TxnHolder>,
    /// Shards parked by the remaster manager, waiting for a remaster commit.
    parked_shards: HashMap<(TxnId, i32), Transaction>,
    /// Remote reads that arrived before their transaction was dispatched.
    early_remote_reads: HashMap<TxnId, Vec<RemoteReadResult>>,
    /// Finished ids so straggling remote reads are dropped, not buffered.
    // TODO: age these tombstones out once completions are acknowledged.
    finished_txns: HashSet<TxnId>,
    next_worker: usize,
}

impl Scheduler {
    pub fn new(
        config: NodeConfig,
        sender: Sender,
        rx: mpsc::UnboundedReceiver<Envelope>,
        remaster_manager: RemasterManager,
    ) -> Self {
        let lock_manager = build_lock_manager(&config.config().lock_manager);
        Self {
            config,
            sender,
            rx,
            lock_manager,
            remaster_manager,
            holders: HashMap::new(),
            parked_shards: HashMap::new(),
            early_remote_reads: HashMap::new(),
            finished_txns: HashSet::new(),
            next_worker: 0,
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
            Request::ForwardTxn(ForwardTxn { txn }) => self.process_shard(txn),
            Request::RemoteReadResult(rr) => self.route_remote_read(rr),
            Request::Completed(CompletedTransaction { txn }) => self.process_completion(txn),
            Request::Stats(stats_request) => {
                let response = Response::Stats(StatsResponse {
                    stats: self.stats(stats_request.level),
                });
                self.sender.send_response(response, env.from, env.from_channel);
            }
            other => tracing::warn!(?other, "scheduler received unexpected request"),
        }
    }

    /// Admit one transaction (or lock-only shard) from the interleaver.
    fn process_shard(&mut self, mut shard: Transaction) {
        let local_partition = self.config.local_partition();
        if !shard.involved_partitions.contains(&local_partition) {
            return;
        }
        shard.record_event(TxnEvent::EnterScheduler, self.config.local_machine_id());

        let expected_lo = if shard.txn_type == TransactionType::MultiHomeOrLockOnly {
            shard.involved_replicas.len() as i32
        } else {
            1
        };
        let txn_id = shard.id;
        let home = shard.home;

        let holder = self.holders.entry(txn_id).or_insert_with(|| TxnHolder {
            txn: shard.clone(),
            expected_lo,
            num_lo: 0,
            aborting: false,
            done: false,
            dispatched_to: None,
        });
        holder.num_lo += 1;
        if holder.num_lo > 1 {
            merge_transaction(&mut holder.txn, &shard);
        }
        let aborting = holder.aborting;
        if aborting {
            self.maybe_collect(txn_id);
            return;
        }

        // Locking and verification see only this partition's keys. A shard
        // whose home holds nothing here still counts toward the part total.
        let local_shard =
            generate_partitioned_txn(&self.config, &shard, local_partition).unwrap_or_else(|| {
                let mut empty = shard.clone();
                empty.keys.clear();
                empty
            });

        let keys: Vec<_> = local_shard
            .keys
            .iter()
            .filter_map(|(key, entry)| entry.metadata.map(|m| (key.clone(), m.master, m.counter)))
            .collect();
        match self
            .remaster_manager
            .verify_master((txn_id, home), keys.into_iter())
        {
            VerifyMasterResult::Valid => self.accept_and_acquire(local_shard, expected_lo),
            VerifyMasterResult::Waiting => {
                self.parked_shards.insert((txn_id, home), local_shard);
            }
            VerifyMasterResult::Abort => {
                self.trigger_abort(txn_id, AbortReason::RemasterInvalid);
            }
        }
    }

    fn accept_and_acquire(&mut self, local_shard: Transaction, expected_lo: i32) {
        let txn_id = local_shard.id;
        let lockable = LockableShard::from_txn(&local_shard, expected_lo);
        match self.lock_manager.accept_txn_and_acquire_locks(&lockable) {
            AcquireLocksResult::Acquired => self.dispatch(txn_id),
            AcquireLocksResult::Waiting => {}
            AcquireLocksResult::Abort => self.trigger_abort(txn_id, AbortReason::RemasterInvalid),
        }
    }

    /// Hand a whole, lock-holding transaction to a worker, round-robin.
    fn dispatch(&mut self, txn_id: TxnId) {
        let num_workers = self.config.config().num_workers;
        let worker = self.next_worker;
        self.next_worker = (self.next_worker + 1) % num_workers;

        let Some(holder) = self.holders.get_mut(&txn_id) else {
            return;
        };
        holder.dispatched_to = Some(worker);
        holder
            .txn
            .record_event(TxnEvent::DispatchedToWorker, self.config.local_machine_id());
        let txn = holder.txn.clone();

        let channel = self.config.channels().worker_channel(worker);
        self.sender
            .send_local(Request::ForwardTxn(ForwardTxn { txn }), channel);

        for rr in self.early_remote_reads.remove(&txn_id).unwrap_or_default() {
            self.sender.send_local(Request::RemoteReadResult(rr), channel);
        }
    }

    fn route_remote_read(&mut self, rr: RemoteReadResult) {
        if self.finished_txns.contains(&rr.txn_id) {
            return;
        }
        match self.holders.get(&rr.txn_id).and_then(|h| h.dispatched_to) {
            Some(worker) => {
                let channel = self.config.channels().worker_channel(worker);
                self.sender.send_local(Request::RemoteReadResult(rr), channel);
            }
            None => {
                self.early_remote_reads.entry(rr.txn_id).or_default().push(rr);
            }
        }
    }

    /// A worker finished executing (or aborting) a transaction.
    fn process_completion(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let newly_ready = self.lock_manager.release_locks(txn_id);

        if txn.status == TransactionStatus::Committed && txn.is_remaster() {
            self.apply_remaster_effects(&txn);
        }

        self.respond_to_coordinator(&txn);

        if let Some(holder) = self.holders.get_mut(&txn_id) {
            holder.done = true;
        }
        self.maybe_collect(txn_id);

        for ready in newly_ready {
            self.dispatch(ready);
        }
    }

    /// Walk remaster wait queues after a committed remaster of local keys.
    fn apply_remaster_effects(&mut self, txn: &Transaction) {
        for (key, entry) in &txn.keys {
            if self.config.partition_of_key(key) != self.config.local_partition() {
                continue;
            }
            let Some(metadata) = entry.metadata else {
                continue;
            };
            let new_counter = metadata.counter + 1;
            let RemasterOccurredResult {
                unblocked,
                should_abort,
            } = self.remaster_manager.remaster_occurred(key, new_counter);

            for shard_id in should_abort {
                self.parked_shards.remove(&shard_id);
                self.trigger_abort(shard_id.0, AbortReason::RemasterInvalid);
            }
            for shard_id in unblocked {
                let Some(shard) = self.parked_shards.remove(&shard_id) else {
                    continue;
                };
                let expected_lo = self
                    .holders
                    .get(&shard_id.0)
                    .map(|h| h.expected_lo)
                    .unwrap_or(1);
                // Re-verify: the shard may still be ahead on another key.
                let keys: Vec<_> = shard
                    .keys
                    .iter()
                    .filter_map(|(key, entry)| {
                        entry.metadata.map(|m| (key.clone(), m.master, m.counter))
                    })
                    .collect();
                match self.remaster_manager.verify_master(shard_id, keys.into_iter()) {
                    VerifyMasterResult::Valid => self.accept_and_acquire(shard, expected_lo),
                    VerifyMasterResult::Waiting => {
                        self.parked_shards.insert(shard_id, shard);
                    }
                    VerifyMasterResult::Abort => {
                        self.trigger_abort(shard_id.0, AbortReason::RemasterInvalid)
                    }
                }
            }
        }
    }

    /// Abort a transaction before (or instead of) execution. Locks it may
    /// already hold are released normally; peers that would wait on our
    /// remote reads are told to abort too.
    fn trigger_abort(&mut self, txn_id: TxnId, reason: AbortReason) {
        let Some(holder) = self.holders.get_mut(&txn_id) else {
            return;
        };
        if holder.aborting || holder.done {
            return;
        }
        holder.aborting = true;
        holder.done = true;
        holder.txn.abort(reason);
        let txn = holder.txn.clone();

        for home in txn.involved_replicas.iter().map(|&r| r as i32) {
            self.parked_shards.remove(&(txn_id, home));
        }

        let newly_ready = self.lock_manager.release_locks(txn_id);
        self.notify_peer_partitions_of_abort(&txn);
        self.respond_to_coordinator(&txn);
        self.maybe_collect(txn_id);

        for ready in newly_ready {
            self.dispatch(ready);
        }
    }

    fn notify_peer_partitions_of_abort(&self, txn: &Transaction) {
        let local_partition = self.config.local_partition();
        for &partition in &txn.involved_partitions {
            if partition == local_partition {
                continue;
            }
            let target = self
                .config
                .make_machine_id(self.config.local_replica(), partition);
            self.sender.send_request(
                Request::RemoteReadResult(RemoteReadResult {
                    txn_id: txn.id,
                    partition: local_partition,
                    keys: Default::default(),
                    will_abort: true,
                }),
                target,
                self.config.channels().scheduler,
            );
        }
    }

    /// Only the coordinating server's replica reports results; the other
    /// replicas execute the same decision silently.
    fn respond_to_coordinator(&self, txn: &Transaction) {
        let coordinator = txn.coordinating_server;
        if self.config.replica_of(coordinator) != self.config.local_replica() {
            return;
        }
        self.sender.send_request(
            Request::Completed(CompletedTransaction { txn: txn.clone() }),
            coordinator,
            self.config.channels().server,
        );
    }

    /// Drop holder state once every expected shard has been observed and the
    /// transaction is finished.
    fn maybe_collect(&mut self, txn_id: TxnId) {
        let Some(holder) = self.holders.get(&txn_id) else {
            return;
        };
        if holder.done && holder.is_whole() {
            self.holders.remove(&txn_id);
            self.early_remote_reads.remove(&txn_id);
            self.finished_txns.insert(txn_id);
        }
    }

    fn stats(&self, level: u32) -> serde_json::Value {
        let mut out = self.lock_manager.stats(level);
        out[stats::NUM_ALL_TXNS] = json!(self.holders.len());
        out["num_parked_shards"] = json!(self.parked_shards.len());
        out["num_blocked_on_remaster"] = json!(self.remaster_manager.num_blocked());
        if level >= 1 {
            let all: Vec<String> = self.holders.keys().map(|id| id.to_string()).collect();
            out[stats::ALL_TXNS] = json!(all);
        }
        out
    }
}
