//! Worker: executes dispatched transactions.
//!
//! Each transaction advances through an explicit phase machine:
//! `ReadLocalStorage -> WaitRemoteRead -> Execute -> Commit -> Finish`.
//! Inbound events (the dispatch itself, each remote read) merge into the
//! transaction buffer and then re-enter `advance`, which moves the
//! transaction as far as it can go without blocking.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::commands::KeyValueCommands;
use crate::config::NodeConfig;
use crate::storage::{LookupMasterIndex, Storage};
use crate::transaction::{
    AbortReason, KeyType, Procedure, Transaction, TransactionStatus, TxnEvent,
};
use crate::types::{
    CompletedTransaction, Envelope, ForwardTxn, Key, Message, Metadata, Record, RemoteReadResult,
    Request, TxnId, Value,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    ReadLocalStorage,
    WaitRemoteRead,
    Execute,
    Commit,
    Finish,
}

struct TxnState {
    txn: Transaction,
    phase: Phase,
    remote_reads_waiting_on: u32,
}

pub struct Worker {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    storage: Arc<dyn Storage>,
    index: Arc<LookupMasterIndex>,
    commands: KeyValueCommands,
    states: HashMap<TxnId, TxnState>,
}

impl Worker {
    pub fn new(
        config: NodeConfig,
        sender: Sender,
        rx: mpsc::UnboundedReceiver<Envelope>,
        storage: Arc<dyn Storage>,
        index: Arc<LookupMasterIndex>,
    ) -> Self {
        Self {
            config,
            sender,
            rx,
            storage,
            index,
            commands: KeyValueCommands::new(),
            states: HashMap::new(),
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
            Request::ForwardTxn(ForwardTxn { mut txn }) => {
                txn.record_event(TxnEvent::EnterWorker, self.config.local_machine_id());
                let txn_id = txn.id;
                self.states.insert(
                    txn_id,
                    TxnState {
                        txn,
                        phase: Phase::ReadLocalStorage,
                        remote_reads_waiting_on: 0,
                    },
                );
                self.advance(txn_id);
            }
            Request::RemoteReadResult(rr) => self.apply_remote_read(rr),
            other => tracing::warn!(?other, "worker received unexpected request"),
        }
    }

    fn apply_remote_read(&mut self, rr: RemoteReadResult) {
        let Some(state) = self.states.get_mut(&rr.txn_id) else {
            // The transaction already finished here (e.g. it aborted before
            // dispatch); late reads carry nothing we still need.
            return;
        };
        if rr.will_abort {
            state.txn.status = TransactionStatus::Aborted;
        } else {
            for (key, value) in rr.keys {
                if let Some(entry) = state.txn.keys.get_mut(&key) {
                    entry.value = value;
                }
            }
        }
        state.remote_reads_waiting_on = state.remote_reads_waiting_on.saturating_sub(1);
        self.advance(rr.txn_id);
    }

    /// Drive the transaction through as many phases as possible.
    fn advance(&mut self, txn_id: TxnId) {
        loop {
            let Some(state) = self.states.get(&txn_id) else {
                return;
            };
            match state.phase {
                Phase::ReadLocalStorage => self.read_local_storage(txn_id),
                Phase::WaitRemoteRead => {
                    let state = self.states.get_mut(&txn_id).unwrap();
                    if state.txn.status == TransactionStatus::Aborted {
                        state.phase = Phase::Finish;
                    } else if state.remote_reads_waiting_on == 0 {
                        state.phase = Phase::Execute;
                    } else {
                        return;
                    }
                }
                Phase::Execute => self.execute(txn_id),
                Phase::Commit => self.commit(txn_id),
                Phase::Finish => {
                    self.finish(txn_id);
                    return;
                }
            }
        }
    }

    /// Read every local key into the buffer, checking that storage still
    /// agrees with the metadata the forwarder collected, then ship the local
    /// reads to the other involved partitions.
    fn read_local_storage(&mut self, txn_id: TxnId) {
        let local_partition = self.config.local_partition();
        let state = self.states.get_mut(&txn_id).unwrap();

        let local_keys: Vec<Key> = state
            .txn
            .keys
            .keys()
            .filter(|key| self.config.partition_of_key(key) == local_partition)
            .cloned()
            .collect();

        let mut local_reads: BTreeMap<Key, Value> = BTreeMap::new();
        for key in &local_keys {
            let record = self.storage.read(key).unwrap_or_default();
            let entry = state.txn.keys.get_mut(key).unwrap();
            let expected = entry.metadata.unwrap_or_default();
            if record.metadata != expected {
                state.txn.abort(AbortReason::Remastered);
                break;
            }
            entry.value = record.value.clone();
            local_reads.insert(key.clone(), record.value);
        }

        let aborted = state.txn.status == TransactionStatus::Aborted;
        let involved = state.txn.involved_partitions.clone();
        state.remote_reads_waiting_on = involved.len().saturating_sub(1) as u32;

        // Every other involved partition hears from us exactly once, either
        // with our reads or with the abort flag.
        let rr = RemoteReadResult {
            txn_id,
            partition: local_partition,
            keys: if aborted { BTreeMap::new() } else { local_reads },
            will_abort: aborted,
        };
        for &partition in involved.iter().filter(|&&p| p != local_partition) {
            let target = self
                .config
                .make_machine_id(self.config.local_replica(), partition);
            self.sender.send_request(
                Request::RemoteReadResult(rr.clone()),
                target,
                self.config.channels().scheduler,
            );
        }

        let state = self.states.get_mut(&txn_id).unwrap();
        state.phase = if aborted {
            Phase::Finish
        } else if state.remote_reads_waiting_on == 0 {
            Phase::Execute
        } else {
            Phase::WaitRemoteRead
        };
    }

    fn execute(&mut self, txn_id: TxnId) {
        let state = self.states.get_mut(&txn_id).unwrap();
        self.commands.execute(&mut state.txn);
        state.phase = if state.txn.status == TransactionStatus::Aborted {
            Phase::Finish
        } else {
            Phase::Commit
        };
    }

    /// Apply declared local writes and deletes; a remaster rewrites the
    /// key's metadata and the lookup index instead.
    fn commit(&mut self, txn_id: TxnId) {
        let local_partition = self.config.local_partition();
        let state = self.states.get_mut(&txn_id).unwrap();

        if let Procedure::Remaster { new_master } = state.txn.procedure {
            for (key, entry) in &state.txn.keys {
                if self.config.partition_of_key(key) != local_partition {
                    continue;
                }
                let old = entry.metadata.unwrap_or_default();
                let new_metadata = Metadata {
                    master: new_master,
                    counter: old.counter + 1,
                };
                self.storage.write(
                    key.clone(),
                    Record {
                        value: entry.value.clone(),
                        metadata: new_metadata,
                    },
                );
                self.index.update(key.clone(), new_metadata);
            }
        } else {
            for (key, entry) in &state.txn.keys {
                if entry.key_type != KeyType::Write
                    || self.config.partition_of_key(key) != local_partition
                {
                    continue;
                }
                if entry.deleted {
                    self.storage.delete(key);
                } else if let Some(new_value) = &entry.new_value {
                    self.storage.write(
                        key.clone(),
                        Record {
                            value: new_value.clone(),
                            metadata: entry.metadata.unwrap_or_default(),
                        },
                    );
                }
            }
        }

        state.phase = Phase::Finish;
    }

    /// Report the result to the scheduler (which releases locks and relays
    /// to the coordinating server) and drop the state.
    fn finish(&mut self, txn_id: TxnId) {
        let Some(mut state) = self.states.remove(&txn_id) else {
            return;
        };
        state
            .txn
            .record_event(TxnEvent::ExitWorker, self.config.local_machine_id());
        self.sender.send_local(
            Request::Completed(CompletedTransaction { txn: state.txn }),
            self.config.channels().scheduler,
        );
    }
}
