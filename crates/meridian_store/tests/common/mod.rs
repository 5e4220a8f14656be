//! Shared in-process cluster harness for integration tests.
//!
//! Builds an `R x P` matrix of machines wired through the in-memory peer
//! net. Tests either start the full module pipeline per machine or only the
//! modules under test, and tap output channels to observe what a downstream
//! module would have received.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use meridian_store::broker::{Broker, LocalPeerNet};
use meridian_store::config::{test_config, NodeConfig};
use meridian_store::interleaver::Interleaver;
use meridian_store::node::{start_machine, Machine};
use meridian_store::remaster_manager::RemasterManager;
use meridian_store::scheduler::Scheduler;
use meridian_store::storage::LookupMasterIndex;
use meridian_store::transaction::{
    make_batch, populate_involved_partitions, set_transaction_type, KeyEntry, KeyType, Procedure,
    Transaction, TransactionType,
};
use meridian_store::types::{
    Batch, BatchId, Channel, CompletedTransaction, Envelope, ForwardTxn, Message, Metadata, Record,
    Request,
};

/// Channel used by tests to play the role of a client or a tapped module.
pub const CLIENT_TAP: Channel = 14;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestMachine {
    pub config: NodeConfig,
    pub broker: Broker,
    pub full: Option<Machine>,
    pub lookup_index: Option<Arc<LookupMasterIndex>>,
    pub storage: Option<Arc<meridian_store::storage::MemStorage>>,
    taps: HashMap<Channel, mpsc::UnboundedReceiver<Envelope>>,
}

impl TestMachine {
    pub fn tap(&mut self, channel: Channel) {
        let rx = self.broker.add_channel(channel);
        self.taps.insert(channel, rx);
    }

    pub async fn recv_tap(&mut self, channel: Channel) -> Envelope {
        let rx = self.taps.get_mut(&channel).expect("channel not tapped");
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for envelope")
            .expect("tap channel closed")
    }

    /// Receive on a tap and unwrap the forwarded transaction.
    pub async fn recv_txn(&mut self, channel: Channel) -> Transaction {
        let env = self.recv_tap(channel).await;
        match env.message {
            Message::Request(Request::ForwardTxn(ForwardTxn { txn })) => txn,
            other => panic!("expected a forwarded transaction, got {other:?}"),
        }
    }

    /// Receive on a tap and unwrap a completed transaction.
    pub async fn recv_completed(&mut self, channel: Channel) -> Transaction {
        let env = self.recv_tap(channel).await;
        match env.message {
            Message::Request(Request::Completed(CompletedTransaction { txn })) => txn,
            other => panic!("expected a completed transaction, got {other:?}"),
        }
    }
}

pub struct TestCluster {
    pub machines: Vec<TestMachine>,
    net: Arc<LocalPeerNet>,
}

impl TestCluster {
    fn empty(num_replicas: u32, num_partitions: u32) -> Self {
        let net = Arc::new(LocalPeerNet::new());
        let mut machines = Vec::new();
        for replica in 0..num_replicas {
            for partition in 0..num_partitions {
                let config = test_config(num_replicas, num_partitions, replica, partition);
                let broker = Broker::new(config.local_machine_id());
                broker.set_transport(net.clone());
                net.register(&broker);
                machines.push(TestMachine {
                    config,
                    broker,
                    full: None,
                    lookup_index: None,
                    storage: None,
                    taps: HashMap::new(),
                });
            }
        }
        Self { machines, net }
    }

    /// Machines running only the interleaver, with the scheduler channel
    /// tapped to observe its output.
    pub fn interleaver_only(num_replicas: u32, num_partitions: u32) -> Self {
        let mut cluster = Self::empty(num_replicas, num_partitions);
        for machine in &mut cluster.machines {
            let rx = machine.broker.add_channel(machine.config.channels().interleaver);
            Interleaver::new(
                machine.config.clone(),
                machine.broker.sender(machine.config.channels().interleaver),
                rx,
            )
            .spawn();
            machine.tap(machine.config.channels().scheduler);
        }
        cluster
    }

    /// Machines running the scheduler and worker pool, with the server
    /// channel tapped to catch completions.
    pub fn scheduler_only(num_replicas: u32, num_partitions: u32) -> Self {
        let mut cluster = Self::empty(num_replicas, num_partitions);
        for machine in &mut cluster.machines {
            let channels = *machine.config.channels();
            let lookup_index = Arc::new(LookupMasterIndex::new());
            let storage = Arc::new(meridian_store::storage::MemStorage::new());

            let rx = machine.broker.add_channel(channels.scheduler);
            Scheduler::new(
                machine.config.clone(),
                machine.broker.sender(channels.scheduler),
                rx,
                RemasterManager::new(Arc::clone(&lookup_index)),
            )
            .spawn();

            for worker in 0..machine.config.config().num_workers {
                let channel = channels.worker_channel(worker);
                let worker_rx = machine.broker.add_channel(channel);
                meridian_store::worker::Worker::new(
                    machine.config.clone(),
                    machine.broker.sender(channel),
                    worker_rx,
                    storage.clone(),
                    Arc::clone(&lookup_index),
                )
                .spawn();
            }

            machine.lookup_index = Some(lookup_index);
            machine.storage = Some(storage);
            machine.tap(channels.server);
        }
        cluster
    }

    /// Machines running the entire pipeline, with a client tap registered.
    pub fn full(num_replicas: u32, num_partitions: u32) -> Self {
        let mut cluster = Self::empty(num_replicas, num_partitions);
        for machine in &mut cluster.machines {
            let full = start_machine(machine.config.clone(), machine.broker.clone());
            machine.full = Some(full);
            machine.tap(CLIENT_TAP);
        }
        cluster
    }

    /// Seed one record on every machine whose partition owns the key.
    /// Replicas are seeded identically, as a real deployment would be.
    pub fn seed(&self, key: &str, value: &str, metadata: Metadata) {
        for machine in &self.machines {
            if machine.config.partition_of_key(&key.to_string()) != machine.config.local_partition()
            {
                continue;
            }
            let record = Record {
                value: value.to_string(),
                metadata,
            };
            if let Some(full) = &machine.full {
                full.data(key.to_string(), record);
                continue;
            }
            if let Some(index) = &machine.lookup_index {
                index.update(key.to_string(), metadata);
            }
            if let Some(storage) = &machine.storage {
                storage.write(key.to_string(), record);
            }
        }
    }

    /// Send a request as if it came from `from`'s module on `from_channel`.
    pub fn send_as(
        &self,
        from: usize,
        from_channel: Channel,
        to: usize,
        to_channel: Channel,
        request: Request,
    ) {
        let to_machine = self.machines[to].config.local_machine_id();
        self.machines[from]
            .broker
            .sender(from_channel)
            .send_request(request, to_machine, to_channel);
    }

    /// Submit a client transaction at `machine`'s server and wait for the
    /// final merged result.
    pub async fn submit(&mut self, machine: usize, txn: Transaction) -> Transaction {
        let server = self.machines[machine].config.channels().server;
        self.send_as(machine, CLIENT_TAP, machine, server, Request::ForwardTxn(ForwardTxn { txn }));
        self.machines[machine].recv_completed(CLIENT_TAP).await
    }

    /// Poll one machine's storage until the key holds `expected`.
    pub async fn wait_for_value(&self, machine: usize, key: &str, expected: Option<&str>) {
        let deadline = tokio::time::Instant::now() + RECV_TIMEOUT;
        let storage = &self.machines[machine].full.as_ref().expect("full machine").storage;
        loop {
            let value = storage.read(&key.to_string()).map(|r| r.value);
            if value.as_deref() == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "machine {machine}: key {key} never reached {expected:?}, last saw {value:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Build a transaction with explicit key entries, classified and with its
/// partition footprint populated.
pub fn make_txn(
    config: &NodeConfig,
    id: u64,
    keys: Vec<(&str, KeyType, Option<Metadata>)>,
    procedure: Procedure,
) -> Transaction {
    let keys: BTreeMap<_, _> = keys
        .into_iter()
        .map(|(key, key_type, metadata)| {
            let mut entry = match key_type {
                KeyType::Read => KeyEntry::read(),
                KeyType::Write => KeyEntry::write(),
            };
            entry.metadata = metadata;
            (key.to_string(), entry)
        })
        .collect();
    let mut txn = Transaction::new(keys, procedure);
    txn.id = id;
    set_transaction_type(&mut txn);
    populate_involved_partitions(config, &mut txn);
    txn
}

/// Build a single-home batch the way a sequencer would.
pub fn make_test_batch(id: BatchId, txns: Vec<Transaction>) -> Batch {
    make_batch(id, TransactionType::SingleHome, txns)
}

/// Storage read helper for full machines.
pub use meridian_store::storage::Storage;
