//! Transaction model: key entries, classification, lock-only and partition
//! projections, merging of per-partition results, and batch packing.
//!
//! A transaction is immutable after admission apart from its status, buffered
//! values, and event trail. Classification depends only on the key metadata
//! set, so it can be re-run at any point with the same outcome.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::types::{
    now_us, Batch, BatchId, Key, MachineId, Metadata, PartitionId, ReplicaId, TxnId, Value,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    Read,
    Write,
}

/// Per-key state carried by a transaction: declared access type, the value
/// buffer filled by workers, and the mastership metadata collected by the
/// forwarder.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub key_type: KeyType,
    pub value: Value,
    pub new_value: Option<Value>,
    pub metadata: Option<Metadata>,
    pub deleted: bool,
}

impl KeyEntry {
    pub fn read() -> Self {
        Self {
            key_type: KeyType::Read,
            value: Value::new(),
            new_value: None,
            metadata: None,
            deleted: false,
        }
    }

    pub fn write() -> Self {
        Self {
            key_type: KeyType::Write,
            ..Self::read()
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Procedure {
    /// Stored-procedure source interpreted by the worker.
    Code(String),
    /// Move one key's mastership to `new_master`, bumping its counter.
    Remaster { new_master: ReplicaId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    Unknown,
    SingleHome,
    MultiHomeOrLockOnly,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    NotStarted,
    Committed,
    Aborted,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum AbortReason {
    /// A worker observed storage metadata that differs from the metadata the
    /// forwarder collected.
    #[error("key was remastered after the transaction was forwarded")]
    Remastered,
    /// The remaster manager saw a counter behind the index.
    #[error("stale master metadata: a remaster was missed at forwarding time")]
    RemasterInvalid,
    /// The stored procedure failed.
    #[error("procedure error: {0}")]
    Execute(String),
}

/// Pipeline checkpoints recorded on the transaction's event trail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxnEvent {
    EnterServer,
    EnterForwarder,
    ExitForwarderToSequencer,
    ExitForwarderToOrderer,
    EnterSequencer,
    EnterOrderer,
    EnterInterleaver,
    EnterScheduler,
    DispatchedToWorker,
    EnterWorker,
    ExitWorker,
    ReturnToServer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEventRecord {
    pub event: TxnEvent,
    pub time_us: i64,
    pub machine: MachineId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TxnId,
    pub keys: BTreeMap<Key, KeyEntry>,
    pub procedure: Procedure,
    pub coordinating_server: MachineId,
    pub txn_type: TransactionType,
    /// Home replica for single-home transactions and lock-only shards;
    /// -1 while unknown or for an unsharded multi-home transaction.
    pub home: i32,
    pub involved_replicas: Vec<ReplicaId>,
    pub involved_partitions: Vec<PartitionId>,
    /// Partitions with at least one write.
    pub active_partitions: Vec<PartitionId>,
    pub status: TransactionStatus,
    pub abort_reason: Option<AbortReason>,
    pub events: Vec<TxnEventRecord>,
}

impl Transaction {
    pub fn new(keys: BTreeMap<Key, KeyEntry>, procedure: Procedure) -> Self {
        Self {
            id: 0,
            keys,
            procedure,
            coordinating_server: 0,
            txn_type: TransactionType::Unknown,
            home: -1,
            involved_replicas: Vec::new(),
            involved_partitions: Vec::new(),
            active_partitions: Vec::new(),
            status: TransactionStatus::NotStarted,
            abort_reason: None,
            events: Vec::new(),
        }
    }

    pub fn is_remaster(&self) -> bool {
        matches!(self.procedure, Procedure::Remaster { .. })
    }

    pub fn record_event(&mut self, event: TxnEvent, machine: MachineId) {
        self.events.push(TxnEventRecord {
            event,
            time_us: now_us(),
            machine,
        });
    }

    pub fn abort(&mut self, reason: AbortReason) {
        self.status = TransactionStatus::Aborted;
        self.abort_reason = Some(reason);
    }
}

/// Classify the transaction from its key metadata. Returns `Unknown` while
/// any metadata is still missing. Idempotent.
///
/// A remaster is multi-home only when it actually moves the key between
/// replicas; a remaster onto the current master keeps single-home handling.
pub fn set_transaction_type(txn: &mut Transaction) -> TransactionType {
    let metadata_complete =
        !txn.keys.is_empty() && txn.keys.values().all(|entry| entry.metadata.is_some());
    if !metadata_complete {
        txn.txn_type = TransactionType::Unknown;
        return txn.txn_type;
    }

    let home = txn
        .keys
        .values()
        .next()
        .and_then(|entry| entry.metadata)
        .map(|m| m.master)
        .unwrap_or_default();
    let mut is_single_home = txn
        .keys
        .values()
        .all(|entry| entry.metadata.map(|m| m.master) == Some(home));

    if let Procedure::Remaster { new_master } = txn.procedure {
        if new_master != home {
            is_single_home = false;
        }
    }

    if is_single_home {
        txn.txn_type = TransactionType::SingleHome;
        txn.home = home as i32;
    } else {
        txn.txn_type = TransactionType::MultiHomeOrLockOnly;
        txn.home = -1;
    }
    populate_involved_replicas(txn);
    txn.txn_type
}

/// Recompute the sorted involved-replica set from the key metadata (plus the
/// remaster target). Requires complete metadata.
pub fn populate_involved_replicas(txn: &mut Transaction) {
    if txn.txn_type == TransactionType::Unknown {
        return;
    }
    let mut replicas: Vec<ReplicaId> = txn
        .keys
        .values()
        .filter_map(|entry| entry.metadata)
        .map(|m| m.master)
        .collect();
    if let Procedure::Remaster { new_master } = txn.procedure {
        replicas.push(new_master);
    }
    replicas.sort_unstable();
    replicas.dedup();
    txn.involved_replicas = replicas;
}

/// Compute involved and active partitions from the declared key set. Static
/// under hash partitioning, so this runs once at admission.
pub fn populate_involved_partitions(config: &NodeConfig, txn: &mut Transaction) {
    let mut involved = Vec::new();
    let mut active = Vec::new();
    for (key, entry) in &txn.keys {
        let partition = config.partition_of_key(key);
        if !involved.contains(&partition) {
            involved.push(partition);
        }
        if entry.key_type == KeyType::Write && !active.contains(&partition) {
            active.push(partition);
        }
    }
    involved.sort_unstable();
    active.sort_unstable();
    txn.involved_partitions = involved;
    txn.active_partitions = active;
}

/// Project a multi-home transaction onto one home replica: the shard carries
/// only the keys mastered there and locks on behalf of that home.
///
/// A remaster shard for the new master keeps its (still old-mastered) key so
/// both homes serialize through the same lock pair.
pub fn generate_lock_only_txn(txn: &Transaction, lo_master: ReplicaId) -> Transaction {
    let mut lock_only = txn.clone();
    lock_only.home = lo_master as i32;

    if let Procedure::Remaster { new_master } = txn.procedure {
        if new_master == lo_master {
            return lock_only;
        }
    }

    lock_only
        .keys
        .retain(|_, entry| entry.metadata.map(|m| m.master) == Some(lo_master));
    lock_only
}

/// Restrict a transaction (or lock-only shard) to the keys of `partition`.
///
/// Returns `None` when nothing remains for this partition, or when a
/// non-remaster lock-only shard keeps no key mastered at its home (such a
/// shard would lock nothing on behalf of its home). For multi-home
/// transactions the involved-replica set is recomputed from the surviving
/// keys.
pub fn generate_partitioned_txn(
    config: &NodeConfig,
    txn: &Transaction,
    partition: PartitionId,
) -> Option<Transaction> {
    let mut partitioned = txn.clone();
    partitioned
        .keys
        .retain(|key, _| config.partition_of_key(key) == partition);

    if partitioned.keys.is_empty() {
        return None;
    }

    if !partitioned.is_remaster() && partitioned.txn_type == TransactionType::MultiHomeOrLockOnly {
        let home_has_key = partitioned
            .keys
            .values()
            .any(|entry| entry.metadata.map(|m| m.master as i32) == Some(partitioned.home));
        if partitioned.home >= 0 && !home_has_key {
            return None;
        }
    }

    if partitioned.txn_type == TransactionType::MultiHomeOrLockOnly {
        populate_involved_replicas(&mut partitioned);
    }
    Some(partitioned)
}

/// Merge the result of one participant into the coordinating copy.
///
/// Mismatched ids or types mean the pipeline routed a foreign result here;
/// that is unrecoverable corruption, so this panics. An aborted participant
/// aborts the merged transaction; otherwise key entries are unioned with
/// first-arrival winning.
pub fn merge_transaction(txn: &mut Transaction, other: &Transaction) {
    assert_eq!(
        txn.id, other.id,
        "cannot merge transactions with different ids"
    );
    assert_eq!(
        txn.txn_type, other.txn_type,
        "cannot merge transactions with different types"
    );

    if other.status == TransactionStatus::Aborted {
        txn.status = TransactionStatus::Aborted;
        if txn.abort_reason.is_none() {
            txn.abort_reason = other.abort_reason.clone();
        }
    } else if txn.status != TransactionStatus::Aborted {
        for (key, entry) in &other.keys {
            txn.keys.entry(key.clone()).or_insert_with(|| entry.clone());
        }
    }
    txn.events.extend(other.events.iter().copied());
}

/// Pack transactions into a batch, preserving order.
pub fn make_batch(id: BatchId, batch_type: TransactionType, txns: Vec<Transaction>) -> Batch {
    Batch {
        id,
        batch_type,
        txns,
        events: Vec::new(),
    }
}

/// Unpack a batch, copying the batch-level events onto every transaction.
pub fn unbatch(batch: Batch) -> Vec<Transaction> {
    let events = batch.events;
    let mut txns = batch.txns;
    for txn in &mut txns {
        txn.events.extend(events.iter().copied());
    }
    txns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;

    fn keys(entries: Vec<(&str, KeyEntry)>) -> BTreeMap<Key, KeyEntry> {
        entries
            .into_iter()
            .map(|(k, e)| (k.to_string(), e))
            .collect()
    }

    fn meta(master: ReplicaId, counter: u64) -> Metadata {
        Metadata { master, counter }
    }

    #[test]
    fn classification_waits_for_complete_metadata() {
        let mut txn = Transaction::new(
            keys(vec![
                ("a", KeyEntry::read().with_metadata(meta(0, 0))),
                ("b", KeyEntry::write()),
            ]),
            Procedure::Code("GET a".into()),
        );
        assert_eq!(set_transaction_type(&mut txn), TransactionType::Unknown);

        txn.keys.get_mut("b").unwrap().metadata = Some(meta(0, 0));
        assert_eq!(set_transaction_type(&mut txn), TransactionType::SingleHome);
        assert_eq!(txn.home, 0);
        assert_eq!(txn.involved_replicas, vec![0]);
    }

    #[test]
    fn classification_is_idempotent_and_metadata_driven() {
        let mut txn = Transaction::new(
            keys(vec![
                ("a", KeyEntry::read().with_metadata(meta(0, 1))),
                ("b", KeyEntry::write().with_metadata(meta(1, 0))),
            ]),
            Procedure::Code(String::new()),
        );
        assert_eq!(
            set_transaction_type(&mut txn),
            TransactionType::MultiHomeOrLockOnly
        );
        assert_eq!(txn.home, -1);
        assert_eq!(txn.involved_replicas, vec![0, 1]);

        // Re-running changes nothing.
        assert_eq!(
            set_transaction_type(&mut txn),
            TransactionType::MultiHomeOrLockOnly
        );
        assert_eq!(txn.involved_replicas, vec![0, 1]);
    }

    #[test]
    fn remaster_to_current_master_stays_single_home() {
        let mut txn = Transaction::new(
            keys(vec![("a", KeyEntry::write().with_metadata(meta(1, 3)))]),
            Procedure::Remaster { new_master: 1 },
        );
        assert_eq!(set_transaction_type(&mut txn), TransactionType::SingleHome);
        assert_eq!(txn.involved_replicas, vec![1]);
    }

    #[test]
    fn remaster_moving_the_key_involves_both_homes() {
        let mut txn = Transaction::new(
            keys(vec![("a", KeyEntry::write().with_metadata(meta(0, 3)))]),
            Procedure::Remaster { new_master: 2 },
        );
        assert_eq!(
            set_transaction_type(&mut txn),
            TransactionType::MultiHomeOrLockOnly
        );
        assert_eq!(txn.involved_replicas, vec![0, 2]);
    }

    #[test]
    fn lock_only_shard_keeps_only_home_keys() {
        let mut txn = Transaction::new(
            keys(vec![
                ("a", KeyEntry::read().with_metadata(meta(0, 0))),
                ("b", KeyEntry::write().with_metadata(meta(1, 2))),
            ]),
            Procedure::Code(String::new()),
        );
        set_transaction_type(&mut txn);

        let shard = generate_lock_only_txn(&txn, 1);
        assert_eq!(shard.home, 1);
        assert_eq!(shard.keys.len(), 1);
        assert!(shard.keys.contains_key("b"));
    }

    #[test]
    fn remaster_new_home_shard_keeps_the_old_mastered_key() {
        let mut txn = Transaction::new(
            keys(vec![("a", KeyEntry::write().with_metadata(meta(0, 3)))]),
            Procedure::Remaster { new_master: 2 },
        );
        set_transaction_type(&mut txn);

        let new_home = generate_lock_only_txn(&txn, 2);
        assert_eq!(new_home.home, 2);
        assert!(new_home.keys.contains_key("a"));

        let old_home = generate_lock_only_txn(&txn, 0);
        assert_eq!(old_home.home, 0);
        assert!(old_home.keys.contains_key("a"));
    }

    #[test]
    fn partitioned_txn_recomputes_involved_replicas() {
        let config = test_config(2, 2, 0, 0);
        let mut txn = Transaction::new(
            keys(vec![
                ("a", KeyEntry::write().with_metadata(meta(0, 0))),
                ("b", KeyEntry::write().with_metadata(meta(1, 0))),
            ]),
            Procedure::Code(String::new()),
        );
        set_transaction_type(&mut txn);
        populate_involved_partitions(&config, &mut txn);

        for partition in 0..2 {
            let Some(part) = generate_partitioned_txn(&config, &txn, partition) else {
                continue;
            };
            let masters: Vec<ReplicaId> = part
                .keys
                .values()
                .filter_map(|e| e.metadata)
                .map(|m| m.master)
                .collect();
            for master in masters {
                assert!(part.involved_replicas.contains(&master));
            }
            // The union over partitions must cover the original key set.
            for key in part.keys.keys() {
                assert_eq!(config.partition_of_key(key), partition);
            }
        }
    }

    #[test]
    fn merge_aborted_participant_aborts_the_whole_txn() {
        let mut txn = Transaction::new(
            keys(vec![("a", KeyEntry::read().with_metadata(meta(0, 0)))]),
            Procedure::Code(String::new()),
        );
        txn.id = 1000;
        txn.status = TransactionStatus::Committed;

        let mut other = txn.clone();
        other.abort(AbortReason::Remastered);

        merge_transaction(&mut txn, &other);
        assert_eq!(txn.status, TransactionStatus::Aborted);
        assert_eq!(txn.abort_reason, Some(AbortReason::Remastered));
    }

    #[test]
    fn merge_unions_keys_first_arrival_wins() {
        let mut txn = Transaction::new(
            keys(vec![("a", KeyEntry::read().with_metadata(meta(0, 0)))]),
            Procedure::Code(String::new()),
        );
        txn.keys.get_mut("a").unwrap().value = "mine".into();

        let mut other = Transaction::new(
            keys(vec![
                ("a", KeyEntry::read().with_metadata(meta(0, 0))),
                ("b", KeyEntry::read().with_metadata(meta(0, 0))),
            ]),
            Procedure::Code(String::new()),
        );
        other.keys.get_mut("a").unwrap().value = "theirs".into();

        merge_transaction(&mut txn, &other);
        assert_eq!(txn.keys["a"].value, "mine");
        assert!(txn.keys.contains_key("b"));
    }

    #[test]
    #[should_panic(expected = "different ids")]
    fn merge_with_mismatched_ids_panics() {
        let mut txn = Transaction::new(BTreeMap::new(), Procedure::Code(String::new()));
        txn.id = 1;
        let mut other = txn.clone();
        other.id = 2;
        merge_transaction(&mut txn, &other);
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        fn arb_metadata() -> impl Strategy<Value = Option<Metadata>> {
            proptest::option::weighted(
                0.9,
                (0u32..3, 0u64..4).prop_map(|(master, counter)| Metadata { master, counter }),
            )
        }

        proptest! {
            /// Classification depends only on the key metadata set and is
            /// stable under repetition.
            #[test]
            fn classification_is_idempotent(
                metas in proptest::collection::vec(arb_metadata(), 1..5),
                remaster_target in proptest::option::of(0u32..3),
            ) {
                let keys: BTreeMap<Key, KeyEntry> = metas
                    .iter()
                    .enumerate()
                    .map(|(i, meta)| {
                        let mut entry = KeyEntry::write();
                        entry.metadata = *meta;
                        (format!("k{i}"), entry)
                    })
                    .collect();
                let procedure = match remaster_target {
                    Some(new_master) => Procedure::Remaster { new_master },
                    None => Procedure::Code(String::new()),
                };
                let mut txn = Transaction::new(keys, procedure);

                let first = set_transaction_type(&mut txn);
                let snapshot = (txn.txn_type, txn.home, txn.involved_replicas.clone());
                let second = set_transaction_type(&mut txn);

                prop_assert_eq!(first, second);
                prop_assert_eq!(snapshot, (txn.txn_type, txn.home, txn.involved_replicas.clone()));
            }

            /// An aborted participant always aborts the merge, whatever the
            /// receiving side's state was.
            #[test]
            fn merge_with_aborted_other_always_aborts(
                committed in proptest::bool::ANY,
            ) {
                let mut txn = Transaction::new(BTreeMap::new(), Procedure::Code(String::new()));
                txn.id = 42;
                if committed {
                    txn.status = TransactionStatus::Committed;
                }
                let mut other = txn.clone();
                other.abort(AbortReason::Remastered);

                merge_transaction(&mut txn, &other);
                prop_assert_eq!(txn.status, TransactionStatus::Aborted);
            }
        }
    }

    #[test]
    fn unbatch_returns_txns_in_order_with_batch_events() {
        let mut t1 = Transaction::new(BTreeMap::new(), Procedure::Code("a".into()));
        t1.id = 1000;
        let mut t2 = Transaction::new(BTreeMap::new(), Procedure::Code("b".into()));
        t2.id = 2000;

        let mut batch = make_batch(100, TransactionType::SingleHome, vec![t1.clone(), t2.clone()]);
        batch.events.push(TxnEventRecord {
            event: TxnEvent::EnterSequencer,
            time_us: 1,
            machine: 3,
        });

        let txns = unbatch(batch);
        assert_eq!(txns.len(), 2);
        assert_eq!(txns[0].id, 1000);
        assert_eq!(txns[0].procedure, t1.procedure);
        assert_eq!(txns[1].id, 2000);
        assert_eq!(txns[1].procedure, t2.procedure);
        for txn in &txns {
            assert_eq!(
                txn.events.last().map(|e| e.event),
                Some(TxnEvent::EnterSequencer)
            );
        }
    }
}
