//! Core identifiers, key records, and the envelope/message contracts that
//! travel on the broker channels.
//!
//! These types are kept dependency-light because they are shared by every
//! module and by the wire codec.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

pub type Key = String;
pub type Value = String;
pub type ReplicaId = u32;
pub type PartitionId = u32;
/// `replica * num_partitions + partition`; unique across the deployment.
pub type MachineId = u32;
/// Machine-prefixed transaction id: `counter * MAX_NUM_MACHINES + machine`.
pub type TxnId = u64;
/// Machine-prefixed batch id, same scheme as `TxnId`.
pub type BatchId = u64;
pub type SlotId = u32;
/// Lane into the local log. Sequencer lanes use the owning machine's id;
/// multi-home lanes use `mh_queue_id`.
pub type QueueId = u32;
pub type Channel = u64;

pub const MAX_NUM_MACHINES: u64 = 1000;

/// Queue id of the distinguished multi-home lane of `replica`.
pub fn mh_queue_id(replica: ReplicaId) -> QueueId {
    MAX_NUM_MACHINES as QueueId + replica
}

pub fn machine_of_txn(txn_id: TxnId) -> MachineId {
    (txn_id % MAX_NUM_MACHINES) as MachineId
}

/// Per-key mastership record. The counter increments on every successful
/// remaster of the key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub master: ReplicaId,
    pub counter: u64,
}

/// Stored record: the value plus its mastership metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: Value,
    pub metadata: Metadata,
}

/// Wall-clock timestamp in microseconds, used for transaction events.
pub fn now_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(i64::MAX as u128) as i64
}

/// One envelope on the bus: the payload plus enough provenance for the
/// receiver to answer or to tell which replica it came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: MachineId,
    pub from_channel: Channel,
    pub message: Message,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Request(Request),
    Response(Response),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    ForwardTxn(ForwardTxn),
    LookupMaster(LookupMasterRequest),
    ForwardBatch(ForwardBatch),
    LocalQueueOrder(LocalQueueOrder),
    RemoteReadResult(RemoteReadResult),
    Completed(CompletedTransaction),
    Stats(StatsRequest),
    Paxos(PaxosWire),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    LookupMaster(LookupMasterResponse),
    Stats(StatsResponse),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardTxn {
    pub txn: Transaction,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupMasterRequest {
    pub txn_ids: Vec<TxnId>,
    pub keys: Vec<Key>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookupMasterResponse {
    pub txn_ids: Vec<TxnId>,
    pub metadata: BTreeMap<Key, Metadata>,
    /// Keys this partition is authoritative for but has never seen; they
    /// default to `{master: 0, counter: 0}`.
    pub new_keys: Vec<Key>,
}

/// Batch replication and ordering traffic for the interleaver and the
/// multi-home orderer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ForwardBatch {
    /// Batch payload, tagged with its position in the origin queue.
    BatchData {
        batch: Batch,
        same_origin_position: u64,
    },
    /// Global ordering decision for a multi-home batch.
    BatchOrder { slot: SlotId, batch_id: BatchId },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalQueueOrder {
    pub slot: SlotId,
    pub queue_id: QueueId,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteReadResult {
    pub txn_id: TxnId,
    pub partition: PartitionId,
    pub keys: BTreeMap<Key, Value>,
    /// Set when the sending partition has aborted the transaction; the
    /// receiver must abort as well instead of executing.
    pub will_abort: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletedTransaction {
    pub txn: Transaction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsRequest {
    pub level: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatsResponse {
    pub stats: serde_json::Value,
}

/// Paxos protocol message riding the bus between members of one instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaxosWire {
    pub msg: meridian_paxos::PaxosMessage,
}

/// An ordered batch of transactions from one queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub batch_type: crate::transaction::TransactionType,
    pub txns: Vec<Transaction>,
    /// Batch-level events, copied onto every member transaction when the
    /// batch is unbatched.
    pub events: Vec<crate::transaction::TxnEventRecord>,
}

impl Envelope {
    pub fn request(from: MachineId, from_channel: Channel, request: Request) -> Self {
        Self {
            from,
            from_channel,
            message: Message::Request(request),
        }
    }

    pub fn response(from: MachineId, from_channel: Channel, response: Response) -> Self {
        Self {
            from,
            from_channel,
            message: Message::Response(response),
        }
    }
}
