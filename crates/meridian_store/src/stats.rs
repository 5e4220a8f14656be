//! Statistic keys shared by the modules' JSON snapshots.

/* Server */
pub const TXN_ID_COUNTER: &str = "txn_id_counter";
pub const NUM_PENDING_RESPONSES: &str = "num_pending_responses";
pub const NUM_PARTIALLY_COMPLETED_TXNS: &str = "num_partially_completed_txns";
pub const PARTIALLY_COMPLETED_TXNS: &str = "partially_completed_txns";

/* Scheduler */
pub const ALL_TXNS: &str = "all_txns";
pub const NUM_ALL_TXNS: &str = "num_all_txns";
pub const NUM_LOCKED_KEYS: &str = "num_locked_keys";
pub const NUM_TXNS_WAITING_FOR_LOCK: &str = "num_txns_waiting_for_lock";
pub const NUM_LOCKS_WAITED_PER_TXN: &str = "num_locks_waited_per_txn";
pub const LOCK_TABLE: &str = "lock_table";
pub const LOCK_TABLE_TYPE: &str = "lock_table_type";
pub const LOCK_WAITED_BY_GRAPH: &str = "lock_waited_by_graph";

/* Forwarder / Sequencer */
pub const BATCH_SIZES: &str = "batch_sizes";
pub const BATCH_DURATIONS_MS: &str = "batch_durations_ms";

/// Cap on lock-table entries included in a stats snapshot.
pub const LOCK_TABLE_SIZE_LIMIT: usize = 1_000_000;
