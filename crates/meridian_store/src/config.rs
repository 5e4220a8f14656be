//! Deployment configuration.
//!
//! One `Config` describes the whole `R x P` matrix and is identical on every
//! machine; `NodeConfig` pins it to one machine's coordinates and carries the
//! derived helpers (machine ids, key partitioning, queue ids). The channel
//! registry travels inside the config so no module reads process globals.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::types::{Channel, Key, MachineId, PartitionId, QueueId, ReplicaId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// One process per machine, talking over TCP.
    Tcp,
    /// Whole deployment inside one process, delivered in-memory.
    Ipc,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// One address per partition, in partition order.
    pub addresses: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct HashPartitioning {
    /// Number of leading key bytes fed to the partition hash; 0 hashes the
    /// whole key.
    pub partition_key_num_bytes: usize,
}

/// Channel numbers for every module. Fixed per deployment and carried here
/// instead of in process-wide constants.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ChannelRegistry {
    pub server: Channel,
    pub forwarder: Channel,
    pub sequencer: Channel,
    pub multi_home_orderer: Channel,
    pub interleaver: Channel,
    pub scheduler: Channel,
    pub local_paxos: Channel,
    pub global_paxos: Channel,
    /// Base channel of the worker pool; worker `i` listens on `worker + i`.
    pub worker: Channel,
    pub broker: Channel,
    pub max_channel: Channel,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self {
            server: 1,
            forwarder: 2,
            sequencer: 3,
            multi_home_orderer: 4,
            interleaver: 5,
            scheduler: 6,
            local_paxos: 7,
            global_paxos: 8,
            worker: 9,
            broker: 10,
            max_channel: 15,
        }
    }
}

impl ChannelRegistry {
    pub fn worker_channel(&self, worker: usize) -> Channel {
        let channel = self.worker + worker as Channel;
        assert!(
            channel < self.max_channel,
            "worker channel {channel} exceeds the registry's max channel"
        );
        channel
    }
}

fn default_num_workers() -> usize {
    3
}

fn default_lock_manager() -> String {
    "ddr".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub protocol: Protocol,
    pub replicas: Vec<ReplicaConfig>,
    pub num_partitions: u32,
    pub hash_partitioning: HashPartitioning,
    pub sequencer_batch_duration_ms: u64,
    pub forwarder_batch_duration_ms: u64,
    pub leader_partition_for_multi_home_ordering: u32,
    /// Skip global multi-home ordering and ship lock-only shards straight to
    /// each home's sequencer.
    pub bypass_mh_orderer: bool,
    /// Port of the client-facing API in front of the server module.
    pub server_port: u16,
    /// Listener ports of the broker; the first carries all peer traffic.
    pub broker_ports: Vec<u16>,
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Lock manager variant; "ddr" is the only shipped implementation.
    #[serde(default = "default_lock_manager")]
    pub lock_manager: String,
    #[serde(default)]
    pub channels: ChannelRegistry,
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.replicas.is_empty(), "config lists no replicas");
        anyhow::ensure!(self.num_partitions > 0, "num_partitions must be positive");
        for (replica, rc) in self.replicas.iter().enumerate() {
            anyhow::ensure!(
                rc.addresses.len() == self.num_partitions as usize,
                "replica {replica} lists {} addresses for {} partitions",
                rc.addresses.len(),
                self.num_partitions
            );
        }
        anyhow::ensure!(
            self.leader_partition_for_multi_home_ordering < self.num_partitions,
            "multi-home leader partition out of range"
        );
        Ok(())
    }

    pub fn num_replicas(&self) -> u32 {
        self.replicas.len() as u32
    }
}

/// A `Config` pinned to one machine's coordinates.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    config: Arc<Config>,
    local_replica: ReplicaId,
    local_partition: PartitionId,
}

impl NodeConfig {
    pub fn new(config: Arc<Config>, replica: ReplicaId, partition: PartitionId) -> Self {
        assert!(replica < config.num_replicas(), "replica out of range");
        assert!(partition < config.num_partitions, "partition out of range");
        Self {
            config,
            local_replica: replica,
            local_partition: partition,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.config.channels
    }

    pub fn num_replicas(&self) -> u32 {
        self.config.num_replicas()
    }

    pub fn num_partitions(&self) -> u32 {
        self.config.num_partitions
    }

    pub fn local_replica(&self) -> ReplicaId {
        self.local_replica
    }

    pub fn local_partition(&self) -> PartitionId {
        self.local_partition
    }

    pub fn make_machine_id(&self, replica: ReplicaId, partition: PartitionId) -> MachineId {
        replica * self.config.num_partitions + partition
    }

    pub fn local_machine_id(&self) -> MachineId {
        self.make_machine_id(self.local_replica, self.local_partition)
    }

    pub fn replica_of(&self, machine: MachineId) -> ReplicaId {
        machine / self.config.num_partitions
    }

    pub fn partition_of(&self, machine: MachineId) -> PartitionId {
        machine % self.config.num_partitions
    }

    /// All machine ids of the deployment, replica-major.
    pub fn all_machines(&self) -> Vec<MachineId> {
        let mut machines = Vec::new();
        for replica in 0..self.num_replicas() {
            for partition in 0..self.num_partitions() {
                machines.push(self.make_machine_id(replica, partition));
            }
        }
        machines
    }

    /// Machine ids of one replica, in partition order.
    pub fn machines_of_replica(&self, replica: ReplicaId) -> Vec<MachineId> {
        (0..self.num_partitions())
            .map(|partition| self.make_machine_id(replica, partition))
            .collect()
    }

    /// Machines hosting a multi-home orderer: the leader partition of every
    /// replica.
    pub fn orderer_machines(&self) -> Vec<MachineId> {
        (0..self.num_replicas())
            .map(|replica| {
                self.make_machine_id(replica, self.config.leader_partition_for_multi_home_ordering)
            })
            .collect()
    }

    pub fn is_orderer_machine(&self) -> bool {
        self.local_partition == self.config.leader_partition_for_multi_home_ordering
    }

    pub fn partition_of_key(&self, key: &Key) -> PartitionId {
        let bytes = key.as_bytes();
        let prefix_len = self.config.hash_partitioning.partition_key_num_bytes;
        let prefix = if prefix_len == 0 || prefix_len >= bytes.len() {
            bytes
        } else {
            &bytes[..prefix_len]
        };
        let mut hasher = DefaultHasher::new();
        prefix.hash(&mut hasher);
        (hasher.finish() % self.config.num_partitions as u64) as PartitionId
    }

    pub fn mh_queue_id(&self, replica: ReplicaId) -> QueueId {
        crate::types::mh_queue_id(replica)
    }

    pub fn sequencer_batch_duration(&self) -> Duration {
        Duration::from_millis(self.config.sequencer_batch_duration_ms)
    }

    pub fn forwarder_batch_duration(&self) -> Duration {
        Duration::from_millis(self.config.forwarder_batch_duration_ms)
    }
}

/// Build an in-process test configuration pinned to `(replica, partition)`.
pub fn test_config(
    num_replicas: u32,
    num_partitions: u32,
    replica: ReplicaId,
    partition: PartitionId,
) -> NodeConfig {
    let config = Config {
        protocol: Protocol::Ipc,
        replicas: (0..num_replicas)
            .map(|_| ReplicaConfig {
                addresses: (0..num_partitions)
                    .map(|p| format!("127.0.0.1:{}", 20000 + p))
                    .collect(),
            })
            .collect(),
        num_partitions,
        hash_partitioning: HashPartitioning {
            partition_key_num_bytes: 0,
        },
        sequencer_batch_duration_ms: 5,
        forwarder_batch_duration_ms: 5,
        leader_partition_for_multi_home_ordering: 0,
        bypass_mh_orderer: false,
        server_port: 2023,
        broker_ports: vec![2024],
        num_workers: 2,
        lock_manager: "ddr".to_string(),
        channels: ChannelRegistry::default(),
    };
    NodeConfig::new(Arc::new(config), replica, partition)
}
