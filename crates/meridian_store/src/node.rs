//! Assembly of one machine's module pipeline.

use std::sync::Arc;

use meridian_paxos::{PaxosConfig, DEFAULT_LEADER_POSITION};

use crate::broker::Broker;
use crate::config::NodeConfig;
use crate::forwarder::Forwarder;
use crate::interleaver::Interleaver;
use crate::orderer::MultiHomeOrderer;
use crate::paxos::{GlobalOrderCommit, LocalOrderCommit, PaxosModule};
use crate::remaster_manager::RemasterManager;
use crate::scheduler::Scheduler;
use crate::sequencer::Sequencer;
use crate::server::Server;
use crate::storage::{LookupMasterIndex, MemStorage, Storage};
use crate::types::{Key, Record};
use crate::worker::Worker;

/// One running machine: its broker, storage, and module tasks.
pub struct Machine {
    pub config: NodeConfig,
    pub broker: Broker,
    pub storage: Arc<MemStorage>,
    pub lookup_index: Arc<LookupMasterIndex>,
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl Machine {
    /// Seed one record. Only meaningful before traffic starts; every
    /// replica must be seeded identically.
    pub fn data(&self, key: Key, record: Record) {
        self.lookup_index.update(key.clone(), record.metadata);
        self.storage.write(key, record);
    }

    pub fn abort_all(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Spawn the full module pipeline of one machine onto the current runtime.
///
/// The multi-home orderer and the global Paxos run only on the configured
/// leader partition of each replica.
pub fn start_machine(config: NodeConfig, broker: Broker) -> Machine {
    let channels = *config.channels();
    let storage = Arc::new(MemStorage::new());
    let lookup_index = Arc::new(LookupMasterIndex::new());
    let me = config.local_machine_id();
    let mut handles = Vec::new();

    let server_rx = broker.add_channel(channels.server);
    handles.push(Server::new(config.clone(), broker.sender(channels.server), server_rx).spawn());

    let forwarder_rx = broker.add_channel(channels.forwarder);
    handles.push(
        Forwarder::new(
            config.clone(),
            broker.sender(channels.forwarder),
            forwarder_rx,
            Arc::clone(&lookup_index),
        )
        .spawn(),
    );

    let sequencer_rx = broker.add_channel(channels.sequencer);
    handles.push(
        Sequencer::new(config.clone(), broker.sender(channels.sequencer), sequencer_rx).spawn(),
    );

    let interleaver_rx = broker.add_channel(channels.interleaver);
    handles.push(
        Interleaver::new(config.clone(), broker.sender(channels.interleaver), interleaver_rx)
            .spawn(),
    );

    let scheduler_rx = broker.add_channel(channels.scheduler);
    handles.push(
        Scheduler::new(
            config.clone(),
            broker.sender(channels.scheduler),
            scheduler_rx,
            RemasterManager::new(Arc::clone(&lookup_index)),
        )
        .spawn(),
    );

    for worker in 0..config.config().num_workers {
        let channel = channels.worker_channel(worker);
        let worker_rx = broker.add_channel(channel);
        handles.push(
            Worker::new(
                config.clone(),
                broker.sender(channel),
                worker_rx,
                Arc::clone(&storage) as Arc<dyn Storage>,
                Arc::clone(&lookup_index),
            )
            .spawn(),
        );
    }

    let local_paxos_rx = broker.add_channel(channels.local_paxos);
    let local_paxos_config = PaxosConfig {
        members: config.machines_of_replica(config.local_replica()),
        me,
        leader_position: DEFAULT_LEADER_POSITION,
    };
    handles.push(
        PaxosModule::new(
            broker.sender(channels.local_paxos),
            local_paxos_rx,
            channels.local_paxos,
            local_paxos_config,
            LocalOrderCommit::new(config.clone(), broker.sender(channels.local_paxos)),
        )
        .spawn(),
    );

    if config.is_orderer_machine() {
        let orderer_rx = broker.add_channel(channels.multi_home_orderer);
        handles.push(
            MultiHomeOrderer::new(
                config.clone(),
                broker.sender(channels.multi_home_orderer),
                orderer_rx,
            )
            .spawn(),
        );

        let global_paxos_rx = broker.add_channel(channels.global_paxos);
        let global_paxos_config = PaxosConfig {
            members: config.orderer_machines(),
            me,
            leader_position: DEFAULT_LEADER_POSITION,
        };
        handles.push(
            PaxosModule::new(
                broker.sender(channels.global_paxos),
                global_paxos_rx,
                channels.global_paxos,
                global_paxos_config,
                GlobalOrderCommit::new(config.clone(), broker.sender(channels.global_paxos)),
            )
            .spawn(),
        );
    }

    tracing::info!(
        machine = me,
        replica = config.local_replica(),
        partition = config.local_partition(),
        "machine started"
    );

    Machine {
        config,
        broker,
        storage,
        lookup_index,
        handles,
    }
}
