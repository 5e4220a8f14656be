//! Bus adapters for the Paxos engine.
//!
//! Two instances run per deployment role: a local Paxos per replica ordering
//! that replica's queue lanes, and a global Paxos across the orderer
//! machines ordering multi-home batches. The module owns a sans-IO
//! `MultiPaxos` engine, translates its actions into bus envelopes, and hands
//! committed values to a `CommitHandler`.

use meridian_paxos::{Action, MultiPaxos, PaxosConfig, SlotId};
use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::types::{
    Channel, Envelope, ForwardBatch, LocalQueueOrder, Message, PaxosWire, QueueId, Request,
};

/// Reaction to a committed Paxos value.
pub trait CommitHandler: Send + 'static {
    fn on_commit(&mut self, slot: SlotId, value: u64, is_leader: bool);
}

/// Local Paxos commits name a queue lane; each member tells its own
/// machine's interleaver.
pub struct LocalOrderCommit {
    config: NodeConfig,
    sender: Sender,
}

impl LocalOrderCommit {
    pub fn new(config: NodeConfig, sender: Sender) -> Self {
        Self { config, sender }
    }
}

impl CommitHandler for LocalOrderCommit {
    fn on_commit(&mut self, slot: SlotId, value: u64, _is_leader: bool) {
        self.sender.send_local(
            Request::LocalQueueOrder(LocalQueueOrder {
                slot,
                queue_id: value as QueueId,
            }),
            self.config.channels().interleaver,
        );
    }
}

/// Global Paxos commits name a multi-home batch; the leader broadcasts the
/// decision to every replica's orderer.
pub struct GlobalOrderCommit {
    config: NodeConfig,
    sender: Sender,
}

impl GlobalOrderCommit {
    pub fn new(config: NodeConfig, sender: Sender) -> Self {
        Self { config, sender }
    }
}

impl CommitHandler for GlobalOrderCommit {
    fn on_commit(&mut self, slot: SlotId, value: u64, is_leader: bool) {
        if !is_leader {
            return;
        }
        self.sender.broadcast_request(
            Request::ForwardBatch(ForwardBatch::BatchOrder {
                slot,
                batch_id: value,
            }),
            &self.config.orderer_machines(),
            self.config.channels().multi_home_orderer,
        );
    }
}

/// One machine's participation in one Paxos instance.
pub struct PaxosModule<H: CommitHandler> {
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    channel: Channel,
    engine: MultiPaxos,
    handler: H,
}

impl<H: CommitHandler> PaxosModule<H> {
    pub fn new(
        sender: Sender,
        rx: mpsc::UnboundedReceiver<Envelope>,
        channel: Channel,
        paxos_config: PaxosConfig,
        handler: H,
    ) -> Self {
        Self {
            sender,
            rx,
            channel,
            engine: MultiPaxos::new(paxos_config),
            handler,
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
        let Message::Request(Request::Paxos(PaxosWire { msg })) = env.message else {
            return;
        };
        // A module on this machine asked us to order a value; everything
        // else is protocol traffic between members.
        let actions = if matches!(msg, meridian_paxos::PaxosMessage::Propose { .. })
            && env.from == self.sender.machine()
            && env.from_channel != self.channel
        {
            match msg {
                meridian_paxos::PaxosMessage::Propose { value } => self.engine.propose(value),
                _ => unreachable!(),
            }
        } else {
            self.engine.handle(env.from, msg)
        };
        self.apply(actions);
    }

    fn apply(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Send { to, msg } => {
                    self.sender
                        .send_request(Request::Paxos(PaxosWire { msg }), to, self.channel);
                }
                Action::Deliver {
                    slot,
                    value,
                    is_leader,
                } => self.handler.on_commit(slot, value, is_leader),
            }
        }
    }
}
