//! Typed envelope bus.
//!
//! Every module registers one named channel on its machine's `Broker` and
//! receives envelopes through a private mpsc receiver. Local sends are
//! delivered in-process; sends to other machines go through the configured
//! `PeerTransport`. Per-peer delivery is FIFO, mirroring one ordered
//! connection per peer.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;

use crate::types::{Channel, Envelope, MachineId, Request, Response};

/// Remote half of the bus. Implementations must preserve per-peer order and
/// never reorder envelopes within one (sender, receiver) pair.
pub trait PeerTransport: Send + Sync + 'static {
    fn send_remote(&self, to: MachineId, to_channel: Channel, env: Envelope);
}

struct BrokerInner {
    machine: MachineId,
    channels: RwLock<HashMap<Channel, mpsc::UnboundedSender<Envelope>>>,
    transport: RwLock<Option<Arc<dyn PeerTransport>>>,
}

/// One machine's bus endpoint.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(machine: MachineId) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                machine,
                channels: RwLock::new(HashMap::new()),
                transport: RwLock::new(None),
            }),
        }
    }

    pub fn machine(&self) -> MachineId {
        self.inner.machine
    }

    /// Install the remote transport. Must happen before any cross-machine
    /// send; local-only deployments may skip it.
    pub fn set_transport(&self, transport: Arc<dyn PeerTransport>) {
        *self.inner.transport.write().unwrap() = Some(transport);
    }

    /// Register a channel and return its receiving end. Each channel number
    /// may be claimed once.
    pub fn add_channel(&self, channel: Channel) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut channels = self.inner.channels.write().unwrap();
        let previous = channels.insert(channel, tx);
        assert!(
            previous.is_none(),
            "channel {channel} registered twice on machine {}",
            self.inner.machine
        );
        rx
    }

    /// Deliver an envelope to a local channel. A nonexistent channel means
    /// the deployment wiring is broken, which is fatal.
    pub fn deliver(&self, to_channel: Channel, env: Envelope) {
        let channels = self.inner.channels.read().unwrap();
        let Some(tx) = channels.get(&to_channel) else {
            panic!(
                "envelope for nonexistent channel {to_channel} on machine {}",
                self.inner.machine
            );
        };
        // A closed receiver only happens during shutdown; drop silently.
        let _ = tx.send(env);
    }

    /// Create a sending handle for a module listening on `from_channel`.
    pub fn sender(&self, from_channel: Channel) -> Sender {
        Sender {
            broker: self.clone(),
            from_channel,
        }
    }

    fn send_envelope(&self, to_machine: MachineId, to_channel: Channel, env: Envelope) {
        if to_machine == self.inner.machine {
            self.deliver(to_channel, env);
            return;
        }
        let transport = self.inner.transport.read().unwrap();
        let Some(transport) = transport.as_ref() else {
            panic!(
                "machine {} has no transport but sends to machine {to_machine}",
                self.inner.machine
            );
        };
        transport.send_remote(to_machine, to_channel, env);
    }
}

/// Sending handle bound to one module's channel; stamps provenance on every
/// outgoing envelope.
#[derive(Clone)]
pub struct Sender {
    broker: Broker,
    from_channel: Channel,
}

impl Sender {
    pub fn machine(&self) -> MachineId {
        self.broker.machine()
    }

    pub fn send_request(&self, request: Request, to_machine: MachineId, to_channel: Channel) {
        let env = Envelope::request(self.broker.machine(), self.from_channel, request);
        self.broker.send_envelope(to_machine, to_channel, env);
    }

    pub fn send_response(&self, response: Response, to_machine: MachineId, to_channel: Channel) {
        let env = Envelope::response(self.broker.machine(), self.from_channel, response);
        self.broker.send_envelope(to_machine, to_channel, env);
    }

    /// Send to a module on this machine.
    pub fn send_local(&self, request: Request, to_channel: Channel) {
        self.send_request(request, self.broker.machine(), to_channel);
    }

    pub fn broadcast_request(
        &self,
        request: Request,
        to_machines: &[MachineId],
        to_channel: Channel,
    ) {
        for &machine in to_machines {
            self.send_request(request.clone(), machine, to_channel);
        }
    }
}

/// In-process deployment net: every machine's broker registered in one
/// shared table. Used by `ipc` deployments and the test harness.
#[derive(Clone, Default)]
pub struct LocalPeerNet {
    brokers: Arc<RwLock<HashMap<MachineId, Broker>>>,
}

impl LocalPeerNet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, broker: &Broker) {
        self.brokers
            .write()
            .unwrap()
            .insert(broker.machine(), broker.clone());
    }
}

impl PeerTransport for LocalPeerNet {
    fn send_remote(&self, to: MachineId, to_channel: Channel, env: Envelope) {
        let brokers = self.brokers.read().unwrap();
        let Some(broker) = brokers.get(&to) else {
            panic!("machine {to} is not part of this in-process deployment");
        };
        broker.deliver(to_channel, env);
    }
}
