//! TCP transport for cross-machine envelopes.
//!
//! Frames are 4-byte big-endian length prefixes followed by a bincode-encoded
//! `RemoteFrame`. Each peer gets at most one outbound connection, written by a
//! dedicated task draining an unbounded queue, so per-peer order is preserved
//! end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::broker::{Broker, PeerTransport};
use crate::config::NodeConfig;
use crate::types::{Channel, Envelope, MachineId};

/// Hard cap on a single frame; anything larger indicates a corrupt stream.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Clone, Debug, Serialize, Deserialize)]
struct RemoteFrame {
    to_channel: Channel,
    env: Envelope,
}

fn encode_frame(frame: &RemoteFrame, buf: &mut BytesMut) -> anyhow::Result<()> {
    let body = bincode::serde::encode_to_vec(frame, bincode::config::standard())?;
    anyhow::ensure!(body.len() <= MAX_FRAME_BYTES, "frame exceeds size cap");
    buf.reserve(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(())
}

/// Try to decode one frame from the front of `buf`, consuming it on success.
fn decode_frame(buf: &mut BytesMut) -> anyhow::Result<Option<RemoteFrame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    anyhow::ensure!(len <= MAX_FRAME_BYTES, "inbound frame exceeds size cap");
    if buf.len() < 4 + len {
        return Ok(None);
    }
    buf.advance(4);
    let body = buf.split_to(len);
    let (frame, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())?;
    Ok(Some(frame))
}

/// TCP-backed `PeerTransport`: lazy outbound connections, one writer task per
/// peer, and an accept loop feeding inbound frames to the local broker.
pub struct TcpPeerNet {
    config: NodeConfig,
    outbound: Mutex<HashMap<MachineId, mpsc::UnboundedSender<RemoteFrame>>>,
}

impl TcpPeerNet {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            outbound: Mutex::new(HashMap::new()),
        })
    }

    /// Bind the broker listener and start accepting inbound peer streams.
    pub async fn serve(&self, broker: Broker) -> anyhow::Result<()> {
        let port = self
            .config
            .config()
            .broker_ports
            .first()
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no broker port configured"))?;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        tracing::info!(port, machine = broker.machine(), "broker listening");

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let broker = broker.clone();
                        tokio::spawn(async move {
                            if let Err(err) = read_peer_stream(stream, broker).await {
                                tracing::warn!(%peer_addr, error = %err, "peer stream closed");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });
        Ok(())
    }

    fn peer_address(&self, machine: MachineId) -> String {
        let replica = self.config.replica_of(machine) as usize;
        let partition = self.config.partition_of(machine) as usize;
        self.config.config().replicas[replica].addresses[partition].clone()
    }

    fn outbound_queue(&self, machine: MachineId) -> mpsc::UnboundedSender<RemoteFrame> {
        let mut outbound = self.outbound.lock().unwrap();
        if let Some(tx) = outbound.get(&machine) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let address = self.peer_address(machine);
        tokio::spawn(write_peer_stream(machine, address, rx));
        outbound.insert(machine, tx.clone());
        tx
    }
}

impl PeerTransport for TcpPeerNet {
    fn send_remote(&self, to: MachineId, to_channel: Channel, env: Envelope) {
        let frame = RemoteFrame { to_channel, env };
        // A closed queue means the writer task died; the next send recreates
        // it, and this frame is lost like any in-flight frame on a dead link.
        let _ = self.outbound_queue(to).send(frame);
    }
}

async fn write_peer_stream(
    machine: MachineId,
    address: String,
    mut rx: mpsc::UnboundedReceiver<RemoteFrame>,
) {
    let mut stream: Option<TcpStream> = None;
    let mut buf = BytesMut::new();

    while let Some(frame) = rx.recv().await {
        if stream.is_none() {
            match TcpStream::connect(&address).await {
                Ok(s) => {
                    let _ = s.set_nodelay(true);
                    stream = Some(s);
                }
                Err(err) => {
                    tracing::warn!(machine, %address, error = %err, "peer connect failed; dropping frame");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            }
        }

        buf.clear();
        if let Err(err) = encode_frame(&frame, &mut buf) {
            tracing::error!(machine, error = %err, "frame encode failed; dropping frame");
            continue;
        }
        if let Some(s) = stream.as_mut() {
            if let Err(err) = s.write_all(&buf).await {
                tracing::warn!(machine, error = %err, "peer write failed; reconnecting");
                stream = None;
            }
        }
    }
}

async fn read_peer_stream(mut stream: TcpStream, broker: Broker) -> anyhow::Result<()> {
    let mut buf = BytesMut::with_capacity(64 * 1024);
    loop {
        while let Some(frame) = decode_frame(&mut buf)? {
            broker.deliver(frame.to_channel, frame.env);
        }
        let read = stream.read_buf(&mut buf).await?;
        if read == 0 {
            return Ok(());
        }
    }
}
