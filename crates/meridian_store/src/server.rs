//! Server: the coordinating endpoint of the pipeline.
//!
//! Assigns machine-prefixed transaction ids on admission, remembers who to
//! answer, and merges the per-partition completions coming back from the
//! schedulers. A transaction finishes when every involved partition has
//! reported; a single aborted partition aborts the whole transaction. The
//! final merged transaction is returned to the channel that submitted it.

use std::collections::HashMap;

use serde_json::json;
use tokio::sync::mpsc;

use crate::broker::Sender;
use crate::config::NodeConfig;
use crate::stats;
use crate::transaction::{
    merge_transaction, populate_involved_partitions, Transaction, TxnEvent,
};
use crate::types::{
    Channel, CompletedTransaction, Envelope, ForwardTxn, MachineId, Message, Request, Response,
    StatsResponse, TxnId, MAX_NUM_MACHINES,
};

struct PendingResponse {
    reply_to: (MachineId, Channel),
    merged: Option<Transaction>,
    received: usize,
    expected: usize,
}

pub struct Server {
    config: NodeConfig,
    sender: Sender,
    rx: mpsc::UnboundedReceiver<Envelope>,
    txn_id_counter: u64,
    pending: HashMap<TxnId, PendingResponse>,
}

impl Server {
    pub fn new(config: NodeConfig, sender: Sender, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            config,
            sender,
            rx,
            txn_id_counter: 0,
            pending: HashMap::new(),
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
            Request::ForwardTxn(ForwardTxn { txn }) => {
                self.admit(txn, (env.from, env.from_channel))
            }
            Request::Completed(CompletedTransaction { txn }) => self.complete(txn),
            Request::Stats(stats_request) => {
                let response = Response::Stats(StatsResponse {
                    stats: self.stats(stats_request.level),
                });
                self.sender.send_response(response, env.from, env.from_channel);
            }
            other => tracing::warn!(?other, "server received unexpected request"),
        }
    }

    /// Admit a client transaction: assign its id, stamp the coordinating
    /// server, compute the partition footprint, and hand it to the local
    /// forwarder.
    fn admit(&mut self, mut txn: Transaction, reply_to: (MachineId, Channel)) {
        self.txn_id_counter += 1;
        txn.id = self.txn_id_counter * MAX_NUM_MACHINES + self.config.local_machine_id() as TxnId;
        txn.coordinating_server = self.config.local_machine_id();
        populate_involved_partitions(&self.config, &mut txn);
        txn.record_event(TxnEvent::EnterServer, self.config.local_machine_id());

        let expected = txn.involved_partitions.len();
        self.pending.insert(
            txn.id,
            PendingResponse {
                reply_to,
                merged: None,
                received: 0,
                expected,
            },
        );
        tracing::debug!(txn_id = txn.id, expected, "transaction admitted");

        self.sender.send_local(
            Request::ForwardTxn(ForwardTxn { txn }),
            self.config.channels().forwarder,
        );
    }

    /// Fold one partition's completion into the pending transaction and
    /// answer the client once every involved partition reported.
    fn complete(&mut self, txn: Transaction) {
        let txn_id = txn.id;
        let Some(pending) = self.pending.get_mut(&txn_id) else {
            tracing::warn!(txn_id, "completion for unknown transaction");
            return;
        };
        pending.received += 1;
        match pending.merged.as_mut() {
            Some(merged) => merge_transaction(merged, &txn),
            None => pending.merged = Some(txn),
        }

        if pending.received < pending.expected {
            return;
        }
        let pending = self.pending.remove(&txn_id).unwrap();
        let Some(mut merged) = pending.merged else {
            return;
        };
        merged.record_event(TxnEvent::ReturnToServer, self.config.local_machine_id());
        tracing::debug!(txn_id, status = ?merged.status, "transaction finished");
        self.sender.send_request(
            Request::Completed(CompletedTransaction { txn: merged }),
            pending.reply_to.0,
            pending.reply_to.1,
        );
    }

    fn stats(&self, level: u32) -> serde_json::Value {
        let partially_completed: Vec<TxnId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.received > 0)
            .map(|(&id, _)| id)
            .collect();
        let mut out = json!({
            (stats::TXN_ID_COUNTER): self.txn_id_counter,
            (stats::NUM_PENDING_RESPONSES): self.pending.len(),
            (stats::NUM_PARTIALLY_COMPLETED_TXNS): partially_completed.len(),
        });
        if level >= 1 {
            out[stats::PARTIALLY_COMPLETED_TXNS] = json!(partially_completed);
        }
        out
    }
}
