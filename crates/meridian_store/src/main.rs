//! Meridian node binary.
//!
//! Starts one machine of the deployment (`tcp` protocol) or, for local
//! development, the whole matrix inside one process (`ipc` protocol).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;

use meridian_store::broker::{Broker, LocalPeerNet};
use meridian_store::config::{Config, NodeConfig, Protocol};
use meridian_store::node::start_machine;
use meridian_store::transport::TcpPeerNet;

#[derive(Debug, Parser)]
#[command(name = "meridian-node", about = "Meridian key-value store node")]
struct Args {
    /// Path to the deployment configuration (JSON).
    #[arg(long, default_value = "meridian.json")]
    config: PathBuf,

    /// Replica index of this machine. Ignored for the ipc protocol.
    #[arg(long, default_value_t = 0)]
    replica: u32,

    /// Partition index of this machine. Ignored for the ipc protocol.
    #[arg(long, default_value_t = 0)]
    partition: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(Config::from_file(&args.config)?);

    let mut machines = Vec::new();
    match config.protocol {
        Protocol::Tcp => {
            let node_config = NodeConfig::new(Arc::clone(&config), args.replica, args.partition);
            let broker = Broker::new(node_config.local_machine_id());
            let net = TcpPeerNet::new(node_config.clone());
            broker.set_transport(net.clone());
            net.serve(broker.clone())
                .await
                .context("starting broker listener")?;
            machines.push(start_machine(node_config, broker));
        }
        Protocol::Ipc => {
            // The whole deployment in one process, wired in memory.
            let net = Arc::new(LocalPeerNet::new());
            let mut brokers = Vec::new();
            for replica in 0..config.num_replicas() {
                for partition in 0..config.num_partitions {
                    let node_config = NodeConfig::new(Arc::clone(&config), replica, partition);
                    let broker = Broker::new(node_config.local_machine_id());
                    broker.set_transport(net.clone());
                    net.register(&broker);
                    brokers.push((node_config, broker));
                }
            }
            for (node_config, broker) in brokers {
                machines.push(start_machine(node_config, broker));
            }
        }
    }

    tracing::info!(machines = machines.len(), "meridian running; ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    for machine in &machines {
        machine.abort_all();
    }
    Ok(())
}
