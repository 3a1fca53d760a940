//! Aurum node daemon.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

use aurum::config::{ChainParams, NodeConfig};
use aurum::node::Node;

/// Participation-based cryptocurrency node.
#[derive(Parser, Debug)]
#[command(name = "aurumd", version, about = "Aurum consensus node")]
struct Cli {
    /// Data directory for chain state and configuration.
    #[arg(long, default_value = "./aurum-data")]
    datadir: PathBuf,

    /// Peer-to-peer listen port.
    #[arg(long)]
    port: Option<u16>,

    /// RPC bind address.
    #[arg(long)]
    rpc_bind: Option<SocketAddr>,

    /// Seed peers to connect to (repeatable).
    #[arg(long = "connect")]
    connect: Vec<SocketAddr>,

    /// Enable the local block-generation loop.
    #[arg(long)]
    produce: bool,

    /// Hex-encoded secret key for staking and production.
    #[arg(long)]
    stake_key: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut config = NodeConfig::load(&cli.datadir);
    if let Some(port) = cli.port {
        config.listen_port = port;
    }
    if let Some(rpc_bind) = cli.rpc_bind {
        config.rpc_bind = rpc_bind;
    }
    config.seeds.extend(cli.connect);
    if cli.produce {
        config.produce = true;
    }
    if cli.stake_key.is_some() {
        config.stake_key = cli.stake_key;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let code = runtime.block_on(async {
        let mut node = match Node::open(config, ChainParams::default()) {
            Ok(node) => node,
            Err(err) => {
                tracing::error!("{err}");
                return err.exit_code();
            }
        };
        if let Err(err) = node.start().await {
            tracing::error!("{err}");
            node.stop().await;
            return err.exit_code();
        }
        node.run_until_shutdown().await;
        0
    });
    std::process::exit(code);
}
