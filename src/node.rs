//! Node orchestrator: wiring, lifecycle, lock file, shutdown drain.
//!
//! Components boot in dependency order (store, chain, mempool, lottery
//! inside the chain, network, RPC) and tear down in reverse. A single
//! lock file guards the data directory against concurrent instances.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainState;
use crate::config::{ChainParams, NodeConfig};
use crate::mempool::Mempool;
use crate::net::peer::{self, NetConfig, NetContext};
use crate::producer::{self, ProducerKeys};
use crate::rpc::RpcHandler;
use crate::store::{FileStore, KvStore};

/// Grace period for task drain on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Fatal initialization failures, mapped to process exit codes.
#[derive(Error, Debug)]
pub enum InitError {
    /// Another instance holds the data directory. Exit code 2.
    #[error("data directory is locked by another instance")]
    LockContention,

    /// Anything else fatal. Exit code 1.
    #[error("initialization failed: {0}")]
    Fatal(String),
}

impl InitError {
    pub fn exit_code(&self) -> i32 {
        match self {
            InitError::LockContention => 2,
            InitError::Fatal(_) => 1,
        }
    }
}

/// Exclusive data-directory lock, released on drop.
struct LockFile {
    path: PathBuf,
}

impl LockFile {
    fn acquire(data_dir: &Path) -> Result<Self, InitError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| InitError::Fatal(format!("cannot create data dir: {e}")))?;
        let path = data_dir.join(".lock");
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(LockFile { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(InitError::LockContention)
            }
            Err(err) => Err(InitError::Fatal(format!("cannot create lock file: {err}"))),
        }
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A running node: shared state plus the task handles that animate it.
pub struct Node {
    pub config: NodeConfig,
    pub chain: Arc<RwLock<ChainState>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub store: Arc<dyn KvStore>,
    pub peer_count: Arc<AtomicUsize>,
    pub shutdown: CancellationToken,
    keys: Option<ProducerKeys>,
    net_tx: Option<tokio::sync::mpsc::Sender<peer::NetCommand>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    _lock: LockFile,
}

impl Node {
    /// Acquire the data directory and bring up store and chain state.
    pub fn open(config: NodeConfig, params: ChainParams) -> Result<Self, InitError> {
        let lock = LockFile::acquire(&config.data_dir)?;
        let store: Arc<dyn KvStore> = Arc::new(
            FileStore::open(&config.data_dir)
                .map_err(|e| InitError::Fatal(format!("store: {e}")))?,
        );
        let chain = ChainState::open(params, store.clone())
            .map_err(|e| InitError::Fatal(format!("chain: {e}")))?;
        tracing::info!(height = chain.height(), "chain state ready");

        let keys = match &config.stake_key {
            Some(hex_key) => Some(
                ProducerKeys::from_hex(hex_key)
                    .ok_or_else(|| InitError::Fatal("malformed stake key".into()))?,
            ),
            None => None,
        };

        Ok(Node {
            config,
            chain: Arc::new(RwLock::new(chain)),
            mempool: Arc::new(RwLock::new(Mempool::new())),
            store,
            peer_count: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
            keys,
            net_tx: None,
            tasks: Vec::new(),
            _lock: lock,
        })
    }

    /// Start the network layer and, if configured, the producer.
    pub async fn start(&mut self) -> Result<(), InitError> {
        let net_config = NetConfig {
            magic: self.chain.read().await.params().magic,
            listen_port: self.config.listen_port,
            user_agent: format!("/aurum:{}/", env!("CARGO_PKG_VERSION")),
            max_connections: self.config.max_connections,
            seeds: self.config.seeds.clone(),
        };
        let ctx = NetContext {
            config: net_config,
            chain: self.chain.clone(),
            mempool: self.mempool.clone(),
            store: self.store.clone(),
            peer_count: self.peer_count.clone(),
            shutdown: self.shutdown.clone(),
        };
        let (_local_addr, net_tx, net_handle) =
            peer::start(ctx).await.map_err(|e| InitError::Fatal(format!("network: {e}")))?;
        self.tasks.push(net_handle);
        self.net_tx = Some(net_tx.clone());

        if self.config.produce {
            match &self.keys {
                Some(keys) => {
                    let handle = tokio::spawn(producer::run(
                        self.chain.clone(),
                        self.mempool.clone(),
                        self.peer_count.clone(),
                        net_tx,
                        keys.clone(),
                        self.shutdown.clone(),
                    ));
                    self.tasks.push(handle);
                }
                None => {
                    return Err(InitError::Fatal(
                        "block production enabled without a stake key".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// The RPC boundary over this node's state.
    pub fn rpc(&self) -> RpcHandler {
        RpcHandler {
            chain: self.chain.clone(),
            mempool: self.mempool.clone(),
            peer_count: self.peer_count.clone(),
            net: self.net_tx.clone(),
            keys: self.keys.clone(),
        }
    }

    /// Block until ctrl-c or an internal fatal cancellation, then drain.
    pub async fn run_until_shutdown(&mut self) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received, shutting down");
            }
            _ = self.shutdown.cancelled() => {
                tracing::error!("internal fatal condition, shutting down");
            }
        }
        self.stop().await;
    }

    /// Orderly drain: stop accepting work, let tasks finish within the
    /// grace period, flush the store.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, task).await.is_err() {
                tracing::warn!("task did not stop within grace period");
            }
        }
        if let Err(err) = self.store.flush() {
            tracing::error!("final store flush failed: {err}");
        }
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &Path) -> NodeConfig {
        NodeConfig {
            data_dir: dir.to_path_buf(),
            listen_port: 0,
            ..NodeConfig::default()
        }
    }

    #[test]
    fn second_instance_hits_lock_contention() {
        let dir = tempfile::tempdir().unwrap();
        let first = Node::open(test_config(dir.path()), ChainParams::regtest()).unwrap();
        let second = Node::open(test_config(dir.path()), ChainParams::regtest());
        match second {
            Err(InitError::LockContention) => {}
            other => panic!("expected lock contention, got {:?}", other.err()),
        }
        drop(first);
        // Lock released on drop.
        Node::open(test_config(dir.path()), ChainParams::regtest()).unwrap();
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(InitError::LockContention.exit_code(), 2);
        assert_eq!(InitError::Fatal("x".into()).exit_code(), 1);
    }

    #[test]
    fn produce_without_key_is_fatal_at_start() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.produce = true;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let mut node = Node::open(config, ChainParams::regtest()).unwrap();
            match node.start().await {
                Err(InitError::Fatal(_)) => {}
                other => panic!("expected fatal, got {other:?}"),
            }
            node.stop().await;
        });
    }

    #[tokio::test]
    async fn node_starts_and_stops_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = Node::open(test_config(dir.path()), ChainParams::regtest()).unwrap();
        node.start().await.unwrap();
        let rpc = node.rpc();
        assert_eq!(rpc.get_block_count().await, 0);
        assert_eq!(rpc.peer_count(), 0);
        node.stop().await;
        // Store flushed: reopening sees the genesis chain.
        drop(node);
        let reopened = Node::open(test_config(dir.path()), ChainParams::regtest()).unwrap();
        assert_eq!(reopened.rpc().get_block_count().await, 0);
    }
}
