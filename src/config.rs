//! Chain parameters and node configuration.
//!
//! `ChainParams` carries everything a network deployment may vary:
//! activation height, the subsidy schedule (the source material disagrees
//! with itself about the floor and halving interval, so both are explicit
//! parameters here), and the lottery target calibration. `NodeConfig` is
//! the operator-facing side, loaded from `aurum.toml` in the data directory
//! with CLI flags taking precedence.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::*;
use crate::types::{Amount, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};

/// Consensus parameters of a chain deployment.
#[derive(Clone, Debug)]
pub struct ChainParams {
    /// Height at which the participation rule replaces proof of work.
    pub activation_height: u64,
    /// Subsidy of the genesis era.
    pub initial_subsidy: Amount,
    /// Subsidy never halves below this floor.
    pub subsidy_floor: Amount,
    /// Blocks between subsidy halvings.
    pub halving_interval: u64,
    /// Confirmations before a coinbase output is spendable.
    pub coinbase_maturity: u64,
    /// Minimum stake for lottery eligibility.
    pub min_stake: Amount,
    /// Confirmations before locked stake counts.
    pub stake_maturity: u64,
    /// Divisor for the lottery target, as a function of the eligible
    /// participant count. The default aims for one expected winner per
    /// height across the eligible set.
    pub lottery_divisor: fn(usize) -> u64,
    /// Network magic for wire frames.
    pub magic: [u8; 4],
    /// Genesis block timestamp.
    pub genesis_time: u32,
    /// Locking script of the genesis coinbase output.
    pub genesis_script_pubkey: Vec<u8>,
}

fn one_winner_per_height(eligible: usize) -> u64 {
    eligible.max(1) as u64
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            activation_height: 3_500_000,
            initial_subsidy: 50 * COIN,
            subsidy_floor: 2 * COIN,
            halving_interval: 840_000,
            coinbase_maturity: COINBASE_MATURITY,
            min_stake: MIN_STAKE,
            stake_maturity: STAKE_MATURITY,
            lottery_divisor: one_winner_per_height,
            magic: NETWORK_MAGIC,
            genesis_time: 1_368_576_000,
            genesis_script_pubkey: vec![0x51],
        }
    }
}

impl ChainParams {
    /// Parameters for isolated test chains: participation from the start,
    /// short maturities.
    pub fn regtest() -> Self {
        ChainParams {
            activation_height: 1,
            coinbase_maturity: 10,
            stake_maturity: 20,
            ..ChainParams::default()
        }
    }

    /// Is the participation rule in force at `height`?
    pub fn participation_active(&self, height: u64) -> bool {
        height >= self.activation_height
    }

    /// Block subsidy: the initial subsidy halved once per interval, never
    /// below the configured floor.
    pub fn subsidy(&self, height: u64) -> Amount {
        let halvings = height / self.halving_interval;
        if halvings >= 63 {
            return self.subsidy_floor;
        }
        (self.initial_subsidy >> halvings).max(self.subsidy_floor)
    }

    /// Lottery winning threshold on the leading 128 bits of the VRF
    /// output, calibrated so the expected number of winners per height is
    /// one across `eligible` participants.
    pub fn lottery_target(&self, eligible: usize) -> u128 {
        u128::MAX / (self.lottery_divisor)(eligible).max(1) as u128
    }

    /// The hard-coded genesis block of this deployment.
    pub fn genesis_block(&self) -> Block {
        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn {
                prevout: OutPoint::null(),
                script_sig: b"From work to participation".to_vec(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TxOut::new(self.initial_subsidy, self.genesis_script_pubkey.clone())],
            lock_time: 0,
        };
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: [0u8; 32],
                merkle_root: [0u8; 32],
                time: self.genesis_time,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        block.header.merkle_root = block.merkle_root();
        block
    }
}

/// Operator configuration: data directory, endpoints, seeds, production.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    pub listen_port: u16,
    pub rpc_bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    pub max_connections: usize,
    /// Run the local block-generation loop.
    pub produce: bool,
    /// Hex-encoded secret key used for producing and stake checks.
    pub stake_key: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            data_dir: PathBuf::from("./aurum-data"),
            listen_port: DEFAULT_PORT,
            rpc_bind: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RPC_PORT)),
            seeds: vec![],
            max_connections: MAX_CONNECTIONS,
            produce: false,
            stake_key: None,
        }
    }
}

/// On-disk shape of `aurum.toml`. All fields optional; CLI flags override.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    node: NodeSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct NodeSection {
    listen_port: Option<u16>,
    rpc_bind: Option<String>,
    seeds: Vec<String>,
    max_connections: Option<usize>,
    produce: Option<bool>,
    stake_key: Option<String>,
}

impl NodeConfig {
    /// Load `aurum.toml` from `data_dir`, folding its values over the
    /// defaults. A missing file yields the defaults; a malformed file is
    /// logged and ignored.
    pub fn load(data_dir: &Path) -> Self {
        let mut config = NodeConfig { data_dir: data_dir.to_path_buf(), ..NodeConfig::default() };
        let path = data_dir.join("aurum.toml");
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(_) => return config,
        };
        let file: ConfigFile = match toml::from_str(&contents) {
            Ok(file) => {
                tracing::info!("loaded config from {}", path.display());
                file
            }
            Err(err) => {
                tracing::warn!("ignoring malformed {}: {err}", path.display());
                return config;
            }
        };
        if let Some(port) = file.node.listen_port {
            config.listen_port = port;
        }
        if let Some(bind) = file.node.rpc_bind.and_then(|s| s.parse().ok()) {
            config.rpc_bind = bind;
        }
        config.seeds.extend(file.node.seeds.iter().filter_map(|s| s.parse::<SocketAddr>().ok()));
        if let Some(max) = file.node.max_connections {
            config.max_connections = max;
        }
        if let Some(produce) = file.node.produce {
            config.produce = produce;
        }
        if file.node.stake_key.is_some() {
            config.stake_key = file.node.stake_key;
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subsidy_halves_and_clamps_to_floor() {
        let params = ChainParams::default();
        assert_eq!(params.subsidy(0), 50 * COIN);
        assert_eq!(params.subsidy(839_999), 50 * COIN);
        assert_eq!(params.subsidy(840_000), 25 * COIN);
        assert_eq!(params.subsidy(1_680_000), 12 * COIN + COIN / 2);
        // Deep into the schedule the floor holds.
        assert_eq!(params.subsidy(840_000 * 10), 2 * COIN);
        assert_eq!(params.subsidy(u64::MAX), 2 * COIN);
    }

    #[test]
    fn lottery_target_scales_with_eligible_count() {
        let params = ChainParams::default();
        assert_eq!(params.lottery_target(0), u128::MAX);
        assert_eq!(params.lottery_target(1), u128::MAX);
        assert_eq!(params.lottery_target(4), u128::MAX / 4);
        assert!(params.lottery_target(100) < params.lottery_target(10));
    }

    #[test]
    fn genesis_block_commits_to_its_transactions() {
        let params = ChainParams::default();
        let genesis = params.genesis_block();
        assert_eq!(genesis.header.merkle_root, genesis.merkle_root());
        assert!(genesis.transactions[0].is_coinbase());
        assert_eq!(genesis.transactions[0].outputs[0].value, 50 * COIN);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("aurum.toml"),
            "[node]\nlisten_port = 9999\nseeds = [\"1.2.3.4:8171\", \"not-an-addr\"]\n",
        )
        .unwrap();
        let config = NodeConfig::load(dir.path());
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.seeds.len(), 1);
        assert_eq!(config.rpc_bind.port(), DEFAULT_RPC_PORT);
    }

    #[test]
    fn missing_config_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig::load(dir.path());
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert!(!config.produce);
    }
}
