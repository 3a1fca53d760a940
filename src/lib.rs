//! # Aurum
//!
//! Consensus core of a participation-based cryptocurrency node. Blocks
//! are produced not by computational work but by a verifiable-random-
//! function lottery among stake-holding participants; the legacy
//! proof-of-work rule survives only to validate the chain below the
//! activation height.
//!
//! ## Architecture
//!
//! The crate is layered leaves-first:
//! - `serialize`: the canonical byte codec every other layer speaks
//! - `types`: transactions, blocks, hashes, merkle trees
//! - `script`: the stack machine guarding outputs
//! - `utxo`: the unspent-output set with per-block undo journalling
//! - `mempool`: admission and the hybrid fee economy (5% free zone)
//! - `chain`: block index, validation, reorganization
//! - `vrf` / `lottery` / `producer`: the participation lottery
//! - `net`: framing, handshake, per-peer state machines
//! - `store` / `rpc` / `node`: persistence boundary, RPC verbs,
//!   orchestration
//!
//! Chain state is an explicit owned value behind the node's writer lock;
//! nothing in the crate is a process-wide singleton, so tests stand up
//! as many isolated nodes as they need.

pub mod chain;
pub mod config;
pub mod constants;
pub mod error;
pub mod lottery;
pub mod mempool;
pub mod net;
pub mod node;
pub mod pow;
pub mod producer;
pub mod rpc;
pub mod script;
pub mod serialize;
pub mod store;
pub mod types;
pub mod utxo;
pub mod vrf;

pub use chain::{AcceptOutcome, BlockStatus, ChainError, ChainState};
pub use config::{ChainParams, NodeConfig};
pub use error::{
    CodecError, ConsensusError, LotteryError, MempoolError, NetError, RpcError, ScriptError,
    StoreError,
};
pub use mempool::Mempool;
pub use node::Node;
pub use types::{Amount, Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut};
