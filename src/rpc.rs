//! The RPC surface, exposed as plain functions over node state.
//!
//! The JSON-RPC server proper lives outside the core; these handlers do
//! the work and return serializable results or `{code, message}` errors
//! drawn from the fixed taxonomy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

use crate::chain::ChainState;
use crate::constants::BLOCK_TIME_SECS;
use crate::error::{MempoolError, RpcError, RpcErrorCode};
use crate::mempool::{Mempool, MempoolStats};
use crate::net::peer::NetCommand;
use crate::producer::ProducerKeys;
use crate::serialize::{decode_exact, encode_to_vec};
use crate::types::{Amount, Hash};

pub type Result<T> = std::result::Result<T, RpcError>;

/// Read/write verbs bound to a node's shared state.
#[derive(Clone)]
pub struct RpcHandler {
    pub chain: Arc<RwLock<ChainState>>,
    pub mempool: Arc<RwLock<Mempool>>,
    pub peer_count: Arc<AtomicUsize>,
    pub net: Option<mpsc::Sender<NetCommand>>,
    pub keys: Option<ProducerKeys>,
}

/// `getblock` result.
#[derive(Debug, Clone, Serialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: Option<u64>,
    pub confirmations: Option<u64>,
    pub time: u32,
    pub merkle_root: String,
    pub previous_block_hash: String,
    pub size: usize,
    pub tx: Vec<String>,
}

/// `getparticipationinfo` result.
#[derive(Debug, Clone, Serialize)]
pub struct ParticipationInfo {
    pub participants: usize,
    pub eligible: usize,
    pub total_staked: Amount,
    pub locally_eligible: bool,
    pub expected_block_time_secs: u64,
}

fn parse_hash(hex_hash: &str) -> Result<Hash> {
    let bytes = hex::decode(hex_hash)
        .map_err(|_| RpcError::invalid_params("hash must be 64 hex characters"))?;
    bytes.try_into().map_err(|_| RpcError::invalid_params("hash must be 32 bytes"))
}

impl RpcHandler {
    pub async fn get_best_block_hash(&self) -> String {
        hex::encode(self.chain.read().await.best_hash())
    }

    pub async fn get_block_count(&self) -> u64 {
        self.chain.read().await.height()
    }

    pub async fn get_block(&self, hash_hex: &str) -> Result<BlockInfo> {
        let hash = parse_hash(hash_hex)?;
        let chain = self.chain.read().await;
        let block = chain.get_block(&hash).ok_or_else(|| RpcError::not_found("block not found"))?;
        let index = chain.lookup(&hash);
        let height = index.map(|i| i.height);
        let confirmations = index.and_then(|i| {
            (i.status == crate::chain::BlockStatus::MainChain)
                .then(|| chain.height() - i.height + 1)
        });
        Ok(BlockInfo {
            hash: hex::encode(hash),
            height,
            confirmations,
            time: block.header.time,
            merkle_root: hex::encode(block.header.merkle_root),
            previous_block_hash: hex::encode(block.header.prev_block_hash),
            size: block.serialized_size(),
            tx: block.transactions.iter().map(|tx| hex::encode(tx.hash())).collect(),
        })
    }

    pub async fn get_block_hash(&self, height: u64) -> Result<String> {
        self.chain
            .read()
            .await
            .block_hash_at_height(height)
            .map(hex::encode)
            .ok_or_else(|| RpcError::not_found("height beyond tip"))
    }

    /// Serialized transaction by hash, from the mempool or the main chain.
    pub async fn get_raw_transaction(&self, hash_hex: &str) -> Result<String> {
        let hash = parse_hash(hash_hex)?;
        if let Some(entry) = self.mempool.read().await.get(&hash) {
            return Ok(hex::encode(encode_to_vec(&entry.tx)));
        }
        let chain = self.chain.read().await;
        let (tx, _) = chain
            .get_transaction(&hash)
            .ok_or_else(|| RpcError::not_found("transaction not found"))?;
        Ok(hex::encode(encode_to_vec(&tx)))
    }

    /// Decode, admit and announce a serialized transaction. Returns its
    /// hash.
    pub async fn send_raw_transaction(&self, tx_hex: &str) -> Result<String> {
        let bytes =
            hex::decode(tx_hex).map_err(|_| RpcError::invalid_params("not hex"))?;
        let tx: crate::types::Transaction = decode_exact(&bytes)
            .map_err(|err| RpcError::invalid_params(format!("malformed transaction: {err}")))?;
        let now = crate::net::message::unix_time();

        let admitted = {
            let chain = self.chain.read().await;
            let mut mempool = self.mempool.write().await;
            mempool.accept(tx, &chain, now)
        };
        match admitted {
            Ok(hashes) => {
                if let Some(net) = &self.net {
                    for hash in &hashes {
                        let _ = net.send(NetCommand::AnnounceTx(*hash)).await;
                    }
                }
                Ok(hex::encode(hashes[0]))
            }
            Err(MempoolError::Duplicate) => {
                Err(RpcError::new(RpcErrorCode::VerifyFailed, "already in mempool"))
            }
            Err(err) => Err(RpcError::new(RpcErrorCode::VerifyFailed, err.to_string())),
        }
    }

    pub async fn get_mempool_info(&self) -> MempoolStats {
        self.mempool.read().await.stats()
    }

    /// Current lottery picture: registry size, eligibility, expected
    /// block time given one expected winner per height.
    pub async fn get_participation_info(&self) -> ParticipationInfo {
        let chain = self.chain.read().await;
        let params = chain.params();
        let next_height = chain.height() + 1;
        let registry = chain.registry();
        let eligible = registry.eligible_count(next_height, params);
        let locally_eligible = self
            .keys
            .as_ref()
            .map(|keys| registry.is_eligible(&keys.public, next_height, params))
            .unwrap_or(false);
        ParticipationInfo {
            participants: registry.len(),
            eligible,
            total_staked: registry.total_staked(),
            locally_eligible,
            // With the target calibrated to one winner per height, the
            // expected spacing is the tick unless nobody is eligible.
            expected_block_time_secs: if eligible == 0 { 0 } else { BLOCK_TIME_SECS },
        }
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count.load(Ordering::Relaxed)
    }
}
