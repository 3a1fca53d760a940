//! Local block production: template to coinbase to signed submission.
//!
//! Production is three separate operations (building the coinbase,
//! assembling the block around a mempool template, sealing it with the
//! producer signature) plus the generation loop that ties them to
//! the lottery every two seconds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use secp256k1::{Secp256k1, SecretKey};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::chain::{AcceptOutcome, ChainState};
use crate::constants::*;
use crate::error::LotteryError;
use crate::lottery::{self, StakeProof};
use crate::mempool::Mempool;
use crate::net::peer::NetCommand;
use crate::script::{p2pkh_script, push_slice};
use crate::types::{hash160, Amount, Block, BlockHeader, Hash, OutPoint, Transaction, TxIn, TxOut};
use crate::vrf::{self, VrfOutput};

/// Bytes reserved for the header and coinbase when sizing a template.
const BLOCK_OVERHEAD_RESERVE: usize = 1000;

/// Producer identity: the stake key and its derived forms.
#[derive(Clone)]
pub struct ProducerKeys {
    pub secret: SecretKey,
    pub public: Vec<u8>,
}

impl ProducerKeys {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = secret.public_key(&secp).serialize().to_vec();
        ProducerKeys { secret, public }
    }

    /// Parse a 32-byte hex secret key.
    pub fn from_hex(hex_key: &str) -> Option<Self> {
        let bytes = hex::decode(hex_key).ok()?;
        let secret = SecretKey::from_slice(&bytes).ok()?;
        Some(ProducerKeys::new(secret))
    }

    /// Where this producer collects rewards.
    pub fn pay_script(&self) -> Vec<u8> {
        p2pkh_script(&hash160(&self.public))
    }
}

/// Build the coinbase for `height`: the height push, the stake proof with
/// an empty signature placeholder, and the reward output.
pub fn build_coinbase(
    height: u64,
    reward: Amount,
    pay_script: Vec<u8>,
    public_key: &[u8],
    vrf_out: &VrfOutput,
) -> Transaction {
    let mut script_sig = Vec::new();
    push_slice(&mut script_sig, &height.to_le_bytes());
    let proof =
        StakeProof { public_key: public_key.to_vec(), vrf: vrf_out.clone(), signature: vec![] };
    proof.append_to(&mut script_sig);
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(OutPoint::null(), script_sig)],
        outputs: vec![TxOut::new(reward, pay_script)],
        lock_time: 0,
    }
}

/// Assemble an unsigned block: coinbase first, template transactions in
/// order, merkle root committed. Post-activation headers carry no nonce.
pub fn assemble_block(
    parent_hash: Hash,
    parent_bits: u32,
    time: u32,
    coinbase: Transaction,
    transactions: Vec<Transaction>,
) -> Block {
    let mut all = Vec::with_capacity(1 + transactions.len());
    all.push(coinbase);
    all.extend(transactions);
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block_hash: parent_hash,
            merkle_root: [0u8; 32],
            time,
            bits: parent_bits,
            nonce: 0,
        },
        transactions: all,
    };
    block.header.merkle_root = block.merkle_root();
    block
}

/// Seal the block: sign the producer commitment hash and splice the
/// signature into the coinbase, recommitting the merkle root.
pub fn sign_block(block: &mut Block, secret: &SecretKey) -> Result<(), LotteryError> {
    let commitment = lottery::producer_commitment_hash(block)?;
    let secp = Secp256k1::signing_only();
    let message = secp256k1::Message::from_digest_slice(&commitment)
        .map_err(|_| LotteryError::MalformedStakeProof)?;
    let signature = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();

    let coinbase = &mut block.transactions[0];
    let proof = StakeProof::decode(&coinbase.inputs[0].script_sig)?;
    let mut script_sig = Vec::new();
    // Preserve the leading height push.
    let height_push = coinbase.inputs[0].script_sig.clone();
    let first_len = *height_push.first().ok_or(LotteryError::MalformedStakeProof)? as usize;
    push_slice(&mut script_sig, height_push.get(1..1 + first_len).unwrap_or_default());
    let sealed = StakeProof { signature, ..proof };
    sealed.append_to(&mut script_sig);
    coinbase.inputs[0].script_sig = script_sig;
    block.header.merkle_root = block.merkle_root();
    Ok(())
}

/// The generation loop. Every tick: require a peer, require eligibility
/// at the next height, evaluate the VRF, and on a win assemble, sign and
/// submit a block, then announce it.
pub async fn run(
    chain: Arc<RwLock<ChainState>>,
    mempool: Arc<RwLock<Mempool>>,
    peer_count: Arc<AtomicUsize>,
    net: mpsc::Sender<NetCommand>,
    keys: ProducerKeys,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(PRODUCER_TICK_SECS));
    tracing::info!("participation producer started");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if peer_count.load(Ordering::Relaxed) == 0 {
            continue;
        }
        let now = unix_time();
        let Some(mut block) = try_produce(&chain, &mempool, &keys, now).await else {
            continue;
        };
        if let Err(err) = sign_block(&mut block, &keys.secret) {
            tracing::error!("failed to sign produced block: {err}");
            continue;
        }
        let hash = block.hash();
        let outcome = chain.write().await.accept_block(block.clone(), now);
        match outcome {
            Ok(AcceptOutcome::Connected { disconnected }) => {
                let mut pool = mempool.write().await;
                pool.remove_for_block(&block);
                drop(pool);
                if !disconnected.is_empty() {
                    let chain_guard = chain.read().await;
                    mempool.write().await.readmit(disconnected, &chain_guard, now);
                }
                tracing::info!(hash = %hex::encode(hash), "produced block");
                let _ = net.send(NetCommand::AnnounceBlock(hash)).await;
            }
            Ok(other) => {
                tracing::warn!("produced block not connected: {other:?}");
            }
            Err(err) => {
                tracing::error!("produced block rejected: {err}");
            }
        }
    }
    tracing::info!("participation producer stopped");
}

/// Check the lottery for the next height and assemble an unsigned block
/// if this node won. Returns `None` on any miss.
async fn try_produce(
    chain: &Arc<RwLock<ChainState>>,
    mempool: &Arc<RwLock<Mempool>>,
    keys: &ProducerKeys,
    now: u64,
) -> Option<Block> {
    let chain_guard = chain.read().await;
    let height = chain_guard.height() + 1;
    let params = chain_guard.params();
    if !params.participation_active(height) {
        return None;
    }
    if !chain_guard.registry().is_eligible(&keys.public, height, params) {
        return None;
    }
    let parent_hash = chain_guard.best_hash();
    let seed = lottery::seed_for_height(&parent_hash, height);
    let vrf_out = vrf::evaluate(&keys.secret, &seed);
    let eligible = chain_guard.registry().eligible_count(height, params);
    if !lottery::wins(&vrf_out.output, params.lottery_target(eligible)) {
        return None;
    }
    tracing::info!(height, "won participation lottery");

    let template = mempool.read().await.build_template(MAX_BLOCK_SIZE - BLOCK_OVERHEAD_RESERVE);
    let reward = params.subsidy(height) + template.total_fees;
    let coinbase = build_coinbase(height, reward, keys.pay_script(), &keys.public, &vrf_out);
    let parent = chain_guard.tip();
    let mtp = chain_guard.median_time_past(chain_guard.tip_id());
    let time = (now as u32).max(mtp + 1);
    Some(assemble_block(parent_hash, parent.header.bits, time, coinbase, template.transactions))
}

fn unix_time() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
