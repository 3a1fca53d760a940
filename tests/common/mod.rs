//! Shared fixtures: isolated chains and valid producer-signed blocks.
#![allow(dead_code)]

use std::sync::Arc;

use secp256k1::{Secp256k1, SecretKey};

use aurum::chain::ChainState;
use aurum::config::ChainParams;
use aurum::constants::*;
use aurum::lottery;
use aurum::producer;
use aurum::script::OP_1;
use aurum::store::MemoryStore;
use aurum::types::{Amount, Block, OutPoint, Transaction, TxIn, TxOut};
use aurum::vrf;

/// Test parameters: participation from height 1, spendable genesis,
/// instantly mature stake.
pub fn pop_params() -> ChainParams {
    ChainParams {
        activation_height: 1,
        coinbase_maturity: 0,
        stake_maturity: 0,
        ..ChainParams::default()
    }
}

pub fn open_chain(params: ChainParams) -> ChainState {
    ChainState::open(params, Arc::new(MemoryStore::new())).unwrap()
}

pub fn keypair(byte: u8) -> (SecretKey, Vec<u8>) {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
    (secret, secret.public_key(&secp).serialize().to_vec())
}

/// Preload a participant with `MIN_STAKE` locked at height 0.
pub fn register_producer(chain: &mut ChainState, pubkey: &[u8]) {
    let min = chain.params().min_stake;
    chain.registry_mut().lock(OutPoint::new([0xEE; 32], 0), pubkey, min, 0);
}

/// Anyone-can-spend transaction consuming `outpoint`.
pub fn simple_spend(outpoint: OutPoint, value: Amount) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxIn::new(outpoint, vec![OP_1])],
        outputs: vec![TxOut::new(value, vec![OP_1])],
        lock_time: 0,
    }
}

pub fn genesis_coinbase_outpoint(chain: &ChainState) -> OutPoint {
    OutPoint::new(chain.params().genesis_block().transactions[0].hash(), 0)
}

/// Build a fully valid producer-signed block on the current tip.
pub fn make_block(
    chain: &ChainState,
    secret: &SecretKey,
    pubkey: &[u8],
    txs: Vec<Transaction>,
) -> Block {
    let height = chain.height() + 1;
    let parent = chain.tip();
    let seed = lottery::seed_for_height(&parent.hash, height);
    let vrf_out = vrf::evaluate(secret, &seed);

    let coinbase = producer::build_coinbase(
        height,
        chain.params().subsidy(height),
        vec![OP_1],
        pubkey,
        &vrf_out,
    );
    let mut block = producer::assemble_block(
        parent.hash,
        parent.header.bits,
        parent.header.time + BLOCK_TIME_SECS as u32,
        coinbase,
        txs,
    );
    producer::sign_block(&mut block, secret).unwrap();
    block
}

pub fn now_for(block: &Block) -> u64 {
    block.header.time as u64
}
