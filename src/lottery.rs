//! Participation lottery: who may produce a block, and how to prove it.
//!
//! Stake is locked by paying to a tagged, spendable script (see
//! [`stake_lock_script`]). The registry follows the main chain: records
//! appear when stake-lock outputs are created and vanish when they are
//! spent or disconnected. Eligibility at height `H` requires the minimum
//! stake and `stake_maturity` confirmations.
//!
//! The producer proves its win with a stake proof embedded in the coinbase
//! `script_sig`. Layout, after the leading height push:
//! `push(pubkey(33)) || push(vrf_output(32)) || push(vrf_proof(64)) ||
//! push(header_signature(DER))`. The signature commits to the block's
//! producer commitment hash, which is the header hash recomputed with
//! the signature push itself blanked. That breaks the circular
//! dependency of a signature living inside the merkle tree it signs.

use std::collections::HashMap;
use std::net::IpAddr;

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use serde::Serialize;

use crate::config::ChainParams;
use crate::constants::*;
use crate::error::LotteryError;
use crate::script::{push_slice, OP_CHECKSIG, OP_DROP, OP_PUSHDATA1};
use crate::serialize::{Decodable, Encodable, Reader, Result as CodecResult};
use crate::types::{hash160, Amount, Block, Hash, Hash160, OutPoint};
use crate::vrf::{self, VrfOutput, PROOF_SIZE};

const STAKE_TAG: &[u8] = b"stake";

/// Serialized compressed public key length.
pub const PUBKEY_SIZE: usize = 33;

/// One registered participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParticipantRecord {
    pub address: Hash160,
    pub stake_amount: Amount,
    pub stake_height: u64,
    pub public_key: Vec<u8>,
    /// Outpoint of the stake-lock output funding this record.
    pub outpoint: OutPoint,
}

impl ParticipantRecord {
    /// Stake age in blocks at `height`.
    pub fn stake_age(&self, height: u64) -> u64 {
        height.saturating_sub(self.stake_height)
    }

    /// Veterans bypass the subnet cap.
    pub fn is_veteran(&self, height: u64, params: &ChainParams) -> bool {
        self.stake_age(height) >= VETERAN_MATURITY_FACTOR * params.stake_maturity
    }
}

impl Encodable for ParticipantRecord {
    fn encode(&self, out: &mut Vec<u8>) {
        self.address.encode(out);
        self.stake_amount.encode(out);
        self.stake_height.encode(out);
        self.public_key.encode(out);
        self.outpoint.encode(out);
    }
}

impl Decodable for ParticipantRecord {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(ParticipantRecord {
            address: Decodable::decode(r)?,
            stake_amount: Decodable::decode(r)?,
            stake_height: Decodable::decode(r)?,
            public_key: Decodable::decode(r)?,
            outpoint: Decodable::decode(r)?,
        })
    }
}

/// Spendable stake-lock script:
/// `<"stake"> OP_DROP <pubkey> OP_CHECKSIG`.
pub fn stake_lock_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = Vec::with_capacity(STAKE_TAG.len() + PUBKEY_SIZE + 4);
    push_slice(&mut script, STAKE_TAG);
    script.push(OP_DROP);
    push_slice(&mut script, pubkey);
    script.push(OP_CHECKSIG);
    script
}

/// If `script` is a stake lock, return the locked public key.
pub fn parse_stake_lock(script: &[u8]) -> Option<&[u8]> {
    let tag_len = STAKE_TAG.len();
    // push(tag) OP_DROP push(pubkey) OP_CHECKSIG
    let expected = 1 + tag_len + 1 + 1 + PUBKEY_SIZE + 1;
    if script.len() != expected {
        return None;
    }
    if script[0] as usize != tag_len || &script[1..1 + tag_len] != STAKE_TAG {
        return None;
    }
    if script[1 + tag_len] != OP_DROP {
        return None;
    }
    let at = 2 + tag_len;
    if script[at] as usize != PUBKEY_SIZE {
        return None;
    }
    if script[expected - 1] != OP_CHECKSIG {
        return None;
    }
    Some(&script[at + 1..at + 1 + PUBKEY_SIZE])
}

/// Registry of stake-holding participants, keyed by public key. Mutated
/// only from within the chain writer while blocks connect and disconnect.
#[derive(Debug, Default, Clone)]
pub struct ParticipantRegistry {
    by_pubkey: HashMap<Vec<u8>, ParticipantRecord>,
    by_outpoint: HashMap<OutPoint, Vec<u8>>,
    /// Last known network address per participant, for the clustering cap.
    addrs: HashMap<Vec<u8>, IpAddr>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        ParticipantRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.by_pubkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_pubkey.is_empty()
    }

    pub fn get(&self, pubkey: &[u8]) -> Option<&ParticipantRecord> {
        self.by_pubkey.get(pubkey)
    }

    pub fn total_staked(&self) -> Amount {
        self.by_pubkey.values().map(|p| p.stake_amount).sum()
    }

    /// All records, eligible or not.
    pub fn records(&self) -> impl Iterator<Item = &ParticipantRecord> {
        self.by_pubkey.values()
    }

    /// Register a stake-lock output created at `height`. A later lock for
    /// the same key supersedes the earlier record (and restarts maturity).
    pub fn lock(&mut self, outpoint: OutPoint, pubkey: &[u8], amount: Amount, height: u64) {
        if let Some(old) = self.by_pubkey.get(pubkey) {
            self.by_outpoint.remove(&old.outpoint);
        }
        let record = ParticipantRecord {
            address: hash160(pubkey),
            stake_amount: amount,
            stake_height: height,
            public_key: pubkey.to_vec(),
            outpoint,
        };
        self.by_outpoint.insert(outpoint, pubkey.to_vec());
        self.by_pubkey.insert(pubkey.to_vec(), record);
    }

    /// Drop the record funded by `outpoint`, if any. Called when the
    /// output is spent on the main chain or rolled back in a reorg.
    pub fn unlock(&mut self, outpoint: &OutPoint) {
        if let Some(pubkey) = self.by_outpoint.remove(outpoint) {
            self.by_pubkey.remove(&pubkey);
            self.addrs.remove(&pubkey);
        }
    }

    /// Record the network address a participant was last seen producing
    /// or relaying from.
    pub fn set_addr(&mut self, pubkey: &[u8], addr: IpAddr) {
        if self.by_pubkey.contains_key(pubkey) {
            self.addrs.insert(pubkey.to_vec(), addr);
        }
    }

    fn subnet_key(ip: &IpAddr, prefix: u8) -> Option<u32> {
        match ip {
            IpAddr::V4(v4) => {
                let bits = u32::from_be_bytes(v4.octets());
                Some(bits >> (32 - prefix as u32))
            }
            // IPv6 participants are not clustered together.
            IpAddr::V6(_) => None,
        }
    }

    /// Subnet class for `ip`: /24 by default, escalated to /20 and /16 as
    /// the /24 neighbourhood gets denser.
    pub fn subnet_class(&self, ip: &IpAddr) -> u8 {
        let Some(key24) = Self::subnet_key(ip, 24) else {
            return 24;
        };
        let density = self
            .addrs
            .values()
            .filter(|a| Self::subnet_key(a, 24) == Some(key24))
            .count();
        if density > SUBNET_ESCALATE_16 {
            16
        } else if density > SUBNET_ESCALATE_20 {
            20
        } else {
            24
        }
    }

    /// Does the clustering cap bar this participant at `height`?
    ///
    /// New entrants beyond [`MAX_NODES_PER_SUBNET`] in a clustered subnet
    /// are excluded; veterans pass regardless.
    fn subnet_capped(&self, record: &ParticipantRecord, height: u64, params: &ChainParams) -> bool {
        let Some(ip) = self.addrs.get(&record.public_key) else {
            return false;
        };
        if record.is_veteran(height, params) {
            return false;
        }
        let prefix = self.subnet_class(ip);
        let Some(key) = Self::subnet_key(ip, prefix) else {
            return false;
        };
        let neighbours = self
            .addrs
            .iter()
            .filter(|(pk, a)| {
                pk.as_slice() != record.public_key.as_slice()
                    && Self::subnet_key(a, prefix) == Some(key)
            })
            .count();
        neighbours >= MAX_NODES_PER_SUBNET
    }

    /// Is `pubkey` eligible to win at `height`?
    pub fn is_eligible(&self, pubkey: &[u8], height: u64, params: &ChainParams) -> bool {
        let Some(record) = self.by_pubkey.get(pubkey) else {
            return false;
        };
        record.stake_amount >= params.min_stake
            && record.stake_age(height) >= params.stake_maturity
            && !self.subnet_capped(record, height, params)
    }

    /// All participants eligible at `height`.
    pub fn eligible(&self, height: u64, params: &ChainParams) -> Vec<&ParticipantRecord> {
        self.by_pubkey
            .values()
            .filter(|r| self.is_eligible(&r.public_key, height, params))
            .collect()
    }

    pub fn eligible_count(&self, height: u64, params: &ChainParams) -> usize {
        self.eligible(height, params).len()
    }
}

/// Lottery seed for height `H`: `prev_block_hash || u64_le(H)`.
pub fn seed_for_height(prev_block_hash: &Hash, height: u64) -> Vec<u8> {
    let mut seed = Vec::with_capacity(40);
    seed.extend_from_slice(prev_block_hash);
    seed.extend_from_slice(&height.to_le_bytes());
    seed
}

/// Winning condition: the leading bits of the output fall under the
/// target.
pub fn wins(output: &Hash, target: u128) -> bool {
    vrf::output_as_u128(output) < target
}

/// Ordering among simultaneous winners: lowest output first, then
/// lexicographic public key.
pub fn winner_order(a: (&Hash, &[u8]), b: (&Hash, &[u8])) -> std::cmp::Ordering {
    a.0.cmp(b.0).then_with(|| a.1.cmp(b.1))
}

/// Decoded stake proof from a coinbase `script_sig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeProof {
    pub public_key: Vec<u8>,
    pub vrf: VrfOutput,
    pub signature: Vec<u8>,
}

impl StakeProof {
    /// Append this proof's pushes to a coinbase `script_sig`.
    pub fn append_to(&self, script_sig: &mut Vec<u8>) {
        push_slice(script_sig, &self.public_key);
        push_slice(script_sig, &self.vrf.output);
        push_slice(script_sig, &self.vrf.proof);
        push_slice(script_sig, &self.signature);
    }

    /// Parse the last four pushes of a coinbase `script_sig`.
    pub fn decode(script_sig: &[u8]) -> Result<StakeProof, LotteryError> {
        let pushes = parse_pushes(script_sig).ok_or(LotteryError::MalformedStakeProof)?;
        if pushes.len() < 4 {
            return Err(LotteryError::MalformedStakeProof);
        }
        let tail = &pushes[pushes.len() - 4..];
        let (public_key, output, proof, signature) = (tail[0], tail[1], tail[2], tail[3]);
        if public_key.len() != PUBKEY_SIZE || output.len() != 32 || proof.len() != PROOF_SIZE {
            return Err(LotteryError::MalformedStakeProof);
        }
        let mut output_arr = [0u8; 32];
        output_arr.copy_from_slice(output);
        let mut proof_arr = [0u8; PROOF_SIZE];
        proof_arr.copy_from_slice(proof);
        Ok(StakeProof {
            public_key: public_key.to_vec(),
            vrf: VrfOutput { output: output_arr, proof: proof_arr },
            signature: signature.to_vec(),
        })
    }
}

/// Split a script consisting purely of pushes into its items.
fn parse_pushes(script: &[u8]) -> Option<Vec<&[u8]>> {
    let mut items = Vec::new();
    let mut pc = 0usize;
    while pc < script.len() {
        let opcode = script[pc];
        pc += 1;
        let len = match opcode {
            0 => 0,
            1..=0x4b => opcode as usize,
            OP_PUSHDATA1 => {
                let len = *script.get(pc)? as usize;
                pc += 1;
                len
            }
            _ => return None,
        };
        if script.len() - pc < len {
            return None;
        }
        items.push(&script[pc..pc + len]);
        pc += len;
    }
    Some(items)
}

/// The message a producer signs: the header hash recomputed with the
/// signature push removed from the coinbase `script_sig`.
pub fn producer_commitment_hash(block: &Block) -> Result<Hash, LotteryError> {
    let mut unsigned = block.clone();
    let coinbase = unsigned.transactions.first_mut().ok_or(LotteryError::MalformedStakeProof)?;
    if coinbase.inputs.is_empty() {
        return Err(LotteryError::MalformedStakeProof);
    }
    let script_sig = coinbase.inputs[0].script_sig.clone();
    let pushes = parse_pushes(&script_sig).ok_or(LotteryError::MalformedStakeProof)?;
    if pushes.is_empty() {
        return Err(LotteryError::MalformedStakeProof);
    }
    // Rebuild the script without its final push.
    let mut trimmed = Vec::new();
    for item in &pushes[..pushes.len() - 1] {
        push_slice(&mut trimmed, item);
    }
    coinbase.inputs[0].script_sig = trimmed;
    let mut header = unsigned.header;
    header.merkle_root = unsigned.merkle_root();
    Ok(header.hash())
}

/// Verify a post-activation block's right to exist.
///
/// 1. Decode the stake proof from the coinbase.
/// 2. The producer must be eligible at `height`.
/// 3. The VRF proof must verify over `seed(height)` and satisfy the
///    winning condition for the current eligible set.
/// 4. The producer's signature over the commitment hash must verify.
/// 5. The timestamp must fall in `[parent_time - 24h, now + 2h]`.
pub fn verify_participation_proof(
    block: &Block,
    height: u64,
    parent_hash: &Hash,
    parent_time: u32,
    registry: &ParticipantRegistry,
    params: &ChainParams,
    now: u64,
) -> Result<(), LotteryError> {
    let coinbase = block.transactions.first().ok_or(LotteryError::MalformedStakeProof)?;
    if coinbase.inputs.is_empty() {
        return Err(LotteryError::MalformedStakeProof);
    }
    let proof = StakeProof::decode(&coinbase.inputs[0].script_sig)?;

    if !registry.is_eligible(&proof.public_key, height, params) {
        if registry.get(&proof.public_key).is_some()
            && registry.subnet_capped_public(&proof.public_key, height, params)
        {
            return Err(LotteryError::SubnetCapExceeded);
        }
        return Err(LotteryError::NotEligible);
    }

    let public =
        PublicKey::from_slice(&proof.public_key).map_err(|_| LotteryError::MalformedStakeProof)?;
    let seed = seed_for_height(parent_hash, height);
    if !vrf::verify(&public, &seed, &proof.vrf.output, &proof.vrf.proof) {
        return Err(LotteryError::InvalidProof);
    }
    let target = params.lottery_target(registry.eligible_count(height, params));
    if !wins(&proof.vrf.output, target) {
        return Err(LotteryError::LotteryLoss);
    }

    let commitment = producer_commitment_hash(block)?;
    let message =
        Message::from_digest_slice(&commitment).map_err(|_| LotteryError::MalformedStakeProof)?;
    let signature =
        Signature::from_der(&proof.signature).map_err(|_| LotteryError::BadProducerSignature)?;
    let secp = Secp256k1::verification_only();
    if secp.verify_ecdsa(&message, &signature, &public).is_err() {
        return Err(LotteryError::BadProducerSignature);
    }

    let time = block.header.time as u64;
    let lower = (parent_time as u64).saturating_sub(PRODUCER_TIME_SLACK_SECS);
    let upper = now.saturating_add(MAX_FUTURE_DRIFT_SECS);
    if time < lower || time > upper {
        return Err(LotteryError::TimeOutOfWindow);
    }
    Ok(())
}

impl ParticipantRegistry {
    /// Public probe used to distinguish a cap exclusion from plain
    /// ineligibility in error reporting.
    pub fn subnet_capped_public(&self, pubkey: &[u8], height: u64, params: &ChainParams) -> bool {
        self.by_pubkey
            .get(pubkey)
            .map(|r| self.subnet_capped(r, height, params))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlockHeader, OutPoint, Transaction, TxIn, TxOut};
    use secp256k1::SecretKey;

    fn keypair(byte: u8) -> (SecretKey, Vec<u8>) {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[byte; 32]).unwrap();
        (secret, secret.public_key(&secp).serialize().to_vec())
    }

    fn test_params() -> ChainParams {
        ChainParams::regtest()
    }

    #[test]
    fn stake_lock_script_round_trips() {
        let (_, pubkey) = keypair(0x21);
        let script = stake_lock_script(&pubkey);
        assert_eq!(parse_stake_lock(&script), Some(pubkey.as_slice()));
        // Ordinary scripts do not register.
        assert_eq!(parse_stake_lock(&[0x51, OP_CHECKSIG]), None);
    }

    #[test]
    fn registry_tracks_lock_and_unlock() {
        let params = test_params();
        let (_, pubkey) = keypair(0x22);
        let mut registry = ParticipantRegistry::new();
        let outpoint = OutPoint::new([1u8; 32], 0);
        registry.lock(outpoint, &pubkey, params.min_stake, 100);

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.total_staked(), params.min_stake);
        // Not yet mature.
        assert!(!registry.is_eligible(&pubkey, 100, &params));
        assert!(registry.is_eligible(&pubkey, 100 + params.stake_maturity, &params));

        registry.unlock(&outpoint);
        assert!(registry.is_empty());
    }

    #[test]
    fn understaked_participant_is_ineligible() {
        let params = test_params();
        let (_, pubkey) = keypair(0x23);
        let mut registry = ParticipantRegistry::new();
        registry.lock(OutPoint::new([1u8; 32], 0), &pubkey, params.min_stake - 1, 0);
        assert!(!registry.is_eligible(&pubkey, params.stake_maturity + 1, &params));
    }

    #[test]
    fn newer_lock_supersedes_and_restarts_maturity() {
        let params = test_params();
        let (_, pubkey) = keypair(0x24);
        let mut registry = ParticipantRegistry::new();
        registry.lock(OutPoint::new([1u8; 32], 0), &pubkey, params.min_stake, 0);
        assert!(registry.is_eligible(&pubkey, params.stake_maturity, &params));
        registry.lock(OutPoint::new([2u8; 32], 0), &pubkey, params.min_stake, 50);
        assert!(!registry.is_eligible(&pubkey, params.stake_maturity, &params));
        // The superseded outpoint no longer unlocks anything.
        registry.unlock(&OutPoint::new([1u8; 32], 0));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn subnet_cap_excludes_new_entrants_but_not_veterans() {
        let params = test_params();
        let mut registry = ParticipantRegistry::new();
        let height = params.stake_maturity + 60;
        for (i, byte) in [0x31u8, 0x32, 0x33].iter().enumerate() {
            let (_, pubkey) = keypair(*byte);
            registry.lock(OutPoint::new([*byte; 32], 0), &pubkey, params.min_stake, 0);
            registry.set_addr(&pubkey, format!("10.1.1.{}", i + 1).parse().unwrap());
        }
        let (_, crowd) = keypair(0x34);
        registry.lock(OutPoint::new([0x34; 32], 0), &crowd, params.min_stake, 40);
        registry.set_addr(&crowd, "10.1.1.9".parse().unwrap());

        // Two neighbours are allowed; the third same-subnet entrant is not.
        assert!(!registry.is_eligible(&crowd, height, &params));

        // A veteran in the same subnet stays eligible.
        let veteran_height = VETERAN_MATURITY_FACTOR * params.stake_maturity + 40;
        assert!(registry.is_eligible(&crowd, veteran_height, &params));
    }

    #[test]
    fn seed_binds_parent_and_height() {
        let seed1 = seed_for_height(&[1u8; 32], 5);
        let seed2 = seed_for_height(&[1u8; 32], 6);
        let seed3 = seed_for_height(&[2u8; 32], 5);
        assert_ne!(seed1, seed2);
        assert_ne!(seed1, seed3);
        assert_eq!(seed1.len(), 40);
    }

    #[test]
    fn winner_order_prefers_lower_output_then_pubkey() {
        let low = [1u8; 32];
        let high = [2u8; 32];
        let pk_a = [0x02u8; 33];
        let pk_b = [0x03u8; 33];
        assert_eq!(
            winner_order((&low, pk_b.as_slice()), (&high, pk_a.as_slice())),
            std::cmp::Ordering::Less
        );
        assert_eq!(
            winner_order((&low, pk_a.as_slice()), (&low, pk_b.as_slice())),
            std::cmp::Ordering::Less
        );
    }

    #[test]
    fn stake_proof_encode_decode_round_trip() {
        let (secret, pubkey) = keypair(0x41);
        let vrf = vrf::evaluate(&secret, b"seed");
        let proof = StakeProof { public_key: pubkey, vrf, signature: vec![0x30, 0x01, 0x02] };
        let mut script_sig = Vec::new();
        push_slice(&mut script_sig, &[5]); // height push
        proof.append_to(&mut script_sig);
        let decoded = StakeProof::decode(&script_sig).unwrap();
        assert_eq!(decoded, proof);
    }

    #[test]
    fn malformed_stake_proof_is_rejected() {
        assert_eq!(StakeProof::decode(&[0x51]), Err(LotteryError::MalformedStakeProof));
        let mut script_sig = Vec::new();
        push_slice(&mut script_sig, &[1, 2, 3]);
        assert_eq!(StakeProof::decode(&script_sig), Err(LotteryError::MalformedStakeProof));
    }

    fn proven_block(secret: &SecretKey, pubkey: &[u8], parent_hash: &Hash, height: u64) -> Block {
        let seed = seed_for_height(parent_hash, height);
        let vrf_out = vrf::evaluate(secret, &seed);
        let mut script_sig = Vec::new();
        push_slice(&mut script_sig, &height.to_le_bytes());
        let proof = StakeProof { public_key: pubkey.to_vec(), vrf: vrf_out, signature: vec![] };
        proof.append_to(&mut script_sig);

        let coinbase = Transaction {
            version: 1,
            inputs: vec![TxIn::new(OutPoint::null(), script_sig)],
            outputs: vec![TxOut::new(50 * COIN, vec![0x51])],
            lock_time: 0,
        };
        let mut block = Block {
            header: BlockHeader {
                version: 1,
                prev_block_hash: *parent_hash,
                merkle_root: [0u8; 32],
                time: 1_368_580_000,
                bits: 0x1d00ffff,
                nonce: 0,
            },
            transactions: vec![coinbase],
        };
        // Sign the commitment (the empty final push stands in for the
        // signature during hashing) and splice the real signature in.
        block.header.merkle_root = block.merkle_root();
        let commitment = producer_commitment_hash(&block).unwrap();
        let secp = Secp256k1::new();
        let message = Message::from_digest_slice(&commitment).unwrap();
        let signature = secp.sign_ecdsa(&message, secret).serialize_der().to_vec();

        let coinbase = &mut block.transactions[0];
        let mut script_sig = Vec::new();
        push_slice(&mut script_sig, &height.to_le_bytes());
        let full = StakeProof { signature, ..proof };
        full.append_to(&mut script_sig);
        coinbase.inputs[0].script_sig = script_sig;
        block.header.merkle_root = block.merkle_root();
        block
    }

    #[test]
    fn valid_participation_proof_verifies() {
        let params = test_params();
        let (secret, pubkey) = keypair(0x51);
        let mut registry = ParticipantRegistry::new();
        registry.lock(OutPoint::new([9u8; 32], 0), &pubkey, params.min_stake, 0);

        let parent_hash = [7u8; 32];
        let height = params.stake_maturity + 1;
        let block = proven_block(&secret, &pubkey, &parent_hash, height);
        // Sole eligible participant: the target accepts every output.
        verify_participation_proof(
            &block,
            height,
            &parent_hash,
            block.header.time - 60,
            &registry,
            &params,
            block.header.time as u64,
        )
        .unwrap();
    }

    #[test]
    fn unregistered_producer_is_rejected() {
        let params = test_params();
        let (secret, pubkey) = keypair(0x52);
        let registry = ParticipantRegistry::new();
        let parent_hash = [7u8; 32];
        let block = proven_block(&secret, &pubkey, &parent_hash, 30);
        let result = verify_participation_proof(
            &block,
            30,
            &parent_hash,
            block.header.time - 60,
            &registry,
            &params,
            block.header.time as u64,
        );
        assert_eq!(result, Err(LotteryError::NotEligible));
    }

    #[test]
    fn tampered_body_breaks_producer_signature() {
        let params = test_params();
        let (secret, pubkey) = keypair(0x53);
        let mut registry = ParticipantRegistry::new();
        registry.lock(OutPoint::new([9u8; 32], 0), &pubkey, params.min_stake, 0);

        let parent_hash = [7u8; 32];
        let height = params.stake_maturity + 1;
        let mut block = proven_block(&secret, &pubkey, &parent_hash, height);
        block.transactions[0].outputs[0].value -= 1;
        block.header.merkle_root = block.merkle_root();
        let result = verify_participation_proof(
            &block,
            height,
            &parent_hash,
            block.header.time - 60,
            &registry,
            &params,
            block.header.time as u64,
        );
        assert_eq!(result, Err(LotteryError::BadProducerSignature));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let params = test_params();
        let (secret, pubkey) = keypair(0x54);
        let mut registry = ParticipantRegistry::new();
        registry.lock(OutPoint::new([9u8; 32], 0), &pubkey, params.min_stake, 0);

        let parent_hash = [7u8; 32];
        let height = params.stake_maturity + 1;
        let block = proven_block(&secret, &pubkey, &parent_hash, height);
        let parent_time = block.header.time + PRODUCER_TIME_SLACK_SECS as u32 + 61;
        let result = verify_participation_proof(
            &block,
            height,
            &parent_hash,
            parent_time,
            &registry,
            &params,
            parent_time as u64,
        );
        assert_eq!(result, Err(LotteryError::TimeOutOfWindow));
    }
}
