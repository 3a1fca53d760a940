//! Core chain types: transactions, blocks, and their canonical hashes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::constants::*;
use crate::error::ConsensusError;
use crate::serialize::{
    decode_vec, encode_vec, encoded_vec_size, Decodable, Encodable, Reader, Result as CodecResult,
};

/// 256-bit hash.
pub type Hash = [u8; 32];

/// 160-bit hash (RIPEMD-160 over SHA-256).
pub type Hash160 = [u8; 20];

/// Monetary amount in base units. Valid amounts lie in `[0, MAX_MONEY]`.
pub type Amount = i64;

/// `SHA256(SHA256(data))`.
pub fn double_sha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    second.into()
}

/// `RIPEMD160(SHA256(data))`.
pub fn hash160(data: &[u8]) -> Hash160 {
    use ripemd::Ripemd160;
    let sha = Sha256::digest(data);
    Ripemd160::digest(sha).into()
}

/// Is `value` inside the money range?
pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}

/// Reference to a transaction output: `(tx hash, output index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        OutPoint { hash, index }
    }

    /// The null outpoint marks a coinbase input.
    pub fn null() -> Self {
        OutPoint { hash: [0u8; 32], index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }
}

impl Encodable for OutPoint {
    fn encode(&self, out: &mut Vec<u8>) {
        self.hash.encode(out);
        self.index.encode(out);
    }

    fn encoded_size(&self) -> usize {
        36
    }
}

impl Decodable for OutPoint {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(OutPoint { hash: Decodable::decode(r)?, index: Decodable::decode(r)? })
    }
}

/// Transaction input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(prevout: OutPoint, script_sig: Vec<u8>) -> Self {
        TxIn { prevout, script_sig, sequence: SEQUENCE_FINAL }
    }
}

impl Encodable for TxIn {
    fn encode(&self, out: &mut Vec<u8>) {
        self.prevout.encode(out);
        self.script_sig.encode(out);
        self.sequence.encode(out);
    }

    fn encoded_size(&self) -> usize {
        self.prevout.encoded_size() + self.script_sig.encoded_size() + 4
    }
}

impl Decodable for TxIn {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(TxIn {
            prevout: Decodable::decode(r)?,
            script_sig: Decodable::decode(r)?,
            sequence: Decodable::decode(r)?,
        })
    }
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOut {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(value: Amount, script_pubkey: Vec<u8>) -> Self {
        TxOut { value, script_pubkey }
    }
}

impl Encodable for TxOut {
    fn encode(&self, out: &mut Vec<u8>) {
        self.value.encode(out);
        self.script_pubkey.encode(out);
    }

    fn encoded_size(&self) -> usize {
        8 + self.script_pubkey.encoded_size()
    }
}

impl Decodable for TxOut {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(TxOut { value: Decodable::decode(r)?, script_pubkey: Decodable::decode(r)? })
    }
}

/// Transaction: `(version, inputs, outputs, lock_time)`.
///
/// The canonical hash is `DSHA256(serialize(tx))`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        double_sha256(&crate::serialize::encode_to_vec(self))
    }

    /// A coinbase has exactly one input whose prevout is null.
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_size()
    }

    /// Sum of output values; overflow or out-of-range is a validation failure.
    pub fn total_output_value(&self) -> Result<Amount, ConsensusError> {
        let mut total: Amount = 0;
        for output in &self.outputs {
            if !money_range(output.value) {
                return Err(ConsensusError::ValueOutOfRange);
            }
            total = total.checked_add(output.value).ok_or(ConsensusError::ValueOverflow)?;
            if !money_range(total) {
                return Err(ConsensusError::ValueOverflow);
            }
        }
        Ok(total)
    }
}

impl Encodable for Transaction {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        encode_vec(out, &self.inputs);
        encode_vec(out, &self.outputs);
        self.lock_time.encode(out);
    }

    fn encoded_size(&self) -> usize {
        4 + encoded_vec_size(&self.inputs) + encoded_vec_size(&self.outputs) + 4
    }
}

impl Decodable for Transaction {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(Transaction {
            version: Decodable::decode(r)?,
            inputs: decode_vec(r)?,
            outputs: decode_vec(r)?,
            lock_time: Decodable::decode(r)?,
        })
    }
}

/// Block header. Hash is `DSHA256` of the fixed 80-byte serialization.
///
/// After the participation rule activates, `nonce` is always 0 and `bits`
/// is carried only for format compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: u32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub const SERIALIZED_SIZE: usize = 80;

    pub fn hash(&self) -> Hash {
        double_sha256(&crate::serialize::encode_to_vec(self))
    }
}

impl Encodable for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.version.encode(out);
        self.prev_block_hash.encode(out);
        self.merkle_root.encode(out);
        self.time.encode(out);
        self.bits.encode(out);
        self.nonce.encode(out);
    }

    fn encoded_size(&self) -> usize {
        Self::SERIALIZED_SIZE
    }
}

impl Decodable for BlockHeader {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(BlockHeader {
            version: Decodable::decode(r)?,
            prev_block_hash: Decodable::decode(r)?,
            merkle_root: Decodable::decode(r)?,
            time: Decodable::decode(r)?,
            bits: Decodable::decode(r)?,
            nonce: Decodable::decode(r)?,
        })
    }
}

/// Block: header plus ordered transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    /// Recompute the merkle root over this block's transactions.
    pub fn merkle_root(&self) -> Hash {
        let hashes: Vec<Hash> = self.transactions.iter().map(|tx| tx.hash()).collect();
        merkle_root(&hashes)
    }

    pub fn serialized_size(&self) -> usize {
        self.encoded_size()
    }
}

impl Encodable for Block {
    fn encode(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        encode_vec(out, &self.transactions);
    }

    fn encoded_size(&self) -> usize {
        BlockHeader::SERIALIZED_SIZE + encoded_vec_size(&self.transactions)
    }
}

impl Decodable for Block {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(Block { header: Decodable::decode(r)?, transactions: decode_vec(r)? })
    }
}

/// Level-wise pairwise double-SHA-256 merkle tree. At each level an odd
/// final element pairs with a copy of itself. The root of an empty set is
/// the zero hash.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash> = hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            let left = pair[0];
            let right = if pair.len() == 2 { pair[1] } else { pair[0] };
            let mut cat = [0u8; 64];
            cat[..32].copy_from_slice(&left);
            cat[32..].copy_from_slice(&right);
            next.push(double_sha256(&cat));
        }
        level = next;
    }
    level[0]
}
