//! Verifiable random function for the participation lottery.
//!
//! Construction: the proof is an RFC6979 deterministic ECDSA signature
//! over the domain-tagged seed; the output is the tagged hash of the
//! proof. Determinism of the signing nonce makes evaluation a function of
//! `(secret key, seed)`, and only the canonical low-s form of the
//! signature is accepted so a producer cannot flip to the malleated twin
//! for a second draw.

use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

use crate::types::Hash;

const INPUT_TAG: &[u8] = b"aurum/vrf/input";
const OUTPUT_TAG: &[u8] = b"aurum/vrf/output";

/// Serialized length of a VRF proof (compact ECDSA signature).
pub const PROOF_SIZE: usize = 64;

/// A VRF evaluation: the pseudorandom output and the proof that binds it
/// to the evaluator's key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VrfOutput {
    pub output: Hash,
    pub proof: [u8; PROOF_SIZE],
}

fn tagged_hash(tag: &[u8], data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(tag);
    hasher.update(data);
    hasher.finalize().into()
}

/// Evaluate the VRF for `seed` under `secret`.
pub fn evaluate(secret: &SecretKey, seed: &[u8]) -> VrfOutput {
    let secp = Secp256k1::signing_only();
    let digest = tagged_hash(INPUT_TAG, seed);
    let message = Message::from_digest_slice(&digest).expect("32-byte digest");
    let signature = secp.sign_ecdsa(&message, secret);
    let proof = signature.serialize_compact();
    VrfOutput { output: tagged_hash(OUTPUT_TAG, &proof), proof }
}

/// Verify that `(output, proof)` is the unique evaluation of `seed` under
/// `public`.
pub fn verify(public: &PublicKey, seed: &[u8], output: &Hash, proof: &[u8; PROOF_SIZE]) -> bool {
    let Ok(mut signature) = Signature::from_compact(proof) else {
        return false;
    };
    // Reject the malleated high-s twin.
    signature.normalize_s();
    if signature.serialize_compact() != *proof {
        return false;
    }
    let digest = tagged_hash(INPUT_TAG, seed);
    let Ok(message) = Message::from_digest_slice(&digest) else {
        return false;
    };
    let secp = Secp256k1::verification_only();
    if secp.verify_ecdsa(&message, &signature, public).is_err() {
        return false;
    }
    tagged_hash(OUTPUT_TAG, proof) == *output
}

/// Leading 128 bits of a VRF output, big-endian, for target comparison.
pub fn output_as_u128(output: &Hash) -> u128 {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&output[..16]);
    u128::from_be_bytes(bytes)
}
