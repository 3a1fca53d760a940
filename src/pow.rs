//! Legacy proof-of-work checks for pre-activation blocks.
//!
//! After the participation rule activates, headers keep the `bits` field
//! for format compatibility only; this module exists to validate the
//! historical part of the chain and to price its cumulative work.

use crate::error::ConsensusError;
use crate::types::BlockHeader;

/// 256-bit unsigned integer for target arithmetic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]); // little-endian limbs

impl U256 {
    pub fn zero() -> Self {
        U256([0; 4])
    }

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    /// Interpret a 32-byte hash (as produced by DSHA256) as a big-endian
    /// integer.
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut limbs = [0u64; 4];
        for (i, chunk) in bytes.chunks(8).enumerate() {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(chunk);
            // chunk 0 holds the most significant limb
            limbs[3 - i] = u64::from_be_bytes(arr);
        }
        U256(limbs)
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&limb| limb == 0)
    }

    pub fn shl(&self, shift: u32) -> Self {
        if shift >= 256 {
            return U256::zero();
        }
        let mut result = U256::zero();
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }

    /// Top 128 bits.
    pub fn high_u128(&self) -> u128 {
        ((self.0[3] as u128) << 64) | self.0[2] as u128
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        for i in (0..4).rev() {
            match self.0[i].cmp(&other.0[i]) {
                std::cmp::Ordering::Equal => continue,
                ord => return ord,
            }
        }
        std::cmp::Ordering::Equal
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Expand a compact-bits target: `mantissa << 8*(exponent-3)`.
pub fn expand_target(bits: u32) -> Result<U256, ConsensusError> {
    let exponent = (bits >> 24) as u32;
    let mantissa = bits & 0x00ff_ffff;
    if mantissa == 0 || exponent > 32 {
        return Err(ConsensusError::BadProofOfWork);
    }
    let target = if exponent <= 3 {
        U256::from_u64((mantissa >> (8 * (3 - exponent))) as u64)
    } else {
        U256::from_u64(mantissa as u64).shl(8 * (exponent - 3))
    };
    if target.is_zero() {
        return Err(ConsensusError::BadProofOfWork);
    }
    Ok(target)
}

/// `DSHA256(header) <= ExpandTarget(header.bits)`.
pub fn check_proof_of_work(header: &BlockHeader) -> Result<bool, ConsensusError> {
    let target = expand_target(header.bits)?;
    let hash = U256::from_be_bytes(&header.hash());
    Ok(hash <= target)
}

/// Ceiling on legacy per-block work, well under the fixed weight of a
/// participation block.
const MAX_LEGACY_WORK: u128 = 1 << 80;

/// Work contributed by one legacy block: inversely proportional to its
/// target, saturated so no compact-bits value can rival participation
/// weight.
pub fn block_work(bits: u32) -> u128 {
    let Ok(target) = expand_target(bits) else {
        return 0;
    };
    let high = target.high_u128();
    if high == 0 {
        return MAX_LEGACY_WORK;
    }
    (u128::MAX / high).min(MAX_LEGACY_WORK)
}
