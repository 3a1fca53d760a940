//! Unspent transaction output set with per-block undo journalling.
//!
//! Every mutation made while connecting a block is recorded in a
//! [`BlockUndo`]; disconnecting replays the journal backwards, restoring
//! the set byte-for-byte. Coinbase maturity is enforced at spend time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::ConsensusError;
use crate::serialize::{Decodable, Encodable, Reader, Result as CodecResult};
use crate::types::{Amount, OutPoint, TxOut};

/// One unspent output with the metadata maturity checks need.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub output: TxOut,
    pub height: u64,
    pub is_coinbase: bool,
}

impl Encodable for Utxo {
    fn encode(&self, out: &mut Vec<u8>) {
        self.output.encode(out);
        self.height.encode(out);
        self.is_coinbase.encode(out);
    }

    fn encoded_size(&self) -> usize {
        self.output.encoded_size() + 9
    }
}

impl Decodable for Utxo {
    fn decode(r: &mut Reader) -> CodecResult<Self> {
        Ok(Utxo {
            output: Decodable::decode(r)?,
            height: Decodable::decode(r)?,
            is_coinbase: Decodable::decode(r)?,
        })
    }
}

/// Journal of one connected block: what it spent (with the full prior
/// records) and what it created.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockUndo {
    pub spent: Vec<(OutPoint, Utxo)>,
    pub created: Vec<OutPoint>,
}

/// The UTXO set: outpoint → unspent output.
#[derive(Debug, Clone, Default)]
pub struct UtxoSet {
    map: HashMap<OutPoint, Utxo>,
}

impl UtxoSet {
    pub fn new() -> Self {
        UtxoSet::default()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.map.get(outpoint)
    }

    pub fn contains(&self, outpoint: &OutPoint) -> bool {
        self.map.contains_key(outpoint)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OutPoint, &Utxo)> {
        self.map.iter()
    }

    /// Sum of all unspent values. Used by conservation checks.
    pub fn total_value(&self) -> Amount {
        self.map.values().map(|u| u.output.value).sum()
    }

    pub fn add(&mut self, outpoint: OutPoint, output: TxOut, height: u64, is_coinbase: bool) {
        self.map.insert(outpoint, Utxo { output, height, is_coinbase });
    }

    /// Remove and return the output behind `outpoint`.
    ///
    /// Fails if the outpoint is absent, or if it is a coinbase output that
    /// has not reached `maturity` confirmations at `spend_height`.
    pub fn spend(
        &mut self,
        outpoint: &OutPoint,
        spend_height: u64,
        maturity: u64,
    ) -> Result<Utxo, ConsensusError> {
        let utxo = self
            .map
            .get(outpoint)
            .ok_or_else(|| ConsensusError::MissingInput(format!("{}:{}", hex::encode(outpoint.hash), outpoint.index)))?;
        if utxo.is_coinbase && spend_height < utxo.height + maturity {
            return Err(ConsensusError::ImmatureCoinbase);
        }
        Ok(self.map.remove(outpoint).expect("checked above"))
    }

    /// Replay `undo` backwards: drop what the block created, restore what
    /// it spent.
    pub fn undo(&mut self, undo: &BlockUndo) {
        for outpoint in &undo.created {
            self.map.remove(outpoint);
        }
        for (outpoint, utxo) in undo.spent.iter().rev() {
            self.map.insert(*outpoint, utxo.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TxOut;

    fn outpoint(n: u8) -> OutPoint {
        OutPoint::new([n; 32], 0)
    }

    #[test]
    fn add_get_spend_round_trip() {
        let mut set = UtxoSet::new();
        set.add(outpoint(1), TxOut::new(1000, vec![0x51]), 5, false);
        assert!(set.contains(&outpoint(1)));
        assert_eq!(set.get(&outpoint(1)).unwrap().output.value, 1000);

        let spent = set.spend(&outpoint(1), 6, 100).unwrap();
        assert_eq!(spent.output.value, 1000);
        assert!(!set.contains(&outpoint(1)));
    }

    #[test]
    fn spending_missing_outpoint_fails() {
        let mut set = UtxoSet::new();
        assert!(matches!(
            set.spend(&outpoint(9), 1, 100),
            Err(ConsensusError::MissingInput(_))
        ));
    }

    #[test]
    fn coinbase_maturity_is_enforced() {
        let mut set = UtxoSet::new();
        set.add(outpoint(2), TxOut::new(50, vec![]), 10, true);
        assert_eq!(set.spend(&outpoint(2), 109, 100), Err(ConsensusError::ImmatureCoinbase));
        // Still present after the failed spend.
        assert!(set.contains(&outpoint(2)));
        assert!(set.spend(&outpoint(2), 110, 100).is_ok());
    }

    #[test]
    fn non_coinbase_ignores_maturity() {
        let mut set = UtxoSet::new();
        set.add(outpoint(3), TxOut::new(50, vec![]), 10, false);
        assert!(set.spend(&outpoint(3), 10, 100).is_ok());
    }

    #[test]
    fn undo_restores_prior_state() {
        let mut set = UtxoSet::new();
        set.add(outpoint(1), TxOut::new(700, vec![0x51]), 1, false);
        let before = set.clone().map;

        let mut undo = BlockUndo::default();
        let spent = set.spend(&outpoint(1), 2, 100).unwrap();
        undo.spent.push((outpoint(1), spent));
        set.add(outpoint(4), TxOut::new(650, vec![0x52]), 2, false);
        undo.created.push(outpoint(4));

        set.undo(&undo);
        assert_eq!(set.map, before);
    }

    #[test]
    fn total_value_sums_outputs() {
        let mut set = UtxoSet::new();
        set.add(outpoint(1), TxOut::new(100, vec![]), 0, false);
        set.add(outpoint(2), TxOut::new(250, vec![]), 0, true);
        assert_eq!(set.total_value(), 350);
    }
}
