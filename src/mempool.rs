//! Mempool and the hybrid fee engine.
//!
//! Admission follows one contract: structural checks, coinbase rejection,
//! input resolution against the UTXO set layered with mempool outputs,
//! script verification, then the two-sided fee policy: high-priority
//! transactions ride free, everything else pays the relay rate unless the
//! pool is under light load. Templates reserve the first five percent of
//! the byte budget for free-eligible entries.

use std::collections::HashMap;

use serde::Serialize;

use crate::chain::ChainState;
use crate::constants::*;
use crate::error::{ConsensusError, MempoolError};
use crate::script;
use crate::types::{Amount, Hash, OutPoint, Transaction, TxOut};

pub type Result<T> = std::result::Result<T, MempoolError>;

/// A resident transaction and its admission-time metadata.
#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Transaction,
    pub hash: Hash,
    pub admission_time: u64,
    /// Monotone tie-breaker among equal scores.
    pub admission_seq: u64,
    pub fee_paid: Amount,
    pub size_bytes: usize,
    pub priority_score: f64,
    pub free_eligible: bool,
    /// Direct in-mempool parents.
    pub ancestor_count: usize,
    /// Direct in-mempool children.
    pub descendant_count: usize,
}

impl MempoolEntry {
    pub fn fee_per_byte(&self) -> f64 {
        self.fee_paid as f64 / self.size_bytes.max(1) as f64
    }

    /// Fee-market label, used by the aggregate stats.
    pub fn category(&self) -> &'static str {
        if self.free_eligible {
            "free"
        } else {
            let ratio = self.priority_score / FREE_PRIORITY_THRESHOLD;
            if ratio > 0.5 {
                "low_fee"
            } else if ratio > 0.1 {
                "standard"
            } else {
                "priority"
            }
        }
    }
}

/// A transaction waiting for parents the node has not seen.
#[derive(Debug, Clone)]
struct OrphanEntry {
    tx: Transaction,
    received: u64,
    missing: Vec<OutPoint>,
}

/// Block template assembled under the two-zone policy.
#[derive(Debug, Clone)]
pub struct Template {
    /// Selected transactions in inclusion order, coinbase excluded.
    pub transactions: Vec<Transaction>,
    pub total_fees: Amount,
    pub free_zone_bytes: usize,
    pub fee_zone_bytes: usize,
}

/// Aggregate counters for `getmempoolinfo`.
#[derive(Debug, Clone, Serialize)]
pub struct MempoolStats {
    pub count: usize,
    pub bytes: usize,
    pub free_eligible: usize,
    pub fee_paying: usize,
    pub total_fees: Amount,
    pub orphans: usize,
}

#[derive(Debug, Default)]
pub struct Mempool {
    entries: HashMap<Hash, MempoolEntry>,
    /// Outpoint → hash of the mempool transaction spending it.
    spends: HashMap<OutPoint, Hash>,
    /// Outputs created by mempool transactions.
    outputs: HashMap<OutPoint, TxOut>,
    orphans: HashMap<Hash, OrphanEntry>,
    orphans_by_missing: HashMap<OutPoint, Vec<Hash>>,
    total_bytes: usize,
    seq: u64,
}

impl Mempool {
    pub fn new() -> Self {
        Mempool::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn get(&self, hash: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn stats(&self) -> MempoolStats {
        let free_eligible = self.entries.values().filter(|e| e.free_eligible).count();
        MempoolStats {
            count: self.entries.len(),
            bytes: self.total_bytes,
            free_eligible,
            fee_paying: self.entries.len() - free_eligible,
            total_fees: self.entries.values().map(|e| e.fee_paid).sum(),
            orphans: self.orphans.len(),
        }
    }

    /// Suggested fee for a transaction of `size` bytes at `priority`,
    /// scaled by how far it falls short of the free threshold.
    pub fn suggest_fee(&self, size: usize, priority: f64) -> Amount {
        if priority >= FREE_PRIORITY_THRESHOLD {
            return 0;
        }
        let ratio = priority / FREE_PRIORITY_THRESHOLD;
        let per_byte: Amount = if ratio > 0.5 {
            500
        } else if ratio > 0.1 {
            1000
        } else {
            2000
        };
        per_byte * size as Amount
    }

    /// Admission contract. On success returns the hashes admitted by this
    /// call: the transaction itself, then any orphans it unblocked.
    ///
    /// 1. Reject duplicates.
    /// 2. Structural checks (delegated to the chain's shared rules).
    /// 3. Reject coinbase submissions.
    /// 4. Resolve each input in UTXO ∪ mempool outputs. A mempool
    ///    double-spend is a conflict; an unknown prevout parks the
    ///    transaction in the bounded orphan pool.
    /// 5. Verify input scripts.
    /// 6. Score priority `Σ value·confirmations / size` and compute the fee.
    /// 7. Free-eligible transactions enter regardless of fee; the rest pay
    ///    the relay minimum unless utilization is below the low-pressure
    ///    threshold.
    pub fn accept(
        &mut self,
        tx: Transaction,
        chain: &ChainState,
        now: u64,
    ) -> Result<Vec<Hash>> {
        let hash = tx.hash();
        if self.entries.contains_key(&hash) || self.orphans.contains_key(&hash) {
            return Err(MempoolError::Duplicate);
        }

        chain.check_transaction(&tx)?;
        if tx.is_coinbase() {
            return Err(MempoolError::CoinbaseSubmission);
        }

        let best_height = chain.height();
        let spend_height = best_height + 1;
        let maturity = chain.params().coinbase_maturity;

        let mut missing = Vec::new();
        let mut resolved: Vec<(TxOut, u64)> = Vec::new(); // (output, confirmations)
        for input in &tx.inputs {
            if let Some(spender) = self.spends.get(&input.prevout) {
                return Err(MempoolError::Conflict(hex::encode(spender)));
            }
            if let Some(utxo) = chain.utxo().get(&input.prevout) {
                if utxo.is_coinbase && spend_height < utxo.height + maturity {
                    return Err(MempoolError::Consensus(ConsensusError::ImmatureCoinbase));
                }
                let confirmations = best_height - utxo.height + 1;
                resolved.push((utxo.output.clone(), confirmations));
            } else if let Some(output) = self.outputs.get(&input.prevout) {
                resolved.push((output.clone(), 0));
            } else {
                missing.push(input.prevout);
            }
        }
        if !missing.is_empty() {
            self.add_orphan(hash, tx, missing, now);
            return Err(MempoolError::Orphan);
        }

        for (index, (prev_output, _)) in resolved.iter().enumerate() {
            script::verify_input(&tx, index, &prev_output.script_pubkey)?;
        }

        let size_bytes = tx.serialized_size();
        let total_in: Amount = resolved.iter().map(|(o, _)| o.value).sum();
        let total_out = tx.total_output_value()?;
        if total_in < total_out {
            return Err(MempoolError::Consensus(ConsensusError::FeeUnderflow));
        }
        let fee_paid = total_in - total_out;
        let priority_score = resolved
            .iter()
            .map(|(o, confirmations)| o.value as f64 * *confirmations as f64)
            .sum::<f64>()
            / size_bytes.max(1) as f64;
        let free_eligible = priority_score >= FREE_PRIORITY_THRESHOLD;

        if !free_eligible && !self.low_pressure() {
            let required = MIN_RELAY_FEE_PER_KB * size_bytes.div_ceil(1024) as Amount;
            if fee_paid < required {
                return Err(MempoolError::FeeTooLow);
            }
        }

        self.seq += 1;
        let ancestor_count =
            tx.inputs.iter().filter(|i| self.outputs.contains_key(&i.prevout)).count();
        let entry = MempoolEntry {
            hash,
            admission_time: now,
            admission_seq: self.seq,
            fee_paid,
            size_bytes,
            priority_score,
            free_eligible,
            ancestor_count,
            descendant_count: 0,
            tx,
        };
        self.insert(entry);
        tracing::debug!(hash = %hex::encode(hash), fee = fee_paid, "admitted transaction");

        let mut admitted = vec![hash];
        admitted.extend(self.promote_orphans_of(&hash, chain, now));
        self.enforce_size_limit();
        Ok(admitted)
    }

    fn low_pressure(&self) -> bool {
        self.total_bytes < MAX_MEMPOOL_SIZE * LOW_PRESSURE_UTILIZATION_PCT / 100
    }

    fn insert(&mut self, entry: MempoolEntry) {
        let tx_hash = entry.hash;
        for input in &entry.tx.inputs {
            self.spends.insert(input.prevout, tx_hash);
            if let Some(parent) = self.outputs.get(&input.prevout).map(|_| input.prevout.hash) {
                if let Some(parent_entry) = self.entries.get_mut(&parent) {
                    parent_entry.descendant_count += 1;
                }
            }
        }
        for (index, output) in entry.tx.outputs.iter().enumerate() {
            self.outputs.insert(OutPoint::new(tx_hash, index as u32), output.clone());
        }
        self.total_bytes += entry.size_bytes;
        self.entries.insert(tx_hash, entry);
    }

    fn add_orphan(&mut self, hash: Hash, tx: Transaction, missing: Vec<OutPoint>, now: u64) {
        if self.orphans.len() >= MAX_ORPHAN_TX {
            // Drop the oldest orphan to stay within the bound.
            if let Some(oldest) =
                self.orphans.iter().min_by_key(|(_, o)| o.received).map(|(h, _)| *h)
            {
                self.remove_orphan(&oldest);
            }
        }
        for prevout in &missing {
            self.orphans_by_missing.entry(*prevout).or_default().push(hash);
        }
        self.orphans.insert(hash, OrphanEntry { tx, received: now, missing });
    }

    fn remove_orphan(&mut self, hash: &Hash) {
        if let Some(orphan) = self.orphans.remove(hash) {
            for prevout in &orphan.missing {
                if let Some(waiters) = self.orphans_by_missing.get_mut(prevout) {
                    waiters.retain(|h| h != hash);
                    if waiters.is_empty() {
                        self.orphans_by_missing.remove(prevout);
                    }
                }
            }
        }
    }

    /// Re-run admission for orphans whose missing prevout is now supplied
    /// by `parent`'s outputs.
    fn promote_orphans_of(&mut self, parent: &Hash, chain: &ChainState, now: u64) -> Vec<Hash> {
        let mut promoted = Vec::new();
        let mut candidates = Vec::new();
        for (prevout, waiters) in &self.orphans_by_missing {
            if prevout.hash == *parent {
                candidates.extend(waiters.iter().copied());
            }
        }
        for hash in candidates {
            if let Some(orphan) = self.orphans.get(&hash) {
                let tx = orphan.tx.clone();
                self.remove_orphan(&hash);
                if let Ok(mut admitted) = self.accept(tx, chain, now) {
                    promoted.append(&mut admitted);
                }
            }
        }
        promoted
    }

    /// Drop orphans older than the TTL.
    pub fn evict_expired_orphans(&mut self, now: u64) {
        let expired: Vec<Hash> = self
            .orphans
            .iter()
            .filter(|(_, o)| now.saturating_sub(o.received) > ORPHAN_TTL_SECS)
            .map(|(h, _)| *h)
            .collect();
        for hash in expired {
            self.remove_orphan(&hash);
        }
    }

    /// Remove one entry (without touching descendants).
    fn remove_entry(&mut self, hash: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        for input in &entry.tx.inputs {
            self.spends.remove(&input.prevout);
        }
        for index in 0..entry.tx.outputs.len() {
            self.outputs.remove(&OutPoint::new(*hash, index as u32));
        }
        self.total_bytes -= entry.size_bytes;
        Some(entry)
    }

    /// Remove an entry together with every in-mempool descendant.
    pub fn remove_with_descendants(&mut self, hash: &Hash) -> Vec<MempoolEntry> {
        let mut removed = Vec::new();
        let Some(entry) = self.remove_entry(hash) else {
            return removed;
        };
        let child_spends: Vec<Hash> = (0..entry.tx.outputs.len())
            .filter_map(|index| self.spends.get(&OutPoint::new(*hash, index as u32)).copied())
            .collect();
        removed.push(entry);
        for child in child_spends {
            removed.extend(self.remove_with_descendants(&child));
        }
        removed
    }

    /// Evict lowest-fee-per-byte entries until the pool fits its budget.
    fn enforce_size_limit(&mut self) {
        while self.total_bytes > MAX_MEMPOOL_SIZE {
            let Some(victim) = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.fee_per_byte()
                        .partial_cmp(&b.fee_per_byte())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|e| e.hash)
            else {
                break;
            };
            tracing::debug!(hash = %hex::encode(victim), "evicting for size");
            self.remove_with_descendants(&victim);
        }
    }

    /// Purge everything a newly connected block made stale: its own
    /// transactions and any mempool transaction now conflicting with the
    /// UTXO set.
    pub fn remove_for_block(&mut self, block: &crate::types::Block) {
        for tx in &block.transactions {
            let hash = tx.hash();
            self.remove_entry(&hash);
            self.remove_orphan(&hash);
            if !tx.is_coinbase() {
                for input in &tx.inputs {
                    if let Some(conflicting) = self.spends.get(&input.prevout).copied() {
                        self.remove_with_descendants(&conflicting);
                    }
                }
            }
        }
    }

    /// Offer reorg-disconnected transactions back to the pool. Any that
    /// no longer validate are dropped.
    pub fn readmit(&mut self, txs: Vec<Transaction>, chain: &ChainState, now: u64) {
        for tx in txs {
            let hash = tx.hash();
            match self.accept(tx, chain, now) {
                Ok(_) => {}
                Err(err) => {
                    tracing::debug!(hash = %hex::encode(hash), "dropped on readmission: {err}")
                }
            }
        }
    }

    /// Build a block template of at most `max_bytes` of transactions.
    ///
    /// The free zone (`5%` of the budget) packs free-eligible entries in
    /// descending priority; the fee zone packs the remainder in descending
    /// fee-per-byte. Both tie-break on earlier admission, and an entry
    /// whose in-mempool ancestor was skipped is skipped too.
    pub fn build_template(&self, max_bytes: usize) -> Template {
        let free_cap = max_bytes * FREE_ZONE_NUMERATOR / FREE_ZONE_DENOMINATOR;

        let mut included: HashMap<Hash, ()> = HashMap::new();
        let mut transactions = Vec::new();
        let mut total_fees: Amount = 0;

        let parents_included = |included: &HashMap<Hash, ()>, entry: &MempoolEntry| {
            entry.tx.inputs.iter().all(|input| {
                !self.outputs.contains_key(&input.prevout)
                    || included.contains_key(&input.prevout.hash)
            })
        };

        // Free zone: priority order.
        let mut free: Vec<&MempoolEntry> =
            self.entries.values().filter(|e| e.free_eligible).collect();
        free.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.admission_seq.cmp(&b.admission_seq))
        });
        let mut free_used = 0usize;
        for entry in free {
            if free_used + entry.size_bytes > free_cap {
                continue;
            }
            if !parents_included(&included, entry) {
                continue;
            }
            free_used += entry.size_bytes;
            total_fees += entry.fee_paid;
            included.insert(entry.hash, ());
            transactions.push(entry.tx.clone());
        }

        // Fee zone: fee-rate order over everything not yet included.
        let mut paying: Vec<&MempoolEntry> =
            self.entries.values().filter(|e| !included.contains_key(&e.hash)).collect();
        paying.sort_by(|a, b| {
            b.fee_per_byte()
                .partial_cmp(&a.fee_per_byte())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.admission_seq.cmp(&b.admission_seq))
        });
        let mut fee_used = 0usize;
        let fee_cap = max_bytes - free_used;
        for entry in paying {
            if fee_used + entry.size_bytes > fee_cap {
                continue;
            }
            if !parents_included(&included, entry) {
                continue;
            }
            fee_used += entry.size_bytes;
            total_fees += entry.fee_paid;
            included.insert(entry.hash, ());
            transactions.push(entry.tx.clone());
        }

        Template { transactions, total_fees, free_zone_bytes: free_used, fee_zone_bytes: fee_used }
    }
}
