//! Memory pool of validated, unconfirmed transactions
//!
//! Admission runs every consensus check a block would run against the
//! current tip (treating the next block height as the spend height), then
//! relay policy on top: standardness, fee floors, package limits and
//! replace-by-fee.

use crate::coins::CoinsView;
use crate::config::{ChainParams, MempoolPolicy};
use crate::constants::*;
use crate::error::{ConsensusError, PolicyError, ValidationError};
use crate::locktime::{calculate_sequence_locks, check_sequence_locks, is_final_tx};
use crate::policy::{check_standard_inputs, check_standard_tx, compare_fee_rates, fee_for_size};
use crate::script::STANDARD_SCRIPT_VERIFY_FLAGS;
use crate::transaction::{check_input_scripts, check_transaction, check_tx_inputs, sigop_cost};
use crate::types::*;
use log::debug;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// What the mempool needs to know about the chain it builds on
pub trait ChainView: CoinsView {
    fn tip_height(&self) -> u64;

    /// Median time past of the tip
    fn tip_median_time(&self) -> u64;

    /// Median time past of the active chain ending at `height`
    fn median_time_at(&self, height: u64) -> u64;
}

#[derive(Debug, Clone)]
pub struct MempoolEntry {
    pub tx: Arc<Transaction>,
    pub txid: Hash,
    pub fee: Amount,
    pub size: usize,
    pub sigop_cost: usize,
    pub entry_height: u64,
    pub entry_time: u64,
    /// In-pool transactions this one spends from
    pub parents: HashSet<Hash>,
    /// In-pool transactions spending this one
    pub children: HashSet<Hash>,
    /// Package figures, each including the entry itself
    pub ancestor_count: usize,
    pub ancestor_size: usize,
    pub ancestor_fees: Amount,
    pub descendant_count: usize,
    pub descendant_size: usize,
    pub descendant_fees: Amount,
    sequence: u64,
}

impl MempoolEntry {
    fn compare_descendant_score(&self, other: &MempoolEntry) -> Ordering {
        compare_fee_rates(
            self.descendant_fees,
            self.descendant_size,
            other.descendant_fees,
            other.descendant_size,
        )
    }
}

/// Successful admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub txid: Hash,
    pub fee: Amount,
    /// Entries evicted by replace-by-fee
    pub replaced: Vec<Hash>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MempoolInfo {
    pub count: usize,
    pub bytes: usize,
    pub total_fee: Amount,
}

/// Coins of the chain tip plus outputs of in-pool transactions
struct PoolCoins<'a, C: ?Sized> {
    chain: &'a C,
    pool: &'a Mempool,
    height: u64,
}

impl<C: ChainView + ?Sized> CoinsView for PoolCoins<'_, C> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        match self.pool.entries.get(&outpoint.hash) {
            Some(entry) => entry
                .tx
                .outputs
                .get(outpoint.index as usize)
                .map(|output| Coin::new(output.clone(), self.height, false)),
            None => self.chain.get_coin(outpoint),
        }
    }
}

pub struct Mempool {
    policy: MempoolPolicy,
    params: ChainParams,
    entries: HashMap<Hash, MempoolEntry>,
    /// Which pool transaction spends an outpoint
    spenders: HashMap<OutPoint, Hash>,
    total_size: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(policy: MempoolPolicy, params: ChainParams) -> Self {
        Self {
            policy,
            params,
            entries: HashMap::new(),
            spenders: HashMap::new(),
            total_size: 0,
            next_sequence: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    pub fn spender_of(&self, outpoint: &OutPoint) -> Option<Hash> {
        self.spenders.get(outpoint).copied()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn info(&self) -> MempoolInfo {
        MempoolInfo {
            count: self.entries.len(),
            bytes: self.total_size,
            total_fee: self.entries.values().map(|entry| entry.fee).sum(),
        }
    }

    /// Transactions in admission order
    pub fn transactions(&self) -> Vec<Arc<Transaction>> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries.into_iter().map(|entry| entry.tx.clone()).collect()
    }

    /// AcceptToMemoryPool
    pub fn accept<C: ChainView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &C,
        now: u64,
    ) -> Result<Admission, ValidationError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(PolicyError::AlreadyInMempool.into());
        }
        check_transaction(&tx)?;
        if tx.is_coinbase() {
            return Err(PolicyError::Coinbase.into());
        }
        check_standard_tx(&tx, &self.policy)?;

        let next_height = chain.tip_height() + 1;
        let tip_median_time = chain.tip_median_time();
        if !is_final_tx(&tx, next_height, tip_median_time) {
            return Err(PolicyError::NonFinal.into());
        }

        let conflicts: HashSet<Hash> = tx
            .inputs
            .iter()
            .filter_map(|input| self.spenders.get(&input.prevout).copied())
            .collect();

        let view = PoolCoins { chain, pool: &*self, height: next_height };
        let mut coins = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            match view.get_coin(&input.prevout) {
                Some(coin) => coins.push(coin),
                None => {
                    let confirmed = (0..tx.outputs.len() as u32)
                        .any(|index| chain.have_coin(&OutPoint::new(txid, index)));
                    return Err(if confirmed {
                        PolicyError::AlreadyConfirmed
                    } else {
                        PolicyError::MissingInputs
                    }
                    .into());
                }
            }
        }
        let parents: HashSet<Hash> = tx
            .inputs
            .iter()
            .map(|input| input.prevout.hash)
            .filter(|hash| self.entries.contains_key(hash))
            .collect();

        let fee = check_tx_inputs(&tx, &coins, next_height, self.params.coinbase_maturity)?;

        let coin_heights: Vec<u64> = coins.iter().map(|coin| coin.height).collect();
        let locks = calculate_sequence_locks(
            &tx,
            self.params.enforces_sequence_locks(next_height),
            &coin_heights,
            |height| chain.median_time_at(height),
        );
        if !check_sequence_locks(&locks, next_height, tip_median_time) {
            return Err(PolicyError::NonBip68Final.into());
        }

        check_standard_inputs(&tx, &coins)?;
        let cost = sigop_cost(&tx, &coins, STANDARD_SCRIPT_VERIFY_FLAGS);
        if cost > MAX_STANDARD_TX_SIGOPS_COST {
            return Err(PolicyError::NonStandard("bad-txns-too-many-sigops").into());
        }

        let size = tx.serialized_size();
        let required = fee_for_size(self.policy.min_relay_fee_rate, size);
        if fee < required {
            return Err(PolicyError::FeeTooLow { fee, required }.into());
        }

        let ancestors = self.check_package_limits(&parents, size)?;

        let evicted = if conflicts.is_empty() {
            HashSet::new()
        } else {
            self.check_replacement(&tx, fee, size, &conflicts, &ancestors)?
        };

        self.check_scripts(&tx, &coins, next_height)?;

        let mut replaced: Vec<Hash> = evicted.into_iter().collect();
        replaced.sort();
        self.remove_entries(&replaced.iter().copied().collect());
        for hash in &replaced {
            debug!("replaced {} with {}", hash_hex(hash), hash_hex(&txid));
        }

        self.insert(MempoolEntry {
            tx: Arc::new(tx),
            txid,
            fee,
            size,
            sigop_cost: cost,
            entry_height: chain.tip_height(),
            entry_time: now,
            parents,
            children: HashSet::new(),
            ancestor_count: 1,
            ancestor_size: size,
            ancestor_fees: fee,
            descendant_count: 1,
            descendant_size: size,
            descendant_fees: fee,
            sequence: 0,
        });
        debug!("accepted {} to mempool (fee {}, {} bytes)", hash_hex(&txid), fee, size);

        let trimmed = self.trim_to_size();
        if trimmed.contains(&txid) {
            return Err(PolicyError::MempoolFull.into());
        }
        Ok(Admission { txid, fee, replaced })
    }

    /// Ancestor and descendant count and size limits; returns the ancestor set
    fn check_package_limits(&self, parents: &HashSet<Hash>, size: usize) -> Result<HashSet<Hash>, PolicyError> {
        let ancestors = self.ancestors_of(parents);
        let count = ancestors.len() + 1;
        if count > self.policy.ancestor_limit {
            return Err(PolicyError::TooManyAncestors { count, limit: self.policy.ancestor_limit });
        }
        let ancestor_size = size + ancestors.iter().map(|hash| self.entries[hash].size).sum::<usize>();
        if ancestor_size > self.policy.ancestor_size_limit {
            return Err(PolicyError::AncestorSizeTooLarge {
                size: ancestor_size,
                limit: self.policy.ancestor_size_limit,
            });
        }
        for hash in &ancestors {
            let entry = &self.entries[hash];
            if entry.descendant_count + 1 > self.policy.descendant_limit {
                return Err(PolicyError::TooManyDescendants {
                    count: entry.descendant_count + 1,
                    limit: self.policy.descendant_limit,
                });
            }
            if entry.descendant_size + size > self.policy.descendant_size_limit {
                return Err(PolicyError::DescendantSizeTooLarge {
                    size: entry.descendant_size + size,
                    limit: self.policy.descendant_size_limit,
                });
            }
        }
        Ok(ancestors)
    }

    /// Replace-by-fee rules; returns everything the replacement evicts
    fn check_replacement(
        &self,
        tx: &Transaction,
        fee: Amount,
        size: usize,
        conflicts: &HashSet<Hash>,
        ancestors: &HashSet<Hash>,
    ) -> Result<HashSet<Hash>, PolicyError> {
        let direct: Vec<&MempoolEntry> = conflicts.iter().map(|hash| &self.entries[hash]).collect();
        if direct.iter().any(|entry| !entry.tx.signals_rbf()) {
            return Err(PolicyError::ConflictNotReplaceable);
        }

        let evicted = self.descendants_of(conflicts);
        if evicted.len() > self.policy.max_replacement_evictions {
            return Err(PolicyError::TooManyReplacements {
                count: evicted.len(),
                limit: self.policy.max_replacement_evictions,
            });
        }
        if !ancestors.is_disjoint(&evicted) {
            return Err(PolicyError::ReplacementSpendsConflict);
        }

        let already_unconfirmed: HashSet<OutPoint> = direct
            .iter()
            .flat_map(|entry| entry.tx.inputs.iter().map(|input| input.prevout))
            .filter(|prevout| self.entries.contains_key(&prevout.hash))
            .collect();
        for (input_index, input) in tx.inputs.iter().enumerate() {
            if self.entries.contains_key(&input.prevout.hash) && !already_unconfirmed.contains(&input.prevout) {
                return Err(PolicyError::ReplacementAddsUnconfirmed { input_index });
            }
        }

        let evicted_fees: Amount = evicted.iter().map(|hash| self.entries[hash].fee).sum();
        if fee <= evicted_fees {
            return Err(PolicyError::InsufficientReplacementFee { fee, evicted: evicted_fees });
        }
        if direct
            .iter()
            .any(|entry| compare_fee_rates(fee, size, entry.fee, entry.size) != Ordering::Greater)
        {
            return Err(PolicyError::InsufficientReplacementFeerate);
        }
        if fee - evicted_fees < fee_for_size(self.policy.incremental_relay_fee_rate, size) {
            return Err(PolicyError::InsufficientReplacementFee { fee, evicted: evicted_fees });
        }
        Ok(evicted)
    }

    /// Standard flags first; a failure is only consensus-invalid if it also
    /// fails under the flags blocks are checked with
    fn check_scripts(&self, tx: &Transaction, coins: &[Coin], next_height: u64) -> Result<(), ValidationError> {
        let Err(standard) = check_input_scripts(tx, coins, STANDARD_SCRIPT_VERIFY_FLAGS) else {
            return Ok(());
        };
        check_input_scripts(tx, coins, self.params.script_flags_at(next_height))?;
        match standard {
            ConsensusError::Script { input_index, source } => {
                Err(PolicyError::NonStandardScript { input_index, source }.into())
            }
            other => Err(other.into()),
        }
    }

    fn ancestors_of(&self, parents: &HashSet<Hash>) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut pending: Vec<Hash> = parents.iter().copied().collect();
        while let Some(hash) = pending.pop() {
            if let Some(entry) = self.entries.get(&hash) {
                if seen.insert(hash) {
                    pending.extend(entry.parents.iter().copied());
                }
            }
        }
        seen
    }

    /// The given entries and everything spending from them
    fn descendants_of(&self, roots: &HashSet<Hash>) -> HashSet<Hash> {
        let mut seen = HashSet::new();
        let mut pending: Vec<Hash> = roots.iter().copied().collect();
        while let Some(hash) = pending.pop() {
            if let Some(entry) = self.entries.get(&hash) {
                if seen.insert(hash) {
                    pending.extend(entry.children.iter().copied());
                }
            }
        }
        seen
    }

    fn insert(&mut self, mut entry: MempoolEntry) {
        let ancestors = self.ancestors_of(&entry.parents);
        for hash in &ancestors {
            let ancestor = &self.entries[hash];
            entry.ancestor_count += 1;
            entry.ancestor_size += ancestor.size;
            entry.ancestor_fees += ancestor.fee;
        }
        for hash in &ancestors {
            if let Some(ancestor) = self.entries.get_mut(hash) {
                ancestor.descendant_count += 1;
                ancestor.descendant_size += entry.size;
                ancestor.descendant_fees += entry.fee;
            }
        }
        for parent in &entry.parents {
            if let Some(parent) = self.entries.get_mut(parent) {
                parent.children.insert(entry.txid);
            }
        }
        for input in &entry.tx.inputs {
            self.spenders.insert(input.prevout, entry.txid);
        }
        entry.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.total_size += entry.size;
        self.entries.insert(entry.txid, entry);
    }

    /// Remove exactly `set`, keeping package figures of the survivors right
    fn remove_entries(&mut self, set: &HashSet<Hash>) {
        for hash in set {
            let Some(entry) = self.entries.get(hash) else { continue };
            let (size, fee) = (entry.size, entry.fee);
            let ancestors = self.ancestors_of(&entry.parents);
            let descendants = self.descendants_of(&entry.children);
            for other in ancestors.difference(set) {
                if let Some(ancestor) = self.entries.get_mut(other) {
                    ancestor.descendant_count -= 1;
                    ancestor.descendant_size -= size;
                    ancestor.descendant_fees -= fee;
                }
            }
            for other in descendants.difference(set) {
                if let Some(descendant) = self.entries.get_mut(other) {
                    descendant.ancestor_count -= 1;
                    descendant.ancestor_size -= size;
                    descendant.ancestor_fees -= fee;
                }
            }
        }
        for hash in set {
            let Some(entry) = self.entries.remove(hash) else { continue };
            for input in &entry.tx.inputs {
                if self.spenders.get(&input.prevout) == Some(hash) {
                    self.spenders.remove(&input.prevout);
                }
            }
            for parent in &entry.parents {
                if let Some(parent) = self.entries.get_mut(parent) {
                    parent.children.remove(hash);
                }
            }
            for child in &entry.children {
                if let Some(child) = self.entries.get_mut(child) {
                    child.parents.remove(hash);
                }
            }
            self.total_size -= entry.size;
        }
    }

    /// Remove entries and all their descendants, returning what went
    pub fn remove_recursive(&mut self, roots: &HashSet<Hash>) -> Vec<Hash> {
        let set = self.descendants_of(roots);
        self.remove_entries(&set);
        let mut removed: Vec<Hash> = set.into_iter().collect();
        removed.sort();
        removed
    }

    /// Evict the lowest descendant-feerate packages until under the size cap
    pub fn trim_to_size(&mut self) -> Vec<Hash> {
        let mut removed = Vec::new();
        while self.total_size > self.policy.max_size_bytes {
            let worst = self
                .entries
                .values()
                .min_by(|a, b| {
                    a.compare_descendant_score(b)
                        .then_with(|| b.sequence.cmp(&a.sequence))
                })
                .map(|entry| entry.txid);
            let Some(worst) = worst else { break };
            let gone = self.remove_recursive(&HashSet::from([worst]));
            debug!("mempool full, evicted {} transactions", gone.len());
            removed.extend(gone);
        }
        removed
    }

    /// Drop transactions confirmed by `block` and anything conflicting with them
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Hash> {
        let mut removed = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if self.entries.contains_key(&txid) {
                self.remove_entries(&HashSet::from([txid]));
                removed.push(txid);
            }
            let conflicts: HashSet<Hash> = tx
                .inputs
                .iter()
                .filter_map(|input| self.spenders.get(&input.prevout).copied())
                .filter(|spender| *spender != txid)
                .collect();
            if !conflicts.is_empty() {
                removed.extend(self.remove_recursive(&conflicts));
            }
        }
        removed
    }

    /// Re-check every entry against a new tip: inputs still present, coinbase
    /// maturity, finality and relative locks. Failures go with their descendants.
    pub fn revalidate<C: ChainView + ?Sized>(&mut self, chain: &C) -> Vec<Hash> {
        let next_height = chain.tip_height() + 1;
        let tip_median_time = chain.tip_median_time();
        let mut stale = HashSet::new();
        {
            let view = PoolCoins { chain, pool: &*self, height: next_height };
            for entry in self.entries.values() {
                let tx = &entry.tx;
                let coins: Option<Vec<Coin>> = tx.inputs.iter().map(|input| view.get_coin(&input.prevout)).collect();
                let still_valid = coins.map_or(false, |coins| {
                    let heights: Vec<u64> = coins.iter().map(|coin| coin.height).collect();
                    let locks = calculate_sequence_locks(
                        tx,
                        self.params.enforces_sequence_locks(next_height),
                        &heights,
                        |height| chain.median_time_at(height),
                    );
                    check_tx_inputs(tx, &coins, next_height, self.params.coinbase_maturity).is_ok()
                        && is_final_tx(tx, next_height, tip_median_time)
                        && check_sequence_locks(&locks, next_height, tip_median_time)
                });
                if !still_valid {
                    stale.insert(entry.txid);
                }
            }
        }
        if stale.is_empty() {
            return Vec::new();
        }
        let removed = self.remove_recursive(&stale);
        debug!("removed {} mempool transactions invalid at the new tip", removed.len());
        removed
    }

    /// Bring the pool in line with a tip change: confirmed and conflicting
    /// transactions leave, survivors are re-checked, and transactions from
    /// disconnected blocks are offered again
    pub fn update_for_tip_change<C: ChainView + ?Sized>(
        &mut self,
        disconnected: &[Arc<Block>],
        connected: &[Arc<Block>],
        chain: &C,
        now: u64,
    ) -> Vec<Hash> {
        let mut removed = Vec::new();
        for block in connected {
            removed.extend(self.remove_for_block(block));
        }
        removed.extend(self.revalidate(chain));

        // Oldest disconnected block first so parents precede children
        for block in disconnected.iter().rev() {
            for tx in block.transactions.iter().skip(1) {
                if let Err(error) = self.accept(tx.clone(), chain, now) {
                    debug!("dropped {} from disconnected block: {}", hash_hex(&tx.txid()), error);
                }
            }
        }
        removed
    }
}
