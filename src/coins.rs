//! Layered UTXO set
//!
//! A [`CoinStore`] is the durable base layer. [`CoinsViewCache`] overlays
//! stack on top of any [`CoinsView`]; they record additions and spends without
//! touching their parent until the caller takes the accumulated
//! [`CoinsDelta`] and applies it one level down. Dropping an overlay discards
//! everything it recorded.

use crate::error::{ConsensusError, Result};
use crate::types::*;
use bitflags::bitflags;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Read access to a set of unspent outputs
pub trait CoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    fn have_coin(&self, outpoint: &OutPoint) -> bool {
        self.get_coin(outpoint).is_some()
    }
}

/// One atomic write against the base layer. `None` deletes the coin.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinBatch {
    pub writes: Vec<(OutPoint, Option<Coin>)>,
    pub best_block: Hash,
}

/// Durable storage collaborator behind the UTXO set
pub trait CoinStore: Send + Sync {
    fn read_coin(&self, outpoint: &OutPoint) -> Option<Coin>;

    /// Apply every write and record `best_block`, all or nothing
    fn write_batch(&self, batch: &CoinBatch) -> anyhow::Result<()>;

    /// Block the stored set corresponds to, if anything was ever written
    fn best_block(&self) -> Option<Hash>;
}

impl CoinsView for dyn CoinStore + '_ {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.read_coin(outpoint)
    }
}

/// In-process base layer
#[derive(Debug, Default)]
pub struct MemoryCoinStore {
    coins: RwLock<HashMap<OutPoint, Coin>>,
    best_block: RwLock<Option<Hash>>,
}

impl MemoryCoinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.coins.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.coins.read().is_empty()
    }

    /// Sum of all stored values
    pub fn total_value(&self) -> Amount {
        self.coins.read().values().map(Coin::value).sum()
    }

    /// Copy of the whole set, sorted by outpoint
    pub fn snapshot(&self) -> Vec<(OutPoint, Coin)> {
        let mut coins: Vec<_> = self
            .coins
            .read()
            .iter()
            .map(|(outpoint, coin)| (*outpoint, coin.clone()))
            .collect();
        coins.sort_by(|a, b| a.0.cmp(&b.0));
        coins
    }
}

impl CoinsView for MemoryCoinStore {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.read_coin(outpoint)
    }
}

impl CoinStore for MemoryCoinStore {
    fn read_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.read().get(outpoint).cloned()
    }

    fn write_batch(&self, batch: &CoinBatch) -> anyhow::Result<()> {
        let mut coins = self.coins.write();
        let mut best = self.best_block.write();
        for (outpoint, coin) in &batch.writes {
            match coin {
                Some(coin) => {
                    coins.insert(*outpoint, coin.clone());
                }
                None => {
                    coins.remove(outpoint);
                }
            }
        }
        *best = Some(batch.best_block);
        Ok(())
    }

    fn best_block(&self) -> Option<Hash> {
        *self.best_block.read()
    }
}

bitflags! {
    /// State of an overlay entry relative to its parent
    pub struct EntryFlags: u8 {
        /// Differs from the parent
        const DIRTY = 0b01;
        /// The parent has no unspent version of this coin
        const FRESH = 0b10;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    /// `None` marks a spent coin
    coin: Option<Coin>,
    flags: EntryFlags,
}

/// Changes recorded by one overlay, ready to be applied to its parent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinsDelta {
    entries: HashMap<OutPoint, CacheEntry>,
}

impl CoinsDelta {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Coins created by this delta
    pub fn added(&self) -> impl Iterator<Item = (&OutPoint, &Coin)> {
        self.entries
            .iter()
            .filter_map(|(outpoint, entry)| entry.coin.as_ref().map(|coin| (outpoint, coin)))
    }

    /// Outpoints this delta removes from its parent
    pub fn spent(&self) -> impl Iterator<Item = &OutPoint> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.coin.is_none())
            .map(|(outpoint, _)| outpoint)
    }

    /// Convert into a store write, sorted by outpoint so identical deltas
    /// produce identical batches
    pub fn into_batch(self, best_block: Hash) -> CoinBatch {
        let mut writes: Vec<_> = self
            .entries
            .into_iter()
            .filter(|(_, entry)| entry.flags.contains(EntryFlags::DIRTY))
            .filter(|(_, entry)| !(entry.coin.is_none() && entry.flags.contains(EntryFlags::FRESH)))
            .map(|(outpoint, entry)| (outpoint, entry.coin))
            .collect();
        writes.sort_by(|a, b| a.0.cmp(&b.0));
        CoinBatch { writes, best_block }
    }
}

/// Copy-on-write overlay over a parent view
pub struct CoinsViewCache<'a, V: CoinsView + ?Sized> {
    base: &'a V,
    entries: HashMap<OutPoint, CacheEntry>,
}

impl<'a, V: CoinsView + ?Sized> CoinsViewCache<'a, V> {
    pub fn new(base: &'a V) -> Self {
        Self { base, entries: HashMap::new() }
    }

    pub fn base(&self) -> &'a V {
        self.base
    }

    /// Number of outpoints this overlay has touched
    pub fn dirty_count(&self) -> usize {
        self.entries.len()
    }

    /// Add an unspent output. Unspendable outputs are silently skipped.
    pub fn add_coin(&mut self, outpoint: OutPoint, coin: Coin) -> Result<()> {
        if coin.output.is_unspendable() {
            return Ok(());
        }
        if self.have_coin(&outpoint) {
            return Err(ConsensusError::DuplicateOutput(outpoint.to_string()));
        }
        match self.entries.get_mut(&outpoint) {
            // Spent here, unspent in the parent: overwrite without FRESH
            Some(entry) => {
                entry.coin = Some(coin);
                entry.flags |= EntryFlags::DIRTY;
            }
            None => {
                self.entries.insert(
                    outpoint,
                    CacheEntry { coin: Some(coin), flags: EntryFlags::DIRTY | EntryFlags::FRESH },
                );
            }
        }
        Ok(())
    }

    /// Add every spendable output of `tx`
    pub fn add_transaction_outputs(&mut self, tx: &Transaction, height: u64) -> Result<()> {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        for (index, output) in tx.outputs.iter().enumerate() {
            self.add_coin(
                OutPoint::new(txid, index as u32),
                Coin::new(output.clone(), height, is_coinbase),
            )?;
        }
        Ok(())
    }

    /// Mark a coin spent, returning it; `None` if it is missing or already spent
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Option<Coin> {
        let coin = self.get_coin(outpoint)?;
        match self.entries.get(outpoint) {
            Some(entry) if entry.flags.contains(EntryFlags::FRESH) => {
                self.entries.remove(outpoint);
            }
            _ => {
                self.entries
                    .insert(*outpoint, CacheEntry { coin: None, flags: EntryFlags::DIRTY });
            }
        }
        Some(coin)
    }

    /// Release the parent borrow, handing back what this overlay recorded
    pub fn take_changes(self) -> CoinsDelta {
        CoinsDelta { entries: self.entries }
    }

    /// Merge a child overlay's changes into this one
    pub fn apply_changes(&mut self, delta: CoinsDelta) {
        for (outpoint, child) in delta.entries {
            if !child.flags.contains(EntryFlags::DIRTY) {
                continue;
            }
            match self.entries.get_mut(&outpoint) {
                None => {
                    // Created and spent inside the child: nothing reaches us
                    if child.coin.is_none() && child.flags.contains(EntryFlags::FRESH) {
                        continue;
                    }
                    self.entries.insert(outpoint, child);
                }
                Some(entry) => {
                    if child.coin.is_none() && entry.flags.contains(EntryFlags::FRESH) {
                        self.entries.remove(&outpoint);
                    } else {
                        entry.coin = child.coin;
                        entry.flags |= EntryFlags::DIRTY;
                    }
                }
            }
        }
    }
}

impl<V: CoinsView + ?Sized> CoinsView for CoinsViewCache<'_, V> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        match self.entries.get(outpoint) {
            Some(entry) => entry.coin.clone(),
            None => self.base.get_coin(outpoint),
        }
    }
}
