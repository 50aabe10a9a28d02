//! # BitsCoin Consensus
//!
//! Consensus validation engine for the BitsCoin network: the rules that decide,
//! identically on every node, whether a block or transaction is valid, and the
//! UTXO set that follows the most-work valid chain through reorganizations.
//!
//! ## Architecture
//!
//! Leaves first:
//! - `serialization`, `pow`, `script`: wire format, proof of work, interpreter
//! - `coins`: layered UTXO views over a pluggable [`coins::CoinStore`]
//! - `transaction`, `block`: context-free and contextual validation, connect/disconnect
//! - `chainstate`: block index, best-chain selection and reorganization
//! - `mempool`, `policy`: relay admission on top of the active tip
//!
//! [`ConsensusEngine`] ties the chainstate manager and the mempool together
//! behind byte-level entry points.
//!
//! ## Usage
//!
//! ```rust
//! use bitscoin_consensus::coins::MemoryCoinStore;
//! use bitscoin_consensus::config::EngineConfig;
//! use bitscoin_consensus::{AcceptanceResult, ConsensusEngine};
//! use std::sync::Arc;
//!
//! let engine = ConsensusEngine::new(EngineConfig::regtest(), Arc::new(MemoryCoinStore::new())).unwrap();
//! assert_eq!(engine.best_tip_info().height, 0);
//!
//! // Garbage never panics; it is rejected with a reason
//! let result = engine.submit_transaction(&[0xde, 0xad]);
//! assert!(matches!(result, AcceptanceResult::Rejected { hash: None, .. }));
//! ```

pub mod constants;
pub mod types;
pub mod error;
pub mod config;
pub mod serialization;
pub mod economic;
pub mod pow;
pub mod script;
pub mod coins;
pub mod locktime;
pub mod transaction;
pub mod block;
pub mod chainstate;
pub mod mempool;
pub mod policy;

// Re-export commonly used types
pub use chainstate::{BlockOutcome, ChainstateManager, TimeSource, TipChanged, TipInfo, TipView};
pub use config::{ChainParams, EngineConfig, MempoolPolicy};
pub use error::{ConsensusError, PolicyError, ScriptError, ValidationError};
pub use mempool::{Mempool, MempoolInfo};
pub use constants::*;
pub use types::*;

use crate::coins::CoinStore;
use crate::error::DecodeError;
use crate::serialization::{deserialize_block, deserialize_transaction};
use crossbeam_channel::Receiver;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of submitting a block or transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcceptanceResult {
    Accepted { hash: Hash },
    /// Already known
    Duplicate { hash: Hash },
    /// Waiting for a parent block or for the outputs it spends
    Pending { hash: Hash },
    /// `hash` is `None` when the bytes did not decode
    Rejected { hash: Option<Hash>, reason: ValidationError },
}

impl AcceptanceResult {
    pub fn is_accepted(&self) -> bool {
        matches!(self, AcceptanceResult::Accepted { .. })
    }

    pub fn reason(&self) -> Option<&ValidationError> {
        match self {
            AcceptanceResult::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    fn undecodable(error: DecodeError) -> Self {
        AcceptanceResult::Rejected { hash: None, reason: error.into() }
    }
}

/// Main engine: one chainstate manager and the mempool that builds on it
///
/// # Examples
///
/// ```
/// use bitscoin_consensus::coins::MemoryCoinStore;
/// use bitscoin_consensus::config::EngineConfig;
/// use bitscoin_consensus::ConsensusEngine;
/// use std::sync::Arc;
///
/// let engine = ConsensusEngine::new(EngineConfig::regtest(), Arc::new(MemoryCoinStore::new())).unwrap();
/// let tip = engine.best_tip_info();
/// assert_eq!(tip.hash, engine.chainstate().genesis_hash());
/// assert_eq!(engine.mempool_info().count, 0);
/// ```
pub struct ConsensusEngine {
    chainstate: Arc<ChainstateManager>,
    mempool: Mutex<Mempool>,
    /// Tip changes the mempool has not caught up with yet
    tip_events: Receiver<TipChanged>,
}

impl ConsensusEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn CoinStore>) -> anyhow::Result<Self> {
        let chainstate = ChainstateManager::new(config.chain.clone(), store, config.script_threads)?;
        Ok(Self::from_parts(chainstate, config.mempool))
    }

    /// Build on a custom clock
    pub fn with_time_source(
        config: EngineConfig,
        store: Arc<dyn CoinStore>,
        time: Arc<dyn TimeSource>,
    ) -> anyhow::Result<Self> {
        let chainstate =
            ChainstateManager::with_time_source(config.chain.clone(), store, config.script_threads, time)?;
        Ok(Self::from_parts(chainstate, config.mempool))
    }

    fn from_parts(chainstate: ChainstateManager, policy: MempoolPolicy) -> Self {
        let tip_events = chainstate.subscribe();
        let mempool = Mempool::new(policy, chainstate.params().clone());
        Self {
            chainstate: Arc::new(chainstate),
            mempool: Mutex::new(mempool),
            tip_events,
        }
    }

    pub fn chainstate(&self) -> &Arc<ChainstateManager> {
        &self.chainstate
    }

    /// SubmitBlock: decode, validate and possibly activate a block
    pub fn submit_block(&self, bytes: &[u8]) -> AcceptanceResult {
        let block = match deserialize_block(bytes) {
            Ok(block) => block,
            Err(error) => return AcceptanceResult::undecodable(error),
        };
        let hash = block.hash();
        let result = match self.chainstate.process_block(block) {
            Ok(BlockOutcome::Accepted) => AcceptanceResult::Accepted { hash },
            Ok(BlockOutcome::Duplicate) => AcceptanceResult::Duplicate { hash },
            Ok(BlockOutcome::Pending) => AcceptanceResult::Pending { hash },
            Err(reason) => AcceptanceResult::Rejected { hash: Some(hash), reason },
        };
        // A rejected block may still have moved the tip to another branch
        self.sync_mempool();
        result
    }

    /// SubmitTransaction: decode and try to admit a transaction to the mempool
    pub fn submit_transaction(&self, bytes: &[u8]) -> AcceptanceResult {
        let tx = match deserialize_transaction(bytes) {
            Ok(tx) => tx,
            Err(error) => return AcceptanceResult::undecodable(error),
        };
        let hash = tx.txid();
        let now = self.chainstate.adjusted_time();
        let mut mempool = self.mempool.lock();
        let outcome = self.chainstate.with_tip_view(|view| {
            self.catch_up(&mut mempool, view);
            mempool.accept(tx, view, now)
        });
        match outcome {
            Ok(_) => AcceptanceResult::Accepted { hash },
            Err(ValidationError::Policy(PolicyError::AlreadyInMempool)) => AcceptanceResult::Duplicate { hash },
            Err(ValidationError::Policy(PolicyError::MissingInputs)) => AcceptanceResult::Pending { hash },
            Err(reason) => AcceptanceResult::Rejected { hash: Some(hash), reason },
        }
    }

    fn sync_mempool(&self) {
        let mut mempool = self.mempool.lock();
        self.chainstate.with_tip_view(|view| self.catch_up(&mut mempool, view));
    }

    /// Apply pending tip changes to the mempool. Tip changes are published
    /// under the chain write lock, so none can arrive while `view` is held.
    fn catch_up(&self, mempool: &mut Mempool, view: &TipView<'_>) {
        let events: Vec<TipChanged> = self.tip_events.try_iter().collect();
        if events.is_empty() {
            return;
        }
        let now = self.chainstate.adjusted_time();
        for event in events {
            let fetch = |hashes: &[Hash]| -> Vec<Arc<Block>> {
                hashes.iter().filter_map(|hash| self.chainstate.block(hash)).collect()
            };
            let disconnected = fetch(&event.disconnected);
            let connected = fetch(&event.connected);
            let removed = mempool.update_for_tip_change(&disconnected, &connected, view, now);
            debug!(
                "mempool updated for tip {}: {} removed, {} entries",
                hash_hex(&event.new_tip),
                removed.len(),
                mempool.len()
            );
        }
    }

    /// GetBestTipInfo
    pub fn best_tip_info(&self) -> TipInfo {
        self.chainstate.best_tip_info()
    }

    /// GetCoin: confirmed unspent output at the active tip
    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.chainstate.get_coin(outpoint)
    }

    pub fn subscribe(&self) -> Receiver<TipChanged> {
        self.chainstate.subscribe()
    }

    pub fn mempool_info(&self) -> MempoolInfo {
        self.sync_mempool();
        self.mempool.lock().info()
    }

    /// Mempool transactions in admission order
    pub fn mempool_transactions(&self) -> Vec<Arc<Transaction>> {
        self.sync_mempool();
        self.mempool.lock().transactions()
    }
}
