//! Chainstate manager: block index, best-chain selection and reorganization
//!
//! Two locks guard the manager. `index` covers the block tree, stored bodies
//! and the orphan pool; `state` covers the active chain, undo data and every
//! write to the coin store. Code that needs both takes `state` first, so
//! header ingestion never waits behind a whole reorganization.

use crate::block::{
    check_block, check_block_header, compute_merkle_root, connect_block, contextual_check_block,
    contextual_check_block_header, disconnect_block, ConnectContext, HeaderContext,
};
use crate::coins::{CoinBatch, CoinStore, CoinsView, CoinsViewCache};
use crate::config::ChainParams;
use crate::constants::*;
use crate::error::{ConsensusError, ValidationError};
use crate::locktime::median_time_past;
use crate::mempool::ChainView;
use crate::pow::{block_proof, get_next_work_required, U256};
use crate::script::{opcodes, push_data};
use crate::types::*;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Headers and blocks with an unknown parent kept around waiting for it
const MAX_ORPHAN_BLOCKS: usize = 100;

/// Stable handle into the block index arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Validation state of an indexed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Header checks passed; the body has not been connected
    HeaderValid,
    /// Connected on the active chain at least once
    FullyValid,
    /// Failed a consensus check
    Failed,
    /// An ancestor failed
    FailedParent,
}

impl BlockStatus {
    pub fn is_failed(self) -> bool {
        matches!(self, BlockStatus::Failed | BlockStatus::FailedParent)
    }
}

#[derive(Debug, Clone)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    pub header: BlockHeader,
    pub parent: Option<BlockId>,
    pub height: u64,
    pub chain_work: U256,
    /// Median time past of the chain ending at this block
    pub median_time_past: u64,
    pub status: BlockStatus,
    pub has_data: bool,
    /// Arrival order of the body; zero until it arrives
    pub sequence_id: u64,
    // This block and every ancestor have bodies
    chain_has_data: bool,
}

/// Source of the current time for the future-timestamp rule
pub trait TimeSource: Send + Sync {
    /// Seconds since the unix epoch
    fn now(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipInfo {
    pub hash: Hash,
    pub height: u64,
    pub chain_work: U256,
}

/// Published after every change of the active tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipChanged {
    pub old_tip: Hash,
    pub new_tip: Hash,
    /// Old tip first
    pub disconnected: Vec<Hash>,
    /// Ascending height
    pub connected: Vec<Hash>,
}

/// How a submitted block was taken in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Accepted,
    Duplicate,
    /// Parent unknown; held until it arrives
    Pending,
}

#[derive(Debug, Clone)]
struct ChainLink {
    id: BlockId,
    hash: Hash,
    median_time_past: u64,
    chain_work: U256,
}

impl ChainLink {
    fn of(id: BlockId, entry: &BlockIndexEntry) -> Self {
        Self {
            id,
            hash: entry.hash,
            median_time_past: entry.median_time_past,
            chain_work: entry.chain_work,
        }
    }

    fn tip_info(&self, height: u64) -> TipInfo {
        TipInfo { hash: self.hash, height, chain_work: self.chain_work }
    }
}

/// Header or whole block waiting for its parent
enum Orphan {
    Header(BlockHeader),
    Block(Block),
}

impl Orphan {
    fn header(&self) -> &BlockHeader {
        match self {
            Orphan::Header(header) => header,
            Orphan::Block(block) => &block.header,
        }
    }
}

#[derive(Default)]
struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    children: Vec<Vec<BlockId>>,
    by_hash: HashMap<Hash, BlockId>,
    bodies: HashMap<BlockId, Arc<Block>>,
    /// Fully stored chains that may become the tip
    candidates: HashSet<BlockId>,
    /// Keyed by the missing parent hash
    orphans: HashMap<Hash, Vec<(Hash, Orphan)>>,
    /// (parent, hash) of every orphan, oldest first
    orphan_order: VecDeque<(Hash, Hash)>,
    next_sequence: u64,
}

impl BlockIndex {
    fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id.index()]
    }

    fn get_mut(&mut self, id: BlockId) -> &mut BlockIndexEntry {
        &mut self.entries[id.index()]
    }

    fn lookup(&self, hash: &Hash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    fn insert(&mut self, entry: BlockIndexEntry) -> BlockId {
        let id = BlockId(self.entries.len() as u32);
        if let Some(parent) = entry.parent {
            self.children[parent.index()].push(id);
        }
        self.by_hash.insert(entry.hash, id);
        self.entries.push(entry);
        self.children.push(Vec::new());
        id
    }

    fn ancestor(&self, id: BlockId, height: u64) -> Option<BlockId> {
        let mut cursor = id;
        loop {
            let entry = self.get(cursor);
            if entry.height == height {
                return Some(cursor);
            }
            if entry.height < height {
                return None;
            }
            cursor = entry.parent?;
        }
    }

    /// Median time past of a chain made of `parent`'s chain plus one block at `timestamp`
    fn median_time_past_after(&self, parent: Option<BlockId>, timestamp: u32) -> u64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        times.push(timestamp);
        let mut cursor = parent;
        while let Some(id) = cursor {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.get(id);
            times.push(entry.header.timestamp);
            cursor = entry.parent;
        }
        median_time_past(&times)
    }

    fn store_body(&mut self, id: BlockId, block: Block) {
        self.bodies.insert(id, Arc::new(block));
        let sequence_id = self.next_sequence;
        self.next_sequence += 1;
        let parent_ready = self
            .get(id)
            .parent
            .map_or(true, |parent| self.get(parent).chain_has_data);

        let entry = self.get_mut(id);
        entry.has_data = true;
        entry.sequence_id = sequence_id;
        if !parent_ready {
            return;
        }
        // Bodies that arrived before this one may now complete their chains
        let mut ready = vec![id];
        while let Some(next) = ready.pop() {
            let entry = self.get_mut(next);
            entry.chain_has_data = true;
            if !entry.status.is_failed() {
                self.candidates.insert(next);
            }
            for &child in &self.children[next.index()] {
                let child_entry = &self.entries[child.index()];
                if child_entry.has_data && !child_entry.chain_has_data {
                    ready.push(child);
                }
            }
        }
    }

    fn mark_failed(&mut self, id: BlockId) {
        self.get_mut(id).status = BlockStatus::Failed;
        self.candidates.remove(&id);
        let mut pending = self.children[id.index()].clone();
        while let Some(next) = pending.pop() {
            self.get_mut(next).status = BlockStatus::FailedParent;
            self.candidates.remove(&next);
            pending.extend(self.children[next.index()].iter().copied());
        }
    }

    /// Most work first, then earliest arrival
    fn best_candidate(&self) -> Option<BlockId> {
        self.candidates.iter().copied().max_by(|&a, &b| {
            let (a, b) = (self.get(a), self.get(b));
            a.chain_work
                .cmp(&b.chain_work)
                .then_with(|| b.sequence_id.cmp(&a.sequence_id))
        })
    }

    fn prune_candidates(&mut self, tip_work: U256) {
        let entries = &self.entries;
        self.candidates
            .retain(|id| entries[id.index()].chain_work >= tip_work);
    }

    /// Hold an orphan, dropping the oldest ones once the pool is full. A
    /// body replaces a pending header with the same hash.
    fn add_orphan(&mut self, orphan: Orphan) {
        let hash = orphan.header().hash();
        let parent = orphan.header().prev_block_hash;
        let waiting = self.orphans.entry(parent).or_default();
        if let Some(known) = waiting.iter_mut().find(|(known, _)| *known == hash) {
            if matches!(orphan, Orphan::Block(_)) {
                known.1 = orphan;
            }
            return;
        }
        waiting.push((hash, orphan));
        self.orphan_order.push_back((parent, hash));

        while self.orphan_order.len() > MAX_ORPHAN_BLOCKS {
            let Some((parent, oldest)) = self.orphan_order.pop_front() else { break };
            if let Some(waiting) = self.orphans.get_mut(&parent) {
                waiting.retain(|(hash, _)| *hash != oldest);
                if waiting.is_empty() {
                    self.orphans.remove(&parent);
                }
            }
            debug!("orphan pool full, dropped {}", hash_hex(&oldest));
        }
    }

    fn take_orphans(&mut self, parent: &Hash) -> Vec<Orphan> {
        let Some(waiting) = self.orphans.remove(parent) else {
            return Vec::new();
        };
        self.orphan_order.retain(|(waiting_on, _)| waiting_on != parent);
        waiting.into_iter().map(|(_, orphan)| orphan).collect()
    }

    fn orphan_count(&self) -> usize {
        self.orphan_order.len()
    }
}

struct ChainState {
    /// Active chain by height; never empty, genesis is always active
    active: Vec<ChainLink>,
    undo: HashMap<Hash, BlockUndo>,
}

impl ChainState {
    fn tip(&self) -> &ChainLink {
        &self.active[self.active.len() - 1]
    }

    fn height(&self) -> u64 {
        (self.active.len() - 1) as u64
    }
}

/// Consistent view of the active chain and its UTXO set
pub struct TipView<'a> {
    links: &'a [ChainLink],
    coins: &'a dyn CoinStore,
}

impl TipView<'_> {
    pub fn tip(&self) -> TipInfo {
        self.links[self.links.len() - 1].tip_info(self.height())
    }

    pub fn height(&self) -> u64 {
        (self.links.len() - 1) as u64
    }

    pub fn median_time_past(&self) -> u64 {
        self.links[self.links.len() - 1].median_time_past
    }

    /// Median time past of the active chain ending at `height`, clamped to the tip
    pub fn median_time_at(&self, height: u64) -> u64 {
        let index = (height as usize).min(self.links.len() - 1);
        self.links[index].median_time_past
    }
}

impl CoinsView for TipView<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        self.coins.read_coin(outpoint)
    }
}

impl ChainView for TipView<'_> {
    fn tip_height(&self) -> u64 {
        self.height()
    }

    fn tip_median_time(&self) -> u64 {
        self.median_time_past()
    }

    fn median_time_at(&self, height: u64) -> u64 {
        TipView::median_time_at(self, height)
    }
}

/// Genesis block of a network. It is never validated and its coinbase is
/// never spendable.
pub fn genesis_block(params: &ChainParams) -> Block {
    let mut script_sig = Vec::new();
    push_data(&mut script_sig, params.genesis_message.as_bytes());
    let coinbase = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: params.genesis_reward,
            script_pubkey: vec![opcodes::OP_RETURN],
        }],
        lock_time: 0,
    };
    let (merkle_root, _) = compute_merkle_root(&[coinbase.txid()]);
    Block {
        header: BlockHeader {
            prev_block_hash: [0u8; 32],
            merkle_root,
            timestamp: params.genesis_timestamp,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
            version: 1,
        },
        transactions: vec![coinbase],
    }
}

struct ConnectStep {
    id: BlockId,
    hash: Hash,
    height: u64,
    median_time_past: u64,
    block: Arc<Block>,
}

struct ActivationPlan {
    fork_height: u64,
    /// Active blocks above the fork, tip first
    disconnect: Vec<(Hash, Arc<Block>)>,
    connect: Vec<ConnectStep>,
}

enum StepOutcome {
    Activated(TipChanged),
    Invalid { id: BlockId, hash: Hash, error: ConsensusError },
}

/// Owns the block index, the active chain and the UTXO base layer
pub struct ChainstateManager {
    params: ChainParams,
    store: Arc<dyn CoinStore>,
    index: RwLock<BlockIndex>,
    state: RwLock<ChainState>,
    pool: rayon::ThreadPool,
    time: Arc<dyn TimeSource>,
    subscribers: Mutex<Vec<Sender<TipChanged>>>,
    genesis_hash: Hash,
}

impl ChainstateManager {
    pub fn new(params: ChainParams, store: Arc<dyn CoinStore>, script_threads: usize) -> anyhow::Result<Self> {
        Self::with_time_source(params, store, script_threads, Arc::new(SystemTimeSource))
    }

    pub fn with_time_source(
        params: ChainParams,
        store: Arc<dyn CoinStore>,
        script_threads: usize,
        time: Arc<dyn TimeSource>,
    ) -> anyhow::Result<Self> {
        params.validate()?;
        let genesis = genesis_block(&params);
        let genesis_hash = genesis.hash();

        match store.best_block() {
            Some(best) if best != genesis_hash => {
                anyhow::bail!("coin store is at unknown block {}", hash_hex(&best))
            }
            Some(_) => {}
            None => store.write_batch(&CoinBatch { writes: Vec::new(), best_block: genesis_hash })?,
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(script_threads)
            .thread_name(|i| format!("script-check-{i}"))
            .build()?;

        let mut index = BlockIndex::default();
        let id = index.insert(BlockIndexEntry {
            hash: genesis_hash,
            header: genesis.header.clone(),
            parent: None,
            height: 0,
            chain_work: block_proof(genesis.header.bits),
            median_time_past: genesis.header.timestamp as u64,
            status: BlockStatus::FullyValid,
            has_data: false,
            sequence_id: 0,
            chain_has_data: false,
        });
        index.store_body(id, genesis);
        let state = ChainState {
            active: vec![ChainLink::of(id, index.get(id))],
            undo: HashMap::new(),
        };

        info!("chainstate initialized at genesis {}", hash_hex(&genesis_hash));
        Ok(Self {
            params,
            store,
            index: RwLock::new(index),
            state: RwLock::new(state),
            pool,
            time,
            subscribers: Mutex::new(Vec::new()),
            genesis_hash,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Current time according to the configured clock
    pub fn adjusted_time(&self) -> u64 {
        self.time.now()
    }

    /// Receive every future tip change
    pub fn subscribe(&self) -> Receiver<TipChanged> {
        let (sender, receiver) = unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }

    pub fn best_tip_info(&self) -> TipInfo {
        let state = self.state.read();
        state.tip().tip_info(state.height())
    }

    pub fn get_coin(&self, outpoint: &OutPoint) -> Option<Coin> {
        let _state = self.state.read();
        self.store.read_coin(outpoint)
    }

    pub fn header(&self, hash: &Hash) -> Option<BlockHeader> {
        let index = self.index.read();
        index.lookup(hash).map(|id| index.get(id).header.clone())
    }

    pub fn block(&self, hash: &Hash) -> Option<Arc<Block>> {
        let index = self.index.read();
        index.lookup(hash).and_then(|id| index.bodies.get(&id).cloned())
    }

    pub fn block_status(&self, hash: &Hash) -> Option<BlockStatus> {
        let index = self.index.read();
        index.lookup(hash).map(|id| index.get(id).status)
    }

    pub fn active_hash_at(&self, height: u64) -> Option<Hash> {
        self.state.read().active.get(height as usize).map(|link| link.hash)
    }

    pub fn orphan_count(&self) -> usize {
        self.index.read().orphan_count()
    }

    /// Run `f` against the active chain with block connection held off
    pub fn with_tip_view<R>(&self, f: impl FnOnce(&TipView<'_>) -> R) -> R {
        let state = self.state.read();
        let view = TipView { links: &state.active, coins: &*self.store };
        f(&view)
    }

    /// CheckHeader and index insertion ahead of the body. Nothing is
    /// activated until bodies arrive through `process_block`.
    pub fn process_header(&self, header: BlockHeader) -> Result<BlockOutcome, ValidationError> {
        let hash = header.hash();
        let mut index = self.index.write();
        let known = index.lookup(&hash).is_some();
        match self.accept_header(&mut index, &header)? {
            Some(_) if known => Ok(BlockOutcome::Duplicate),
            Some(_) => {
                self.accept_orphans(&mut index, hash);
                Ok(BlockOutcome::Accepted)
            }
            None => {
                debug!(
                    "header {} waits for unknown parent {}",
                    hash_hex(&hash),
                    hash_hex(&header.prev_block_hash)
                );
                index.add_orphan(Orphan::Header(header));
                Ok(BlockOutcome::Pending)
            }
        }
    }

    /// Validate and store a block, then move the tip to the best valid chain
    pub fn process_block(&self, block: Block) -> Result<BlockOutcome, ValidationError> {
        let hash = block.hash();
        let outcome = {
            let mut index = self.index.write();
            let outcome = self.accept_block(&mut index, block)?;
            if outcome == BlockOutcome::Accepted {
                self.accept_orphans(&mut index, hash);
            }
            outcome
        };
        if outcome != BlockOutcome::Accepted {
            return Ok(outcome);
        }

        let failures = self.activate_best_chain()?;
        if let Some((_, error)) = failures.into_iter().find(|(failed, _)| *failed == hash) {
            return Err(error.into());
        }
        if self.block_status(&hash) == Some(BlockStatus::FailedParent) {
            return Err(ConsensusError::BadPrevBlock.into());
        }
        Ok(BlockOutcome::Accepted)
    }

    fn accept_block(&self, index: &mut BlockIndex, block: Block) -> Result<BlockOutcome, ValidationError> {
        let hash = block.hash();
        let stored = index.lookup(&hash).map(|id| index.get(id));
        if stored.map_or(false, |entry| entry.has_data && !entry.status.is_failed()) {
            return Ok(BlockOutcome::Duplicate);
        }

        let Some(id) = self.accept_header(index, &block.header)? else {
            debug!(
                "block {} waits for unknown parent {}",
                hash_hex(&hash),
                hash_hex(&block.header.prev_block_hash)
            );
            index.add_orphan(Orphan::Block(block));
            return Ok(BlockOutcome::Pending);
        };
        let entry = index.get(id);
        let height = entry.height;
        let parent_median_time = entry.parent.map_or(0, |parent| index.get(parent).median_time_past);

        let checked = check_block(&block, &self.params)
            .and_then(|_| contextual_check_block(&block, height, parent_median_time));
        if let Err(error) = checked {
            if !error.may_be_mutation() {
                warn!("block {} at height {} is invalid: {}", hash_hex(&hash), height, error);
                index.mark_failed(id);
            }
            return Err(error.into());
        }

        index.store_body(id, block);
        debug!("stored block {} at height {}", hash_hex(&hash), height);
        Ok(BlockOutcome::Accepted)
    }

    /// Index a header, or find it already indexed. `None` when the parent is
    /// not known yet.
    fn accept_header(
        &self,
        index: &mut BlockIndex,
        header: &BlockHeader,
    ) -> Result<Option<BlockId>, ConsensusError> {
        let hash = header.hash();
        if let Some(id) = index.lookup(&hash) {
            if index.get(id).status.is_failed() {
                return Err(ConsensusError::KnownInvalid);
            }
            return Ok(Some(id));
        }
        check_block_header(header, &self.params)?;
        let Some(parent_id) = index.lookup(&header.prev_block_hash) else {
            return Ok(None);
        };

        let parent = index.get(parent_id);
        let expected_bits = get_next_work_required(
            parent.height,
            &parent.header,
            |height| index.ancestor(parent_id, height).map(|id| index.get(id).header.timestamp),
            &self.params,
        )?;
        let context = HeaderContext {
            expected_bits,
            median_time_past: parent.median_time_past,
            now: self.time.now(),
        };
        contextual_check_block_header(header, &context, &self.params)?;

        let parent_failed = parent.status.is_failed();
        let entry = BlockIndexEntry {
            hash,
            header: header.clone(),
            parent: Some(parent_id),
            height: parent.height + 1,
            chain_work: parent.chain_work.saturating_add(block_proof(header.bits)),
            median_time_past: index.median_time_past_after(Some(parent_id), header.timestamp),
            status: if parent_failed { BlockStatus::FailedParent } else { BlockStatus::HeaderValid },
            has_data: false,
            sequence_id: 0,
            chain_has_data: false,
        };
        let height = entry.height;
        let id = index.insert(entry);
        if parent_failed {
            return Err(ConsensusError::BadPrevBlock);
        }
        debug!("accepted header {} at height {}", hash_hex(&hash), height);
        Ok(Some(id))
    }

    fn accept_orphans(&self, index: &mut BlockIndex, parent: Hash) {
        let mut parents = vec![parent];
        while let Some(parent) = parents.pop() {
            for orphan in index.take_orphans(&parent) {
                let orphan_hash = orphan.header().hash();
                let result = match orphan {
                    Orphan::Header(header) => self
                        .accept_header(index, &header)
                        .map(|_| ())
                        .map_err(ValidationError::from),
                    Orphan::Block(block) => self.accept_block(index, block).map(|_| ()),
                };
                if let Err(error) = result {
                    debug!("orphan {} rejected: {}", hash_hex(&orphan_hash), error);
                }
                // Indexed headers release their own orphans, failed ones included
                if index.lookup(&orphan_hash).is_some() {
                    parents.push(orphan_hash);
                }
            }
        }
    }

    /// Switch to the most-work valid chain, returning the blocks that failed
    /// along the way
    fn activate_best_chain(&self) -> Result<Vec<(Hash, ConsensusError)>, ValidationError> {
        let mut state = self.state.write();
        let mut failures = Vec::new();
        loop {
            let plan = {
                let index = self.index.read();
                let Some(best) = index.best_candidate() else { break };
                if index.get(best).chain_work <= state.tip().chain_work {
                    break;
                }
                self.plan_activation(&index, &state, best)?
            };

            match self.activate_step(&mut state, plan)? {
                StepOutcome::Activated(event) => self.publish(event),
                StepOutcome::Invalid { id, hash, error } => {
                    warn!("block {} failed to connect: {}", hash_hex(&hash), error);
                    self.index.write().mark_failed(id);
                    failures.push((hash, error));
                }
            }
        }
        self.index.write().prune_candidates(state.tip().chain_work);
        Ok(failures)
    }

    fn plan_activation(
        &self,
        index: &BlockIndex,
        state: &ChainState,
        target: BlockId,
    ) -> Result<ActivationPlan, ValidationError> {
        let body = |id: BlockId| {
            index
                .bodies
                .get(&id)
                .cloned()
                .ok_or(ValidationError::Consensus(ConsensusError::UncleanDisconnect))
        };

        let mut branch = Vec::new();
        let mut cursor = Some(target);
        while let Some(id) = cursor {
            let entry = index.get(id);
            if state.active.get(entry.height as usize).map(|link| link.id) == Some(id) {
                break;
            }
            branch.push(id);
            cursor = entry.parent;
        }
        branch.reverse();
        let fork_height = match branch.first() {
            Some(&first) => index.get(first).height - 1,
            None => state.height(),
        };

        let mut disconnect = Vec::new();
        for link in state.active[fork_height as usize + 1..].iter().rev() {
            disconnect.push((link.hash, body(link.id)?));
        }
        let mut connect = Vec::with_capacity(branch.len());
        for id in branch {
            let entry = index.get(id);
            connect.push(ConnectStep {
                id,
                hash: entry.hash,
                height: entry.height,
                median_time_past: entry.median_time_past,
                block: body(id)?,
            });
        }
        Ok(ActivationPlan { fork_height, disconnect, connect })
    }

    /// Apply one activation plan in a reorg-wide overlay. The store is only
    /// written, and the tip only moves, when every block connected.
    fn activate_step(&self, state: &mut ChainState, plan: ActivationPlan) -> Result<StepOutcome, ValidationError> {
        let base: &dyn CoinStore = &*self.store;
        let mut reorg = CoinsViewCache::new(base);
        let fork = plan.fork_height as usize;

        for (offset, (hash, block)) in plan.disconnect.iter().enumerate() {
            let height = state.height() - offset as u64;
            let undo = state.undo.get(hash).ok_or(ConsensusError::UncleanDisconnect)?;
            let delta = disconnect_block(block, undo, &reorg, height)?;
            reorg.apply_changes(delta);
        }

        let links = &state.active[..=fork];
        let steps = &plan.connect;
        let median_time_at = move |height: u64| -> u64 {
            let height = height as usize;
            if height <= fork {
                links.get(height).map_or(0, |link| link.median_time_past)
            } else {
                steps.get(height - fork - 1).map_or(0, |step| step.median_time_past)
            }
        };

        let mut undos = Vec::with_capacity(steps.len());
        for step in steps {
            let prev_median_time = median_time_at(step.height - 1);
            let ctx = ConnectContext::new(step.height, prev_median_time, &self.params, &median_time_at)
                .with_pool(&self.pool);
            match connect_block(&step.block, &reorg, &ctx) {
                Ok(connected) => {
                    reorg.apply_changes(connected.delta);
                    undos.push((step.hash, connected.undo));
                }
                Err(error) => return Ok(StepOutcome::Invalid { id: step.id, hash: step.hash, error }),
            }
        }

        let old_tip = state.tip().hash;
        let new_tip = match plan.connect.last() {
            Some(step) => step.hash,
            None => old_tip,
        };
        let batch = reorg.take_changes().into_batch(new_tip);
        self.store.write_batch(&batch).map_err(ValidationError::storage)?;

        let mut index = self.index.write();
        state.active.truncate(fork + 1);
        let disconnected: Vec<Hash> = plan.disconnect.iter().map(|(hash, _)| *hash).collect();
        for hash in &disconnected {
            state.undo.remove(hash);
        }
        for step in &plan.connect {
            let entry = index.get_mut(step.id);
            entry.status = BlockStatus::FullyValid;
            state.active.push(ChainLink::of(step.id, entry));
        }
        state.undo.extend(undos);

        if disconnected.is_empty() {
            info!(
                "new best tip {} at height {}",
                hash_hex(&new_tip),
                state.height()
            );
        } else {
            info!(
                "reorganized {} blocks off {} onto {} at height {}",
                disconnected.len(),
                hash_hex(&old_tip),
                hash_hex(&new_tip),
                state.height()
            );
        }
        Ok(StepOutcome::Activated(TipChanged {
            old_tip,
            new_tip,
            disconnected,
            connected: plan.connect.iter().map(|step| step.hash).collect(),
        }))
    }

    fn publish(&self, event: TipChanged) {
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }
}
