//! Block validation: header checks, body checks, connect and disconnect

use crate::coins::{CoinsDelta, CoinsView, CoinsViewCache};
use crate::config::ChainParams;
use crate::constants::*;
use crate::economic::{get_block_subsidy, money_range};
use crate::error::{ConsensusError, Result};
use crate::locktime::{calculate_sequence_locks, check_sequence_locks, is_final_tx};
use crate::pow::check_proof_of_work;
use crate::script::ScriptFlags;
use crate::serialization::double_sha256;
use crate::transaction::{check_transaction, check_tx_inputs, legacy_sigop_count, sigop_cost, verify_input_script};
use crate::types::*;
use rayon::prelude::*;
use rayon::ThreadPool;

/// ComputeMerkleRoot: SHA256d pairing of `leaves`, duplicating the last node
/// of odd levels. The flag reports two identical adjacent nodes on any level,
/// which lets a different transaction list produce the same root.
pub fn compute_merkle_root(leaves: &[Hash]) -> (Hash, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        for pair in level.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(&last) = level.last() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                double_sha256(&buf)
            })
            .collect();
    }
    (level[0], mutated)
}

pub fn block_merkle_root(block: &Block) -> (Hash, bool) {
    let txids: Vec<Hash> = block.transactions.iter().map(Transaction::txid).collect();
    compute_merkle_root(&txids)
}

/// Block weight: every byte counts four times, there is no witness discount
pub fn block_weight(block: &Block) -> usize {
    block.serialized_size() * WITNESS_SCALE_FACTOR
}

/// CheckBlockHeader: proof of work against the header's own target
pub fn check_block_header(header: &BlockHeader, params: &ChainParams) -> Result<()> {
    check_proof_of_work(&header.hash(), header.bits, params)
}

/// Chain context a header is validated against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderContext {
    /// Bits due per the difficulty schedule
    pub expected_bits: u32,
    /// Median time past of the parent
    pub median_time_past: u64,
    /// Adjusted current time
    pub now: u64,
}

/// ContextualCheckBlockHeader: difficulty schedule, timestamp window, version
pub fn contextual_check_block_header(
    header: &BlockHeader,
    ctx: &HeaderContext,
    params: &ChainParams,
) -> Result<()> {
    if header.bits != ctx.expected_bits {
        return Err(ConsensusError::BadDifficultyBits {
            actual: header.bits,
            expected: ctx.expected_bits,
        });
    }
    let time = header.timestamp as u64;
    if time <= ctx.median_time_past {
        return Err(ConsensusError::TimeTooOld { time, median: ctx.median_time_past });
    }
    if time > ctx.now + params.max_future_block_time {
        return Err(ConsensusError::TimeTooNew { time, now: ctx.now });
    }
    if header.version < 1 {
        return Err(ConsensusError::BadVersion(header.version));
    }
    Ok(())
}

/// CheckBlock: context-free body validity
pub fn check_block(block: &Block, params: &ChainParams) -> Result<()> {
    check_block_header(&block.header, params)?;

    if block.transactions.is_empty() {
        return Err(ConsensusError::EmptyBlock);
    }
    let (root, mutated) = block_merkle_root(block);
    if root != block.header.merkle_root {
        return Err(ConsensusError::BadMerkleRoot);
    }
    if mutated {
        return Err(ConsensusError::DuplicateTransaction);
    }

    let weight = block_weight(block);
    if weight > MAX_BLOCK_WEIGHT {
        return Err(ConsensusError::BlockWeight { weight, limit: MAX_BLOCK_WEIGHT });
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ConsensusError::MissingCoinbase);
    }
    for (tx_index, tx) in block.transactions.iter().enumerate().skip(1) {
        if tx.is_coinbase() {
            return Err(ConsensusError::UnexpectedCoinbase.in_transaction(tx_index));
        }
    }
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        check_transaction(tx).map_err(|e| e.in_transaction(tx_index))?;
    }

    let sigops: usize = block.transactions.iter().map(legacy_sigop_count).sum();
    let cost = sigops * WITNESS_SCALE_FACTOR;
    if cost > MAX_BLOCK_SIGOPS_COST {
        return Err(ConsensusError::TooManySigops { cost, limit: MAX_BLOCK_SIGOPS_COST });
    }
    Ok(())
}

/// ContextualCheckBlock: every transaction final for this height and time
pub fn contextual_check_block(block: &Block, height: u64, prev_median_time: u64) -> Result<()> {
    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if !is_final_tx(tx, height, prev_median_time) {
            return Err(ConsensusError::NonFinal.in_transaction(tx_index));
        }
    }
    Ok(())
}

/// Everything `connect_block` needs to know about the block's position
pub struct ConnectContext<'a> {
    pub height: u64,
    pub prev_median_time: u64,
    pub flags: ScriptFlags,
    pub enforce_sequence_locks: bool,
    pub coinbase_maturity: u64,
    pub subsidy: Amount,
    /// Median time past of the chain ending at a given height
    pub median_time_at: &'a (dyn Fn(u64) -> u64 + Sync),
    /// Script checks run here when present, inline otherwise
    pub pool: Option<&'a ThreadPool>,
}

impl<'a> ConnectContext<'a> {
    pub fn new(
        height: u64,
        prev_median_time: u64,
        params: &ChainParams,
        median_time_at: &'a (dyn Fn(u64) -> u64 + Sync),
    ) -> Self {
        Self {
            height,
            prev_median_time,
            flags: params.script_flags_at(height),
            enforce_sequence_locks: params.enforces_sequence_locks(height),
            coinbase_maturity: params.coinbase_maturity,
            subsidy: get_block_subsidy(height, params),
            median_time_at,
            pool: None,
        }
    }

    pub fn with_pool(mut self, pool: &'a ThreadPool) -> Self {
        self.pool = Some(pool);
        self
    }
}

/// Result of a successful connect, not yet applied anywhere
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedBlock {
    pub delta: CoinsDelta,
    pub undo: BlockUndo,
    pub fees: Amount,
    pub sigop_cost: usize,
}

struct ScriptCheck<'b> {
    tx_index: usize,
    input_index: usize,
    tx: &'b Transaction,
    coin: Coin,
}

impl ScriptCheck<'_> {
    fn run(&self, flags: ScriptFlags) -> Option<ConsensusError> {
        verify_input_script(self.tx, self.input_index, &self.coin, flags)
            .err()
            .map(|source| {
                ConsensusError::Script { input_index: self.input_index, source }
                    .in_transaction(self.tx_index)
            })
    }
}

/// ConnectBlock: apply `block` on top of `view`
///
/// Inputs are resolved in block order inside a private overlay, so a second
/// spend of the same outpoint fails as missing. Script checks only read the
/// coins captured during that pass and run after it, in parallel when a pool
/// is supplied; the reported failure is always the first one in block order.
/// Nothing is written to `view`: the caller applies the returned delta.
pub fn connect_block<V: CoinsView + ?Sized>(
    block: &Block,
    view: &V,
    ctx: &ConnectContext<'_>,
) -> Result<ConnectedBlock> {
    let mut overlay = CoinsViewCache::new(view);
    let mut undo = BlockUndo::default();
    let mut fees: Amount = 0;
    let mut cost = 0usize;
    let mut checks = Vec::new();

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if tx.is_coinbase() {
            cost += legacy_sigop_count(tx) * WITNESS_SCALE_FACTOR;
        } else {
            let mut coins = Vec::with_capacity(tx.inputs.len());
            for (index, input) in tx.inputs.iter().enumerate() {
                let coin = overlay
                    .spend_coin(&input.prevout)
                    .ok_or_else(|| ConsensusError::MissingOrSpentInput { index }.in_transaction(tx_index))?;
                coins.push(coin);
            }

            let fee = check_tx_inputs(tx, &coins, ctx.height, ctx.coinbase_maturity)
                .map_err(|e| e.in_transaction(tx_index))?;
            fees = fees
                .checked_add(fee)
                .filter(|total| money_range(*total))
                .ok_or(ConsensusError::FeeOverflow)?;

            let coin_heights: Vec<u64> = coins.iter().map(|coin| coin.height).collect();
            let locks = calculate_sequence_locks(
                tx,
                ctx.enforce_sequence_locks,
                &coin_heights,
                ctx.median_time_at,
            );
            if !check_sequence_locks(&locks, ctx.height, ctx.prev_median_time) {
                return Err(ConsensusError::SequenceLockNotSatisfied.in_transaction(tx_index));
            }

            cost += sigop_cost(tx, &coins, ctx.flags);

            for (input_index, coin) in coins.iter().enumerate() {
                checks.push(ScriptCheck { tx_index, input_index, tx, coin: coin.clone() });
            }
            undo.txs.push(TxUndo { spent: coins });
        }

        if cost > MAX_BLOCK_SIGOPS_COST {
            return Err(ConsensusError::TooManySigops { cost, limit: MAX_BLOCK_SIGOPS_COST });
        }
        overlay
            .add_transaction_outputs(tx, ctx.height)
            .map_err(|e| e.in_transaction(tx_index))?;
    }

    let claimed = block
        .transactions
        .first()
        .and_then(Transaction::total_output_value)
        .ok_or(ConsensusError::MissingCoinbase)?;
    let allowed = ctx.subsidy + fees;
    if claimed > allowed {
        return Err(ConsensusError::BadCoinbaseValue { claimed, allowed });
    }

    let flags = ctx.flags;
    let failure = match ctx.pool {
        Some(pool) => pool.install(|| checks.par_iter().find_map_first(|check| check.run(flags))),
        None => checks.iter().find_map(|check| check.run(flags)),
    };
    if let Some(err) = failure {
        return Err(err);
    }

    Ok(ConnectedBlock { delta: overlay.take_changes(), undo, fees, sigop_cost: cost })
}

/// DisconnectBlock: undo `block` on top of `view` using the coins it spent
pub fn disconnect_block<V: CoinsView + ?Sized>(
    block: &Block,
    undo: &BlockUndo,
    view: &V,
    height: u64,
) -> Result<CoinsDelta> {
    if undo.txs.len() + 1 != block.transactions.len() {
        return Err(ConsensusError::UncleanDisconnect);
    }
    let mut overlay = CoinsViewCache::new(view);

    for (tx_index, tx) in block.transactions.iter().enumerate().rev() {
        let txid = tx.txid();
        for (index, output) in tx.outputs.iter().enumerate() {
            if output.is_unspendable() {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            match overlay.spend_coin(&outpoint) {
                Some(coin)
                    if coin.output == *output
                        && coin.height == height
                        && coin.is_coinbase == tx.is_coinbase() => {}
                _ => return Err(ConsensusError::UncleanDisconnect),
            }
        }

        if tx_index == 0 {
            continue;
        }
        let tx_undo = &undo.txs[tx_index - 1];
        if tx_undo.spent.len() != tx.inputs.len() {
            return Err(ConsensusError::UncleanDisconnect);
        }
        for (input, coin) in tx.inputs.iter().zip(&tx_undo.spent).rev() {
            overlay
                .add_coin(input.prevout, coin.clone())
                .map_err(|_| ConsensusError::UncleanDisconnect)?;
        }
    }
    Ok(overlay.take_changes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CoinBatch, CoinStore, MemoryCoinStore};
    use crate::error::ScriptError;
    use crate::pow::check_proof_of_work;

    const OP_TRUE: u8 = 0x51;

    fn params() -> ChainParams {
        ChainParams::regtest()
    }

    fn coinbase(height: u64, value: Amount) -> Transaction {
        let mut script_sig = height.to_be_bytes().to_vec();
        script_sig.push(0x00);
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig,
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value, script_pubkey: vec![OP_TRUE] }],
            lock_time: 0,
        }
    }

    fn spend(prevouts: &[OutPoint], value: Amount) -> Transaction {
        Transaction {
            version: 1,
            inputs: prevouts
                .iter()
                .map(|prevout| TransactionInput {
                    prevout: *prevout,
                    script_sig: vec![],
                    sequence: SEQUENCE_FINAL,
                })
                .collect(),
            outputs: vec![TransactionOutput { value, script_pubkey: vec![OP_TRUE] }],
            lock_time: 0,
        }
    }

    fn make_block(transactions: Vec<Transaction>) -> Block {
        let txids: Vec<Hash> = transactions.iter().map(Transaction::txid).collect();
        let mut block = Block {
            header: BlockHeader {
                prev_block_hash: [0; 32],
                merkle_root: compute_merkle_root(&txids).0,
                timestamp: 1_735_689_700,
                bits: REGTEST_MAX_TARGET,
                nonce: 0,
                version: 1,
            },
            transactions,
        };
        while check_proof_of_work(&block.header.hash(), block.header.bits, &params()).is_err() {
            block.header.nonce += 1;
        }
        block
    }

    fn funded_store(outpoints: &[(OutPoint, Amount)], height: u64) -> MemoryCoinStore {
        let store = MemoryCoinStore::new();
        let writes = outpoints
            .iter()
            .map(|(outpoint, value)| {
                let output = TransactionOutput { value: *value, script_pubkey: vec![OP_TRUE] };
                (*outpoint, Some(Coin::new(output, height, false)))
            })
            .collect();
        store.write_batch(&CoinBatch { writes, best_block: [0; 32] }).unwrap();
        store
    }

    fn flat_mtp(_: u64) -> u64 {
        0
    }

    #[test]
    fn test_merkle_root_single() {
        let leaf = [7u8; 32];
        assert_eq!(compute_merkle_root(&[leaf]), (leaf, false));
    }

    #[test]
    fn test_merkle_root_odd_duplicates_last() {
        let (a, b, c) = ([1u8; 32], [2u8; 32], [3u8; 32]);
        let (odd, mutated) = compute_merkle_root(&[a, b, c]);
        assert!(!mutated);
        let (even, mutated) = compute_merkle_root(&[a, b, c, c]);
        assert!(mutated);
        assert_eq!(odd, even);
    }

    #[test]
    fn test_check_block_accepts_well_formed() {
        let block = make_block(vec![coinbase(1, 50)]);
        assert!(check_block(&block, &params()).is_ok());
    }

    #[test]
    fn test_check_block_bad_merkle_root() {
        let mut block = make_block(vec![coinbase(1, 50)]);
        block.transactions[0].outputs[0].value = 49;
        assert_eq!(check_block(&block, &params()), Err(ConsensusError::BadMerkleRoot));
    }

    #[test]
    fn test_check_block_duplicate_transactions() {
        let first = spend(&[OutPoint::new([1; 32], 0)], 1);
        let tx = spend(&[OutPoint::new([2; 32], 0)], 1);
        let block = make_block(vec![coinbase(1, 50), first, tx.clone(), tx]);
        assert_eq!(check_block(&block, &params()), Err(ConsensusError::DuplicateTransaction));
    }

    #[test]
    fn test_check_block_rejects_overweight() {
        let mut heavy = spend(&[OutPoint::new([1; 32], 0)], 1);
        heavy.outputs[0].script_pubkey = vec![OP_TRUE; MAX_BLOCK_SERIALIZED_SIZE];
        let block = make_block(vec![coinbase(1, 50), heavy]);
        let weight = block_weight(&block);
        assert!(weight > MAX_BLOCK_WEIGHT);
        assert_eq!(
            check_block(&block, &params()),
            Err(ConsensusError::BlockWeight { weight, limit: MAX_BLOCK_WEIGHT })
        );
    }

    #[test]
    fn test_check_block_coinbase_position() {
        let block = make_block(vec![spend(&[OutPoint::new([1; 32], 0)], 1)]);
        assert_eq!(check_block(&block, &params()), Err(ConsensusError::MissingCoinbase));

        let block = make_block(vec![coinbase(1, 50), coinbase(2, 50)]);
        assert_eq!(
            check_block(&block, &params()),
            Err(ConsensusError::UnexpectedCoinbase.in_transaction(1))
        );
    }

    #[test]
    fn test_check_block_wraps_transaction_errors() {
        let block = make_block(vec![coinbase(1, 50), spend(&[OutPoint::new([1; 32], 0)], -5)]);
        let err = check_block(&block, &params()).unwrap_err();
        assert_eq!(err, ConsensusError::NegativeOutput { index: 0, value: -5 }.in_transaction(1));
    }

    #[test]
    fn test_check_block_rejects_high_hash() {
        let mut block = make_block(vec![coinbase(1, 50)]);
        while check_block_header(&block.header, &params()).is_ok() {
            block.header.nonce += 1;
        }
        assert_eq!(check_block(&block, &params()), Err(ConsensusError::HighHash));
    }

    #[test]
    fn test_contextual_header_checks() {
        let header = make_block(vec![coinbase(1, 50)]).header;
        let time = header.timestamp as u64;
        let ctx = HeaderContext { expected_bits: REGTEST_MAX_TARGET, median_time_past: time - 1, now: time };
        assert!(contextual_check_block_header(&header, &ctx, &params()).is_ok());

        let wrong_bits = HeaderContext { expected_bits: MAX_TARGET, ..ctx };
        assert!(matches!(
            contextual_check_block_header(&header, &wrong_bits, &params()),
            Err(ConsensusError::BadDifficultyBits { .. })
        ));
        let old = HeaderContext { median_time_past: time, ..ctx };
        assert!(matches!(
            contextual_check_block_header(&header, &old, &params()),
            Err(ConsensusError::TimeTooOld { .. })
        ));
        let early_clock = HeaderContext { now: time - MAX_FUTURE_BLOCK_TIME - 1, ..ctx };
        assert!(matches!(
            contextual_check_block_header(&header, &early_clock, &params()),
            Err(ConsensusError::TimeTooNew { .. })
        ));
        let edge_clock = HeaderContext { now: time - MAX_FUTURE_BLOCK_TIME, ..ctx };
        assert!(contextual_check_block_header(&header, &edge_clock, &params()).is_ok());
    }

    #[test]
    fn test_contextual_check_block_finality() {
        let mut tx = spend(&[OutPoint::new([1; 32], 0)], 1);
        tx.lock_time = 10;
        tx.inputs[0].sequence = 0;
        let block = make_block(vec![coinbase(10, 50), tx]);
        assert_eq!(
            contextual_check_block(&block, 10, 0),
            Err(ConsensusError::NonFinal.in_transaction(1))
        );
        assert!(contextual_check_block(&block, 11, 0).is_ok());
    }

    #[test]
    fn test_connect_collects_fees_and_undo() {
        let funding = OutPoint::new([1; 32], 0);
        let store = funded_store(&[(funding, 1_000)], 1);
        let base: &dyn CoinStore = &store;
        let subsidy = get_block_subsidy(2, &params());
        let block = make_block(vec![coinbase(2, subsidy + 100), spend(&[funding], 900)]);
        let ctx = ConnectContext::new(2, 0, &params(), &flat_mtp);

        let connected = connect_block(&block, base, &ctx).unwrap();
        assert_eq!(connected.fees, 100);
        assert_eq!(connected.undo.txs.len(), 1);
        assert_eq!(connected.undo.txs[0].spent[0].value(), 1_000);
        assert_eq!(connected.delta.spent().collect::<Vec<_>>(), vec![&funding]);
        assert_eq!(connected.delta.added().count(), 2);
        // Nothing reached the store
        assert!(store.read_coin(&funding).is_some());
    }

    #[test]
    fn test_connect_rejects_overpaying_coinbase() {
        let store = MemoryCoinStore::new();
        let base: &dyn CoinStore = &store;
        let subsidy = get_block_subsidy(1, &params());
        let block = make_block(vec![coinbase(1, subsidy + 1)]);
        let ctx = ConnectContext::new(1, 0, &params(), &flat_mtp);
        assert_eq!(
            connect_block(&block, base, &ctx),
            Err(ConsensusError::BadCoinbaseValue { claimed: subsidy + 1, allowed: subsidy })
        );
    }

    #[test]
    fn test_connect_rejects_double_spend_within_block() {
        let funding = OutPoint::new([1; 32], 0);
        let store = funded_store(&[(funding, 1_000)], 1);
        let base: &dyn CoinStore = &store;
        let mut second = spend(&[funding], 800);
        second.version = 2;
        let block = make_block(vec![coinbase(2, 0), spend(&[funding], 900), second]);
        let ctx = ConnectContext::new(2, 0, &params(), &flat_mtp);
        assert_eq!(
            connect_block(&block, base, &ctx),
            Err(ConsensusError::MissingOrSpentInput { index: 0 }.in_transaction(2))
        );
    }

    #[test]
    fn test_connect_allows_chained_spends_in_order() {
        let funding = OutPoint::new([1; 32], 0);
        let store = funded_store(&[(funding, 1_000)], 1);
        let base: &dyn CoinStore = &store;
        let parent = spend(&[funding], 900);
        let child = spend(&[OutPoint::new(parent.txid(), 0)], 800);
        let ctx = ConnectContext::new(2, 0, &params(), &flat_mtp);

        let block = make_block(vec![coinbase(2, 0), parent.clone(), child.clone()]);
        assert_eq!(connect_block(&block, base, &ctx).unwrap().fees, 200);

        let reversed = make_block(vec![coinbase(2, 0), child, parent]);
        assert_eq!(
            connect_block(&reversed, base, &ctx),
            Err(ConsensusError::MissingOrSpentInput { index: 0 }.in_transaction(1))
        );
    }

    #[test]
    fn test_connect_reports_first_script_failure_with_pool() {
        let funding: Vec<OutPoint> = (1..=6u8).map(|n| OutPoint::new([n; 32], 0)).collect();
        let spendable = funded_store(&funding.iter().map(|o| (*o, 10)).collect::<Vec<_>>(), 1);
        // Coins 2 and 4 are locked by a script that leaves false on the stack
        let failing = MemoryCoinStore::new();
        let writes = funding
            .iter()
            .enumerate()
            .map(|(i, outpoint)| {
                let script = if i == 2 || i == 4 { vec![0x00] } else { vec![OP_TRUE] };
                let output = TransactionOutput { value: 10, script_pubkey: script };
                (*outpoint, Some(Coin::new(output, 1, false)))
            })
            .collect();
        failing.write_batch(&CoinBatch { writes, best_block: [0; 32] }).unwrap();

        let mut txs = vec![coinbase(2, 0)];
        txs.extend(funding.iter().map(|outpoint| spend(&[*outpoint], 10)));
        let block = make_block(txs);
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        let ctx = ConnectContext::new(2, 0, &params(), &flat_mtp).with_pool(&pool);

        let failing_base: &dyn CoinStore = &failing;
        for _ in 0..10 {
            assert_eq!(
                connect_block(&block, failing_base, &ctx),
                Err(ConsensusError::Script { input_index: 0, source: ScriptError::EvalFalse }
                    .in_transaction(3))
            );
        }
        let base: &dyn CoinStore = &spendable;
        assert!(connect_block(&block, base, &ctx).is_ok());
    }

    #[test]
    fn test_connect_enforces_maturity() {
        let cb = coinbase(1, 50);
        let funding = OutPoint::new(cb.txid(), 0);
        let store = MemoryCoinStore::new();
        let output = cb.outputs[0].clone();
        store
            .write_batch(&CoinBatch {
                writes: vec![(funding, Some(Coin::new(output, 1, true)))],
                best_block: [0; 32],
            })
            .unwrap();
        let base: &dyn CoinStore = &store;
        let block = make_block(vec![coinbase(100, 0), spend(&[funding], 50)]);

        let ctx = ConnectContext::new(100, 0, &params(), &flat_mtp);
        assert_eq!(
            connect_block(&block, base, &ctx),
            Err(ConsensusError::PrematureCoinbaseSpend { index: 0, depth: 99, required: 100 }
                .in_transaction(1))
        );
        let ctx = ConnectContext::new(101, 0, &params(), &flat_mtp);
        assert!(connect_block(&block, base, &ctx).is_ok());
    }

    #[test]
    fn test_connect_enforces_sequence_locks() {
        let funding = OutPoint::new([1; 32], 0);
        let store = funded_store(&[(funding, 1_000)], 10);
        let base: &dyn CoinStore = &store;
        let mut tx = spend(&[funding], 900);
        tx.version = 2;
        tx.inputs[0].sequence = 5;
        let block = make_block(vec![coinbase(14, 0), tx]);

        let ctx = ConnectContext::new(14, 0, &params(), &flat_mtp);
        assert_eq!(
            connect_block(&block, base, &ctx),
            Err(ConsensusError::SequenceLockNotSatisfied.in_transaction(1))
        );
        let ctx = ConnectContext::new(15, 0, &params(), &flat_mtp);
        assert!(connect_block(&block, base, &ctx).is_ok());
    }

    #[test]
    fn test_disconnect_restores_previous_state() {
        let funding = OutPoint::new([1; 32], 0);
        let store = funded_store(&[(funding, 1_000)], 1);
        let before = store.snapshot();
        let base: &dyn CoinStore = &store;
        let block = make_block(vec![coinbase(2, 100), spend(&[funding], 900)]);
        let ctx = ConnectContext::new(2, 0, &params(), &flat_mtp);

        let connected = connect_block(&block, base, &ctx).unwrap();
        store.write_batch(&connected.delta.into_batch(block.hash())).unwrap();
        assert!(store.read_coin(&funding).is_none());

        let delta = disconnect_block(&block, &connected.undo, base, 2).unwrap();
        store.write_batch(&delta.into_batch([0; 32])).unwrap();
        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn test_disconnect_detects_inconsistent_undo() {
        let store = MemoryCoinStore::new();
        let base: &dyn CoinStore = &store;
        let block = make_block(vec![coinbase(2, 100), spend(&[OutPoint::new([1; 32], 0)], 900)]);
        // Outputs were never created in this view
        assert_eq!(
            disconnect_block(&block, &BlockUndo { txs: vec![TxUndo::default()] }, base, 2),
            Err(ConsensusError::UncleanDisconnect)
        );
        assert_eq!(
            disconnect_block(&block, &BlockUndo::default(), base, 2),
            Err(ConsensusError::UncleanDisconnect)
        );
    }
}
