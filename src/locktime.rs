//! Absolute and relative lock times

use crate::constants::*;
use crate::types::*;

/// IsFinalTx: whether `tx` may be included in a block at `block_height`
/// whose lock-time reference is `block_time` (the previous median time past)
pub fn is_final_tx(tx: &Transaction, block_height: u64, block_time: u64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let lock_time = tx.lock_time as u64;
    let reference = if tx.lock_time < LOCKTIME_THRESHOLD {
        block_height
    } else {
        block_time
    };
    if lock_time < reference {
        return true;
    }
    // Lock time is ignored when every input opts out
    tx.inputs.iter().all(|input| input.sequence == SEQUENCE_FINAL)
}

/// Median of the given timestamps (at most the last eleven are passed in)
pub fn median_time_past(timestamps: &[u32]) -> u64 {
    if timestamps.is_empty() {
        return 0;
    }
    let mut sorted = timestamps.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2] as u64
}

/// Earliest height and time at which a transaction's relative locks are
/// satisfied, expressed as the last *invalid* values (-1 means no constraint)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceLocks {
    pub min_height: i64,
    pub min_time: i64,
}

impl SequenceLocks {
    pub const NONE: SequenceLocks = SequenceLocks { min_height: -1, min_time: -1 };
}

/// CalculateSequenceLocks
///
/// `coin_heights[i]` is the height of the block that created the coin spent
/// by input `i`; `median_time_at(h)` returns the median time past of the
/// chain ending at height `h`.
pub fn calculate_sequence_locks<F>(
    tx: &Transaction,
    enforce: bool,
    coin_heights: &[u64],
    median_time_at: F,
) -> SequenceLocks
where
    F: Fn(u64) -> u64,
{
    let mut locks = SequenceLocks::NONE;
    if !enforce || tx.version < 2 || tx.is_coinbase() {
        return locks;
    }
    for (input, &coin_height) in tx.inputs.iter().zip(coin_heights) {
        if input.sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG != 0 {
            continue;
        }
        let value = (input.sequence & SEQUENCE_LOCKTIME_MASK) as i64;
        if input.sequence & SEQUENCE_LOCKTIME_TYPE_FLAG != 0 {
            let coin_time = median_time_at(coin_height.saturating_sub(1)) as i64;
            locks.min_time = locks
                .min_time
                .max(coin_time + (value << SEQUENCE_LOCKTIME_GRANULARITY) - 1);
        } else {
            locks.min_height = locks.min_height.max(coin_height as i64 + value - 1);
        }
    }
    locks
}

/// EvaluateSequenceLocks: satisfied for a block at `block_height` whose
/// predecessor has median time past `prev_median_time`
pub fn check_sequence_locks(locks: &SequenceLocks, block_height: u64, prev_median_time: u64) -> bool {
    locks.min_height < block_height as i64 && locks.min_time < prev_median_time as i64
}
