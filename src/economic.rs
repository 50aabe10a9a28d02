//! Monetary rules: block subsidy and money range

use crate::config::ChainParams;
use crate::constants::*;
use crate::types::*;

/// GetBlockSubsidy: ℕ → ℤ
///
/// Subsidy halves every `halving_interval` blocks and is zero after 64 halvings.
/// A zero interval pays nothing.
pub fn get_block_subsidy(height: u64, params: &ChainParams) -> Amount {
    let Some(halvings) = height.checked_div(params.halving_interval) else {
        return 0;
    };
    if halvings >= 64 {
        return 0;
    }
    params.initial_subsidy >> halvings
}

/// Total coins issued by subsidies for blocks `0..=height`
pub fn total_supply(height: u64, params: &ChainParams) -> Amount {
    let mut total = 0i64;
    let mut start = 0u64;
    while start <= height {
        let subsidy = get_block_subsidy(start, params);
        if subsidy == 0 {
            break;
        }
        let era_end = (start / params.halving_interval + 1) * params.halving_interval;
        let blocks = era_end.min(height + 1) - start;
        total = total.saturating_add(subsidy.saturating_mul(blocks as i64));
        start = era_end;
    }
    total
}

pub fn money_range(value: Amount) -> bool {
    (0..=MAX_MONEY).contains(&value)
}
