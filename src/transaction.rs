//! Transaction validation

use crate::coins::CoinsView;
use crate::constants::*;
use crate::economic::money_range;
use crate::error::{ConsensusError, Result, ScriptError};
use crate::script::{self, ScriptFlags, TransactionSignatureChecker};
use crate::types::*;
use std::collections::HashSet;

/// CheckTransaction: context-free structural validity
///
/// 1. at least one input and one output
/// 2. serialized size within the block size limit
/// 3. every output and the running total within [0, MAX_MONEY]
/// 4. no outpoint spent twice
/// 5. coinbase script length in [2, 100]; other inputs never reference the null outpoint
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    if tx.inputs.is_empty() {
        return Err(ConsensusError::NoInputs);
    }
    if tx.outputs.is_empty() {
        return Err(ConsensusError::NoOutputs);
    }
    let size = tx.serialized_size();
    if size > MAX_BLOCK_SERIALIZED_SIZE {
        return Err(ConsensusError::OversizeTransaction { size, limit: MAX_BLOCK_SERIALIZED_SIZE });
    }

    let mut total: Amount = 0;
    for (index, output) in tx.outputs.iter().enumerate() {
        if output.value < 0 {
            return Err(ConsensusError::NegativeOutput { index, value: output.value });
        }
        if output.value > MAX_MONEY {
            return Err(ConsensusError::OutputTooLarge { index, value: output.value });
        }
        total += output.value;
        if !money_range(total) {
            return Err(ConsensusError::OutputTotalTooLarge);
        }
    }

    let mut seen = HashSet::with_capacity(tx.inputs.len());
    for (index, input) in tx.inputs.iter().enumerate() {
        if !seen.insert(input.prevout) {
            return Err(ConsensusError::DuplicateInput { index });
        }
    }

    if tx.is_coinbase() {
        let len = tx.inputs[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_SIZE..=MAX_COINBASE_SCRIPT_SIZE).contains(&len) {
            return Err(ConsensusError::BadCoinbaseLength(len));
        }
    } else {
        for (index, input) in tx.inputs.iter().enumerate() {
            if input.prevout.is_null() {
                return Err(ConsensusError::NullPrevout { index });
            }
        }
    }
    Ok(())
}

/// Look up the coin spent by every input
pub fn resolve_inputs<V: CoinsView + ?Sized>(tx: &Transaction, view: &V) -> Result<Vec<Coin>> {
    tx.inputs
        .iter()
        .enumerate()
        .map(|(index, input)| {
            view.get_coin(&input.prevout)
                .ok_or(ConsensusError::MissingOrSpentInput { index })
        })
        .collect()
}

/// CheckTxInputs: value conservation and coinbase maturity, returning the fee.
/// `coins[i]` is the coin spent by input `i`.
pub fn check_tx_inputs(
    tx: &Transaction,
    coins: &[Coin],
    spend_height: u64,
    coinbase_maturity: u64,
) -> Result<Amount> {
    let mut value_in: Amount = 0;
    for (index, coin) in coins.iter().enumerate() {
        if coin.is_coinbase {
            let depth = spend_height.saturating_sub(coin.height);
            if depth < coinbase_maturity {
                return Err(ConsensusError::PrematureCoinbaseSpend {
                    index,
                    depth,
                    required: coinbase_maturity,
                });
            }
        }
        value_in = value_in
            .checked_add(coin.value())
            .filter(|v| money_range(*v) && money_range(coin.value()))
            .ok_or(ConsensusError::InputValueOutOfRange)?;
    }

    let value_out = tx.total_output_value().ok_or(ConsensusError::OutputTotalTooLarge)?;
    if value_in < value_out {
        return Err(ConsensusError::InputsBelowOutputs { input: value_in, output: value_out });
    }
    Ok(value_in - value_out)
}

/// Legacy signature operations in every script of `tx`
pub fn legacy_sigop_count(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .inputs
        .iter()
        .map(|input| script::count_sigops(&input.script_sig, false))
        .sum();
    let outputs: usize = tx
        .outputs
        .iter()
        .map(|output| script::count_sigops(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

/// Signature operations hidden in P2SH redeem scripts
pub fn p2sh_sigop_count(tx: &Transaction, coins: &[Coin]) -> usize {
    if tx.is_coinbase() {
        return 0;
    }
    tx.inputs
        .iter()
        .zip(coins)
        .map(|(input, coin)| script::p2sh_sigop_count(&input.script_sig, coin.script_pubkey()))
        .sum()
}

/// Weighted signature operation cost of `tx`
pub fn sigop_cost(tx: &Transaction, coins: &[Coin], flags: ScriptFlags) -> usize {
    let mut cost = legacy_sigop_count(tx) * WITNESS_SCALE_FACTOR;
    if flags.contains(ScriptFlags::P2SH) {
        cost += p2sh_sigop_count(tx, coins) * WITNESS_SCALE_FACTOR;
    }
    cost
}

/// Run the unlocking script of input `index` against the coin it spends
pub fn verify_input_script(
    tx: &Transaction,
    index: usize,
    coin: &Coin,
    flags: ScriptFlags,
) -> std::result::Result<(), ScriptError> {
    let checker = TransactionSignatureChecker::new(tx, index);
    script::verify_script(&tx.inputs[index].script_sig, coin.script_pubkey(), flags, &checker)
}

/// Verify every input script in order, stopping at the first failure
pub fn check_input_scripts(tx: &Transaction, coins: &[Coin], flags: ScriptFlags) -> Result<()> {
    for (input_index, coin) in coins.iter().enumerate() {
        verify_input_script(tx, input_index, coin, flags)
            .map_err(|source| ConsensusError::Script { input_index, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coins::{CoinStore, CoinsViewCache, MemoryCoinStore};

    fn spend(prevouts: &[OutPoint], values: &[Amount]) -> Transaction {
        Transaction {
            version: 1,
            inputs: prevouts
                .iter()
                .map(|prevout| TransactionInput {
                    prevout: *prevout,
                    script_sig: vec![0x51],
                    sequence: SEQUENCE_FINAL,
                })
                .collect(),
            outputs: values
                .iter()
                .map(|&value| TransactionOutput { value, script_pubkey: vec![0x51] })
                .collect(),
            lock_time: 0,
        }
    }

    fn coinbase(script_len: usize) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: vec![0x01; script_len],
                sequence: SEQUENCE_FINAL,
            }],
            outputs: vec![TransactionOutput { value: 50, script_pubkey: vec![0x51] }],
            lock_time: 0,
        }
    }

    fn coin(value: Amount, height: u64, is_coinbase: bool) -> Coin {
        Coin::new(TransactionOutput { value, script_pubkey: vec![0x51] }, height, is_coinbase)
    }

    #[test]
    fn test_check_transaction_valid() {
        assert!(check_transaction(&spend(&[OutPoint::new([1; 32], 0)], &[1000])).is_ok());
    }

    #[test]
    fn test_check_transaction_empty() {
        assert_eq!(check_transaction(&spend(&[], &[1])), Err(ConsensusError::NoInputs));
        assert_eq!(
            check_transaction(&spend(&[OutPoint::new([1; 32], 0)], &[])),
            Err(ConsensusError::NoOutputs)
        );
    }

    #[test]
    fn test_check_transaction_output_values() {
        let prevout = [OutPoint::new([1; 32], 0)];
        assert_eq!(
            check_transaction(&spend(&prevout, &[-1])),
            Err(ConsensusError::NegativeOutput { index: 0, value: -1 })
        );
        assert_eq!(
            check_transaction(&spend(&prevout, &[1, MAX_MONEY + 1])),
            Err(ConsensusError::OutputTooLarge { index: 1, value: MAX_MONEY + 1 })
        );
        assert_eq!(
            check_transaction(&spend(&prevout, &[MAX_MONEY, 1])),
            Err(ConsensusError::OutputTotalTooLarge)
        );
        assert!(check_transaction(&spend(&prevout, &[MAX_MONEY])).is_ok());
    }

    #[test]
    fn test_check_transaction_duplicate_inputs() {
        let prevout = OutPoint::new([1; 32], 0);
        assert_eq!(
            check_transaction(&spend(&[prevout, prevout], &[1])),
            Err(ConsensusError::DuplicateInput { index: 1 })
        );
    }

    #[test]
    fn test_check_transaction_null_prevout() {
        let tx = spend(&[OutPoint::new([1; 32], 0), OutPoint::null()], &[1]);
        assert_eq!(check_transaction(&tx), Err(ConsensusError::NullPrevout { index: 1 }));
    }

    #[test]
    fn test_coinbase_script_length() {
        assert!(check_transaction(&coinbase(2)).is_ok());
        assert!(check_transaction(&coinbase(100)).is_ok());
        assert_eq!(check_transaction(&coinbase(1)), Err(ConsensusError::BadCoinbaseLength(1)));
        assert_eq!(check_transaction(&coinbase(101)), Err(ConsensusError::BadCoinbaseLength(101)));
    }

    #[test]
    fn test_oversize_transaction() {
        let mut tx = spend(&[OutPoint::new([1; 32], 0)], &[1]);
        tx.outputs[0].script_pubkey = vec![0; MAX_BLOCK_SERIALIZED_SIZE];
        assert!(matches!(
            check_transaction(&tx),
            Err(ConsensusError::OversizeTransaction { .. })
        ));
    }

    #[test]
    fn test_check_tx_inputs_fee() {
        let tx = spend(&[OutPoint::new([1; 32], 0), OutPoint::new([2; 32], 0)], &[70]);
        let coins = [coin(50, 1, false), coin(30, 1, false)];
        assert_eq!(check_tx_inputs(&tx, &coins, 10, 100), Ok(10));
    }

    #[test]
    fn test_check_tx_inputs_overspend() {
        let tx = spend(&[OutPoint::new([1; 32], 0)], &[101]);
        assert_eq!(
            check_tx_inputs(&tx, &[coin(100, 1, false)], 10, 100),
            Err(ConsensusError::InputsBelowOutputs { input: 100, output: 101 })
        );
    }

    #[test]
    fn test_coinbase_maturity_boundary() {
        let tx = spend(&[OutPoint::new([1; 32], 0)], &[10]);
        let coins = [coin(50, 5, true)];
        assert_eq!(
            check_tx_inputs(&tx, &coins, 104, 100),
            Err(ConsensusError::PrematureCoinbaseSpend { index: 0, depth: 99, required: 100 })
        );
        assert_eq!(check_tx_inputs(&tx, &coins, 105, 100), Ok(40));
    }

    #[test]
    fn test_input_value_out_of_range() {
        let tx = spend(&[OutPoint::new([1; 32], 0), OutPoint::new([2; 32], 0)], &[1]);
        let coins = [coin(MAX_MONEY, 1, false), coin(1, 1, false)];
        assert_eq!(
            check_tx_inputs(&tx, &coins, 10, 100),
            Err(ConsensusError::InputValueOutOfRange)
        );
    }

    #[test]
    fn test_resolve_inputs_reports_missing_index() {
        let store = MemoryCoinStore::new();
        let base: &dyn CoinStore = &store;
        let mut view = CoinsViewCache::new(base);
        view.add_coin(OutPoint::new([1; 32], 0), coin(5, 1, false)).unwrap();
        let tx = spend(&[OutPoint::new([1; 32], 0), OutPoint::new([2; 32], 0)], &[1]);
        assert_eq!(
            resolve_inputs(&tx, &view),
            Err(ConsensusError::MissingOrSpentInput { index: 1 })
        );
    }

    #[test]
    fn test_sigop_cost() {
        let mut tx = spend(&[OutPoint::new([1; 32], 0)], &[1]);
        tx.outputs[0].script_pubkey = script::p2pkh_script(&[0; 20]);
        assert_eq!(legacy_sigop_count(&tx), 1);
        assert_eq!(sigop_cost(&tx, &[coin(5, 1, false)], ScriptFlags::P2SH), 4);
    }

    #[test]
    fn test_check_input_scripts_reports_input() {
        let tx = spend(&[OutPoint::new([1; 32], 0), OutPoint::new([2; 32], 0)], &[1]);
        let failing = Coin::new(TransactionOutput { value: 5, script_pubkey: vec![0x00] }, 1, false);
        let err = check_input_scripts(&tx, &[coin(5, 1, false), failing], ScriptFlags::empty());
        assert_eq!(
            err,
            Err(ConsensusError::Script { input_index: 1, source: ScriptError::EvalFalse })
        );
    }
}
