//! Relay policy: standard script templates, dust and fee arithmetic
//!
//! Nothing here affects block validity. A transaction that fails these
//! checks is still valid in a block; this node just does not relay it.

use crate::config::MempoolPolicy;
use crate::constants::*;
use crate::error::PolicyError;
use crate::script::opcodes::*;
use crate::script::{self, is_p2sh, is_push_only, read_instruction};
use crate::serialization::compact_size_len;
use crate::types::*;
use std::cmp::Ordering;

/// Redeem scripts may not carry more signature operations than this
pub const MAX_P2SH_SIGOPS: usize = 15;

/// Keys allowed in a standard bare multisig output
pub const MAX_STANDARD_MULTISIG_KEYS: usize = 3;

/// Size of a typical input spending an output, used for the dust threshold
const SPEND_INPUT_SIZE: usize = 32 + 4 + 1 + 107 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptTemplate {
    PubkeyHash,
    ScriptHash,
    Pubkey,
    Multisig { required: usize, keys: usize },
    NullData,
    NonStandard,
}

fn small_int(opcode: u8) -> Option<usize> {
    (OP_1..=OP_16).contains(&opcode).then(|| (opcode - OP_1 + 1) as usize)
}

fn is_pubkey_len(len: usize) -> bool {
    len == 33 || len == 65
}

/// Solver: match a locking script against the standard templates
pub fn classify_script(script: &[u8]) -> ScriptTemplate {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        return ScriptTemplate::PubkeyHash;
    }
    if is_p2sh(script) {
        return ScriptTemplate::ScriptHash;
    }
    if script.first() == Some(&OP_RETURN) {
        if script.len() <= MAX_OP_RETURN_RELAY && is_push_only(&script[1..]) {
            return ScriptTemplate::NullData;
        }
        return ScriptTemplate::NonStandard;
    }
    if let Some(template) = match_pubkey(script) {
        return template;
    }
    match_multisig(script).unwrap_or(ScriptTemplate::NonStandard)
}

fn match_pubkey(script: &[u8]) -> Option<ScriptTemplate> {
    let (&last, body) = script.split_last()?;
    let key_len = *body.first()? as usize;
    (last == OP_CHECKSIG && is_pubkey_len(key_len) && body.len() == key_len + 1)
        .then_some(ScriptTemplate::Pubkey)
}

fn match_multisig(script: &[u8]) -> Option<ScriptTemplate> {
    let mut pc = 0;
    let mut ops = Vec::new();
    while pc < script.len() {
        ops.push(read_instruction(script, &mut pc).ok()?);
    }
    let (&(last, _), rest) = ops.split_last()?;
    let (&(first, _), rest) = rest.split_first()?;
    let (&(count_op, _), keys) = rest.split_last()?;
    if last != OP_CHECKMULTISIG {
        return None;
    }
    let required = small_int(first)?;
    let total = small_int(count_op)?;
    if total != keys.len() || required > total {
        return None;
    }
    keys.iter()
        .all(|(_, data)| data.map_or(false, |key| is_pubkey_len(key.len())))
        .then_some(ScriptTemplate::Multisig { required, keys: total })
}

/// GetFee: fee owed for `size` bytes at `rate` satoshis per 1000 bytes
pub fn fee_for_size(rate: Amount, size: usize) -> Amount {
    let fee = rate.saturating_mul(size as i64) / 1000;
    if fee == 0 && size > 0 && rate > 0 {
        return 1;
    }
    fee
}

/// Compare two fee rates given as (fee, size) without dividing
pub fn compare_fee_rates(fee_a: Amount, size_a: usize, fee_b: Amount, size_b: usize) -> Ordering {
    (fee_a as i128 * size_b as i128).cmp(&(fee_b as i128 * size_a as i128))
}

/// Outputs worth less than the fee to spend them at the dust rate
pub fn dust_threshold(output: &TransactionOutput, dust_relay_fee_rate: Amount) -> Amount {
    if output.is_unspendable() {
        return 0;
    }
    let output_size = 8 + compact_size_len(output.script_pubkey.len() as u64) + output.script_pubkey.len();
    fee_for_size(dust_relay_fee_rate, output_size + SPEND_INPUT_SIZE)
}

pub fn is_dust(output: &TransactionOutput, dust_relay_fee_rate: Amount) -> bool {
    output.value < dust_threshold(output, dust_relay_fee_rate)
}

/// IsStandardTx: shape checks that need no inputs
pub fn check_standard_tx(tx: &Transaction, policy: &MempoolPolicy) -> Result<(), PolicyError> {
    if !(1..=2).contains(&tx.version) {
        return Err(PolicyError::NonStandard("version"));
    }
    if tx.serialized_size() > MAX_STANDARD_TX_SIZE {
        return Err(PolicyError::NonStandard("tx-size"));
    }
    for input in &tx.inputs {
        if input.script_sig.len() > MAX_STANDARD_SCRIPTSIG_SIZE {
            return Err(PolicyError::NonStandard("scriptsig-size"));
        }
        if !is_push_only(&input.script_sig) {
            return Err(PolicyError::NonStandard("scriptsig-not-pushonly"));
        }
    }

    let mut null_data = 0;
    for output in &tx.outputs {
        match classify_script(&output.script_pubkey) {
            ScriptTemplate::NonStandard => return Err(PolicyError::NonStandard("scriptpubkey")),
            ScriptTemplate::NullData => null_data += 1,
            ScriptTemplate::Multisig { required, keys } => {
                if !policy.permit_bare_multisig {
                    return Err(PolicyError::NonStandard("bare-multisig"));
                }
                if required == 0 || keys > MAX_STANDARD_MULTISIG_KEYS {
                    return Err(PolicyError::NonStandard("scriptpubkey"));
                }
            }
            _ => {}
        }
        if is_dust(output, policy.dust_relay_fee_rate) {
            return Err(PolicyError::NonStandard("dust"));
        }
    }
    if null_data > 1 {
        return Err(PolicyError::NonStandard("multi-op-return"));
    }
    Ok(())
}

/// AreInputsStandard: every spent output is a known template and P2SH
/// redeem scripts stay within the signature operation allowance
pub fn check_standard_inputs(tx: &Transaction, coins: &[Coin]) -> Result<(), PolicyError> {
    for (input, coin) in tx.inputs.iter().zip(coins) {
        match classify_script(coin.script_pubkey()) {
            ScriptTemplate::NonStandard | ScriptTemplate::NullData => {
                return Err(PolicyError::NonStandard("bad-txns-nonstandard-inputs"));
            }
            ScriptTemplate::ScriptHash => {
                if script::p2sh_sigop_count(&input.script_sig, coin.script_pubkey()) > MAX_P2SH_SIGOPS {
                    return Err(PolicyError::NonStandard("bad-txns-nonstandard-inputs"));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::{p2pkh_script, p2sh_script, Builder};

    fn output(value: Amount, script_pubkey: ByteString) -> TransactionOutput {
        TransactionOutput { value, script_pubkey }
    }

    fn tx_with_outputs(outputs: Vec<TransactionOutput>) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::new([1; 32], 0),
                script_sig: Builder::new().push_slice(&[7; 72]).into_script(),
                sequence: SEQUENCE_FINAL,
            }],
            outputs,
            lock_time: 0,
        }
    }

    fn multisig(required: i64, keys: usize) -> ByteString {
        let mut builder = Builder::new().push_int(required);
        for i in 0..keys {
            builder = builder.push_slice(&[2 + i as u8; 33]);
        }
        builder.push_int(keys as i64).push_opcode(OP_CHECKMULTISIG).into_script()
    }

    #[test]
    fn test_classify_templates() {
        assert_eq!(classify_script(&p2pkh_script(&[1; 20])), ScriptTemplate::PubkeyHash);
        assert_eq!(classify_script(&p2sh_script(&[1; 20])), ScriptTemplate::ScriptHash);
        let p2pk = Builder::new().push_slice(&[2; 33]).push_opcode(OP_CHECKSIG).into_script();
        assert_eq!(classify_script(&p2pk), ScriptTemplate::Pubkey);
        assert_eq!(
            classify_script(&multisig(2, 3)),
            ScriptTemplate::Multisig { required: 2, keys: 3 }
        );
        let null_data = Builder::new().push_opcode(OP_RETURN).push_slice(b"hello").into_script();
        assert_eq!(classify_script(&null_data), ScriptTemplate::NullData);
        assert_eq!(classify_script(&[OP_1]), ScriptTemplate::NonStandard);
        assert_eq!(classify_script(&multisig(3, 2)), ScriptTemplate::NonStandard);
    }

    #[test]
    fn test_oversized_null_data_is_nonstandard() {
        let script = Builder::new().push_opcode(OP_RETURN).push_slice(&[0; 81]).into_script();
        assert!(script.len() > MAX_OP_RETURN_RELAY);
        assert_eq!(classify_script(&script), ScriptTemplate::NonStandard);
    }

    #[test]
    fn test_fee_for_size_rounds_up_to_one() {
        assert_eq!(fee_for_size(1000, 250), 250);
        assert_eq!(fee_for_size(1, 10), 1);
        assert_eq!(fee_for_size(0, 10), 0);
    }

    #[test]
    fn test_dust_threshold_for_p2pkh() {
        let out = output(0, p2pkh_script(&[1; 20]));
        // 34 byte output plus 148 byte input at 3 sat/byte
        assert_eq!(dust_threshold(&out, DUST_RELAY_TX_FEE), 546);
        assert!(is_dust(&output(545, p2pkh_script(&[1; 20])), DUST_RELAY_TX_FEE));
        assert!(!is_dust(&output(546, p2pkh_script(&[1; 20])), DUST_RELAY_TX_FEE));
    }

    #[test]
    fn test_standard_tx_rules() {
        let policy = MempoolPolicy::default();
        let good = tx_with_outputs(vec![output(10_000, p2pkh_script(&[1; 20]))]);
        assert!(check_standard_tx(&good, &policy).is_ok());

        let mut bad_version = good.clone();
        bad_version.version = 3;
        assert_eq!(check_standard_tx(&bad_version, &policy), Err(PolicyError::NonStandard("version")));

        let dust = tx_with_outputs(vec![output(1, p2pkh_script(&[1; 20]))]);
        assert_eq!(check_standard_tx(&dust, &policy), Err(PolicyError::NonStandard("dust")));

        let mut not_push = good.clone();
        not_push.inputs[0].script_sig = vec![OP_DUP];
        assert_eq!(
            check_standard_tx(&not_push, &policy),
            Err(PolicyError::NonStandard("scriptsig-not-pushonly"))
        );

        let wide = tx_with_outputs(vec![output(10_000, multisig(1, 4))]);
        assert!(check_standard_tx(&wide, &policy).is_err());

        let strict = MempoolPolicy { permit_bare_multisig: false, ..MempoolPolicy::default() };
        let bare = tx_with_outputs(vec![output(10_000, multisig(1, 2))]);
        assert!(check_standard_tx(&bare, &policy).is_ok());
        assert_eq!(check_standard_tx(&bare, &strict), Err(PolicyError::NonStandard("bare-multisig")));
    }

    #[test]
    fn test_nonstandard_inputs() {
        let tx = tx_with_outputs(vec![output(10_000, p2pkh_script(&[1; 20]))]);
        let standard = Coin::new(output(20_000, p2pkh_script(&[2; 20])), 1, false);
        assert!(check_standard_inputs(&tx, &[standard]).is_ok());
        let odd = Coin::new(output(20_000, vec![OP_1]), 1, false);
        assert!(check_standard_inputs(&tx, &[odd]).is_err());
    }
}
