//! Core BitsCoin types for consensus validation

use crate::constants::*;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hash type: 256-bit hash
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Amount in satoshis
pub type Amount = i64;

/// Render a hash for logs and error messages
pub fn hash_hex(hash: &Hash) -> String {
    hex::encode(hash)
}

/// OutPoint: reference to output `index` of transaction `hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    pub fn new(hash: Hash, index: u32) -> Self {
        Self { hash, index }
    }

    /// The outpoint carried by a coinbase input
    pub fn null() -> Self {
        Self { hash: [0u8; 32], index: u32::MAX }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hash_hex(&self.hash), self.index)
    }
}

/// Transaction input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

/// Transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

impl TransactionOutput {
    /// Outputs that can never be spent are kept out of the UTXO set
    pub fn is_unspendable(&self) -> bool {
        self.script_pubkey.first() == Some(&0x6a) || self.script_pubkey.len() > MAX_SCRIPT_SIZE
    }
}

/// Transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input spending the null outpoint
    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].prevout.is_null()
    }

    /// Sum of output values, `None` on overflow
    pub fn total_output_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0i64, |acc, output| acc.checked_add(output.value))
    }

    /// Opt-in replace-by-fee signal
    pub fn signals_rbf(&self) -> bool {
        self.inputs
            .iter()
            .any(|input| input.sequence <= MAX_BIP125_RBF_SEQUENCE)
    }
}

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    pub version: i32,
}

/// Block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Coin: an unspent output together with the context it was created in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub output: TransactionOutput,
    pub height: u64,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn new(output: TransactionOutput, height: u64, is_coinbase: bool) -> Self {
        Self { output, height, is_coinbase }
    }

    pub fn value(&self) -> Amount {
        self.output.value
    }

    pub fn script_pubkey(&self) -> &ByteString {
        &self.output.script_pubkey
    }
}

/// Undo data for one transaction: the coins its inputs consumed, in input order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Undo data for one block, one entry per non-coinbase transaction in block order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}
