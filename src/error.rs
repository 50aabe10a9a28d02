//! Error types for consensus validation
//!
//! Consensus errors are permanent: every honest node rejects the object.
//! Policy errors are local and may clear up later. The two never mix; the
//! engine boundary carries both inside [`ValidationError`].

use crate::types::Amount;
use thiserror::Error;

/// Script interpreter failure reasons
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("script evaluated to false")]
    EvalFalse,
    #[error("OP_RETURN encountered")]
    OpReturn,
    #[error("script larger than {0} bytes")]
    ScriptSize(usize),
    #[error("push of {0} bytes exceeds element size limit")]
    PushSize(usize),
    #[error("operation limit exceeded")]
    OpCount,
    #[error("stack size limit exceeded")]
    StackSize,
    #[error("signature count out of range")]
    SigCount,
    #[error("public key count out of range")]
    PubkeyCount,
    #[error("OP_VERIFY failed")]
    Verify,
    #[error("OP_EQUALVERIFY failed")]
    EqualVerify,
    #[error("OP_CHECKMULTISIGVERIFY failed")]
    CheckMultisigVerify,
    #[error("OP_CHECKSIGVERIFY failed")]
    CheckSigVerify,
    #[error("OP_NUMEQUALVERIFY failed")]
    NumEqualVerify,
    #[error("bad opcode 0x{0:02x}")]
    BadOpcode(u8),
    #[error("disabled opcode 0x{0:02x}")]
    DisabledOpcode(u8),
    #[error("stack underflow")]
    InvalidStackOperation,
    #[error("alt stack underflow")]
    InvalidAltstackOperation,
    #[error("unbalanced conditional")]
    UnbalancedConditional,
    #[error("truncated push data")]
    BadPush,
    #[error("script number overflow or non-minimal encoding")]
    InvalidNumber,
    #[error("negative lock time")]
    NegativeLocktime,
    #[error("lock time requirement not satisfied")]
    UnsatisfiedLocktime,
    #[error("non-canonical signature hash type")]
    SigHashType,
    #[error("non-canonical DER signature")]
    SigDer,
    #[error("data push is not minimal")]
    MinimalData,
    #[error("unlocking script is not push-only")]
    SigPushOnly,
    #[error("signature S value is high")]
    SigHighS,
    #[error("CHECKMULTISIG dummy element not empty")]
    SigNullDummy,
    #[error("public key encoding not canonical")]
    PubkeyType,
    #[error("stack not clean after evaluation")]
    CleanStack,
    #[error("failing signature check with non-empty signature")]
    SigNullFail,
    #[error("upgradable NOP used")]
    DiscourageUpgradableNops,
}

/// Permanent rejection reasons for blocks and transactions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("malformed encoding: {0}")]
    Malformed(#[from] DecodeError),
    #[error("transaction has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("transaction size {size} exceeds {limit}")]
    OversizeTransaction { size: usize, limit: usize },
    #[error("output {index} has negative value {value}")]
    NegativeOutput { index: usize, value: Amount },
    #[error("output {index} value {value} exceeds the money supply")]
    OutputTooLarge { index: usize, value: Amount },
    #[error("total output value exceeds the money supply")]
    OutputTotalTooLarge,
    #[error("input {index} spends an outpoint already spent by this transaction")]
    DuplicateInput { index: usize },
    #[error("coinbase script length {0} out of range")]
    BadCoinbaseLength(usize),
    #[error("input {index} references the null outpoint")]
    NullPrevout { index: usize },
    #[error("input {index} spends a missing or spent output")]
    MissingOrSpentInput { index: usize },
    #[error("input {index} spends a coinbase at depth {depth}, below maturity {required}")]
    PrematureCoinbaseSpend { index: usize, depth: u64, required: u64 },
    #[error("input value {input} below output value {output}")]
    InputsBelowOutputs { input: Amount, output: Amount },
    #[error("input values out of range")]
    InputValueOutOfRange,
    #[error("transaction is not final")]
    NonFinal,
    #[error("transaction relative lock time not satisfied")]
    SequenceLockNotSatisfied,
    #[error("script verification failed on input {input_index}: {source}")]
    Script {
        input_index: usize,
        #[source]
        source: ScriptError,
    },
    #[error("output {0} already exists unspent")]
    DuplicateOutput(String),
    #[error("coinbase transaction outside of a block's first position")]
    UnexpectedCoinbase,
    #[error("high-hash: proof of work does not meet target")]
    HighHash,
    #[error("bad-diffbits: bits {actual:#010x}, expected {expected:#010x}")]
    BadDifficultyBits { actual: u32, expected: u32 },
    #[error("compact target {0:#010x} is negative, zero, overflowing or above the limit")]
    BadTarget(u32),
    #[error("block time {time} not after median time past {median}")]
    TimeTooOld { time: u64, median: u64 },
    #[error("block time {time} too far in the future (now {now})")]
    TimeTooNew { time: u64, now: u64 },
    #[error("block version {0} is obsolete")]
    BadVersion(i32),
    #[error("block has no transactions")]
    EmptyBlock,
    #[error("merkle root mismatch")]
    BadMerkleRoot,
    #[error("duplicate transaction in block")]
    DuplicateTransaction,
    #[error("block weight {weight} exceeds {limit}")]
    BlockWeight { weight: usize, limit: usize },
    #[error("signature operation cost {cost} exceeds {limit}")]
    TooManySigops { cost: usize, limit: usize },
    #[error("first transaction is not a coinbase")]
    MissingCoinbase,
    #[error("coinbase claims {claimed}, allowed subsidy plus fees is {allowed}")]
    BadCoinbaseValue { claimed: Amount, allowed: Amount },
    #[error("transaction {tx_index} invalid: {source}")]
    Transaction {
        tx_index: usize,
        #[source]
        source: Box<ConsensusError>,
    },
    #[error("fee total overflows")]
    FeeOverflow,
    #[error("block builds on an invalid parent")]
    BadPrevBlock,
    #[error("block is marked invalid")]
    KnownInvalid,
    #[error("block disconnect found inconsistent undo data")]
    UncleanDisconnect,
}

impl ConsensusError {
    /// Wrap a transaction-level failure with its position in the block
    pub fn in_transaction(self, tx_index: usize) -> Self {
        ConsensusError::Transaction { tx_index, source: Box::new(self) }
    }

    /// Innermost reason, skipping the block-position wrapper
    pub fn root(&self) -> &ConsensusError {
        match self {
            ConsensusError::Transaction { source, .. } => source.root(),
            other => other,
        }
    }

    /// Failures that a mutated copy of a valid block can produce. They say
    /// nothing about the header and must not mark it invalid.
    pub fn may_be_mutation(&self) -> bool {
        matches!(
            self,
            ConsensusError::BadMerkleRoot | ConsensusError::DuplicateTransaction
        )
    }
}

/// Mempool-only and transient rejection reasons
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("transaction already in mempool")]
    AlreadyInMempool,
    #[error("transaction already confirmed")]
    AlreadyConfirmed,
    #[error("missing inputs")]
    MissingInputs,
    #[error("coinbase transactions are not relayed")]
    Coinbase,
    #[error("non-standard transaction: {0}")]
    NonStandard(&'static str),
    #[error("non-standard script on input {input_index}: {source}")]
    NonStandardScript {
        input_index: usize,
        #[source]
        source: ScriptError,
    },
    #[error("transaction is not final for the next block")]
    NonFinal,
    #[error("relative lock time not satisfied for the next block")]
    NonBip68Final,
    #[error("fee {fee} below minimum {required}")]
    FeeTooLow { fee: Amount, required: Amount },
    #[error("too many unconfirmed ancestors ({count} > {limit})")]
    TooManyAncestors { count: usize, limit: usize },
    #[error("unconfirmed ancestor size {size} exceeds {limit}")]
    AncestorSizeTooLarge { size: usize, limit: usize },
    #[error("too many descendants for an unconfirmed ancestor ({count} > {limit})")]
    TooManyDescendants { count: usize, limit: usize },
    #[error("descendant size {size} exceeds {limit}")]
    DescendantSizeTooLarge { size: usize, limit: usize },
    #[error("conflicts with non-replaceable transaction")]
    ConflictNotReplaceable,
    #[error("replacement would evict {count} transactions, limit {limit}")]
    TooManyReplacements { count: usize, limit: usize },
    #[error("replacement fee {fee} does not exceed evicted fees {evicted}")]
    InsufficientReplacementFee { fee: Amount, evicted: Amount },
    #[error("replacement feerate does not exceed that of conflicting transaction")]
    InsufficientReplacementFeerate,
    #[error("replacement adds new unconfirmed input {input_index}")]
    ReplacementAddsUnconfirmed { input_index: usize },
    #[error("replacement spends an output of a transaction it replaces")]
    ReplacementSpendsConflict,
    #[error("mempool full")]
    MempoolFull,
}

/// Wire decoding failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("non-canonical compact size")]
    NonCanonicalCompactSize,
    #[error("length {0} exceeds maximum")]
    OversizedLength(u64),
    #[error("{0} trailing bytes")]
    TrailingBytes(usize),
    #[error("output value does not fit a signed amount")]
    ValueOutOfRange,
}

/// Engine-boundary failure: the single tagged result type handed to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("consensus: {0}")]
    Consensus(#[from] ConsensusError),
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl ValidationError {
    /// Only consensus failures poison the block index
    pub fn is_permanent(&self) -> bool {
        matches!(self, ValidationError::Consensus(_))
    }

    pub fn consensus(&self) -> Option<&ConsensusError> {
        match self {
            ValidationError::Consensus(e) => Some(e),
            _ => None,
        }
    }

    pub fn policy(&self) -> Option<&PolicyError> {
        match self {
            ValidationError::Policy(e) => Some(e),
            _ => None,
        }
    }

    pub(crate) fn storage(err: anyhow::Error) -> Self {
        ValidationError::Storage(format!("{err:#}"))
    }
}

impl From<DecodeError> for ValidationError {
    fn from(err: DecodeError) -> Self {
        ValidationError::Consensus(ConsensusError::Malformed(err))
    }
}

pub type Result<T, E = ConsensusError> = std::result::Result<T, E>;
