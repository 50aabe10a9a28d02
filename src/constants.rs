//! Consensus and policy constants for the BitsCoin network

/// Satoshis per coin
pub const COIN: i64 = 100_000_000;

/// Maximum money supply: 21,000,000 coins in satoshis
pub const MAX_MONEY: i64 = 21_000_000 * COIN;

/// Initial block subsidy: 50 coins
pub const INITIAL_SUBSIDY: i64 = 50 * COIN;

/// Halving interval: 210,000 blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// Maximum block weight
pub const MAX_BLOCK_WEIGHT: usize = 4_000_000;

/// Weight units per serialized byte
pub const WITNESS_SCALE_FACTOR: usize = 4;

/// Maximum serialized block size, derived from the weight limit
pub const MAX_BLOCK_SERIALIZED_SIZE: usize = MAX_BLOCK_WEIGHT / WITNESS_SCALE_FACTOR;

/// Maximum signature-operation cost per block
pub const MAX_BLOCK_SIGOPS_COST: usize = 80_000;

/// Coinbase outputs need this many confirmations before they can be spent
pub const COINBASE_MATURITY: u64 = 100;

/// Coinbase script_sig length bounds
pub const MIN_COINBASE_SCRIPT_SIZE: usize = 2;
pub const MAX_COINBASE_SCRIPT_SIZE: usize = 100;

/// Maximum script length
pub const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum size of a single pushed stack element
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

/// Maximum number of non-push operations per script
pub const MAX_OPS_PER_SCRIPT: usize = 201;

/// Maximum combined size of the main and alt stacks
pub const MAX_STACK_SIZE: usize = 1000;

/// Maximum number of public keys in a CHECKMULTISIG
pub const MAX_PUBKEYS_PER_MULTISIG: usize = 20;

/// Lock time threshold: values below are block heights, above are unix times
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// Sequence number marking an input final
pub const SEQUENCE_FINAL: u32 = 0xffffffff;

/// Highest sequence number that still signals opt-in replaceability
pub const MAX_BIP125_RBF_SEQUENCE: u32 = 0xfffffffd;

/// Relative lock time is ignored when this bit is set
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;

/// Relative lock time is measured in 512-second units when this bit is set
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;

/// Mask extracting the relative lock time value
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000ffff;

/// Granularity shift for time-based relative lock times (2^9 = 512 seconds)
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

/// Number of previous blocks used for the median time past
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Maximum allowed clock drift of a block timestamp into the future: 2 hours
pub const MAX_FUTURE_BLOCK_TIME: u64 = 2 * 60 * 60;

/// Difficulty adjustment interval: 2016 blocks
pub const DIFFICULTY_ADJUSTMENT_INTERVAL: u64 = 2016;

/// Target time per block: 10 minutes
pub const TARGET_TIME_PER_BLOCK: u64 = 600;

/// Mainnet proof-of-work limit (minimum difficulty)
pub const MAX_TARGET: u32 = 0x1d00ffff;

/// Regtest proof-of-work limit
pub const REGTEST_MAX_TARGET: u32 = 0x207fffff;

/// Upper bound on any length prefix accepted by the decoder: 32 MiB
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Maximum serialized size of a standard transaction
pub const MAX_STANDARD_TX_SIZE: usize = 100_000;

/// Maximum size of a standard script_sig
pub const MAX_STANDARD_SCRIPTSIG_SIZE: usize = 1650;

/// Maximum payload of a standard null-data output (OP_RETURN + pushes)
pub const MAX_OP_RETURN_RELAY: usize = 83;

/// Maximum sig-op cost of a standard transaction
pub const MAX_STANDARD_TX_SIGOPS_COST: usize = MAX_BLOCK_SIGOPS_COST / 5;

/// Default mempool limits
pub const DEFAULT_ANCESTOR_LIMIT: usize = 25;
pub const DEFAULT_ANCESTOR_SIZE_LIMIT: usize = 101_000;
pub const DEFAULT_DESCENDANT_LIMIT: usize = 25;
pub const DEFAULT_DESCENDANT_SIZE_LIMIT: usize = 101_000;
pub const DEFAULT_MAX_MEMPOOL_SIZE: usize = 300_000_000;
pub const MAX_REPLACEMENT_CANDIDATES: usize = 100;

/// Default relay fee rates in satoshis per 1000 bytes
pub const DEFAULT_MIN_RELAY_TX_FEE: i64 = 1000;
pub const DEFAULT_INCREMENTAL_RELAY_FEE: i64 = 1000;
pub const DUST_RELAY_TX_FEE: i64 = 3000;
