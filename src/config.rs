//! Chain parameters and engine configuration
//!
//! Everything a validation decision depends on is carried here and handed to
//! constructors explicitly. Nothing is read from globals or the environment.

use crate::constants::*;
use crate::script::ScriptFlags;
use serde::{Deserialize, Serialize};

/// Network selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

/// Consensus parameters of one network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub network: Network,
    pub genesis_timestamp: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub genesis_message: String,
    pub genesis_reward: i64,
    pub halving_interval: u64,
    pub initial_subsidy: i64,
    pub pow_limit_bits: u32,
    pub target_spacing: u64,
    pub target_timespan: u64,
    pub no_retargeting: bool,
    pub coinbase_maturity: u64,
    pub max_future_block_time: u64,
    pub p2sh_height: u64,
    pub strict_der_height: u64,
    pub checklocktimeverify_height: u64,
    pub checksequenceverify_height: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self::mainnet()
    }
}

impl ChainParams {
    pub fn mainnet() -> Self {
        Self {
            network: Network::Mainnet,
            genesis_timestamp: 1_735_689_600,
            genesis_bits: MAX_TARGET,
            genesis_nonce: 0,
            genesis_message: "BitsCoin 2025 Launch".to_string(),
            genesis_reward: INITIAL_SUBSIDY,
            halving_interval: HALVING_INTERVAL,
            initial_subsidy: INITIAL_SUBSIDY,
            pow_limit_bits: MAX_TARGET,
            target_spacing: TARGET_TIME_PER_BLOCK,
            target_timespan: DIFFICULTY_ADJUSTMENT_INTERVAL * TARGET_TIME_PER_BLOCK,
            no_retargeting: false,
            coinbase_maturity: COINBASE_MATURITY,
            max_future_block_time: MAX_FUTURE_BLOCK_TIME,
            p2sh_height: 0,
            strict_der_height: 0,
            checklocktimeverify_height: 0,
            checksequenceverify_height: 0,
        }
    }

    pub fn testnet() -> Self {
        Self {
            network: Network::Testnet,
            genesis_message: "BitsCoin 2025 Testnet".to_string(),
            ..Self::mainnet()
        }
    }

    /// Minimum difficulty, no retargeting: blocks can be ground in tests
    pub fn regtest() -> Self {
        Self {
            network: Network::Regtest,
            genesis_bits: REGTEST_MAX_TARGET,
            genesis_message: "BitsCoin 2025 Regtest".to_string(),
            halving_interval: 150,
            pow_limit_bits: REGTEST_MAX_TARGET,
            no_retargeting: true,
            ..Self::mainnet()
        }
    }

    pub fn for_network(network: Network) -> Self {
        match network {
            Network::Mainnet => Self::mainnet(),
            Network::Testnet => Self::testnet(),
            Network::Regtest => Self::regtest(),
        }
    }

    /// Reject parameters the schedule arithmetic cannot work with
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.target_spacing > 0, "target_spacing must be positive");
        anyhow::ensure!(self.halving_interval > 0, "halving_interval must be positive");
        Ok(())
    }

    /// Number of blocks between difficulty adjustments
    pub fn difficulty_adjustment_interval(&self) -> u64 {
        (self.target_timespan / self.target_spacing.max(1)).max(1)
    }

    /// Consensus script flags in force for a block at `height`
    pub fn script_flags_at(&self, height: u64) -> ScriptFlags {
        let mut flags = ScriptFlags::empty();
        if height >= self.p2sh_height {
            flags |= ScriptFlags::P2SH;
        }
        if height >= self.strict_der_height {
            flags |= ScriptFlags::DERSIG;
        }
        if height >= self.checklocktimeverify_height {
            flags |= ScriptFlags::CHECKLOCKTIMEVERIFY;
        }
        if height >= self.checksequenceverify_height {
            flags |= ScriptFlags::CHECKSEQUENCEVERIFY;
        }
        flags
    }

    /// BIP68 relative lock times are enforced together with CHECKSEQUENCEVERIFY
    pub fn enforces_sequence_locks(&self, height: u64) -> bool {
        height >= self.checksequenceverify_height
    }
}

/// Relay policy knobs; none of these affect block validity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MempoolPolicy {
    pub max_size_bytes: usize,
    /// Satoshis per 1000 bytes
    pub min_relay_fee_rate: i64,
    pub incremental_relay_fee_rate: i64,
    pub dust_relay_fee_rate: i64,
    pub ancestor_limit: usize,
    pub ancestor_size_limit: usize,
    pub descendant_limit: usize,
    pub descendant_size_limit: usize,
    pub max_replacement_evictions: usize,
    pub permit_bare_multisig: bool,
}

impl Default for MempoolPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_MEMPOOL_SIZE,
            min_relay_fee_rate: DEFAULT_MIN_RELAY_TX_FEE,
            incremental_relay_fee_rate: DEFAULT_INCREMENTAL_RELAY_FEE,
            dust_relay_fee_rate: DUST_RELAY_TX_FEE,
            ancestor_limit: DEFAULT_ANCESTOR_LIMIT,
            ancestor_size_limit: DEFAULT_ANCESTOR_SIZE_LIMIT,
            descendant_limit: DEFAULT_DESCENDANT_LIMIT,
            descendant_size_limit: DEFAULT_DESCENDANT_SIZE_LIMIT,
            max_replacement_evictions: MAX_REPLACEMENT_CANDIDATES,
            permit_bare_multisig: true,
        }
    }
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chain: ChainParams,
    pub mempool: MempoolPolicy,
    /// Worker threads for script verification; 0 lets rayon decide
    pub script_threads: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chain: ChainParams::mainnet(),
            mempool: MempoolPolicy::default(),
            script_threads: 0,
        }
    }
}

impl EngineConfig {
    /// Default policy on the given network
    pub fn for_network(network: Network) -> Self {
        Self {
            chain: ChainParams::for_network(network),
            ..Self::default()
        }
    }

    pub fn regtest() -> Self {
        Self::for_network(Network::Regtest)
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.chain.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
