//! Proof of work: compact targets, difficulty retargeting and chain work

use crate::config::ChainParams;
use crate::error::{ConsensusError, Result};
use crate::types::*;
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, Shl, Shr, Sub};

/// 256-bit unsigned integer for targets and cumulative work.
/// Words are stored least significant first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_u64(value: u64) -> Self {
        U256([value, 0, 0, 0])
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    /// Interpret 32 bytes as a big-endian number
    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn low_u64(&self) -> u64 {
        self.0[0]
    }

    /// Number of significant bits
    pub fn bits(&self) -> u32 {
        for i in (0..4).rev() {
            if self.0[i] != 0 {
                return 64 * i as u32 + (64 - self.0[i].leading_zeros());
            }
        }
        0
    }

    fn bit(&self, index: u32) -> bool {
        (self.0[(index / 64) as usize] >> (index % 64)) & 1 == 1
    }

    pub fn checked_add(self, other: U256) -> Option<U256> {
        let mut out = [0u64; 4];
        let mut carry = false;
        for (i, slot) in out.iter_mut().enumerate() {
            let (sum, c1) = self.0[i].overflowing_add(other.0[i]);
            let (sum, c2) = sum.overflowing_add(carry as u64);
            *slot = sum;
            carry = c1 || c2;
        }
        if carry {
            None
        } else {
            Some(U256(out))
        }
    }

    pub fn checked_sub(self, other: U256) -> Option<U256> {
        if self < other {
            return None;
        }
        let mut out = [0u64; 4];
        let mut borrow = false;
        for (i, slot) in out.iter_mut().enumerate() {
            let (diff, b1) = self.0[i].overflowing_sub(other.0[i]);
            let (diff, b2) = diff.overflowing_sub(borrow as u64);
            *slot = diff;
            borrow = b1 || b2;
        }
        Some(U256(out))
    }

    pub fn saturating_add(self, other: U256) -> U256 {
        self.checked_add(other).unwrap_or(U256::MAX)
    }

    /// Multiply by a 64-bit factor, `None` on overflow
    pub fn checked_mul_u64(self, factor: u64) -> Option<U256> {
        let mut out = [0u64; 4];
        let mut carry = 0u128;
        for (i, slot) in out.iter_mut().enumerate() {
            let product = self.0[i] as u128 * factor as u128 + carry;
            *slot = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            None
        } else {
            Some(U256(out))
        }
    }

    /// Long division; `None` when dividing by zero
    pub fn checked_div(self, divisor: U256) -> Option<U256> {
        if divisor.is_zero() {
            return None;
        }
        if self < divisor {
            return Some(U256::ZERO);
        }
        let mut quotient = U256::ZERO;
        let mut remainder = U256::ZERO;
        for i in (0..self.bits()).rev() {
            remainder = remainder << 1;
            if self.bit(i) {
                remainder.0[0] |= 1;
            }
            if remainder >= divisor {
                remainder = remainder - divisor;
                quotient.0[(i / 64) as usize] |= 1 << (i % 64);
            }
        }
        Some(quotient)
    }

    fn not(self) -> U256 {
        U256([!self.0[0], !self.0[1], !self.0[2], !self.0[3]])
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

impl Shl<u32> for U256 {
    type Output = U256;

    fn shl(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in 0..4 {
            if i + word_shift < 4 {
                result.0[i + word_shift] |= self.0[i] << bit_shift;
                if bit_shift > 0 && i + word_shift + 1 < 4 {
                    result.0[i + word_shift + 1] |= self.0[i] >> (64 - bit_shift);
                }
            }
        }
        result
    }
}

impl Shr<u32> for U256 {
    type Output = U256;

    fn shr(self, shift: u32) -> U256 {
        if shift >= 256 {
            return U256::ZERO;
        }
        let mut result = U256::ZERO;
        let word_shift = (shift / 64) as usize;
        let bit_shift = shift % 64;
        for i in word_shift..4 {
            result.0[i - word_shift] |= self.0[i] >> bit_shift;
            if bit_shift > 0 && i > word_shift {
                result.0[i - word_shift - 1] |= self.0[i] << (64 - bit_shift);
            }
        }
        result
    }
}

/// Saturating arithmetic; callers that care about bounds use the checked forms
impl Add for U256 {
    type Output = U256;

    fn add(self, other: U256) -> U256 {
        self.checked_add(other).unwrap_or(U256::MAX)
    }
}

impl Sub for U256 {
    type Output = U256;

    fn sub(self, other: U256) -> U256 {
        self.checked_sub(other).unwrap_or(U256::ZERO)
    }
}

impl fmt::Display for U256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.to_be_bytes()))
    }
}

/// A decoded compact target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// SetCompact: expand the 32-bit compact encoding `size | mantissa`
pub fn set_compact(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from_u64(word as u64)
    } else {
        U256::from_u64(word as u64) << (8 * (size - 3))
    };
    CompactTarget {
        target,
        negative: word != 0 && bits & 0x0080_0000 != 0,
        overflow: word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32)),
    }
}

/// GetCompact: the shortest compact encoding of `target`
pub fn get_compact(target: &U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (*target >> (8 * (size - 3))).low_u64() as u32
    };
    // The mantissa is signed: move a set sign bit into the next byte
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// Expand `bits` and reject negative, zero, overflowing or too-easy targets
pub fn decode_target(bits: u32, params: &ChainParams) -> Result<U256> {
    let decoded = set_compact(bits);
    let limit = set_compact(params.pow_limit_bits).target;
    if decoded.negative || decoded.overflow || decoded.target.is_zero() || decoded.target > limit {
        return Err(ConsensusError::BadTarget(bits));
    }
    Ok(decoded.target)
}

/// CheckProofOfWork: hash, read as a big-endian number, must not exceed the target
pub fn check_proof_of_work(hash: &Hash, bits: u32, params: &ChainParams) -> Result<()> {
    let target = decode_target(bits, params)?;
    if U256::from_be_bytes(hash) > target {
        return Err(ConsensusError::HighHash);
    }
    Ok(())
}

/// Work represented by a header: 2^256 / (target + 1)
pub fn block_proof(bits: u32) -> U256 {
    let decoded = set_compact(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return U256::ZERO;
    }
    // 2^256 does not fit, but 2^256 / (t + 1) == (~t / (t + 1)) + 1
    let divisor = decoded.target.saturating_add(U256::ONE);
    match decoded.target.not().checked_div(divisor) {
        Some(quotient) => quotient.saturating_add(U256::ONE),
        None => U256::ZERO,
    }
}

/// CalculateNextWorkRequired: scale the previous target by the observed timespan
pub fn calculate_next_work_required(
    prev_bits: u32,
    first_block_time: u32,
    last_block_time: u32,
    params: &ChainParams,
) -> u32 {
    if params.no_retargeting {
        return prev_bits;
    }
    let target_timespan = params.target_timespan.max(1);
    let actual = (last_block_time as i64 - first_block_time as i64)
        .clamp((target_timespan / 4) as i64, (target_timespan * 4) as i64) as u64;

    let limit = set_compact(params.pow_limit_bits).target;
    let old = set_compact(prev_bits).target;
    let scaled = match old.checked_mul_u64(actual) {
        Some(product) => product.checked_div(U256::from_u64(target_timespan)),
        // Targets near 2^256 lose the low bits instead of overflowing
        None => old
            .checked_div(U256::from_u64(target_timespan))
            .and_then(|q| q.checked_mul_u64(actual)),
    }
    .unwrap_or(limit);

    get_compact(&scaled.min(limit))
}

/// GetNextWorkRequired: bits due for the block following `prev` at `prev_height`.
///
/// `ancestor_time` returns the timestamp of the active-branch ancestor of
/// `prev` at a given height.
pub fn get_next_work_required<F>(
    prev_height: u64,
    prev: &BlockHeader,
    ancestor_time: F,
    params: &ChainParams,
) -> Result<u32>
where
    F: Fn(u64) -> Option<u32>,
{
    let interval = params.difficulty_adjustment_interval();
    let next_height = prev_height + 1;
    if params.no_retargeting || next_height % interval != 0 {
        return Ok(prev.bits);
    }
    let first_height = prev_height.saturating_sub(interval - 1);
    let first_time = ancestor_time(first_height).ok_or(ConsensusError::BadPrevBlock)?;
    Ok(calculate_next_work_required(prev.bits, first_time, prev.timestamp, params))
}
