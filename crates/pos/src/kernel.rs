//! Stake kernel hash and coin-age accounting.

use novad_consensus::constants::{STAKE_MAX_AGE, STAKE_MIN_AGE};
use novad_consensus::money::{CENT, COIN};
use novad_consensus::Hash256;
use novad_pow::difficulty::compact_to_u256;
use novad_primitives::encoding::Encoder;
use novad_primitives::hash::sha256d;
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Coinstake stamped before the output it spends.
    TimeReversal,
    /// The staked output has not reached minimum age.
    ImmatureStake,
    /// Kernel hash does not beat the weighted target.
    TargetMissed,
    BadTarget,
}

impl std::fmt::Display for KernelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelError::TimeReversal => {
                write!(f, "coinstake timestamp earlier than staked output")
            }
            KernelError::ImmatureStake => write!(f, "staked output below minimum age"),
            KernelError::TargetMissed => write!(f, "kernel hash misses stake target"),
            KernelError::BadTarget => write!(f, "invalid stake target"),
        }
    }
}

impl std::error::Error for KernelError {}

/// Everything the kernel hash binds: where the staked output sits on disk,
/// when it and its block were created, and when the stake happens.
#[derive(Clone, Copy, Debug)]
pub struct KernelInput {
    pub stake_modifier: u64,
    /// Timestamp of the block containing the staked output.
    pub block_from_time: u32,
    /// File offset of the staked transaction within its block record.
    pub tx_offset: u32,
    pub prev_tx_time: u32,
    pub prevout_index: u32,
    pub value: i64,
    /// Coinstake timestamp.
    pub tx_time: u32,
}

/// Verifies the kernel and returns the proof hash recorded on the block
/// index. The target scales with coin-day weight so large, old stakes find
/// blocks proportionally faster, capped at the maximum age.
pub fn check_stake_kernel(bits: u32, input: &KernelInput) -> Result<Hash256, KernelError> {
    if input.tx_time < input.prev_tx_time {
        return Err(KernelError::TimeReversal);
    }
    if input.block_from_time.saturating_add(STAKE_MIN_AGE) > input.tx_time {
        return Err(KernelError::ImmatureStake);
    }

    let target = compact_to_u256(bits).map_err(|_| KernelError::BadTarget)?;

    let duration = (input.tx_time - input.prev_tx_time) as u64;
    let weighted_age = duration
        .saturating_sub(STAKE_MIN_AGE as u64)
        .min(STAKE_MAX_AGE as u64);
    let coin_day_weight =
        (input.value as u64 as u128 * weighted_age as u128 / COIN as u128 / (24 * 60 * 60)) as u64;

    let mut encoder = Encoder::with_capacity(64);
    encoder.write_u64_le(input.stake_modifier);
    encoder.write_u32_le(input.block_from_time);
    encoder.write_u32_le(input.tx_offset);
    encoder.write_u32_le(input.prev_tx_time);
    encoder.write_u32_le(input.prevout_index);
    encoder.write_u32_le(input.tx_time);
    let proof = sha256d(&encoder.into_inner());

    let weighted_target = U512::from(target).saturating_mul(U512::from(coin_day_weight));
    if U512::from(U256::from_little_endian(&proof)) > weighted_target {
        return Err(KernelError::TargetMissed);
    }

    Ok(proof)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoinAgeError {
    TimeReversal,
    ValueOutOfRange,
}

impl std::fmt::Display for CoinAgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinAgeError::TimeReversal => {
                write!(f, "transaction timestamp earlier than input transaction")
            }
            CoinAgeError::ValueOutOfRange => write!(f, "coin age value out of range"),
        }
    }
}

impl std::error::Error for CoinAgeError {}

/// One spent output as the age accounting sees it. The minimum-age gate
/// runs on the containing block's timestamp, the same anchor the kernel
/// uses; accrual runs on the output transaction's own timestamp.
#[derive(Clone, Copy, Debug)]
pub struct AgeInput {
    pub value: i64,
    pub prev_tx_time: u32,
    /// Timestamp of the block containing the spent output.
    pub block_from_time: u32,
}

/// Coin-days consumed by a transaction: per input, value times seconds held,
/// truncated to cent-seconds along the way the way the reference chain does.
/// Inputs whose block has not reached the minimum stake age contribute
/// nothing.
pub fn coin_age(tx_time: u32, inputs: &[AgeInput]) -> Result<u64, CoinAgeError> {
    let mut cent_seconds: u128 = 0;
    for input in inputs {
        if tx_time < input.prev_tx_time {
            return Err(CoinAgeError::TimeReversal);
        }
        if input.value < 0 {
            return Err(CoinAgeError::ValueOutOfRange);
        }
        if input.block_from_time.saturating_add(STAKE_MIN_AGE) > tx_time {
            continue;
        }
        let held = (tx_time - input.prev_tx_time) as u128;
        cent_seconds += input.value as u128 * held / CENT as u128;
    }
    let coin_days = cent_seconds * CENT as u128 / COIN as u128 / (24 * 60 * 60);
    u64::try_from(coin_days).map_err(|_| CoinAgeError::ValueOutOfRange)
}
