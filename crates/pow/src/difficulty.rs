//! Compact target utilities and the continuous retarget rule.

use novad_consensus::constants::{STAKE_TARGET_SPACING, TARGET_TIMESPAN};
use novad_consensus::{ConsensusParams, Hash256};
use primitive_types::U256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if (bits & 0x0080_0000) != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3))
    };

    if word != 0 {
        let overflow = size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32);
        if overflow {
            return Err(CompactError::Overflow);
        }
    }

    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }

    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact: u32 = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };

    if (compact & 0x0080_0000) != 0 {
        compact >>= 8;
        size += 1;
    }

    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(compact_to_u256(bits)?.to_little_endian())
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Work metric contributed by one block at the given compact target.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::from(1u64);
    Ok((!target / (target + one)) + one)
}

/// The last two same-type blocks the retarget rule looks at.
#[derive(Clone, Copy, Debug)]
pub struct TargetBlock {
    pub height: i32,
    pub time: u32,
    pub bits: u32,
}

/// Continuous per-block retarget: the new target tracks the spacing between
/// the last two blocks of the same proof type, damped over a one-week
/// reference timespan. Work blocks stretch their target spacing with the
/// distance since the last work block, up to twelve stake intervals.
pub fn next_target_required(
    prev: Option<TargetBlock>,
    prev_prev: Option<TargetBlock>,
    last_height: i32,
    is_proof_of_stake: bool,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let limit = if is_proof_of_stake {
        U256::from_little_endian(&params.pos_limit)
    } else {
        U256::from_little_endian(&params.pow_limit)
    };
    let limit_bits = u256_to_compact(limit);

    let (prev, prev_prev) = match (prev, prev_prev) {
        (Some(prev), Some(prev_prev)) => (prev, prev_prev),
        // First or second block of this proof type.
        _ => return Ok(limit_bits),
    };

    let actual_spacing = (prev.time as i64 - prev_prev.time as i64).max(1);
    let target_spacing = if is_proof_of_stake {
        STAKE_TARGET_SPACING
    } else {
        let gap = 1 + (last_height - prev.height) as i64;
        (STAKE_TARGET_SPACING * gap).min(STAKE_TARGET_SPACING * 12)
    };
    let interval = TARGET_TIMESPAN / target_spacing;

    let prev_target = compact_to_u256(prev.bits)?;
    let numerator = U256::from(((interval - 1) * target_spacing + 2 * actual_spacing) as u64);
    let denominator = U256::from(((interval + 1) * target_spacing) as u64);
    let (scaled, overflow) = (prev_target / denominator).overflowing_mul(numerator);
    let mut new_target = if overflow {
        limit
    } else {
        scaled
            .checked_add(prev_target % denominator * numerator / denominator)
            .unwrap_or(limit)
    };

    if new_target.is_zero() || new_target > limit {
        new_target = limit;
    }

    Ok(u256_to_compact(new_target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use novad_consensus::params::{consensus_params, Network};

    #[test]
    fn compact_round_trips() {
        for bits in [0x1d00_ffffu32, 0x1e0f_ffff, 0x2100_ffff, 0x0301_2345] {
            let value = compact_to_u256(bits).expect("target");
            assert_eq!(u256_to_compact(value), bits);
        }
    }

    #[test]
    fn compact_rejects_negative_and_overflow() {
        assert_eq!(compact_to_u256(0x0180_0000), Err(CompactError::Negative));
        assert_eq!(compact_to_u256(0xff00_ffff), Err(CompactError::Overflow));
    }

    #[test]
    fn proof_is_larger_for_smaller_targets() {
        let easy = block_proof(0x207f_ffff).expect("easy proof");
        let hard = block_proof(0x1d00_ffff).expect("hard proof");
        assert!(hard > easy);
    }

    #[test]
    fn retarget_without_history_returns_limit() {
        let params = consensus_params(Network::Regtest);
        let bits = next_target_required(None, None, 0, false, &params).expect("bits");
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn retarget_moves_toward_spacing() {
        let params = consensus_params(Network::Mainnet);
        let limit_bits = target_to_compact(&params.pow_limit);
        let prev_prev = TargetBlock {
            height: 100,
            time: 1_000_000,
            bits: 0x1d00_ffff,
        };

        // Fast blocks tighten the target.
        let fast_prev = TargetBlock {
            height: 101,
            time: 1_000_060,
            bits: 0x1d00_ffff,
        };
        let fast = next_target_required(Some(fast_prev), Some(prev_prev), 101, false, &params)
            .expect("bits");
        assert!(compact_to_u256(fast).unwrap() < compact_to_u256(0x1d00_ffff).unwrap());

        // Slow blocks relax it.
        let slow_prev = TargetBlock {
            height: 101,
            time: 1_003_600,
            bits: 0x1d00_ffff,
        };
        let slow = next_target_required(Some(slow_prev), Some(prev_prev), 101, false, &params)
            .expect("bits");
        assert!(compact_to_u256(slow).unwrap() > compact_to_u256(0x1d00_ffff).unwrap());
        assert_ne!(slow, limit_bits);
    }

    #[test]
    fn retarget_clamps_to_limit() {
        let params = consensus_params(Network::Regtest);
        let limit_bits = target_to_compact(&params.pow_limit);
        let prev = TargetBlock {
            height: 1,
            time: 2_000_000,
            bits: limit_bits,
        };
        let prev_prev = TargetBlock {
            height: 0,
            time: 1_000_000,
            bits: limit_bits,
        };
        let bits =
            next_target_required(Some(prev), Some(prev_prev), 1, false, &params).expect("bits");
        assert_eq!(bits, limit_bits);
    }
}
