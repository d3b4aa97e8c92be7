//! Difficulty-indexed proof-of-work subsidy.

use novad_consensus::money::{Amount, CENT};
use novad_consensus::rewards::MAX_MINT_PROOF_OF_WORK;
use novad_consensus::ConsensusParams;
use primitive_types::{U256, U512};

use crate::difficulty::{compact_to_u256, CompactError};

/// The subsidy scales with the inverse fourth root of difficulty: the
/// largest value (rounded down to a cent) satisfying
/// `subsidy^4 * limit_target <= cap^4 * block_target`, capped at 100 coins.
/// Found by bisection, the way the reference chain computes it.
pub fn proof_of_work_reward(bits: u32, params: &ConsensusParams) -> Result<Amount, CompactError> {
    let target = compact_to_u256(bits)?;
    let target_limit = U256::from_little_endian(&params.pow_limit);
    if target.is_zero() || target_limit.is_zero() {
        return Ok(0);
    }

    let cap = U512::from(MAX_MINT_PROOF_OF_WORK as u64);
    let rhs = pow4(cap).saturating_mul(U512::from(target));
    let limit512 = U512::from(target_limit);

    let mut lower = U512::from(CENT as u64);
    let mut upper = cap;
    while lower + U512::from(CENT as u64) <= upper {
        let mid = (lower + upper) >> 1;
        if pow4(mid).saturating_mul(limit512) > rhs {
            upper = mid;
        } else {
            lower = mid;
        }
    }

    let mut subsidy = lower.as_u64() as Amount;
    subsidy -= subsidy % CENT;
    Ok(subsidy.min(MAX_MINT_PROOF_OF_WORK))
}

fn pow4(value: U512) -> U512 {
    let squared = value.saturating_mul(value);
    squared.saturating_mul(squared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use novad_consensus::params::{consensus_params, Network};
    use novad_consensus::money::COIN;
    use crate::difficulty::target_to_compact;

    #[test]
    fn reward_at_limit_approaches_the_cap() {
        let params = consensus_params(Network::Mainnet);
        // The compact encoding rounds the limit down a hair, so the
        // easiest block pays a cent-floored value just under the cap.
        let bits = target_to_compact(&params.pow_limit);
        let reward = proof_of_work_reward(bits, &params).expect("reward");
        assert!(reward > 99 * COIN);
        assert!(reward <= 100 * COIN);
        assert_eq!(reward % CENT, 0);
    }

    #[test]
    fn reward_shrinks_as_difficulty_grows() {
        let params = consensus_params(Network::Mainnet);
        let easy = proof_of_work_reward(target_to_compact(&params.pow_limit), &params)
            .expect("easy reward");
        let hard = proof_of_work_reward(0x1c00_ffff, &params).expect("hard reward");
        assert!(hard < easy);
        assert!(hard > 0);
        assert_eq!(hard % CENT, 0);
    }
}
