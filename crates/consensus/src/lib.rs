//! Consensus constants, parameters, and the reward schedule.

pub mod constants;
pub mod money;
pub mod params;
pub mod rewards;

/// 32-byte little-endian hash.
pub type Hash256 = [u8; 32];

pub use params::{
    chain_params, hash256_from_hex, ChainParams, Checkpoint, ConsensusParams, Network,
    StakeModifierCheckpoint,
};
pub use rewards::proof_of_stake_reward;
