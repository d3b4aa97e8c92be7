//! Proof-of-stake auxiliary state: entropy bits, the stake modifier, the
//! kernel hash, coin age, and block signatures.

pub mod entropy;
pub mod kernel;
pub mod modifier;
pub mod signature;

pub use entropy::stake_entropy_bit;
pub use kernel::{check_stake_kernel, coin_age, AgeInput, KernelInput};
pub use modifier::{
    compute_stake_modifier, selection_interval, stake_modifier_checksum, CandidateBlock,
    StakeModifierError,
};
pub use signature::{check_block_signature, SignatureError};
