//! Protocol-wide consensus constants.

/// Maximum serialized block size, and the cap on transactions per block.
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;

/// Cumulative signature-operation cap per block.
pub const MAX_BLOCK_SIGOPS: u32 = 20_000;

/// Orphan transactions kept by the relay layer before eviction.
pub const MAX_ORPHAN_TRANSACTIONS: usize = 10_000;

/// Block version produced by this release.
pub const CURRENT_BLOCK_VERSION: i32 = 6;

pub const CURRENT_TX_VERSION: i32 = 1;

/// How far a block timestamp may run ahead of adjusted time.
pub const FUTURE_DRIFT: u32 = 2 * 60 * 60;

/// How far a block timestamp may trail its own coinbase timestamp.
pub const PAST_DRIFT: u32 = 2 * 60 * 60;

/// Lock times below this are heights, above are unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;

/// CHECKLOCKTIMEVERIFY enforcement begins for transactions stamped at or
/// after 2015-12-20 00:00 UTC. The same instant tightens the allowed offset
/// between a block and its ancestors' median time from a week to 12 hours.
pub const CHECKLOCKTIMEVERIFY_SWITCH_TIME: u32 = 1_450_569_600;

pub const MAX_MEDIAN_TIME_OFFSET: i64 = 12 * 60 * 60;
pub const MAX_MEDIAN_TIME_OFFSET_LEGACY: i64 = 7 * 24 * 60 * 60;

/// Window for the past-median timestamp rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Coins must sit this long before they may stake.
pub const STAKE_MIN_AGE: u32 = 60 * 60 * 24 * 30;

/// Coin-age weight stops accruing past this.
pub const STAKE_MAX_AGE: u32 = 60 * 60 * 24 * 90;

/// Stake-modifier recomputation interval, seconds.
pub const MODIFIER_INTERVAL: i64 = 6 * 60 * 60;

pub const MODIFIER_INTERVAL_RATIO: i64 = 3;

pub const STAKE_TARGET_SPACING: i64 = 10 * 60;

/// Retarget reference timespan (one week).
pub const TARGET_TIMESPAN: i64 = 7 * 24 * 60 * 60;

/// During initial sync, block files are fsynced every this many blocks
/// instead of on every append.
pub const SYNC_FLUSH_INTERVAL: u32 = 500;

/// UI change notifications are debounced to this cadence while syncing.
pub const UI_NOTIFY_INTERVAL: u32 = 16;
