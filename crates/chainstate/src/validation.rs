//! Context-free block and transaction rules, and the chain-state error
//! taxonomy.

use std::collections::HashSet;

use novad_consensus::constants::{
    FUTURE_DRIFT, LOCKTIME_THRESHOLD, MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, PAST_DRIFT,
};
use novad_consensus::money::{money_range, MAX_MONEY};
use novad_consensus::Hash256;
use novad_pos::signature::check_block_signature;
use novad_pow::difficulty::{compact_to_target, hash_meets_target};
use novad_primitives::block::Block;
use novad_primitives::merkle::merkle_root;
use novad_primitives::transaction::Transaction;

use crate::blockfiles::BlockFileError;
use crate::chaindb::ChainDbError;
use crate::script::sigop_count;
use novad_storage::StoreError;

/// A protocol violation with the misbehavior score surfaced to the peer
/// layer. Zero means invalid but honestly explicable (clock drift and the
/// like); 100 is unambiguous malice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockError {
    pub message: &'static str,
    pub dos: u32,
}

impl BlockError {
    pub fn new(message: &'static str, dos: u32) -> Self {
        Self { message, dos }
    }
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for BlockError {}

#[derive(Debug)]
pub enum ChainStateError {
    /// Invalid block or transaction content; rejected, nothing persisted.
    Invalid(BlockError),
    /// The parent is unknown; the caller may stash the block as an orphan.
    MissingParent,
    /// Storage failure. Fatal: the caller shuts down.
    Store(StoreError),
    /// Block-file I/O failure. Fatal.
    BlockFile(BlockFileError),
    /// The persisted state contradicts itself; the transaction is aborted.
    Consistency(&'static str),
    /// Checkpoint mismatch; the block is rejected but the node survives.
    Checkpoint(&'static str),
}

impl ChainStateError {
    pub fn invalid(message: &'static str, dos: u32) -> Self {
        ChainStateError::Invalid(BlockError::new(message, dos))
    }

    pub fn dos_score(&self) -> u32 {
        match self {
            ChainStateError::Invalid(err) => err.dos,
            _ => 0,
        }
    }

    /// Only storage failures bring the node down.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChainStateError::Store(_) | ChainStateError::BlockFile(_)
        )
    }
}

impl std::fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainStateError::Invalid(err) => write!(f, "{err}"),
            ChainStateError::MissingParent => write!(f, "previous block is not known"),
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::BlockFile(err) => write!(f, "{err}"),
            ChainStateError::Consistency(message) => write!(f, "{message}"),
            ChainStateError::Checkpoint(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<BlockError> for ChainStateError {
    fn from(err: BlockError) -> Self {
        ChainStateError::Invalid(err)
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<BlockFileError> for ChainStateError {
    fn from(err: BlockFileError) -> Self {
        ChainStateError::BlockFile(err)
    }
}

impl From<ChainDbError> for ChainStateError {
    fn from(err: ChainDbError) -> Self {
        match err {
            ChainDbError::Store(err) => ChainStateError::Store(err),
            ChainDbError::TransactionAlreadyOpen => {
                ChainStateError::Consistency("index transaction already open")
            }
            ChainDbError::Corrupt(message) => ChainStateError::Consistency(message),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CheckBlockFlags {
    pub check_pow: bool,
    pub check_merkle: bool,
    pub check_sig: bool,
    /// Verify stake kernels on acceptance. Requires the staked outputs to
    /// be resolvable through the transaction index.
    pub check_stake: bool,
}

impl Default for CheckBlockFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_merkle: true,
            check_sig: true,
            check_stake: true,
        }
    }
}

impl CheckBlockFlags {
    /// Everything off; synthetic-chain tests and reconnects of
    /// already-verified blocks.
    pub fn none() -> Self {
        Self {
            check_pow: false,
            check_merkle: false,
            check_sig: false,
            check_stake: false,
        }
    }
}

/// Context-free transaction rules.
pub fn check_transaction(tx: &Transaction) -> Result<(), BlockError> {
    if tx.vin.is_empty() {
        return Err(BlockError::new("transaction has no inputs", 10));
    }
    if tx.vout.is_empty() {
        return Err(BlockError::new("transaction has no outputs", 10));
    }
    if tx.serialized_size() as u32 > MAX_BLOCK_SIZE {
        return Err(BlockError::new("transaction oversize", 100));
    }

    let user_tx = !tx.is_coinbase() && !tx.is_coinstake();
    let mut value_out = 0i64;
    for output in &tx.vout {
        if output.is_empty() && user_tx {
            return Err(BlockError::new("empty output in user transaction", 100));
        }
        if output.value < 0 {
            return Err(BlockError::new("output value is negative", 100));
        }
        if output.value > MAX_MONEY {
            return Err(BlockError::new("output value above money range", 100));
        }
        value_out = value_out
            .checked_add(output.value)
            .filter(|total| money_range(*total))
            .ok_or(BlockError::new("output total above money range", 100))?;
    }

    let mut seen = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen.insert(input.prevout) {
            return Err(BlockError::new("duplicate input", 100));
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(2..=100).contains(&script_len) {
            return Err(BlockError::new("coinbase script size out of range", 100));
        }
    } else if tx.vin.iter().any(|input| input.prevout.is_null()) {
        return Err(BlockError::new("null prevout outside coinbase", 10));
    }

    Ok(())
}

/// Context-free block rules. `adjusted_time` bounds the future drift.
pub fn check_block(
    block: &Block,
    flags: CheckBlockFlags,
    adjusted_time: u32,
) -> Result<(), BlockError> {
    if block.transactions.is_empty() {
        return Err(BlockError::new("block has no transactions", 100));
    }
    if block.transactions.len() as u32 > MAX_BLOCK_SIZE
        || block.serialized_size() as u32 > MAX_BLOCK_SIZE
    {
        return Err(BlockError::new("block size limits failed", 100));
    }

    if !block.transactions[0].is_coinbase() {
        return Err(BlockError::new("first transaction is not coinbase", 100));
    }
    check_transaction(&block.transactions[0])?;
    for tx in &block.transactions[1..] {
        if tx.is_coinbase() {
            return Err(BlockError::new("more than one coinbase", 100));
        }
    }

    if block.is_proof_of_stake() {
        if block.header.nonce != 0 {
            return Err(BlockError::new(
                "non-zero nonce in proof-of-stake block",
                100,
            ));
        }
        let coinbase = &block.transactions[0];
        if coinbase.vout.len() != 1 || !coinbase.vout[0].is_empty() {
            return Err(BlockError::new(
                "coinbase output not empty in proof-of-stake block",
                100,
            ));
        }
        for (index, tx) in block.transactions.iter().enumerate() {
            if tx.is_coinstake() && index != 1 {
                return Err(BlockError::new("coinstake in wrong position", 100));
            }
        }
        let coinstake = &block.transactions[1];
        if block.header.time != coinstake.time {
            return Err(BlockError::new("coinstake timestamp violation", 50));
        }
        check_transaction(coinstake)?;
        if flags.check_sig {
            // The key paid by the coinstake signs the block.
            let payout_script = coinstake
                .vout
                .get(1)
                .map(|output| output.script_pubkey.as_slice())
                .unwrap_or(&[]);
            check_block_signature(&block.hash(), &block.signature, payout_script)
                .map_err(|_| BlockError::new("bad proof-of-stake block signature", 100))?;
        }
    } else {
        if !block.signature.is_empty() {
            return Err(BlockError::new(
                "unexpected signature on proof-of-work block",
                100,
            ));
        }
        if flags.check_pow {
            let target = compact_to_target(block.header.bits)
                .map_err(|_| BlockError::new("invalid proof-of-work target", 50))?;
            if !hash_meets_target(&block.hash(), &target) {
                return Err(BlockError::new("proof of work failed", 50));
            }
        }
        if block.header.time > adjusted_time.saturating_add(FUTURE_DRIFT) {
            return Err(BlockError::new("block timestamp too far in the future", 0));
        }
        if block
            .header
            .time
            .saturating_add(PAST_DRIFT)
            < block.transactions[0].time
        {
            return Err(BlockError::new("coinbase timestamp is too early", 50));
        }
    }

    let mut seen_txids: HashSet<Hash256> = HashSet::with_capacity(block.transactions.len());
    let mut sigops = 0u32;
    let mut txids = Vec::with_capacity(block.transactions.len());
    for (index, tx) in block.transactions.iter().enumerate() {
        if index > 0 {
            if block.header.time < tx.time {
                return Err(BlockError::new(
                    "block timestamp earlier than transaction timestamp",
                    50,
                ));
            }
            if index != 1 || block.is_proof_of_work() {
                if tx.is_coinstake() {
                    return Err(BlockError::new("coinstake in wrong position", 100));
                }
                check_transaction(tx)?;
            }
        }
        let txid = tx.txid();
        if !seen_txids.insert(txid) {
            return Err(BlockError::new("duplicate transaction", 100));
        }
        txids.push(txid);

        for input in &tx.vin {
            sigops += sigop_count(&input.script_sig, false);
        }
        for output in &tx.vout {
            sigops += sigop_count(&output.script_pubkey, false);
        }
    }
    if sigops > MAX_BLOCK_SIGOPS {
        return Err(BlockError::new("too many sigops", 100));
    }

    if flags.check_merkle && block.header.merkle_root != merkle_root(&txids) {
        return Err(BlockError::new("merkle root mismatch", 100));
    }

    Ok(())
}

/// Finality at a given chain position: zero lock time, expired lock time,
/// or every input final.
pub fn is_final_tx(tx: &Transaction, height: i32, block_time: i64) -> bool {
    if tx.lock_time == 0 {
        return true;
    }
    let threshold = if tx.lock_time < LOCKTIME_THRESHOLD {
        height as i64
    } else {
        block_time
    };
    if (tx.lock_time as i64) < threshold {
        return true;
    }
    tx.vin.iter().all(|input| input.is_final())
}

/// The minimal script push of a block height the coinbase must lead with.
pub fn height_script(height: i32) -> Vec<u8> {
    const OP_0: u8 = 0x00;
    const OP_1: u8 = 0x51;

    if height == 0 {
        return vec![OP_0];
    }
    if (1..=16).contains(&height) {
        return vec![OP_1 + (height as u8 - 1)];
    }

    let mut value = height as i64;
    let mut data = Vec::new();
    while value > 0 {
        data.push((value & 0xff) as u8);
        value >>= 8;
    }
    if data.last().is_some_and(|last| last & 0x80 != 0) {
        data.push(0);
    }
    let mut script = Vec::with_capacity(data.len() + 1);
    script.push(data.len() as u8);
    script.extend_from_slice(&data);
    script
}
