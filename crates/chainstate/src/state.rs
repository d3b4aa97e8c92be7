//! The chain state proper: block acceptance, connection and disconnection,
//! and best-chain selection across forks.
//!
//! Mutation is single-threaded: one task at a time holds the inner lock
//! and drives a block from acceptance to the committed tip. The only
//! parallelism is the script check pool inside block connection. Database
//! writes land in the open index transaction; in-memory node updates are
//! staged and merged only after the transaction commits, so readers see
//! the pre-reorg chain or the post-reorg chain, never a half-applied one.

use std::collections::HashMap;
use std::process::Command;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use novad_consensus::constants::{
    CHECKLOCKTIMEVERIFY_SWITCH_TIME, FUTURE_DRIFT, MAX_BLOCK_SIGOPS, MAX_MEDIAN_TIME_OFFSET,
    MAX_MEDIAN_TIME_OFFSET_LEGACY, MEDIAN_TIME_SPAN, MODIFIER_INTERVAL, SYNC_FLUSH_INTERVAL,
    UI_NOTIFY_INTERVAL,
};
use novad_consensus::money::money_range;
use novad_consensus::rewards::proof_of_stake_reward;
use novad_consensus::{ChainParams, Hash256};
use novad_log::{log_error, log_info, log_warn};
use novad_pos::entropy::stake_entropy_bit;
use novad_pos::kernel::{check_stake_kernel, coin_age, AgeInput, KernelInput};
use novad_pos::modifier::{
    compute_stake_modifier, selection_interval, stake_modifier_checksum, CandidateBlock,
};
use novad_pow::difficulty::{next_target_required, TargetBlock};
use novad_pow::reward::proof_of_work_reward;
use novad_primitives::block::{Block, HEADER_SIZE};
use novad_primitives::encoding::encode;
use novad_primitives::hash::hash256_to_hex;
use novad_primitives::outpoint::OutPoint;
use novad_storage::KeyValueStore;
use primitive_types::U256;

use crate::blockfiles::{BlockFileStore, BlockPosition};
use crate::blockindex::{BlockIndex, FLAG_PROOF_OF_STAKE};
use crate::chaindb::ChainDb;
use crate::notify::{BlockLocator, ChainListener};
use crate::script::{
    is_pay_to_script_hash, p2sh_sigop_count, run_script_checks, sigop_count, ScriptCheck,
    ScriptVerifier, SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, SCRIPT_VERIFY_P2SH,
};
use crate::txindex::{DiskTxPos, TxIndexEntry};
use crate::validation::{
    check_block, height_script, is_final_tx, ChainStateError, CheckBlockFlags,
};

const ZERO_HASH: Hash256 = [0u8; 32];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CheckpointPolicy {
    /// Blocks conflicting with the synchronized checkpoint are rejected.
    Strict,
    /// Conflicts are logged, not rejected.
    Advisory,
}

#[derive(Clone, Debug)]
pub struct ChainOptions {
    pub flags: CheckBlockFlags,
    pub checkpoint_policy: CheckpointPolicy,
    /// Shell command run on every new best block; `%s` becomes the hash.
    pub block_notify: Option<String>,
}

impl Default for ChainOptions {
    fn default() -> Self {
        Self {
            flags: CheckBlockFlags::default(),
            checkpoint_policy: CheckpointPolicy::Strict,
            block_notify: None,
        }
    }
}

#[derive(Clone, Debug)]
struct Tip {
    hash: Hash256,
    height: i32,
    trust: U256,
    time: u32,
}

impl Tip {
    fn of(node: &BlockIndex) -> Self {
        Self {
            hash: node.block_hash,
            height: node.height,
            trust: node.chain_trust,
            time: node.time,
        }
    }
}

struct ChainInner {
    index: HashMap<Hash256, BlockIndex>,
    genesis: Option<Hash256>,
    best: Option<Tip>,
    blocks_since_ui_notify: u32,
    appends_since_flush: u32,
}

struct ChainEvent {
    block: Block,
    index: BlockIndex,
    connected: bool,
}

/// Node updates accumulated during one index transaction, applied to the
/// in-memory graph only after the transaction commits.
#[derive(Default)]
struct StagedBatch {
    nodes: HashMap<Hash256, BlockIndex>,
    tip: Option<Tip>,
    events: Vec<ChainEvent>,
}

impl StagedBatch {
    fn node<'a>(&'a self, inner: &'a ChainInner, hash: &Hash256) -> Option<&'a BlockIndex> {
        self.nodes.get(hash).or_else(|| inner.index.get(hash))
    }
}

pub struct ChainState<S> {
    params: ChainParams,
    options: ChainOptions,
    db: ChainDb<S>,
    files: BlockFileStore,
    verifier: Option<Arc<dyn ScriptVerifier>>,
    listeners: Vec<Arc<dyn ChainListener>>,
    shutdown: Arc<AtomicBool>,
    inner: Mutex<ChainInner>,
}

impl<S: KeyValueStore> ChainState<S> {
    pub fn new(
        params: ChainParams,
        options: ChainOptions,
        store: Arc<S>,
        files: BlockFileStore,
        verifier: Option<Arc<dyn ScriptVerifier>>,
    ) -> Result<Self, ChainStateError> {
        let db = ChainDb::new(store);
        let inner = Self::load(&db, &params)?;
        Ok(Self {
            params,
            options,
            db,
            files,
            verifier,
            listeners: Vec::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            inner: Mutex::new(inner),
        })
    }

    pub fn add_listener(&mut self, listener: Arc<dyn ChainListener>) {
        self.listeners.push(listener);
    }

    /// Script workers poll this; set it to wind down mid-batch.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn load(db: &ChainDb<S>, params: &ChainParams) -> Result<ChainInner, ChainStateError> {
        let mut nodes = db.scan_block_index()?;
        nodes.sort_by_key(|node| node.height);

        let mut index: HashMap<Hash256, BlockIndex> = HashMap::with_capacity(nodes.len());
        let mut genesis = None;
        for mut node in nodes {
            node.chain_trust = if node.is_genesis() {
                node.block_trust()
            } else {
                let prev = index.get(&node.prev).ok_or(ChainStateError::Consistency(
                    "block index references unknown parent",
                ))?;
                prev.chain_trust + node.block_trust()
            };
            if node.is_genesis() && node.block_hash == params.consensus.hash_genesis_block {
                genesis = Some(node.block_hash);
            }
            index.insert(node.block_hash, node);
        }

        let best = match db.read_best_chain()? {
            Some(hash) => {
                let node = index.get(&hash).ok_or(ChainStateError::Consistency(
                    "best chain points at unknown block",
                ))?;
                Some(Tip::of(node))
            }
            None => None,
        };

        Ok(ChainInner {
            index,
            genesis,
            best,
            blocks_since_ui_notify: 0,
            appends_since_flush: 0,
        })
    }

    // ---- read-side accessors -------------------------------------------

    pub fn best_hash(&self) -> Option<Hash256> {
        self.inner
            .lock()
            .expect("chain state lock")
            .best
            .as_ref()
            .map(|tip| tip.hash)
    }

    pub fn genesis_hash(&self) -> Option<Hash256> {
        self.inner.lock().expect("chain state lock").genesis
    }

    pub fn best_height(&self) -> Option<i32> {
        self.inner
            .lock()
            .expect("chain state lock")
            .best
            .as_ref()
            .map(|tip| tip.height)
    }

    pub fn block_index(&self, hash: &Hash256) -> Option<BlockIndex> {
        self.inner
            .lock()
            .expect("chain state lock")
            .index
            .get(hash)
            .cloned()
    }

    pub fn tx_index(&self, txid: &Hash256) -> Result<Option<TxIndexEntry>, ChainStateError> {
        Ok(self.db.read_tx_index(txid)?)
    }

    pub fn read_block(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let position = match self.block_index(hash) {
            Some(node) => BlockPosition {
                file_id: node.file_id,
                offset: node.block_offset,
            },
            None => return Ok(None),
        };
        Ok(Some(self.files.read_block(position)?))
    }

    pub fn is_initial_block_download(&self) -> bool {
        let inner = self.inner.lock().expect("chain state lock");
        Self::initial_download(&inner, adjusted_time())
    }

    fn initial_download(inner: &ChainInner, now: u32) -> bool {
        match &inner.best {
            Some(tip) => (tip.time as i64) < now as i64 - 24 * 60 * 60,
            None => true,
        }
    }

    pub fn block_locator(&self, hash: &Hash256) -> BlockLocator {
        let inner = self.inner.lock().expect("chain state lock");
        Self::locator(&inner, hash)
    }

    fn locator(inner: &ChainInner, hash: &Hash256) -> BlockLocator {
        let mut have = Vec::new();
        let mut cursor = match inner.index.get(hash) {
            Some(node) => node,
            None => return BlockLocator::default(),
        };
        let mut step = 1usize;
        loop {
            have.push(cursor.block_hash);
            if cursor.is_genesis() {
                break;
            }
            if have.len() > 10 {
                step *= 2;
            }
            let mut walked = cursor;
            for _ in 0..step {
                if walked.is_genesis() {
                    break;
                }
                match inner.index.get(&walked.prev) {
                    Some(prev) => walked = prev,
                    None => break,
                }
            }
            if walked.block_hash == cursor.block_hash {
                break;
            }
            cursor = walked;
        }
        BlockLocator { have }
    }

    /// The compact target the next block of the given proof type must use.
    /// Public because block producers need the same answer.
    pub fn next_bits(
        &self,
        prev_hash: &Hash256,
        is_proof_of_stake: bool,
    ) -> Result<u32, ChainStateError> {
        let inner = self.inner.lock().expect("chain state lock");
        self.expected_bits(&inner, prev_hash, is_proof_of_stake)
    }

    fn expected_bits(
        &self,
        inner: &ChainInner,
        prev_hash: &Hash256,
        is_proof_of_stake: bool,
    ) -> Result<u32, ChainStateError> {
        let prev = inner
            .index
            .get(prev_hash)
            .ok_or(ChainStateError::MissingParent)?;
        let last = Self::last_of_type(inner, Some(prev), is_proof_of_stake);
        let last_parent = last.and_then(|node| {
            if node.is_genesis() {
                None
            } else {
                inner.index.get(&node.prev)
            }
        });
        let prev_prev = Self::last_of_type(inner, last_parent, is_proof_of_stake);

        let as_target = |node: &BlockIndex| TargetBlock {
            height: node.height,
            time: node.time,
            bits: node.bits,
        };
        next_target_required(
            last.map(as_target),
            prev_prev.map(as_target),
            prev.height,
            is_proof_of_stake,
            &self.params.consensus,
        )
        .map_err(|_| ChainStateError::invalid("unworkable difficulty target", 100))
    }

    fn last_of_type<'a>(
        inner: &'a ChainInner,
        start: Option<&'a BlockIndex>,
        is_proof_of_stake: bool,
    ) -> Option<&'a BlockIndex> {
        let mut cursor = start?;
        loop {
            if cursor.is_proof_of_stake() == is_proof_of_stake {
                return Some(cursor);
            }
            if cursor.is_genesis() {
                return None;
            }
            cursor = inner.index.get(&cursor.prev)?;
        }
    }

    fn median_time_past(inner: &ChainInner, hash: &Hash256) -> i64 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut cursor = inner.index.get(hash);
        while let Some(node) = cursor {
            times.push(node.time as i64);
            if times.len() == MEDIAN_TIME_SPAN || node.is_genesis() {
                break;
            }
            cursor = inner.index.get(&node.prev);
        }
        times.sort_unstable();
        times[times.len() / 2]
    }

    // ---- block acceptance ----------------------------------------------

    /// The single entry point: context-free checks, contextual acceptance,
    /// disk append, index insertion, and best-chain handoff.
    pub fn process_block(&self, block: &Block) -> Result<(), ChainStateError> {
        let hash = block.hash();
        let mut inner = self.inner.lock().expect("chain state lock");
        if inner.index.contains_key(&hash) {
            return Err(ChainStateError::invalid("block already processed", 0));
        }
        check_block(block, self.options.flags, adjusted_time())?;
        self.accept_block(&mut inner, block, hash)
    }

    fn accept_block(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        hash: Hash256,
    ) -> Result<(), ChainStateError> {
        let is_genesis =
            hash == self.params.consensus.hash_genesis_block && inner.index.is_empty();
        let is_proof_of_stake = block.is_proof_of_stake();

        let (prev_hash, height) = if is_genesis {
            (ZERO_HASH, 0)
        } else {
            let prev = inner
                .index
                .get(&block.header.prev_block)
                .ok_or(ChainStateError::MissingParent)?;
            let height = prev.height + 1;
            let prev_time = prev.time;
            let prev_hash = prev.block_hash;

            if block.header.bits != self.expected_bits(inner, &prev_hash, is_proof_of_stake)? {
                return Err(ChainStateError::invalid("incorrect difficulty target", 100));
            }

            let median = Self::median_time_past(inner, &prev_hash);
            if (block.header.time as i64) <= median {
                return Err(ChainStateError::invalid(
                    "block's timestamp is too early",
                    0,
                ));
            }
            if block.header.time.saturating_add(FUTURE_DRIFT) < prev_time {
                return Err(ChainStateError::invalid(
                    "block's timestamp is before its parent",
                    0,
                ));
            }
            let max_offset = if block.header.time >= CHECKLOCKTIMEVERIFY_SWITCH_TIME {
                MAX_MEDIAN_TIME_OFFSET
            } else {
                MAX_MEDIAN_TIME_OFFSET_LEGACY
            };
            if (block.header.time as i64) > median + max_offset {
                return Err(ChainStateError::invalid(
                    "block's timestamp is too far past median time",
                    0,
                ));
            }

            for tx in &block.transactions {
                if !is_final_tx(tx, height, block.header.time as i64) {
                    return Err(ChainStateError::invalid(
                        "block contains a non-final transaction",
                        10,
                    ));
                }
            }

            if let Some(checkpoint) = self.params.consensus.checkpoint_at(height) {
                if checkpoint.hash != hash {
                    return Err(ChainStateError::invalid(
                        "rejected by checkpoint lock-in",
                        100,
                    ));
                }
            }
            self.check_sync_checkpoint(inner, &hash, &prev_hash, height)?;

            if !block.transactions[0].vin[0]
                .script_sig
                .starts_with(&height_script(height))
            {
                return Err(ChainStateError::invalid(
                    "block height mismatch in coinbase",
                    100,
                ));
            }

            (prev_hash, height)
        };

        let hash_proof_of_stake = if is_proof_of_stake && self.options.flags.check_stake {
            self.check_proof_of_stake(inner, block)?
        } else {
            ZERO_HASH
        };

        // Disk first; nothing in the index changes if the write fails.
        let payload = encode(block);
        let initial_download = Self::initial_download(inner, adjusted_time());
        let sync = !initial_download || inner.appends_since_flush + 1 >= SYNC_FLUSH_INTERVAL;
        let position = self.files.append(&payload, sync)?;
        inner.appends_since_flush = if sync {
            0
        } else {
            inner.appends_since_flush + 1
        };

        let node = self.add_to_block_index(
            inner,
            block,
            hash,
            prev_hash,
            height,
            position,
            hash_proof_of_stake,
        )?;

        let heavier = match &inner.best {
            Some(tip) => node.chain_trust > tip.trust,
            None => true,
        };
        if heavier {
            self.set_best_chain(inner, hash)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_to_block_index(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        hash: Hash256,
        prev_hash: Hash256,
        height: i32,
        position: BlockPosition,
        hash_proof_of_stake: Hash256,
    ) -> Result<BlockIndex, ChainStateError> {
        let prev_trust = inner
            .index
            .get(&prev_hash)
            .map(|node| node.chain_trust)
            .unwrap_or_default();

        let mut node = BlockIndex {
            block_hash: hash,
            prev: prev_hash,
            next_on_best: None,
            height,
            file_id: position.file_id,
            block_offset: position.offset,
            chain_trust: U256::zero(),
            money_supply: 0,
            mint: 0,
            version: block.header.version,
            merkle_root: block.header.merkle_root,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            flags: 0,
            stake_modifier: 0,
            stake_modifier_checksum: 0,
            hash_proof_of_stake,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
        };
        if block.is_proof_of_stake() {
            let coinstake = &block.transactions[1];
            node.set_proof_of_stake();
            node.prevout_stake = coinstake.vin[0].prevout;
            node.stake_time = coinstake.time;
        }
        node.chain_trust = prev_trust + node.block_trust();
        node.set_entropy_bit(stake_entropy_bit(height, &hash, &self.params.consensus));

        self.compute_stake_modifier_fields(inner, &mut node)?;

        if let Some(expected) = self.params.consensus.stake_modifier_checkpoint_at(height) {
            if node.stake_modifier_checksum != expected {
                return Err(ChainStateError::Checkpoint(
                    "stake modifier checkpoint mismatch",
                ));
            }
        }

        self.db.begin()?;
        if let Err(err) = self.db.write_block_index(&node) {
            self.db.abort();
            return Err(err.into());
        }
        self.db.commit()?;

        if node.is_genesis() && hash == self.params.consensus.hash_genesis_block {
            inner.genesis = Some(hash);
        }
        inner.index.insert(hash, node.clone());
        Ok(node)
    }

    fn compute_stake_modifier_fields(
        &self,
        inner: &ChainInner,
        node: &mut BlockIndex,
    ) -> Result<(), ChainStateError> {
        let (modifier, generated, prev_checksum) = if node.is_genesis() {
            let (modifier, generated) = compute_stake_modifier(&[], 0, 0, 0, true)
                .map_err(|_| ChainStateError::Consistency("genesis stake modifier failed"))?;
            (modifier, generated, None)
        } else {
            let prev = inner
                .index
                .get(&node.prev)
                .ok_or(ChainStateError::Consistency(
                    "stake modifier requires a known parent",
                ))?;

            // Last explicitly generated modifier on this branch.
            let mut cursor = prev;
            let (prev_modifier, prev_modifier_time) = loop {
                if cursor.generated_stake_modifier() {
                    break (cursor.stake_modifier, cursor.time);
                }
                if cursor.is_genesis() {
                    break (0, cursor.time);
                }
                cursor =
                    inner
                        .index
                        .get(&cursor.prev)
                        .ok_or(ChainStateError::Consistency(
                            "stake modifier walk hit unknown parent",
                        ))?;
            };

            let selection_start =
                (prev.time as i64 / MODIFIER_INTERVAL) * MODIFIER_INTERVAL - selection_interval();
            let mut window = Vec::new();
            let mut cursor = Some(prev);
            while let Some(walked) = cursor {
                if (walked.time as i64) < selection_start {
                    break;
                }
                window.push(CandidateBlock {
                    hash: walked.block_hash,
                    hash_proof: walked.selection_proof(),
                    time: walked.time,
                    entropy_bit: walked.entropy_bit(),
                    is_proof_of_stake: walked.is_proof_of_stake(),
                });
                if walked.is_genesis() {
                    break;
                }
                cursor = inner.index.get(&walked.prev);
            }

            let (modifier, generated) =
                compute_stake_modifier(&window, prev.time, prev_modifier, prev_modifier_time, false)
                    .map_err(|_| {
                        ChainStateError::invalid("unable to compute stake modifier", 0)
                    })?;
            (modifier, generated, Some(prev.stake_modifier_checksum))
        };

        node.stake_modifier = modifier;
        if generated {
            node.set_generated_stake_modifier();
        }
        node.stake_modifier_checksum = stake_modifier_checksum(
            prev_checksum,
            node.flags,
            &node.hash_proof_of_stake,
            modifier,
        );
        Ok(())
    }

    /// Resolves the staked output and verifies the kernel; returns the
    /// proof hash recorded on the index node.
    fn check_proof_of_stake(
        &self,
        inner: &ChainInner,
        block: &Block,
    ) -> Result<Hash256, ChainStateError> {
        let coinstake = &block.transactions[1];
        let stake_input = &coinstake.vin[0];

        let entry =
            self.db
                .read_tx_index(&stake_input.prevout.hash)?
                .ok_or(ChainStateError::invalid(
                    "staked output not found in transaction index",
                    0,
                ))?;
        let prev_tx = self.files.read_tx(entry.pos)?;
        let output = prev_tx
            .vout
            .get(stake_input.prevout.index as usize)
            .ok_or(ChainStateError::invalid("staked output out of range", 100))?;
        let block_from = self.files.read_header(BlockPosition {
            file_id: entry.pos.file_id,
            offset: entry.pos.block_offset,
        })?;

        let modifier = Self::kernel_stake_modifier(inner, &block_from.hash(), block_from.time)
            .ok_or(ChainStateError::invalid(
                "stake modifier not yet available for kernel",
                0,
            ))?;

        let kernel = KernelInput {
            stake_modifier: modifier,
            block_from_time: block_from.time,
            tx_offset: entry.pos.tx_offset - entry.pos.block_offset,
            prev_tx_time: prev_tx.time,
            prevout_index: stake_input.prevout.index,
            value: output.value,
            tx_time: coinstake.time,
        };
        check_stake_kernel(block.header.bits, &kernel)
            .map_err(|_| ChainStateError::invalid("check proof-of-stake failed", 100))
    }

    /// The modifier a kernel must be seeded with: the first one generated
    /// at least a full selection interval after the staked output's block,
    /// so stakers cannot precompute it.
    fn kernel_stake_modifier(
        inner: &ChainInner,
        from_hash: &Hash256,
        from_time: u32,
    ) -> Option<u64> {
        let interval = selection_interval();
        let mut cursor = inner.index.get(from_hash)?;
        let mut modifier = None;
        loop {
            if cursor.generated_stake_modifier() {
                modifier = Some(cursor.stake_modifier);
            }
            if cursor.time as i64 >= from_time as i64 + interval {
                break;
            }
            cursor = inner.index.get(&cursor.next_on_best?)?;
        }
        modifier
    }

    fn check_sync_checkpoint(
        &self,
        inner: &ChainInner,
        hash: &Hash256,
        prev_hash: &Hash256,
        height: i32,
    ) -> Result<(), ChainStateError> {
        let checkpoint_hash = match self.db.read_sync_checkpoint()? {
            Some(checkpoint) => checkpoint,
            None => return Ok(()),
        };
        let checkpoint = match inner.index.get(&checkpoint_hash) {
            Some(node) => node,
            None => return Ok(()),
        };

        let violation = if height <= checkpoint.height {
            // The checkpointed chain already owns this height.
            true
        } else {
            // The ancestor at the checkpoint height must be the checkpoint.
            let mut cursor = inner.index.get(prev_hash);
            while let Some(node) = cursor {
                if node.height == checkpoint.height {
                    break;
                }
                cursor = inner.index.get(&node.prev);
            }
            cursor.map(|node| node.block_hash) != Some(checkpoint_hash)
        };

        if !violation {
            return Ok(());
        }
        match self.options.checkpoint_policy {
            CheckpointPolicy::Strict => Err(ChainStateError::Checkpoint(
                "rejected by synchronized checkpoint",
            )),
            CheckpointPolicy::Advisory => {
                log_warn!(
                    "block {} conflicts with the synchronized checkpoint {}",
                    hash256_to_hex(hash),
                    hash256_to_hex(&checkpoint_hash)
                );
                Ok(())
            }
        }
    }

    // ---- best-chain selection ------------------------------------------

    fn set_best_chain(
        &self,
        inner: &mut ChainInner,
        new_hash: Hash256,
    ) -> Result<(), ChainStateError> {
        let new_node = inner
            .index
            .get(&new_hash)
            .cloned()
            .ok_or(ChainStateError::Consistency("best candidate not indexed"))?;

        // Decide the batch shape before writing anything.
        let (disconnects, connects, postponed) = match &inner.best {
            None => {
                if new_hash != self.params.consensus.hash_genesis_block {
                    return Err(ChainStateError::Consistency(
                        "first best block is not genesis",
                    ));
                }
                (Vec::new(), vec![new_hash], Vec::new())
            }
            Some(best) if new_node.prev == best.hash => {
                (Vec::new(), vec![new_hash], Vec::new())
            }
            Some(best) => {
                // A fork won. Reorganize to the nearest ancestor of the
                // new block that already beats the old chain; heavier
                // descendants are postponed into their own transactions.
                let mut intermediate = new_hash;
                let mut postponed = Vec::new();
                loop {
                    let node = inner
                        .index
                        .get(&intermediate)
                        .ok_or(ChainStateError::Consistency("fork walk hit unknown block"))?;
                    if node.is_genesis() {
                        break;
                    }
                    let prev = inner
                        .index
                        .get(&node.prev)
                        .ok_or(ChainStateError::Consistency("fork walk hit unknown parent"))?;
                    if prev.chain_trust <= best.trust {
                        break;
                    }
                    postponed.push(intermediate);
                    intermediate = node.prev;
                }
                postponed.reverse();

                let fork = Self::fork_point(inner, &best.hash, &intermediate)?;
                let mut disconnects = Vec::new();
                let mut cursor = best.hash;
                while cursor != fork {
                    disconnects.push(cursor);
                    cursor = inner.index[&cursor].prev;
                }
                let mut connects = Vec::new();
                let mut cursor = intermediate;
                while cursor != fork {
                    connects.push(cursor);
                    cursor = inner.index[&cursor].prev;
                }
                connects.reverse();
                log_info!(
                    "reorganize: disconnecting {} blocks, connecting {} blocks over fork {}",
                    disconnects.len(),
                    connects.len(),
                    hash256_to_hex(&fork)
                );
                (disconnects, connects, postponed)
            }
        };

        let mut all_events = Vec::new();
        self.apply_batch(inner, &disconnects, &connects, &mut all_events)
            .inspect_err(|err| {
                if !err.is_fatal() {
                    self.invalid_chain_found(inner, &new_hash);
                }
            })?;

        // Postponed blocks ride separate transactions; failure here leaves
        // a valid, already-committed best chain behind.
        for hash in postponed {
            match self.apply_batch(inner, &[], &[hash], &mut all_events) {
                Ok(()) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    log_error!(
                        "failed to connect postponed block {}: {err}",
                        hash256_to_hex(&hash)
                    );
                    self.invalid_chain_found(inner, &hash);
                    break;
                }
            }
        }

        self.finish_best_chain_update(inner, all_events);
        Ok(())
    }

    /// One index transaction: disconnect then connect the given blocks,
    /// commit, and merge the staged node updates into the graph.
    fn apply_batch(
        &self,
        inner: &mut ChainInner,
        disconnects: &[Hash256],
        connects: &[Hash256],
        all_events: &mut Vec<ChainEvent>,
    ) -> Result<(), ChainStateError> {
        let mut staged = StagedBatch::default();
        self.db.begin()?;
        let result = (|| -> Result<(), ChainStateError> {
            for hash in disconnects {
                self.stage_disconnect(inner, hash, &mut staged)?;
            }
            for hash in connects {
                self.stage_connect(inner, hash, &mut staged)?;
            }
            Ok(())
        })();
        match result {
            Ok(()) => self.db.commit()?,
            Err(err) => {
                self.db.abort();
                return Err(err);
            }
        }

        for (hash, node) in staged.nodes {
            inner.index.insert(hash, node);
        }
        if let Some(tip) = staged.tip {
            inner.best = Some(tip);
        }
        all_events.extend(staged.events);
        Ok(())
    }

    fn stage_connect(
        &self,
        inner: &ChainInner,
        hash: &Hash256,
        staged: &mut StagedBatch,
    ) -> Result<(), ChainStateError> {
        let mut node = staged
            .node(inner, hash)
            .cloned()
            .ok_or(ChainStateError::Consistency("connect target not indexed"))?;
        let block = self.files.read_block(BlockPosition {
            file_id: node.file_id,
            offset: node.block_offset,
        })?;

        let prev_money_supply = if node.is_genesis() {
            0
        } else {
            staged
                .node(inner, &node.prev)
                .ok_or(ChainStateError::Consistency("connect parent not indexed"))?
                .money_supply
        };

        let (mint, money_supply) =
            self.connect_block_impl(inner, &block, &node, false, prev_money_supply)?;

        node.mint = mint;
        node.money_supply = money_supply;
        node.next_on_best = None;
        self.db.write_block_index(&node)?;

        if !node.is_genesis() {
            let mut prev = staged
                .node(inner, &node.prev)
                .cloned()
                .ok_or(ChainStateError::Consistency("connect parent not indexed"))?;
            prev.next_on_best = Some(*hash);
            self.db.write_block_index(&prev)?;
            staged.nodes.insert(prev.block_hash, prev);
        }

        self.db.write_best_chain(hash)?;
        staged.tip = Some(Tip::of(&node));
        staged.nodes.insert(*hash, node.clone());
        staged.events.push(ChainEvent {
            block,
            index: node,
            connected: true,
        });
        Ok(())
    }

    fn stage_disconnect(
        &self,
        inner: &ChainInner,
        hash: &Hash256,
        staged: &mut StagedBatch,
    ) -> Result<(), ChainStateError> {
        let node = staged
            .node(inner, hash)
            .cloned()
            .ok_or(ChainStateError::Consistency("disconnect target not indexed"))?;
        if node.is_genesis() {
            return Err(ChainStateError::Consistency("cannot disconnect genesis"));
        }
        let block = self.files.read_block(BlockPosition {
            file_id: node.file_id,
            offset: node.block_offset,
        })?;

        self.disconnect_block_impl(&block)?;

        let mut prev = staged
            .node(inner, &node.prev)
            .cloned()
            .ok_or(ChainStateError::Consistency("disconnect parent not indexed"))?;
        prev.next_on_best = None;
        self.db.write_block_index(&prev)?;
        self.db.write_best_chain(&prev.block_hash)?;
        staged.tip = Some(Tip::of(&prev));
        staged.nodes.insert(prev.block_hash, prev);
        staged.events.push(ChainEvent {
            block,
            index: node,
            connected: false,
        });
        Ok(())
    }

    fn fork_point(
        inner: &ChainInner,
        left_tip: &Hash256,
        right_tip: &Hash256,
    ) -> Result<Hash256, ChainStateError> {
        let height_of = |hash: &Hash256| {
            inner
                .index
                .get(hash)
                .map(|node| node.height)
                .ok_or(ChainStateError::Consistency("fork point walk lost a block"))
        };
        let mut left = *left_tip;
        let mut right = *right_tip;
        let mut left_height = height_of(&left)?;
        let mut right_height = height_of(&right)?;
        while left_height > right_height {
            left = inner.index[&left].prev;
            left_height -= 1;
        }
        while right_height > left_height {
            right = inner.index[&right].prev;
            right_height -= 1;
        }
        while left != right {
            left = inner.index[&left].prev;
            right = inner.index[&right].prev;
        }
        Ok(left)
    }

    fn finish_best_chain_update(&self, inner: &mut ChainInner, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        for event in &events {
            for listener in &self.listeners {
                if event.connected {
                    listener.on_block_connected(&event.block, &event.index);
                } else {
                    listener.on_block_disconnected(&event.block, &event.index);
                }
            }
        }

        let initial_download = Self::initial_download(inner, adjusted_time());
        inner.blocks_since_ui_notify += 1;
        if !initial_download || inner.blocks_since_ui_notify >= UI_NOTIFY_INTERVAL {
            inner.blocks_since_ui_notify = 0;
            for listener in &self.listeners {
                listener.on_blocks_changed();
            }
        }

        let tip = match &inner.best {
            Some(tip) => tip.clone(),
            None => return,
        };
        log_info!(
            "new best chain: height={} hash={} trust={}",
            tip.height,
            hash256_to_hex(&tip.hash),
            tip.trust
        );
        if !initial_download {
            let locator = Self::locator(inner, &tip.hash);
            for listener in &self.listeners {
                listener.on_best_chain(&locator);
            }
        }
        if let Some(command) = &self.options.block_notify {
            let command = command.replace("%s", &hash256_to_hex(&tip.hash));
            std::thread::spawn(move || {
                let _ = Command::new("sh").arg("-c").arg(command).status();
            });
        }
    }

    fn invalid_chain_found(&self, inner: &ChainInner, hash: &Hash256) {
        let trust = inner
            .index
            .get(hash)
            .map(|node| node.chain_trust)
            .unwrap_or_default();
        log_warn!(
            "invalid chain found: tip {} trust {}",
            hash256_to_hex(hash),
            trust
        );
    }

    // ---- block connection ----------------------------------------------

    /// Dry-run connection against the current tip; nothing is written.
    /// Block producers use this to validate a candidate before announcing.
    pub fn verify_block_connects(&self, block: &Block) -> Result<(), ChainStateError> {
        let inner = self.inner.lock().expect("chain state lock");
        let tip = inner
            .best
            .as_ref()
            .ok_or(ChainStateError::Consistency("no best chain yet"))?;
        if block.header.prev_block != tip.hash {
            return Err(ChainStateError::invalid("block does not extend the tip", 0));
        }
        let node = BlockIndex {
            block_hash: block.hash(),
            prev: tip.hash,
            next_on_best: None,
            height: tip.height + 1,
            file_id: u32::MAX,
            block_offset: 0,
            chain_trust: U256::zero(),
            money_supply: 0,
            mint: 0,
            version: block.header.version,
            merkle_root: block.header.merkle_root,
            time: block.header.time,
            bits: block.header.bits,
            nonce: block.header.nonce,
            flags: if block.is_proof_of_stake() {
                FLAG_PROOF_OF_STAKE
            } else {
                0
            },
            stake_modifier: 0,
            stake_modifier_checksum: 0,
            hash_proof_of_stake: ZERO_HASH,
            prevout_stake: OutPoint::null(),
            stake_time: 0,
        };
        self.connect_block_impl(&inner, block, &node, true, 0)
            .map(|_| ())
    }

    /// Connects one block's transactions: BIP30, input fetching through
    /// the queued overlay, value conservation, sigop accounting, script
    /// verification, spent-vector updates, and the reward rules. Returns
    /// `(mint, money_supply)` for the index node.
    fn connect_block_impl(
        &self,
        inner: &ChainInner,
        block: &Block,
        node: &BlockIndex,
        just_check: bool,
        prev_money_supply: i64,
    ) -> Result<(i64, i64), ChainStateError> {
        // Re-run the context-free rules; proof of work was checked before
        // the block ever reached disk, signatures on first acceptance.
        let mut flags = self.options.flags;
        flags.check_pow = false;
        flags.check_sig = false;
        check_block(block, flags, adjusted_time())?;

        let txids: Vec<Hash256> = block.transactions.iter().map(|tx| tx.txid()).collect();
        let in_block: HashMap<Hash256, usize> = txids
            .iter()
            .enumerate()
            .map(|(index, txid)| (*txid, index))
            .collect();

        // Transaction offsets within the block file, skipped on dry runs.
        let tx_offsets: Vec<u32> = if just_check {
            vec![0; block.transactions.len()]
        } else {
            let mut offsets = Vec::with_capacity(block.transactions.len());
            let mut cursor = node.block_offset
                + 8
                + HEADER_SIZE as u32
                + compact_size_len(block.transactions.len() as u64);
            for tx in &block.transactions {
                offsets.push(cursor);
                cursor += tx.serialized_size() as u32;
            }
            offsets
        };

        // BIP30: a transaction hash may only recur once its previous
        // incarnation is fully spent.
        for txid in &txids {
            if let Some(existing) = self.db.read_tx_index(txid)? {
                if existing.has_unspent_output() {
                    return Err(ChainStateError::invalid(
                        "unspent duplicate transaction on the chain",
                        100,
                    ));
                }
            }
        }

        let mut queued: HashMap<Hash256, TxIndexEntry> = HashMap::new();
        let mut script_checks: Vec<ScriptCheck<'_>> = Vec::new();
        let mut sigops = 0u32;
        let mut total_value_in = 0i64;
        let mut total_value_out = 0i64;
        let mut fees = 0i64;

        for (tx_index, tx) in block.transactions.iter().enumerate() {
            let txid = txids[tx_index];
            // Dry runs have no disk position; any non-null locator keeps
            // the spent-slot bookkeeping honest.
            let this_pos = if just_check {
                DiskTxPos::new(0, 0, 0)
            } else {
                DiskTxPos::new(node.file_id, node.block_offset, tx_offsets[tx_index])
            };

            for input in &tx.vin {
                sigops += sigop_count(&input.script_sig, false);
            }
            for output in &tx.vout {
                sigops += sigop_count(&output.script_pubkey, false);
            }

            let tx_value_out = tx
                .value_out()
                .filter(|total| money_range(*total))
                .ok_or(ChainStateError::invalid("output total out of range", 100))?;

            if tx.is_coinbase() {
                total_value_out = checked_money_add(total_value_out, tx_value_out)?;
                queued.insert(txid, TxIndexEntry::new(this_pos, tx.vout.len()));
                continue;
            }

            let is_coinstake = tx.is_coinstake();
            let mut tx_value_in = 0i64;
            let mut age_inputs: Vec<AgeInput> =
                Vec::with_capacity(if is_coinstake { tx.vin.len() } else { 0 });
            for (input_index, input) in tx.vin.iter().enumerate() {
                let prev_hash = input.prevout.hash;
                let prev_index = input.prevout.index as usize;

                if !queued.contains_key(&prev_hash) {
                    let entry = self
                        .db
                        .read_tx_index(&prev_hash)?
                        .ok_or(ChainStateError::invalid(
                            "input transaction index missing",
                            0,
                        ))?;
                    queued.insert(prev_hash, entry);
                }
                let prev_pos = {
                    let entry = queued.get(&prev_hash).expect("inserted above");
                    if prev_index >= entry.spent.len() {
                        return Err(ChainStateError::invalid("prevout index out of range", 100));
                    }
                    if !entry.spent[prev_index].is_null() {
                        return Err(ChainStateError::invalid("input already spent", 100));
                    }
                    entry.pos
                };

                let prev_tx = match in_block.get(&prev_hash) {
                    Some(index) => block.transactions[*index].clone(),
                    None => self.files.read_tx(prev_pos)?,
                };
                if tx.time < prev_tx.time {
                    return Err(ChainStateError::invalid(
                        "transaction timestamp earlier than input transaction",
                        100,
                    ));
                }
                let output = prev_tx
                    .vout
                    .get(prev_index)
                    .ok_or(ChainStateError::invalid("prevout index out of range", 100))?;
                if !money_range(output.value) {
                    return Err(ChainStateError::invalid("input value out of range", 100));
                }

                if prev_tx.is_coinbase() || prev_tx.is_coinstake() {
                    let minted_height = match in_block.get(&prev_hash) {
                        Some(_) => node.height,
                        None => self.height_of_position(inner, prev_pos)?,
                    };
                    if node.height - minted_height < self.params.consensus.coinbase_maturity {
                        return Err(ChainStateError::invalid(
                            "tried to spend an immature minted output",
                            0,
                        ));
                    }
                }

                tx_value_in = checked_money_add(tx_value_in, output.value)?;
                if is_coinstake {
                    // The age gate anchors on the block holding the spent
                    // output, the same anchor the kernel check uses.
                    let block_from_time = match in_block.get(&prev_hash) {
                        Some(_) => block.header.time,
                        None => {
                            self.files
                                .read_header(BlockPosition {
                                    file_id: prev_pos.file_id,
                                    offset: prev_pos.block_offset,
                                })?
                                .time
                        }
                    };
                    age_inputs.push(AgeInput {
                        value: output.value,
                        prev_tx_time: prev_tx.time,
                        block_from_time,
                    });
                }

                if is_pay_to_script_hash(&output.script_pubkey) {
                    sigops += p2sh_sigop_count(&input.script_sig, &output.script_pubkey);
                }
                if !just_check && self.verifier.is_some() {
                    let mut script_flags = SCRIPT_VERIFY_P2SH;
                    if tx.time >= CHECKLOCKTIMEVERIFY_SWITCH_TIME {
                        script_flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
                    }
                    script_checks.push(ScriptCheck {
                        tx,
                        input_index,
                        script_pubkey: output.script_pubkey.clone(),
                        value: output.value,
                        flags: script_flags,
                    });
                }

                queued
                    .get_mut(&prev_hash)
                    .expect("inserted above")
                    .spent[prev_index] = this_pos;
            }

            if sigops > MAX_BLOCK_SIGOPS {
                return Err(ChainStateError::invalid("too many sigops", 100));
            }

            if is_coinstake {
                // Fees are destroyed on stake blocks: the coinstake may
                // only mint the coin-age reward, nothing credits fees.
                let stake_reward = tx_value_out - tx_value_in;
                let age = coin_age(tx.time, &age_inputs).map_err(|_| {
                    ChainStateError::invalid("unable to account coinstake age", 100)
                })?;
                if stake_reward > proof_of_stake_reward(age) {
                    return Err(ChainStateError::invalid("coinstake pays too much", 100));
                }
            } else {
                if tx_value_in < tx_value_out {
                    return Err(ChainStateError::invalid(
                        "input value below output value",
                        100,
                    ));
                }
                fees = checked_money_add(fees, tx_value_in - tx_value_out)?;
            }

            total_value_in = checked_money_add(total_value_in, tx_value_in)?;
            total_value_out = checked_money_add(total_value_out, tx_value_out)?;
            queued.insert(txid, TxIndexEntry::new(this_pos, tx.vout.len()));
        }

        if block.is_proof_of_work() {
            let reward = proof_of_work_reward(node.bits, &self.params.consensus)
                .map_err(|_| ChainStateError::invalid("unworkable difficulty target", 100))?;
            let coinbase_out = block.transactions[0].value_out().unwrap_or(0);
            if coinbase_out > reward + fees {
                return Err(ChainStateError::invalid("coinbase pays too much", 100));
            }
        }

        if !script_checks.is_empty() {
            let verifier = self.verifier.as_ref().expect("checks imply a verifier");
            run_script_checks(verifier.as_ref(), &script_checks, &self.shutdown)
                .map_err(|_| ChainStateError::invalid("script verification failed", 100))?;
        }

        if just_check {
            return Ok((0, 0));
        }

        for (txid, entry) in &queued {
            self.db.update_tx_index(txid, entry)?;
        }

        let mint = total_value_out - total_value_in + fees;
        let money_supply = prev_money_supply + total_value_out - total_value_in;
        Ok((mint, money_supply))
    }

    /// Height of the block record holding a transaction, resolved through
    /// its header hash.
    fn height_of_position(
        &self,
        inner: &ChainInner,
        pos: DiskTxPos,
    ) -> Result<i32, ChainStateError> {
        let header = self.files.read_header(BlockPosition {
            file_id: pos.file_id,
            offset: pos.block_offset,
        })?;
        inner
            .index
            .get(&header.hash())
            .map(|node| node.height)
            .ok_or(ChainStateError::Consistency(
                "block record not present in the index",
            ))
    }

    /// Reverses one block: restore every spent slot it filled, then drop
    /// its own transaction records.
    fn disconnect_block_impl(&self, block: &Block) -> Result<(), ChainStateError> {
        for tx in block.transactions.iter().rev() {
            let txid = tx.txid();
            if !tx.is_coinbase() {
                for input in tx.vin.iter().rev() {
                    let mut entry = self.db.read_tx_index(&input.prevout.hash)?.ok_or(
                        ChainStateError::Consistency("transaction index missing during disconnect"),
                    )?;
                    let prev_index = input.prevout.index as usize;
                    if prev_index >= entry.spent.len() {
                        return Err(ChainStateError::Consistency(
                            "spent vector shorter than prevout index",
                        ));
                    }
                    entry.spent[prev_index] = DiskTxPos::null();
                    self.db.update_tx_index(&input.prevout.hash, &entry)?;
                }
            }
            self.db.erase_tx_index(&txid)?;
        }
        Ok(())
    }
}

fn checked_money_add(total: i64, value: i64) -> Result<i64, ChainStateError> {
    total
        .checked_add(value)
        .filter(|sum| money_range(*sum))
        .ok_or(ChainStateError::invalid("value total out of range", 100))
}

fn compact_size_len(value: u64) -> u32 {
    if value < 0xfd {
        1
    } else if value <= 0xffff {
        3
    } else if value <= 0xffff_ffff {
        5
    } else {
        9
    }
}

fn adjusted_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_lengths() {
        assert_eq!(compact_size_len(0), 1);
        assert_eq!(compact_size_len(0xfc), 1);
        assert_eq!(compact_size_len(0xfd), 3);
        assert_eq!(compact_size_len(0x1_0000), 5);
        assert_eq!(compact_size_len(u64::MAX), 9);
    }
}
