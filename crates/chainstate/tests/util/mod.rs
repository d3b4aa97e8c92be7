#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use novad_chainstate::blockfiles::BlockFileStore;
use novad_chainstate::notify::ChainListener;
use novad_chainstate::state::{ChainOptions, ChainState, CheckpointPolicy};
use novad_chainstate::validation::{height_script, CheckBlockFlags};
use novad_chainstate::BlockIndex;
use novad_consensus::constants::CURRENT_BLOCK_VERSION;
use novad_consensus::money::COIN;
use novad_consensus::params::{chain_params, Network};
use novad_consensus::{ChainParams, Hash256};
use novad_pow::difficulty::target_to_compact;
use novad_primitives::block::{Block, BlockHeader};
use novad_primitives::merkle::merkle_root;
use novad_primitives::outpoint::OutPoint;
use novad_primitives::transaction::{Transaction, TxIn, TxOut};
use novad_storage::memory::MemoryStore;

pub const BASE_TIME: u32 = 1_700_000_000;
pub const SPACING: u32 = 16;
pub const COINBASE_VALUE: i64 = 50 * COIN;

pub fn p2pkh_script(tag: u8) -> Vec<u8> {
    let mut script = Vec::with_capacity(25);
    script.extend_from_slice(&[0x76, 0xa9, 0x14]);
    script.extend_from_slice(&[tag; 20]);
    script.extend_from_slice(&[0x88, 0xac]);
    script
}

pub fn coinbase_tx(height: i32, time: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    let mut script_sig = height_script(height);
    // Coinbase scripts must be at least two bytes.
    if script_sig.len() < 2 {
        script_sig.push(0x2a);
    }
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout: OutPoint::null(),
            script_sig,
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn spend_tx(prevout: OutPoint, time: u32, value: i64, script_pubkey: Vec<u8>) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn {
            prevout,
            script_sig: vec![0x01, 0x02],
            sequence: u32::MAX,
        }],
        vout: vec![TxOut {
            value,
            script_pubkey,
        }],
        lock_time: 0,
    }
}

pub fn make_block(
    prev_block: Hash256,
    time: u32,
    bits: u32,
    nonce: u32,
    transactions: Vec<Transaction>,
    signature: Vec<u8>,
) -> Block {
    let txids: Vec<Hash256> = transactions.iter().map(|tx| tx.txid()).collect();
    Block {
        header: BlockHeader {
            version: CURRENT_BLOCK_VERSION,
            prev_block,
            merkle_root: merkle_root(&txids),
            time,
            bits,
            nonce,
        },
        transactions,
        signature,
    }
}

pub struct Harness {
    pub chain: ChainState<MemoryStore>,
    pub params: ChainParams,
    pub genesis: Block,
    pub store: Arc<MemoryStore>,
    pub dir: tempfile::TempDir,
}

/// Regtest chain state over a memory store and tempdir block files, with a
/// synthetic genesis substituted into the parameters. Proof checks are off
/// so headers need no mining; structural rules stay on.
pub fn setup() -> Harness {
    setup_with(Vec::new())
}

pub fn setup_with(listeners: Vec<Arc<dyn ChainListener>>) -> Harness {
    let mut params = chain_params(Network::Regtest);
    let bits = target_to_compact(&params.consensus.pow_limit);
    let genesis = make_block(
        [0u8; 32],
        BASE_TIME,
        bits,
        0,
        vec![coinbase_tx(0, BASE_TIME, 0, vec![0x51])],
        Vec::new(),
    );
    params.consensus.hash_genesis_block = genesis.hash();

    let dir = tempfile::tempdir().expect("tempdir");
    let files =
        BlockFileStore::new(dir.path(), params.message_start, 16_000_000).expect("block files");
    let options = ChainOptions {
        flags: CheckBlockFlags {
            check_pow: false,
            check_merkle: true,
            check_sig: false,
            check_stake: false,
        },
        checkpoint_policy: CheckpointPolicy::Strict,
        block_notify: None,
    };
    let store = Arc::new(MemoryStore::new());
    let mut chain = ChainState::new(
        params.clone(),
        options,
        Arc::clone(&store),
        files,
        None,
    )
    .expect("chain state");
    for listener in listeners {
        chain.add_listener(listener);
    }
    Harness {
        chain,
        params,
        genesis,
        store,
        dir,
    }
}

impl Harness {
    pub fn node(&self, hash: &Hash256) -> BlockIndex {
        self.chain.block_index(hash).expect("block index entry")
    }

    /// A work block on `prev` with the expected target, extra transactions
    /// after the coinbase. `nonce` keeps equal-height fork blocks distinct.
    pub fn build_pow_block(
        &self,
        prev_hash: &Hash256,
        nonce: u32,
        coinbase_script: Vec<u8>,
        extra: Vec<Transaction>,
    ) -> Block {
        let prev = self.node(prev_hash);
        let height = prev.height + 1;
        let time = BASE_TIME + height as u32 * SPACING;
        let bits = self.chain.next_bits(prev_hash, false).expect("next bits");
        let mut transactions = vec![coinbase_tx(height, time, COINBASE_VALUE, coinbase_script)];
        transactions.extend(extra);
        make_block(*prev_hash, time, bits, nonce, transactions, Vec::new())
    }

    /// Extends the best chain by `count` work blocks; returns their hashes.
    pub fn extend_chain(&self, count: usize, nonce: u32) -> Vec<Hash256> {
        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let tip = self.chain.best_hash().expect("best hash");
            let block = self.build_pow_block(&tip, nonce, p2pkh_script(0x77), Vec::new());
            self.chain.process_block(&block).expect("process block");
            hashes.push(block.hash());
        }
        hashes
    }
}

/// Records connect/disconnect callbacks in arrival order.
#[derive(Default)]
pub struct RecordingListener {
    pub events: Mutex<Vec<(Hash256, bool)>>,
}

impl RecordingListener {
    pub fn snapshot(&self) -> Vec<(Hash256, bool)> {
        self.events.lock().expect("listener lock").clone()
    }
}

impl ChainListener for RecordingListener {
    fn on_block_connected(&self, block: &Block, _index: &BlockIndex) {
        self.events
            .lock()
            .expect("listener lock")
            .push((block.hash(), true));
    }

    fn on_block_disconnected(&self, block: &Block, _index: &BlockIndex) {
        self.events
            .lock()
            .expect("listener lock")
            .push((block.hash(), false));
    }
}
