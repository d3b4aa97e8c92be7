mod util;

use novad_primitives::outpoint::OutPoint;
use novad_primitives::transaction::{Transaction, TxIn, TxOut};

use util::{coinbase_tx, make_block, p2pkh_script, setup, spend_tx, BASE_TIME, COINBASE_VALUE, SPACING};

#[test]
fn unspent_duplicate_transaction_is_rejected() {
    let harness = setup();
    harness
        .chain
        .process_block(&harness.genesis)
        .expect("install genesis");
    let chain = harness.extend_chain(11, 0xa0);

    let coinbase1_txid = harness
        .chain
        .read_block(&chain[0])
        .expect("read block")
        .expect("block 1 on disk")
        .transactions[0]
        .txid();
    let spend = spend_tx(
        OutPoint::new(coinbase1_txid, 0),
        BASE_TIME + 12 * SPACING,
        0,
        p2pkh_script(0x31),
    );
    let spend_txid = spend.txid();
    let block12 = harness.build_pow_block(&chain[10], 0xa0, p2pkh_script(0x12), vec![spend.clone()]);
    harness.chain.process_block(&block12).expect("block 12");

    // The same transaction again while its output is still unspent.
    let block13 = harness.build_pow_block(&block12.hash(), 0xa0, p2pkh_script(0x13), vec![spend]);
    let err = harness
        .chain
        .process_block(&block13)
        .expect_err("duplicate rejected");
    assert_eq!(err.dos_score(), 100);

    // Chain state is untouched: same tip, same index entries.
    assert_eq!(harness.chain.best_hash(), Some(block12.hash()));
    let entry = harness
        .chain
        .tx_index(&spend_txid)
        .expect("tx index read")
        .expect("original spend still indexed");
    assert!(entry.spent.iter().all(|pos| pos.is_null()));
    let funded = harness
        .chain
        .tx_index(&coinbase1_txid)
        .expect("tx index read")
        .expect("coinbase 1 indexed");
    assert!(!funded.spent[0].is_null());
}

#[test]
fn sigop_limit_is_enforced_exactly() {
    const OP_CHECKSIG: u8 = 0xac;

    let harness = setup();
    harness
        .chain
        .process_block(&harness.genesis)
        .expect("install genesis");
    let genesis_hash = harness.genesis.hash();

    // One over the cap.
    let over = harness.build_pow_block(
        &genesis_hash,
        1,
        vec![OP_CHECKSIG; 20_001],
        Vec::new(),
    );
    let err = harness
        .chain
        .process_block(&over)
        .expect_err("sigop overflow rejected");
    assert_eq!(err.dos_score(), 100);
    assert_eq!(harness.chain.best_height(), Some(0));

    // Exactly at the cap.
    let at_limit = harness.build_pow_block(
        &genesis_hash,
        2,
        vec![OP_CHECKSIG; 20_000],
        Vec::new(),
    );
    harness
        .chain
        .process_block(&at_limit)
        .expect("limit block accepted");
    assert_eq!(harness.chain.best_hash(), Some(at_limit.hash()));
}

fn coinstake_block(
    harness: &util::Harness,
    prev_hash: &novad_consensus::Hash256,
    staked: OutPoint,
    block_time: u32,
    coinstake_time: u32,
) -> novad_primitives::block::Block {
    let height = harness.node(prev_hash).height + 1;
    let bits = harness
        .chain
        .next_bits(prev_hash, true)
        .expect("stake bits");
    let coinbase = coinbase_tx(height, block_time, 0, Vec::new());
    let coinstake = Transaction {
        version: 1,
        time: coinstake_time,
        vin: vec![TxIn {
            prevout: staked,
            script_sig: vec![0x01, 0x02],
            sequence: u32::MAX,
        }],
        vout: vec![
            TxOut {
                value: 0,
                script_pubkey: Vec::new(),
            },
            // The staked coins come back to the staker; age zero mints
            // nothing extra.
            TxOut {
                value: COINBASE_VALUE,
                script_pubkey: p2pkh_script(0x51),
            },
        ],
        lock_time: 0,
    };
    make_block(
        *prev_hash,
        block_time,
        bits,
        0,
        vec![coinbase, coinstake],
        Vec::new(),
    )
}

#[test]
fn coinstake_timestamp_must_match_the_block() {
    let harness = setup();
    harness
        .chain
        .process_block(&harness.genesis)
        .expect("install genesis");
    let chain = harness.extend_chain(11, 0xa0);

    let coinbase1_txid = harness
        .chain
        .read_block(&chain[0])
        .expect("read block")
        .expect("block 1 on disk")
        .transactions[0]
        .txid();
    let staked = OutPoint::new(coinbase1_txid, 0);
    let block_time = BASE_TIME + 12 * SPACING;

    // Coinstake stamped one second off the header.
    let skewed = coinstake_block(&harness, &chain[10], staked, block_time, block_time - 1);
    let err = harness
        .chain
        .process_block(&skewed)
        .expect_err("skewed coinstake rejected");
    assert_eq!(err.dos_score(), 50);
    assert_eq!(harness.chain.best_height(), Some(11));

    // Matching timestamps connect.
    let stake = coinstake_block(&harness, &chain[10], staked, block_time, block_time);
    harness.chain.process_block(&stake).expect("stake block");
    assert_eq!(harness.chain.best_hash(), Some(stake.hash()));
    assert_eq!(harness.chain.best_height(), Some(12));

    let node = harness.node(&stake.hash());
    assert!(node.is_proof_of_stake());
    assert_eq!(node.prevout_stake, staked);
    assert_eq!(node.stake_time, block_time);

    // The staked output is now spent on the best chain.
    let funded = harness
        .chain
        .tx_index(&coinbase1_txid)
        .expect("tx index read")
        .expect("coinbase 1 indexed");
    assert!(!funded.spent[0].is_null());
}
