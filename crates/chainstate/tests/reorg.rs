mod util;

use std::sync::Arc;

use novad_primitives::outpoint::OutPoint;

use util::{p2pkh_script, setup_with, spend_tx, RecordingListener, BASE_TIME, SPACING};

#[test]
fn heavier_fork_triggers_a_full_reorganization() {
    let listener = Arc::new(RecordingListener::default());
    let harness = setup_with(vec![Arc::clone(&listener) as _]);
    harness
        .chain
        .process_block(&harness.genesis)
        .expect("install genesis");
    let genesis_hash = harness.genesis.hash();

    // Branch A: three blocks on genesis.
    let branch_a = harness.extend_chain(3, 0xa0);
    assert_eq!(harness.chain.best_hash(), Some(branch_a[2]));

    // Branch B: four blocks on genesis, heavier in total.
    let mut branch_b = Vec::new();
    let mut prev = genesis_hash;
    for _ in 0..4 {
        let block = harness.build_pow_block(&prev, 0xb0, p2pkh_script(0xbb), Vec::new());
        harness.chain.process_block(&block).expect("branch b block");
        prev = block.hash();
        branch_b.push(block);
    }

    let tip_b = branch_b[3].hash();
    assert_eq!(harness.chain.best_hash(), Some(tip_b));
    assert_eq!(harness.chain.best_height(), Some(4));

    // The losing branch's coinbases left the transaction index; the
    // winning branch's are indexed and unspent.
    for hash in &branch_a {
        let coinbase_txid = harness
            .chain
            .read_block(hash)
            .expect("read block")
            .expect("branch a block on disk")
            .transactions[0]
            .txid();
        assert!(harness
            .chain
            .tx_index(&coinbase_txid)
            .expect("tx index read")
            .is_none());
    }
    for block in &branch_b {
        let entry = harness
            .chain
            .tx_index(&block.transactions[0].txid())
            .expect("tx index read")
            .expect("branch b coinbase indexed");
        assert!(entry.spent.iter().all(|pos| pos.is_null()));
    }

    // Linkage follows the new chain; the losing tip is detached.
    assert_eq!(
        harness.node(&genesis_hash).next_on_best,
        Some(branch_b[0].hash())
    );
    assert_eq!(harness.node(&branch_a[2]).next_on_best, None);

    // Wallet callbacks: one disconnect per losing block tip-down, then
    // one connect per winning block bottom-up.
    let events = listener.snapshot();
    let tail = &events[events.len() - 7..];
    assert_eq!(tail[0], (branch_a[2], false));
    assert_eq!(tail[1], (branch_a[1], false));
    assert_eq!(tail[2], (branch_a[0], false));
    assert_eq!(tail[3], (branch_b[0].hash(), true));
    assert_eq!(tail[4], (branch_b[1].hash(), true));
    assert_eq!(tail[5], (branch_b[2].hash(), true));
    assert_eq!(tail[6], (branch_b[3].hash(), true));
}

#[test]
fn reorganization_restores_spent_outputs() {
    let listener = Arc::new(RecordingListener::default());
    let harness = setup_with(vec![Arc::clone(&listener) as _]);
    harness
        .chain
        .process_block(&harness.genesis)
        .expect("install genesis");

    // Eleven blocks make the first coinbase spendable at regtest maturity.
    let chain = harness.extend_chain(11, 0xa0);
    let coinbase1_txid = harness
        .chain
        .read_block(&chain[0])
        .expect("read block")
        .expect("block 1 on disk")
        .transactions[0]
        .txid();
    let funded = OutPoint::new(coinbase1_txid, 0);

    // Block 12 spends it.
    let spend = spend_tx(
        funded,
        BASE_TIME + 12 * SPACING,
        0,
        p2pkh_script(0x21),
    );
    let spend_txid = spend.txid();
    let block12 = harness.build_pow_block(&chain[10], 0xa0, p2pkh_script(0x12), vec![spend]);
    harness.chain.process_block(&block12).expect("block 12");

    let entry = harness
        .chain
        .tx_index(&coinbase1_txid)
        .expect("tx index read")
        .expect("coinbase 1 indexed");
    assert!(!entry.spent[0].is_null(), "output marked spent");
    assert!(harness
        .chain
        .tx_index(&spend_txid)
        .expect("tx index read")
        .is_some());

    // A heavier sibling branch without the spend wins.
    let block12b = harness.build_pow_block(&chain[10], 0xb0, p2pkh_script(0x13), Vec::new());
    harness.chain.process_block(&block12b).expect("block 12b");
    let block13b = harness.build_pow_block(&block12b.hash(), 0xb0, p2pkh_script(0x14), Vec::new());
    harness.chain.process_block(&block13b).expect("block 13b");

    assert_eq!(harness.chain.best_hash(), Some(block13b.hash()));
    assert_eq!(harness.chain.best_height(), Some(13));

    // The spend is gone and the staked-over output is unspent again.
    assert!(harness
        .chain
        .tx_index(&spend_txid)
        .expect("tx index read")
        .is_none());
    let entry = harness
        .chain
        .tx_index(&coinbase1_txid)
        .expect("tx index read")
        .expect("coinbase 1 indexed");
    assert!(entry.spent[0].is_null(), "spend was rolled back");

    let events = listener.snapshot();
    let tail = &events[events.len() - 3..];
    assert_eq!(tail[0], (block12.hash(), false));
    assert_eq!(tail[1], (block12b.hash(), true));
    assert_eq!(tail[2], (block13b.hash(), true));
}
