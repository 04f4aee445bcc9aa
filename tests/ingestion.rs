mod common;

use std::sync::Arc;
use std::time::Duration;

use agora_indexer::agora::BlockSource;
use agora_indexer::ingest;
use agora_indexer::ledger::Ledger;
use agora_indexer::types::{fold_merkle_path, Hash};
use agora_indexer::validators::{active_validators, preimage_at};

use common::{commit_all, test_node, MemorySource, TestChain, CYCLE};

async fn wait_for_height(ledger: &Ledger, target: u64) {
    for _ in 0..200 {
        if ledger.expected_height().expect("expected height") >= target {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("ledger never reached height {target}");
}

#[test]
fn expected_height_matches_any_committed_prefix() {
    let mut chain = TestChain::new(6);
    chain.push_empty_blocks_to(5);
    let node = test_node();
    for (index, block) in chain.blocks.iter().enumerate() {
        node.ledger.commit_block(block).expect("commit");
        assert_eq!(
            node.ledger.expected_height().expect("height"),
            index as u64 + 1
        );
    }
}

#[test]
fn genesis_and_freeze_enrollments_grow_the_committee() {
    let mut chain = TestChain::new(6);
    let mut txs = Vec::new();
    let mut enrollments = Vec::new();
    for _ in 0..5 {
        let (tx, enrollment) = chain.freeze_and_enroll(1);
        txs.push(tx);
        enrollments.push(enrollment);
    }
    chain.push_block(txs, enrollments);

    let node = test_node();
    commit_all(&node, &chain.blocks);

    let committee = active_validators(node.ledger.storage(), 1).expect("committee");
    assert_eq!(committee.len(), 11);

    // The committee matches the non-zero reveals in the block header.
    let block = node
        .ledger
        .storage()
        .block_by_height(1)
        .expect("read")
        .expect("block");
    let revealed = block
        .header
        .preimages
        .iter()
        .filter(|preimage| !preimage.is_zero())
        .count();
    assert_eq!(revealed, committee.len());
}

#[test]
fn every_committed_transaction_balances() {
    let mut chain = TestChain::new(6);
    let destination = chain.validators[0].address.clone();
    let fee_tx = chain.payment_tx(&destination, 250_000, Vec::new());
    chain.push_block(vec![fee_tx], Vec::new());
    chain.push_empty_blocks_to(3);

    let node = test_node();
    commit_all(&node, &chain.blocks);

    for height in 0..node.ledger.expected_height().expect("height") {
        for row in node
            .ledger
            .storage()
            .txs_for_block(height)
            .expect("block txs")
        {
            let input_sum: u64 = row.inputs.iter().map(|input| input.amount).sum();
            let output_sum: u64 = row.outputs.iter().map(|output| output.amount).sum();
            if row.inputs.is_empty() {
                assert_eq!(row.fee, 0);
            } else {
                assert_eq!(input_sum, output_sum + row.fee);
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gap_recovery_backfills_from_the_consensus_node() {
    let mut chain = TestChain::new(6);
    chain.push_empty_blocks_to(8);
    let node = test_node();
    commit_all(&node, &chain.blocks[..4]);

    let source = Arc::new(MemorySource::new(chain.blocks.clone()));
    let (handle, _worker) =
        ingest::spawn(node.ledger.clone(), source, node.bus.clone(), None, 64);

    // Local height is 3; block 8 forces a pull of 4..=7 first.
    handle
        .submit_block(chain.blocks[8].clone())
        .await
        .expect("enqueue");
    wait_for_height(&node.ledger, 9).await;

    for height in 0..9 {
        let block = node
            .ledger
            .storage()
            .block_by_height(height)
            .expect("read")
            .expect("block");
        assert_eq!(block.header.height, height);
        if height > 0 {
            let parent = node
                .ledger
                .storage()
                .block_by_height(height - 1)
                .expect("read")
                .expect("parent");
            assert_eq!(block.header.prev_block, parent.hash);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_out_of_order_submissions_converge() {
    let mut chain = TestChain::new(6);
    chain.push_empty_blocks_to(3);
    let node = test_node();
    let source = Arc::new(MemorySource::new(chain.blocks.clone()));
    let (handle, _worker) =
        ingest::spawn(node.ledger.clone(), source, node.bus.clone(), None, 64);

    handle
        .submit_block(chain.blocks[0].clone())
        .await
        .expect("enqueue");
    // Out of order: height 2 before height 1; the gap is served upstream.
    handle
        .submit_block(chain.blocks[2].clone())
        .await
        .expect("enqueue");
    handle
        .submit_block(chain.blocks[1].clone())
        .await
        .expect("enqueue");
    handle
        .submit_block(chain.blocks[3].clone())
        .await
        .expect("enqueue");
    wait_for_height(&node.ledger, 4).await;

    let stats_before = node.ledger.storage().stats().expect("stats");
    // Re-delivery of an already committed block changes nothing.
    handle
        .submit_block(chain.blocks[2].clone())
        .await
        .expect("enqueue");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(node.ledger.expected_height().expect("height"), 4);
    let stats_after = node.ledger.storage().stats().expect("stats");
    assert_eq!(stats_before.tx_count, stats_after.tx_count);
}

#[test]
fn preimage_updates_are_monotone() {
    let chain = TestChain::new(6);
    let node = test_node();
    commit_all(&node, &chain.blocks);

    let validator = &chain.validators[0];
    assert!(node
        .ledger
        .update_preimage(&validator.preimage(7))
        .expect("update"));
    // A lower tip is a no-op.
    assert!(!node
        .ledger
        .update_preimage(&validator.preimage(5))
        .expect("update"));

    let row = node
        .ledger
        .storage()
        .preimage(&validator.stake_utxo)
        .expect("read")
        .expect("row");
    assert_eq!(row.tip_height, 7);
    // Derivation at 6 hashes down from the height-7 tip.
    assert_eq!(preimage_at(&row, 6), Some(validator.chain.at(6)));

    // Beyond the cycle is refused outright.
    let overrun = agora_indexer::types::PreImageInfo {
        utxo: validator.stake_utxo,
        hash: Hash([1u8; 32]),
        height: CYCLE + 1,
    };
    assert!(!node.ledger.update_preimage(&overrun).expect("update"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn merkle_paths_from_the_source_verify_against_stored_roots() {
    let mut chain = TestChain::new(6);
    let destination = chain.validators[0].address.clone();
    let txs = vec![
        chain.payment_tx(&destination, 1_000, Vec::new()),
        chain.payment_tx(&destination, 2_000, Vec::new()),
        chain.payment_tx(&destination, 3_000, Vec::new()),
    ];
    chain.push_block(txs, Vec::new());

    let node = test_node();
    commit_all(&node, &chain.blocks);
    let source = MemorySource::new(chain.blocks.clone());

    let rows = node.ledger.storage().txs_for_block(1).expect("block txs");
    assert_eq!(rows.len(), 3);
    let stored = node
        .ledger
        .storage()
        .block_by_height(1)
        .expect("read")
        .expect("block");
    for row in rows {
        let path = source.merkle_path(1, &row.hash).await.expect("path");
        let root = fold_merkle_path(&row.hash, &path, row.index as usize);
        assert_eq!(root, stored.header.merkle_root);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn catch_up_reaches_the_consensus_tip_before_intake_opens() {
    let mut chain = TestChain::new(6);
    chain.push_empty_blocks_to(6);
    let node = test_node();
    let source = MemorySource::new(chain.blocks.clone());

    ingest::catch_up(&node.ledger, &source, &node.bus, None)
        .await
        .expect("catch up");
    assert_eq!(node.ledger.expected_height().expect("height"), 7);
}
