//! Block validation and chain selection through the chainstate manager

mod common;

use bitscoin_consensus::chainstate::BlockStatus;
use bitscoin_consensus::coins::{CoinStore, MemoryCoinStore};
use bitscoin_consensus::economic::get_block_subsidy;
use bitscoin_consensus::*;
use common::*;
use std::sync::Arc;

fn manager_with(params: &ChainParams, threads: usize) -> (ChainstateManager, Arc<MemoryCoinStore>) {
    init_logging();
    let store = Arc::new(MemoryCoinStore::new());
    let manager =
        ChainstateManager::with_time_source(params.clone(), store.clone(), threads, Arc::new(clock_for(params)))
            .unwrap();
    (manager, store)
}

fn new_manager() -> (ChainstateManager, Arc<MemoryCoinStore>) {
    manager_with(&ChainParams::regtest(), 2)
}

fn submit_all(manager: &ChainstateManager, blocks: &[Block]) {
    for block in blocks {
        assert_eq!(manager.process_block(block.clone()), Ok(BlockOutcome::Accepted));
    }
}

/// Params whose difficulty moves every two blocks, so equal-length chains can differ in work
fn retargeting_params() -> ChainParams {
    ChainParams {
        no_retargeting: false,
        target_spacing: 600,
        target_timespan: 1200,
        ..ChainParams::regtest()
    }
}

#[test]
fn test_coinbase_claiming_more_than_subsidy_is_rejected() {
    let (manager, store) = new_manager();
    let params = manager.params().clone();
    let mut branch = Branch::new(&params, 0);
    let key = Key::new(1);

    let greedy = coinbase(1, 0, &key.script_pubkey(), get_block_subsidy(1, &params) + 1);
    let block = branch.assemble(greedy, vec![], 600);
    let err = manager.process_block(block.clone()).unwrap_err();
    assert_eq!(
        err.consensus().map(ConsensusError::root),
        Some(&ConsensusError::BadCoinbaseValue {
            claimed: get_block_subsidy(1, &params) + 1,
            allowed: get_block_subsidy(1, &params),
        })
    );
    assert_eq!(manager.block_status(&block.hash()), Some(BlockStatus::Failed));
    assert_eq!(manager.best_tip_info().height, 0);
    assert!(store.is_empty());
}

#[test]
fn test_in_block_double_spend_is_rejected() {
    let (manager, store) = new_manager();
    let params = manager.params().clone();
    let key = Key::new(2);
    let mut branch = Branch::new(&params, 0);
    let blocks = branch.extend(101, &key.script_pubkey());
    submit_all(&manager, &blocks);
    let before = store.snapshot();

    let spent = coinbase_outpoint(&blocks[0]);
    let first = signed_spend(&key, &[spent], vec![pay(&key, 49 * 100_000_000)], SEQUENCE_FINAL);
    let second = signed_spend(&key, &[spent], vec![pay(&key, 48 * 100_000_000)], SEQUENCE_FINAL);
    let block = branch.next(&key.script_pubkey(), vec![first, second], 3 * 100_000_000);

    let err = manager.process_block(block).unwrap_err();
    match err.consensus() {
        Some(ConsensusError::Transaction { tx_index, source }) => {
            assert_eq!(*tx_index, 2);
            assert_eq!(**source, ConsensusError::MissingOrSpentInput { index: 0 });
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(manager.best_tip_info().height, 101);
    assert_eq!(store.snapshot(), before);
}

#[test]
fn test_higher_work_chain_wins_even_when_second() {
    let params = retargeting_params();
    let (manager, _) = manager_with(&params, 2);
    let payout = Key::new(3).script_pubkey();

    // Slow first block leaves the difficulty at the limit
    let mut slow = Branch::new(&params, 1);
    let slow_blocks = vec![slow.next_with(&payout, vec![], 0, 4800), slow.next(&payout, vec![], 0)];
    // Fast first block quadruples the difficulty of the second
    let mut fast = Branch::new(&params, 2);
    let fast_blocks = vec![fast.next_with(&payout, vec![], 0, 1), fast.next(&payout, vec![], 0)];
    assert_ne!(slow_blocks[1].header.bits, fast_blocks[1].header.bits);

    submit_all(&manager, &slow_blocks);
    assert_eq!(manager.best_tip_info().hash, slow_blocks[1].hash());
    let slow_work = manager.best_tip_info().chain_work;

    submit_all(&manager, &fast_blocks);
    let tip = manager.best_tip_info();
    assert_eq!(tip.height, 2);
    assert_eq!(tip.hash, fast_blocks[1].hash());
    assert!(tip.chain_work > slow_work);
}

#[test]
fn test_coinbase_maturity_boundary() {
    let (manager, _) = new_manager();
    let params = manager.params().clone();
    let key = Key::new(4);
    let mut branch = Branch::new(&params, 0);
    let blocks = branch.extend(99, &key.script_pubkey());
    submit_all(&manager, &blocks);

    let spent = coinbase_outpoint(&blocks[0]);
    let spend = signed_spend(&key, &[spent], vec![pay(&key, 49 * 100_000_000)], SEQUENCE_FINAL);

    // Height 100 spends the height 1 coinbase at depth 99
    let mut early = branch.clone();
    let premature = early.next(&key.script_pubkey(), vec![spend.clone()], 100_000_000);
    let err = manager.process_block(premature).unwrap_err();
    assert_eq!(
        err.consensus().map(ConsensusError::root),
        Some(&ConsensusError::PrematureCoinbaseSpend { index: 0, depth: 99, required: 100 })
    );

    submit_all(&manager, &[branch.next(&key.script_pubkey(), vec![], 0)]);
    let mature = branch.next(&key.script_pubkey(), vec![spend.clone()], 100_000_000);
    submit_all(&manager, &[mature]);
    assert_eq!(manager.best_tip_info().height, 101);
    assert!(manager.get_coin(&spent).is_none());
    assert!(manager.get_coin(&OutPoint::new(spend.txid(), 0)).is_some());
}

#[test]
fn test_bad_signature_fails_block() {
    let (manager, _) = new_manager();
    let params = manager.params().clone();
    let owner = Key::new(5);
    let thief = Key::new(6);
    let mut branch = Branch::new(&params, 0);
    let blocks = branch.extend(101, &owner.script_pubkey());
    submit_all(&manager, &blocks);

    let mut theft = signed_spend(&owner, &[coinbase_outpoint(&blocks[0])], vec![pay(&thief, 100_000)], SEQUENCE_FINAL);
    thief.sign_input(&mut theft, 0);

    let fees = 50 * 100_000_000 - 100_000;
    let block = branch.next(&thief.script_pubkey(), vec![theft], fees);
    let err = manager.process_block(block).unwrap_err();
    assert!(matches!(
        err.consensus().map(ConsensusError::root),
        Some(ConsensusError::Script { input_index: 0, .. })
    ));
}

#[test]
fn test_reorg_matches_straight_line_connection() {
    let (manager, store) = new_manager();
    let params = manager.params().clone();
    let key = Key::new(7);
    let payout = key.script_pubkey();

    let mut main = Branch::new(&params, 1);
    let mut main_blocks = main.extend(101, &payout);
    let spend = signed_spend(&key, &[coinbase_outpoint(&main_blocks[0])], vec![pay(&key, 4_000_000_000)], SEQUENCE_FINAL);
    main_blocks.push(main.next(&payout, vec![spend.clone()], 1_000_000_000));
    submit_all(&manager, &main_blocks);

    // A longer side branch from height 100 undoes the spend
    let mut side = main.fork_at(100, 2);
    let side_blocks = side.extend(3, &payout);
    let events = manager.subscribe();
    for block in &side_blocks {
        manager.process_block(block.clone()).unwrap();
    }
    assert_eq!(manager.best_tip_info().hash, side.tip_hash());
    assert!(manager.get_coin(&coinbase_outpoint(&main_blocks[0])).is_some());
    assert!(manager.get_coin(&OutPoint::new(spend.txid(), 0)).is_none());

    let reorg = events.try_iter().last().unwrap();
    assert_eq!(reorg.disconnected, vec![main_blocks[101].hash(), main_blocks[100].hash()]);
    assert_eq!(reorg.connected, side_blocks.iter().map(Block::hash).collect::<Vec<_>>());

    // Same blocks connected without any reorganization
    let (fresh, fresh_store) = new_manager();
    submit_all(&fresh, &main_blocks[..100]);
    submit_all(&fresh, &side_blocks);
    assert_eq!(store.snapshot(), fresh_store.snapshot());
    assert_eq!(store.best_block(), fresh_store.best_block());

    // And back again
    main_blocks.extend(main.extend(2, &payout));
    for block in &main_blocks[102..] {
        manager.process_block(block.clone()).unwrap();
    }
    let (straight, straight_store) = new_manager();
    submit_all(&straight, &main_blocks);
    assert_eq!(manager.best_tip_info(), straight.best_tip_info());
    assert_eq!(store.snapshot(), straight_store.snapshot());
}

#[test]
fn test_resubmission_is_idempotent() {
    let (manager, store) = new_manager();
    let params = manager.params().clone();
    let blocks = Branch::new(&params, 0).extend(3, &Key::new(8).script_pubkey());
    submit_all(&manager, &blocks);
    let snapshot = store.snapshot();
    let tip = manager.best_tip_info();

    for block in &blocks {
        assert_eq!(manager.process_block(block.clone()), Ok(BlockOutcome::Duplicate));
    }
    assert_eq!(store.snapshot(), snapshot);
    assert_eq!(manager.best_tip_info(), tip);
}

#[test]
fn test_outcome_independent_of_script_threads() {
    let params = ChainParams::regtest();
    let key = Key::new(9);
    let other = Key::new(10);
    let mut branch = Branch::new(&params, 0);
    let mut blocks = branch.extend(103, &key.script_pubkey());

    let good = signed_spend(&key, &[coinbase_outpoint(&blocks[0])], vec![pay(&key, 4_900_000_000)], SEQUENCE_FINAL);
    let mut bad = signed_spend(&key, &[coinbase_outpoint(&blocks[1])], vec![pay(&key, 4_900_000_000)], SEQUENCE_FINAL);
    other.sign_input(&mut bad, 0);
    let mut invalid_branch = branch.clone();
    let invalid = invalid_branch.next(&key.script_pubkey(), vec![good.clone(), bad], 200_000_000);
    blocks.push(branch.next(&key.script_pubkey(), vec![good], 100_000_000));

    let mut results = Vec::new();
    for threads in [1, 4] {
        let (manager, store) = manager_with(&params, threads);
        submit_all(&manager, &blocks[..103]);
        let err = manager.process_block(invalid.clone()).unwrap_err();
        submit_all(&manager, &blocks[103..]);
        results.push((err, manager.best_tip_info(), store.snapshot()));
    }
    assert_eq!(results[0], results[1]);
}

#[test]
fn test_block_status_tracking() {
    let (manager, _) = new_manager();
    let params = manager.params().clone();
    let blocks = Branch::new(&params, 0).extend(2, &Key::new(11).script_pubkey());
    assert_eq!(manager.block_status(&blocks[0].hash()), None);
    submit_all(&manager, &blocks);
    assert_eq!(manager.block_status(&blocks[1].hash()), Some(BlockStatus::FullyValid));
    assert_eq!(manager.header(&blocks[1].hash()), Some(blocks[1].header.clone()));
    assert_eq!(manager.active_hash_at(2), Some(blocks[1].hash()));
    assert_eq!(manager.active_hash_at(3), None);
}
