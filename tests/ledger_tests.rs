use std::collections::HashMap;

use peerchain::core::crypto;
use peerchain::core::hash::pow_ok;
use peerchain::core::ledger::Ledger;
use peerchain::core::miner::mine_block;
use peerchain::core::types::{ChainPolicy, MinedBlock, Transaction};

// Difficulty 1 keeps the brute-force search fast in tests.
fn test_policy() -> ChainPolicy {
    ChainPolicy {
        difficulty: 1,
        reward: 100,
    }
}

fn mine_on(parent: Option<String>, txs: Vec<Transaction>) -> MinedBlock {
    mine_block(txs, parent, test_policy().difficulty)
}

fn signed_tx(id: u64, amount: u64, sender: &str, receiver: &str, sk: &str) -> Transaction {
    let mut tx = Transaction::new(id, amount, sender, receiver);
    tx.sign(sk).unwrap();
    tx
}

#[test]
fn mined_block_satisfies_difficulty() {
    let ledger = Ledger::new("miner", test_policy());
    let block = ledger.mine_block_from_transactions(vec![]);
    assert!(pow_ok(&block.hash(), 1));
    assert!(block.has_valid_hash(1));
    // the reward was appended for the owner
    assert_eq!(block.transactions.len(), 1);
    assert_eq!(block.transactions[0].receiver, "miner");
}

#[test]
fn insert_block_is_idempotent() {
    let mut ledger = Ledger::new("miner", test_policy());
    let block = mine_on(None, vec![]);
    assert!(ledger.insert_block(block.clone()));
    assert!(!ledger.insert_block(block));
    assert_eq!(ledger.chain_height(), 1);
    assert_eq!(ledger.all_blocks().len(), 1);
}

#[test]
fn block_lookup_by_hash() {
    let mut ledger = Ledger::new("miner", test_policy());
    let block = mine_on(None, vec![]);
    let hash = block.hash();
    ledger.insert_block(block.clone());
    assert!(ledger.has_block(&hash));
    assert_eq!(ledger.get_block_by_hash(&hash), Some(&block));
    assert_eq!(ledger.get_block_by_hash("missing"), None);
}

#[test]
fn longest_chain_wins_over_shorter_fork() {
    let mut ledger = Ledger::new("miner", test_policy());

    // common root
    let root = mine_on(None, vec![]);
    let root_hash = root.hash();
    ledger.insert_block(root.clone());

    // fork a: two more blocks, three total
    let mut parent = root_hash.clone();
    for _ in 0..2 {
        let block = mine_on(Some(parent), vec![Transaction::reward("a", 100)]);
        parent = block.hash();
        ledger.insert_block(block);
    }

    // fork b: three more blocks, four total
    let mut parent = root_hash.clone();
    let mut b_hashes = vec![root_hash];
    for _ in 0..3 {
        let block = mine_on(Some(parent), vec![Transaction::reward("b", 100)]);
        parent = block.hash();
        b_hashes.push(parent.clone());
        ledger.insert_block(block);
    }

    let chain: Vec<String> = ledger.longest_chain().iter().map(|b| b.hash()).collect();
    assert_eq!(chain, b_hashes);
    assert_eq!(ledger.chain_height(), 4);
    assert_eq!(ledger.tip_hash(), Some(parent));
}

#[test]
fn equal_length_forks_break_ties_on_lower_tip_hash() {
    let mut ledger = Ledger::new("miner", test_policy());
    let root = mine_on(None, vec![]);
    let root_hash = root.hash();
    ledger.insert_block(root);

    let a = mine_on(Some(root_hash.clone()), vec![Transaction::reward("a", 100)]);
    let b = mine_on(Some(root_hash), vec![Transaction::reward("b", 100)]);
    let expected = a.hash().min(b.hash());
    ledger.insert_block(a);
    ledger.insert_block(b);

    assert_eq!(ledger.tip_hash(), Some(expected.clone()));

    // recomputation after more inserts keeps the same winner
    let c = mine_on(None, vec![Transaction::reward("c", 100)]);
    ledger.insert_block(c);
    assert_eq!(ledger.tip_hash(), Some(expected));
}

#[test]
fn chain_truncates_at_unresolved_parent() {
    let mut ledger = Ledger::new("miner", test_policy());
    let orphan = mine_on(Some("0".repeat(64)), vec![]);
    let orphan_hash = orphan.hash();
    ledger.insert_block(orphan);

    // only the orphan itself is walkable
    assert_eq!(ledger.chain_height(), 1);
    assert_eq!(ledger.tip_hash(), Some(orphan_hash));
}

#[test]
fn add_block_reconciles_pending_pool() {
    let mut ledger = Ledger::new("miner", test_policy());
    let tx = Transaction::new(0, 10, "alice", "bob");
    let unrelated = Transaction::new(0, 99, "carol", "dan");
    ledger.add_pending_transaction(tx.clone());
    ledger.add_pending_transaction(unrelated.clone());

    // the mined copy carries a different id, is_equal still matches it
    let mined_copy = Transaction::new(5, 10, "alice", "bob");
    let block = mine_on(None, vec![mined_copy]);
    ledger.add_block(block, true);

    assert_eq!(ledger.pending_transactions(), &[unrelated]);
}

#[test]
fn balance_conservation_after_one_transfer() {
    let (sk, pk) = crypto::generate_keypair();
    let keys = HashMap::from([("alice".to_string(), pk)]);

    let mut ledger = Ledger::new("alice", test_policy());
    // alice mines herself a reward, then pays bob 30 out of it
    let reward_block = ledger.mine_block_from_transactions(vec![]);
    ledger.add_block(reward_block, false);

    let pay = signed_tx(0, 30, "alice", "bob", &sk);
    let pay_block = ledger.mine_block_from_transactions(vec![pay]);
    ledger.add_block(pay_block, false);

    // two rewards of 100 minus 30 sent
    assert_eq!(ledger.calculate_balance(&keys, "alice"), 170);
    assert_eq!(ledger.calculate_balance(&keys, "bob"), 30);
}

#[test]
fn balance_is_zero_on_empty_chain() {
    let ledger = Ledger::new("miner", test_policy());
    assert_eq!(ledger.calculate_balance(&HashMap::new(), "anyone"), 0);
}

#[test]
fn duplicate_transaction_id_counted_once_in_balance() {
    let (sk, pk) = crypto::generate_keypair();
    let keys = HashMap::from([("alice".to_string(), pk)]);

    let mut ledger = Ledger::new("carol", test_policy());
    let first = signed_tx(0, 25, "alice", "bob", &sk);
    let replay = signed_tx(0, 25, "alice", "bob", &sk);

    let b1 = ledger.mine_block_from_transactions(vec![first]);
    ledger.add_block(b1.clone(), false);
    let b2 = mine_on(Some(b1.hash()), vec![replay]);
    ledger.add_block(b2, false);

    assert_eq!(ledger.calculate_balance(&keys, "bob"), 25);
    assert_eq!(ledger.calculate_balance(&keys, "alice"), -25);
}

#[test]
fn duplicate_identical_rewards_in_one_block_counted_once() {
    let mut ledger = Ledger::new("carol", test_policy());
    let reward = Transaction::reward("mallory", 100);
    let block = mine_on(None, vec![reward.clone(), reward]);
    let hash = block.hash();
    ledger.add_block(block, false);

    // only the first-position reward is valid, the identical copy is not
    let keys = HashMap::new();
    assert_eq!(ledger.calculate_balance(&keys, "mallory"), 100);
    assert!(!ledger.is_block_valid(&hash, &keys));
}

#[test]
fn extreme_amounts_saturate_instead_of_flipping_sign() {
    let (sk, pk) = crypto::generate_keypair();
    let keys = HashMap::from([("alice".to_string(), pk)]);

    let mut ledger = Ledger::new("carol", test_policy());
    let huge = signed_tx(0, u64::MAX, "alice", "bob", &sk);
    let block = ledger.mine_block_from_transactions(vec![huge]);
    ledger.add_block(block, false);

    assert_eq!(ledger.calculate_balance(&keys, "bob"), i64::MAX);
    assert_eq!(ledger.calculate_balance(&keys, "alice"), i64::MIN);
}

#[test]
fn unknown_sender_is_excluded_from_balances() {
    let (sk, _) = crypto::generate_keypair();
    let mut ledger = Ledger::new("carol", test_policy());
    let tx = signed_tx(0, 25, "alice", "bob", &sk);
    let block = ledger.mine_block_from_transactions(vec![tx]);
    ledger.add_block(block, false);

    // no key registered for alice
    let keys = HashMap::new();
    assert_eq!(ledger.calculate_balance(&keys, "bob"), 0);
    assert_eq!(ledger.calculate_balance(&keys, "alice"), 0);
}

#[test]
fn next_transaction_id_is_sequential() {
    let mut ledger = Ledger::new("miner", test_policy());
    assert_eq!(ledger.next_transaction_id(), 0);
    assert_eq!(ledger.next_transaction_id(), 1);
    assert_eq!(ledger.next_transaction_id(), 2);
}

#[test]
fn clear_blocks_resets_the_arena() {
    let mut ledger = Ledger::new("miner", test_policy());
    ledger.insert_block(mine_on(None, vec![]));
    ledger.clear_blocks();
    assert_eq!(ledger.chain_height(), 0);
    assert!(ledger.all_blocks().is_empty());
    assert_eq!(ledger.tip_hash(), None);
}

#[test]
fn is_block_valid_accepts_well_formed_and_rejects_double_reward() {
    let (sk, pk) = crypto::generate_keypair();
    let keys = HashMap::from([("alice".to_string(), pk)]);

    let mut ledger = Ledger::new("alice", test_policy());
    let tx = signed_tx(0, 10, "alice", "bob", &sk);
    let good = ledger.mine_block_from_transactions(vec![tx]);
    let good_hash = good.hash();
    ledger.add_block(good, false);
    assert!(ledger.is_block_valid(&good_hash, &keys));

    let double = mine_on(
        Some(good_hash),
        vec![
            Transaction::reward("alice", 100),
            Transaction::reward("alice", 100),
        ],
    );
    let double_hash = double.hash();
    ledger.add_block(double, false);
    assert!(!ledger.is_block_valid(&double_hash, &keys));
    assert!(!ledger.is_block_valid("missing", &keys));
}
