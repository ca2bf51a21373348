use std::collections::HashMap;

use peerchain::core::crypto;
use peerchain::core::types::{Transaction, SYSTEM_SENDER};

fn signed_tx(id: u64, amount: u64, sender: &str, receiver: &str, private_key: &str) -> Transaction {
    let mut tx = Transaction::new(id, amount, sender, receiver);
    tx.sign(private_key).unwrap();
    tx
}

#[test]
fn sign_then_verify_roundtrip() {
    let (sk, pk) = crypto::generate_keypair();
    let tx = signed_tx(0, 42, "alice", "bob", &sk);
    assert!(tx.verify_signature(&pk));
}

#[test]
fn verify_fails_after_tampering_any_signed_field() {
    let (sk, pk) = crypto::generate_keypair();
    let tx = signed_tx(3, 42, "alice", "bob", &sk);

    let mut t = tx.clone();
    t.amount = 43;
    assert!(!t.verify_signature(&pk), "amount tamper must break signature");

    let mut t = tx.clone();
    t.receiver = "mallory".into();
    assert!(!t.verify_signature(&pk), "receiver tamper must break signature");

    let mut t = tx.clone();
    t.sender = "mallory".into();
    assert!(!t.verify_signature(&pk), "sender tamper must break signature");

    let mut t = tx;
    t.transaction_id = 4;
    assert!(!t.verify_signature(&pk), "id tamper must break signature");
}

#[test]
fn verify_fails_without_signature() {
    let (_, pk) = crypto::generate_keypair();
    let tx = Transaction::new(0, 10, "alice", "bob");
    assert!(!tx.verify_signature(&pk));
}

#[test]
fn verify_fails_against_wrong_or_garbage_key() {
    let (sk, _) = crypto::generate_keypair();
    let (_, other_pk) = crypto::generate_keypair();
    let tx = signed_tx(0, 10, "alice", "bob", &sk);

    assert!(!tx.verify_signature(&other_pk));
    assert!(!tx.verify_signature("not hex at all"));
    assert!(!tx.verify_signature("deadbeef"));
}

#[test]
fn sign_rejects_garbage_private_key() {
    let mut tx = Transaction::new(0, 10, "alice", "bob");
    let err = tx.sign("???").unwrap_err().to_string();
    assert!(err.contains("signing"), "unexpected error: {err}");
}

#[test]
fn public_key_of_matches_generated_pair() {
    let (sk, pk) = crypto::generate_keypair();
    assert_eq!(crypto::public_key_of(&sk).unwrap(), pk);
}

#[test]
fn is_equal_ignores_transaction_id_and_signature() {
    let (sk, _) = crypto::generate_keypair();
    let a = signed_tx(1, 42, "alice", "bob", &sk);
    let b = Transaction::new(9, 42, "alice", "bob");
    assert!(a.is_equal(&b));

    let c = Transaction::new(1, 43, "alice", "bob");
    assert!(!a.is_equal(&c));
}

#[test]
fn system_transaction_valid_only_as_first_system_entry_with_exact_reward() {
    let keys = HashMap::new();
    let reward = Transaction::reward("miner", 100);
    assert!(reward.is_valid(&keys, &[], &[], 100));

    // wrong amount
    let wrong = Transaction::reward("miner", 99);
    assert!(!wrong.is_valid(&keys, &[], &[], 100));

    // a second system transaction in the same block is not in first position
    let first = Transaction::reward("miner", 100);
    let second = Transaction::new(0, 100, SYSTEM_SENDER, "other");
    assert!(first.is_valid(&keys, &[], &[], 100));
    assert!(!second.is_valid(&keys, &[], &[first], 100));
}

#[test]
fn duplicate_identical_reward_is_invalid_in_second_position() {
    // the duplicate compares equal to the first reward; position decides
    let keys = HashMap::new();
    let first = Transaction::reward("miner", 100);
    let duplicate = first.clone();
    assert!(first.is_valid(&keys, &[], &[], 100));
    assert!(!duplicate.is_valid(&keys, &[], &[first], 100));
}

#[test]
fn replayed_transaction_id_is_invalid() {
    let (sk, pk) = crypto::generate_keypair();
    let keys = HashMap::from([("alice".to_string(), pk)]);

    let first = signed_tx(7, 10, "alice", "bob", &sk);
    let replay = signed_tx(7, 10, "alice", "bob", &sk);

    assert!(first.is_valid(&keys, &[], &[], 100));
    assert!(!replay.is_valid(&keys, &[first], &[], 100));
}

#[test]
fn sender_without_known_key_is_invalid() {
    let (sk, _) = crypto::generate_keypair();
    let tx = signed_tx(0, 10, "alice", "bob", &sk);
    let keys = HashMap::new();
    assert!(!tx.is_valid(&keys, &[], &[], 100));
}

#[test]
fn wire_shape_uses_camel_case_and_omits_missing_signature() {
    let tx = Transaction::new(5, 10, "alice", "bob");
    let v = serde_json::to_value(&tx).unwrap();
    let obj = v.as_object().unwrap();
    assert!(obj.contains_key("transactionId"));
    assert!(!obj.contains_key("signature"));
}
