use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::core::crypto;
use crate::core::error::ChainError;
use crate::core::hash::{pow_ok, sha256_hex};

/// Reserved sender id of block-reward transactions. They carry no signature.
pub const SYSTEM_SENDER: &str = "system";

/// Consensus policy constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChainPolicy {
    /// Required number of leading '0' hex chars in a block hash.
    pub difficulty: usize,
    /// Amount of the per-block system reward transaction.
    pub reward: u64,
}

impl Default for ChainPolicy {
    fn default() -> Self {
        Self {
            difficulty: 3,
            reward: 100,
        }
    }
}

/// A signed unit of value transfer with per-sender sequence numbering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Per-sender sequence number (0 for the system reward).
    pub transaction_id: u64,
    pub amount: u64,
    pub sender: String,
    pub receiver: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub signature: Option<String>,
}

/// The exact payload a signature covers: the unsigned fields, in order.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SigningPayload<'a> {
    transaction_id: u64,
    amount: u64,
    sender: &'a str,
    receiver: &'a str,
}

impl Transaction {
    pub fn new(transaction_id: u64, amount: u64, sender: &str, receiver: &str) -> Self {
        Self {
            transaction_id,
            amount,
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            signature: None,
        }
    }

    /// The unsigned system transaction rewarding a block's miner.
    pub fn reward(receiver: &str, amount: u64) -> Self {
        Self::new(0, amount, SYSTEM_SENDER, receiver)
    }

    pub fn is_system(&self) -> bool {
        self.sender == SYSTEM_SENDER
    }

    /// Canonical byte serialization of the unsigned fields.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let payload = SigningPayload {
            transaction_id: self.transaction_id,
            amount: self.amount,
            sender: &self.sender,
            receiver: &self.receiver,
        };
        serde_json::to_vec(&payload).expect("serialize signing payload")
    }

    /// Sign the unsigned payload in place.
    pub fn sign(&mut self, private_key: &str) -> Result<(), ChainError> {
        let sig = crypto::sign(&self.signing_bytes(), private_key)?;
        self.signature = Some(sig);
        Ok(())
    }

    /// True only if a signature is present and verifies against `public_key`
    /// over this transaction's current unsigned fields. Never errors.
    pub fn verify_signature(&self, public_key: &str) -> bool {
        match &self.signature {
            Some(sig) => crypto::verify(&self.signing_bytes(), sig, public_key),
            None => false,
        }
    }

    /// Structural equality on amount/sender/receiver only.
    ///
    /// Deliberately ignores `transaction_id` so a locally pending transaction
    /// can be reconciled with the possibly re-sequenced copy that arrives
    /// inside a mined block.
    pub fn is_equal(&self, other: &Transaction) -> bool {
        self.amount == other.amount
            && self.sender == other.sender
            && self.receiver == other.receiver
    }

    /// The consensus validity predicate.
    ///
    /// A system transaction is valid iff no system transaction precedes it in
    /// its containing block (`earlier_in_block` holds the block's transactions
    /// before this one, in order) and its amount equals the policy reward. The
    /// positional check means a byte-identical duplicate reward is still
    /// invalid. Any other transaction is valid iff its id has not appeared
    /// among `prior` (the already-accepted transactions of the same sender, in
    /// replay order) and its signature verifies against the sender's known
    /// public key. Senders with no known key contribute nothing.
    pub fn is_valid(
        &self,
        public_keys: &HashMap<String, String>,
        prior: &[Transaction],
        earlier_in_block: &[Transaction],
        reward: u64,
    ) -> bool {
        if self.is_system() {
            return self.amount == reward && !earlier_in_block.iter().any(|t| t.is_system());
        }

        if prior.iter().any(|t| t.transaction_id == self.transaction_id) {
            return false;
        }

        match public_keys.get(&self.sender) {
            Some(key) => self.verify_signature(key),
            None => false,
        }
    }
}

/// An ordered set of transactions waiting to be mined into a block.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingBlock {
    pub transactions: Vec<Transaction>,
}

impl PendingBlock {
    pub fn new(transactions: Vec<Transaction>) -> Self {
        Self { transactions }
    }
}

/// An immutable mined block. The parent is referenced by hash only and looked
/// up in the ledger's arena, never through an object reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MinedBlock {
    pub transactions: Vec<Transaction>,
    /// Hash of the parent block, or `None` for a chain root.
    pub previous_hash: Option<String>,
    /// Proof-of-work nonce.
    pub proof_of_work: u64,
}

impl MinedBlock {
    /// Digest of the canonical serialization of
    /// `{transactions, previousHash, proofOfWork}`.
    pub fn hash(&self) -> String {
        let bytes = serde_json::to_vec(self).expect("serialize block");
        sha256_hex(&bytes)
    }

    pub fn has_valid_hash(&self, difficulty: usize) -> bool {
        pow_ok(&self.hash(), difficulty)
    }

    /// Full block validity: proof-of-work prefix and every transaction valid
    /// against the chain state as of this block's position. The per-position
    /// system rule limits a block to one reward transaction. `prior_by_sender`
    /// holds each sender's accepted transactions from earlier blocks and is
    /// advanced past this block.
    pub fn is_valid(
        &self,
        public_keys: &HashMap<String, String>,
        prior_by_sender: &mut HashMap<String, Vec<Transaction>>,
        policy: ChainPolicy,
    ) -> bool {
        if !self.has_valid_hash(policy.difficulty) {
            return false;
        }
        for (i, tx) in self.transactions.iter().enumerate() {
            let prior = prior_by_sender.entry(tx.sender.clone()).or_default();
            if !tx.is_valid(public_keys, prior, &self.transactions[..i], policy.reward) {
                return false;
            }
            prior.push(tx.clone());
        }
        true
    }
}
