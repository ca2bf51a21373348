use std::collections::HashMap;

use tracing::{debug, info};

use crate::core::miner::mine_block;
use crate::core::types::{ChainPolicy, MinedBlock, PendingBlock, Transaction};

/// The ledger/consensus engine of one node.
///
/// Owns the arena of every block the node has ever seen (including
/// non-canonical fork branches), the pending-transaction pool and the node's
/// own sequence counter. The canonical chain is a derived view, recomputed
/// whenever a block is inserted. The ledger never touches the network; peers
/// feed it through [`add_block`](Ledger::add_block) and
/// [`add_pending_transaction`](Ledger::add_pending_transaction).
pub struct Ledger {
    policy: ChainPolicy,
    /// Local identity, receiver of this node's mining rewards.
    owner: String,
    /// Every known block, keyed by hash. Parents are resolved through this
    /// table on demand, so blocks may arrive in any order.
    blocks: HashMap<String, MinedBlock>,
    /// Genesis-first hashes of the current canonical chain.
    canonical: Vec<String>,
    pending: Vec<Transaction>,
    own_sequence: u64,
}

impl Ledger {
    pub fn new(owner: impl Into<String>, policy: ChainPolicy) -> Self {
        Self {
            policy,
            owner: owner.into(),
            blocks: HashMap::new(),
            canonical: Vec::new(),
            pending: Vec::new(),
            own_sequence: 0,
        }
    }

    pub fn policy(&self) -> ChainPolicy {
        self.policy
    }

    /// Next `transaction_id` for a transaction this node originates.
    pub fn next_transaction_id(&mut self) -> u64 {
        let id = self.own_sequence;
        self.own_sequence += 1;
        id
    }

    /// Append to the pending pool. Never rejects; validation is deferred to
    /// mining/acceptance time.
    pub fn add_pending_transaction(&mut self, tx: Transaction) {
        debug!(sender = %tx.sender, amount = tx.amount, "pending transaction added");
        self.pending.push(tx);
    }

    pub fn pending_transactions(&self) -> &[Transaction] {
        &self.pending
    }

    pub fn get_block_by_hash(&self, hash: &str) -> Option<&MinedBlock> {
        self.blocks.get(hash)
    }

    pub fn has_block(&self, hash: &str) -> bool {
        self.blocks.contains_key(hash)
    }

    /// All known blocks, forks included. Order is unspecified.
    pub fn all_blocks(&self) -> Vec<MinedBlock> {
        self.blocks.values().cloned().collect()
    }

    /// Hash of the canonical chain tip, if any.
    pub fn tip_hash(&self) -> Option<String> {
        self.canonical.last().cloned()
    }

    pub fn chain_height(&self) -> usize {
        self.canonical.len()
    }

    /// Insert a block into the arena, keyed by hash. Idempotent: re-inserting
    /// a known hash is a no-op. Returns whether the block was new.
    pub fn insert_block(&mut self, block: MinedBlock) -> bool {
        let hash = block.hash();
        if self.blocks.contains_key(&hash) {
            debug!(%hash, "block already known");
            return false;
        }
        info!(%hash, txs = block.transactions.len(), "block added");
        self.blocks.insert(hash, block);
        self.canonical = self.compute_longest_chain();
        true
    }

    /// Insert `block` and, when `remove_from_pending` is set, drop every
    /// pending transaction that [`Transaction::is_equal`] matches a
    /// transaction inside it.
    pub fn add_block(&mut self, block: MinedBlock, remove_from_pending: bool) {
        let block_txs = block.transactions.clone();
        self.insert_block(block);
        if remove_from_pending {
            let before = self.pending.len();
            self.pending
                .retain(|p| !block_txs.iter().any(|t| t.is_equal(p)));
            let dropped = before - self.pending.len();
            if dropped > 0 {
                debug!(dropped, "pending transactions reconciled against block");
            }
        }
    }

    /// Walk parent links back from `tip`, genesis-first. A parent that cannot
    /// be resolved truncates the chain there.
    fn chain_hashes_ending_at(&self, tip: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = Some(tip.to_string());
        while let Some(hash) = cursor {
            match self.blocks.get(&hash) {
                Some(block) => {
                    chain.push(hash);
                    cursor = block.previous_hash.clone();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    fn compute_longest_chain(&self) -> Vec<String> {
        let mut best: Vec<String> = Vec::new();
        for tip in self.blocks.keys() {
            let candidate = self.chain_hashes_ending_at(tip);
            let better = candidate.len() > best.len()
                || (candidate.len() == best.len() && candidate.last() < best.last());
            if better {
                best = candidate;
            }
        }
        best
    }

    /// Fork resolution: the longest chain of parent links wins. Equal-length
    /// chains are broken deterministically by the lower tip hash.
    pub fn longest_chain(&self) -> Vec<&MinedBlock> {
        self.canonical
            .iter()
            .filter_map(|h| self.blocks.get(h))
            .collect()
    }

    /// Destructive local reset of all mined blocks. No network effect.
    pub fn clear_blocks(&mut self) {
        info!(blocks = self.blocks.len(), "clearing all blocks");
        self.blocks.clear();
        self.canonical.clear();
    }

    /// Build the unmined block a local mining run should search on: the given
    /// transactions plus the system reward for this node, parented on the
    /// current canonical tip.
    pub fn prepare_block(&self, mut transactions: Vec<Transaction>) -> (PendingBlock, Option<String>) {
        transactions.push(Transaction::reward(&self.owner, self.policy.reward));
        (PendingBlock::new(transactions), self.tip_hash())
    }

    /// Synchronous mining: blocks the caller until the search completes.
    /// Async callers use [`prepare_block`](Ledger::prepare_block) with
    /// [`Miner`](crate::core::miner::Miner) instead.
    pub fn mine_block_from_transactions(&self, transactions: Vec<Transaction>) -> MinedBlock {
        let (pending, previous_hash) = self.prepare_block(transactions);
        mine_block(pending.transactions, previous_hash, self.policy.difficulty)
    }

    /// Replay the canonical chain through the validity predicate and return
    /// the transactions that survive, in chain order. Invalid, double-spent or
    /// unverifiable transactions are silently excluded.
    pub fn valid_chain_transactions(
        &self,
        public_keys: &HashMap<String, String>,
    ) -> Vec<Transaction> {
        let mut valid = Vec::new();
        let mut prior_by_sender: HashMap<String, Vec<Transaction>> = HashMap::new();
        for block in self.longest_chain() {
            for (i, tx) in block.transactions.iter().enumerate() {
                let prior = prior_by_sender.entry(tx.sender.clone()).or_default();
                if tx.is_valid(public_keys, prior, &block.transactions[..i], self.policy.reward) {
                    valid.push(tx.clone());
                    prior.push(tx.clone());
                }
            }
        }
        valid
    }

    /// Net balance of `user_id`: valid incoming minus valid outgoing amounts
    /// over the canonical chain. 0 for an empty chain. Accumulated in i128 and
    /// saturated at the i64 bounds, so extreme amounts cannot flip the sign.
    pub fn calculate_balance(&self, public_keys: &HashMap<String, String>, user_id: &str) -> i64 {
        let mut balance: i128 = 0;
        for tx in self.valid_chain_transactions(public_keys) {
            if tx.receiver == user_id {
                balance += i128::from(tx.amount);
            }
            if tx.sender == user_id {
                balance -= i128::from(tx.amount);
            }
        }
        balance.clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
    }

    /// Whether the block at `hash` is valid against the chain leading to it.
    pub fn is_block_valid(&self, hash: &str, public_keys: &HashMap<String, String>) -> bool {
        let Some(block) = self.blocks.get(hash) else {
            return false;
        };
        let mut prior_by_sender: HashMap<String, Vec<Transaction>> = HashMap::new();
        let chain = self.chain_hashes_ending_at(hash);
        for ancestor_hash in chain.iter().take(chain.len().saturating_sub(1)) {
            if let Some(ancestor) = self.blocks.get(ancestor_hash) {
                for (i, tx) in ancestor.transactions.iter().enumerate() {
                    let prior = prior_by_sender.entry(tx.sender.clone()).or_default();
                    if tx.is_valid(
                        public_keys,
                        prior,
                        &ancestor.transactions[..i],
                        self.policy.reward,
                    ) {
                        prior.push(tx.clone());
                    }
                }
            }
        }
        block.is_valid(public_keys, &mut prior_by_sender, self.policy)
    }
}
