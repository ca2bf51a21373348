use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::core::types::{ChainPolicy, MinedBlock, PendingBlock, Transaction};

/// How often the search polls its cancel flag, in nonce increments.
const CANCEL_CHECK_INTERVAL: u64 = 4096;

/// Brute-force nonce search: start at 0 and increment until the block hash
/// has the required zero prefix. Unbounded by design; an empty transaction
/// list is legal.
pub fn mine_block(
    transactions: Vec<Transaction>,
    previous_hash: Option<String>,
    difficulty: usize,
) -> MinedBlock {
    let mut block = MinedBlock {
        transactions,
        previous_hash,
        proof_of_work: 0,
    };
    while !block.has_valid_hash(difficulty) {
        block.proof_of_work = block.proof_of_work.wrapping_add(1);
    }
    block
}

/// Like [`mine_block`], but gives up with `None` once `cancel` is set.
/// The flag is polled every [`CANCEL_CHECK_INTERVAL`] attempts.
pub fn mine_block_cancellable(
    transactions: Vec<Transaction>,
    previous_hash: Option<String>,
    difficulty: usize,
    cancel: &AtomicBool,
) -> Option<MinedBlock> {
    let mut block = MinedBlock {
        transactions,
        previous_hash,
        proof_of_work: 0,
    };
    while !block.has_valid_hash(difficulty) {
        if block.proof_of_work % CANCEL_CHECK_INTERVAL == 0 && cancel.load(Ordering::Relaxed) {
            debug!(attempts = block.proof_of_work, "mining search cancelled");
            return None;
        }
        block.proof_of_work = block.proof_of_work.wrapping_add(1);
    }
    Some(block)
}

/// Runs proof-of-work searches off the async runtime so a long search never
/// starves connection I/O.
pub struct Miner {
    policy: ChainPolicy,
    mining: Arc<AtomicBool>,
}

impl Miner {
    pub fn new(policy: ChainPolicy) -> Self {
        Self {
            policy,
            mining: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a search is currently in progress.
    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::Relaxed)
    }

    /// Mine `pending` on a blocking worker. Returns `None` if `cancel` was
    /// set before the search finished.
    pub async fn mine(
        &self,
        pending: PendingBlock,
        previous_hash: Option<String>,
        cancel: Arc<AtomicBool>,
    ) -> Option<MinedBlock> {
        let difficulty = self.policy.difficulty;
        self.mining.store(true, Ordering::Relaxed);
        let result = tokio::task::spawn_blocking(move || {
            mine_block_cancellable(pending.transactions, previous_hash, difficulty, &cancel)
        })
        .await
        .unwrap_or(None);
        self.mining.store(false, Ordering::Relaxed);
        result
    }
}
