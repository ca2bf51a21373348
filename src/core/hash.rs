use sha2::{Digest, Sha256};

/// SHA-256 hex digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let out = hasher.finalize();
    hex::encode(out)
}

/// Proof-of-work predicate: the hash must start with `difficulty` '0' hex chars.
pub fn pow_ok(block_hash: &str, difficulty: usize) -> bool {
    block_hash.chars().take(difficulty).all(|c| c == '0')
}
