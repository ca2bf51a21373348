use thiserror::Error;

/// Failures of the peer messaging layer that are surfaced to callers.
///
/// Only request/response failures reach application code; transport-level
/// errors are handled inside the session (the dead connection is dropped and
/// logged).
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no open connection to peer {0}")]
    NoConnection(String),

    #[error("request to peer {0} timed out")]
    RequestTimeout(String),

    #[error("no handler registered for request type {0}")]
    NoHandler(String),

    #[error("peer {peer} answered with an error: {message}")]
    Remote { peer: String, message: String },

    #[error("peer session is closed")]
    Closed,

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Ledger-side failures. Signature and validity checks are deliberately not
/// here: an invalid transaction is an expected outcome and degrades to a
/// boolean `false`, never an error.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("signing failed: {0}")]
    Signing(String),

    #[error("previous block {0} is not known")]
    DanglingParent(String),
}
