pub mod crypto;
pub mod directory;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod miner;
pub mod node;
pub mod session;
pub mod types;
pub mod wire;
