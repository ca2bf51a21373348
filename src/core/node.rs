//! One complete node: a ledger wired to a peer session.
//!
//! The ledger and the session communicate only through the handler
//! registration and broadcast/request contracts; neither reaches into the
//! other's state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::core::crypto;
use crate::core::directory::Directory;
use crate::core::error::{ChainError, SessionError};
use crate::core::ledger::Ledger;
use crate::core::miner::Miner;
use crate::core::session::{PeerSession, SessionConfig};
use crate::core::types::{ChainPolicy, MinedBlock, Transaction};
use crate::core::wire::{
    self,
    payloads::{AllBlocks, PublicKeyShare, RequestOtherPublicKey, ResponsePublicKey},
    Packet,
};

pub struct Node {
    id: String,
    private_key: String,
    public_key: String,
    policy: ChainPolicy,
    ledger: Arc<Mutex<Ledger>>,
    session: Arc<PeerSession>,
    /// Public keys learned from peers, keyed by peer id.
    known_keys: Arc<Mutex<HashMap<String, String>>>,
    miner: Miner,
    /// Cancel flag of the mining run in flight, if any. Set when a remote
    /// block moves the chain tip under the search.
    mine_cancel: Arc<Mutex<Option<Arc<AtomicBool>>>>,
}

impl Node {
    pub fn new(
        id: impl Into<String>,
        directory: Arc<dyn Directory>,
        policy: ChainPolicy,
        session_config: SessionConfig,
    ) -> Arc<Self> {
        let id = id.into();
        let (private_key, public_key) = crypto::generate_keypair();
        let ledger = Arc::new(Mutex::new(Ledger::new(id.clone(), policy)));
        let session = PeerSession::new(id.clone(), directory, session_config);
        Arc::new(Self {
            id,
            private_key,
            public_key,
            policy,
            ledger,
            session,
            known_keys: Arc::new(Mutex::new(HashMap::new())),
            miner: Miner::new(policy),
            mine_cancel: Arc::new(Mutex::new(None)),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    pub fn session(&self) -> &Arc<PeerSession> {
        &self.session
    }

    pub fn is_mining(&self) -> bool {
        self.miner.is_mining()
    }

    /// Register handlers and start the session. Returns the listen address.
    pub async fn start(&self, listen: SocketAddr) -> Result<SocketAddr, SessionError> {
        self.register_data_handler();
        self.register_request_handlers();
        self.session.start(listen).await
    }

    pub async fn stop(&self) {
        self.session.shutdown().await;
    }

    fn register_data_handler(&self) {
        let ledger = Arc::clone(&self.ledger);
        let known_keys = Arc::clone(&self.known_keys);
        let mine_cancel = Arc::clone(&self.mine_cancel);

        self.session.add_data_handler(move |packet: &Packet| {
            match packet.packet_type.as_str() {
                wire::TYPE_PUBLIC_KEY_SHARE => {
                    match serde_json::from_value::<PublicKeyShare>(packet.data.clone()) {
                        Ok(share) => {
                            info!(peer = %packet.sender, "learned public key");
                            known_keys
                                .lock()
                                .expect("key table lock")
                                .insert(packet.sender.clone(), share.public_key);
                        }
                        Err(e) => warn!(error = %e, "malformed publicKeyShare packet"),
                    }
                }
                wire::TYPE_TRANSACTION => {
                    match serde_json::from_value::<Transaction>(packet.data.clone()) {
                        Ok(tx) => ledger.lock().expect("ledger lock").add_pending_transaction(tx),
                        Err(e) => warn!(error = %e, "malformed transaction packet"),
                    }
                }
                wire::TYPE_BLOCK => {
                    match serde_json::from_value::<MinedBlock>(packet.data.clone()) {
                        Ok(block) => {
                            let mut ledger = ledger.lock().expect("ledger lock");
                            if let Some(prev) = &block.previous_hash {
                                if !ledger.has_block(prev) {
                                    warn!(
                                        peer = %packet.sender,
                                        "rejecting block: {}",
                                        ChainError::DanglingParent(prev.clone())
                                    );
                                    return;
                                }
                            }
                            ledger.add_block(block, true);
                            // the tip moved; an in-flight local search is stale
                            if let Some(flag) =
                                mine_cancel.lock().expect("mine cancel lock").as_ref()
                            {
                                flag.store(true, Ordering::Relaxed);
                            }
                        }
                        Err(e) => warn!(error = %e, "malformed block packet"),
                    }
                }
                other => debug!(packet_type = %other, "ignoring unknown packet type"),
            }
        });
    }

    fn register_request_handlers(&self) {
        let known_keys = Arc::clone(&self.known_keys);
        let own_id = self.id.clone();
        let own_key = self.public_key.clone();
        self.session
            .add_request_handler(wire::REQ_OTHER_PUBLIC_KEY, move |payload: Value| {
                let req: RequestOtherPublicKey = serde_json::from_value(payload)?;
                let public_key = if req.peer == own_id {
                    Some(own_key.clone())
                } else {
                    known_keys
                        .lock()
                        .expect("key table lock")
                        .get(&req.peer)
                        .cloned()
                };
                Ok(serde_json::to_value(ResponsePublicKey { public_key })?)
            });

        let ledger = Arc::clone(&self.ledger);
        self.session
            .add_request_handler(wire::REQ_GET_ALL_BLOCKS, move |_payload: Value| {
                let blocks = ledger.lock().expect("ledger lock").all_blocks();
                Ok(serde_json::to_value(AllBlocks { blocks })?)
            });
    }

    /// Broadcast our own public key to every connected peer.
    pub async fn share_public_key(&self) {
        let share = PublicKeyShare {
            public_key: self.public_key.clone(),
        };
        self.session
            .broadcast(
                serde_json::to_value(share).expect("serialize key share"),
                wire::TYPE_PUBLIC_KEY_SHARE,
                &[],
            )
            .await;
    }

    /// Ask `peer` for the public key it knows for `of_peer` and record the
    /// answer.
    pub async fn request_public_key(
        &self,
        peer: &str,
        of_peer: &str,
    ) -> Result<Option<String>, SessionError> {
        let payload = serde_json::to_value(RequestOtherPublicKey {
            peer: of_peer.to_string(),
        })?;
        let response = self
            .session
            .request(peer, wire::REQ_OTHER_PUBLIC_KEY, payload)
            .await?;
        let response: ResponsePublicKey = serde_json::from_value(response)?;
        if let Some(key) = &response.public_key {
            self.known_keys
                .lock()
                .expect("key table lock")
                .insert(of_peer.to_string(), key.clone());
        }
        Ok(response.public_key)
    }

    /// Build, sign, locally pend and broadcast a transfer from this node.
    pub async fn send_money(&self, receiver: &str, amount: u64) -> Result<Transaction, ChainError> {
        let tx = {
            let mut ledger = self.ledger.lock().expect("ledger lock");
            let id = ledger.next_transaction_id();
            let mut tx = Transaction::new(id, amount, &self.id, receiver);
            tx.sign(&self.private_key)?;
            ledger.add_pending_transaction(tx.clone());
            tx
        };
        info!(receiver, amount, "sending money");
        self.session
            .broadcast(
                serde_json::to_value(&tx).expect("serialize transaction"),
                wire::TYPE_TRANSACTION,
                &[],
            )
            .await;
        Ok(tx)
    }

    /// Mine the oldest pending transaction (plus the reward) into a block,
    /// add it locally and broadcast it. Returns `None` when another run is
    /// already in progress or the search was cancelled by a tip change.
    pub async fn mine_latest_transaction(&self) -> Option<MinedBlock> {
        if self.miner.is_mining() {
            debug!("mining already in progress");
            return None;
        }
        let (pending_block, previous_hash) = {
            let ledger = self.ledger.lock().expect("ledger lock");
            let oldest: Vec<Transaction> =
                ledger.pending_transactions().iter().take(1).cloned().collect();
            ledger.prepare_block(oldest)
        };

        let cancel = Arc::new(AtomicBool::new(false));
        *self.mine_cancel.lock().expect("mine cancel lock") = Some(Arc::clone(&cancel));
        let mined = self.miner.mine(pending_block, previous_hash, cancel).await;
        *self.mine_cancel.lock().expect("mine cancel lock") = None;

        let block = match mined {
            Some(block) => block,
            None => {
                info!("mining run cancelled, chain tip changed");
                return None;
            }
        };
        info!(hash = %block.hash(), "mined block");
        self.ledger
            .lock()
            .expect("ledger lock")
            .add_block(block.clone(), true);
        self.session
            .broadcast(
                serde_json::to_value(&block).expect("serialize block"),
                wire::TYPE_BLOCK,
                &[],
            )
            .await;
        Some(block)
    }

    /// Fetch every connected peer's blocks and merge them into the local
    /// arena. Parents are resolved by hash, so out-of-order arrival is fine.
    /// Returns the number of new blocks learned.
    pub async fn load_blocks_from_peers(&self) -> usize {
        let mut added = 0;
        for peer in self.session.connected_peers().await {
            let response = self
                .session
                .request(&peer, wire::REQ_GET_ALL_BLOCKS, serde_json::json!({}))
                .await;
            match response.and_then(|v| Ok(serde_json::from_value::<AllBlocks>(v)?)) {
                Ok(all) => {
                    let mut ledger = self.ledger.lock().expect("ledger lock");
                    for block in all.blocks {
                        if ledger.insert_block(block) {
                            added += 1;
                        }
                    }
                }
                Err(e) => warn!(%peer, error = %e, "getAllBlocks request failed"),
            }
        }
        if added > 0 {
            info!(added, "loaded blocks from peers");
        }
        added
    }

    /// All public keys this node can verify against: every learned key plus
    /// its own.
    pub fn public_keys(&self) -> HashMap<String, String> {
        let mut keys = self.known_keys.lock().expect("key table lock").clone();
        keys.insert(self.id.clone(), self.public_key.clone());
        keys
    }

    /// Record a peer's public key directly, as if received via key share.
    pub fn record_public_key(&self, peer: &str, public_key: &str) {
        self.known_keys
            .lock()
            .expect("key table lock")
            .insert(peer.to_string(), public_key.to_string());
    }

    pub fn balance_of(&self, user_id: &str) -> i64 {
        self.ledger
            .lock()
            .expect("ledger lock")
            .calculate_balance(&self.public_keys(), user_id)
    }

    pub fn balance(&self) -> i64 {
        self.balance_of(&self.id)
    }

    pub fn pending_transactions(&self) -> Vec<Transaction> {
        self.ledger
            .lock()
            .expect("ledger lock")
            .pending_transactions()
            .to_vec()
    }

    pub fn chain_height(&self) -> usize {
        self.ledger.lock().expect("ledger lock").chain_height()
    }

    pub fn tip_hash(&self) -> Option<String> {
        self.ledger.lock().expect("ledger lock").tip_hash()
    }

    pub fn policy(&self) -> ChainPolicy {
        self.policy
    }

    /// Direct access to the ledger, shared with the session handlers.
    pub fn ledger(&self) -> &Arc<Mutex<Ledger>> {
        &self.ledger
    }
}
