//! The peer-discovery collaborator: a directory of currently reachable peers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// A peer as listed by the discovery directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: String,
    pub addr: SocketAddr,
}

/// Discovery boundary polled by the session's reconciliation loop.
pub trait Directory: Send + Sync {
    /// Currently reachable peers, excluding `own_id`.
    fn list_active_peers(&self, own_id: &str) -> Vec<PeerInfo>;
}

/// In-memory directory. Peers register and unregister explicitly; a shared
/// instance between nodes plays the role of the discovery server.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    peers: Mutex<HashMap<String, SocketAddr>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, addr: SocketAddr) {
        self.peers.lock().expect("directory lock").insert(id.into(), addr);
    }

    pub fn unregister(&self, id: &str) {
        self.peers.lock().expect("directory lock").remove(id);
    }
}

impl Directory for StaticDirectory {
    fn list_active_peers(&self, own_id: &str) -> Vec<PeerInfo> {
        self.peers
            .lock()
            .expect("directory lock")
            .iter()
            .filter(|(id, _)| id.as_str() != own_id)
            .map(|(id, addr)| PeerInfo {
                id: id.clone(),
                addr: *addr,
            })
            .collect()
    }
}
