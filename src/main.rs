use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use rand::RngCore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use peerchain::core::directory::StaticDirectory;
use peerchain::core::node::Node;
use peerchain::core::session::SessionConfig;
use peerchain::core::types::ChainPolicy;

#[derive(Parser, Debug)]
#[command(name = "peerchain")]
#[command(about = "A proof-of-work ledger node with peer-to-peer gossip.", long_about = None)]
struct Cli {
    /// Node identity. Random when omitted.
    #[arg(long)]
    id: Option<String>,

    /// Listen address for inbound peer connections.
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Known peer, as `id@host:port`. May be given multiple times.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// Number of leading zero hex digits a block hash must carry.
    #[arg(long, default_value_t = 3)]
    difficulty: usize,

    /// Reward amount minted per mined block.
    #[arg(long, default_value_t = 100)]
    reward: u64,

    /// Mine pending transactions as they arrive.
    #[arg(long)]
    mine: bool,

    /// Send `--amount` to this peer once connected.
    #[arg(long)]
    send_to: Option<String>,

    /// Amount for `--send-to`.
    #[arg(long, default_value_t = 10)]
    amount: u64,
}

fn random_id() -> String {
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("node-{}", hex::encode(bytes))
}

fn parse_peer(entry: &str) -> anyhow::Result<(String, SocketAddr)> {
    let (id, addr) = entry
        .split_once('@')
        .ok_or_else(|| anyhow::anyhow!("peer must be `id@host:port`, got `{entry}`"))?;
    Ok((id.to_string(), addr.parse()?))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let id = cli.id.unwrap_or_else(random_id);
    let policy = ChainPolicy {
        difficulty: cli.difficulty,
        reward: cli.reward,
    };

    let directory = Arc::new(StaticDirectory::new());
    for entry in &cli.peers {
        let (peer_id, addr) = parse_peer(entry)?;
        directory.register(peer_id, addr);
    }

    let node = Node::new(id.clone(), directory.clone(), policy, SessionConfig::default());
    let addr = node.start(cli.listen).await?;
    info!(%id, %addr, "node running");

    let mut sent = false;
    let mut synced = false;
    loop {
        tokio::time::sleep(Duration::from_secs(5)).await;
        let connected = node.session().connected_peers().await;

        node.share_public_key().await;
        if !connected.is_empty() && !synced {
            node.load_blocks_from_peers().await;
            synced = true;
        }

        if let Some(receiver) = &cli.send_to {
            if !sent && connected.iter().any(|p| p == receiver) {
                match node.request_public_key(receiver, receiver).await {
                    Ok(Some(_)) => {
                        node.send_money(receiver, cli.amount).await?;
                        sent = true;
                    }
                    Ok(None) => warn!(%receiver, "peer has no known public key yet"),
                    Err(e) => warn!(%receiver, error = %e, "public key request failed"),
                }
            }
        }

        if cli.mine && !node.pending_transactions().is_empty() && !node.is_mining() {
            let node = node.clone();
            tokio::spawn(async move {
                node.mine_latest_transaction().await;
            });
        }

        info!(
            height = node.chain_height(),
            pending = node.pending_transactions().len(),
            balance = node.balance(),
            peers = connected.len(),
            "status"
        );
    }
}
