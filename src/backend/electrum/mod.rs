//! Peer-pool backend speaking the Electrum protocol.
//!
//! One initial peer is connected and validated up front; a background loop
//! keeps discovering additional peers through `server.peers.subscribe`.
//! Validation of every peer checks the genesis hash, the advertised
//! protocol version (>= 1.2), negotiates our version, and reads the peer's
//! chain tip; the validation connection is then dropped and a fresh working
//! connection opened, because a headers subscription cannot be undone.
//!
//! Peers that fail validation or any request are blacklisted for the rest
//! of the run and the failed request is handed to another peer, with a
//! per-item attempt cap so a permanently missing record cannot make the
//! run spin forever.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::interval;
use tracing::{debug, info, warn};

pub mod node;
pub mod transport;

use self::node::{check_version, node_ident, HistoryItem, Node, Peer};
use super::{
    AddrResponse, Backend, BackendError, BlockResponse, ResponseSenders, SenderSlot, TakeOnce,
    TxResponse, ADDR_CHANNEL_SIZE, MAX_ATTEMPTS, TX_CHANNEL_SIZE,
};
use crate::config::Network;
use crate::deriver::Address;
use crate::progress;
use crate::reporter::Reporter;

/// Hard cap on pool size.
pub const MAX_PEERS: usize = 100;

/// How often the discovery loop asks a peer for more peers.
const PEER_FETCH_INTERVAL: Duration = Duration::from_secs(30);

/// A unit of work, multiplexed over every connected peer. Re-enqueued items
/// carry the number of attempts already burned on them.
enum Work {
    Addr { addr: Address, attempts: u32 },
    Tx { hash: String, attempts: u32 },
    Block { height: u32, attempts: u32 },
    Peers,
}

struct Shared {
    network: Network,
    target_height: AtomicU32,
    work_tx: mpsc::Sender<Work>,
    work_rx: AsyncMutex<mpsc::Receiver<Work>>,
    senders: SenderSlot,
    peers: StdMutex<HashSet<String>>,
    blacklist: StdMutex<HashSet<String>>,
    tx_heights: StdMutex<HashMap<String, i64>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Shared {
    fn done(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    fn peer_count(&self) -> usize {
        self.peers.lock().expect("peer lock").len()
    }

    fn is_known(&self, ident: &str) -> bool {
        self.peers.lock().expect("peer lock").contains(ident)
            || self.blacklist.lock().expect("blacklist lock").contains(ident)
    }

    fn remove_peer(&self, ident: &str) {
        self.peers.lock().expect("peer lock").remove(ident);
    }

    /// Take a peer out of rotation for the rest of the run.
    fn shutdown_peer(&self, ident: &str) {
        self.remove_peer(ident);
        self.blacklist
            .lock()
            .expect("blacklist lock")
            .insert(ident.to_string());
    }

    /// Record heights learned from an address history. Observing the same
    /// hash at two different heights means the chain data is inconsistent,
    /// which nothing downstream could recover from.
    fn cache_tx_heights(&self, items: &[HistoryItem]) {
        let mut heights = self.tx_heights.lock().expect("tx height lock");
        for item in items {
            if let Some(known) = heights.get(&item.tx_hash) {
                if *known != item.height {
                    panic!(
                        "inconsistent tx height cache: {} {} != {}",
                        item.tx_hash, known, item.height
                    );
                }
            }
            heights.insert(item.tx_hash.clone(), item.height);
        }
    }

    /// Height for a transaction we have already seen in some address
    /// history. A miss means requests were answered out of order in a way
    /// the protocol does not allow.
    fn tx_height(&self, hash: &str) -> i64 {
        *self
            .tx_heights
            .lock()
            .expect("tx height lock")
            .get(hash)
            .unwrap_or_else(|| panic!("tx height cache miss for {}", hash))
    }

    /// Hand a failed request to the next available peer.
    async fn requeue(&self, work: Work) {
        let (attempts, desc) = match &work {
            Work::Addr { addr, attempts } => (*attempts, format!("address {}", addr)),
            Work::Tx { hash, attempts } => (*attempts, format!("tx {}", hash)),
            Work::Block { height, attempts } => (*attempts, format!("block {}", height)),
            Work::Peers => return,
        };
        if attempts > MAX_ATTEMPTS {
            panic!("giving up on {} after {} attempts", desc, MAX_ATTEMPTS);
        }
        let _ = self.work_tx.send(work).await;
    }
}

/// Pool of Electrum peers implementing [`Backend`].
pub struct ElectrumBackend {
    chain_height: u32,
    initial_peer: (String, String),
    shared: Arc<Shared>,
    addr_rx: TakeOnce<mpsc::Receiver<AddrResponse>>,
    tx_rx: TakeOnce<mpsc::Receiver<TxResponse>>,
    block_rx: TakeOnce<mpsc::Receiver<BlockResponse>>,
}

impl ElectrumBackend {
    /// Validate the initial peer and read the chain tip from it. The peer
    /// itself joins the pool when `start` is called; peer discovery runs
    /// from then on.
    pub async fn new(host: &str, port: &str, network: Network) -> Result<Self, BackendError> {
        let mut probe = Node::connect(host, port, network).await?;
        let chain_height = validate_node(&mut probe, network, None).await?;
        drop(probe);

        let (work_tx, work_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (addr_tx, addr_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (tx_tx, tx_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (block_tx, block_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            network,
            target_height: AtomicU32::new(0),
            work_tx,
            work_rx: AsyncMutex::new(work_rx),
            senders: SenderSlot::new(ResponseSenders {
                addr: addr_tx,
                tx: tx_tx,
                block: block_tx,
            }),
            peers: StdMutex::new(HashSet::new()),
            blacklist: StdMutex::new(HashSet::new()),
            tx_heights: StdMutex::new(HashMap::new()),
            done_tx,
            done_rx,
        });

        Ok(ElectrumBackend {
            chain_height,
            initial_peer: (host.to_string(), port.to_string()),
            shared,
            addr_rx: TakeOnce::new(addr_rx),
            tx_rx: TakeOnce::new(tx_rx),
            block_rx: TakeOnce::new(block_rx),
        })
    }
}

#[async_trait]
impl Backend for ElectrumBackend {
    fn chain_height(&self) -> u32 {
        self.chain_height
    }

    async fn start(&self, target_height: u32) -> Result<(), BackendError> {
        self.shared
            .target_height
            .store(target_height, Ordering::Relaxed);

        // The initial peer is the user's choice; if it cannot serve, there
        // is no fallback.
        let (host, port) = self.initial_peer.clone();
        add_node(Arc::clone(&self.shared), host, port).await?;

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut done = shared.done();
            let mut tick = interval(PEER_FETCH_INTERVAL);
            loop {
                tokio::select! {
                    _ = done.changed() => return,
                    _ = tick.tick() => {
                        Reporter::global().set_peers(shared.peer_count() as i32);
                        if shared.peer_count() < MAX_PEERS {
                            let _ = shared.work_tx.send(Work::Peers).await;
                        }
                    }
                }
            }
        });
        Ok(())
    }

    async fn addr_request(&self, addr: Address) {
        Reporter::global().inc_addresses_scheduled();
        progress!("scheduling address: {}", addr);
        let _ = self
            .shared
            .work_tx
            .send(Work::Addr { addr, attempts: 0 })
            .await;
    }

    fn addr_responses(&self) -> mpsc::Receiver<AddrResponse> {
        self.addr_rx.take()
    }

    async fn tx_request(&self, tx_hash: String) {
        Reporter::global().inc_tx_scheduled();
        progress!("scheduling tx: {}", tx_hash);
        let _ = self
            .shared
            .work_tx
            .send(Work::Tx {
                hash: tx_hash,
                attempts: 0,
            })
            .await;
    }

    fn tx_responses(&self) -> mpsc::Receiver<TxResponse> {
        self.tx_rx.take()
    }

    async fn block_request(&self, height: u32) {
        let _ = self
            .shared
            .work_tx
            .send(Work::Block {
                height,
                attempts: 0,
            })
            .await;
    }

    fn block_responses(&self) -> mpsc::Receiver<BlockResponse> {
        self.block_rx.take()
    }

    fn finish(&self) {
        let _ = self.shared.done_tx.send(true);
        self.shared.senders.drop_senders();
        self.shared.peers.lock().expect("peer lock").clear();
    }
}

/// Full validation handshake. Returns the peer's chain tip.
async fn validate_node(
    node: &mut Node,
    network: Network,
    min_tip: Option<u32>,
) -> Result<u32, BackendError> {
    let features = node
        .server_features()
        .await
        .map_err(|e| BackendError::Rpc(e.to_string()))?;
    if features.genesis_hash != network.genesis_hash() {
        return Err(BackendError::IncorrectGenesisBlock {
            expected: network.genesis_hash().to_string(),
            actual: features.genesis_hash,
        });
    }
    check_version(&features.protocol_max)?;
    node.server_version()
        .await
        .map_err(|_| BackendError::FailedNegotiateVersion)?;
    let tip = node
        .headers_subscribe()
        .await
        .map_err(|e| BackendError::Rpc(e.to_string()))?
        .height;
    if let Some(min) = min_tip {
        if tip < min {
            return Err(BackendError::StaleTip { tip, target: min });
        }
    }
    Ok(tip)
}

/// Validate a peer and, on success, put a worker for it into the pool.
async fn add_node(shared: Arc<Shared>, host: String, port: String) -> Result<(), BackendError> {
    let ident = node_ident(&host, &port);
    if shared.is_known(&ident) {
        return Err(BackendError::Connect(
            ident,
            "already connected or known to be unreachable".to_string(),
        ));
    }

    info!("connecting to {}", ident);
    let target = shared.target_height.load(Ordering::Relaxed);
    let min_tip = (target > 0).then_some(target);

    let validated = async {
        let mut probe = Node::connect(&host, &port, shared.network).await?;
        validate_node(&mut probe, shared.network, min_tip).await?;
        drop(probe);
        Node::connect(&host, &port, shared.network).await
    }
    .await;

    let node = match validated {
        Ok(node) => node,
        Err(e) => {
            shared.shutdown_peer(&ident);
            return Err(e);
        }
    };

    let senders = match shared.senders.get() {
        Some(s) => s,
        None => return Ok(()), // already finished
    };
    shared.peers.lock().expect("peer lock").insert(ident);
    tokio::spawn(run_worker(shared, node, senders));
    Ok(())
}

/// Per-peer worker: pulls work off the shared queue and runs it over this
/// peer's single serial connection. Any failure retires the peer.
async fn run_worker(shared: Arc<Shared>, mut node: Node, senders: ResponseSenders) {
    let mut done = shared.done();
    loop {
        let work = tokio::select! {
            _ = done.changed() => break,
            work = async { shared.work_rx.lock().await.recv().await } => match work {
                Some(work) => work,
                None => break,
            },
        };

        let ok = match work {
            Work::Addr { addr, attempts } => {
                process_addr(&shared, &mut node, &senders, addr, attempts).await
            }
            Work::Tx { hash, attempts } => {
                process_tx(&shared, &mut node, &senders, hash, attempts).await
            }
            Work::Block { height, attempts } => {
                process_block(&shared, &mut node, &senders, height, attempts).await
            }
            Work::Peers => process_peers(&shared, &mut node).await,
        };
        if !ok {
            shared.shutdown_peer(&node.ident);
            break;
        }
    }
    shared.remove_peer(&node.ident);
}

async fn process_addr(
    shared: &Arc<Shared>,
    node: &mut Node,
    senders: &ResponseSenders,
    addr: Address,
    attempts: u32,
) -> bool {
    match node.address_get_history(&addr.to_string()).await {
        Ok(history) => {
            shared.cache_tx_heights(&history);
            let tx_hashes = history.into_iter().map(|item| item.tx_hash).collect();
            let _ = senders
                .addr
                .send(AddrResponse {
                    address: addr,
                    tx_hashes,
                })
                .await;
            true
        }
        Err(e) => {
            warn!("address request failed on {}: {}", node.ident, e);
            shared
                .requeue(Work::Addr {
                    addr,
                    attempts: attempts + 1,
                })
                .await;
            false
        }
    }
}

async fn process_tx(
    shared: &Arc<Shared>,
    node: &mut Node,
    senders: &ResponseSenders,
    hash: String,
    attempts: u32,
) -> bool {
    match node.transaction_get(&hash).await {
        Ok(hex) => {
            // The get call does not return a height; it was recorded when
            // the hash showed up in an address history.
            let height = shared.tx_height(&hash);
            let _ = senders.tx.send(TxResponse { hash, height, hex }).await;
            true
        }
        Err(e) => {
            warn!("tx request failed on {}: {}", node.ident, e);
            shared
                .requeue(Work::Tx {
                    hash,
                    attempts: attempts + 1,
                })
                .await;
            false
        }
    }
}

async fn process_block(
    shared: &Arc<Shared>,
    node: &mut Node,
    senders: &ResponseSenders,
    height: u32,
    attempts: u32,
) -> bool {
    match node.block_header_timestamp(height).await {
        Ok(timestamp) => {
            let _ = senders.block.send(BlockResponse { height, timestamp }).await;
            true
        }
        Err(e) => {
            warn!("block request failed on {}: {}", node.ident, e);
            shared
                .requeue(Work::Block {
                    height,
                    attempts: attempts + 1,
                })
                .await;
            false
        }
    }
}

async fn process_peers(shared: &Arc<Shared>, node: &mut Node) -> bool {
    if shared.peer_count() >= MAX_PEERS {
        return true;
    }
    match node.peers_subscribe().await {
        Ok(peers) => {
            for peer in peers {
                add_peer(shared, peer);
            }
            true
        }
        Err(e) => {
            warn!("peer discovery failed on {}: {}", node.ident, e);
            false
        }
    }
}

/// Consider one advertised peer for the pool. Tor-only hosts and old
/// protocol versions are skipped; TCP is preferred over TLS.
fn add_peer(shared: &Arc<Shared>, peer: Peer) {
    if peer.host.ends_with(".onion") {
        debug!("skipping {} because of .onion", peer.host);
        return;
    }
    if check_version(&peer.version).is_err() {
        debug!(
            "skipping {} because of protocol version {}",
            peer.host, peer.version
        );
        return;
    }
    let host = if peer.ip.is_empty() {
        peer.host.clone()
    } else {
        peer.ip.clone()
    };
    let feature = peer
        .features
        .iter()
        .find(|f| f.starts_with('t'))
        .or_else(|| peer.features.iter().find(|f| f.starts_with('s')));
    match feature {
        Some(f) => {
            let shared = Arc::clone(shared);
            let port = f.clone();
            tokio::spawn(async move {
                if let Err(e) = add_node(shared, host, port).await {
                    debug!("could not add peer: {}", e);
                }
            });
        }
        None => debug!(
            "skipping {}: no tcp or tls service in {:?}",
            peer.host, peer.features
        ),
    }
}
