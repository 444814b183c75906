//! Trusted-node backend.
//!
//! Talks HTTP JSON-RPC to a single btcd node the operator runs themselves
//! (`--txindex --addrindex`). Because the node is trusted there are no
//! retries and no blacklist: any failure is fatal for the process. A pool
//! of workers pulls from shared request queues, since one HTTP round-trip
//! at a time would make large wallets crawl.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::warn;

use super::{
    AddrResponse, Backend, BackendError, BlockResponse, ResponseSenders, SenderSlot, TakeOnce,
    TxResponse, ADDR_CHANNEL_SIZE, MAX_TXS_PER_ADDR, TX_CHANNEL_SIZE,
};
use crate::config::Network;
use crate::deriver::Address;
use crate::progress;
use crate::reporter::Reporter;

/// Number of concurrent RPC workers.
const WORKER_COUNT: usize = 100;

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

/// A verbose transaction as returned by `searchrawtransactions` and
/// `getrawtransaction`.
#[derive(Debug, Clone, Deserialize)]
struct VerboseTx {
    txid: String,
    hex: String,
    #[serde(default)]
    blockhash: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VerboseHeader {
    height: i64,
    time: i64,
}

struct RpcClient {
    http: reqwest::Client,
    url: String,
    user: String,
    pass: String,
    next_id: AtomicU64,
}

impl RpcClient {
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::json!({
            "jsonrpc": "1.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let resp = self
            .http
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&body)
            .send()
            .await
            .map_err(|e| BackendError::Rpc(format!("{}: {}", method, e)))?;
        let parsed: RpcResponse<T> = resp
            .json()
            .await
            .map_err(|e| BackendError::Rpc(format!("{}: {}", method, e)))?;
        if let Some(err) = parsed.error {
            return Err(BackendError::Rpc(format!(
                "{}: {} (code {})",
                method, err.message, err.code
            )));
        }
        parsed
            .result
            .ok_or_else(|| BackendError::Rpc(format!("{}: missing result", method)))
    }
}

enum BtcdWork {
    Addr(Address),
    Tx(String),
    Block(u32),
}

struct BtcdShared {
    client: RpcClient,
    work_tx: mpsc::Sender<BtcdWork>,
    work_rx: AsyncMutex<mpsc::Receiver<BtcdWork>>,
    senders: SenderSlot,
    // block hash -> height; idempotent writes only
    header_heights: StdMutex<HashMap<String, i64>>,
    // transactions already fetched while answering address queries
    tx_cache: StdMutex<HashMap<String, TxResponse>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Single trusted btcd node implementing [`Backend`].
pub struct BtcdBackend {
    chain_height: u32,
    shared: Arc<BtcdShared>,
    addr_rx: TakeOnce<mpsc::Receiver<AddrResponse>>,
    tx_rx: TakeOnce<mpsc::Receiver<TxResponse>>,
    block_rx: TakeOnce<mpsc::Receiver<BlockResponse>>,
}

impl BtcdBackend {
    /// Connect, verify the node is on the expected chain and read the tip.
    pub async fn new(
        host_port: &str,
        user: &str,
        pass: &str,
        network: Network,
    ) -> Result<Self, BackendError> {
        let client = RpcClient {
            http: reqwest::Client::new(),
            url: format!("http://{}", host_port),
            user: user.to_string(),
            pass: pass.to_string(),
            next_id: AtomicU64::new(1),
        };

        let genesis: String = client.call("getblockhash", serde_json::json!([0])).await?;
        if genesis != network.genesis_hash() {
            return Err(BackendError::IncorrectGenesisBlock {
                expected: network.genesis_hash().to_string(),
                actual: genesis,
            });
        }
        let count: i64 = client.call("getblockcount", serde_json::json!([])).await?;

        let (work_tx, work_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (addr_tx, addr_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (tx_tx, tx_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (block_tx, block_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(BtcdShared {
            client,
            work_tx,
            work_rx: AsyncMutex::new(work_rx),
            senders: SenderSlot::new(ResponseSenders {
                addr: addr_tx,
                tx: tx_tx,
                block: block_tx,
            }),
            header_heights: StdMutex::new(HashMap::new()),
            tx_cache: StdMutex::new(HashMap::new()),
            done_tx,
            done_rx,
        });

        Ok(BtcdBackend {
            chain_height: count as u32,
            shared,
            addr_rx: TakeOnce::new(addr_rx),
            tx_rx: TakeOnce::new(tx_rx),
            block_rx: TakeOnce::new(block_rx),
        })
    }
}

#[async_trait]
impl Backend for BtcdBackend {
    fn chain_height(&self) -> u32 {
        self.chain_height
    }

    async fn start(&self, _target_height: u32) -> Result<(), BackendError> {
        for _ in 0..WORKER_COUNT {
            let senders = match self.shared.senders.get() {
                Some(s) => s,
                None => break,
            };
            tokio::spawn(run_worker(Arc::clone(&self.shared), senders));
        }
        Reporter::global().set_peers(1);
        Ok(())
    }

    async fn addr_request(&self, addr: Address) {
        Reporter::global().inc_addresses_scheduled();
        progress!("scheduling address: {}", addr);
        let _ = self.shared.work_tx.send(BtcdWork::Addr(addr)).await;
    }

    fn addr_responses(&self) -> mpsc::Receiver<AddrResponse> {
        self.addr_rx.take()
    }

    async fn tx_request(&self, tx_hash: String) {
        Reporter::global().inc_tx_scheduled();
        progress!("scheduling tx: {}", tx_hash);
        let _ = self.shared.work_tx.send(BtcdWork::Tx(tx_hash)).await;
    }

    fn tx_responses(&self) -> mpsc::Receiver<TxResponse> {
        self.tx_rx.take()
    }

    async fn block_request(&self, height: u32) {
        let _ = self.shared.work_tx.send(BtcdWork::Block(height)).await;
    }

    fn block_responses(&self) -> mpsc::Receiver<BlockResponse> {
        self.block_rx.take()
    }

    fn finish(&self) {
        let _ = self.shared.done_tx.send(true);
        self.shared.senders.drop_senders();
    }
}

async fn run_worker(shared: Arc<BtcdShared>, senders: ResponseSenders) {
    let mut done = shared.done_rx.clone();
    loop {
        let work = tokio::select! {
            _ = done.changed() => return,
            work = async { shared.work_rx.lock().await.recv().await } => match work {
                Some(work) => work,
                None => return,
            },
        };
        // The node is trusted; a failed request means the audit cannot be
        // completed correctly.
        let result = match work {
            BtcdWork::Addr(addr) => process_addr(&shared, &senders, addr).await,
            BtcdWork::Tx(hash) => process_tx(&shared, &senders, hash).await,
            BtcdWork::Block(height) => process_block(&shared, &senders, height).await,
        };
        if let Err(e) = result {
            panic!("trusted node request failed: {}", e);
        }
    }
}

async fn process_addr(
    shared: &BtcdShared,
    senders: &ResponseSenders,
    addr: Address,
) -> Result<(), BackendError> {
    let text = addr.to_string();
    let params = serde_json::json!([
        text,
        1,                     // verbose
        0,                     // skip
        MAX_TXS_PER_ADDR + 1,  // count
        0,                     // vinextra
        false,                 // reverse
        [text],                // filteraddrs
    ]);
    let txs: Vec<VerboseTx> = match shared.client.call("searchrawtransactions", params).await {
        Ok(txs) => txs,
        // An unused address has no index entry at all.
        Err(BackendError::Rpc(msg)) if msg.contains("No information") => Vec::new(),
        Err(e) => return Err(e),
    };
    if txs.len() > MAX_TXS_PER_ADDR {
        panic!(
            "address {} has more than the allowed {} transactions",
            text, MAX_TXS_PER_ADDR
        );
    }

    let mut tx_hashes = Vec::with_capacity(txs.len());
    for tx in txs {
        let height = match &tx.blockhash {
            Some(hash) => block_height(shared, hash).await?,
            None => 0,
        };
        tx_hashes.push(tx.txid.clone());
        shared.tx_cache.lock().expect("tx cache lock").insert(
            tx.txid.clone(),
            TxResponse {
                hash: tx.txid,
                height,
                hex: tx.hex,
            },
        );
    }

    let _ = senders
        .addr
        .send(AddrResponse {
            address: addr,
            tx_hashes,
        })
        .await;
    Ok(())
}

async fn process_tx(
    shared: &BtcdShared,
    senders: &ResponseSenders,
    hash: String,
) -> Result<(), BackendError> {
    let cached = shared
        .tx_cache
        .lock()
        .expect("tx cache lock")
        .get(&hash)
        .cloned();
    let resp = match cached {
        Some(resp) => resp,
        None => {
            let tx: VerboseTx = shared
                .client
                .call("getrawtransaction", serde_json::json!([hash, 1]))
                .await?;
            let height = match &tx.blockhash {
                Some(block) => block_height(shared, block).await?,
                None => 0,
            };
            TxResponse {
                hash: tx.txid,
                height,
                hex: tx.hex,
            }
        }
    };
    let _ = senders.tx.send(resp).await;
    Ok(())
}

async fn process_block(
    shared: &BtcdShared,
    senders: &ResponseSenders,
    height: u32,
) -> Result<(), BackendError> {
    let hash: String = shared
        .client
        .call("getblockhash", serde_json::json!([height]))
        .await?;
    let header: VerboseHeader = shared
        .client
        .call("getblockheader", serde_json::json!([hash, true]))
        .await?;
    let timestamp = DateTime::<Utc>::from_timestamp(header.time, 0)
        .ok_or_else(|| BackendError::Rpc(format!("bad header time {}", header.time)))?;
    if header.height != height as i64 {
        warn!(
            "header height mismatch: asked {}, node says {}",
            height, header.height
        );
    }
    let _ = senders.block.send(BlockResponse { height, timestamp }).await;
    Ok(())
}

/// Height for a block hash, via the idempotent header cache.
async fn block_height(shared: &BtcdShared, hash: &str) -> Result<i64, BackendError> {
    if let Some(height) = shared
        .header_heights
        .lock()
        .expect("header cache lock")
        .get(hash)
    {
        return Ok(*height);
    }
    let header: VerboseHeader = shared
        .client
        .call("getblockheader", serde_json::json!([hash, true]))
        .await?;
    shared
        .header_heights
        .lock()
        .expect("header cache lock")
        .insert(hash.to_string(), header.height);
    Ok(header.height)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const TESTNET_GENESIS: &str =
        "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";

    fn rpc_result(id: &serde_json::Value, result: serde_json::Value) -> Vec<u8> {
        let body =
            serde_json::json!({"jsonrpc": "1.0", "id": id, "result": result, "error": null})
                .to_string();
        format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }

    /// Tiny HTTP/1.1 JSON-RPC stub that understands just enough of the
    /// protocol for these tests.
    async fn spawn_stub_node(genesis: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let (mut sock, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        // Read one request: headers, then content-length bytes.
                        let mut chunk = [0u8; 1024];
                        let header_end = loop {
                            if let Some(pos) =
                                buf.windows(4).position(|w| w == b"\r\n\r\n")
                            {
                                break pos + 4;
                            }
                            match sock.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        };
                        let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
                        let content_length: usize = headers
                            .lines()
                            .find_map(|l| {
                                let (name, value) = l.split_once(':')?;
                                name.eq_ignore_ascii_case("content-length")
                                    .then(|| value.trim().parse().ok())?
                            })
                            .unwrap_or(0);
                        while buf.len() < header_end + content_length {
                            match sock.read(&mut chunk).await {
                                Ok(0) | Err(_) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                            }
                        }
                        let body: serde_json::Value =
                            serde_json::from_slice(&buf[header_end..header_end + content_length])
                                .unwrap();
                        buf.drain(..header_end + content_length);

                        let id = body["id"].clone();
                        let params = body["params"].clone();
                        let result = match body["method"].as_str().unwrap() {
                            "getblockhash" if params[0] == 0 => {
                                serde_json::json!(genesis)
                            }
                            "getblockhash" => serde_json::json!("00beef"),
                            "getblockcount" => serde_json::json!(1500),
                            "getblockheader" => serde_json::json!({
                                "height": 42,
                                "time": 1_400_000_000,
                            }),
                            "searchrawtransactions" => serde_json::json!([
                                {"txid": "aa", "hex": "00", "blockhash": "00beef"}
                            ]),
                            "getrawtransaction" => serde_json::json!(
                                {"txid": "bb", "hex": "01", "blockhash": "00beef"}
                            ),
                            other => panic!("unexpected method {}", other),
                        };
                        if sock.write_all(&rpc_result(&id, result)).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn test_genesis_mismatch_is_fatal() {
        let port = spawn_stub_node("not-the-testnet-genesis").await;
        let result = BtcdBackend::new(
            &format!("127.0.0.1:{}", port),
            "user",
            "pass",
            Network::Testnet,
        )
        .await;
        assert!(matches!(
            result,
            Err(BackendError::IncorrectGenesisBlock { .. })
        ));
    }

    #[tokio::test]
    async fn test_addr_and_tx_flow() {
        let port = spawn_stub_node(TESTNET_GENESIS).await;
        let backend = BtcdBackend::new(
            &format!("127.0.0.1:{}", port),
            "user",
            "pass",
            Network::Testnet,
        )
        .await
        .unwrap();
        assert_eq!(backend.chain_height(), 1500);

        let mut addr_rx = backend.addr_responses();
        let mut tx_rx = backend.tx_responses();
        let mut block_rx = backend.block_responses();
        backend.start(1000).await.unwrap();

        let deriver = crate::deriver::AddressDeriver::single_address(
            Network::Testnet,
            "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn",
        )
        .unwrap();
        backend.addr_request(deriver.derive(0, 0)).await;
        let addr_resp = addr_rx.recv().await.unwrap();
        assert_eq!(addr_resp.tx_hashes, vec!["aa".to_string()]);

        // Served from the cache populated by the address query.
        backend.tx_request("aa".to_string()).await;
        let tx_resp = tx_rx.recv().await.unwrap();
        assert_eq!(tx_resp.height, 42);
        assert_eq!(tx_resp.hex, "00");

        backend.block_request(42).await;
        let block_resp = block_rx.recv().await.unwrap();
        assert_eq!(block_resp.timestamp.timestamp(), 1_400_000_000);

        backend.finish();
    }
}
