//! Recorder backend: a decorator that forwards every request to another
//! backend and records every response. On `finish` the recording is
//! written as a fixture document, so a later run can replay the exact same
//! audit offline.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::error;

use super::fixture::{AddressRecord, BlockRecord, FixtureDocument, Metadata, TransactionRecord};
use super::{
    AddrResponse, Backend, BackendError, BlockResponse, ResponseSenders, SenderSlot, TakeOnce,
    TxResponse, ADDR_CHANNEL_SIZE, TX_CHANNEL_SIZE,
};
use crate::deriver::Address;
use crate::progress;

struct RecorderState {
    addr_index: StdMutex<HashMap<String, AddrResponse>>,
    tx_index: StdMutex<HashMap<String, TxResponse>>,
    blocks: StdMutex<HashMap<u32, DateTime<Utc>>>,
    senders: SenderSlot,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

/// Records another backend's responses, implementing [`Backend`].
pub struct RecorderBackend {
    inner: Arc<dyn Backend>,
    state: Arc<RecorderState>,
    out_path: PathBuf,
    addr_rx: TakeOnce<mpsc::Receiver<AddrResponse>>,
    tx_rx: TakeOnce<mpsc::Receiver<TxResponse>>,
    block_rx: TakeOnce<mpsc::Receiver<BlockResponse>>,
}

impl RecorderBackend {
    /// Wrap `inner`, recording into `path` when the run finishes.
    pub fn new(inner: Arc<dyn Backend>, path: impl Into<PathBuf>) -> Self {
        let inner_addr_rx = inner.addr_responses();
        let inner_tx_rx = inner.tx_responses();
        let inner_block_rx = inner.block_responses();

        let (addr_tx, addr_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (tx_tx, tx_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (block_tx, block_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (done_tx, done_rx) = watch::channel(false);

        let state = Arc::new(RecorderState {
            addr_index: StdMutex::new(HashMap::new()),
            tx_index: StdMutex::new(HashMap::new()),
            blocks: StdMutex::new(HashMap::new()),
            senders: SenderSlot::new(ResponseSenders {
                addr: addr_tx,
                tx: tx_tx,
                block: block_tx,
            }),
            done_tx,
            done_rx,
        });

        tokio::spawn(pipe_responses(
            Arc::clone(&state),
            inner_addr_rx,
            inner_tx_rx,
            inner_block_rx,
        ));

        RecorderBackend {
            inner,
            state,
            out_path: path.into(),
            addr_rx: TakeOnce::new(addr_rx),
            tx_rx: TakeOnce::new(tx_rx),
            block_rx: TakeOnce::new(block_rx),
        }
    }

    fn write_to_file(&self) -> std::io::Result<()> {
        progress!("writing fixture to {}", self.out_path.display());

        let addresses = self
            .state
            .addr_index
            .lock()
            .expect("addr index lock")
            .values()
            .map(|resp| AddressRecord {
                address: resp.address.to_string(),
                path: resp.address.path().to_string(),
                network: resp.address.network(),
                change: resp.address.change(),
                addr_index: resp.address.index(),
                tx_hashes: resp.tx_hashes.clone(),
            })
            .collect();

        let transactions = self
            .state
            .tx_index
            .lock()
            .expect("tx index lock")
            .values()
            .map(|resp| TransactionRecord {
                hash: resp.hash.clone(),
                height: resp.height,
                hex: resp.hex.clone(),
            })
            .collect();

        let blocks = self
            .state
            .blocks
            .lock()
            .expect("blocks lock")
            .iter()
            .map(|(height, timestamp)| BlockRecord {
                height: *height,
                timestamp: *timestamp,
            })
            .collect();

        let doc = FixtureDocument {
            metadata: Metadata {
                height: self.inner.chain_height(),
            },
            addresses,
            transactions,
            blocks,
        };
        let json = doc
            .to_pretty_json()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&self.out_path, json)
    }
}

/// Move responses from the wrapped backend to our consumers, keeping a
/// copy of each.
async fn pipe_responses(
    state: Arc<RecorderState>,
    mut addr_rx: mpsc::Receiver<AddrResponse>,
    mut tx_rx: mpsc::Receiver<TxResponse>,
    mut block_rx: mpsc::Receiver<BlockResponse>,
) {
    let mut done = state.done_rx.clone();
    loop {
        let senders = match state.senders.get() {
            Some(s) => s,
            None => return,
        };
        tokio::select! {
            _ = done.changed() => return,
            Some(resp) = addr_rx.recv() => {
                state
                    .addr_index
                    .lock()
                    .expect("addr index lock")
                    .insert(resp.address.to_string(), resp.clone());
                let _ = senders.addr.send(resp).await;
            }
            Some(resp) = tx_rx.recv() => {
                state
                    .tx_index
                    .lock()
                    .expect("tx index lock")
                    .insert(resp.hash.clone(), resp.clone());
                let _ = senders.tx.send(resp).await;
            }
            Some(resp) = block_rx.recv() => {
                state
                    .blocks
                    .lock()
                    .expect("blocks lock")
                    .insert(resp.height, resp.timestamp);
                let _ = senders.block.send(resp).await;
            }
            else => return,
        }
    }
}

#[async_trait]
impl Backend for RecorderBackend {
    fn chain_height(&self) -> u32 {
        self.inner.chain_height()
    }

    async fn start(&self, target_height: u32) -> Result<(), BackendError> {
        self.inner.start(target_height).await
    }

    async fn addr_request(&self, addr: Address) {
        self.inner.addr_request(addr).await;
    }

    fn addr_responses(&self) -> mpsc::Receiver<AddrResponse> {
        self.addr_rx.take()
    }

    async fn tx_request(&self, tx_hash: String) {
        self.inner.tx_request(tx_hash).await;
    }

    fn tx_responses(&self) -> mpsc::Receiver<TxResponse> {
        self.tx_rx.take()
    }

    async fn block_request(&self, height: u32) {
        self.inner.block_request(height).await;
    }

    fn block_responses(&self) -> mpsc::Receiver<BlockResponse> {
        self.block_rx.take()
    }

    fn finish(&self) {
        self.inner.finish();
        if let Err(e) = self.write_to_file() {
            error!("failed to write fixture {}: {}", self.out_path.display(), e);
        }
        let _ = self.state.done_tx.send(true);
        self.state.senders.drop_senders();
    }
}
