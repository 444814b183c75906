//! Fixture backend: replays a transcript recorded by the recorder backend.
//!
//! The fixture document is plain JSON so recordings can be inspected and
//! trimmed by hand. Addresses and transactions are sorted by their primary
//! string field when written, making recordings diffable.
//!
//! Replay semantics: an address the recording never saw answers with an
//! empty history (it had none when the recording was made). A transaction
//! the recording never saw is dropped with a warning. A block header the
//! recording never saw is fatal; the block finder cannot do anything
//! meaningful with a hole in its search space.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use super::{
    AddrResponse, Backend, BackendError, BlockResponse, ResponseSenders, SenderSlot, TakeOnce,
    TxResponse, ADDR_CHANNEL_SIZE, TX_CHANNEL_SIZE,
};
use crate::config::Network;
use crate::deriver::Address;
use crate::progress;
use crate::reporter::Reporter;

/// The on-disk fixture document.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct FixtureDocument {
    pub metadata: Metadata,
    pub addresses: Vec<AddressRecord>,
    pub transactions: Vec<TransactionRecord>,
    #[serde(default)]
    pub blocks: Vec<BlockRecord>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Metadata {
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub path: String,
    pub network: Network,
    pub change: u32,
    pub addr_index: u32,
    pub tx_hashes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub hash: String,
    pub height: i64,
    pub hex: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRecord {
    pub height: u32,
    pub timestamp: DateTime<Utc>,
}

impl FixtureDocument {
    /// Deterministic, diff-friendly serialization: sorted arrays, four
    /// space indentation.
    pub fn to_pretty_json(&self) -> Result<String, serde_json::Error> {
        let mut sorted = self.clone();
        sorted.addresses.sort_by(|a, b| a.address.cmp(&b.address));
        sorted.transactions.sort_by(|a, b| a.hash.cmp(&b.hash));
        sorted.blocks.sort_by_key(|b| b.height);

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        sorted.serialize(&mut ser)?;
        Ok(String::from_utf8(buf).expect("serde_json writes utf-8"))
    }
}

/// Replays a recorded transcript, implementing [`Backend`].
pub struct FixtureBackend {
    chain_height: u32,
    addr_index: HashMap<String, AddrResponse>,
    tx_index: HashMap<String, TxResponse>,
    blocks: HashMap<u32, DateTime<Utc>>,
    senders: SenderSlot,
    addr_rx: TakeOnce<mpsc::Receiver<AddrResponse>>,
    tx_rx: TakeOnce<mpsc::Receiver<TxResponse>>,
    block_rx: TakeOnce<mpsc::Receiver<BlockResponse>>,
}

impl FixtureBackend {
    /// Load a fixture file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, BackendError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            BackendError::Fixture(format!("cannot open {}: {}", path.display(), e))
        })?;
        let doc: FixtureDocument = serde_json::from_str(&data).map_err(|e| {
            BackendError::Fixture(format!("cannot parse {}: {}", path.display(), e))
        })?;
        Self::from_document(doc)
    }

    /// Build a replaying backend from an in-memory document.
    pub fn from_document(doc: FixtureDocument) -> Result<Self, BackendError> {
        let mut addr_index = HashMap::with_capacity(doc.addresses.len());
        for record in &doc.addresses {
            let address = Address::from_record(
                &record.path,
                &record.address,
                record.network,
                record.change,
                record.addr_index,
            )
            .map_err(|e| BackendError::Fixture(e.to_string()))?;
            addr_index.insert(
                record.address.clone(),
                AddrResponse {
                    address,
                    tx_hashes: record.tx_hashes.clone(),
                },
            );
        }

        let tx_index = doc
            .transactions
            .iter()
            .map(|t| {
                (
                    t.hash.clone(),
                    TxResponse {
                        hash: t.hash.clone(),
                        height: t.height,
                        hex: t.hex.clone(),
                    },
                )
            })
            .collect();

        let blocks = doc.blocks.iter().map(|b| (b.height, b.timestamp)).collect();

        let (addr_tx, addr_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);
        let (tx_tx, tx_rx) = mpsc::channel(TX_CHANNEL_SIZE);
        let (block_tx, block_rx) = mpsc::channel(ADDR_CHANNEL_SIZE);

        Ok(FixtureBackend {
            chain_height: doc.metadata.height,
            addr_index,
            tx_index,
            blocks,
            senders: SenderSlot::new(ResponseSenders {
                addr: addr_tx,
                tx: tx_tx,
                block: block_tx,
            }),
            addr_rx: TakeOnce::new(addr_rx),
            tx_rx: TakeOnce::new(tx_rx),
            block_rx: TakeOnce::new(block_rx),
        })
    }
}

#[async_trait]
impl Backend for FixtureBackend {
    fn chain_height(&self) -> u32 {
        self.chain_height
    }

    async fn start(&self, _target_height: u32) -> Result<(), BackendError> {
        Ok(())
    }

    async fn addr_request(&self, addr: Address) {
        Reporter::global().inc_addresses_scheduled();
        progress!("[fixture] scheduling address: {}", addr);
        let senders = match self.senders.get() {
            Some(s) => s,
            None => return,
        };
        let resp = match self.addr_index.get(&addr.to_string()) {
            Some(resp) => resp.clone(),
            // Never observed while recording, so it has no history.
            None => AddrResponse {
                address: addr,
                tx_hashes: Vec::new(),
            },
        };
        let _ = senders.addr.send(resp).await;
    }

    fn addr_responses(&self) -> mpsc::Receiver<AddrResponse> {
        self.addr_rx.take()
    }

    async fn tx_request(&self, tx_hash: String) {
        Reporter::global().inc_tx_scheduled();
        progress!("[fixture] scheduling tx: {}", tx_hash);
        let senders = match self.senders.get() {
            Some(s) => s,
            None => return,
        };
        match self.tx_index.get(&tx_hash) {
            Some(resp) => {
                let _ = senders.tx.send(resp.clone()).await;
            }
            None => warn!("fixture has no transaction {}", tx_hash),
        }
    }

    fn tx_responses(&self) -> mpsc::Receiver<TxResponse> {
        self.tx_rx.take()
    }

    async fn block_request(&self, height: u32) {
        let senders = match self.senders.get() {
            Some(s) => s,
            None => return,
        };
        match self.blocks.get(&height) {
            Some(timestamp) => {
                let _ = senders
                    .block
                    .send(BlockResponse {
                        height,
                        timestamp: *timestamp,
                    })
                    .await;
            }
            None => panic!("fixture has no block at height {}", height),
        }
    }

    fn block_responses(&self) -> mpsc::Receiver<BlockResponse> {
        self.block_rx.take()
    }

    fn finish(&self) {
        self.senders.drop_senders();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn sample_document() -> FixtureDocument {
        FixtureDocument {
            metadata: Metadata { height: 1_438_800 },
            addresses: vec![
                AddressRecord {
                    address: "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn".to_string(),
                    path: "m/.../0/0".to_string(),
                    network: Network::Testnet,
                    change: 0,
                    addr_index: 0,
                    tx_hashes: vec!["aa11".to_string(), "bb22".to_string()],
                },
                AddressRecord {
                    address: "moHN13u4RoMxujdaPxvuaTaawgWZ3LaGyo".to_string(),
                    path: "m/.../1/0".to_string(),
                    network: Network::Testnet,
                    change: 1,
                    addr_index: 0,
                    tx_hashes: vec![],
                },
            ],
            transactions: vec![
                TransactionRecord {
                    hash: "bb22".to_string(),
                    height: 1_400_000,
                    hex: "00".to_string(),
                },
                TransactionRecord {
                    hash: "aa11".to_string(),
                    height: 1_400_100,
                    hex: "01".to_string(),
                },
            ],
            blocks: vec![
                BlockRecord {
                    height: 100,
                    timestamp: DateTime::from_timestamp(1_500_000_000, 0).unwrap(),
                },
                BlockRecord {
                    height: 99,
                    timestamp: DateTime::from_timestamp(1_499_999_000, 0).unwrap(),
                },
            ],
        }
    }

    #[test]
    fn test_rejects_missing_and_bad_files() {
        assert!(FixtureBackend::new("does/not/exist.json").is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not json").unwrap();
        assert!(FixtureBackend::new(file.path()).is_err());
    }

    #[test]
    fn test_pretty_json_is_sorted_and_indented() {
        let doc = sample_document();
        let json = doc.to_pretty_json().unwrap();
        // transactions sorted by hash, blocks by height
        assert!(json.find("\"aa11\"").unwrap() < json.find("\"bb22\"").unwrap());
        assert!(json.contains("    \"metadata\""));
        let round: FixtureDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(round.blocks[0].height, 99);
        assert_eq!(round.metadata.height, 1_438_800);
    }

    #[tokio::test]
    async fn test_known_address_and_tx() {
        let backend = FixtureBackend::from_document(sample_document()).unwrap();
        let mut addr_rx = backend.addr_responses();
        let mut tx_rx = backend.tx_responses();

        let addr = Address::from_record(
            "m/.../0/0",
            "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn",
            Network::Testnet,
            0,
            0,
        )
        .unwrap();
        backend.addr_request(addr).await;
        let resp = addr_rx.recv().await.unwrap();
        assert!(resp.has_transactions());
        assert_eq!(resp.tx_hashes.len(), 2);

        backend.tx_request("aa11".to_string()).await;
        let tx = tx_rx.recv().await.unwrap();
        assert_eq!(tx.height, 1_400_100);
    }

    #[tokio::test]
    async fn test_unknown_address_yields_one_empty_history() {
        let backend = FixtureBackend::from_document(sample_document()).unwrap();
        let mut addr_rx = backend.addr_responses();

        // A perfectly valid address the recording never saw.
        let addr = Address::from_record(
            "m/.../0/61",
            "mfsNoNz57ANkYrCzHaLZDLoMGujBW8u3zv",
            Network::Testnet,
            0,
            61,
        )
        .unwrap();
        backend.addr_request(addr).await;

        let resp = addr_rx.recv().await.unwrap();
        assert!(!resp.has_transactions());
        assert_eq!(
            resp.address.to_string(),
            "mfsNoNz57ANkYrCzHaLZDLoMGujBW8u3zv"
        );

        backend.finish();
        assert!(addr_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_tx_is_dropped() {
        let backend = FixtureBackend::from_document(sample_document()).unwrap();
        let mut tx_rx = backend.tx_responses();
        backend.tx_request("cafe".to_string()).await;
        backend.finish();
        // No response for the unknown hash; the stream just ends.
        assert!(tx_rx.recv().await.is_none());
    }

    #[tokio::test]
    #[should_panic(expected = "no block at height")]
    async fn test_unknown_block_is_fatal() {
        let backend = FixtureBackend::from_document(sample_document()).unwrap();
        backend.block_request(12345).await;
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let backend = FixtureBackend::from_document(sample_document()).unwrap();
        backend.finish();
        backend.finish();
    }
}
