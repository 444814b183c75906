//! Backends: interchangeable sources of address history, raw transactions
//! and block headers.
//!
//! Backends stay deliberately thin; all accounting logic lives in the
//! accounter. What a backend must do for each transaction is produce the
//! confirmation height and the raw bytes, and it may fetch the chain tip
//! once at startup and cache it.
//!
//! There are real differences between the variants. An Electrum peer
//! returns heights with the address history but needs a second request for
//! raw bytes; a trusted node returns raw transactions directly but needs
//! header lookups for heights. `finish` exists so callers can tear down
//! whichever background work a variant runs.
//!
//! Implementations:
//! - `ElectrumBackend` - pool of public Electrum peers, discovery + retries
//! - `BtcdBackend` - one trusted local node, worker pool, no retries
//! - `FixtureBackend` - replays a recorded JSON transcript
//! - `RecorderBackend` - decorates another backend and records a transcript

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::deriver::Address;

pub mod btcd;
pub mod electrum;
pub mod fixture;
pub mod recorder;

pub use btcd::BtcdBackend;
pub use electrum::ElectrumBackend;
pub use fixture::FixtureBackend;
pub use recorder::RecorderBackend;

/// Buffer size for address request/response channels.
pub const ADDR_CHANNEL_SIZE: usize = 2 * 100;

/// Buffer size for transaction request/response channels.
pub const TX_CHANNEL_SIZE: usize = 2 * MAX_TXS_PER_ADDR;

/// Addresses with more transactions than this are unsupported.
pub const MAX_TXS_PER_ADDR: usize = 1000;

/// How many times a failed request is handed to another peer before the
/// run is aborted.
pub const MAX_ATTEMPTS: u32 = 5;

/// Backend startup and readiness errors
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to connect to {0}: {1}")]
    Connect(String, String),

    #[error("incorrect genesis block: expected {expected}, peer has {actual}")]
    IncorrectGenesisBlock { expected: String, actual: String },

    #[error("incompatible protocol version: {0}")]
    IncompatibleVersion(String),

    #[error("failed to negotiate protocol version")]
    FailedNegotiateVersion,

    #[error("peer tip {tip} is below target height {target}")]
    StaleTip { tip: u32, target: u32 },

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("fixture error: {0}")]
    Fixture(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Transaction hashes observed for one address.
#[derive(Debug, Clone)]
pub struct AddrResponse {
    pub address: Address,
    pub tx_hashes: Vec<String>,
}

impl AddrResponse {
    /// True if any transaction touches the address.
    pub fn has_transactions(&self) -> bool {
        !self.tx_hashes.is_empty()
    }
}

/// A raw transaction with the height it confirmed at.
///
/// `height > 0` is a confirmed transaction, `0` sits in the mempool and
/// negative heights are forbidden.
#[derive(Debug, Clone)]
pub struct TxResponse {
    pub hash: String,
    pub height: i64,
    pub hex: String,
}

/// A block header's height and wall-clock timestamp.
#[derive(Debug, Clone)]
pub struct BlockResponse {
    pub height: u32,
    pub timestamp: DateTime<Utc>,
}

/// A source of address history, raw transactions and block headers.
///
/// Request methods enqueue work; the corresponding `*_responses` receiver
/// yields exactly one response per successful request, in no particular
/// order. Each receiver can be claimed once, by the single consumer that
/// will drain it. After `finish` the response channels eventually close and
/// reads never block forever.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Top of the chain, fetched once at startup.
    fn chain_height(&self) -> u32;

    /// Readiness check; must succeed before any request is enqueued.
    async fn start(&self, target_height: u32) -> Result<(), BackendError>;

    /// Schedule an address-history lookup.
    async fn addr_request(&self, addr: Address);

    /// Claim the address response stream. Panics if claimed twice.
    fn addr_responses(&self) -> mpsc::Receiver<AddrResponse>;

    /// Schedule a raw-transaction lookup.
    async fn tx_request(&self, tx_hash: String);

    /// Claim the transaction response stream. Panics if claimed twice.
    fn tx_responses(&self) -> mpsc::Receiver<TxResponse>;

    /// Schedule a block-header lookup.
    async fn block_request(&self, height: u32);

    /// Claim the block response stream. Panics if claimed twice.
    fn block_responses(&self) -> mpsc::Receiver<BlockResponse>;

    /// Stop all background work. Idempotent.
    fn finish(&self);
}

/// Holder for a response receiver that is handed out exactly once.
pub(crate) struct TakeOnce<T>(Mutex<Option<T>>);

impl<T> TakeOnce<T> {
    pub fn new(value: T) -> Self {
        TakeOnce(Mutex::new(Some(value)))
    }

    pub fn take(&self) -> T {
        self.0
            .lock()
            .expect("take-once lock poisoned")
            .take()
            .expect("response channel already claimed")
    }
}

/// Response senders shared by a backend's workers. Dropped on `finish` so
/// receivers observe end-of-stream once in-flight work drains.
#[derive(Clone)]
pub(crate) struct ResponseSenders {
    pub addr: mpsc::Sender<AddrResponse>,
    pub tx: mpsc::Sender<TxResponse>,
    pub block: mpsc::Sender<BlockResponse>,
}

pub(crate) struct SenderSlot(Mutex<Option<ResponseSenders>>);

impl SenderSlot {
    pub fn new(senders: ResponseSenders) -> Self {
        SenderSlot(Mutex::new(Some(senders)))
    }

    /// Clone the senders for a new worker, unless the backend has finished.
    pub fn get(&self) -> Option<ResponseSenders> {
        self.0.lock().expect("sender lock poisoned").clone()
    }

    pub fn drop_senders(&self) {
        self.0.lock().expect("sender lock poisoned").take();
    }
}
