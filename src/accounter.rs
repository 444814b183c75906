//! The accounter tallies the balance a wallet controlled at a target block
//! height.
//!
//! Two cooperating loops drive the scan. A producer walks both address
//! streams (receive and change) up to their frontiers, deriving addresses
//! and scheduling history lookups. A consumer multiplexes the backend's
//! responses: address histories schedule transaction fetches, and each
//! confirmed transaction response pushes the owning stream's frontier out
//! to `index + lookahead + 1`.
//!
//! The frontier moves on *transaction* responses, not address responses.
//! An address history carries only hashes; whether those transactions sit
//! at or below the target height is only known once the transaction
//! response arrives, and transactions above the target must not widen the
//! scan. When an address lists a hash whose transaction is already in the
//! ledger, the height is known and the stream extends immediately.
//!
//! Everything is tallied only after fetching completes, so response
//! ordering never matters. We do not track fees.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, sleep};
use tracing::error;

use crate::backend::{AddrResponse, Backend, TxResponse};
use crate::deriver::{Address, AddressDeriver};
use crate::progress;
use crate::reporter::Reporter;

/// How long the producer naps when it has caught up with the frontiers.
const DERIVE_IDLE: Duration = Duration::from_millis(100);

/// How often the consumer re-evaluates the completion predicate.
const COMPLETION_TICK: Duration = Duration::from_secs(1);

/// Scan bookkeeping. All five fields are read together by the completion
/// predicate, so they live under one lock.
#[derive(Debug)]
struct ScanState {
    frontiers: [u32; 2],
    derived: u32,
    processed_addr: u32,
    seen_tx: u32,
    processed_tx: u32,
}

impl ScanState {
    fn complete(&self) -> bool {
        let scheduled = self.frontiers[0] + self.frontiers[1];
        self.derived == scheduled
            && self.processed_addr == scheduled
            && self.seen_tx == self.processed_tx
    }
}

struct LedgerTx {
    height: i64,
    hex: String,
    inputs: Vec<TxInputRef>,
    outputs: Vec<LedgerOutput>,
}

struct TxInputRef {
    prev_hash: String,
    index: u32,
}

struct LedgerOutput {
    // signed so the arithmetic below cannot underflow silently
    value: i64,
    ours: bool,
    spent_by: Option<String>,
}

/// Computes the balance of a wallet at a given block height.
pub struct Accounter {
    backend: Arc<dyn Backend>,
    deriver: Arc<AddressDeriver>,
    lookahead: u32,
    block_height: u32,

    state: Arc<Mutex<ScanState>>,
    // output script hex -> the address it pays
    addresses: HashMap<String, Address>,
    // tx hash -> addresses whose streams the tx may extend
    tx_addresses: HashMap<String, Vec<Address>>,
    // tx hash -> ledger entry
    transactions: HashMap<String, LedgerTx>,
}

impl Accounter {
    pub fn new(
        backend: Arc<dyn Backend>,
        deriver: Arc<AddressDeriver>,
        lookahead: u32,
        block_height: u32,
    ) -> Self {
        Accounter {
            backend,
            deriver,
            lookahead,
            block_height,
            state: Arc::new(Mutex::new(ScanState {
                frontiers: [lookahead, lookahead],
                derived: 0,
                processed_addr: 0,
                seen_tx: 0,
                processed_tx: 0,
            })),
            addresses: HashMap::new(),
            tx_addresses: HashMap::new(),
            transactions: HashMap::new(),
        }
    }

    /// Run the full audit: fetch everything, then tally.
    pub async fn compute_balance(mut self) -> u64 {
        self.fetch_transactions().await;
        self.process_transactions();
        self.balance()
    }

    /// Final frontier of each stream, (receive, change).
    pub fn frontiers(&self) -> (u32, u32) {
        let state = self.state.lock().expect("scan state lock");
        (state.frontiers[0], state.frontiers[1])
    }

    async fn fetch_transactions(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let producer = tokio::spawn(send_work(
            Arc::clone(&self.backend),
            Arc::clone(&self.deriver),
            Arc::clone(&self.state),
            stop_rx,
        ));

        self.recv_work().await;

        let _ = stop_tx.send(true);
        progress!("done fetching addresses; waiting to finish...");
        self.backend.finish();
        let _ = producer.await;
        progress!("done fetching transactions");
    }

    async fn recv_work(&mut self) {
        let mut addr_rx = self.backend.addr_responses();
        let mut tx_rx = self.backend.tx_responses();
        let mut tick = interval(COMPLETION_TICK);
        loop {
            tokio::select! {
                Some(resp) = addr_rx.recv() => self.on_addr_response(resp).await,
                Some(resp) = tx_rx.recv() => self.on_tx_response(resp),
                _ = tick.tick() => {
                    if self.state.lock().expect("scan state lock").complete() {
                        return;
                    }
                }
            }
        }
    }

    async fn on_addr_response(&mut self, resp: AddrResponse) {
        Reporter::global().inc_addresses_fetched();
        self.state.lock().expect("scan state lock").processed_addr += 1;

        progress!(
            "address {} has {} transactions",
            resp.address,
            resp.tx_hashes.len()
        );
        self.addresses
            .insert(resp.address.script_hex().to_string(), resp.address.clone());

        for hash in &resp.tx_hashes {
            if let Some(tx) = self.transactions.get(hash) {
                // Already fetched; its height is final.
                let height = tx.height;
                self.maybe_extend(&resp.address, height);
            } else {
                self.tx_addresses
                    .entry(hash.clone())
                    .or_default()
                    .push(resp.address.clone());
                self.state.lock().expect("scan state lock").seen_tx += 1;
                self.backend.tx_request(hash.clone()).await;
            }
        }
    }

    fn on_tx_response(&mut self, resp: TxResponse) {
        Reporter::global().inc_tx_fetched();
        self.state.lock().expect("scan state lock").processed_tx += 1;

        let height = resp.height;
        self.transactions.insert(
            resp.hash.clone(),
            LedgerTx {
                height,
                hex: resp.hex,
                inputs: Vec::new(),
                outputs: Vec::new(),
            },
        );

        if let Some(addrs) = self.tx_addresses.get(&resp.hash) {
            for addr in addrs.clone() {
                self.maybe_extend(&addr, height);
            }
        }
    }

    /// Extend a stream's frontier for a transaction confirmed at or below
    /// the target height.
    fn maybe_extend(&self, addr: &Address, height: i64) {
        if height <= 0 || height > self.block_height as i64 {
            return;
        }
        let change = addr.change() as usize;
        let next = addr.index() + self.lookahead + 1;
        let mut state = self.state.lock().expect("scan state lock");
        if next > state.frontiers[change] {
            state.frontiers[change] = next;
        }
    }

    /// Drop transactions outside the audit window and parse the rest.
    fn process_transactions(&mut self) {
        let target = self.block_height as i64;
        self.transactions.retain(|hash, tx| {
            if tx.height < 0 {
                panic!("transaction {} has forbidden height {}", hash, tx.height);
            }
            if tx.height > target {
                progress!(
                    "transaction {} has height {} > target height {}",
                    hash,
                    tx.height,
                    target
                );
                return false;
            }
            if tx.height == 0 {
                progress!("transaction {} has not been mined yet", hash);
                return false;
            }
            true
        });
        Reporter::global().set_tx_after_filter(self.transactions.len() as i32);
        progress!("done filtering");

        for (hash, tx) in &mut self.transactions {
            let bytes = match hex::decode(&tx.hex) {
                Ok(bytes) => bytes,
                Err(_) => {
                    error!("failed to unhex transaction {}", hash);
                    continue;
                }
            };
            let parsed: bitcoin::Transaction =
                match bitcoin::consensus::encode::deserialize(&bytes) {
                    Ok(parsed) => parsed,
                    Err(_) => {
                        error!("failed to parse transaction {}", hash);
                        continue;
                    }
                };

            for txin in &parsed.input {
                tx.inputs.push(TxInputRef {
                    prev_hash: txin.previous_output.txid.to_string(),
                    index: txin.previous_output.vout,
                });
            }
            for txout in &parsed.output {
                let script_hex = hex::encode(txout.script_pubkey.as_bytes());
                let ours = self.addresses.contains_key(&script_hex);
                tx.outputs.push(LedgerOutput {
                    value: txout.value.to_sat() as i64,
                    ours,
                    spent_by: None,
                });
            }
        }
    }

    /// Credits minus debits over the owned outputs. Links each spent owned
    /// output to the transaction consuming it; a second consumer of the
    /// same output means the chain data is corrupt.
    fn balance(&mut self) -> u64 {
        let mut balance: i64 = 0;

        for tx in self.transactions.values() {
            for out in &tx.outputs {
                if out.ours {
                    balance += out.value;
                }
            }
        }

        let spends: Vec<(String, String, u32)> = self
            .transactions
            .iter()
            .flat_map(|(hash, tx)| {
                tx.inputs
                    .iter()
                    .map(move |input| (hash.clone(), input.prev_hash.clone(), input.index))
            })
            .collect();

        for (spender, prev_hash, index) in spends {
            let Some(prev) = self.transactions.get_mut(&prev_hash) else {
                continue;
            };
            let idx = index as usize;
            if idx >= prev.outputs.len() {
                panic!(
                    "input of {} references output {} of {}, which has only {} outputs",
                    spender,
                    index,
                    prev_hash,
                    prev.outputs.len()
                );
            }
            let out = &mut prev.outputs[idx];
            if out.ours {
                balance -= out.value;
                if let Some(existing) = &out.spent_by {
                    panic!(
                        "{} and {} both spend output {} of {}",
                        spender, existing, index, prev_hash
                    );
                }
                out.spent_by = Some(spender.clone());
            }
        }

        if balance < 0 {
            panic!("balance is negative");
        }
        balance as u64
    }
}

/// Producer loop: derive both streams up to their frontiers and schedule
/// history lookups; nap briefly when caught up, since a transaction
/// response may push a frontier further out.
async fn send_work(
    backend: Arc<dyn Backend>,
    deriver: Arc<AddressDeriver>,
    state: Arc<Mutex<ScanState>>,
    mut stop: watch::Receiver<bool>,
) {
    let mut indexes = [0u32, 0u32];
    loop {
        for change in 0..2usize {
            let frontier = state.lock().expect("scan state lock").frontiers[change];
            while indexes[change] < frontier {
                let addr = deriver.derive(change as u32, indexes[change]);
                state.lock().expect("scan state lock").derived += 1;
                backend.addr_request(addr).await;
                indexes[change] += 1;
            }
        }
        tokio::select! {
            _ = stop.changed() => return,
            _ = sleep(DERIVE_IDLE) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fixture::{
        AddressRecord, FixtureDocument, Metadata, TransactionRecord,
    };
    use crate::backend::{FixtureBackend, RecorderBackend};
    use crate::config::Network;
    use std::str::FromStr;

    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{
        Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    };

    const TPUB: &str = "tpubDBrCAXucLxvjC9n9nZGGcYS8pk4X1N97YJmUgdDSwG2p36gbSqeRuytHYCHe2dHxLsV2EchX9ePaFdRwp7cNLrSpnr3PsoPLUQqbvLBDWvh";

    // An output script no derived address ever matches.
    const FOREIGN_SCRIPT: &str = "76a914000000000000000000000000000000000000dead88ac";

    fn test_deriver() -> Arc<AddressDeriver> {
        Arc::new(AddressDeriver::new(Network::Testnet, &[TPUB.to_string()], 1).unwrap())
    }

    fn input_spending(txid: &str, vout: u32) -> TxIn {
        TxIn {
            previous_output: OutPoint {
                txid: Txid::from_str(txid).unwrap(),
                vout,
            },
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }
    }

    /// An input spending an outpoint that is not part of the ledger.
    fn external_input(tag: u8) -> TxIn {
        input_spending(&hex::encode([tag; 32]), 0)
    }

    fn build_tx(inputs: Vec<TxIn>, outputs: Vec<(String, u64)>) -> (String, String) {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: inputs,
            output: outputs
                .into_iter()
                .map(|(script_hex, value)| TxOut {
                    value: Amount::from_sat(value),
                    script_pubkey: ScriptBuf::from_hex(&script_hex).unwrap(),
                })
                .collect(),
        };
        let hash = tx.compute_txid().to_string();
        let hex = hex::encode(bitcoin::consensus::encode::serialize(&tx));
        (hash, hex)
    }

    fn address_record(addr: &Address, tx_hashes: Vec<String>) -> AddressRecord {
        AddressRecord {
            address: addr.to_string(),
            path: addr.path().to_string(),
            network: addr.network(),
            change: addr.change(),
            addr_index: addr.index(),
            tx_hashes,
        }
    }

    fn run_accounter(
        doc: FixtureDocument,
        deriver: Arc<AddressDeriver>,
        lookahead: u32,
        height: u32,
    ) -> (u64, (u32, u32)) {
        let backend: Arc<dyn Backend> =
            Arc::new(FixtureBackend::from_document(doc).unwrap());
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let accounter = Accounter::new(backend, deriver, lookahead, height);
            let state = Arc::clone(&accounter.state);
            let balance = accounter.compute_balance().await;
            let frontiers = {
                let s = state.lock().unwrap();
                (s.frontiers[0], s.frontiers[1])
            };
            (balance, frontiers)
        })
    }

    #[test]
    fn test_empty_wallet() {
        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            ..Default::default()
        };
        let (balance, frontiers) = run_accounter(doc, test_deriver(), 10, 1000);
        assert_eq!(balance, 0);
        assert_eq!(frontiers, (10, 10));
    }

    #[test]
    fn test_credits_and_debits() {
        let deriver = test_deriver();
        let receive = deriver.derive(0, 0);
        let change = deriver.derive(1, 0);

        // Fund the receive address, then spend that output: part leaves the
        // wallet, part comes back as change.
        let (fund_hash, fund_hex) = build_tx(
            vec![external_input(0x11)],
            vec![
                (receive.script_hex().to_string(), 1_000_000),
                (FOREIGN_SCRIPT.to_string(), 123_456),
            ],
        );
        let (spend_hash, spend_hex) = build_tx(
            vec![input_spending(&fund_hash, 0)],
            vec![
                (FOREIGN_SCRIPT.to_string(), 400_000),
                (change.script_hex().to_string(), 550_000),
            ],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![
                address_record(&receive, vec![fund_hash.clone(), spend_hash.clone()]),
                address_record(&change, vec![spend_hash.clone()]),
            ],
            transactions: vec![
                TransactionRecord {
                    hash: fund_hash,
                    height: 900,
                    hex: fund_hex,
                },
                TransactionRecord {
                    hash: spend_hash,
                    height: 950,
                    hex: spend_hex,
                },
            ],
            blocks: vec![],
        };

        let (balance, frontiers) = run_accounter(doc, deriver, 10, 1000);
        assert_eq!(balance, 550_000);
        // Both streams saw a confirmed transaction at index 0.
        assert_eq!(frontiers, (11, 11));
    }

    #[test]
    fn test_transactions_above_target_are_excluded() {
        let deriver = test_deriver();
        let receive = deriver.derive(0, 0);

        let (old_hash, old_hex) = build_tx(
            vec![external_input(0x22)],
            vec![(receive.script_hex().to_string(), 70_000)],
        );
        let (recent_hash, recent_hex) = build_tx(
            vec![external_input(0x33)],
            vec![(receive.script_hex().to_string(), 50_000)],
        );
        let (mempool_hash, mempool_hex) = build_tx(
            vec![external_input(0x44)],
            vec![(receive.script_hex().to_string(), 10_000)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(
                &receive,
                vec![old_hash.clone(), recent_hash.clone(), mempool_hash.clone()],
            )],
            transactions: vec![
                TransactionRecord {
                    hash: old_hash,
                    height: 900,
                    hex: old_hex,
                },
                TransactionRecord {
                    hash: recent_hash,
                    height: 1500, // above the target height
                    hex: recent_hex,
                },
                TransactionRecord {
                    hash: mempool_hash,
                    height: 0, // unmined
                    hex: mempool_hex,
                },
            ],
            blocks: vec![],
        };

        let (balance, _) = run_accounter(doc, deriver, 10, 1000);
        assert_eq!(balance, 70_000);
    }

    #[test]
    fn test_gap_extension() {
        let deriver = test_deriver();
        let deep = deriver.derive(0, 28);

        let (fund_hash, fund_hex) = build_tx(
            vec![external_input(0x55)],
            vec![(deep.script_hex().to_string(), 42_000)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(&deep, vec![fund_hash.clone()])],
            transactions: vec![TransactionRecord {
                hash: fund_hash,
                height: 900,
                hex: fund_hex,
            }],
            blocks: vec![],
        };

        let (balance, frontiers) = run_accounter(doc, deriver, 10, 1000);
        assert_eq!(balance, 42_000);
        // A hit at index 28 with lookahead 10 scans through index 38; the
        // untouched change stream stays at its initial frontier.
        assert_eq!(frontiers, (39, 10));
    }

    #[test]
    #[should_panic(expected = "both spend")]
    fn test_double_spend_aborts() {
        let deriver = test_deriver();
        let receive = deriver.derive(0, 0);

        let (fund_hash, fund_hex) = build_tx(
            vec![external_input(0x66)],
            vec![(receive.script_hex().to_string(), 10_000)],
        );
        let (spend1_hash, spend1_hex) = build_tx(
            vec![input_spending(&fund_hash, 0)],
            vec![(FOREIGN_SCRIPT.to_string(), 9_000)],
        );
        let (spend2_hash, spend2_hex) = build_tx(
            vec![input_spending(&fund_hash, 0)],
            vec![(FOREIGN_SCRIPT.to_string(), 8_000)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(
                &receive,
                vec![fund_hash.clone(), spend1_hash.clone(), spend2_hash.clone()],
            )],
            transactions: vec![
                TransactionRecord {
                    hash: fund_hash,
                    height: 900,
                    hex: fund_hex,
                },
                TransactionRecord {
                    hash: spend1_hash,
                    height: 910,
                    hex: spend1_hex,
                },
                TransactionRecord {
                    hash: spend2_hash,
                    height: 920,
                    hex: spend2_hex,
                },
            ],
            blocks: vec![],
        };

        run_accounter(doc, deriver, 10, 1000);
    }

    #[test]
    #[should_panic(expected = "forbidden height")]
    fn test_negative_height_aborts() {
        let deriver = test_deriver();
        let receive = deriver.derive(0, 0);

        let (hash, hex) = build_tx(
            vec![external_input(0x77)],
            vec![(receive.script_hex().to_string(), 1_000)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(&receive, vec![hash.clone()])],
            transactions: vec![TransactionRecord {
                hash,
                height: -3,
                hex,
            }],
            blocks: vec![],
        };

        run_accounter(doc, deriver, 10, 1000);
    }

    #[test]
    fn test_single_address_mode() {
        let deriver = Arc::new(
            AddressDeriver::single_address(
                Network::Testnet,
                "mzoeuyGqMudyvKbkNx5dtNBNN59oKEAsPn",
            )
            .unwrap(),
        );
        let addr = deriver.derive(0, 0);

        let (hash, hex) = build_tx(
            vec![external_input(0x88)],
            vec![(addr.script_hex().to_string(), 111_168_038)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(&addr, vec![hash.clone()])],
            transactions: vec![TransactionRecord {
                hash,
                height: 900,
                hex,
            }],
            blocks: vec![],
        };

        let (balance, _) = run_accounter(doc, deriver, 1, 1000);
        assert_eq!(balance, 111_168_038);
    }

    #[tokio::test]
    async fn test_record_then_replay_matches() {
        let deriver = test_deriver();
        let receive = deriver.derive(0, 3);

        let (fund_hash, fund_hex) = build_tx(
            vec![external_input(0x99)],
            vec![(receive.script_hex().to_string(), 77_000)],
        );

        let doc = FixtureDocument {
            metadata: Metadata { height: 2000 },
            addresses: vec![address_record(&receive, vec![fund_hash.clone()])],
            transactions: vec![TransactionRecord {
                hash: fund_hash,
                height: 900,
                hex: fund_hex,
            }],
            blocks: vec![],
        };

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.json");

        // Record a run...
        let live: Arc<dyn Backend> =
            Arc::new(FixtureBackend::from_document(doc).unwrap());
        let recorder: Arc<dyn Backend> = Arc::new(RecorderBackend::new(live, &path));
        let accounter = Accounter::new(recorder, Arc::clone(&deriver), 10, 1000);
        let state = Arc::clone(&accounter.state);
        let recorded_balance = accounter.compute_balance().await;
        let recorded_frontiers = {
            let s = state.lock().unwrap();
            (s.frontiers[0], s.frontiers[1])
        };

        // ...and replay it.
        let replay: Arc<dyn Backend> = Arc::new(FixtureBackend::new(&path).unwrap());
        let accounter = Accounter::new(replay, deriver, 10, 1000);
        let state = Arc::clone(&accounter.state);
        let replayed_balance = accounter.compute_balance().await;
        let replayed_frontiers = {
            let s = state.lock().unwrap();
            (s.frontiers[0], s.frontiers[1])
        };

        assert_eq!(recorded_balance, 77_000);
        assert_eq!(recorded_balance, replayed_balance);
        assert_eq!(recorded_frontiers, replayed_frontiers);
    }
}
