//! beancounter - a command-line Bitcoin wallet balance audit tool.
//!
//! Run modes:
//!   beancounter keytree I...             - child key derivations
//!   beancounter find-address ADDRESS     - locate an address in xpub space
//!   beancounter find-block TIMESTAMP     - block height for a date/time
//!   beancounter compute-balance          - audit a watch wallet
//!
//! Extended public keys (or the single address) are read from stdin, one
//! per line. Piped stdin is refused outside debug mode so keys do not end
//! up in shell history by accident.

use std::io::{BufRead, IsTerminal, Write};
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::secp256k1::Secp256k1;
use chrono::{DateTime, Utc};

use beancounter::accounter::Accounter;
use beancounter::backend::{
    Backend, BtcdBackend, ElectrumBackend, FixtureBackend, RecorderBackend,
};
use beancounter::blockfinder::BlockFinder;
use beancounter::config::{self, Network, MIN_CONFIRMATIONS};
use beancounter::deriver::AddressDeriver;
use beancounter::error::{BeancounterError, Result};
use beancounter::logging::{init_logging, LogLevel};
use beancounter::units;

#[tokio::main]
async fn main() {
    // Logic assertions anywhere in the pipeline must bring the whole
    // process down, including ones raised on worker tasks.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::exit(101);
    }));

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.iter().any(|a| a == "--debug");
    args.retain(|a| a != "--debug");

    init_logging(if debug { LogLevel::Debug } else { LogLevel::Info });

    if args.is_empty() {
        print_usage();
        return;
    }

    let result = match args[0].as_str() {
        "keytree" => do_keytree(&args[1..], debug),
        "find-address" => do_find_address(&args[1..], debug),
        "find-block" => do_find_block(&args[1..]).await,
        "compute-balance" => do_compute_balance(&args[1..], debug).await,
        "help" | "--help" | "-h" => {
            print_usage();
            return;
        }
        other => Err(BeancounterError::usage(format!("unknown command: {}", other))),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("beancounter - Bitcoin wallet balance audit tool");
    println!();
    println!("Usage:");
    println!("  beancounter keytree [--n N] I...              Child key derivations from stdin");
    println!("  beancounter find-address [--m M] [--n N] ADDR Scan xpub space for an address");
    println!("  beancounter find-block [backend flags] TIME   Block height for a date/time");
    println!("  beancounter compute-balance --type T [flags]  Audit a watch wallet");
    println!();
    println!("compute-balance flags:");
    println!("  --type multisig|single-address     Wallet type (required)");
    println!("  --m M --n N                        Multisig quorum (default 1-of-1)");
    println!("  --block-height H                   Audit height; 0 means tip - {} + 1", MIN_CONFIRMATIONS);
    println!("  --backend electrum|btcd|electrum-recorder|btcd-recorder|fixture");
    println!("  --addr HOST:PORT                   Initial server (defaults per network)");
    println!("  --rpcuser USER --rpcpass PASS      Credentials for the btcd backend");
    println!("  --fixture-file PATH                Recording to write or replay");
    println!("  --lookahead N                      Gap limit (default 100)");
    println!();
    println!("Common flags:");
    println!("  --debug                            Verbose logging; also allows piped stdin");
    println!();
    println!("Timestamps accept RFC3339, 'YYYY-MM-DD HH:MM:SS +0000' or");
    println!("'YYYY-MM-DD HH:MM:SS UTC'.");
}

/// Flags shared by every networked command.
#[derive(Debug, Default)]
struct BackendOpts {
    backend: String,
    addr: Option<String>,
    rpcuser: String,
    rpcpass: String,
    fixture_file: Option<String>,
}

fn do_keytree(args: &[String], debug: bool) -> Result<()> {
    let mut n: usize = 1;
    let mut path: Vec<u32> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--n" | "-n" if i + 1 < args.len() => {
                n = parse_flag(&args[i + 1], "--n")?;
                i += 2;
            }
            arg => {
                path.push(parse_flag(arg, "path component")?);
                i += 1;
            }
        }
    }
    if path.is_empty() {
        return Err(BeancounterError::usage("keytree needs at least one path component"));
    }

    require_interactive_stdin(debug)?;
    let mut xpubs = read_xpubs(n)?;
    check_matching_prefixes(&xpubs)?;

    let secp = Secp256k1::verification_only();
    for component in &path {
        let child = ChildNumber::from_normal_idx(*component).map_err(|_| {
            BeancounterError::usage(format!("path component {} is out of range", component))
        })?;
        for xpub in &mut xpubs {
            let key = Xpub::from_str(xpub)
                .map_err(|e| BeancounterError::usage(format!("invalid xpub {}: {}", xpub, e)))?;
            let key = key
                .ckd_pub(&secp, child)
                .map_err(|e| BeancounterError::usage(format!("derivation failed: {}", e)))?;
            *xpub = key.to_string();
        }
    }

    for (i, xpub) in xpubs.iter().enumerate() {
        println!("Child pubkey #{}: {}", i + 1, xpub);
    }
    Ok(())
}

fn do_find_address(args: &[String], debug: bool) -> Result<()> {
    let mut m: usize = 1;
    let mut n: usize = 1;
    let mut target: Option<String> = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--m" | "-m" if i + 1 < args.len() => {
                m = parse_flag(&args[i + 1], "--m")?;
                i += 2;
            }
            "--n" | "-n" if i + 1 < args.len() => {
                n = parse_flag(&args[i + 1], "--n")?;
                i += 2;
            }
            arg => {
                target = Some(arg.to_string());
                i += 1;
            }
        }
    }
    let target = target.ok_or_else(|| BeancounterError::usage("find-address needs an address"))?;
    config::verify_m_and_n(m, n)?;

    require_interactive_stdin(debug)?;
    let xpubs = read_xpubs(n)?;
    check_matching_prefixes(&xpubs)?;
    let network = config::xpub_network(&xpubs[0])?;
    let deriver = AddressDeriver::new(network, &xpubs, m)?;

    println!("Searching for {}", target);
    match deriver.find_by_string(&target) {
        Some((change, index)) => {
            println!("found: m/.../{}/{} {}", change, index, target);
            Ok(())
        }
        None => Err(BeancounterError::usage(format!("{} not found", target))),
    }
}

async fn do_find_block(args: &[String]) -> Result<()> {
    let mut opts = BackendOpts {
        backend: "electrum".to_string(),
        ..Default::default()
    };
    let mut timestamp_parts: Vec<String> = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--backend" if i + 1 < args.len() => {
                opts.backend = args[i + 1].clone();
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                opts.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--rpcuser" if i + 1 < args.len() => {
                opts.rpcuser = args[i + 1].clone();
                i += 2;
            }
            "--rpcpass" if i + 1 < args.len() => {
                opts.rpcpass = args[i + 1].clone();
                i += 2;
            }
            "--fixture-file" if i + 1 < args.len() => {
                opts.fixture_file = Some(args[i + 1].clone());
                i += 2;
            }
            arg => {
                timestamp_parts.push(arg.to_string());
                i += 1;
            }
        }
    }
    if timestamp_parts.is_empty() {
        return Err(BeancounterError::usage("find-block needs a timestamp"));
    }
    let raw = timestamp_parts.join(" ");
    let target = parse_timestamp(&raw)?;

    // Block lookup is mainnet only.
    let backend = build_backend(&opts, Network::Mainnet).await?;
    backend.start(0).await?;

    let mut finder = BlockFinder::new(backend);
    let (height, median, header_time) = finder.search(target).await;
    println!(
        "Closest block to '{}' is block #{} with a median time of '{}'",
        target, height, median
    );
    tracing::debug!("header timestamp: '{}'", header_time);
    Ok(())
}

async fn do_compute_balance(args: &[String], debug: bool) -> Result<()> {
    let mut wallet_type: Option<String> = None;
    let mut m: usize = 1;
    let mut n: usize = 1;
    let mut block_height: u32 = 0;
    let mut lookahead: u32 = 100;
    let mut opts = BackendOpts {
        backend: "electrum".to_string(),
        ..Default::default()
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--type" if i + 1 < args.len() => {
                wallet_type = Some(args[i + 1].clone());
                i += 2;
            }
            "--m" | "-m" if i + 1 < args.len() => {
                m = parse_flag(&args[i + 1], "--m")?;
                i += 2;
            }
            "--n" | "-n" if i + 1 < args.len() => {
                n = parse_flag(&args[i + 1], "--n")?;
                i += 2;
            }
            "--block-height" if i + 1 < args.len() => {
                block_height = parse_flag(&args[i + 1], "--block-height")?;
                i += 2;
            }
            "--lookahead" if i + 1 < args.len() => {
                lookahead = parse_flag(&args[i + 1], "--lookahead")?;
                i += 2;
            }
            "--backend" if i + 1 < args.len() => {
                opts.backend = args[i + 1].clone();
                i += 2;
            }
            "--addr" if i + 1 < args.len() => {
                opts.addr = Some(args[i + 1].clone());
                i += 2;
            }
            "--rpcuser" if i + 1 < args.len() => {
                opts.rpcuser = args[i + 1].clone();
                i += 2;
            }
            "--rpcpass" if i + 1 < args.len() => {
                opts.rpcpass = args[i + 1].clone();
                i += 2;
            }
            "--fixture-file" if i + 1 < args.len() => {
                opts.fixture_file = Some(args[i + 1].clone());
                i += 2;
            }
            other => {
                return Err(BeancounterError::usage(format!("unknown flag: {}", other)));
            }
        }
    }

    let wallet_type = wallet_type
        .ok_or_else(|| BeancounterError::usage("--type multisig|single-address is required"))?;
    config::verify_m_and_n(m, n)?;
    require_interactive_stdin(debug)?;

    let (network, deriver, lookahead) = match wallet_type.as_str() {
        "single-address" => {
            println!("Enter single address:");
            let address = read_line()?;
            let network = config::address_network(&address)?;
            let deriver = AddressDeriver::single_address(network, &address)?;
            // One literal address: there is nothing beyond index 0 to scan.
            (network, deriver, 1)
        }
        "multisig" => {
            let xpubs = read_xpubs(n)?;
            check_matching_prefixes(&xpubs)?;
            let network = config::xpub_network(&xpubs[0])?;
            let deriver = AddressDeriver::new(network, &xpubs, m)?;
            (network, deriver, lookahead)
        }
        other => {
            return Err(BeancounterError::usage(format!(
                "unknown wallet type: {} (use multisig or single-address)",
                other
            )));
        }
    };

    let backend = build_backend(&opts, network).await?;

    let tip = backend.chain_height();
    let max_height = tip - MIN_CONFIRMATIONS + 1;
    let block_height = if block_height == 0 {
        max_height
    } else {
        block_height
    };
    if block_height > max_height {
        return Err(BeancounterError::usage(format!(
            "block height {} is too high (chain tip {} minus {} confirmations)",
            block_height, tip, MIN_CONFIRMATIONS
        )));
    }
    println!("Going to compute balance at {}", block_height);

    backend.start(block_height).await?;
    let accounter = Accounter::new(backend, Arc::new(deriver), lookahead, block_height);
    let balance = accounter.compute_balance().await;

    tracing::debug!("{}", units::format_sats(balance));
    println!("Balance: {}", balance);
    Ok(())
}

/// Build the backend selected by `--backend`.
async fn build_backend(opts: &BackendOpts, network: Network) -> Result<Arc<dyn Backend>> {
    let backend: Arc<dyn Backend> = match opts.backend.as_str() {
        "electrum" => {
            let (host, port) = electrum_server(network, &opts.addr)?;
            Arc::new(ElectrumBackend::new(&host, &port, network).await?)
        }
        "btcd" => {
            let addr = opts.addr.clone().unwrap_or_else(|| "localhost:8334".to_string());
            Arc::new(BtcdBackend::new(&addr, &opts.rpcuser, &opts.rpcpass, network).await?)
        }
        "electrum-recorder" => {
            let fixture = require_fixture_file(opts)?;
            let (host, port) = electrum_server(network, &opts.addr)?;
            let inner: Arc<dyn Backend> =
                Arc::new(ElectrumBackend::new(&host, &port, network).await?);
            Arc::new(RecorderBackend::new(inner, fixture))
        }
        "btcd-recorder" => {
            let fixture = require_fixture_file(opts)?;
            let addr = opts.addr.clone().unwrap_or_else(|| "localhost:8334".to_string());
            let inner: Arc<dyn Backend> =
                Arc::new(BtcdBackend::new(&addr, &opts.rpcuser, &opts.rpcpass, network).await?);
            Arc::new(RecorderBackend::new(inner, fixture))
        }
        "fixture" => {
            let fixture = require_fixture_file(opts)?;
            Arc::new(FixtureBackend::new(fixture)?)
        }
        other => {
            return Err(BeancounterError::usage(format!(
                "unknown backend: {} (use electrum, btcd, electrum-recorder, btcd-recorder or fixture)",
                other
            )));
        }
    };
    Ok(backend)
}

fn require_fixture_file(opts: &BackendOpts) -> Result<String> {
    opts.fixture_file.clone().ok_or_else(|| {
        BeancounterError::usage(format!("the {} backend requires --fixture-file", opts.backend))
    })
}

/// Pick the Electrum server: `--addr HOST:PORTSPEC` or the per-network
/// default. The port spec may be a bare number (TCP) or `t`/`s` prefixed.
fn electrum_server(network: Network, addr: &Option<String>) -> Result<(String, String)> {
    match addr {
        Some(addr) => {
            let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
                BeancounterError::usage(format!("--addr must be HOST:PORT, got {}", addr))
            })?;
            Ok((host.to_string(), port.to_string()))
        }
        None => {
            let (host, port) = network.default_electrum_server();
            Ok((host.to_string(), port.to_string()))
        }
    }
}

fn parse_flag<T: FromStr>(value: &str, flag: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BeancounterError::usage(format!("invalid value for {}: {}", flag, value)))
}

/// Refuse piped stdin so xpubs do not leak into shell history on recall.
fn require_interactive_stdin(debug: bool) -> Result<()> {
    if debug {
        return Ok(());
    }
    if !std::io::stdin().is_terminal() {
        return Err(BeancounterError::usage(
            "piping stdin is forbidden (pass --debug to override)",
        ));
    }
    Ok(())
}

fn read_line() -> Result<String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn read_xpubs(n: usize) -> Result<Vec<String>> {
    let mut xpubs = Vec::with_capacity(n);
    for i in 0..n {
        println!("Enter pubkey #{} out of #{}:", i + 1, n);
        std::io::stdout().flush()?;
        xpubs.push(read_line()?);
    }
    Ok(xpubs)
}

/// All keys of a wallet must come from the same network and key version.
fn check_matching_prefixes(xpubs: &[String]) -> Result<()> {
    for xpub in xpubs.iter().skip(1) {
        if xpub.len() < 4 || xpubs[0].len() < 4 || xpubs[0][..4] != xpub[..4] {
            return Err(BeancounterError::usage(format!(
                "prefixes must match: {} {}",
                xpubs[0], xpub
            )));
        }
    }
    Ok(())
}

/// Accepts RFC3339, `%Y-%m-%d %H:%M:%S %z`, and `%Y-%m-%d %H:%M:%S` with
/// an optional trailing `UTC`/`GMT`.
fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S %z") {
        return Ok(t.with_timezone(&Utc));
    }
    let trimmed = s
        .trim_end_matches(" UTC")
        .trim_end_matches(" GMT")
        .trim_end();
    if let Ok(t) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        return Ok(t.and_utc());
    }
    Err(BeancounterError::usage(format!(
        "cannot parse timestamp: {}",
        s
    )))
}
