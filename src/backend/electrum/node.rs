//! A single Electrum peer and the protocol methods we speak to it.
//!
//! Protocol docs: <https://electrumx.readthedocs.io/en/latest/protocol-methods.html>
//!
//! Requests carry monotonically increasing ids and are strictly serial per
//! connection. After every request we sleep briefly to be polite to the
//! community servers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::time::sleep;

use super::transport::{RequestMessage, Transport, TransportError};
use crate::backend::BackendError;
use crate::config::Network;

/// Client name and protocol version announced during negotiation.
const CLIENT_NAME: &str = "beancounter";
const PROTOCOL_VERSION: &str = "1.2";

/// Post-request throttle.
const THROTTLE: Duration = Duration::from_millis(200);

/// Server feature dictionary (`server.features`).
#[derive(Debug, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub genesis_hash: String,
    #[serde(rename = "protocol_max", default)]
    pub protocol_max: String,
}

/// One `(tx_hash, height)` entry from `blockchain.address.get_history`.
#[derive(Debug, Clone, Deserialize)]
pub struct HistoryItem {
    pub tx_hash: String,
    pub height: i64,
}

/// Chain tip notification from `blockchain.headers.subscribe`.
#[derive(Debug, Deserialize)]
pub struct HeadersEvent {
    #[serde(alias = "block_height")]
    pub height: u32,
}

/// Result of `blockchain.block.headers`.
#[derive(Debug, Deserialize)]
pub struct BlockHeaders {
    pub count: u32,
    pub hex: String,
    #[serde(default)]
    pub max: u32,
}

/// A peer advertised by `server.peers.subscribe`.
#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: String,
    pub host: String,
    pub version: String,
    pub features: Vec<String>,
}

/// Key for the pool and blacklist maps: `host|portspec`.
pub fn node_ident(host: &str, port: &str) -> String {
    format!("{}|{}", host, port)
}

/// Checks that a version string such as "1.2" or "v1.3" is >= 1.2.
pub fn check_version(ver: &str) -> Result<(), BackendError> {
    let trimmed = ver.strip_prefix('v').unwrap_or(ver);
    let parsed: f32 = trimmed
        .parse()
        .map_err(|_| BackendError::IncompatibleVersion(ver.to_string()))?;
    if parsed < 1.2 {
        return Err(BackendError::IncompatibleVersion(ver.to_string()));
    }
    Ok(())
}

/// One connected Electrum peer.
pub struct Node {
    pub ident: String,
    transport: Transport,
    next_id: u64,
}

impl Node {
    /// Connect to `host` using a port spec: `t`/`s` picks the network's
    /// default TCP/TLS port, `t50001`/`s50002` an explicit one, and a bare
    /// number means plain TCP.
    pub async fn connect(host: &str, port: &str, network: Network) -> Result<Self, BackendError> {
        let (default_tcp, default_ssl) = network.default_ports();
        let bracketed = if host.contains(':') {
            format!("[{}]", host)
        } else {
            host.to_string()
        };

        let connect_err = |e: TransportError| {
            BackendError::Connect(node_ident(host, port), e.to_string())
        };

        let transport = match port.chars().next() {
            Some('t') => {
                let rest = &port[1..];
                let p = if rest.is_empty() { default_tcp } else { rest };
                Transport::connect_tcp(&format!("{}:{}", bracketed, p))
                    .await
                    .map_err(connect_err)?
            }
            Some('s') => {
                let rest = &port[1..];
                let p = if rest.is_empty() { default_ssl } else { rest };
                Transport::connect_tls(host, &format!("{}:{}", bracketed, p))
                    .await
                    .map_err(connect_err)?
            }
            Some(_) if port.chars().all(|c| c.is_ascii_digit()) => {
                Transport::connect_tcp(&format!("{}:{}", bracketed, port))
                    .await
                    .map_err(connect_err)?
            }
            _ => {
                return Err(BackendError::Connect(
                    node_ident(host, port),
                    format!("unsupported port spec {:?}", port),
                ))
            }
        };

        Ok(Node {
            ident: node_ident(host, port),
            transport,
            next_id: 0,
        })
    }

    async fn request<T: DeserializeOwned>(
        &mut self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, TransportError> {
        self.next_id += 1;
        let msg = RequestMessage {
            id: self.next_id,
            method: method.to_string(),
            params,
        };
        let resp = self.transport.send_message(&msg).await?;
        let result = serde_json::from_value(resp.result)
            .map_err(|e| TransportError::Malformed(format!("{}: {}", method, e)))?;
        sleep(THROTTLE).await;
        Ok(result)
    }

    /// `server.features`
    pub async fn server_features(&mut self) -> Result<Features, TransportError> {
        self.request("server.features", vec![]).await
    }

    /// `server.version` - negotiate the protocol version. Some methods we
    /// rely on did not exist before 1.2.
    pub async fn server_version(&mut self) -> Result<(), TransportError> {
        let _ignored: serde_json::Value = self
            .request(
                "server.version",
                vec![CLIENT_NAME.into(), PROTOCOL_VERSION.into()],
            )
            .await?;
        Ok(())
    }

    /// `blockchain.address.get_history`
    pub async fn address_get_history(
        &mut self,
        address: &str,
    ) -> Result<Vec<HistoryItem>, TransportError> {
        self.request("blockchain.address.get_history", vec![address.into()])
            .await
    }

    /// `blockchain.transaction.get` - raw transaction hex.
    pub async fn transaction_get(&mut self, tx_hash: &str) -> Result<String, TransportError> {
        self.request(
            "blockchain.transaction.get",
            vec![tx_hash.into(), false.into()],
        )
        .await
    }

    /// `blockchain.headers.subscribe` - used once per connection to learn
    /// the chain tip. The protocol has no unsubscribe, which is why callers
    /// reconnect afterwards.
    pub async fn headers_subscribe(&mut self) -> Result<HeadersEvent, TransportError> {
        self.request("blockchain.headers.subscribe", vec![]).await
    }

    /// `blockchain.block.headers` - fetch one header and decode its
    /// wall-clock timestamp.
    pub async fn block_header_timestamp(
        &mut self,
        height: u32,
    ) -> Result<DateTime<Utc>, TransportError> {
        let headers: BlockHeaders = self
            .request("blockchain.block.headers", vec![height.into(), 1u32.into()])
            .await?;
        if headers.count != 1 {
            return Err(TransportError::Malformed(format!(
                "asked for 1 header at {}, got {}",
                height, headers.count
            )));
        }
        let bytes = hex::decode(&headers.hex)
            .map_err(|e| TransportError::Malformed(format!("header hex: {}", e)))?;
        let header: bitcoin::block::Header = bitcoin::consensus::encode::deserialize(&bytes)
            .map_err(|e| TransportError::Malformed(format!("header decode: {}", e)))?;
        DateTime::from_timestamp(header.time as i64, 0)
            .ok_or_else(|| TransportError::Malformed(format!("header time {}", header.time)))
    }

    /// `server.peers.subscribe` - peers known to this server. The wire shape
    /// is `[ip, host, [version, feature, ...]]` per peer.
    pub async fn peers_subscribe(&mut self) -> Result<Vec<Peer>, TransportError> {
        let raw: Vec<serde_json::Value> = self.request("server.peers.subscribe", vec![]).await?;

        let mut peers = Vec::with_capacity(raw.len());
        for entry in raw {
            let row = entry
                .as_array()
                .ok_or_else(|| TransportError::Malformed("peer entry not an array".into()))?;
            if row.len() < 3 {
                return Err(TransportError::Malformed("short peer entry".into()));
            }
            let strings = |v: &serde_json::Value| v.as_str().unwrap_or_default().to_string();
            let mut features: Vec<String> = row[2]
                .as_array()
                .map(|f| f.iter().map(strings).collect())
                .unwrap_or_default();
            if features.is_empty() {
                continue;
            }
            peers.push(Peer {
                ip: strings(&row[0]),
                host: strings(&row[1]),
                version: features.remove(0),
                features,
            });
        }
        Ok(peers)
    }
}
