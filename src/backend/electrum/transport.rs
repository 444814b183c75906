//! Line-delimited JSON-RPC transport for the Electrum protocol.
//!
//! Each message is one UTF-8 JSON object terminated by `\n`. Requests and
//! responses are strictly paired on a single connection; a response whose
//! `id` does not match the request forces the connection down. Deadlines:
//! 2 s to connect, 10 s per read and per write.
//!
//! TLS connections accept any certificate. Electrum peers are public
//! community servers with self-signed certs; the genesis-hash check is the
//! identity check that matters.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
pub const READ_TIMEOUT: Duration = Duration::from_secs(10);
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Transport-level errors. Any of these shuts the connection down.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect timed out")]
    ConnectTimeout,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("connection closed by peer")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("response id mismatch: sent {sent}, got {got}")]
    IdMismatch { sent: u64, got: u64 },

    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },
}

#[derive(Debug, Serialize)]
pub struct RequestMessage {
    pub id: u64,
    pub method: String,
    pub params: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseMessage {
    pub id: u64,
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub result: serde_json::Value,
    #[serde(default)]
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// One serial request/response connection to an Electrum peer.
pub struct Transport {
    reader: BufReader<tokio::io::ReadHalf<Box<dyn AsyncStream>>>,
    writer: tokio::io::WriteHalf<Box<dyn AsyncStream>>,
    peer: String,
}

impl Transport {
    /// Open a plain TCP connection.
    pub async fn connect_tcp(addr: &str) -> Result<Self, TransportError> {
        let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        Ok(Self::from_stream(Box::new(stream), addr))
    }

    /// Open a TLS connection, accepting whatever certificate the peer
    /// presents.
    pub async fn connect_tls(host: &str, addr: &str) -> Result<Self, TransportError> {
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);

        let tcp = timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        let tls = timeout(CONNECT_TIMEOUT, connector.connect(host, tcp))
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(TransportError::Tls)?;
        Ok(Self::from_stream(Box::new(tls), addr))
    }

    fn from_stream(stream: Box<dyn AsyncStream>, peer: &str) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Transport {
            reader: BufReader::new(read_half),
            writer: write_half,
            peer: peer.to_string(),
        }
    }

    /// Send one request and wait for its response.
    pub async fn send_message(
        &mut self,
        request: &RequestMessage,
    ) -> Result<ResponseMessage, TransportError> {
        let mut body = serde_json::to_vec(request)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;
        body.push(b'\n');

        timeout(WRITE_TIMEOUT, self.writer.write_all(&body))
            .await
            .map_err(|_| TransportError::Timeout("write"))??;
        debug!("{} <- {}", self.peer, String::from_utf8_lossy(&body).trim_end());

        let mut line = String::new();
        let n = timeout(READ_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .map_err(|_| TransportError::Timeout("read"))??;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        debug!("{} -> {}", self.peer, line.trim_end());

        let resp: ResponseMessage = serde_json::from_str(&line)
            .map_err(|e| TransportError::Malformed(e.to_string()))?;

        if resp.id != request.id {
            return Err(TransportError::IdMismatch {
                sent: request.id,
                got: resp.id,
            });
        }
        if let Some(err) = resp.error {
            return Err(TransportError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        Ok(resp)
    }
}
