//! Async TCP transport: length-prefixed framed messages, per-peer
//! reconnect with exponential backoff capped at 30s, hostname resolution,
//! and clean teardown on close (spec §4.H, §5 "suspension points... inside
//! any RPC sync/get awaiting a reply").
//!
//! Grounded on `original_source/src/distributed/rpc.h`'s manual
//! `size_t`-prefixed buffer framing, generalized to `tokio_util`'s
//! `LengthDelimitedCodec` (SPEC_FULL §4.H: "the idiomatic Rust equivalent
//! of... manual framing").

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{CoreError, Result};

/// Initial and maximum reconnect backoff (spec §4.H, §8 scenario S5:
/// "within 30s, new RPCs succeed").
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `*:port` binds all interfaces; `host:port` or `[ipv6]:port` otherwise
/// (spec §6 "Endpoint syntax").
pub fn normalize_endpoint(endpoint: &str) -> String {
    if let Some(port) = endpoint.strip_prefix("*:") {
        format!("0.0.0.0:{port}")
    } else {
        endpoint.to_string()
    }
}

/// A single framed length-delimited connection over TCP.
pub struct Connection {
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl Connection {
    fn wrap(stream: TcpStream) -> Self {
        stream.set_nodelay(true).ok();
        Self { framed: Framed::new(stream, LengthDelimitedCodec::new()) }
    }

    /// Resolves `endpoint` (hostname or address) and connects once, with no
    /// retry -- retry/backoff is the caller's concern (`connect_with_backoff`).
    pub async fn connect(endpoint: &str) -> Result<Self> {
        let addr = normalize_endpoint(endpoint);
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| CoreError::TransientNetwork(format!("connect to {addr} failed: {e}")))?;
        Ok(Self::wrap(stream))
    }

    /// Connects with exponential backoff starting at [`INITIAL_BACKOFF`],
    /// doubling, capped at [`MAX_BACKOFF`] (spec §4.H, §8 S5). Never gives
    /// up; callers that want a deadline should race this future against a
    /// timeout of their own.
    pub async fn connect_with_backoff(endpoint: &str) -> Self {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match Self::connect(endpoint).await {
                Ok(conn) => return conn,
                Err(e) => {
                    log::warn!("🔌 reconnect to {endpoint} failed ({e}), retrying in {backoff:?}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    pub async fn send(&mut self, frame: Vec<u8>) -> Result<()> {
        self.framed
            .send(Bytes::from(frame))
            .await
            .map_err(|e| CoreError::TransientNetwork(format!("send failed: {e}")))
    }

    pub async fn recv(&mut self) -> Result<Option<Bytes>> {
        match self.framed.next().await {
            Some(Ok(bytes)) => Ok(Some(bytes.freeze())),
            Some(Err(e)) => Err(CoreError::TransientNetwork(format!("recv failed: {e}"))),
            None => Ok(None),
        }
    }
}

/// Binds a listener, normalizing `*:port` to `0.0.0.0:port` (spec §6).
pub async fn bind(endpoint: &str) -> Result<TcpListener> {
    let addr = normalize_endpoint(endpoint);
    TcpListener::bind(&addr)
        .await
        .map_err(|e| CoreError::FatalConfig(format!("bind {addr} failed: {e}")))
}

pub async fn accept(listener: &TcpListener) -> Result<Connection> {
    let (stream, _peer) = listener
        .accept()
        .await
        .map_err(|e| CoreError::TransientNetwork(format!("accept failed: {e}")))?;
    Ok(Connection::wrap(stream))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_endpoint_binds_all_interfaces() {
        assert_eq!(normalize_endpoint("*:9001"), "0.0.0.0:9001");
        assert_eq!(normalize_endpoint("localhost:9001"), "localhost:9001");
        assert_eq!(normalize_endpoint("[::1]:9001"), "[::1]:9001");
    }

    #[tokio::test]
    async fn connect_send_recv_round_trip() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = accept(&listener).await.unwrap();
            let msg = conn.recv().await.unwrap().unwrap();
            conn.send(msg.to_vec()).await.unwrap();
        });

        let mut client = Connection::connect(&addr.to_string()).await.unwrap();
        client.send(b"ping".to_vec()).await.unwrap();
        let echoed = client.recv().await.unwrap().unwrap();
        assert_eq!(&echoed[..], b"ping");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_transient() {
        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = Connection::connect(&addr.to_string()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
