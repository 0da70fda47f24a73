//! RPC server: accepts framed connections, decodes requests, dispatches to
//! registered handlers by function name, and replies with the handler's
//! result or an unknown-function/remote-exception status (spec §4.H).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use crate::error::Result;
use crate::rpc::message::{self, Reply, Status};
use crate::rpc::transport::{self, Connection};

/// A handler takes the raw argument blob and returns a raw return-value
/// blob. Concrete RPCs (e.g. the distributed service's `requestModel`,
/// `trainData`, `gameResult`) build small positional encode/decode helpers
/// on top of this, decoded "positionally" per spec §4.H.
pub type Handler = Arc<dyn Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync>;

#[derive(Clone, Default)]
pub struct RpcServer {
    handlers: HashMap<String, Handler>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    pub fn register<F>(&mut self, function: impl Into<String>, handler: F)
    where
        F: Fn(Vec<u8>) -> Result<Vec<u8>> + Send + Sync + 'static,
    {
        self.handlers.insert(function.into(), Arc::new(handler));
    }

    /// Binds `endpoint` and spawns the accept loop in the background,
    /// returning the bound address (useful for tests that bind to port 0).
    pub async fn spawn_on(&self, endpoint: &str) -> Result<SocketAddr> {
        let listener = transport::bind(endpoint).await?;
        let addr = listener.local_addr().map_err(crate::error::CoreError::Io)?;
        let handlers = self.handlers.clone();
        tokio::spawn(Self::accept_loop(listener, handlers));
        Ok(addr)
    }

    /// Runs the accept loop on the current task until the listener errors.
    /// Used by long-lived server binaries that want to await it directly.
    pub async fn serve(&self, endpoint: &str) -> Result<()> {
        let listener = transport::bind(endpoint).await?;
        Self::accept_loop(listener, self.handlers.clone()).await;
        Ok(())
    }

    async fn accept_loop(listener: TcpListener, handlers: HashMap<String, Handler>) {
        loop {
            let conn = match transport::accept(&listener).await {
                Ok(conn) => conn,
                Err(e) => {
                    log::warn!("⚠️ rpc accept failed: {e}");
                    continue;
                }
            };
            let handlers = handlers.clone();
            tokio::spawn(Self::serve_connection(conn, handlers));
        }
    }

    async fn serve_connection(mut conn: Connection, handlers: HashMap<String, Handler>) {
        loop {
            let frame = match conn.recv().await {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(e) => {
                    log::debug!("rpc connection recv error: {e}");
                    return;
                }
            };
            let decompressed = match message::decompress_frame(&frame) {
                Ok(body) => body,
                Err(e) => {
                    log::warn!("⚠️ rpc frame decompression failed: {e}");
                    continue;
                }
            };
            let request = match message::decode_request(decompressed.into()) {
                Ok(req) => req,
                Err(e) => {
                    log::warn!("⚠️ rpc frame decode failed: {e}");
                    continue;
                }
            };

            let reply = match handlers.get(&request.function) {
                Some(handler) => match handler(request.args) {
                    Ok(payload) => Reply { id: request.id, status: Status::Ok, payload },
                    Err(e) => Reply {
                        id: request.id,
                        status: Status::RemoteException,
                        payload: e.to_string().into_bytes(),
                    },
                },
                None => Reply { id: request.id, status: Status::UnknownFunction, payload: Vec::new() },
            };

            let body = message::encode_reply(&reply);
            let compressed = match message::compress_frame(&body) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("⚠️ rpc reply compression failed: {e}");
                    continue;
                }
            };
            if conn.send(compressed).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client::RpcClient;

    #[tokio::test]
    async fn registered_handler_is_dispatched() {
        let mut server = RpcServer::new();
        server.register("double", |args| Ok(args.iter().map(|b| b.wrapping_mul(2)).collect()));
        let addr = server.spawn_on("127.0.0.1:0").await.unwrap();

        let client = RpcClient::connect(addr.to_string());
        let reply = client.call("double", vec![1, 2, 3]).await.unwrap();
        assert_eq!(reply, vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn handler_error_surfaces_as_remote_exception() {
        let mut server = RpcServer::new();
        server.register("boom", |_| Err(crate::error::CoreError::Action("boom".to_string())));
        let addr = server.spawn_on("127.0.0.1:0").await.unwrap();

        let client = RpcClient::connect(addr.to_string());
        let err = client.call("boom", vec![]).await.unwrap_err();
        assert_matches::assert_matches!(err, crate::error::CoreError::Remote(_));
    }
}
