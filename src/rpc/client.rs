//! RPC client: request/reply over the framed transport, reconnecting
//! transparently and resolving each call to whichever peer answers (spec
//! §4.H). Callbacks are keyed by a 32-bit request id; timeouts are not
//! enforced in-band (callers may race a call against their own timer,
//! spec §4.H "timeouts are not enforced in-band").

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Mutex};

use crate::error::{CoreError, Result};
use crate::rpc::message::{self, Reply, Request, Status};
use crate::rpc::transport::Connection;

struct Pending {
    callbacks: Mutex<HashMap<u32, oneshot::Sender<Reply>>>,
}

/// A reconnecting RPC client bound to one endpoint. Runs a background task
/// that owns the socket, dispatches outgoing requests from a channel, and
/// resolves pending callbacks as replies arrive; on disconnect all
/// in-flight callbacks resolve to [`CoreError::TransientNetwork`] (spec §5
/// "in-flight futures resolve to a connection-closed error") and the task
/// reconnects with backoff before resuming.
pub struct RpcClient {
    endpoint: String,
    next_id: AtomicU32,
    pending: Arc<Pending>,
    outbox: mpsc::Sender<(Request, oneshot::Sender<Reply>)>,
    closed: Arc<AtomicBool>,
}

impl RpcClient {
    pub fn connect(endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        let pending = Arc::new(Pending { callbacks: Mutex::new(HashMap::new()) });
        let (outbox, mut inbox) = mpsc::channel::<(Request, oneshot::Sender<Reply>)>(256);
        let closed = Arc::new(AtomicBool::new(false));

        let task_endpoint = endpoint.clone();
        let task_pending = pending.clone();
        let task_closed = closed.clone();
        tokio::spawn(async move {
            'reconnect: loop {
                if task_closed.load(Ordering::Acquire) {
                    break;
                }
                let mut conn = Connection::connect_with_backoff(&task_endpoint).await;
                log::info!("📡 rpc client connected to {task_endpoint}");

                loop {
                    if task_closed.load(Ordering::Acquire) {
                        break 'reconnect;
                    }
                    tokio::select! {
                        outgoing = inbox.recv() => {
                            let Some((req, reply_tx)) = outgoing else { break 'reconnect; };
                            task_pending.callbacks.lock().await.insert(req.id, reply_tx);
                            let body = message::encode_request(&req);
                            let Ok(compressed) = message::compress_frame(&body) else { continue };
                            if conn.send(compressed).await.is_err() {
                                Self::fail_all_pending(&task_pending).await;
                                break;
                            }
                        }
                        incoming = conn.recv() => {
                            match incoming {
                                Ok(Some(bytes)) => {
                                    if let Ok(decompressed) = message::decompress_frame(&bytes) {
                                        if let Ok(reply) = message::decode_reply(decompressed.into()) {
                                            if let Some(tx) = task_pending.callbacks.lock().await.remove(&reply.id) {
                                                let _ = tx.send(reply);
                                            }
                                        }
                                    }
                                }
                                Ok(None) | Err(_) => {
                                    log::warn!("🔌 rpc connection to {task_endpoint} dropped");
                                    Self::fail_all_pending(&task_pending).await;
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            Self::fail_all_pending(&task_pending).await;
        });

        Self { endpoint, next_id: AtomicU32::new(1), pending, outbox, closed }
    }

    async fn fail_all_pending(pending: &Pending) {
        let mut callbacks = pending.callbacks.lock().await;
        for (_, tx) in callbacks.drain() {
            let _ = tx.send(Reply { id: 0, status: Status::RemoteException, payload: Vec::new() });
        }
    }

    /// Async futures-returning call variant (spec §4.H "async futures-
    /// returning variants").
    pub async fn call(&self, function: impl Into<String>, args: Vec<u8>) -> Result<Vec<u8>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.outbox
            .send((Request { id, function: function.into(), args }, reply_tx))
            .await
            .map_err(|_| CoreError::TransientNetwork(format!("rpc client for {} is closed", self.endpoint)))?;
        let reply = reply_rx
            .await
            .map_err(|_| CoreError::TransientNetwork("rpc connection closed before reply".to_string()))?;
        match reply.status {
            Status::Ok => Ok(reply.payload),
            Status::RemoteException => Err(CoreError::Remote(
                String::from_utf8_lossy(&reply.payload).to_string(),
            )),
            Status::UnknownFunction => Err(CoreError::Remote("unknown function".to_string())),
        }
    }

    /// Blocking sync variant, for callers outside an async context (spec
    /// §4.H "sync and async futures-returning variants"). Must not be
    /// called from within a tokio worker thread.
    pub fn call_sync(&self, function: impl Into<String>, args: Vec<u8>) -> Result<Vec<u8>> {
        tokio::runtime::Handle::current().block_on(self.call(function, args))
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::server::RpcServer;

    #[tokio::test]
    async fn call_reaches_a_registered_handler() {
        let mut server = RpcServer::new();
        server.register("echo", |args| Ok(args));
        let listener_addr = server.spawn_on("127.0.0.1:0").await.unwrap();

        let client = RpcClient::connect(listener_addr.to_string());
        let reply = client.call("echo", b"hi".to_vec()).await.unwrap();
        assert_eq!(reply, b"hi");
    }

    #[tokio::test]
    async fn unknown_function_surfaces_as_remote_error() {
        let server = RpcServer::new();
        let listener_addr = server.spawn_on("127.0.0.1:0").await.unwrap();
        let client = RpcClient::connect(listener_addr.to_string());
        let err = client.call("nope", vec![]).await.unwrap_err();
        assert_matches::assert_matches!(err, CoreError::Remote(_));
    }
}
