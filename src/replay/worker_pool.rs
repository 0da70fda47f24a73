//! Background sample-worker pool that pre-produces decompressed samples on
//! a bounded queue to hide ZSTD latency (spec §4.B).
//!
//! Grounded on `original_source/src/core/replay_buffer.h`'s
//! `sampleThreads`/condition-variable design, re-architected per Design
//! Note §9 into explicit `tokio` tasks and channels instead of a
//! condvar-guarded thread pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::error::{CoreError, Result};
use crate::replay::ReplayBuffer;

/// Default worker count (spec §4.B "fixed size, default 8").
pub const DEFAULT_WORKERS: usize = 8;

struct SampleRequest {
    k: usize,
    reply: oneshot::Sender<Result<HashMap<String, Vec<u8>>>>,
}

/// Pool of tasks draining a bounded request channel, each running
/// decompression on a blocking thread (CPU-bound per spec §4.B).
pub struct ReplayWorkerPool {
    request_tx: mpsc::Sender<SampleRequest>,
}

impl ReplayWorkerPool {
    pub fn new(buffer: Arc<ReplayBuffer>, workers: usize, queue_capacity: usize) -> Self {
        let (request_tx, request_rx) = mpsc::channel(queue_capacity);
        let request_rx = Arc::new(tokio::sync::Mutex::new(request_rx));
        for worker_id in 0..workers.max(1) {
            let buffer = buffer.clone();
            let request_rx = request_rx.clone();
            tokio::spawn(async move {
                loop {
                    let request = {
                        let mut rx = request_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(request) = request else {
                        log::debug!("replay worker {worker_id} shutting down (channel closed)");
                        break;
                    };
                    let buffer = buffer.clone();
                    let result =
                        tokio::task::spawn_blocking(move || buffer.sample_sync(request.k))
                            .await
                            .unwrap_or_else(|e| {
                                Err(CoreError::FatalConfig(format!(
                                    "replay worker {worker_id} panicked: {e}"
                                )))
                            });
                    let _ = request.reply.send(result);
                }
            });
        }
        Self { request_tx }
    }

    pub fn with_default_pool_size(buffer: Arc<ReplayBuffer>) -> Self {
        Self::new(buffer, DEFAULT_WORKERS, DEFAULT_WORKERS * 4)
    }

    /// Enqueues a sample request and awaits the worker's result.
    pub async fn sample(&self, k: usize) -> Result<HashMap<String, Vec<u8>>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(SampleRequest { k, reply: reply_tx })
            .await
            .map_err(|_| CoreError::FatalConfig("replay worker pool is shut down".to_string()))?;
        reply_rx
            .await
            .map_err(|_| CoreError::FatalConfig("replay worker dropped the reply channel".to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::{Batch, DType, FieldBatch};

    #[tokio::test]
    async fn pool_serves_sample_requests() {
        let buffer = Arc::new(ReplayBuffer::new(32, 1));
        let field = FieldBatch {
            name: "s".to_string(),
            shape_tail: vec![1],
            dtype: DType::F32,
            data: (0..8i32).map(|i| i as f32).flat_map(|v| v.to_le_bytes()).collect(),
        };
        buffer.add(&Batch { n: 8, fields: vec![field] }).unwrap();

        let pool = ReplayWorkerPool::new(buffer, 2, 8);
        let sampled = pool.sample(4).await.unwrap();
        assert_eq!(sampled["s"].len(), 16);
    }
}
