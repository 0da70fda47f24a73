//! Model manager: batched evaluator behind a priority mutex (spec §4.C).
//!
//! Neural network *architecture* is out of scope (spec §1 Non-goals); what
//! this module owns is the batched-inference/state-dict-update contract an
//! [`crate::actor::Actor`] implementation can forward into, grounded on
//! `original_source/src/core/model_manager.h`'s `ModelManager` surface and
//! the teacher's `neural/manager.rs` (`NeuralManager::new`/`save_models`
//! shape, logging style).

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tch::{Device, Tensor};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::error::{CoreError, Result};
use crate::neural::priority_mutex::{PriorityMutex, DEFAULT_INFERENCE_PRIORITY, UPDATE_PRIORITY};
use crate::replay::{Batch, ReplayBuffer};

/// A minimal contract for "whatever the trained net is": one forward pass
/// over a batch of features producing value + policy (+ optional recurrent
/// state), plus a named state dict for distribution. Concrete architectures
/// live outside this crate's scope; callers plug in their own `tch`-backed
/// implementation.
pub trait InferenceModel: Send {
    fn forward(
        &self,
        input: &Tensor,
        rnn_in: Option<&Tensor>,
    ) -> (Tensor, Tensor, Option<Tensor>);

    fn state_dict(&self) -> HashMap<String, Tensor>;

    /// Copies `dict` into this model's parameters/buffers in place.
    /// Shape mismatches and missing/unknown keys are `FatalConfig` (spec
    /// §4.C `updateModel`).
    fn load_state_dict(&mut self, dict: &HashMap<String, Tensor>) -> Result<()>;
}

/// Configuration for a [`ModelManager`] (teacher's `NeuralConfig` shape,
/// generalized away from a fixed input dimension since feature extraction
/// is out of scope here).
#[derive(Debug, Clone)]
pub struct NeuralConfig {
    pub device: Device,
    pub model_path: String,
    /// Default worker priority for inference callers (spec §4.C).
    pub inference_priority: i64,
}

impl Default for NeuralConfig {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            model_path: "model_weights".to_string(),
            inference_priority: DEFAULT_INFERENCE_PRIORITY,
        }
    }
}

/// Cached result of [`ModelManager::find_batch_size`]'s one-shot tuning
/// pass (spec §4.C).
#[derive(Debug, Clone, Copy)]
pub struct BatchSizeTuning {
    pub batch_size: usize,
    pub score: f64,
}

/// Holds one serialized neural model on a device, behind a priority mutex,
/// plus the ambient train/model-update channel machinery named in spec
/// §4.C.
pub struct ModelManager<M: InferenceModel> {
    config: NeuralConfig,
    model: Arc<PriorityMutex<M>>,
    replay: Arc<ReplayBuffer>,
    batch_size_cache: OnceLock<BatchSizeTuning>,
    find_batch_size_max_ms: f64,
    find_batch_size_max_bs: usize,
    version: AtomicI64,
    /// Outbound training-batch channel drained by the dedicated train
    /// thread (spec §4.C "a dedicated train thread drains a channel").
    train_tx: mpsc::Sender<Batch>,
    train_rx: AsyncMutex<Option<mpsc::Receiver<Batch>>>,
}

impl<M: InferenceModel> ModelManager<M> {
    pub fn new(model: M, config: NeuralConfig, replay: Arc<ReplayBuffer>) -> Self {
        log::info!("🧠 initializing model manager on {:?}", config.device);
        let (train_tx, train_rx) = mpsc::channel(1024);
        Self {
            config,
            model: Arc::new(PriorityMutex::new(model)),
            replay,
            batch_size_cache: OnceLock::new(),
            find_batch_size_max_ms: 50.0,
            find_batch_size_max_bs: 2048,
            version: AtomicI64::new(0),
            train_tx,
            train_rx: AsyncMutex::new(Some(train_rx)),
        }
    }

    pub fn config(&self) -> &NeuralConfig {
        &self.config
    }

    pub fn version(&self) -> i64 {
        self.version.load(Ordering::Acquire)
    }

    /// Runs a forward pass under the priority mutex, releasing it to the
    /// lowest-numbered waiter on unlock (spec §4.C `batchAct`). Inference
    /// callers pass their own thread priority; the default is `-1`.
    pub fn batch_act(
        &self,
        input: &Tensor,
        rnn_in: Option<&Tensor>,
        priority: i64,
    ) -> (Tensor, Tensor, Option<Tensor>) {
        let input = input.to_device(self.config.device);
        let rnn_in = rnn_in.map(|t| t.to_device(self.config.device));
        let guard = self.model.lock(priority);
        guard.forward(&input, rnn_in.as_ref())
    }

    /// Copies `state_dict` into the model under the highest priority (`-9`)
    /// so loads preempt any waiting inference (spec §4.C). Bumps the
    /// manager's version counter on success.
    pub fn update_model(&self, state_dict: &HashMap<String, Tensor>) -> Result<()> {
        log::info!("📦 applying model update (preempting inference queue)");
        let mut guard = self.model.lock(UPDATE_PRIORITY);
        guard.load_state_dict(state_dict)?;
        drop(guard);
        self.version.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// One-shot tuning routine: measures latency/throughput across a
    /// discrete sweep of batch sizes via timed forward passes, and caches
    /// the batch size minimizing `latency/N - log(throughput/N)` (spec
    /// §4.C `findBatchSize`). Re-running requires a fresh `ModelManager`
    /// (or clearing the cache) since `OnceLock` only fills once.
    pub fn find_batch_size(&self, sample_input: &Tensor) -> BatchSizeTuning {
        if let Some(cached) = self.batch_size_cache.get() {
            return *cached;
        }
        let candidates: Vec<usize> = [1usize, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024, 2048]
            .into_iter()
            .filter(|&n| n <= self.find_batch_size_max_bs)
            .collect();

        let feature_shape = sample_input.size()[1..].to_vec();
        let mut best = BatchSizeTuning {
            batch_size: candidates.first().copied().unwrap_or(1),
            score: f64::INFINITY,
        };

        for n in candidates {
            let mut shape = vec![n as i64];
            shape.extend(feature_shape.iter());
            let batch = sample_input
                .get(0)
                .unsqueeze(0)
                .expand(&shape, true)
                .to_device(self.config.device)
                .contiguous();

            let start = Instant::now();
            let guard = self.model.lock(self.config.inference_priority);
            let _ = guard.forward(&batch, None);
            drop(guard);
            let elapsed = start.elapsed();
            if elapsed > Duration::from_millis(self.find_batch_size_max_ms as u64) {
                break;
            }
            let latency = elapsed.as_secs_f64();
            let throughput = n as f64 / latency.max(1e-9);
            let score = latency / n as f64 - (throughput / n as f64).ln();
            if score < best.score {
                best = BatchSizeTuning { batch_size: n, score };
            }
        }

        let _ = self.batch_size_cache.set(best);
        log::info!(
            "⚙️ find_batch_size settled on batch_size={} score={:.4}",
            best.batch_size,
            best.score
        );
        best
    }

    /// Delegates to the local replay buffer (a remote endpoint is handled
    /// one layer up by [`crate::distributed::client`] when configured).
    pub fn sample(&self, k: usize) -> Result<HashMap<String, Vec<u8>>> {
        self.replay.sample_sync(k)
    }

    /// Enqueues a training batch on the outgoing channel (spec §4.C "a
    /// dedicated train thread drains a channel of outgoing training
    /// batches").
    pub async fn push_train_batch(&self, batch: Batch) -> Result<()> {
        self.train_tx
            .send(batch)
            .await
            .map_err(|_| CoreError::FatalConfig("train channel closed".to_string()))
    }

    /// Takes ownership of the train-batch receiver so a dedicated task can
    /// drain it into the local replay buffer (or forward it over RPC).
    /// Returns `None` if already taken.
    pub async fn take_train_receiver(&self) -> Option<mpsc::Receiver<Batch>> {
        self.train_rx.lock().await.take()
    }

    pub fn replay(&self) -> &Arc<ReplayBuffer> {
        &self.replay
    }
}

/// Saves a `tch::nn::VarStore`-backed model's weights to disk, mirroring
/// the teacher's `save_models` (but generalized away from a fixed
/// policy/value net pair).
pub fn save_state_dict(state_dict: &HashMap<String, Tensor>, path: impl AsRef<Path>) -> Result<()> {
    crate::neural::model_io::save_named_tensors(state_dict, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct StubModel {
        calls: StdMutex<Vec<i64>>,
        dict: HashMap<String, Tensor>,
    }

    impl InferenceModel for StubModel {
        fn forward(&self, input: &Tensor, _rnn_in: Option<&Tensor>) -> (Tensor, Tensor, Option<Tensor>) {
            self.calls.lock().unwrap().push(input.size()[0]);
            let n = input.size()[0];
            (Tensor::zeros([n], (tch::Kind::Float, Device::Cpu)), Tensor::zeros([n, 1], (tch::Kind::Float, Device::Cpu)), None)
        }

        fn state_dict(&self) -> HashMap<String, Tensor> {
            self.dict.clone()
        }

        fn load_state_dict(&mut self, dict: &HashMap<String, Tensor>) -> Result<()> {
            for (k, v) in dict {
                if let Some(existing) = self.dict.get(k) {
                    if existing.size() != v.size() {
                        return Err(CoreError::FatalConfig(format!("shape mismatch for {k}")));
                    }
                } else {
                    return Err(CoreError::FatalConfig(format!("unknown key {k}")));
                }
                self.dict.insert(k.clone(), v.shallow_clone());
            }
            Ok(())
        }
    }

    fn manager() -> ModelManager<StubModel> {
        let model = StubModel {
            calls: StdMutex::new(Vec::new()),
            dict: HashMap::from([("w".to_string(), Tensor::zeros([4], (tch::Kind::Float, Device::Cpu)))]),
        };
        let replay = Arc::new(ReplayBuffer::new(16, 1));
        ModelManager::new(model, NeuralConfig::default(), replay)
    }

    #[test]
    fn batch_act_runs_under_priority_mutex() {
        let m = manager();
        let input = Tensor::zeros([4, 3], (tch::Kind::Float, Device::Cpu));
        let (value, _policy, _rnn) = m.batch_act(&input, None, -1);
        assert_eq!(value.size(), vec![4]);
    }

    #[test]
    fn update_model_rejects_unknown_keys() {
        let m = manager();
        let mut bad = HashMap::new();
        bad.insert("nope".to_string(), Tensor::zeros([1], (tch::Kind::Float, Device::Cpu)));
        let err = m.update_model(&bad).unwrap_err();
        assert_matches::assert_matches!(err, CoreError::FatalConfig(_));
        assert_eq!(m.version(), 0);
    }

    #[test]
    fn update_model_bumps_version_on_success() {
        let m = manager();
        let mut good = HashMap::new();
        good.insert("w".to_string(), Tensor::zeros([4], (tch::Kind::Float, Device::Cpu)));
        m.update_model(&good).unwrap();
        assert_eq!(m.version(), 1);
    }
}
