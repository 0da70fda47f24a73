//! Neural inference surface (spec §4.C): a priority-mutex-guarded model
//! manager, safetensors-based persistence, and the priority-mutex
//! primitive itself.

pub mod manager;
pub mod model_io;
pub mod priority_mutex;

pub use manager::{InferenceModel, ModelManager, NeuralConfig};
pub use priority_mutex::{PriorityMutex, PriorityMutexGuard};
