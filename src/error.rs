//! Error taxonomy shared across the arena, replay buffer, model manager,
//! orchestrator, registry, and RPC layer.
//!
//! Mirrors spec §7: `FatalConfig` / `TransientNetwork` / `RemoteError` /
//! `ActionError` abort or reconnect; `Termination` is deliberately not a
//! variant here (observed as a flag, not an error).

/// Top-level error type for the self-play core.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Configuration that cannot be recovered from at runtime: a malformed
    /// [`crate::mcts::option::MctsOption`], an arena sized smaller than a
    /// single rollout requires, a state-dict whose keys/shapes don't match
    /// the model, an unknown game name, a replay schema mismatch.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    /// A network condition that is expected to resolve itself (reconnect,
    /// retry, backoff) rather than abort the caller.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// The remote peer (registry or replay-buffer server) returned an
    /// application-level exception rather than a transport failure.
    #[error("remote error: {0}")]
    Remote(String),

    /// An `Action` was rejected by a `State` (illegal move, index out of
    /// range, or the state has already reached a terminal position).
    /// Per spec §7, indicates an engine bug -- fatal, no retry.
    #[error("invalid action: {0}")]
    Action(String),

    /// The node arena has no free slots and growth was not requested.
    #[error("arena exhausted (capacity {capacity})")]
    ArenaExhausted { capacity: usize },

    /// `ReplayBuffer::add` saw a batch whose keys/shape-tail/dtype don't
    /// match the schema recorded on the first `add`.
    #[error("replay buffer schema mismatch: {0}")]
    InvalidSchema(String),

    /// ZSTD (de)compression of a replay entry failed.
    #[error("compression error: {0}")]
    Compression(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Whether a caller should treat this as retryable (spec §7's
    /// `TransientNetwork` class) as opposed to fatal.
    pub fn is_transient(&self) -> bool {
        matches!(self, CoreError::TransientNetwork(_))
    }
}
