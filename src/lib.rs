//! # Batched MCTS self-play core
//!
//! A batched Monte Carlo Tree Search engine, a multi-game orchestrator, and
//! a distributed rating-sampled model-and-replay service for training
//! AlphaZero-style agents.
//!
//! ## Components
//!
//! - **Arena** ([`arena`]): index-based tree storage for concurrent rollouts.
//! - **MCTS** ([`mcts`]): selection/expansion/backup, forced rollouts,
//!   virtual loss, and the time-budgeted player driving them.
//! - **Neural** ([`neural`]): a priority-mutex-guarded batched model
//!   manager and safetensors-based state-dict I/O.
//! - **Replay** ([`replay`]): a fixed-capacity, ZSTD-compressed replay
//!   buffer with a background sampling worker pool.
//! - **Orchestrator** ([`orchestrator`]): runs many in-flight games per
//!   thread, batching identical players and emitting training trajectories.
//! - **Distributed** ([`distributed`]): a rating-sampled model registry
//!   exposed over [`rpc`] for fleet-wide self-play.
//!
//! ## Usage
//!
//! ```no_run
//! use alphazero_core::mcts::{MctsOption, MctsPlayer};
//!
//! let mut player = MctsPlayer::new(MctsOption::default());
//! ```

pub mod actor;
pub mod arena;
pub mod demos;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod mcts;
pub mod neural;
pub mod orchestrator;
pub mod player;
pub mod replay;
pub mod rpc;
pub mod state;

pub use actor::{Actor, PiVal};
pub use error::{CoreError, Result};
pub use player::Player;
pub use state::{Action, State, StateHash};

/// Library version information.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
