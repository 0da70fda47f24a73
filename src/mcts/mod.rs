//! Batched MCTS engine (spec §4.D, §4.E).

pub mod engine;
pub mod option;
pub mod player;
pub mod result;

pub use engine::compute_rollouts;
pub use option::MctsOption;
pub use player::{HumanPlayer, MctsPlayer};
pub use result::MctsResult;
