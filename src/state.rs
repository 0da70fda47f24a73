//! The `State` external collaborator (spec §6).
//!
//! Game rule implementations are out of scope for this crate (spec §1); what
//! lives here is the *contract* the MCTS engine, orchestrator, and registry
//! rely on. A concrete implementation is provided only as a test fixture
//! (`crate::demos::tic_tac_toe`) -- never as a "real" shipped game.

/// An opaque index into a state's legal-actions list.
pub type Action = i64;

/// Sentinel meaning "no action" (spec §3, `Action`).
pub const INVALID_ACTION: Action = -1;

/// A 64-bit position hash, used to key stochastic-game child maps and to
/// detect transpositions.
pub type StateHash = u64;

/// Immutable-from-the-engine's-perspective game state (spec §3, §6).
///
/// Every method here must be cheap enough to call from the MCTS hot loop;
/// `clone` in particular is expected to be O(state size), not O(history).
pub trait State: Send + Sync {
    /// The player to move, `0` or `1` (or `0` for single-player/tied games).
    fn current_player(&self) -> i32;

    /// Number of plies played so far.
    fn step_idx(&self) -> i64;

    /// Whether the game has ended.
    fn terminated(&self) -> bool;

    /// Reward for `player` on a terminal state, in `[-1, 1]`.
    fn reward(&self, player: i32) -> f32;

    /// Single-player (or cooperative) games skip the player-flip in backup.
    fn is_one_player_game(&self) -> bool {
        false
    }

    /// Whether actions can resolve to more than one successor state
    /// (dice rolls, card draws, ...). Stochastic games key mcts children by
    /// `(action, post_move_hash)` rather than `action` alone (spec §4.D).
    fn is_stochastic(&self) -> bool {
        false
    }

    /// For stochastic games: re-roll whatever hidden randomness the state
    /// carries (used by tree-reuse paths that replay a stochastic
    /// transition deterministically). Returns whether anything changed.
    fn stochastic_reset(&mut self) -> bool {
        false
    }

    /// Applies `action` in place. Returns whether the state actually
    /// advanced; `false` indicates an engine bug (spec §7 `ActionError`) and
    /// callers should treat it as fatal, not retry.
    fn forward(&mut self, action: Action) -> bool;

    /// A 64-bit hash of the current position.
    fn hash(&self) -> StateHash;

    /// Deep copy; for stochastic games this advances (not resets) any
    /// internal rng stream so that cloned branches decorrelate.
    fn clone_state(&self) -> Box<dyn State>;

    /// Legal actions at the current position, in a fixed deterministic
    /// order (selection's tie-break relies on this order being stable).
    fn legal_actions(&self) -> Vec<Action>;

    /// Dense feature tensor fed to the neural evaluator.
    fn features(&self) -> Vec<f32>;

    /// Shape of [`State::features`]'s output.
    fn feature_size(&self) -> Vec<i64>;

    /// Shape of the policy head's dense output.
    fn action_size(&self) -> Vec<i64>;

    /// A cheap random-rollout value estimate for `player`, used as a prior
    /// when [`crate::mcts::option::MctsOption::use_value_prior`] is set and
    /// no sibling has been explored yet.
    fn random_rollout_reward(&self, _player: i32) -> f32 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demos::tic_tac_toe::TicTacToeState;

    #[test]
    fn legal_actions_deterministic_order() {
        let s = TicTacToeState::new();
        let a = s.legal_actions();
        let b = s.legal_actions();
        assert_eq!(a, b);
        assert_eq!(a, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn forward_on_fresh_state_advances() {
        let mut s = TicTacToeState::new();
        assert!(s.forward(4));
        assert_eq!(s.step_idx(), 1);
    }
}
