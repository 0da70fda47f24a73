//! Minimal two-player zero-sum [`State`] used only to exercise the engine,
//! orchestrator, and registry in tests (spec §6: game rules are out of
//! scope for the core; this is a fixture, not a shipped game).

use std::hash::{Hash, Hasher};

use crate::state::{Action, State, StateHash, INVALID_ACTION};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TicTacToeState {
    board: [i8; 9],
    to_move: i8,
    last_move: Action,
}

impl TicTacToeState {
    pub fn new() -> Self {
        Self {
            board: [0; 9],
            to_move: 0,
            last_move: INVALID_ACTION,
        }
    }

    fn winner(&self) -> Option<i8> {
        const LINES: [[usize; 3]; 8] = [
            [0, 1, 2],
            [3, 4, 5],
            [6, 7, 8],
            [0, 3, 6],
            [1, 4, 7],
            [2, 5, 8],
            [0, 4, 8],
            [2, 4, 6],
        ];
        for line in LINES {
            let [a, b, c] = line;
            if self.board[a] != 0 && self.board[a] == self.board[b] && self.board[b] == self.board[c]
            {
                return Some(self.board[a]);
            }
        }
        None
    }

    fn board_full(&self) -> bool {
        self.board.iter().all(|&c| c != 0)
    }
}

impl Default for TicTacToeState {
    fn default() -> Self {
        Self::new()
    }
}

impl State for TicTacToeState {
    fn current_player(&self) -> i32 {
        self.to_move as i32
    }

    fn step_idx(&self) -> i64 {
        self.board.iter().filter(|&&c| c != 0).count() as i64
    }

    fn terminated(&self) -> bool {
        self.winner().is_some() || self.board_full()
    }

    fn reward(&self, player: i32) -> f32 {
        match self.winner() {
            Some(mark) => {
                let winner_player = (mark - 1) as i32;
                if winner_player == player {
                    1.0
                } else {
                    -1.0
                }
            }
            None => 0.0,
        }
    }

    fn forward(&mut self, action: Action) -> bool {
        if !(0..9).contains(&action) || self.board[action as usize] != 0 || self.terminated() {
            return false;
        }
        self.board[action as usize] = self.to_move + 1;
        self.to_move = 1 - self.to_move;
        self.last_move = action;
        true
    }

    fn hash(&self) -> StateHash {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.hash(&mut hasher);
        hasher.finish()
    }

    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }

    fn legal_actions(&self) -> Vec<Action> {
        if self.terminated() {
            return Vec::new();
        }
        (0..9)
            .filter(|&i| self.board[i as usize] == 0)
            .collect()
    }

    fn features(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; 27];
        for i in 0..9 {
            match self.board[i] {
                1 => out[i] = 1.0,
                2 => out[9 + i] = 1.0,
                _ => out[18 + i] = 1.0,
            }
        }
        out
    }

    fn feature_size(&self) -> Vec<i64> {
        vec![3, 3, 3]
    }

    fn action_size(&self) -> Vec<i64> {
        vec![9]
    }

    fn random_rollout_reward(&self, player: i32) -> f32 {
        // Cheap heuristic rollout prior: count of this player's marks minus
        // the opponent's, normalized -- not a real Monte Carlo rollout, but
        // enough to exercise `use_value_prior` in tests.
        let mark = (player + 1) as i8;
        let other = 3 - mark;
        let mine = self.board.iter().filter(|&&c| c == mark).count() as f32;
        let theirs = self.board.iter().filter(|&&c| c == other).count() as f32;
        ((mine - theirs) / 9.0).clamp(-1.0, 1.0)
    }
}

/// Terminal fixture state used by invariant test S1 (spec §8): a state that
/// is already terminal with a fixed reward, and has no legal actions.
#[derive(Debug, Clone)]
pub struct FixedTerminalState {
    pub player: i32,
    pub reward_for_player: f32,
    pub step: i64,
}

impl State for FixedTerminalState {
    fn current_player(&self) -> i32 {
        self.player
    }

    fn step_idx(&self) -> i64 {
        self.step
    }

    fn terminated(&self) -> bool {
        true
    }

    fn reward(&self, player: i32) -> f32 {
        if player == self.player {
            self.reward_for_player
        } else {
            -self.reward_for_player
        }
    }

    fn forward(&mut self, _action: Action) -> bool {
        false
    }

    fn hash(&self) -> StateHash {
        0xDEAD_BEEF
    }

    fn clone_state(&self) -> Box<dyn State> {
        Box::new(self.clone())
    }

    fn legal_actions(&self) -> Vec<Action> {
        Vec::new()
    }

    fn features(&self) -> Vec<f32> {
        Vec::new()
    }

    fn feature_size(&self) -> Vec<i64> {
        Vec::new()
    }

    fn action_size(&self) -> Vec<i64> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_board_has_nine_legal_actions() {
        let s = TicTacToeState::new();
        assert_eq!(s.legal_actions().len(), 9);
        assert!(!s.terminated());
    }

    #[test]
    fn horizontal_win_is_detected() {
        let mut s = TicTacToeState::new();
        for a in [0, 3, 1, 4, 2] {
            s.forward(a);
        }
        assert!(s.terminated());
        assert_eq!(s.reward(0), 1.0);
        assert_eq!(s.reward(1), -1.0);
    }

    #[test]
    fn full_board_draw_has_zero_reward() {
        let mut s = TicTacToeState::new();
        // X O X / X O O / O X X -- no line, board full.
        for a in [0, 1, 2, 4, 3, 5, 7, 6, 8] {
            assert!(s.forward(a));
        }
        assert!(s.terminated());
        assert_eq!(s.reward(0), 0.0);
    }

    #[test]
    fn illegal_move_rejected() {
        let mut s = TicTacToeState::new();
        assert!(s.forward(0));
        assert!(!s.forward(0));
    }
}
