//! `MctsResult` (spec §3, §4.D "Move selection"), grounded on
//! `original_source/torchRL/mcts/utils.h`'s `MctsResult`.

use rand::Rng;

use crate::state::{Action, INVALID_ACTION};

/// Output of one `act_mcts` call for a single root state: a normalized
/// visit-count policy target, the chosen action, and the root's value
/// estimate.
#[derive(Debug, Clone)]
pub struct MctsResult {
    max_visits: f32,
    sum_visits: f32,
    pub best_action: Action,
    /// Dense policy target over actions, indexed by action id; normalized
    /// by [`MctsResult::normalize`] to sum to 1.
    pub mcts_policy: Vec<f32>,
    pub root_value: f32,
    pub rollouts: i32,
    pub rnn_state: Vec<f32>,
}

impl Default for MctsResult {
    fn default() -> Self {
        Self {
            max_visits: -1000.0,
            sum_visits: 0.0,
            best_action: INVALID_ACTION,
            mcts_policy: Vec::new(),
            root_value: 0.0,
            rollouts: 0,
            rnn_state: Vec::new(),
        }
    }
}

impl MctsResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `visits` observed for action `a`, growing the dense policy
    /// vector as needed, and tracks the running argmax (spec §4.D
    /// `bestAction` = argmax of visit count).
    pub fn add(&mut self, a: Action, visits: f32) {
        let idx = a as usize;
        if self.mcts_policy.len() <= idx {
            self.mcts_policy.resize(idx + 1, 0.0);
        }
        self.mcts_policy[idx] = visits;
        self.sum_visits += visits;
        if visits > self.max_visits {
            self.max_visits = visits;
            self.best_action = a;
        }
    }

    /// Normalizes the accumulated visit counts into a probability
    /// distribution (spec invariant 3: non-negative, sums to 1 ± 1e-6).
    pub fn normalize(&mut self) {
        if self.sum_visits <= 0.0 {
            return;
        }
        for v in &mut self.mcts_policy {
            *v /= self.sum_visits;
        }
    }

    /// Samples `best_action` from a tempered transform of the (already
    /// normalized) policy target instead of keeping the argmax, for the
    /// first `sample_before_step_idx` plies of a game (spec §4.D). The
    /// transform is `exp(p^2 * 2) - (1 - 0.5 / K)`, an unusual form kept
    /// verbatim from `original_source/torchRL/mcts/utils.h::MctsResult::sample`
    /// since spec §9 flags it as opaque/do-not-guess.
    pub fn sample(&mut self, rng: &mut impl Rng) {
        let k = self.mcts_policy.len();
        if k == 0 {
            return;
        }
        let mut best = 0.0f32;
        for (action_index, &pi_val) in self.mcts_policy.iter().enumerate() {
            let ceiling = (pi_val * pi_val * 2.0).exp() - (1.0 - 0.5 / k as f32);
            let ceiling = ceiling.max(0.0);
            let v: f32 = rng.random_range(0.0..=ceiling.max(f32::MIN_POSITIVE));
            if v > best {
                best = v;
                self.best_action = action_index as Action;
            }
        }
    }

    pub fn set_mcts_policy(&mut self, policy: Vec<f32>) {
        self.mcts_policy = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn add_tracks_argmax_and_sum() {
        let mut r = MctsResult::new();
        r.add(0, 3.0);
        r.add(1, 7.0);
        r.add(2, 2.0);
        assert_eq!(r.best_action, 1);
        assert_eq!(r.sum_visits, 12.0);
    }

    #[test]
    fn normalize_sums_to_one() {
        let mut r = MctsResult::new();
        r.add(0, 1.0);
        r.add(1, 3.0);
        r.normalize();
        let sum: f32 = r.mcts_policy.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn sample_picks_a_valid_action_index() {
        let mut r = MctsResult::new();
        r.add(0, 1.0);
        r.add(1, 5.0);
        r.add(2, 0.0);
        r.normalize();
        let mut rng = StdRng::seed_from_u64(7);
        r.sample(&mut rng);
        assert!((0..3).contains(&r.best_action));
    }
}
