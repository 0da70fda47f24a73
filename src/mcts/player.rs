//! `MctsPlayer` (spec §4.E), grounded on
//! `original_source/torchRL/mcts/mcts.h`'s `MctsPlayer::actMcts`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::{rngs::StdRng, SeedableRng};

use crate::actor::Actor;
use crate::arena::{Arena, NODE_NONE};
use crate::mcts::engine::compute_rollouts;
use crate::mcts::option::MctsOption;
use crate::mcts::result::MctsResult;
use crate::player::Player;
use crate::state::State;

/// Time-budgeted driver wrapping the rollout engine and one or more
/// actors. Stateless across moves except `remaining_time` (spec §4.E).
pub struct MctsPlayer {
    option: MctsOption,
    remaining_time: f32,
    actors: Vec<Arc<dyn Actor>>,
    arena: Arena,
    rng: StdRng,
    terminate_flag: Arc<AtomicBool>,
}

impl MctsPlayer {
    pub fn new(option: MctsOption) -> Self {
        let remaining_time = option.total_time;
        let rng = StdRng::seed_from_u64(option.seed);
        let arena = Arena::new(option.storage_cap);
        Self {
            option,
            remaining_time,
            actors: Vec::new(),
            arena,
            rng,
            terminate_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn add_actor(&mut self, actor: Arc<dyn Actor>) {
        self.actors.push(actor);
    }

    pub fn is_tournament_opponent(&self) -> bool {
        self.actors.first().map(|a| a.is_tournament_opponent()).unwrap_or(false)
    }

    /// Runs MCTS for a batch of root states sharing this player (spec
    /// §4.D "Inputs: a list of root states... handled by the same
    /// player"), and returns one [`MctsResult`] per state.
    pub fn act_mcts(&mut self, states: &[&dyn State]) -> Vec<MctsResult> {
        let mut results: Vec<MctsResult> = (0..states.len()).map(|_| MctsResult::new()).collect();

        if !self.option.use_mcts {
            for (i, &state) in states.iter().enumerate() {
                let pi_val = self.actors[0].evaluate(state);
                results[i].set_mcts_policy(pi_val.policy);
            }
        } else {
            let root_player: Vec<i32> = states.iter().map(|s| s.current_player()).collect();
            let mut roots = Vec::with_capacity(states.len());
            for &state in states {
                let stored = if self.option.store_state_in_node {
                    Some(state.clone_state())
                } else {
                    None
                };
                let root_id = self
                    .arena
                    .acquire(NODE_NONE, stored, state.hash())
                    .expect("arena exhausted allocating mcts roots");
                roots.push(root_id);
            }

            let this_move_time = (self.remaining_time * self.option.time_ratio) as f64;
            let begin = Instant::now();

            let root_states: Vec<Box<dyn State>> = states.iter().map(|s| s.clone_state()).collect();
            let terminate_flag = self.terminate_flag.clone();
            let terminated = move || terminate_flag.load(Ordering::Acquire);

            let rollout_counts: Vec<usize> = if self.actors.len() <= 1 {
                let actor = self.actors[0].as_ref();
                compute_rollouts(
                    &roots,
                    &root_states,
                    &root_player,
                    &self.arena,
                    actor,
                    &self.option,
                    this_move_time,
                    &terminated,
                    &mut self.rng,
                )
                .expect("rollout loop failed")
            } else {
                // Multiple evaluators drive the same root set concurrently
                // (spec §4.D "by several threads per root set"); each gets
                // its own rng stream derived from the base seed. Per-root
                // rollout totals are summed across actors for the
                // "rollouts per second" stat.
                let arena = &self.arena;
                let option = &self.option;
                let per_actor: Vec<Vec<usize>> = std::thread::scope(|scope| {
                    let handles: Vec<_> = self
                        .actors
                        .iter()
                        .enumerate()
                        .map(|(actor_idx, actor)| {
                            let roots = &roots;
                            let root_states = &root_states;
                            let root_player = &root_player;
                            let terminated = &terminated;
                            let mut local_rng =
                                StdRng::seed_from_u64(option.seed.wrapping_add(actor_idx as u64 + 1));
                            scope.spawn(move || {
                                compute_rollouts(
                                    roots,
                                    root_states,
                                    root_player,
                                    arena,
                                    actor.as_ref(),
                                    option,
                                    this_move_time,
                                    terminated,
                                    &mut local_rng,
                                )
                                .expect("rollout loop failed")
                            })
                        })
                        .collect();
                    handles.into_iter().map(|h| h.join().expect("mcts rollout thread panicked")).collect()
                });
                let mut totals = vec![0usize; roots.len()];
                for counts in per_actor {
                    for (t, c) in totals.iter_mut().zip(counts.into_iter()) {
                        *t += c;
                    }
                }
                totals
            };

            self.remaining_time -= begin.elapsed().as_secs_f32();

            for (i, &root_id) in roots.iter().enumerate() {
                let node = self.arena.node(root_id);
                results[i].root_value = node.stats.avg_value();
                let children = node.children.lock().unwrap().clone();
                let mut visits_by_action: std::collections::HashMap<i64, f32> = std::collections::HashMap::new();
                for (action, _hash, child_id) in children {
                    let visits = self.arena.node(child_id).stats.visit_count() as f32;
                    *visits_by_action.entry(action).or_insert(0.0) += visits;
                }
                for (action, visits) in visits_by_action {
                    results[i].add(action, visits);
                }
                results[i].normalize();
                results[i].rollouts = rollout_counts[i] as i32;
                self.arena.free_tree(root_id);
            }
        }

        for (i, &state) in states.iter().enumerate() {
            if state.step_idx() < self.option.sample_before_step_idx {
                results[i].sample(&mut self.rng);
            }
        }

        results
    }

    pub fn act_mcts_one(&mut self, state: &dyn State) -> MctsResult {
        self.act_mcts(&[state]).remove(0)
    }
}

impl Player for MctsPlayer {
    fn record_move(&self, state: &dyn State) {
        if let Some(actor) = self.actors.first() {
            actor.record_move(state);
        }
    }

    fn result(&self, state: &dyn State, reward: f32) {
        if let Some(actor) = self.actors.first() {
            actor.result(state, reward);
        }
    }

    fn terminate(&self) {
        self.terminate_flag.store(true, Ordering::Release);
        for actor in &self.actors {
            actor.terminate();
        }
    }

    fn is_tournament_opponent(&self) -> bool {
        MctsPlayer::is_tournament_opponent(self)
    }
}

/// A pseudo-player that skips MCTS entirely and reads its action from a
/// blocking input queue (spec §4.E "a human / tournament-proxy pseudo-
/// player variant"), grounded on `original_source/core/human_player.h`'s
/// `HumanPlayer`/`TPPlayer`.
///
/// Unlike `MctsPlayer`, this has no batched `act_mcts` -- it acts one state
/// at a time via [`HumanPlayer::act`], matching the original's un-batched
/// `act(State&)` signature (a human can't be asked to move in more than
/// one game at once).
pub struct HumanPlayer {
    actor: Arc<dyn Actor>,
    input: std::sync::mpsc::Receiver<crate::state::Action>,
    is_tournament_proxy: bool,
}

impl HumanPlayer {
    pub fn new(actor: Arc<dyn Actor>, input: std::sync::mpsc::Receiver<crate::state::Action>) -> Self {
        Self { actor, input, is_tournament_proxy: false }
    }

    pub fn tournament_proxy(actor: Arc<dyn Actor>, input: std::sync::mpsc::Receiver<crate::state::Action>) -> Self {
        Self { actor, input, is_tournament_proxy: true }
    }

    /// Blocks until an action is available on the input queue, then
    /// validates it against `state`'s legal actions.
    pub fn act(&self, state: &dyn State) -> crate::state::Action {
        let action = self.input.recv().expect("human input channel closed");
        debug_assert!(
            state.legal_actions().contains(&action),
            "human input produced an action outside the legal-actions list"
        );
        action
    }
}

impl Player for HumanPlayer {
    fn record_move(&self, state: &dyn State) {
        self.actor.record_move(state);
    }

    fn result(&self, state: &dyn State, reward: f32) {
        self.actor.result(state, reward);
    }

    fn terminate(&self) {
        self.actor.terminate();
    }

    fn is_tournament_opponent(&self) -> bool {
        self.is_tournament_proxy
    }

    fn is_human(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::PiVal;
    use crate::demos::tic_tac_toe::TicTacToeState;

    struct UniformActor;
    impl Actor for UniformActor {
        fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {}
        fn batch_result(&self, _index: usize, state: &dyn State, out: &mut PiVal) {
            let n = state.legal_actions().len().max(1);
            *out = PiVal::new(state.current_player(), 0.0, vec![1.0 / n as f32; n]);
        }
    }

    #[test]
    fn act_mcts_returns_normalized_policy_and_valid_root_value() {
        let option = MctsOption {
            num_rollout_per_thread: 32,
            puct: 1.0,
            storage_cap: 2048,
            ..Default::default()
        };
        let mut player = MctsPlayer::new(option);
        player.add_actor(Arc::new(UniformActor));

        let state = TicTacToeState::new();
        let result = player.act_mcts_one(&state);

        let sum: f32 = result.mcts_policy.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6 || result.mcts_policy.is_empty());
        assert!(result.root_value >= -1.0 && result.root_value <= 1.0);
    }

    #[test]
    fn human_player_returns_the_queued_legal_action() {
        let (tx, rx) = std::sync::mpsc::channel();
        tx.send(4).unwrap();
        let human = HumanPlayer::new(Arc::new(UniformActor), rx);
        let state = TicTacToeState::new();
        assert_eq!(human.act(&state), 4);
    }
}
