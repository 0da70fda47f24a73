//! The `Actor` external collaborator (spec §6, §4.D).
//!
//! An `Actor` is whatever turns a `State` into a `PiVal` -- a neural
//! evaluator backed by [`crate::neural::manager::ModelManager`] in
//! production, or a scripted/test stand-in. The MCTS engine drives it
//! through the batched `batch_resize`/`batch_prepare`/`batch_evaluate`/
//! `batch_result` quartet (spec §4.D "Scheduling & parallelism"); the
//! single-state `evaluate` has a default impl in terms of the batch
//! quartet so simple actors only need to implement one side.

use crate::state::State;

/// Evaluator output at a state (spec §3).
#[derive(Debug, Clone, Default)]
pub struct PiVal {
    /// Player id the value/policy are expressed from the perspective of.
    pub player_id: i32,
    /// Value in `[-1, 1]` from `player_id`'s perspective.
    pub value: f32,
    /// Dense policy vector over the state's legal actions (sums to ~1).
    pub policy: Vec<f32>,
    /// Optional recurrent-state passthrough (spec §3 "optional
    /// recurrent-state tensor bytes").
    pub rnn_state: Option<Vec<f32>>,
}

impl PiVal {
    pub fn new(player_id: i32, value: f32, policy: Vec<f32>) -> Self {
        Self {
            player_id,
            value,
            policy,
            rnn_state: None,
        }
    }
}

/// Minimal interface the MCTS engine needs from an evaluator (spec §6).
///
/// Implementors only need to override either [`Actor::evaluate`] or the
/// batched quartet; the default impls bridge between the two so the engine
/// can always drive through the batched path.
pub trait Actor: Send + Sync {
    /// Evaluates a single state. The default batches through the quartet
    /// with `n = 1`.
    fn evaluate(&self, state: &dyn State) -> PiVal {
        self.batch_resize(1);
        self.batch_prepare(0, state, None);
        self.batch_evaluate(1);
        let mut out = PiVal::default();
        self.batch_result(0, state, &mut out);
        out
    }

    /// Reserves room for `n` in-flight evaluations in this round.
    fn batch_resize(&self, _n: usize) {}

    /// Stages `state` (and optional recurrent input) at slot `index`.
    fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {
        unimplemented!("batch_prepare must be overridden by batched actors");
    }

    /// Runs the forward pass for the `n` staged slots.
    fn batch_evaluate(&self, _n: usize) {}

    /// Retrieves the result for slot `index` into `out`.
    fn batch_result(&self, _index: usize, _state: &dyn State, _out: &mut PiVal) {
        unimplemented!("batch_result must be overridden by batched actors");
    }

    /// Called once per move actually played, after the engine has picked it.
    fn record_move(&self, _state: &dyn State) {}

    /// Called once a game concludes, with this actor's final reward.
    fn result(&self, _state: &dyn State, _reward: f32) {}

    /// Cooperative shutdown signal (spec §5 cancellation).
    fn terminate(&self) {}

    /// Whether this actor represents a tournament opponent (affects
    /// resignation and rating bookkeeping in §4.F/§4.G).
    fn is_tournament_opponent(&self) -> bool {
        false
    }

    /// Model registry id this actor is currently evaluating with, if any.
    fn model_id(&self) -> Option<String> {
        None
    }
}
