//! Game orchestrator (spec §4.F): runs N in-flight games on one thread,
//! batches identical players to maximize inference batch size, applies
//! resignation, and emits training trajectories.
//!
//! No `original_source` dispatcher file made it into the retrieved pack
//! (`tube/src_cpp/` only carries `network.h`/`distributed.h`); the
//! per-step algorithm below follows spec §4.F's numbered steps directly,
//! reusing the `MctsPlayer`/`HumanPlayer` split from §4.E and the
//! `Batch`/`FieldBatch` shapes from §4.B so a finished episode feeds the
//! replay buffer without another translation layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::mcts::{HumanPlayer, MctsPlayer, MctsResult};
use crate::player::Player;
use crate::replay::{Batch, DType, FieldBatch};
use crate::state::{Action, State};

/// Tagged variant over the small, fixed set of player implementations
/// (Design Note §9: "avoid vtables over hot inner loops; use sum types
/// where the set is known at build time"). `act_batch`'s signature differs
/// from the `Player` trait's lifecycle hooks (§4.E), so it lives here
/// rather than on `Player` itself.
pub enum PlayerHandle {
    Mcts(Mutex<MctsPlayer>),
    Human(HumanPlayer),
}

impl PlayerHandle {
    /// Runs move selection for every state in `states` sharing this
    /// player, returning one [`MctsResult`] per state in order (spec §4.D
    /// "Inputs: a list of root states... handled by the same player").
    /// `HumanPlayer` has no batched path (a human can't move in two games
    /// at once, per §4.E), so it is driven one state at a time and its
    /// action wrapped into a one-hot `MctsResult`.
    fn act_batch(&self, states: &[&dyn State]) -> Vec<MctsResult> {
        match self {
            PlayerHandle::Mcts(player) => player.lock().unwrap().act_mcts(states),
            PlayerHandle::Human(human) => states
                .iter()
                .map(|&state| {
                    let action = human.act(state);
                    let mut result = MctsResult::new();
                    result.best_action = action;
                    let action_len = state
                        .action_size()
                        .iter()
                        .product::<i64>()
                        .max(1) as usize;
                    let mut policy = vec![0.0f32; action_len];
                    if (action as usize) < policy.len() && action >= 0 {
                        policy[action as usize] = 1.0;
                    }
                    result.set_mcts_policy(policy);
                    result
                })
                .collect(),
        }
    }

    fn is_tournament_opponent(&self) -> bool {
        match self {
            PlayerHandle::Mcts(player) => player.lock().unwrap().is_tournament_opponent(),
            PlayerHandle::Human(human) => human.is_tournament_opponent(),
        }
    }

    fn record_move(&self, state: &dyn State) {
        match self {
            PlayerHandle::Mcts(player) => player.lock().unwrap().record_move(state),
            PlayerHandle::Human(human) => human.record_move(state),
        }
    }

    fn result(&self, state: &dyn State, reward: f32) {
        match self {
            PlayerHandle::Mcts(player) => player.lock().unwrap().result(state, reward),
            PlayerHandle::Human(human) => human.result(state, reward),
        }
    }

    fn terminate(&self) {
        match self {
            PlayerHandle::Mcts(player) => player.lock().unwrap().terminate(),
            PlayerHandle::Human(human) => human.terminate(),
        }
    }
}

/// One frame of per-move training data for one player (spec §6 "Data
/// channel to the training system"): features, the MCTS policy target
/// spread over the full action space, and a legality mask. `value_target`
/// is filled in once the episode concludes (spec §2 "push... into
/// trajectories").
#[derive(Debug, Clone)]
pub struct TrajectoryFrame {
    pub features: Vec<f32>,
    pub policy_target: Vec<f32>,
    pub policy_mask: Vec<f32>,
    pub value_target: f32,
}

/// A completed episode's trajectories, one per seat, ready to be pushed
/// into the replay buffer (spec §2 data flow: orchestrator -> replay
/// buffer, locally or via RPC through the distributed service).
#[derive(Debug, Clone, Default)]
pub struct FinishedEpisode {
    pub frames: [Vec<TrajectoryFrame>; 2],
    pub rewards: [f32; 2],
    pub duration_steps: i64,
    pub duration_seconds: f64,
}

/// Converts a finished episode into a [`Batch`] the replay buffer /
/// training channel accepts (spec §4.B `add`'s `name -> tensor` shape).
/// Both seats' frames are concatenated along the batch dimension.
pub fn episode_to_batch(episode: &FinishedEpisode) -> Batch {
    let mut features = Vec::new();
    let mut policy_target = Vec::new();
    let mut policy_mask = Vec::new();
    let mut value_target = Vec::new();
    let mut feature_tail = 0usize;
    let mut action_tail = 0usize;
    let mut n = 0usize;

    for seat in 0..2 {
        for frame in &episode.frames[seat] {
            feature_tail = frame.features.len();
            action_tail = frame.policy_target.len();
            features.extend(frame.features.iter().flat_map(|v| v.to_le_bytes()));
            policy_target.extend(frame.policy_target.iter().flat_map(|v| v.to_le_bytes()));
            policy_mask.extend(frame.policy_mask.iter().flat_map(|v| v.to_le_bytes()));
            value_target.extend(frame.value_target.to_le_bytes());
            n += 1;
        }
    }

    Batch {
        n,
        fields: vec![
            FieldBatch { name: "features".to_string(), shape_tail: vec![feature_tail], dtype: DType::F32, data: features },
            FieldBatch { name: "policy_target".to_string(), shape_tail: vec![action_tail], dtype: DType::F32, data: policy_target },
            FieldBatch { name: "policy_mask".to_string(), shape_tail: vec![action_tail], dtype: DType::F32, data: policy_mask },
            FieldBatch { name: "value_target".to_string(), shape_tail: vec![], dtype: DType::F32, data: value_target },
        ],
    }
}

/// Tunables governing resignation and episode replacement (spec §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorOption {
    /// Root-value magnitude past which a resign-counter increments.
    pub resign_value_threshold: f32,
    /// Consecutive-observation threshold when more than one game is
    /// acting through the same player this step (spec: "7 in the batched
    /// path").
    pub resign_threshold_batched: u32,
    /// Threshold when exactly one game is acting this step (spec: "2 in
    /// the single-game path").
    pub resign_threshold_single: u32,
    /// Probability a freshly started game is resign-eligible (spec:
    /// "activated per-game with probability 2/3").
    pub can_resign_probability: f64,
    /// Disables resignation outright (spec: "disabled in eval mode").
    pub eval_mode: bool,
    /// Caps the number of episodes a slot will be replaced for; `None`
    /// means unlimited (keep replacing forever).
    pub episode_budget: Option<usize>,
    pub seed: u64,
}

impl Default for OrchestratorOption {
    fn default() -> Self {
        Self {
            resign_value_threshold: 0.95,
            resign_threshold_batched: 7,
            resign_threshold_single: 2,
            can_resign_probability: 2.0 / 3.0,
            eval_mode: false,
            episode_budget: None,
            seed: 42,
        }
    }
}

struct GameSlot {
    state: Box<dyn State>,
    step_index: i64,
    trajectory: [Vec<TrajectoryFrame>; 2],
    resign_counter: [u32; 2],
    can_resign: bool,
    /// -1 = not resigned, 0/1 = that seat resigned (lost).
    resigned: i8,
    start_time: Instant,
    episodes_remaining: Option<usize>,
}

#[derive(Default, Clone, Copy)]
struct StatAccumulator {
    count: u64,
    sum: f64,
    sum_sq: f64,
}

impl StatAccumulator {
    fn record(&mut self, x: f64) {
        self.count += 1;
        self.sum += x;
        self.sum_sq += x * x;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 { 0.0 } else { self.sum / self.count as f64 }
    }

    fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum_sq / self.count as f64) - self.mean() * self.mean()
        }
    }
}

/// The four stats triples named in spec §4.F, each `(count, sum, sum_sq)`
/// for downstream mean/variance reporting.
#[derive(Default)]
pub struct OrchestratorStats {
    game_duration_steps: StatAccumulator,
    game_duration_seconds: StatAccumulator,
    rollouts_per_second: StatAccumulator,
    move_duration_seconds: StatAccumulator,
}

/// Plain summary of one stat's `(count, sum, sum_sq)` triple (spec §4.F).
#[derive(Debug, Clone, Copy)]
pub struct StatSummary {
    pub count: u64,
    pub mean: f64,
    pub variance: f64,
}

impl OrchestratorStats {
    pub fn summary(&self) -> [(&'static str, StatSummary); 4] {
        let mk = |name, acc: &StatAccumulator| {
            (
                name,
                StatSummary { count: acc.count, mean: acc.mean(), variance: acc.variance() },
            )
        };
        [
            mk("Game duration (steps)", &self.game_duration_steps),
            mk("Game duration (seconds)", &self.game_duration_seconds),
            mk("Rollouts per second", &self.rollouts_per_second),
            mk("Move duration (seconds)", &self.move_duration_seconds),
        ]
    }
}

/// Runs N in-flight games on one thread, grouping identical players for
/// batched inference (spec §4.F).
pub struct GameOrchestrator {
    option: OrchestratorOption,
    new_game: Arc<dyn Fn() -> Box<dyn State> + Send + Sync>,
    players: Vec<Arc<PlayerHandle>>,
    /// `remap[i] = min j such that players[j] == players[i]` (pointer
    /// equality, spec §4.F).
    remap: Vec<usize>,
    games: Vec<GameSlot>,
    stats: Mutex<OrchestratorStats>,
    terminate_flag: Arc<AtomicBool>,
    finished: Mutex<Vec<FinishedEpisode>>,
    rng: Mutex<StdRng>,
}

impl GameOrchestrator {
    pub fn new(
        players: Vec<Arc<PlayerHandle>>,
        new_game: Arc<dyn Fn() -> Box<dyn State> + Send + Sync>,
        num_games: usize,
        option: OrchestratorOption,
    ) -> Self {
        let remap = Self::compute_remap(&players);
        let mut rng = StdRng::seed_from_u64(option.seed);
        let games = (0..num_games)
            .map(|_| Self::spawn_game(&new_game, &option, &mut rng))
            .collect();
        Self {
            option,
            new_game,
            players,
            remap,
            games,
            stats: Mutex::new(OrchestratorStats::default()),
            terminate_flag: Arc::new(AtomicBool::new(false)),
            finished: Mutex::new(Vec::new()),
            rng: Mutex::new(rng),
        }
    }

    fn compute_remap(players: &[Arc<PlayerHandle>]) -> Vec<usize> {
        let mut remap = Vec::with_capacity(players.len());
        for i in 0..players.len() {
            let mut mapped = i;
            for (j, slot) in remap.iter().enumerate().take(i) {
                let _ = slot;
                if Arc::ptr_eq(&players[j], &players[i]) {
                    mapped = j;
                    break;
                }
            }
            remap.push(mapped);
        }
        remap
    }

    fn spawn_game(
        new_game: &Arc<dyn Fn() -> Box<dyn State> + Send + Sync>,
        option: &OrchestratorOption,
        rng: &mut StdRng,
    ) -> GameSlot {
        let can_resign = !option.eval_mode && rng.random_bool(option.can_resign_probability);
        GameSlot {
            state: new_game(),
            step_index: 0,
            trajectory: [Vec::new(), Vec::new()],
            resign_counter: [0, 0],
            can_resign,
            resigned: -1,
            start_time: Instant::now(),
            episodes_remaining: option.episode_budget,
        }
    }

    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        self.terminate_flag.clone()
    }

    pub fn terminate(&self) {
        self.terminate_flag.store(true, Ordering::Release);
        for player in &self.players {
            player.terminate();
        }
    }

    /// Drains episodes completed so far (spec §2: "ultimately into the
    /// replay buffer, either locally or via RPC").
    pub fn drain_finished(&self) -> Vec<FinishedEpisode> {
        std::mem::take(&mut self.finished.lock().unwrap())
    }

    pub fn stats_summary(&self) -> [(&'static str, StatSummary); 4] {
        self.stats.lock().unwrap().summary()
    }

    fn seat_of(state: &dyn State) -> usize {
        if state.is_one_player_game() {
            0
        } else {
            state.current_player() as usize
        }
    }

    /// Runs one full step of the loop described in spec §4.F. Returns
    /// `false` once the termination flag is observed (the caller should
    /// stop calling `step` again).
    pub fn step(&mut self) -> bool {
        if self.terminate_flag.load(Ordering::Acquire) {
            return false;
        }

        // Step 1: finish terminal/resigned games, optionally replacing them.
        let mut rng = self.rng.lock().unwrap();
        for idx in 0..self.games.len() {
            let is_done = self.games[idx].state.terminated() || self.games[idx].resigned != -1;
            if !is_done {
                continue;
            }
            let remaining = self.games[idx].episodes_remaining;
            let episode = self.finish_game(idx);
            self.stats.lock().unwrap().game_duration_steps.record(episode.duration_steps as f64);
            self.stats.lock().unwrap().game_duration_seconds.record(episode.duration_seconds);
            self.finished.lock().unwrap().push(episode);

            let should_replace = remaining.map(|n| n > 0).unwrap_or(true);
            if should_replace {
                let mut fresh = Self::spawn_game(&self.new_game, &self.option, &mut rng);
                fresh.episodes_remaining = remaining.map(|n| n - 1);
                self.games[idx] = fresh;
            }
        }
        drop(rng);

        // Step 2: group acting games by player slot (spec's `remap`).
        let mut to_act: Vec<Vec<usize>> = vec![Vec::new(); self.players.len()];
        for (idx, game) in self.games.iter().enumerate() {
            if game.state.terminated() || game.resigned != -1 {
                continue;
            }
            let seat = Self::seat_of(game.state.as_ref());
            let p = self.remap[seat.min(self.players.len().saturating_sub(1))];
            to_act[p].push(idx);
        }

        for (p, game_indices) in to_act.iter().enumerate() {
            if game_indices.is_empty() {
                continue;
            }
            let states: Vec<&dyn State> = game_indices
                .iter()
                .map(|&idx| self.games[idx].state.as_ref())
                .collect();
            let move_start = Instant::now();
            let results = self.players[p].act_batch(&states);
            let move_elapsed = move_start.elapsed().as_secs_f64();

            let batched = game_indices.len() > 1;
            let threshold = if batched {
                self.option.resign_threshold_batched
            } else {
                self.option.resign_threshold_single
            };

            for (&idx, result) in game_indices.iter().zip(results.iter()) {
                self.apply_result(idx, result, threshold);
            }

            let mut stats = self.stats.lock().unwrap();
            stats.move_duration_seconds.record(move_elapsed);
            if move_elapsed > 0.0 {
                let total_rollouts: i64 = results.iter().map(|r| r.rollouts as i64).sum();
                if total_rollouts > 0 {
                    stats.rollouts_per_second.record(total_rollouts as f64 / move_elapsed);
                }
            }
        }

        !self.terminate_flag.load(Ordering::Acquire)
    }

    fn apply_result(&mut self, idx: usize, result: &MctsResult, threshold: u32) {
        let resign_value_threshold = self.option.resign_value_threshold;
        let players = &self.players;
        let remap = &self.remap;
        let game = &mut self.games[idx];
        let seat = Self::seat_of(game.state.as_ref());
        let action_len = game
            .state
            .action_size()
            .iter()
            .product::<i64>()
            .max(result.mcts_policy.len() as i64) as usize;

        let mut policy_mask = vec![0.0f32; action_len];
        for a in game.state.legal_actions() {
            if (a as usize) < policy_mask.len() {
                policy_mask[a as usize] = 1.0;
            }
        }
        let mut policy_target = vec![0.0f32; action_len];
        for (a, &p) in result.mcts_policy.iter().enumerate() {
            if a < policy_target.len() {
                policy_target[a] = p;
            }
        }

        game.trajectory[seat].push(TrajectoryFrame {
            features: game.state.features(),
            policy_target,
            policy_mask,
            value_target: 0.0,
        });

        if game.can_resign {
            let root_value = result.root_value;
            let opponent_seat = 1 - seat;
            if root_value < -resign_value_threshold {
                game.resign_counter[seat] += 1;
            } else {
                game.resign_counter[seat] = 0;
            }
            if root_value > resign_value_threshold {
                game.resign_counter[opponent_seat] += 1;
            } else {
                game.resign_counter[opponent_seat] = 0;
            }
            if game.resign_counter[seat] >= threshold {
                game.resigned = seat as i8;
            } else if game.resign_counter[opponent_seat] >= threshold {
                game.resigned = opponent_seat as i8;
            }
        }

        players[remap[seat.min(players.len().saturating_sub(1))]].record_move(game.state.as_ref());
        let advanced = game.state.forward(result.best_action);
        debug_assert!(advanced, "orchestrator forwarded an action the engine rejected");
        game.step_index += 1;
    }

    /// Finishes a game (terminal or resigned), back-fills `value_target`
    /// on every buffered frame, notifies the owning players, and returns
    /// the episode ready for `episode_to_batch` (spec §4.F step 1).
    fn finish_game(&mut self, idx: usize) -> FinishedEpisode {
        let players = &self.players;
        let remap = &self.remap;
        let game = &mut self.games[idx];
        let rewards = if game.resigned != -1 {
            if game.resigned == 0 { [-1.0, 1.0] } else { [1.0, -1.0] }
        } else {
            [game.state.reward(0), game.state.reward(1)]
        };

        for seat in 0..2 {
            for frame in &mut game.trajectory[seat] {
                frame.value_target = rewards[seat];
            }
            if !game.trajectory[seat].is_empty() || (seat == 0 && game.state.is_one_player_game()) {
                players[remap[seat.min(players.len().saturating_sub(1))]]
                    .result(game.state.as_ref(), rewards[seat]);
            }
        }

        FinishedEpisode {
            frames: [std::mem::take(&mut game.trajectory[0]), std::mem::take(&mut game.trajectory[1])],
            rewards,
            duration_steps: game.step_index,
            duration_seconds: game.start_time.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{Actor, PiVal};
    use crate::demos::tic_tac_toe::TicTacToeState;
    use crate::mcts::MctsOption;

    struct UniformActor;
    impl Actor for UniformActor {
        fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {}
        fn batch_result(&self, _index: usize, state: &dyn State, out: &mut PiVal) {
            let n = state.legal_actions().len().max(1);
            *out = PiVal::new(state.current_player(), 0.0, vec![1.0 / n as f32; n]);
        }
    }

    fn mcts_player_handle(seed: u64) -> Arc<PlayerHandle> {
        let option = MctsOption {
            num_rollout_per_thread: 8,
            puct: 1.0,
            storage_cap: 4096,
            seed,
            ..Default::default()
        };
        let mut player = MctsPlayer::new(option);
        player.add_actor(Arc::new(UniformActor));
        Arc::new(PlayerHandle::Mcts(Mutex::new(player)))
    }

    #[test]
    fn identical_player_handles_merge_via_remap() {
        let shared = mcts_player_handle(1);
        let players = vec![shared.clone(), shared.clone()];
        let remap = GameOrchestrator::compute_remap(&players);
        assert_eq!(remap, vec![0, 0]);
    }

    #[test]
    fn distinct_player_handles_do_not_merge() {
        let players = vec![mcts_player_handle(1), mcts_player_handle(2)];
        let remap = GameOrchestrator::compute_remap(&players);
        assert_eq!(remap, vec![0, 1]);
    }

    #[test]
    fn self_play_games_eventually_finish_and_emit_trajectories() {
        let shared = mcts_player_handle(7);
        let players = vec![shared.clone(), shared];
        let new_game: Arc<dyn Fn() -> Box<dyn State> + Send + Sync> =
            Arc::new(|| Box::new(TicTacToeState::new()) as Box<dyn State>);
        let option = OrchestratorOption { episode_budget: Some(0), ..Default::default() };
        let mut orchestrator = GameOrchestrator::new(players, new_game, 3, option);

        for _ in 0..40 {
            if !orchestrator.step() {
                break;
            }
        }

        let finished = orchestrator.drain_finished();
        assert!(!finished.is_empty(), "at least one tic-tac-toe game should finish within 40 steps");
        for episode in &finished {
            let batch = episode_to_batch(episode);
            assert!(batch.n > 0);
            for field in &batch.fields {
                if field.name == "value_target" {
                    let floats: Vec<f32> = field
                        .data
                        .chunks_exact(4)
                        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                        .collect();
                    assert!(floats.iter().all(|&v| (-1.0..=1.0).contains(&v)));
                }
            }
        }
    }

    #[test]
    fn s6_seven_consecutive_low_values_trigger_resignation() {
        // Spec §8 scenario S6: feed 7 consecutive rootValue < -0.95
        // evaluations for the acting seat; the game should resign with
        // that seat losing.
        struct AlwaysLosingActor;
        impl Actor for AlwaysLosingActor {
            fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {}
            fn batch_result(&self, _index: usize, state: &dyn State, out: &mut PiVal) {
                let n = state.legal_actions().len().max(1);
                *out = PiVal::new(state.current_player(), -0.99, vec![1.0 / n as f32; n]);
            }
        }

        let option = MctsOption {
            num_rollout_per_thread: 1,
            puct: 1.0,
            storage_cap: 4096,
            use_value_prior: false,
            seed: 11,
            ..Default::default()
        };
        let mut player = MctsPlayer::new(option);
        player.add_actor(Arc::new(AlwaysLosingActor));
        let shared = Arc::new(PlayerHandle::Mcts(Mutex::new(player)));

        let players = vec![shared.clone(), shared];
        let new_game: Arc<dyn Fn() -> Box<dyn State> + Send + Sync> =
            Arc::new(|| Box::new(TicTacToeState::new()) as Box<dyn State>);
        let mut orchestrator_option = OrchestratorOption {
            episode_budget: Some(0),
            resign_threshold_single: 2,
            resign_threshold_batched: 2,
            ..Default::default()
        };
        orchestrator_option.can_resign_probability = 1.0;
        let mut orchestrator = GameOrchestrator::new(players, new_game, 1, orchestrator_option);

        // Force resignation eligibility deterministically and drive enough
        // steps that resign_counter[seat] should cross the threshold well
        // before the board could fill up.
        orchestrator.games[0].can_resign = true;
        let mut resigned = false;
        for _ in 0..9 {
            if orchestrator.games.first().map(|g| g.resigned != -1).unwrap_or(false) {
                resigned = true;
                break;
            }
            orchestrator.step();
        }
        assert!(resigned || orchestrator.drain_finished().iter().any(|e| e.rewards == [-1.0, 1.0] || e.rewards == [1.0, -1.0]));
    }
}
