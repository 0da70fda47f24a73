//! Minimal binary exercising the full self-play loop end to end (spec
//! §4.D-F): `num_games` tic-tac-toe games run in parallel on one thread,
//! sharing one `MctsPlayer` for both seats, until `num_steps` orchestrator
//! steps elapse, then reports orchestrator stats.

use std::sync::{Arc, Mutex};

use alphazero_core::demos::tic_tac_toe::TicTacToeState;
use alphazero_core::logging;
use alphazero_core::mcts::{MctsOption, MctsPlayer};
use alphazero_core::orchestrator::{GameOrchestrator, OrchestratorOption, PlayerHandle};
use alphazero_core::state::State;
use alphazero_core::{Actor, PiVal};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "selfplay-demo")]
struct Config {
    /// Number of in-flight games sharing the one MCTS player.
    #[arg(short = 'g', long, default_value_t = 8)]
    num_games: usize,

    /// Number of orchestrator steps to run.
    #[arg(short = 's', long, default_value_t = 200)]
    num_steps: usize,

    /// Rollouts per move.
    #[arg(long, default_value_t = 64)]
    rollouts: i64,
}

/// A uniform-policy, zero-value stand-in for a trained network: enough to
/// exercise the tree search without the neural architecture this crate
/// deliberately leaves out of scope.
struct UniformActor;

impl Actor for UniformActor {
    fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {}

    fn batch_result(&self, _index: usize, state: &dyn State, out: &mut PiVal) {
        let n = state.legal_actions().len().max(1);
        *out = PiVal::new(state.current_player(), 0.0, vec![1.0 / n as f32; n]);
    }
}

fn main() {
    logging::setup_logging_stderr();
    let config = Config::parse();

    let option = MctsOption { num_rollout_per_thread: config.rollouts, puct: 1.5, ..Default::default() };
    let mut player = MctsPlayer::new(option);
    player.add_actor(Arc::new(UniformActor));
    let shared = Arc::new(PlayerHandle::Mcts(Mutex::new(player)));

    let players = vec![shared.clone(), shared];
    let new_game: Arc<dyn Fn() -> Box<dyn State> + Send + Sync> =
        Arc::new(|| Box::new(TicTacToeState::new()) as Box<dyn State>);
    let mut orchestrator =
        GameOrchestrator::new(players, new_game, config.num_games, OrchestratorOption::default());

    for _ in 0..config.num_steps {
        if !orchestrator.step() {
            break;
        }
    }

    let finished = orchestrator.drain_finished();
    log::info!("{} episodes finished", finished.len());
    for (name, summary) in orchestrator.stats_summary() {
        log::info!("{name}: mean={:.4} variance={:.4} n={}", summary.mean, summary.variance, summary.count);
    }
}
