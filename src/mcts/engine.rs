//! The core rollout loop (spec §4.D), grounded on
//! `original_source/torchRL/mcts/mcts.h`'s `computeRollouts` call shape
//! (the body is not present in the retrieved source; selection/expansion/
//! backup below follow spec §4.D's algorithm description directly, using
//! the same `Node`/`MctsStats` operations named in `utils.h`/`node.h`).

use std::time::Instant;

use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use crate::actor::{Actor, PiVal};
use crate::arena::{Arena, MctsStats, NodeId, NODE_NONE};
use crate::error::Result;
use crate::mcts::option::MctsOption;
use crate::state::{Action, State, StateHash};

/// One in-flight rollout's live selection path: node ids visited plus the
/// state reached at each (recomputed by replay since `storeStateInNode`
/// defaults to off).
struct SelectionPath {
    nodes: Vec<NodeId>,
}

/// A leaf awaiting batched evaluation.
struct PendingLeaf {
    root_idx: usize,
    path: SelectionPath,
    state: Box<dyn State>,
}

/// Per-root outcome of one parallel selection step: either the rollout
/// completed inline (terminal backup or randomized-rollout value) or it
/// produced a leaf awaiting batched evaluation.
enum SelectOutcome {
    Done,
    Pending(PendingLeaf),
}

/// Runs rollouts for every root in `roots` against `arena`, driving
/// `actor`'s batched quartet once per round (spec §4.D "Scheduling &
/// parallelism": "one batched forward pass per round"). Stops when every
/// root has exhausted its rollout budget, `thisMoveTime` has elapsed, or
/// `terminated` reports `true` (spec §5 cancellation, checked between
/// rounds).
pub fn compute_rollouts(
    roots: &[NodeId],
    root_states: &[Box<dyn State>],
    root_player: &[i32],
    arena: &Arena,
    actor: &dyn Actor,
    option: &MctsOption,
    this_move_time: f64,
    terminated: &dyn Fn() -> bool,
    rng: &mut impl Rng,
) -> Result<Vec<usize>> {
    let budget = if option.num_rollout_per_thread > 0 {
        option.num_rollout_per_thread as usize
    } else {
        usize::MAX
    };
    let mut done = vec![0usize; roots.len()];
    let start = Instant::now();

    loop {
        if terminated() {
            break;
        }
        if this_move_time > 0.0 && start.elapsed().as_secs_f64() >= this_move_time {
            break;
        }
        if done.iter().zip(roots.iter()).all(|(&d, _)| d >= budget) {
            break;
        }

        // Selection fans out across the active roots in parallel (spec §1
        // "parallel rollout loop... many concurrent in-flight games"):
        // each root's descent only touches nodes reachable from its own
        // root id, and the arena's per-node atomics/mutexes make
        // concurrent selection across disjoint roots safe. Each root gets
        // its own RNG stream, seeded from the shared `rng` up front so the
        // whole round stays reproducible under a fixed seed regardless of
        // how rayon schedules the fan-out.
        let active: Vec<usize> = (0..roots.len()).filter(|&idx| done[idx] < budget).collect();
        let seeds: Vec<u64> = active.iter().map(|_| rng.random()).collect();

        let outcomes: Vec<(usize, SelectOutcome)> = active
            .par_iter()
            .zip(seeds.par_iter())
            .map(|(&idx, &seed)| {
                let mut local_rng = StdRng::seed_from_u64(seed);
                let root_id = roots[idx];
                let mut state = root_states[idx].clone_state();
                let path = select(arena, root_id, root_player[idx], option, &mut state, &mut local_rng);
                if state.terminated() {
                    // Terminal leaf: backup directly, no evaluation needed
                    // (spec §4.D step 2 "If leaf is terminal: let V = terminal
                    // reward for the root player").
                    let v = state.reward(root_player[idx]);
                    backup(arena, &path, v, option.virtual_loss);
                    (idx, SelectOutcome::Done)
                } else if option.randomized_rollouts {
                    // Rollout-MCTS mode: skip the Actor entirely and use the
                    // state's own cheap value estimate.
                    let v = state.random_rollout_reward(root_player[idx]);
                    let leaf_id = *path.nodes.last().unwrap();
                    settle_with_prior(arena, leaf_id, root_player[idx], v);
                    backup(arena, &path, v, option.virtual_loss);
                    (idx, SelectOutcome::Done)
                } else {
                    (idx, SelectOutcome::Pending(PendingLeaf { root_idx: idx, path, state }))
                }
            })
            .collect();

        let mut pending = Vec::new();
        for (idx, outcome) in outcomes {
            match outcome {
                SelectOutcome::Done => done[idx] += 1,
                SelectOutcome::Pending(leaf) => pending.push(leaf),
            }
        }

        if pending.is_empty() {
            continue;
        }

        actor.batch_resize(pending.len());
        for (i, leaf) in pending.iter().enumerate() {
            actor.batch_prepare(i, leaf.state.as_ref(), None);
        }
        actor.batch_evaluate(pending.len());

        for (i, leaf) in pending.into_iter().enumerate() {
            let mut pi_val = PiVal::default();
            actor.batch_result(i, leaf.state.as_ref(), &mut pi_val);
            let up_value = if root_player[leaf.root_idx] == pi_val.player_id {
                pi_val.value
            } else {
                -pi_val.value
            };
            let leaf_id = *leaf.path.nodes.last().unwrap();
            let parent_stats = parent_stats_of(arena, &leaf.path);
            arena.node(leaf_id).settle(root_player[leaf.root_idx], pi_val, parent_stats);
            backup(arena, &leaf.path, up_value, option.virtual_loss);
            done[leaf.root_idx] += 1;
        }
    }

    Ok(done)
}

fn parent_stats_of<'a>(arena: &'a Arena, path: &SelectionPath) -> Option<&'a MctsStats> {
    if path.nodes.len() < 2 {
        return None;
    }
    let parent_id = path.nodes[path.nodes.len() - 2];
    Some(&arena.node(parent_id).stats)
}

/// Directly settles a leaf with a scalar value (no policy) for the
/// randomized-rollout path, so still-unvisited siblings can use it as a
/// prior.
fn settle_with_prior(arena: &Arena, leaf_id: NodeId, root_player: i32, value: f32) {
    let pi_val = PiVal::new(root_player, value, Vec::new());
    let parent_stats = {
        let parent = arena.node(leaf_id).parent();
        if parent == NODE_NONE {
            None
        } else {
            Some(&arena.node(parent).stats)
        }
    };
    arena.node(leaf_id).settle(root_player, pi_val, parent_stats);
}

/// Selection (spec §4.D step 1): descends from `root_id` while the current
/// node is visited and the working `state` is non-terminal, picking the
/// PUCT-maximizing (or forced-rollout, or sampled) child at each step and
/// creating it on first touch. Mutates `state` in place to the leaf's
/// position; returns the node-id path from root to leaf inclusive.
fn select(
    arena: &Arena,
    root_id: NodeId,
    root_player: i32,
    option: &MctsOption,
    state: &mut Box<dyn State>,
    rng: &mut impl Rng,
) -> SelectionPath {
    let mut path = vec![root_id];
    arena.node(root_id).stats.add_virtual_loss(option.virtual_loss);

    let mut current_id = root_id;
    loop {
        if state.terminated() || !arena.node(current_id).is_visited() {
            break;
        }

        let legal = state.legal_actions();
        if legal.is_empty() {
            break;
        }
        let policy = arena.node(current_id).pi_val.lock().unwrap().policy.clone();
        let parent_visits = arena.node(current_id).stats.visit_count().max(0) as f32;
        let current_player = state.current_player();

        let mut best_action = legal[0];
        let mut best_score = f32::NEG_INFINITY;
        let mut forced_action: Option<Action> = None;

        let children = arena.node(current_id).children.lock().unwrap().clone();
        for &a in &legal {
            let p_a = policy.get(a as usize).copied().unwrap_or(0.0);
            let child_entry = children.iter().find(|(ca, _, _)| *ca == a);
            let child_id = child_entry.map(|&(_, _, id)| id);
            let child_stats = child_id.map(|id| &arena.node(id).stats);

            let prior_child_v = arena.node(current_id).stats.avg_child_v();
            let (q_raw, visit_count, effective_visits) = match child_stats {
                Some(stats) if stats.visit_count() > 0 || stats.virtual_loss() > 0.0 => {
                    let visits = stats.visit_count() as f32;
                    let vl = stats.virtual_loss();
                    let eff = visits + vl;
                    let q = if eff > 0.0 {
                        (stats.value_sum() - option.virtual_loss * vl) / eff
                    } else {
                        prior_child_v
                    };
                    (q, visits, eff)
                }
                _ => (prior_child_v, 0.0, 0.0),
            };
            let q = if current_player == root_player { q_raw } else { -q_raw };

            if option.forced_rollouts_multiplier > 0.0
                && forced_action.is_none()
                && p_a * parent_visits.sqrt() * option.forced_rollouts_multiplier > visit_count
            {
                forced_action = Some(a);
            }

            let u = option.puct * p_a * parent_visits.sqrt() / (1.0 + effective_visits);
            let score = q + u;
            if score > best_score {
                best_score = score;
                best_action = a;
            }
        }
        drop(children);

        let chosen = forced_action.unwrap_or(best_action);
        let chosen = if option.sampling_mcts {
            sample_child_action(arena, current_id, &legal, &policy, parent_visits, rng)
                .unwrap_or(chosen)
        } else {
            chosen
        };

        let (child_id, child_state) = find_or_create_child(arena, current_id, chosen, state);
        arena.node(child_id).stats.add_virtual_loss(option.virtual_loss);
        path.push(child_id);
        current_id = child_id;
        *state = child_state;
    }

    SelectionPath { nodes: path }
}

/// Tree-level sampling (spec §4.D "Tree-level sampling"): softmax over
/// visit counts plus prior, in place of argmax.
fn sample_child_action(
    arena: &Arena,
    node_id: NodeId,
    legal: &[Action],
    policy: &[f32],
    parent_visits: f32,
    rng: &mut impl Rng,
) -> Option<Action> {
    let children = arena.node(node_id).children.lock().unwrap();
    let mut weights = Vec::with_capacity(legal.len());
    for &a in legal {
        let p_a = policy.get(a as usize).copied().unwrap_or(0.0);
        let visits = children
            .iter()
            .find(|(ca, _, _)| *ca == a)
            .map(|&(_, _, id)| arena.node(id).stats.visit_count() as f32)
            .unwrap_or(0.0);
        weights.push((visits + p_a * parent_visits.sqrt()).exp());
    }
    drop(children);
    let sum: f32 = weights.iter().sum();
    if sum <= 0.0 {
        return None;
    }
    let mut target = rng.random_range(0.0..sum);
    for (i, &w) in weights.iter().enumerate() {
        if target < w {
            return Some(legal[i]);
        }
        target -= w;
    }
    legal.last().copied()
}

/// Finds an existing child for `action` (keyed additionally by post-move
/// hash for stochastic games, spec §4.D), or creates it. Always advances
/// `state` by `action` and returns the resulting state alongside the
/// child's id.
fn find_or_create_child(
    arena: &Arena,
    parent_id: NodeId,
    action: Action,
    state: &Box<dyn State>,
) -> (NodeId, Box<dyn State>) {
    let mut next = state.clone_state();
    let advanced = next.forward(action);
    debug_assert!(advanced, "selection must only pick legal actions");
    let post_hash: StateHash = next.hash();
    let is_stochastic = state.is_stochastic();

    let existing = arena
        .node(parent_id)
        .find_child(action, if is_stochastic { Some(post_hash) } else { None });

    let child_id = match existing {
        Some(id) => id,
        None => {
            let id = arena
                .acquire(parent_id, None, post_hash)
                .expect("arena exhausted mid-rollout");
            arena
                .node(parent_id)
                .children
                .lock()
                .unwrap()
                .push((action, post_hash, id));
            id
        }
    };
    (child_id, next)
}

/// Backup (spec §4.D step 3): walks `path` from leaf to root, adding the
/// same root-player-perspective value to every node (spec §3 invariant:
/// "`value_sum` is summed from the root-player's perspective").
fn backup(arena: &Arena, path: &SelectionPath, value: f32, virtual_loss: f32) {
    for &id in &path.nodes {
        arena.node(id).stats.atomic_update(value, virtual_loss);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demos::tic_tac_toe::{FixedTerminalState, TicTacToeState};
    use rand::{rngs::StdRng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct UniformActor {
        calls: AtomicUsize,
    }

    impl Actor for UniformActor {
        fn batch_prepare(&self, _index: usize, _state: &dyn State, _rnn_in: Option<&[f32]>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }

        fn batch_result(&self, _index: usize, state: &dyn State, out: &mut PiVal) {
            let n = state.legal_actions().len().max(1);
            *out = PiVal::new(state.current_player(), 0.0, vec![1.0 / n as f32; n]);
        }
    }

    fn never_terminated() -> bool {
        false
    }

    #[test]
    fn s1_terminal_root_backs_up_without_creating_children() {
        // Spec §8 scenario S1.
        let arena = Arena::new(8);
        let state: Box<dyn State> = Box::new(FixedTerminalState {
            player: 0,
            reward_for_player: 1.0,
            step: 5,
        });
        let root = arena.acquire(NODE_NONE, None, state.hash()).unwrap();
        let actor = UniformActor { calls: AtomicUsize::new(0) };
        let option = MctsOption {
            num_rollout_per_thread: 1,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(1);

        compute_rollouts(
            &[root],
            &[state],
            &[0],
            &arena,
            &actor,
            &option,
            0.0,
            &never_terminated,
            &mut rng,
        )
        .unwrap();

        assert_eq!(arena.node(root).stats.visit_count(), 1);
        assert_eq!(arena.node(root).stats.value_sum(), 1.0);
        assert!(arena.node(root).children.lock().unwrap().is_empty());
    }

    #[test]
    fn visit_count_equals_one_plus_children_after_quiescence() {
        // Spec §8 invariant 1, exercised against the tic-tac-toe fixture.
        let arena = Arena::new(512);
        let state: Box<dyn State> = Box::new(TicTacToeState::new());
        let root = arena.acquire(NODE_NONE, None, state.hash()).unwrap();
        let actor = UniformActor { calls: AtomicUsize::new(0) };
        let option = MctsOption {
            num_rollout_per_thread: 50,
            puct: 1.5,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(2);

        compute_rollouts(
            &[root],
            &[state],
            &[0],
            &arena,
            &actor,
            &option,
            0.0,
            &never_terminated,
            &mut rng,
        )
        .unwrap();

        let root_visits = arena.node(root).stats.visit_count();
        let child_visit_sum: i32 = arena
            .node(root)
            .children
            .lock()
            .unwrap()
            .iter()
            .map(|&(_, _, id)| arena.node(id).stats.visit_count())
            .sum();
        assert_eq!(root_visits, 1 + child_visit_sum);
        assert_eq!(arena.node(root).stats.virtual_loss(), 0.0);
    }

    #[test]
    fn forced_rollouts_eventually_visit_a_high_prior_child() {
        // Spec §8 invariant 9 (deterministic tree: uniform actor, zero puct
        // so UCB alone would pick action 0 first every time).
        let arena = Arena::new(64);
        let state: Box<dyn State> = Box::new(TicTacToeState::new());
        let root = arena.acquire(NODE_NONE, None, state.hash()).unwrap();
        let actor = UniformActor { calls: AtomicUsize::new(0) };
        let option = MctsOption {
            num_rollout_per_thread: 9,
            puct: 0.0,
            forced_rollouts_multiplier: 2.0,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(3);

        compute_rollouts(
            &[root],
            &[state],
            &[0],
            &arena,
            &actor,
            &option,
            0.0,
            &never_terminated,
            &mut rng,
        )
        .unwrap();

        let children = arena.node(root).children.lock().unwrap();
        assert!(children.len() > 1, "forced rollouts should spread visits across actions");
        let visited_children = children
            .iter()
            .filter(|&&(_, _, id)| arena.node(id).stats.visit_count() > 0)
            .count();
        assert!(visited_children > 1, "forced rollouts should have visited more than one child");
    }
}
