//! Arena-allocated MCTS tree storage (spec §3 "Storage", §4.A).
//!
//! Nodes are addressed by integer index rather than raw pointer (Design
//! Note §9: "kills lifetime complexity, makes `freeTree` a linear sweep"),
//! grounded on `original_source/torchRL/mcts/node.h` and `src/mcts/node.h`'s
//! `Storage`/`acquire`/`release`/`freeTree` split.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::actor::PiVal;
use crate::error::{CoreError, Result};
use crate::state::{Action, State, StateHash};

/// Index into the arena. `NONE` marks a null back-pointer/child slot.
pub type NodeId = u32;

/// Sentinel for "no node" (root's parent, an unexpanded child slot).
pub const NODE_NONE: NodeId = u32::MAX;

/// The five-field stats block named in spec §3 ("stats") and
/// `original_source/torchRL/mcts/utils.h`'s `MctsStats`.
///
/// Values that participate in concurrent rollouts (`value_sum`,
/// `visit_count`, `virtual_loss`) are plain `Mutex`-free atomics updated via
/// the `atomic_*` methods named in the original; `sum_child_v`/
/// `num_child_explored` are updated exactly once per completed rollout
/// reaching the owning node's *parent*, so a `Mutex` is unnecessary overkill
/// there too -- we still route them through atomics for uniformity.
#[derive(Debug, Default)]
pub struct MctsStats {
    value_sum: AtomicAccumulator,
    visit_count: AtomicI32,
    virtual_loss: AtomicAccumulator,
    sum_child_v: AtomicAccumulator,
    num_child_explored: AtomicI32,
}

/// `f32` accumulator implemented on top of `AtomicU64`'s bit pattern, since
/// `std::sync::atomic` has no stable `AtomicF32`. Reads/writes are CAS
/// loops, which is fine: MCTS backup contention is low relative to
/// selection-path reads.
#[derive(Debug, Default)]
struct AtomicAccumulator(AtomicU64);

impl AtomicAccumulator {
    fn load(&self) -> f32 {
        f64::from_bits(self.0.load(Ordering::Acquire)) as f32
    }

    fn add(&self, delta: f32) {
        let mut cur = self.0.load(Ordering::Acquire);
        loop {
            let next = (f64::from_bits(cur) + delta as f64).to_bits();
            match self
                .0
                .compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    fn reset(&self) {
        self.0.store(0.0f64.to_bits(), Ordering::Release);
    }
}

impl MctsStats {
    pub fn reset(&self) {
        self.value_sum.reset();
        self.visit_count.store(0, Ordering::Release);
        self.virtual_loss.reset();
        self.sum_child_v.reset();
        self.num_child_explored.store(0, Ordering::Release);
    }

    pub fn value_sum(&self) -> f32 {
        self.value_sum.load()
    }

    pub fn visit_count(&self) -> i32 {
        self.visit_count.load(Ordering::Acquire)
    }

    pub fn virtual_loss(&self) -> f32 {
        self.virtual_loss.load()
    }

    /// Prior for an unvisited child: the mean of siblings' observed value
    /// (`sum_child_v / num_child_explored`), or `0` if none explored yet.
    pub fn avg_child_v(&self) -> f32 {
        let n = self.num_child_explored.load(Ordering::Acquire);
        if n == 0 {
            0.0
        } else {
            self.sum_child_v.load() / n as f32
        }
    }

    /// Mean value from this node's own visits (`rootValue` when called on
    /// the root, spec §4.D "Move selection").
    pub fn avg_value(&self) -> f32 {
        let n = self.visit_count.load(Ordering::Acquire);
        if n == 0 {
            0.0
        } else {
            self.value_sum.load() / n as f32
        }
    }

    pub fn add_virtual_loss(&self, virtual_loss: f32) {
        self.virtual_loss.add(virtual_loss);
    }

    /// Backup step: `value_sum += value`, `visit_count += 1`,
    /// `virtual_loss -= virtual_loss` (spec §4.D step 3).
    pub fn atomic_update(&self, value: f32, virtual_loss: f32) {
        self.value_sum.add(value);
        self.visit_count.fetch_add(1, Ordering::AcqRel);
        self.virtual_loss.add(-virtual_loss);
    }

    /// Called on a parent once its child settles (spec §4.D step 2,
    /// `settle`): accumulates the child's observed value as a prior for
    /// still-unvisited siblings.
    pub fn atomic_update_child_v(&self, child_v: f32) {
        self.sum_child_v.add(child_v);
        self.num_child_explored.fetch_add(1, Ordering::AcqRel);
    }
}

/// Arena element (spec §3 "Node").
///
/// `children` is a `Vec<(Action, NodeId)>` rather than a map: the original
/// source represents it the same way (`vector<pair<Action, Node*>>`), and a
/// stochastic game may map one action to several children keyed by
/// post-move hash (spec §4.D), so a linear scan over the small per-node
/// child list plus a hash comparison is simpler than a nested map.
pub struct Node {
    parent: AtomicU32,
    state_hash: AtomicU64,
    /// Populated only at `storeStateInterval` depth (spec §3) to save
    /// memory; `None` means "recompute by replaying from an ancestor that
    /// does store it".
    state: Mutex<Option<Box<dyn State>>>,
    pub visited: AtomicBool,
    pub pi_val: Mutex<PiVal>,
    pub children: Mutex<Vec<(Action, StateHash, NodeId)>>,
    pub stats: MctsStats,
}

impl Node {
    fn empty() -> Self {
        Self {
            parent: AtomicU32::new(NODE_NONE),
            state_hash: AtomicU64::new(0),
            state: Mutex::new(None),
            visited: AtomicBool::new(false),
            pi_val: Mutex::new(PiVal::default()),
            children: Mutex::new(Vec::new()),
            stats: MctsStats::default(),
        }
    }

    /// Resets a recycled node for reuse in a new tree (spec §4.A `init`).
    /// Only ever called on a node just popped off the arena's free list, so
    /// there is no concurrent reader to race with.
    pub fn init(&self, parent: NodeId, state: Option<Box<dyn State>>, state_hash: StateHash) {
        self.parent.store(parent, Ordering::Release);
        self.state_hash.store(state_hash, Ordering::Release);
        *self.state.lock().unwrap() = state;
        self.visited.store(false, Ordering::Release);
        *self.pi_val.lock().unwrap() = PiVal::default();
        self.children.lock().unwrap().clear();
        self.stats.reset();
    }

    pub fn parent(&self) -> NodeId {
        self.parent.load(Ordering::Acquire)
    }

    pub fn state_hash(&self) -> StateHash {
        self.state_hash.load(Ordering::Acquire)
    }

    pub fn has_state(&self) -> bool {
        self.state.lock().unwrap().is_some()
    }

    pub fn with_state<R>(&self, f: impl FnOnce(Option<&dyn State>) -> R) -> R {
        let guard = self.state.lock().unwrap();
        f(guard.as_deref())
    }

    pub fn set_state(&self, state: Option<Box<dyn State>>) {
        *self.state.lock().unwrap() = state;
    }

    pub fn is_visited(&self) -> bool {
        self.visited.load(Ordering::Acquire)
    }

    /// Marks the node visited and, if it has a parent, folds this node's
    /// signed value into the parent's child-value-prior accumulator
    /// (spec §4.D step 2 `settle`).
    pub fn settle(&self, root_player_id: i32, pi_val: PiVal, parent_stats: Option<&MctsStats>) {
        if let Some(stats) = parent_stats {
            let up_value = if root_player_id == pi_val.player_id {
                pi_val.value
            } else {
                -pi_val.value
            };
            stats.atomic_update_child_v(up_value);
        }
        *self.pi_val.lock().unwrap() = pi_val;
        self.visited.store(true, Ordering::Release);
    }

    pub fn find_child(&self, action: Action, post_hash: Option<StateHash>) -> Option<NodeId> {
        let children = self.children.lock().unwrap();
        children
            .iter()
            .find(|(a, h, _)| *a == action && post_hash.map_or(true, |ph| *h == ph))
            .map(|(_, _, id)| *id)
    }
}

/// Wait-free-in-the-common-path node pool (spec §4.A).
///
/// `acquire` pops from a lock-protected free list; growth on exhaustion is
/// explicit (`grow`) rather than automatic, since the spec treats capacity
/// exhaustion as `FatalConfig` by default.
pub struct Arena {
    nodes: Vec<Node>,
    free_list: Mutex<Vec<NodeId>>,
    capacity: usize,
}

impl Arena {
    pub fn new(capacity: usize) -> Self {
        let mut nodes = Vec::with_capacity(capacity);
        let mut free_list = Vec::with_capacity(capacity);
        for i in 0..capacity {
            nodes.push(Node::empty());
            free_list.push(i as NodeId);
        }
        // LIFO reuse pattern mirrors the original's storage freelist.
        free_list.reverse();
        Self {
            nodes,
            free_list: Mutex::new(free_list),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Acquires a free node, initializing it in place. Errs with
    /// [`CoreError::ArenaExhausted`] when the free list is empty -- callers
    /// that want the "if empty, grow" behavior (spec §4.A) should call
    /// [`Arena::grow`] explicitly first.
    pub fn acquire(
        &self,
        parent: NodeId,
        state: Option<Box<dyn State>>,
        state_hash: StateHash,
    ) -> Result<NodeId> {
        let id = {
            let mut free = self.free_list.lock().unwrap();
            free.pop()
                .ok_or(CoreError::ArenaExhausted { capacity: self.capacity })?
        };
        self.node(id).init(parent, state, state_hash);
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id as usize]
    }

    pub fn release(&self, id: NodeId) {
        self.free_list.lock().unwrap().push(id);
    }

    /// Walks the tree rooted at `root`, releasing every reachable node
    /// (spec §4.A `freeTree`). Linear in tree size thanks to the
    /// integer-index representation (Design Note §9).
    pub fn free_tree(&self, root: NodeId) {
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            let children = node.children.lock().unwrap();
            for &(_, _, child) in children.iter() {
                if child != NODE_NONE {
                    stack.push(child);
                }
            }
            drop(children);
            self.release(id);
        }
    }

    /// Escape hatch for long-running jobs that want to keep going past the
    /// initial capacity (spec §4.A "if empty, grow").
    pub fn grow(&mut self, additional: usize) {
        let start = self.nodes.len();
        self.nodes.reserve(additional);
        let mut free = self.free_list.lock().unwrap();
        for i in 0..additional {
            self.nodes.push(Node::empty());
            free.push((start + i) as NodeId);
        }
        self.capacity += additional;
    }

    pub fn free_count(&self) -> usize {
        self.free_list.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release_round_trip() {
        let arena = Arena::new(4);
        assert_eq!(arena.free_count(), 4);
        let id = arena.acquire(NODE_NONE, None, 42).unwrap();
        assert_eq!(arena.free_count(), 3);
        assert_eq!(arena.node(id).state_hash(), 42);
        arena.release(id);
        assert_eq!(arena.free_count(), 4);
    }

    #[test]
    fn exhaustion_is_fatal_config() {
        let arena = Arena::new(1);
        let _id = arena.acquire(NODE_NONE, None, 1).unwrap();
        let err = arena.acquire(NODE_NONE, None, 2).unwrap_err();
        assert_matches::assert_matches!(err, CoreError::ArenaExhausted { capacity: 1 });
    }

    #[test]
    fn grow_adds_capacity() {
        let mut arena = Arena::new(1);
        let _id = arena.acquire(NODE_NONE, None, 1).unwrap();
        arena.grow(2);
        assert_eq!(arena.capacity(), 3);
        assert_eq!(arena.free_count(), 2);
    }

    #[test]
    fn free_tree_releases_whole_subtree() {
        let arena = Arena::new(8);
        let root = arena.acquire(NODE_NONE, None, 1).unwrap();
        let child = arena.acquire(root, None, 2).unwrap();
        let grandchild = arena.acquire(child, None, 3).unwrap();
        arena.node(root).children.lock().unwrap().push((0, 2, child));
        arena
            .node(child)
            .children
            .lock()
            .unwrap()
            .push((0, 3, grandchild));
        arena.free_tree(root);
        assert_eq!(arena.free_count(), 8);
    }

    #[test]
    fn stats_invariant_visit_equals_one_plus_children() {
        let stats = MctsStats::default();
        stats.atomic_update(1.0, 0.0);
        assert_eq!(stats.visit_count(), 1);
        assert_eq!(stats.value_sum(), 1.0);
    }

    #[test]
    fn virtual_loss_round_trips_through_add_and_update() {
        let stats = MctsStats::default();
        stats.add_virtual_loss(1.0);
        assert_eq!(stats.virtual_loss(), 1.0);
        stats.atomic_update(0.5, 1.0);
        assert_eq!(stats.virtual_loss(), 0.0);
    }
}
