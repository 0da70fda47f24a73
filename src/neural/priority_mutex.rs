//! Priority mutex (spec §4.C, §5, Design Note §9).
//!
//! Waiters are ordered by an integer priority; the lowest-numbered
//! (highest-priority) waiter acquires next on unlock, with FIFO ordering
//! within a priority level for fairness. The trainer calls
//! [`ModelManager::update_model`](crate::neural::manager::ModelManager::update_model)
//! at priority `-9` so model loads preempt inference running at `-1` or
//! per-thread priorities (spec §4.C).
//!
//! Implemented as a `Mutex<State>` + `Condvar` rather than a lock-free
//! structure: contention is low (one GPU, a handful of inference/update
//! callers) and the correctness property under test (§8 invariant 6) only
//! concerns acquisition order, not raw throughput.

use std::collections::BinaryHeap;
use std::sync::{Condvar, Mutex};

/// Priority used by model updates so they preempt any waiting inference
/// (spec §4.C: "the trainer calls `updateModel` with priority -9").
pub const UPDATE_PRIORITY: i64 = -9;

/// Default priority for an inference caller with no specific priority.
pub const DEFAULT_INFERENCE_PRIORITY: i64 = -1;

struct Waiter {
    priority: i64,
    seq: u64,
}

// Reverse ordering: `BinaryHeap` is a max-heap, we want the *lowest*
// priority (and, within a priority, lowest sequence number) to pop first.
impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for Waiter {}
impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Inner {
    locked: bool,
    next_seq: u64,
    queue: BinaryHeap<Waiter>,
}

/// A mutex whose waiters are served in priority order, not enqueue order.
pub struct PriorityMutex<T> {
    inner: Mutex<Inner>,
    cv: Condvar,
    data: Mutex<T>,
}

/// RAII guard; dropping it releases the mutex and wakes the next waiter.
pub struct PriorityMutexGuard<'a, T> {
    outer: &'a PriorityMutex<T>,
    data: std::sync::MutexGuard<'a, T>,
}

impl<'a, T> std::ops::Deref for PriorityMutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.data
    }
}
impl<'a, T> std::ops::DerefMut for PriorityMutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

impl<'a, T> Drop for PriorityMutexGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.outer.inner.lock().unwrap();
        inner.locked = false;
        self.outer.cv.notify_all();
    }
}

impl<T> PriorityMutex<T> {
    pub fn new(data: T) -> Self {
        Self {
            inner: Mutex::new(Inner {
                locked: false,
                next_seq: 0,
                queue: BinaryHeap::new(),
            }),
            cv: Condvar::new(),
            data: Mutex::new(data),
        }
    }

    /// Blocks until this caller is the highest-priority waiter and the
    /// mutex is free, then locks it.
    pub fn lock(&self, priority: i64) -> PriorityMutexGuard<'_, T> {
        let mut inner = self.inner.lock().unwrap();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.queue.push(Waiter { priority, seq });

        loop {
            let at_front = inner.queue.peek().map(|w| w.seq) == Some(seq);
            if !inner.locked && at_front {
                inner.queue.pop();
                inner.locked = true;
                break;
            }
            inner = self.cv.wait(inner).unwrap();
        }
        drop(inner);
        PriorityMutexGuard {
            outer: self,
            data: self.data.lock().unwrap(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn single_threaded_lock_unlock() {
        let m = PriorityMutex::new(0i32);
        {
            let mut g = m.lock(0);
            *g += 1;
        }
        let g = m.lock(0);
        assert_eq!(*g, 1);
    }

    #[test]
    fn lower_priority_number_wins_regardless_of_enqueue_order() {
        // Invariant 6 (spec §8): N waiters with priorities p1 < ... < pN
        // queueing while the mutex is held acquire in ascending-p order.
        let m = Arc::new(PriorityMutex::new(Vec::<i64>::new()));
        let held = m.lock(100);

        let priorities = vec![5i64, -9, 3, -1, 0];
        let mut handles = Vec::new();
        let barrier = Arc::new(std::sync::Barrier::new(priorities.len() + 1));
        for p in priorities.iter().copied() {
            let m = m.clone();
            let barrier = barrier.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                // Small stagger so the holder's priority-100 lock attempt
                // below definitely starts after these have enqueued.
                thread::sleep(std::time::Duration::from_millis(10));
                let mut g = m.lock(p);
                g.push(p);
            }));
        }
        barrier.wait();
        thread::sleep(std::time::Duration::from_millis(50));
        drop(held);
        for h in handles {
            h.join().unwrap();
        }
        let order = m.lock(0).clone();
        let mut expected = priorities.clone();
        expected.sort();
        assert_eq!(order, expected);
    }
}
