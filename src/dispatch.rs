//! Static work distribution and the fixed worker pool.
//!
//! Tile ownership is never communicated between phases: every phase
//! re-derives the same assignment from `(num_tiles, workers, worker_id)`.
//! Worker `w` owns tile indices `{w, w+P, w+2P, ...}`, a complete and
//! non-overlapping partition of the tile range. There is no work stealing
//! and no rebalancing; a slow worker just finishes later.
//!
//! The pool runs a fixed set of scoped threads. Joining a phase is the
//! barrier between phases; `PhaseBarrier` additionally provides mid-phase
//! checkpoints (used between per-class stitch passes) that wake cleanly
//! instead of deadlocking when a sibling worker fails.

use std::sync::{Condvar, Mutex};
use std::thread;

use crate::error::{FirstErrorCapture, Result, VoxtileError};

/// Tile indices owned by `worker_id` out of `num_tiles`, in increasing
/// order. Deterministic and stateless; the union over all workers is
/// exactly `0..num_tiles` with no duplicates. Workers beyond the tile
/// count receive the empty set.
pub fn assigned_tiles(
    num_tiles: usize,
    workers: usize,
    worker_id: usize,
) -> impl Iterator<Item = usize> {
    debug_assert!(workers > 0);
    debug_assert!(worker_id < workers);
    (worker_id..num_tiles).step_by(workers.max(1))
}

struct BarrierState {
    waiting: usize,
    generation: u64,
    failed: bool,
}

/// An error-aware rendezvous for a fixed party of workers.
///
/// Unlike `std::sync::Barrier`, a failed worker can mark the barrier so
/// that everyone blocked (or arriving later) returns an `Aborted` error
/// rather than waiting for a participant that will never come.
pub struct PhaseBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    cvar: Condvar,
}

impl PhaseBarrier {
    pub fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                waiting: 0,
                generation: 0,
                failed: false,
            }),
            cvar: Condvar::new(),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BarrierState>> {
        self.state
            .lock()
            .map_err(|_| VoxtileError::aborted("phase barrier poisoned"))
    }

    /// Block until all parties arrive, or until any party fails.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.failed {
            return Err(VoxtileError::aborted("another worker failed"));
        }

        state.waiting += 1;
        if state.waiting == self.parties {
            state.waiting = 0;
            state.generation += 1;
            self.cvar.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.failed {
            state = self
                .cvar
                .wait(state)
                .map_err(|_| VoxtileError::aborted("phase barrier poisoned"))?;
        }

        if state.failed {
            Err(VoxtileError::aborted("another worker failed"))
        } else {
            Ok(())
        }
    }

    /// Mark the barrier failed and wake everyone blocked on it.
    pub fn fail(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.failed = true;
        }
        self.cvar.notify_all();
    }
}

/// Per-worker view handed to a phase closure.
pub struct WorkerCtx<'a> {
    pub worker_id: usize,
    pub workers: usize,
    barrier: &'a PhaseBarrier,
}

impl WorkerCtx<'_> {
    /// This worker's share of `num_tiles`, in processing order.
    pub fn assigned(&self, num_tiles: usize) -> impl Iterator<Item = usize> {
        assigned_tiles(num_tiles, self.workers, self.worker_id)
    }

    /// Rendezvous with all sibling workers (e.g. between per-class stitch
    /// passes). Returns an error if any sibling has failed.
    pub fn checkpoint(&self) -> Result<()> {
        self.barrier.wait()
    }
}

/// A fixed pool of cooperating workers.
///
/// The pool size is decided before the run and never changes mid-run.
/// Workers share nothing but the filesystem and the phase barrier; the
/// first error aborts the phase and is reported to the caller.
pub struct WorkerPool {
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Result<Self> {
        if workers == 0 {
            return Err(VoxtileError::config("worker count must be positive"));
        }
        Ok(Self { workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run one phase on all workers and join them. The join is the barrier
    /// between phases: when `run` returns, every tile operation of the
    /// phase has completed (or the first error is returned).
    pub fn run<F>(&self, phase: F) -> Result<()>
    where
        F: Fn(WorkerCtx<'_>) -> Result<()> + Sync,
    {
        let barrier = PhaseBarrier::new(self.workers);
        let first_error = FirstErrorCapture::new();

        thread::scope(|scope| {
            for worker_id in 0..self.workers {
                let barrier = &barrier;
                let first_error = &first_error;
                let phase = &phase;
                let workers = self.workers;
                scope.spawn(move || {
                    let ctx = WorkerCtx {
                        worker_id,
                        workers,
                        barrier,
                    };
                    if let Err(err) = phase(ctx) {
                        first_error.store(err);
                        barrier.fail();
                    }
                });
            }
        });

        match first_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_assignment_is_a_partition() {
        for &(n, p) in &[(0usize, 1usize), (1, 1), (10, 3), (10, 10), (3, 8), (100, 7)] {
            let mut seen = HashSet::new();
            for w in 0..p {
                for idx in assigned_tiles(n, p, w) {
                    assert!(seen.insert(idx), "tile {} assigned twice (n={}, p={})", idx, n, p);
                }
            }
            assert_eq!(seen.len(), n, "incomplete partition for n={}, p={}", n, p);
        }
    }

    #[test]
    fn test_assignment_order_is_increasing() {
        let idx: Vec<usize> = assigned_tiles(20, 4, 1).collect();
        assert_eq!(idx, vec![1, 5, 9, 13, 17]);
    }

    #[test]
    fn test_more_workers_than_tiles() {
        // Workers beyond the tile count do no work.
        assert_eq!(assigned_tiles(2, 5, 4).count(), 0);
        assert_eq!(assigned_tiles(2, 5, 1).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_pool_runs_all_workers() {
        let pool = WorkerPool::new(4).unwrap();
        let counter = AtomicUsize::new(0);
        pool.run(|ctx| {
            counter.fetch_add(ctx.worker_id + 1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1 + 2 + 3 + 4);
    }

    #[test]
    fn test_pool_reports_first_error() {
        let pool = WorkerPool::new(3).unwrap();
        let result = pool.run(|ctx| {
            if ctx.worker_id == 1 {
                Err(VoxtileError::config("worker 1 exploded"))
            } else {
                Ok(())
            }
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("worker 1 exploded"));
    }

    #[test]
    fn test_checkpoint_synchronizes() {
        let pool = WorkerPool::new(4).unwrap();
        let before = AtomicUsize::new(0);
        let after = AtomicUsize::new(0);
        pool.run(|ctx| {
            before.fetch_add(1, Ordering::SeqCst);
            ctx.checkpoint()?;
            // Every worker must have passed `before` by now.
            assert_eq!(before.load(Ordering::SeqCst), 4);
            after.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(after.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_failed_worker_does_not_deadlock_checkpoint() {
        let pool = WorkerPool::new(3).unwrap();
        let result = pool.run(|ctx| {
            if ctx.worker_id == 0 {
                // Fails before ever reaching the checkpoint.
                return Err(VoxtileError::config("early failure"));
            }
            // The other workers wake with Aborted instead of hanging.
            match ctx.checkpoint() {
                Err(VoxtileError::Aborted(_)) => Ok(()),
                Err(other) => Err(other),
                Ok(()) => Err(VoxtileError::config("checkpoint should have aborted")),
            }
        });
        let err = result.unwrap_err();
        assert!(err.to_string().contains("early failure"));
    }

    #[test]
    fn test_zero_workers_rejected() {
        assert!(WorkerPool::new(0).is_err());
    }
}
