//! Fire-and-forget jobs whose outcomes are polled, not awaited. The
//! orchestrator dispatches scan and read work here, then checks each cycle
//! for jobs whose `completed` flag has flipped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::pool::ThreadPoolContext;

struct Job<T> {
    completed: AtomicBool,
    outcome: Mutex<Option<T>>,
}

/// Tracks in-flight jobs of one outcome type. The mutex guards only list
/// and slot mutation; job bodies run unlocked on the pool.
pub struct JobRunner<T> {
    jobs: Mutex<Vec<Arc<Job<T>>>>,
}

impl<T: Send + 'static> JobRunner<T> {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Run `body` on the pool; its return value becomes pollable via
    /// [`drain_completed`](Self::drain_completed).
    pub fn spawn(&self, ctx: &ThreadPoolContext, body: impl FnOnce() -> T + Send + 'static) {
        let job = Arc::new(Job {
            completed: AtomicBool::new(false),
            outcome: Mutex::new(None),
        });
        self.jobs.lock().push(Arc::clone(&job));
        ctx.spawn(move || {
            let outcome = body();
            *job.outcome.lock() = Some(outcome);
            job.completed.store(true, Ordering::Release);
        });
    }

    /// Remove every finished job from the list and return its outcome, in
    /// completion-discovery order.
    pub fn drain_completed(&self) -> Vec<T> {
        let mut jobs = self.jobs.lock();
        let mut outcomes = Vec::new();
        jobs.retain(|job| {
            if job.completed.load(Ordering::Acquire) {
                if let Some(outcome) = job.outcome.lock().take() {
                    outcomes.push(outcome);
                }
                false
            } else {
                true
            }
        });
        outcomes
    }

    /// Number of jobs still on the list. A finished job counts until its
    /// outcome has been drained: the outcome may still change what the
    /// orchestrator knows, so the job is not over from its point of view.
    pub fn num_outstanding(&self) -> usize {
        self.jobs.lock().len()
    }
}

impl<T: Send + 'static> Default for JobRunner<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pool::JobCountdown;
    use crate::refs::WorkSignaller;

    fn test_ctx() -> ThreadPoolContext {
        ThreadPoolContext {
            pool: Arc::new(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(2)
                    .build()
                    .unwrap(),
            ),
            jobs: Arc::new(JobCountdown::new()),
            signaller: WorkSignaller::new(),
        }
    }

    #[test]
    fn outcomes_are_drained_once() {
        let ctx = test_ctx();
        let runner = JobRunner::new();
        runner.spawn(&ctx, || 1);
        runner.spawn(&ctx, || 2);
        ctx.jobs.wait_until_zero();

        let mut outcomes = runner.drain_completed();
        outcomes.sort_unstable();
        assert_eq!(outcomes, vec![1, 2]);
        assert!(runner.drain_completed().is_empty());
        assert_eq!(runner.num_outstanding(), 0);
    }

    #[test]
    fn finished_jobs_count_until_drained() {
        let ctx = test_ctx();
        let runner = JobRunner::new();
        let (done_tx, done_rx) = crossbeam_channel::bounded::<()>(1);
        runner.spawn(&ctx, move || {
            let _ = done_tx.send(());
            3
        });
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        ctx.jobs.wait_until_zero();

        assert_eq!(runner.num_outstanding(), 1);
        assert_eq!(runner.drain_completed(), vec![3]);
        assert_eq!(runner.num_outstanding(), 0);
    }

    #[test]
    fn unfinished_jobs_stay_listed() {
        let ctx = test_ctx();
        let runner = JobRunner::new();
        let (block_tx, block_rx) = crossbeam_channel::bounded::<()>(0);
        runner.spawn(&ctx, move || {
            let _ = block_rx.recv_timeout(Duration::from_secs(5));
            7
        });
        assert_eq!(runner.num_outstanding(), 1);
        assert!(runner.drain_completed().is_empty());

        drop(block_tx);
        ctx.jobs.wait_until_zero();
        assert_eq!(runner.drain_completed(), vec![7]);
    }
}
