//! Shared thread-pool plumbing for fire-and-forget jobs: a countdown the
//! loading thread drains to zero before it garbage-collects, bundled with
//! the pool handle and the wake signaller every job needs.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::refs::WorkSignaller;

/// Counts in-flight thread-pool jobs. The loading thread must wait for zero
/// before freeing audio memory, so no in-flight decode writes into a freed
/// buffer.
pub struct JobCountdown {
    count: Mutex<u32>,
    zero: Condvar,
}

impl JobCountdown {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            zero: Condvar::new(),
        }
    }

    pub fn increase(&self) {
        *self.count.lock() += 1;
    }

    pub fn count_down(&self) {
        let mut count = self.count.lock();
        debug_assert!(*count > 0);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn current(&self) -> u32 {
        *self.count.lock()
    }

    pub fn wait_until_zero(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }
}

impl Default for JobCountdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a job needs to run on the shared pool and report back.
#[derive(Clone)]
pub struct ThreadPoolContext {
    pub pool: Arc<rayon::ThreadPool>,
    pub jobs: Arc<JobCountdown>,
    pub signaller: WorkSignaller,
}

impl ThreadPoolContext {
    /// Run `body` on the pool, tracked by the countdown and signalling the
    /// loading thread when finished, even if the body panics.
    pub fn spawn(&self, body: impl FnOnce() + Send + 'static) {
        self.jobs.increase();
        let guard_jobs = Arc::clone(&self.jobs);
        let guard_signaller = self.signaller.clone();
        self.pool.spawn(move || {
            let _guard = JobGuard {
                jobs: guard_jobs,
                signaller: guard_signaller,
            };
            body();
        });
    }
}

struct JobGuard {
    jobs: Arc<JobCountdown>,
    signaller: WorkSignaller,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.jobs.count_down();
        self.signaller.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_context() -> ThreadPoolContext {
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
    fn countdown_reaches_zero_after_jobs_finish() {
        let ctx = test_context();
        for _ in 0..16 {
            ctx.spawn(|| std::thread::sleep(std::time::Duration::from_millis(1)));
        }
        ctx.jobs.wait_until_zero();
        assert_eq!(ctx.jobs.current(), 0);
    }
}
