//! Worker-pool boundary and per-connection ordered dispatch.
//!
//! The hub never runs user callbacks on its selector thread; it hands them
//! to a shared [`Executor`]. A [`Lane`] sits in front of the executor for
//! each connection and guarantees that the connection's jobs run one at a
//! time in submission order, while jobs of different lanes run in parallel
//! on whatever threads the pool provides.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;

/// Unit of work handed to the pool.
pub type Job = Box<dyn FnOnce() + Send>;

/// Shared worker pool boundary. Implementations are supplied by the
/// embedder; the hub only submits jobs.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Job);
}

/// Per-connection sequencer over a shared [`Executor`].
///
/// A lane is either idle or running. Submitting to an idle lane schedules
/// one pool job that drains the lane's queue in order until it is empty and
/// the lane falls back to idle. Submitting to a running lane only appends.
pub struct Lane {
    pool: Arc<dyn Executor>,
    state: Arc<LaneState>,
}

struct LaneState {
    queue: Mutex<LaneQueue>,
}

struct LaneQueue {
    jobs: VecDeque<Job>,
    running: bool,
}

impl Lane {
    pub fn new(pool: Arc<dyn Executor>) -> Self {
        Self {
            pool,
            state: Arc::new(LaneState {
                queue: Mutex::new(LaneQueue {
                    jobs: VecDeque::new(),
                    running: false,
                }),
            }),
        }
    }

    /// Append a job; it runs after every previously submitted job of this
    /// lane has finished.
    pub fn submit(&self, job: Job) {
        let schedule = {
            let mut q = self.state.queue.lock();
            q.jobs.push_back(job);
            if q.running {
                false
            } else {
                q.running = true;
                true
            }
        };
        if schedule {
            let state = self.state.clone();
            self.pool.execute(Box::new(move || drain(&state)));
        }
    }
}

fn drain(state: &LaneState) {
    // If a job unwinds, flip back to idle so the next submit reschedules
    // instead of queueing behind a drainer that no longer exists.
    let _reset = IdleOnPanic(state);
    loop {
        let job = {
            let mut q = state.queue.lock();
            match q.jobs.pop_front() {
                Some(job) => job,
                None => {
                    q.running = false;
                    return;
                }
            }
        };
        job();
    }
}

struct IdleOnPanic<'a>(&'a LaneState);

impl Drop for IdleOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.queue.lock().running = false;
        }
    }
}
