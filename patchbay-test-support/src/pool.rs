//! Fixed-size worker pool for tests and examples.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use patchbay::{Executor, Job};

/// A handful of worker threads draining one shared queue. Jobs that panic
/// are contained so a bad callback cannot take a worker down.
pub struct FixedPool {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

struct State {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

impl FixedPool {
    pub fn new(workers: usize) -> Arc<Self> {
        assert!(workers >= 1);
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });
        let handles = (0..workers)
            .map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("pool-worker-{i}"))
                    .spawn(move || worker(&shared))
                    .expect("spawn pool worker")
            })
            .collect();
        Arc::new(Self {
            shared,
            workers: Mutex::new(handles),
        })
    }

    /// Jobs still queued (not the ones currently running).
    pub fn backlog(&self) -> usize {
        self.shared.state.lock().unwrap().jobs.len()
    }
}

fn worker(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if let Some(job) = state.jobs.pop_front() {
                    break job;
                }
                if state.shutdown {
                    return;
                }
                state = shared.available.wait(state).unwrap();
            }
        };
        let _ = panic::catch_unwind(AssertUnwindSafe(job));
    }
}

impl Executor for FixedPool {
    fn execute(&self, job: Job) {
        let mut state = self.shared.state.lock().unwrap();
        state.jobs.push_back(job);
        self.shared.available.notify_one();
    }
}

impl Drop for FixedPool {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.available.notify_all();
        for handle in self.workers.lock().unwrap().drain(..) {
            let _ = handle.join();
        }
    }
}
