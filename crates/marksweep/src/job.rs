//! Background jobs.
//!
//! The sweep coordinator hands its block walk to a [`JobPool`] when
//! concurrent sweeping is enabled and waits on the returned [`JobHandle`]
//! whenever a mutator needs the sweep to be over.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};

/// A unit of background work.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Somewhere to run background jobs.
pub trait JobPool: Send + Sync {
    /// Schedules `job` and returns a handle that completes after it ran.
    fn enqueue(&self, job: Job) -> JobHandle;
}

/// A job's panic payload, kept until a waiter re-raises it.
type Payload = Box<dyn Any + Send + 'static>;

#[derive(Debug, Default)]
struct JobState {
    done: bool,
    panicked: bool,
    payload: Option<Payload>,
}

#[derive(Debug, Default)]
struct Completion {
    state: Mutex<JobState>,
    cond: Condvar,
}

/// Completion handle of an enqueued job. Clones share the same job.
#[derive(Debug, Clone, Default)]
pub struct JobHandle {
    completion: Arc<Completion>,
}

impl JobHandle {
    /// A handle for a job that has not run yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the job finished and wakes every waiter.
    pub fn complete(&self) {
        let mut state = self.completion.state.lock();
        state.done = true;
        self.completion.cond.notify_all();
    }

    /// Marks the job finished by a panic. Waiters re-raise it.
    fn complete_with_panic(&self, payload: Payload) {
        let mut state = self.completion.state.lock();
        state.done = true;
        state.panicked = true;
        state.payload = Some(payload);
        self.completion.cond.notify_all();
    }

    /// Runs `job` and completes the handle, even if the job unwinds.
    fn run(&self, job: Job) {
        match panic::catch_unwind(AssertUnwindSafe(job)) {
            Ok(()) => self.complete(),
            Err(payload) => self.complete_with_panic(payload),
        }
    }

    /// Whether the job has finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.completion.state.lock().done
    }

    /// Blocks until the job has finished.
    ///
    /// # Panics
    ///
    /// Re-raises the job's panic. The first waiter gets the original
    /// payload, later ones a generic message.
    pub fn wait(&self) {
        let mut state = self.completion.state.lock();
        while !state.done {
            self.completion.cond.wait(&mut state);
        }
        if state.panicked {
            let payload = state.payload.take();
            drop(state);
            match payload {
                Some(payload) => panic::resume_unwind(payload),
                None => panic!("background GC job panicked"),
            }
        }
    }
}

/// Runs `job` on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlinePool;

impl JobPool for InlinePool {
    fn enqueue(&self, job: Job) -> JobHandle {
        let handle = JobHandle::new();
        job();
        handle.complete();
        handle
    }
}

/// A fixed set of worker threads fed through a channel.
///
/// Workers exit once the pool is dropped and the queue drains. The pool
/// does not join them on drop: the last reference to whatever a job
/// captured may be released on a worker thread.
#[derive(Debug)]
pub struct ThreadPool {
    sender: Sender<(Job, JobHandle)>,
    workers: usize,
}

impl ThreadPool {
    /// Starts `workers` threads (at least one).
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = channel::unbounded::<(Job, JobHandle)>();
        for index in 0..workers {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("marksweep-worker-{index}"))
                .spawn(move || {
                    for (job, handle) in receiver {
                        handle.run(job);
                    }
                })
                .unwrap_or_else(|err| panic!("failed to spawn GC worker: {err}"));
        }
        Self { sender, workers }
    }

    /// Number of worker threads.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.workers
    }
}

impl JobPool for ThreadPool {
    fn enqueue(&self, job: Job) -> JobHandle {
        let handle = JobHandle::new();
        if let Err(channel::SendError((job, _))) = self.sender.send((job, handle.clone())) {
            // Workers are gone; run it here rather than lose it.
            job();
            handle.complete();
        }
        handle
    }
}
