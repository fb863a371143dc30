//! Bounded worker queues for resource creation and closing

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// What to do with a job when the queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejection {
    /// Drop the job silently.
    Discard,
    /// Run the job on the submitting thread.
    CallerRuns,
}

/// A fixed set of worker threads fed from a bounded queue.
pub(crate) struct TaskQueue {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    receiver: Receiver<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rejection: Rejection,
}

impl TaskQueue {
    pub fn new(
        name: impl Into<String>,
        workers: usize,
        capacity: usize,
        rejection: Rejection,
    ) -> std::io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = channel::bounded::<Job>(capacity.max(1));

        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers.max(1) {
            let jobs = receiver.clone();
            let worker_name = name.clone();
            let handle = thread::Builder::new().name(name.clone()).spawn(move || {
                for job in jobs.iter() {
                    // A panicking job must not take the worker down with it.
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        error!("Job panicked on {}", worker_name);
                    }
                }
            })?;
            handles.push(handle);
        }

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(handles),
            rejection,
        })
    }

    /// Submit a job. Returns `false` if it was discarded.
    pub fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let outcome = match self.sender.lock().as_ref() {
            Some(sender) => sender.try_send(Box::new(job)),
            None => Err(TrySendError::Disconnected(Box::new(job) as Job)),
        };

        match outcome {
            Ok(()) => true,
            Err(TrySendError::Full(job)) if self.rejection == Rejection::CallerRuns => {
                job();
                true
            }
            Err(TrySendError::Disconnected(job)) if self.rejection == Rejection::CallerRuns => {
                job();
                true
            }
            Err(_) => false,
        }
    }

    /// Jobs waiting to be picked up by a worker.
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Stop accepting jobs, let workers drain the queue, and wait up to `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.sender.lock().take();

        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        let current = thread::current().id();
        let deadline = Instant::now().checked_add(timeout);

        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            while !worker.is_finished() {
                if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                    warn!("Timed-out waiting for {} to shut down", self.name);
                    return false;
                }
                thread::sleep(Duration::from_millis(5));
            }
            let _ = worker.join();
        }
        true
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.sender.get_mut().take();
    }
}
