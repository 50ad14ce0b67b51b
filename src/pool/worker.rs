//! Worker Thread Pool
//!
//! A fixed set of threads fed from one crossbeam channel. Event-driven
//! connections queue short jobs with [`WorkerPool::execute`]; blocking
//! connections need a thread for their whole life and take a
//! [`Reservation`] first, which fails immediately when every thread is
//! already spoken for.
//!
//! ```text
//!                 ┌──────────────┐
//!  execute(job) ──>│   channel    │──> worker-0
//!                 │  (unbounded) │──> worker-1
//!  reservation ──>│              │──> ...
//!                 └──────────────┘──> worker-N
//! ```

use super::PoolError;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
struct Shared {
    size: usize,
    reserved: AtomicUsize,
    busy: AtomicUsize,
}

/// Fixed-size pool of worker threads.
#[derive(Debug)]
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Spawns `size` threads named `{name}-worker-{i}`.
    pub fn new(name: &str, size: usize) -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<Job>();
        let shared = Arc::new(Shared {
            size,
            reserved: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
        });

        let mut handles = Vec::with_capacity(size);
        for i in 0..size {
            let receiver = receiver.clone();
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{name}-worker-{i}"))
                .spawn(move || worker_loop(receiver, shared))?;
            handles.push(handle);
        }
        debug!(pool = name, threads = size, "Worker pool started");

        Ok(Self {
            name: name.to_string(),
            sender: Mutex::new(Some(sender)),
            handles: Mutex::new(handles),
            shared,
        })
    }

    /// Queues a job for the next free thread.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => sender
                .send(Box::new(job))
                .map_err(|_| PoolError::Closed("worker")),
            None => Err(PoolError::Closed("worker")),
        }
    }

    /// Claims a thread for a long-running job. Returns `None` when every
    /// thread is already reserved.
    pub fn try_reserve(&self) -> Option<Reservation> {
        let sender = self.sender.lock().clone()?;
        let mut current = self.shared.reserved.load(Ordering::Acquire);
        loop {
            if current >= self.shared.size {
                return None;
            }
            match self.shared.reserved.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Some(Reservation {
            shared: Arc::clone(&self.shared),
            sender,
        })
    }

    pub fn size(&self) -> usize {
        self.shared.size
    }

    /// Threads currently held by reservations.
    pub fn reserved(&self) -> usize {
        self.shared.reserved.load(Ordering::Acquire)
    }

    /// Threads currently running a job.
    pub fn busy(&self) -> usize {
        self.shared.busy.load(Ordering::Acquire)
    }

    /// Stops accepting jobs and joins the threads once the queue is empty.
    /// A worker calling this does not wait for itself.
    pub fn shutdown(&self) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "Worker thread panicked outside a job");
            }
        }
        debug!(pool = %self.name, "Worker pool stopped");
    }
}

/// A thread claimed by [`WorkerPool::try_reserve`]. The claim ends when the
/// job given to [`execute`](Self::execute) returns, or when the reservation
/// is dropped unused.
#[derive(Debug)]
pub struct Reservation {
    shared: Arc<Shared>,
    sender: Sender<Job>,
}

impl Reservation {
    /// Runs `job` on the reserved thread.
    pub fn execute<F>(self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.clone();
        sender
            .send(Box::new(move || {
                let _claim = self;
                job();
            }))
            .map_err(|_| PoolError::Closed("worker"))
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.shared.reserved.fetch_sub(1, Ordering::AcqRel);
    }
}

fn worker_loop(receiver: Receiver<Job>, shared: Arc<Shared>) {
    while let Ok(job) = receiver.recv() {
        shared.busy.fetch_add(1, Ordering::AcqRel);
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!(
                thread = thread::current().name().unwrap_or("worker"),
                "Job panicked"
            );
        }
        shared.busy.fetch_sub(1, Ordering::AcqRel);
    }
}
