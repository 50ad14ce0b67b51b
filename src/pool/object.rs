//! Fail-Fast Object Pool
//!
//! Holds reusable objects (connection slots, per-client data) up to a fixed
//! capacity. Objects are created lazily by a factory that receives the
//! object's index, so the first `capacity` borrows each build a new object
//! and every later borrow reuses a returned one.

use super::{PoolError, Poolable};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{debug, trace};

type Factory<T> = Box<dyn Fn(usize) -> T + Send + Sync>;

/// A bounded pool whose `borrow` never waits.
pub struct ObjectPool<T: Poolable> {
    name: &'static str,
    capacity: usize,
    idle: Mutex<Vec<T>>,
    created: AtomicUsize,
    outstanding: AtomicUsize,
    closed: AtomicBool,
    factory: Factory<T>,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates an empty pool. `factory` is called with the index of each
    /// new object, from `0` to `capacity - 1`.
    pub fn new<F>(name: &'static str, capacity: usize, factory: F) -> Self
    where
        F: Fn(usize) -> T + Send + Sync + 'static,
    {
        Self {
            name,
            capacity,
            idle: Mutex::new(Vec::with_capacity(capacity)),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            factory: Box::new(factory),
        }
    }

    /// Takes an idle object, or builds one while under capacity.
    pub fn borrow(&self) -> Result<T, PoolError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed(self.name));
        }

        let mut idle = self.idle.lock();
        if let Some(obj) = idle.pop() {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            return Ok(obj);
        }

        let index = self.created.load(Ordering::Acquire);
        if index >= self.capacity {
            trace!(pool = self.name, capacity = self.capacity, "Pool exhausted");
            return Err(PoolError::Exhausted {
                pool: self.name,
                capacity: self.capacity,
            });
        }
        self.created.store(index + 1, Ordering::Release);
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        drop(idle);

        trace!(pool = self.name, index, "Creating pooled object");
        Ok((self.factory)(index))
    }

    /// Resets `obj` and puts it back. After [`release`](Self::release) the
    /// object is dropped instead.
    pub fn give_back(&self, mut obj: T) {
        obj.reset();
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.idle.lock().push(obj);
    }

    /// Drops every idle object and refuses further borrows.
    pub fn release(&self) {
        self.closed.store(true, Ordering::Release);
        let freed = {
            let mut idle = self.idle.lock();
            let n = idle.len();
            idle.clear();
            n
        };
        debug!(pool = self.name, freed, "Object pool released");
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Objects currently lent out.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Objects sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

impl<T: Poolable> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}
