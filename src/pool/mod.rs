//! Resource Pools
//!
//! Everything the engine reuses under load comes from a pool:
//!
//! ```text
//! ┌──────────────┐  borrow blocks   ┌──────────────────────────────────┐
//! │ BufferPool   │─────────────────>│ read scratch, outbound chain, TLS │
//! └──────────────┘  when exhausted  └──────────────────────────────────┘
//! ┌──────────────┐  borrow fails    ┌──────────────────────────────────┐
//! │ ObjectPool   │─────────────────>│ Connection slots, client data     │
//! └──────────────┘  fast            └──────────────────────────────────┘
//! ┌──────────────┐  reserve fails   ┌──────────────────────────────────┐
//! │ WorkerPool   │─────────────────>│ event jobs, blocking connections  │
//! └──────────────┘  fast            └──────────────────────────────────┘
//! ```
//!
//! A stalled I/O operation can afford to wait for a buffer; an accept
//! cannot afford to wait for a connection slot, so the acceptor closes the
//! raw socket instead.
//!
//! Objects go back through [`Poolable::reset`], which must wipe every piece
//! of per-client state before the slot can serve someone else.

pub mod buffer;
pub mod object;
pub mod worker;

pub use buffer::{BufferPool, PooledBuffer};
pub use object::ObjectPool;
pub use worker::{Reservation, WorkerPool};

use thiserror::Error;

/// Pool failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Every object is lent out
    #[error("{pool} pool exhausted ({capacity} in use)")]
    Exhausted { pool: &'static str, capacity: usize },

    /// The pool was released during shutdown
    #[error("{0} pool is closed")]
    Closed(&'static str),
}

/// An object that can be handed to a new owner after [`reset`](Self::reset).
pub trait Poolable: Send {
    /// Returns the object to its zero state.
    fn reset(&mut self);
}
