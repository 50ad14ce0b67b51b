//! Runs a connection's queued events on the worker pool.
//!
//! A dispatch takes a hold on the connection and submits one job. The job
//! pops a single event under the state lock, processes it, and dispatches
//! again if more events are waiting, so one connection never occupies a
//! worker for longer than one event while others wait.

use super::ServerContext;
use crate::connection::{event_driven, Connection, HoldGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Submits a job for the next queued event of `conn`.
pub(crate) fn dispatch(ctx: &Arc<ServerContext>, conn: &Arc<Connection>, generation: u64) {
    if !conn.try_hold(ctx, generation) {
        trace!(slot = conn.slot(), "Dispatch skipped");
        return;
    }

    let job_ctx = Arc::clone(ctx);
    let job_conn = Arc::clone(conn);
    let submitted = ctx
        .workers
        .execute(move || run(job_ctx, job_conn, generation));
    if let Err(e) = submitted {
        warn!(id = %conn.id(), error = %e, "Could not dispatch event");
        conn.release(ctx);
    }
}

fn run(ctx: Arc<ServerContext>, conn: Arc<Connection>, generation: u64) {
    let more = {
        let _hold = HoldGuard::adopt(&conn, &ctx);
        let mut state = conn.state.lock();
        if !conn.is_closed() && conn.generation() == generation {
            if let Some(event) = conn.pop_event() {
                event_driven::process(&ctx, &conn, generation, &mut state, event);
            }
        }
        conn.has_events() && !conn.is_closed()
    };
    if more {
        dispatch(&ctx, &conn, generation);
    }
}

/// Bounds how many workers write to sockets at once.
#[derive(Debug)]
pub(crate) struct WriteGate {
    active: AtomicUsize,
    limit: usize,
}

impl WriteGate {
    pub fn new(limit: usize) -> Self {
        Self {
            active: AtomicUsize::new(0),
            limit: limit.max(1),
        }
    }

    /// True if another writer would be admitted now.
    pub fn permits(&self) -> bool {
        self.active.load(Ordering::Acquire) < self.limit
    }

    pub fn enter(&self) -> WritePermit<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        WritePermit { gate: self }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

pub(crate) struct WritePermit<'a> {
    gate: &'a WriteGate,
}

impl Drop for WritePermit<'_> {
    fn drop(&mut self) {
        self.gate.active.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_gate() {
        let gate = WriteGate::new(2);
        assert!(gate.permits());

        let first = gate.enter();
        let second = gate.enter();
        assert!(!gate.permits());
        assert_eq!(gate.active(), 2);

        drop(first);
        assert!(gate.permits());
        drop(second);
        assert_eq!(gate.active(), 0);
    }
}
