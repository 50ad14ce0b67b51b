//! The live-connection registry.
//!
//! A slot-indexed arena: index = the connection's pool slot, entry tagged
//! with the generation it was bound for. Lookups and removals by a stale
//! [`ConnectionId`] miss.
//!
//! ## Scanning
//!
//! The reaper needs a consistent view without stalling accept and close.
//! An optimistic pass locks one slot at a time and checks afterwards that
//! no insert or remove bumped the version meanwhile; a locked pass holds
//! the structure lock for the whole scan.

use crate::connection::{Connection, ConnectionId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

type Entry = Option<(Arc<Connection>, u64)>;

pub(crate) struct Registry {
    slots: Box<[Mutex<Entry>]>,
    /// Held by structural changes and by locked scans
    guard: Mutex<()>,
    version: AtomicU64,
    len: AtomicUsize,
}

impl Registry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Mutex::new(None)).collect(),
            guard: Mutex::new(()),
            version: AtomicU64::new(0),
            len: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, conn: Arc<Connection>, generation: u64) {
        let Some(slot) = self.slots.get(conn.slot()) else {
            return;
        };
        let _guard = self.guard.lock();
        let previous = slot.lock().replace((conn, generation));
        if previous.is_none() {
            self.len.fetch_add(1, Ordering::AcqRel);
        }
        self.version.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes the entry for `id` if it is still the one registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let Some(slot) = self.slots.get(id.slot) else {
            return false;
        };
        let _guard = self.guard.lock();
        let mut entry = slot.lock();
        match entry.as_ref() {
            Some((_, generation)) if *generation == id.generation => {
                *entry = None;
                self.len.fetch_sub(1, Ordering::AcqRel);
                self.version.fetch_add(1, Ordering::AcqRel);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let entry = self.slots.get(id.slot)?.lock();
        match entry.as_ref() {
            Some((conn, generation)) if *generation == id.generation => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    fn collect(&self) -> Vec<(ConnectionId, Arc<Connection>)> {
        let mut live = Vec::with_capacity(self.len());
        for (index, slot) in self.slots.iter().enumerate() {
            if let Some((conn, generation)) = slot.lock().as_ref() {
                let id = ConnectionId {
                    slot: index,
                    generation: *generation,
                };
                live.push((id, Arc::clone(conn)));
            }
        }
        live
    }

    /// One pass without the structure lock. None if the registry changed
    /// during the pass.
    pub fn snapshot_optimistic(&self) -> Option<Vec<(ConnectionId, Arc<Connection>)>> {
        let before = self.version.load(Ordering::Acquire);
        let live = self.collect();
        (self.version.load(Ordering::Acquire) == before).then_some(live)
    }

    pub fn snapshot_locked(&self) -> Vec<(ConnectionId, Arc<Connection>)> {
        let _guard = self.guard.lock();
        self.collect()
    }

    /// Tries `retries` optimistic passes before falling back to a locked
    /// one.
    pub fn snapshot(&self, retries: u32) -> Vec<(ConnectionId, Arc<Connection>)> {
        for _ in 0..retries {
            if let Some(live) = self.snapshot_optimistic() {
                return live;
            }
        }
        self.snapshot_locked()
    }
}
