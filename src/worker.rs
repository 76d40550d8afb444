//! Worker handles and the supervisor's roster
//!
//! A `WorkerHandle` describes one supervised child: its stable id, the port
//! derived from it, the pid of the live process, and an embedded counter of
//! in-flight proxied connections. The supervisor owns the roster; the proxy
//! reads it through cloned snapshots and mutates only the counters.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Descriptor for one supervised worker process
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    port: u16,
    /// Pid of the live child; None before spawn and during restart back-off
    pid: Mutex<Option<u32>>,
    /// Number of proxied connections currently in flight to this worker
    active_connections: AtomicUsize,
}

impl WorkerHandle {
    pub fn new(id: usize, port: u16) -> Self {
        Self {
            id,
            port,
            pid: Mutex::new(None),
            active_connections: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock()
    }

    pub fn set_pid(&self, pid: Option<u32>) {
        *self.pid.lock() = pid;
    }

    /// Clear the process reference during restart
    pub fn clear_process(&self) {
        *self.pid.lock() = None;
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }
}

/// Tracks one proxied connection against a worker
///
/// Increments the worker's counter on construction and decrements it on drop,
/// so the decrement happens on every path including errors and panics.
#[derive(Debug)]
pub struct ConnectionGuard {
    worker: Arc<WorkerHandle>,
}

impl ConnectionGuard {
    pub fn new(worker: Arc<WorkerHandle>) -> Self {
        worker.active_connections.fetch_add(1, Ordering::SeqCst);
        Self { worker }
    }

    pub fn worker(&self) -> &Arc<WorkerHandle> {
        &self.worker
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.worker
            .active_connections
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// The supervisor's live list of worker handles
///
/// Kept ordered by worker id so selection order stays deterministic even
/// though concurrent spawns and restarts complete in arbitrary order.
#[derive(Debug, Default)]
pub struct Roster {
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle at its id-ordered slot
    pub fn insert(&self, handle: Arc<WorkerHandle>) {
        let mut workers = self.workers.write();
        let pos = workers
            .binary_search_by_key(&handle.id(), |w| w.id())
            .unwrap_or_else(|pos| pos);
        workers.insert(pos, handle);
    }

    /// Remove the handle with the given id, if present
    pub fn remove(&self, id: usize) -> Option<Arc<WorkerHandle>> {
        let mut workers = self.workers.write();
        let pos = workers.iter().position(|w| w.id() == id)?;
        Some(workers.remove(pos))
    }

    /// Cloned snapshot of the current handles, in id order
    pub fn snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.workers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_guard_counts() {
        let worker = Arc::new(WorkerHandle::new(0, 3000));
        assert_eq!(worker.active_connections(), 0);

        let g1 = ConnectionGuard::new(Arc::clone(&worker));
        let g2 = ConnectionGuard::new(Arc::clone(&worker));
        assert_eq!(worker.active_connections(), 2);

        drop(g1);
        assert_eq!(worker.active_connections(), 1);
        drop(g2);
        assert_eq!(worker.active_connections(), 0);
    }

    #[test]
    fn test_roster_stays_ordered_by_id() {
        let roster = Roster::new();
        roster.insert(Arc::new(WorkerHandle::new(2, 3002)));
        roster.insert(Arc::new(WorkerHandle::new(0, 3000)));
        roster.insert(Arc::new(WorkerHandle::new(1, 3001)));

        let ids: Vec<usize> = roster.snapshot().iter().map(|w| w.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_roster_remove_and_reinsert() {
        let roster = Roster::new();
        for id in 0..3 {
            roster.insert(Arc::new(WorkerHandle::new(id, 3000 + id as u16)));
        }

        let removed = roster.remove(1).unwrap();
        assert_eq!(removed.port(), 3001);
        assert_eq!(roster.len(), 2);
        assert!(roster.remove(1).is_none());

        // A restarted worker lands back in its slot
        roster.insert(Arc::new(WorkerHandle::new(1, 3001)));
        let ids: Vec<usize> = roster.snapshot().iter().map(|w| w.id()).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn test_pid_lifecycle() {
        let worker = WorkerHandle::new(0, 3000);
        assert_eq!(worker.pid(), None);

        worker.set_pid(Some(4242));
        assert_eq!(worker.pid(), Some(4242));

        worker.clear_process();
        assert_eq!(worker.pid(), None);
    }
}
