//! Quiescent-state-based reclamation
//!
//! Retired blocks (hash-table keys blocks, MRO-cache bucket arrays) may
//! still be probed by lock-free readers. They are stamped with an epoch
//! and freed only after every registered thread has passed a quiescent
//! state — an evaluator safe point — at or after that epoch.
//!
//! The global epoch only moves when something is retired, so idle
//! threads cost nothing. A thread blocked in foreign code stalls
//! reclamation until it reaches its next safe point or unregisters;
//! retired memory is bounded by retirement rate, not by time.

use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

/// Process-wide reclamation clock and thread registry.
pub struct Qsbr {
    global: AtomicU64,
    threads: Mutex<HashMap<u64, Arc<AtomicU64>>>,
}

impl Qsbr {
    /// New clock at epoch zero with no threads.
    pub fn new() -> Qsbr {
        Qsbr {
            global: AtomicU64::new(0),
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Register a thread; returns its local-epoch cell. The thread must
    /// store the global epoch into it at every quiescent state.
    pub fn register(&self, tid: u64) -> Arc<AtomicU64> {
        let cell = Arc::new(AtomicU64::new(self.global.load(Ordering::Acquire)));
        let prev = self
            .threads
            .lock()
            .unwrap()
            .insert(tid, Arc::clone(&cell));
        debug_assert!(prev.is_none(), "thread {tid} registered twice");
        cell
    }

    /// Remove a thread from the registry. Its outstanding retirements
    /// become reclaimable as soon as the remaining threads catch up.
    pub fn unregister(&self, tid: u64) {
        self.threads.lock().unwrap().remove(&tid);
        tracing::trace!(target: "quill::qsbr", tid, "thread unregistered");
    }

    /// Current global epoch.
    pub fn epoch(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    /// Advance the clock for a new retirement; returns the epoch the
    /// retired block must wait out.
    pub fn advance(&self) -> u64 {
        self.global.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Record a quiescent state for a thread's local cell.
    pub fn quiescent(&self, local: &AtomicU64) {
        local.store(self.global.load(Ordering::Acquire), Ordering::Release);
    }

    /// The oldest epoch any registered thread might still be reading.
    /// Blocks stamped at or before this value are safe to free.
    pub fn safe_epoch(&self) -> u64 {
        self.threads
            .lock()
            .unwrap()
            .values()
            .map(|cell| cell.load(Ordering::Acquire))
            .min()
            .unwrap_or(u64::MAX)
    }
}

impl Default for Qsbr {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-thread list of stamped deferred frees.
pub struct RetireList {
    items: Vec<(u64, Box<dyn FnOnce() + Send>)>,
}

impl RetireList {
    /// Empty list.
    pub fn new() -> RetireList {
        RetireList { items: Vec::new() }
    }

    /// Number of blocks awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.items.len()
    }

    /// Stamp and queue a deferred free.
    pub fn retire(&mut self, qsbr: &Qsbr, free: Box<dyn FnOnce() + Send>) {
        let epoch = qsbr.advance();
        self.items.push((epoch, free));
    }

    /// Free every queued block that all threads have stopped reading.
    pub fn flush(&mut self, qsbr: &Qsbr) {
        if self.items.is_empty() {
            return;
        }
        let safe = qsbr.safe_epoch();
        let before = self.items.len();
        let mut keep = Vec::with_capacity(self.items.len());
        for (epoch, free) in self.items.drain(..) {
            if epoch <= safe {
                free();
            } else {
                keep.push((epoch, free));
            }
        }
        self.items = keep;
        let freed = before - self.items.len();
        if freed > 0 {
            tracing::trace!(target: "quill::qsbr", freed, pending = self.items.len(), "retired blocks reclaimed");
        }
    }

    /// Free everything unconditionally. Only valid once no reader can
    /// exist (runtime teardown).
    pub fn flush_all(&mut self) {
        for (_, free) in self.items.drain(..) {
            free();
        }
    }
}

impl Default for RetireList {
    fn default() -> Self {
        Self::new()
    }
}
