//! Collector boundary
//!
//! The core does not collect cycles itself; it exposes what a collector
//! needs: track/untrack of collector-visible objects on an intrusive
//! list threaded through their headers, a live count with a threshold,
//! and the stop-the-world handshake driven through the eval breaker.
//! Deferred-RC objects are kept alive by this layer rather than by
//! per-operation counting.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};

use crate::object::{Obj, ObjectHeader};

/// `gc_prev` low bit: the object is on the tracked list.
pub const GC_TRACKED: usize = 1;
/// `gc_prev` low bit: marked unreachable by the current collection.
pub const GC_UNREACHABLE: usize = 2;
/// `gc_prev` low bit: the finalizer already ran.
pub const GC_FINALIZED: usize = 4;

const GC_FLAG_MASK: usize = 7;

#[inline]
fn prev_ptr(word: usize) -> *mut ObjectHeader {
    (word & !GC_FLAG_MASK) as *mut ObjectHeader
}

#[derive(Default)]
struct StopRound {
    active: bool,
    parked: usize,
    generation: u64,
}

/// Collector-facing state. Process-wide: destructors must reach the
/// tracked list without a runtime handle, so there is exactly one.
pub struct GcState {
    live: AtomicUsize,
    threshold: AtomicUsize,
    /// Head of the intrusive tracked list; guards all link words.
    list: Mutex<usize>,
    stop: Mutex<StopRound>,
    cv: Condvar,
}

/// The process-wide collector state.
pub fn state() -> &'static GcState {
    use std::sync::OnceLock;
    static STATE: OnceLock<GcState> = OnceLock::new();
    STATE.get_or_init(|| GcState {
        live: AtomicUsize::new(0),
        threshold: AtomicUsize::new(crate::consts::GC_THRESHOLD),
        list: Mutex::new(0),
        stop: Mutex::new(StopRound::default()),
        cv: Condvar::new(),
    })
}

impl GcState {
    /// Adjust the collection threshold (runtime bring-up).
    pub fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }

    /// Objects currently tracked.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Whether the live count passed the collection threshold.
    pub fn over_threshold(&self) -> bool {
        self.live() > self.threshold.load(Ordering::Relaxed)
    }

    /// Put an object on the tracked list. The object must not already
    /// be tracked.
    pub fn track(&self, obj: Obj) {
        let header = obj.header();
        let mut head = self.list.lock().unwrap();
        debug_assert_eq!(header.gc_prev.load(Ordering::Relaxed) & GC_TRACKED, 0);
        let old_head = *head;
        header.gc_next.store(old_head, Ordering::Relaxed);
        header.gc_prev.store(GC_TRACKED, Ordering::Relaxed);
        if old_head != 0 {
            let next = unsafe { &*(old_head as *const ObjectHeader) };
            let flags = next.gc_prev.load(Ordering::Relaxed) & GC_FLAG_MASK;
            next.gc_prev.store(obj.addr() | flags, Ordering::Relaxed);
        }
        *head = obj.addr();
        drop(head);
        let live = self.live.fetch_add(1, Ordering::Relaxed) + 1;
        if live == self.threshold.load(Ordering::Relaxed) + 1 {
            tracing::debug!(target: "quill::gc", live, "collection threshold crossed");
        }
    }

    /// Remove an object from the tracked list if present.
    pub fn untrack(&self, obj: Obj) {
        let header = obj.header();
        if header.gc_prev.load(Ordering::Relaxed) & GC_TRACKED == 0 {
            return;
        }
        let mut head = self.list.lock().unwrap();
        let word = header.gc_prev.load(Ordering::Relaxed);
        if word & GC_TRACKED == 0 {
            return;
        }
        let prev = prev_ptr(word);
        let next = header.gc_next.load(Ordering::Relaxed);
        if prev.is_null() {
            *head = next;
        } else {
            unsafe { (*prev).gc_next.store(next, Ordering::Relaxed) };
        }
        if next != 0 {
            let next_header = unsafe { &*(next as *const ObjectHeader) };
            let flags = next_header.gc_prev.load(Ordering::Relaxed) & GC_FLAG_MASK;
            next_header
                .gc_prev
                .store(prev as usize | flags, Ordering::Relaxed);
        }
        header.gc_prev.store(0, Ordering::Relaxed);
        header.gc_next.store(0, Ordering::Relaxed);
        drop(head);
        self.live.fetch_sub(1, Ordering::Relaxed);
    }

    /// Whether the object is on the tracked list.
    pub fn is_tracked(&self, obj: Obj) -> bool {
        obj.header().gc_prev.load(Ordering::Relaxed) & GC_TRACKED != 0
    }

    /// Visit every tracked object. Only sound while the world is
    /// stopped.
    pub fn for_each_tracked(&self, mut f: impl FnMut(Obj)) {
        let head = self.list.lock().unwrap();
        let mut cur = *head;
        while cur != 0 {
            let obj = unsafe { Obj::from_addr(cur as u64) };
            f(obj);
            cur = obj.header().gc_next.load(Ordering::Relaxed);
        }
    }

    /// Park the calling thread until the stop-the-world round ends.
    pub(crate) fn park(&self, tid: u64) {
        let mut round = self.stop.lock().unwrap();
        if !round.active {
            return;
        }
        tracing::trace!(target: "quill::gc", tid, "thread parked for collection");
        round.parked += 1;
        self.cv.notify_all();
        let generation = round.generation;
        while round.active && round.generation == generation {
            round = self.cv.wait(round).unwrap();
        }
        round.parked -= 1;
        self.cv.notify_all();
    }

    /// Begin a round, waiting for `expected` peers to park.
    pub(crate) fn begin_stop(&self, expected: usize) {
        let mut round = self.stop.lock().unwrap();
        assert!(!round.active, "nested stop-the-world");
        round.active = true;
        while round.parked < expected {
            round = self.cv.wait(round).unwrap();
        }
    }

    /// End the round and wait until every parked thread resumed.
    pub(crate) fn end_stop(&self) {
        let mut round = self.stop.lock().unwrap();
        round.active = false;
        round.generation += 1;
        self.cv.notify_all();
        while round.parked > 0 {
            round = self.cv.wait(round).unwrap();
        }
    }
}

/// Unconditional untrack used on the destruction path.
pub(crate) fn untrack(obj: Obj) {
    // Fast path without taking the list lock when never tracked.
    if obj.header().gc_prev.load(Ordering::Relaxed) & GC_TRACKED == 0 {
        return;
    }
    state().untrack(obj);
}
