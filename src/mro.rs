//! Per-type method-resolution cache
//!
//! Each type carries a small hash table from interned name to resolved
//! attribute. Reads are lock-free: relaxed loads over a published bucket
//! array. Writes happen under the process-wide MRO mutex and never
//! mutate a bucket a reader could be probing incoherently: growth
//! allocates a fresh (empty) array, publishes it with a release store,
//! and retires the old one through QSBR. Erase swaps in a shared
//! refcounted empty array so invalidation allocates nothing.
//!
//! A value word of 0 means "slot being written, treat as miss"; the low
//! bit set means "known absent"; otherwise the word is a borrowed
//! pointer to the attribute, kept alive by the bucket array itself.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use crate::object::{Obj, ObjectHeader};
use crate::qsbr::{Qsbr, RetireList};
use crate::rc;

const MIN_CAPACITY: usize = crate::consts::MRO_CACHE_MIN_CAPACITY;
const MAX_CAPACITY: usize = 65536;

struct Entry {
    name: AtomicPtr<ObjectHeader>,
    value: AtomicUsize,
}

struct Buckets {
    /// Entry count; the probe mask is `capacity - 1`.
    capacity: usize,
    /// Sharers of the process-wide empty array; 1 for ordinary arrays.
    refcount: AtomicUsize,
    /// Unused entries before the next insert forces growth.
    available: AtomicU32,
    /// Occupied entries.
    used: AtomicU32,
    entries: Box<[Entry]>,
}

impl Buckets {
    fn new(capacity: usize) -> *mut Buckets {
        let entries = (0..capacity)
            .map(|_| Entry {
                name: AtomicPtr::new(core::ptr::null_mut()),
                value: AtomicUsize::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Box::into_raw(Box::new(Buckets {
            capacity,
            refcount: AtomicUsize::new(1),
            available: AtomicU32::new((capacity * 7 / 8) as u32),
            used: AtomicU32::new(0),
            entries,
        }))
    }

    /// A placeholder with no usable slots: every insert forces a real
    /// allocation, every lookup misses.
    fn new_empty(capacity: usize) -> *mut Buckets {
        let b = Self::new(capacity);
        unsafe { (*b).available.store(0, Ordering::Relaxed) };
        b
    }

    fn is_empty_placeholder(&self) -> bool {
        self.available.load(Ordering::Relaxed) == 0 && self.used.load(Ordering::Relaxed) == 0
    }
}

/// Pointer wrapper so retire closures can move bucket arrays across
/// threads.
struct SendBuckets(*mut Buckets);
unsafe impl Send for SendBuckets {}

/// Answer of a cache probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheAnswer {
    /// Nothing cached for this name; resolve through the MRO and insert.
    Miss,
    /// Cached "attribute does not exist".
    Absent,
    /// Cached attribute. Borrowed from the bucket array; acquire a
    /// reference before any suspension point.
    Hit(Obj),
}

/// Process-wide cache state, guarded by the runtime MRO mutex.
pub struct MroState {
    empty_buckets: *mut Buckets,
    empty_capacity: usize,
    /// Deferred bucket frees, flushed at safe points.
    pub(crate) retired: RetireList,
}

unsafe impl Send for MroState {}

impl MroState {
    /// Bring-up: allocate the shared empty array.
    pub fn new() -> MroState {
        MroState {
            empty_buckets: Buckets::new_empty(MIN_CAPACITY),
            empty_capacity: MIN_CAPACITY,
            retired: RetireList::new(),
        }
    }

    fn ensure_empty_capacity(&mut self, capacity: usize, qsbr: &Qsbr) {
        if capacity <= self.empty_capacity {
            return;
        }
        let old = self.empty_buckets;
        self.empty_buckets = Buckets::new_empty(capacity);
        self.empty_capacity = capacity;
        release_buckets(old, &mut self.retired, qsbr);
    }

    /// Teardown: drop the shared empty array once no type references it.
    pub fn teardown(&mut self) {
        let old = self.empty_buckets;
        self.empty_buckets = core::ptr::null_mut();
        unsafe {
            if (*old).refcount.fetch_sub(1, Ordering::Relaxed) == 1 {
                drop(Box::from_raw(old));
            }
        }
        self.retired.flush_all();
    }
}

impl Default for MroState {
    fn default() -> Self {
        Self::new()
    }
}

fn release_buckets(buckets: *mut Buckets, retired: &mut RetireList, qsbr: &Qsbr) {
    unsafe {
        if (*buckets).is_empty_placeholder() {
            // Shared placeholder: drop one reference; free via QSBR when
            // the last sharer lets go.
            if (*buckets).refcount.fetch_sub(1, Ordering::Relaxed) != 1 {
                return;
            }
        }
    }
    let ptr = SendBuckets(buckets);
    // Readers may still probe the array until the grace period ends;
    // only then are the cached references dropped.
    // (The closure runs on whichever thread flushes the list.)
    retired_free(ptr, retired, qsbr);
}

fn retired_free(ptr: SendBuckets, retired: &mut RetireList, qsbr: &Qsbr) {
    retired.retire(
        qsbr,
        Box::new(move || {
            let ptr = ptr;
            let buckets = ptr.0;
            unsafe {
                for entry in (*buckets).entries.iter() {
                    let word = entry.value.load(Ordering::Relaxed);
                    if word > 1 && word & 1 == 0 {
                        rc::decref(Obj::from_addr(word as u64));
                    }
                }
                drop(Box::from_raw(buckets));
            }
        }),
    );
}

/// The per-type cache: a published bucket array plus its probe mask.
pub struct MroCache {
    /// `capacity - 1`. Published after the bucket pointer.
    mask: AtomicU32,
    buckets: AtomicPtr<Buckets>,
}

impl MroCache {
    /// An unattached cache; every lookup misses until
    /// [`init`](Self::init).
    pub const fn new() -> MroCache {
        MroCache {
            mask: AtomicU32::new(0),
            buckets: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Attach the shared empty array. Runs under the MRO mutex during
    /// type readying.
    pub(crate) fn init(&self, state: &mut MroState) {
        if !crate::raw::load_ptr_relaxed(&self.buckets).is_null() {
            return;
        }
        unsafe {
            (*state.empty_buckets).refcount.fetch_add(1, Ordering::Relaxed);
        }
        crate::raw::store_ptr_release(&self.buckets, state.empty_buckets);
        self.mask
            .store((state.empty_capacity - 1) as u32, Ordering::Release);
    }

    /// Lock-free probe. `name` must be an interned string with a stored
    /// hash.
    pub fn lookup(&self, name: Obj) -> CacheAnswer {
        let mask = self.mask.load(Ordering::Acquire) as usize;
        let buckets = crate::raw::load_ptr_relaxed(&self.buckets);
        if buckets.is_null() {
            return CacheAnswer::Miss;
        }
        let entries = unsafe { &(*buckets).entries };
        // A stale mask/bucket pair can only shrink the probed range;
        // clamp so the index is in bounds either way.
        let clamp = entries.len() - 1;
        let hash = crate::object::string::cached_hash(name);
        let start = (hash as usize & mask) & clamp;

        let name_ptr = name.as_ptr();
        // First pass: from the start bucket backwards to the base.
        let mut ix = start;
        loop {
            match probe(entries, ix, name_ptr) {
                Probe::Empty => return CacheAnswer::Miss,
                Probe::Found(answer) => return answer,
                Probe::Other => {}
            }
            if ix == 0 {
                break;
            }
            ix -= 1;
        }
        // Second pass: from the top backwards to the base.
        let mut ix = mask & clamp;
        loop {
            match probe(entries, ix, name_ptr) {
                Probe::Empty => return CacheAnswer::Miss,
                Probe::Found(answer) => return answer,
                Probe::Other => {}
            }
            if ix == 0 {
                return CacheAnswer::Miss;
            }
            ix -= 1;
        }
    }

    /// Insert a resolution (or a known absence). Under the MRO mutex.
    pub(crate) fn insert(
        &self,
        state: &mut MroState,
        qsbr: &Qsbr,
        name: Obj,
        value: Option<Obj>,
    ) {
        let mut buckets = crate::raw::load_ptr_relaxed(&self.buckets);
        debug_assert!(!buckets.is_null(), "insert into uninitialized cache");
        unsafe {
            if (*buckets).available.load(Ordering::Relaxed) == 0 {
                if !self.grow(state, qsbr) {
                    // Over the size cap: skip caching this name.
                    return;
                }
                buckets = crate::raw::load_ptr_relaxed(&self.buckets);
            }
            let entries = &(*buckets).entries;
            let mask = (*buckets).capacity - 1;
            let hash = crate::object::string::cached_hash(name);
            let mut ix = hash as usize & mask;
            loop {
                let slot_name = entries[ix].name.load(Ordering::Relaxed);
                if slot_name.is_null() {
                    let word = match value {
                        Some(v) => {
                            rc::incref(v);
                            v.addr()
                        }
                        None => 1,
                    };
                    // Value first, then the name with release, so a
                    // reader that sees the name sees a complete entry.
                    entries[ix].value.store(word, Ordering::Relaxed);
                    entries[ix].name.store(name.as_ptr(), Ordering::Release);
                    (*buckets).available.fetch_sub(1, Ordering::Relaxed);
                    (*buckets).used.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                if slot_name == name.as_ptr() {
                    // Raced with another resolver; first one wins.
                    return;
                }
                ix = if ix == 0 { mask } else { ix - 1 };
            }
        }
    }

    /// Drop every cached entry by swapping in the shared empty array.
    /// Under the MRO mutex.
    pub(crate) fn erase(&self, state: &mut MroState, qsbr: &Qsbr) {
        let old = crate::raw::load_ptr_relaxed(&self.buckets);
        if old.is_null() {
            return;
        }
        unsafe {
            if (*old).is_empty_placeholder() {
                return;
            }
        }
        unsafe {
            (*state.empty_buckets).refcount.fetch_add(1, Ordering::Relaxed);
        }
        // The replacement placeholder is never larger than what grow()
        // guaranteed, so the published mask stays valid.
        crate::raw::store_ptr_release(&self.buckets, state.empty_buckets);
        release_buckets(old, &mut state.retired, qsbr);
        tracing::trace!(target: "quill::mro", "cache erased");
    }

    fn grow(&self, state: &mut MroState, qsbr: &Qsbr) -> bool {
        let old = crate::raw::load_ptr_relaxed(&self.buckets);
        let (old_capacity, was_placeholder) =
            unsafe { ((*old).capacity, (*old).used.load(Ordering::Relaxed) == 0) };
        // The placeholder grows into a real array of the same size; a
        // full array doubles.
        let new_capacity = if was_placeholder {
            old_capacity
        } else {
            old_capacity * 2
        };
        if new_capacity > MAX_CAPACITY {
            return false;
        }
        state.ensure_empty_capacity(new_capacity, qsbr);
        let new = Buckets::new(new_capacity);
        crate::raw::store_ptr_release(&self.buckets, new);
        self.mask.store((new_capacity - 1) as u32, Ordering::Release);
        release_buckets(old, &mut state.retired, qsbr);
        true
    }
}

enum Probe {
    Empty,
    Other,
    Found(CacheAnswer),
}

#[inline(always)]
fn probe(entries: &[Entry], ix: usize, name: *mut ObjectHeader) -> Probe {
    let slot = entries[ix].name.load(Ordering::Acquire);
    if slot.is_null() {
        return Probe::Empty;
    }
    if slot != name {
        return Probe::Other;
    }
    let word = entries[ix].value.load(Ordering::Relaxed);
    Probe::Found(match word {
        0 => CacheAnswer::Miss,
        1 => CacheAnswer::Absent,
        _ if word & 1 == 1 => CacheAnswer::Absent,
        _ => CacheAnswer::Hit(unsafe { Obj::from_addr(word as u64) }),
    })
}
