//! Biased and deferred reference counting
//!
//! Each object carries two count words. The *local* word is only
//! mutated by the owning thread, without atomic read-modify-write. The
//! *shared* word is mutated atomically by everyone else. When the local
//! count reaches zero on the owning thread the two are merged, the
//! shared word becomes authoritative (`MERGED`), and the object dies
//! when the merged total reaches zero.
//!
//! Objects flagged `IMMORTAL` ignore counting entirely. Objects flagged
//! `DEFERRED` (code objects, top-level functions, module globals) elide
//! counting as well; the tracing collector owns their true count.
//!
//! Contract: a successful increment keeps the object alive until the
//! matching decrement; no decrement may run while a critical section
//! over the object is held unless the caller accepts implicit release.

use crate::object::{Obj, ObjectHeader, ObjRef};
use crate::raw;
use core::sync::atomic::AtomicPtr;
use std::sync::{Arc, Mutex, OnceLock};

/// Shift of the count in the local word.
pub const LOCAL_SHIFT: u32 = 2;
/// Local flag: the object is never deallocated.
pub const IMMORTAL: u32 = 0b01;
/// Local flag: refcount changes are elided; the GC owns the count.
pub const DEFERRED: u32 = 0b10;
/// Mask of the local flag bits.
pub const LOCAL_FLAGS: u32 = 0b11;

/// Shift of the count in the shared word.
pub const SHARED_SHIFT: u32 = 2;
/// Shared flag: a weak reference may exist.
pub const MAYBE_WEAKREF: u32 = 0b01;
/// Shared flag: local and shared counts have been combined.
pub const MERGED: u32 = 0b10;
/// Mask of the shared flag bits.
pub const SHARED_FLAGS: u32 = 0b11;

#[inline(always)]
fn local_flags(header: &ObjectHeader) -> u32 {
    raw::load_u32_relaxed(&header.ref_local) & LOCAL_FLAGS
}

#[inline(always)]
fn owned_by_current(header: &ObjectHeader) -> bool {
    header.tid.load(core::sync::atomic::Ordering::Relaxed) == raw::thread_id()
}

/// Whether the object is immortal.
#[inline(always)]
pub fn is_immortal(obj: Obj) -> bool {
    local_flags(obj.header()) & IMMORTAL != 0
}

/// Whether the object uses deferred (GC-owned) counting.
#[inline(always)]
pub fn is_deferred(obj: Obj) -> bool {
    local_flags(obj.header()) & DEFERRED != 0
}

/// Mark an object immortal. Irreversible.
pub fn make_immortal(obj: Obj) {
    let header = obj.header();
    let v = raw::load_u32_relaxed(&header.ref_local);
    raw::store_u32_relaxed(&header.ref_local, v | IMMORTAL);
}

/// Switch the object to deferred counting. Only valid on the owning
/// thread, before the object is shared.
pub fn make_deferred(obj: Obj) {
    let header = obj.header();
    debug_assert!(owned_by_current(header) || is_immortal(obj));
    let v = raw::load_u32_relaxed(&header.ref_local);
    raw::store_u32_relaxed(&header.ref_local, v | DEFERRED);
}

/// Acquire one reference.
#[inline]
pub fn incref(obj: Obj) {
    let header = obj.header();
    let local = raw::load_u32_relaxed(&header.ref_local);
    if local & LOCAL_FLAGS != 0 {
        return;
    }
    if owned_by_current(header) {
        raw::store_u32_relaxed(&header.ref_local, local + (1 << LOCAL_SHIFT));
    } else {
        incref_shared_slow(header);
    }
}

#[cold]
fn incref_shared_slow(header: &ObjectHeader) {
    // First shared reference optimistically records that a weak
    // reference may exist; see §MAYBE_WEAKREF contract.
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        let mut next = shared + (1 << SHARED_SHIFT);
        if shared & SHARED_FLAGS == 0 && shared >> SHARED_SHIFT == 0 {
            next |= MAYBE_WEAKREF;
        }
        if raw::cas_u32(&header.ref_shared, shared, next) {
            return;
        }
    }
}

/// Release one reference. May destroy the object.
#[inline]
pub fn decref(obj: Obj) {
    let header = obj.header();
    let local = raw::load_u32_relaxed(&header.ref_local);
    if local & LOCAL_FLAGS != 0 {
        return;
    }
    if owned_by_current(header) {
        debug_assert!(local >> LOCAL_SHIFT > 0, "local refcount underflow");
        let next = local - (1 << LOCAL_SHIFT);
        raw::store_u32_relaxed(&header.ref_local, next);
        if next >> LOCAL_SHIFT == 0 {
            merge_and_maybe_destroy(obj, 0);
        }
    } else {
        decref_shared_slow(obj);
    }
}

#[cold]
fn decref_shared_slow(obj: Obj) {
    let header = obj.header();
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        if shared >> SHARED_SHIFT == 0 {
            // The count this reference took lives in the owner's local
            // word. Hand the reference over for an explicit merge.
            debug_assert_eq!(shared & MERGED, 0, "decref of a dead object");
            hand_off_to_owner(obj);
            return;
        }
        let next = shared - (1 << SHARED_SHIFT);
        if raw::cas_u32(&header.ref_shared, shared, next) {
            if next >> SHARED_SHIFT == 0 && next & MERGED != 0 {
                destroy(obj);
            }
            return;
        }
    }
}

/// Merge the local count into the shared word, making it authoritative.
/// Destroys the object if the merged total is zero. Only the owning
/// thread may call this.
pub fn merge(obj: Obj) {
    let header = obj.header();
    if local_flags(header) != 0 {
        return;
    }
    debug_assert!(owned_by_current(header));
    let local = raw::load_u32_relaxed(&header.ref_local);
    raw::store_u32_relaxed(&header.ref_local, 0);
    merge_and_maybe_destroy(obj, local >> LOCAL_SHIFT);
}

#[cold]
fn merge_and_maybe_destroy(obj: Obj, carried: u32) {
    let header = obj.header();
    header.tid.store(0, core::sync::atomic::Ordering::Relaxed);
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        let next = (shared | MERGED) + (carried << SHARED_SHIFT);
        if raw::cas_u32(&header.ref_shared, shared, next) {
            if next >> SHARED_SHIFT == 0 {
                destroy(obj);
            }
            return;
        }
    }
}

/// Optimistic acquisition: succeeds iff the object is uncounted or
/// owned by the current thread. Used at speculative points before
/// falling back to [`try_incref_shared`].
#[inline]
pub fn try_incref_fast(obj: Obj) -> bool {
    let header = obj.header();
    let local = raw::load_u32_relaxed(&header.ref_local);
    if local & LOCAL_FLAGS != 0 {
        return true;
    }
    if owned_by_current(header) {
        raw::store_u32_relaxed(&header.ref_local, local + (1 << LOCAL_SHIFT));
        return true;
    }
    false
}

/// Shared-word acquisition: fails when the count is zero or the object
/// is already merged and dying.
#[inline]
pub fn try_incref_shared(obj: Obj) -> bool {
    let header = obj.header();
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        // A zero count with no weakref hint was never published to this
        // thread; a zero count with MERGED set is a dying object.
        if shared == 0 || shared == MERGED {
            return false;
        }
        if raw::cas_u32(&header.ref_shared, shared, shared + (1 << SHARED_SHIFT)) {
            return true;
        }
    }
}

/// Acquire a reference to `obj` and verify `slot` still publishes it.
/// The shared path revalidates; the fast path cannot race destruction
/// because only the owning thread merges.
#[inline]
pub fn try_acquire(slot: &AtomicPtr<ObjectHeader>, obj: Obj) -> bool {
    if try_incref_fast(obj) {
        return true;
    }
    if !try_incref_shared(obj) {
        return false;
    }
    if raw::load_ptr_acquire(slot) != obj.as_ptr() {
        decref(obj);
        return false;
    }
    true
}

/// Atomically load a pointer slot and acquire a reference, retrying on
/// races with concurrent updates. Returns `None` for a null slot.
pub fn fetch_ref(slot: &AtomicPtr<ObjectHeader>) -> Option<ObjRef> {
    loop {
        let ptr = raw::load_ptr_acquire(slot);
        if ptr.is_null() {
            return None;
        }
        let obj = unsafe { Obj::from_ptr(ptr) };
        if try_acquire(slot, obj) {
            return Some(unsafe { ObjRef::from_raw(obj) });
        }
    }
}

/// Record that a weak reference to the object may exist.
pub fn set_maybe_weakref(obj: Obj) {
    let header = obj.header();
    if is_immortal(obj) {
        return;
    }
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        if shared & SHARED_FLAGS != 0 {
            return;
        }
        if raw::cas_u32(&header.ref_shared, shared, shared | MAYBE_WEAKREF) {
            return;
        }
    }
}

/// Pack an object into a register, acquiring a reference unless the
/// object is uncounted (in which case the register is a free alias).
#[inline]
pub fn pack_incref(obj: Obj) -> crate::value::Register {
    let header = obj.header();
    let local = raw::load_u32_relaxed(&header.ref_local);
    if local & LOCAL_FLAGS != 0 {
        return crate::value::Register::alias(obj);
    }
    if owned_by_current(header) {
        raw::store_u32_relaxed(&header.ref_local, local + (1 << LOCAL_SHIFT));
    } else {
        incref_shared_slow(header);
    }
    crate::value::Register::owned(obj)
}

/// Drop the reference a register carries, if it owns one.
#[inline]
pub fn clear_register(reg: crate::value::Register) {
    if reg.is_owned() {
        decref(reg.as_obj());
    }
}

/* EXPLICIT-MERGE HANDOFF */

/// Objects whose last foreign reference died are queued to their owning
/// thread, which releases them on its own biased word at the next safe
/// point (the `MERGE_REQUEST` breaker bit).
pub(crate) struct MergeTarget {
    queue: Mutex<Vec<usize>>,
    shared: Arc<crate::thread::ThreadShared>,
}

fn merge_registry() -> &'static Mutex<hashbrown::HashMap<u64, Arc<MergeTarget>>> {
    static REGISTRY: OnceLock<Mutex<hashbrown::HashMap<u64, Arc<MergeTarget>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(hashbrown::HashMap::new()))
}

/// Register a thread as a merge target.
pub(crate) fn register_merge_target(
    tid: u64,
    shared: Arc<crate::thread::ThreadShared>,
) -> Arc<MergeTarget> {
    let target = Arc::new(MergeTarget {
        queue: Mutex::new(Vec::new()),
        shared,
    });
    merge_registry()
        .lock()
        .unwrap()
        .insert(tid, Arc::clone(&target));
    target
}

/// Drop a thread from the registry. The caller drains its queue first.
pub(crate) fn unregister_merge_target(tid: u64) {
    merge_registry().lock().unwrap().remove(&tid);
}

/// Release every reference handed to this thread for merging.
pub(crate) fn drain_merge_queue(target: &MergeTarget) {
    loop {
        let batch: Vec<usize> = {
            let mut queue = target.queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }
            queue.drain(..).collect()
        };
        for addr in batch {
            // Each entry owns one reference; we are the owning thread,
            // so this runs the biased path and the merge if it hits 0.
            decref(unsafe { Obj::from_addr(addr as u64) });
        }
    }
}

/// Hand one owned reference to the owning thread's merge queue, or
/// merge in place when the owner has detached.
fn hand_off_to_owner(obj: Obj) {
    let header = obj.header();
    let registry = merge_registry().lock().unwrap();
    let owner = header.tid.load(core::sync::atomic::Ordering::Relaxed);
    if let Some(target) = registry.get(&owner) {
        target.queue.lock().unwrap().push(obj.addr());
        target
            .shared
            .post(crate::thread::Breaker::MERGE_REQUEST);
        return;
    }
    drop(registry);
    orphan_merge(obj);
}

/// Merge on behalf of a detached owner. The registry lock serializes
/// foreign threads reaching this path; nobody else writes the local
/// word once the owner is gone.
fn orphan_merge(obj: Obj) {
    let header = obj.header();
    header.tid.store(0, core::sync::atomic::Ordering::Relaxed);
    let local = raw::load_u32_relaxed(&header.ref_local);
    debug_assert!(local >> LOCAL_SHIFT >= 1, "handed-off reference missing");
    raw::store_u32_relaxed(&header.ref_local, 0);
    // Carry the local count minus the reference being released.
    let carried = (local >> LOCAL_SHIFT) - 1;
    loop {
        let shared = raw::load_u32_relaxed(&header.ref_shared);
        let next = (shared | MERGED).wrapping_add(carried << SHARED_SHIFT);
        if raw::cas_u32(&header.ref_shared, shared, next) {
            if next >> SHARED_SHIFT == 0 {
                destroy(obj);
            }
            return;
        }
    }
}

/// Current local count, for assertions and tests.
pub fn local_count(obj: Obj) -> u32 {
    raw::load_u32_relaxed(&obj.header().ref_local) >> LOCAL_SHIFT
}

/// Current shared count, for assertions and tests.
pub fn shared_count(obj: Obj) -> u32 {
    raw::load_u32_relaxed(&obj.header().ref_shared) >> SHARED_SHIFT
}

fn destroy(obj: Obj) {
    crate::gc::untrack(obj);
    let drop_fn = obj.type_of().drop_fn;
    unsafe { drop_fn(obj) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{TypeFlags, TypeObject, TypeSlots};
    use core::sync::atomic::{AtomicUsize, Ordering};

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn counting_drop(obj: Obj) {
        DROPS.fetch_add(1, Ordering::SeqCst);
        drop(Box::from_raw(obj.as_ptr()));
    }

    fn test_type() -> &'static TypeObject {
        Box::leak(Box::new(TypeObject::make(
            core::ptr::null(),
            "rc-test".into(),
            TypeFlags::empty(),
            TypeSlots::EMPTY,
            counting_drop,
            None,
        )))
    }

    fn fresh(ty: &'static TypeObject) -> Obj {
        let header = ObjectHeader::new(ty, raw::thread_id());
        let boxed = Box::into_raw(Box::new(header));
        unsafe { Obj::from_ptr(boxed) }
    }

    #[test]
    fn local_incref_decref_balances() {
        let ty = test_type();
        let obj = fresh(ty);
        assert_eq!(local_count(obj), 1);
        incref(obj);
        incref(obj);
        assert_eq!(local_count(obj), 3);
        decref(obj);
        decref(obj);
        assert_eq!(local_count(obj), 1);
        let before = DROPS.load(Ordering::SeqCst);
        decref(obj);
        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn immortal_ignores_counting() {
        let ty = test_type();
        let obj = fresh(ty);
        make_immortal(obj);
        let before = DROPS.load(Ordering::SeqCst);
        for _ in 0..64 {
            decref(obj);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), before);
        assert!(try_incref_fast(obj));
    }

    #[test]
    fn foreign_decref_defers_to_merge() {
        let ty = test_type();
        let obj = fresh(ty);
        incref(obj); // count 2, both local
        let addr = obj.addr();
        std::thread::spawn(move || {
            let obj = unsafe { Obj::from_addr(addr as u64) };
            // Foreign thread: routes through the shared word.
            incref(obj);
            decref(obj);
        })
        .join()
        .unwrap();
        // Shared word saw +1/-1; object still alive with 2 local refs.
        assert_eq!(local_count(obj), 2);
        let before = DROPS.load(Ordering::SeqCst);
        decref(obj);
        decref(obj);
        assert_eq!(DROPS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn try_incref_shared_fails_on_merged_zero() {
        let ty = test_type();
        let obj = fresh(ty);
        // Simulate a foreign observer of a dying object.
        let header = obj.header();
        raw::store_u32_relaxed(&header.ref_shared, MERGED);
        assert!(!try_incref_shared(obj));
        // Cleanup without the merge path.
        raw::store_u32_relaxed(&header.ref_shared, 0);
        let _ = unsafe { Box::from_raw(obj.as_ptr()) };
    }
}
