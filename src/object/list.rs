//! List objects
//!
//! The element vector is guarded by the object's own lock: every
//! mutating accessor opens a critical section, readers that only touch
//! a single slot do the same. The vector is never exposed across a
//! suspension point.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ExcKind, ExecResult};
use crate::object::{CmpOp, IterNext, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct ListObject {
    base: ObjectHeader,
    items: UnsafeCell<Vec<ObjRef>>,
}

/// Allocate a list from owned elements.
pub fn new(ts: &mut ThreadState, items: Vec<ObjRef>) -> ObjRef {
    let ty = ts.rt().types.list;
    ts.alloc_gc(ListObject {
        base: ObjectHeader::new(ty, ts.id()),
        items: UnsafeCell::new(items),
    })
}

/// The element vector. Caller must hold the object's critical section
/// or otherwise exclude writers.
pub(crate) unsafe fn items_unlocked<'a>(obj: Obj) -> &'a mut Vec<ObjRef> {
    let payload: &ListObject = obj.payload();
    &mut *payload.items.get()
}

/// Element count, taken under the lock.
pub fn len(ts: &mut ThreadState, obj: Obj) -> usize {
    let id = ts.sections.begin(obj.mutex());
    let n = unsafe { items_unlocked(obj).len() };
    ts.sections.end(id);
    n
}

/// Append one owned element.
pub fn append(ts: &mut ThreadState, obj: Obj, value: ObjRef) {
    let id = ts.sections.begin(obj.mutex());
    unsafe { items_unlocked(obj).push(value) };
    ts.sections.end(id);
}

/// Extend from any iterable, driving the iterator protocol.
pub fn extend(ts: &mut ThreadState, obj: Obj, iterable: Obj) -> ExecResult<()> {
    let iter = crate::interpreter::iter::get_iter(ts, iterable)?;
    loop {
        match crate::interpreter::iter::iter_next(ts, iter.as_obj())? {
            IterNext::Yield(item) => append(ts, obj, item),
            IterNext::Done(_) => return Ok(()),
        }
    }
}

/// Snapshot the elements (used by extended calls and unpacking).
pub fn snapshot(ts: &mut ThreadState, obj: Obj) -> Vec<ObjRef> {
    let id = ts.sections.begin(obj.mutex());
    let copy = unsafe { items_unlocked(obj).clone() };
    ts.sections.end(id);
    copy
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<ListObject>(obj);
}

fn list_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    // Traversal runs with the world stopped; no lock needed.
    for item in unsafe { items_unlocked(obj).iter() } {
        visit(item.as_obj());
    }
}

fn resolve_index(len: usize, idx: i64) -> Option<usize> {
    let resolved = if idx < 0 { idx + len as i64 } else { idx };
    usize::try_from(resolved).ok().filter(|i| *i < len)
}

fn list_subscr(ts: &mut ThreadState, obj: Obj, key: Obj) -> ExecResult<ObjRef> {
    if !super::number::is_int(ts, key) {
        return Err(ts.raise(ExcKind::TypeError, "list indices must be integers"));
    }
    let idx = super::number::int_value(key);
    let id = ts.sections.begin(obj.mutex());
    let found = resolve_index(unsafe { items_unlocked(obj).len() }, idx)
        .map(|i| unsafe { items_unlocked(obj)[i].clone() });
    ts.sections.end(id);
    match found {
        Some(item) => Ok(item),
        None => Err(ts.raise(ExcKind::IndexError, "list index out of range")),
    }
}

fn list_set_subscr(
    ts: &mut ThreadState,
    obj: Obj,
    key: Obj,
    value: Option<Obj>,
) -> ExecResult<()> {
    if !super::number::is_int(ts, key) {
        return Err(ts.raise(ExcKind::TypeError, "list indices must be integers"));
    }
    let idx = super::number::int_value(key);
    let id = ts.sections.begin(obj.mutex());
    let ok = {
        let items = unsafe { items_unlocked(obj) };
        match resolve_index(items.len(), idx) {
            Some(i) => {
                match value {
                    Some(v) => items[i] = ObjRef::new(v),
                    None => drop(items.remove(i)),
                }
                true
            }
            None => false,
        }
    };
    ts.sections.end(id);
    if ok {
        Ok(())
    } else {
        Err(ts.raise(ExcKind::IndexError, "list assignment index out of range"))
    }
}

fn list_contains(ts: &mut ThreadState, obj: Obj, item: Obj) -> ExecResult<bool> {
    // Snapshot first: the comparison may suspend and mutate the list.
    let elements = snapshot(ts, obj);
    for element in &elements {
        if crate::interpreter::arith::eq_bool(ts, element.as_obj(), item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn list_richcompare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<Option<ObjRef>> {
    if !b.is_exact(ts.rt().types.list) || !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Ok(None);
    }
    let (xs, ys) = (snapshot(ts, a), snapshot(ts, b));
    let mut equal = xs.len() == ys.len();
    if equal {
        for (x, y) in xs.iter().zip(ys.iter()) {
            if !crate::interpreter::arith::eq_bool(ts, x.as_obj(), y.as_obj())? {
                equal = false;
                break;
            }
        }
    }
    let answer = if matches!(op, CmpOp::Eq) { equal } else { !equal };
    Ok(Some(ts.bool_ref(answer)))
}

fn list_concat(ts: &mut ThreadState, a: Obj, b: Obj) -> ExecResult<Option<ObjRef>> {
    if !a.is_exact(ts.rt().types.list) || !b.is_exact(ts.rt().types.list) {
        return Ok(None);
    }
    let mut out = snapshot(ts, a);
    out.extend(snapshot(ts, b));
    Ok(Some(new(ts, out)))
}

fn list_inplace_concat(ts: &mut ThreadState, a: Obj, b: Obj) -> ExecResult<Option<ObjRef>> {
    if !a.is_exact(ts.rt().types.list) {
        return Ok(None);
    }
    extend(ts, a, b)?;
    Ok(Some(ObjRef::new(a)))
}

fn list_bool(ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(len(ts, obj) != 0)
}

fn list_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let ty = ts.rt().types.list_iter;
    Ok(ts.alloc_obj(ListIterObject {
        base: ObjectHeader::new(ty, ts.id()),
        list: ObjRef::new(obj),
        pos: AtomicUsize::new(0),
    }))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.binary[crate::object::BinOp::Add as usize] = Some(list_concat);
    number.inplace[crate::object::BinOp::Add as usize] = Some(list_inplace_concat);
    number.bool_ = Some(list_bool);
    TypeSlots {
        richcompare: Some(list_richcompare),
        number,
        subscr: Some(list_subscr),
        set_subscr: Some(list_set_subscr),
        contains: Some(list_contains),
        iter: Some(list_iter),
        traverse: Some(list_traverse),
        ..TypeSlots::EMPTY
    }
}

/* ITERATOR */

#[repr(C)]
pub struct ListIterObject {
    base: ObjectHeader,
    list: ObjRef,
    pos: AtomicUsize,
}

pub(crate) unsafe fn drop_iter(obj: Obj) {
    crate::heap::free_object::<ListIterObject>(obj);
}

fn list_iter_next(ts: &mut ThreadState, obj: Obj) -> ExecResult<IterNext> {
    let payload: &ListIterObject = unsafe { obj.payload() };
    let pos = payload.pos.fetch_add(1, Ordering::Relaxed);
    let list = payload.list.as_obj();
    let id = ts.sections.begin(list.mutex());
    let item = unsafe { items_unlocked(list).get(pos).cloned() };
    ts.sections.end(id);
    match item {
        Some(item) => Ok(IterNext::Yield(item)),
        None => Ok(IterNext::Done(None)),
    }
}

fn identity_iter(_ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(ObjRef::new(obj))
}

pub(crate) fn iter_slots() -> TypeSlots {
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(list_iter_next),
        ..TypeSlots::EMPTY
    }
}
