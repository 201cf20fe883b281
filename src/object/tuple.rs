//! Tuple objects

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{ExcKind, ExecResult};
use crate::object::{CmpOp, IterNext, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct TupleObject {
    base: ObjectHeader,
    items: Box<[ObjRef]>,
}

/// Allocate a tuple from owned elements. Empty tuples collapse to the
/// shared singleton.
pub fn new(ts: &mut ThreadState, items: Vec<ObjRef>) -> ObjRef {
    if items.is_empty() {
        return ObjRef::new(ts.rt().singletons.empty_tuple);
    }
    let ty = ts.rt().types.tuple;
    ts.alloc_gc(TupleObject {
        base: ObjectHeader::new(ty, ts.id()),
        items: items.into_boxed_slice(),
    })
}

/// Immortal payload for the empty-tuple singleton.
pub(crate) fn make_empty(ty: &'static crate::object::TypeObject) -> TupleObject {
    TupleObject {
        base: ObjectHeader::new_immortal(ty),
        items: Box::new([]),
    }
}

/// Immortal tuple payload, for bring-up structures (MRO chains).
pub(crate) fn make_immortal_tuple(
    ty: &'static crate::object::TypeObject,
    items: Vec<ObjRef>,
) -> TupleObject {
    TupleObject {
        base: ObjectHeader::new_immortal(ty),
        items: items.into_boxed_slice(),
    }
}

/// The elements. Tuples are immutable, so the borrow is safe for any
/// holder of a reference.
pub fn items<'a>(obj: Obj) -> &'a [ObjRef] {
    let payload: &TupleObject = unsafe { obj.payload() };
    &payload.items
}

/// Element count.
pub fn len(obj: Obj) -> usize {
    items(obj).len()
}

/// A new tuple with `first` prepended; used by bound-method extended
/// calls.
pub fn prepend(ts: &mut ThreadState, first: ObjRef, rest: Obj) -> ObjRef {
    let mut out = Vec::with_capacity(1 + len(rest));
    out.push(first);
    out.extend(items(rest).iter().cloned());
    new(ts, out)
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<TupleObject>(obj);
}

fn tuple_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    for item in items(obj) {
        visit(item.as_obj());
    }
}

fn tuple_richcompare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<Option<ObjRef>> {
    if !b.is_exact(ts.rt().types.tuple) {
        return Ok(None);
    }
    if !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Ok(None);
    }
    let mut equal = len(a) == len(b);
    if equal {
        for i in 0..len(a) {
            let (x, y) = (items(a)[i].as_obj(), items(b)[i].as_obj());
            if !crate::interpreter::arith::eq_bool(ts, x, y)? {
                equal = false;
                break;
            }
        }
    }
    let answer = if matches!(op, CmpOp::Eq) { equal } else { !equal };
    Ok(Some(ts.bool_ref(answer)))
}

fn tuple_hash_slot(ts: &mut ThreadState, obj: Obj) -> ExecResult<u64> {
    let mut h: u64 = 0x345678;
    for item in items(obj) {
        let part = crate::dict::hash_key(ts, item.as_obj())?;
        h = crate::dict::mix_hash(h ^ part);
    }
    Ok(if h == 0 { 1 } else { h })
}

fn tuple_subscr(ts: &mut ThreadState, obj: Obj, key: Obj) -> ExecResult<ObjRef> {
    if !super::number::is_int(ts, key) {
        return Err(ts.raise(ExcKind::TypeError, "tuple indices must be integers"));
    }
    let idx = super::number::int_value(key);
    let slice = items(obj);
    let resolved = if idx < 0 { idx + slice.len() as i64 } else { idx };
    match usize::try_from(resolved).ok().and_then(|i| slice.get(i)) {
        Some(item) => Ok(item.clone()),
        None => Err(ts.raise(ExcKind::IndexError, "tuple index out of range")),
    }
}

fn tuple_contains(ts: &mut ThreadState, obj: Obj, item: Obj) -> ExecResult<bool> {
    for element in items(obj) {
        if crate::interpreter::arith::eq_bool(ts, element.as_obj(), item)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn tuple_bool(_ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(len(obj) != 0)
}

fn tuple_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let ty = ts.rt().types.tuple_iter;
    Ok(ts.alloc_obj(TupleIterObject {
        base: ObjectHeader::new(ty, ts.id()),
        tuple: ObjRef::new(obj),
        pos: AtomicUsize::new(0),
    }))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.bool_ = Some(tuple_bool);
    TypeSlots {
        richcompare: Some(tuple_richcompare),
        hash: Some(tuple_hash_slot),
        number,
        subscr: Some(tuple_subscr),
        contains: Some(tuple_contains),
        iter: Some(tuple_iter),
        traverse: Some(tuple_traverse),
        ..TypeSlots::EMPTY
    }
}

/* ITERATOR */

#[repr(C)]
pub struct TupleIterObject {
    base: ObjectHeader,
    tuple: ObjRef,
    pos: AtomicUsize,
}

pub(crate) unsafe fn drop_iter(obj: Obj) {
    crate::heap::free_object::<TupleIterObject>(obj);
}

fn tuple_iter_next(_ts: &mut ThreadState, obj: Obj) -> ExecResult<IterNext> {
    let payload: &TupleIterObject = unsafe { obj.payload() };
    let pos = payload.pos.fetch_add(1, Ordering::Relaxed);
    match items(payload.tuple.as_obj()).get(pos) {
        Some(item) => Ok(IterNext::Yield(item.clone())),
        None => Ok(IterNext::Done(None)),
    }
}

fn identity_iter(_ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(ObjRef::new(obj))
}

pub(crate) fn iter_slots() -> TypeSlots {
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(tuple_iter_next),
        ..TypeSlots::EMPTY
    }
}
