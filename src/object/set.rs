//! Set objects
//!
//! A set is a thin shell over the concurrent mapping with the element as
//! key and `None` as value, inheriting its locking, ordering and
//! iteration behavior.

use crate::error::ExecResult;
use crate::object::{CmpOp, IterNext, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct SetObject {
    base: ObjectHeader,
    map: ObjRef,
}

/// Allocate an empty set.
pub fn new(ts: &mut ThreadState) -> ObjRef {
    let map = crate::dict::new(ts);
    let ty = ts.rt().types.set;
    ts.alloc_gc(SetObject {
        base: ObjectHeader::new(ty, ts.id()),
        map,
    })
}

fn map_of(obj: Obj) -> Obj {
    let payload: &SetObject = unsafe { obj.payload() };
    payload.map.as_obj()
}

/// Element count.
pub fn len(obj: Obj) -> usize {
    crate::dict::len(map_of(obj))
}

/// Insert one element.
pub fn add(ts: &mut ThreadState, obj: Obj, item: Obj) -> ExecResult<()> {
    let none = ts.rt().singletons.none;
    crate::dict::set(ts, map_of(obj), item, none)
}

/// Insert every element of an iterable.
pub fn update(ts: &mut ThreadState, obj: Obj, iterable: Obj) -> ExecResult<()> {
    let iter = crate::interpreter::iter::get_iter(ts, iterable)?;
    loop {
        match crate::interpreter::iter::iter_next(ts, iter.as_obj())? {
            IterNext::Yield(item) => add(ts, obj, item.as_obj())?,
            IterNext::Done(_) => return Ok(()),
        }
    }
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<SetObject>(obj);
}

fn set_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    visit(map_of(obj));
}

fn set_contains(ts: &mut ThreadState, obj: Obj, item: Obj) -> ExecResult<bool> {
    Ok(crate::dict::get(ts, map_of(obj), item)?.is_some())
}

fn set_bool(_ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(len(obj) != 0)
}

fn set_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    // Iterating a set is iterating the keys of its mapping.
    let map = map_of(obj);
    let iter_slot = map
        .type_of()
        .slots
        .iter
        .expect("mapping type always has an iter slot");
    iter_slot(ts, map)
}

fn set_richcompare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<Option<ObjRef>> {
    if !b.is_exact(ts.rt().types.set) || !matches!(op, CmpOp::Eq | CmpOp::Ne) {
        return Ok(None);
    }
    let mut equal = len(a) == len(b);
    if equal {
        for (key, _) in crate::dict::items_ordered(ts, map_of(a)) {
            if !set_contains(ts, b, key.as_obj())? {
                equal = false;
                break;
            }
        }
    }
    let answer = if matches!(op, CmpOp::Eq) { equal } else { !equal };
    Ok(Some(ts.bool_ref(answer)))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.bool_ = Some(set_bool);
    TypeSlots {
        number,
        richcompare: Some(set_richcompare),
        contains: Some(set_contains),
        iter: Some(set_iter),
        traverse: Some(set_traverse),
        ..TypeSlots::EMPTY
    }
}
