//! Slice objects

use crate::error::{ExcKind, ExecResult};
use crate::object::{Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct SliceObject {
    base: ObjectHeader,
    start: ObjRef,
    stop: ObjRef,
    step: ObjRef,
}

/// Allocate a slice; each bound is an int or `None`.
pub fn new(ts: &mut ThreadState, start: ObjRef, stop: ObjRef, step: ObjRef) -> ObjRef {
    let ty = ts.rt().types.slice;
    ts.alloc_gc(SliceObject {
        base: ObjectHeader::new(ty, ts.id()),
        start,
        stop,
        step,
    })
}

fn payload(obj: Obj) -> &'static SliceObject {
    unsafe { obj.payload() }
}

fn bound(ts: &mut ThreadState, obj: Obj, default: i64) -> ExecResult<i64> {
    if obj == ts.none() {
        return Ok(default);
    }
    if !super::number::is_int(ts, obj) {
        return Err(ts.raise(ExcKind::TypeError, "slice indices must be integers or None"));
    }
    Ok(super::number::int_value(obj))
}

/// Resolve the slice against a sequence length: `(start, stop, step)`.
pub fn indices(ts: &mut ThreadState, obj: Obj, len: usize) -> ExecResult<(i64, i64, i64)> {
    let s = payload(obj);
    let step = bound(ts, s.step.as_obj(), 1)?;
    if step == 0 {
        return Err(ts.raise(ExcKind::ValueError, "slice step cannot be zero"));
    }
    let len = len as i64;
    let (def_start, def_stop) = if step > 0 { (0, len) } else { (len - 1, -1) };
    let clamp = |v: i64, low: i64, high: i64| v.clamp(low, high);
    let norm = |v: i64| if v < 0 { v + len } else { v };
    let start = if s.start.as_obj() == ts.none() {
        def_start
    } else {
        clamp(norm(bound(ts, s.start.as_obj(), def_start)?), if step > 0 { 0 } else { -1 }, len)
    };
    let stop = if s.stop.as_obj() == ts.none() {
        def_stop
    } else {
        clamp(norm(bound(ts, s.stop.as_obj(), def_stop)?), if step > 0 { 0 } else { -1 }, len)
    };
    Ok((start, stop, step))
}

/// Whether the object is a slice.
pub fn is_slice(ts: &ThreadState, obj: Obj) -> bool {
    obj.is_exact(ts.rt().types.slice)
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<SliceObject>(obj);
}

fn slice_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let s = payload(obj);
    visit(s.start.as_obj());
    visit(s.stop.as_obj());
    visit(s.step.as_obj());
}

pub(crate) fn slots() -> TypeSlots {
    TypeSlots {
        traverse: Some(slice_traverse),
        ..TypeSlots::EMPTY
    }
}
