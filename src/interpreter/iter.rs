//! Iterator and awaitable protocols

use crate::error::{ExcKind, ExecResult};
use crate::object::{IterNext, Obj, ObjRef};
use crate::thread::ThreadState;

/// `iter(obj)` through the type's iterator slot.
pub(crate) fn get_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    match obj.type_of().slots.iter {
        Some(f) => f(ts, obj),
        None => {
            let name = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'{name}' object is not iterable"),
            ))
        }
    }
}

/// `GET_YIELD_FROM_ITER`: generators and coroutines delegate as
/// themselves; everything else goes through `iter()`.
pub(crate) fn get_yield_from_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let rt = ts.runtime();
    if obj.is_exact(rt.types.generator) || obj.is_exact(rt.types.coroutine) {
        return Ok(ObjRef::new(obj));
    }
    get_iter(ts, obj)
}

/// Advance an iterator; exhaustion is in-band.
pub(crate) fn iter_next(ts: &mut ThreadState, obj: Obj) -> ExecResult<IterNext> {
    match obj.type_of().slots.iternext {
        Some(f) => f(ts, obj),
        None => {
            let name = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'{name}' object is not an iterator"),
            ))
        }
    }
}

/// `GET_AWAITABLE`: coroutines await as themselves; otherwise the
/// `am_await` slot supplies the iterator.
pub(crate) fn get_awaitable(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let rt = ts.runtime();
    if obj.is_exact(rt.types.coroutine) {
        return Ok(ObjRef::new(obj));
    }
    match obj.type_of().slots.async_.await_ {
        Some(f) => f(ts, obj),
        None => {
            let name = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("object {name} can't be used in 'await' expression"),
            ))
        }
    }
}

/// `GET_AITER` through `am_aiter`.
pub(crate) fn get_aiter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    match obj.type_of().slots.async_.aiter {
        Some(f) => f(ts, obj),
        None => {
            let name = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'async for' requires an object with __aiter__ method, got {name}"),
            ))
        }
    }
}

/// `GET_ANEXT` through `am_anext`, yielding the awaitable.
pub(crate) fn get_anext(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    match obj.type_of().slots.async_.anext {
        Some(f) => f(ts, obj),
        None => {
            let name = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'async for' requires an iterator with __anext__ method, got {name}"),
            ))
        }
    }
}
