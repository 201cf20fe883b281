//! Sequence and mapping constructors
//!
//! All builders read their inputs from a contiguous register range of
//! the current frame and clear the inputs on success.

use crate::error::{ExcKind, ExecResult};
use crate::object::{list, set, slice, tuple, IterNext, Obj, ObjRef};
use crate::thread::ThreadState;

/// Take the register at frame offset `i` as an owned reference.
pub(crate) fn take_ref(ts: &mut ThreadState, i: isize) -> ObjRef {
    let reg = ts.active_mut().take(i);
    debug_assert!(reg.is_object(), "builder input register is not an object");
    if reg.is_owned() {
        unsafe { ObjRef::from_raw(reg.as_obj()) }
    } else {
        ObjRef::new(reg.as_obj())
    }
}

fn collect_range(ts: &mut ThreadState, base: usize, n: usize) -> Vec<ObjRef> {
    (0..n).map(|i| take_ref(ts, (base + i) as isize)).collect()
}

/// `BUILD_LIST`.
pub(crate) fn build_list(ts: &mut ThreadState, base: usize, n: usize) -> ObjRef {
    let items = collect_range(ts, base, n);
    list::new(ts, items)
}

/// `BUILD_TUPLE`.
pub(crate) fn build_tuple(ts: &mut ThreadState, base: usize, n: usize) -> ObjRef {
    let items = collect_range(ts, base, n);
    tuple::new(ts, items)
}

/// `BUILD_SET`.
pub(crate) fn build_set(ts: &mut ThreadState, base: usize, n: usize) -> ExecResult<ObjRef> {
    let items = collect_range(ts, base, n);
    let out = set::new(ts);
    for item in &items {
        set::add(ts, out.as_obj(), item.as_obj())?;
    }
    Ok(out)
}

/// `BUILD_MAP` over `npairs` key/value pairs.
pub(crate) fn build_map(ts: &mut ThreadState, base: usize, npairs: usize) -> ExecResult<ObjRef> {
    let out = crate::dict::new(ts);
    for i in 0..npairs {
        let key = take_ref(ts, (base + 2 * i) as isize);
        let value = take_ref(ts, (base + 2 * i + 1) as isize);
        crate::dict::set(ts, out.as_obj(), key.as_obj(), value.as_obj())?;
    }
    Ok(out)
}

/// `BUILD_SLICE` over three registers (start, stop, step).
pub(crate) fn build_slice(ts: &mut ThreadState, base: usize) -> ObjRef {
    let start = take_ref(ts, base as isize);
    let stop = take_ref(ts, (base + 1) as isize);
    let step = take_ref(ts, (base + 2) as isize);
    slice::new(ts, start, stop, step)
}

/// `UNPACK`: distribute the accumulator's iterable into
/// `regs[base]..`. `after_plus_one == 0` means no starred target;
/// otherwise `before` targets precede the star and `after_plus_one - 1`
/// follow it.
pub(crate) fn unpack(
    ts: &mut ThreadState,
    iterable: Obj,
    base: usize,
    before: usize,
    after_plus_one: usize,
) -> ExecResult<()> {
    let iter = super::iter::get_iter(ts, iterable)?;
    let mut collected: Vec<ObjRef> = Vec::with_capacity(before);
    loop {
        match super::iter::iter_next(ts, iter.as_obj())? {
            IterNext::Yield(item) => collected.push(item),
            IterNext::Done(_) => break,
        }
    }

    let starred = after_plus_one > 0;
    let after = after_plus_one.saturating_sub(1);
    if !starred {
        if collected.len() != before {
            let msg = if collected.len() < before {
                format!(
                    "not enough values to unpack (expected {before}, got {})",
                    collected.len()
                )
            } else {
                format!("too many values to unpack (expected {before})")
            };
            return Err(ts.raise(ExcKind::ValueError, msg));
        }
        for (i, item) in collected.into_iter().enumerate() {
            ts.active_mut().store(
                (base + i) as isize,
                crate::value::Register::owned(item.into_raw()),
            );
        }
        return Ok(());
    }

    if collected.len() < before + after {
        return Err(ts.raise(
            ExcKind::ValueError,
            format!(
                "not enough values to unpack (expected at least {}, got {})",
                before + after,
                collected.len()
            ),
        ));
    }
    let tail: Vec<ObjRef> = collected.split_off(collected.len() - after);
    let mid: Vec<ObjRef> = collected.split_off(before);
    for (i, item) in collected.into_iter().enumerate() {
        ts.active_mut().store(
            (base + i) as isize,
            crate::value::Register::owned(item.into_raw()),
        );
    }
    let star = list::new(ts, mid);
    ts.active_mut().store(
        (base + before) as isize,
        crate::value::Register::owned(star.into_raw()),
    );
    for (i, item) in tail.into_iter().enumerate() {
        ts.active_mut().store(
            (base + before + 1 + i) as isize,
            crate::value::Register::owned(item.into_raw()),
        );
    }
    Ok(())
}

/// `DICT_MERGE`: like update, but duplicate keys raise TypeError (the
/// `**kwargs` construction contract).
pub(crate) fn dict_merge(ts: &mut ThreadState, dst: Obj, src: Obj) -> ExecResult<()> {
    if !src.is_exact(ts.rt().types.dict) {
        let name = src.type_of().name().to_owned();
        return Err(ts.raise(
            ExcKind::TypeError,
            format!("argument after ** must be a mapping, not {name}"),
        ));
    }
    for (key, value) in crate::dict::items_ordered(ts, src) {
        if crate::dict::get(ts, dst, key.as_obj())?.is_some() {
            let desc = if key.as_obj().is_exact(ts.rt().types.str_) {
                crate::object::string::as_str(key.as_obj()).to_owned()
            } else {
                "<object>".to_owned()
            };
            return Err(ts.raise(
                ExcKind::TypeError,
                format!("got multiple values for keyword argument '{desc}'"),
            ));
        }
        crate::dict::set(ts, dst, key.as_obj(), value.as_obj())?;
    }
    Ok(())
}
