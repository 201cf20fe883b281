//! Call protocol
//!
//! A call writes the callee at `regs[base-1]` and arguments at
//! `regs[base..]`, advances the frame base by `base`, and lets the
//! callee's header instruction finish the setup. Interpreted functions
//! stay inside the dispatch loop; native callables are invoked in place.
//! Native code enters the evaluator through [`call_object`], which
//! pushes a frame linked with the `FRAME_C` sentinel.

use crate::consts::*;
use crate::error::{ExcKind, ExecResult};
use crate::object::{func, string, tuple, Obj, ObjRef};
use crate::thread::ThreadState;
use crate::value::Register;

/// Outcome of dispatching a call instruction.
pub(crate) enum Dispatched {
    /// An interpreted frame was pushed; continue at its first
    /// instruction with the packed argument word in the accumulator.
    Frame { code: Obj, acc_word: i64 },
    /// The call completed in place with this result.
    Inline(ObjRef),
}

/// Dispatch a `CALL_FUNCTION`/`CALL_METHOD`/`CALL_FUNCTION_EX` once the
/// caller has laid out the frame. `caller_pc` is the offset to resume at
/// after the callee returns.
pub(crate) fn dispatch_call(
    ts: &mut ThreadState,
    base: usize,
    mut acc_word: i64,
    caller_pc: usize,
) -> ExecResult<Dispatched> {
    debug_assert!(
        base >= FRAME_EXTRA,
        "call base must clear the reserved frame slots"
    );
    loop {
        let callee_reg = ts.active_mut().reg(base as isize - 1);
        if !callee_reg.is_object() {
            return Err(ts.raise(ExcKind::SystemError, "call without a callee"));
        }
        let callee = callee_reg.as_obj();
        let rt = ts.runtime();

        if callee.is_exact(rt.types.function) {
            let stack = ts.active_mut();
            stack.put(base as isize - 4, Register::from_payload(base as i64));
            stack.put(base as isize - 3, Register::from_payload(caller_pc as i64));
            stack.base += base;
            stack.pc = 0;
            return Ok(Dispatched::Frame {
                code: func::code_of(callee),
                acc_word,
            });
        }

        if callee.is_exact(rt.types.method) {
            // Expand the bound method: shift the positional arguments up
            // and splice the receiver in front (tuple-prepend for the
            // extended-call form).
            let receiver = ObjRef::new(func::method_receiver(callee));
            let function = ObjRef::new(func::method_func(callee));
            if acc_word & ACC_FLAG_VARARGS != 0 {
                let callargs = super::build::take_ref(ts, base as isize + CALLARGS_IDX);
                let prepended = tuple::prepend(ts, receiver, callargs.as_obj());
                ts.active_mut().put(
                    base as isize + CALLARGS_IDX,
                    Register::owned(prepended.into_raw()),
                );
            } else {
                let nargs = (acc_word & ACC_MASK_ARGS) as usize;
                let stack = ts.active_mut();
                if !stack.ensure(base + nargs + 2) {
                    return Err(ts.raise(ExcKind::RecursionError, "call stack exhausted"));
                }
                let stack = ts.active_mut();
                let mut i = nargs;
                while i > 0 {
                    let v = stack.take((base + i - 1) as isize);
                    stack.put((base + i) as isize, v);
                    i -= 1;
                }
                stack.put(base as isize, Register::owned(receiver.into_raw()));
                acc_word += 1;
            }
            ts.active_mut()
                .store(base as isize - 1, Register::owned(function.into_raw()));
            continue;
        }

        // Everything else goes through the type's call slot in place.
        return call_inline(ts, callee, base, acc_word).map(Dispatched::Inline);
    }
}

/// Invoke a native callable with the frame-layout arguments, clearing
/// them afterwards.
fn call_inline(
    ts: &mut ThreadState,
    callee: Obj,
    base: usize,
    acc_word: i64,
) -> ExecResult<ObjRef> {
    let Some(call_slot) = callee.type_of().slots.call else {
        let name = callee.type_of().name().to_owned();
        clear_call_regs(ts, base, acc_word);
        return Err(ts.raise(
            ExcKind::TypeError,
            format!("'{name}' object is not callable"),
        ));
    };

    let mut owned: Vec<ObjRef> = Vec::new();
    if acc_word & ACC_FLAG_VARARGS != 0 {
        let callargs = ts.active_mut().reg(base as isize + CALLARGS_IDX);
        debug_assert!(callargs.is_object());
        let callargs = callargs.as_obj();
        for item in tuple::items(callargs) {
            owned.push(item.clone());
        }
    } else {
        if acc_word & ACC_MASK_KWARGS != 0 {
            clear_call_regs(ts, base, acc_word);
            let name = callee.type_of().name().to_owned();
            return Err(ts.raise(
                ExcKind::TypeError,
                format!("'{name}' object takes no keyword arguments"),
            ));
        }
        let nargs = (acc_word & ACC_MASK_ARGS) as usize;
        for i in 0..nargs {
            owned.push(super::build::take_ref(ts, (base + i) as isize));
        }
    }
    let args: Vec<Obj> = owned.iter().map(|o| o.as_obj()).collect();
    let result = call_slot(ts, callee, &args);
    clear_call_regs(ts, base, acc_word);
    result
}

/// Clear the callee slot, argument registers and extended-call slots of
/// a call that never became a frame.
pub(crate) fn clear_call_regs(ts: &mut ThreadState, base: usize, acc_word: i64) {
    let stack = ts.active_mut();
    stack.clear(base as isize - 1);
    if acc_word & (ACC_FLAG_VARARGS | ACC_FLAG_VARKEYWORDS) != 0 {
        stack.clear(base as isize + CALLARGS_IDX);
        stack.clear(base as isize + KWARGS_IDX);
        return;
    }
    let nargs = (acc_word & ACC_MASK_ARGS) as usize;
    for i in 0..nargs {
        stack.clear((base + i) as isize);
    }
    let nkw = ((acc_word & ACC_MASK_KWARGS) >> ACC_SHIFT_KWARGS) as usize;
    if nkw > 0 {
        stack.clear(base as isize + KWARGS_IDX);
        for j in 0..nkw {
            stack.clear(base as isize + KWARGS_IDX - 1 - j as isize);
        }
    }
}

/* NATIVE ENTRY */

/// Registers reserved by the currently executing frame.
fn frame_reserve(ts: &ThreadState) -> usize {
    let stack = unsafe { ts.active_ref() };
    match stack.callee() {
        Some(callee) if callee.is_exact(ts.rt().types.function) => {
            crate::code::signature(func::code_of(callee)).framesize as usize
        }
        _ => 0,
    }
}

/// Call any callable from native code with positional arguments.
pub(crate) fn call_object(
    ts: &mut ThreadState,
    callable: Obj,
    args: &[Obj],
) -> ExecResult<ObjRef> {
    let rt = ts.runtime();
    if callable.is_exact(rt.types.function) {
        return call_function_from_native(ts, callable, args);
    }
    if callable.is_exact(rt.types.method) {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(func::method_receiver(callable));
        full.extend_from_slice(args);
        return call_object(ts, func::method_func(callable), &full);
    }
    match callable.type_of().slots.call {
        Some(f) => f(ts, callable, args),
        None => {
            let name = callable.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'{name}' object is not callable"),
            ))
        }
    }
}

fn call_function_from_native(
    ts: &mut ThreadState,
    function: Obj,
    args: &[Obj],
) -> ExecResult<ObjRef> {
    if args.len() > ACC_MASK_ARGS as usize {
        return Err(ts.raise(ExcKind::TypeError, "too many positional arguments"));
    }
    let delta = frame_reserve(ts) + FRAME_EXTRA;
    {
        let saved_pc = unsafe { ts.active_ref() }.pc as i64;
        let stack = ts.active_mut();
        if !stack.ensure(delta + args.len() + FRAME_EXTRA) {
            return Err(ts.raise(ExcKind::RecursionError, "maximum recursion depth exceeded"));
        }
        let stack = ts.active_mut();
        stack.put(delta as isize + FRAME_DELTA, Register::from_payload(delta as i64));
        stack.put(delta as isize + FRAME_LINK, Register::from_payload(FRAME_C));
        // Native frames stash the interpreted caller's resume offset
        // where interpreted frames keep their snapshot.
        stack.put(delta as isize + FRAME_OBJ, Register::from_payload(saved_pc));
        stack.put(delta as isize + FRAME_CALLEE, crate::rc::pack_incref(function));
        for (i, arg) in args.iter().enumerate() {
            stack.put((delta + i) as isize, crate::rc::pack_incref(*arg));
        }
        stack.base += delta;
        stack.pc = 0;
    }
    let acc = Register::from_payload(args.len() as i64);
    let result = super::executors::eval(ts, acc);
    // The frame was popped on return or unwound on error; the stack's pc
    // still belongs to the caller and is restored by it.
    result
}

/* FRAME SETUP (headers) */

/// Shared `FUNC_HEADER` body: argument checking, defaults, keyword
/// matching, varargs, cells and free variables.
pub(crate) fn setup_frame(
    ts: &mut ThreadState,
    code: Obj,
    acc_word: i64,
    framesize: usize,
) -> ExecResult<()> {
    let function = ts
        .active_mut()
        .reg(FRAME_CALLEE)
        .as_obj();
    let sig = crate::code::signature(code);
    let flags = crate::code::flags(code);

    if !ts.active_mut().ensure(framesize) {
        clear_failed_call(ts, acc_word, framesize);
        return Err(ts.raise(ExcKind::RecursionError, "maximum recursion depth exceeded"));
    }
    ts.check_breaker().map_err(|raised| {
        clear_failed_call(ts, acc_word, framesize);
        raised
    })?;

    // Fast path: exact positional match, nothing fancy in the signature.
    let plain = acc_word == sig.argcount as i64
        && sig.kwonly == 0
        && sig.ndefaults == 0
        && sig.ncells == 0
        && sig.nfreevars == 0
        && !flags.intersects(crate::code::CodeFlags::VARARGS | crate::code::CodeFlags::VARKEYWORDS);
    if plain {
        return Ok(());
    }

    setup_frame_slow(ts, function, code, acc_word, framesize).map_err(|raised| {
        clear_failed_call(ts, acc_word, framesize);
        raised
    })
}

fn setup_frame_slow(
    ts: &mut ThreadState,
    function: Obj,
    code: Obj,
    acc_word: i64,
    _framesize: usize,
) -> ExecResult<()> {
    let sig = crate::code::signature(code);
    let flags = crate::code::flags(code);
    let argcount = sig.argcount as usize;
    let totalargs = sig.totalargs as usize;

    let mut nargs;
    let mut kwnames: Option<ObjRef> = None;
    let mut kwvalues: Vec<ObjRef> = Vec::new();
    let mut kwdict_src: Option<ObjRef> = None;

    if acc_word & (ACC_FLAG_VARARGS | ACC_FLAG_VARKEYWORDS) != 0 {
        // Extended call: spread the iterable into the argument
        // registers and take the mapping as keyword source.
        let callargs = super::build::take_ref(ts, CALLARGS_IDX);
        let kwargs_reg = ts.active_mut().take(KWARGS_IDX);
        if kwargs_reg.is_object() {
            let obj = kwargs_reg.as_obj();
            let owned = if kwargs_reg.is_owned() {
                unsafe { ObjRef::from_raw(obj) }
            } else {
                ObjRef::new(obj)
            };
            kwdict_src = Some(owned);
        }
        let items: Vec<ObjRef> = if callargs.as_obj().is_exact(ts.rt().types.tuple) {
            tuple::items(callargs.as_obj()).to_vec()
        } else if callargs.as_obj().is_exact(ts.rt().types.list) {
            crate::object::list::snapshot(ts, callargs.as_obj())
        } else {
            let name = callargs.as_obj().type_of().name().to_owned();
            return Err(ts.raise(
                ExcKind::TypeError,
                format!("argument after * must be an iterable, not {name}"),
            ));
        };
        nargs = items.len();
        if nargs > ACC_MASK_ARGS as usize {
            return Err(ts.raise(ExcKind::TypeError, "too many positional arguments"));
        }
        for (i, item) in items.into_iter().enumerate() {
            ts.active_mut()
                .store(i as isize, Register::owned(item.into_raw()));
        }
    } else {
        nargs = (acc_word & ACC_MASK_ARGS) as usize;
        let nkw = ((acc_word & ACC_MASK_KWARGS) >> ACC_SHIFT_KWARGS) as usize;
        if nkw > 0 {
            let names = super::build::take_ref(ts, KWARGS_IDX);
            for j in 0..nkw {
                kwvalues.push(super::build::take_ref(ts, KWARGS_IDX - 1 - j as isize));
            }
            kwnames = Some(names);
        }
    }

    // Overflowing positionals either pack into the varargs tuple or are
    // an error.
    let vararg_reg = totalargs;
    let kwdict_reg = totalargs + usize::from(flags.contains(crate::code::CodeFlags::VARARGS));
    if nargs > argcount {
        if !flags.contains(crate::code::CodeFlags::VARARGS) {
            return Err(err_too_many(ts, code, nargs));
        }
        let extras: Vec<ObjRef> = (argcount..nargs)
            .map(|i| super::build::take_ref(ts, i as isize))
            .collect();
        let packed = tuple::new(ts, extras);
        ts.active_mut()
            .store(vararg_reg as isize, Register::owned(packed.into_raw()));
        nargs = argcount;
    } else if flags.contains(crate::code::CodeFlags::VARARGS) {
        let packed = tuple::new(ts, Vec::new());
        ts.active_mut()
            .store(vararg_reg as isize, Register::owned(packed.into_raw()));
    }
    if flags.contains(crate::code::CodeFlags::VARKEYWORDS) {
        let kwdict = crate::dict::new(ts);
        ts.active_mut()
            .store(kwdict_reg as isize, Register::owned(kwdict.into_raw()));
    }

    // Keyword arguments: match by identity first, then by string value.
    let varnames = crate::code::varnames(code);
    let mut place_keyword = |ts: &mut ThreadState, name: Obj, value: ObjRef| -> ExecResult<()> {
        let mut target = None;
        for (i, candidate) in varnames.iter().enumerate().take(totalargs) {
            let candidate = candidate.as_obj();
            if candidate == name || string::as_str(candidate) == string::as_str(name) {
                target = Some(i);
                break;
            }
        }
        match target {
            Some(i) if i < sig.posonly as usize => {
                let n = string::as_str(name).to_owned();
                Err(ts.raise(
                    ExcKind::TypeError,
                    format!("got some positional-only arguments passed as keyword arguments: '{n}'"),
                ))
            }
            Some(i) => {
                if ts.active_mut().reg(i as isize).is_object() {
                    let n = string::as_str(name).to_owned();
                    return Err(ts.raise(
                        ExcKind::TypeError,
                        format!("got multiple values for argument '{n}'"),
                    ));
                }
                ts.active_mut()
                    .store(i as isize, Register::owned(value.into_raw()));
                Ok(())
            }
            None => {
                if flags.contains(crate::code::CodeFlags::VARKEYWORDS) {
                    let kwdict = ts.active_mut().reg(kwdict_reg as isize).as_obj();
                    crate::dict::set(ts, kwdict, name, value.as_obj())?;
                    Ok(())
                } else {
                    let n = string::as_str(name).to_owned();
                    Err(ts.raise(
                        ExcKind::TypeError,
                        format!("got an unexpected keyword argument '{n}'"),
                    ))
                }
            }
        }
    };

    if let Some(names) = &kwnames {
        let names_obj = names.as_obj();
        for (j, value) in kwvalues.into_iter().enumerate() {
            let name = tuple::items(names_obj)[j].as_obj();
            place_keyword(ts, name, value)?;
        }
    }
    if let Some(src) = &kwdict_src {
        for (name, value) in crate::dict::items_ordered(ts, src.as_obj()) {
            place_keyword(ts, name.as_obj(), value)?;
        }
    }

    // Defaults for still-missing parameters.
    let defaults = func::defaults_of(function);
    let first_default = argcount - defaults.len().min(argcount);
    for i in nargs..argcount {
        if ts.active_mut().reg(i as isize).is_object() {
            continue;
        }
        if i >= first_default {
            let value = defaults[i - first_default].clone();
            ts.active_mut()
                .store(i as isize, Register::owned(value.into_raw()));
        } else {
            return Err(err_missing(ts, code, i));
        }
    }
    for i in argcount..totalargs {
        if ts.active_mut().reg(i as isize).is_object() {
            continue;
        }
        let name = varnames[i].as_obj();
        let filled = match func::kw_defaults_of(function) {
            Some(kd) => crate::dict::get(ts, kd, name)?,
            None => None,
        };
        match filled {
            Some(value) => ts
                .active_mut()
                .store(i as isize, Register::owned(value.into_raw())),
            None => return Err(err_missing(ts, code, i)),
        }
    }

    // Promote cell variables and load captured free variables.
    for reg in crate::code::cell2reg(code) {
        let current = ts.active_mut().take(*reg as isize);
        let seed = current.is_object().then(|| current.as_obj());
        let cell = func::new_cell(ts, seed);
        crate::rc::clear_register(current);
        ts.active_mut()
            .put(*reg as isize, Register::owned(cell.into_raw()));
    }
    let closure = func::closure_of(function);
    for (i, reg) in crate::code::free2reg(code).iter().enumerate() {
        let cell = closure[i].clone();
        ts.active_mut()
            .store(*reg as isize, Register::owned(cell.into_raw()));
    }
    Ok(())
}

/// Ensure the extended-call iterable at `CALLARGS_IDX` (relative to the
/// prospective frame at `base`) is a tuple.
pub(crate) fn normalize_callargs(ts: &mut ThreadState, base: usize) -> ExecResult<()> {
    let slot = base as isize + CALLARGS_IDX;
    let current = ts.active_mut().reg(slot);
    if !current.is_object() {
        let empty = tuple::new(ts, Vec::new());
        ts.active_mut()
            .put(slot, Register::owned(empty.into_raw()));
        return Ok(());
    }
    let obj = current.as_obj();
    if obj.is_exact(ts.rt().types.tuple) {
        return Ok(());
    }
    let items: Vec<ObjRef> = if obj.is_exact(ts.rt().types.list) {
        crate::object::list::snapshot(ts, obj)
    } else {
        let iter = super::iter::get_iter(ts, obj)?;
        let mut out = Vec::new();
        loop {
            match super::iter::iter_next(ts, iter.as_obj())? {
                crate::object::IterNext::Yield(item) => out.push(item),
                crate::object::IterNext::Done(_) => break,
            }
        }
        out
    };
    let packed = tuple::new(ts, items);
    ts.active_mut()
        .store(slot, Register::owned(packed.into_raw()));
    Ok(())
}

/// Clear a half-built frame after a failed header so the unwinder sees
/// only the reserved slots.
fn clear_failed_call(ts: &mut ThreadState, acc_word: i64, framesize: usize) {
    let stack = ts.active_mut();
    if acc_word & (ACC_FLAG_VARARGS | ACC_FLAG_VARKEYWORDS) != 0 {
        stack.clear(CALLARGS_IDX);
        stack.clear(KWARGS_IDX);
    }
    let nkw = ((acc_word & ACC_MASK_KWARGS) >> ACC_SHIFT_KWARGS) as usize;
    if nkw > 0 {
        stack.clear(KWARGS_IDX);
        for j in 0..nkw {
            stack.clear(KWARGS_IDX - 1 - j as isize);
        }
    }
    let nargs = (acc_word & ACC_MASK_ARGS) as usize;
    stack.clear_range(0, nargs.max(framesize));
}

fn err_too_many(ts: &mut ThreadState, code: Obj, nargs: usize) -> crate::error::Raised {
    let sig = crate::code::signature(code);
    let name = string::as_str(crate::code::qualname(code)).to_owned();
    ts.raise(
        ExcKind::TypeError,
        format!(
            "{name}() takes {} positional argument{} but {nargs} were given",
            sig.argcount,
            if sig.argcount == 1 { "" } else { "s" },
        ),
    )
}

fn err_missing(ts: &mut ThreadState, code: Obj, index: usize) -> crate::error::Raised {
    let varnames = crate::code::varnames(code);
    let missing = string::as_str(varnames[index].as_obj()).to_owned();
    let name = string::as_str(crate::code::qualname(code)).to_owned();
    ts.raise(
        ExcKind::TypeError,
        format!("{name}() missing required argument: '{missing}'"),
    )
}

/// `MAKE_FUNCTION`: create a function from a code constant, inheriting
/// the creating function's globals and builtins and capturing cells for
/// the new code's free variables by name.
pub(crate) fn make_function(ts: &mut ThreadState, creator: Obj, code: Obj) -> ExecResult<ObjRef> {
    let globals = func::globals_of(creator);
    let builtins = func::builtins_of(creator);
    let creator_code = func::code_of(creator);

    let mut closure = Vec::new();
    for freevar in crate::code::freevars(code) {
        let name = freevar.as_obj();
        let cell = find_cell(ts, creator_code, name)?;
        closure.push(cell);
    }
    let qualname = string::as_str(crate::code::qualname(code)).to_owned();
    Ok(func::new(
        ts, code, globals, builtins, Vec::new(), None, closure, &qualname,
    ))
}

/// Locate the cell for `name` in the creating frame: its own cell
/// variables first, then its captured free variables.
fn find_cell(ts: &mut ThreadState, creator_code: Obj, name: Obj) -> ExecResult<ObjRef> {
    for (i, cellname) in crate::code::cellvars(creator_code).iter().enumerate() {
        if cellname.as_obj() == name {
            let reg = crate::code::cell2reg(creator_code)[i];
            let cell = ts.active_mut().reg(reg as isize);
            if cell.is_object() {
                return Ok(ObjRef::new(cell.as_obj()));
            }
        }
    }
    for (i, freename) in crate::code::freevars(creator_code).iter().enumerate() {
        if freename.as_obj() == name {
            let reg = crate::code::free2reg(creator_code)[i];
            let cell = ts.active_mut().reg(reg as isize);
            if cell.is_object() {
                return Ok(ObjRef::new(cell.as_obj()));
            }
        }
    }
    let n = string::as_str(name).to_owned();
    Err(ts.raise(
        ExcKind::SystemError,
        format!("no cell for free variable '{n}'"),
    ))
}
