//! Raise, exception matching, and the with-block protocol

use crate::error::{ExcKind, ExecResult, Raised};
use crate::object::{exception, tuple, Obj, ObjRef, TypeObject};
use crate::thread::ThreadState;
use crate::value::Register;

/// `RAISE`: an exception instance raises itself, an exception type is
/// instantiated with no arguments, an empty accumulator re-raises the
/// innermost handled exception.
pub(crate) fn raise_op(ts: &mut ThreadState, value: Option<ObjRef>) -> Raised {
    match value {
        Some(value) => {
            let obj = value.as_obj();
            if exception::is_exception(obj) {
                return ts.raise_obj(value);
            }
            if obj.is_exact(ts.rt().types.type_) {
                let ty: &TypeObject = unsafe { obj.payload() };
                if ty.exc_kind.is_some() {
                    let ty = unsafe { crate::object::class::extend_lifetime(ty) };
                    let exc = exception::construct(ts, ty, &[]);
                    return ts.raise_obj(exc);
                }
            }
            ts.raise(
                ExcKind::TypeError,
                "exceptions must derive from BaseException",
            )
        }
        None => match super::unwind::handled_exc(ts) {
            Some(exc) => {
                let exc = ObjRef::new(exc);
                ts.raise_obj(exc)
            }
            None => ts.raise(ExcKind::RuntimeError, "No active exception to re-raise"),
        },
    }
}

/// `JUMP_IF_NOT_EXC_MATCH` predicate: does the handled exception at link
/// register `a` match the type (or tuple of types) in the accumulator?
pub(crate) fn exc_match(ts: &mut ThreadState, link_reg: usize, target: Obj) -> ExecResult<bool> {
    let exc_reg = ts.active_mut().reg(link_reg as isize + 1);
    if !exc_reg.is_object() {
        return Err(ts.raise(ExcKind::SystemError, "exception match without an exception"));
    }
    let exc = exc_reg.as_obj();
    if target.is_exact(ts.rt().types.tuple) {
        for entry in tuple::items(target) {
            if match_one(ts, exc, entry.as_obj())? {
                return Ok(true);
            }
        }
        return Ok(false);
    }
    match_one(ts, exc, target)
}

fn match_one(ts: &mut ThreadState, exc: Obj, target: Obj) -> ExecResult<bool> {
    if !target.is_exact(ts.rt().types.type_) {
        return Err(ts.raise(
            ExcKind::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        ));
    }
    let target_ty: &TypeObject = unsafe { target.payload() };
    if target_ty.exc_kind.is_none() {
        return Err(ts.raise(
            ExcKind::TypeError,
            "catching classes that do not inherit from BaseException is not allowed",
        ));
    }
    Ok(exc.type_of().is_subtype_of(target_ty))
}

/// `SETUP_WITH` / `SETUP_ASYNC_WITH`: store the manager at `regs[a]`,
/// its exit callable at `regs[a+1]`, and return `__enter__()` (the
/// awaitable of `__aenter__()` in the async form).
pub(crate) fn setup_with(
    ts: &mut ThreadState,
    a: usize,
    manager: ObjRef,
    is_async: bool,
) -> ExecResult<ObjRef> {
    let (enter_name, exit_name) = if is_async {
        ("__aenter__", "__aexit__")
    } else {
        ("__enter__", "__exit__")
    };
    let exit_key = ts.intern(exit_name);
    let exit = super::attr::getattr(ts, manager.as_obj(), exit_key)?;
    let enter_key = ts.intern(enter_name);
    let enter = super::attr::getattr(ts, manager.as_obj(), enter_key)?;
    {
        let stack = ts.active_mut();
        stack.store(a as isize, Register::owned(manager.into_raw()));
        stack.store(a as isize + 1, Register::owned(exit.into_raw()));
    }
    super::call::call_object(ts, enter.as_obj(), &[])
}

/// Result of closing a with block.
pub(crate) enum EndWith {
    /// No exception, or the exit handler suppressed it.
    Proceed,
    /// Re-raise the stored exception.
    Reraise(Raised),
}

/// `END_WITH` / `END_ASYNC_WITH` (the synchronous part: the async form
/// awaits the exit result before calling [`finish_with`]).
pub(crate) fn end_with(ts: &mut ThreadState, a: usize) -> ExecResult<EndWith> {
    let link = ts.active_mut().reg(a as isize + 2);
    let on_exception = link.is_payload() && link.payload() == -1;
    let exit_reg = ts.active_mut().reg(a as isize + 1);
    debug_assert!(exit_reg.is_object());
    let exit = ObjRef::new(exit_reg.as_obj());

    let none = ts.none();
    let result;
    let exc;
    if on_exception {
        let exc_reg = ts.active_mut().reg(a as isize + 3);
        debug_assert!(exc_reg.is_object());
        let exc_obj = exc_reg.as_obj();
        exc = Some(ObjRef::new(exc_obj));
        let exc_type = exc_obj.type_of().as_obj();
        result = super::call::call_object(ts, exit.as_obj(), &[exc_type, exc_obj, none])?;
    } else {
        exc = None;
        result = super::call::call_object(ts, exit.as_obj(), &[none, none, none])?;
    }
    finish_with(ts, a, result, exc)
}

/// Interpret the exit handler's result: truthy suppresses the stored
/// exception. Clears the with-block registers.
pub(crate) fn finish_with(
    ts: &mut ThreadState,
    a: usize,
    exit_result: ObjRef,
    exc: Option<ObjRef>,
) -> ExecResult<EndWith> {
    let suppress = super::arith::truth(ts, exit_result.as_obj())?;
    let stack = ts.active_mut();
    for i in 0..4 {
        stack.clear(a as isize + i);
    }
    match exc {
        Some(exc) if !suppress => Ok(EndWith::Reraise(ts.raise_obj(exc))),
        _ => Ok(EndWith::Proceed),
    }
}
