//! Generators, coroutines and async generators
//!
//! A generator object embeds its own thread-stack. Resuming pushes that
//! stack onto the calling thread's active chain and re-enters the
//! evaluator at the saved offset; yielding saves the offset, pops the
//! stack and hands the value out. The status machine moves only along
//! `Created → Running ↔ Suspended → Closed`.
//!
//! The generator owns its stack; the stack keeps only a raw backlink,
//! which breaks the cycle a generator would otherwise form with the
//! frame that created it.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use crate::consts::*;
use crate::error::{ExcKind, ExecResult, Raised};
use crate::frame::{StackKind, ThreadStack};
use crate::object::{exception, func, string, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::state::{GenStatus, SendResult};
use crate::thread::ThreadState;
use crate::value::Register;

/// What flavor of suspendable function this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenKind {
    Generator,
    Coroutine,
    AsyncGenerator,
}

/// One frame of a coroutine's creation backtrace.
pub struct OriginEntry {
    /// Source file.
    pub filename: ObjRef,
    /// Line of the call site.
    pub line: u32,
    /// Qualified name of the calling function.
    pub qualname: ObjRef,
}

#[repr(C)]
pub struct GenObject {
    base: ObjectHeader,
    stack: UnsafeCell<ThreadStack>,
    status: AtomicU8,
    kind: GenKind,
    /// An `aclose` arrived while running; inject GeneratorExit at the
    /// next suspension.
    closing: AtomicBool,
    code: ObjRef,
    name: ObjRef,
    qualname: ObjRef,
    return_value: UnsafeCell<Option<ObjRef>>,
    /// Delegation target while a `yield from` is in flight.
    yield_from: UnsafeCell<Option<ObjRef>>,
    /// Creation backtrace, coroutines only.
    origin: Vec<OriginEntry>,
}

fn payload(obj: Obj) -> &'static GenObject {
    unsafe { obj.payload() }
}

/// The generator's status.
pub fn status_of(obj: Obj) -> GenStatus {
    match payload(obj).status.load(Ordering::Acquire) {
        0 => GenStatus::Created,
        1 => GenStatus::Running,
        2 => GenStatus::Suspended,
        _ => GenStatus::Closed,
    }
}

fn set_status(obj: Obj, next: GenStatus) {
    let current = status_of(obj);
    debug_assert!(
        current == next || current.can_become(next),
        "generator status {current:?} cannot become {next:?}"
    );
    payload(obj).status.store(next as u8, Ordering::Release);
}

/// The generator's kind.
pub fn kind_of(obj: Obj) -> GenKind {
    payload(obj).kind
}

/// The coroutine's captured creation backtrace.
pub fn origin_of<'a>(obj: Obj) -> &'a [OriginEntry] {
    &payload(obj).origin
}

/// The delegation target of an in-flight `yield from`, if any.
pub fn yield_from_of(obj: Obj) -> Option<Obj> {
    unsafe { (*payload(obj).yield_from.get()).as_ref().map(|o| o.as_obj()) }
}

/// Whether `obj` is a generator of any kind.
pub fn is_generator(ts: &ThreadState, obj: Obj) -> bool {
    let rt = ts.rt();
    obj.is_exact(rt.types.generator)
        || obj.is_exact(rt.types.coroutine)
        || obj.is_exact(rt.types.async_generator)
}

/// The generator owning the thread's active stack, if any.
fn current_gen(ts: &ThreadState) -> Option<Obj> {
    let stack = unsafe { ts.active_ref() };
    if stack.kind != StackKind::Generator || stack.owner.is_null() {
        return None;
    }
    Some(unsafe { Obj::from_ptr(stack.owner) })
}

/* CREATION (COROGEN_HEADER) */

/// Build the generator for the frame the header just set up, moving the
/// initialized registers into the embedded stack. The caller's reserved
/// slots (delta/link) stay behind for the return protocol.
pub(crate) fn materialize(
    ts: &mut ThreadState,
    code: Obj,
    framesize: usize,
    resume_pc: usize,
) -> ExecResult<ObjRef> {
    let flags = crate::code::flags(code);
    let kind = if flags.contains(crate::code::CodeFlags::ASYNC_GENERATOR) {
        GenKind::AsyncGenerator
    } else if flags.contains(crate::code::CodeFlags::COROUTINE) {
        GenKind::Coroutine
    } else {
        GenKind::Generator
    };
    let ty = match kind {
        GenKind::Generator => ts.rt().types.generator,
        GenKind::Coroutine => ts.rt().types.coroutine,
        GenKind::AsyncGenerator => ts.rt().types.async_generator,
    };

    // Capture the creation backtrace while the creating frame is still
    // intact.
    let origin = if matches!(kind, GenKind::Coroutine) {
        capture_origin(ts)
    } else {
        Vec::new()
    };

    let mut stack = ThreadStack::new(StackKind::Generator);
    if !stack.ensure(framesize) {
        return Err(ts.raise(ExcKind::RecursionError, "generator frame too large"));
    }
    stack.pc = resume_pc;
    stack.put(FRAME_DELTA, Register::from_payload(0));
    stack.put(FRAME_LINK, Register::from_payload(FRAME_GENERATOR));
    {
        let src = ts.active_mut();
        // Callee and the whole register window move wholesale.
        let callee = src.take(FRAME_CALLEE);
        stack.put(FRAME_CALLEE, callee);
        for i in 0..framesize {
            let v = src.take(i as isize);
            stack.put(i as isize, v);
        }
    }

    let name = ObjRef::new(crate::code::qualname(code));
    let gen = ts.alloc_gc(GenObject {
        base: ObjectHeader::new(ty, ts.id()),
        stack: UnsafeCell::new(stack),
        status: AtomicU8::new(GenStatus::Created as u8),
        kind,
        closing: AtomicBool::new(false),
        code: ObjRef::new(code),
        name: name.clone(),
        qualname: name,
        return_value: UnsafeCell::new(None),
        yield_from: UnsafeCell::new(None),
        origin,
    });
    unsafe {
        (*payload(gen.as_obj()).stack.get()).owner = gen.as_obj().as_ptr();
    }
    Ok(gen)
}

fn capture_origin(ts: &mut ThreadState) -> Vec<OriginEntry> {
    let depth = ts.rt().config.coro_origin_depth;
    let views: Vec<crate::frame::FrameView> =
        crate::frame::StackWalker::new(ts).take(depth).collect();
    views
        .into_iter()
        .map(|view| {
            let code = func::code_of(view.func);
            OriginEntry {
                filename: ObjRef::new(crate::code::filename(code)),
                line: crate::code::line_for(code, view.pc),
                qualname: ObjRef::new(crate::code::qualname(code)),
            }
        })
        .collect()
}

/* SUSPEND / RESUME */

/// Yield out of the evaluator: record the resume offset, mark the
/// generator suspended and pop its stack.
pub(crate) fn suspend(ts: &mut ThreadState, resume_pc: usize) {
    let gen = current_gen(ts).expect("yield outside a generator frame");
    ts.active_mut().pc = resume_pc;
    set_status(gen, GenStatus::Suspended);
    ts.pop_stack();
}

/// The generator's bottom frame returned: mark closed and pop.
pub(crate) fn finish_return(ts: &mut ThreadState) {
    let gen = current_gen(ts).expect("generator return outside a generator frame");
    set_status(gen, GenStatus::Closed);
    ts.pop_stack();
}

/// The generator's bottom frame unwound with an exception.
pub(crate) fn close_on_unwind(ts: &mut ThreadState) {
    let gen = current_gen(ts).expect("generator unwind outside a generator frame");
    set_status(gen, GenStatus::Closed);
    ts.pop_stack();
}

/// Resume a generator with `value`. The core of `send`, `__next__`,
/// `__anext__` and delegation.
pub fn send(ts: &mut ThreadState, gen: Obj, value: Option<Obj>) -> ExecResult<SendResult> {
    match status_of(gen) {
        GenStatus::Running => {
            let what = kind_name(kind_of(gen));
            return Err(ts.raise(ExcKind::ValueError, format!("{what} already executing")));
        }
        GenStatus::Closed => {
            let kind = match kind_of(gen) {
                GenKind::AsyncGenerator => ExcKind::StopAsyncIteration,
                _ => ExcKind::StopIteration,
            };
            let exc = exception::new(ts, kind, Vec::new());
            return Err(ts.raise_obj(exc));
        }
        GenStatus::Created => {
            if let Some(v) = value {
                if v != ts.none() {
                    let what = kind_name(kind_of(gen));
                    return Err(ts.raise(
                        ExcKind::TypeError,
                        format!("can't send non-None value to a just-started {what}"),
                    ));
                }
            }
        }
        GenStatus::Suspended => {}
    }

    let first = status_of(gen) == GenStatus::Created;
    set_status(gen, GenStatus::Running);
    let stack = payload(gen).stack.get();
    ts.push_stack(stack);

    let acc = if first {
        Register::EMPTY
    } else {
        match value {
            Some(v) => crate::rc::pack_incref(v),
            None => crate::rc::pack_incref(ts.none()),
        }
    };
    let result = crate::interpreter::executors::eval(ts, acc);
    interpret_resume(ts, gen, result)
}

fn interpret_resume(
    ts: &mut ThreadState,
    gen: Obj,
    result: ExecResult<ObjRef>,
) -> ExecResult<SendResult> {
    match result {
        Ok(value) => match status_of(gen) {
            GenStatus::Suspended => {
                if payload(gen).closing.load(Ordering::Acquire) {
                    // A close was scheduled while we ran: inject now.
                    return inject_close(ts, gen).map(|_| {
                        let none = ObjRef::new(ts.none());
                        SendResult::Return(none)
                    });
                }
                Ok(SendResult::Yield(value))
            }
            GenStatus::Closed => {
                unsafe {
                    *payload(gen).return_value.get() = Some(value.clone());
                }
                Ok(SendResult::Return(value))
            }
            other => {
                debug_assert!(false, "generator resumed into status {other:?}");
                Ok(SendResult::Return(value))
            }
        },
        Err(raised) => Err(convert_escaped(ts, gen, raised)),
    }
}

/// StopIteration escaping a generator body becomes RuntimeError with the
/// original as context (StopAsyncIteration for async generators).
fn convert_escaped(ts: &mut ThreadState, gen: Obj, raised: Raised) -> Raised {
    let _ = raised;
    let exc = ts.take_exc();
    let offending = match kind_of(gen) {
        GenKind::AsyncGenerator => ExcKind::StopAsyncIteration,
        _ => ExcKind::StopIteration,
    };
    if ts.exception_matches(exc.as_obj(), offending) {
        let what = kind_name(kind_of(gen));
        let msg = crate::object::string::new(ts, format!("{what} raised {offending}"));
        let replacement = exception::new(ts, ExcKind::RuntimeError, vec![msg]);
        exception::set_context(replacement.as_obj(), exc);
        return ts.raise_obj(replacement);
    }
    ts.raise_obj(exc)
}

fn kind_name(kind: GenKind) -> &'static str {
    match kind {
        GenKind::Generator => "generator",
        GenKind::Coroutine => "coroutine",
        GenKind::AsyncGenerator => "async generator",
    }
}

/* THROW / CLOSE */

/// Inject an exception at the generator's current offset.
pub fn throw(ts: &mut ThreadState, gen: Obj, exc: ObjRef) -> ExecResult<SendResult> {
    match status_of(gen) {
        GenStatus::Running => {
            let what = kind_name(kind_of(gen));
            return Err(ts.raise(ExcKind::ValueError, format!("{what} already executing")));
        }
        GenStatus::Closed => return Err(ts.raise_obj(exc)),
        GenStatus::Created | GenStatus::Suspended => {}
    }
    set_status(gen, GenStatus::Running);
    let stack = payload(gen).stack.get();
    ts.push_stack(stack);
    let pc = unsafe { (*stack).pc };
    let _pending = ts.raise_obj(exc);
    let result = match crate::interpreter::unwind::unwind(ts, pc) {
        crate::interpreter::unwind::Unwound::Handler { .. } => {
            crate::interpreter::executors::eval(ts, Register::EMPTY)
        }
        crate::interpreter::unwind::Unwound::Generator(raised)
        | crate::interpreter::unwind::Unwound::Native(raised) => Err(raised),
    };
    interpret_resume(ts, gen, result)
}

/// Close the generator, injecting GeneratorExit when it is suspended.
/// On a running generator the close is scheduled for the next
/// suspension point.
pub fn close(ts: &mut ThreadState, gen: Obj) -> ExecResult<()> {
    match status_of(gen) {
        GenStatus::Closed => Ok(()),
        GenStatus::Created => {
            set_status(gen, GenStatus::Closed);
            Ok(())
        }
        GenStatus::Running => {
            payload(gen).closing.store(true, Ordering::Release);
            tracing::debug!(target: "quill::generator", "close scheduled on running generator");
            Ok(())
        }
        GenStatus::Suspended => inject_close(ts, gen),
    }
}

fn inject_close(ts: &mut ThreadState, gen: Obj) -> ExecResult<()> {
    payload(gen).closing.store(false, Ordering::Release);
    let exc = exception::new(ts, ExcKind::GeneratorExit, Vec::new());
    match throw(ts, gen, exc) {
        Ok(SendResult::Yield(_)) => {
            let what = kind_name(kind_of(gen));
            Err(ts.raise(
                ExcKind::RuntimeError,
                format!("{what} ignored GeneratorExit"),
            ))
        }
        Ok(SendResult::Return(_)) => Ok(()),
        Err(raised) => {
            let exc = ts.take_exc();
            let swallowed = ts.exception_matches(exc.as_obj(), ExcKind::GeneratorExit)
                || ts.exception_matches(exc.as_obj(), ExcKind::StopIteration)
                || ts.exception_matches(exc.as_obj(), ExcKind::StopAsyncIteration);
            if swallowed {
                let _ = raised;
                Ok(())
            } else {
                Err(ts.raise_obj(exc))
            }
        }
    }
}

/* DELEGATION (YIELD_FROM) */

/// Outcome of one delegation step.
pub(crate) enum Delegate {
    /// The sub-iterator yielded; re-yield to our caller.
    Yielded(ObjRef),
    /// The sub-iterator finished with this value.
    Done(ObjRef),
}

/// Advance the sub-iterator of a `yield from`.
pub(crate) fn delegate(
    ts: &mut ThreadState,
    sub: Obj,
    sent: Option<ObjRef>,
) -> ExecResult<Delegate> {
    if let Some(gen) = current_gen(ts) {
        unsafe { *payload(gen).yield_from.get() = Some(ObjRef::new(sub)) };
    }
    let outcome = if is_generator(ts, sub) {
        match send(ts, sub, sent.as_ref().map(|v| v.as_obj())) {
            Ok(SendResult::Yield(v)) => Ok(Delegate::Yielded(v)),
            Ok(SendResult::Return(v)) => Ok(Delegate::Done(v)),
            Err(raised) => {
                // A StopIteration out of a closed sub-generator ends the
                // delegation normally.
                let exc = ts.take_exc();
                if ts.exception_matches(exc.as_obj(), ExcKind::StopIteration) {
                    let _ = raised;
                    let value = stop_iteration_value(ts, exc.as_obj());
                    Ok(Delegate::Done(value))
                } else {
                    Err(ts.raise_obj(exc))
                }
            }
        }
    } else {
        match crate::interpreter::iter::iter_next(ts, sub)? {
            crate::object::IterNext::Yield(v) => Ok(Delegate::Yielded(v)),
            crate::object::IterNext::Done(value) => {
                let value = value.unwrap_or_else(|| ObjRef::new(ts.none()));
                Ok(Delegate::Done(value))
            }
        }
    };
    if let Some(gen) = current_gen(ts) {
        if matches!(outcome, Ok(Delegate::Done(_)) | Err(_)) {
            unsafe { *payload(gen).yield_from.get() = None };
        }
    }
    outcome
}

/// The payload of a StopIteration: its first argument, or None.
fn stop_iteration_value(ts: &ThreadState, exc: Obj) -> ObjRef {
    let args = exception::args_of(exc);
    match crate::object::tuple::items(args).first() {
        Some(v) => v.clone(),
        None => ObjRef::new(ts.none()),
    }
}

/// Drive an awaitable to completion, discarding intermediate yields.
/// Used where the core must await without an event loop (async-with
/// exits, `aclose`).
pub(crate) fn drive(ts: &mut ThreadState, awaitable: Obj) -> ExecResult<ObjRef> {
    let iter = crate::interpreter::iter::get_awaitable(ts, awaitable)?;
    loop {
        if is_generator(ts, iter.as_obj()) {
            match send(ts, iter.as_obj(), None)? {
                SendResult::Yield(_) => continue,
                SendResult::Return(v) => return Ok(v),
            }
        }
        match crate::interpreter::iter::iter_next(ts, iter.as_obj())? {
            crate::object::IterNext::Yield(_) => continue,
            crate::object::IterNext::Done(v) => {
                return Ok(v.unwrap_or_else(|| ObjRef::new(ts.none())))
            }
        }
    }
}

/// `END_ASYNC_WITH`: like the synchronous form, but the exit handler's
/// result is awaited before the suppress decision.
pub(crate) fn end_async_with(
    ts: &mut ThreadState,
    a: usize,
) -> ExecResult<crate::interpreter::flow::EndWith> {
    let link = ts.active_mut().reg(a as isize + 2);
    let on_exception = link.is_payload() && link.payload() == -1;
    let exit_reg = ts.active_mut().reg(a as isize + 1);
    debug_assert!(exit_reg.is_object());
    let exit = ObjRef::new(exit_reg.as_obj());

    let none = ts.none();
    let exc;
    let raw = if on_exception {
        let exc_reg = ts.active_mut().reg(a as isize + 3);
        debug_assert!(exc_reg.is_object());
        let exc_obj = exc_reg.as_obj();
        exc = Some(ObjRef::new(exc_obj));
        let exc_type = exc_obj.type_of().as_obj();
        crate::interpreter::call::call_object(ts, exit.as_obj(), &[exc_type, exc_obj, none])?
    } else {
        exc = None;
        crate::interpreter::call::call_object(ts, exit.as_obj(), &[none, none, none])?
    };
    let result = drive(ts, raw.as_obj())?;
    crate::interpreter::flow::finish_with(ts, a, result, exc)
}

/* ASYNC-GENERATOR WRAPPING */

#[repr(C)]
pub struct WrappedValue {
    base: ObjectHeader,
    value: ObjRef,
}

/// Wrap a value yielded by an async generator so `__anext__` can tell
/// yields from returns.
pub(crate) fn wrap_async_yield(ts: &mut ThreadState, value: ObjRef) -> ObjRef {
    let Some(gen) = current_gen(ts) else {
        return value;
    };
    if kind_of(gen) != GenKind::AsyncGenerator {
        return value;
    }
    let ty = ts.rt().types.agen_wrapped;
    ts.alloc_obj(WrappedValue {
        base: ObjectHeader::new(ty, ts.id()),
        value,
    })
}

fn unwrap_value(obj: Obj) -> ObjRef {
    let payload: &WrappedValue = unsafe { obj.payload() };
    payload.value.clone()
}

pub(crate) unsafe fn drop_wrapped(obj: Obj) {
    crate::heap::free_object::<WrappedValue>(obj);
}

pub(crate) fn wrapped_slots() -> TypeSlots {
    TypeSlots::EMPTY
}

/* TYPE GLUE */

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<GenObject>(obj);
}

fn gen_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let g = payload(obj);
    visit(g.code.as_obj());
    if let Some(rv) = unsafe { (*g.return_value.get()).as_ref() } {
        visit(rv.as_obj());
    }
    if let Some(yf) = unsafe { (*g.yield_from.get()).as_ref() } {
        visit(yf.as_obj());
    }
    // Suspended frame registers hold strong references too.
    for reg in unsafe { (*g.stack.get()).regs.iter() } {
        if reg.is_owned() {
            visit(reg.as_obj());
        }
    }
}

fn gen_finalize(ts: &mut ThreadState, obj: Obj) {
    if matches!(status_of(obj), GenStatus::Suspended) {
        if let Err(raised) = close(ts, obj) {
            let _ = ts.take_exc();
            let _ = raised;
            tracing::warn!(target: "quill::generator", "exception ignored while finalizing generator");
        }
    }
}

fn identity_iter(_ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(ObjRef::new(obj))
}

fn gen_iternext(ts: &mut ThreadState, obj: Obj) -> ExecResult<crate::object::IterNext> {
    if matches!(status_of(obj), GenStatus::Closed) {
        return Ok(crate::object::IterNext::Done(None));
    }
    match send(ts, obj, None)? {
        SendResult::Yield(v) => Ok(crate::object::IterNext::Yield(v)),
        SendResult::Return(v) => {
            let none = ts.none();
            let value = (v.as_obj() != none).then_some(v);
            Ok(crate::object::IterNext::Done(value))
        }
    }
}

fn gen_getattr(ts: &mut ThreadState, obj: Obj, name: Obj) -> ExecResult<ObjRef> {
    let method: Option<func::NativeFn> = match string::as_str(name) {
        "send" => Some(native_send),
        "throw" => Some(native_throw),
        "close" => Some(native_close),
        "asend" if kind_of(obj) == GenKind::AsyncGenerator => Some(native_send),
        "aclose" if kind_of(obj) == GenKind::AsyncGenerator => Some(native_close),
        "__name__" => {
            return Ok(payload(obj).name.clone());
        }
        "__qualname__" => {
            return Ok(payload(obj).qualname.clone());
        }
        _ => None,
    };
    match method {
        Some(f) => {
            let native = func::new_native(ts, string::as_str(name), f);
            Ok(func::new_method(ts, native.as_obj(), obj))
        }
        None => Err(crate::interpreter::attr::err_attr(ts, obj.type_of(), name)),
    }
}

fn native_send(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [gen, value] = args else {
        return Err(ts.raise(ExcKind::TypeError, "send() takes exactly one argument"));
    };
    match send(ts, *gen, Some(*value))? {
        SendResult::Yield(v) => Ok(v),
        SendResult::Return(v) => {
            let exc = exception::new(ts, ExcKind::StopIteration, vec![v]);
            Err(ts.raise_obj(exc))
        }
    }
}

fn native_throw(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [gen, exc] = args else {
        return Err(ts.raise(ExcKind::TypeError, "throw() takes exactly one argument"));
    };
    if !exception::is_exception(*exc) {
        return Err(ts.raise(
            ExcKind::TypeError,
            "exceptions must derive from BaseException",
        ));
    }
    match throw(ts, *gen, ObjRef::new(*exc))? {
        SendResult::Yield(v) => Ok(v),
        SendResult::Return(v) => {
            let exc = exception::new(ts, ExcKind::StopIteration, vec![v]);
            Err(ts.raise_obj(exc))
        }
    }
}

fn native_close(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [gen] = args else {
        return Err(ts.raise(ExcKind::TypeError, "close() takes no arguments"));
    };
    close(ts, *gen)?;
    Ok(ObjRef::new(ts.none()))
}

pub(crate) fn generator_slots() -> TypeSlots {
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(gen_iternext),
        getattr: Some(gen_getattr),
        traverse: Some(gen_traverse),
        finalize: Some(gen_finalize),
        ..TypeSlots::EMPTY
    }
}

pub(crate) fn coroutine_slots() -> TypeSlots {
    let mut async_ = crate::object::AsyncMethods::EMPTY;
    async_.await_ = Some(identity_iter);
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(gen_iternext),
        getattr: Some(gen_getattr),
        traverse: Some(gen_traverse),
        finalize: Some(gen_finalize),
        async_,
        ..TypeSlots::EMPTY
    }
}

/* __anext__ AWAITABLE */

#[repr(C)]
pub struct AnextAwaitable {
    base: ObjectHeader,
    gen: ObjRef,
}

fn agen_anext(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let ty = ts.rt().types.anext_awaitable;
    Ok(ts.alloc_obj(AnextAwaitable {
        base: ObjectHeader::new(ty, ts.id()),
        gen: ObjRef::new(obj),
    }))
}

/// Driving the `__anext__` awaitable: wrapped yields complete the await
/// with the unwrapped value; bare yields pass through to whatever is
/// driving the outer coroutine; a return raises StopAsyncIteration.
fn anext_iternext(ts: &mut ThreadState, obj: Obj) -> ExecResult<crate::object::IterNext> {
    let gen = {
        let a: &AnextAwaitable = unsafe { obj.payload() };
        a.gen.as_obj()
    };
    match send(ts, gen, None)? {
        SendResult::Yield(v) => {
            if v.as_obj().is_exact(ts.rt().types.agen_wrapped) {
                Ok(crate::object::IterNext::Done(Some(unwrap_value(v.as_obj()))))
            } else {
                Ok(crate::object::IterNext::Yield(v))
            }
        }
        SendResult::Return(_) => {
            let exc = exception::new(ts, ExcKind::StopAsyncIteration, Vec::new());
            Err(ts.raise_obj(exc))
        }
    }
}

pub(crate) unsafe fn drop_anext(obj: Obj) {
    crate::heap::free_object::<AnextAwaitable>(obj);
}

pub(crate) fn anext_slots() -> TypeSlots {
    let mut async_ = crate::object::AsyncMethods::EMPTY;
    async_.await_ = Some(identity_iter);
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(anext_iternext),
        async_,
        ..TypeSlots::EMPTY
    }
}

pub(crate) fn async_generator_slots() -> TypeSlots {
    let mut async_ = crate::object::AsyncMethods::EMPTY;
    async_.aiter = Some(identity_iter);
    async_.anext = Some(agen_anext);
    TypeSlots {
        getattr: Some(gen_getattr),
        traverse: Some(gen_traverse),
        finalize: Some(gen_finalize),
        async_,
        ..TypeSlots::EMPTY
    }
}
