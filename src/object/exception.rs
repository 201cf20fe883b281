//! Exception objects
//!
//! An exception instance is its kind (carried by its type), an argument
//! tuple, the implicitly chained `__context__`, and the traceback
//! accumulated while the unwinder walks frames. Context and traceback
//! are only mutated by the thread that is raising, between suspension
//! points, so they live in unlocked cells.

use core::cell::UnsafeCell;

use itertools::Itertools;

use crate::error::{ExcKind, ExecResult};
use crate::object::{string, tuple, Obj, ObjectHeader, ObjRef, TypeObject, TypeSlots};
use crate::thread::ThreadState;

/// One traceback line, innermost last.
pub struct TraceEntry {
    /// Source file of the frame.
    pub filename: ObjRef,
    /// Qualified name of the running function.
    pub qualname: ObjRef,
    /// Line active when the frame unwound.
    pub line: u32,
}

#[repr(C)]
pub struct ExcObject {
    base: ObjectHeader,
    kind: ExcKind,
    args: ObjRef,
    context: UnsafeCell<Option<ObjRef>>,
    traceback: UnsafeCell<Vec<TraceEntry>>,
}

/// Allocate an exception of `kind` with an argument tuple.
pub fn new(ts: &mut ThreadState, kind: ExcKind, args: Vec<ObjRef>) -> ObjRef {
    let args = tuple::new(ts, args);
    let ty = ts.rt().types.exceptions[kind as usize];
    ts.alloc_gc(ExcObject {
        base: ObjectHeader::new(ty, ts.id()),
        kind,
        args,
        context: UnsafeCell::new(None),
        traceback: UnsafeCell::new(Vec::new()),
    })
}

/// Allocate an exception whose single argument is a message string.
pub fn new_msg(ts: &mut ThreadState, kind: ExcKind, msg: &str) -> ObjRef {
    let msg = string::new(ts, msg);
    new(ts, kind, vec![msg])
}

/// Instantiate from an exception type object (its `tp_call`).
pub(crate) fn construct(ts: &mut ThreadState, ty: &'static TypeObject, args: &[Obj]) -> ObjRef {
    let kind = ty.exc_kind.expect("construct requires an exception type");
    let args = args.iter().map(|o| ObjRef::new(*o)).collect();
    let args = tuple::new(ts, args);
    ts.alloc_gc(ExcObject {
        base: ObjectHeader::new(ty, ts.id()),
        kind,
        args,
        context: UnsafeCell::new(None),
        traceback: UnsafeCell::new(Vec::new()),
    })
}

fn payload(obj: Obj) -> &'static ExcObject {
    unsafe { obj.payload() }
}

/// Whether this object is an exception instance.
pub fn is_exception(obj: Obj) -> bool {
    obj.type_of().exc_kind.is_some()
}

/// The exception kind.
pub fn kind_of(obj: Obj) -> ExcKind {
    payload(obj).kind
}

/// The argument tuple.
pub fn args_of(obj: Obj) -> Obj {
    payload(obj).args.as_obj()
}

/// The implicitly chained exception, if any.
pub fn context_of(obj: Obj) -> Option<Obj> {
    unsafe { (*payload(obj).context.get()).as_ref().map(|c| c.as_obj()) }
}

/// Chain `context` onto a freshly raised exception. Raiser-thread only.
pub(crate) fn set_context(obj: Obj, context: ObjRef) {
    let cell = payload(obj).context.get();
    unsafe {
        if (*cell).is_none() && context.as_obj() != obj {
            *cell = Some(context);
        }
    }
}

/// Append a traceback line. Unwinder-thread only.
pub(crate) fn push_trace(obj: Obj, entry: TraceEntry) {
    unsafe { (*payload(obj).traceback.get()).push(entry) };
}

/// The traceback accumulated so far, outermost last.
pub fn traceback_of<'a>(obj: Obj) -> &'a [TraceEntry] {
    unsafe { &*payload(obj).traceback.get() }
}

/// Render the arguments the way an uncaught-exception report does.
pub fn message(obj: Obj) -> String {
    let args = args_of(obj);
    let items = tuple::items(args);
    match items {
        [] => String::new(),
        [single] if single.as_obj().type_of().exc_kind.is_none() => {
            render_arg(single.as_obj())
        }
        many => {
            let parts = many.iter().map(|a| render_arg(a.as_obj())).join(", ");
            format!("({parts})")
        }
    }
}

fn render_arg(obj: Obj) -> String {
    let ty = obj.type_of();
    if ty.name() == "str" {
        string::as_str(obj).to_owned()
    } else if ty.name() == "int" || ty.name() == "bool" {
        format!("{}", super::number::int_value(obj))
    } else {
        format!("<{}>", ty.name())
    }
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<ExcObject>(obj);
}

fn exc_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let e = payload(obj);
    visit(e.args.as_obj());
    if let Some(ctx) = unsafe { (*e.context.get()).as_ref() } {
        visit(ctx.as_obj());
    }
    for entry in unsafe { (*e.traceback.get()).iter() } {
        visit(entry.filename.as_obj());
        visit(entry.qualname.as_obj());
    }
}

fn exc_getattr(ts: &mut ThreadState, obj: Obj, name: Obj) -> ExecResult<ObjRef> {
    match string::as_str(name) {
        "args" => Ok(payload(obj).args.clone()),
        "__context__" => Ok(match context_of(obj) {
            Some(ctx) => ObjRef::new(ctx),
            None => ObjRef::new(ts.rt().singletons.none),
        }),
        other => {
            let ty = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::AttributeError,
                format!("'{ty}' object has no attribute '{other}'"),
            ))
        }
    }
}

pub(crate) fn slots() -> TypeSlots {
    TypeSlots {
        getattr: Some(exc_getattr),
        traverse: Some(exc_traverse),
        ..TypeSlots::EMPTY
    }
}
