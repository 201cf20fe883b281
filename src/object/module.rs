//! Module objects: a name plus a namespace mapping.

use crate::error::{ExcKind, ExecResult};
use crate::object::{string, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct ModuleObject {
    base: ObjectHeader,
    name: ObjRef,
    dict: ObjRef,
}

/// Allocate a module with a fresh namespace.
pub fn new(ts: &mut ThreadState, name: &str) -> ObjRef {
    let dict = crate::dict::new(ts);
    let name = ts.intern(name);
    let ty = ts.rt().types.module;
    ts.alloc_gc(ModuleObject {
        base: ObjectHeader::new(ty, ts.id()),
        name: ObjRef::new(name),
        dict,
    })
}

/// The module's namespace mapping.
pub fn dict_of(obj: Obj) -> Obj {
    let payload: &ModuleObject = unsafe { obj.payload() };
    payload.dict.as_obj()
}

/// The module's name.
pub fn name_of(obj: Obj) -> Obj {
    let payload: &ModuleObject = unsafe { obj.payload() };
    payload.name.as_obj()
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<ModuleObject>(obj);
}

fn module_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    visit(dict_of(obj));
}

fn module_getattr(ts: &mut ThreadState, obj: Obj, name: Obj) -> ExecResult<ObjRef> {
    if let Some(value) = crate::dict::get(ts, dict_of(obj), name)? {
        return Ok(value);
    }
    let module = string::as_str(name_of(obj)).to_owned();
    let attr = string::as_str(name).to_owned();
    Err(ts.raise(
        ExcKind::AttributeError,
        format!("module '{module}' has no attribute '{attr}'"),
    ))
}

fn module_setattr(
    ts: &mut ThreadState,
    obj: Obj,
    name: Obj,
    value: Option<Obj>,
) -> ExecResult<()> {
    match value {
        Some(value) => crate::dict::set(ts, dict_of(obj), name, value),
        None => {
            if crate::dict::delete(ts, dict_of(obj), name)? {
                Ok(())
            } else {
                let attr = string::as_str(name).to_owned();
                Err(ts.raise(ExcKind::AttributeError, attr))
            }
        }
    }
}

pub(crate) fn slots() -> TypeSlots {
    TypeSlots {
        getattr: Some(module_getattr),
        setattr: Some(module_setattr),
        traverse: Some(module_traverse),
        ..TypeSlots::EMPTY
    }
}
