//! Attribute access and method loading

use crate::error::{ExcKind, ExecResult};
use crate::object::{class, func, Obj, ObjRef, TypeObject};
use crate::thread::ThreadState;

/// Generic attribute read: the type's slot, else MRO resolution.
pub(crate) fn getattr(ts: &mut ThreadState, obj: Obj, name: Obj) -> ExecResult<ObjRef> {
    if let Some(f) = obj.type_of().slots.getattr {
        return f(ts, obj, name);
    }
    let ty = unsafe { class::extend_lifetime(obj.type_of()) };
    if let Some(value) = class::type_lookup(ts, ty, name)? {
        let value_obj = value.as_obj();
        if value_obj.is_exact(ts.rt().types.function) || value_obj.is_exact(ts.rt().types.native) {
            return Ok(func::new_method(ts, value_obj, obj));
        }
        return Ok(value);
    }
    Err(err_attr(ts, obj.type_of(), name))
}

/// Generic attribute write/delete through the type's slot.
pub(crate) fn setattr(
    ts: &mut ThreadState,
    obj: Obj,
    name: Obj,
    value: Option<Obj>,
) -> ExecResult<()> {
    match obj.type_of().slots.setattr {
        Some(f) => f(ts, obj, name, value),
        None => {
            let name_str = crate::object::string::as_str(name).to_owned();
            let ty = obj.type_of().name().to_owned();
            Err(ts.raise(
                ExcKind::AttributeError,
                format!("'{ty}' object attribute '{name_str}' is read-only"),
            ))
        }
    }
}

/// `LOAD_METHOD` resolution. Returns `(callable, Some(receiver))` for an
/// unbound function found on the type — the caller passes the receiver
/// as the first argument without materializing a bound method — or
/// `(attribute, None)` for anything else.
pub(crate) fn load_method(
    ts: &mut ThreadState,
    obj: Obj,
    name: Obj,
) -> ExecResult<(ObjRef, Option<ObjRef>)> {
    // Only the generic path can split the pair; types with a getattr
    // slot resolve through it wholesale.
    if obj.type_of().slots.getattr.is_none() {
        let ty = unsafe { class::extend_lifetime(obj.type_of()) };
        if let Some(value) = class::type_lookup(ts, ty, name)? {
            let value_obj = value.as_obj();
            if value_obj.is_exact(ts.rt().types.function)
                || value_obj.is_exact(ts.rt().types.native)
            {
                return Ok((value, Some(ObjRef::new(obj))));
            }
            return Ok((value, None));
        }
        return Err(err_attr(ts, obj.type_of(), name));
    }
    let attr = getattr(ts, obj, name)?;
    Ok((attr, None))
}

pub(crate) fn err_attr(
    ts: &mut ThreadState,
    ty: &TypeObject,
    name: Obj,
) -> crate::error::Raised {
    let attr = crate::object::string::as_str(name).to_owned();
    let ty = ty.name().to_owned();
    ts.raise(
        ExcKind::AttributeError,
        format!("'{ty}' object has no attribute '{attr}'"),
    )
}
