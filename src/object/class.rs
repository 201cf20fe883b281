//! Runtime classes and instances
//!
//! A class statement produces a heap [`TypeObject`]: its namespace dict,
//! a C3-linearized MRO tuple, and the per-type method cache. Classes are
//! immortal once created; what dies is their instances. Attribute writes
//! on a class invalidate its cache and every transitive subclass's
//! cache under the runtime MRO mutex.

use crate::error::{ExcKind, ExecResult};
use crate::mro::CacheAnswer;
use crate::object::{
    string, tuple, Obj, ObjectHeader, ObjRef, TypeFlags, TypeObject, TypeSlots,
};
use crate::rc;
use crate::thread::ThreadState;

#[repr(C)]
pub struct InstanceObject {
    base: ObjectHeader,
    dict: ObjRef,
}

/// The instance's attribute mapping.
pub fn instance_dict(obj: Obj) -> Obj {
    let payload: &InstanceObject = unsafe { obj.payload() };
    payload.dict.as_obj()
}

pub(crate) unsafe fn drop_instance(obj: Obj) {
    crate::heap::free_object::<InstanceObject>(obj);
}

fn instance_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    visit(instance_dict(obj));
}

/// Create a class: namespace is consumed as the type's dict.
pub fn new_class(
    ts: &mut ThreadState,
    name: &str,
    bases: &[Obj],
    namespace: Obj,
) -> ExecResult<Obj> {
    let type_ty = ts.rt().types.type_;
    let exc_kind = bases
        .iter()
        .find_map(|b| unsafe { b.payload::<TypeObject>() }.exc_kind);
    let mut ty = TypeObject::make(
        type_ty,
        name.into(),
        TypeFlags::HEAP | TypeFlags::BASETYPE | TypeFlags::HAS_DICT | TypeFlags::HAS_GC,
        instance_slots(),
        drop_instance,
        exc_kind,
    );
    rc::incref(namespace);
    ty.dict = core::sync::atomic::AtomicPtr::new(namespace.as_ptr());

    // Classes are immortal; the leak is deliberate.
    let ty: &'static TypeObject = Box::leak(Box::new(ty));
    let ty_obj = ty.as_obj();

    let mro = linearize(ts, ty_obj, bases)?;
    let mro_tuple = tuple::new(ts, mro.iter().map(|o| ObjRef::new(*o)).collect());
    crate::raw::store_ptr_release(&ty.mro, mro_tuple.into_raw().as_ptr());

    ts.with_mro(|_ts, state| {
        ty.cache.init(state);
        for base in bases {
            let base_ty: &TypeObject = unsafe { base.payload() };
            unsafe { (*base_ty.subclasses.get()).push(ty_obj) };
        }
    });
    tracing::debug!(target: "quill::class", name, bases = bases.len(), "class created");
    Ok(ty_obj)
}

/// C3 linearization of `ty` over its bases' MROs.
fn linearize(ts: &mut ThreadState, ty: Obj, bases: &[Obj]) -> ExecResult<Vec<Obj>> {
    let mut sequences: Vec<Vec<Obj>> = Vec::with_capacity(bases.len() + 2);
    for base in bases {
        let base_ty: &TypeObject = unsafe { base.payload() };
        let mro = base_ty
            .mro_tuple()
            .map(|t| tuple::items(t).iter().map(|o| o.as_obj()).collect())
            .unwrap_or_else(|| vec![*base]);
        sequences.push(mro);
    }
    sequences.push(bases.to_vec());

    let mut out = vec![ty];
    loop {
        sequences.retain(|s| !s.is_empty());
        if sequences.is_empty() {
            return Ok(out);
        }
        // A head is good if it appears in no other sequence's tail.
        let mut chosen = None;
        'heads: for seq in &sequences {
            let head = seq[0];
            for other in &sequences {
                if other[1..].contains(&head) {
                    continue 'heads;
                }
            }
            chosen = Some(head);
            break;
        }
        let Some(head) = chosen else {
            return Err(ts.raise(
                ExcKind::TypeError,
                "cannot create a consistent method resolution order",
            ));
        };
        out.push(head);
        for seq in &mut sequences {
            seq.retain(|t| *t != head);
        }
    }
}

/// Resolve `name` through the type's MRO, consulting and filling the
/// per-type cache.
pub fn type_lookup(
    ts: &mut ThreadState,
    ty: &'static TypeObject,
    name: Obj,
) -> ExecResult<Option<ObjRef>> {
    match ty.cache.lookup(name) {
        CacheAnswer::Hit(value) => return Ok(Some(ObjRef::new(value))),
        CacheAnswer::Absent => return Ok(None),
        CacheAnswer::Miss => {}
    }
    // Walk the MRO outside any lock: namespace reads of interned names
    // are lock-free.
    let resolved = resolve_uncached(ts, ty, name)?;
    let value_obj = resolved.as_ref().map(|v| v.as_obj());
    ts.with_mro(|_ts, state| {
        let rt = _ts.runtime();
        ty.cache.init(state);
        ty.cache.insert(state, &rt.qsbr, name, value_obj);
    });
    Ok(resolved)
}

fn resolve_uncached(
    ts: &mut ThreadState,
    ty: &TypeObject,
    name: Obj,
) -> ExecResult<Option<ObjRef>> {
    let Some(mro) = ty.mro_tuple() else {
        // Unreadied type: consult only its own dict.
        if let Some(dict) = ty.dict_obj() {
            return crate::dict::get(ts, dict, name);
        }
        return Ok(None);
    };
    let entries: Vec<Obj> = tuple::items(mro).iter().map(|o| o.as_obj()).collect();
    for entry in entries {
        let entry_ty: &TypeObject = unsafe { entry.payload() };
        if let Some(dict) = entry_ty.dict_obj() {
            if let Some(value) = crate::dict::get(ts, dict, name)? {
                return Ok(Some(value));
            }
        }
    }
    Ok(None)
}

/// Invalidate the cache of `ty` and of every transitive subclass.
pub fn invalidate_type(ts: &mut ThreadState, ty: &'static TypeObject) {
    ts.with_mro(|_ts, state| {
        let rt = _ts.runtime();
        let mut stack: Vec<&'static TypeObject> = vec![ty];
        while let Some(t) = stack.pop() {
            t.cache.erase(state, &rt.qsbr);
            for sub in unsafe { (*t.subclasses.get()).iter() } {
                stack.push(unsafe { sub.payload::<TypeObject>() });
            }
        }
    });
}

/* SLOTS FOR INSTANCES */

fn instance_getattr(ts: &mut ThreadState, obj: Obj, name: Obj) -> ExecResult<ObjRef> {
    if let Some(value) = crate::dict::get(ts, instance_dict(obj), name)? {
        return Ok(value);
    }
    let ty = unsafe { extend_lifetime(obj.type_of()) };
    if let Some(value) = type_lookup(ts, ty, name)? {
        // Functions found on the class bind to the instance.
        let value_obj = value.as_obj();
        if value_obj.is_exact(ts.rt().types.function) || value_obj.is_exact(ts.rt().types.native)
        {
            return Ok(super::func::new_method(ts, value_obj, obj));
        }
        return Ok(value);
    }
    let ty_name = obj.type_of().name().to_owned();
    let attr = string::as_str(name).to_owned();
    Err(ts.raise(
        ExcKind::AttributeError,
        format!("'{ty_name}' object has no attribute '{attr}'"),
    ))
}

fn instance_setattr(
    ts: &mut ThreadState,
    obj: Obj,
    name: Obj,
    value: Option<Obj>,
) -> ExecResult<()> {
    match value {
        Some(value) => crate::dict::set(ts, instance_dict(obj), name, value),
        None => {
            if crate::dict::delete(ts, instance_dict(obj), name)? {
                Ok(())
            } else {
                let attr = string::as_str(name).to_owned();
                Err(ts.raise(ExcKind::AttributeError, attr))
            }
        }
    }
}

pub(crate) fn instance_slots() -> TypeSlots {
    TypeSlots {
        getattr: Some(instance_getattr),
        setattr: Some(instance_setattr),
        traverse: Some(instance_traverse),
        ..TypeSlots::EMPTY
    }
}

/* SLOTS FOR THE METATYPE */

/// Calling a type: instantiate it.
fn type_call(ts: &mut ThreadState, cls: Obj, args: &[Obj]) -> ExecResult<ObjRef> {
    let ty: &TypeObject = unsafe { cls.payload() };
    let ty = unsafe { extend_lifetime(ty) };
    if ty.exc_kind.is_some() {
        return Ok(super::exception::construct(ts, ty, args));
    }
    if !ty.flags().contains(TypeFlags::HEAP) {
        let name = ty.name().to_owned();
        return Err(ts.raise(
            ExcKind::TypeError,
            format!("cannot create '{name}' instances"),
        ));
    }
    let dict = crate::dict::new(ts);
    let instance = ts.alloc_gc(InstanceObject {
        base: ObjectHeader::new(ty, ts.id()),
        dict,
    });
    let init_name = ts.intern("__init__");
    if let Some(init) = type_lookup(ts, ty, init_name)? {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(instance.as_obj());
        full.extend_from_slice(args);
        let result = crate::interpreter::call::call_object(ts, init.as_obj(), &full)?;
        drop(result);
    }
    Ok(instance)
}

/// Attribute read on a class object (`A.m`): unbound MRO lookup.
fn type_getattr(ts: &mut ThreadState, cls: Obj, name: Obj) -> ExecResult<ObjRef> {
    let ty: &TypeObject = unsafe { cls.payload() };
    let ty = unsafe { extend_lifetime(ty) };
    if string::as_str(name) == "__name__" {
        let n = ty.name().to_owned();
        return Ok(string::new(ts, n));
    }
    if let Some(value) = type_lookup(ts, ty, name)? {
        return Ok(value);
    }
    let ty_name = ty.name().to_owned();
    let attr = string::as_str(name).to_owned();
    Err(ts.raise(
        ExcKind::AttributeError,
        format!("type object '{ty_name}' has no attribute '{attr}'"),
    ))
}

/// Attribute write on a class object: update the namespace and drop
/// every cache that could have resolved through it.
fn type_setattr(ts: &mut ThreadState, cls: Obj, name: Obj, value: Option<Obj>) -> ExecResult<()> {
    let ty: &TypeObject = unsafe { cls.payload() };
    let ty = unsafe { extend_lifetime(ty) };
    if !ty.flags().contains(TypeFlags::HEAP) {
        let ty_name = ty.name().to_owned();
        return Err(ts.raise(
            ExcKind::TypeError,
            format!("cannot set attributes of built-in type '{ty_name}'"),
        ));
    }
    let Some(dict) = ty.dict_obj() else {
        return Err(ts.raise(ExcKind::SystemError, "class namespace missing"));
    };
    match value {
        Some(value) => crate::dict::set(ts, dict, name, value)?,
        None => {
            if !crate::dict::delete(ts, dict, name)? {
                let attr = string::as_str(name).to_owned();
                return Err(ts.raise(ExcKind::AttributeError, attr));
            }
        }
    }
    invalidate_type(ts, ty);
    Ok(())
}

pub(crate) fn type_slots() -> TypeSlots {
    TypeSlots {
        call: Some(type_call),
        getattr: Some(type_getattr),
        setattr: Some(type_setattr),
        ..TypeSlots::EMPTY
    }
}

pub(crate) unsafe fn drop_type(obj: Obj) {
    // Types are immortal; reaching this is a refcount bug.
    unreachable!("type object {} destroyed", obj.type_of().name());
}

/// Types created by `new_class` (and the builtin set) are immortal, so
/// a `&TypeObject` derived from a live handle never dangles.
pub(crate) unsafe fn extend_lifetime(ty: &TypeObject) -> &'static TypeObject {
    &*(ty as *const TypeObject)
}
