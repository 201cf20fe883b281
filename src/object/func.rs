//! Function, native-function, bound-method and cell objects

use core::sync::atomic::{AtomicI32, AtomicPtr, AtomicU64, Ordering};

use crate::error::ExecResult;
use crate::object::{Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::rc;
use crate::thread::ThreadState;

/// One inline-cache word per `LOAD_GLOBAL` site: the mapping version the
/// cached slot was observed at, and the slot (-1 = "absent from
/// globals; check builtins").
pub struct GlobalCache {
    pub(crate) version: AtomicU64,
    pub(crate) slot: AtomicI32,
}

impl GlobalCache {
    fn new() -> GlobalCache {
        GlobalCache {
            version: AtomicU64::new(0),
            slot: AtomicI32::new(i32::MIN),
        }
    }

    /// Load the cache, `None` while still cold.
    pub(crate) fn load(&self) -> Option<(u64, i32)> {
        let slot = self.slot.load(Ordering::Relaxed);
        if slot == i32::MIN {
            return None;
        }
        Some((self.version.load(Ordering::Acquire), slot))
    }

    pub(crate) fn store(&self, version: u64, slot: i32) {
        self.version.store(version, Ordering::Release);
        self.slot.store(slot, Ordering::Relaxed);
    }
}

#[repr(C)]
pub struct FuncObject {
    base: ObjectHeader,
    code: ObjRef,
    globals: ObjRef,
    builtins: ObjRef,
    /// Defaults for the rightmost positional parameters.
    defaults: Box<[ObjRef]>,
    /// `name → default` mapping for keyword-only parameters.
    kw_defaults: Option<ObjRef>,
    /// Captured cells, one per free variable of the code object.
    closure: Box<[ObjRef]>,
    name: ObjRef,
    qualname: ObjRef,
    /// One entry per global-load site in the code object.
    global_cache: Box<[GlobalCache]>,
}

/// Allocate a function object.
#[allow(clippy::too_many_arguments)]
pub fn new(
    ts: &mut ThreadState,
    code: Obj,
    globals: Obj,
    builtins: Obj,
    defaults: Vec<ObjRef>,
    kw_defaults: Option<ObjRef>,
    closure: Vec<ObjRef>,
    qualname: &str,
) -> ObjRef {
    let ncaches = crate::code::global_cache_count(code);
    let name = ObjRef::new(ts.intern(qualname.rsplit('.').next().unwrap_or(qualname)));
    let qualname = ObjRef::new(ts.intern(qualname));
    let ty = ts.rt().types.function;
    ts.alloc_gc(FuncObject {
        base: ObjectHeader::new(ty, ts.id()),
        code: ObjRef::new(code),
        globals: ObjRef::new(globals),
        builtins: ObjRef::new(builtins),
        defaults: defaults.into_boxed_slice(),
        kw_defaults,
        closure: closure.into_boxed_slice(),
        name,
        qualname,
        global_cache: (0..ncaches).map(|_| GlobalCache::new()).collect(),
    })
}

fn payload(obj: Obj) -> &'static FuncObject {
    unsafe { obj.payload() }
}

/// The function's code object.
pub fn code_of(obj: Obj) -> Obj {
    payload(obj).code.as_obj()
}

/// The function's globals mapping.
pub fn globals_of(obj: Obj) -> Obj {
    payload(obj).globals.as_obj()
}

/// The function's builtins mapping.
pub fn builtins_of(obj: Obj) -> Obj {
    payload(obj).builtins.as_obj()
}

/// Positional defaults (rightmost parameters).
pub fn defaults_of(obj: Obj) -> &'static [ObjRef] {
    &payload(obj).defaults
}

/// Keyword-only defaults mapping, if any.
pub fn kw_defaults_of(obj: Obj) -> Option<Obj> {
    payload(obj).kw_defaults.as_ref().map(|d| d.as_obj())
}

/// Captured closure cells.
pub fn closure_of(obj: Obj) -> &'static [ObjRef] {
    &payload(obj).closure
}

/// Qualified name.
pub fn qualname_of(obj: Obj) -> Obj {
    payload(obj).qualname.as_obj()
}

pub(crate) fn global_cache(obj: Obj, site: usize) -> Option<&'static GlobalCache> {
    payload(obj).global_cache.get(site)
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<FuncObject>(obj);
}

fn func_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let f = payload(obj);
    visit(f.code.as_obj());
    visit(f.globals.as_obj());
    visit(f.builtins.as_obj());
    for d in f.defaults.iter() {
        visit(d.as_obj());
    }
    if let Some(kd) = &f.kw_defaults {
        visit(kd.as_obj());
    }
    for c in f.closure.iter() {
        visit(c.as_obj());
    }
}

fn func_call(ts: &mut ThreadState, obj: Obj, args: &[Obj]) -> ExecResult<ObjRef> {
    crate::interpreter::call::call_object(ts, obj, args)
}

pub(crate) fn slots() -> TypeSlots {
    TypeSlots {
        call: Some(func_call),
        traverse: Some(func_traverse),
        ..TypeSlots::EMPTY
    }
}

/* NATIVE FUNCTIONS */

/// Signature of a native callable at the evaluator boundary.
pub type NativeFn = fn(&mut ThreadState, &[Obj]) -> ExecResult<ObjRef>;

#[repr(C)]
pub struct NativeFuncObject {
    base: ObjectHeader,
    name: ObjRef,
    func: NativeFn,
}

/// Allocate a native callable.
pub fn new_native(ts: &mut ThreadState, name: &str, func: NativeFn) -> ObjRef {
    let name = ObjRef::new(ts.intern(name));
    let ty = ts.rt().types.native;
    ts.alloc_obj(NativeFuncObject {
        base: ObjectHeader::new(ty, ts.id()),
        name,
        func,
    })
}

/// The native entry point.
pub fn native_fn(obj: Obj) -> NativeFn {
    let payload: &NativeFuncObject = unsafe { obj.payload() };
    payload.func
}

/// The native callable's name.
pub fn native_name(obj: Obj) -> Obj {
    let payload: &NativeFuncObject = unsafe { obj.payload() };
    payload.name.as_obj()
}

pub(crate) unsafe fn drop_native(obj: Obj) {
    crate::heap::free_object::<NativeFuncObject>(obj);
}

fn native_call(ts: &mut ThreadState, obj: Obj, args: &[Obj]) -> ExecResult<ObjRef> {
    (native_fn(obj))(ts, args)
}

pub(crate) fn native_slots() -> TypeSlots {
    TypeSlots {
        call: Some(native_call),
        ..TypeSlots::EMPTY
    }
}

/* BOUND METHODS */

#[repr(C)]
pub struct MethodObject {
    base: ObjectHeader,
    func: ObjRef,
    receiver: ObjRef,
}

/// Bind `func` to `receiver`.
pub fn new_method(ts: &mut ThreadState, func: Obj, receiver: Obj) -> ObjRef {
    let ty = ts.rt().types.method;
    ts.alloc_gc(MethodObject {
        base: ObjectHeader::new(ty, ts.id()),
        func: ObjRef::new(func),
        receiver: ObjRef::new(receiver),
    })
}

/// The unbound callable.
pub fn method_func(obj: Obj) -> Obj {
    let payload: &MethodObject = unsafe { obj.payload() };
    payload.func.as_obj()
}

/// The bound receiver.
pub fn method_receiver(obj: Obj) -> Obj {
    let payload: &MethodObject = unsafe { obj.payload() };
    payload.receiver.as_obj()
}

pub(crate) unsafe fn drop_method(obj: Obj) {
    crate::heap::free_object::<MethodObject>(obj);
}

fn method_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    visit(method_func(obj));
    visit(method_receiver(obj));
}

fn method_call(ts: &mut ThreadState, obj: Obj, args: &[Obj]) -> ExecResult<ObjRef> {
    let mut full = Vec::with_capacity(args.len() + 1);
    full.push(method_receiver(obj));
    full.extend_from_slice(args);
    crate::interpreter::call::call_object(ts, method_func(obj), &full)
}

pub(crate) fn method_slots() -> TypeSlots {
    TypeSlots {
        call: Some(method_call),
        traverse: Some(method_traverse),
        ..TypeSlots::EMPTY
    }
}

/* CELLS */

#[repr(C)]
pub struct CellObject {
    base: ObjectHeader,
    value: AtomicPtr<ObjectHeader>,
}

/// Allocate a cell holding `value` (which may be empty).
pub fn new_cell(ts: &mut ThreadState, value: Option<Obj>) -> ObjRef {
    let ptr = match value {
        Some(v) => {
            rc::incref(v);
            v.as_ptr()
        }
        None => core::ptr::null_mut(),
    };
    let ty = ts.rt().types.cell;
    ts.alloc_gc(CellObject {
        base: ObjectHeader::new(ty, ts.id()),
        value: AtomicPtr::new(ptr),
    })
}

/// Read the cell with a reference acquired.
pub fn cell_get(obj: Obj) -> Option<ObjRef> {
    let payload: &CellObject = unsafe { obj.payload() };
    rc::fetch_ref(&payload.value)
}

/// Store into the cell, dropping the previous value. `None` empties it.
pub fn cell_set(obj: Obj, value: Option<Obj>) {
    let payload: &CellObject = unsafe { obj.payload() };
    let new_ptr = match value {
        Some(v) => {
            rc::incref(v);
            rc::set_maybe_weakref(v);
            v.as_ptr()
        }
        None => core::ptr::null_mut(),
    };
    let old = payload.value.swap(new_ptr, Ordering::AcqRel);
    if !old.is_null() {
        rc::decref(unsafe { Obj::from_ptr(old) });
    }
}

pub(crate) unsafe fn drop_cell(obj: Obj) {
    let payload: &CellObject = obj.payload();
    let old = payload.value.swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        rc::decref(Obj::from_ptr(old));
    }
    crate::heap::free_object::<CellObject>(obj);
}

fn cell_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let payload: &CellObject = unsafe { obj.payload() };
    let ptr = payload.value.load(Ordering::Acquire);
    if !ptr.is_null() {
        visit(unsafe { Obj::from_ptr(ptr) });
    }
}

pub(crate) fn cell_slots() -> TypeSlots {
    TypeSlots {
        traverse: Some(cell_traverse),
        ..TypeSlots::EMPTY
    }
}
