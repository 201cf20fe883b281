//! Process-wide runtime state
//!
//! One [`Runtime`] per process: the builtin type table, the immortal
//! singletons, the string intern table, the MRO mutex and cache pool,
//! the pending-call queue, the signal and import hooks, the intrinsic
//! table and the collector handshake. Everything here is created during
//! bring-up (`Runtime::new`) and torn down explicitly (`shutdown`).

use core::cell::UnsafeCell;
use core::sync::atomic::AtomicU64;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use hashbrown::HashMap;
use strum::EnumCount;

use crate::error::{ExcKind, ExecResult};
use crate::heap::AllocPolicy;
use crate::lock::RawMutex;
use crate::mro::MroState;
use crate::object::{
    class, exception, func, list, module, number, set, string, tuple, Obj, ObjRef, TypeFlags,
    TypeObject, TypeSlots,
};
use crate::qsbr::{Qsbr, RetireList};
use crate::thread::{Breaker, ThreadShared, ThreadState};

/// Tunables fixed at bring-up.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Process-wide allocator policy.
    pub alloc_policy: AllocPolicy,
    /// Live-object count that requests a collection.
    pub gc_threshold: usize,
    /// Frames captured into a coroutine's origin.
    pub coro_origin_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            alloc_policy: AllocPolicy::Default,
            gc_threshold: crate::consts::GC_THRESHOLD,
            coro_origin_depth: crate::consts::CORO_ORIGIN_DEPTH,
        }
    }
}

/// A host callback drained at safe points.
pub type PendingCall = Box<dyn FnOnce(&mut ThreadState) + Send>;

/// Host signal dispatcher.
pub type SignalHandler = Box<dyn Fn(&mut ThreadState) -> ExecResult<()> + Send + Sync>;

/// Host import resolver: name → module object.
pub type ImportHook = Box<dyn Fn(&mut ThreadState, &str) -> ExecResult<ObjRef> + Send + Sync>;

/// A process-wide intrinsic.
pub enum Intrinsic {
    /// One argument in, one value out.
    Unary(fn(&mut ThreadState, Obj) -> ExecResult<ObjRef>),
    /// A contiguous argument slice in, one value out.
    Vararg(fn(&mut ThreadState, &[Obj]) -> ExecResult<ObjRef>),
}

/// The builtin type table. Every entry is immortal.
pub struct BuiltinTypes {
    pub type_: &'static TypeObject,
    pub none: &'static TypeObject,
    pub bool_: &'static TypeObject,
    pub int: &'static TypeObject,
    pub str_: &'static TypeObject,
    pub tuple: &'static TypeObject,
    pub tuple_iter: &'static TypeObject,
    pub list: &'static TypeObject,
    pub list_iter: &'static TypeObject,
    pub set: &'static TypeObject,
    pub dict: &'static TypeObject,
    pub dict_iter: &'static TypeObject,
    pub module: &'static TypeObject,
    pub function: &'static TypeObject,
    pub native: &'static TypeObject,
    pub method: &'static TypeObject,
    pub cell: &'static TypeObject,
    pub code: &'static TypeObject,
    pub generator: &'static TypeObject,
    pub coroutine: &'static TypeObject,
    pub async_generator: &'static TypeObject,
    /// Wrapper distinguishing async-generator yields from returns.
    pub agen_wrapped: &'static TypeObject,
    /// The awaitable produced by an async generator's `__anext__`.
    pub anext_awaitable: &'static TypeObject,
    pub frame: &'static TypeObject,
    pub slice: &'static TypeObject,
    /// One type per builtin exception kind, indexed by `ExcKind`.
    pub exceptions: [&'static TypeObject; ExcKind::COUNT],
}

/// The immortal singletons.
pub struct Singletons {
    pub none: Obj,
    pub true_: Obj,
    pub false_: Obj,
    pub empty_tuple: Obj,
    /// `-5..=256`, see [`number::SMALL_INT_MIN`].
    pub small_ints: Vec<Obj>,
}

/// The process-wide runtime.
pub struct Runtime {
    pub(crate) config: RuntimeConfig,
    pub(crate) qsbr: Qsbr,
    /// Guards `mro_state` and every type's subclass list.
    pub(crate) mro_mutex: RawMutex,
    pub(crate) mro_state: UnsafeCell<MroState>,
    pub(crate) types: BuiltinTypes,
    pub(crate) singletons: Singletons,
    intern_table: Mutex<HashMap<Box<str>, Obj>>,
    pub(crate) global_version: AtomicU64,
    threads: Mutex<HashMap<u64, Arc<ThreadShared>>>,
    pending: Mutex<VecDeque<PendingCall>>,
    signal_handler: Mutex<Option<SignalHandler>>,
    import_hook: Mutex<Option<ImportHook>>,
    builtins: OnceLock<ObjRef>,
    pub(crate) gc: &'static crate::gc::GcState,
    pub(crate) intrinsics: Vec<Intrinsic>,
    /// Retire lists inherited from detached threads.
    orphans: Mutex<Vec<RetireList>>,
}

unsafe impl Sync for Runtime {}
unsafe impl Send for Runtime {}

fn leak_type(ty: TypeObject) -> &'static TypeObject {
    Box::leak(Box::new(ty))
}

impl Runtime {
    /// Bring the runtime up: types, singletons, interning, builtins.
    pub fn new(config: RuntimeConfig) -> Arc<Runtime> {
        crate::heap::set_policy(config.alloc_policy);
        tracing::info!(target: "quill::runtime", ?config, "runtime bring-up");

        // The metatype references itself; patch after leaking.
        let type_: &'static TypeObject = leak_type(TypeObject::make(
            core::ptr::null(),
            "type".into(),
            TypeFlags::BASETYPE,
            class::type_slots(),
            class::drop_type,
            None,
        ));
        unsafe {
            let p = type_ as *const TypeObject as *mut TypeObject;
            (*p).base.ty = type_;
        }

        let mk = |name: &str, flags: TypeFlags, slots: TypeSlots, drop: crate::object::DropFunc| {
            leak_type(TypeObject::make(type_, name.into(), flags, slots, drop, None))
        };

        let none = mk("NoneType", TypeFlags::empty(), number::none_slots(), immortal_drop);
        let bool_ = mk("bool", TypeFlags::empty(), number::bool_slots(), immortal_drop);
        let int = mk("int", TypeFlags::empty(), number::slots(), number::drop_obj);
        let str_ = mk("str", TypeFlags::empty(), string::slots(), string::drop_obj);
        let tuple_ty = mk("tuple", TypeFlags::HAS_GC, tuple::slots(), tuple::drop_obj);
        let tuple_iter = mk("tuple_iterator", TypeFlags::empty(), tuple::iter_slots(), tuple::drop_iter);
        let list_ty = mk("list", TypeFlags::HAS_GC, list::slots(), list::drop_obj);
        let list_iter = mk("list_iterator", TypeFlags::empty(), list::iter_slots(), list::drop_iter);
        let set_ty = mk("set", TypeFlags::HAS_GC, set::slots(), set::drop_obj);
        let dict_ty = mk("dict", TypeFlags::HAS_GC, crate::dict::slots(), crate::dict::drop_obj);
        let dict_iter = mk(
            "dict_keyiterator",
            TypeFlags::empty(),
            crate::dict::iter_slots(),
            crate::dict::drop_iter,
        );
        let module_ty = mk("module", TypeFlags::HAS_GC, module::slots(), module::drop_obj);
        let function = mk("function", TypeFlags::HAS_GC, func::slots(), func::drop_obj);
        let native = mk(
            "builtin_function_or_method",
            TypeFlags::empty(),
            func::native_slots(),
            func::drop_native,
        );
        let method = mk("method", TypeFlags::HAS_GC, func::method_slots(), func::drop_method);
        let cell = mk("cell", TypeFlags::HAS_GC, func::cell_slots(), func::drop_cell);
        let code = mk("code", TypeFlags::empty(), crate::code::slots(), crate::code::drop_obj);
        let generator = mk(
            "generator",
            TypeFlags::HAS_GC,
            crate::generator::generator_slots(),
            crate::generator::drop_obj,
        );
        let coroutine = mk(
            "coroutine",
            TypeFlags::HAS_GC,
            crate::generator::coroutine_slots(),
            crate::generator::drop_obj,
        );
        let async_generator = mk(
            "async_generator",
            TypeFlags::HAS_GC,
            crate::generator::async_generator_slots(),
            crate::generator::drop_obj,
        );
        let agen_wrapped = mk(
            "async_generator_wrapped_value",
            TypeFlags::empty(),
            crate::generator::wrapped_slots(),
            crate::generator::drop_wrapped,
        );
        let anext_awaitable = mk(
            "async_generator_asend",
            TypeFlags::empty(),
            crate::generator::anext_slots(),
            crate::generator::drop_anext,
        );
        let frame = mk(
            "frame",
            TypeFlags::empty(),
            crate::frame::snapshot_slots(),
            crate::frame::drop_snapshot,
        );
        let slice = mk(
            "slice",
            TypeFlags::HAS_GC,
            crate::object::slice::slots(),
            crate::object::slice::drop_obj,
        );

        let exceptions: [&'static TypeObject; ExcKind::COUNT] =
            core::array::from_fn(|i| {
                let kind = ALL_EXC_KINDS[i];
                leak_type(TypeObject::make(
                    type_,
                    kind.to_string().into(),
                    TypeFlags::HAS_GC | TypeFlags::BASETYPE,
                    exception::slots(),
                    exception::drop_obj,
                    Some(kind),
                ))
            });

        // Immortal singletons.
        let none_obj = leak_obj(number::make_singleton(none));
        let true_obj = leak_obj(number::make_bool(bool_, true));
        let false_obj = leak_obj(number::make_bool(bool_, false));
        let empty_tuple = leak_obj(tuple::make_empty(tuple_ty));
        let small_ints: Vec<Obj> = (number::SMALL_INT_MIN..=number::SMALL_INT_MAX)
            .map(|v| leak_obj(number::make_immortal_int(int, v)))
            .collect();

        let types = BuiltinTypes {
            type_,
            none,
            bool_,
            int,
            str_,
            tuple: tuple_ty,
            tuple_iter,
            list: list_ty,
            list_iter,
            set: set_ty,
            dict: dict_ty,
            dict_iter,
            module: module_ty,
            function,
            native,
            method,
            cell,
            code,
            generator,
            coroutine,
            async_generator,
            agen_wrapped,
            anext_awaitable,
            frame,
            slice,
            exceptions,
        };

        // MRO tuples and caches: builtin types linearize to themselves;
        // exception types chain through their parents.
        let mut mro_state = MroState::new();
        for ty in types.iter() {
            set_mro_chain(&types, ty, &mut mro_state);
        }

        let gc = crate::gc::state();
        gc.set_threshold(config.gc_threshold);
        let rt = Arc::new(Runtime {
            config,
            qsbr: Qsbr::new(),
            mro_mutex: RawMutex::new(),
            mro_state: UnsafeCell::new(mro_state),
            types,
            singletons: Singletons {
                none: none_obj,
                true_: true_obj,
                false_: false_obj,
                empty_tuple,
                small_ints,
            },
            intern_table: Mutex::new(HashMap::new()),
            global_version: AtomicU64::new(0),
            threads: Mutex::new(HashMap::new()),
            pending: Mutex::new(VecDeque::new()),
            signal_handler: Mutex::new(None),
            import_hook: Mutex::new(None),
            builtins: OnceLock::new(),
            gc,
            intrinsics: default_intrinsics(),
            orphans: Mutex::new(Vec::new()),
        });

        // Bootstrap thread: populates the builtins module, then detaches.
        {
            let mut boot = ThreadState::new(Arc::clone(&rt));
            let builtins = make_builtins(&mut boot);
            rt.builtins.set(builtins).ok();
        }
        tracing::info!(target: "quill::runtime", "runtime ready");
        rt
    }

    /// The builtin type table.
    pub fn types(&self) -> &BuiltinTypes {
        &self.types
    }

    /// The immortal singletons.
    pub fn singletons(&self) -> &Singletons {
        &self.singletons
    }

    /// The builtins module.
    pub fn builtins(&self) -> Obj {
        self.builtins.get().expect("runtime bring-up complete").as_obj()
    }

    /// The builtins namespace mapping.
    pub fn builtins_dict(&self) -> Obj {
        module::dict_of(self.builtins())
    }

    /// Intern a string, creating an immortal object on first use.
    pub fn intern(&self, s: &str) -> Obj {
        let mut table = self.intern_table.lock().unwrap();
        if let Some(obj) = table.get(s) {
            return *obj;
        }
        let obj = leak_obj(string::make_interned(self.types.str_, s));
        table.insert(s.into(), obj);
        obj
    }

    pub(crate) fn register_thread(&self, tid: u64, shared: Arc<ThreadShared>) {
        self.threads.lock().unwrap().insert(tid, shared);
    }

    pub(crate) fn unregister_thread(&self, tid: u64) {
        self.threads.lock().unwrap().remove(&tid);
    }

    /// Number of attached threads.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().unwrap().len()
    }

    /// Set breaker bits on every attached thread.
    pub(crate) fn broadcast(&self, bits: Breaker) {
        for shared in self.threads.lock().unwrap().values() {
            shared.post(bits);
        }
    }

    /// Set breaker bits on one thread.
    pub(crate) fn post_to(&self, tid: u64, bits: Breaker) -> bool {
        match self.threads.lock().unwrap().get(&tid) {
            Some(shared) => {
                shared.post(bits);
                true
            }
            None => false,
        }
    }

    /// Queue a host callback; some thread runs it at its next safe
    /// point.
    pub fn add_pending_call(&self, call: PendingCall) {
        self.pending.lock().unwrap().push_back(call);
        self.broadcast(Breaker::PENDING_CALLS);
    }

    pub(crate) fn drain_pending(&self, ts: &mut ThreadState) {
        loop {
            let call = self.pending.lock().unwrap().pop_front();
            match call {
                Some(call) => call(ts),
                None => return,
            }
        }
    }

    /// Install the host signal dispatcher.
    pub fn set_signal_handler(&self, handler: SignalHandler) {
        *self.signal_handler.lock().unwrap() = Some(handler);
    }

    /// Note a host signal; dispatch happens at the next safe point.
    pub fn post_signal(&self) {
        self.broadcast(Breaker::PENDING_SIGNALS);
    }

    pub(crate) fn dispatch_signals(&self, ts: &mut ThreadState) -> ExecResult<()> {
        // Don't hold the lock across the handler: it may run user code.
        let taken = self.signal_handler.lock().unwrap().take();
        if let Some(handler) = taken {
            let result = handler(ts);
            *self.signal_handler.lock().unwrap() = Some(handler);
            return result;
        }
        Ok(())
    }

    /// Post an asynchronous exception to `tid`, delivered at its next
    /// safe point. Returns false when the thread is not attached.
    pub fn post_async_exc(&self, tid: u64, exc: ObjRef) -> bool {
        let threads = self.threads.lock().unwrap();
        let Some(shared) = threads.get(&tid) else {
            return false;
        };
        *shared.async_exc.lock().unwrap() = Some(exc);
        shared.post(Breaker::ASYNC_EXC);
        true
    }

    /// Stop every other attached thread at its next safe point, run
    /// `f`, then resume the world. The calling thread acts as the
    /// collector and must hold no critical sections.
    pub fn stop_the_world(&self, ts: &mut ThreadState, f: impl FnOnce(&Runtime)) {
        let expected = self.thread_count().saturating_sub(1);
        ts.sections.end_all();
        self.broadcast(Breaker::STOP_THE_WORLD);
        // The collector does not park itself.
        crate::raw::and_word(&ts.shared.breaker, !Breaker::STOP_THE_WORLD.bits());
        tracing::debug!(target: "quill::runtime", expected, "stopping the world");
        self.gc.begin_stop(expected);
        f(self);
        self.gc.end_stop();
        tracing::debug!(target: "quill::runtime", "world resumed");
    }

    /// Install the host import resolver.
    pub fn set_import_hook(&self, hook: ImportHook) {
        *self.import_hook.lock().unwrap() = Some(hook);
    }

    pub(crate) fn import_module(&self, ts: &mut ThreadState, name: &str) -> ExecResult<ObjRef> {
        let taken = self.import_hook.lock().unwrap().take();
        match taken {
            Some(hook) => {
                let result = hook(ts, name);
                *self.import_hook.lock().unwrap() = Some(hook);
                result
            }
            None => Err(ts.raise(
                ExcKind::ImportError,
                format!("no import hook installed (importing '{name}')"),
            )),
        }
    }

    pub(crate) fn adopt_retired(&self, list: RetireList) {
        if list.pending() > 0 {
            self.orphans.lock().unwrap().push(list);
        }
    }

    /// Explicit teardown: reclaim retired blocks once every thread has
    /// detached.
    pub fn shutdown(&self) {
        assert_eq!(self.thread_count(), 0, "shutdown with attached threads");
        for mut list in self.orphans.lock().unwrap().drain(..) {
            list.flush_all();
        }
        unsafe { (*self.mro_state.get()).retired.flush_all() };
        tracing::info!(target: "quill::runtime", "runtime shut down");
    }
}

impl BuiltinTypes {
    fn iter(&self) -> impl Iterator<Item = &'static TypeObject> + '_ {
        let base = [
            self.type_, self.none, self.bool_, self.int, self.str_, self.tuple,
            self.tuple_iter, self.list, self.list_iter, self.set, self.dict, self.dict_iter,
            self.module, self.function, self.native, self.method, self.cell, self.code,
            self.generator, self.coroutine, self.async_generator, self.agen_wrapped,
            self.anext_awaitable, self.frame, self.slice,
        ];
        base.into_iter().chain(self.exceptions.iter().copied())
    }
}

/// Dense `ExcKind` listing matching its discriminants.
const ALL_EXC_KINDS: [ExcKind; ExcKind::COUNT] = [
    ExcKind::BaseException,
    ExcKind::Exception,
    ExcKind::TypeError,
    ExcKind::ValueError,
    ExcKind::OverflowError,
    ExcKind::ZeroDivisionError,
    ExcKind::ArithmeticError,
    ExcKind::NameError,
    ExcKind::UnboundLocalError,
    ExcKind::AttributeError,
    ExcKind::KeyError,
    ExcKind::IndexError,
    ExcKind::LookupError,
    ExcKind::StopIteration,
    ExcKind::StopAsyncIteration,
    ExcKind::GeneratorExit,
    ExcKind::RuntimeError,
    ExcKind::RecursionError,
    ExcKind::NotImplementedError,
    ExcKind::ImportError,
    ExcKind::SystemError,
    ExcKind::KeyboardInterrupt,
];

fn leak_obj<T>(payload: T) -> Obj {
    let leaked = Box::leak(Box::new(payload));
    unsafe { Obj::from_ptr(leaked as *mut T as *mut crate::object::ObjectHeader) }
}

fn set_mro_chain(types: &BuiltinTypes, ty: &'static TypeObject, state: &mut MroState) {
    let mut chain: Vec<ObjRef> = vec![ObjRef::new(ty.as_obj())];
    if let Some(kind) = ty.exc_kind {
        let mut parent = kind.parent();
        while let Some(k) = parent {
            chain.push(ObjRef::new(types.exceptions[k as usize].as_obj()));
            parent = k.parent();
        }
    }
    let mro = leak_obj(tuple::make_immortal_tuple(types.tuple, chain));
    crate::raw::store_ptr_release(&ty.mro, mro.as_ptr());
    ty.cache.init(state);
}

fn immortal_drop(obj: Obj) {
    unreachable!("immortal object {:#x} destroyed", obj.addr());
}

/* BUILTINS MODULE */

fn make_builtins(ts: &mut ThreadState) -> ObjRef {
    let module = module::new(ts, "builtins");
    crate::rc::make_immortal(module.as_obj());
    let dict = module::dict_of(module.as_obj());
    crate::rc::make_immortal(dict);

    let entries: &[(&str, func::NativeFn)] = &[
        ("len", builtin_len),
        ("sum", builtin_sum),
        ("print", builtin_print),
        ("iter", builtin_iter),
        ("next", builtin_next),
        ("__build_class__", builtin_build_class),
    ];
    for (name, f) in entries {
        let native = func::new_native(ts, name, *f);
        crate::rc::make_immortal(native.as_obj());
        let key = ts.intern(name);
        crate::dict::set(ts, dict, key, native.as_obj()).expect("builtins dict insert");
    }
    // Exception types are reachable by name.
    for kind in ALL_EXC_KINDS {
        let ty = ts.rt().types.exceptions[kind as usize];
        let key = ts.intern(&kind.to_string());
        crate::dict::set(ts, dict, key, ty.as_obj()).expect("builtins dict insert");
    }
    let none_key = ts.intern("None");
    let none = ts.none();
    crate::dict::set(ts, dict, none_key, none).expect("builtins dict insert");
    module
}

fn builtin_len(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [obj] = args else {
        return Err(ts.raise(ExcKind::TypeError, "len() takes exactly one argument"));
    };
    let rt = ts.runtime();
    let n = if obj.is_exact(rt.types.list) {
        list::len(ts, *obj)
    } else if obj.is_exact(rt.types.tuple) {
        tuple::len(*obj)
    } else if obj.is_exact(rt.types.dict) {
        crate::dict::len(*obj)
    } else if obj.is_exact(rt.types.set) {
        set::len(*obj)
    } else if obj.is_exact(rt.types.str_) {
        string::as_str(*obj).chars().count()
    } else {
        let name = obj.type_of().name().to_owned();
        return Err(ts.raise(ExcKind::TypeError, format!("object of type '{name}' has no len()")));
    };
    Ok(number::new_int(ts, n as i64))
}

fn builtin_sum(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let (iterable, start) = match args {
        [iterable] => (*iterable, None),
        [iterable, start] => (*iterable, Some(*start)),
        _ => return Err(ts.raise(ExcKind::TypeError, "sum() takes one or two arguments")),
    };
    let mut total = match start {
        Some(s) => ObjRef::new(s),
        None => number::new_int(ts, 0),
    };
    let iter = crate::interpreter::iter::get_iter(ts, iterable)?;
    loop {
        match crate::interpreter::iter::iter_next(ts, iter.as_obj())? {
            crate::object::IterNext::Yield(item) => {
                total = crate::interpreter::arith::binary_op(
                    ts,
                    crate::object::BinOp::Add,
                    total.as_obj(),
                    item.as_obj(),
                )?;
            }
            crate::object::IterNext::Done(_) => return Ok(total),
        }
    }
}

fn builtin_print(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let rendered: Vec<String> = args
        .iter()
        .map(|a| {
            if a.is_exact(ts.rt().types.str_) {
                string::as_str(*a).to_owned()
            } else if number::is_int(ts, *a) {
                format!("{}", number::int_value(*a))
            } else {
                format!("<{}>", a.type_of().name())
            }
        })
        .collect();
    println!("{}", rendered.join(" "));
    Ok(ObjRef::new(ts.none()))
}

fn builtin_iter(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [obj] = args else {
        return Err(ts.raise(ExcKind::TypeError, "iter() takes exactly one argument"));
    };
    crate::interpreter::iter::get_iter(ts, *obj)
}

fn builtin_next(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [obj] = args else {
        return Err(ts.raise(ExcKind::TypeError, "next() takes exactly one argument"));
    };
    match crate::interpreter::iter::iter_next(ts, *obj)? {
        crate::object::IterNext::Yield(value) => Ok(value),
        crate::object::IterNext::Done(value) => {
            let args = match value {
                Some(v) => vec![v],
                None => vec![],
            };
            let exc = exception::new(ts, ExcKind::StopIteration, args);
            Err(ts.raise_obj(exc))
        }
    }
}

fn builtin_build_class(ts: &mut ThreadState, args: &[Obj]) -> ExecResult<ObjRef> {
    let [name, namespace, bases @ ..] = args else {
        return Err(ts.raise(
            ExcKind::TypeError,
            "__build_class__(name, namespace, *bases)",
        ));
    };
    if !name.is_exact(ts.rt().types.str_) || !namespace.is_exact(ts.rt().types.dict) {
        return Err(ts.raise(ExcKind::TypeError, "__build_class__ argument types"));
    }
    let name = string::as_str(*name).to_owned();
    let ty = class::new_class(ts, &name, bases, *namespace)?;
    Ok(ObjRef::new(ty))
}

fn default_intrinsics() -> Vec<Intrinsic> {
    vec![
        // 0: identity
        Intrinsic::Unary(|_ts, obj| Ok(ObjRef::new(obj))),
        // 1: materialize an iterable as a list
        Intrinsic::Unary(|ts, obj| {
            let out = list::new(ts, Vec::new());
            list::extend(ts, out.as_obj(), obj)?;
            Ok(out)
        }),
        // 2: materialize an iterable as a tuple
        Intrinsic::Unary(|ts, obj| {
            let items = {
                let out = list::new(ts, Vec::new());
                list::extend(ts, out.as_obj(), obj)?;
                list::snapshot(ts, out.as_obj())
            };
            Ok(tuple::new(ts, items))
        }),
        // 3: pack a register range into a tuple
        Intrinsic::Vararg(|ts, args| {
            let items = args.iter().map(|a| ObjRef::new(*a)).collect();
            Ok(tuple::new(ts, items))
        }),
    ]
}
