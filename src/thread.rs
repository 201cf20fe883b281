//! Per-thread state
//!
//! Each OS thread attaches a [`ThreadState`]: its register stacks, the
//! critical-section chain, the four heaps, the QSBR hook, the pending
//! exception and the eval-breaker word. There is no interpreter-wide
//! lock; everything cross-thread goes through object locks, atomic
//! refcounts, or the breaker bits.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::consts::VERSION_BATCH;
use crate::error::{ExcKind, ExecResult, Raised, TraceLine, VmError};
use crate::frame::{StackKind, ThreadStack};
use crate::heap::{Domain, ThreadHeaps};
use crate::object::{exception, string, Obj, ObjectHeader, ObjRef};
use crate::qsbr::RetireList;
use crate::runtime::Runtime;
use crate::section::SectionChain;

bitflags::bitflags! {
    /// Asynchronous conditions examined at safe points.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Breaker: usize {
        /// A host signal arrived; call the registered dispatcher.
        const PENDING_SIGNALS = 1 << 0;
        /// The pending-calls queue is non-empty.
        const PENDING_CALLS = 1 << 1;
        /// A collector requested the world to stop.
        const STOP_THE_WORLD = 1 << 2;
        /// An asynchronous exception was posted to this thread.
        const ASYNC_EXC = 1 << 3;
        /// Another thread asked this one to yield its locks briefly.
        const DROP_REQUEST = 1 << 4;
        /// Merge biased counts for objects leaving this thread.
        const MERGE_REQUEST = 1 << 5;
    }
}

/// The slice of thread state other threads may touch.
pub struct ThreadShared {
    /// The eval-breaker word.
    pub(crate) breaker: AtomicUsize,
    /// Asynchronous exception awaiting delivery.
    pub(crate) async_exc: Mutex<Option<ObjRef>>,
}

impl ThreadShared {
    pub(crate) fn post(&self, bits: Breaker) {
        crate::raw::or_word(&self.breaker, bits.bits());
    }

    fn clear(&self, bits: Breaker) {
        crate::raw::and_word(&self.breaker, !bits.bits());
    }
}

/// Thread-local batch of version tags.
struct VersionCounter {
    next: u64,
    limit: u64,
}

/// Per-thread interpreter state.
pub struct ThreadState {
    pub(crate) rt: Arc<Runtime>,
    id: u64,
    pub(crate) heaps: ThreadHeaps,
    pub(crate) sections: SectionChain,
    pub(crate) shared: Arc<ThreadShared>,
    /// References handed over by foreign threads for biased release.
    merge_target: Arc<crate::rc::MergeTarget>,
    qsbr_local: Arc<AtomicU64>,
    /// Deferred frees of retired keys blocks.
    pub(crate) retired: RetireList,
    versions: VersionCounter,
    /// The thread's own stack; generators push theirs above it.
    base_stack: Box<ThreadStack>,
    /// Innermost stack of the active chain.
    active: *mut ThreadStack,
    /// Pending exception, present iff a `Raised` is in flight.
    pub(crate) cur_exc: Option<ObjRef>,
    /// Trace/profile hook state.
    pub(crate) trace: crate::trace::TraceState,
    /// Safe points since the last retire flush.
    pulse: u32,
}

impl ThreadState {
    /// Attach a new thread state to the runtime.
    pub fn new(rt: Arc<Runtime>) -> ThreadState {
        let id = crate::raw::thread_id();
        let shared = Arc::new(ThreadShared {
            breaker: AtomicUsize::new(0),
            async_exc: Mutex::new(None),
        });
        rt.register_thread(id, Arc::clone(&shared));
        let merge_target = crate::rc::register_merge_target(id, Arc::clone(&shared));
        let qsbr_local = rt.qsbr.register(id);
        let mut base_stack = Box::new(ThreadStack::new(StackKind::Thread));
        let active = base_stack.as_mut() as *mut ThreadStack;
        tracing::debug!(target: "quill::thread", tid = id, "thread state attached");
        ThreadState {
            heaps: ThreadHeaps::new(id),
            sections: SectionChain::new(),
            shared,
            merge_target,
            qsbr_local,
            retired: RetireList::new(),
            versions: VersionCounter { next: 0, limit: 0 },
            base_stack,
            active,
            cur_exc: None,
            trace: crate::trace::TraceState::new(),
            pulse: 0,
            rt,
            id,
        }
    }

    /// The VM thread id used for biased refcounting.
    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The owning runtime.
    #[inline(always)]
    pub fn rt(&self) -> &Runtime {
        &self.rt
    }

    /// A clonable handle to the runtime.
    #[inline(always)]
    pub fn runtime(&self) -> Arc<Runtime> {
        Arc::clone(&self.rt)
    }

    /* STACKS */

    /// The innermost active stack.
    #[inline(always)]
    pub(crate) fn active_mut(&mut self) -> &mut ThreadStack {
        unsafe { &mut *self.active }
    }

    /// Borrow the active stack immutably (stack walking).
    #[inline(always)]
    pub(crate) unsafe fn active_ref(&self) -> &ThreadStack {
        &*self.active
    }

    /// Push a generator's embedded stack onto the active chain.
    pub(crate) fn push_stack(&mut self, stack: *mut ThreadStack) {
        unsafe {
            (*stack).prev = self.active;
        }
        self.active = stack;
    }

    /// Pop the innermost stack, restoring its predecessor.
    pub(crate) fn pop_stack(&mut self) {
        let prev = unsafe { (*self.active).prev };
        unsafe {
            (*self.active).prev = core::ptr::null_mut();
        }
        debug_assert!(!prev.is_null(), "popping the base thread-stack");
        self.active = prev;
    }

    /// Depth of the active stack chain (1 = base only).
    pub fn stack_depth(&self) -> usize {
        let mut depth = 1;
        let mut cur = unsafe { (*self.active).prev };
        while !cur.is_null() {
            depth += 1;
            cur = unsafe { (*cur).prev };
        }
        depth
    }

    /* ALLOCATION */

    /// Allocate a non-collected object payload.
    pub(crate) fn alloc_obj<T>(&mut self, value: T) -> ObjRef {
        let ptr = crate::heap::alloc_value(&mut self.heaps, Domain::Obj, value);
        unsafe { ObjRef::from_raw(Obj::from_ptr(ptr.as_ptr() as *mut ObjectHeader)) }
    }

    /// Allocate a collector-visible object payload and track it, unless
    /// the type's `is_gc` slot opts this instance out.
    pub(crate) fn alloc_gc<T>(&mut self, value: T) -> ObjRef {
        let ptr = crate::heap::alloc_value(&mut self.heaps, Domain::Gc, value);
        let obj = unsafe { Obj::from_ptr(ptr.as_ptr() as *mut ObjectHeader) };
        let collectible = match obj.type_of().slots.is_gc {
            Some(f) => f(obj),
            None => true,
        };
        if collectible {
            self.rt.gc.track(obj);
        }
        unsafe { ObjRef::from_raw(obj) }
    }

    /// Intern a string, returning the immortal object.
    pub fn intern(&mut self, s: &str) -> Obj {
        self.rt.intern(s)
    }

    /// The shared `None` object.
    #[inline]
    pub fn none(&self) -> Obj {
        self.rt.singletons.none
    }

    /// An owned reference to `True` or `False`.
    #[inline]
    pub fn bool_ref(&self, value: bool) -> ObjRef {
        let obj = if value {
            self.rt.singletons.true_
        } else {
            self.rt.singletons.false_
        };
        ObjRef::new(obj)
    }

    /* VERSION TAGS */

    /// Allocate a mapping version tag from the thread-local batch,
    /// refilling from the global counter every [`VERSION_BATCH`] tags.
    pub(crate) fn next_version(&mut self) -> u64 {
        if self.versions.next == self.versions.limit {
            let start = self
                .rt
                .global_version
                .fetch_add(VERSION_BATCH, Ordering::AcqRel);
            self.versions.next = start;
            self.versions.limit = start + VERSION_BATCH;
        }
        self.versions.next += 1;
        self.versions.next
    }

    /* EXCEPTIONS */

    /// Raise a fresh exception of `kind`, chaining the handled
    /// exception as `__context__` when one is active.
    pub fn raise(&mut self, kind: ExcKind, msg: impl AsRef<str>) -> Raised {
        let exc = exception::new_msg(self, kind, msg.as_ref());
        self.raise_obj(exc)
    }

    /// Raise an existing exception object.
    pub fn raise_obj(&mut self, exc: ObjRef) -> Raised {
        if let Some(context) = crate::interpreter::unwind::handled_exc(self) {
            if context != exc.as_obj() {
                exception::set_context(exc.as_obj(), ObjRef::new(context));
            }
        }
        debug_assert!(exception::is_exception(exc.as_obj()));
        self.cur_exc = Some(exc);
        crate::error::raised()
    }

    /// Take the pending exception; the `Raised` in flight is consumed.
    pub(crate) fn take_exc(&mut self) -> ObjRef {
        self.cur_exc
            .take()
            .expect("Raised in flight without a pending exception")
    }

    /// Whether an exception is pending.
    pub fn exc_pending(&self) -> bool {
        self.cur_exc.is_some()
    }

    /* MRO MUTEX */

    /// Run `f` with the process-wide MRO state locked. `f` must not
    /// reach a suspension point.
    pub(crate) fn with_mro<R>(
        &mut self,
        f: impl FnOnce(&mut ThreadState, &mut crate::mro::MroState) -> R,
    ) -> R {
        let rt = self.runtime();
        let id = self.sections.begin(&rt.mro_mutex);
        let state = unsafe { &mut *rt.mro_state.get() };
        let result = f(self, state);
        self.sections.end(id);
        result
    }

    /* SAFE POINTS */

    /// Record a quiescent state and service breaker bits. Returns an
    /// error when an asynchronous exception was delivered.
    pub(crate) fn check_breaker(&mut self) -> ExecResult<()> {
        self.rt.qsbr.quiescent(&self.qsbr_local);
        self.pulse = self.pulse.wrapping_add(1);
        if self.pulse % 128 == 0 {
            let rt = self.runtime();
            self.retired.flush(&rt.qsbr);
            self.heaps.drain_remote();
        }
        let bits = Breaker::from_bits_truncate(self.shared.breaker.load(Ordering::Acquire));
        if bits.is_empty() {
            return Ok(());
        }
        self.check_breaker_slow(bits)
    }

    #[cold]
    fn check_breaker_slow(&mut self, bits: Breaker) -> ExecResult<()> {
        let rt = self.runtime();
        if bits.contains(Breaker::STOP_THE_WORLD) {
            // Acknowledge and park until the collector releases us. All
            // critical sections drop first.
            self.sections.end_all();
            self.shared.clear(Breaker::STOP_THE_WORLD);
            rt.gc.park(self.id);
        }
        if bits.contains(Breaker::PENDING_CALLS) {
            self.shared.clear(Breaker::PENDING_CALLS);
            rt.drain_pending(self);
        }
        if bits.contains(Breaker::PENDING_SIGNALS) {
            self.shared.clear(Breaker::PENDING_SIGNALS);
            rt.dispatch_signals(self)?;
        }
        if bits.contains(Breaker::MERGE_REQUEST) {
            self.shared.clear(Breaker::MERGE_REQUEST);
            let target = Arc::clone(&self.merge_target);
            crate::rc::drain_merge_queue(&target);
        }
        if bits.contains(Breaker::DROP_REQUEST) {
            self.shared.clear(Breaker::DROP_REQUEST);
            self.sections.end_all();
            std::thread::yield_now();
        }
        if bits.contains(Breaker::ASYNC_EXC) {
            self.shared.clear(Breaker::ASYNC_EXC);
            let exc = self.shared.async_exc.lock().unwrap().take();
            if let Some(exc) = exc {
                tracing::debug!(target: "quill::thread", tid = self.id, "async exception delivered");
                return Err(self.raise_obj(exc));
            }
        }
        Ok(())
    }

    /* PUBLIC CALL SURFACE */

    /// Service the eval breaker from long-running native code: records
    /// a quiescent state, parks for stop-the-world, drains pending
    /// calls, and delivers asynchronous exceptions.
    pub fn safepoint(&mut self) -> Result<(), VmError> {
        match self.check_breaker() {
            Ok(()) => Ok(()),
            Err(raised) => Err(self.uncaught(raised)),
        }
    }

    /// Call a callable with positional arguments, converting an escaped
    /// exception into the embedder error shape.
    pub fn call(&mut self, callable: Obj, args: &[Obj]) -> Result<ObjRef, VmError> {
        match crate::interpreter::call::call_object(self, callable, args) {
            Ok(value) => Ok(value),
            Err(raised) => Err(self.uncaught(raised)),
        }
    }

    /// Attribute read through the full resolution machinery.
    pub fn getattr(&mut self, obj: Obj, name: &str) -> Result<ObjRef, VmError> {
        let key = self.intern(name);
        match crate::interpreter::attr::getattr(self, obj, key) {
            Ok(value) => Ok(value),
            Err(raised) => Err(self.uncaught(raised)),
        }
    }

    /// Attribute write (`None` deletes) through the type's slot.
    pub fn setattr(&mut self, obj: Obj, name: &str, value: Option<Obj>) -> Result<(), VmError> {
        let key = self.intern(name);
        match crate::interpreter::attr::setattr(self, obj, key, value) {
            Ok(()) => Ok(()),
            Err(raised) => Err(self.uncaught(raised)),
        }
    }

    /// Render the pending exception as a [`VmError`].
    pub fn uncaught(&mut self, _proof: Raised) -> VmError {
        let exc = self.take_exc();
        let obj = exc.as_obj();
        let traceback = exception::traceback_of(obj)
            .iter()
            .map(|entry| TraceLine {
                filename: string::as_str(entry.filename.as_obj()).to_owned(),
                qualname: string::as_str(entry.qualname.as_obj()).to_owned(),
                line: entry.line,
            })
            .collect();
        VmError::Uncaught {
            kind: exception::kind_of(obj),
            message: exception::message(obj),
            traceback,
        }
    }

    /// Create a class object (the `__build_class__` surface).
    pub fn new_class(&mut self, name: &str, bases: &[Obj], namespace: Obj) -> Result<Obj, VmError> {
        match crate::object::class::new_class(self, name, bases, namespace) {
            Ok(ty) => Ok(ty),
            Err(raised) => Err(self.uncaught(raised)),
        }
    }

    /// Whether `obj` is an instance of an exception type of `kind`.
    pub fn exception_matches(&self, obj: Obj, kind: ExcKind) -> bool {
        exception::is_exception(obj) && exception::kind_of(obj).is_subkind_of(kind)
    }

    /// Materialize the current frame for reflection. `None` outside any
    /// interpreted frame.
    pub fn current_frame(&mut self) -> Option<ObjRef> {
        let function = {
            let stack = unsafe { self.active_ref() };
            if stack.base < crate::consts::FRAME_EXTRA {
                return None;
            }
            stack.callee()?
        };
        if !function.is_exact(self.rt.types.function) {
            return None;
        }
        let pc = unsafe { self.active_ref() }.pc;
        Some(crate::frame::snapshot(self, function, pc))
    }
}

impl Drop for ThreadState {
    fn drop(&mut self) {
        debug_assert_eq!(self.sections.active_count(), 0);
        debug_assert_eq!(
            self.base_stack.base,
            crate::consts::FRAME_EXTRA,
            "thread exited with live frames"
        );
        // Release references peers handed over, then leave the merge
        // registry: later handoffs fall back to in-place merging.
        let target = Arc::clone(&self.merge_target);
        crate::rc::drain_merge_queue(&target);
        crate::rc::unregister_merge_target(self.id);
        // Outstanding retirements may still be probed by peers; park
        // them with the runtime for teardown.
        let leftovers = core::mem::take(&mut self.retired);
        self.rt.adopt_retired(leftovers);
        self.rt.qsbr.unregister(self.id);
        self.rt.unregister_thread(self.id);
        tracing::debug!(target: "quill::thread", tid = self.id, "thread state detached");
    }
}

/// Thread states are moved between OS threads only as whole owned
/// values, never shared.
unsafe impl Send for ThreadState {}
