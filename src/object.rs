//! Object headers, handles and type descriptors
//!
//! Every managed value starts with an [`ObjectHeader`]: type pointer,
//! biased refcount words, the per-object lock and the collector header.
//! [`Obj`] is a copyable non-owning handle; [`ObjRef`] owns one
//! reference count and releases it on drop.
//!
//! Refcount *semantics* (biased counts, merge, deferral) live in
//! [`crate::rc`]; this module only owns the layout.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize};

use crate::error::{ExcKind, ExecResult};
use crate::lock::RawMutex;
use crate::mro::MroCache;
use crate::rc;
use crate::thread::ThreadState;

pub mod class;
pub mod exception;
pub mod func;
pub mod list;
pub mod module;
pub mod number;
pub mod set;
pub mod slice;
pub mod string;
pub mod tuple;

/// Header common to all managed objects.
#[repr(C)]
pub struct ObjectHeader {
    /// Type descriptor. Written once during allocation.
    pub(crate) ty: *const TypeObject,
    /// Thread that owns biased refcounting for this object; 0 = shared.
    pub(crate) tid: AtomicU64,
    /// Local refcount word: `count << 2 | IMMORTAL | DEFERRED`.
    pub(crate) ref_local: AtomicU32,
    /// Shared refcount word: `count << 2 | MAYBE_WEAKREF | MERGED`.
    pub(crate) ref_shared: AtomicU32,
    /// The per-object lock used by critical sections.
    pub(crate) mutex: RawMutex,
    /// Collector back link; low bits hold TRACKED/UNREACHABLE/FINALIZED.
    pub(crate) gc_prev: AtomicUsize,
    /// Collector forward link.
    pub(crate) gc_next: AtomicUsize,
}

unsafe impl Send for ObjectHeader {}
unsafe impl Sync for ObjectHeader {}

impl ObjectHeader {
    /// Header for a freshly allocated object owned by `tid` with one
    /// local reference.
    pub(crate) fn new(ty: *const TypeObject, tid: u64) -> ObjectHeader {
        ObjectHeader {
            ty,
            tid: AtomicU64::new(tid),
            ref_local: AtomicU32::new(1 << rc::LOCAL_SHIFT),
            ref_shared: AtomicU32::new(0),
            mutex: RawMutex::new(),
            gc_prev: AtomicUsize::new(0),
            gc_next: AtomicUsize::new(0),
        }
    }

    /// Header for an immortal object: never deallocated, refcount ops
    /// are no-ops.
    pub(crate) fn new_immortal(ty: *const TypeObject) -> ObjectHeader {
        ObjectHeader {
            ty,
            tid: AtomicU64::new(0),
            ref_local: AtomicU32::new(rc::IMMORTAL),
            ref_shared: AtomicU32::new(0),
            mutex: RawMutex::new(),
            gc_prev: AtomicUsize::new(0),
            gc_next: AtomicUsize::new(0),
        }
    }
}

/// Non-owning object handle. Copyable; identity is the address.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Obj(NonNull<ObjectHeader>);

unsafe impl Send for Obj {}
unsafe impl Sync for Obj {}

impl Obj {
    /// Rebuild a handle from an address previously produced by
    /// [`addr`](Self::addr) or a tagged register.
    ///
    /// # Safety
    /// `addr` must come from a live object allocation.
    #[inline(always)]
    pub(crate) unsafe fn from_addr(addr: u64) -> Obj {
        debug_assert_ne!(addr, 0);
        Obj(NonNull::new_unchecked(addr as usize as *mut ObjectHeader))
    }

    /// Wrap a raw header pointer.
    ///
    /// # Safety
    /// The pointer must reference a live, initialized object.
    #[inline(always)]
    pub(crate) unsafe fn from_ptr(ptr: *mut ObjectHeader) -> Obj {
        Obj(NonNull::new_unchecked(ptr))
    }

    /// Address identity of the object.
    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Raw header pointer.
    #[inline(always)]
    pub(crate) fn as_ptr(self) -> *mut ObjectHeader {
        self.0.as_ptr()
    }

    /// The object header.
    #[inline(always)]
    pub(crate) fn header<'a>(self) -> &'a ObjectHeader {
        unsafe { self.0.as_ref() }
    }

    /// The object's type descriptor.
    #[inline(always)]
    pub fn type_of<'a>(self) -> &'a TypeObject {
        unsafe { &*self.header().ty }
    }

    /// Whether this object's type is exactly `ty`.
    #[inline(always)]
    pub fn is_exact(self, ty: &TypeObject) -> bool {
        core::ptr::eq(self.header().ty, ty)
    }

    /// The per-object lock.
    #[inline(always)]
    pub(crate) fn mutex<'a>(self) -> &'a RawMutex {
        &self.header().mutex
    }

    /// View the object as its concrete payload type.
    ///
    /// # Safety
    /// The caller must have checked the type; `T` must be the payload
    /// struct this object was allocated as (its first field is the
    /// header).
    #[inline(always)]
    pub(crate) unsafe fn payload<'a, T>(self) -> &'a T {
        &*(self.0.as_ptr() as *const T)
    }
}

impl core::fmt::Debug for Obj {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<{} at {:#x}>", self.type_of().name(), self.addr())
    }
}

/// Owning object handle: holds one reference count.
pub struct ObjRef(Obj);

impl ObjRef {
    /// Acquire a new reference to `obj`.
    #[inline]
    pub fn new(obj: Obj) -> ObjRef {
        rc::incref(obj);
        ObjRef(obj)
    }

    /// Assume ownership of one already-acquired reference.
    ///
    /// # Safety
    /// The caller must transfer exactly one reference count.
    #[inline]
    pub unsafe fn from_raw(obj: Obj) -> ObjRef {
        ObjRef(obj)
    }

    /// The underlying handle.
    #[inline]
    pub fn as_obj(&self) -> Obj {
        self.0
    }

    /// Give up ownership without decrementing.
    #[inline]
    pub fn into_raw(self) -> Obj {
        let obj = self.0;
        core::mem::forget(self);
        obj
    }
}

impl Clone for ObjRef {
    fn clone(&self) -> Self {
        ObjRef::new(self.0)
    }
}

impl Drop for ObjRef {
    fn drop(&mut self) {
        rc::decref(self.0);
    }
}

impl core::ops::Deref for ObjRef {
    type Target = Obj;
    fn deref(&self) -> &Obj {
        &self.0
    }
}

impl core::fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.0.fmt(f)
    }
}

unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

/* SLOT SIGNATURES */

/// Unary slot: `iter`, `await`, `aiter`, numeric negate, str().
pub type UnaryFunc = fn(&mut ThreadState, Obj) -> ExecResult<ObjRef>;

/// Binary numeric slot. `None` means "not implemented for these
/// operands"; the dispatcher then tries the reflected operand or raises.
pub type BinaryFunc = fn(&mut ThreadState, Obj, Obj) -> ExecResult<Option<ObjRef>>;

/// Truth-value slot.
pub type BoolFunc = fn(&mut ThreadState, Obj) -> ExecResult<bool>;

/// Hash slot.
pub type HashFunc = fn(&mut ThreadState, Obj) -> ExecResult<u64>;

/// Rich comparison slot; `None` defers to the generic fallback.
pub type CompareFunc = fn(&mut ThreadState, Obj, Obj, CmpOp) -> ExecResult<Option<ObjRef>>;

/// Native call slot (positional arguments only at this boundary).
pub type CallFunc = fn(&mut ThreadState, Obj, &[Obj]) -> ExecResult<ObjRef>;

/// Attribute read slot.
pub type GetAttrFunc = fn(&mut ThreadState, Obj, Obj) -> ExecResult<ObjRef>;

/// Attribute write slot; `None` value deletes.
pub type SetAttrFunc = fn(&mut ThreadState, Obj, Obj, Option<Obj>) -> ExecResult<()>;

/// Result of advancing an iterator.
pub enum IterNext {
    /// The iterator produced a value.
    Yield(ObjRef),
    /// The iterator is exhausted; generators may carry a return value.
    Done(Option<ObjRef>),
}

/// Iterator advance slot. Exhaustion is in-band, not an exception.
pub type IterNextFunc = fn(&mut ThreadState, Obj) -> ExecResult<IterNext>;

/// Subscript read slot.
pub type SubscrFunc = fn(&mut ThreadState, Obj, Obj) -> ExecResult<ObjRef>;

/// Subscript write slot; `None` value deletes.
pub type SetSubscrFunc = fn(&mut ThreadState, Obj, Obj, Option<Obj>) -> ExecResult<()>;

/// Containment slot.
pub type ContainsFunc = fn(&mut ThreadState, Obj, Obj) -> ExecResult<bool>;

/// Collector traversal: must visit every strong reference.
pub type TraverseFunc = fn(Obj, &mut dyn FnMut(Obj));

/// Finalizer: runs user-visible cleanup with a thread state.
pub type FinalizeFunc = fn(&mut ThreadState, Obj);

/// Destructor: drops the payload and returns memory to the heap. Must
/// not run user code and must not require a thread state.
pub type DropFunc = unsafe fn(Obj);

/// Rich-comparison selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CmpOp {
    Lt = 0,
    Le = 1,
    Eq = 2,
    Ne = 3,
    Gt = 4,
    Ge = 5,
}

impl CmpOp {
    /// The comparison with operands swapped.
    pub const fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Le => CmpOp::Ge,
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::Ne => CmpOp::Ne,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Ge => CmpOp::Le,
        }
    }

    /// Decode the operand of `COMPARE_OP`.
    pub const fn from_operand(op: u8) -> Option<CmpOp> {
        Some(match op {
            0 => CmpOp::Lt,
            1 => CmpOp::Le,
            2 => CmpOp::Eq,
            3 => CmpOp::Ne,
            4 => CmpOp::Gt,
            5 => CmpOp::Ge,
            _ => return None,
        })
    }
}

/// Binary operator index into [`NumberMethods`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum BinOp {
    Add = 0,
    Sub = 1,
    Mul = 2,
    MatMul = 3,
    TrueDiv = 4,
    FloorDiv = 5,
    Rem = 6,
    Pow = 7,
    Shl = 8,
    Shr = 9,
    And = 10,
    Or = 11,
    Xor = 12,
}

/// Number of [`BinOp`] variants.
pub const BINOP_COUNT: usize = 13;

impl BinOp {
    /// Operator symbol for error messages.
    pub const fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::MatMul => "@",
            BinOp::TrueDiv => "/",
            BinOp::FloorDiv => "//",
            BinOp::Rem => "%",
            BinOp::Pow => "**",
            BinOp::Shl => "<<",
            BinOp::Shr => ">>",
            BinOp::And => "&",
            BinOp::Or => "|",
            BinOp::Xor => "^",
        }
    }
}

/// Unary operator index into [`NumberMethods`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum UnOp {
    Neg = 0,
    Pos = 1,
    Invert = 2,
}

/// Numeric method table.
#[derive(Clone, Copy)]
pub struct NumberMethods {
    /// Binary operators.
    pub binary: [Option<BinaryFunc>; BINOP_COUNT],
    /// In-place operators; fall back to `binary` when absent.
    pub inplace: [Option<BinaryFunc>; BINOP_COUNT],
    /// Unary operators (negate, posate, invert).
    pub unary: [Option<UnaryFunc>; 3],
    /// Truth value; objects without it are unconditionally true.
    pub bool_: Option<BoolFunc>,
}

impl NumberMethods {
    /// A table with every slot absent.
    pub const EMPTY: NumberMethods = NumberMethods {
        binary: [None; BINOP_COUNT],
        inplace: [None; BINOP_COUNT],
        unary: [None; 3],
        bool_: None,
    };
}

/// Asynchronous method table.
#[derive(Clone, Copy)]
pub struct AsyncMethods {
    /// `am_await`: produce the awaitable iterator.
    pub await_: Option<UnaryFunc>,
    /// `am_aiter`: produce the async iterator.
    pub aiter: Option<UnaryFunc>,
    /// `am_anext`: produce the awaitable for the next element.
    pub anext: Option<UnaryFunc>,
}

impl AsyncMethods {
    /// A table with every slot absent.
    pub const EMPTY: AsyncMethods = AsyncMethods {
        await_: None,
        aiter: None,
        anext: None,
    };
}

/// The full slot table of a type.
#[derive(Clone, Copy)]
pub struct TypeSlots {
    /// `tp_call`.
    pub call: Option<CallFunc>,
    /// `tp_getattro`.
    pub getattr: Option<GetAttrFunc>,
    /// `tp_setattro`.
    pub setattr: Option<SetAttrFunc>,
    /// `tp_iter`.
    pub iter: Option<UnaryFunc>,
    /// `tp_iternext`.
    pub iternext: Option<IterNextFunc>,
    /// `tp_richcompare`.
    pub richcompare: Option<CompareFunc>,
    /// `tp_hash`.
    pub hash: Option<HashFunc>,
    /// Numeric methods.
    pub number: NumberMethods,
    /// Async methods.
    pub async_: AsyncMethods,
    /// Mapping/sequence subscript read.
    pub subscr: Option<SubscrFunc>,
    /// Mapping/sequence subscript write/delete.
    pub set_subscr: Option<SetSubscrFunc>,
    /// Containment test.
    pub contains: Option<ContainsFunc>,
    /// Collector traversal; required when `TypeFlags::HAS_GC` is set.
    pub traverse: Option<TraverseFunc>,
    /// Finalizer, run before destruction for resurrectable cleanup.
    pub finalize: Option<FinalizeFunc>,
    /// Per-instance opt-out of collection for `HAS_GC` types.
    pub is_gc: Option<fn(Obj) -> bool>,
}

impl TypeSlots {
    /// A slot table with everything absent.
    pub const EMPTY: TypeSlots = TypeSlots {
        call: None,
        getattr: None,
        setattr: None,
        iter: None,
        iternext: None,
        richcompare: None,
        hash: None,
        number: NumberMethods::EMPTY,
        async_: AsyncMethods::EMPTY,
        subscr: None,
        set_subscr: None,
        contains: None,
        traverse: None,
        finalize: None,
        is_gc: None,
    };
}

bitflags::bitflags! {
    /// Type behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Instances participate in cycle collection.
        const HAS_GC = 1 << 0;
        /// The type may be subclassed.
        const BASETYPE = 1 << 1;
        /// The type was created at runtime (a class statement).
        const HEAP = 1 << 2;
        /// Instances carry an attribute dict.
        const HAS_DICT = 1 << 3;
    }
}

/// A type descriptor. Type descriptors are themselves objects.
#[repr(C)]
pub struct TypeObject {
    pub(crate) base: ObjectHeader,
    name: Box<str>,
    flags: TypeFlags,
    pub(crate) slots: TypeSlots,
    pub(crate) drop_fn: DropFunc,
    /// Builtin exception kind, for exception types only.
    pub(crate) exc_kind: Option<ExcKind>,
    /// Namespace mapping (a dict object), if the type has one.
    pub(crate) dict: AtomicPtr<ObjectHeader>,
    /// Linearized MRO as a tuple of types, `self` first.
    pub(crate) mro: AtomicPtr<ObjectHeader>,
    /// Method lookup cache over the MRO.
    pub(crate) cache: MroCache,
    /// Direct subclasses; guarded by the runtime MRO mutex.
    pub(crate) subclasses: UnsafeCell<Vec<Obj>>,
}

unsafe impl Send for TypeObject {}
unsafe impl Sync for TypeObject {}

impl TypeObject {
    /// Type name as written in diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Behavior flags.
    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    /// The type descriptor as an object handle.
    pub fn as_obj(&self) -> Obj {
        unsafe { Obj::from_ptr(self as *const TypeObject as *mut ObjectHeader) }
    }

    /// Construct the descriptor value; allocation is the caller's job.
    pub(crate) fn make(
        ty_of_types: *const TypeObject,
        name: Box<str>,
        flags: TypeFlags,
        slots: TypeSlots,
        drop_fn: DropFunc,
        exc_kind: Option<ExcKind>,
    ) -> TypeObject {
        TypeObject {
            base: ObjectHeader::new_immortal(ty_of_types),
            name,
            flags,
            slots,
            drop_fn,
            exc_kind,
            dict: AtomicPtr::new(core::ptr::null_mut()),
            mro: AtomicPtr::new(core::ptr::null_mut()),
            cache: MroCache::new(),
            subclasses: UnsafeCell::new(Vec::new()),
        }
    }

    /// The MRO tuple, if initialized.
    pub(crate) fn mro_tuple(&self) -> Option<Obj> {
        let ptr = crate::raw::load_ptr_acquire(&self.mro);
        NonNull::new(ptr).map(|p| Obj(p))
    }

    /// The namespace dict, if initialized.
    pub(crate) fn dict_obj(&self) -> Option<Obj> {
        let ptr = crate::raw::load_ptr_acquire(&self.dict);
        NonNull::new(ptr).map(|p| Obj(p))
    }

    /// Whether `self` is `other` or a transitive subtype of it, per the
    /// linearized MRO.
    pub fn is_subtype_of(&self, other: &TypeObject) -> bool {
        if core::ptr::eq(self, other) {
            return true;
        }
        let Some(mro) = self.mro_tuple() else {
            return false;
        };
        crate::object::tuple::items(mro)
            .iter()
            .any(|entry| entry.addr() == other.as_obj().addr())
    }
}

impl core::fmt::Debug for TypeObject {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "<type {}>", self.name)
    }
}
