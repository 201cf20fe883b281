//! String objects
//!
//! Interned strings are immortal and identity-comparable; the runtime
//! intern table promotes every name that reaches a namespace, so the
//! concurrent mapping and the MRO cache can compare keys by pointer.
//! The hash is computed once and cached in the header word.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::ExecResult;
use crate::object::{CmpOp, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::thread::ThreadState;

#[repr(C)]
pub struct StrObject {
    base: ObjectHeader,
    /// Cached hash; 0 means "not yet computed".
    hash: AtomicU64,
    interned: bool,
    value: Box<str>,
}

/// Allocate a mortal string.
pub fn new(ts: &mut ThreadState, value: impl Into<Box<str>>) -> ObjRef {
    let ty = ts.rt().types.str_;
    ts.alloc_obj(StrObject {
        base: ObjectHeader::new(ty, ts.id()),
        hash: AtomicU64::new(0),
        interned: false,
        value: value.into(),
    })
}

/// Construct the immortal payload for the intern table. The hash is
/// computed eagerly so readers never race its initialization.
pub(crate) fn make_interned(ty: &'static crate::object::TypeObject, value: &str) -> StrObject {
    StrObject {
        base: ObjectHeader::new_immortal(ty),
        hash: AtomicU64::new(str_hash(value)),
        interned: true,
        value: value.into(),
    }
}

/// The string contents.
pub fn as_str<'a>(obj: Obj) -> &'a str {
    let payload: &StrObject = unsafe { obj.payload() };
    &payload.value
}

/// Whether the object is an interned string (identity-comparable key).
pub fn is_interned(obj: Obj) -> bool {
    let payload: &StrObject = unsafe { obj.payload() };
    payload.interned
}

/// The cached hash, computing and storing it on first use.
pub fn cached_hash(obj: Obj) -> u64 {
    let payload: &StrObject = unsafe { obj.payload() };
    let h = payload.hash.load(Ordering::Relaxed);
    if h != 0 {
        return h;
    }
    let computed = str_hash(&payload.value);
    payload.hash.store(computed, Ordering::Relaxed);
    computed
}

/// FNV-1a over the bytes, pinned away from the 0 sentinel.
pub(crate) fn str_hash(s: &str) -> u64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in s.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x1000_0000_01b3);
    }
    if h == 0 {
        1
    } else {
        h
    }
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<StrObject>(obj);
}

fn str_richcompare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<Option<ObjRef>> {
    if !b.is_exact(ts.rt().types.str_) {
        return Ok(None);
    }
    let (sa, sb) = (as_str(a), as_str(b));
    let answer = match op {
        CmpOp::Eq => sa == sb,
        CmpOp::Ne => sa != sb,
        CmpOp::Lt => sa < sb,
        CmpOp::Le => sa <= sb,
        CmpOp::Gt => sa > sb,
        CmpOp::Ge => sa >= sb,
    };
    Ok(Some(ts.bool_ref(answer)))
}

fn str_hash_slot(_ts: &mut ThreadState, obj: Obj) -> ExecResult<u64> {
    Ok(cached_hash(obj))
}

fn str_concat(ts: &mut ThreadState, a: Obj, b: Obj) -> ExecResult<Option<ObjRef>> {
    if !a.is_exact(ts.rt().types.str_) || !b.is_exact(ts.rt().types.str_) {
        return Ok(None);
    }
    let mut out = String::with_capacity(as_str(a).len() + as_str(b).len());
    out.push_str(as_str(a));
    out.push_str(as_str(b));
    Ok(Some(new(ts, out)))
}

fn str_bool(_ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(!as_str(obj).is_empty())
}

fn str_contains(ts: &mut ThreadState, obj: Obj, item: Obj) -> ExecResult<bool> {
    if !item.is_exact(ts.rt().types.str_) {
        return Err(ts.raise(
            crate::error::ExcKind::TypeError,
            "'in <string>' requires string as left operand",
        ));
    }
    Ok(as_str(obj).contains(as_str(item)))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.binary[crate::object::BinOp::Add as usize] = Some(str_concat);
    number.bool_ = Some(str_bool);
    TypeSlots {
        richcompare: Some(str_richcompare),
        hash: Some(str_hash_slot),
        number,
        contains: Some(str_contains),
        ..TypeSlots::EMPTY
    }
}
