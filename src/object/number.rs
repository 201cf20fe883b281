//! Integer, boolean and none objects
//!
//! Integers are boxed `i64` values. The bring-up pre-allocates the
//! `-5..=256` range as immortal objects, so hot counters never touch
//! the allocator. Arithmetic that leaves the `i64` range raises
//! OverflowError rather than wrapping.

use crate::error::{ExcKind, ExecResult};
use crate::object::{BinOp, CmpOp, Obj, ObjectHeader, ObjRef, TypeSlots, UnOp};
use crate::thread::ThreadState;

/// Smallest pre-allocated integer.
pub const SMALL_INT_MIN: i64 = -5;
/// Largest pre-allocated integer.
pub const SMALL_INT_MAX: i64 = 256;

#[repr(C)]
pub struct IntObject {
    base: ObjectHeader,
    value: i64,
}

/// Immortal payload for the small-int cache and constants.
pub(crate) fn make_immortal_int(ty: &'static crate::object::TypeObject, value: i64) -> IntObject {
    IntObject {
        base: ObjectHeader::new_immortal(ty),
        value,
    }
}

/// Allocate (or fetch from the small-int cache) an integer.
pub fn new_int(ts: &mut ThreadState, value: i64) -> ObjRef {
    if (SMALL_INT_MIN..=SMALL_INT_MAX).contains(&value) {
        let obj = ts.rt().singletons.small_ints[(value - SMALL_INT_MIN) as usize];
        return ObjRef::new(obj);
    }
    let ty = ts.rt().types.int;
    ts.alloc_obj(IntObject {
        base: ObjectHeader::new(ty, ts.id()),
        value,
    })
}

/// The integer value. Valid for int and bool objects.
pub fn int_value(obj: Obj) -> i64 {
    let payload: &IntObject = unsafe { obj.payload() };
    payload.value
}

/// Whether the object is an int (or bool, which counts as one).
pub fn is_int(ts: &ThreadState, obj: Obj) -> bool {
    obj.is_exact(ts.rt().types.int) || obj.is_exact(ts.rt().types.bool_)
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<IntObject>(obj);
}

fn binary(ts: &mut ThreadState, a: Obj, b: Obj, op: BinOp) -> ExecResult<Option<ObjRef>> {
    if !is_int(ts, a) || !is_int(ts, b) {
        return Ok(None);
    }
    let (x, y) = (int_value(a), int_value(b));
    let result = match op {
        BinOp::Add => x.checked_add(y),
        BinOp::Sub => x.checked_sub(y),
        BinOp::Mul => x.checked_mul(y),
        BinOp::FloorDiv => {
            if y == 0 {
                return Err(ts.raise(ExcKind::ZeroDivisionError, "integer division by zero"));
            }
            Some(x.div_euclid(y))
        }
        BinOp::Rem => {
            if y == 0 {
                return Err(ts.raise(ExcKind::ZeroDivisionError, "integer modulo by zero"));
            }
            Some(x.rem_euclid(y))
        }
        BinOp::Pow => {
            if y < 0 {
                return Err(ts.raise(
                    ExcKind::ValueError,
                    "negative exponent not supported for integer power",
                ));
            }
            u32::try_from(y).ok().and_then(|e| x.checked_pow(e))
        }
        BinOp::Shl => u32::try_from(y).ok().and_then(|s| x.checked_shl(s)),
        BinOp::Shr => u32::try_from(y).ok().and_then(|s| x.checked_shr(s)),
        BinOp::And => Some(x & y),
        BinOp::Or => Some(x | y),
        BinOp::Xor => Some(x ^ y),
        BinOp::TrueDiv | BinOp::MatMul => return Ok(None),
    };
    match result {
        Some(v) => Ok(Some(new_int(ts, v))),
        None => Err(ts.raise(ExcKind::OverflowError, "integer result out of range")),
    }
}

macro_rules! int_binop {
    ($name:ident, $op:expr) => {
        fn $name(ts: &mut ThreadState, a: Obj, b: Obj) -> ExecResult<Option<ObjRef>> {
            binary(ts, a, b, $op)
        }
    };
}

int_binop!(int_add, BinOp::Add);
int_binop!(int_sub, BinOp::Sub);
int_binop!(int_mul, BinOp::Mul);
int_binop!(int_floordiv, BinOp::FloorDiv);
int_binop!(int_rem, BinOp::Rem);
int_binop!(int_pow, BinOp::Pow);
int_binop!(int_shl, BinOp::Shl);
int_binop!(int_shr, BinOp::Shr);
int_binop!(int_and, BinOp::And);
int_binop!(int_or, BinOp::Or);
int_binop!(int_xor, BinOp::Xor);

fn int_neg(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    match int_value(obj).checked_neg() {
        Some(v) => Ok(new_int(ts, v)),
        None => Err(ts.raise(ExcKind::OverflowError, "integer result out of range")),
    }
}

fn int_pos(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(new_int(ts, int_value(obj)))
}

fn int_invert(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(new_int(ts, !int_value(obj)))
}

fn int_richcompare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<Option<ObjRef>> {
    if !is_int(ts, a) || !is_int(ts, b) {
        return Ok(None);
    }
    let (x, y) = (int_value(a), int_value(b));
    let answer = match op {
        CmpOp::Lt => x < y,
        CmpOp::Le => x <= y,
        CmpOp::Eq => x == y,
        CmpOp::Ne => x != y,
        CmpOp::Gt => x > y,
        CmpOp::Ge => x >= y,
    };
    Ok(Some(ts.bool_ref(answer)))
}

fn int_bool(_ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(int_value(obj) != 0)
}

fn int_hash_slot(_ts: &mut ThreadState, obj: Obj) -> ExecResult<u64> {
    Ok(crate::dict::mix_hash(int_value(obj) as u64))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.binary[BinOp::Add as usize] = Some(int_add);
    number.binary[BinOp::Sub as usize] = Some(int_sub);
    number.binary[BinOp::Mul as usize] = Some(int_mul);
    number.binary[BinOp::FloorDiv as usize] = Some(int_floordiv);
    number.binary[BinOp::Rem as usize] = Some(int_rem);
    number.binary[BinOp::Pow as usize] = Some(int_pow);
    number.binary[BinOp::Shl as usize] = Some(int_shl);
    number.binary[BinOp::Shr as usize] = Some(int_shr);
    number.binary[BinOp::And as usize] = Some(int_and);
    number.binary[BinOp::Or as usize] = Some(int_or);
    number.binary[BinOp::Xor as usize] = Some(int_xor);
    number.unary[UnOp::Neg as usize] = Some(int_neg);
    number.unary[UnOp::Pos as usize] = Some(int_pos);
    number.unary[UnOp::Invert as usize] = Some(int_invert);
    number.bool_ = Some(int_bool);
    TypeSlots {
        richcompare: Some(int_richcompare),
        hash: Some(int_hash_slot),
        number,
        ..TypeSlots::EMPTY
    }
}

/* BOOL AND NONE */

#[repr(C)]
pub struct SingletonObject {
    base: ObjectHeader,
}

pub(crate) fn make_singleton(ty: &'static crate::object::TypeObject) -> SingletonObject {
    SingletonObject {
        base: ObjectHeader::new_immortal(ty),
    }
}

/// Immortal payload for `True`/`False`: a bool is an int with a bool
/// type pointer.
pub(crate) fn make_bool(ty: &'static crate::object::TypeObject, value: bool) -> IntObject {
    IntObject {
        base: ObjectHeader::new_immortal(ty),
        value: value as i64,
    }
}

fn none_bool(_ts: &mut ThreadState, _obj: Obj) -> ExecResult<bool> {
    Ok(false)
}

fn none_hash_slot(_ts: &mut ThreadState, obj: Obj) -> ExecResult<u64> {
    Ok(crate::dict::mix_hash(obj.addr() as u64))
}

pub(crate) fn none_slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.bool_ = Some(none_bool);
    TypeSlots {
        number,
        hash: Some(none_hash_slot),
        ..TypeSlots::EMPTY
    }
}

/// Bool reuses the int slots; only the type identity differs.
pub(crate) fn bool_slots() -> TypeSlots {
    slots()
}
