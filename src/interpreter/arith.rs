//! Numeric, comparison and truth-protocol dispatch
//!
//! Binary operators try the left operand's slot, then the right
//! operand's when the types differ; `None` from both raises TypeError.
//! In-place operators prefer the in-place slot and fall back to the
//! plain binary one.

use crate::error::{ExcKind, ExecResult};
use crate::object::{BinOp, CmpOp, Obj, ObjRef, UnOp};
use crate::thread::ThreadState;

/// Full binary-operator dispatch.
pub(crate) fn binary_op(ts: &mut ThreadState, op: BinOp, a: Obj, b: Obj) -> ExecResult<ObjRef> {
    if let Some(f) = a.type_of().slots.number.binary[op as usize] {
        if let Some(result) = f(ts, a, b)? {
            return Ok(result);
        }
    }
    if !core::ptr::eq(a.type_of(), b.type_of()) {
        if let Some(f) = b.type_of().slots.number.binary[op as usize] {
            if let Some(result) = f(ts, a, b)? {
                return Ok(result);
            }
        }
    }
    Err(err_operands(ts, op.symbol(), a, b))
}

/// In-place operator dispatch (`INPLACE_*`).
pub(crate) fn inplace_op(ts: &mut ThreadState, op: BinOp, a: Obj, b: Obj) -> ExecResult<ObjRef> {
    if let Some(f) = a.type_of().slots.number.inplace[op as usize] {
        if let Some(result) = f(ts, a, b)? {
            return Ok(result);
        }
    }
    binary_op(ts, op, a, b)
}

/// Unary operator dispatch.
pub(crate) fn unary_op(ts: &mut ThreadState, op: UnOp, a: Obj) -> ExecResult<ObjRef> {
    if let Some(f) = a.type_of().slots.number.unary[op as usize] {
        return f(ts, a);
    }
    let symbol = match op {
        UnOp::Neg => "-",
        UnOp::Pos => "+",
        UnOp::Invert => "~",
    };
    let name = a.type_of().name().to_owned();
    Err(ts.raise(
        ExcKind::TypeError,
        format!("bad operand type for unary {symbol}: '{name}'"),
    ))
}

fn err_operands(ts: &mut ThreadState, symbol: &str, a: Obj, b: Obj) -> crate::error::Raised {
    let (ta, tb) = (a.type_of().name().to_owned(), b.type_of().name().to_owned());
    ts.raise(
        ExcKind::TypeError,
        format!("unsupported operand type(s) for {symbol}: '{ta}' and '{tb}'"),
    )
}

/// Truth value of an object. Types without a truth slot are true.
pub(crate) fn truth(ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    // The singletons short-circuit without slot dispatch.
    let rt = ts.runtime();
    if obj == rt.singletons.true_ {
        return Ok(true);
    }
    if obj == rt.singletons.false_ || obj == rt.singletons.none {
        return Ok(false);
    }
    match obj.type_of().slots.number.bool_ {
        Some(f) => f(ts, obj),
        None => Ok(true),
    }
}

/// Rich comparison producing an object.
pub(crate) fn rich_compare(
    ts: &mut ThreadState,
    a: Obj,
    b: Obj,
    op: CmpOp,
) -> ExecResult<ObjRef> {
    if let Some(f) = a.type_of().slots.richcompare {
        if let Some(result) = f(ts, a, b, op)? {
            return Ok(result);
        }
    }
    if !core::ptr::eq(a.type_of(), b.type_of()) {
        if let Some(f) = b.type_of().slots.richcompare {
            if let Some(result) = f(ts, b, a, op.swapped())? {
                return Ok(result);
            }
        }
    }
    // Identity fallback for (in)equality; ordering has no fallback.
    match op {
        CmpOp::Eq => Ok(ts.bool_ref(a == b)),
        CmpOp::Ne => Ok(ts.bool_ref(a != b)),
        _ => {
            let (ta, tb) = (a.type_of().name().to_owned(), b.type_of().name().to_owned());
            Err(ts.raise(
                ExcKind::TypeError,
                format!("'{ta}' and '{tb}' are not orderable"),
            ))
        }
    }
}

/// Equality collapsed to a bool, with the identity short-circuit.
pub(crate) fn eq_bool(ts: &mut ThreadState, a: Obj, b: Obj) -> ExecResult<bool> {
    if a == b {
        return Ok(true);
    }
    let result = rich_compare(ts, a, b, CmpOp::Eq)?;
    truth(ts, result.as_obj())
}

/// Containment test through the `contains` slot, falling back to
/// iteration.
pub(crate) fn contains(ts: &mut ThreadState, container: Obj, item: Obj) -> ExecResult<bool> {
    if let Some(f) = container.type_of().slots.contains {
        return f(ts, container, item);
    }
    let iterator = super::iter::get_iter(ts, container)?;
    loop {
        match super::iter::iter_next(ts, iterator.as_obj())? {
            crate::object::IterNext::Yield(candidate) => {
                if eq_bool(ts, candidate.as_obj(), item)? {
                    return Ok(true);
                }
            }
            crate::object::IterNext::Done(_) => return Ok(false),
        }
    }
}
