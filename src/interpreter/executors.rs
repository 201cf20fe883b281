//! Dispatch loop
//!
//! One fetch/decode/execute loop over the byte encoding. The hot values
//! (`pc`, the current code object, the accumulator) are locals; the
//! thread state's copies are synchronized at safety points, calls and
//! raises. Errors never propagate with `?` past an instruction: every
//! fallible step routes through the unwinder, which either lands in a
//! handler (the loop continues there) or pops out of the evaluator.

use crate::consts::*;
use crate::error::{ExcKind, ExecResult, Raised};
use crate::object::{func, BinOp, CmpOp, IterNext, Obj, ObjRef, UnOp};
use crate::opcode::{Opcode, JUMP_BIAS, JUMP_BIAS_WIDE, JUMP_SIDE_SENTINEL};
use crate::rc;
use crate::thread::ThreadState;
use crate::value::Register;

use super::call::Dispatched;
use super::flow::EndWith;
use super::unwind::Unwound;

#[inline(always)]
fn fetch_u8(instrs: &[u8], pc: &mut usize) -> usize {
    let v = instrs[*pc];
    *pc += 1;
    v as usize
}

#[inline(always)]
fn fetch_u16(instrs: &[u8], pc: &mut usize) -> usize {
    let v = u16::from_le_bytes([instrs[*pc], instrs[*pc + 1]]);
    *pc += 2;
    v as usize
}

#[inline(always)]
fn fetch_u32(instrs: &[u8], pc: &mut usize) -> usize {
    let v = u32::from_le_bytes([
        instrs[*pc],
        instrs[*pc + 1],
        instrs[*pc + 2],
        instrs[*pc + 3],
    ]);
    *pc += 4;
    v as usize
}

/// A register/count operand: one byte, or four when wide.
#[inline(always)]
fn fetch_r(instrs: &[u8], pc: &mut usize, wide: bool) -> usize {
    if wide {
        fetch_u32(instrs, pc)
    } else {
        fetch_u8(instrs, pc)
    }
}

/// An index operand: two bytes, or four when wide.
#[inline(always)]
fn fetch_d(instrs: &[u8], pc: &mut usize, wide: bool) -> usize {
    if wide {
        fetch_u32(instrs, pc)
    } else {
        fetch_u16(instrs, pc)
    }
}

/// A biased jump operand; `None` means "consult the side table".
#[inline(always)]
fn fetch_jump(instrs: &[u8], pc: &mut usize, wide: bool) -> Option<i64> {
    if wide {
        let raw = fetch_u32(instrs, pc) as u32;
        if raw as u64 == JUMP_SIDE_SENTINEL as u64 {
            return None;
        }
        Some(raw as i64 - JUMP_BIAS_WIDE)
    } else {
        let raw = fetch_u16(instrs, pc) as u16;
        if raw == JUMP_SIDE_SENTINEL {
            return None;
        }
        Some(raw as i64 - JUMP_BIAS as i64)
    }
}

/// Convert an accumulator register into an owned reference.
#[inline]
fn ref_of(reg: Register) -> ObjRef {
    debug_assert!(reg.is_object());
    if reg.is_owned() {
        unsafe { ObjRef::from_raw(reg.as_obj()) }
    } else {
        ObjRef::new(reg.as_obj())
    }
}

/// The function of the current frame.
#[inline]
fn current_function(ts: &ThreadState) -> Obj {
    let reg = unsafe { ts.active_ref() }.reg(FRAME_CALLEE);
    debug_assert!(reg.is_object());
    reg.as_obj()
}

enum Step {
    /// Fall through to the next instruction.
    Next,
    /// Return out of the evaluator with this value.
    Return(ObjRef),
}

/// Run the evaluator over the thread's active stack until the current
/// entry frame returns, yields, or unwinds.
pub(crate) fn eval(ts: &mut ThreadState, mut acc: Register) -> ExecResult<ObjRef> {
    let mut code = func::code_of(current_function(ts));
    let mut pc = unsafe { ts.active_ref() }.pc;
    let mut insn_pc = pc;

    loop {
        let instrs = crate::code::instrs(code);
        insn_pc = pc;
        let mut byte = instrs[pc];
        pc += 1;
        let mut wide = false;
        if byte == Opcode::WIDE as u8 {
            wide = true;
            byte = instrs[pc];
            pc += 1;
        }
        let Some(op) = Opcode::from_repr(byte) else {
            let raised = ts.raise(ExcKind::SystemError, format!("unknown opcode {byte}"));
            match handle_raise(ts, &mut acc, raised, insn_pc) {
                Some((new_pc, new_code)) => {
                    pc = new_pc;
                    code = new_code;
                    continue;
                }
                None => return Err(crate::error::raised()),
            }
        };

        if op.is_safety_point() {
            ts.active_mut().pc = insn_pc;
            if ts.trace.wants_lines() {
                crate::trace::line_event(ts, current_function(ts), insn_pc);
            }
        }

        // The dispatch body mutates the loop-carried values through the
        // closure's captures; errors fall out to the unwinder below.
        let step: ExecResult<Step> = (|| {
            match op {
                Opcode::WIDE => {
                    return Err(ts.raise(ExcKind::SystemError, "dangling WIDE prefix"))
                }

                /* constants & jumps */
                Opcode::LOAD_CONST => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let value = crate::code::consts(code)[idx].as_obj();
                    rc::clear_register(acc.take());
                    acc = rc::pack_incref(value);
                }
                Opcode::JUMP => {
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    if target < pc {
                        ts.check_breaker()?;
                    }
                    pc = target;
                }
                Opcode::POP_JUMP_IF_TRUE | Opcode::POP_JUMP_IF_FALSE => {
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    let value = ref_of(acc.take());
                    let truth = quick_truth(ts, value.as_obj())?;
                    drop(value);
                    let jump_on = matches!(op, Opcode::POP_JUMP_IF_TRUE);
                    if truth == jump_on {
                        if target < pc {
                            ts.check_breaker()?;
                        }
                        pc = target;
                    }
                }
                Opcode::JUMP_IF_TRUE | Opcode::JUMP_IF_FALSE => {
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    debug_assert!(acc.is_object());
                    let truth = quick_truth(ts, acc.as_obj())?;
                    let jump_on = matches!(op, Opcode::JUMP_IF_TRUE);
                    if truth == jump_on {
                        if target < pc {
                            ts.check_breaker()?;
                        }
                        pc = target;
                    }
                }

                /* locals */
                Opcode::LOAD_FAST => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let reg = ts.active_mut().reg(r as isize);
                    if !reg.is_object() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    rc::clear_register(acc.take());
                    acc = rc::pack_incref(reg.as_obj());
                }
                Opcode::STORE_FAST => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = acc.take();
                    ts.active_mut().store(r as isize, value);
                }
                Opcode::MOVE => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    let b = fetch_r(instrs, &mut pc, wide);
                    let value = ts.active_mut().take(b as isize);
                    ts.active_mut().store(a as isize, value);
                }
                Opcode::COPY => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    let b = fetch_r(instrs, &mut pc, wide);
                    let src = ts.active_mut().reg(b as isize);
                    debug_assert!(src.is_object());
                    let alias = Register::alias(src.as_obj());
                    ts.active_mut().store(a as isize, alias);
                }
                Opcode::CLEAR_FAST => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    ts.active_mut().clear(r as isize);
                }
                Opcode::CLEAR_ACC => {
                    rc::clear_register(acc.take());
                }
                Opcode::DELETE_FAST => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    if !ts.active_mut().reg(r as isize).is_object() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    ts.active_mut().clear(r as isize);
                }

                /* names */
                Opcode::LOAD_NAME => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let function = current_function(ts);
                    let value = super::names::load_name(ts, function, name)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(value.into_raw());
                }
                Opcode::STORE_NAME | Opcode::STORE_GLOBAL => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let value = ref_of(acc.take());
                    let function = current_function(ts);
                    super::names::store_global(ts, function, name, value.as_obj())?;
                }
                Opcode::DELETE_NAME | Opcode::DELETE_GLOBAL => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let function = current_function(ts);
                    super::names::delete_global(ts, function, name)?;
                }
                Opcode::LOAD_GLOBAL => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let site = fetch_r(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let function = current_function(ts);
                    let value = super::names::load_global(ts, function, name, site)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(value.into_raw());
                }
                Opcode::LOAD_DEREF => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let cell = ts.active_mut().reg(r as isize);
                    debug_assert!(cell.is_object());
                    match func::cell_get(cell.as_obj()) {
                        Some(value) => {
                            rc::clear_register(acc.take());
                            acc = Register::owned(value.into_raw());
                        }
                        None => return Err(super::names::err_unbound(ts, code, r)),
                    }
                }
                Opcode::STORE_DEREF => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let cell = ts.active_mut().reg(r as isize);
                    debug_assert!(cell.is_object());
                    func::cell_set(cell.as_obj(), Some(value.as_obj()));
                }
                Opcode::DELETE_DEREF => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let cell = ts.active_mut().reg(r as isize);
                    debug_assert!(cell.is_object());
                    if func::cell_get(cell.as_obj()).is_none() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    func::cell_set(cell.as_obj(), None);
                }
                Opcode::LOAD_CLASSDEREF => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let r = fetch_r(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let cell = ts.active_mut().reg(r as isize);
                    debug_assert!(cell.is_object());
                    let function = current_function(ts);
                    let value =
                        super::names::load_classderef(ts, function, cell.as_obj(), name)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(value.into_raw());
                }

                /* attributes */
                Opcode::LOAD_ATTR => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let obj = ref_of(acc.take());
                    let value = super::attr::getattr(ts, obj.as_obj(), name)?;
                    acc = Register::owned(value.into_raw());
                }
                Opcode::STORE_ATTR => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let r = fetch_r(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let value = ref_of(acc.take());
                    let obj = ts.active_mut().reg(r as isize);
                    debug_assert!(obj.is_object());
                    super::attr::setattr(ts, obj.as_obj(), name, Some(value.as_obj()))?;
                }
                Opcode::DELETE_ATTR => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let obj = ref_of(acc.take());
                    super::attr::setattr(ts, obj.as_obj(), name, None)?;
                }
                Opcode::LOAD_METHOD => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let a = fetch_r(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let obj = ref_of(acc.take());
                    let (callable, receiver) = super::attr::load_method(ts, obj.as_obj(), name)?;
                    let stack = ts.active_mut();
                    stack.store(a as isize - 1, Register::owned(callable.into_raw()));
                    match receiver {
                        Some(recv) => {
                            stack.store(a as isize, Register::owned(recv.into_raw()))
                        }
                        None => stack.clear(a as isize),
                    }
                }

                /* arithmetic */
                Opcode::BINARY_ADD
                | Opcode::BINARY_SUBTRACT
                | Opcode::BINARY_MULTIPLY
                | Opcode::BINARY_MATRIX_MULTIPLY
                | Opcode::BINARY_TRUE_DIVIDE
                | Opcode::BINARY_FLOOR_DIVIDE
                | Opcode::BINARY_MODULO
                | Opcode::BINARY_POWER
                | Opcode::BINARY_LSHIFT
                | Opcode::BINARY_RSHIFT
                | Opcode::BINARY_AND
                | Opcode::BINARY_OR
                | Opcode::BINARY_XOR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let rhs = ref_of(acc.take());
                    let lhs = ts.active_mut().reg(r as isize);
                    if !lhs.is_object() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    let result =
                        super::arith::binary_op(ts, binop_of(op), lhs.as_obj(), rhs.as_obj())?;
                    acc = Register::owned(result.into_raw());
                }
                Opcode::INPLACE_ADD
                | Opcode::INPLACE_SUBTRACT
                | Opcode::INPLACE_MULTIPLY
                | Opcode::INPLACE_MATRIX_MULTIPLY
                | Opcode::INPLACE_TRUE_DIVIDE
                | Opcode::INPLACE_FLOOR_DIVIDE
                | Opcode::INPLACE_MODULO
                | Opcode::INPLACE_POWER
                | Opcode::INPLACE_LSHIFT
                | Opcode::INPLACE_RSHIFT
                | Opcode::INPLACE_AND
                | Opcode::INPLACE_OR
                | Opcode::INPLACE_XOR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let rhs = ref_of(acc.take());
                    let lhs = ts.active_mut().reg(r as isize);
                    if !lhs.is_object() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    let result =
                        super::arith::inplace_op(ts, binop_of(op), lhs.as_obj(), rhs.as_obj())?;
                    acc = Register::owned(result.into_raw());
                }
                Opcode::UNARY_NEGATIVE | Opcode::UNARY_POSITIVE | Opcode::UNARY_INVERT => {
                    let operand = ref_of(acc.take());
                    let unop = match op {
                        Opcode::UNARY_NEGATIVE => UnOp::Neg,
                        Opcode::UNARY_POSITIVE => UnOp::Pos,
                        _ => UnOp::Invert,
                    };
                    let result = super::arith::unary_op(ts, unop, operand.as_obj())?;
                    acc = Register::owned(result.into_raw());
                }
                Opcode::UNARY_NOT => {
                    let operand = ref_of(acc.take());
                    let truth = super::arith::truth(ts, operand.as_obj())?;
                    drop(operand);
                    acc = Register::alias(if truth {
                        ts.rt().singletons.false_
                    } else {
                        ts.rt().singletons.true_
                    });
                }
                Opcode::UNARY_NOT_FAST => {
                    debug_assert!(acc.is_object());
                    let is_true = acc.as_obj() == ts.rt().singletons.true_;
                    rc::clear_register(acc.take());
                    acc = Register::alias(if is_true {
                        ts.rt().singletons.false_
                    } else {
                        ts.rt().singletons.true_
                    });
                }

                /* comparisons */
                Opcode::COMPARE_OP => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let sel = fetch_r(instrs, &mut pc, wide);
                    let Some(cmp) = CmpOp::from_operand(sel as u8) else {
                        return Err(ts.raise(ExcKind::SystemError, "bad COMPARE_OP operand"));
                    };
                    let rhs = ref_of(acc.take());
                    let lhs = ts.active_mut().reg(r as isize);
                    if !lhs.is_object() {
                        return Err(super::names::err_unbound(ts, code, r));
                    }
                    // Same tagged pointer short-circuits equality.
                    if lhs.as_obj() == rhs.as_obj() && matches!(cmp, CmpOp::Eq) {
                        acc = Register::alias(ts.rt().singletons.true_);
                    } else {
                        let result =
                            super::arith::rich_compare(ts, lhs.as_obj(), rhs.as_obj(), cmp)?;
                        acc = Register::owned(result.into_raw());
                    }
                }
                Opcode::IS_OP => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let invert = fetch_r(instrs, &mut pc, wide) != 0;
                    let rhs = ref_of(acc.take());
                    let lhs = ts.active_mut().reg(r as isize);
                    debug_assert!(lhs.is_object());
                    let same = lhs.as_obj() == rhs.as_obj();
                    drop(rhs);
                    acc = Register::alias(if same != invert {
                        ts.rt().singletons.true_
                    } else {
                        ts.rt().singletons.false_
                    });
                }
                Opcode::CONTAINS_OP => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let invert = fetch_r(instrs, &mut pc, wide) != 0;
                    let container = ref_of(acc.take());
                    let item = ts.active_mut().reg(r as isize);
                    debug_assert!(item.is_object());
                    let found = super::arith::contains(ts, container.as_obj(), item.as_obj())?;
                    drop(container);
                    acc = Register::alias(if found != invert {
                        ts.rt().singletons.true_
                    } else {
                        ts.rt().singletons.false_
                    });
                }

                /* sequences */
                Opcode::BUILD_LIST => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let n = fetch_r(instrs, &mut pc, wide);
                    let out = super::build::build_list(ts, base, n);
                    rc::clear_register(acc.take());
                    acc = Register::owned(out.into_raw());
                }
                Opcode::BUILD_TUPLE => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let n = fetch_r(instrs, &mut pc, wide);
                    let out = super::build::build_tuple(ts, base, n);
                    rc::clear_register(acc.take());
                    acc = Register::owned(out.into_raw());
                }
                Opcode::BUILD_SET => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let n = fetch_r(instrs, &mut pc, wide);
                    let out = super::build::build_set(ts, base, n)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(out.into_raw());
                }
                Opcode::BUILD_MAP => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let n = fetch_r(instrs, &mut pc, wide);
                    let out = super::build::build_map(ts, base, n)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(out.into_raw());
                }
                Opcode::BUILD_SLICE => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let out = super::build::build_slice(ts, base);
                    rc::clear_register(acc.take());
                    acc = Register::owned(out.into_raw());
                }
                Opcode::LIST_APPEND => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    crate::object::list::append(ts, target.as_obj(), value);
                }
                Opcode::LIST_EXTEND => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    crate::object::list::extend(ts, target.as_obj(), value.as_obj())?;
                }
                Opcode::SET_ADD => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    crate::object::set::add(ts, target.as_obj(), value.as_obj())?;
                }
                Opcode::SET_UPDATE => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    crate::object::set::update(ts, target.as_obj(), value.as_obj())?;
                }
                Opcode::DICT_UPDATE => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    if !value.as_obj().is_exact(ts.rt().types.dict) {
                        let name = value.as_obj().type_of().name().to_owned();
                        return Err(ts.raise(
                            ExcKind::TypeError,
                            format!("'{name}' object is not a mapping"),
                        ));
                    }
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    crate::dict::update(ts, target.as_obj(), value.as_obj())?;
                }
                Opcode::DICT_MERGE => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let target = ts.active_mut().reg(r as isize);
                    debug_assert!(target.is_object());
                    super::build::dict_merge(ts, target.as_obj(), value.as_obj())?;
                }
                Opcode::UNPACK => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let before = fetch_r(instrs, &mut pc, wide);
                    let after1 = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    super::build::unpack(ts, value.as_obj(), base, before, after1)?;
                }
                Opcode::BINARY_SUBSCR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let key = ref_of(acc.take());
                    let container = ts.active_mut().reg(r as isize);
                    debug_assert!(container.is_object());
                    let container = container.as_obj();
                    let Some(subscr) = container.type_of().slots.subscr else {
                        let name = container.type_of().name().to_owned();
                        return Err(ts.raise(
                            ExcKind::TypeError,
                            format!("'{name}' object is not subscriptable"),
                        ));
                    };
                    let result = subscr(ts, container, key.as_obj())?;
                    acc = Register::owned(result.into_raw());
                }
                Opcode::STORE_SUBSCR => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    let b = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let container = ts.active_mut().reg(a as isize);
                    let key = ts.active_mut().reg(b as isize);
                    debug_assert!(container.is_object() && key.is_object());
                    let container = container.as_obj();
                    let Some(set_subscr) = container.type_of().slots.set_subscr else {
                        let name = container.type_of().name().to_owned();
                        return Err(ts.raise(
                            ExcKind::TypeError,
                            format!("'{name}' object does not support item assignment"),
                        ));
                    };
                    set_subscr(ts, container, key.as_obj(), Some(value.as_obj()))?;
                }
                Opcode::DELETE_SUBSCR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let key = ref_of(acc.take());
                    let container = ts.active_mut().reg(r as isize);
                    debug_assert!(container.is_object());
                    let container = container.as_obj();
                    let Some(set_subscr) = container.type_of().slots.set_subscr else {
                        let name = container.type_of().name().to_owned();
                        return Err(ts.raise(
                            ExcKind::TypeError,
                            format!("'{name}' object does not support item deletion"),
                        ));
                    };
                    set_subscr(ts, container, key.as_obj(), None)?;
                }

                /* iteration */
                Opcode::GET_ITER | Opcode::GET_YIELD_FROM_ITER => {
                    let dst = fetch_r(instrs, &mut pc, wide);
                    let iterable = ref_of(acc.take());
                    let iterator = if matches!(op, Opcode::GET_ITER) {
                        super::iter::get_iter(ts, iterable.as_obj())?
                    } else {
                        super::iter::get_yield_from_iter(ts, iterable.as_obj())?
                    };
                    ts.active_mut()
                        .store(dst as isize, Register::owned(iterator.into_raw()));
                }
                Opcode::FOR_ITER => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    let iterator = ts.active_mut().reg(r as isize);
                    debug_assert!(iterator.is_object());
                    match super::iter::iter_next(ts, iterator.as_obj())? {
                        IterNext::Yield(value) => {
                            rc::clear_register(acc.take());
                            acc = Register::owned(value.into_raw());
                        }
                        IterNext::Done(_) => {
                            ts.active_mut().clear(r as isize);
                            pc = target;
                        }
                    }
                }
                Opcode::GET_AITER => {
                    let dst = fetch_r(instrs, &mut pc, wide);
                    let value = ref_of(acc.take());
                    let aiter = super::iter::get_aiter(ts, value.as_obj())?;
                    ts.active_mut()
                        .store(dst as isize, Register::owned(aiter.into_raw()));
                }
                Opcode::GET_ANEXT => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let aiter = ts.active_mut().reg(r as isize);
                    debug_assert!(aiter.is_object());
                    let awaitable = super::iter::get_anext(ts, aiter.as_obj())?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(awaitable.into_raw());
                }
                Opcode::END_ASYNC_FOR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let link = ts.active_mut().reg(r as isize);
                    if link.is_payload() && link.payload() == -1 {
                        let exc = ts.active_mut().reg(r as isize + 1);
                        debug_assert!(exc.is_object());
                        let exc_obj = exc.as_obj();
                        if ts.exception_matches(exc_obj, ExcKind::StopAsyncIteration) {
                            ts.active_mut().clear(r as isize);
                            ts.active_mut().clear(r as isize + 1);
                        } else {
                            let exc = ObjRef::new(exc_obj);
                            ts.active_mut().clear(r as isize);
                            ts.active_mut().clear(r as isize + 1);
                            return Err(ts.raise_obj(exc));
                        }
                    }
                }

                /* calls */
                Opcode::CALL_FUNCTION => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let nargs = fetch_r(instrs, &mut pc, wide);
                    rc::clear_register(acc.take());
                    match super::call::dispatch_call(ts, base, nargs as i64, pc)? {
                        Dispatched::Frame { code: callee_code, acc_word } => {
                            crate::trace::call_event(ts);
                            code = callee_code;
                            pc = 0;
                            acc = Register::from_payload(acc_word);
                        }
                        Dispatched::Inline(result) => {
                            acc = Register::owned(result.into_raw());
                        }
                    }
                }
                Opcode::CALL_METHOD => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    let nargs = fetch_r(instrs, &mut pc, wide);
                    rc::clear_register(acc.take());
                    let has_receiver = ts.active_mut().reg(base as isize).is_object();
                    let word = if has_receiver {
                        nargs as i64 + 1
                    } else {
                        // No receiver: slide the arguments down over the
                        // empty slot.
                        let stack = ts.active_mut();
                        for i in 0..nargs {
                            let v = stack.take((base + 1 + i) as isize);
                            stack.put((base + i) as isize, v);
                        }
                        nargs as i64
                    };
                    match super::call::dispatch_call(ts, base, word, pc)? {
                        Dispatched::Frame { code: callee_code, acc_word } => {
                            crate::trace::call_event(ts);
                            code = callee_code;
                            pc = 0;
                            acc = Register::from_payload(acc_word);
                        }
                        Dispatched::Inline(result) => {
                            acc = Register::owned(result.into_raw());
                        }
                    }
                }
                Opcode::CALL_FUNCTION_EX => {
                    let base = fetch_r(instrs, &mut pc, wide);
                    rc::clear_register(acc.take());
                    super::call::normalize_callargs(ts, base)?;
                    let mut word = ACC_FLAG_VARARGS;
                    if ts.active_mut().reg(base as isize + KWARGS_IDX).is_object() {
                        word |= ACC_FLAG_VARKEYWORDS;
                    }
                    match super::call::dispatch_call(ts, base, word, pc)? {
                        Dispatched::Frame { code: callee_code, acc_word } => {
                            crate::trace::call_event(ts);
                            code = callee_code;
                            pc = 0;
                            acc = Register::from_payload(acc_word);
                        }
                        Dispatched::Inline(result) => {
                            acc = Register::owned(result.into_raw());
                        }
                    }
                }
                Opcode::FUNC_HEADER => {
                    let framesize = fetch_d(instrs, &mut pc, wide);
                    debug_assert!(acc.is_payload());
                    let word = acc.payload();
                    super::call::setup_frame(ts, code, word, framesize)?;
                    acc = Register::EMPTY;
                }
                Opcode::CFUNC_HEADER | Opcode::FUNC_TPCALL_HEADER => {
                    debug_assert!(acc.is_payload());
                    let nargs = (acc.payload() & ACC_MASK_ARGS) as usize;
                    acc = Register::EMPTY;
                    let Some(callee) = ts.active_mut().callee() else {
                        return Err(ts.raise(ExcKind::SystemError, "header without a callee"));
                    };
                    let args: Vec<Obj> = (0..nargs)
                        .map(|i| {
                            let reg = unsafe { ts.active_ref() }.reg(i as isize);
                            debug_assert!(reg.is_object());
                            reg.as_obj()
                        })
                        .collect();
                    let Some(call_slot) = callee.type_of().slots.call else {
                        let name = callee.type_of().name().to_owned();
                        return Err(ts.raise(
                            ExcKind::TypeError,
                            format!("'{name}' object is not callable"),
                        ));
                    };
                    let result = call_slot(ts, callee, &args)?;
                    match pop_and_resume(ts, &mut code, &mut pc, result)? {
                        Some(value) => return Ok(Step::Return(value)),
                        None => {}
                    }
                }
                Opcode::METHOD_HEADER => {
                    debug_assert!(acc.is_payload());
                    let word = acc.payload();
                    let Some(callee) = ts.active_mut().callee() else {
                        return Err(ts.raise(ExcKind::SystemError, "header without a callee"));
                    };
                    if !callee.is_exact(ts.rt().types.method) {
                        return Err(ts.raise(ExcKind::SystemError, "METHOD_HEADER without a method"));
                    }
                    let receiver = ObjRef::new(func::method_receiver(callee));
                    let function = ObjRef::new(func::method_func(callee));
                    if !function.as_obj().is_exact(ts.rt().types.function) {
                        return Err(ts.raise(
                            ExcKind::SystemError,
                            "METHOD_HEADER over a non-interpreted callable",
                        ));
                    }
                    let unbound_code = func::code_of(function.as_obj());
                    let nargs = (word & ACC_MASK_ARGS) as usize;
                    let stack = ts.active_mut();
                    let mut i = nargs;
                    while i > 0 {
                        let v = stack.take(i as isize - 1);
                        stack.put(i as isize, v);
                        i -= 1;
                    }
                    stack.put(0, Register::owned(receiver.into_raw()));
                    stack.store(FRAME_CALLEE, Register::owned(function.into_raw()));
                    acc = Register::from_payload(word + 1);
                    code = unbound_code;
                    pc = 0;
                }
                Opcode::COROGEN_HEADER => {
                    let framesize = fetch_d(instrs, &mut pc, wide);
                    debug_assert!(acc.is_payload());
                    let word = acc.payload();
                    super::call::setup_frame(ts, code, word, framesize)?;
                    acc = Register::EMPTY;
                    let gen = crate::generator::materialize(ts, code, framesize, pc)?;
                    match pop_and_resume_moved(ts, &mut code, &mut pc, gen)? {
                        Some(value) => return Ok(Step::Return(value)),
                        None => {}
                    }
                }
                Opcode::MAKE_FUNCTION => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let code_const = crate::code::consts(code)[idx].as_obj();
                    let creator = current_function(ts);
                    let function = super::call::make_function(ts, creator, code_const)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(function.into_raw());
                }

                /* control flow */
                Opcode::RETURN_VALUE => {
                    ts.check_breaker()?;
                    crate::trace::return_event(ts, current_function(ts), insn_pc);
                    let value = ref_of(acc.take());
                    match pop_and_resume(ts, &mut code, &mut pc, value)? {
                        Some(value) => return Ok(Step::Return(value)),
                        None => {}
                    }
                }
                Opcode::YIELD_VALUE => {
                    ts.check_breaker()?;
                    let value = ref_of(acc.take());
                    let value = crate::generator::wrap_async_yield(ts, value);
                    crate::generator::suspend(ts, pc);
                    return Ok(Step::Return(value));
                }
                Opcode::YIELD_FROM => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let sub = ts.active_mut().reg(r as isize);
                    debug_assert!(sub.is_object());
                    let sent = if acc.is_object() {
                        Some(ref_of(acc.take()))
                    } else {
                        rc::clear_register(acc.take());
                        None
                    };
                    match crate::generator::delegate(ts, sub.as_obj(), sent)? {
                        crate::generator::Delegate::Yielded(value) => {
                            // Stay on this instruction: the next resume
                            // re-enters the delegation.
                            crate::generator::suspend(ts, insn_pc);
                            return Ok(Step::Return(value));
                        }
                        crate::generator::Delegate::Done(value) => {
                            ts.active_mut().clear(r as isize);
                            acc = Register::owned(value.into_raw());
                        }
                    }
                }
                Opcode::RAISE => {
                    let value = if acc.is_object() {
                        Some(ref_of(acc.take()))
                    } else {
                        rc::clear_register(acc.take());
                        None
                    };
                    return Err(super::flow::raise_op(ts, value));
                }
                Opcode::JUMP_IF_NOT_EXC_MATCH => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    let pattern = ref_of(acc.take());
                    let matched = super::flow::exc_match(ts, r, pattern.as_obj())?;
                    if !matched {
                        pc = target;
                    }
                }
                Opcode::END_EXCEPT => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    ts.active_mut().clear(r as isize);
                    ts.active_mut().clear(r as isize + 1);
                }
                Opcode::CALL_FINALLY => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let target = decode_jump(ts, code, instrs, &mut pc, wide)?;
                    ts.active_mut()
                        .store(r as isize, Register::from_payload(pc as i64));
                    pc = target;
                }
                Opcode::END_FINALLY => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let link = ts.active_mut().take(r as isize);
                    if link.is_payload() {
                        match link.payload() {
                            0 => {}
                            -1 => {
                                let exc_reg = ts.active_mut().take(r as isize + 1);
                                debug_assert!(exc_reg.is_object());
                                let exc = ref_of(exc_reg);
                                return Err(ts.raise_obj(exc));
                            }
                            resume => {
                                debug_assert!(resume > 0);
                                pc = resume as usize;
                            }
                        }
                    } else {
                        rc::clear_register(link);
                    }
                }
                Opcode::SETUP_WITH | Opcode::SETUP_ASYNC_WITH => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    let manager = ref_of(acc.take());
                    let is_async = matches!(op, Opcode::SETUP_ASYNC_WITH);
                    let entered = super::flow::setup_with(ts, a, manager, is_async)?;
                    acc = Register::owned(entered.into_raw());
                }
                Opcode::END_WITH => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    match super::flow::end_with(ts, a)? {
                        EndWith::Proceed => {}
                        EndWith::Reraise(raised) => return Err(raised),
                    }
                }
                Opcode::END_ASYNC_WITH => {
                    let a = fetch_r(instrs, &mut pc, wide);
                    match crate::generator::end_async_with(ts, a)? {
                        EndWith::Proceed => {}
                        EndWith::Reraise(raised) => return Err(raised),
                    }
                }
                Opcode::IMPORT_NAME => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    let name_str = crate::object::string::as_str(name).to_owned();
                    let rt = ts.runtime();
                    let module = rt.import_module(ts, &name_str)?;
                    rc::clear_register(acc.take());
                    acc = Register::owned(module.into_raw());
                }
                Opcode::IMPORT_FROM => {
                    let idx = fetch_d(instrs, &mut pc, wide);
                    let name = crate::code::names(code)[idx].as_obj();
                    debug_assert!(acc.is_object());
                    let module = ref_of(acc.take());
                    match super::attr::getattr(ts, module.as_obj(), name) {
                        Ok(value) => acc = Register::owned(value.into_raw()),
                        Err(_) => {
                            let _ = ts.take_exc();
                            let n = crate::object::string::as_str(name).to_owned();
                            return Err(ts.raise(
                                ExcKind::ImportError,
                                format!("cannot import name '{n}'"),
                            ));
                        }
                    }
                }
                Opcode::IMPORT_STAR => {
                    let r = fetch_r(instrs, &mut pc, wide);
                    let module = ts.active_mut().reg(r as isize);
                    debug_assert!(module.is_object());
                    let function = current_function(ts);
                    let globals = func::globals_of(function);
                    let source = crate::object::module::dict_of(module.as_obj());
                    for (key, value) in crate::dict::items_ordered(ts, source) {
                        let skip = key.as_obj().is_exact(ts.rt().types.str_)
                            && crate::object::string::as_str(key.as_obj()).starts_with('_');
                        if !skip {
                            crate::dict::set(ts, globals, key.as_obj(), value.as_obj())?;
                        }
                    }
                }
                Opcode::GET_AWAITABLE => {
                    let value = ref_of(acc.take());
                    let awaitable = super::iter::get_awaitable(ts, value.as_obj())?;
                    acc = Register::owned(awaitable.into_raw());
                }
                Opcode::LOAD_BUILD_CLASS => {
                    let rt = ts.runtime();
                    let key = ts.intern("__build_class__");
                    match crate::dict::get(ts, rt.builtins_dict(), key)? {
                        Some(value) => {
                            rc::clear_register(acc.take());
                            acc = Register::owned(value.into_raw());
                        }
                        None => {
                            return Err(
                                ts.raise(ExcKind::NameError, "__build_class__ not found")
                            )
                        }
                    }
                }
                Opcode::LOAD_INTRINSIC => {
                    let id = fetch_r(instrs, &mut pc, wide);
                    rc::clear_register(acc.take());
                    acc = Register::from_payload(id as i64);
                }
                Opcode::CALL_INTRINSIC_1 => {
                    let id = fetch_r(instrs, &mut pc, wide);
                    let arg = ref_of(acc.take());
                    let rt = ts.runtime();
                    let Some(crate::runtime::Intrinsic::Unary(f)) = rt.intrinsics.get(id) else {
                        return Err(
                            ts.raise(ExcKind::SystemError, format!("bad intrinsic id {id}"))
                        );
                    };
                    let result = f(ts, arg.as_obj())?;
                    acc = Register::owned(result.into_raw());
                }
                Opcode::CALL_INTRINSIC_N => {
                    let id = fetch_r(instrs, &mut pc, wide);
                    let base = fetch_r(instrs, &mut pc, wide);
                    let n = fetch_r(instrs, &mut pc, wide);
                    rc::clear_register(acc.take());
                    let rt = ts.runtime();
                    let Some(crate::runtime::Intrinsic::Vararg(f)) = rt.intrinsics.get(id) else {
                        return Err(
                            ts.raise(ExcKind::SystemError, format!("bad intrinsic id {id}"))
                        );
                    };
                    let args: Vec<Obj> = (0..n)
                        .map(|i| {
                            let reg = unsafe { ts.active_ref() }.reg((base + i) as isize);
                            debug_assert!(reg.is_object());
                            reg.as_obj()
                        })
                        .collect();
                    let result = f(ts, &args)?;
                    for i in 0..n {
                        ts.active_mut().clear((base + i) as isize);
                    }
                    acc = Register::owned(result.into_raw());
                }
            }
            Ok(Step::Next)
        })();

        match step {
            Ok(Step::Next) => {}
            Ok(Step::Return(value)) => return Ok(value),
            Err(raised) => match handle_raise(ts, &mut acc, raised, insn_pc) {
                Some((new_pc, new_code)) => {
                    pc = new_pc;
                    code = new_code;
                }
                None => return Err(crate::error::raised()),
            },
        }
    }
}

/// Route a raise through the unwinder. Returns the handler position to
/// continue at, or `None` when the exception leaves this evaluator.
fn handle_raise(
    ts: &mut ThreadState,
    acc: &mut Register,
    raised: Raised,
    insn_pc: usize,
) -> Option<(usize, Obj)> {
    let _ = raised;
    rc::clear_register(acc.take());
    ts.active_mut().pc = insn_pc;
    match super::unwind::unwind(ts, insn_pc) {
        Unwound::Handler { pc, code } => Some((pc, code)),
        Unwound::Native(_) | Unwound::Generator(_) => None,
    }
}

/// Shared return path: pop the frame, interpret the link, and either
/// resume the caller (updating `code`/`pc`) or hand the value out of
/// the evaluator.
fn pop_and_resume(
    ts: &mut ThreadState,
    code: &mut Obj,
    pc: &mut usize,
    value: ObjRef,
) -> ExecResult<Option<ObjRef>> {
    let framesize = crate::code::signature(*code).framesize as usize;
    let link = ts.active_mut().pop_frame(framesize);
    resume_link(ts, code, pc, value, link)
}

/// Return path for `COROGEN_HEADER`, whose frame registers were moved
/// into the generator rather than cleared.
fn pop_and_resume_moved(
    ts: &mut ThreadState,
    code: &mut Obj,
    pc: &mut usize,
    value: ObjRef,
) -> ExecResult<Option<ObjRef>> {
    let stack = ts.active_mut();
    let delta = stack.take(FRAME_DELTA).payload();
    let link = stack.take(FRAME_LINK).payload();
    stack.clear(FRAME_OBJ);
    debug_assert!(delta >= 0 && (delta as usize) <= stack.base);
    stack.base -= delta as usize;
    resume_link(ts, code, pc, value, link)
}

fn resume_link(
    ts: &mut ThreadState,
    code: &mut Obj,
    pc: &mut usize,
    value: ObjRef,
    link: i64,
) -> ExecResult<Option<ObjRef>> {
    match link {
        FRAME_C => Ok(Some(value)),
        FRAME_GENERATOR => {
            crate::generator::finish_return(ts);
            Ok(Some(value))
        }
        resume => {
            debug_assert!(resume >= 0);
            *pc = resume as usize;
            *code = func::code_of(current_function(ts));
            ts.active_mut().pc = *pc;
            Ok(None)
        }
    }
}

/// Truth test with the singleton fast path.
fn quick_truth(ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    super::arith::truth(ts, obj)
}

fn decode_jump(
    ts: &mut ThreadState,
    code: Obj,
    instrs: &[u8],
    pc: &mut usize,
    wide: bool,
) -> ExecResult<usize> {
    match fetch_jump(instrs, pc, wide) {
        Some(offset) => {
            let target = *pc as i64 + offset;
            debug_assert!(target >= 0 && (target as usize) <= instrs.len());
            Ok(target as usize)
        }
        None => match crate::code::jump_side_target(code, *pc) {
            Some(target) => Ok(target),
            None => Err(ts.raise(ExcKind::SystemError, "jump outside the side table")),
        },
    }
}

fn binop_of(op: Opcode) -> BinOp {
    match op {
        Opcode::BINARY_ADD | Opcode::INPLACE_ADD => BinOp::Add,
        Opcode::BINARY_SUBTRACT | Opcode::INPLACE_SUBTRACT => BinOp::Sub,
        Opcode::BINARY_MULTIPLY | Opcode::INPLACE_MULTIPLY => BinOp::Mul,
        Opcode::BINARY_MATRIX_MULTIPLY | Opcode::INPLACE_MATRIX_MULTIPLY => BinOp::MatMul,
        Opcode::BINARY_TRUE_DIVIDE | Opcode::INPLACE_TRUE_DIVIDE => BinOp::TrueDiv,
        Opcode::BINARY_FLOOR_DIVIDE | Opcode::INPLACE_FLOOR_DIVIDE => BinOp::FloorDiv,
        Opcode::BINARY_MODULO | Opcode::INPLACE_MODULO => BinOp::Rem,
        Opcode::BINARY_POWER | Opcode::INPLACE_POWER => BinOp::Pow,
        Opcode::BINARY_LSHIFT | Opcode::INPLACE_LSHIFT => BinOp::Shl,
        Opcode::BINARY_RSHIFT | Opcode::INPLACE_RSHIFT => BinOp::Shr,
        Opcode::BINARY_AND | Opcode::INPLACE_AND => BinOp::And,
        Opcode::BINARY_OR | Opcode::INPLACE_OR => BinOp::Or,
        Opcode::BINARY_XOR | Opcode::INPLACE_XOR => BinOp::Xor,
        _ => unreachable!("not a binary opcode"),
    }
}
