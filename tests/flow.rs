//! Call/return, arithmetic and branching scenarios.

mod common;

use common::Vm;
use quill_vm::object::CmpOp;
use quill_vm::prelude::*;

/// `fib(n) = fib(n-1) + fib(n-2)`, assembled by hand.
///
/// Register plan: r0 = n, r1 = fib(n-1); calls use base 6 (callee in
/// r5, argument in r6, reserved slots r2..r5).
fn make_fib(vm: &mut Vm) -> (ObjRef, ObjRef) {
    let globals = vm.globals();
    let fib = vm.function(
        globals.as_obj(),
        "fib",
        CodeFlags::empty(),
        1,
        10,
        &["n"],
        |b, ts| {
            let recurse = b.label();
            // if n < 2: return n
            let two = b.const_int(ts, 2);
            b.op_u16(Opcode::LOAD_CONST, two);
            b.op_rr(Opcode::COMPARE_OP, 0, CmpOp::Lt as u8);
            b.jump(Opcode::POP_JUMP_IF_FALSE, recurse);
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op(Opcode::RETURN_VALUE);

            b.bind(recurse);
            // r1 = fib(n - 1)
            let name = b.name(ts, "fib");
            let site0 = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site0);
            b.op_r(Opcode::STORE_FAST, 5);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op_r(Opcode::BINARY_SUBTRACT, 0);
            b.op_r(Opcode::STORE_FAST, 6);
            b.op_rr(Opcode::CALL_FUNCTION, 6, 1);
            b.op_r(Opcode::STORE_FAST, 1);
            // acc = fib(n - 2)
            let site1 = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site1);
            b.op_r(Opcode::STORE_FAST, 5);
            b.op_u16(Opcode::LOAD_CONST, two);
            b.op_r(Opcode::BINARY_SUBTRACT, 0);
            b.op_r(Opcode::STORE_FAST, 6);
            b.op_rr(Opcode::CALL_FUNCTION, 6, 1);
            // return r1 + acc
            b.op_r(Opcode::BINARY_ADD, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    vm.define_global(globals.as_obj(), "fib", fib.as_obj());
    (fib, globals)
}

#[test]
fn fib_recursion() {
    let mut vm = Vm::new();
    let (fib, _globals) = make_fib(&mut vm);
    let ten = vm.int(10);
    assert_eq!(vm.call_int(fib.as_obj(), &[ten.as_obj()]), 55);
    let twenty = vm.int(20);
    assert_eq!(vm.call_int(fib.as_obj(), &[twenty.as_obj()]), 6765);
}

#[test]
fn fib_base_cases() {
    let mut vm = Vm::new();
    let (fib, _globals) = make_fib(&mut vm);
    for (n, expected) in [(0, 0), (1, 1), (2, 1), (3, 2), (7, 13)] {
        let arg = vm.int(n);
        assert_eq!(vm.call_int(fib.as_obj(), &[arg.as_obj()]), expected);
    }
}

#[test]
fn backward_jump_loop() {
    // total = 0; i = n; while i: total += i; i -= 1; return total
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "triangle",
        CodeFlags::empty(),
        1,
        6,
        &["n", "total"],
        |b, ts| {
            let zero = b.const_int(ts, 0);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, zero);
            b.op_r(Opcode::STORE_FAST, 1);
            let top = b.label();
            let done = b.label();
            b.bind(top);
            b.op_r(Opcode::LOAD_FAST, 0);
            b.jump(Opcode::POP_JUMP_IF_FALSE, done);
            // total += i
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op_r(Opcode::BINARY_ADD, 1);
            b.op_r(Opcode::STORE_FAST, 1);
            // i -= 1
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op_r(Opcode::BINARY_SUBTRACT, 0);
            b.op_r(Opcode::STORE_FAST, 0);
            b.jump(Opcode::JUMP, top);
            b.bind(done);
            b.op_r(Opcode::LOAD_FAST, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let n = vm.int(100);
    assert_eq!(vm.call_int(func.as_obj(), &[n.as_obj()]), 5050);
}

#[test]
fn unary_and_compare_ops() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    // return -(a * b)
    let func = vm.function(
        globals.as_obj(),
        "negprod",
        CodeFlags::empty(),
        2,
        4,
        &["a", "b"],
        |b, _ts| {
            b.op_r(Opcode::LOAD_FAST, 1);
            b.op_r(Opcode::BINARY_MULTIPLY, 0);
            b.op(Opcode::UNARY_NEGATIVE);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let a = vm.int(6);
    let b = vm.int(7);
    assert_eq!(vm.call_int(func.as_obj(), &[a.as_obj(), b.as_obj()]), -42);
}

#[test]
fn global_cache_sees_rebinding() {
    // return x, through the inline cache; rebinding x must invalidate.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "readx",
        CodeFlags::empty(),
        0,
        2,
        &[],
        |b, ts| {
            let name = b.name(ts, "x");
            let site = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let one = vm.int(1);
    vm.define_global(globals.as_obj(), "x", one.as_obj());
    assert_eq!(vm.call_int(func.as_obj(), &[]), 1);
    // Warm cache: a second read must still be correct.
    assert_eq!(vm.call_int(func.as_obj(), &[]), 1);
    let two = vm.int(2);
    vm.define_global(globals.as_obj(), "x", two.as_obj());
    assert_eq!(vm.call_int(func.as_obj(), &[]), 2);
    // Force a resize of the globals block and re-validate.
    for i in 0..64 {
        let v = vm.int(i);
        vm.define_global(globals.as_obj(), &format!("pad{i}"), v.as_obj());
    }
    assert_eq!(vm.call_int(func.as_obj(), &[]), 2);
}

#[test]
fn missing_global_is_name_error() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "readmissing",
        CodeFlags::empty(),
        0,
        2,
        &[],
        |b, ts| {
            let name = b.name(ts, "nope");
            let site = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    match vm.ts.call(func.as_obj(), &[]) {
        Err(VmError::Uncaught { kind, message, .. }) => {
            assert_eq!(kind, ExcKind::NameError);
            assert!(message.contains("nope"), "message: {message}");
        }
        other => panic!("expected NameError, got {other:?}"),
    }
}

#[test]
fn builtins_resolve_through_global_load() {
    // sum(xs) where sum comes from builtins, not globals.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "sumlist",
        CodeFlags::empty(),
        1,
        9,
        &["xs"],
        |b, ts| {
            let name = b.name(ts, "sum");
            let site = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site);
            b.op_r(Opcode::STORE_FAST, 5);
            b.op_rr(Opcode::MOVE, 6, 0);
            b.op_rr(Opcode::CALL_FUNCTION, 6, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let items = vec![vm.int(1), vm.int(2), vm.int(39)];
    let xs = list::new(&mut vm.ts, items);
    assert_eq!(vm.call_int(func.as_obj(), &[xs.as_obj()]), 42);
}

#[test]
fn too_few_arguments_is_type_error() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "needs2",
        CodeFlags::empty(),
        2,
        4,
        &["a", "b"],
        |b, _ts| {
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let one = vm.int(1);
    match vm.ts.call(func.as_obj(), &[one.as_obj()]) {
        Err(VmError::Uncaught { kind, message, .. }) => {
            assert_eq!(kind, ExcKind::TypeError);
            assert!(message.contains("b"), "message: {message}");
        }
        other => panic!("expected TypeError, got {other:?}"),
    }
}
