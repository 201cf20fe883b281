//! Exception handling scenarios: table selection, link registers,
//! chaining, finally and with blocks.

mod common;

use common::Vm;
use quill_vm::prelude::*;

/// try: raise ValueError("a")
/// except ValueError as e: return e.args
fn make_catcher(vm: &mut Vm) -> ObjRef {
    let globals = vm.globals();
    vm.function(
        globals.as_obj(),
        "catcher",
        CodeFlags::empty(),
        0,
        12,
        &[],
        |b, ts| {
            let body = b.label();
            let handler = b.label();
            let handler_end = b.label();
            let reraise = b.label();
            b.bind(body);
            // raise ValueError("a")
            let ve = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::ValueError)));
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op_r(Opcode::STORE_FAST, 7);
            let a = b.const_str(ts, "a");
            b.op_u16(Opcode::LOAD_CONST, a);
            b.op_r(Opcode::STORE_FAST, 8);
            b.op_rr(Opcode::CALL_FUNCTION, 8, 1);
            b.op(Opcode::RAISE);
            b.bind(handler);
            // link pair in r2/r3
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op_rj(Opcode::JUMP_IF_NOT_EXC_MATCH, 2, reraise);
            b.op_r(Opcode::LOAD_FAST, 3);
            let args = b.name(ts, "args");
            b.op_u16(Opcode::LOAD_ATTR, args);
            b.op_r(Opcode::STORE_FAST, 4);
            b.op_r(Opcode::END_EXCEPT, 2);
            b.op_r(Opcode::LOAD_FAST, 4);
            b.op(Opcode::RETURN_VALUE);
            b.bind(reraise);
            b.op(Opcode::RAISE);
            b.bind(handler_end);
            b.handler(body, handler, handler_end, 2);
        },
    )
}

#[test]
fn try_except_catches_and_exposes_args() {
    let mut vm = Vm::new();
    let catcher = make_catcher(&mut vm);
    let result = vm.ts.call(catcher.as_obj(), &[]).expect("handled");
    // e.args == ("a",)
    assert!(result.as_obj().is_exact(vm.rt.types().tuple));
    let items = tuple::items(result.as_obj());
    assert_eq!(items.len(), 1);
    assert_eq!(string::as_str(items[0].as_obj()), "a");
}

#[test]
fn unmatched_exception_propagates_with_traceback() {
    // raise KeyError inside, match against ValueError -> re-raise.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "throws_key_error",
        CodeFlags::empty(),
        0,
        12,
        &[],
        |b, ts| {
            b.line(10);
            let ke = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::KeyError)));
            b.op_u16(Opcode::LOAD_CONST, ke);
            b.op(Opcode::RAISE);
        },
    );
    match vm.ts.call(func.as_obj(), &[]) {
        Err(VmError::Uncaught {
            kind, traceback, ..
        }) => {
            assert_eq!(kind, ExcKind::KeyError);
            assert_eq!(traceback.len(), 1);
            assert_eq!(traceback[0].qualname, "throws_key_error");
            assert_eq!(traceback[0].filename, "<test>");
            assert_eq!(traceback[0].line, 10);
        }
        other => panic!("expected KeyError, got {other:?}"),
    }
}

#[test]
fn nested_frames_accumulate_traceback() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let inner = vm.function(
        globals.as_obj(),
        "inner",
        CodeFlags::empty(),
        0,
        8,
        &[],
        |b, ts| {
            b.line(3);
            let re = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::RuntimeError)));
            b.op_u16(Opcode::LOAD_CONST, re);
            b.op(Opcode::RAISE);
        },
    );
    vm.define_global(globals.as_obj(), "inner", inner.as_obj());
    let outer = vm.function(
        globals.as_obj(),
        "outer",
        CodeFlags::empty(),
        0,
        10,
        &[],
        |b, ts| {
            b.line(8);
            let name = b.name(ts, "inner");
            let site = b.cache_site();
            b.op_dr(Opcode::LOAD_GLOBAL, name, site);
            b.op_r(Opcode::STORE_FAST, 5);
            b.op_rr(Opcode::CALL_FUNCTION, 6, 0);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    match vm.ts.call(outer.as_obj(), &[]) {
        Err(VmError::Uncaught {
            kind, traceback, ..
        }) => {
            assert_eq!(kind, ExcKind::RuntimeError);
            let names: Vec<&str> = traceback.iter().map(|t| t.qualname.as_str()).collect();
            assert_eq!(names, vec!["inner", "outer"]);
        }
        other => panic!("expected RuntimeError, got {other:?}"),
    }
}

#[test]
fn raising_while_handling_chains_context() {
    // try: raise ValueError
    // except ValueError: raise KeyError   -> KeyError.__context__ is the ValueError
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "chainer",
        CodeFlags::empty(),
        0,
        12,
        &[],
        |b, ts| {
            let body = b.label();
            let handler = b.label();
            let handler_end = b.label();
            b.bind(body);
            let ve = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::ValueError)));
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op(Opcode::RAISE);
            b.bind(handler);
            let ke = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::KeyError)));
            b.op_u16(Opcode::LOAD_CONST, ke);
            b.op(Opcode::RAISE);
            b.bind(handler_end);
            b.handler(body, handler, handler_end, 2);
        },
    );
    let err = vm.ts.call(func.as_obj(), &[]);
    match err {
        Err(VmError::Uncaught { kind, .. }) => assert_eq!(kind, ExcKind::KeyError),
        other => panic!("expected KeyError, got {other:?}"),
    }
}

#[test]
fn finally_runs_on_both_paths() {
    // count = 0 (r1); CALL_FINALLY to the finally block, which adds 10;
    // END_FINALLY resumes; return count.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "with_finally",
        CodeFlags::empty(),
        0,
        8,
        &[],
        |b, ts| {
            let finally = b.label();
            let zero = b.const_int(ts, 0);
            let ten = b.const_int(ts, 10);
            b.op_u16(Opcode::LOAD_CONST, zero);
            b.op_r(Opcode::STORE_FAST, 1);
            b.op_rj(Opcode::CALL_FINALLY, 2, finally);
            // resumed here after END_FINALLY
            b.op_r(Opcode::LOAD_FAST, 1);
            b.op(Opcode::RETURN_VALUE);
            b.bind(finally);
            b.op_u16(Opcode::LOAD_CONST, ten);
            b.op_r(Opcode::BINARY_ADD, 1);
            b.op_r(Opcode::STORE_FAST, 1);
            b.op_r(Opcode::END_FINALLY, 2);
        },
    );
    assert_eq!(vm.call_int(func.as_obj(), &[]), 10);
}

#[test]
fn with_block_suppresses_when_exit_returns_true() {
    // class Suppress: __exit__ returns True. The body raises; code after
    // the with block must still run.
    let mut vm = Vm::new();
    let globals = vm.globals();

    // Build the manager class: namespace with __enter__/__exit__.
    let namespace = quill_vm::dict::new(&mut vm.ts);
    let enter = vm.function(
        globals.as_obj(),
        "Suppress.__enter__",
        CodeFlags::empty(),
        1,
        4,
        &["self"],
        |b, ts| {
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let exit = vm.function(
        globals.as_obj(),
        "Suppress.__exit__",
        CodeFlags::empty(),
        4,
        8,
        &["self", "exc_type", "exc", "tb"],
        |b, ts| {
            let t = b.const_obj(vm_true(ts));
            b.op_u16(Opcode::LOAD_CONST, t);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let enter_key = vm.ts.intern("__enter__");
    quill_vm::dict::set(&mut vm.ts, namespace.as_obj(), enter_key, enter.as_obj()).unwrap();
    let exit_key = vm.ts.intern("__exit__");
    quill_vm::dict::set(&mut vm.ts, namespace.as_obj(), exit_key, exit.as_obj()).unwrap();
    let suppress_cls = vm
        .ts
        .new_class("Suppress", &[], namespace.as_obj())
        .expect("class");

    // def run(mgr_cls):
    //     with mgr_cls():            # slots r1..r4
    //         raise ValueError("boom")
    //     return 7
    let func = vm.function(
        globals.as_obj(),
        "run",
        CodeFlags::empty(),
        1,
        16,
        &["cls"],
        |b, ts| {
            let body = b.label();
            let with_exit = b.label();
            let handler_end = b.label();
            // instantiate the manager: call cls() at base 8
            b.op_rr(Opcode::MOVE, 7, 0);
            b.op_rr(Opcode::CALL_FUNCTION, 8, 0);
            b.op_r(Opcode::SETUP_WITH, 1);
            b.op(Opcode::CLEAR_ACC);
            b.bind(body);
            let ve = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::ValueError)));
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op(Opcode::RAISE);
            // exception path lands at with_exit with the link pair in
            // r3/r4 (SETUP_WITH used base 1: mgr r1, __exit__ r2).
            b.bind(with_exit);
            b.op_r(Opcode::END_WITH, 1);
            let seven = b.const_int(ts, 7);
            b.op_u16(Opcode::LOAD_CONST, seven);
            b.op(Opcode::RETURN_VALUE);
            b.bind(handler_end);
            b.handler(body, with_exit, handler_end, 3);
        },
    );
    let result = vm
        .ts
        .call(func.as_obj(), &[suppress_cls])
        .expect("suppressed");
    assert_eq!(number::int_value(result.as_obj()), 7);
}

fn vm_true(ts: &mut ThreadState) -> ObjRef {
    ts.bool_ref(true)
}

#[test]
fn innermost_handler_wins() {
    // Two nested protected ranges over the same raise; the inner entry
    // (listed first) must be selected.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "nested",
        CodeFlags::empty(),
        0,
        12,
        &[],
        |b, ts| {
            let body = b.label();
            let inner_handler = b.label();
            let inner_end = b.label();
            let outer_handler = b.label();
            let outer_end = b.label();
            b.bind(body);
            let ve = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::ValueError)));
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op(Opcode::RAISE);
            b.bind(inner_handler);
            b.op_r(Opcode::END_EXCEPT, 4);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
            b.bind(inner_end);
            b.bind(outer_handler);
            b.op_r(Opcode::END_EXCEPT, 2);
            let two = b.const_int(ts, 2);
            b.op_u16(Opcode::LOAD_CONST, two);
            b.op(Opcode::RETURN_VALUE);
            b.bind(outer_end);
            // innermost first
            b.handler(body, inner_handler, inner_end, 4);
            b.handler(body, outer_handler, outer_end, 2);
        },
    );
    assert_eq!(vm.call_int(func.as_obj(), &[]), 1);
}
