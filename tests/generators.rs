//! Generator and delegation scenarios.

mod common;

use common::Vm;
use quill_vm::generator::status_of;
use quill_vm::prelude::*;

/// `def g(): yield 1; yield 2; yield 3`
fn make_counter(vm: &mut Vm) -> ObjRef {
    let globals = vm.globals();
    vm.function(
        globals.as_obj(),
        "g",
        CodeFlags::GENERATOR,
        0,
        4,
        &[],
        |b, ts| {
            for v in 1..=3 {
                let c = b.const_int(ts, v);
                b.op_u16(Opcode::LOAD_CONST, c);
                b.op(Opcode::YIELD_VALUE);
            }
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
        },
    )
}

#[test]
fn generator_sum() {
    let mut vm = Vm::new();
    let g = make_counter(&mut vm);
    let gen = vm.ts.call(g.as_obj(), &[]).expect("creating the generator");
    assert_eq!(status_of(gen.as_obj()), GenStatus::Created);
    let sum = vm.builtin("sum");
    let result = vm.ts.call(sum.as_obj(), &[gen.as_obj()]).expect("sum");
    assert_eq!(number::int_value(result.as_obj()), 6);
    assert_eq!(status_of(gen.as_obj()), GenStatus::Closed);
}

#[test]
fn generator_yields_in_order() {
    let mut vm = Vm::new();
    let g = make_counter(&mut vm);
    let gen = vm.ts.call(g.as_obj(), &[]).expect("creating the generator");
    for expected in 1..=3 {
        match gen_send(&mut vm.ts, gen.as_obj(), None).expect("resume") {
            SendResult::Yield(v) => assert_eq!(number::int_value(v.as_obj()), expected),
            SendResult::Return(_) => panic!("finished early"),
        }
        assert_eq!(status_of(gen.as_obj()), GenStatus::Suspended);
    }
    match gen_send(&mut vm.ts, gen.as_obj(), None).expect("finish") {
        SendResult::Return(v) => assert_eq!(v.as_obj(), vm.ts.none()),
        SendResult::Yield(_) => panic!("extra yield"),
    }
    assert_eq!(status_of(gen.as_obj()), GenStatus::Closed);
}

#[test]
fn send_value_resumes_into_accumulator() {
    // def echo(): got = yield 1; return got
    let mut vm = Vm::new();
    let globals = vm.globals();
    let echo = vm.function(
        globals.as_obj(),
        "echo",
        CodeFlags::GENERATOR,
        0,
        4,
        &[],
        |b, ts| {
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::YIELD_VALUE);
            // the sent value is in the accumulator
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let gen = vm.ts.call(echo.as_obj(), &[]).expect("create");
    match gen_send(&mut vm.ts, gen.as_obj(), None).expect("first resume") {
        SendResult::Yield(v) => assert_eq!(number::int_value(v.as_obj()), 1),
        SendResult::Return(_) => panic!("finished early"),
    }
    let sent = vm.int(42);
    match gen_send(&mut vm.ts, gen.as_obj(), Some(sent.as_obj())).expect("second resume") {
        SendResult::Return(v) => assert_eq!(number::int_value(v.as_obj()), 42),
        SendResult::Yield(_) => panic!("unexpected yield"),
    }
}

#[test]
fn send_into_fresh_generator_requires_none() {
    let mut vm = Vm::new();
    let g = make_counter(&mut vm);
    let gen = vm.ts.call(g.as_obj(), &[]).expect("create");
    let value = vm.int(5);
    match gen_send(&mut vm.ts, gen.as_obj(), Some(value.as_obj())) {
        Err(raised) => match vm.ts.uncaught(raised) {
            VmError::Uncaught { kind, .. } => assert_eq!(kind, ExcKind::TypeError),
            other => panic!("unexpected error {other:?}"),
        },
        Ok(_) => panic!("non-None send into fresh generator must fail"),
    }
}

#[test]
fn close_then_resume_raises_stop_iteration() {
    let mut vm = Vm::new();
    let g = make_counter(&mut vm);
    let gen = vm.ts.call(g.as_obj(), &[]).expect("create");
    match gen_send(&mut vm.ts, gen.as_obj(), None).expect("start") {
        SendResult::Yield(_) => {}
        SendResult::Return(_) => panic!("finished early"),
    }
    gen_close(&mut vm.ts, gen.as_obj()).expect("close");
    assert_eq!(status_of(gen.as_obj()), GenStatus::Closed);
    match gen_send(&mut vm.ts, gen.as_obj(), None) {
        Err(raised) => match vm.ts.uncaught(raised) {
            VmError::Uncaught { kind, .. } => assert_eq!(kind, ExcKind::StopIteration),
            other => panic!("unexpected error {other:?}"),
        },
        Ok(_) => panic!("resuming a closed generator must fail"),
    }
}

#[test]
fn throw_lands_in_generator_handler() {
    // def guarded():
    //     try: yield 1
    //     except ValueError: yield 99
    let mut vm = Vm::new();
    let globals = vm.globals();
    let guarded = vm.function(
        globals.as_obj(),
        "guarded",
        CodeFlags::GENERATOR,
        0,
        8,
        &[],
        |b, ts| {
            let body = b.label();
            let handler = b.label();
            let handler_end = b.label();
            let done = b.label();
            b.bind(body);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::YIELD_VALUE);
            b.jump(Opcode::JUMP, done);
            b.bind(handler);
            // regs: r2 = link, r3 = exception
            let ve = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::ValueError)));
            b.op_u16(Opcode::LOAD_CONST, ve);
            b.op_rj(Opcode::JUMP_IF_NOT_EXC_MATCH, 2, done);
            let v99 = b.const_int(ts, 99);
            b.op_u16(Opcode::LOAD_CONST, v99);
            b.op(Opcode::YIELD_VALUE);
            b.op_r(Opcode::END_EXCEPT, 2);
            b.bind(handler_end);
            b.bind(done);
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
            b.handler(body, handler, handler_end, 2);
        },
    );
    let gen = vm.ts.call(guarded.as_obj(), &[]).expect("create");
    match gen_send(&mut vm.ts, gen.as_obj(), None).expect("start") {
        SendResult::Yield(v) => assert_eq!(number::int_value(v.as_obj()), 1),
        SendResult::Return(_) => panic!("finished early"),
    }
    let exc = common::make_exc(&mut vm, ExcKind::ValueError, "boom");
    match gen_throw(&mut vm.ts, gen.as_obj(), exc).expect("throw") {
        SendResult::Yield(v) => assert_eq!(number::int_value(v.as_obj()), 99),
        SendResult::Return(_) => panic!("handler should yield"),
    }
}

#[test]
fn yield_from_delegates_and_collects_return() {
    // def inner(): yield 1; yield 2; return 7
    // def outer(sub): result = yield from sub; return result
    let mut vm = Vm::new();
    let globals = vm.globals();
    let inner = vm.function(
        globals.as_obj(),
        "inner",
        CodeFlags::GENERATOR,
        0,
        4,
        &[],
        |b, ts| {
            for v in [1, 2] {
                let c = b.const_int(ts, v);
                b.op_u16(Opcode::LOAD_CONST, c);
                b.op(Opcode::YIELD_VALUE);
            }
            let seven = b.const_int(ts, 7);
            b.op_u16(Opcode::LOAD_CONST, seven);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let outer = vm.function(
        globals.as_obj(),
        "outer",
        CodeFlags::GENERATOR,
        1,
        4,
        &["sub"],
        |b, _ts| {
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op_r(Opcode::GET_YIELD_FROM_ITER, 1);
            b.op_r(Opcode::YIELD_FROM, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let sub = vm.ts.call(inner.as_obj(), &[]).expect("inner()");
    let gen = vm.ts.call(outer.as_obj(), &[sub.as_obj()]).expect("outer()");
    let mut yields = Vec::new();
    loop {
        match gen_send(&mut vm.ts, gen.as_obj(), None).expect("resume") {
            SendResult::Yield(v) => yields.push(number::int_value(v.as_obj())),
            SendResult::Return(v) => {
                assert_eq!(number::int_value(v.as_obj()), 7);
                break;
            }
        }
    }
    assert_eq!(yields, vec![1, 2]);
}

#[test]
fn stop_iteration_escaping_body_becomes_runtime_error() {
    // def bad(): raise StopIteration
    let mut vm = Vm::new();
    let globals = vm.globals();
    let bad = vm.function(
        globals.as_obj(),
        "bad",
        CodeFlags::GENERATOR,
        0,
        4,
        &[],
        |b, ts| {
            let si = b.const_obj(ObjRef::new(common::exc_type_of(ts, ExcKind::StopIteration)));
            b.op_u16(Opcode::LOAD_CONST, si);
            b.op(Opcode::RAISE);
        },
    );
    let gen = vm.ts.call(bad.as_obj(), &[]).expect("create");
    match gen_send(&mut vm.ts, gen.as_obj(), None) {
        Err(raised) => match vm.ts.uncaught(raised) {
            VmError::Uncaught { kind, message, .. } => {
                assert_eq!(kind, ExcKind::RuntimeError);
                assert!(message.contains("StopIteration"), "message: {message}");
            }
            other => panic!("unexpected error {other:?}"),
        },
        Ok(_) => panic!("StopIteration must not escape as itself"),
    }
    assert_eq!(status_of(gen.as_obj()), GenStatus::Closed);
}
