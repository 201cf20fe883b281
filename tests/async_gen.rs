//! Coroutines and async generators.

mod common;

use common::Vm;
use quill_vm::generator::{origin_of, status_of};
use quill_vm::prelude::*;

/// `async def inner(): return 5`
fn make_inner_coro(vm: &mut Vm) -> ObjRef {
    let globals = vm.globals();
    vm.function(
        globals.as_obj(),
        "inner",
        CodeFlags::COROUTINE,
        0,
        4,
        &[],
        |b, ts| {
            let five = b.const_int(ts, 5);
            b.op_u16(Opcode::LOAD_CONST, five);
            b.op(Opcode::RETURN_VALUE);
        },
    )
}

#[test]
fn await_compiles_to_get_awaitable_plus_yield_from() {
    // async def outer(sub): return await sub
    let mut vm = Vm::new();
    let globals = vm.globals();
    let inner = make_inner_coro(&mut vm);
    let outer = vm.function(
        globals.as_obj(),
        "outer",
        CodeFlags::COROUTINE,
        1,
        4,
        &["sub"],
        |b, _ts| {
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op(Opcode::GET_AWAITABLE);
            b.op_r(Opcode::STORE_FAST, 1);
            b.op(Opcode::CLEAR_ACC);
            b.op_r(Opcode::YIELD_FROM, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    // Build: outer(inner()) driven to completion.
    let sub = vm.ts.call(inner.as_obj(), &[]).expect("inner()");
    assert_eq!(status_of(sub.as_obj()), GenStatus::Created);
    let coro = vm.ts.call(outer.as_obj(), &[sub.as_obj()]).expect("outer()");
    match gen_send(&mut vm.ts, coro.as_obj(), None).expect("drive") {
        SendResult::Return(v) => assert_eq!(number::int_value(v.as_obj()), 5),
        SendResult::Yield(_) => panic!("nothing should reach the event loop"),
    }
    assert_eq!(status_of(coro.as_obj()), GenStatus::Closed);
    assert_eq!(status_of(sub.as_obj()), GenStatus::Closed);
}

#[test]
fn awaited_value_lands_in_accumulator() {
    // async def outer(sub): x = await sub; return x + 1
    let mut vm = Vm::new();
    let globals = vm.globals();
    let inner = make_inner_coro(&mut vm);
    let outer = vm.function(
        globals.as_obj(),
        "outer",
        CodeFlags::COROUTINE,
        1,
        4,
        &["sub"],
        |b, ts| {
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op(Opcode::GET_AWAITABLE);
            b.op_r(Opcode::STORE_FAST, 1);
            b.op(Opcode::CLEAR_ACC);
            b.op_r(Opcode::YIELD_FROM, 1);
            b.op_r(Opcode::STORE_FAST, 2);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op_r(Opcode::BINARY_ADD, 2);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let sub = vm.ts.call(inner.as_obj(), &[]).expect("inner()");
    let coro = vm.ts.call(outer.as_obj(), &[sub.as_obj()]).expect("outer()");
    match gen_send(&mut vm.ts, coro.as_obj(), None).expect("drive") {
        SendResult::Return(v) => assert_eq!(number::int_value(v.as_obj()), 6),
        SendResult::Yield(_) => panic!("nothing should reach the event loop"),
    }
}

#[test]
fn coroutine_records_its_origin() {
    let mut vm = Vm::new();
    let inner = make_inner_coro(&mut vm);
    let coro = vm.ts.call(inner.as_obj(), &[]).expect("inner()");
    let origin = origin_of(coro.as_obj());
    assert!(!origin.is_empty());
    assert_eq!(string::as_str(origin[0].qualname.as_obj()), "inner");
    assert_eq!(string::as_str(origin[0].filename.as_obj()), "<test>");
}

#[test]
fn reusing_a_finished_coroutine_raises() {
    let mut vm = Vm::new();
    let inner = make_inner_coro(&mut vm);
    let coro = vm.ts.call(inner.as_obj(), &[]).expect("inner()");
    match gen_send(&mut vm.ts, coro.as_obj(), None).expect("drive") {
        SendResult::Return(v) => assert_eq!(number::int_value(v.as_obj()), 5),
        SendResult::Yield(_) => panic!("unexpected yield"),
    }
    match gen_send(&mut vm.ts, coro.as_obj(), None) {
        Err(raised) => match vm.ts.uncaught(raised) {
            VmError::Uncaught { kind, .. } => assert_eq!(kind, ExcKind::StopIteration),
            other => panic!("unexpected error {other:?}"),
        },
        Ok(_) => panic!("reuse must fail"),
    }
}

/// `async def agen(): yield 1` (an async generator).
fn make_agen(vm: &mut Vm) -> ObjRef {
    let globals = vm.globals();
    vm.function(
        globals.as_obj(),
        "agen",
        CodeFlags::ASYNC_GENERATOR,
        0,
        4,
        &[],
        |b, ts| {
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::YIELD_VALUE);
            b.op(Opcode::CLEAR_ACC);
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
        },
    )
}

#[test]
fn async_generator_wraps_its_yields() {
    let mut vm = Vm::new();
    let agen_fn = make_agen(&mut vm);
    let agen = vm.ts.call(agen_fn.as_obj(), &[]).expect("agen()");
    assert!(agen.as_obj().is_exact(vm.rt.types().async_generator));
    match gen_send(&mut vm.ts, agen.as_obj(), None).expect("resume") {
        SendResult::Yield(v) => {
            assert!(
                v.as_obj().is_exact(vm.rt.types().agen_wrapped),
                "async generators wrap yielded values"
            );
        }
        SendResult::Return(_) => panic!("finished early"),
    }
}

#[test]
fn aclose_then_anext_raises_stop_async_iteration() {
    let mut vm = Vm::new();
    let agen_fn = make_agen(&mut vm);
    let agen = vm.ts.call(agen_fn.as_obj(), &[]).expect("agen()");
    // Suspend at the yield, then close.
    match gen_send(&mut vm.ts, agen.as_obj(), None).expect("resume") {
        SendResult::Yield(_) => {}
        SendResult::Return(_) => panic!("finished early"),
    }
    gen_close(&mut vm.ts, agen.as_obj()).expect("aclose");
    assert_eq!(status_of(agen.as_obj()), GenStatus::Closed);
    // A subsequent resume (what __anext__ does) raises
    // StopAsyncIteration.
    match gen_send(&mut vm.ts, agen.as_obj(), None) {
        Err(raised) => match vm.ts.uncaught(raised) {
            VmError::Uncaught { kind, .. } => assert_eq!(kind, ExcKind::StopAsyncIteration),
            other => panic!("unexpected error {other:?}"),
        },
        Ok(_) => panic!("closed async generator must not resume"),
    }
}

#[test]
fn generator_exit_can_be_observed_by_the_body() {
    // An async generator with a try/finally-style handler around its
    // yield: close() injects GeneratorExit there, and the generator must
    // finish rather than keep yielding.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let agen_fn = vm.function(
        globals.as_obj(),
        "guarded_agen",
        CodeFlags::ASYNC_GENERATOR,
        0,
        8,
        &[],
        |b, ts| {
            let body = b.label();
            let handler = b.label();
            let handler_end = b.label();
            b.bind(body);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::YIELD_VALUE);
            b.op(Opcode::CLEAR_ACC);
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
            b.bind(handler);
            // Re-raise whatever arrived (GeneratorExit included).
            b.op(Opcode::RAISE);
            b.bind(handler_end);
            b.handler(body, handler, handler_end, 2);
        },
    );
    let agen = vm.ts.call(agen_fn.as_obj(), &[]).expect("agen()");
    match gen_send(&mut vm.ts, agen.as_obj(), None).expect("resume") {
        SendResult::Yield(_) => {}
        SendResult::Return(_) => panic!("finished early"),
    }
    gen_close(&mut vm.ts, agen.as_obj()).expect("close swallows GeneratorExit");
    assert_eq!(status_of(agen.as_obj()), GenStatus::Closed);
}
