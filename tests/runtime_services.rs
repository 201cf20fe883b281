//! Runtime-level services: pending calls, async exceptions, signals,
//! stop-the-world, tracing and imports.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::Vm;
use quill_vm::prelude::*;

#[test]
fn pending_calls_run_at_safe_points() {
    let mut vm = Vm::new();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    vm.rt.add_pending_call(Box::new(move |_ts| {
        flag.store(true, Ordering::Release);
    }));
    assert!(!ran.load(Ordering::Acquire));
    vm.ts.safepoint().expect("safepoint");
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn async_exception_interrupts_evaluation() {
    // A self-decrementing loop runs until another thread posts an
    // asynchronous KeyboardInterrupt.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "spin",
        CodeFlags::empty(),
        1,
        4,
        &["n"],
        |b, ts| {
            let top = b.label();
            let done = b.label();
            let one = b.const_int(ts, 1);
            b.bind(top);
            b.op_r(Opcode::LOAD_FAST, 0);
            b.jump(Opcode::POP_JUMP_IF_FALSE, done);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op_r(Opcode::BINARY_SUBTRACT, 0);
            b.op_r(Opcode::STORE_FAST, 0);
            b.jump(Opcode::JUMP, top);
            b.bind(done);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
        },
    );

    let tid = vm.ts.id();
    let exc = common::make_exc(&mut vm, ExcKind::KeyboardInterrupt, "stop");
    assert!(vm.rt.post_async_exc(tid, exc));

    // A long (but bounded) loop: the injection must arrive at a
    // backward-jump safety point well before it finishes.
    let n = vm.int(50_000_000);
    match vm.ts.call(func.as_obj(), &[n.as_obj()]) {
        Err(VmError::Uncaught { kind, .. }) => assert_eq!(kind, ExcKind::KeyboardInterrupt),
        Ok(_) => panic!("async exception was never delivered"),
        other => panic!("unexpected result {other:?}"),
    }
}

#[test]
fn signal_handler_runs_on_post() {
    let mut vm = Vm::new();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    vm.rt.set_signal_handler(Box::new(move |_ts| {
        counter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }));
    vm.rt.post_signal();
    vm.ts.safepoint().expect("safepoint");
    assert_eq!(hits.load(Ordering::Acquire), 1);
    // The bit is one-shot until posted again.
    vm.ts.safepoint().expect("safepoint");
    assert_eq!(hits.load(Ordering::Acquire), 1);
}

#[test]
fn stop_the_world_waits_for_peers() {
    let mut vm = Vm::new();
    let rt = Arc::clone(&vm.rt);
    let running = Arc::new(AtomicBool::new(true));

    let peer_rt = Arc::clone(&rt);
    let peer_running = Arc::clone(&running);
    let peer = std::thread::spawn(move || {
        let mut ts2 = ThreadState::new(peer_rt);
        while peer_running.load(Ordering::Acquire) {
            ts2.safepoint().unwrap();
            std::thread::yield_now();
        }
    });

    let observed = Arc::new(AtomicUsize::new(0));
    let inside = Arc::clone(&observed);
    rt.stop_the_world(&mut vm.ts, |rt| {
        // With the world stopped the peer is parked; the tracked-object
        // census is stable here.
        inside.store(rt.thread_count(), Ordering::Release);
    });
    assert_eq!(observed.load(Ordering::Acquire), 2);

    running.store(false, Ordering::Release);
    peer.join().unwrap();
}

#[test]
fn import_goes_through_the_host_hook() {
    let mut vm = Vm::new();
    vm.rt.set_import_hook(Box::new(|ts, name| {
        let module = module::new(ts, name);
        let marker_key = ts.intern("marker");
        let value = number::new_int(ts, 77);
        quill_vm::dict::set(ts, module::dict_of(module.as_obj()), marker_key, value.as_obj())?;
        Ok(module)
    }));

    let globals = vm.globals();
    // import depot; return depot.marker
    let func = vm.function(
        globals.as_obj(),
        "imports",
        CodeFlags::empty(),
        0,
        4,
        &[],
        |b, ts| {
            let name = b.name(ts, "depot");
            b.op_u16(Opcode::IMPORT_NAME, name);
            let marker = b.name(ts, "marker");
            b.op_u16(Opcode::IMPORT_FROM, marker);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    assert_eq!(vm.call_int(func.as_obj(), &[]), 77);
}

#[test]
fn import_without_hook_raises_import_error() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "imports",
        CodeFlags::empty(),
        0,
        4,
        &[],
        |b, ts| {
            let name = b.name(ts, "depot");
            b.op_u16(Opcode::IMPORT_NAME, name);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    match vm.ts.call(func.as_obj(), &[]) {
        Err(VmError::Uncaught { kind, .. }) => assert_eq!(kind, ExcKind::ImportError),
        other => panic!("expected ImportError, got {other:?}"),
    }
}

#[test]
fn trace_hook_sees_call_line_and_return() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "traced",
        CodeFlags::empty(),
        0,
        4,
        &[],
        |b, ts| {
            b.line(2);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.line(3);
            b.op_r(Opcode::STORE_FAST, 1);
            b.op_r(Opcode::LOAD_FAST, 1);
            b.op(Opcode::RETURN_VALUE);
        },
    );

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    set_trace(
        &mut vm.ts,
        Some(Arc::new(move |_ts, event| {
            sink.lock().unwrap().push(event);
            Ok(())
        })),
    );
    let _ = vm.ts.call(func.as_obj(), &[]).expect("traced call");
    set_trace(&mut vm.ts, None);

    let seen = events.lock().unwrap().clone();
    assert!(seen.contains(&TraceEvent::Return), "events: {seen:?}");
    assert!(
        seen.iter().any(|e| matches!(e, TraceEvent::Line(_))),
        "events: {seen:?}"
    );
    // Line events fire once per line, not once per instruction.
    let line3 = seen
        .iter()
        .filter(|e| matches!(e, TraceEvent::Line(3)))
        .count();
    assert_eq!(line3, 1, "events: {seen:?}");
}

#[test]
fn shutdown_flushes_orphaned_retirements() {
    let rt = {
        let mut vm = Vm::new();
        // Force keys-block retirements, then detach the thread.
        let d = quill_vm::dict::new(&mut vm.ts);
        for i in 0..200i64 {
            let key = vm.ts.intern(&format!("k{i}"));
            let value = vm.int(i);
            quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();
        }
        Arc::clone(&vm.rt)
    };
    assert_eq!(rt.thread_count(), 0);
    rt.shutdown();
}
