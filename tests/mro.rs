//! Class, method resolution and cache-invalidation scenarios.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::Vm;
use quill_vm::prelude::*;

/// A class `A` with a method `m` returning `value`.
fn make_class_with_m(vm: &mut Vm, name: &str, value: i64) -> (Obj, ObjRef) {
    let globals = vm.globals();
    let method = vm.function(
        globals.as_obj(),
        &format!("{name}.m"),
        CodeFlags::empty(),
        1,
        4,
        &["self"],
        |b, ts| {
            let c = b.const_int(ts, value);
            b.op_u16(Opcode::LOAD_CONST, c);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let namespace = quill_vm::dict::new(&mut vm.ts);
    let key = vm.ts.intern("m");
    quill_vm::dict::set(&mut vm.ts, namespace.as_obj(), key, method.as_obj()).unwrap();
    let cls = vm.ts.new_class(name, &[], namespace.as_obj()).expect("class");
    (cls, method)
}

#[test]
fn instance_method_binds_and_calls() {
    let mut vm = Vm::new();
    let (cls, _method) = make_class_with_m(&mut vm, "A", 5);
    let instance = vm.ts.call(cls, &[]).expect("A()");
    let bound = vm.ts.getattr(instance.as_obj(), "m").expect("A().m");
    assert!(bound.as_obj().is_exact(vm.rt.types().method));
    let result = vm.ts.call(bound.as_obj(), &[]).expect("A().m()");
    assert_eq!(number::int_value(result.as_obj()), 5);
}

#[test]
fn repeated_lookup_hits_cache_and_stays_correct() {
    let mut vm = Vm::new();
    let (cls, _method) = make_class_with_m(&mut vm, "A", 5);
    let instance = vm.ts.call(cls, &[]).expect("A()");
    for _ in 0..64 {
        let bound = vm.ts.getattr(instance.as_obj(), "m").expect("cached lookup");
        let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
        assert_eq!(number::int_value(result.as_obj()), 5);
    }
}

#[test]
fn monkey_patching_invalidates_the_cache() {
    let mut vm = Vm::new();
    let (cls, _method) = make_class_with_m(&mut vm, "A", 5);
    let instance = vm.ts.call(cls, &[]).expect("A()");

    // Warm the cache.
    let bound = vm.ts.getattr(instance.as_obj(), "m").expect("warm");
    let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
    assert_eq!(number::int_value(result.as_obj()), 5);

    // A.m = other
    let globals = vm.globals();
    let other = vm.function(
        globals.as_obj(),
        "other",
        CodeFlags::empty(),
        1,
        4,
        &["self"],
        |b, ts| {
            let c = b.const_int(ts, 99);
            b.op_u16(Opcode::LOAD_CONST, c);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    vm.ts.setattr(cls, "m", Some(other.as_obj())).expect("patch");

    let bound = vm.ts.getattr(instance.as_obj(), "m").expect("fresh lookup");
    let result = vm.ts.call(bound.as_obj(), &[]).expect("patched call");
    assert_eq!(number::int_value(result.as_obj()), 99);
}

#[test]
fn subclass_caches_invalidate_with_the_base() {
    let mut vm = Vm::new();
    let (base, _method) = make_class_with_m(&mut vm, "A", 5);
    let namespace = quill_vm::dict::new(&mut vm.ts);
    let sub = vm
        .ts
        .new_class("B", &[base], namespace.as_obj())
        .expect("B(A)");
    let instance = vm.ts.call(sub, &[]).expect("B()");

    // Warm B's cache through the inherited method.
    let bound = vm.ts.getattr(instance.as_obj(), "m").expect("inherited");
    let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
    assert_eq!(number::int_value(result.as_obj()), 5);

    // Patch on the BASE; the subclass cache entry must die with it.
    let globals = vm.globals();
    let other = vm.function(
        globals.as_obj(),
        "other",
        CodeFlags::empty(),
        1,
        4,
        &["self"],
        |b, ts| {
            let c = b.const_int(ts, 42);
            b.op_u16(Opcode::LOAD_CONST, c);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    vm.ts.setattr(base, "m", Some(other.as_obj())).expect("patch base");

    let bound = vm.ts.getattr(instance.as_obj(), "m").expect("post-patch");
    let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
    assert_eq!(number::int_value(result.as_obj()), 42);
}

#[test]
fn missing_attribute_is_cached_as_absent_but_appears_after_patch() {
    let mut vm = Vm::new();
    let (cls, _method) = make_class_with_m(&mut vm, "A", 5);
    let instance = vm.ts.call(cls, &[]).expect("A()");

    for _ in 0..4 {
        match vm.ts.getattr(instance.as_obj(), "later") {
            Err(VmError::Uncaught { kind, .. }) => assert_eq!(kind, ExcKind::AttributeError),
            other => panic!("expected AttributeError, got {other:?}"),
        }
    }
    let marker = vm.int(1234);
    vm.ts.setattr(cls, "later", Some(marker.as_obj())).expect("add attr");
    let got = vm.ts.getattr(instance.as_obj(), "later").expect("new attr");
    assert_eq!(number::int_value(got.as_obj()), 1234);
}

#[test]
fn cross_thread_patch_is_observed() {
    // T1 looks `A.m` up in a loop (caching); T2 patches it once. T1 must
    // observe the new method and never a torn state.
    let mut vm = Vm::new();
    let rt = Arc::clone(&vm.rt);
    let (cls, _method) = make_class_with_m(&mut vm, "A", 5);
    let instance = vm.ts.call(cls, &[]).expect("A()");

    let patched = Arc::new(AtomicBool::new(false));
    let patcher_rt = Arc::clone(&rt);
    let patcher_flag = Arc::clone(&patched);
    let patcher = std::thread::spawn(move || {
        let mut ts2 = ThreadState::new(patcher_rt);
        let globals = quill_vm::dict::new(&mut ts2);
        let other = common::assemble_function(
            &mut ts2,
            globals.as_obj(),
            "other",
            CodeFlags::empty(),
            1,
            4,
            &["self"],
            |b, ts| {
                let c = b.const_int(ts, 99);
                b.op_u16(Opcode::LOAD_CONST, c);
                b.op(Opcode::RETURN_VALUE);
            },
        );
        ts2.setattr(cls, "m", Some(other.as_obj())).expect("patch");
        patcher_flag.store(true, Ordering::Release);
        // Stay attached briefly so reclamation has a live peer.
        for _ in 0..64 {
            ts2.safepoint().unwrap();
            std::thread::yield_now();
        }
    });

    let mut saw_new = false;
    for _ in 0..200_000 {
        let bound = vm.ts.getattr(instance.as_obj(), "m").expect("lookup");
        let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
        let v = number::int_value(result.as_obj());
        assert!(v == 5 || v == 99, "torn method value {v}");
        if patched.load(Ordering::Acquire) && v == 99 {
            saw_new = true;
            break;
        }
        vm.ts.safepoint().unwrap();
    }
    patcher.join().unwrap();
    assert!(saw_new, "patched method never observed");

    // After the patch settles, the stale entry must never reappear.
    for _ in 0..100 {
        let bound = vm.ts.getattr(instance.as_obj(), "m").expect("lookup");
        let result = vm.ts.call(bound.as_obj(), &[]).expect("call");
        assert_eq!(number::int_value(result.as_obj()), 99);
    }
}
