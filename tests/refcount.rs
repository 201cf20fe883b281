//! Biased refcount behavior across handles and threads.

mod common;

use std::sync::Arc;

use common::Vm;
use quill_vm::prelude::*;
use quill_vm::{local_count, shared_count};

#[test]
fn clone_and_drop_balance() {
    let mut vm = Vm::new();
    let obj = list::new(&mut vm.ts, Vec::new());
    let base = local_count(obj.as_obj());
    let extra: Vec<ObjRef> = (0..10).map(|_| obj.clone()).collect();
    assert_eq!(local_count(obj.as_obj()), base + 10);
    drop(extra);
    assert_eq!(local_count(obj.as_obj()), base);
}

#[test]
fn immortal_singletons_ignore_counting() {
    let vm = Vm::new();
    let none = vm.rt.singletons().none;
    let before = local_count(none);
    let handles: Vec<ObjRef> = (0..100).map(|_| ObjRef::new(none)).collect();
    assert_eq!(local_count(none), before);
    drop(handles);
    assert_eq!(local_count(none), before);
}

#[test]
fn foreign_thread_counts_on_the_shared_word() {
    let mut vm = Vm::new();
    let obj = list::new(&mut vm.ts, Vec::new());
    assert_eq!(shared_count(obj.as_obj()), 0);

    let held = obj.clone();
    let handle = std::thread::spawn(move || {
        // Cloning and dropping from a foreign thread must route through
        // the shared word and leave it balanced.
        let extra = held.clone();
        let s = shared_count(extra.as_obj());
        assert!(s >= 1);
        drop(extra);
        drop(held);
    });
    handle.join().unwrap();

    // The local bias is untouched; the object is still alive here.
    let n = list::len(&mut vm.ts, obj.as_obj());
    assert_eq!(n, 0);
}

#[test]
fn container_keeps_elements_alive() {
    let mut vm = Vm::new();
    let element = string::new(&mut vm.ts, "payload");
    let base = local_count(element.as_obj());
    let l = list::new(&mut vm.ts, vec![element.clone()]);
    assert_eq!(local_count(element.as_obj()), base + 1);
    drop(l);
    assert_eq!(local_count(element.as_obj()), base);
}

#[test]
fn dict_value_survives_removal_while_referenced() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    let key = vm.ts.intern("k");
    let value = string::new(&mut vm.ts, "kept-alive");
    quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();

    let fetched = quill_vm::dict::get(&mut vm.ts, d.as_obj(), key)
        .unwrap()
        .expect("present");
    assert!(quill_vm::dict::delete(&mut vm.ts, d.as_obj(), key).unwrap());
    // The mapping dropped its reference; ours still pins the object.
    assert_eq!(string::as_str(fetched.as_obj()), "kept-alive");
    drop(fetched);
    drop(value);
}

#[test]
fn evaluation_leaves_argument_counts_balanced() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let identity = vm.function(
        globals.as_obj(),
        "identity",
        CodeFlags::empty(),
        1,
        4,
        &["x"],
        |b, _ts| {
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let payload = string::new(&mut vm.ts, "round-trip");
    let before = local_count(payload.as_obj());
    for _ in 0..50 {
        let out = vm.ts.call(identity.as_obj(), &[payload.as_obj()]).unwrap();
        assert_eq!(out.as_obj(), payload.as_obj());
        drop(out);
    }
    assert_eq!(local_count(payload.as_obj()), before);
}

#[test]
fn cross_thread_handoff_then_death() {
    // Create on one thread, move the only reference to another thread,
    // drop it there: the merge path must reclaim without a crash and
    // the memory stays valid until the drop.
    let mut vm = Vm::new();
    let rt = Arc::clone(&vm.rt);
    let obj = string::new(&mut vm.ts, "nomad");
    let handle = std::thread::spawn(move || {
        let _ts2 = ThreadState::new(rt);
        assert_eq!(string::as_str(obj.as_obj()), "nomad");
        drop(obj);
    });
    handle.join().unwrap();
}
