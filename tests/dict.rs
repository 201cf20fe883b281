//! Concurrent mapping scenarios: ordering, versions, contention.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use common::Vm;
use quill_vm::prelude::*;

#[test]
fn iteration_matches_insertion_order() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    let names = ["alpha", "beta", "gamma", "delta", "epsilon"];
    for (i, name) in names.iter().enumerate() {
        let key = vm.ts.intern(name);
        let value = vm.int(i as i64);
        quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();
    }
    let keys = quill_vm::dict::keys_ordered(&mut vm.ts, d.as_obj());
    let got: Vec<&str> = keys.iter().map(|k| string::as_str(k.as_obj())).collect();
    assert_eq!(got, names);

    // Deleting an interior key preserves the order of survivors.
    let beta = vm.ts.intern("beta");
    assert!(quill_vm::dict::delete(&mut vm.ts, d.as_obj(), beta).unwrap());
    let keys = quill_vm::dict::keys_ordered(&mut vm.ts, d.as_obj());
    let got: Vec<&str> = keys.iter().map(|k| string::as_str(k.as_obj())).collect();
    assert_eq!(got, vec!["alpha", "gamma", "delta", "epsilon"]);
}

#[test]
fn order_survives_resize() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    let names: Vec<String> = (0..100).map(|i| format!("key{i:03}")).collect();
    for name in &names {
        let key = vm.ts.intern(name);
        let value = vm.int(1);
        quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();
    }
    assert_eq!(quill_vm::dict::len(d.as_obj()), 100);
    let keys = quill_vm::dict::keys_ordered(&mut vm.ts, d.as_obj());
    let got: Vec<String> = keys
        .iter()
        .map(|k| string::as_str(k.as_obj()).to_owned())
        .collect();
    assert_eq!(got, names);
}

#[test]
fn version_tag_strictly_increases() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    let mut last = quill_vm::dict::version(d.as_obj());
    for i in 0..64 {
        let key = vm.ts.intern(&format!("v{i}"));
        let value = vm.int(i);
        quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();
        let now = quill_vm::dict::version(d.as_obj());
        assert!(now > last, "version must grow on every mutation");
        last = now;
    }
    // Overwriting an existing key is a mutation too.
    let key = vm.ts.intern("v0");
    let value = vm.int(999);
    quill_vm::dict::set(&mut vm.ts, d.as_obj(), key, value.as_obj()).unwrap();
    assert!(quill_vm::dict::version(d.as_obj()) > last);
}

#[test]
fn non_string_keys_demote_to_general_block() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    // Interned-string keys first, then an int key forces the rebuild.
    let s = vm.ts.intern("name");
    let v1 = vm.int(1);
    quill_vm::dict::set(&mut vm.ts, d.as_obj(), s, v1.as_obj()).unwrap();
    let k7 = vm.int(7);
    let v2 = vm.int(2);
    quill_vm::dict::set(&mut vm.ts, d.as_obj(), k7.as_obj(), v2.as_obj()).unwrap();

    let got = quill_vm::dict::get(&mut vm.ts, d.as_obj(), s)
        .unwrap()
        .expect("string key survives demotion");
    assert_eq!(number::int_value(got.as_obj()), 1);
    // Equal-by-value int key (distinct object) still finds the entry.
    let k7b = vm.int(7);
    let got = quill_vm::dict::get(&mut vm.ts, d.as_obj(), k7b.as_obj())
        .unwrap()
        .expect("int key compares by value");
    assert_eq!(number::int_value(got.as_obj()), 2);
}

#[test]
fn missing_key_subscript_raises_key_error() {
    let mut vm = Vm::new();
    let d = quill_vm::dict::new(&mut vm.ts);
    let k = vm.ts.intern("absent");
    assert!(quill_vm::dict::get(&mut vm.ts, d.as_obj(), k).unwrap().is_none());
    assert!(!quill_vm::dict::delete(&mut vm.ts, d.as_obj(), k).unwrap());
}

#[test]
fn concurrent_reader_never_sees_gaps() {
    // One thread rebinds d[k] = i, another reads d.get(k) in a loop.
    // Once the key exists, every read must produce some written value.
    let vm = Vm::new();
    let Vm { rt, mut ts } = vm;
    let d = quill_vm::dict::new(&mut ts);
    let key = ts.intern("k");
    let zero = number::new_int(&mut ts, 0);
    quill_vm::dict::set(&mut ts, d.as_obj(), key, zero.as_obj()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer_rt = Arc::clone(&rt);
    let writer_dict = d.clone();
    let writer_stop = Arc::clone(&stop);
    let writer = std::thread::spawn(move || {
        let mut ts2 = ThreadState::new(writer_rt);
        let key = ts2.intern("k");
        for i in 1..=10_000i64 {
            let value = number::new_int(&mut ts2, i);
            quill_vm::dict::set(&mut ts2, writer_dict.as_obj(), key, value.as_obj()).unwrap();
            if i % 256 == 0 {
                ts2.safepoint().unwrap();
            }
        }
        writer_stop.store(true, Ordering::Release);
    });

    let mut last_seen = 0i64;
    let mut reads = 0u64;
    while !stop.load(Ordering::Acquire) || reads == 0 {
        let got = quill_vm::dict::get(&mut ts, d.as_obj(), key)
            .unwrap()
            .expect("key is never absent once inserted");
        let v = number::int_value(got.as_obj());
        assert!((0..=10_000).contains(&v));
        // Writes from one writer are observed monotonically thanks to
        // version validation on the read path.
        assert!(v >= last_seen, "reader went backwards: {v} < {last_seen}");
        last_seen = v;
        reads += 1;
        if reads % 512 == 0 {
            ts.safepoint().unwrap();
        }
    }
    writer.join().unwrap();

    let final_value = quill_vm::dict::get(&mut ts, d.as_obj(), key)
        .unwrap()
        .expect("final value present");
    assert_eq!(number::int_value(final_value.as_obj()), 10_000);
    assert!(reads > 0);
}

#[test]
fn concurrent_inserts_from_two_threads() {
    let Vm { rt, mut ts } = Vm::new();
    let d = quill_vm::dict::new(&mut ts);

    let other_rt = Arc::clone(&rt);
    let other_dict = d.clone();
    let other = std::thread::spawn(move || {
        let mut ts2 = ThreadState::new(other_rt);
        for i in 0..500i64 {
            let key = ts2.intern(&format!("b{i}"));
            let value = number::new_int(&mut ts2, i);
            quill_vm::dict::set(&mut ts2, other_dict.as_obj(), key, value.as_obj()).unwrap();
            if i % 64 == 0 {
                ts2.safepoint().unwrap();
            }
        }
    });
    for i in 0..500i64 {
        let key = ts.intern(&format!("a{i}"));
        let value = number::new_int(&mut ts, i);
        quill_vm::dict::set(&mut ts, d.as_obj(), key, value.as_obj()).unwrap();
        if i % 64 == 0 {
            ts.safepoint().unwrap();
        }
    }
    other.join().unwrap();

    assert_eq!(quill_vm::dict::len(d.as_obj()), 1000);
    for i in 0..500i64 {
        for prefix in ["a", "b"] {
            let key = ts.intern(&format!("{prefix}{i}"));
            let got = quill_vm::dict::get(&mut ts, d.as_obj(), key)
                .unwrap()
                .expect("inserted key present");
            assert_eq!(number::int_value(got.as_obj()), i);
        }
    }
}

#[test]
fn for_loop_over_dict_yields_keys() {
    // Drive the dict iterator object through a for-loop body.
    let mut vm = Vm::new();
    let globals = vm.globals();
    // def first_key(d): for k in d: return k
    let func = vm.function(
        globals.as_obj(),
        "first_key",
        CodeFlags::empty(),
        1,
        6,
        &["d"],
        |b, ts| {
            let done = b.label();
            b.op_r(Opcode::LOAD_FAST, 0);
            b.op_r(Opcode::GET_ITER, 1);
            b.op_rj(Opcode::FOR_ITER, 1, done);
            b.op(Opcode::RETURN_VALUE);
            b.bind(done);
            let none = b.const_obj(ObjRef::new(ts.none()));
            b.op_u16(Opcode::LOAD_CONST, none);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let d = quill_vm::dict::new(&mut vm.ts);
    let k = vm.ts.intern("only");
    let v = vm.int(1);
    quill_vm::dict::set(&mut vm.ts, d.as_obj(), k, v.as_obj()).unwrap();
    let got = vm.ts.call(func.as_obj(), &[d.as_obj()]).expect("iterates");
    assert_eq!(string::as_str(got.as_obj()), "only");
}

#[test]
fn parallel_hammer_keeps_the_table_consistent() {
    use rand::seq::SliceRandom;
    use rayon::prelude::*;

    let Vm { rt, mut ts } = Vm::new();
    let d = quill_vm::dict::new(&mut ts);

    // Four workers, each inserting the same 200 keys in its own random
    // order with worker-tagged values; any interleaving must end with
    // all keys present and each value written by some worker.
    (0..4u8).into_par_iter().for_each(|worker| {
        let mut ts2 = ThreadState::new(Arc::clone(&rt));
        let mut order: Vec<i64> = (0..200).collect();
        order.shuffle(&mut rand::thread_rng());
        for i in order {
            let key = ts2.intern(&format!("h{i}"));
            let value = number::new_int(&mut ts2, i * 10 + worker as i64);
            quill_vm::dict::set(&mut ts2, d.as_obj(), key, value.as_obj()).unwrap();
            if i % 32 == 0 {
                ts2.safepoint().unwrap();
            }
        }
    });

    assert_eq!(quill_vm::dict::len(d.as_obj()), 200);
    for i in 0..200i64 {
        let key = ts.intern(&format!("h{i}"));
        let got = quill_vm::dict::get(&mut ts, d.as_obj(), key)
            .unwrap()
            .expect("hammered key present");
        let v = number::int_value(got.as_obj());
        assert_eq!(v / 10, i, "value for key h{i} written by some worker");
        assert!((0..4).contains(&(v % 10)));
    }
}
