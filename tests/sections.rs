//! Critical-section laws: ordering, implicit release, contention.

use quickcheck_macros::quickcheck;
use quill_vm::lock::RawMutex;
use quill_vm::section::SectionChain;

#[quickcheck]
fn two_lock_begin_orders_by_address(first: usize, second: usize, flip: bool) -> bool {
    // Arbitrary pair out of a small pool, in either argument order: the
    // section must lock both and release both, regardless.
    let pool: Vec<Box<RawMutex>> = (0..8).map(|_| Box::new(RawMutex::new())).collect();
    let a = &pool[first % pool.len()];
    let b = &pool[second % pool.len()];
    let (x, y) = if flip { (b, a) } else { (a, b) };

    let mut chain = SectionChain::new();
    let id = chain.begin2(x, y);
    let both_locked = x.is_locked() && y.is_locked();
    chain.end(id);
    let both_released = !x.is_locked() && !y.is_locked();
    both_locked && both_released && chain.depth() == 0
}

#[quickcheck]
fn nested_sections_unwind_cleanly(depth: u8) -> bool {
    let depth = (depth % 16) as usize + 1;
    let pool: Vec<Box<RawMutex>> = (0..depth).map(|_| Box::new(RawMutex::new())).collect();
    let mut chain = SectionChain::new();
    let ids: Vec<_> = pool.iter().map(|m| chain.begin(m)).collect();
    if chain.active_count() != depth {
        return false;
    }
    for id in ids.into_iter().rev() {
        chain.end(id);
    }
    chain.depth() == 0 && pool.iter().all(|m| !m.is_locked())
}

#[test]
fn opposite_order_pairs_never_deadlock() {
    // Two threads, same two locks, opposite argument orders, many
    // rounds. Address ordering inside begin2 makes this safe.
    let a: &RawMutex = Box::leak(Box::new(RawMutex::new()));
    let b: &RawMutex = Box::leak(Box::new(RawMutex::new()));

    let forward = std::thread::spawn(move || {
        let mut chain = SectionChain::new();
        for _ in 0..20_000 {
            let id = chain.begin2(a, b);
            chain.end(id);
        }
    });
    let backward = std::thread::spawn(move || {
        let mut chain = SectionChain::new();
        for _ in 0..20_000 {
            let id = chain.begin2(b, a);
            chain.end(id);
        }
    });
    forward.join().unwrap();
    backward.join().unwrap();
    assert!(!a.is_locked() && !b.is_locked());
}

#[test]
fn blocking_on_inner_lock_releases_outer() {
    // Thread 1 holds `outer` in a section and then blocks acquiring
    // `inner`, which thread 2 holds. Thread 2 proceeds to take `outer`,
    // which only works because thread 1 released it implicitly.
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    let outer: &RawMutex = Box::leak(Box::new(RawMutex::new()));
    let inner: &RawMutex = Box::leak(Box::new(RawMutex::new()));
    inner.lock(); // held on behalf of thread 2
    let entering = Arc::new(AtomicBool::new(false));

    let t2_entering = Arc::clone(&entering);
    let t2 = std::thread::spawn(move || {
        // Wait until thread 1 is about to block, then for the implicit
        // release of its outer section.
        while !t2_entering.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        while outer.is_locked() {
            std::thread::yield_now();
        }
        let mut chain = SectionChain::new();
        let id = chain.begin(outer);
        chain.end(id);
        inner.unlock(); // let thread 1 through
    });

    let mut chain = SectionChain::new();
    let id_outer = chain.begin(outer);
    entering.store(true, Ordering::Release);
    let id_inner = chain.begin(inner); // blocks; implicitly ends outer
    assert!(inner.is_locked());
    chain.end(id_inner); // resumes outer
    assert!(outer.is_locked());
    chain.end(id_outer);
    t2.join().unwrap();
}

#[test]
fn atomicity_between_suspension_points() {
    // A writer mutates a pair of fields under the object's section; a
    // reader takes the same section and must always observe a
    // consistent pair. No suspension point sits between the writes.
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    struct Pair {
        mutex: RawMutex,
        a: AtomicU64,
        b: AtomicU64,
    }
    let pair = Arc::new(Pair {
        mutex: RawMutex::new(),
        a: AtomicU64::new(0),
        b: AtomicU64::new(0),
    });

    let writer_pair = Arc::clone(&pair);
    let writer = std::thread::spawn(move || {
        let mut chain = SectionChain::new();
        for i in 1..=50_000u64 {
            let id = chain.begin(&writer_pair.mutex);
            writer_pair.a.store(i, Ordering::Relaxed);
            writer_pair.b.store(i, Ordering::Relaxed);
            chain.end(id);
        }
    });

    let mut chain = SectionChain::new();
    for _ in 0..50_000 {
        let id = chain.begin(&pair.mutex);
        let a = pair.a.load(Ordering::Relaxed);
        let b = pair.b.load(Ordering::Relaxed);
        chain.end(id);
        assert_eq!(a, b, "observed a torn update");
    }
    writer.join().unwrap();
}
