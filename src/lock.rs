//! Word-sized lock primitives
//!
//! [`RawMutex`] is the one-word per-object lock used by critical
//! sections. The fast path is a single compare-and-swap on the lock bit;
//! the slow path spins briefly and then yields the OS thread until the
//! bit is acquired. Fairness is left to the scheduler.
//!
//! Threads must release all critical sections before blocking on a
//! `RawMutex` (see `section::end_all`), which is what makes the naive
//! slow path deadlock-free.

use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

const UNLOCKED: usize = 0;
const LOCKED: usize = 1;

/// Bounded spin before falling back to `yield_now`.
const SPIN_LIMIT: u32 = 40;

/// A one-word mutex with no queue. The word is the whole state.
#[repr(transparent)]
pub struct RawMutex {
    v: AtomicUsize,
}

impl RawMutex {
    /// New unlocked mutex.
    pub const fn new() -> Self {
        Self {
            v: AtomicUsize::new(UNLOCKED),
        }
    }

    /// Fast-path acquisition attempt.
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.v
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Acquire, yielding until the lock bit is ours.
    #[inline]
    pub fn lock(&self) {
        if self.try_lock() {
            return;
        }
        self.lock_slow();
    }

    #[cold]
    fn lock_slow(&self) {
        let mut spins = 0u32;
        loop {
            if self.v.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                return;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Timed acquisition. Returns `false` on timeout.
    pub fn timed_lock(&self, timeout: Duration) -> bool {
        if self.try_lock() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            if self.v.load(Ordering::Relaxed) == UNLOCKED && self.try_lock() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Release. The caller must hold the lock.
    #[inline]
    pub fn unlock(&self) {
        let prev = self.v.swap(UNLOCKED, Ordering::Release);
        debug_assert_eq!(prev, LOCKED, "unlock of an unlocked RawMutex");
    }

    /// Whether the lock bit is currently set by any thread.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.v.load(Ordering::Relaxed) == LOCKED
    }

    /// Address identity, used for two-lock acquisition order.
    #[inline]
    pub fn addr(&self) -> usize {
        self as *const Self as usize
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawMutex")
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// A one-shot event: starts unset, transitions to set exactly once.
#[repr(transparent)]
pub struct Event {
    v: AtomicUsize,
}

impl Event {
    /// New unset event.
    pub const fn new() -> Self {
        Self {
            v: AtomicUsize::new(0),
        }
    }

    /// Set the event, waking all waiters.
    pub fn notify(&self) {
        self.v.store(1, Ordering::Release);
    }

    /// Whether the event is set.
    pub fn is_set(&self) -> bool {
        self.v.load(Ordering::Acquire) == 1
    }

    /// Block until the event is set.
    pub fn wait(&self) {
        let mut spins = 0u32;
        while !self.is_set() {
            if spins < SPIN_LIMIT {
                spins += 1;
                core::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// Block until the event is set or the timeout elapses. Returns
    /// whether the event was observed set.
    pub fn timed_wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_set() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_excludes() {
        let m = Arc::new(RawMutex::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let m = Arc::clone(&m);
            let counter = Arc::clone(&counter);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    m.lock();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                    m.unlock();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn timed_lock_times_out_while_held() {
        let m = RawMutex::new();
        m.lock();
        assert!(!m.timed_lock(Duration::from_millis(10)));
        m.unlock();
        assert!(m.timed_lock(Duration::from_millis(10)));
    }

    #[test]
    fn event_wakes_waiter() {
        let e = Arc::new(Event::new());
        let e2 = Arc::clone(&e);
        let h = std::thread::spawn(move || e2.wait());
        e.notify();
        h.join().unwrap();
        assert!(e.is_set());
    }
}
