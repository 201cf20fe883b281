//! Atomic primitives and memory-ordering conventions
//!
//! Every cross-thread access in the runtime goes through this module so
//! the ordering discipline stays auditable in one place:
//!
//! * biased refcount fast paths are relaxed, the merge path is
//!   release/acquire (`rc`);
//! * published table pointers (keys blocks, cache buckets) are release
//!   stores paired with acquire loads;
//! * version tags are release on write, acquire on read;
//! * eval-breaker bits are acquire/release read-modify-writes.

use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Relaxed load of a `u32` cell.
#[inline(always)]
pub fn load_u32_relaxed(cell: &AtomicU32) -> u32 {
    cell.load(Ordering::Relaxed)
}

/// Relaxed store of a `u32` cell.
#[inline(always)]
pub fn store_u32_relaxed(cell: &AtomicU32, value: u32) {
    cell.store(value, Ordering::Relaxed)
}

/// Single-shot compare-exchange on a `u32` cell (acquire/release on
/// success, relaxed on failure).
#[inline(always)]
pub fn cas_u32(cell: &AtomicU32, current: u32, new: u32) -> bool {
    cell.compare_exchange(current, new, Ordering::AcqRel, Ordering::Relaxed)
        .is_ok()
}

/// Acquire load of a published pointer.
#[inline(always)]
pub fn load_ptr_acquire<T>(cell: &AtomicPtr<T>) -> *mut T {
    cell.load(Ordering::Acquire)
}

/// Relaxed load of a pointer that is only validated afterwards.
#[inline(always)]
pub fn load_ptr_relaxed<T>(cell: &AtomicPtr<T>) -> *mut T {
    cell.load(Ordering::Relaxed)
}

/// Release store publishing a fully constructed block.
#[inline(always)]
pub fn store_ptr_release<T>(cell: &AtomicPtr<T>, value: *mut T) {
    cell.store(value, Ordering::Release)
}

/// Acquire load of a version tag.
#[inline(always)]
pub fn load_version(cell: &AtomicU64) -> u64 {
    cell.load(Ordering::Acquire)
}

/// Release store of a version tag.
#[inline(always)]
pub fn store_version(cell: &AtomicU64, value: u64) {
    cell.store(value, Ordering::Release)
}

/// Fetch-or on a machine word (breaker bits), acquire/release.
#[inline(always)]
pub fn or_word(cell: &AtomicUsize, bits: usize) -> usize {
    cell.fetch_or(bits, Ordering::AcqRel)
}

/// Fetch-and on a machine word (breaker bits), acquire/release.
#[inline(always)]
pub fn and_word(cell: &AtomicUsize, bits: usize) -> usize {
    cell.fetch_and(bits, Ordering::AcqRel)
}

/// Returns the current thread's VM identity. Non-zero; zero is reserved
/// for "shared / no owner" in object headers.
#[inline]
pub fn thread_id() -> u64 {
    use core::sync::atomic::AtomicU64 as Cell;
    static NEXT: Cell = Cell::new(1);
    thread_local! {
        static TID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    TID.with(|t| *t)
}
