//! Allocator façade
//!
//! Four logical heaps back the runtime: `raw` (untyped scratch), `mem`
//! (interior buffers), `obj` (object payloads) and `gc` (payloads that
//! participate in cycle collection). Allocation happens on the owning
//! thread. A free issued from a foreign thread is routed to the owning
//! thread's inbox — an intrusive lock-free MPSC stack whose nodes are
//! the freed blocks themselves — and drained at the owner's next
//! allocation or safe point.
//!
//! A process-wide policy selects between the default allocator and a
//! debug wrapper that adds red-zone bytes and a serial number to every
//! block.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicPtr, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::object::{Obj, ObjectHeader};

/// Logical heap domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Domain {
    /// Untyped scratch memory.
    Raw = 0,
    /// Interior buffers (keys blocks, register stacks).
    Mem = 1,
    /// Object payloads outside the collector.
    Obj = 2,
    /// Object payloads tracked by the collector.
    Gc = 3,
}

/// Process-wide allocator policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AllocPolicy {
    /// Plain system allocation.
    Default = 0,
    /// Red zones, size prefix and serial numbers on every block.
    Debug = 1,
}

static POLICY: AtomicU8 = AtomicU8::new(AllocPolicy::Default as u8);
static SERIAL: AtomicU64 = AtomicU64::new(1);

/// One allocator event forwarded to an observability hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocEvent {
    /// A block was handed out.
    Alloc {
        /// Heap domain of the block.
        domain: Domain,
        /// Requested size in bytes.
        size: usize,
    },
    /// A block was returned (directly or through a remote inbox).
    Free {
        /// Size in bytes.
        size: usize,
    },
}

/// Allocation-event observer (tracemalloc-style instrumentation).
pub type AllocHook = fn(AllocEvent);

static ALLOC_HOOK: std::sync::OnceLock<AllocHook> = std::sync::OnceLock::new();

/// Install a process-wide allocation observer. First caller wins; the
/// hook must be async-signal-tolerant and must not allocate through the
/// observed heaps.
pub fn set_alloc_hook(hook: AllocHook) -> bool {
    ALLOC_HOOK.set(hook).is_ok()
}

#[inline(always)]
fn forward(event: AllocEvent) {
    if let Some(hook) = ALLOC_HOOK.get() {
        hook(event);
    }
}

/// Select the process-wide allocator policy. Must happen before any
/// allocation; later calls are ignored with a warning.
pub fn set_policy(policy: AllocPolicy) {
    let prev = POLICY.swap(policy as u8, Ordering::Relaxed);
    if prev != policy as u8 {
        tracing::debug!(target: "quill::heap", ?policy, "allocator policy set");
    }
}

fn policy() -> AllocPolicy {
    match POLICY.load(Ordering::Relaxed) {
        1 => AllocPolicy::Debug,
        _ => AllocPolicy::Default,
    }
}

const RED_ZONE: usize = 16;
const RED_BYTE: u8 = 0xfb;

/// Debug prefix placed in front of guarded blocks.
#[repr(C)]
struct DebugHead {
    size: usize,
    serial: u64,
}

/// An entry in a remote-free inbox. Lives inside the freed block.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
    layout: Layout,
}

/// MPSC inbox of blocks freed by foreign threads.
pub struct RemoteInbox {
    head: AtomicPtr<FreeNode>,
}

impl RemoteInbox {
    fn new() -> RemoteInbox {
        RemoteInbox {
            head: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Push a block. Any thread.
    fn push(&self, ptr: *mut u8, layout: Layout) {
        debug_assert!(layout.size() >= core::mem::size_of::<FreeNode>());
        let node = ptr as *mut FreeNode;
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                node.write(FreeNode { next: head, layout });
            }
            if self
                .head
                .compare_exchange(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Take the whole stack. Owning thread only.
    fn take_all(&self) -> *mut FreeNode {
        self.head.swap(core::ptr::null_mut(), Ordering::AcqRel)
    }
}

/// tid → inbox registry. Threads register on creation and unregister on
/// teardown, draining their own inbox first.
fn registry() -> &'static Mutex<HashMap<u64, Arc<RemoteInbox>>> {
    use std::sync::OnceLock;
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Arc<RemoteInbox>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Per-domain allocation statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeapStats {
    /// Blocks allocated over the heap lifetime.
    pub allocated: u64,
    /// Blocks freed directly by the owner.
    pub freed: u64,
    /// Blocks freed for this heap by foreign threads.
    pub remote_freed: u64,
}

/// The four per-thread heaps.
pub struct ThreadHeaps {
    tid: u64,
    stats: [HeapStats; 4],
    inbox: Arc<RemoteInbox>,
    /// Allocations between inbox drains.
    pulse: u32,
}

impl ThreadHeaps {
    /// Create and register the heaps of thread `tid`.
    pub fn new(tid: u64) -> ThreadHeaps {
        let inbox = Arc::new(RemoteInbox::new());
        registry().lock().unwrap().insert(tid, Arc::clone(&inbox));
        ThreadHeaps {
            tid,
            stats: [HeapStats::default(); 4],
            inbox,
            pulse: 0,
        }
    }

    /// Statistics for one domain.
    pub fn stats(&self, domain: Domain) -> HeapStats {
        self.stats[domain as usize]
    }

    /// Allocate from a domain. Aborts on exhaustion like the system
    /// allocator.
    pub fn alloc(&mut self, domain: Domain, layout: Layout) -> NonNull<u8> {
        self.pulse = self.pulse.wrapping_add(1);
        if self.pulse % 64 == 0 {
            self.drain_remote();
        }
        self.stats[domain as usize].allocated += 1;
        forward(AllocEvent::Alloc {
            domain,
            size: layout.size(),
        });
        let ptr = match policy() {
            AllocPolicy::Default => unsafe { std::alloc::alloc(layout) },
            AllocPolicy::Debug => unsafe { debug_alloc(layout) },
        };
        match NonNull::new(ptr) {
            Some(p) => p,
            None => std::alloc::handle_alloc_error(layout),
        }
    }

    /// Free a block owned by this thread.
    pub fn free(&mut self, domain: Domain, ptr: NonNull<u8>, layout: Layout) {
        self.stats[domain as usize].freed += 1;
        unsafe { free_now(ptr.as_ptr(), layout) };
    }

    /// Drain the remote inbox, freeing every block foreign threads have
    /// returned to us.
    pub fn drain_remote(&mut self) {
        let mut node = self.inbox.take_all();
        let mut drained = 0u64;
        while !node.is_null() {
            let FreeNode { next, layout } = unsafe { node.read() };
            unsafe { free_now(node as *mut u8, layout) };
            node = next;
            drained += 1;
        }
        if drained > 0 {
            self.stats[Domain::Obj as usize].remote_freed += drained;
            tracing::trace!(target: "quill::heap", drained, "remote inbox drained");
        }
    }
}

impl Drop for ThreadHeaps {
    fn drop(&mut self) {
        self.drain_remote();
        registry().lock().unwrap().remove(&self.tid);
    }
}

unsafe fn debug_alloc(layout: Layout) -> *mut u8 {
    let (outer, offset) = debug_layout(layout);
    let base = std::alloc::alloc(outer);
    if base.is_null() {
        return base;
    }
    let head = base as *mut DebugHead;
    head.write(DebugHead {
        size: layout.size(),
        serial: SERIAL.fetch_add(1, Ordering::Relaxed),
    });
    let user = base.add(offset);
    core::ptr::write_bytes(user.add(layout.size()), RED_BYTE, RED_ZONE);
    user
}

unsafe fn debug_free(user: *mut u8, layout: Layout) {
    let (outer, offset) = debug_layout(layout);
    let base = user.sub(offset);
    let head = &*(base as *const DebugHead);
    assert_eq!(head.size, layout.size(), "debug heap: size mismatch on free");
    for i in 0..RED_ZONE {
        assert_eq!(
            *user.add(layout.size() + i),
            RED_BYTE,
            "debug heap: red zone clobbered (serial {})",
            head.serial
        );
    }
    std::alloc::dealloc(base, outer);
}

fn debug_layout(layout: Layout) -> (Layout, usize) {
    let head = Layout::new::<DebugHead>();
    let (with_head, offset) = head.extend(layout).expect("layout overflow");
    let outer = Layout::from_size_align(with_head.size() + RED_ZONE, with_head.align())
        .expect("layout overflow")
        .pad_to_align();
    (outer, offset)
}

unsafe fn free_now(ptr: *mut u8, layout: Layout) {
    forward(AllocEvent::Free {
        size: layout.size(),
    });
    match policy() {
        AllocPolicy::Default => std::alloc::dealloc(ptr, layout),
        AllocPolicy::Debug => debug_free(ptr, layout),
    }
}

/// Free a block whose owner may be another thread. `owner_tid` is the
/// owning thread recorded at allocation (0 = unowned: free directly).
///
/// # Safety
/// `ptr` must be a live allocation of `layout` from [`ThreadHeaps::alloc`].
pub unsafe fn free_routed(owner_tid: u64, ptr: *mut u8, layout: Layout) {
    if owner_tid == 0 || owner_tid == crate::raw::thread_id() {
        free_now(ptr, layout);
        return;
    }
    let inbox = registry().lock().unwrap().get(&owner_tid).cloned();
    match inbox {
        Some(inbox) if layout.size() >= core::mem::size_of::<FreeNode>() => {
            inbox.push(ptr, layout)
        }
        // Owner already gone, or the block is too small to carry a
        // free-list node: free in place.
        _ => free_now(ptr, layout),
    }
}

/// Allocate an object payload and move `value` into it.
pub(crate) fn alloc_value<T>(heaps: &mut ThreadHeaps, domain: Domain, value: T) -> NonNull<T> {
    let ptr = heaps.alloc(domain, Layout::new::<T>()).cast::<T>();
    unsafe { ptr.as_ptr().write(value) };
    ptr
}

/// Drop an object payload in place and release its memory, routing the
/// free to the owning thread when necessary.
///
/// # Safety
/// `obj` must be a dead object allocated as a `T`.
pub(crate) unsafe fn free_object<T>(obj: Obj) {
    let owner = (*(obj.as_ptr() as *const ObjectHeader))
        .tid
        .load(Ordering::Relaxed);
    let ptr = obj.as_ptr() as *mut T;
    core::ptr::drop_in_place(ptr);
    free_routed(owner, ptr as *mut u8, Layout::new::<T>());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let mut heaps = ThreadHeaps::new(crate::raw::thread_id());
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = heaps.alloc(Domain::Mem, layout);
        unsafe { core::ptr::write_bytes(p.as_ptr(), 0xa5, 64) };
        heaps.free(Domain::Mem, p, layout);
        assert_eq!(heaps.stats(Domain::Mem).allocated, 1);
        assert_eq!(heaps.stats(Domain::Mem).freed, 1);
    }

    #[test]
    fn remote_free_routes_through_inbox() {
        let tid = crate::raw::thread_id();
        let mut heaps = ThreadHeaps::new(tid);
        let layout = Layout::from_size_align(64, 8).unwrap();
        let p = heaps.alloc(Domain::Obj, layout);
        let addr = p.as_ptr() as usize;

        std::thread::spawn(move || unsafe {
            free_routed(tid, addr as *mut u8, layout);
        })
        .join()
        .unwrap();

        heaps.drain_remote();
        assert_eq!(heaps.stats(Domain::Obj).remote_freed, 1);
    }
}
