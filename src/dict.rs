//! Concurrent insertion-ordered mapping
//!
//! The canonical name→value mapping: module globals, instance and type
//! namespaces, and the user-visible dict. Reads of interned-string keys
//! are lock-free against a published *keys block*; every write runs
//! under the mapping's own lock (a critical section, so it releases
//! across suspension points such as user `__eq__` calls).
//!
//! A keys block is a power-of-two open-addressed table probed in groups
//! of eight control bytes. Each control byte is `EMPTY`, `DELETED`, or
//! the low seven bits of the hash. A side array records insertion order,
//! with its element width narrowed to the capacity. Blocks whose keys
//! are all interned strings (`Unicode`) compare by identity; inserting
//! any other key rebuilds the block as `General`, which carries a
//! parallel hash array and compares under the lock.
//!
//! Replaced blocks are retired through QSBR: a reader either sees the
//! old complete block or the new complete block, and revalidates the
//! version tag before trusting a result.

use core::alloc::Layout;
use core::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use crate::consts::{DICT_MIN_CAPACITY, DICT_USABLE_DEN, DICT_USABLE_NUM};
use crate::error::{ExcKind, ExecResult};
use crate::heap::Domain;
use crate::object::{string, IterNext, Obj, ObjectHeader, ObjRef, TypeSlots};
use crate::rc;
use crate::thread::ThreadState;

/// Control byte: slot never used.
pub const CTRL_EMPTY: u8 = 0xff;
/// Control byte: slot held a key that was deleted.
pub const CTRL_DELETED: u8 = 0x80;

const GROUP: usize = 8;

/// Finalizing mix (murmur-style) applied to non-string hashes so the
/// top bits used for the control tag are well distributed.
pub fn mix_hash(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    if h == 0 {
        1
    } else {
        h
    }
}

#[inline(always)]
fn ctrl_tag(hash: u64) -> u8 {
    ((hash >> 57) & 0x7f) as u8
}

#[inline(always)]
fn repeat(byte: u8) -> u64 {
    (byte as u64).wrapping_mul(0x0101_0101_0101_0101)
}

/// High bit set in every lane whose byte equals `byte`.
#[inline(always)]
fn match_lanes(word: u64, byte: u8) -> u64 {
    let x = word ^ repeat(byte);
    x.wrapping_sub(repeat(0x01)) & !x & repeat(0x80)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum KeysKind {
    /// All keys are interned strings; identity compare suffices.
    Unicode = 0,
    /// Arbitrary hashable keys; compares run under the lock.
    General = 1,
}

struct DictEntry {
    key: AtomicPtr<ObjectHeader>,
    value: AtomicPtr<ObjectHeader>,
}

/// Insertion-order side index, width-narrowed per capacity.
enum OrderIndex {
    U8(Box<[AtomicU8]>),
    U16(Box<[core::sync::atomic::AtomicU16]>),
    U32(Box<[AtomicU32]>),
    Usize(Box<[AtomicUsize]>),
}

impl OrderIndex {
    fn new(capacity: usize) -> OrderIndex {
        if capacity <= u8::MAX as usize {
            OrderIndex::U8((0..capacity).map(|_| AtomicU8::new(0)).collect())
        } else if capacity <= u16::MAX as usize {
            OrderIndex::U16(
                (0..capacity)
                    .map(|_| core::sync::atomic::AtomicU16::new(0))
                    .collect(),
            )
        } else if capacity <= u32::MAX as usize {
            OrderIndex::U32((0..capacity).map(|_| AtomicU32::new(0)).collect())
        } else {
            OrderIndex::Usize((0..capacity).map(|_| AtomicUsize::new(0)).collect())
        }
    }

    #[inline]
    fn get(&self, pos: usize) -> usize {
        match self {
            OrderIndex::U8(a) => a[pos].load(Ordering::Relaxed) as usize,
            OrderIndex::U16(a) => a[pos].load(Ordering::Relaxed) as usize,
            OrderIndex::U32(a) => a[pos].load(Ordering::Relaxed) as usize,
            OrderIndex::Usize(a) => a[pos].load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn set(&self, pos: usize, slot: usize) {
        match self {
            OrderIndex::U8(a) => a[pos].store(slot as u8, Ordering::Relaxed),
            OrderIndex::U16(a) => a[pos].store(slot as u16, Ordering::Relaxed),
            OrderIndex::U32(a) => a[pos].store(slot as u32, Ordering::Relaxed),
            OrderIndex::Usize(a) => a[pos].store(slot, Ordering::Relaxed),
        }
    }
}

pub(crate) struct DictKeys {
    kind: AtomicU8,
    /// Power-of-two slot count.
    capacity: usize,
    /// Insertions left before the next write forces a resize.
    usable: AtomicU32,
    /// Order positions handed out (live plus deleted).
    nentries: AtomicU32,
    /// One word per eight control bytes.
    ctrl: Box<[AtomicU64]>,
    entries: Box<[DictEntry]>,
    order: OrderIndex,
    /// Parallel hashes; present only on `General` blocks.
    hashes: Option<Box<[AtomicU64]>>,
    /// Thread whose heap allocated this block.
    owner: u64,
}

impl DictKeys {
    fn kind(&self) -> KeysKind {
        if self.kind.load(Ordering::Relaxed) == 0 {
            KeysKind::Unicode
        } else {
            KeysKind::General
        }
    }

    fn mask(&self) -> usize {
        self.capacity - 1
    }

    fn groups(&self) -> usize {
        self.capacity / GROUP
    }

    #[inline]
    fn ctrl_byte(&self, slot: usize) -> u8 {
        let word = self.ctrl[slot / GROUP].load(Ordering::Acquire);
        word.to_le_bytes()[slot % GROUP]
    }

    fn set_ctrl(&self, slot: usize, byte: u8) {
        let cell = &self.ctrl[slot / GROUP];
        let mut bytes = cell.load(Ordering::Relaxed).to_le_bytes();
        bytes[slot % GROUP] = byte;
        cell.store(u64::from_le_bytes(bytes), Ordering::Release);
    }

    /// Hash of the key in `slot`; unicode blocks read the string's
    /// cached hash, general blocks the parallel array.
    fn slot_hash(&self, slot: usize) -> u64 {
        match &self.hashes {
            Some(hashes) => hashes[slot].load(Ordering::Relaxed),
            None => {
                let key = self.entries[slot].key.load(Ordering::Acquire);
                debug_assert!(!key.is_null());
                string::cached_hash(unsafe { Obj::from_ptr(key) })
            }
        }
    }
}

fn alloc_keys(ts: &mut ThreadState, capacity: usize, kind: KeysKind) -> *mut DictKeys {
    debug_assert!(capacity.is_power_of_two() && capacity >= DICT_MIN_CAPACITY);
    let keys = DictKeys {
        kind: AtomicU8::new(kind as u8),
        capacity,
        usable: AtomicU32::new((capacity * DICT_USABLE_NUM / DICT_USABLE_DEN) as u32),
        nentries: AtomicU32::new(0),
        ctrl: (0..capacity / GROUP)
            .map(|_| AtomicU64::new(repeat(CTRL_EMPTY)))
            .collect(),
        entries: (0..capacity)
            .map(|_| DictEntry {
                key: AtomicPtr::new(core::ptr::null_mut()),
                value: AtomicPtr::new(core::ptr::null_mut()),
            })
            .collect(),
        order: OrderIndex::new(capacity),
        hashes: match kind {
            KeysKind::Unicode => None,
            KeysKind::General => Some((0..capacity).map(|_| AtomicU64::new(0)).collect()),
        },
        owner: ts.id(),
    };
    crate::heap::alloc_value(&mut ts.heaps, Domain::Mem, keys).as_ptr()
}

/// Free a keys block without touching the references its entries held.
unsafe fn free_keys_memory(keys: *mut DictKeys) {
    let owner = (*keys).owner;
    core::ptr::drop_in_place(keys);
    crate::heap::free_routed(owner, keys as *mut u8, Layout::new::<DictKeys>());
}

/// Free a keys block and drop the references its live entries own.
unsafe fn free_keys_and_contents(keys: *mut DictKeys) {
    for entry in (*keys).entries.iter() {
        let key = entry.key.load(Ordering::Relaxed);
        if !key.is_null() {
            rc::decref(Obj::from_ptr(key));
        }
        let value = entry.value.load(Ordering::Relaxed);
        if !value.is_null() {
            rc::decref(Obj::from_ptr(value));
        }
    }
    free_keys_memory(keys);
}

struct SendKeys(*mut DictKeys);
unsafe impl Send for SendKeys {}

/* THE MAPPING OBJECT */

#[repr(C)]
pub struct DictObject {
    base: ObjectHeader,
    used: AtomicUsize,
    version: AtomicU64,
    keys: AtomicPtr<DictKeys>,
}

/// Allocate an empty mapping.
pub fn new(ts: &mut ThreadState) -> ObjRef {
    let keys = alloc_keys(ts, DICT_MIN_CAPACITY, KeysKind::Unicode);
    let ty = ts.rt().types.dict;
    let version = ts.next_version();
    ts.alloc_gc(DictObject {
        base: ObjectHeader::new(ty, ts.id()),
        used: AtomicUsize::new(0),
        version: AtomicU64::new(version),
        keys: AtomicPtr::new(keys),
    })
}

fn payload(obj: Obj) -> &'static DictObject {
    unsafe { obj.payload() }
}

/// Live entry count.
pub fn len(obj: Obj) -> usize {
    payload(obj).used.load(Ordering::Acquire)
}

/// Current version tag.
pub fn version(obj: Obj) -> u64 {
    crate::raw::load_version(&payload(obj).version)
}

fn bump_version(ts: &mut ThreadState, d: &DictObject) -> u64 {
    // Tags must stay strictly increasing per mapping even though they
    // are allocated in thread-local batches.
    let allocated = ts.next_version();
    let current = crate::raw::load_version(&d.version);
    let next = allocated.max(current + 1);
    crate::raw::store_version(&d.version, next);
    next
}

/// Outcome of a key probe under the lock.
enum Found {
    At(usize),
    Missing,
    /// The block changed under a suspension; restart.
    Moved,
}

/// Hash a key object. Strings use their cached hash; everything else
/// dispatches the type's hash slot and mixes the result.
pub fn hash_key(ts: &mut ThreadState, key: Obj) -> ExecResult<u64> {
    if key.is_exact(ts.rt().types.str_) {
        return Ok(string::cached_hash(key));
    }
    match key.type_of().slots.hash {
        Some(f) => Ok(mix_hash(f(ts, key)?)),
        None => {
            let name = key.type_of().name().to_owned();
            Err(ts.raise(ExcKind::TypeError, format!("unhashable type: '{name}'")))
        }
    }
}

/* LOCK-FREE READ PATH */

enum FastGet {
    Hit(ObjRef),
    Missing,
    /// Not eligible (general block or non-interned key): take the lock.
    Fallback,
}

fn get_interned(dict: Obj, key: Obj) -> FastGet {
    let d = payload(dict);
    'retry: loop {
        let version = crate::raw::load_version(&d.version);
        let keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
        let keys = unsafe { &*keys_ptr };
        if keys.kind() != KeysKind::Unicode {
            return FastGet::Fallback;
        }
        let hash = string::cached_hash(key);
        let tag = ctrl_tag(hash);
        let groups = keys.groups();
        let mut group = (hash as usize & keys.mask()) / GROUP;
        for _ in 0..groups {
            let word = keys.ctrl[group].load(Ordering::Acquire);
            let mut lanes = match_lanes(word, tag);
            while lanes != 0 {
                let lane = lanes.trailing_zeros() as usize / 8;
                lanes &= lanes - 1;
                let slot = group * GROUP + lane;
                let entry = &keys.entries[slot];
                if entry.key.load(Ordering::Acquire) != key.as_ptr() {
                    continue;
                }
                // Candidate hit: acquire the value, then revalidate.
                loop {
                    let value_ptr = crate::raw::load_ptr_acquire(&entry.value);
                    if value_ptr.is_null() {
                        continue 'retry;
                    }
                    let value = unsafe { Obj::from_ptr(value_ptr) };
                    if !rc::try_acquire(&entry.value, value) {
                        continue;
                    }
                    let acquired = unsafe { ObjRef::from_raw(value) };
                    if crate::raw::load_version(&d.version) != version {
                        drop(acquired);
                        continue 'retry;
                    }
                    return FastGet::Hit(acquired);
                }
            }
            if match_lanes(word, CTRL_EMPTY) != 0 {
                if crate::raw::load_version(&d.version) != version {
                    continue 'retry;
                }
                return FastGet::Missing;
            }
            group = (group + 1) % groups;
        }
        // Table with no empty slot in any probed group; fall back.
        return FastGet::Fallback;
    }
}

/// Look a key up, locking only when the fast path does not apply.
pub fn get(ts: &mut ThreadState, dict: Obj, key: Obj) -> ExecResult<Option<ObjRef>> {
    if key.is_exact(ts.rt().types.str_) && string::is_interned(key) {
        match get_interned(dict, key) {
            FastGet::Hit(v) => return Ok(Some(v)),
            FastGet::Missing => return Ok(None),
            FastGet::Fallback => {}
        }
    }
    let hash = hash_key(ts, key)?;
    let d = payload(dict);
    let id = ts.sections.begin(dict.mutex());
    let result = loop {
        let keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
        match probe_locked(ts, dict, keys_ptr, key, hash)? {
            Found::At(slot) => {
                let keys = unsafe { &*keys_ptr };
                break rc::fetch_ref(&keys.entries[slot].value);
            }
            Found::Missing => break None,
            Found::Moved => continue,
        }
    };
    ts.sections.end(id);
    Ok(result)
}

/// Probe for `key` with the lock held. Comparisons may suspend; the
/// caller restarts on [`Found::Moved`].
fn probe_locked(
    ts: &mut ThreadState,
    dict: Obj,
    keys_ptr: *mut DictKeys,
    key: Obj,
    hash: u64,
) -> ExecResult<Found> {
    let d = payload(dict);
    let keys = unsafe { &*keys_ptr };
    let tag = ctrl_tag(hash);
    let groups = keys.groups();
    let mut group = (hash as usize & keys.mask()) / GROUP;
    for _ in 0..groups {
        let word = keys.ctrl[group].load(Ordering::Acquire);
        let mut lanes = match_lanes(word, tag);
        while lanes != 0 {
            let lane = lanes.trailing_zeros() as usize / 8;
            lanes &= lanes - 1;
            let slot = group * GROUP + lane;
            let entry_key = keys.entries[slot].key.load(Ordering::Acquire);
            if entry_key.is_null() {
                continue;
            }
            let entry_key = unsafe { Obj::from_ptr(entry_key) };
            if entry_key == key {
                return Ok(Found::At(slot));
            }
            if keys.slot_hash(slot) == hash {
                let version = crate::raw::load_version(&d.version);
                let equal = crate::interpreter::arith::eq_bool(ts, entry_key, key)?;
                // The compare may have suspended and released our lock;
                // anything may have happened to the block.
                if crate::raw::load_ptr_acquire(&d.keys) != keys_ptr
                    || crate::raw::load_version(&d.version) != version
                {
                    return Ok(Found::Moved);
                }
                if equal {
                    return Ok(Found::At(slot));
                }
            }
        }
        if match_lanes(word, CTRL_EMPTY) != 0 {
            return Ok(Found::Missing);
        }
        group = (group + 1) % groups;
    }
    Ok(Found::Missing)
}

/* WRITE PATH */

/// Insert or replace `key → value`.
pub fn set(ts: &mut ThreadState, dict: Obj, key: Obj, value: Obj) -> ExecResult<()> {
    let hash = hash_key(ts, key)?;
    let key_is_interned = key.is_exact(ts.rt().types.str_) && string::is_interned(key);
    let d = payload(dict);
    let id = ts.sections.begin(dict.mutex());
    let replaced = loop {
        let mut keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
        // A non-interned key demotes the block to the general layout.
        if !key_is_interned && unsafe { (*keys_ptr).kind() } == KeysKind::Unicode {
            keys_ptr = rebuild(ts, dict, keys_ptr, true, KeysKind::General);
        }
        match probe_locked(ts, dict, keys_ptr, key, hash)? {
            Found::At(slot) => {
                let keys = unsafe { &*keys_ptr };
                rc::incref(value);
                let old = keys.entries[slot].value.swap(value.as_ptr(), Ordering::AcqRel);
                bump_version(ts, d);
                break (!old.is_null()).then(|| unsafe { Obj::from_ptr(old) });
            }
            Found::Missing => {
                let keys = unsafe { &*keys_ptr };
                if keys.usable.load(Ordering::Relaxed) == 0 {
                    rebuild(ts, dict, keys_ptr, true, keys.kind());
                    continue;
                }
                insert_fresh(keys, key, value, hash);
                d.used.fetch_add(1, Ordering::AcqRel);
                bump_version(ts, d);
                break None;
            }
            Found::Moved => continue,
        }
    };
    ts.sections.end(id);
    if let Some(old) = replaced {
        rc::decref(old);
    }
    Ok(())
}

/// Write a key into a block with at least one usable slot. Lock held;
/// the key must be absent.
fn insert_fresh(keys: &DictKeys, key: Obj, value: Obj, hash: u64) {
    let tag = ctrl_tag(hash);
    let groups = keys.groups();
    let mut group = (hash as usize & keys.mask()) / GROUP;
    loop {
        let word = keys.ctrl[group].load(Ordering::Relaxed);
        let empties = match_lanes(word, CTRL_EMPTY) | match_lanes(word, CTRL_DELETED);
        if empties != 0 {
            let lane = empties.trailing_zeros() as usize / 8;
            let slot = group * GROUP + lane;
            rc::incref(key);
            rc::incref(value);
            if let Some(hashes) = &keys.hashes {
                hashes[slot].store(hash, Ordering::Relaxed);
            }
            // Publish value before key before ctrl: a reader that sees
            // the ctrl tag finds a complete entry.
            keys.entries[slot].value.store(value.as_ptr(), Ordering::Release);
            keys.entries[slot].key.store(key.as_ptr(), Ordering::Release);
            keys.set_ctrl(slot, tag);
            let pos = keys.nentries.fetch_add(1, Ordering::Relaxed) as usize;
            keys.order.set(pos, slot);
            keys.usable.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        group = (group + 1) % groups;
    }
}

/// Remove `key`. Returns whether it was present.
pub fn delete(ts: &mut ThreadState, dict: Obj, key: Obj) -> ExecResult<bool> {
    let hash = hash_key(ts, key)?;
    let d = payload(dict);
    let id = ts.sections.begin(dict.mutex());
    let removed = loop {
        let keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
        match probe_locked(ts, dict, keys_ptr, key, hash)? {
            Found::At(slot) => {
                let keys = unsafe { &*keys_ptr };
                let old_key = keys.entries[slot].key.swap(core::ptr::null_mut(), Ordering::AcqRel);
                let old_value =
                    keys.entries[slot].value.swap(core::ptr::null_mut(), Ordering::AcqRel);
                keys.set_ctrl(slot, CTRL_DELETED);
                d.used.fetch_sub(1, Ordering::AcqRel);
                bump_version(ts, d);
                break Some((old_key, old_value));
            }
            Found::Missing => break None,
            Found::Moved => continue,
        }
    };
    ts.sections.end(id);
    match removed {
        Some((k, v)) => {
            unsafe {
                if !k.is_null() {
                    rc::decref(Obj::from_ptr(k));
                }
                if !v.is_null() {
                    rc::decref(Obj::from_ptr(v));
                }
            }
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Replace the keys block: double the capacity on growth, same capacity
/// for compaction or layout promotion. Returns the new block. Lock held.
fn rebuild(
    ts: &mut ThreadState,
    dict: Obj,
    old_ptr: *mut DictKeys,
    grow: bool,
    kind: KeysKind,
) -> *mut DictKeys {
    let d = payload(dict);
    let old = unsafe { &*old_ptr };
    let live = d.used.load(Ordering::Relaxed);
    let new_capacity = if grow && live * DICT_USABLE_DEN >= old.capacity * DICT_USABLE_NUM {
        old.capacity * 2
    } else {
        old.capacity
    };
    tracing::trace!(
        target: "quill::dict",
        capacity = new_capacity,
        live,
        ?kind,
        "keys block rebuilt"
    );
    let new_ptr = alloc_keys(ts, new_capacity, kind);
    let new = unsafe { &*new_ptr };
    // Re-insert in insertion order; references transfer to the new
    // block, so retiring the old one frees memory only.
    let nentries = old.nentries.load(Ordering::Relaxed) as usize;
    for pos in 0..nentries {
        let slot = old.order.get(pos);
        let key_ptr = old.entries[slot].key.swap(core::ptr::null_mut(), Ordering::AcqRel);
        if key_ptr.is_null() {
            continue;
        }
        let value_ptr = old.entries[slot].value.swap(core::ptr::null_mut(), Ordering::AcqRel);
        let key = unsafe { Obj::from_ptr(key_ptr) };
        let hash = match &old.hashes {
            Some(hashes) => hashes[slot].load(Ordering::Relaxed),
            None => string::cached_hash(key),
        };
        transfer_entry(new, key_ptr, value_ptr, hash);
    }
    crate::raw::store_ptr_release(&d.keys, new_ptr);
    bump_version(ts, d);
    let retired = SendKeys(old_ptr);
    let rt = ts.runtime();
    ts.retired
        .retire(&rt.qsbr, Box::new(move || unsafe { let retired = retired; free_keys_memory(retired.0) }));
    new_ptr
}

/// Move an already-owned entry into a fresh block.
fn transfer_entry(keys: &DictKeys, key: *mut ObjectHeader, value: *mut ObjectHeader, hash: u64) {
    let tag = ctrl_tag(hash);
    let groups = keys.groups();
    let mut group = (hash as usize & keys.mask()) / GROUP;
    loop {
        let word = keys.ctrl[group].load(Ordering::Relaxed);
        let empties = match_lanes(word, CTRL_EMPTY);
        if empties != 0 {
            let lane = empties.trailing_zeros() as usize / 8;
            let slot = group * GROUP + lane;
            if let Some(hashes) = &keys.hashes {
                hashes[slot].store(hash, Ordering::Relaxed);
            }
            keys.entries[slot].value.store(value, Ordering::Release);
            keys.entries[slot].key.store(key, Ordering::Release);
            keys.set_ctrl(slot, tag);
            let pos = keys.nentries.fetch_add(1, Ordering::Relaxed) as usize;
            keys.order.set(pos, slot);
            keys.usable.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        group = (group + 1) % groups;
    }
}

/* SLOT-INDEXED ACCESS (inline caches) */

/// Result of a cacheable global lookup.
pub struct SlotLookup {
    /// Version tag observed during the probe.
    pub version: u64,
    /// Slot holding the key, or -1 when absent at `version`.
    pub slot: i32,
    /// The value, when present.
    pub value: Option<ObjRef>,
}

/// Lock-free probe of an interned key that also reports the slot index
/// for the evaluator's inline cache.
pub fn lookup_interned_slot(dict: Obj, key: Obj) -> Option<SlotLookup> {
    let d = payload(dict);
    'retry: loop {
        let version = crate::raw::load_version(&d.version);
        let keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
        let keys = unsafe { &*keys_ptr };
        if keys.kind() != KeysKind::Unicode {
            return None;
        }
        let hash = string::cached_hash(key);
        let tag = ctrl_tag(hash);
        let groups = keys.groups();
        let mut group = (hash as usize & keys.mask()) / GROUP;
        for _ in 0..groups {
            let word = keys.ctrl[group].load(Ordering::Acquire);
            let mut lanes = match_lanes(word, tag);
            while lanes != 0 {
                let lane = lanes.trailing_zeros() as usize / 8;
                lanes &= lanes - 1;
                let slot = group * GROUP + lane;
                let entry = &keys.entries[slot];
                if entry.key.load(Ordering::Acquire) != key.as_ptr() {
                    continue;
                }
                match rc::fetch_ref(&entry.value) {
                    Some(value) => {
                        if crate::raw::load_version(&d.version) != version {
                            continue 'retry;
                        }
                        return Some(SlotLookup {
                            version,
                            slot: slot as i32,
                            value: Some(value),
                        });
                    }
                    None => continue 'retry,
                }
            }
            if match_lanes(word, CTRL_EMPTY) != 0 {
                if crate::raw::load_version(&d.version) != version {
                    continue 'retry;
                }
                return Some(SlotLookup {
                    version,
                    slot: -1,
                    value: None,
                });
            }
            group = (group + 1) % groups;
        }
        return None;
    }
}

/// Re-read a cached slot, valid only while the version still matches.
pub fn load_slot(dict: Obj, slot: u32, version: u64) -> Option<ObjRef> {
    let d = payload(dict);
    if crate::raw::load_version(&d.version) != version {
        return None;
    }
    let keys = unsafe { &*crate::raw::load_ptr_acquire(&d.keys) };
    let entry = keys.entries.get(slot as usize)?;
    let value = rc::fetch_ref(&entry.value)?;
    if crate::raw::load_version(&d.version) != version {
        return None;
    }
    Some(value)
}

/* ITERATION */

/// Keys in insertion order, snapshotted under the lock.
pub fn keys_ordered(ts: &mut ThreadState, dict: Obj) -> Vec<ObjRef> {
    let d = payload(dict);
    let id = ts.sections.begin(dict.mutex());
    let keys = unsafe { &*crate::raw::load_ptr_acquire(&d.keys) };
    let mut out = Vec::with_capacity(d.used.load(Ordering::Relaxed));
    for pos in 0..keys.nentries.load(Ordering::Relaxed) as usize {
        let slot = keys.order.get(pos);
        let key = keys.entries[slot].key.load(Ordering::Acquire);
        if !key.is_null() {
            out.push(ObjRef::new(unsafe { Obj::from_ptr(key) }));
        }
    }
    ts.sections.end(id);
    out
}

/// `(key, value)` pairs in insertion order, snapshotted under the lock.
pub fn items_ordered(ts: &mut ThreadState, dict: Obj) -> Vec<(ObjRef, ObjRef)> {
    let d = payload(dict);
    let id = ts.sections.begin(dict.mutex());
    let keys = unsafe { &*crate::raw::load_ptr_acquire(&d.keys) };
    let mut out = Vec::with_capacity(d.used.load(Ordering::Relaxed));
    for pos in 0..keys.nentries.load(Ordering::Relaxed) as usize {
        let slot = keys.order.get(pos);
        let key = keys.entries[slot].key.load(Ordering::Acquire);
        let value = keys.entries[slot].value.load(Ordering::Acquire);
        if !key.is_null() && !value.is_null() {
            out.push((
                ObjRef::new(unsafe { Obj::from_ptr(key) }),
                ObjRef::new(unsafe { Obj::from_ptr(value) }),
            ));
        }
    }
    ts.sections.end(id);
    out
}

/// Copy every entry of `src` into `dst` (DICT_UPDATE / DICT_MERGE).
pub fn update(ts: &mut ThreadState, dst: Obj, src: Obj) -> ExecResult<()> {
    for (key, value) in items_ordered(ts, src) {
        set(ts, dst, key.as_obj(), value.as_obj())?;
    }
    Ok(())
}

/* TYPE GLUE */

pub(crate) unsafe fn drop_obj(obj: Obj) {
    let d = payload(obj);
    let keys = d.keys.swap(core::ptr::null_mut(), Ordering::AcqRel);
    if !keys.is_null() {
        // The object is dead: no reader can hold the block.
        free_keys_and_contents(keys);
    }
    crate::heap::free_object::<DictObject>(obj);
}

fn dict_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let d = payload(obj);
    let keys_ptr = crate::raw::load_ptr_acquire(&d.keys);
    if keys_ptr.is_null() {
        return;
    }
    let keys = unsafe { &*keys_ptr };
    for entry in keys.entries.iter() {
        let key = entry.key.load(Ordering::Acquire);
        if !key.is_null() {
            visit(unsafe { Obj::from_ptr(key) });
        }
        let value = entry.value.load(Ordering::Acquire);
        if !value.is_null() {
            visit(unsafe { Obj::from_ptr(value) });
        }
    }
}

fn dict_subscr(ts: &mut ThreadState, obj: Obj, key: Obj) -> ExecResult<ObjRef> {
    match get(ts, obj, key)? {
        Some(value) => Ok(value),
        None => {
            let repr = describe_key(ts, key);
            Err(ts.raise(ExcKind::KeyError, repr))
        }
    }
}

fn dict_set_subscr(ts: &mut ThreadState, obj: Obj, key: Obj, value: Option<Obj>) -> ExecResult<()> {
    match value {
        Some(value) => set(ts, obj, key, value),
        None => {
            if delete(ts, obj, key)? {
                Ok(())
            } else {
                let repr = describe_key(ts, key);
                Err(ts.raise(ExcKind::KeyError, repr))
            }
        }
    }
}

fn describe_key(ts: &ThreadState, key: Obj) -> String {
    if key.is_exact(ts.rt().types.str_) {
        format!("'{}'", string::as_str(key))
    } else if key.is_exact(ts.rt().types.int) {
        format!("{}", crate::object::number::int_value(key))
    } else {
        format!("<{}>", key.type_of().name())
    }
}

fn dict_contains(ts: &mut ThreadState, obj: Obj, key: Obj) -> ExecResult<bool> {
    Ok(get(ts, obj, key)?.is_some())
}

fn dict_bool(_ts: &mut ThreadState, obj: Obj) -> ExecResult<bool> {
    Ok(len(obj) != 0)
}

fn dict_iter(ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    let ty = ts.rt().types.dict_iter;
    let captured = version(obj);
    Ok(ts.alloc_obj(DictIterObject {
        base: ObjectHeader::new(ty, ts.id()),
        dict: ObjRef::new(obj),
        version: captured,
        pos: AtomicUsize::new(0),
    }))
}

pub(crate) fn slots() -> TypeSlots {
    let mut number = crate::object::NumberMethods::EMPTY;
    number.bool_ = Some(dict_bool);
    TypeSlots {
        number,
        subscr: Some(dict_subscr),
        set_subscr: Some(dict_set_subscr),
        contains: Some(dict_contains),
        iter: Some(dict_iter),
        traverse: Some(dict_traverse),
        ..TypeSlots::EMPTY
    }
}

/* KEY ITERATOR */

#[repr(C)]
pub struct DictIterObject {
    base: ObjectHeader,
    dict: ObjRef,
    version: u64,
    pos: AtomicUsize,
}

pub(crate) unsafe fn drop_iter(obj: Obj) {
    crate::heap::free_object::<DictIterObject>(obj);
}

fn dict_iter_next(ts: &mut ThreadState, obj: Obj) -> ExecResult<IterNext> {
    let it: &DictIterObject = unsafe { obj.payload() };
    let dict = it.dict.as_obj();
    if version(dict) != it.version {
        return Err(ts.raise(
            ExcKind::RuntimeError,
            "dictionary changed size during iteration",
        ));
    }
    let d = payload(dict);
    let keys = unsafe { &*crate::raw::load_ptr_acquire(&d.keys) };
    let nentries = keys.nentries.load(Ordering::Relaxed) as usize;
    loop {
        let pos = it.pos.fetch_add(1, Ordering::Relaxed);
        if pos >= nentries {
            return Ok(IterNext::Done(None));
        }
        let slot = keys.order.get(pos);
        if let Some(key) = rc::fetch_ref(&keys.entries[slot].key) {
            return Ok(IterNext::Yield(key));
        }
    }
}

fn identity_iter(_ts: &mut ThreadState, obj: Obj) -> ExecResult<ObjRef> {
    Ok(ObjRef::new(obj))
}

pub(crate) fn iter_slots() -> TypeSlots {
    TypeSlots {
        iter: Some(identity_iter),
        iternext: Some(dict_iter_next),
        ..TypeSlots::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swar_match_finds_bytes() {
        let word = u64::from_le_bytes([0x11, 0x22, 0x11, CTRL_EMPTY, 0x00, 0x7f, 0x11, 0x22]);
        let lanes = match_lanes(word, 0x11);
        let mut found = Vec::new();
        let mut m = lanes;
        while m != 0 {
            found.push(m.trailing_zeros() as usize / 8);
            m &= m - 1;
        }
        assert_eq!(found, vec![0, 2, 6]);
        assert_ne!(match_lanes(word, CTRL_EMPTY), 0);
        assert_eq!(match_lanes(word, 0x33), 0);
    }

    #[test]
    fn mix_hash_never_zero() {
        for v in [0u64, 1, u64::MAX, 0xdead_beef] {
            assert_ne!(mix_hash(v), 0);
        }
    }

    #[test]
    fn ctrl_tag_is_seven_bits() {
        for h in [0u64, u64::MAX, 0x8000_0000_0000_0000] {
            assert!(ctrl_tag(h) <= 0x7f);
        }
    }
}
