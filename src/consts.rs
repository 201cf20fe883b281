//! VM parameters and frame layout

/* FRAME LAYOUT */

/// Number of reserved slots between the caller's temporaries and the
/// callee's base. The reserved region holds the frame delta, the frame
/// link, the materialized frame slot and the callee itself.
pub const FRAME_EXTRA: usize = 4;

/// Offset of the frame delta (distance to the caller's base), relative
/// to the frame base.
pub const FRAME_DELTA: isize = -4;

/// Offset of the frame link: the caller's resume program counter or a
/// sentinel ([`FRAME_C`], [`FRAME_GENERATOR`]).
pub const FRAME_LINK: isize = -3;

/// Offset of the lazily materialized frame snapshot, if any.
pub const FRAME_OBJ: isize = -2;

/// Offset of the callee (function object) of the frame.
pub const FRAME_CALLEE: isize = -1;

/// Frame-link sentinel: the frame was entered from native code and
/// returning must leave the evaluator.
pub const FRAME_C: i64 = -1;

/// Frame-link sentinel: the frame belongs to a generator thread-stack.
pub const FRAME_GENERATOR: i64 = -2;

/// Slot holding the unpacked `*args` iterable during extended call setup.
pub const CALLARGS_IDX: isize = -(FRAME_EXTRA as isize) - 2;

/// Slot holding the `**kwargs` mapping (or the keyword-name tuple for
/// plain keyword calls) during call setup.
pub const KWARGS_IDX: isize = -(FRAME_EXTRA as isize) - 1;

/* ACCUMULATOR CALL FLAGS */

/// Positional argument count mask of the accumulator on function entry.
pub const ACC_MASK_ARGS: i64 = 0xff;

/// Shift of the keyword argument count in the accumulator.
pub const ACC_SHIFT_KWARGS: i64 = 8;

/// Keyword argument count mask of the accumulator on function entry.
pub const ACC_MASK_KWARGS: i64 = 0xff << ACC_SHIFT_KWARGS;

/// The caller placed an `*args` iterable at [`CALLARGS_IDX`].
pub const ACC_FLAG_VARARGS: i64 = 1 << 16;

/// The caller placed a `**kwargs` mapping at [`KWARGS_IDX`].
pub const ACC_FLAG_VARKEYWORDS: i64 = 1 << 17;

/* REGISTER STACK */

/// Initial register stack size, in registers.
pub const STACK_INITIAL: usize = 256;

/// Register stack growth cap: 1 GiB of registers.
pub const STACK_MAX_BYTES: usize = 1024 * 1024 * 1024;

/// Maximum register stack size, in registers.
pub const STACK_MAX: usize = STACK_MAX_BYTES / core::mem::size_of::<u64>();

/// Headroom below the cap at which the recursion-depth check trips
/// instead of growing further.
pub const STACK_HEADROOM: usize = 4096;

/* MAPPING PARAMETERS */

/// Smallest keys-block capacity.
pub const DICT_MIN_CAPACITY: usize = 8;

/// Numerator of the usable-fraction of a keys block (7/8 of capacity).
pub const DICT_USABLE_NUM: usize = 7;

/// Denominator of the usable-fraction of a keys block.
pub const DICT_USABLE_DEN: usize = 8;

/// Per-thread version-tag bumps between global counter refills.
pub const VERSION_BATCH: u64 = 1024;

/* MRO CACHE */

/// Initial per-type cache capacity, in buckets.
pub const MRO_CACHE_MIN_CAPACITY: usize = 8;

/* MISC */

/// Default depth of coroutine origin capture.
pub const CORO_ORIGIN_DEPTH: usize = 16;

/// Default number of live allocations that triggers a collection
/// request.
pub const GC_THRESHOLD: usize = 7000;
