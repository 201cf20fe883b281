//! QuillVM: the runtime core of the Quill language.
//!
//! A register-based evaluator with per-object locks in place of a
//! global interpreter lock. Reference counting is biased per thread
//! with deferred counting for runtime-owned objects; namespaces are
//! concurrent insertion-ordered mappings with a lock-free read path;
//! attribute resolution goes through a per-type lock-free cache.
//!
//! Embedding starts at [`runtime::Runtime::new`], attaches a
//! [`thread::ThreadState`] per OS thread, assembles code objects with
//! [`code::CodeBuilder`], and calls functions through
//! [`thread::ThreadState::call`].

pub mod code;
pub mod consts;
pub mod dict;
pub mod error;
pub mod frame;
pub mod gc;
pub mod generator;
pub mod heap;
pub mod lock;
pub mod mro;
pub mod object;
pub mod opcode;
pub mod qsbr;
pub mod runtime;
pub mod section;
pub mod state;
pub mod thread;
pub mod trace;
pub mod value;

mod interpreter;
mod raw;
mod rc;

pub use rc::{is_deferred, is_immortal, local_count, merge, shared_count};

pub mod prelude {
    //! The embedder-facing surface in one import.

    pub use crate::code::{ArgSignature, CodeBuilder, CodeFlags, CodeMeta, ExceptionHandler};
    pub use crate::error::{CodeError, ExcKind, ExecResult, VmError};
    pub use crate::generator::{close as gen_close, send as gen_send, throw as gen_throw, GenKind};
    pub use crate::heap::AllocPolicy;
    pub use crate::object::{func, list, module, number, set, string, tuple, Obj, ObjRef};
    pub use crate::opcode::Opcode;
    pub use crate::runtime::{Runtime, RuntimeConfig};
    pub use crate::state::{GenStatus, SendResult};
    pub use crate::thread::ThreadState;
    pub use crate::trace::{set_profile, set_trace, TraceEvent};
    pub use crate::value::Register;
}
