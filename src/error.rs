//! Runtime error types
//!
//! Failures inside the evaluator are always *language-level exceptions*:
//! an operation stores an exception object into the thread state and
//! returns the [`Raised`] marker. `Raised` has no public constructor, so
//! a failing operation cannot forget to set the exception first.
//!
//! [`VmError`] is the embedder-facing shape: what a native caller gets
//! back when an exception escapes the outermost frame.

use thiserror::Error;

/// Result of an operation that may raise a language-level exception.
///
/// The exception itself lives in the thread state; the error arm is a
/// zero-sized proof that it was stored.
pub type ExecResult<T> = Result<T, Raised>;

/// Marker for "an exception is pending in the thread state".
///
/// Only `ThreadState::raise*` can produce this value.
#[derive(Debug)]
#[must_use]
pub struct Raised {
    _priv: (),
}

/// Internal constructor for [`Raised`]. Callers must have already stored
/// the pending exception.
pub(crate) const fn raised() -> Raised {
    Raised { _priv: () }
}

/// Builtin exception kinds known to the core.
///
/// The kind determines handler matching (`except ValueError:`) through
/// the [`parent`](ExcKind::parent) chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumCount)]
pub enum ExcKind {
    BaseException,
    Exception,
    TypeError,
    ValueError,
    OverflowError,
    ZeroDivisionError,
    ArithmeticError,
    NameError,
    UnboundLocalError,
    AttributeError,
    KeyError,
    IndexError,
    LookupError,
    StopIteration,
    StopAsyncIteration,
    GeneratorExit,
    RuntimeError,
    RecursionError,
    NotImplementedError,
    ImportError,
    SystemError,
    KeyboardInterrupt,
}

impl ExcKind {
    /// Parent kind in the builtin exception hierarchy, or `None` for the
    /// root.
    pub const fn parent(self) -> Option<ExcKind> {
        use ExcKind::*;
        Some(match self {
            BaseException => return None,
            Exception | GeneratorExit | KeyboardInterrupt => BaseException,
            ArithmeticError | TypeError | ValueError | NameError | AttributeError
            | LookupError | StopIteration | StopAsyncIteration | RuntimeError
            | ImportError | SystemError => Exception,
            OverflowError | ZeroDivisionError => ArithmeticError,
            UnboundLocalError => NameError,
            KeyError | IndexError => LookupError,
            RecursionError | NotImplementedError => RuntimeError,
        })
    }

    /// Whether `self` is `other` or a transitive subkind of it.
    pub fn is_subkind_of(self, other: ExcKind) -> bool {
        let mut cur = Some(self);
        while let Some(kind) = cur {
            if kind == other {
                return true;
            }
            cur = kind.parent();
        }
        false
    }
}

/// One rendered traceback line of an uncaught exception.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceLine {
    /// Source file of the frame.
    pub filename: String,
    /// Qualified name of the running function.
    pub qualname: String,
    /// Source line active when the frame was unwound.
    pub line: u32,
}

/// Error surface returned to native callers of the VM.
#[derive(Debug, Error)]
pub enum VmError {
    /// An exception escaped the outermost frame.
    #[error("uncaught {kind}: {message}")]
    Uncaught {
        /// Exception kind.
        kind: ExcKind,
        /// Rendered exception arguments.
        message: String,
        /// Innermost-last traceback.
        traceback: Vec<TraceLine>,
    },
    /// A code object failed validation during construction.
    #[error(transparent)]
    Code(#[from] CodeError),
}

/// Validation failures while building a code object.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    /// A jump target does not land on an instruction boundary.
    #[error("jump target {0} is not an instruction boundary")]
    BadJumpTarget(usize),
    /// An operand does not fit even the wide encoding.
    #[error("operand {0} exceeds the wide encoding")]
    OperandOverflow(i64),
    /// The frame size is too small for the declared registers.
    #[error("frame size {framesize} cannot hold {nlocals} locals")]
    FrameTooSmall {
        /// Declared frame size.
        framesize: u32,
        /// Declared argument-plus-local count.
        nlocals: u32,
    },
    /// An exception-table entry is out of bounds or inverted.
    #[error("malformed exception handler entry at index {0}")]
    BadHandler(usize),
    /// A label was referenced but never bound.
    #[error("unbound label {0}")]
    UnboundLabel(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exc_hierarchy_reaches_root() {
        use strum::EnumCount;
        // Every kind terminates at BaseException.
        let mut seen = 0;
        for kind in [
            ExcKind::TypeError,
            ExcKind::KeyError,
            ExcKind::RecursionError,
            ExcKind::GeneratorExit,
            ExcKind::OverflowError,
            ExcKind::UnboundLocalError,
        ] {
            assert!(kind.is_subkind_of(ExcKind::BaseException));
            seen += 1;
        }
        assert!(seen <= ExcKind::COUNT);
    }

    #[test]
    fn stop_iteration_is_not_generator_exit() {
        assert!(ExcKind::StopIteration.is_subkind_of(ExcKind::Exception));
        assert!(!ExcKind::GeneratorExit.is_subkind_of(ExcKind::Exception));
        assert!(ExcKind::GeneratorExit.is_subkind_of(ExcKind::BaseException));
        assert!(!ExcKind::StopIteration.is_subkind_of(ExcKind::StopAsyncIteration));
    }
}
