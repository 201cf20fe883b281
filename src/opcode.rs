//! Instruction set and encoding
//!
//! One opcode byte followed by 0–3 operand bytes. A [`Opcode::WIDE`]
//! prefix widens every operand of the following instruction to 32 bits.
//! Jump operands are program-counter-relative offsets measured from the
//! end of the jump instruction, stored biased (`offset + 0x8000`, or
//! `+ 0x8000_0000` when wide). A jump whose offset does not fit the
//! narrow encoding is stored as the bias sentinel and resolved through
//! the code object's jump side table.
//!
//! Most instructions take one input from the accumulator and at most one
//! register operand, which is what keeps every narrow encoding within
//! three operand bytes.

use strum::{Display, EnumCount, FromRepr};

/// Bias added to narrow jump offsets.
pub const JUMP_BIAS: i32 = 0x8000;
/// Bias added to wide jump offsets.
pub const JUMP_BIAS_WIDE: i64 = 0x8000_0000;
/// Narrow encoding of "look the target up in the jump side table".
pub const JUMP_SIDE_SENTINEL: u16 = 0;

/// Operand layout of an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// No operands.
    Nil,
    /// One register/count byte.
    R,
    /// Two register/count bytes.
    RR,
    /// Three register/count bytes.
    RRR,
    /// One 16-bit index (constant pool, name table, frame size).
    U16,
    /// One 16-bit index plus one register byte.
    DR,
    /// One biased 16-bit jump offset.
    J,
    /// One register byte plus one biased 16-bit jump offset.
    RJ,
}

impl Format {
    /// Operand bytes in the narrow (or wide) encoding.
    pub const fn operand_bytes(self, wide: bool) -> usize {
        let (count, _) = self.shape();
        if wide {
            count * 4
        } else {
            match self {
                Format::Nil => 0,
                Format::R => 1,
                Format::RR => 2,
                Format::RRR => 3,
                Format::U16 | Format::J => 2,
                Format::DR | Format::RJ => 3,
            }
        }
    }

    /// `(operand count, has jump)` of the format.
    pub const fn shape(self) -> (usize, bool) {
        match self {
            Format::Nil => (0, false),
            Format::R => (1, false),
            Format::RR => (2, false),
            Format::RRR => (3, false),
            Format::U16 => (1, false),
            Format::DR => (2, false),
            Format::J => (1, true),
            Format::RJ => (2, true),
        }
    }
}

/// The instruction set.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromRepr, Display, EnumCount)]
#[repr(u8)]
pub enum Opcode {
    /// Widens the operands of the next instruction to 32 bits.
    WIDE = 0,

    /* constants & jumps */
    /// `acc = consts[D]`, as an alias for uncounted constants.
    LOAD_CONST = 1,
    /// Unconditional relative jump.
    JUMP = 2,
    /// Jump when the accumulator is true; clears it either way.
    POP_JUMP_IF_TRUE = 3,
    /// Jump when the accumulator is false; clears it either way.
    POP_JUMP_IF_FALSE = 4,
    /// Jump when the accumulator is true; keeps it.
    JUMP_IF_TRUE = 5,
    /// Jump when the accumulator is false; keeps it.
    JUMP_IF_FALSE = 6,

    /* locals */
    /// `acc = regs[A]` with a reference acquired.
    LOAD_FAST = 7,
    /// `regs[A] = acc`, taking ownership; the old value is cleared.
    STORE_FAST = 8,
    /// `regs[A] = regs[B]`, transferring ownership out of `B`.
    MOVE = 9,
    /// `regs[A] = regs[B]` as an alias; `B` keeps ownership.
    COPY = 10,
    /// Clear `regs[A]`, dropping an owned reference.
    CLEAR_FAST = 11,
    /// Clear the accumulator.
    CLEAR_ACC = 12,
    /// Clear `regs[A]`, raising UnboundLocalError when already empty.
    DELETE_FAST = 13,

    /* names */
    /// Module-level name load: globals then builtins.
    LOAD_NAME = 14,
    /// Module-level name store into globals.
    STORE_NAME = 15,
    /// Module-level name delete from globals.
    DELETE_NAME = 16,
    /// Global load through the per-site inline cache (site index `A`).
    LOAD_GLOBAL = 17,
    /// Store the accumulator into the function's globals.
    STORE_GLOBAL = 18,
    /// Delete a key from the function's globals.
    DELETE_GLOBAL = 19,
    /// Load through the cell in `regs[A]`.
    LOAD_DEREF = 20,
    /// Store the accumulator into the cell in `regs[A]`.
    STORE_DEREF = 21,
    /// Empty the cell in `regs[A]`.
    DELETE_DEREF = 22,
    /// Class-body free-variable load: cell `A`, falling back to name `D`.
    LOAD_CLASSDEREF = 23,

    /* attributes */
    /// `acc = acc.names[D]`.
    LOAD_ATTR = 24,
    /// `regs[A].names[D] = acc`.
    STORE_ATTR = 25,
    /// `del acc.names[D]`.
    DELETE_ATTR = 26,
    /// Method load for `CALL_METHOD`: fills `regs[A-1]` and `regs[A]`.
    LOAD_METHOD = 27,

    /* arithmetic */
    BINARY_ADD = 28,
    BINARY_SUBTRACT = 29,
    BINARY_MULTIPLY = 30,
    BINARY_MATRIX_MULTIPLY = 31,
    BINARY_TRUE_DIVIDE = 32,
    BINARY_FLOOR_DIVIDE = 33,
    BINARY_MODULO = 34,
    BINARY_POWER = 35,
    BINARY_LSHIFT = 36,
    BINARY_RSHIFT = 37,
    BINARY_AND = 38,
    BINARY_OR = 39,
    BINARY_XOR = 40,
    INPLACE_ADD = 41,
    INPLACE_SUBTRACT = 42,
    INPLACE_MULTIPLY = 43,
    INPLACE_MATRIX_MULTIPLY = 44,
    INPLACE_TRUE_DIVIDE = 45,
    INPLACE_FLOOR_DIVIDE = 46,
    INPLACE_MODULO = 47,
    INPLACE_POWER = 48,
    INPLACE_LSHIFT = 49,
    INPLACE_RSHIFT = 50,
    INPLACE_AND = 51,
    INPLACE_OR = 52,
    INPLACE_XOR = 53,
    UNARY_NEGATIVE = 54,
    UNARY_POSITIVE = 55,
    UNARY_INVERT = 56,
    /// Logical not through the truth protocol.
    UNARY_NOT = 57,
    /// Logical not of an accumulator already known to be a bool.
    UNARY_NOT_FAST = 58,

    /* comparisons */
    /// `acc = regs[A] <op B> acc` with `B` a `CmpOp` operand.
    COMPARE_OP = 59,
    /// Identity test; `B != 0` inverts.
    IS_OP = 60,
    /// Containment test; `B != 0` inverts.
    CONTAINS_OP = 61,

    /* sequences */
    /// `acc = [regs[A] .. regs[A+B])`, clearing the inputs.
    BUILD_LIST = 62,
    BUILD_TUPLE = 63,
    BUILD_SET = 64,
    /// `acc = {regs[A]: regs[A+1], ..}` over `B` pairs.
    BUILD_MAP = 65,
    /// `acc = slice(regs[A], regs[A+1], regs[A+2])`.
    BUILD_SLICE = 66,
    /// Append the accumulator to the list in `regs[A]`.
    LIST_APPEND = 67,
    /// Extend the list in `regs[A]` from the iterable in the accumulator.
    LIST_EXTEND = 68,
    /// Add the accumulator to the set in `regs[A]`.
    SET_ADD = 69,
    /// Update the set in `regs[A]` from the iterable in the accumulator.
    SET_UPDATE = 70,
    /// `regs[A].update(acc)`.
    DICT_UPDATE = 71,
    /// Like `DICT_UPDATE` but duplicate keys raise (for `**kwargs`).
    DICT_MERGE = 72,
    /// Unpack the accumulator into `regs[A]..`: `B` targets before a
    /// starred target, `C-1` after it (`C == 0` means no star).
    UNPACK = 73,
    /// `acc = regs[A][acc]`.
    BINARY_SUBSCR = 74,
    /// `regs[A][regs[B]] = acc`.
    STORE_SUBSCR = 75,
    /// `del regs[A][acc]`.
    DELETE_SUBSCR = 76,

    /* iteration */
    /// `regs[A] = iter(acc)`, clearing the accumulator.
    GET_ITER = 77,
    /// Like `GET_ITER` but generators/coroutines pass through.
    GET_YIELD_FROM_ITER = 78,
    /// Advance `regs[A]`: value into the accumulator, or clear and jump.
    FOR_ITER = 79,
    /// `regs[A] = acc.__aiter__()`.
    GET_AITER = 80,
    /// `acc = awaitable of regs[A].__anext__()`.
    GET_ANEXT = 81,
    /// Close an async-for: swallow StopAsyncIteration at link reg `A`.
    END_ASYNC_FOR = 82,

    /* calls */
    /// Call `regs[A-1]` with `B` positional args at `regs[A]..`.
    CALL_FUNCTION = 83,
    /// Call a `LOAD_METHOD` pair at `A` with `B` extra args.
    CALL_METHOD = 84,
    /// Extended call: `*args`/`**kwargs` in the reserved slots below `A`.
    CALL_FUNCTION_EX = 85,
    /// Interpreted-function prologue; operand is the frame size.
    FUNC_HEADER = 86,
    /// Native-function prologue.
    CFUNC_HEADER = 87,
    /// Prologue for callables invoked through the type's call slot.
    FUNC_TPCALL_HEADER = 88,
    /// Bound-method prologue: prepends the receiver.
    METHOD_HEADER = 89,
    /// Generator/coroutine prologue: captures the frame and returns.
    COROGEN_HEADER = 90,
    /// `acc = function(consts[D], current globals)`.
    MAKE_FUNCTION = 91,

    /* control flow */
    RETURN_VALUE = 92,
    YIELD_VALUE = 93,
    /// Delegate to the sub-iterator in `regs[A]`.
    YIELD_FROM = 94,
    /// Raise the accumulator (empty accumulator re-raises).
    RAISE = 95,
    /// Jump unless the handled exception at link `A` matches the
    /// accumulator.
    JUMP_IF_NOT_EXC_MATCH = 96,
    /// Leave a handler: clear link `A` and its exception slot.
    END_EXCEPT = 97,
    /// Enter a finally block at `J`, recording the resume point in `A`.
    CALL_FINALLY = 98,
    /// Leave a finally block according to link `A`.
    END_FINALLY = 99,
    /// Enter a with block: manager in acc, slots at `A`.
    SETUP_WITH = 100,
    /// Leave a with block at `A`, consulting `regs[A+2]`.
    END_WITH = 101,
    SETUP_ASYNC_WITH = 102,
    END_ASYNC_WITH = 103,
    /// Import a module by name `D` through the host hook.
    IMPORT_NAME = 104,
    /// `acc = acc.names[D]` with ImportError on failure.
    IMPORT_FROM = 105,
    /// Star-import the module in `regs[A]` into the globals.
    IMPORT_STAR = 106,
    /// Coerce the accumulator to an awaitable iterator.
    GET_AWAITABLE = 107,
    /// `acc = __build_class__`.
    LOAD_BUILD_CLASS = 108,
    /// `acc = intrinsic id A` (as a non-object payload).
    LOAD_INTRINSIC = 109,
    /// `acc = intrinsics[A](acc)`.
    CALL_INTRINSIC_1 = 110,
    /// `acc = intrinsics[A](regs[B] .. regs[B+C])`.
    CALL_INTRINSIC_N = 111,
}

impl Opcode {
    /// Operand layout of this opcode.
    pub const fn format(self) -> Format {
        use Opcode::*;
        match self {
            WIDE | CLEAR_ACC | RETURN_VALUE | YIELD_VALUE | RAISE | CFUNC_HEADER
            | FUNC_TPCALL_HEADER | METHOD_HEADER | GET_AWAITABLE | LOAD_BUILD_CLASS
            | UNARY_NEGATIVE | UNARY_POSITIVE | UNARY_INVERT | UNARY_NOT | UNARY_NOT_FAST => {
                Format::Nil
            }

            LOAD_FAST | STORE_FAST | CLEAR_FAST | DELETE_FAST | LOAD_DEREF | STORE_DEREF
            | DELETE_DEREF | BINARY_ADD | BINARY_SUBTRACT | BINARY_MULTIPLY
            | BINARY_MATRIX_MULTIPLY | BINARY_TRUE_DIVIDE | BINARY_FLOOR_DIVIDE
            | BINARY_MODULO | BINARY_POWER | BINARY_LSHIFT | BINARY_RSHIFT | BINARY_AND
            | BINARY_OR | BINARY_XOR | INPLACE_ADD | INPLACE_SUBTRACT | INPLACE_MULTIPLY
            | INPLACE_MATRIX_MULTIPLY | INPLACE_TRUE_DIVIDE | INPLACE_FLOOR_DIVIDE
            | INPLACE_MODULO | INPLACE_POWER | INPLACE_LSHIFT | INPLACE_RSHIFT | INPLACE_AND
            | INPLACE_OR | INPLACE_XOR | BUILD_SLICE | LIST_APPEND | LIST_EXTEND | SET_ADD
            | SET_UPDATE | DICT_UPDATE | DICT_MERGE | BINARY_SUBSCR | DELETE_SUBSCR
            | GET_ITER | GET_YIELD_FROM_ITER | GET_AITER | GET_ANEXT | END_ASYNC_FOR
            | CALL_FUNCTION_EX | YIELD_FROM | END_EXCEPT | END_FINALLY | SETUP_WITH
            | END_WITH | SETUP_ASYNC_WITH | END_ASYNC_WITH | IMPORT_STAR | LOAD_INTRINSIC
            | CALL_INTRINSIC_1 => Format::R,

            MOVE | COPY | COMPARE_OP | IS_OP | CONTAINS_OP | BUILD_LIST | BUILD_TUPLE
            | BUILD_SET | BUILD_MAP | CALL_FUNCTION | CALL_METHOD | STORE_SUBSCR => Format::RR,

            UNPACK | CALL_INTRINSIC_N => Format::RRR,

            LOAD_CONST | LOAD_NAME | STORE_NAME | DELETE_NAME | STORE_GLOBAL | DELETE_GLOBAL
            | LOAD_ATTR | DELETE_ATTR | FUNC_HEADER | COROGEN_HEADER | MAKE_FUNCTION
            | IMPORT_NAME | IMPORT_FROM => Format::U16,

            LOAD_GLOBAL | LOAD_CLASSDEREF | STORE_ATTR | LOAD_METHOD => Format::DR,

            JUMP | POP_JUMP_IF_TRUE | POP_JUMP_IF_FALSE | JUMP_IF_TRUE | JUMP_IF_FALSE => {
                Format::J
            }

            FOR_ITER | JUMP_IF_NOT_EXC_MATCH | CALL_FINALLY => Format::RJ,
        }
    }

    /// Total encoded size, opcode byte included.
    pub const fn size(self, wide: bool) -> usize {
        let prefix = if wide { 2 } else { 1 };
        prefix + self.format().operand_bytes(wide)
    }

    /// Whether this opcode may run user code, allocate, or block: the
    /// eval breaker is examined here and critical sections must be
    /// releasable.
    pub const fn is_safety_point(self) -> bool {
        use Opcode::*;
        !matches!(
            self,
            WIDE | LOAD_CONST
                | LOAD_FAST
                | STORE_FAST
                | MOVE
                | COPY
                | CLEAR_FAST
                | CLEAR_ACC
                | JUMP
                | JUMP_IF_TRUE
                | JUMP_IF_FALSE
                | POP_JUMP_IF_TRUE
                | POP_JUMP_IF_FALSE
                | IS_OP
                | LOAD_INTRINSIC
                | UNARY_NOT_FAST
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount;

    #[test]
    fn opcode_bytes_roundtrip() {
        for byte in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_repr(byte).expect("dense opcode numbering");
            assert_eq!(op as u8, byte);
        }
        assert!(Opcode::from_repr(Opcode::COUNT as u8).is_none());
    }

    #[test]
    fn formats_fit_three_operand_bytes() {
        for byte in 0..Opcode::COUNT as u8 {
            let op = Opcode::from_repr(byte).unwrap();
            assert!(op.format().operand_bytes(false) <= 3, "{op} too wide");
            assert_eq!(
                op.format().operand_bytes(true),
                op.format().shape().0 * 4,
                "{op} wide operands"
            );
        }
    }

    #[test]
    fn jumps_are_safety_points_only_when_conditional_on_objects() {
        assert!(!Opcode::JUMP.is_safety_point());
        assert!(Opcode::FOR_ITER.is_safety_point());
        assert!(Opcode::CALL_FUNCTION.is_safety_point());
        assert!(!Opcode::LOAD_FAST.is_safety_point());
    }
}
