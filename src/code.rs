//! Code objects
//!
//! A code object is immutable after construction: instruction bytes, a
//! constant pool (interned during construction), name tables, the packed
//! argument signature, the exception table, the line table and the jump
//! side table. Code objects use deferred reference counting — their
//! lifetime is owned by the collector, not by per-operation counting.
//!
//! [`CodeBuilder`] is the assembly surface used by the compiler and by
//! tests: emit instructions against labels, then `build` validates and
//! freezes the object.

use crate::error::{CodeError, ExcKind, Raised};
use crate::object::{string, Obj, ObjectHeader, ObjRef};
use crate::opcode::{Format, Opcode, JUMP_BIAS, JUMP_SIDE_SENTINEL};
use crate::thread::ThreadState;

bitflags::bitflags! {
    /// Behavior flags of a code object.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct CodeFlags: u32 {
        /// The function accepts `*args`.
        const VARARGS = 1 << 0;
        /// The function accepts `**kwargs`.
        const VARKEYWORDS = 1 << 1;
        /// The body contains `yield`.
        const GENERATOR = 1 << 2;
        /// Defined with `async def`.
        const COROUTINE = 1 << 3;
        /// `async def` containing `yield`.
        const ASYNC_GENERATOR = 1 << 4;
        /// The frame gets a fresh locals namespace.
        const NEWLOCALS = 1 << 5;
        /// Defined inside another function.
        const NESTED = 1 << 6;
        /// Generator usable as a coroutine (legacy adapter).
        const ITERABLE_COROUTINE = 1 << 7;
    }
}

/// Packed argument signature, checked by `FUNC_HEADER`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArgSignature {
    /// Positional-or-keyword parameter count.
    pub argcount: u32,
    /// Leading positional-only parameters.
    pub posonly: u32,
    /// Keyword-only parameters (after `argcount`).
    pub kwonly: u32,
    /// Total named parameters (`argcount + kwonly`).
    pub totalargs: u32,
    /// Defaults for the rightmost positional parameters.
    pub ndefaults: u32,
    /// Free variables captured from enclosing scopes.
    pub nfreevars: u32,
    /// Cells materialized for inner scopes.
    pub ncells: u32,
    /// Registers the frame needs, arguments included.
    pub framesize: u32,
}

/// One exception-table entry. Entries are ordered innermost-first by
/// `start`; the active range is `[start, handler)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// First protected instruction offset.
    pub start: u32,
    /// Handler entry offset; also the end of the protected range.
    pub handler: u32,
    /// End of the handler body (for handled-exception queries).
    pub handler_end: u32,
    /// First register cleared on entry; the link register.
    pub link_reg: u32,
}

/// One run of the line table: `byte_delta` instruction bytes, then the
/// line moves by `line_delta`.
#[derive(Debug, Clone, Copy)]
pub struct LineEntry {
    /// Instruction bytes covered by the previous line.
    pub byte_delta: u8,
    /// Signed line movement after those bytes.
    pub line_delta: i8,
}

/// A jump side-table edge for offsets that overflow the narrow encoding.
#[derive(Debug, Clone, Copy)]
pub struct JumpEdge {
    /// Offset of the byte after the jump instruction.
    pub from: u32,
    /// Absolute target offset.
    pub to: u32,
}

#[repr(C)]
pub struct CodeObject {
    base: ObjectHeader,
    instrs: Box<[u8]>,
    consts: Box<[ObjRef]>,
    names: Box<[ObjRef]>,
    varnames: Box<[ObjRef]>,
    cellvars: Box<[ObjRef]>,
    freevars: Box<[ObjRef]>,
    cell2reg: Box<[u32]>,
    free2reg: Box<[u32]>,
    sig: ArgSignature,
    flags: CodeFlags,
    exc_table: Box<[ExceptionHandler]>,
    line_table: Box<[LineEntry]>,
    first_line: u32,
    jump_table: Box<[JumpEdge]>,
    filename: ObjRef,
    qualname: ObjRef,
    /// `LOAD_GLOBAL` sites; sized the function objects' inline caches.
    ncaches: u32,
}

fn payload(obj: Obj) -> &'static CodeObject {
    unsafe { obj.payload() }
}

/// Instruction bytes.
pub fn instrs<'a>(obj: Obj) -> &'a [u8] {
    &payload(obj).instrs
}

/// Constant pool.
pub fn consts<'a>(obj: Obj) -> &'a [ObjRef] {
    &payload(obj).consts
}

/// Interned name table (globals, attributes, imports).
pub fn names<'a>(obj: Obj) -> &'a [ObjRef] {
    &payload(obj).names
}

/// Local variable names, for unbound-local diagnostics.
pub fn varnames<'a>(obj: Obj) -> &'a [ObjRef] {
    &payload(obj).varnames
}

/// Cell-variable names.
pub fn cellvars<'a>(obj: Obj) -> &'a [ObjRef] {
    &payload(obj).cellvars
}

/// Free-variable names.
pub fn freevars<'a>(obj: Obj) -> &'a [ObjRef] {
    &payload(obj).freevars
}

/// Register targets of materialized cells.
pub fn cell2reg<'a>(obj: Obj) -> &'a [u32] {
    &payload(obj).cell2reg
}

/// Register targets of captured free variables.
pub fn free2reg<'a>(obj: Obj) -> &'a [u32] {
    &payload(obj).free2reg
}

/// Packed signature.
pub fn signature(obj: Obj) -> ArgSignature {
    payload(obj).sig
}

/// Behavior flags.
pub fn flags(obj: Obj) -> CodeFlags {
    payload(obj).flags
}

/// Whether the code is a generator, coroutine or async generator.
pub fn is_corogen(obj: Obj) -> bool {
    flags(obj).intersects(
        CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR,
    )
}

/// Number of `LOAD_GLOBAL` cache sites.
pub fn global_cache_count(obj: Obj) -> usize {
    payload(obj).ncaches as usize
}

/// Source filename.
pub fn filename(obj: Obj) -> Obj {
    payload(obj).filename.as_obj()
}

/// Qualified name.
pub fn qualname(obj: Obj) -> Obj {
    payload(obj).qualname.as_obj()
}

/// The innermost handler whose protected range contains `pc`.
pub fn handler_for(obj: Obj, pc: usize) -> Option<ExceptionHandler> {
    payload(obj)
        .exc_table
        .iter()
        .find(|eh| (eh.start as usize) <= pc && pc < eh.handler as usize)
        .copied()
}

/// Every table entry, for handled-exception scans.
pub fn handlers<'a>(obj: Obj) -> &'a [ExceptionHandler] {
    &payload(obj).exc_table
}

/// Source line for an instruction offset, through the run-length table.
pub fn line_for(obj: Obj, pc: usize) -> u32 {
    let code = payload(obj);
    let mut line = code.first_line as i64;
    let mut offset = 0usize;
    for entry in code.line_table.iter() {
        offset += entry.byte_delta as usize;
        if offset > pc {
            break;
        }
        line += entry.line_delta as i64;
    }
    line.max(0) as u32
}

/// Resolve an overflowed jump through the side table. `from` is the
/// offset just past the jump instruction.
pub fn jump_side_target(obj: Obj, from: usize) -> Option<usize> {
    let table = &payload(obj).jump_table;
    table
        .binary_search_by_key(&(from as u32), |edge| edge.from)
        .ok()
        .map(|i| table[i].to as usize)
}

pub(crate) unsafe fn drop_obj(obj: Obj) {
    crate::heap::free_object::<CodeObject>(obj);
}

fn code_traverse(obj: Obj, visit: &mut dyn FnMut(Obj)) {
    let code = payload(obj);
    for c in code.consts.iter() {
        visit(c.as_obj());
    }
}

pub(crate) fn slots() -> crate::object::TypeSlots {
    crate::object::TypeSlots {
        traverse: Some(code_traverse),
        ..crate::object::TypeSlots::EMPTY
    }
}

/* BUILDER */

/// A forward-referencable instruction offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Offset of the 16-bit jump operand.
    operand_at: usize,
    /// Offset just past the instruction (jump origin).
    origin: usize,
    label: Label,
}

/// Metadata for [`CodeBuilder::build`].
#[derive(Debug, Clone, Default)]
pub struct CodeMeta {
    /// Packed signature; `framesize` must cover args, locals and temps.
    pub sig: ArgSignature,
    /// Behavior flags.
    pub flags: CodeFlags,
    /// Source filename.
    pub filename: String,
    /// Qualified name.
    pub qualname: String,
    /// First source line.
    pub first_line: u32,
    /// Argument and local names, for diagnostics.
    pub varnames: Vec<String>,
    /// Cell variable names and their register targets.
    pub cellvars: Vec<(String, u32)>,
    /// Free variable names and their register targets.
    pub freevars: Vec<(String, u32)>,
}

/// Incremental assembler for one code object.
#[derive(Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
    consts: Vec<ObjRef>,
    names: Vec<ObjRef>,
    handlers: Vec<(Label, Label, Label, u32)>,
    lines: Vec<(usize, u32)>,
    ncaches: u32,
}

impl CodeBuilder {
    /// Fresh builder.
    pub fn new() -> CodeBuilder {
        CodeBuilder::default()
    }

    /// Current instruction offset.
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    /// Allocate an unbound label.
    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind a label to the current offset.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.bytes.len());
    }

    /// Intern a constant, deduplicating by identity.
    pub fn const_obj(&mut self, value: ObjRef) -> u16 {
        if let Some(pos) = self
            .consts
            .iter()
            .position(|c| c.as_obj() == value.as_obj())
        {
            return pos as u16;
        }
        self.consts.push(value);
        (self.consts.len() - 1) as u16
    }

    /// Intern an integer constant.
    pub fn const_int(&mut self, ts: &mut ThreadState, value: i64) -> u16 {
        let obj = crate::object::number::new_int(ts, value);
        self.const_obj(obj)
    }

    /// Intern a string constant.
    pub fn const_str(&mut self, ts: &mut ThreadState, value: &str) -> u16 {
        let obj = ObjRef::new(ts.intern(value));
        self.const_obj(obj)
    }

    /// Intern a name (always interned strings).
    pub fn name(&mut self, ts: &mut ThreadState, name: &str) -> u16 {
        let obj = ts.intern(name);
        if let Some(pos) = self.names.iter().position(|n| n.as_obj() == obj) {
            return pos as u16;
        }
        self.names.push(ObjRef::new(obj));
        (self.names.len() - 1) as u16
    }

    /// Allocate a `LOAD_GLOBAL` inline-cache site.
    pub fn cache_site(&mut self) -> u8 {
        let site = self.ncaches;
        self.ncaches += 1;
        site as u8
    }

    /// Record that the following instructions belong to `line`.
    pub fn line(&mut self, line: u32) {
        self.lines.push((self.bytes.len(), line));
    }

    /// Emit a no-operand instruction.
    pub fn op(&mut self, op: Opcode) {
        debug_assert_eq!(op.format(), Format::Nil);
        self.bytes.push(op as u8);
    }

    /// Emit a one-register instruction.
    pub fn op_r(&mut self, op: Opcode, a: u8) {
        debug_assert_eq!(op.format(), Format::R);
        self.bytes.push(op as u8);
        self.bytes.push(a);
    }

    /// Emit a two-register instruction.
    pub fn op_rr(&mut self, op: Opcode, a: u8, b: u8) {
        debug_assert_eq!(op.format(), Format::RR);
        self.bytes.push(op as u8);
        self.bytes.push(a);
        self.bytes.push(b);
    }

    /// Emit a three-register instruction.
    pub fn op_rrr(&mut self, op: Opcode, a: u8, b: u8, c: u8) {
        debug_assert_eq!(op.format(), Format::RRR);
        self.bytes.push(op as u8);
        self.bytes.push(a);
        self.bytes.push(b);
        self.bytes.push(c);
    }

    /// Emit an index instruction.
    pub fn op_u16(&mut self, op: Opcode, d: u16) {
        debug_assert_eq!(op.format(), Format::U16);
        self.bytes.push(op as u8);
        self.bytes.extend_from_slice(&d.to_le_bytes());
    }

    /// Emit an index+register instruction.
    pub fn op_dr(&mut self, op: Opcode, d: u16, a: u8) {
        debug_assert_eq!(op.format(), Format::DR);
        self.bytes.push(op as u8);
        self.bytes.extend_from_slice(&d.to_le_bytes());
        self.bytes.push(a);
    }

    /// Emit a jump.
    pub fn jump(&mut self, op: Opcode, target: Label) {
        debug_assert_eq!(op.format(), Format::J);
        self.bytes.push(op as u8);
        let operand_at = self.bytes.len();
        self.bytes.extend_from_slice(&0u16.to_le_bytes());
        self.fixups.push(Fixup {
            operand_at,
            origin: self.bytes.len(),
            label: target,
        });
    }

    /// Emit a register+jump instruction.
    pub fn op_rj(&mut self, op: Opcode, a: u8, target: Label) {
        debug_assert_eq!(op.format(), Format::RJ);
        self.bytes.push(op as u8);
        self.bytes.push(a);
        let operand_at = self.bytes.len();
        self.bytes.extend_from_slice(&0u16.to_le_bytes());
        self.fixups.push(Fixup {
            operand_at,
            origin: self.bytes.len(),
            label: target,
        });
    }

    /// Register an exception handler. `start..end` is the protected
    /// range, `handler_end` closes the handler body, `link_reg` receives
    /// the link/exception pair.
    pub fn handler(&mut self, start: Label, handler: Label, handler_end: Label, link_reg: u32) {
        self.handlers.push((start, handler, handler_end, link_reg));
    }

    /// Validate, resolve jumps, intern constants, and freeze.
    pub fn build(self, ts: &mut ThreadState, meta: CodeMeta) -> Result<ObjRef, CodeError> {
        let CodeBuilder {
            mut bytes,
            labels,
            fixups,
            consts,
            names,
            handlers,
            lines,
            ncaches,
        } = self;

        let mut sig = meta.sig;
        if sig.totalargs == 0 {
            sig.totalargs = sig.argcount + sig.kwonly;
        }
        sig.nfreevars = meta.freevars.len() as u32;
        sig.ncells = meta.cellvars.len() as u32;
        if sig.framesize < sig.totalargs {
            return Err(CodeError::FrameTooSmall {
                framesize: sig.framesize,
                nlocals: sig.totalargs,
            });
        }

        let resolve = |label: Label| -> Result<usize, CodeError> {
            labels[label.0].ok_or(CodeError::UnboundLabel(label.0))
        };

        let mut jump_table = Vec::new();
        for fixup in &fixups {
            let target = resolve(fixup.label)?;
            let offset = target as i64 - fixup.origin as i64;
            let biased = offset + JUMP_BIAS as i64;
            let encoded = if (1..=u16::MAX as i64).contains(&biased) {
                biased as u16
            } else {
                // Overflow (or the reserved bias value): route through
                // the side table.
                jump_table.push(JumpEdge {
                    from: fixup.origin as u32,
                    to: target as u32,
                });
                JUMP_SIDE_SENTINEL
            };
            bytes[fixup.operand_at..fixup.operand_at + 2]
                .copy_from_slice(&encoded.to_le_bytes());
        }
        jump_table.sort_by_key(|edge| edge.from);

        let mut exc_table = Vec::with_capacity(handlers.len());
        for (i, (start, handler, handler_end, link_reg)) in handlers.iter().enumerate() {
            let entry = ExceptionHandler {
                start: resolve(*start)? as u32,
                handler: resolve(*handler)? as u32,
                handler_end: resolve(*handler_end)? as u32,
                link_reg: *link_reg,
            };
            if entry.start >= entry.handler
                || entry.handler > entry.handler_end
                || entry.handler_end as usize > bytes.len()
                || entry.link_reg + 1 >= sig.framesize
            {
                return Err(CodeError::BadHandler(i));
            }
            exc_table.push(entry);
        }

        let mut line_table = Vec::new();
        let mut prev_offset = 0usize;
        let mut prev_line = meta.first_line as i64;
        for (offset, line) in lines {
            let mut byte_delta = offset - prev_offset;
            while byte_delta > u8::MAX as usize {
                line_table.push(LineEntry {
                    byte_delta: u8::MAX,
                    line_delta: 0,
                });
                byte_delta -= u8::MAX as usize;
            }
            let mut line_delta = line as i64 - prev_line;
            while line_delta > i8::MAX as i64 || line_delta < i8::MIN as i64 {
                let step = line_delta.clamp(i8::MIN as i64, i8::MAX as i64);
                line_table.push(LineEntry {
                    byte_delta: byte_delta as u8,
                    line_delta: step as i8,
                });
                byte_delta = 0;
                line_delta -= step;
            }
            line_table.push(LineEntry {
                byte_delta: byte_delta as u8,
                line_delta: line_delta as i8,
            });
            prev_offset = offset;
            prev_line = line as i64;
        }

        let filename = ObjRef::new(ts.intern(&meta.filename));
        let qualname = ObjRef::new(ts.intern(&meta.qualname));
        let mut named = meta.varnames.clone();
        while (named.len() as u32) < sig.totalargs {
            named.push(format!("arg{}", named.len()));
        }
        let varnames = named
            .iter()
            .map(|n| ObjRef::new(ts.intern(n)))
            .collect();
        let cellvars: Box<[ObjRef]> = meta
            .cellvars
            .iter()
            .map(|(n, _)| ObjRef::new(ts.intern(n)))
            .collect();
        let freevars: Box<[ObjRef]> = meta
            .freevars
            .iter()
            .map(|(n, _)| ObjRef::new(ts.intern(n)))
            .collect();
        let cell2reg = meta.cellvars.iter().map(|(_, r)| *r).collect();
        let free2reg = meta.freevars.iter().map(|(_, r)| *r).collect();

        let ty = ts.rt().types.code;
        let code = ts.alloc_obj(CodeObject {
            base: ObjectHeader::new(ty, ts.id()),
            instrs: bytes.into_boxed_slice(),
            consts: consts.into_boxed_slice(),
            names: names.into_boxed_slice(),
            varnames,
            cellvars,
            freevars,
            cell2reg,
            free2reg,
            sig,
            flags: meta.flags,
            exc_table: exc_table.into_boxed_slice(),
            line_table: line_table.into_boxed_slice(),
            first_line: meta.first_line,
            jump_table: jump_table.into_boxed_slice(),
            filename,
            qualname,
            ncaches,
        });
        // Code objects churn references constantly (every call loads
        // them); their count is owned by the collector instead.
        crate::rc::make_deferred(code.as_obj());
        Ok(code)
    }
}

/// Raise the canonical "name is not defined" error.
pub(crate) fn err_name(ts: &mut ThreadState, name: Obj) -> Raised {
    let n = string::as_str(name).to_owned();
    ts.raise(ExcKind::NameError, format!("name '{n}' is not defined"))
}
