//! Shared assembly harness for the integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use quill_vm::prelude::*;

pub struct Vm {
    pub rt: Arc<Runtime>,
    pub ts: ThreadState,
}

impl Vm {
    pub fn new() -> Vm {
        let rt = Runtime::new(RuntimeConfig::default());
        let ts = ThreadState::new(Arc::clone(&rt));
        Vm { rt, ts }
    }

    /// A fresh globals mapping.
    pub fn globals(&mut self) -> ObjRef {
        quill_vm::dict::new(&mut self.ts)
    }

    /// Assemble a function. The correct header instruction is emitted
    /// before `body` runs; `framesize` must cover locals and any call
    /// regions.
    pub fn function(
        &mut self,
        globals: Obj,
        qualname: &str,
        flags: CodeFlags,
        argcount: u32,
        framesize: u32,
        varnames: &[&str],
        body: impl FnOnce(&mut CodeBuilder, &mut ThreadState),
    ) -> ObjRef {
        assemble_function(
            &mut self.ts,
            globals,
            qualname,
            flags,
            argcount,
            framesize,
            varnames,
            body,
        )
    }

    /// Bind a function into its own globals so it can call itself.
    pub fn define_global(&mut self, globals: Obj, name: &str, value: Obj) {
        let key = self.ts.intern(name);
        quill_vm::dict::set(&mut self.ts, globals, key, value).expect("globals insert");
    }

    pub fn int(&mut self, v: i64) -> ObjRef {
        number::new_int(&mut self.ts, v)
    }

    /// Call and unwrap an integer result.
    pub fn call_int(&mut self, callable: Obj, args: &[Obj]) -> i64 {
        let result = self.ts.call(callable, args).expect("call succeeds");
        assert!(
            number::is_int(&self.ts, result.as_obj()),
            "expected an int result"
        );
        number::int_value(result.as_obj())
    }

    /// A builtin by name.
    pub fn builtin(&mut self, name: &str) -> ObjRef {
        let dict = self.rt.builtins_dict();
        let key = self.ts.intern(name);
        quill_vm::dict::get(&mut self.ts, dict, key)
            .expect("builtins lookup")
            .expect("builtin present")
    }
}

/// Assemble a function against an explicit thread state (for tests
/// that attach extra threads).
#[allow(clippy::too_many_arguments)]
pub fn assemble_function(
    ts: &mut ThreadState,
    globals: Obj,
    qualname: &str,
    flags: CodeFlags,
    argcount: u32,
    framesize: u32,
    varnames: &[&str],
    body: impl FnOnce(&mut CodeBuilder, &mut ThreadState),
) -> ObjRef {
    let mut b = CodeBuilder::new();
    let corogen = flags.intersects(
        CodeFlags::GENERATOR | CodeFlags::COROUTINE | CodeFlags::ASYNC_GENERATOR,
    );
    if corogen {
        b.op_u16(Opcode::COROGEN_HEADER, framesize as u16);
    } else {
        b.op_u16(Opcode::FUNC_HEADER, framesize as u16);
    }
    body(&mut b, ts);
    let meta = CodeMeta {
        sig: ArgSignature {
            argcount,
            totalargs: argcount,
            framesize,
            ..Default::default()
        },
        flags,
        filename: "<test>".into(),
        qualname: qualname.into(),
        first_line: 1,
        varnames: varnames.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    };
    let code = b.build(ts, meta).expect("bytecode assembles");
    let builtins = ts.rt().builtins_dict();
    func::new(
        ts,
        code.as_obj(),
        globals,
        builtins,
        Vec::new(),
        None,
        Vec::new(),
        qualname,
    )
}

/// The exception type object for a kind, reachable from inside
/// assembly closures.
pub fn exc_type_of(ts: &ThreadState, kind: ExcKind) -> Obj {
    ts.rt().types().exceptions[kind as usize].as_obj()
}

/// Construct an exception instance with a message argument.
pub fn make_exc(vm: &mut Vm, kind: ExcKind, msg: &str) -> ObjRef {
    quill_vm::object::exception::new_msg(&mut vm.ts, kind, msg)
}
