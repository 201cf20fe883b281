//! Code-object construction: jump resolution, tables, validation.

mod common;

use common::Vm;
use quill_vm::prelude::*;

#[test]
fn forward_and_backward_jumps_resolve() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    // if n: return 1 else: return 0, with the else placed first in the
    // byte stream so both jump directions occur.
    let func = vm.function(
        globals.as_obj(),
        "jumps",
        CodeFlags::empty(),
        1,
        4,
        &["n"],
        |b, ts| {
            let truthy = b.label();
            b.op_r(Opcode::LOAD_FAST, 0);
            b.jump(Opcode::POP_JUMP_IF_TRUE, truthy);
            let zero = b.const_int(ts, 0);
            b.op_u16(Opcode::LOAD_CONST, zero);
            b.op(Opcode::RETURN_VALUE);
            b.bind(truthy);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let yes = vm.int(5);
    let no = vm.int(0);
    assert_eq!(vm.call_int(func.as_obj(), &[yes.as_obj()]), 1);
    assert_eq!(vm.call_int(func.as_obj(), &[no.as_obj()]), 0);
}

#[test]
fn unbound_label_is_rejected() {
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new();
    b.op_u16(Opcode::FUNC_HEADER, 4);
    let nowhere = b.label();
    b.jump(Opcode::JUMP, nowhere);
    let meta = CodeMeta {
        sig: ArgSignature {
            framesize: 4,
            ..Default::default()
        },
        filename: "<test>".into(),
        qualname: "broken".into(),
        ..Default::default()
    };
    match b.build(&mut vm.ts, meta) {
        Err(CodeError::UnboundLabel(_)) => {}
        other => panic!("expected UnboundLabel, got {other:?}"),
    }
}

#[test]
fn inverted_handler_is_rejected() {
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new();
    b.op_u16(Opcode::FUNC_HEADER, 8);
    let start = b.label();
    let handler = b.label();
    let end = b.label();
    b.bind(handler);
    b.op(Opcode::RETURN_VALUE);
    b.bind(start);
    b.op(Opcode::RETURN_VALUE);
    b.bind(end);
    // handler before start: the protected range is empty/inverted.
    b.handler(start, handler, end, 2);
    let meta = CodeMeta {
        sig: ArgSignature {
            framesize: 8,
            ..Default::default()
        },
        filename: "<test>".into(),
        qualname: "broken".into(),
        ..Default::default()
    };
    match b.build(&mut vm.ts, meta) {
        Err(CodeError::BadHandler(0)) => {}
        other => panic!("expected BadHandler, got {other:?}"),
    }
}

#[test]
fn frame_too_small_is_rejected() {
    let mut vm = Vm::new();
    let mut b = CodeBuilder::new();
    b.op_u16(Opcode::FUNC_HEADER, 2);
    b.op(Opcode::RETURN_VALUE);
    let meta = CodeMeta {
        sig: ArgSignature {
            argcount: 4,
            framesize: 2,
            ..Default::default()
        },
        filename: "<test>".into(),
        qualname: "broken".into(),
        ..Default::default()
    };
    match b.build(&mut vm.ts, meta) {
        Err(CodeError::FrameTooSmall { framesize: 2, nlocals: 4 }) => {}
        other => panic!("expected FrameTooSmall, got {other:?}"),
    }
}

#[test]
fn distant_jump_routes_through_side_table() {
    // A jump across ~40k bytes of padding exceeds the biased i16 range
    // and must land in the side table, still executing correctly.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "far",
        CodeFlags::empty(),
        0,
        4,
        &[],
        |b, ts| {
            let far = b.label();
            let back = b.label();
            b.jump(Opcode::JUMP, far);
            b.bind(back);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
            // Padding the encoder never reaches: CLEAR_ACC is 1 byte.
            for _ in 0..40_000 {
                b.op(Opcode::CLEAR_ACC);
            }
            b.bind(far);
            b.jump(Opcode::JUMP, back);
        },
    );
    assert_eq!(vm.call_int(func.as_obj(), &[]), 1);
}

#[test]
fn line_table_round_trips_through_large_gaps() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "liner",
        CodeFlags::empty(),
        0,
        4,
        &[],
        |b, ts| {
            b.line(100);
            for _ in 0..600 {
                b.op(Opcode::CLEAR_ACC);
            }
            b.line(1700);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
        },
    );
    let code = func::code_of(func.as_obj());
    assert_eq!(quill_vm::code::line_for(code, 10), 100);
    let late = quill_vm::code::instrs(code).len() - 2;
    assert_eq!(quill_vm::code::line_for(code, late), 1700);
}

#[test]
fn handler_selection_enumerated_over_every_offset() {
    // Three nested/overlapping protected ranges; the first (innermost)
    // containing entry must win for every valid instruction offset.
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "nested_spans",
        CodeFlags::empty(),
        0,
        10,
        &[],
        |b, ts| {
            let mut marks = Vec::new();
            // Offsets are marked by padding with 1-byte CLEAR_ACC ops.
            for _ in 0..6 {
                let label = b.label();
                b.bind(label);
                marks.push(label);
                for _ in 0..8 {
                    b.op(Opcode::CLEAR_ACC);
                }
            }
            let tail = b.label();
            b.bind(tail);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
            // innermost-first: [m2,m3) then [m1,m4) then [m0,m5)
            b.handler(marks[2], marks[3], tail, 6);
            b.handler(marks[1], marks[4], tail, 4);
            b.handler(marks[0], marks[5], tail, 2);
        },
    );
    let code = func::code_of(func.as_obj());
    // Reconstruct the model from the published table and enumerate.
    let table: Vec<_> = quill_vm::code::handlers(code).to_vec();
    assert_eq!(table.len(), 3);
    let len = quill_vm::code::instrs(code).len();
    for pc in 0..len {
        let expected = table
            .iter()
            .find(|eh| (eh.start as usize) <= pc && pc < eh.handler as usize)
            .copied();
        assert_eq!(
            quill_vm::code::handler_for(code, pc),
            expected,
            "offset {pc}"
        );
    }
    // Spot-check the nesting: an offset inside all three ranges picks
    // the innermost link register.
    let inner_pc = table[0].start as usize;
    assert_eq!(quill_vm::code::handler_for(code, inner_pc).unwrap().link_reg, 6);
}

#[test]
fn handler_lookup_on_a_real_code_object() {
    let mut vm = Vm::new();
    let globals = vm.globals();
    let func = vm.function(
        globals.as_obj(),
        "spans",
        CodeFlags::empty(),
        0,
        8,
        &[],
        |b, ts| {
            let start = b.label();
            let handler = b.label();
            let end = b.label();
            b.bind(start);
            let one = b.const_int(ts, 1);
            b.op_u16(Opcode::LOAD_CONST, one);
            b.op(Opcode::RETURN_VALUE);
            b.bind(handler);
            b.op(Opcode::RAISE);
            b.bind(end);
            b.handler(start, handler, end, 2);
        },
    );
    let code = func::code_of(func.as_obj());
    let inside = quill_vm::code::handler_for(code, 4);
    assert!(inside.is_some());
    let entry = inside.unwrap();
    assert_eq!(entry.link_reg, 2);
    // Offsets inside the handler body are not protected by it.
    assert!(quill_vm::code::handler_for(code, entry.handler as usize).is_none());
}
