//! Exception unwinding
//!
//! Raising exits the dispatch loop with the exception in the thread
//! state. The unwinder finds the innermost exception-table entry whose
//! protected range contains the faulting offset; on a hit it clears the
//! frame's registers above the link register, stores `-1` and the
//! exception into the link pair, and resumes at the handler. Frames
//! without a handler contribute a traceback line and are popped; the
//! walk stops at native entries and generator bottoms.

use crate::consts::*;
use crate::error::raised;
use crate::object::{exception, func, Obj, ObjRef};
use crate::thread::ThreadState;
use crate::value::Register;

/// Where the unwinder landed.
pub(crate) enum Unwound {
    /// A handler takes over; continue dispatch there.
    Handler { pc: usize, code: Obj },
    /// Unwound past a native entry frame; the exception is pending
    /// again and the evaluator must return.
    Native(crate::error::Raised),
    /// Unwound out of a generator's bottom frame; the generator is
    /// closed and its stack popped.
    Generator(crate::error::Raised),
}

/// Unwind from the current frame at `pc`. The pending exception is
/// consumed and either parked in a handler's link pair or re-stored for
/// propagation.
pub(crate) fn unwind(ts: &mut ThreadState, mut pc: usize) -> Unwound {
    let mut exc = ts.take_exc();
    loop {
        let callee = ts.active_mut().callee();
        let function = match callee {
            Some(obj) if obj.is_exact(ts.rt().types.function) => obj,
            _ => {
                // A frame without an interpreted callee can only be the
                // native entry frame.
                let link = ts.active_mut().pop_frame(0);
                debug_assert_eq!(link, FRAME_C);
                ts.cur_exc = Some(exc);
                return Unwound::Native(raised());
            }
        };
        let code = func::code_of(function);

        // The header offset means the frame never started running; it
        // contributes no traceback line.
        if pc > 0 {
            exception::push_trace(
                exc.as_obj(),
                exception::TraceEntry {
                    filename: ObjRef::new(crate::code::filename(code)),
                    qualname: ObjRef::new(crate::code::qualname(code)),
                    line: crate::code::line_for(code, pc),
                },
            );
            crate::trace::exception_event(ts, function, pc);
        }

        if let Some(handler) = crate::code::handler_for(code, pc) {
            let framesize = crate::code::signature(code).framesize as usize;
            let stack = ts.active_mut();
            stack.clear_range(handler.link_reg as isize, framesize);
            stack.put(handler.link_reg as isize, Register::from_payload(-1));
            stack.put(
                handler.link_reg as isize + 1,
                Register::owned(exc.into_raw()),
            );
            stack.pc = handler.handler as usize;
            return Unwound::Handler {
                pc: handler.handler as usize,
                code,
            };
        }

        crate::trace::return_event(ts, function, pc);
        let framesize = crate::code::signature(code).framesize as usize;
        let link = ts.active_mut().pop_frame(framesize);
        match link {
            FRAME_C => {
                ts.cur_exc = Some(exc);
                return Unwound::Native(raised());
            }
            FRAME_GENERATOR => {
                crate::generator::close_on_unwind(ts);
                ts.cur_exc = Some(exc);
                return Unwound::Generator(raised());
            }
            resume => {
                debug_assert!(resume >= 0);
                pc = resume as usize;
                ts.active_mut().pc = pc;
            }
        }
    }
}

/// The innermost handled exception: the exception stored in a link pair
/// whose handler range covers the frame's current offset. Used for
/// implicit chaining and bare `raise`.
pub(crate) fn handled_exc(ts: &ThreadState) -> Option<Obj> {
    let function_ty = ts.rt().types.function;
    let mut stack = Some(unsafe { ts.active_ref() });
    while let Some(s) = stack {
        let mut base = s.base;
        let mut pc = s.pc;
        while base >= FRAME_EXTRA {
            let callee = s.regs[base - 1];
            if callee.is_object() && callee.as_obj().is_exact(function_ty) {
                let code = func::code_of(callee.as_obj());
                for handler in crate::code::handlers(code) {
                    if (handler.handler as usize) <= pc && pc < handler.handler_end as usize {
                        let link = s.regs[base + handler.link_reg as usize];
                        if link.is_payload() && link.payload() == -1 {
                            let exc = s.regs[base + handler.link_reg as usize + 1];
                            if exc.is_object() {
                                return Some(exc.as_obj());
                            }
                        }
                    }
                }
            }
            // Step to the caller frame.
            let link = s.regs[base - 3];
            let delta = s.regs[base - 4];
            if !link.is_payload() || !delta.is_payload() {
                break;
            }
            let link = link.payload();
            if link == FRAME_GENERATOR || base == FRAME_EXTRA {
                break;
            }
            if link >= 0 {
                pc = link as usize;
            }
            let step = delta.payload() as usize;
            if step == 0 || step > base {
                break;
            }
            base -= step;
        }
        stack = unsafe { s.prev.as_ref() };
    }
    None
}
