//! Trace and profile hooks
//!
//! Per-thread callbacks interposed on call, line, return and exception
//! boundaries. Line events fire when the instruction offset maps to a
//! different source line than the previously traced offset; profile
//! hooks see only call/return. A depth counter prevents a hook from
//! re-entering itself. A hook that raises is uninstalled.

use std::sync::Arc;

use crate::error::ExecResult;
use crate::object::{func, Obj};
use crate::thread::ThreadState;

/// One traced event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// An interpreted frame was entered.
    Call,
    /// Execution moved to a new source line.
    Line(u32),
    /// An interpreted frame is returning.
    Return,
    /// An exception is unwinding through a frame.
    Exception,
}

/// Hook signature shared by trace and profile callbacks.
pub type Hook = Arc<dyn Fn(&mut ThreadState, TraceEvent) -> ExecResult<()> + Send + Sync>;

/// Per-thread hook state.
pub struct TraceState {
    trace: Option<Hook>,
    profile: Option<Hook>,
    /// Non-zero while a hook is running.
    depth: u32,
    last_line: Option<u32>,
}

impl TraceState {
    pub(crate) fn new() -> TraceState {
        TraceState {
            trace: None,
            profile: None,
            depth: 0,
            last_line: None,
        }
    }

    /// Whether line events need computing at safety points.
    #[inline(always)]
    pub(crate) fn wants_lines(&self) -> bool {
        self.trace.is_some() && self.depth == 0
    }
}

/// Install (or clear) the trace hook on a thread.
pub fn set_trace(ts: &mut ThreadState, hook: Option<Hook>) {
    ts.trace.trace = hook;
    ts.trace.last_line = None;
}

/// Install (or clear) the profile hook on a thread.
pub fn set_profile(ts: &mut ThreadState, hook: Option<Hook>) {
    ts.trace.profile = hook;
}

fn fire(ts: &mut ThreadState, which: Which, event: TraceEvent) {
    let hook = match which {
        Which::Trace => ts.trace.trace.clone(),
        Which::Profile => ts.trace.profile.clone(),
    };
    let Some(hook) = hook else {
        return;
    };
    if ts.trace.depth > 0 {
        return;
    }
    ts.trace.depth += 1;
    let result = hook(ts, event);
    ts.trace.depth -= 1;
    if let Err(raised) = result {
        // A failing hook uninstalls itself, like the original.
        let _ = raised;
        let _ = ts.take_exc();
        match which {
            Which::Trace => ts.trace.trace = None,
            Which::Profile => ts.trace.profile = None,
        }
        tracing::warn!(target: "quill::trace", "trace hook raised; uninstalled");
    }
}

#[derive(Clone, Copy)]
enum Which {
    Trace,
    Profile,
}

/// Fire a line event when `pc` maps to a new line of `function`.
pub(crate) fn line_event(ts: &mut ThreadState, function: Obj, pc: usize) {
    if !ts.trace.wants_lines() {
        return;
    }
    let code = func::code_of(function);
    let line = crate::code::line_for(code, pc);
    if ts.trace.last_line == Some(line) {
        return;
    }
    ts.trace.last_line = Some(line);
    fire(ts, Which::Trace, TraceEvent::Line(line));
}

/// Fire call events on frame entry.
pub(crate) fn call_event(ts: &mut ThreadState) {
    if ts.trace.trace.is_none() && ts.trace.profile.is_none() {
        return;
    }
    ts.trace.last_line = None;
    fire(ts, Which::Trace, TraceEvent::Call);
    fire(ts, Which::Profile, TraceEvent::Call);
}

/// Fire return events on frame exit.
pub(crate) fn return_event(ts: &mut ThreadState, _function: Obj, _pc: usize) {
    if ts.trace.trace.is_none() && ts.trace.profile.is_none() {
        return;
    }
    ts.trace.last_line = None;
    fire(ts, Which::Trace, TraceEvent::Return);
    fire(ts, Which::Profile, TraceEvent::Return);
}

/// Fire an exception event while unwinding through a frame.
pub(crate) fn exception_event(ts: &mut ThreadState, _function: Obj, _pc: usize) {
    fire(ts, Which::Trace, TraceEvent::Exception);
}
