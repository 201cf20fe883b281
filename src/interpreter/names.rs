//! Name resolution: globals, builtins and the inline cache
//!
//! `LOAD_GLOBAL` caches `(version, slot)` per call site on the function
//! object. A positive slot re-reads the keys block directly while the
//! mapping's version is unchanged; a negative slot records "absent from
//! globals at that version", skipping straight to builtins.

use crate::dict::{self, SlotLookup};
use crate::error::{ExcKind, ExecResult};
use crate::object::{func, string, Obj, ObjRef};
use crate::thread::ThreadState;

/// Cached global load.
pub(crate) fn load_global(
    ts: &mut ThreadState,
    function: Obj,
    name: Obj,
    site: usize,
) -> ExecResult<ObjRef> {
    let globals = func::globals_of(function);
    let builtins = func::builtins_of(function);

    if let Some(cache) = func::global_cache(function, site) {
        if let Some((version, slot)) = cache.load() {
            if slot >= 0 {
                if let Some(value) = dict::load_slot(globals, slot as u32, version) {
                    return Ok(value);
                }
            } else if dict::version(globals) == version {
                // Still absent from globals; only builtins can answer.
                if let Some(value) = dict::get(ts, builtins, name)? {
                    return Ok(value);
                }
                return Err(crate::code::err_name(ts, name));
            }
        }
    }

    // Cache cold or stale: probe and refill.
    match dict::lookup_interned_slot(globals, name) {
        Some(SlotLookup {
            version,
            slot,
            value: Some(value),
        }) => {
            if let Some(cache) = func::global_cache(function, site) {
                cache.store(version, slot);
            }
            Ok(value)
        }
        Some(SlotLookup { version, .. }) => {
            if let Some(cache) = func::global_cache(function, site) {
                cache.store(version, -1);
            }
            match dict::get(ts, builtins, name)? {
                Some(value) => Ok(value),
                None => Err(crate::code::err_name(ts, name)),
            }
        }
        // Generic keys block: the locked path, uncached.
        None => match dict::get(ts, globals, name)? {
            Some(value) => Ok(value),
            None => match dict::get(ts, builtins, name)? {
                Some(value) => Ok(value),
                None => Err(crate::code::err_name(ts, name)),
            },
        },
    }
}

/// Uncached module-level name load: globals, then builtins.
pub(crate) fn load_name(ts: &mut ThreadState, function: Obj, name: Obj) -> ExecResult<ObjRef> {
    let globals = func::globals_of(function);
    if let Some(value) = dict::get(ts, globals, name)? {
        return Ok(value);
    }
    let builtins = func::builtins_of(function);
    match dict::get(ts, builtins, name)? {
        Some(value) => Ok(value),
        None => Err(crate::code::err_name(ts, name)),
    }
}

/// Store into the function's globals.
pub(crate) fn store_global(
    ts: &mut ThreadState,
    function: Obj,
    name: Obj,
    value: Obj,
) -> ExecResult<()> {
    dict::set(ts, func::globals_of(function), name, value)
}

/// Delete from the function's globals; absent names raise NameError.
pub(crate) fn delete_global(ts: &mut ThreadState, function: Obj, name: Obj) -> ExecResult<()> {
    if dict::delete(ts, func::globals_of(function), name)? {
        Ok(())
    } else {
        Err(crate::code::err_name(ts, name))
    }
}

/// Class-body free variable: the cell when bound, else the enclosing
/// namespace chain.
pub(crate) fn load_classderef(
    ts: &mut ThreadState,
    function: Obj,
    cell: Obj,
    name: Obj,
) -> ExecResult<ObjRef> {
    if let Some(value) = func::cell_get(cell) {
        return Ok(value);
    }
    load_name(ts, function, name)
}

/// Raise the unbound-local error for register `reg` of `code`.
pub(crate) fn err_unbound(ts: &mut ThreadState, code: Obj, reg: usize) -> crate::error::Raised {
    let varnames = crate::code::varnames(code);
    let name = varnames
        .get(reg)
        .map(|n| string::as_str(n.as_obj()).to_owned())
        .unwrap_or_else(|| format!("<register {reg}>"));
    ts.raise(
        ExcKind::UnboundLocalError,
        format!("local variable '{name}' referenced before assignment"),
    )
}
