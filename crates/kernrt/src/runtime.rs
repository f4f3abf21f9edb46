//! Per-thread "currently executing script" and the support calls that rely
//! on it.
//!
//! Compiled kernels call back into runtime support without a context
//! argument. Every entry into a module publishes its script here for the
//! duration of the call; each dispatcher worker publishes it for itself.

use std::cell::Cell;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::allocation::Allocation;
use crate::script::Script;

thread_local! {
    static CURRENT: Cell<*const Script> = const { Cell::new(std::ptr::null()) };
}

/// Publishes a script as current on this thread until dropped, then restores
/// whatever was current before. Guards must be dropped in reverse order of
/// entry, so they never leave the crate.
pub(crate) struct CurrentScriptGuard<'a> {
    prev: *const Script,
    _script: PhantomData<&'a Script>,
}

impl<'a> CurrentScriptGuard<'a> {
    pub(crate) fn enter(script: &'a Script) -> Self {
        let prev = CURRENT.with(|c| c.replace(script as *const Script));
        Self {
            prev,
            _script: PhantomData,
        }
    }
}

impl Drop for CurrentScriptGuard<'_> {
    fn drop(&mut self) {
        CURRENT.with(|c| c.set(self.prev));
    }
}

/// Runs `f` with `script` published as current on this thread. The previous
/// script, if any, is current again once `f` returns or unwinds.
pub fn with_published<R>(script: &Script, f: impl FnOnce() -> R) -> R {
    let _current = CurrentScriptGuard::enter(script);
    f()
}

/// Runs `f` with the script current on this thread, if any.
pub fn with_current_script<R>(f: impl FnOnce(&Script) -> R) -> Option<R> {
    let ptr = CURRENT.with(Cell::get);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: a non-null value was published by a live guard on this thread.
    // Guards are scoped and dropped in reverse order, and each borrows its
    // script for as long as it is published.
    Some(f(unsafe { &*ptr }))
}

pub fn has_current_script() -> bool {
    CURRENT.with(|c| !c.get().is_null())
}

/// Recovers the allocation bound to the current script whose backing buffer
/// starts at `ptr`.
pub fn allocation_for_pointer(ptr: *const u8) -> Option<Arc<dyn Allocation>> {
    with_current_script(|script| script.allocation_for_pointer(ptr)).flatten()
}
