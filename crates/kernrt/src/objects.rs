//! Reference-counted object handles stored in script globals.
//!
//! Every store into an object-typed location takes the new reference before
//! dropping the old one, so reassigning an object to itself (or to an alias
//! of itself) never lets its count reach zero in between.

use std::ffi::c_void;
use std::ptr::NonNull;

/// Reference counting provided by the object runtime that owns the handles.
pub trait ObjectRuntime: Send + Sync {
    fn inc_ref(&self, obj: NonNull<c_void>);
    fn dec_ref(&self, obj: NonNull<c_void>);
}

/// Describes the layout of one array element and the object references it
/// embeds.
pub trait ElementDescriptor {
    fn size_bytes(&self) -> usize;

    /// Takes a reference on every object embedded in the element.
    ///
    /// # Safety
    /// `elem` must point to `size_bytes()` readable bytes laid out as this
    /// descriptor describes.
    unsafe fn inc_refs(&self, elem: *const u8);

    /// Drops a reference on every object embedded in the element.
    ///
    /// # Safety
    /// Same as [`ElementDescriptor::inc_refs`].
    unsafe fn dec_refs(&self, elem: *const u8);
}

/// Element without embedded objects.
#[derive(Debug, Clone, Copy)]
pub struct PlainElement {
    pub size: usize,
}

impl ElementDescriptor for PlainElement {
    fn size_bytes(&self) -> usize {
        self.size
    }

    unsafe fn inc_refs(&self, _elem: *const u8) {}

    unsafe fn dec_refs(&self, _elem: *const u8) {}
}

/// Element that is exactly one object handle.
pub struct HandleElement<'a> {
    pub runtime: &'a dyn ObjectRuntime,
}

impl ElementDescriptor for HandleElement<'_> {
    fn size_bytes(&self) -> usize {
        std::mem::size_of::<*mut c_void>()
    }

    unsafe fn inc_refs(&self, elem: *const u8) {
        if let Some(obj) = NonNull::new((elem as *const *mut c_void).read_unaligned()) {
            self.runtime.inc_ref(obj);
        }
    }

    unsafe fn dec_refs(&self, elem: *const u8) {
        if let Some(obj) = NonNull::new((elem as *const *mut c_void).read_unaligned()) {
            self.runtime.dec_ref(obj);
        }
    }
}

/// A pointer-sized location that owns one reference to an object.
pub struct ObjectSlot<'a> {
    cell: NonNull<*mut c_void>,
    runtime: &'a dyn ObjectRuntime,
}

impl<'a> ObjectSlot<'a> {
    /// # Safety
    /// `cell` must be a valid, pointer-aligned location holding either null
    /// or an object handle that owns a reference, and must not be accessed
    /// concurrently while the slot is alive.
    pub unsafe fn from_raw(cell: NonNull<*mut c_void>, runtime: &'a dyn ObjectRuntime) -> Self {
        Self { cell, runtime }
    }

    pub fn get(&self) -> Option<NonNull<c_void>> {
        // SAFETY: upheld by `from_raw`.
        NonNull::new(unsafe { self.cell.as_ptr().read() })
    }

    pub fn assign(&mut self, new: Option<NonNull<c_void>>) {
        if let Some(new) = new {
            self.runtime.inc_ref(new);
        }
        if let Some(old) = self.get() {
            self.runtime.dec_ref(old);
        }
        let raw = new.map_or(std::ptr::null_mut(), NonNull::as_ptr);
        // SAFETY: upheld by `from_raw`.
        unsafe { self.cell.as_ptr().write(raw) };
    }

    /// Drops the held reference, if any. Returns whether one was released.
    pub fn clear(&mut self) -> bool {
        let Some(old) = self.get() else {
            return false;
        };
        self.runtime.dec_ref(old);
        // SAFETY: upheld by `from_raw`.
        unsafe { self.cell.as_ptr().write(std::ptr::null_mut()) };
        true
    }
}
