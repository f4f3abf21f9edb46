//! Exported global variables, addressed by slot.
//!
//! The store is not synchronized. Mutating operations take `&mut self`, so a
//! script cannot be written while a launch holds it by shared reference.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use crate::allocation::Allocation;
use crate::error::{table_with_capacity, Result, ScriptError};
use crate::loader::SymbolAddr;
use crate::objects::{ElementDescriptor, ObjectRuntime, ObjectSlot};
use crate::symbols::VariableSymbol;

struct GlobalSlot {
    /// `None` when the module optimized the global away.
    addr: Option<SymbolAddr>,
    is_object: bool,
    bound: Option<Weak<dyn Allocation>>,
}

pub struct GlobalSlots {
    slots: Vec<GlobalSlot>,
    runtime: Arc<dyn ObjectRuntime>,
}

impl GlobalSlots {
    pub fn new(variables: &[VariableSymbol], runtime: Arc<dyn ObjectRuntime>) -> Result<Self> {
        let mut slots = table_with_capacity(variables.len(), "global slot")?;
        slots.extend(variables.iter().map(|v| GlobalSlot {
            addr: v.addr,
            is_object: v.is_object,
            bound: None,
        }));
        Ok(Self { slots, runtime })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, slot: usize) -> Result<&GlobalSlot> {
        self.slots.get(slot).ok_or_else(|| {
            ScriptError::ContractViolation(format!(
                "global slot {slot} out of range ({} exported)",
                self.slots.len()
            ))
        })
    }

    fn slot_mut(&mut self, slot: usize) -> Result<&mut GlobalSlot> {
        let len = self.slots.len();
        self.slots.get_mut(slot).ok_or_else(|| {
            ScriptError::ContractViolation(format!(
                "global slot {slot} out of range ({len} exported)"
            ))
        })
    }

    pub fn address(&self, slot: usize) -> Result<Option<SymbolAddr>> {
        Ok(self.slot(slot)?.addr)
    }

    pub fn is_object(&self, slot: usize) -> Result<bool> {
        Ok(self.slot(slot)?.is_object)
    }

    /// Copies `out.len()` bytes out of the global.
    ///
    /// # Safety
    /// The global must be at least `out.len()` bytes long.
    pub unsafe fn read(&self, slot: usize, out: &mut [u8]) -> Result<()> {
        let Some(addr) = self.slot(slot)?.addr else {
            return Ok(());
        };
        std::ptr::copy_nonoverlapping(addr.as_ptr() as *const u8, out.as_mut_ptr(), out.len());
        Ok(())
    }

    /// Copies `data` into the global. Object globals must go through
    /// [`GlobalSlots::write_object`].
    ///
    /// # Safety
    /// The global must be at least `data.len()` bytes long.
    pub unsafe fn write(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        let entry = self.slot(slot)?;
        if entry.is_object {
            return Err(ScriptError::ContractViolation(format!(
                "global slot {slot} holds an object reference; raw writes are not allowed"
            )));
        }
        let Some(addr) = entry.addr else {
            return Ok(());
        };
        std::ptr::copy_nonoverlapping(data.as_ptr(), addr.as_ptr() as *mut u8, data.len());
        Ok(())
    }

    pub fn write_object(&mut self, slot: usize, obj: Option<NonNull<c_void>>) -> Result<()> {
        let entry = self.slot(slot)?;
        if !entry.is_object {
            return Err(ScriptError::ContractViolation(format!(
                "global slot {slot} is not an object slot"
            )));
        }
        let Some(addr) = entry.addr else {
            return Ok(());
        };
        // SAFETY: object globals are pointer-sized handle cells owned by the
        // module; `&mut self` serializes access.
        let mut cell = unsafe {
            ObjectSlot::from_raw(addr.as_non_null().cast::<*mut c_void>(), self.runtime.as_ref())
        };
        cell.assign(obj);
        Ok(())
    }

    /// Replaces a one-dimensional array global with `data`, taking the new
    /// elements' references before releasing the old ones.
    ///
    /// # Safety
    /// The global must hold at least `dims[0]` elements laid out as `element`
    /// describes, and `data` must hold exactly that many.
    pub unsafe fn write_array(
        &mut self,
        slot: usize,
        data: &[u8],
        element: &dyn ElementDescriptor,
        dims: &[usize],
    ) -> Result<()> {
        let entry = self.slot(slot)?;
        let &[count] = dims else {
            return Err(ScriptError::ContractViolation(format!(
                "global slot {slot}: only one-dimensional arrays are supported, got {} dimensions",
                dims.len()
            )));
        };
        let stride = element.size_bytes();
        if count.checked_mul(stride) != Some(data.len()) {
            return Err(ScriptError::ContractViolation(format!(
                "global slot {slot}: {} bytes do not hold {count} elements of {stride} bytes",
                data.len()
            )));
        }
        let Some(addr) = entry.addr else {
            return Ok(());
        };
        let dest = addr.as_ptr() as *mut u8;

        for i in 0..count {
            element.inc_refs(data.as_ptr().add(i * stride));
        }
        for i in 0..count {
            element.dec_refs(dest.add(i * stride));
        }
        std::ptr::copy_nonoverlapping(data.as_ptr(), dest, data.len());
        Ok(())
    }

    /// Points the global at `alloc`'s backing buffer and remembers the
    /// allocation for reverse lookups. `None` clears both.
    pub fn bind_allocation(
        &mut self,
        slot: usize,
        alloc: Option<&Arc<dyn Allocation>>,
    ) -> Result<()> {
        let entry = self.slot_mut(slot)?;
        let Some(addr) = entry.addr else {
            tracing::debug!(slot, "binding to an optimized-away global ignored");
            return Ok(());
        };
        entry.bound = alloc.map(Arc::downgrade);
        let ptr = alloc.map_or(std::ptr::null_mut(), |a| a.backing_ptr());
        // SAFETY: allocation globals are pointer-sized.
        unsafe { (addr.as_ptr() as *mut *mut u8).write_unaligned(ptr) };
        Ok(())
    }

    pub fn bound_allocation(&self, slot: usize) -> Result<Option<Arc<dyn Allocation>>> {
        Ok(self.slot(slot)?.bound.as_ref().and_then(Weak::upgrade))
    }

    /// Finds the bound allocation whose backing buffer starts at `ptr`.
    pub fn resolve_allocation_by_pointer(&self, ptr: *const u8) -> Option<Arc<dyn Allocation>> {
        if ptr.is_null() {
            return None;
        }
        let found = self
            .slots
            .iter()
            .filter_map(|s| s.bound.as_ref().and_then(Weak::upgrade))
            .find(|a| a.backing_ptr() as *const u8 == ptr);
        if found.is_none() {
            tracing::error!(?ptr, "no bound allocation for pointer");
        }
        found
    }

    /// Releases the reference held by every object global. Returns how many
    /// references were dropped.
    pub fn release_objects(&mut self) -> usize {
        let mut released = 0;
        for entry in self.slots.iter().filter(|s| s.is_object) {
            let Some(addr) = entry.addr else {
                continue;
            };
            // SAFETY: see `write_object`.
            let mut cell = unsafe {
                ObjectSlot::from_raw(addr.as_non_null().cast::<*mut c_void>(), self.runtime.as_ref())
            };
            if cell.clear() {
                released += 1;
            }
        }
        released
    }
}

impl fmt::Debug for GlobalSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalSlots")
            .field("len", &self.slots.len())
            .field(
                "objects",
                &self.slots.iter().filter(|s| s.is_object).count(),
            )
            .finish()
    }
}
