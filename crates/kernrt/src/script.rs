//! Script Execution Engine.
//!
//! A [`Script`] owns one code module together with its resolved symbols and
//! global slots. It is `Loaded` once the module is open and fully resolved,
//! and `Ready` once its initializer has run. Entry points into the module
//! require `Ready`; global slot access does not.

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;

use kernrt_contracts::SYMBOL_INFO;
use serde::Serialize;

use crate::acquire::{acquire, ScriptIdentity, ScriptSource};
use crate::allocation::Allocation;
use crate::driver::Driver;
use crate::error::{Result, ScriptError};
use crate::globals::GlobalSlots;
use crate::launch::{
    compute_launch_bounds, Dispatcher, ForEachParams, LaunchDescriptor, LaunchOutcome, LaunchPlan,
    LaunchRange,
};
use crate::loader::CodeModule;
use crate::metadata::{self, ExportMetadata};
use crate::objects::ElementDescriptor;
use crate::runtime::CurrentScriptGuard;
use crate::symbols::SymbolTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptState {
    Loaded,
    Ready,
}

/// Root entry reported to the host runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RootEntry {
    Expanded,
    Plain,
    Absent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptInfo {
    pub exported_function_count: usize,
    pub exported_variable_count: usize,
    pub exported_foreach_count: usize,
    /// Prebuilt modules carry no pragmas.
    pub exported_pragma_count: usize,
    pub root: RootEntry,
}

pub struct Script {
    identity: ScriptIdentity,
    state: ScriptState,
    is_threadable: bool,
    metadata: ExportMetadata,
    symbols: SymbolTable,
    globals: GlobalSlots,
    dispatcher: Arc<dyn Dispatcher>,
    // Declared last: every address above points into this module.
    module: CodeModule,
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| ScriptError::Geometry(format!("{what} {value} does not fit in 32 bits")))
}

impl Script {
    /// Acquires the module for `identity`, reads its self-description and
    /// resolves every export. The initializer is not run.
    ///
    /// On failure everything acquired so far is released before returning.
    ///
    /// # Safety
    /// The module must be a compiled kernel module whose exports have the C
    /// signatures their roles imply. Opening it runs its static constructors.
    #[tracing::instrument(level = "debug", skip(driver, source), fields(mode = %source.mode()))]
    pub unsafe fn load(
        driver: &Driver,
        identity: ScriptIdentity,
        source: ScriptSource<'_>,
    ) -> Result<Self> {
        let _init = driver.lock_init();

        let module = acquire(driver, &identity, source)?;
        let info = module.export_info().ok_or_else(|| {
            ScriptError::Configuration(format!(
                "{} exports no {SYMBOL_INFO}",
                module.path().display()
            ))
        })?;
        let metadata = metadata::parse(info)?;
        let symbols = SymbolTable::resolve(&module, &metadata)?;
        let globals = GlobalSlots::new(symbols.variables(), driver.objects().clone())?;

        tracing::debug!(
            variables = metadata.variable_count(),
            functions = metadata.function_count(),
            foreach = metadata.foreach_count(),
            objects = metadata.object_slots.len(),
            "script loaded"
        );

        Ok(Self {
            identity,
            state: ScriptState::Loaded,
            is_threadable: driver.config().threadable,
            metadata,
            symbols,
            globals,
            dispatcher: driver.dispatcher().clone(),
            module,
        })
    }

    /// [`Script::load`] followed by [`Script::invoke_initializer`].
    ///
    /// # Safety
    /// Same as [`Script::load`].
    pub unsafe fn create(
        driver: &Driver,
        identity: ScriptIdentity,
        source: ScriptSource<'_>,
    ) -> Result<Self> {
        let mut script = Self::load(driver, identity, source)?;
        script.invoke_initializer();
        Ok(script)
    }

    pub fn identity(&self) -> &ScriptIdentity {
        &self.identity
    }

    pub fn state(&self) -> ScriptState {
        self.state
    }

    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn module(&self) -> &CodeModule {
        &self.module
    }

    pub fn is_threadable(&self) -> bool {
        self.is_threadable
    }

    pub fn info(&self) -> ScriptInfo {
        let root = if self.symbols.has_root_expand() {
            RootEntry::Expanded
        } else if self.symbols.has_root() {
            RootEntry::Plain
        } else {
            RootEntry::Absent
        };
        ScriptInfo {
            exported_function_count: self.metadata.function_count(),
            exported_variable_count: self.metadata.variable_count(),
            exported_foreach_count: self.metadata.foreach_count(),
            exported_pragma_count: 0,
            root,
        }
    }

    fn require_ready(&self) -> Result<()> {
        match self.state {
            ScriptState::Ready => Ok(()),
            ScriptState::Loaded => Err(ScriptError::NotReady(self.identity.res_name.clone())),
        }
    }

    /// Runs `init` if the module exports one and marks the script ready.
    pub fn invoke_initializer(&mut self) {
        if let Some(init) = self.symbols.init {
            // SAFETY: resolved from this script's module, which is still open.
            unsafe { init() };
        }
        self.state = ScriptState::Ready;
    }

    /// Runs `.rs.dtor` if the module exports one.
    pub fn invoke_finalizer(&self) {
        if let Some(dtor) = self.symbols.dtor {
            // SAFETY: see `invoke_initializer`.
            unsafe { dtor() };
        }
    }

    /// Calls `root()`. Returns `None` when the module has no root.
    pub fn invoke_root(&self) -> Result<Option<i32>> {
        self.require_ready()?;
        let Some(root) = self.symbols.root else {
            return Ok(None);
        };
        let _current = CurrentScriptGuard::enter(self);
        // SAFETY: see `invoke_initializer`.
        Ok(Some(unsafe { root() }))
    }

    /// Calls the exported function at `slot` with a raw parameter block.
    pub fn invoke_routine(&self, slot: usize, params: &[u8]) -> Result<()> {
        self.require_ready()?;
        let entry = self.symbols.function(slot)?;
        let len = u32::try_from(params.len()).map_err(|_| {
            ScriptError::ContractViolation(format!(
                "parameter block of {} bytes for function slot {slot}",
                params.len()
            ))
        })?;
        let ptr = if params.is_empty() {
            std::ptr::null()
        } else {
            params.as_ptr() as *const c_void
        };
        let _current = CurrentScriptGuard::enter(self);
        // SAFETY: see `invoke_initializer`; the block outlives the call.
        unsafe { entry(ptr, len) };
        Ok(())
    }

    /// Validates a ForEach request and builds its launch descriptor.
    pub fn configure_for_each_launch<'a>(
        &'a self,
        slot: usize,
        input: Option<&dyn Allocation>,
        output: Option<&dyn Allocation>,
        usr: Option<&[u8]>,
        range: Option<&LaunchRange>,
    ) -> Result<LaunchPlan<'a>> {
        self.require_ready()?;
        let (kernel, signature) = self.symbols.kernel(slot)?;

        if input.is_some_and(|a| a.backing_ptr().is_null()) {
            return Err(ScriptError::Geometry(
                "forEach called with an unbacked input allocation".to_string(),
            ));
        }
        if output.is_some_and(|a| a.backing_ptr().is_null()) {
            return Err(ScriptError::Geometry(
                "forEach called with an unbacked output allocation".to_string(),
            ));
        }
        let Some(shape) = input.or(output) else {
            return Err(ScriptError::Geometry(
                "forEach called without allocations".to_string(),
            ));
        };
        let dims = shape.dims();

        let Some(bounds) = compute_launch_bounds(dims, range)? else {
            return Ok(LaunchPlan::Skip);
        };

        let mut params = ForEachParams {
            dim_x: dims.x,
            dim_y: dims.y,
            dim_z: dims.z,
            slot: to_u32(slot, "forEach slot")?,
            ..ForEachParams::default()
        };
        if let Some(usr) = usr {
            params.usr = usr.as_ptr() as *const c_void;
            params.usr_len = to_u32(usr.len(), "user data length")?;
        }
        if let Some(a) = input {
            params.ptr_in = a.backing_ptr();
            params.e_stride_in = to_u32(a.element_size_bytes(), "input element size")?;
            params.y_stride_in = to_u32(a.row_stride_bytes(), "input row stride")?;
        }
        if let Some(a) = output {
            params.ptr_out = a.backing_ptr();
            params.e_stride_out = to_u32(a.element_size_bytes(), "output element size")?;
            params.y_stride_out = to_u32(a.row_stride_bytes(), "output row stride")?;
        }

        Ok(LaunchPlan::Dispatch(LaunchDescriptor {
            script: self,
            params,
            bounds,
            kernel,
            signature,
            is_threadable: self.is_threadable,
            slice_size: 1,
        }))
    }

    /// Configures and dispatches a ForEach launch. Returns after every cell
    /// has run, or right away when the requested range is empty.
    pub fn invoke_for_each(
        &self,
        slot: usize,
        input: Option<&dyn Allocation>,
        output: Option<&dyn Allocation>,
        usr: Option<&[u8]>,
        range: Option<&LaunchRange>,
    ) -> Result<LaunchOutcome> {
        let launch = match self.configure_for_each_launch(slot, input, output, usr, range)? {
            LaunchPlan::Dispatch(launch) => launch,
            LaunchPlan::Skip => {
                tracing::debug!(slot, ?range, "empty forEach range, skipping");
                return Ok(LaunchOutcome::Skipped);
            }
        };
        let _current = CurrentScriptGuard::enter(self);
        self.dispatcher.dispatch(input, output, range, &launch);
        Ok(LaunchOutcome::Dispatched)
    }

    /// # Safety
    /// The global at `slot` must be at least `out.len()` bytes.
    pub unsafe fn read_global(&self, slot: usize, out: &mut [u8]) -> Result<()> {
        self.globals.read(slot, out)
    }

    /// # Safety
    /// The global at `slot` must be at least `data.len()` bytes.
    pub unsafe fn write_global(&mut self, slot: usize, data: &[u8]) -> Result<()> {
        self.globals.write(slot, data)
    }

    pub fn write_global_object(&mut self, slot: usize, obj: Option<NonNull<c_void>>) -> Result<()> {
        self.globals.write_object(slot, obj)
    }

    /// # Safety
    /// The global at `slot` must hold `dims[0]` elements described by
    /// `element`.
    pub unsafe fn write_global_array(
        &mut self,
        slot: usize,
        data: &[u8],
        element: &dyn ElementDescriptor,
        dims: &[usize],
    ) -> Result<()> {
        self.globals.write_array(slot, data, element, dims)
    }

    pub fn bind_allocation(
        &mut self,
        slot: usize,
        alloc: Option<&Arc<dyn Allocation>>,
    ) -> Result<()> {
        self.globals.bind_allocation(slot, alloc)
    }

    pub fn bound_allocation(&self, slot: usize) -> Result<Option<Arc<dyn Allocation>>> {
        self.globals.bound_allocation(slot)
    }

    pub fn allocation_for_pointer(&self, ptr: *const u8) -> Option<Arc<dyn Allocation>> {
        self.globals.resolve_allocation_by_pointer(ptr)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("identity", &self.identity)
            .field("state", &self.state)
            .field("module", &self.module)
            .field("symbols", &self.symbols)
            .field("globals", &self.globals)
            .finish_non_exhaustive()
    }
}

impl Drop for Script {
    fn drop(&mut self) {
        let released = self.globals.release_objects();
        tracing::debug!(res = %self.identity.res_name, released, "destroying script");
    }
}
