//! Resolved entry points of a loaded module, indexed by export slot.
//!
//! Every address is resolved once, right after the module is opened, and
//! converted to a typed function pointer. Callers invoke by index and never
//! look names up again.

use std::ffi::c_void;
use std::fmt;

use kernrt_contracts::{
    FOREACH_EXPAND_SUFFIX, SYMBOL_DTOR, SYMBOL_INIT, SYMBOL_ROOT, SYMBOL_ROOT_EXPAND,
};

use crate::error::{table_with_capacity, Result, ScriptError};
use crate::launch::ForEachParams;
use crate::loader::{CodeModule, SymbolAddr};
use crate::metadata::{ExportMetadata, ForEachSignature};

/// `int root(void)`
pub type RootFn = unsafe extern "C" fn() -> i32;
/// `void init(void)` and `void .rs.dtor(void)`
pub type InitFn = unsafe extern "C" fn();
/// `void fn(const void *params, uint32_t params_len)`
pub type InvokeFn = unsafe extern "C" fn(*const c_void, u32);
/// `void name.expand(const params *, uint32_t x1, uint32_t x2, uint32_t instep, uint32_t outstep)`
pub type ForEachFn = unsafe extern "C" fn(*const ForEachParams, u32, u32, u32, u32);

#[derive(Debug, Clone)]
pub struct VariableSymbol {
    pub name: String,
    pub addr: Option<SymbolAddr>,
    pub is_object: bool,
}

#[derive(Debug, Clone)]
pub struct ForEachSymbol {
    pub name: String,
    pub signature: ForEachSignature,
    /// Only slot 0 may be unresolved.
    pub kernel: Option<ForEachFn>,
}

#[derive(Debug, Clone)]
pub struct FunctionSymbol {
    pub name: String,
    pub entry: InvokeFn,
}

pub struct SymbolTable {
    pub(crate) root: Option<RootFn>,
    pub(crate) root_expand: Option<ForEachFn>,
    pub(crate) init: Option<InitFn>,
    pub(crate) dtor: Option<InitFn>,
    pub(crate) variables: Vec<VariableSymbol>,
    pub(crate) functions: Vec<FunctionSymbol>,
    pub(crate) foreach: Vec<ForEachSymbol>,
}

// SAFETY (all casts below): the module's self-description declares these
// exports with the matching C signatures.
unsafe fn as_root(addr: SymbolAddr) -> RootFn {
    std::mem::transmute::<*mut c_void, RootFn>(addr.as_ptr())
}

unsafe fn as_init(addr: SymbolAddr) -> InitFn {
    std::mem::transmute::<*mut c_void, InitFn>(addr.as_ptr())
}

unsafe fn as_invoke(addr: SymbolAddr) -> InvokeFn {
    std::mem::transmute::<*mut c_void, InvokeFn>(addr.as_ptr())
}

unsafe fn as_foreach(addr: SymbolAddr) -> ForEachFn {
    std::mem::transmute::<*mut c_void, ForEachFn>(addr.as_ptr())
}

impl SymbolTable {
    /// Resolves every export `meta` declares.
    ///
    /// Missing variables are tolerated (their slot stays null). A missing
    /// function, or a missing ForEach kernel at any slot but 0, fails with
    /// [`ScriptError::Loader`].
    ///
    /// # Safety
    /// The module's exports must have the signatures their names imply.
    pub unsafe fn resolve(module: &CodeModule, meta: &ExportMetadata) -> Result<Self> {
        let root = module.resolve(SYMBOL_ROOT).map(|a| as_root(a));
        let root_expand = module.resolve(SYMBOL_ROOT_EXPAND).map(|a| as_foreach(a));
        let init = module.resolve(SYMBOL_INIT).map(|a| as_init(a));
        let dtor = module.resolve(SYMBOL_DTOR).map(|a| as_init(a));

        let mut variables = table_with_capacity(meta.variable_count(), "variable")?;
        for (i, name) in meta.variables.iter().enumerate() {
            let addr = module.resolve(name);
            if addr.is_none() {
                tracing::warn!(
                    variable = %name,
                    diagnostic = %module.resolve_error(name),
                    "exported variable has no address"
                );
            }
            variables.push(VariableSymbol {
                name: name.clone(),
                addr,
                is_object: meta.is_object(i),
            });
        }

        let mut functions = table_with_capacity(meta.function_count(), "function")?;
        for name in &meta.functions {
            let Some(addr) = module.resolve(name) else {
                let diagnostic = module.resolve_error(name);
                tracing::error!(function = %name, %diagnostic, "missing exported function");
                return Err(ScriptError::loader(format!("function {name}()"), diagnostic));
            };
            functions.push(FunctionSymbol {
                name: name.clone(),
                entry: as_invoke(addr),
            });
        }

        let mut foreach = table_with_capacity(meta.foreach_count(), "forEach")?;
        for (i, export) in meta.foreach.iter().enumerate() {
            let expanded = format!("{}{FOREACH_EXPAND_SUFFIX}", export.name);
            let kernel = module.resolve(&expanded).map(|a| as_foreach(a));
            if kernel.is_none() {
                let diagnostic = module.resolve_error(&expanded);
                if i != 0 {
                    tracing::error!(kernel = %expanded, %diagnostic, "missing forEach kernel");
                    return Err(ScriptError::loader(format!("forEach kernel {expanded}"), diagnostic));
                }
                tracing::debug!(kernel = %expanded, "no default forEach kernel");
            }
            foreach.push(ForEachSymbol {
                name: export.name.clone(),
                signature: export.signature,
                kernel,
            });
        }

        Ok(Self {
            root,
            root_expand,
            init,
            dtor,
            variables,
            functions,
            foreach,
        })
    }

    pub fn variables(&self) -> &[VariableSymbol] {
        &self.variables
    }

    pub fn functions(&self) -> &[FunctionSymbol] {
        &self.functions
    }

    pub fn foreach(&self) -> &[ForEachSymbol] {
        &self.foreach
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn has_root_expand(&self) -> bool {
        self.root_expand.is_some()
    }

    pub fn has_init(&self) -> bool {
        self.init.is_some()
    }

    pub fn has_dtor(&self) -> bool {
        self.dtor.is_some()
    }

    pub(crate) fn function(&self, slot: usize) -> Result<InvokeFn> {
        self.functions.get(slot).map(|f| f.entry).ok_or_else(|| {
            ScriptError::ContractViolation(format!(
                "function slot {slot} out of range ({} exported)",
                self.functions.len()
            ))
        })
    }

    pub(crate) fn kernel(&self, slot: usize) -> Result<(ForEachFn, ForEachSignature)> {
        let entry = self.foreach.get(slot).ok_or_else(|| {
            ScriptError::ContractViolation(format!(
                "forEach slot {slot} out of range ({} exported)",
                self.foreach.len()
            ))
        })?;
        let kernel = entry.kernel.ok_or_else(|| {
            ScriptError::ContractViolation(format!(
                "forEach slot {slot} ({}) has no kernel",
                entry.name
            ))
        })?;
        Ok((kernel, entry.signature))
    }
}

impl fmt::Debug for SymbolTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SymbolTable")
            .field("root", &self.root.is_some())
            .field("root_expand", &self.root_expand.is_some())
            .field("init", &self.init.is_some())
            .field("dtor", &self.dtor.is_some())
            .field("variables", &self.variables.len())
            .field("functions", &self.functions.len())
            .field("foreach", &self.foreach.len())
            .finish()
    }
}
