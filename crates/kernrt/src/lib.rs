//! CPU execution engine for precompiled data-parallel kernel modules.
//!
//! A [`Driver`] carries the process-wide collaborators (platform loader,
//! compiler service, dispatcher, object runtime). [`Script::create`] turns a
//! [`ScriptIdentity`] into a loaded module with its own globals, and the
//! script then runs routines, `root` and ForEach kernels against
//! [`Allocation`]s.

pub mod acquire;
pub mod allocation;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod error;
pub mod globals;
pub mod instancing;
pub mod launch;
pub mod lib_paths;
pub mod loader;
pub mod metadata;
pub mod objects;
pub mod runtime;
pub mod script;
pub mod symbols;

pub use acquire::{ScriptIdentity, ScriptSource};
pub use allocation::{Allocation, Dims, HostAllocation};
pub use compiler::{
    BuildRequest, CompilerService, ExternalCompiler, FloatPrecision, LinkRuntimeCallback,
    RuntimeLibraries, RuntimeSelector,
};
pub use config::{BuildMode, ContextKind, EngineConfig};
pub use driver::{Driver, DriverBuilder};
pub use error::{Result, ScriptError};
pub use launch::{
    compute_launch_bounds, Dispatcher, ForEachParams, LaunchBounds, LaunchDescriptor,
    LaunchOutcome, LaunchPlan, LaunchRange, SerialDispatcher,
};
pub use loader::{CodeModule, DlLoader, ModuleHandle, PlatformLoader, SymbolAddr};
pub use metadata::{ExportMetadata, ForEachExport, ForEachSignature, MetadataError};
pub use objects::{ElementDescriptor, HandleElement, ObjectRuntime, PlainElement};
pub use runtime::{allocation_for_pointer, with_current_script, with_published};
pub use script::{RootEntry, Script, ScriptInfo, ScriptState};
