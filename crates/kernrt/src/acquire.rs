//! Module Acquirer: turns a script identity into an opened code module whose
//! globals belong to that script alone.

use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::compiler::BuildRequest;
use crate::config::BuildMode;
use crate::driver::Driver;
use crate::error::{Result, ScriptError};
use crate::instancing::{load_instanced, InstancedLoadError};
use crate::lib_paths::{describe_checked, prebuilt_library_candidates};
use crate::loader::CodeModule;

/// Which artifact a script is built from. Fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ScriptIdentity {
    pub cache_dir: PathBuf,
    pub res_name: String,
}

impl ScriptIdentity {
    pub fn new(cache_dir: impl Into<PathBuf>, res_name: impl Into<String>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            res_name: res_name.into(),
        }
    }
}

/// Where the code comes from.
#[derive(Debug, Clone, Copy)]
pub enum ScriptSource<'a> {
    /// Compile this source module on demand.
    Bitcode(&'a [u8]),
    /// Load the packaged library for the resource name.
    Prebuilt,
}

impl ScriptSource<'_> {
    pub fn mode(&self) -> BuildMode {
        match self {
            ScriptSource::Bitcode(_) => BuildMode::Compile,
            ScriptSource::Prebuilt => BuildMode::Prebuilt,
        }
    }
}

/// Caller must hold the driver's init lock.
pub(crate) fn acquire(
    driver: &Driver,
    identity: &ScriptIdentity,
    source: ScriptSource<'_>,
) -> Result<CodeModule> {
    match source {
        ScriptSource::Prebuilt => acquire_prebuilt(driver, identity),
        ScriptSource::Bitcode(bitcode) => acquire_compiled(driver, identity, bitcode),
    }
}

/// Opens `path` with instancing. `Ok(None)` when there is no file.
fn open_instanced(
    driver: &Driver,
    path: &Path,
    identity: &ScriptIdentity,
) -> Result<Option<CodeModule>> {
    let loader = driver.loader();
    match load_instanced(loader.as_ref(), path, &identity.cache_dir, &identity.res_name) {
        Ok((handle, opened)) => Ok(Some(CodeModule::new(loader.clone(), handle, opened))),
        Err(InstancedLoadError::Missing) => Ok(None),
        Err(InstancedLoadError::Loader(diagnostic)) => {
            tracing::error!(path = %path.display(), %diagnostic, "unable to open library");
            Err(ScriptError::loader(path.display().to_string(), diagnostic))
        }
        Err(InstancedLoadError::Alias(err)) => {
            tracing::error!(path = %path.display(), "instancing failed: {err:#}");
            Err(ScriptError::Configuration(format!(
                "instancing {}: {err:#}",
                path.display()
            )))
        }
    }
}

#[tracing::instrument(level = "debug", skip(driver), fields(res = %identity.res_name))]
fn acquire_prebuilt(driver: &Driver, identity: &ScriptIdentity) -> Result<CodeModule> {
    let candidates = prebuilt_library_candidates(
        &identity.cache_dir,
        &identity.res_name,
        &driver.config().system_lib_dir,
    );
    let mut last_err = None;
    for path in &candidates {
        match open_instanced(driver, path, identity) {
            Ok(Some(module)) => return Ok(module),
            Ok(None) => tracing::debug!(path = %path.display(), "no library"),
            Err(err) => last_err = Some(err),
        }
    }
    if let Some(err) = last_err {
        return Err(err);
    }
    Err(ScriptError::Configuration(format!(
        "library for {:?} not found; looked for:\n{}",
        identity.res_name,
        describe_checked(&candidates)
    )))
}

#[tracing::instrument(level = "debug", skip(driver, bitcode), fields(res = %identity.res_name, len = bitcode.len()))]
fn acquire_compiled(
    driver: &Driver,
    identity: &ScriptIdentity,
    bitcode: &[u8],
) -> Result<CodeModule> {
    let compiler = driver.compiler().ok_or_else(|| {
        ScriptError::Configuration("compile mode requires a compiler service".to_string())
    })?;
    let precision = compiler.float_precision(bitcode).ok_or_else(|| {
        ScriptError::Configuration(format!(
            "unknown floating point precision for {:?}",
            identity.res_name
        ))
    })?;

    let context = driver.context();
    let mut runtime_library = driver
        .runtime_libraries()
        .select(precision, context)
        .to_path_buf();
    if let Some(selector) = driver.runtime_selector() {
        if let Some(chosen) = selector(bitcode) {
            runtime_library = chosen;
        }
    }
    if context.is_debug() {
        runtime_library = driver.runtime_libraries().debug.clone();
    }
    tracing::debug!(%precision, runtime_library = %runtime_library.display(), "runtime library selected");

    let use_cache = !context.is_debug() && !driver.config().forces_recompile();
    let mut artifact = if use_cache {
        compiler.load_cached(&identity.cache_dir, &identity.res_name, bitcode)
    } else {
        None
    };

    if artifact.is_none() {
        let request = BuildRequest {
            cache_dir: &identity.cache_dir,
            res_name: &identity.res_name,
            source: bitcode,
            runtime_library: &runtime_library,
            context,
            link_runtime: driver.link_runtime(),
        };
        if compiler.build(&request) {
            artifact = compiler.load_cached(&identity.cache_dir, &identity.res_name, bitcode);
        }
    }

    let Some(artifact) = artifact else {
        tracing::error!(res = %identity.res_name, "failed to prepare executable");
        return Err(ScriptError::Configuration(format!(
            "failed to prepare executable for {:?}",
            identity.res_name
        )));
    };
    open_instanced(driver, &artifact, identity)?.ok_or_else(|| {
        ScriptError::Configuration(format!("built artifact vanished: {}", artifact.display()))
    })
}
