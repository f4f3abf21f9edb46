//! Compiler service seam used by compile-on-demand builds.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, Result};
use kernrt_contracts::{
    LIBRARY_PREFIX, LIBRARY_SUFFIX, PRECISION_MARKER_IMPRECISE, PRECISION_MARKER_RELAXED,
    SOURCE_EXTENSION, SOURCE_HASH_DOMAIN, SOURCE_HASH_EXTENSION,
};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::config::ContextKind;

/// Floating point precision declared by a source module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FloatPrecision {
    Full,
    Relaxed,
    Imprecise,
}

impl FloatPrecision {
    pub fn is_reduced(self) -> bool {
        !matches!(self, FloatPrecision::Full)
    }
}

impl fmt::Display for FloatPrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FloatPrecision::Full => "full",
            FloatPrecision::Relaxed => "relaxed",
            FloatPrecision::Imprecise => "imprecise",
        })
    }
}

/// Runtime support libraries linked into compiled modules.
#[derive(Debug, Clone)]
pub struct RuntimeLibraries {
    pub generic: PathBuf,
    /// Faster math for reduced-precision sources, when the target has one.
    pub accelerated: Option<PathBuf>,
    /// Replaces the choice for every precision on architectures that ship
    /// their own optimized library.
    pub architecture: Option<PathBuf>,
    pub debug: PathBuf,
}

impl RuntimeLibraries {
    pub fn under(dir: &Path) -> Self {
        Self {
            generic: dir.join("libclcore.bc"),
            accelerated: None,
            architecture: None,
            debug: dir.join("libclcore_debug.bc"),
        }
    }

    pub fn select(&self, precision: FloatPrecision, context: ContextKind) -> &Path {
        if context.is_debug() {
            return &self.debug;
        }
        if let Some(arch) = &self.architecture {
            return arch;
        }
        match (&self.accelerated, precision.is_reduced()) {
            (Some(accelerated), true) => accelerated,
            _ => &self.generic,
        }
    }
}

/// Overrides the runtime library picked for a source module.
pub type RuntimeSelector = Arc<dyn Fn(&[u8]) -> Option<PathBuf> + Send + Sync>;

/// Accepts or rejects a freshly built artifact linked against a runtime
/// library: `(artifact, runtime_library)`.
pub type LinkRuntimeCallback = Arc<dyn Fn(&Path, &Path) -> bool + Send + Sync>;

pub struct BuildRequest<'a> {
    pub cache_dir: &'a Path,
    pub res_name: &'a str,
    pub source: &'a [u8],
    pub runtime_library: &'a Path,
    pub context: ContextKind,
    pub link_runtime: Option<&'a LinkRuntimeCallback>,
}

pub trait CompilerService: Send + Sync {
    /// Precision declared by `source`; `None` when it cannot be determined.
    fn float_precision(&self, source: &[u8]) -> Option<FloatPrecision>;

    /// Path of a previously built artifact for exactly this source, if any.
    fn load_cached(&self, cache_dir: &Path, res_name: &str, source: &[u8]) -> Option<PathBuf>;

    fn build(&self, request: &BuildRequest<'_>) -> bool;
}

pub fn source_hash(source: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(SOURCE_HASH_DOMAIN);
    hasher.update((source.len() as u64).to_le_bytes());
    hasher.update(source);
    hex_lower(&hasher.finalize())
}

/// Scans the source module for an embedded precision pragma.
pub fn detect_precision(source: &[u8]) -> FloatPrecision {
    if contains(source, PRECISION_MARKER_IMPRECISE) {
        FloatPrecision::Imprecise
    } else if contains(source, PRECISION_MARKER_RELAXED) {
        FloatPrecision::Relaxed
    } else {
        FloatPrecision::Full
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Runs an out-of-process compiler:
/// `<exe> -o <res> -output_path <cache_dir> -bclib <runtime_lib> <res>.bc`.
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    exe: PathBuf,
}

impl ExternalCompiler {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        Self { exe: exe.into() }
    }

    pub fn artifact_path(cache_dir: &Path, res_name: &str) -> PathBuf {
        cache_dir.join(format!("{LIBRARY_PREFIX}{res_name}{LIBRARY_SUFFIX}"))
    }

    fn hash_path(cache_dir: &Path, res_name: &str) -> PathBuf {
        cache_dir.join(format!("{res_name}.{SOURCE_HASH_EXTENSION}"))
    }

    fn try_build(&self, request: &BuildRequest<'_>) -> Result<()> {
        let cache_dir = request.cache_dir;
        std::fs::create_dir_all(cache_dir)
            .with_context(|| format!("create cache dir: {}", cache_dir.display()))?;

        let bc_path = cache_dir.join(format!("{}.{SOURCE_EXTENSION}", request.res_name));
        std::fs::write(&bc_path, request.source)
            .with_context(|| format!("write source module: {}", bc_path.display()))?;

        let mut cmd = Command::new(&self.exe);
        cmd.arg("-o")
            .arg(format!("{LIBRARY_PREFIX}{}", request.res_name))
            .arg("-output_path")
            .arg(cache_dir)
            .arg("-bclib")
            .arg(request.runtime_library);
        if request.context.is_debug() {
            cmd.arg("-g");
        }
        cmd.arg(&bc_path);

        let out = cmd
            .output()
            .with_context(|| format!("spawn compiler: {}", self.exe.display()))?;
        if !out.status.success() {
            anyhow::bail!(
                "compiler terminated unexpectedly ({}): {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }

        let artifact = Self::artifact_path(cache_dir, request.res_name);
        if !artifact.is_file() {
            anyhow::bail!("compiler produced no artifact at {}", artifact.display());
        }
        if let Some(link) = request.link_runtime {
            if !link(&artifact, request.runtime_library) {
                anyhow::bail!(
                    "runtime link rejected {} against {}",
                    artifact.display(),
                    request.runtime_library.display()
                );
            }
        }

        let hash_path = Self::hash_path(cache_dir, request.res_name);
        std::fs::write(&hash_path, source_hash(request.source))
            .with_context(|| format!("write source hash: {}", hash_path.display()))?;
        Ok(())
    }
}

impl CompilerService for ExternalCompiler {
    fn float_precision(&self, source: &[u8]) -> Option<FloatPrecision> {
        Some(detect_precision(source))
    }

    fn load_cached(&self, cache_dir: &Path, res_name: &str, source: &[u8]) -> Option<PathBuf> {
        let artifact = Self::artifact_path(cache_dir, res_name);
        if !artifact.is_file() {
            return None;
        }
        let recorded = std::fs::read_to_string(Self::hash_path(cache_dir, res_name)).ok()?;
        if recorded.trim() != source_hash(source) {
            tracing::debug!(res_name, "cached artifact is stale");
            return None;
        }
        Some(artifact)
    }

    fn build(&self, request: &BuildRequest<'_>) -> bool {
        match self.try_build(request) {
            Ok(()) => true,
            Err(err) => {
                tracing::error!(res_name = request.res_name, "build failed: {err:#}");
                false
            }
        }
    }
}

pub fn hex_lower(bytes: &[u8]) -> String {
    const LUT: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(LUT[(b >> 4) as usize] as char);
        out.push(LUT[(b & 0x0F) as usize] as char);
    }
    out
}
