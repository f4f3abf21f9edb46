//! Shared, version-pinned protocol identifiers.
//!
//! These constants are the single source of truth for the names that appear
//! in compiled kernel modules, on disk, in the environment, and in
//! machine-readable runner output.

pub const KERNRT_RUNNER_REPORT_SCHEMA_VERSION: &str = "kernrt-runner.report@0.1.0";
pub const KERNRT_INFO_REPORT_SCHEMA_VERSION: &str = "kernrt.info.report@0.1.0";

// Well-known exports of a compiled script module.
pub const SYMBOL_ROOT: &str = "root";
pub const SYMBOL_ROOT_EXPAND: &str = "root.expand";
pub const SYMBOL_INIT: &str = "init";
pub const SYMBOL_DTOR: &str = ".rs.dtor";
pub const SYMBOL_INFO: &str = ".rs.info";
pub const FOREACH_EXPAND_SUFFIX: &str = ".expand";

// Self-description (`.rs.info`) line keys, in stream order.
pub const INFO_EXPORT_VAR_KEY: &str = "exportVarCount";
pub const INFO_EXPORT_FUNC_KEY: &str = "exportFuncCount";
pub const INFO_EXPORT_FOREACH_KEY: &str = "exportForEachCount";
pub const INFO_OBJECT_SLOT_KEY: &str = "objectSlotCount";
pub const INFO_FOREACH_SEPARATOR: &str = " - ";

/// Longest accepted self-description line, terminator included.
pub const INFO_MAX_LINE_BYTES: usize = 500;

// Prebuilt library naming.
pub const LIBRARY_PREFIX: &str = "librs.";
pub const LIBRARY_SUFFIX: &str = ".so";
pub const LIBRARY_SUBDIR: &str = "lib";
pub const CACHE_MARKER: &str = "cache";
pub const DEFAULT_SYSTEM_LIB_DIR: &str = "/system/lib";
pub const INSTANCE_CACHE_DIR: &str = "com.android.renderscript.cache";
pub const INSTANCE_SUFFIX_LEN: usize = 6;

// Compile-on-demand artifacts inside the cache location.
pub const SOURCE_EXTENSION: &str = "bc";
pub const SOURCE_HASH_EXTENSION: &str = "sha256";
pub const SOURCE_HASH_DOMAIN: &[u8] = b"kernrt-source-v1\0";

// Precision markers carried by source modules.
pub const PRECISION_MARKER_IMPRECISE: &[u8] = b"rs_fp_imprecise";
pub const PRECISION_MARKER_RELAXED: &[u8] = b"rs_fp_relaxed";

// Process configuration.
pub const ENV_FORCE_RECOMPILE: &str = "KERNRT_FORCE_RECOMPILE";
pub const ENV_PRECISION: &str = "KERNRT_PRECISION";
pub const ENV_SYSTEM_LIB_DIR: &str = "KERNRT_SYSTEM_LIB_DIR";
pub const ENV_COMPILER: &str = "KERNRT_COMPILER";
pub const ENV_LOG: &str = "KERNRT_LOG";
pub const DEFAULT_COMPILER: &str = "bcc";
