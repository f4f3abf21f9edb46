use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use kernrt_contracts::{
    DEFAULT_COMPILER, DEFAULT_SYSTEM_LIB_DIR, ENV_COMPILER, ENV_FORCE_RECOMPILE, ENV_PRECISION,
    ENV_SYSTEM_LIB_DIR,
};
use thiserror::Error;

/// Kind of the owning driver context. A debug context always builds an
/// instrumented module and never reuses cached artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ContextKind {
    #[default]
    Normal,
    Debug,
}

impl ContextKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContextKind::Normal => "normal",
            ContextKind::Debug => "debug",
        }
    }

    pub fn is_debug(self) -> bool {
        matches!(self, ContextKind::Debug)
    }
}

impl fmt::Display for ContextKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a script's code module is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildMode {
    /// Compile the source module on demand, reusing cached artifacts.
    Compile,
    /// Load a platform-packaged native library for the resource name.
    Prebuilt,
}

impl BuildMode {
    pub fn as_str(self) -> &'static str {
        match self {
            BuildMode::Compile => "compile",
            BuildMode::Prebuilt => "prebuilt",
        }
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid {what} {value:?} (expected one of: {expected})")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
    expected: &'static str,
}

impl FromStr for ContextKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "normal" => Ok(ContextKind::Normal),
            "debug" => Ok(ContextKind::Debug),
            _ => Err(ParseEnumError {
                what: "context kind",
                value: s,
                expected: "normal, debug",
            }),
        }
    }
}

impl FromStr for BuildMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "compile" => Ok(BuildMode::Compile),
            "prebuilt" | "so" => Ok(BuildMode::Prebuilt),
            _ => Err(ParseEnumError {
                what: "build mode",
                value: s,
                expected: "compile, prebuilt",
            }),
        }
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for ContextKind {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [ContextKind; 2] = [ContextKind::Normal, ContextKind::Debug];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(self.as_str()))
    }
}

#[cfg(feature = "clap")]
impl clap::ValueEnum for BuildMode {
    fn value_variants<'a>() -> &'a [Self] {
        const ALL: [BuildMode; 2] = [BuildMode::Compile, BuildMode::Prebuilt];
        &ALL
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        match self {
            BuildMode::Compile => Some(clap::builder::PossibleValue::new("compile")),
            BuildMode::Prebuilt => Some(clap::builder::PossibleValue::new("prebuilt").alias("so")),
        }
    }
}

/// Process-level knobs read once per driver.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub force_recompile: bool,
    /// Floating point precision override. Its presence forces recompilation.
    pub precision_override: Option<String>,
    /// Secondary location searched for prebuilt libraries.
    pub system_lib_dir: PathBuf,
    /// Executable used by [`crate::compiler::ExternalCompiler`].
    pub compiler: PathBuf,
    /// Module-wide threadability recorded into every launch.
    pub threadable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            force_recompile: false,
            precision_override: None,
            system_lib_dir: PathBuf::from(DEFAULT_SYSTEM_LIB_DIR),
            compiler: PathBuf::from(DEFAULT_COMPILER),
            threadable: true,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = EngineConfig::default();

        if let Some(raw) = lookup(ENV_FORCE_RECOMPILE) {
            config.force_recompile = parse_bool_env(ENV_FORCE_RECOMPILE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_PRECISION) {
            let raw = raw.trim();
            if !raw.is_empty() {
                config.precision_override = Some(raw.to_string());
            }
        }
        if let Some(raw) = lookup(ENV_SYSTEM_LIB_DIR) {
            let raw = raw.trim();
            if raw.is_empty() {
                anyhow::bail!("invalid environment variable {ENV_SYSTEM_LIB_DIR}: empty path");
            }
            config.system_lib_dir = PathBuf::from(raw);
        }
        if let Some(raw) = lookup(ENV_COMPILER) {
            let raw = raw.trim();
            if !raw.is_empty() {
                config.compiler = PathBuf::from(raw);
            }
        }
        Ok(config)
    }

    pub fn forces_recompile(&self) -> bool {
        self.force_recompile || self.precision_override.is_some()
    }
}

fn parse_bool_env(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" | "" => Ok(false),
        other => anyhow::bail!(
            "invalid environment variable {name}={other:?} (expected one of: 1, 0, true, false, yes, no)"
        ),
    }
}
