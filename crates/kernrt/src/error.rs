//! Engine errors.
//!
//! Construction failures (`Configuration`, `Loader`, `ResourceExhaustion`)
//! are fatal to the script being built; any partially acquired module is
//! released before the error reaches the caller. `Geometry` and
//! `ContractViolation` abort the call that raised them but leave the script
//! usable. An empty launch range is not an error at all, see
//! [`crate::launch::LaunchPlan::Skip`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Error)]
pub enum ScriptError {
    /// Missing or unreadable artifact, malformed self-description.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The platform loader could not open the module or a required export.
    #[error("loader error: {what}: {diagnostic}")]
    Loader { what: String, diagnostic: String },

    /// Invalid launch geometry: bad sub-range or unusable allocations.
    #[error("geometry violation: {0}")]
    Geometry(String),

    /// An internal table could not be allocated.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The caller broke an API contract (slot out of range, raw write to an
    /// object slot, unsupported array shape).
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The script has been loaded but its initializer has not run.
    #[error("script {0:?} is loaded but not initialized")]
    NotReady(String),
}

impl ScriptError {
    pub(crate) fn loader(what: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        ScriptError::Loader {
            what: what.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn is_construction_fatal(&self) -> bool {
        matches!(
            self,
            ScriptError::Configuration(_)
                | ScriptError::Loader { .. }
                | ScriptError::ResourceExhaustion(_)
        )
    }
}

/// Reserves exactly `count` slots, reporting failure instead of aborting.
pub(crate) fn table_with_capacity<T>(count: usize, what: &str) -> Result<Vec<T>> {
    let mut out = Vec::new();
    out.try_reserve_exact(count).map_err(|e| {
        ScriptError::ResourceExhaustion(format!("{what} table for {count} entries: {e}"))
    })?;
    Ok(out)
}
