//! Reader for the self-description a compiled module carries in `.rs.info`.
//!
//! The stream is newline-terminated ASCII in fixed order:
//!
//! ```text
//! exportVarCount: <n>
//! <n variable names>
//! exportFuncCount: <n>
//! <n function names>
//! exportForEachCount: <n>
//! <n lines of "<signature> - <name>">
//! objectSlotCount: <n>
//! <n variable indices>
//! ```

use std::collections::BTreeSet;
use std::fmt;

use kernrt_contracts::{
    INFO_EXPORT_FOREACH_KEY, INFO_EXPORT_FUNC_KEY, INFO_EXPORT_VAR_KEY, INFO_FOREACH_SEPARATOR,
    INFO_MAX_LINE_BYTES, INFO_OBJECT_SLOT_KEY,
};
use serde::Serialize;
use thiserror::Error;

use crate::error::ScriptError;

/// Packed description of the arguments a ForEach kernel consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(transparent)]
pub struct ForEachSignature(pub u32);

impl ForEachSignature {
    pub const IN: u32 = 0x01;
    pub const OUT: u32 = 0x02;
    pub const USR_DATA: u32 = 0x04;
    pub const X: u32 = 0x08;
    pub const Y: u32 = 0x10;
    pub const KERNEL: u32 = 0x20;

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn has_input(self) -> bool {
        self.0 & Self::IN != 0
    }

    pub fn has_output(self) -> bool {
        self.0 & Self::OUT != 0
    }

    pub fn has_user_data(self) -> bool {
        self.0 & Self::USR_DATA != 0
    }

    pub fn has_x(self) -> bool {
        self.0 & Self::X != 0
    }

    pub fn has_y(self) -> bool {
        self.0 & Self::Y != 0
    }

    /// New-style kernel (returns its output instead of writing through a
    /// pointer argument).
    pub fn is_kernel(self) -> bool {
        self.0 & Self::KERNEL != 0
    }
}

impl fmt::Display for ForEachSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForEachExport {
    pub signature: ForEachSignature,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportMetadata {
    pub variables: Vec<String>,
    pub functions: Vec<String>,
    pub foreach: Vec<ForEachExport>,
    /// Variable indices holding reference-counted object handles.
    pub object_slots: BTreeSet<u32>,
}

impl ExportMetadata {
    pub fn variable_count(&self) -> usize {
        self.variables.len()
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    pub fn foreach_count(&self) -> usize {
        self.foreach.len()
    }

    pub fn is_object(&self, slot: usize) -> bool {
        u32::try_from(slot).is_ok_and(|s| self.object_slots.contains(&s))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("line {line}: stream ended early, expected {expected}")]
    Truncated { line: usize, expected: &'static str },

    #[error("line {line}: longer than {max} bytes")]
    Overlong { line: usize, max: usize },

    #[error("line {line}: invalid {what}: {text:?}")]
    Malformed {
        line: usize,
        what: &'static str,
        text: String,
    },

    #[error("{what} count {count} cannot be allocated")]
    Exhausted { what: &'static str, count: usize },
}

impl From<MetadataError> for ScriptError {
    fn from(err: MetadataError) -> Self {
        match err {
            MetadataError::Exhausted { .. } => ScriptError::ResourceExhaustion(err.to_string()),
            _ => ScriptError::Configuration(format!("malformed export metadata: {err}")),
        }
    }
}

struct Lines<'a> {
    rest: &'a [u8],
    line: usize,
}

impl<'a> Lines<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            rest: input,
            line: 0,
        }
    }

    /// Next line without its terminator.
    fn next_line(&mut self, expected: &'static str) -> Result<&'a str, MetadataError> {
        self.line += 1;
        if self.rest.is_empty() || self.rest[0] == 0 {
            return Err(MetadataError::Truncated {
                line: self.line,
                expected,
            });
        }
        let end = self
            .rest
            .iter()
            .position(|&b| b == b'\n' || b == 0)
            .unwrap_or(self.rest.len());
        let consumed = if self.rest.get(end) == Some(&b'\n') {
            end + 1
        } else {
            end
        };
        // The terminator has to fit too.
        if consumed >= INFO_MAX_LINE_BYTES {
            return Err(MetadataError::Overlong {
                line: self.line,
                max: INFO_MAX_LINE_BYTES - 1,
            });
        }
        let raw = &self.rest[..end];
        self.rest = &self.rest[consumed..];
        let text = std::str::from_utf8(raw).map_err(|_| MetadataError::Malformed {
            line: self.line,
            what: expected,
            text: String::from_utf8_lossy(raw).into_owned(),
        })?;
        Ok(text.strip_suffix('\r').unwrap_or(text))
    }

    fn count(&mut self, key: &'static str) -> Result<usize, MetadataError> {
        let text = self.next_line(key)?;
        let value = text
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix(':'))
            .map(str::trim)
            .and_then(|n| n.parse::<usize>().ok());
        value.ok_or_else(|| MetadataError::Malformed {
            line: self.line,
            what: key,
            text: text.to_string(),
        })
    }
}

fn reserve<T>(what: &'static str, count: usize) -> Result<Vec<T>, MetadataError> {
    let mut out = Vec::new();
    out.try_reserve_exact(count)
        .map_err(|_| MetadataError::Exhausted { what, count })?;
    Ok(out)
}

pub fn parse(info: &[u8]) -> Result<ExportMetadata, MetadataError> {
    let mut lines = Lines::new(info);

    let var_count = lines.count(INFO_EXPORT_VAR_KEY)?;
    let mut variables = reserve("variable", var_count)?;
    for _ in 0..var_count {
        variables.push(lines.next_line("variable name")?.to_string());
    }

    let func_count = lines.count(INFO_EXPORT_FUNC_KEY)?;
    let mut functions = reserve("function", func_count)?;
    for _ in 0..func_count {
        functions.push(lines.next_line("function name")?.to_string());
    }

    let foreach_count = lines.count(INFO_EXPORT_FOREACH_KEY)?;
    let mut foreach = reserve("forEach", foreach_count)?;
    for _ in 0..foreach_count {
        let text = lines.next_line("forEach export")?;
        foreach.push(parse_foreach_line(text).ok_or_else(|| MetadataError::Malformed {
            line: lines.line,
            what: "forEach export",
            text: text.to_string(),
        })?);
    }

    let object_count = lines.count(INFO_OBJECT_SLOT_KEY)?;
    let mut object_slots = BTreeSet::new();
    for _ in 0..object_count {
        let text = lines.next_line("object slot")?;
        let slot = text
            .trim()
            .parse::<u32>()
            .map_err(|_| MetadataError::Malformed {
                line: lines.line,
                what: "object slot",
                text: text.to_string(),
            })?;
        if (slot as usize) < var_count {
            object_slots.insert(slot);
        } else {
            tracing::warn!(slot, var_count, "ignoring object slot beyond exported variables");
        }
    }

    Ok(ExportMetadata {
        variables,
        functions,
        foreach,
        object_slots,
    })
}

fn parse_foreach_line(text: &str) -> Option<ForEachExport> {
    let (sig, name) = text.split_once(INFO_FOREACH_SEPARATOR.trim())?;
    let signature = sig.trim().parse::<u32>().ok()?;
    let name = name.trim();
    if name.is_empty() || name.contains(char::is_whitespace) {
        return None;
    }
    Some(ForEachExport {
        signature: ForEachSignature(signature),
        name: name.to_string(),
    })
}
