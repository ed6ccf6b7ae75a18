//! Source locations attached to nodes and errors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A `(file, line, column)` triple; lines and columns are 1-based.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    /// Source file path as given to the loader.
    #[serde(default)]
    pub file: String,
    /// Line number, 0 when unknown.
    #[serde(default)]
    pub line: u32,
    /// Column number, 0 when unknown.
    #[serde(default)]
    pub col: u32,
}

impl SourceLocation {
    /// Create a location.
    pub fn new(file: impl Into<String>, line: u32, col: u32) -> Self {
        Self {
            file: file.into(),
            line,
            col,
        }
    }

    /// Returns `true` when no position information is present.
    pub fn is_unknown(&self) -> bool {
        self.file.is_empty() && self.line == 0
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "<unknown>");
        }
        let file = if self.file.is_empty() {
            "<input>"
        } else {
            &self.file
        };
        write!(f, "{file}:{}:{}", self.line, self.col)
    }
}
