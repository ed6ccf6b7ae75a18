//! Loading node trees from disk.
//!
//! The surface grammar lives outside this crate; a [`NodeLoader`] turns a
//! path into a [`Node`]. [`JsonLoader`] reads the serialized tree form:
//!
//! ```json
//! {"name": "root", "children": [
//!   {"name": "http.get", "value": "/users/{id}", "line": 1, "col": 1, "children": [...]}
//! ]}
//! ```
//!
//! A top-level array is accepted as the children of an implicit `root`.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use zeno_common::{RuntimeError, SourceLocation};

use crate::node::Node;
use crate::value::Value;

/// Produces node trees from source paths.
pub trait NodeLoader: Send + Sync {
    /// Load and parse the tree at `path`.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the source cannot be read and `Syntax` if it
    /// cannot be parsed.
    fn load(&self, path: &Path) -> Result<Node, RuntimeError>;
}

/// Loader for the JSON tree representation.
#[derive(Debug, Clone, Default)]
pub struct JsonLoader;

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDocument {
    Node(RawNode),
    List(Vec<RawNode>),
}

#[derive(Deserialize)]
struct RawNode {
    name: String,
    #[serde(default)]
    value: serde_json::Value,
    #[serde(default)]
    children: Vec<RawNode>,
    #[serde(default)]
    file: Option<String>,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    col: u32,
}

impl RawNode {
    fn into_node(self, file: &str) -> Node {
        let file = self.file.unwrap_or_else(|| file.to_string());
        let children = self
            .children
            .into_iter()
            .map(|c| c.into_node(&file))
            .collect();
        Node {
            name: self.name,
            value: Value::from_json(self.value),
            children,
            location: SourceLocation::new(file, self.line, self.col),
        }
    }
}

impl JsonLoader {
    /// Parse a tree from JSON text.
    ///
    /// # Arguments
    ///
    /// * `source` - JSON document
    /// * `file` - File name recorded in node locations
    ///
    /// # Errors
    ///
    /// Returns `Syntax` with the parser position on malformed input.
    pub fn parse_str(source: &str, file: &str) -> Result<Node, RuntimeError> {
        let doc: RawDocument = serde_json::from_str(source).map_err(|e| {
            RuntimeError::syntax(
                e.to_string(),
                SourceLocation::new(
                    file,
                    u32::try_from(e.line()).unwrap_or(u32::MAX),
                    u32::try_from(e.column()).unwrap_or(u32::MAX),
                ),
            )
        })?;

        Ok(match doc {
            RawDocument::Node(raw) => raw.into_node(file),
            RawDocument::List(items) => Node {
                name: "root".to_string(),
                value: Value::Nil,
                children: items.into_iter().map(|c| c.into_node(file)).collect(),
                location: SourceLocation::new(file, 1, 1),
            },
        })
    }
}

impl NodeLoader for JsonLoader {
    fn load(&self, path: &Path) -> Result<Node, RuntimeError> {
        let source = std::fs::read_to_string(path)
            .map_err(|e| RuntimeError::io(format!("{}: {e}", path.display())))?;
        Self::parse_str(&source, &path.display().to_string())
    }
}

/// Resolve an include target relative to the including file.
///
/// The result is lexically normalized, so every spelling of a file maps to
/// the same key in include cycle checks.
pub fn resolve_include_path(target: &str, from: &SourceLocation) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() || from.file.is_empty() {
        return normalize_path(target);
    }
    Path::new(&from.file)
        .parent()
        .map_or_else(|| normalize_path(target), |dir| normalize_path(&dir.join(target)))
}

/// Collapse `.` and `..` components without touching the filesystem.
///
/// `..` never climbs above the root; leading `..` of a relative path is kept.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}
