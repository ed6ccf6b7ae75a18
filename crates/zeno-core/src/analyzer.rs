//! Preflight checks over a program tree.
//!
//! The analyzer reports, without executing anything:
//! - unregistered slot names;
//! - missing required inputs and required blocks;
//! - constant values whose type contradicts the slot metadata.
//!
//! `include` targets are loaded and analyzed once each, so include cycles
//! terminate.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use zeno_common::{RuntimeError, SourceLocation};

use crate::engine::{Engine, STRUCTURAL};
use crate::loader::{normalize_path, resolve_include_path};
use crate::node::Node;
use crate::registry::SlotMetadata;
use crate::value::Value;

/// Slots whose unknown children are accepted as free-form arguments.
const PERMISSIVE: &[&str] = &["call", "data"];

/// Tree walker collecting [`RuntimeError::Static`] diagnostics.
pub struct Analyzer<'a> {
    engine: &'a Engine,
    visited: HashSet<PathBuf>,
    diagnostics: Vec<RuntimeError>,
}

impl<'a> Analyzer<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            visited: HashSet::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Analyze `root` and return every diagnostic found.
    pub fn run(mut self, root: &Node) -> Vec<RuntimeError> {
        if !root.location.file.is_empty() {
            self.visited
                .insert(normalize_path(Path::new(&root.location.file)));
        }
        self.visit(root);
        self.diagnostics
    }

    fn report(&mut self, message: String, location: &SourceLocation) {
        self.diagnostics.push(RuntimeError::Static {
            message,
            location: location.clone(),
        });
    }

    fn visit(&mut self, node: &Node) {
        if node.name.starts_with('$') || node.name == "as" {
            return;
        }
        if let Some(entry) = self.engine.registry().get(&node.name) {
            self.check_slot(node, &entry.metadata);
            return;
        }
        if STRUCTURAL.contains(&node.name.as_str()) {
            for child in &node.children {
                self.visit(child);
            }
            return;
        }
        self.report(format!("unknown slot '{}'", node.name), &node.location);
    }

    fn check_slot(&mut self, node: &Node, meta: &SlotMetadata) {
        let mut positional_used = node.value.is_nil();
        let required = meta.inputs.iter().filter(|(_, s)| s.required).map(|(n, _)| n);
        for name in required {
            if node.has_child(name) {
                continue;
            }
            if !positional_used {
                positional_used = true;
                continue;
            }
            self.report(
                format!("slot '{}' is missing required input '{name}'", node.name),
                &node.location,
            );
        }

        for block in &meta.required_blocks {
            if !node.has_child(block) {
                self.report(
                    format!("slot '{}' requires a '{block}' block", node.name),
                    &node.location,
                );
            }
        }

        if let Some(kind) = &meta.value_type {
            if !type_matches(kind, &node.value) {
                self.report(
                    format!(
                        "slot '{}' expects a {kind} value, got {}",
                        node.name,
                        node.value.type_name()
                    ),
                    &node.location,
                );
            }
        }

        let permissive = meta.inputs.is_empty() || PERMISSIVE.contains(&node.name.as_str());
        for child in &node.children {
            if let Some(input) = meta.inputs.get(&child.name) {
                let value = constant_of(child);
                if !type_matches(&input.kind, &value) {
                    self.report(
                        format!(
                            "input '{}' of slot '{}' expects {}, got {}",
                            child.name,
                            node.name,
                            input.kind,
                            value.type_name()
                        ),
                        &child.location,
                    );
                }
                continue;
            }
            let known = child.name.starts_with('$')
                || child.name == "as"
                || STRUCTURAL.contains(&child.name.as_str())
                || self.engine.registry().contains(&child.name);
            if known || !permissive {
                self.visit(child);
            }
        }

        if node.name == "include" {
            self.follow_include(node);
        }
    }

    fn follow_include(&mut self, node: &Node) {
        let Some(target) = node.value_str().filter(|t| !t.contains('$')) else {
            return;
        };
        let path = resolve_include_path(target, &node.location);
        if !self.visited.insert(path.clone()) {
            return;
        }
        match self.engine.loader().load(&path) {
            Ok(tree) => self.visit(&tree),
            Err(err) => self.report(
                format!("cannot include '{}': {err}", path.display()),
                &node.location,
            ),
        }
    }
}

/// Constant value of an attribute child; nested children form a map.
fn constant_of(node: &Node) -> Value {
    if node.value.is_nil() && !node.children.is_empty() {
        return Value::Map(
            node.children
                .iter()
                .map(|c| (c.name.clone(), constant_of(c)))
                .collect(),
        );
    }
    node.value.clone()
}

/// Whether a constant can satisfy a declared type; variables always can.
fn type_matches(kind: &str, value: &Value) -> bool {
    match (kind, value) {
        ("any", _) | (_, Value::Nil | Value::Opaque(_)) => true,
        (_, Value::String(s)) if s.contains('$') => true,
        ("string", Value::String(_) | Value::Int(_) | Value::Float(_) | Value::Bool(_))
        | ("number", Value::Int(_) | Value::Float(_))
        | ("int", Value::Int(_))
        | ("bool", Value::Bool(_))
        | ("list", Value::List(_))
        | ("map", Value::Map(_))
        | ("duration", Value::Int(_) | Value::Float(_)) => true,
        ("number", Value::String(s)) => s.trim().parse::<f64>().is_ok(),
        ("int", Value::String(s)) => s.trim().parse::<i64>().is_ok(),
        ("bool", Value::String(s)) => matches!(s.as_str(), "true" | "false"),
        ("list", Value::String(s)) => s.trim_start().starts_with('[') || s.contains(','),
        ("duration", Value::String(s)) => {
            s.trim().parse::<u64>().is_ok() || zeno_common::parse_duration(s).is_ok()
        }
        _ => false,
    }
}
