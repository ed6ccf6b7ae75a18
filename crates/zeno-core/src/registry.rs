//! Slot registry: name → handler + metadata.
//!
//! Reads on the dispatch path are lock-free (`ArcSwap` snapshot). Writes
//! copy the table and swap it in; they are rare (startup, plugin reload).

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use zeno_common::RuntimeError;

use crate::context::Context;
use crate::node::Node;
use crate::scope::Scope;

/// A slot implementation.
#[async_trait]
pub trait SlotHandler: Send + Sync {
    /// Run the slot for `node` against `scope`.
    async fn call(&self, ctx: &Context, node: &Node, scope: &Scope) -> Result<(), RuntimeError>;
}

/// Declared input of a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InputSpec {
    /// `string`, `number`, `int`, `bool`, `list`, `map` or `any`.
    #[serde(rename = "type")]
    pub kind: String,
    pub required: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
}

/// Documentation and analysis data for a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SlotMetadata {
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub example: Option<String>,
    /// Ordered declared inputs.
    pub inputs: IndexMap<String, InputSpec>,
    /// Named children that must be present.
    pub required_blocks: Vec<String>,
    /// Expected type of the node's own value.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_type: Option<String>,
}

impl SlotMetadata {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn example(mut self, example: impl Into<String>) -> Self {
        self.example = Some(example.into());
        self
    }

    /// Declare an optional input.
    #[must_use]
    pub fn input(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputSpec {
                kind: kind.to_string(),
                required: false,
                description: description.to_string(),
            },
        );
        self
    }

    /// Declare a required input.
    #[must_use]
    pub fn required(mut self, name: &str, kind: &str, description: &str) -> Self {
        self.inputs.insert(
            name.to_string(),
            InputSpec {
                kind: kind.to_string(),
                required: true,
                description: description.to_string(),
            },
        );
        self
    }

    /// Declare a required child block.
    #[must_use]
    pub fn block(mut self, name: &str) -> Self {
        self.required_blocks.push(name.to_string());
        self
    }

    #[must_use]
    pub fn value_type(mut self, kind: &str) -> Self {
        self.value_type = Some(kind.to_string());
        self
    }
}

/// A registered slot.
pub struct SlotEntry {
    pub handler: Arc<dyn SlotHandler>,
    pub metadata: SlotMetadata,
}

impl fmt::Debug for SlotEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotEntry")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

type Table = HashMap<String, Arc<SlotEntry>>;

/// Name → slot table.
pub struct SlotRegistry {
    slots: ArcSwap<Table>,
    write: Mutex<()>,
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self {
            slots: ArcSwap::from_pointee(Table::new()),
            write: Mutex::new(()),
        }
    }
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a slot.
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn SlotHandler>,
        metadata: SlotMetadata,
    ) -> Option<Arc<SlotEntry>> {
        let name = name.into();
        let _guard = self.write.lock();
        let mut next = (**self.slots.load()).clone();
        let previous = next.insert(name, Arc::new(SlotEntry { handler, metadata }));
        self.slots.store(Arc::new(next));
        previous
    }

    /// Re-insert a previously removed entry.
    pub fn restore(&self, name: impl Into<String>, entry: Arc<SlotEntry>) {
        let _guard = self.write.lock();
        let mut next = (**self.slots.load()).clone();
        next.insert(name.into(), entry);
        self.slots.store(Arc::new(next));
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<SlotEntry>> {
        let _guard = self.write.lock();
        let mut next = (**self.slots.load()).clone();
        let removed = next.remove(name);
        if removed.is_some() {
            self.slots.store(Arc::new(next));
        }
        removed
    }

    pub fn get(&self, name: &str) -> Option<Arc<SlotEntry>> {
        self.slots.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.slots.load().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.slots.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Metadata of every slot, sorted by name.
    pub fn documentation(&self) -> BTreeMap<String, SlotMetadata> {
        self.slots
            .load()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.metadata.clone()))
            .collect()
    }
}

impl fmt::Debug for SlotRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotRegistry")
            .field("slots", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nothing;

    #[async_trait]
    impl SlotHandler for Nothing {
        async fn call(&self, _: &Context, _: &Node, _: &Scope) -> Result<(), RuntimeError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SlotRegistry::new();
        assert!(registry.is_empty());

        let meta = SlotMetadata::new("does nothing")
            .required("name", "string", "target")
            .input("level", "string", "")
            .block("do");
        registry.register("x", Arc::new(Nothing), meta.clone());

        let entry = registry.get("x").unwrap();
        assert_eq!(entry.metadata, meta);
        assert_eq!(
            entry.metadata.inputs.keys().collect::<Vec<_>>(),
            vec!["name", "level"]
        );
        assert!(registry.get("y").is_none());
    }

    #[test]
    fn test_unregister_and_restore() {
        let registry = SlotRegistry::new();
        registry.register("p", Arc::new(Nothing), SlotMetadata::new("plugin"));

        let removed = registry.unregister("p").unwrap();
        assert!(!registry.contains("p"));
        assert!(registry.unregister("p").is_none());

        registry.restore("p", removed);
        assert_eq!(registry.get("p").unwrap().metadata.description, "plugin");
    }

    #[test]
    fn test_snapshot_survives_replacement() {
        let registry = SlotRegistry::new();
        registry.register("s", Arc::new(Nothing), SlotMetadata::new("v1"));
        let held = registry.get("s").unwrap();

        registry.register("s", Arc::new(Nothing), SlotMetadata::new("v2"));
        assert_eq!(held.metadata.description, "v1");
        assert_eq!(registry.get("s").unwrap().metadata.description, "v2");
    }

    #[test]
    fn test_documentation_sorted() {
        let registry = SlotRegistry::new();
        registry.register("b", Arc::new(Nothing), SlotMetadata::new("b"));
        registry.register("a", Arc::new(Nothing), SlotMetadata::new("a"));

        let docs = registry.documentation();
        assert_eq!(docs.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        let json = serde_json::to_value(&docs).unwrap();
        assert_eq!(json["a"]["description"], "a");
    }
}
