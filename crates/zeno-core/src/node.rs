//! The uniform tree consumed by the engine, the analyzer and the compiler.

use zeno_common::SourceLocation;

use crate::value::{Value, ValueMap};

/// One element of the program tree.
///
/// Children are ordered; slots observe attribute order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    /// Slot identifier or attribute key.
    pub name: String,
    /// The node's own (unresolved) value.
    pub value: Value,
    /// Ordered child nodes.
    pub children: Vec<Node>,
    /// Where the node was defined.
    pub location: SourceLocation,
}

impl Node {
    /// Create a node with no value and no children.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the node's value.
    #[must_use]
    pub fn with_value(mut self, value: impl Into<Value>) -> Self {
        self.value = value.into();
        self
    }

    /// Append a child.
    #[must_use]
    pub fn with_child(mut self, child: Node) -> Self {
        self.children.push(child);
        self
    }

    /// Append several children.
    #[must_use]
    pub fn with_children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.children.extend(children);
        self
    }

    /// Append an attribute child `name: value`.
    #[must_use]
    pub fn with_attr(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with_child(Node::new(name).with_value(value))
    }

    /// Set the source location.
    #[must_use]
    pub fn at(mut self, location: SourceLocation) -> Self {
        self.location = location;
        self
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.children.iter().find(|c| c.name == name)
    }

    /// All children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.child(name).is_some()
    }

    /// The `as` child as a variable name, without a leading `$`.
    pub fn as_name(&self) -> Option<String> {
        self.child("as")
            .and_then(|c| c.value.as_str())
            .map(|s| s.trim_start_matches('$').to_string())
    }

    /// Literal text of the node's value when it is a string.
    pub fn value_str(&self) -> Option<&str> {
        self.value.as_str()
    }

    /// The body block: the `do` child when present, otherwise `self`.
    pub fn body(&self) -> &Node {
        self.child("do").unwrap_or(self)
    }

    /// Build a slot call node from a name and an argument map.
    ///
    /// Each argument becomes an attribute child, in map order.
    pub fn from_args(name: impl Into<String>, args: &ValueMap) -> Self {
        let mut node = Self::new(name);
        for (key, value) in args {
            if key == "value" {
                node.value = value.clone();
            } else {
                node.children.push(Self::new(key.clone()).with_value(value.clone()));
            }
        }
        node
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(Node::size).sum::<usize>()
    }
}
