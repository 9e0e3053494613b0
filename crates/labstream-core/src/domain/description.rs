//! Free-form, hierarchical stream description.
//!
//! Publishers attach arbitrary metadata to a stream (channel labels,
//! acquisition hardware, units ...).  The tree is an ordered list of named
//! elements; each element holds either a text value or further elements.
//!
//! ```text
//! desc
//! ├── manufacturer = "ACME"
//! └── channels
//!     ├── channel
//!     │   └── label = "C3"
//!     └── channel
//!         └── label = "C4"
//! ```
//!
//! Names may repeat (`channel` above); lookups by name return the first
//! match.  Values are arbitrary UTF-8 including newlines and tabs.
//!
//! The tree itself is a plain owned value.  Sharing between cheap
//! [`StreamInfo`](crate::StreamInfo) copies is done one level up with an
//! `Arc`, so nothing here needs interior mutability.

use serde::{Deserialize, Serialize};

/// The root of a description tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Description {
    children: Vec<DescElement>,
}

/// One named node of the tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DescElement {
    name: String,
    node: DescNode,
}

/// An element holds either text or child elements, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DescNode {
    Value(String),
    Children(Vec<DescElement>),
}

// ── Shared list helpers ───────────────────────────────────────────────────────

fn find<'a>(list: &'a [DescElement], name: &str) -> Option<&'a DescElement> {
    list.iter().find(|e| e.name == name)
}

fn find_mut<'a>(list: &'a mut [DescElement], name: &str) -> Option<&'a mut DescElement> {
    list.iter_mut().find(|e| e.name == name)
}

fn push(list: &mut Vec<DescElement>, element: DescElement) -> &mut DescElement {
    list.push(element);
    let last = list.len() - 1;
    &mut list[last]
}

// ── Description ───────────────────────────────────────────────────────────────

impl Description {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when the tree has no elements.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Top-level elements in insertion order.
    pub fn children(&self) -> &[DescElement] {
        &self.children
    }

    /// First top-level element called `name`.
    pub fn child(&self, name: &str) -> Option<&DescElement> {
        find(&self.children, name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut DescElement> {
        find_mut(&mut self.children, name)
    }

    /// Text of the first top-level element called `name`, if it is a leaf.
    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(DescElement::value)
    }

    /// Appends a leaf `name = value` and returns `self` for chaining.
    pub fn append_child_value(&mut self, name: &str, value: &str) -> &mut Self {
        self.children.push(DescElement::leaf(name, value));
        self
    }

    /// Appends an empty container element and returns it.
    pub fn append_child(&mut self, name: &str) -> &mut DescElement {
        push(&mut self.children, DescElement::container(name))
    }

    /// Removes and returns the first top-level element called `name`.
    pub fn remove_child(&mut self, name: &str) -> Option<DescElement> {
        let index = self.children.iter().position(|e| e.name == name)?;
        Some(self.children.remove(index))
    }
}

// ── DescElement ───────────────────────────────────────────────────────────────

impl DescElement {
    /// A text element.
    pub fn leaf(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            node: DescNode::Value(value.to_string()),
        }
    }

    /// An element without children yet.
    pub fn container(name: &str) -> Self {
        Self {
            name: name.to_string(),
            node: DescNode::Children(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The text of a leaf element; `None` for containers.
    pub fn value(&self) -> Option<&str> {
        match &self.node {
            DescNode::Value(v) => Some(v),
            DescNode::Children(_) => None,
        }
    }

    /// Replaces the element's content with text.
    pub fn set_value(&mut self, value: &str) {
        self.node = DescNode::Value(value.to_string());
    }

    /// Child elements; empty for leaves.
    pub fn children(&self) -> &[DescElement] {
        match &self.node {
            DescNode::Value(_) => &[],
            DescNode::Children(c) => c,
        }
    }

    pub fn child(&self, name: &str) -> Option<&DescElement> {
        find(self.children(), name)
    }

    pub fn child_value(&self, name: &str) -> Option<&str> {
        self.child(name).and_then(DescElement::value)
    }

    /// Appends a leaf child.  A text element turns into a container and
    /// loses its text.
    pub fn append_child_value(&mut self, name: &str, value: &str) -> &mut Self {
        self.children_mut().push(DescElement::leaf(name, value));
        self
    }

    /// Appends an empty container child and returns it.
    pub fn append_child(&mut self, name: &str) -> &mut DescElement {
        push(self.children_mut(), DescElement::container(name))
    }

    fn children_mut(&mut self) -> &mut Vec<DescElement> {
        if let DescNode::Value(_) = self.node {
            self.node = DescNode::Children(Vec::new());
        }
        match &mut self.node {
            DescNode::Children(c) => c,
            DescNode::Value(_) => unreachable!("text node was replaced above"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
