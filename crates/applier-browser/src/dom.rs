//! Synthetic document model
//!
//! A [`DomSnapshot`] is a flat, document-ordered list of element nodes read
//! from a live page. Resolution and verification run against snapshots, so
//! the automation engine is testable without a browser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Page-assigned node identity, stable for the lifetime of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One element of the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomNode {
    pub id: NodeId,
    /// Lowercase tag name
    pub tag: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Trimmed text content
    #[serde(default)]
    pub text: String,
    /// Current value of form controls
    #[serde(default)]
    pub value: Option<String>,
    /// Whether the element has a layout box
    #[serde(default)]
    pub visible: bool,
}

impl DomNode {
    pub fn element(id: u64, tag: impl Into<String>) -> Self {
        Self {
            id: NodeId(id),
            tag: tag.into().to_lowercase(),
            attributes: BTreeMap::new(),
            text: String::new(),
            value: None,
            visible: true,
        }
    }

    pub fn with_attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    /// User-facing label: text content, falling back to the value of inputs
    pub fn label(&self) -> &str {
        let text = self.text.trim();
        if text.is_empty() {
            self.value.as_deref().unwrap_or("").trim()
        } else {
            text
        }
    }
}

/// `document.readyState`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    #[default]
    Loading,
    Interactive,
    Complete,
}

/// Point-in-time view of a document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomSnapshot {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub ready_state: ReadyState,
    #[serde(default)]
    pub nodes: Vec<DomNode>,
}

impl DomSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            ready_state: ReadyState::Complete,
            nodes: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_node(mut self, node: DomNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn node(&self, id: NodeId) -> Option<&DomNode> {
        self.nodes.iter().find(|node| node.id == id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut DomNode> {
        self.nodes.iter_mut().find(|node| node.id == id)
    }

    pub fn is_complete(&self) -> bool {
        self.ready_state == ReadyState::Complete
    }
}
