//! Animation targets: either a selector resolved lazily at execution time,
//! or an element handle the caller already holds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle to a host element (DOM node, scene object, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Looked up through the host `TargetResolver` when the request runs.
    Selector(String),
    /// Already resolved, passed through untouched.
    Element(ElementId),
}

impl Target {
    pub fn selector(s: impl Into<String>) -> Self {
        Target::Selector(s.into())
    }

    /// Empty selectors count as a missing target.
    pub fn is_empty(&self) -> bool {
        match self {
            Target::Selector(s) => s.trim().is_empty(),
            Target::Element(_) => false,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Selector(s) => write!(f, "{}", s),
            Target::Element(id) => write!(f, "{}", id),
        }
    }
}

impl From<&str> for Target {
    fn from(s: &str) -> Self {
        Target::Selector(s.to_string())
    }
}

impl From<ElementId> for Target {
    fn from(id: ElementId) -> Self {
        Target::Element(id)
    }
}
