// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Identifier and key types for the region store.
//!
//! Two kinds of handles coexist: *identifiers* ([`NodeId`], [`ElementId`])
//! are caller-chosen positive integers, unique within the ultimate master
//! region and stable across sessions; *keys* ([`FieldKey`], [`LayoutKey`])
//! are arena-chosen generational keys (`slotmap`) for interned objects that
//! only ever live inside one region tree.

use slotmap::new_key_type;

new_key_type! {
    /// Key for a field registered in a region's field directory.
    pub struct FieldKey;

    /// Key for an interned field layout in the layout registry.
    pub struct LayoutKey;
}

/// Identifier of a node. Node numbers are positive and unique within the
/// ultimate master region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeId(pub i32);

impl NodeId {
    /// Returns the node number.
    pub fn number(self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node {}", self.0)
    }
}

/// Discriminant for the three stored element varieties: top-level elements,
/// faces, and lines. Faces and lines are usually synthesized during face
/// definition, but importers may merge them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementKind {
    Element = 0,
    Face = 1,
    Line = 2,
}

impl ElementKind {
    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Element => "element",
            ElementKind::Face => "face",
            ElementKind::Line => "line",
        }
    }
}

/// Identifier of an element: a kind plus a positive number. Numbers are
/// unique per kind within the ultimate master region, so `element 1`,
/// `face 1` and `line 1` are three distinct entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementId {
    pub kind: ElementKind,
    pub number: i32,
}

impl ElementId {
    /// Creates an element identifier from a kind and number.
    pub fn new(kind: ElementKind, number: i32) -> Self {
        Self { kind, number }
    }

    /// Shorthand for a top-level element identifier.
    pub fn element(number: i32) -> Self {
        Self::new(ElementKind::Element, number)
    }

    /// Shorthand for a face identifier.
    pub fn face(number: i32) -> Self {
        Self::new(ElementKind::Face, number)
    }

    /// Shorthand for a line identifier.
    pub fn line(number: i32) -> Self {
        Self::new(ElementKind::Line, number)
    }
}

impl std::fmt::Display for ElementId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.kind.as_str(), self.number)
    }
}

/// A reference to any identified entity, used in error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Field(String),
    Node(NodeId),
    Element(ElementId),
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityRef::Field(name) => write!(f, "field {name}"),
            EntityRef::Node(id) => id.fmt(f),
            EntityRef::Element(id) => id.fmt(f),
        }
    }
}

impl From<NodeId> for EntityRef {
    fn from(id: NodeId) -> Self {
        EntityRef::Node(id)
    }
}

impl From<ElementId> for EntityRef {
    fn from(id: ElementId) -> Self {
        EntityRef::Element(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_ordering() {
        assert!(NodeId(1) < NodeId(2));
        assert!(NodeId(10) > NodeId(9));
    }

    #[test]
    fn element_id_orders_by_kind_then_number() {
        assert!(ElementId::element(99) < ElementId::face(1));
        assert!(ElementId::face(99) < ElementId::line(1));
        assert!(ElementId::element(1) < ElementId::element(2));
    }

    #[test]
    fn display_forms() {
        assert_eq!(NodeId(5).to_string(), "node 5");
        assert_eq!(ElementId::face(3).to_string(), "face 3");
        assert_eq!(
            EntityRef::Field("coordinates".to_string()).to_string(),
            "field coordinates"
        );
    }
}
