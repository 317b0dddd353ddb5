// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Nodes, elements, shapes and the standalone merge specs.
//!
//! Stored entities hold a non-owning [`LayoutKey`] into the region's layout
//! registry plus a typed value buffer whose shape that layout describes.
//! Importers never construct stored entities directly; they build
//! [`NodeSpec`] / [`ElementSpec`] values and hand them to the merge engine.

use smallvec::SmallVec;

use crate::field::ValueType;
use crate::keys::{ElementId, ElementKind, LayoutKey, NodeId};
use crate::layout::ValueTotals;
use crate::store::Identified;

// =============================================================================
// Shapes
// =============================================================================

/// The parametric shape of an element, with linear-corner node counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ElementShape {
    Line,
    Triangle,
    Square,
    Tetrahedron,
    Cube,
}

/// Node indices of one sub-face, in the sub-face's own node order.
type FaceTable = &'static [&'static [usize]];

// Corner numbering follows the xi-coordinate convention: node index =
// xi1 + 2*xi2 (+ 4*xi3), so cube face tables read off one fixed xi plane.
const CUBE_FACES: FaceTable = &[
    &[0, 2, 4, 6], // xi1 = 0
    &[1, 3, 5, 7], // xi1 = 1
    &[0, 1, 4, 5], // xi2 = 0
    &[2, 3, 6, 7], // xi2 = 1
    &[0, 1, 2, 3], // xi3 = 0
    &[4, 5, 6, 7], // xi3 = 1
];
const SQUARE_FACES: FaceTable = &[&[0, 2], &[1, 3], &[0, 1], &[2, 3]];
const TRIANGLE_FACES: FaceTable = &[&[0, 1], &[0, 2], &[1, 2]];
const TETRAHEDRON_FACES: FaceTable = &[&[0, 1, 2], &[0, 1, 3], &[0, 2, 3], &[1, 2, 3]];

impl ElementShape {
    /// The parametric dimension of the shape.
    pub fn dimension(&self) -> u8 {
        match self {
            ElementShape::Line => 1,
            ElementShape::Triangle | ElementShape::Square => 2,
            ElementShape::Tetrahedron | ElementShape::Cube => 3,
        }
    }

    /// Number of corner nodes.
    pub fn node_count(&self) -> usize {
        match self {
            ElementShape::Line => 2,
            ElementShape::Triangle => 3,
            ElementShape::Square | ElementShape::Tetrahedron => 4,
            ElementShape::Cube => 8,
        }
    }

    /// Number of faces (lines count as faces of 2D shapes; 1D shapes have
    /// none, the hierarchy stops at lines).
    pub fn face_count(&self) -> usize {
        self.face_table().len()
    }

    /// The shape of face `index`.
    pub fn face_shape(&self, index: usize) -> Option<ElementShape> {
        if index >= self.face_count() {
            return None;
        }
        Some(match self {
            ElementShape::Line => return None,
            ElementShape::Triangle | ElementShape::Square => ElementShape::Line,
            ElementShape::Tetrahedron => ElementShape::Triangle,
            ElementShape::Cube => ElementShape::Square,
        })
    }

    /// Corner-node indices of face `index`, in the face's own node order.
    pub fn face_nodes(&self, index: usize) -> Option<&'static [usize]> {
        self.face_table().get(index).copied()
    }

    /// The element kind of this shape's faces: faces of a 3D element are
    /// stored as faces, faces of a 2D element as lines.
    pub fn face_kind(&self) -> Option<ElementKind> {
        match self.dimension() {
            3 => Some(ElementKind::Face),
            2 => Some(ElementKind::Line),
            _ => None,
        }
    }

    /// A synthesized sub-face collapses when too few distinct nodes remain:
    /// two for a 2D face, one for a line.
    pub fn collapses_at(&self) -> usize {
        match self.dimension() {
            2 => 2,
            _ => 1,
        }
    }

    fn face_table(&self) -> FaceTable {
        match self {
            ElementShape::Line => &[],
            ElementShape::Triangle => TRIANGLE_FACES,
            ElementShape::Square => SQUARE_FACES,
            ElementShape::Tetrahedron => TETRAHEDRON_FACES,
            ElementShape::Cube => CUBE_FACES,
        }
    }
}

// =============================================================================
// Value storage
// =============================================================================

/// Typed component values for one field, as supplied by an importer.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FieldValues {
    Real(Vec<f64>),
    Integer(Vec<i32>),
    Text(Vec<String>),
}

impl FieldValues {
    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            FieldValues::Real(v) => v.len(),
            FieldValues::Integer(v) => v.len(),
            FieldValues::Text(v) => v.len(),
        }
    }

    /// Whether there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The value type these values satisfy.
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValues::Real(_) => ValueType::Real,
            FieldValues::Integer(_) => ValueType::Integer,
            FieldValues::Text(_) => ValueType::Text,
        }
    }
}

/// Per-entity value storage, one vector per value type. A layout entry's
/// offset indexes the vector matching its field's value type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueBuffer {
    pub reals: Vec<f64>,
    pub integers: Vec<i32>,
    pub texts: Vec<String>,
}

impl ValueBuffer {
    /// Allocates a zeroed buffer of the given shape.
    pub fn with_totals(totals: ValueTotals) -> Self {
        Self {
            reals: vec![0.0; totals.reals],
            integers: vec![0; totals.integers],
            texts: vec![String::new(); totals.texts],
        }
    }

    /// Grows the buffer to a larger shape, zero-filling the new tail.
    pub fn grow_to(&mut self, totals: ValueTotals) {
        if totals.reals > self.reals.len() {
            self.reals.resize(totals.reals, 0.0);
        }
        if totals.integers > self.integers.len() {
            self.integers.resize(totals.integers, 0);
        }
        if totals.texts > self.texts.len() {
            self.texts.resize(totals.texts, String::new());
        }
    }

    /// Overwrites the values at a descriptor's range. The caller has
    /// already checked that the value count matches the descriptor.
    pub fn write(&mut self, offset: usize, values: &FieldValues) {
        match values {
            FieldValues::Real(v) => self.reals[offset..offset + v.len()].clone_from_slice(v),
            FieldValues::Integer(v) => {
                self.integers[offset..offset + v.len()].clone_from_slice(v)
            }
            FieldValues::Text(v) => self.texts[offset..offset + v.len()].clone_from_slice(v),
        }
    }

    /// Reads the values stored for a field.
    pub fn read(&self, value_type: ValueType, offset: usize, count: usize) -> FieldValues {
        match value_type {
            ValueType::Real => FieldValues::Real(self.reals[offset..offset + count].to_vec()),
            ValueType::Integer => {
                FieldValues::Integer(self.integers[offset..offset + count].to_vec())
            }
            ValueType::Text => FieldValues::Text(self.texts[offset..offset + count].to_vec()),
        }
    }
}

// =============================================================================
// Stored entities
// =============================================================================

/// A stored node: identifier, layout reference and value buffer.
#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub layout: Option<LayoutKey>,
    pub values: ValueBuffer,
}

impl Node {
    /// Creates a node with no fields defined.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            layout: None,
            values: ValueBuffer::default(),
        }
    }
}

impl Identified<NodeId> for Node {
    fn id(&self) -> NodeId {
        self.id
    }
    fn set_id(&mut self, id: NodeId) {
        self.id = id;
    }
}

/// A stored element: shape, corner-node connectivity, face links, and the
/// same layout/value machinery nodes use.
#[derive(Debug)]
pub struct Element {
    pub id: ElementId,
    pub shape: ElementShape,
    /// Corner nodes referenced by the default coordinate field, in shape
    /// order. Empty when the element carries no connectivity.
    pub nodes: SmallVec<[NodeId; 8]>,
    /// One slot per shape face; `None` until defined or linked.
    pub faces: SmallVec<[Option<ElementId>; 6]>,
    pub layout: Option<LayoutKey>,
    pub values: ValueBuffer,
    /// A synthesized face that degenerated to too few distinct nodes. It
    /// stays out of topology matching but keeps its identifier.
    pub collapsed: bool,
}

impl Element {
    /// Creates an element with no connectivity, fields or faces.
    pub fn new(id: ElementId, shape: ElementShape) -> Self {
        Self {
            id,
            shape,
            nodes: SmallVec::new(),
            faces: smallvec::smallvec![None; shape.face_count()],
            layout: None,
            values: ValueBuffer::default(),
            collapsed: false,
        }
    }

    /// The distinct node identifiers of this element, ascending.
    pub fn distinct_nodes(&self) -> SmallVec<[NodeId; 8]> {
        let mut nodes = self.nodes.clone();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Whether this element references the given node.
    pub fn references_node(&self, id: NodeId) -> bool {
        self.nodes.contains(&id)
    }

    /// Whether this element links the given face or line.
    pub fn references_face(&self, id: ElementId) -> bool {
        self.faces.iter().any(|f| *f == Some(id))
    }
}

impl Identified<ElementId> for Element {
    fn id(&self) -> ElementId {
        self.id
    }
    fn set_id(&mut self, id: ElementId) {
        self.id = id;
    }
}

// =============================================================================
// Merge specs
// =============================================================================

/// One field's definition and values on an incoming entity.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldValueSpec {
    pub field: crate::field::FieldSpec,
    pub versions: u32,
    pub values: FieldValues,
}

/// A standalone node as an importer builds it, ready to merge.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeSpec {
    pub id: NodeId,
    pub fields: Vec<FieldValueSpec>,
}

impl NodeSpec {
    /// Creates a node spec with no fields.
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            fields: Vec::new(),
        }
    }

    /// Adds a single-version field with its values.
    pub fn with_field(self, field: crate::field::FieldSpec, values: FieldValues) -> Self {
        self.with_field_versions(field, 1, values)
    }

    /// Adds a field with an explicit version count.
    pub fn with_field_versions(
        mut self,
        field: crate::field::FieldSpec,
        versions: u32,
        values: FieldValues,
    ) -> Self {
        self.fields.push(FieldValueSpec {
            field,
            versions,
            values,
        });
        self
    }
}

/// A standalone element as an importer builds it, ready to merge.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ElementSpec {
    pub id: ElementId,
    pub shape: ElementShape,
    /// Corner-node connectivity; empty leaves any existing connectivity
    /// untouched on reconcile.
    pub nodes: Vec<NodeId>,
    /// Explicit face links; empty leaves face slots untouched.
    pub faces: Vec<Option<ElementId>>,
    pub fields: Vec<FieldValueSpec>,
}

impl ElementSpec {
    /// Creates an element spec with no connectivity or fields.
    pub fn new(id: ElementId, shape: ElementShape) -> Self {
        Self {
            id,
            shape,
            nodes: Vec::new(),
            faces: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Sets the corner-node connectivity.
    pub fn with_nodes(mut self, nodes: impl IntoIterator<Item = i32>) -> Self {
        self.nodes = nodes.into_iter().map(NodeId).collect();
        self
    }

    /// Sets explicit face links.
    pub fn with_faces(mut self, faces: Vec<Option<ElementId>>) -> Self {
        self.faces = faces;
        self
    }

    /// Adds a single-version field with its values.
    pub fn with_field(mut self, field: crate::field::FieldSpec, values: FieldValues) -> Self {
        self.fields.push(FieldValueSpec {
            field,
            versions: 1,
            values,
        });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_dimensions_and_counts() {
        assert_eq!(ElementShape::Line.dimension(), 1);
        assert_eq!(ElementShape::Cube.dimension(), 3);
        assert_eq!(ElementShape::Cube.node_count(), 8);
        assert_eq!(ElementShape::Cube.face_count(), 6);
        assert_eq!(ElementShape::Tetrahedron.face_count(), 4);
        assert_eq!(ElementShape::Line.face_count(), 0);
    }

    #[test]
    fn cube_faces_are_squares_with_shared_edges() {
        let shape = ElementShape::Cube;
        assert_eq!(shape.face_shape(0), Some(ElementShape::Square));
        assert_eq!(shape.face_kind(), Some(ElementKind::Face));

        // Every cube corner appears on exactly 3 of the 6 faces.
        let mut appearances = [0usize; 8];
        for i in 0..shape.face_count() {
            for &n in shape.face_nodes(i).unwrap() {
                appearances[n] += 1;
            }
        }
        assert_eq!(appearances, [3; 8]);
    }

    #[test]
    fn tetrahedron_faces_are_triangles() {
        let shape = ElementShape::Tetrahedron;
        assert_eq!(shape.face_shape(0), Some(ElementShape::Triangle));
        // Each tet corner appears on exactly 3 of the 4 faces.
        let mut appearances = [0usize; 4];
        for i in 0..shape.face_count() {
            for &n in shape.face_nodes(i).unwrap() {
                appearances[n] += 1;
            }
        }
        assert_eq!(appearances, [3; 4]);
    }

    #[test]
    fn square_faces_are_lines() {
        let shape = ElementShape::Square;
        assert_eq!(shape.face_shape(0), Some(ElementShape::Line));
        assert_eq!(shape.face_kind(), Some(ElementKind::Line));
        assert_eq!(shape.face_nodes(0), Some(&[0usize, 2][..]));
    }

    #[test]
    fn value_buffer_round_trip() {
        let mut buffer = ValueBuffer::with_totals(ValueTotals {
            reals: 6,
            integers: 1,
            texts: 0,
        });
        buffer.write(3, &FieldValues::Real(vec![1.0, 2.0, 3.0]));
        buffer.write(0, &FieldValues::Integer(vec![42]));

        assert_eq!(
            buffer.read(ValueType::Real, 3, 3),
            FieldValues::Real(vec![1.0, 2.0, 3.0])
        );
        assert_eq!(
            buffer.read(ValueType::Integer, 0, 1),
            FieldValues::Integer(vec![42])
        );
        // Unwritten values stay zeroed.
        assert_eq!(
            buffer.read(ValueType::Real, 0, 3),
            FieldValues::Real(vec![0.0, 0.0, 0.0])
        );
    }

    #[test]
    fn element_distinct_nodes_sorts_and_dedups() {
        let mut element = Element::new(ElementId::face(1), ElementShape::Square);
        element.nodes = smallvec::smallvec![NodeId(7), NodeId(3), NodeId(7), NodeId(1)];
        let distinct = element.distinct_nodes();
        assert_eq!(&distinct[..], &[NodeId(1), NodeId(3), NodeId(7)]);
    }
}
