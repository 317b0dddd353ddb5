// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Duplicate-topology index for face and line de-duplication.
//!
//! During face definition, a synthesized face must find any existing face
//! spanning the same node set, so two elements sharing a face end up
//! referencing one shared face entity. The index keys faces and lines by
//! (kind, dimension, ascending distinct node identifiers) and lives only
//! inside an explicit begin/end-define-faces bracket: maintaining it is
//! O(n) in the face count, so it is built for a generation pass and torn
//! down afterwards.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::debug;

use crate::entity::Element;
use crate::keys::{ElementId, ElementKind, NodeId};
use crate::region::Region;

/// Index key: element kind, parametric dimension, and the ascending
/// distinct node identifiers the entity spans.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopologyKey {
    pub kind: ElementKind,
    pub dimension: u8,
    pub nodes: SmallVec<[NodeId; 8]>,
}

impl TopologyKey {
    /// The key for a stored element, or `None` when the element cannot
    /// participate in topology matching (collapsed, or no connectivity).
    pub fn for_element(element: &Element) -> Option<TopologyKey> {
        if element.collapsed || element.nodes.is_empty() {
            return None;
        }
        Some(TopologyKey {
            kind: element.id.kind,
            dimension: element.shape.dimension(),
            nodes: element.distinct_nodes(),
        })
    }
}

/// Transient node-set-keyed lookup from topology keys to the element that
/// owns each node set.
#[derive(Debug, Default)]
pub struct DuplicateTopologyIndex {
    entries: FxHashMap<TopologyKey, ElementId>,
}

impl DuplicateTopologyIndex {
    /// Creates an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of indexed entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registers an element under a key. Returns the previous holder when
    /// the key was already taken, leaving the previous mapping replaced.
    pub fn insert(&mut self, key: TopologyKey, id: ElementId) -> Option<ElementId> {
        self.entries.insert(key, id)
    }

    /// The element spanning this node set, if any.
    pub fn find(&self, key: &TopologyKey) -> Option<ElementId> {
        self.entries.get(key).copied()
    }

    /// Unregisters a key. Returns the element it mapped to.
    pub fn remove(&mut self, key: &TopologyKey) -> Option<ElementId> {
        self.entries.remove(key)
    }
}

impl Region {
    /// Opens a define-faces bracket on this region's tree, building the
    /// duplicate-topology index from all non-collapsed faces and lines.
    /// Brackets nest; the index is built on the outermost open.
    pub fn begin_define_faces(&self) {
        let root = self.ultimate_master();
        let mut st = root.inner.borrow_mut();
        st.face_define_level += 1;
        if st.face_define_level > 1 {
            return;
        }
        let mut index = DuplicateTopologyIndex::new();
        for element in st.elements.iter() {
            if matches!(element.id.kind, ElementKind::Face | ElementKind::Line) {
                if let Some(key) = TopologyKey::for_element(element) {
                    index.insert(key, element.id);
                }
            }
        }
        debug!(indexed = index.len(), "built duplicate-topology index");
        st.face_index = Some(index);
    }

    /// Closes a define-faces bracket, tearing the index down on the
    /// outermost close.
    pub fn end_define_faces(&self) {
        let root = self.ultimate_master();
        let mut st = root.inner.borrow_mut();
        debug_assert!(st.face_define_level > 0, "unbalanced end_define_faces");
        st.face_define_level = st.face_define_level.saturating_sub(1);
        if st.face_define_level == 0 {
            st.face_index = None;
        }
    }

    /// Whether a define-faces bracket is currently open.
    pub fn defining_faces(&self) -> bool {
        self.ultimate_master().inner.borrow().face_index.is_some()
    }
}
