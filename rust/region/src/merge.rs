// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The merge engine: structure-preserving upserts and the mutation
//! front-end of the region.
//!
//! Every merge runs the same state machine: validate everything first,
//! then commit, so a failed call leaves the region untouched. Incoming
//! specs are standalone entities; their field layouts are interned into
//! the target registry during commit, and a reconciled entity's replaced
//! layout reference is released in the same step. Each entry point wraps
//! itself in a change bracket, so caller-side bracketing affects only how
//! many notifications fire, never correctness.

use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use tracing::trace;

use crate::change::ChangeClass;
use crate::dedup::TopologyKey;
use crate::entity::{Element, ElementSpec, FieldValueSpec, Node, NodeSpec, ValueBuffer};
use crate::error::{Error, Result};
use crate::field::{Field, FieldChange, FieldDirectory, FieldSpec, ValueValidator};
use crate::keys::{ElementId, ElementKind, NodeId};
use crate::layout::{FieldLayout, LayoutEntry, LayoutRegistry, StorageDescriptor, ValueTotals};
use crate::region::Region;

/// Whether `merge_element` also defines the element's faces and lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceMode {
    /// Merge the element only.
    Ignore,
    /// Synthesize missing faces and lines, de-duplicated against the
    /// topology index, parent before child.
    Define,
}

// =============================================================================
// Field-spec plumbing shared by node and element merges
// =============================================================================

/// Checks a spec's field list against the directory and an existing
/// entity's layout without modifying anything.
fn validate_field_specs(
    specs: &[FieldValueSpec],
    dir: &FieldDirectory,
    validator: Option<&ValueValidator>,
    existing_layout: Option<&FieldLayout>,
) -> Result<()> {
    let mut seen: FxHashSet<&str> = FxHashSet::default();
    for fv in specs {
        let name = fv.field.name.as_str();
        if !seen.insert(name) {
            return Err(Error::FieldStructureConflict(name.to_string()));
        }
        let expected = fv.field.component_count as usize * fv.versions as usize;
        if fv.versions == 0
            || fv.values.value_type() != fv.field.value_type
            || fv.values.len() != expected
        {
            return Err(Error::FieldStructureConflict(name.to_string()));
        }
        dir.check_compatible(&fv.field)?;
        if fv.field.default_values.is_some() {
            if let Some(validate) = validator {
                if !validate(&fv.field) {
                    return Err(Error::InvalidFieldValues(name.to_string()));
                }
            }
        }
        if let Some(layout) = existing_layout {
            if let Some(key) = dir.find_by_name(name) {
                if let Some(entry) = layout.entry(key) {
                    if entry.descriptor.versions != fv.versions {
                        return Err(Error::FieldStructureConflict(name.to_string()));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Applies a validated field list to an entity's layout reference and
/// value buffer: merges field definitions, extends or interns the layout,
/// and overwrites values. Returns whether the entity's content actually
/// changed. Field-directory changes are appended to `field_changes` for
/// the caller to log.
fn apply_field_specs(
    specs: &[FieldValueSpec],
    dir: &mut FieldDirectory,
    registry: &mut LayoutRegistry,
    layout_slot: &mut Option<crate::keys::LayoutKey>,
    values: &mut ValueBuffer,
    field_changes: &mut Vec<(String, ChangeClass)>,
) -> Result<bool> {
    if specs.is_empty() {
        return Ok(false);
    }

    // Merge definitions; validation has already ruled out failure paths
    // other than the ones `merge` re-checks.
    let mut resolved = Vec::with_capacity(specs.len());
    for fv in specs {
        let (key, change) = dir.merge(&fv.field, None)?;
        match change {
            FieldChange::Created => field_changes.push((fv.field.name.clone(), ChangeClass::Added)),
            FieldChange::Updated => {
                field_changes.push((fv.field.name.clone(), ChangeClass::ObjectChanged))
            }
            FieldChange::Unchanged => {}
        }
        let field = dir
            .field(key)
            .ok_or_else(|| Error::FieldNotFound(fv.field.name.clone()))?;
        let count = field.component_count as usize * fv.versions as usize;
        resolved.push((key, field.value_type, count, fv));
    }

    match *layout_slot {
        None => {
            let mut totals = ValueTotals::default();
            let mut entries: SmallVec<[LayoutEntry; 4]> = SmallVec::new();
            let mut writes = Vec::with_capacity(resolved.len());
            for &(key, value_type, count, fv) in &resolved {
                let offset = totals.allocate(value_type, count);
                entries.push(LayoutEntry {
                    field: key,
                    descriptor: StorageDescriptor {
                        offset,
                        versions: fv.versions,
                    },
                });
                writes.push((offset, fv));
            }
            let layout_key = registry.find_or_create(FieldLayout::new(entries, totals));
            *layout_slot = Some(layout_key);
            values.grow_to(totals);
            for (offset, fv) in writes {
                values.write(offset, &fv.values);
            }
            Ok(true)
        }
        Some(current_key) => {
            let current = registry
                .layout(current_key)
                .cloned()
                .unwrap_or_default();
            let mut totals = current.totals();
            let mut additions: Vec<(LayoutEntry, crate::field::ValueType, usize)> = Vec::new();
            let mut writes = Vec::with_capacity(resolved.len());
            for &(key, value_type, count, fv) in &resolved {
                match current.entry(key) {
                    Some(entry) => writes.push((entry.descriptor.offset, value_type, count, fv)),
                    None => {
                        let offset = totals.allocate(value_type, count);
                        let entry = LayoutEntry {
                            field: key,
                            descriptor: StorageDescriptor {
                                offset,
                                versions: fv.versions,
                            },
                        };
                        additions.push((entry, value_type, count));
                        writes.push((offset, value_type, count, fv));
                    }
                }
            }

            let mut mutated = !additions.is_empty();
            let new_key = registry.extend(current_key, &additions)?;
            *layout_slot = Some(new_key);
            if let Some(layout) = registry.layout(new_key) {
                values.grow_to(layout.totals());
            }
            for (offset, value_type, count, fv) in writes {
                if values.read(value_type, offset, count) != fv.values {
                    values.write(offset, &fv.values);
                    mutated = true;
                }
            }
            Ok(mutated)
        }
    }
}

// =============================================================================
// Field merges and removal
// =============================================================================

impl Region {
    /// Merges a field definition into the region's directory.
    ///
    /// Repeating an identical definition is a no-op; a compatible
    /// definition updating the spheroidal focus or the default values
    /// updates in place; anything else fails
    /// [`Error::IncompatibleField`].
    pub fn merge_field(&self, spec: &FieldSpec) -> Result<Field> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.merge_field_inner(spec);
        self.end_change();
        result
    }

    fn merge_field_inner(&self, spec: &FieldSpec) -> Result<Field> {
        let root = self.ultimate_master();
        let fields = root.fields_rc();
        let (field, change) = {
            let st = root.inner.borrow();
            let mut dir = fields.borrow_mut();
            let (key, change) = dir.merge(spec, st.validator.as_ref())?;
            let field = dir
                .field(key)
                .cloned()
                .ok_or_else(|| Error::FieldNotFound(spec.name.clone()))?;
            (field, change)
        };
        match change {
            FieldChange::Created => {
                trace!(name = %spec.name, "merged new field");
                self.log_field(&spec.name, ChangeClass::Added);
            }
            FieldChange::Updated => self.log_field(&spec.name, ChangeClass::ObjectChanged),
            FieldChange::Unchanged => {}
        }
        Ok(field)
    }

    /// Removes a field by name.
    ///
    /// Fails with [`Error::FieldInUse`] while any live layout stores the
    /// field, or while another field is indexed by it.
    pub fn remove_field(&self, name: &str) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.remove_field_inner(name);
        self.end_change();
        result
    }

    fn remove_field_inner(&self, name: &str) -> Result<()> {
        let root = self.ultimate_master();
        let fields = root.fields_rc();
        let layouts = root.layouts_rc();
        {
            let mut dir = fields.borrow_mut();
            let key = dir
                .find_by_name(name)
                .ok_or_else(|| Error::FieldNotFound(name.to_string()))?;
            if layouts.borrow().references_field(key) {
                return Err(Error::FieldInUse(name.to_string()));
            }
            if dir.iter().any(|(_, f)| f.indexer == Some(key)) {
                return Err(Error::FieldInUse(name.to_string()));
            }
            dir.remove(key);
        }
        self.log_field(name, ChangeClass::Removed);
        Ok(())
    }
}

// =============================================================================
// Node merges
// =============================================================================

impl Region {
    /// Merges a standalone node into the region: inserts it when the
    /// identifier is free, otherwise reconciles field structure and
    /// overwrites values. Fails without touching the target on any
    /// validation error.
    pub fn merge_node(&self, spec: &NodeSpec) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.merge_node_inner(spec);
        self.end_change();
        result
    }

    /// Merges a batch of nodes inside one change bracket, continuing past
    /// per-node failures. Returns the residual list of nodes that could
    /// not be merged.
    pub fn merge_nodes(&self, specs: &[NodeSpec]) -> Result<Vec<(NodeId, Error)>> {
        self.check_mutable()?;
        self.begin_change();
        let mut residual = Vec::new();
        for spec in specs {
            if let Err(error) = self.merge_node_inner(spec) {
                residual.push((spec.id, error));
            }
        }
        self.end_change();
        Ok(residual)
    }

    pub(crate) fn merge_node_inner(&self, spec: &NodeSpec) -> Result<()> {
        if spec.id.0 <= 0 {
            return Err(Error::InvalidIdentifier(spec.id.into()));
        }
        let root = self.ultimate_master();
        let fields = root.fields_rc();
        let layouts = root.layouts_rc();

        // Validate: nothing below this block may fail after it passes.
        {
            let st = root.inner.borrow();
            let dir = fields.borrow();
            let registry = layouts.borrow();
            let existing_layout = st
                .nodes
                .get(spec.id)
                .and_then(|n| n.layout)
                .and_then(|k| registry.layout(k))
                .cloned();
            validate_field_specs(
                &spec.fields,
                &dir,
                st.validator.as_ref(),
                existing_layout.as_ref(),
            )?;
        }

        // Commit.
        let mut field_changes = Vec::new();
        let added;
        let mutated;
        {
            let mut st = root.inner.borrow_mut();
            let mut dir = fields.borrow_mut();
            let mut registry = layouts.borrow_mut();
            if let Some(node) = st.nodes.get_mut(spec.id) {
                added = false;
                mutated = apply_field_specs(
                    &spec.fields,
                    &mut dir,
                    &mut registry,
                    &mut node.layout,
                    &mut node.values,
                    &mut field_changes,
                )?;
            } else {
                added = true;
                mutated = true;
                let mut node = Node::new(spec.id);
                apply_field_specs(
                    &spec.fields,
                    &mut dir,
                    &mut registry,
                    &mut node.layout,
                    &mut node.values,
                    &mut field_changes,
                )?;
                st.nodes.insert(node)?;
            }
        }

        // Log and record membership.
        self.add_node_membership(spec.id);
        for (name, class) in field_changes {
            self.log_field(&name, class);
        }
        if added {
            trace!(id = %spec.id, "merged new node");
            self.log_node(spec.id, ChangeClass::Added);
        } else if mutated {
            self.log_node(spec.id, ChangeClass::ObjectChanged);
        }
        Ok(())
    }

    /// Removes a node. On a master region this destroys the node (failing
    /// with [`Error::EntityInUse`] while an element references it); on a
    /// sub-region it only drops the node from the membership.
    pub fn remove_node(&self, id: NodeId) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.remove_node_inner(id);
        self.end_change();
        result
    }

    /// Removes a batch of nodes inside one change bracket, continuing past
    /// per-node failures. Returns the residual list.
    pub fn remove_nodes(&self, ids: &[NodeId]) -> Result<Vec<(NodeId, Error)>> {
        self.check_mutable()?;
        self.begin_change();
        let mut residual = Vec::new();
        for &id in ids {
            if let Err(error) = self.remove_node_inner(id) {
                residual.push((id, error));
            }
        }
        self.end_change();
        Ok(residual)
    }

    fn remove_node_inner(&self, id: NodeId) -> Result<()> {
        let root = self.ultimate_master();
        if !self.is_same(&root) {
            // Membership-only removal; the master still owns the node.
            if !self.contains_node(id) {
                return Err(Error::NodeNotFound(id));
            }
            let contained = self.purge_node_membership(id);
            for region in contained {
                region
                    .inner
                    .borrow_mut()
                    .tracker
                    .nodes
                    .log(id, ChangeClass::Removed);
            }
            return Ok(());
        }

        {
            let st = root.inner.borrow();
            if !st.nodes.contains(id) {
                return Err(Error::NodeNotFound(id));
            }
            if st.elements.find(|e| e.references_node(id)).is_some() {
                return Err(Error::EntityInUse(id.into()));
            }
        }
        let contained = root.purge_node_membership(id);
        let layouts = root.layouts_rc();
        {
            let mut st = root.inner.borrow_mut();
            if let Some(node) = st.nodes.remove(id) {
                if let Some(layout) = node.layout {
                    layouts.borrow_mut().release(layout);
                }
            }
        }
        root.inner
            .borrow_mut()
            .tracker
            .nodes
            .log(id, ChangeClass::Removed);
        for region in contained {
            region
                .inner
                .borrow_mut()
                .tracker
                .nodes
                .log(id, ChangeClass::Removed);
        }
        trace!(id = %id, "removed node");
        Ok(())
    }

    /// Atomically renames a node. Elements referencing the node are
    /// rewritten (and logged as related changes); memberships across the
    /// tree follow the rename.
    pub fn change_node_identifier(&self, old: NodeId, new: NodeId) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.change_node_identifier_inner(old, new);
        self.end_change();
        result
    }

    fn change_node_identifier_inner(&self, old: NodeId, new: NodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let root = self.ultimate_master();
        let affected = {
            let mut st = root.inner.borrow_mut();
            st.nodes.change_identifier(old, new)?;
            let mut affected = Vec::new();
            let mut rekeyed = Vec::new();
            for element in st.elements.iter_mut() {
                if element.references_node(old) {
                    let indexed =
                        matches!(element.id.kind, ElementKind::Face | ElementKind::Line);
                    let old_key = indexed.then(|| TopologyKey::for_element(element)).flatten();
                    for node in element.nodes.iter_mut() {
                        if *node == old {
                            *node = new;
                        }
                    }
                    let new_key = indexed.then(|| TopologyKey::for_element(element)).flatten();
                    affected.push(element.id);
                    rekeyed.push((old_key, new_key, element.id));
                }
            }
            if let Some(index) = st.face_index.as_mut() {
                for (old_key, new_key, id) in rekeyed {
                    if let Some(key) = old_key {
                        index.remove(&key);
                    }
                    if let Some(key) = new_key {
                        index.insert(key, id);
                    }
                }
            }
            affected
        };
        for region in root.tree() {
            if region.is_same(&root) {
                continue;
            }
            let mut st = region.inner.borrow_mut();
            if st.node_members.remove(&old) {
                st.node_members.insert(new);
            }
        }
        self.log_node(new, ChangeClass::IdentifierChanged);
        for id in affected {
            self.log_element(id, ChangeClass::RelatedObjectChanged);
        }
        Ok(())
    }
}

// =============================================================================
// Element merges
// =============================================================================

impl Region {
    /// Merges a standalone element, optionally defining its faces and
    /// lines. Referenced nodes must already exist; use
    /// [`Region::merge_element_with_nodes`] to merge them in the same
    /// bracket.
    pub fn merge_element(&self, spec: &ElementSpec, mode: FaceMode) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.merge_element_inner(spec, mode);
        self.end_change();
        result
    }

    /// Merges an element's nodes, then the element itself, inside one
    /// change bracket.
    pub fn merge_element_with_nodes(
        &self,
        spec: &ElementSpec,
        nodes: &[NodeSpec],
        mode: FaceMode,
    ) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let mut result = Ok(());
        for node_spec in nodes {
            if let Err(error) = self.merge_node_inner(node_spec) {
                result = Err(error);
                break;
            }
        }
        if result.is_ok() {
            result = self.merge_element_inner(spec, mode);
        }
        self.end_change();
        result
    }

    /// Merges a batch of elements inside one change bracket, continuing
    /// past per-element failures. Returns the residual list.
    pub fn merge_elements(
        &self,
        specs: &[ElementSpec],
        mode: FaceMode,
    ) -> Result<Vec<(ElementId, Error)>> {
        self.check_mutable()?;
        self.begin_change();
        let transient = mode == FaceMode::Define && !self.defining_faces();
        if transient {
            self.begin_define_faces();
        }
        let mut residual = Vec::new();
        for spec in specs {
            if let Err(error) = self.merge_element_inner(spec, mode) {
                residual.push((spec.id, error));
            }
        }
        if transient {
            self.end_define_faces();
        }
        self.end_change();
        Ok(residual)
    }

    fn merge_element_inner(&self, spec: &ElementSpec, mode: FaceMode) -> Result<()> {
        if spec.id.number <= 0 {
            return Err(Error::InvalidIdentifier(spec.id.into()));
        }
        let root = self.ultimate_master();
        let fields = root.fields_rc();
        let layouts = root.layouts_rc();

        // Validate.
        {
            let st = root.inner.borrow();
            if let Some(existing) = st.elements.get(spec.id) {
                if existing.shape != spec.shape {
                    return Err(Error::InvalidTopology(format!(
                        "shape mismatch at {}: stored {:?}, incoming {:?}",
                        spec.id, existing.shape, spec.shape
                    )));
                }
            }
            if !spec.nodes.is_empty() && spec.nodes.len() != spec.shape.node_count() {
                return Err(Error::InvalidTopology(format!(
                    "{} requires {} nodes, got {}",
                    spec.id,
                    spec.shape.node_count(),
                    spec.nodes.len()
                )));
            }
            for &node in &spec.nodes {
                if !st.nodes.contains(node) {
                    return Err(Error::InvalidTopology(format!(
                        "{} references missing {}",
                        spec.id, node
                    )));
                }
            }
            if !spec.faces.is_empty() && spec.faces.len() != spec.shape.face_count() {
                return Err(Error::InvalidTopology(format!(
                    "{} requires {} face slots, got {}",
                    spec.id,
                    spec.shape.face_count(),
                    spec.faces.len()
                )));
            }
            for face in spec.faces.iter().flatten() {
                match st.elements.get(*face) {
                    None => {
                        return Err(Error::InvalidTopology(format!(
                            "{} links missing {}",
                            spec.id, face
                        )))
                    }
                    Some(stored) => {
                        if stored.shape.dimension() + 1 != spec.shape.dimension() {
                            return Err(Error::InvalidTopology(format!(
                                "{} links {} of wrong dimension",
                                spec.id, face
                            )));
                        }
                    }
                }
            }
            let dir = fields.borrow();
            let registry = layouts.borrow();
            let existing_layout = st
                .elements
                .get(spec.id)
                .and_then(|e| e.layout)
                .and_then(|k| registry.layout(k))
                .cloned();
            validate_field_specs(
                &spec.fields,
                &dir,
                st.validator.as_ref(),
                existing_layout.as_ref(),
            )?;
        }

        // Commit.
        let mut field_changes = Vec::new();
        let added;
        let mut mutated;
        {
            let mut st = root.inner.borrow_mut();
            let mut dir = fields.borrow_mut();
            let mut registry = layouts.borrow_mut();
            if let Some(element) = st.elements.get_mut(spec.id) {
                added = false;
                mutated = apply_field_specs(
                    &spec.fields,
                    &mut dir,
                    &mut registry,
                    &mut element.layout,
                    &mut element.values,
                    &mut field_changes,
                )?;
                if !spec.nodes.is_empty() && element.nodes[..] != spec.nodes[..] {
                    element.nodes = spec.nodes.iter().copied().collect();
                    mutated = true;
                }
                for (slot, incoming) in element.faces.iter_mut().zip(spec.faces.iter()) {
                    if incoming.is_some() && *slot != *incoming {
                        *slot = *incoming;
                        mutated = true;
                    }
                }
            } else {
                added = true;
                mutated = true;
                let mut element = Element::new(spec.id, spec.shape);
                element.nodes = spec.nodes.iter().copied().collect();
                for (slot, incoming) in element.faces.iter_mut().zip(spec.faces.iter()) {
                    *slot = *incoming;
                }
                apply_field_specs(
                    &spec.fields,
                    &mut dir,
                    &mut registry,
                    &mut element.layout,
                    &mut element.values,
                    &mut field_changes,
                )?;
                st.elements.insert(element)?;
            }
        }

        self.add_element_membership(spec.id);
        for (name, class) in field_changes {
            self.log_field(&name, class);
        }
        if added {
            trace!(id = %spec.id, "merged new element");
            self.log_element(spec.id, ChangeClass::Added);
        } else if mutated {
            self.log_element(spec.id, ChangeClass::ObjectChanged);
        }

        if mode == FaceMode::Define {
            let transient = !self.defining_faces();
            if transient {
                self.begin_define_faces();
            }
            let result = self.define_faces_recursive(&root, spec.id);
            if transient {
                self.end_define_faces();
            }
            result?;
        }
        Ok(())
    }

    /// Defines faces and lines for every top-level element visible in this
    /// region, inside one change bracket and one define-faces bracket.
    pub fn define_faces(&self) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let transient = !self.defining_faces();
        if transient {
            self.begin_define_faces();
        }
        let root = self.ultimate_master();
        let mut ids = Vec::new();
        self.for_each_element(|element| {
            if element.id.kind == ElementKind::Element {
                ids.push(element.id);
            }
        });
        let mut result = Ok(());
        for id in ids {
            if let Err(error) = self.define_faces_recursive(&root, id) {
                result = Err(error);
                break;
            }
        }
        if transient {
            self.end_define_faces();
        }
        self.end_change();
        result
    }

    /// Synthesizes or links the faces of one element, parent before child,
    /// recursing into each face for its own lines.
    fn define_faces_recursive(&self, root: &Region, id: ElementId) -> Result<()> {
        let (shape, nodes, faces) = {
            let st = root.inner.borrow();
            let element = st
                .elements
                .get(id)
                .ok_or(Error::ElementNotFound(id))?;
            (element.shape, element.nodes.clone(), element.faces.clone())
        };
        if shape.dimension() <= 1 {
            return Ok(());
        }
        let Some(face_kind) = shape.face_kind() else {
            return Ok(());
        };

        for index in 0..shape.face_count() {
            if let Some(existing) = faces[index] {
                self.define_faces_recursive(root, existing)?;
                continue;
            }
            // Without full connectivity there is nothing to derive a face
            // from; leave the slot undefined.
            if nodes.len() != shape.node_count() {
                continue;
            }
            let Some(face_shape) = shape.face_shape(index) else {
                continue;
            };
            let Some(indices) = shape.face_nodes(index) else {
                continue;
            };
            let face_nodes: SmallVec<[NodeId; 8]> =
                indices.iter().map(|&i| nodes[i]).collect();
            let mut distinct = face_nodes.clone();
            distinct.sort_unstable();
            distinct.dedup();
            let collapsed = distinct.len() <= face_shape.collapses_at();

            // A non-collapsed face may already exist on a neighbouring
            // element; share it instead of synthesizing a duplicate.
            if !collapsed {
                let key = TopologyKey {
                    kind: face_kind,
                    dimension: face_shape.dimension(),
                    nodes: distinct.clone(),
                };
                let shared = {
                    let st = root.inner.borrow();
                    st.face_index.as_ref().and_then(|ix| ix.find(&key))
                };
                if let Some(shared) = shared {
                    let mut st = root.inner.borrow_mut();
                    if let Some(element) = st.elements.get_mut(id) {
                        element.faces[index] = Some(shared);
                    }
                    continue;
                }
            }

            let face_id = {
                let st = root.inner.borrow();
                st.elements
                    .next_unused_identifier(ElementId::new(face_kind, 1))
            };
            {
                let mut st = root.inner.borrow_mut();
                let mut face = Element::new(face_id, face_shape);
                face.nodes = face_nodes;
                face.collapsed = collapsed;
                if !collapsed {
                    if let (Some(index_map), Some(key)) =
                        (st.face_index.as_mut(), TopologyKey::for_element(&face))
                    {
                        index_map.insert(key, face_id);
                    }
                }
                st.elements.insert(face)?;
                if let Some(element) = st.elements.get_mut(id) {
                    element.faces[index] = Some(face_id);
                }
            }
            trace!(id = %face_id, parent = %id, collapsed, "synthesized face");
            self.add_element_membership(face_id);
            self.log_element(face_id, ChangeClass::Added);
            self.define_faces_recursive(root, face_id)?;
        }
        Ok(())
    }

    /// Removes an element. On a master region this destroys the element
    /// (failing with [`Error::EntityInUse`] while a parent element links
    /// it as a face); on a sub-region it only drops membership.
    pub fn remove_element(&self, id: ElementId) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.remove_element_inner(id);
        self.end_change();
        result
    }

    /// Removes a batch of elements inside one change bracket, continuing
    /// past per-element failures. Returns the residual list.
    pub fn remove_elements(&self, ids: &[ElementId]) -> Result<Vec<(ElementId, Error)>> {
        self.check_mutable()?;
        self.begin_change();
        let mut residual = Vec::new();
        for &id in ids {
            if let Err(error) = self.remove_element_inner(id) {
                residual.push((id, error));
            }
        }
        self.end_change();
        Ok(residual)
    }

    fn remove_element_inner(&self, id: ElementId) -> Result<()> {
        let root = self.ultimate_master();
        if !self.is_same(&root) {
            if !self.contains_element(id) {
                return Err(Error::ElementNotFound(id));
            }
            let contained = self.purge_element_membership(id);
            for region in contained {
                region
                    .inner
                    .borrow_mut()
                    .tracker
                    .elements
                    .log(id, ChangeClass::Removed);
            }
            return Ok(());
        }

        {
            let st = root.inner.borrow();
            if !st.elements.contains(id) {
                return Err(Error::ElementNotFound(id));
            }
            if st.elements.find(|e| e.references_face(id)).is_some() {
                return Err(Error::EntityInUse(id.into()));
            }
        }
        let contained = root.purge_element_membership(id);
        let layouts = root.layouts_rc();
        {
            let mut st = root.inner.borrow_mut();
            if let Some(element) = st.elements.remove(id) {
                if let Some(layout) = element.layout {
                    layouts.borrow_mut().release(layout);
                }
                if let (Some(index), Some(key)) =
                    (st.face_index.as_mut(), TopologyKey::for_element(&element))
                {
                    if index.find(&key) == Some(id) {
                        index.remove(&key);
                    }
                }
            }
        }
        root.inner
            .borrow_mut()
            .tracker
            .elements
            .log(id, ChangeClass::Removed);
        for region in contained {
            region
                .inner
                .borrow_mut()
                .tracker
                .elements
                .log(id, ChangeClass::Removed);
        }
        trace!(id = %id, "removed element");
        Ok(())
    }

    /// Atomically renames an element. Parent elements linking it as a face
    /// are rewritten (and logged as related changes); memberships across
    /// the tree follow the rename.
    pub fn change_element_identifier(&self, old: ElementId, new: ElementId) -> Result<()> {
        self.check_mutable()?;
        self.begin_change();
        let result = self.change_element_identifier_inner(old, new);
        self.end_change();
        result
    }

    fn change_element_identifier_inner(&self, old: ElementId, new: ElementId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        if old.kind != new.kind {
            return Err(Error::InvalidIdentifier(new.into()));
        }
        let root = self.ultimate_master();
        let affected = {
            let mut st = root.inner.borrow_mut();
            st.elements.change_identifier(old, new)?;
            let mut affected = Vec::new();
            for element in st.elements.iter_mut() {
                let mut touched = false;
                for slot in element.faces.iter_mut() {
                    if *slot == Some(old) {
                        *slot = Some(new);
                        touched = true;
                    }
                }
                if touched {
                    affected.push(element.id);
                }
            }
            // The index maps node sets to identifiers; follow the rename.
            let key = st
                .elements
                .get(new)
                .and_then(TopologyKey::for_element);
            if let (Some(index), Some(key)) = (st.face_index.as_mut(), key) {
                if index.find(&key) == Some(old) {
                    index.insert(key, new);
                }
            }
            affected
        };
        for region in root.tree() {
            if region.is_same(&root) {
                continue;
            }
            let mut st = region.inner.borrow_mut();
            if st.element_members.remove(&old) {
                st.element_members.insert(new);
            }
        }
        self.log_element(new, ChangeClass::IdentifierChanged);
        for id in affected {
            self.log_element(id, ChangeClass::RelatedObjectChanged);
        }
        Ok(())
    }
}
