// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The region: hierarchical container of fields, nodes and elements.
//!
//! A master region's stores are the sole owners of their entities. A
//! sub-region delegates storage to its master and holds only membership
//! subsets; identifier uniqueness and the field directory live at the
//! ultimate master. A region may also host one companion *data region*
//! which shares the field directory and layout registry but stores a
//! disjoint set of point entities.
//!
//! All mutation goes through the merge engine (see `merge`); this module
//! provides composition, the change-batching machinery, listeners, and
//! the read-only query surface. Queries are callable at any time,
//! including from inside a change listener; mutations are not.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use tracing::debug;

use crate::change::{ChangeClass, ChangeEvent, ChangeTracker, ListenerToken};
use crate::dedup::DuplicateTopologyIndex;
use crate::entity::{Element, FieldValues, Node};
use crate::error::Result;
use crate::field::{Field, FieldDirectory, ValueValidator};
use crate::keys::{ElementId, LayoutKey, NodeId};
use crate::layout::LayoutRegistry;
use crate::store::EntityStore;

type Listener = Box<dyn FnMut(&ChangeEvent)>;

pub(crate) struct RegionState {
    pub(crate) master: Option<Region>,
    pub(crate) children: Vec<Weak<RefCell<RegionState>>>,
    pub(crate) data_region: Option<Region>,
    pub(crate) data_host: Option<Weak<RefCell<RegionState>>>,
    pub(crate) fields: Rc<RefCell<FieldDirectory>>,
    pub(crate) layouts: Rc<RefCell<LayoutRegistry>>,
    pub(crate) nodes: EntityStore<NodeId, Node>,
    pub(crate) elements: EntityStore<ElementId, Element>,
    pub(crate) node_members: BTreeSet<NodeId>,
    pub(crate) element_members: BTreeSet<ElementId>,
    pub(crate) tracker: ChangeTracker,
    pub(crate) listeners: Vec<(ListenerToken, Listener)>,
    pub(crate) removed_listeners: Vec<ListenerToken>,
    pub(crate) next_listener: u64,
    pub(crate) face_define_level: u32,
    pub(crate) face_index: Option<DuplicateTopologyIndex>,
    pub(crate) validator: Option<ValueValidator>,
}

impl RegionState {
    fn new(fields: Rc<RefCell<FieldDirectory>>, layouts: Rc<RefCell<LayoutRegistry>>) -> Self {
        Self {
            master: None,
            children: Vec::new(),
            data_region: None,
            data_host: None,
            fields,
            layouts,
            nodes: EntityStore::new(),
            elements: EntityStore::new(),
            node_members: BTreeSet::new(),
            element_members: BTreeSet::new(),
            tracker: ChangeTracker::default(),
            listeners: Vec::new(),
            removed_listeners: Vec::new(),
            next_listener: 0,
            face_define_level: 0,
            face_index: None,
            validator: None,
        }
    }
}

/// Handle to a region. Cloning the handle shares the region; regions form
/// a single-threaded tree and are not `Send`.
pub struct Region {
    pub(crate) inner: Rc<RefCell<RegionState>>,
}

impl Clone for Region {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.borrow();
        f.debug_struct("Region")
            .field("master", &st.master.is_some())
            .field("nodes", &st.nodes.len())
            .field("elements", &st.elements.len())
            .finish()
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Composition and hierarchy
// =============================================================================

impl Region {
    /// Creates a standalone master region.
    pub fn new() -> Self {
        let fields = Rc::new(RefCell::new(FieldDirectory::new()));
        let layouts = Rc::new(RefCell::new(LayoutRegistry::new()));
        Self {
            inner: Rc::new(RefCell::new(RegionState::new(fields, layouts))),
        }
    }

    /// Creates a sub-region delegating storage to this region's tree.
    ///
    /// The sub-region starts with an empty membership; merging entities
    /// through it inserts them into the ultimate master and records
    /// membership along the delegation chain.
    pub fn create_subregion(&self) -> Region {
        let (fields, layouts) = {
            let st = self.inner.borrow();
            (Rc::clone(&st.fields), Rc::clone(&st.layouts))
        };
        let mut state = RegionState::new(fields, layouts);
        state.master = Some(self.clone());
        let child = Region {
            inner: Rc::new(RefCell::new(state)),
        };
        self.inner
            .borrow_mut()
            .children
            .push(Rc::downgrade(&child.inner));
        child
    }

    /// The region this one delegates to, if any.
    pub fn master(&self) -> Option<Region> {
        self.inner.borrow().master.clone()
    }

    /// Whether this region owns its stores.
    pub fn is_master(&self) -> bool {
        self.inner.borrow().master.is_none()
    }

    /// Walks the master chain to the region that owns the stores. Returns
    /// `self` for a master region.
    pub fn ultimate_master(&self) -> Region {
        let mut current = self.clone();
        while let Some(master) = current.master() {
            current = master;
        }
        current
    }

    /// Whether two handles refer to the same region.
    pub fn is_same(&self, other: &Region) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Detaches this region from its master, prior to discarding it. The
    /// region keeps its membership sets but no longer resolves entities.
    pub fn detach_master(&self) {
        let master = self.inner.borrow_mut().master.take();
        if let Some(master) = master {
            master
                .inner
                .borrow_mut()
                .children
                .retain(|w| !w.ptr_eq(&Rc::downgrade(&self.inner)));
        }
    }

    /// Returns the companion data region, creating it on first use. The
    /// data region shares this tree's field directory and layout registry
    /// and stores its own disjoint set of point entities.
    pub fn data_region(&self) -> Region {
        let root = self.ultimate_master();
        if let Some(existing) = root.inner.borrow().data_region.clone() {
            return existing;
        }
        let (fields, layouts) = {
            let st = root.inner.borrow();
            (Rc::clone(&st.fields), Rc::clone(&st.layouts))
        };
        let mut state = RegionState::new(fields, layouts);
        state.data_host = Some(Rc::downgrade(&root.inner));
        let data = Region {
            inner: Rc::new(RefCell::new(state)),
        };
        root.inner.borrow_mut().data_region = Some(data.clone());
        data
    }

    /// Locates the companion data region without creating it.
    pub fn find_data_region(&self) -> Option<Region> {
        self.ultimate_master().inner.borrow().data_region.clone()
    }

    /// Whether this region is a companion data region.
    pub fn is_data_region(&self) -> bool {
        self.inner.borrow().data_host.is_some()
    }

    /// Installs the external value validator consulted when field specs
    /// carry default values. Replaces any previous validator.
    pub fn set_value_validator(&self, validator: ValueValidator) {
        self.ultimate_master().inner.borrow_mut().validator = Some(validator);
    }

    /// Shared handle to the tree's field directory.
    pub(crate) fn fields_rc(&self) -> Rc<RefCell<FieldDirectory>> {
        Rc::clone(&self.inner.borrow().fields)
    }

    /// Shared handle to the tree's layout registry.
    pub(crate) fn layouts_rc(&self) -> Rc<RefCell<LayoutRegistry>> {
        Rc::clone(&self.inner.borrow().layouts)
    }

    /// The delegation chain from this region up to and including the
    /// ultimate master.
    pub(crate) fn chain(&self) -> Vec<Region> {
        let mut chain = vec![self.clone()];
        let mut current = self.clone();
        while let Some(master) = current.master() {
            chain.push(master.clone());
            current = master;
        }
        chain
    }

    /// Every region in this tree: the ultimate master plus all live
    /// descendants, parents before children.
    pub(crate) fn tree(&self) -> Vec<Region> {
        let root = self.ultimate_master();
        let mut regions = Vec::new();
        let mut stack = vec![root];
        while let Some(region) = stack.pop() {
            let children: Vec<Region> = region
                .inner
                .borrow()
                .children
                .iter()
                .filter_map(|w| w.upgrade().map(|inner| Region { inner }))
                .collect();
            regions.push(region);
            stack.extend(children);
        }
        regions
    }
}

// =============================================================================
// Change batching and notification
// =============================================================================

impl Region {
    /// Opens a change bracket on this region and every ancestor. Brackets
    /// nest; the consolidated notification fires when the outermost one
    /// closes.
    pub fn begin_change(&self) {
        for region in self.chain() {
            region.inner.borrow_mut().tracker.level += 1;
        }
    }

    /// Closes a change bracket. On the outermost close, each region whose
    /// counter reached zero dispatches its consolidated notification,
    /// masters before sub-regions, so a listener never observes a
    /// half-applied master batch.
    pub fn end_change(&self) {
        for region in self.chain() {
            let mut st = region.inner.borrow_mut();
            debug_assert!(st.tracker.level > 0, "unbalanced end_change");
            st.tracker.level = st.tracker.level.saturating_sub(1);
            if st.tracker.level == 0 && st.tracker.has_changes() {
                st.tracker.pending = true;
            }
        }
        let root = self.ultimate_master();
        Self::flush_tree(&root);
        // One companion hop in each direction; companions run independent
        // cycles and never recurse back.
        let data = root.inner.borrow().data_region.clone();
        if let Some(data) = data {
            Self::flush_tree(&data);
        }
        let host = root
            .inner
            .borrow()
            .data_host
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| Region { inner });
        if let Some(host) = host {
            Self::flush_tree(&host);
        }
    }

    /// Current change-bracket nesting depth of this region.
    pub fn change_level(&self) -> u32 {
        self.inner.borrow().tracker.level
    }

    /// Whether this region's bracket has closed but its notification is
    /// still deferred behind an open ancestor bracket.
    pub fn pending_changes(&self) -> bool {
        self.inner.borrow().tracker.pending
    }

    /// Registers a change listener; the returned token detaches it.
    pub fn add_listener(&self, listener: impl FnMut(&ChangeEvent) + 'static) -> ListenerToken {
        let mut st = self.inner.borrow_mut();
        st.next_listener += 1;
        let token = ListenerToken(st.next_listener);
        st.listeners.push((token, Box::new(listener)));
        token
    }

    /// Detaches a listener. Returns `false` for an unknown token.
    ///
    /// Callable from inside a listener; a listener detached mid-dispatch
    /// still completes the current event but receives no further ones.
    pub fn remove_listener(&self, token: ListenerToken) -> bool {
        let mut st = self.inner.borrow_mut();
        let before = st.listeners.len();
        st.listeners.retain(|(t, _)| *t != token);
        if st.listeners.len() != before {
            return true;
        }
        // Mid-dispatch the registered listeners are checked out of the
        // state; record the removal for the restore step.
        if st.tracker.dispatching {
            st.removed_listeners.push(token);
            return true;
        }
        false
    }

    /// Dispatches every region of a tree whose bracket is closed, root
    /// first. Sub-trees still inside a bracket stay deferred.
    fn flush_tree(root: &Region) {
        if root.inner.borrow().tracker.level > 0 {
            return;
        }
        root.dispatch_if_changed();
        let children: Vec<Region> = root
            .inner
            .borrow()
            .children
            .iter()
            .filter_map(|w| w.upgrade().map(|inner| Region { inner }))
            .collect();
        for child in children {
            Self::flush_tree(&child);
        }
    }

    /// Builds and dispatches this region's consolidated event if anything
    /// was logged. Listeners run with the region readable but not
    /// mutable: mutation attempts observe the dispatch guard and fail.
    fn dispatch_if_changed(&self) {
        let (event, mut listeners) = {
            let mut st = self.inner.borrow_mut();
            if st.tracker.level > 0 || !st.tracker.has_changes() {
                return;
            }
            let event = st.tracker.take_event();
            st.tracker.dispatching = true;
            (event, std::mem::take(&mut st.listeners))
        };
        debug!(
            fields = event.fields.len(),
            nodes = event.nodes.len(),
            elements = event.elements.len(),
            "dispatching consolidated change notification"
        );
        for (_, listener) in listeners.iter_mut() {
            listener(&event);
        }
        let mut st = self.inner.borrow_mut();
        st.tracker.dispatching = false;
        // Listeners registered during dispatch landed in the state; keep
        // them behind the originals. Removals requested during dispatch
        // apply now.
        let added_during = std::mem::take(&mut st.listeners);
        let removed_during = std::mem::take(&mut st.removed_listeners);
        st.listeners = listeners;
        st.listeners.extend(added_during);
        if !removed_during.is_empty() {
            st.listeners.retain(|(t, _)| !removed_during.contains(t));
        }
    }

    /// Fails when any region of the delegation chain is mid-dispatch.
    pub(crate) fn check_mutable(&self) -> Result<()> {
        for region in self.chain() {
            if region.inner.borrow().tracker.dispatching {
                return Err(crate::error::Error::ReentrantMutation);
            }
        }
        Ok(())
    }

    // --- change-log helpers -------------------------------------------------

    /// Logs a field change into every region of the tree plus the
    /// companion: the directory is shared, so all of them observe it.
    pub(crate) fn log_field(&self, name: &str, class: ChangeClass) {
        for region in self.tree() {
            region
                .inner
                .borrow_mut()
                .tracker
                .fields
                .log(name.to_string(), class);
        }
        let root = self.ultimate_master();
        let companion = {
            let st = root.inner.borrow();
            st.data_region
                .clone()
                .or_else(|| st.data_host.as_ref().and_then(Weak::upgrade).map(|inner| Region { inner }))
        };
        if let Some(companion) = companion {
            for region in companion.tree() {
                region
                    .inner
                    .borrow_mut()
                    .tracker
                    .fields
                    .log(name.to_string(), class);
            }
        }
    }

    /// Logs a node change into the ultimate master and every region whose
    /// membership contains the node.
    pub(crate) fn log_node(&self, id: NodeId, class: ChangeClass) {
        let root = self.ultimate_master();
        for region in self.tree() {
            let is_root = region.is_same(&root);
            let mut st = region.inner.borrow_mut();
            if is_root || st.node_members.contains(&id) {
                st.tracker.nodes.log(id, class);
            }
        }
    }

    /// Logs an element change into the ultimate master and every region
    /// whose membership contains the element.
    pub(crate) fn log_element(&self, id: ElementId, class: ChangeClass) {
        let root = self.ultimate_master();
        for region in self.tree() {
            let is_root = region.is_same(&root);
            let mut st = region.inner.borrow_mut();
            if is_root || st.element_members.contains(&id) {
                st.tracker.elements.log(id, class);
            }
        }
    }

    // --- membership helpers -------------------------------------------------

    /// Records membership of a node along the delegation chain (every
    /// region below the ultimate master).
    pub(crate) fn add_node_membership(&self, id: NodeId) {
        let mut current = self.clone();
        while let Some(master) = current.master() {
            current.inner.borrow_mut().node_members.insert(id);
            current = master;
        }
    }

    /// Records membership of an element along the delegation chain.
    pub(crate) fn add_element_membership(&self, id: ElementId) {
        let mut current = self.clone();
        while let Some(master) = current.master() {
            current.inner.borrow_mut().element_members.insert(id);
            current = master;
        }
    }

    /// Drops a node from the membership of this region and every live
    /// descendant, returning the regions that actually contained it.
    pub(crate) fn purge_node_membership(&self, id: NodeId) -> Vec<Region> {
        let mut contained = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(region) = stack.pop() {
            let removed = {
                let mut st = region.inner.borrow_mut();
                st.node_members.remove(&id)
            };
            let children: Vec<Region> = region
                .inner
                .borrow()
                .children
                .iter()
                .filter_map(|w| w.upgrade().map(|inner| Region { inner }))
                .collect();
            stack.extend(children);
            if removed {
                contained.push(region);
            }
        }
        contained
    }

    /// Drops an element from the membership of this region and every live
    /// descendant, returning the regions that actually contained it.
    pub(crate) fn purge_element_membership(&self, id: ElementId) -> Vec<Region> {
        let mut contained = Vec::new();
        let mut stack = vec![self.clone()];
        while let Some(region) = stack.pop() {
            let removed = {
                let mut st = region.inner.borrow_mut();
                st.element_members.remove(&id)
            };
            let children: Vec<Region> = region
                .inner
                .borrow()
                .children
                .iter()
                .filter_map(|w| w.upgrade().map(|inner| Region { inner }))
                .collect();
            stack.extend(children);
            if removed {
                contained.push(region);
            }
        }
        contained
    }
}

// =============================================================================
// Queries
// =============================================================================

impl Region {
    /// Looks up a field by name.
    pub fn field(&self, name: &str) -> Option<Field> {
        let st = self.inner.borrow();
        let dir = st.fields.borrow();
        dir.find_by_name(name).and_then(|k| dir.field(k).cloned())
    }

    /// Number of fields registered in this region's tree.
    pub fn field_count(&self) -> usize {
        self.inner.borrow().fields.borrow().len()
    }

    /// Visits fields in name order.
    pub fn for_each_field(&self, mut f: impl FnMut(&Field)) {
        let st = self.inner.borrow();
        let dir = st.fields.borrow();
        for (_, field) in dir.iter() {
            f(field);
        }
    }

    /// Whether any live layout stores the named field. A field in use
    /// cannot be removed.
    pub fn field_in_use(&self, name: &str) -> bool {
        let st = self.inner.borrow();
        let dir = st.fields.borrow();
        match dir.find_by_name(name) {
            Some(key) => st.layouts.borrow().references_field(key),
            None => false,
        }
    }

    /// The first field (in name order) that can serve as a coordinate
    /// field: real-valued, at most three components, spatial coordinate
    /// system.
    pub fn default_coordinate_field(&self) -> Option<Field> {
        let st = self.inner.borrow();
        let dir = st.fields.borrow();
        let result = dir
            .iter()
            .map(|(_, field)| field)
            .find(|field| {
                field.value_type == crate::field::ValueType::Real
                    && (1..=3).contains(&field.component_count)
                    && field.coordinate_system.is_spatial()
            })
            .cloned();
        result
    }

    /// Whether a node with this identifier is visible in this region.
    pub fn contains_node(&self, id: NodeId) -> bool {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            root.inner.borrow().nodes.contains(id)
        } else {
            self.inner.borrow().node_members.contains(&id)
                && root.inner.borrow().nodes.contains(id)
        }
    }

    /// Number of nodes visible in this region.
    pub fn node_count(&self) -> usize {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            root.inner.borrow().nodes.len()
        } else {
            self.inner.borrow().node_members.len()
        }
    }

    /// Scoped access to a node.
    pub fn with_node<R>(&self, id: NodeId, f: impl FnOnce(&Node) -> R) -> Option<R> {
        if !self.contains_node(id) {
            return None;
        }
        let root = self.ultimate_master();
        let st = root.inner.borrow();
        st.nodes.get(id).map(f)
    }

    /// Visits nodes visible in this region, in identifier order.
    pub fn for_each_node(&self, mut f: impl FnMut(&Node)) {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            let st = root.inner.borrow();
            for node in st.nodes.iter() {
                f(node);
            }
        } else {
            let members = self.inner.borrow().node_members.clone();
            let st = root.inner.borrow();
            for id in members {
                if let Some(node) = st.nodes.get(id) {
                    f(node);
                }
            }
        }
    }

    /// The first visible node (in identifier order) matching a predicate.
    pub fn find_node(&self, mut predicate: impl FnMut(&Node) -> bool) -> Option<NodeId> {
        let mut found = None;
        self.for_each_node(|node| {
            if found.is_none() && predicate(node) {
                found = Some(node.id);
            }
        });
        found
    }

    /// Identifiers of all visible nodes, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids = Vec::with_capacity(self.node_count());
        self.for_each_node(|node| ids.push(node.id));
        ids
    }

    /// The values a node stores for a named field.
    pub fn node_field_values(&self, id: NodeId, field_name: &str) -> Option<FieldValues> {
        let root = self.ultimate_master();
        if !self.contains_node(id) {
            return None;
        }
        let st = root.inner.borrow();
        let dir = st.fields.borrow();
        let key = dir.find_by_name(field_name)?;
        let field = dir.field(key)?;
        let layouts = st.layouts.borrow();
        let node = st.nodes.get(id)?;
        let entry = *layouts.layout(node.layout?)?.entry(key)?;
        let count = (field.component_count * entry.descriptor.versions) as usize;
        Some(
            node.values
                .read(field.value_type, entry.descriptor.offset, count),
        )
    }

    /// Whether an element with this identifier is visible in this region.
    pub fn contains_element(&self, id: ElementId) -> bool {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            root.inner.borrow().elements.contains(id)
        } else {
            self.inner.borrow().element_members.contains(&id)
                && root.inner.borrow().elements.contains(id)
        }
    }

    /// Number of elements visible in this region (all kinds).
    pub fn element_count(&self) -> usize {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            root.inner.borrow().elements.len()
        } else {
            self.inner.borrow().element_members.len()
        }
    }

    /// Scoped access to an element.
    pub fn with_element<R>(&self, id: ElementId, f: impl FnOnce(&Element) -> R) -> Option<R> {
        if !self.contains_element(id) {
            return None;
        }
        let root = self.ultimate_master();
        let st = root.inner.borrow();
        st.elements.get(id).map(f)
    }

    /// Visits elements visible in this region, in identifier order.
    pub fn for_each_element(&self, mut f: impl FnMut(&Element)) {
        let root = self.ultimate_master();
        if self.is_same(&root) {
            let st = root.inner.borrow();
            for element in st.elements.iter() {
                f(element);
            }
        } else {
            let members = self.inner.borrow().element_members.clone();
            let st = root.inner.borrow();
            for id in members {
                if let Some(element) = st.elements.get(id) {
                    f(element);
                }
            }
        }
    }

    /// The first visible element (in identifier order) matching a
    /// predicate.
    pub fn find_element(&self, mut predicate: impl FnMut(&Element) -> bool) -> Option<ElementId> {
        let mut found = None;
        self.for_each_element(|element| {
            if found.is_none() && predicate(element) {
                found = Some(element.id);
            }
        });
        found
    }

    /// The values an element stores for a named field.
    pub fn element_field_values(&self, id: ElementId, field_name: &str) -> Option<FieldValues> {
        let root = self.ultimate_master();
        if !self.contains_element(id) {
            return None;
        }
        let st = root.inner.borrow();
        let dir = st.fields.borrow();
        let key = dir.find_by_name(field_name)?;
        let field = dir.field(key)?;
        let layouts = st.layouts.borrow();
        let element = st.elements.get(id)?;
        let entry = *layouts.layout(element.layout?)?.entry(key)?;
        let count = (field.component_count * entry.descriptor.versions) as usize;
        Some(
            element
                .values
                .read(field.value_type, entry.descriptor.offset, count),
        )
    }

    /// The first unused node identifier at or after `from`.
    pub fn next_unused_node_identifier(&self, from: NodeId) -> NodeId {
        self.ultimate_master()
            .inner
            .borrow()
            .nodes
            .next_unused_identifier(from)
    }

    /// The first unused element identifier at or after `from`, within the
    /// same kind.
    pub fn next_unused_element_identifier(&self, from: ElementId) -> ElementId {
        self.ultimate_master()
            .inner
            .borrow()
            .elements
            .next_unused_identifier(from)
    }

    // --- layout introspection ----------------------------------------------

    /// The layout a node references, for sharing and lifetime assertions.
    pub fn node_layout(&self, id: NodeId) -> Option<LayoutKey> {
        self.with_node(id, |node| node.layout).flatten()
    }

    /// The layout an element references.
    pub fn element_layout(&self, id: ElementId) -> Option<LayoutKey> {
        self.with_element(id, |element| element.layout).flatten()
    }

    /// Current referent count of a layout.
    pub fn layout_refcount(&self, key: LayoutKey) -> usize {
        self.inner.borrow().layouts.borrow().refcount(key)
    }

    /// Number of distinct live layouts in this tree's registry.
    pub fn layout_count(&self) -> usize {
        self.inner.borrow().layouts.borrow().len()
    }
}
