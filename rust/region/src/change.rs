// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Change classification, per-cycle logs and batch bookkeeping.
//!
//! Every mutation records the entities it touched into the region's change
//! logs. Nested `begin_change`/`end_change` brackets batch mutations; when
//! the outermost bracket closes, the logs consolidate into one
//! [`ChangeEvent`] dispatched to listeners, then clear. Each entity
//! appears in an event at most once, under the strongest classification
//! seen during the cycle.

use std::collections::BTreeMap;

use crate::keys::{ElementId, NodeId};

/// How strongly an entity changed within one notification cycle.
///
/// The variants escalate: once an entity is logged at a classification,
/// only a stronger one can replace it. `Removed` is terminal, with one
/// exception: an entity removed and re-added under the same identifier in
/// one cycle nets [`ChangeClass::ObjectChanged`], since listeners observe
/// an entity that existed before and exists after, with different content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ChangeClass {
    /// A related entity changed (an element whose node was renamed).
    RelatedObjectChanged,
    /// The entity was renamed.
    IdentifierChanged,
    /// The entity's content changed.
    ObjectChanged,
    /// The entity was created this cycle.
    Added,
    /// The entity was removed this cycle.
    Removed,
}

/// Per-cycle map from entity identity to its strongest classification.
#[derive(Debug, Clone)]
pub struct ChangeLog<K: Ord> {
    entries: BTreeMap<K, ChangeClass>,
}

impl<K: Ord> Default for ChangeLog<K> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord> ChangeLog<K> {
    /// Records a change, keeping the strongest classification per entity.
    pub fn log(&mut self, key: K, change: ChangeClass) {
        let class = match self.entries.get(&key) {
            Some(ChangeClass::Removed) if change == ChangeClass::Added => {
                ChangeClass::ObjectChanged
            }
            Some(&current) => current.max(change),
            None => change,
        };
        self.entries.insert(key, class);
    }

    /// The classification currently logged for an entity.
    pub fn get(&self, key: &K) -> Option<ChangeClass> {
        self.entries.get(key).copied()
    }

    /// Whether nothing was logged this cycle.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of logged entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drains the log into an identity-ordered list.
    pub fn drain(&mut self) -> Vec<(K, ChangeClass)> {
        std::mem::take(&mut self.entries).into_iter().collect()
    }
}

/// One consolidated notification: everything that changed during a batch.
///
/// Field entries come first so listeners refresh per-field metadata before
/// visiting the nodes and elements that store those fields.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChangeEvent {
    pub fields: Vec<(String, ChangeClass)>,
    pub nodes: Vec<(NodeId, ChangeClass)>,
    pub elements: Vec<(ElementId, ChangeClass)>,
}

impl ChangeEvent {
    /// Whether the event carries no changes at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.nodes.is_empty() && self.elements.is_empty()
    }
}

/// Token returned by listener registration, used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(pub(crate) u64);

/// Per-region batching state: nesting depth, deferred-dispatch flag, the
/// in-dispatch guard, and the three change logs.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    /// Nesting depth of open `begin_change` brackets; always ≥ 0 and
    /// notification fires only on the 1 → 0 transition.
    pub level: u32,
    /// Set when this region's bracket closed while an ancestor's was still
    /// open; the ancestor flushes it on its own close.
    pub pending: bool,
    /// Set while listeners run; mutations observe it and fail.
    pub dispatching: bool,
    pub fields: ChangeLog<String>,
    pub nodes: ChangeLog<NodeId>,
    pub elements: ChangeLog<ElementId>,
}

impl ChangeTracker {
    /// Whether any log has entries this cycle.
    pub fn has_changes(&self) -> bool {
        !self.fields.is_empty() || !self.nodes.is_empty() || !self.elements.is_empty()
    }

    /// Consolidates and clears the logs into a dispatchable event.
    pub fn take_event(&mut self) -> ChangeEvent {
        self.pending = false;
        ChangeEvent {
            fields: self.fields.drain(),
            nodes: self.nodes.drain(),
            elements: self.elements.drain(),
        }
    }

    /// Discards the logs without dispatching (aborted batch).
    pub fn discard(&mut self) {
        let _ = self.take_event();
    }
}
