// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interned, reference-counted field layouts.
//!
//! Most nodes in a mesh define the same fields the same way, so the
//! description of "which fields, stored how" is hoisted out of the entity
//! and interned once in the [`LayoutRegistry`]. An entity holds a
//! non-owning [`LayoutKey`]; the registry tracks how many entities
//! reference each layout and destroys a layout when the count reaches
//! zero. Distinct layouts are typically far fewer than entities, so the
//! O(k) structural lookup (k = fields per layout) is dominated by the
//! sharing benefit.
//!
//! An interned layout's structure never changes in place. The only
//! in-place path is [`LayoutRegistry::extend_exclusive`], valid for a sole
//! owner; every other structural change goes copy-on-write through
//! [`LayoutRegistry::extend`].

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashMap, FxHasher};
use slotmap::SlotMap;
use smallvec::SmallVec;
use tracing::trace;

use crate::error::{Error, Result};
use crate::field::ValueType;
use crate::keys::{FieldKey, LayoutKey};

/// How one field's values are stored on an entity: where they start in the
/// entity's typed value buffer, and how many versions each component has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StorageDescriptor {
    /// Start index in the value vector selected by the field's value type.
    pub offset: usize,
    /// Versions per component (a node on a mesh seam may carry one value
    /// per adjoining element).
    pub versions: u32,
}

/// One (field, storage descriptor) pair in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub field: FieldKey,
    pub descriptor: StorageDescriptor,
}

/// Per-value-type buffer sizes an entity needs to satisfy a layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueTotals {
    pub reals: usize,
    pub integers: usize,
    pub texts: usize,
}

impl ValueTotals {
    /// Reserves room for `count` values of the given type and returns the
    /// offset at which they start.
    pub fn allocate(&mut self, value_type: ValueType, count: usize) -> usize {
        let slot = match value_type {
            ValueType::Real => &mut self.reals,
            ValueType::Integer => &mut self.integers,
            ValueType::Text => &mut self.texts,
        };
        let offset = *slot;
        *slot += count;
        offset
    }
}

/// An immutable, interned list of (field, storage descriptor) pairs, plus
/// the buffer totals entities shape their value storage from.
#[derive(Debug, Clone, Default)]
pub struct FieldLayout {
    entries: SmallVec<[LayoutEntry; 4]>,
    totals: ValueTotals,
}

impl FieldLayout {
    /// Builds a layout from its entries and precomputed totals.
    pub fn new(entries: SmallVec<[LayoutEntry; 4]>, totals: ValueTotals) -> Self {
        Self { entries, totals }
    }

    /// The layout's entries in storage order.
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    /// Returns the entry for a field, if the layout stores it.
    pub fn entry(&self, field: FieldKey) -> Option<&LayoutEntry> {
        self.entries.iter().find(|e| e.field == field)
    }

    /// Whether the layout stores the given field.
    pub fn contains_field(&self, field: FieldKey) -> bool {
        self.entry(field).is_some()
    }

    /// The per-type buffer sizes this layout describes.
    pub fn totals(&self) -> ValueTotals {
        self.totals
    }

    fn structural_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.entries.hash(&mut hasher);
        hasher.finish()
    }
}

// Structural identity is the ordered entry list; totals are derived data.
impl PartialEq for FieldLayout {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}
impl Eq for FieldLayout {}

struct LayoutSlot {
    layout: FieldLayout,
    refcount: usize,
}

/// Content-addressed, reference-counted interning pool for field layouts.
///
/// The registry is shared between a region and its companion data region,
/// so "is this field referenced by any live layout?" is a single scan.
#[derive(Default)]
pub struct LayoutRegistry {
    slots: SlotMap<LayoutKey, LayoutSlot>,
    /// Structural-hash buckets; collisions resolved by ordered comparison.
    index: FxHashMap<u64, SmallVec<[LayoutKey; 2]>>,
}

impl LayoutRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct live layouts.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the registry holds no layouts.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns the layout for a key.
    pub fn layout(&self, key: LayoutKey) -> Option<&FieldLayout> {
        self.slots.get(key).map(|s| &s.layout)
    }

    /// Current referent count of a layout, or zero for a stale key.
    pub fn refcount(&self, key: LayoutKey) -> usize {
        self.slots.get(key).map_or(0, |s| s.refcount)
    }

    /// Interns a layout: returns the existing structurally-equal layout
    /// with its refcount incremented, or registers a new one at refcount 1.
    pub fn find_or_create(&mut self, layout: FieldLayout) -> LayoutKey {
        let hash = layout.structural_hash();
        if let Some(bucket) = self.index.get(&hash) {
            for &key in bucket {
                if self.slots[key].layout == layout {
                    self.slots[key].refcount += 1;
                    return key;
                }
            }
        }
        let fields = layout.entries.len();
        let key = self.slots.insert(LayoutSlot { layout, refcount: 1 });
        self.index.entry(hash).or_default().push(key);
        trace!(?key, fields, "interned new field layout");
        key
    }

    /// Adds one reference to an existing layout.
    pub fn acquire(&mut self, key: LayoutKey) {
        if let Some(slot) = self.slots.get_mut(key) {
            slot.refcount += 1;
        }
    }

    /// Drops one reference; destroys and unregisters the layout when the
    /// count reaches zero. Returns `true` if the layout was destroyed.
    pub fn release(&mut self, key: LayoutKey) -> bool {
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        slot.refcount -= 1;
        if slot.refcount > 0 {
            return false;
        }
        let layout = self.slots.remove(key).map(|s| s.layout);
        if let Some(layout) = layout {
            self.unindex(key, layout.structural_hash());
        }
        trace!(?key, "destroyed unreferenced field layout");
        true
    }

    /// Extends a sole-owned layout in place with one more entry.
    ///
    /// Fails with [`Error::SharedLayoutViolation`] when the layout has more
    /// than one referent. When the extended structure collides with another
    /// interned layout, the two coalesce: this layout is destroyed, the
    /// survivor gains the reference, and the survivor's key is returned.
    pub fn extend_exclusive(
        &mut self,
        key: LayoutKey,
        entry: LayoutEntry,
        value_type: ValueType,
        value_count: usize,
    ) -> Result<LayoutKey> {
        let slot = self
            .slots
            .get(key)
            .ok_or(Error::SharedLayoutViolation)?;
        if slot.refcount != 1 {
            return Err(Error::SharedLayoutViolation);
        }

        let mut extended = slot.layout.clone();
        extended.entries.push(entry);
        extended.totals.allocate(value_type, value_count);
        Ok(self.rehome(key, extended))
    }

    /// Extends the layout an entity references by additional entries,
    /// choosing in-place extension when the entity is the sole owner and
    /// copy-on-write otherwise. The entity's old reference is consumed;
    /// the returned key carries the entity's reference to the new layout.
    pub fn extend(
        &mut self,
        key: LayoutKey,
        additions: &[(LayoutEntry, ValueType, usize)],
    ) -> Result<LayoutKey> {
        if additions.is_empty() {
            return Ok(key);
        }
        let sole = self.refcount(key) == 1;
        let mut extended = self
            .slots
            .get(key)
            .map(|s| s.layout.clone())
            .unwrap_or_default();
        for &(entry, value_type, count) in additions {
            extended.entries.push(entry);
            extended.totals.allocate(value_type, count);
        }
        if sole {
            Ok(self.rehome(key, extended))
        } else {
            let new_key = self.find_or_create(extended);
            self.release(key);
            Ok(new_key)
        }
    }

    /// Replaces a sole-owned layout's structure, keeping the intern index
    /// consistent. When the new structure collides with another interned
    /// layout the two coalesce: this slot is destroyed, the survivor gains
    /// the reference, and the survivor's key is returned.
    fn rehome(&mut self, key: LayoutKey, extended: FieldLayout) -> LayoutKey {
        let new_hash = extended.structural_hash();
        let survivor = self.index.get(&new_hash).and_then(|bucket| {
            bucket
                .iter()
                .copied()
                .find(|&other| other != key && self.slots[other].layout == extended)
        });
        let old_hash = self.slots[key].layout.structural_hash();
        match survivor {
            Some(other) => {
                self.slots[other].refcount += 1;
                self.slots.remove(key);
                self.unindex(key, old_hash);
                other
            }
            None => {
                self.unindex(key, old_hash);
                self.slots[key].layout = extended;
                self.index.entry(new_hash).or_default().push(key);
                key
            }
        }
    }

    /// Whether any live layout references the given field.
    pub fn references_field(&self, field: FieldKey) -> bool {
        self.slots.values().any(|s| s.layout.contains_field(field))
    }

    fn unindex(&mut self, key: LayoutKey, hash: u64) {
        if let Some(bucket) = self.index.get_mut(&hash) {
            bucket.retain(|k| *k != key);
            if bucket.is_empty() {
                self.index.remove(&hash);
            }
        }
    }
}

impl std::fmt::Debug for LayoutRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayoutRegistry")
            .field("layouts", &self.slots.len())
            .finish()
    }
}
