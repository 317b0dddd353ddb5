// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # FE-Lite Region
//!
//! Hierarchical finite-element region store: the in-memory database that
//! owns fields, nodes and elements, interns their field layouts, batches
//! change notifications, and performs structure-preserving merges.
//!
//! ## Overview
//!
//! - **Field directory**: named, typed fields with compatibility-checked
//!   re-definition.
//! - **Layout registry**: content-addressed, reference-counted interning
//!   of "which fields, stored how" descriptors shared across entities.
//! - **Entity stores**: identifier-ordered node and element collections
//!   with atomic rename.
//! - **Change tracking**: nested begin/end batching with one consolidated
//!   notification per batch, masters before sub-regions.
//! - **Merge engine**: validate-then-commit upserts of standalone specs,
//!   with optional face/line synthesis de-duplicated through a transient
//!   topology index.
//!
//! Numeric evaluation of field values, file formats and rendering live in
//! external collaborators built on this crate's query/mutation API and
//! change notifications.
//!
//! ## Quick Start
//!
//! ```
//! use fe_lite_region::{FieldSpec, FieldValues, NodeSpec, Region, ValueType};
//!
//! let region = Region::new();
//! region
//!     .merge_field(&FieldSpec::new("coordinates", ValueType::Real, 3))
//!     .unwrap();
//!
//! let node = NodeSpec::new(fe_lite_region::NodeId(5)).with_field(
//!     FieldSpec::new("coordinates", ValueType::Real, 3),
//!     FieldValues::Real(vec![1.0, 2.0, 3.0]),
//! );
//! region.merge_node(&node).unwrap();
//! assert_eq!(region.node_count(), 1);
//! ```
//!
//! ## Concurrency
//!
//! Single-threaded and synchronous. Change brackets nest and re-enter
//! freely; mutating a region from inside one of its change listeners does
//! not: it fails with [`Error::ReentrantMutation`].
//!
//! ## Feature Flags
//!
//! - `serde`: serialization support for the spec and identifier types.

pub mod change;
pub mod dedup;
pub mod entity;
pub mod error;
pub mod field;
pub mod keys;
pub mod layout;
pub mod merge;
pub mod region;
pub mod store;

pub use change::{ChangeClass, ChangeEvent, ListenerToken};
pub use dedup::{DuplicateTopologyIndex, TopologyKey};
pub use entity::{
    Element, ElementShape, ElementSpec, FieldValueSpec, FieldValues, Node, NodeSpec, ValueBuffer,
};
pub use error::{Error, Result};
pub use field::{CoordinateSystem, Field, FieldDirectory, FieldSpec, ValueType, ValueValidator};
pub use keys::{ElementId, ElementKind, EntityRef, FieldKey, LayoutKey, NodeId};
pub use layout::{FieldLayout, LayoutEntry, LayoutRegistry, StorageDescriptor};
pub use merge::FaceMode;
pub use region::Region;
pub use store::{EntityStore, Identified, Identifier};
