// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error types for region operations.
//!
//! Every error is local and recoverable: a failed call leaves its target
//! region unmodified, and the caller decides whether to retry, skip or
//! abort. Nothing in this crate panics on bad input.

use crate::keys::{ElementId, EntityRef, NodeId};

/// Result type alias for region operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during region operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An entity with this identifier already exists and blocks the operation.
    #[error("identifier already in use: {0}")]
    IdentityConflict(EntityRef),

    /// Node and element numbers must be positive.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(EntityRef),

    /// An incoming field's storage structure (component or version count)
    /// does not match the structure already stored on the target entity.
    #[error("field structure conflict on field {0}")]
    FieldStructureConflict(String),

    /// A field of this name already exists with a different definition.
    #[error("incompatible redefinition of field {0}")]
    IncompatibleField(String),

    /// The configured value validator rejected the field's default values.
    #[error("rejected default values for field {0}")]
    InvalidFieldValues(String),

    /// The field is referenced by at least one live field layout.
    #[error("field {0} is in use by a stored layout")]
    FieldInUse(String),

    /// The entity is referenced by other entities (a node by an element's
    /// connectivity, a face or line by its parent element).
    #[error("{0} is referenced by other entities")]
    EntityInUse(EntityRef),

    /// An in-place layout extension was attempted on a layout with more
    /// than one referent.
    #[error("layout is shared and cannot be extended in place")]
    SharedLayoutViolation,

    /// Element topology is inconsistent: wrong node count for the shape,
    /// missing referenced nodes, or a shape mismatch at an existing
    /// identifier.
    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    /// A mutation was attempted from inside a change-notification listener.
    #[error("mutation attempted during change notification")]
    ReentrantMutation,

    /// No field of this name is registered in the region.
    #[error("field not found: {0}")]
    FieldNotFound(String),

    /// No node with this identifier exists in the region.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// No element with this identifier exists in the region.
    #[error("element not found: {0}")]
    ElementNotFound(ElementId),
}
