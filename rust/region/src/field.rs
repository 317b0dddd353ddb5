// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fields and the per-region field directory.
//!
//! A field is a named, typed quantity defined over nodes and elements
//! (coordinates, temperature, fibre angles). Its public identity is its
//! name within the ultimate master region; the [`FieldKey`] is the cheap
//! internal handle layouts compare by. The [`FieldDirectory`] registers
//! fields and reconciles repeated definitions of the same name.

use std::collections::BTreeMap;

use slotmap::SlotMap;

use crate::error::{Error, Result};
use crate::keys::FieldKey;

/// The value type of a field's components.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ValueType {
    Real,
    Integer,
    Text,
}

/// The coordinate system a field's values are expressed in.
///
/// The spheroidal variants carry a focus parameter. The focus is the one
/// attribute of a field that may change after creation; everything else is
/// fixed by the first definition.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CoordinateSystem {
    RectangularCartesian,
    CylindricalPolar,
    SphericalPolar,
    ProlateSpheroidal { focus: f64 },
    OblateSpheroidal { focus: f64 },
    Fibre,
    NotApplicable,
}

impl CoordinateSystem {
    /// Two coordinate systems are the same kind when they differ at most in
    /// the focus parameter.
    pub fn same_kind(&self, other: &CoordinateSystem) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }

    /// Whether this system locates points in space, which qualifies a field
    /// as a coordinate field candidate.
    pub fn is_spatial(&self) -> bool {
        !matches!(
            self,
            CoordinateSystem::Fibre | CoordinateSystem::NotApplicable
        )
    }
}

/// A standalone field definition, as importers construct it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FieldSpec {
    pub name: String,
    pub value_type: ValueType,
    pub component_count: u32,
    pub coordinate_system: CoordinateSystem,
    /// Name of the field this field is indexed by, if any.
    pub indexer: Option<String>,
    /// Number of indexed values when an indexer is set.
    pub indexed_value_count: u32,
    /// Optional default component values, vetted by the region's value
    /// validator when one is installed.
    pub default_values: Option<Vec<f64>>,
}

impl FieldSpec {
    /// Creates a field definition with a rectangular cartesian coordinate
    /// system and no indexing.
    pub fn new(name: impl Into<String>, value_type: ValueType, component_count: u32) -> Self {
        Self {
            name: name.into(),
            value_type,
            component_count,
            coordinate_system: CoordinateSystem::RectangularCartesian,
            indexer: None,
            indexed_value_count: 0,
            default_values: None,
        }
    }

    /// Sets the coordinate system.
    pub fn with_coordinate_system(mut self, cs: CoordinateSystem) -> Self {
        self.coordinate_system = cs;
        self
    }

    /// Makes the field indexed by another field.
    pub fn with_indexer(mut self, indexer: impl Into<String>, value_count: u32) -> Self {
        self.indexer = Some(indexer.into());
        self.indexed_value_count = value_count;
        self
    }

    /// Sets default component values.
    pub fn with_default_values(mut self, values: Vec<f64>) -> Self {
        self.default_values = Some(values);
        self
    }
}

/// A field registered in a region.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: String,
    pub value_type: ValueType,
    pub component_count: u32,
    pub coordinate_system: CoordinateSystem,
    pub indexer: Option<FieldKey>,
    pub indexed_value_count: u32,
    pub default_values: Option<Vec<f64>>,
}

/// What a directory merge did with an incoming field definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldChange {
    Created,
    Updated,
    Unchanged,
}

/// Callback seam for the external field-value evaluator. It is consulted
/// only to vet default values at field creation or update; the region never
/// interprets values itself.
pub type ValueValidator = Box<dyn Fn(&FieldSpec) -> bool>;

/// Registry of the fields known to a region, indexed by name.
///
/// The directory is shared between a region and its companion data region,
/// so both see one consistent set of field definitions.
#[derive(Default)]
pub struct FieldDirectory {
    fields: SlotMap<FieldKey, Field>,
    by_name: BTreeMap<String, FieldKey>,
}

impl FieldDirectory {
    /// Creates an empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the key of the field with the given name, if registered.
    pub fn find_by_name(&self, name: &str) -> Option<FieldKey> {
        self.by_name.get(name).copied()
    }

    /// Returns the field for a key.
    pub fn field(&self, key: FieldKey) -> Option<&Field> {
        self.fields.get(key)
    }

    /// Number of registered fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the directory is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterates fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (FieldKey, &Field)> {
        self.by_name.values().map(move |&k| (k, &self.fields[k]))
    }

    /// Checks that a spec could merge against the current directory state
    /// without modifying anything.
    pub fn check_compatible(&self, spec: &FieldSpec) -> Result<()> {
        let indexer = self.resolve_indexer(spec)?;
        if let Some(key) = self.find_by_name(&spec.name) {
            self.compatible(&self.fields[key], spec, indexer)?;
        }
        Ok(())
    }

    /// Merges a field definition: returns the existing field when the spec
    /// is compatible, creating or updating as needed.
    ///
    /// Fails with [`Error::IncompatibleField`] when a field of the same name
    /// exists with a different value type, component count, coordinate
    /// system kind or indexing, and with [`Error::InvalidFieldValues`] when
    /// the validator rejects the spec's default values.
    pub fn merge(
        &mut self,
        spec: &FieldSpec,
        validator: Option<&ValueValidator>,
    ) -> Result<(FieldKey, FieldChange)> {
        let indexer = self.resolve_indexer(spec)?;

        if let Some(key) = self.find_by_name(&spec.name) {
            self.compatible(&self.fields[key], spec, indexer)?;
            let focus_changed = !self.fields[key]
                .coordinate_system
                .eq(&spec.coordinate_system);
            let defaults_changed = spec.default_values.is_some()
                && self.fields[key].default_values != spec.default_values;
            if !focus_changed && !defaults_changed {
                return Ok((key, FieldChange::Unchanged));
            }
            if defaults_changed {
                Self::validate_defaults(spec, validator)?;
            }
            let field = &mut self.fields[key];
            field.coordinate_system = spec.coordinate_system;
            if defaults_changed {
                field.default_values = spec.default_values.clone();
            }
            return Ok((key, FieldChange::Updated));
        }

        Self::validate_defaults(spec, validator)?;
        let field = Field {
            name: spec.name.clone(),
            value_type: spec.value_type,
            component_count: spec.component_count,
            coordinate_system: spec.coordinate_system,
            indexer,
            indexed_value_count: spec.indexed_value_count,
            default_values: spec.default_values.clone(),
        };
        let key = self.fields.insert(field);
        self.by_name.insert(spec.name.clone(), key);
        Ok((key, FieldChange::Created))
    }

    /// Removes a field. The caller is responsible for checking that no live
    /// layout references it.
    pub fn remove(&mut self, key: FieldKey) -> Option<Field> {
        let field = self.fields.remove(key)?;
        self.by_name.remove(&field.name);
        Some(field)
    }

    fn resolve_indexer(&self, spec: &FieldSpec) -> Result<Option<FieldKey>> {
        match &spec.indexer {
            None => Ok(None),
            Some(name) => self
                .find_by_name(name)
                .map(Some)
                .ok_or_else(|| Error::FieldNotFound(name.clone())),
        }
    }

    fn compatible(
        &self,
        existing: &Field,
        spec: &FieldSpec,
        indexer: Option<FieldKey>,
    ) -> Result<()> {
        let ok = existing.value_type == spec.value_type
            && existing.component_count == spec.component_count
            && existing
                .coordinate_system
                .same_kind(&spec.coordinate_system)
            && existing.indexer == indexer
            && (indexer.is_none() || existing.indexed_value_count == spec.indexed_value_count);
        if ok {
            Ok(())
        } else {
            Err(Error::IncompatibleField(spec.name.clone()))
        }
    }

    fn validate_defaults(spec: &FieldSpec, validator: Option<&ValueValidator>) -> Result<()> {
        if spec.default_values.is_some() {
            if let Some(validate) = validator {
                if !validate(spec) {
                    return Err(Error::InvalidFieldValues(spec.name.clone()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for FieldDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldDirectory")
            .field("fields", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coords() -> FieldSpec {
        FieldSpec::new("coordinates", ValueType::Real, 3)
    }

    #[test]
    fn merge_creates_field() {
        let mut dir = FieldDirectory::new();
        let (key, change) = dir.merge(&coords(), None).unwrap();
        assert_eq!(change, FieldChange::Created);
        assert_eq!(dir.len(), 1);

        let field = dir.field(key).unwrap();
        assert_eq!(field.name, "coordinates");
        assert_eq!(field.component_count, 3);
    }

    #[test]
    fn merge_is_idempotent() {
        let mut dir = FieldDirectory::new();
        let (key1, _) = dir.merge(&coords(), None).unwrap();
        let (key2, change) = dir.merge(&coords(), None).unwrap();
        assert_eq!(key1, key2);
        assert_eq!(change, FieldChange::Unchanged);
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn merge_rejects_incompatible_redefinition() {
        let mut dir = FieldDirectory::new();
        dir.merge(&coords(), None).unwrap();

        let other = FieldSpec::new("coordinates", ValueType::Real, 2);
        assert!(matches!(
            dir.merge(&other, None),
            Err(Error::IncompatibleField(_))
        ));
        // Unmodified on failure.
        assert_eq!(dir.field(dir.find_by_name("coordinates").unwrap()).unwrap().component_count, 3);
    }

    #[test]
    fn focus_update_is_the_updated_path() {
        let mut dir = FieldDirectory::new();
        let spec = FieldSpec::new("lambda", ValueType::Real, 1)
            .with_coordinate_system(CoordinateSystem::ProlateSpheroidal { focus: 1.0 });
        dir.merge(&spec, None).unwrap();

        let refocused = FieldSpec::new("lambda", ValueType::Real, 1)
            .with_coordinate_system(CoordinateSystem::ProlateSpheroidal { focus: 35.25 });
        let (key, change) = dir.merge(&refocused, None).unwrap();
        assert_eq!(change, FieldChange::Updated);
        assert_eq!(
            dir.field(key).unwrap().coordinate_system,
            CoordinateSystem::ProlateSpheroidal { focus: 35.25 }
        );

        // A different system kind is still incompatible.
        let cylindrical = FieldSpec::new("lambda", ValueType::Real, 1)
            .with_coordinate_system(CoordinateSystem::CylindricalPolar);
        assert!(dir.merge(&cylindrical, None).is_err());
    }

    #[test]
    fn indexer_must_exist() {
        let mut dir = FieldDirectory::new();
        let spec = FieldSpec::new("pressure", ValueType::Real, 1).with_indexer("grid_point", 8);
        assert!(matches!(
            dir.merge(&spec, None),
            Err(Error::FieldNotFound(_))
        ));

        dir.merge(&FieldSpec::new("grid_point", ValueType::Integer, 1), None)
            .unwrap();
        let (key, _) = dir.merge(&spec, None).unwrap();
        assert!(dir.field(key).unwrap().indexer.is_some());
        assert_eq!(dir.field(key).unwrap().indexed_value_count, 8);
    }

    #[test]
    fn validator_vets_default_values() {
        let mut dir = FieldDirectory::new();
        let validator: ValueValidator =
            Box::new(|spec| spec.default_values.as_ref().is_some_and(|v| v.len() == spec.component_count as usize));

        let bad = coords().with_default_values(vec![0.0; 2]);
        assert!(matches!(
            dir.merge(&bad, Some(&validator)),
            Err(Error::InvalidFieldValues(_))
        ));
        assert!(dir.is_empty());

        let good = coords().with_default_values(vec![0.0; 3]);
        let (_, change) = dir.merge(&good, Some(&validator)).unwrap();
        assert_eq!(change, FieldChange::Created);
    }

    #[test]
    fn iteration_is_name_ordered() {
        let mut dir = FieldDirectory::new();
        dir.merge(&FieldSpec::new("temperature", ValueType::Real, 1), None)
            .unwrap();
        dir.merge(&coords(), None).unwrap();
        dir.merge(&FieldSpec::new("fibres", ValueType::Real, 3), None)
            .unwrap();

        let names: Vec<_> = dir.iter().map(|(_, f)| f.name.as_str()).collect();
        assert_eq!(names, ["coordinates", "fibres", "temperature"]);
    }

    #[test]
    fn remove_unregisters_name() {
        let mut dir = FieldDirectory::new();
        let (key, _) = dir.merge(&coords(), None).unwrap();
        assert!(dir.remove(key).is_some());
        assert!(dir.find_by_name("coordinates").is_none());
        assert!(dir.is_empty());
    }
}
