// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end scenarios for field, node and change-tracking behavior.

use std::cell::RefCell;
use std::rc::Rc;

use fe_lite_region::{
    ChangeClass, ChangeEvent, Error, FieldSpec, FieldValues, NodeSpec, Region, ValueType,
};

fn coordinates() -> FieldSpec {
    FieldSpec::new("coordinates", ValueType::Real, 3)
}

fn coordinate_node(id: i32, values: [f64; 3]) -> NodeSpec {
    NodeSpec::new(fe_lite_region::NodeId(id))
        .with_field(coordinates(), FieldValues::Real(values.to_vec()))
}

/// Captures every dispatched event for later inspection.
fn record_events(region: &Region) -> Rc<RefCell<Vec<ChangeEvent>>> {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    region.add_listener(move |event| sink.borrow_mut().push(event.clone()));
    events
}

#[test]
fn merge_field_into_empty_directory() {
    let region = Region::new();
    let field = region.merge_field(&coordinates()).unwrap();

    assert_eq!(region.field_count(), 1);
    assert_eq!(field.name, "coordinates");
    assert_eq!(field.component_count, 3);
    assert_eq!(field.value_type, ValueType::Real);
}

#[test]
fn repeated_field_merge_is_idempotent() {
    let region = Region::new();
    let events = record_events(&region);

    region.merge_field(&coordinates()).unwrap();
    region.merge_field(&coordinates()).unwrap();
    region.merge_field(&coordinates()).unwrap();

    assert_eq!(region.field_count(), 1);
    // Only the creation notified; identical re-merges dispatch nothing.
    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].fields,
        vec![("coordinates".to_string(), ChangeClass::Added)]
    );
}

#[test]
fn merge_node_into_empty_region() {
    let region = Region::new();
    let events = record_events(&region);

    region.merge_node(&coordinate_node(5, [1.0, 2.0, 3.0])).unwrap();

    assert_eq!(region.node_count(), 1);
    assert!(region.contains_node(fe_lite_region::NodeId(5)));
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(5), "coordinates"),
        Some(FieldValues::Real(vec![1.0, 2.0, 3.0]))
    );

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].nodes,
        vec![(fe_lite_region::NodeId(5), ChangeClass::Added)]
    );
    // The coordinates field was created by the same merge.
    assert_eq!(
        events[0].fields,
        vec![("coordinates".to_string(), ChangeClass::Added)]
    );
}

#[test]
fn re_merge_overwrites_values() {
    let region = Region::new();
    region.merge_node(&coordinate_node(5, [1.0, 2.0, 3.0])).unwrap();

    let events = record_events(&region);
    region.merge_node(&coordinate_node(5, [4.0, 5.0, 6.0])).unwrap();

    assert_eq!(region.node_count(), 1);
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(5), "coordinates"),
        Some(FieldValues::Real(vec![4.0, 5.0, 6.0]))
    );

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].nodes,
        vec![(fe_lite_region::NodeId(5), ChangeClass::ObjectChanged)]
    );
}

#[test]
fn identical_re_merge_changes_nothing() {
    let region = Region::new();
    let events = record_events(&region);

    region.merge_node(&coordinate_node(5, [1.0, 2.0, 3.0])).unwrap();
    region.merge_node(&coordinate_node(5, [1.0, 2.0, 3.0])).unwrap();

    assert_eq!(region.node_count(), 1);
    // One event for the add; the identical re-merge dispatches nothing.
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn bracketed_merges_notify_once() {
    let region = Region::new();
    let events = record_events(&region);

    region.begin_change();
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    region.merge_node(&coordinate_node(2, [1.0, 0.0, 0.0])).unwrap();
    assert!(events.borrow().is_empty());
    region.end_change();

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    let nodes: Vec<i32> = events[0].nodes.iter().map(|(id, _)| id.0).collect();
    assert_eq!(nodes, [1, 2]);
}

#[test]
fn nested_brackets_notify_exactly_once_at_depth_zero() {
    let region = Region::new();
    let events = record_events(&region);

    for _ in 0..4 {
        region.begin_change();
    }
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    for _ in 0..3 {
        region.end_change();
        assert!(events.borrow().is_empty());
    }
    region.end_change();
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn identical_field_sets_share_one_layout() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    region.merge_node(&coordinate_node(2, [1.0, 0.0, 0.0])).unwrap();

    let a = region.node_layout(fe_lite_region::NodeId(1)).unwrap();
    let b = region.node_layout(fe_lite_region::NodeId(2)).unwrap();
    assert_eq!(a, b);
    assert_eq!(region.layout_refcount(a), 2);
    assert_eq!(region.layout_count(), 1);

    // A third node with a different field set gets its own layout.
    let spec = NodeSpec::new(fe_lite_region::NodeId(3)).with_field(
        FieldSpec::new("temperature", ValueType::Real, 1),
        FieldValues::Real(vec![36.6]),
    );
    region.merge_node(&spec).unwrap();
    let c = region.node_layout(fe_lite_region::NodeId(3)).unwrap();
    assert_ne!(a, c);
    assert_eq!(region.layout_refcount(c), 1);
    assert_eq!(region.layout_count(), 2);
}

#[test]
fn refcount_follows_referent_count() {
    let region = Region::new();
    for id in 1..=4 {
        region
            .merge_node(&coordinate_node(id, [id as f64, 0.0, 0.0]))
            .unwrap();
    }
    let layout = region.node_layout(fe_lite_region::NodeId(1)).unwrap();
    assert_eq!(region.layout_refcount(layout), 4);

    region.remove_node(fe_lite_region::NodeId(3)).unwrap();
    assert_eq!(region.layout_refcount(layout), 3);

    for id in [1, 2, 4] {
        region.remove_node(fe_lite_region::NodeId(id)).unwrap();
    }
    // Last referent gone: the layout is destroyed.
    assert_eq!(region.layout_refcount(layout), 0);
    assert_eq!(region.layout_count(), 0);
}

#[test]
fn field_removal_blocked_while_layouts_reference_it() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();

    assert!(region.field_in_use("coordinates"));
    assert!(matches!(
        region.remove_field("coordinates"),
        Err(Error::FieldInUse(_))
    ));

    region.remove_node(fe_lite_region::NodeId(1)).unwrap();
    assert!(!region.field_in_use("coordinates"));
    region.remove_field("coordinates").unwrap();
    assert_eq!(region.field_count(), 0);
}

#[test]
fn growing_a_node_extends_its_layout() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    region.merge_node(&coordinate_node(2, [1.0, 0.0, 0.0])).unwrap();
    let shared = region.node_layout(fe_lite_region::NodeId(1)).unwrap();
    assert_eq!(region.layout_refcount(shared), 2);

    // Adding a field to node 1 moves it to an extended layout; node 2
    // keeps the original.
    let spec = NodeSpec::new(fe_lite_region::NodeId(1)).with_field(
        FieldSpec::new("temperature", ValueType::Real, 1),
        FieldValues::Real(vec![21.5]),
    );
    region.merge_node(&spec).unwrap();

    let grown = region.node_layout(fe_lite_region::NodeId(1)).unwrap();
    assert_ne!(grown, shared);
    assert_eq!(region.layout_refcount(shared), 1);
    assert_eq!(region.layout_refcount(grown), 1);

    // Old values survive the layout change.
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(1), "coordinates"),
        Some(FieldValues::Real(vec![0.0, 0.0, 0.0]))
    );
    match region.node_field_values(fe_lite_region::NodeId(1), "temperature") {
        Some(FieldValues::Real(values)) => {
            approx::assert_relative_eq!(values[0], 21.5);
        }
        other => panic!("expected real temperature values, got {other:?}"),
    }
}

#[test]
fn field_structure_conflict_leaves_node_untouched() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [1.0, 2.0, 3.0])).unwrap();

    // Same field, two versions per component: structure mismatch.
    let conflicting = NodeSpec::new(fe_lite_region::NodeId(1)).with_field_versions(
        coordinates(),
        2,
        FieldValues::Real(vec![9.0; 6]),
    );
    let events = record_events(&region);
    assert!(matches!(
        region.merge_node(&conflicting),
        Err(Error::FieldStructureConflict(_))
    ));

    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(1), "coordinates"),
        Some(FieldValues::Real(vec![1.0, 2.0, 3.0]))
    );
    assert!(events.borrow().is_empty());
}

#[test]
fn batch_merge_reports_only_the_poisoned_spec() {
    let region = Region::new();
    region.merge_node(&coordinate_node(7, [0.0, 0.0, 0.0])).unwrap();

    let specs = vec![
        coordinate_node(1, [0.0, 0.0, 0.0]),
        // Poisoned: redefines coordinates with a conflicting version count.
        NodeSpec::new(fe_lite_region::NodeId(7)).with_field_versions(
            coordinates(),
            3,
            FieldValues::Real(vec![0.0; 9]),
        ),
        coordinate_node(2, [1.0, 0.0, 0.0]),
    ];
    let events = record_events(&region);
    let residual = region.merge_nodes(&specs).unwrap();

    assert_eq!(residual.len(), 1);
    assert_eq!(residual[0].0, fe_lite_region::NodeId(7));
    assert!(matches!(residual[0].1, Error::FieldStructureConflict(_)));
    assert_eq!(region.node_count(), 3);
    // Still exactly one consolidated notification for the batch.
    assert_eq!(events.borrow().len(), 1);
}

#[test]
fn reentrant_mutation_from_a_listener_fails() {
    let region = Region::new();
    let observed = Rc::new(RefCell::new(None));

    let handle = region.clone();
    let sink = Rc::clone(&observed);
    region.add_listener(move |_| {
        let result = handle.merge_node(&coordinate_node(99, [0.0, 0.0, 0.0]));
        *sink.borrow_mut() = Some(result);
    });

    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();

    match observed.borrow_mut().take() {
        Some(Err(Error::ReentrantMutation)) => {}
        other => panic!("expected ReentrantMutation, got {other:?}"),
    }
    // The reentrant merge must not have landed.
    assert!(!region.contains_node(fe_lite_region::NodeId(99)));
}

#[test]
fn queries_from_a_listener_are_allowed() {
    let region = Region::new();
    let counted = Rc::new(RefCell::new(0usize));

    let handle = region.clone();
    let sink = Rc::clone(&counted);
    region.add_listener(move |_| {
        *sink.borrow_mut() = handle.node_count();
    });

    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    assert_eq!(*counted.borrow(), 1);
}

#[test]
fn listener_can_detach_itself_mid_dispatch() {
    let region = Region::new();
    let fired = Rc::new(RefCell::new(0usize));

    let handle = region.clone();
    let token = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&fired);
    let slot = Rc::clone(&token);
    let registered = region.add_listener(move |_| {
        *sink.borrow_mut() += 1;
        if let Some(token) = slot.borrow_mut().take() {
            assert!(handle.remove_listener(token));
        }
    });
    *token.borrow_mut() = Some(registered);

    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    region.merge_node(&coordinate_node(2, [1.0, 0.0, 0.0])).unwrap();

    // The listener saw the first event, detached, and missed the second.
    assert_eq!(*fired.borrow(), 1);
}

#[test]
fn subregion_notification_defers_until_master_closes() {
    let root = Region::new();
    let child = root.create_subregion();

    let order = Rc::new(RefCell::new(Vec::new()));
    let root_sink = Rc::clone(&order);
    root.add_listener(move |_| root_sink.borrow_mut().push("master"));
    let child_sink = Rc::clone(&order);
    child.add_listener(move |_| child_sink.borrow_mut().push("child"));

    root.begin_change();
    child.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    // The child's own bracket closed, but the master batch is still open.
    assert!(order.borrow().is_empty());
    assert!(child.pending_changes());
    root.end_change();
    assert!(!child.pending_changes());

    assert_eq!(&order.borrow()[..], &["master", "child"]);
}

#[test]
fn subregion_merge_inserts_into_the_master_store() {
    let root = Region::new();
    let child = root.create_subregion();

    child.merge_node(&coordinate_node(5, [1.0, 1.0, 1.0])).unwrap();

    assert!(root.contains_node(fe_lite_region::NodeId(5)));
    assert!(child.contains_node(fe_lite_region::NodeId(5)));
    assert_eq!(root.node_count(), 1);
    assert_eq!(child.node_count(), 1);

    // A sibling sub-region does not see the node.
    let sibling = root.create_subregion();
    assert!(!sibling.contains_node(fe_lite_region::NodeId(5)));
    assert_eq!(sibling.node_count(), 0);
}

#[test]
fn subregion_removal_keeps_the_master_entity() {
    let root = Region::new();
    let child = root.create_subregion();
    child.merge_node(&coordinate_node(5, [1.0, 1.0, 1.0])).unwrap();

    child.remove_node(fe_lite_region::NodeId(5)).unwrap();
    assert!(!child.contains_node(fe_lite_region::NodeId(5)));
    assert!(root.contains_node(fe_lite_region::NodeId(5)));

    // Removing through the master destroys the node everywhere.
    root.remove_node(fe_lite_region::NodeId(5)).unwrap();
    assert!(!root.contains_node(fe_lite_region::NodeId(5)));
}

#[test]
fn identifier_conflicts_are_rejected_atomically() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [1.0, 0.0, 0.0])).unwrap();
    region.merge_node(&coordinate_node(2, [2.0, 0.0, 0.0])).unwrap();

    assert!(matches!(
        region.change_node_identifier(fe_lite_region::NodeId(1), fe_lite_region::NodeId(2)),
        Err(Error::IdentityConflict(_))
    ));
    // Both nodes untouched.
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(1), "coordinates"),
        Some(FieldValues::Real(vec![1.0, 0.0, 0.0]))
    );
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(2), "coordinates"),
        Some(FieldValues::Real(vec![2.0, 0.0, 0.0]))
    );

    region
        .change_node_identifier(fe_lite_region::NodeId(1), fe_lite_region::NodeId(10))
        .unwrap();
    assert!(region.contains_node(fe_lite_region::NodeId(10)));
    assert!(!region.contains_node(fe_lite_region::NodeId(1)));
}

#[test]
fn remove_then_re_add_in_one_bracket_nets_object_changed() {
    let region = Region::new();
    region.merge_node(&coordinate_node(5, [1.0, 2.0, 3.0])).unwrap();

    let events = record_events(&region);
    region.begin_change();
    region.remove_node(fe_lite_region::NodeId(5)).unwrap();
    region.merge_node(&coordinate_node(5, [9.0, 9.0, 9.0])).unwrap();
    region.end_change();

    let events = events.borrow();
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].nodes,
        vec![(fe_lite_region::NodeId(5), ChangeClass::ObjectChanged)]
    );
}

#[test]
fn data_region_holds_disjoint_points_with_shared_fields() {
    let region = Region::new();
    let data = region.data_region();

    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();
    data.merge_node(&coordinate_node(1, [5.0, 5.0, 5.0])).unwrap();

    // Same identifier, two disjoint stores.
    assert_eq!(
        region.node_field_values(fe_lite_region::NodeId(1), "coordinates"),
        Some(FieldValues::Real(vec![0.0, 0.0, 0.0]))
    );
    assert_eq!(
        data.node_field_values(fe_lite_region::NodeId(1), "coordinates"),
        Some(FieldValues::Real(vec![5.0, 5.0, 5.0]))
    );

    // One shared field directory.
    assert_eq!(region.field_count(), 1);
    assert_eq!(data.field_count(), 1);

    // The shared layout registry counts referents from both stores.
    let layout = region.node_layout(fe_lite_region::NodeId(1)).unwrap();
    assert_eq!(region.layout_refcount(layout), 2);
}

#[test]
fn installed_validator_vets_default_values() {
    let region = Region::new();
    region.set_value_validator(Box::new(|spec| {
        spec.default_values
            .as_ref()
            .map_or(true, |v| v.len() == spec.component_count as usize)
    }));

    let bad = coordinates().with_default_values(vec![0.0; 2]);
    assert!(matches!(
        region.merge_field(&bad),
        Err(Error::InvalidFieldValues(_))
    ));
    assert_eq!(region.field_count(), 0);

    let good = coordinates().with_default_values(vec![0.0; 3]);
    let field = region.merge_field(&good).unwrap();
    assert_eq!(field.default_values, Some(vec![0.0; 3]));
}

#[test]
fn default_coordinate_field_prefers_spatial_real_fields() {
    let region = Region::new();
    region
        .merge_field(&FieldSpec::new("angle", ValueType::Real, 3).with_coordinate_system(
            fe_lite_region::CoordinateSystem::Fibre,
        ))
        .unwrap();
    assert!(region.default_coordinate_field().is_none());

    region.merge_field(&coordinates()).unwrap();
    let field = region.default_coordinate_field().unwrap();
    assert_eq!(field.name, "coordinates");
}

#[test]
fn batch_remove_reports_residual() {
    let region = Region::new();
    region.merge_node(&coordinate_node(1, [0.0, 0.0, 0.0])).unwrap();

    let residual = region
        .remove_nodes(&[fe_lite_region::NodeId(1), fe_lite_region::NodeId(2)])
        .unwrap();
    assert_eq!(residual.len(), 1);
    assert_eq!(residual[0].0, fe_lite_region::NodeId(2));
    assert!(matches!(residual[0].1, Error::NodeNotFound(_)));
    assert_eq!(region.node_count(), 0);
}

#[test]
fn predicate_queries_scan_in_identifier_order() {
    let region = Region::new();
    for (id, x) in [(4, 4.0), (1, 1.0), (9, 9.0)] {
        region.merge_node(&coordinate_node(id, [x, 0.0, 0.0])).unwrap();
    }

    assert_eq!(
        region.node_ids(),
        vec![
            fe_lite_region::NodeId(1),
            fe_lite_region::NodeId(4),
            fe_lite_region::NodeId(9)
        ]
    );

    // First match in identifier order, not insertion order.
    let found = region.find_node(|node| node.values.reals.first().is_some_and(|&x| x > 2.0));
    assert_eq!(found, Some(fe_lite_region::NodeId(4)));

    let mut names = Vec::new();
    region.for_each_field(|field| names.push(field.name.clone()));
    assert_eq!(names, ["coordinates"]);
}

#[test]
fn next_unused_identifiers_skip_occupied_numbers() {
    let region = Region::new();
    for id in [1, 2, 4] {
        region
            .merge_node(&coordinate_node(id, [0.0, 0.0, 0.0]))
            .unwrap();
    }
    assert_eq!(
        region.next_unused_node_identifier(fe_lite_region::NodeId(1)),
        fe_lite_region::NodeId(3)
    );
}
