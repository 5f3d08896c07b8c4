// SPDX-License-Identifier: Apache-2.0
//! Provisioning during PLANNING: policies, offers, and gated choices.

mod common;

use std::collections::BTreeMap;

use common::{choice, driver_at, node};
use loom_core::{
    make_uid, Edge, Entity, Graph, Op, ProvisioningPolicy, Requirement, TemplateData, Uid, Value,
    NODE_FQN,
};

fn attrs(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), v.clone()))
        .collect()
}

/// World: cursor `hub` with a choice into `vault`; `vault` carries one
/// dependency built from `requirement`.
fn gated_world(requirement: Requirement) -> (Graph, Uid) {
    let mut g = Graph::new();
    let hub = node("hub");
    let vault = node("vault");
    let (uh, uv) = (hub.uid(), vault.uid());
    g.insert_node(hub).expect("hub");
    g.insert_node(vault).expect("vault");
    g.insert_edge(choice("enter-vault", uh, uv)).expect("choice");
    g.insert_edge(Edge::dependency(
        Entity::labeled(make_uid("dep"), "prize"),
        uv,
        requirement,
    ))
    .expect("dependency");
    (g, uv)
}

#[test]
fn create_policy_materializes_the_provider_and_unlocks_the_choice() {
    let requirement = Requirement::new(make_uid("req-prize"), ProvisioningPolicy::Create)
        .with_template(TemplateData {
            cls: NODE_FQN.to_owned(),
            attributes: attrs(&[
                ("label", Value::from("prize-node")),
                ("worth", Value::Int(10)),
            ]),
        });
    let (g, _) = gated_world(requirement);
    let mut driver = driver_at(g, "hub");

    // Before planning runs, the hard requirement gates the choice.
    assert!(driver.get_choices().expect("choices").is_empty());

    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());

    // The committed patch carries the CREATE_NODE.
    let patch = &driver.log().patches()[0];
    assert!(patch.effects.iter().any(|e| e.op() == Op::CreateNode));

    // The provider exists with the template attributes applied.
    let provider = driver
        .graph()
        .nodes()
        .find(|n| n.entity.label.as_deref() == Some("prize-node"))
        .expect("provider");
    assert_eq!(provider.locals.get("worth"), Some(&Value::Int(10)));

    // The dependency is satisfied and the choice is enabled.
    let dep = driver.graph().edge(&make_uid("dep")).expect("dep");
    let req = dep.requirement.as_ref().expect("req");
    assert_eq!(req.provider_id, Some(provider.uid()));
    let choices = driver.get_choices().expect("choices");
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].edge_uid, make_uid("enter-vault"));
}

#[test]
fn unresolvable_hard_requirement_filters_the_choice_without_error() {
    let requirement = Requirement::new(make_uid("req-ghost"), ProvisioningPolicy::Existing)
        .with_identifier("ghost");
    let (g, _) = gated_world(requirement);
    let mut driver = driver_at(g, "hub");

    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());

    let dep = driver.graph().edge(&make_uid("dep")).expect("dep");
    let req = dep.requirement.as_ref().expect("req");
    assert!(req.is_unresolvable);
    assert!(req.provider_id.is_none());
    assert!(driver.get_choices().expect("choices").is_empty());
}

#[test]
fn existing_policy_attaches_a_matching_node_from_the_graph() {
    let requirement = Requirement::new(make_uid("req-hero"), ProvisioningPolicy::Existing)
        .with_identifier("hero");
    let (mut g, _) = gated_world(requirement);
    g.insert_node(node("hero").with_local("role", Value::from("lead")))
        .expect("hero");
    let mut driver = driver_at(g, "hub");

    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    let dep = driver.graph().edge(&make_uid("dep")).expect("dep");
    assert_eq!(
        dep.requirement.as_ref().and_then(|r| r.provider_id),
        Some(make_uid("hero"))
    );
    assert_eq!(driver.get_choices().expect("choices").len(), 1);
}

#[test]
fn update_policy_overlays_the_template_on_the_existing_provider() {
    let requirement = Requirement::new(make_uid("req-forge"), ProvisioningPolicy::Update)
        .with_identifier("forge")
        .with_template(TemplateData {
            cls: NODE_FQN.to_owned(),
            attributes: attrs(&[("heat", Value::Int(900))]),
        });
    let (mut g, _) = gated_world(requirement);
    g.insert_node(node("forge").with_local("heat", Value::Int(20)))
        .expect("forge");
    let mut driver = driver_at(g, "hub");

    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    let forge = driver.graph().node(&make_uid("forge")).expect("forge");
    assert_eq!(forge.locals.get("heat"), Some(&Value::Int(900)));
    let dep = driver.graph().edge(&make_uid("dep")).expect("dep");
    assert_eq!(
        dep.requirement.as_ref().and_then(|r| r.provider_id),
        Some(make_uid("forge"))
    );
}

#[test]
fn clone_policy_copies_the_reference_with_a_fresh_uid() {
    let requirement = Requirement::new(make_uid("req-guard"), ProvisioningPolicy::Clone)
        .with_identifier("guard")
        .with_template(TemplateData {
            cls: NODE_FQN.to_owned(),
            attributes: attrs(&[("post", Value::from("vault-door"))]),
        });
    let (mut g, _) = gated_world(requirement);
    g.insert_node(node("guard").with_local("hp", Value::Int(5)))
        .expect("guard");
    let mut driver = driver_at(g, "hub");

    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());

    let dep = driver.graph().edge(&make_uid("dep")).expect("dep");
    let clone_uid = dep
        .requirement
        .as_ref()
        .and_then(|r| r.provider_id)
        .expect("provider");
    assert_ne!(clone_uid, make_uid("guard"));
    let clone = driver.graph().node(&clone_uid).expect("clone");
    // Copied state plus the template overlay.
    assert_eq!(clone.locals.get("hp"), Some(&Value::Int(5)));
    assert_eq!(clone.locals.get("post"), Some(&Value::from("vault-door")));
    // The original is untouched.
    let original = driver.graph().node(&make_uid("guard")).expect("guard");
    assert!(original.locals.get("post").is_none());
}

#[test]
fn soft_requirement_never_gates_the_choice() {
    let requirement = Requirement::new(make_uid("req-soft"), ProvisioningPolicy::Existing)
        .with_identifier("nobody")
        .soft();
    let (g, _) = gated_world(requirement);
    let driver = driver_at(g, "hub");
    // Satisfied by softness even with no provider in sight.
    assert_eq!(driver.get_choices().expect("choices").len(), 1);
}

#[test]
fn affordance_links_to_a_matching_frontier_node() {
    // A resource node affords itself to any frontier node labeled "stage";
    // the cursor's choice leads to "stage".
    let mut g = Graph::new();
    let hub = node("hub");
    let stage = node("stage");
    let prop = node("prop");
    let (uh, us, up) = (hub.uid(), stage.uid(), prop.uid());
    g.insert_node(hub).expect("hub");
    g.insert_node(stage).expect("stage");
    g.insert_node(prop).expect("prop");
    g.insert_edge(choice("to-stage", uh, us)).expect("choice");

    let mut requirement =
        Requirement::new(make_uid("req-aff"), ProvisioningPolicy::Existing).soft();
    requirement.criteria.insert("label".to_owned(), Value::from("stage"));
    g.insert_edge(Edge::affordance(
        Entity::labeled(make_uid("aff"), "prop"),
        up,
        requirement,
    ))
    .expect("affordance");

    let mut driver = driver_at(g, "hub");
    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());

    let aff = driver.graph().edge(&make_uid("aff")).expect("aff");
    assert_eq!(
        aff.requirement.as_ref().and_then(|r| r.provider_id),
        Some(us)
    );
    assert_eq!(aff.source(), Some(us));
}
