// SPDX-License-Identifier: Apache-2.0
//! Single choice transition: one tick, one patch, cursor handoff.

mod common;

use common::{choice, driver_at, node};
use loom_core::{
    make_uid, EdgeState, EffectArgs, FragmentType, Graph, Value,
};

fn two_room_graph() -> Graph {
    let mut g = Graph::new();
    let a = node("a").with_local("content", Value::from("the first room"));
    let b = node("b").with_local("content", Value::from("the second room"));
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("onward", ua, ub)).expect("edge");
    g
}

#[test]
fn step_commits_a_patch_and_hands_the_cursor_off() {
    let mut driver = driver_at(two_room_graph(), "a");
    let edge = make_uid("onward");

    let choices = driver.get_choices().expect("choices");
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].edge_uid, edge);

    let result = driver.step(Some(edge)).expect("step");
    assert!(result.error.is_none());
    assert!(result.patch_id.is_some());

    // Journal: a marker line plus the block content of the cursor.
    let marker = result
        .journal
        .iter()
        .find(|f| f.fragment_type == FragmentType::Marker)
        .expect("marker fragment");
    assert!(marker.content.starts_with("[step"));
    assert!(marker.content.ends_with("cursor at a"));
    let block = result
        .journal
        .iter()
        .find(|f| f.fragment_type == FragmentType::Block)
        .expect("block fragment");
    assert_eq!(block.content, "the first room");
    assert_eq!(block.source_id, Some(make_uid("a")));

    // The committed patch records cursor metadata writes.
    let patch = &driver.log().patches()[0];
    assert!(patch.effects.iter().any(|e| matches!(
        &e.args,
        EffectArgs::SetAttr { uid, path, .. }
            if *uid == make_uid("a") && path == &["locals".to_owned(), "visits".to_owned()]
    )));

    // Next tick starts at the destination; the edge is marked visited.
    assert_eq!(driver.cursor_uid(), make_uid("b"));
    let visited = driver.graph().edge(&edge).expect("edge");
    assert_eq!(visited.state, EdgeState::Visited);
    let a = driver.graph().node(&make_uid("a")).expect("a");
    assert_eq!(a.locals.get("visits"), Some(&Value::Int(1)));
}

#[test]
fn selecting_a_non_choice_is_rejected_without_state_change() {
    let mut driver = driver_at(two_room_graph(), "a");
    let before = driver.graph().state_hash();
    let err = driver.step(Some(make_uid("not-an-edge")));
    assert!(err.is_err());
    assert_eq!(driver.graph().state_hash(), before);
    assert_eq!(driver.log().version(), 0);
}

#[test]
fn choice_gated_by_condition_is_filtered() {
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("gated", ua, ub).with_condition("has key"))
        .expect("edge");
    let driver = driver_at(g, "a");
    assert!(driver.get_choices().expect("choices").is_empty());
}

#[test]
fn entry_effects_write_through_the_effect_api() {
    let mut g = Graph::new();
    let mut a = node("a");
    a.entry_effects.push("mood = 'tense'".to_owned());
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("on", ua, ub)).expect("edge");

    let mut driver = driver_at(g, "a");
    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    let a_after = driver.graph().node(&make_uid("a")).expect("a");
    assert_eq!(a_after.locals.get("mood"), Some(&Value::from("tense")));
}
