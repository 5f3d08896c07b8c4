// SPDX-License-Identifier: Apache-2.0
//! Prereq/postreq redirects and the auto-traversal bound.

mod common;

use common::{choice, driver_at, driver_with_config, node};
use loom_core::{Graph, Phase, RunReason, RuntimeConfig, TickError};

#[test]
fn prereq_and_postreq_chain_reaches_the_end_in_two_patches() {
    // a →(PREREQS)→ b →(POSTREQS)→ c
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let c = node("c");
    let (ua, ub, uc) = (a.uid(), b.uid(), c.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_node(c).expect("c");
    g.insert_edge(choice("a->b", ua, ub).with_trigger(Phase::Prereqs))
        .expect("a->b");
    g.insert_edge(choice("b->c", ub, uc).with_trigger(Phase::Postreqs))
        .expect("b->c");

    let mut driver = driver_at(g, "a");
    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    assert_eq!(driver.cursor_uid(), uc);
    // One patch for the a/b tick, one for the c tick.
    assert_eq!(driver.log().version(), 2);
}

#[test]
fn unavailable_postreq_edge_does_not_hand_off() {
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(
        choice("a->b", ua, ub)
            .with_trigger(Phase::Postreqs)
            .with_condition("false"),
    )
    .expect("a->b");

    let mut driver = driver_at(g, "a");
    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    assert_eq!(driver.cursor_uid(), ua);
    assert_eq!(driver.log().version(), 1);
}

#[test]
fn postreq_cycle_hits_the_bound_and_reports_a_loop() {
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("a->b", ua, ub).with_trigger(Phase::Postreqs))
        .expect("a->b");
    g.insert_edge(choice("b->a", ub, ua).with_trigger(Phase::Postreqs))
        .expect("b->a");

    let config = RuntimeConfig {
        auto_traversal_bound: 4,
        ..RuntimeConfig::default()
    };
    let mut driver = driver_with_config(g, "a", config);
    let result = driver.step(None).expect("step");
    assert!(matches!(
        result.error,
        Some(TickError::AutoTraversalExceeded { chain_length: 5 })
    ));
    // Every tick before the bound committed normally.
    assert!(result.patch_id.is_some());
    assert_eq!(driver.log().version(), 5);
}

#[test]
fn run_until_blocked_classifies_stop_reasons() {
    // Blocked: a manual choice is waiting.
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("a->b", ua, ub)).expect("edge");
    let mut driver = driver_at(g, "a");
    let run = driver.run_until_blocked(10).expect("run");
    assert_eq!(run.reason, RunReason::Blocked);
    assert!(run.patches.is_empty());

    // NoChoice: a dead end with no edges at all.
    let mut g2 = Graph::new();
    g2.insert_node(node("end")).expect("end");
    let mut driver2 = driver_at(g2, "end");
    let run2 = driver2.run_until_blocked(10).expect("run");
    assert_eq!(run2.reason, RunReason::NoChoice);
    assert_eq!(run2.patches.len(), 1);

    // Loop: a postreq cycle exhausts the traversal bound.
    let mut g3 = Graph::new();
    let x = node("x");
    let y = node("y");
    let (ux, uy) = (x.uid(), y.uid());
    g3.insert_node(x).expect("x");
    g3.insert_node(y).expect("y");
    g3.insert_edge(choice("x->y", ux, uy).with_trigger(Phase::Postreqs))
        .expect("x->y");
    g3.insert_edge(choice("y->x", uy, ux).with_trigger(Phase::Postreqs))
        .expect("y->x");
    let config = RuntimeConfig {
        auto_traversal_bound: 3,
        ..RuntimeConfig::default()
    };
    let mut driver3 = driver_with_config(g3, "x", config);
    let run3 = driver3.run_until_blocked(10).expect("run");
    assert_eq!(run3.reason, RunReason::Loop);
}

#[test]
fn prereq_redirect_restarts_within_a_single_tick() {
    // a →(PREREQS)→ b, no further triggers: one patch, cursor at b.
    let mut g = Graph::new();
    let a = node("a");
    let b = node("b");
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("a->b", ua, ub).with_trigger(Phase::Prereqs))
        .expect("a->b");

    let mut driver = driver_at(g, "a");
    let result = driver.step(None).expect("step");
    assert!(result.error.is_none());
    assert_eq!(driver.cursor_uid(), ub);
    assert_eq!(driver.log().version(), 1);
    // The journal reflects the post-redirect cursor.
    assert!(result
        .journal
        .iter()
        .any(|f| f.content.ends_with("cursor at b")));
}
