// SPDX-License-Identifier: Apache-2.0
//! Dispatch ordering, namespace precedence, and tick-level error handling.

mod common;

use common::{choice, driver_at, node};
use loom_core::{
    make_uid, CallerFilter, Edge, EdgeKind, Entity, FragmentType, Graph, HandlerOut,
    HandlerPriority, HandlerScope, Phase, Service, TickError, Value,
};

fn hierarchy(label: &str, parent: loom_core::Uid, child: loom_core::Uid) -> Edge {
    Edge::new(Entity::labeled(make_uid(label), label), parent, child, EdgeKind::Hierarchy)
}

/// grandparent (domain:mist, x=3, y=9) → parent (x=2) → child (x=1).
fn layered_graph() -> Graph {
    let mut g = Graph::new();
    let grand = node("grand")
        .with_local("x", Value::Int(3))
        .with_local("y", Value::Int(9));
    let mut grand = grand;
    grand.entity.tags.insert("domain:mist".to_owned());
    let parent = node("parent").with_local("x", Value::Int(2));
    let child = node("child").with_local("x", Value::Int(1));
    let (ug, up, uc) = (grand.uid(), parent.uid(), child.uid());
    g.insert_node(grand).expect("grand");
    g.insert_node(parent).expect("parent");
    g.insert_node(child).expect("child");
    g.insert_edge(hierarchy("g->p", ug, up)).expect("g->p");
    g.insert_edge(hierarchy("p->c", up, uc)).expect("p->c");
    g
}

fn journal_texts(journal: &[loom_core::Fragment]) -> Vec<String> {
    journal
        .iter()
        .filter(|f| f.fragment_type == FragmentType::Text)
        .map(|f| f.content.clone())
        .collect()
}

#[test]
fn namespace_resolution_prefers_the_innermost_layer() {
    let mut driver = driver_at(layered_graph(), "child");
    driver.vm_mut().set_global("z", Value::Int(42));
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "peek_ns",
        Box::new(|ctx, _site| {
            let x = ctx.ns.get("x").cloned().unwrap_or(Value::Null);
            let y = ctx.ns.get("y").cloned().unwrap_or(Value::Null);
            let z = ctx.ns.get("z").cloned().unwrap_or(Value::Null);
            Ok(HandlerOut::Text(format!("x={x} y={y} z={z}")))
        }),
    );

    let result = driver.step(None).expect("step");
    let texts = journal_texts(&result.journal);
    assert_eq!(texts, vec!["x=1 y=9 z=42".to_owned()]);
}

#[test]
fn inner_scopes_override_outer_scopes_at_equal_priority() {
    let graph = layered_graph();
    let child = make_uid("child");
    let parent = make_uid("parent");
    let mut driver = driver_at(graph, "child");

    // Same priority, four layers; registration order is global-first to
    // prove the layer depth dominates the tie-break.
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "from_global",
        Box::new(|_, _| Ok(HandlerOut::Text("global".to_owned()))),
    );
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Domain("mist".to_owned()),
        HandlerPriority::Normal,
        CallerFilter::Any,
        "from_domain",
        Box::new(|_, _| Ok(HandlerOut::Text("domain".to_owned()))),
    );
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Ancestor(parent),
        HandlerPriority::Normal,
        CallerFilter::Any,
        "from_ancestor",
        Box::new(|_, _| Ok(HandlerOut::Text("ancestor".to_owned()))),
    );
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Node(child),
        HandlerPriority::Normal,
        CallerFilter::Any,
        "from_node",
        Box::new(|_, _| Ok(HandlerOut::Text("node".to_owned()))),
    );

    let result = driver.step(None).expect("step");
    let texts = journal_texts(&result.journal);
    assert_eq!(texts, vec!["node", "ancestor", "domain", "global"]);
}

#[test]
fn registration_order_breaks_priority_ties() {
    let mut driver = driver_at(layered_graph(), "child");
    for name in ["first_registered", "second_registered"] {
        let text = name.to_owned();
        driver.vm_mut().register_handler(
            Service::Phase(Phase::Journal),
            HandlerScope::Global,
            HandlerPriority::Normal,
            CallerFilter::Any,
            name,
            Box::new(move |_, _| Ok(HandlerOut::Text(text.clone()))),
        );
    }
    let result = driver.step(None).expect("step");
    let texts = journal_texts(&result.journal);
    assert_eq!(texts, vec!["first_registered", "second_registered"]);
}

#[test]
fn caller_filters_restrict_application() {
    let mut g = Graph::new();
    let a = node("a");
    let mut b = node("b");
    b.entity.tags.insert("haunted".to_owned());
    let (ua, ub) = (a.uid(), b.uid());
    g.insert_node(a).expect("a");
    g.insert_node(b).expect("b");
    g.insert_edge(choice("a->b", ua, ub)).expect("edge");

    let mut driver = driver_at(g, "a");
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Tagged("haunted".to_owned()),
        "haunted_whisper",
        Box::new(|_, _| Ok(HandlerOut::Text("whisper".to_owned()))),
    );

    let at_a = driver.step(Some(make_uid("a->b"))).expect("step at a");
    assert!(journal_texts(&at_a.journal).is_empty());

    let at_b = driver.step(None).expect("step at b");
    assert_eq!(journal_texts(&at_b.journal), vec!["whisper"]);
}

#[test]
fn unregistering_a_handler_removes_it_from_dispatch() {
    let mut driver = driver_at(layered_graph(), "child");
    let id = driver.vm_mut().register_handler(
        Service::Phase(Phase::Journal),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "transient",
        Box::new(|_, _| Ok(HandlerOut::Text("here".to_owned()))),
    );
    let first = driver.step(None).expect("step");
    assert_eq!(journal_texts(&first.journal), vec!["here"]);

    assert!(driver.vm_mut().unregister_handler(id));
    let second = driver.step(None).expect("step");
    assert!(journal_texts(&second.journal).is_empty());
}

#[test]
fn get_choices_handlers_can_contribute_extra_edges() {
    let mut g = layered_graph();
    let secret = Edge::new(
        Entity::labeled(make_uid("secret-exit"), "secret-exit"),
        make_uid("child"),
        make_uid("grand"),
        EdgeKind::Meta,
    );
    g.insert_edge(secret).expect("secret edge");

    let mut driver = driver_at(g, "child");
    assert!(driver.get_choices().expect("choices").is_empty());

    driver.vm_mut().register_handler(
        Service::GetChoices,
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "offer_secret_exit",
        Box::new(|_, _| Ok(HandlerOut::Edge(make_uid("secret-exit")))),
    );
    let choices = driver.get_choices().expect("choices");
    assert_eq!(choices.len(), 1);
    assert_eq!(choices[0].edge_uid, make_uid("secret-exit"));
    assert_eq!(choices[0].dst, make_uid("grand"));
}

#[test]
fn validation_failure_discards_the_tick_and_leaves_the_log_untouched() {
    let mut driver = driver_at(layered_graph(), "child");
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Validate),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "veto",
        Box::new(|_, _| Ok(HandlerOut::Bool(false))),
    );

    let before = driver.graph().state_hash();
    let result = driver.step(None).expect("step");
    assert_eq!(
        result.error,
        Some(TickError::ValidationFailed {
            reasons: vec!["veto".to_owned()],
        })
    );
    assert!(result.patch_id.is_none());

    // The journal carries an error fragment with a stable code.
    let error = result
        .journal
        .iter()
        .find(|f| f.fragment_type == FragmentType::Error)
        .expect("error fragment");
    assert_eq!(
        error.extras.get("code"),
        Some(&Value::from("validation_failed"))
    );

    // State untouched; the log receives nothing.
    assert_eq!(driver.graph().state_hash(), before);
    assert_eq!(driver.log().version(), 0);
}

#[test]
fn handler_faults_abort_the_tick_without_applying_effects() {
    let mut driver = driver_at(layered_graph(), "child");
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Update),
        HandlerScope::Global,
        HandlerPriority::Normal,
        CallerFilter::Any,
        "explode",
        Box::new(|_, _| Err(loom_core::HandlerError::new("boom"))),
    );

    let before = driver.graph().state_hash();
    let result = driver.step(None).expect("step");
    assert!(matches!(
        result.error,
        Some(TickError::HandlerFault { ref handler, .. }) if handler == "explode"
    ));
    assert_eq!(driver.graph().state_hash(), before);
    assert_eq!(driver.log().version(), 0);
}

#[test]
fn effect_budget_overflow_is_a_handler_fault() {
    let config = loom_core::RuntimeConfig {
        max_effects_per_tick: 1,
        ..loom_core::RuntimeConfig::default()
    };
    let mut driver = common::driver_with_config(layered_graph(), "child", config);
    driver.vm_mut().register_handler(
        Service::Phase(Phase::Update),
        HandlerScope::Global,
        HandlerPriority::First,
        CallerFilter::Any,
        "greedy",
        Box::new(|ctx, site| {
            ctx.frame.set_attr(
                site.caller,
                vec!["locals".to_owned(), "a".to_owned()],
                Value::Int(1),
            )?;
            ctx.frame.set_attr(
                site.caller,
                vec!["locals".to_owned(), "b".to_owned()],
                Value::Int(2),
            )?;
            Ok(HandlerOut::None)
        }),
    );
    let result = driver.step(None).expect("step");
    assert!(matches!(
        result.error,
        Some(TickError::HandlerFault { ref handler, .. }) if handler == "greedy"
    ));
}
