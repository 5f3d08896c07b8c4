// SPDX-License-Identifier: Apache-2.0
//! Shared fixtures for integration tests.

use loom_core::{
    make_uid, Driver, Edge, EdgeKind, Entity, Graph, LiteralEval, Node, RuntimeConfig, Uid, Vm,
};

/// A labeled node whose uid derives from its label.
pub fn node(label: &str) -> Node {
    Node::new(Entity::labeled(make_uid(label), label))
}

/// A labeled choice edge between two label-derived nodes.
pub fn choice(label: &str, src: Uid, dst: Uid) -> Edge {
    Edge::new(Entity::labeled(make_uid(label), label), src, dst, EdgeKind::Choice)
}

/// A driver over `graph` with the literal evaluator, positioned at the
/// node labeled `start`.
pub fn driver_at(graph: Graph, start: &str) -> Driver {
    driver_with_config(graph, start, RuntimeConfig::default())
}

/// Like [`driver_at`] with explicit runtime bounds.
pub fn driver_with_config(graph: Graph, start: &str, config: RuntimeConfig) -> Driver {
    let vm = Vm::new(config).with_eval(Box::new(LiteralEval));
    Driver::new(vm, graph, make_uid("story"), make_uid(start)).expect("driver")
}
