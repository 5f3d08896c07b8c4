// SPDX-License-Identifier: Apache-2.0
//! Scope assembly: the layer structure behind namespaces and dispatch.
//!
//! A scope is computed per anchor from the preview graph. Layers in
//! precedence order: the anchor itself, its ancestors nearest-first (via
//! HIERARCHY edges), the active domains, then process globals. Active
//! domains are the union of `domain:*` tag suffixes on the anchor and its
//! ancestors; providers of inactive domains contribute nothing.

use std::collections::BTreeSet;

use crate::errors::GraphError;
use crate::graph::Graph;
use crate::handler::ScopeKind;
use crate::ident::Uid;

/// One scope layer, ordered by `depth` (inner first).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScopeLayer {
    /// Layer kind.
    pub kind: ScopeKind,
    /// Tie-break depth used in dispatch sort keys; inner scopes override
    /// outer scopes at equal priority.
    pub depth: u32,
    /// Node carrying this layer (anchor, ancestor, or domain carrier);
    /// `None` for the global layer.
    pub anchor: Option<Uid>,
    /// Domain name for domain layers.
    pub domain: Option<String>,
}

/// The set of layers contributing namespace and handlers for one anchor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Scope {
    /// The node this scope is about.
    pub anchor: Uid,
    /// Layers in precedence order, inner first, global last.
    pub layers: Vec<ScopeLayer>,
    /// Domain names active for the anchor.
    pub active_domains: BTreeSet<String>,
    /// Ancestor labels and active domain names, used by template scope
    /// patterns.
    pub scope_path: Vec<String>,
}

impl Scope {
    /// Assembles the scope for `anchor` against `graph`.
    pub fn assemble(graph: &Graph, anchor: Uid) -> Result<Self, GraphError> {
        if graph.node(&anchor).is_none() {
            return Err(GraphError::Corrupt(format!(
                "scope anchor {anchor} is not a node"
            )));
        }

        let ancestors = graph.ancestors_of(&anchor);
        let mut layers = Vec::with_capacity(ancestors.len() + 3);
        let mut depth = 0u32;
        layers.push(ScopeLayer {
            kind: ScopeKind::Node,
            depth,
            anchor: Some(anchor),
            domain: None,
        });

        let mut scope_path = Vec::new();
        for ancestor in &ancestors {
            depth += 1;
            layers.push(ScopeLayer {
                kind: ScopeKind::Ancestor,
                depth,
                anchor: Some(*ancestor),
                domain: None,
            });
            if let Some(label) = graph.node(ancestor).and_then(|n| n.entity.label.clone()) {
                scope_path.push(label);
            }
        }

        // Domains activate along the chain from the anchor upward; the
        // carrier nearest the anchor wins when a name repeats.
        let mut active_domains = BTreeSet::new();
        let chain = core::iter::once(anchor).chain(ancestors.iter().copied());
        let mut domain_layers = Vec::new();
        for carrier in chain {
            let Some(node) = graph.node(&carrier) else {
                continue;
            };
            for name in node.entity.domains() {
                if active_domains.insert(name.to_owned()) {
                    domain_layers.push((name.to_owned(), carrier));
                }
            }
        }
        for (name, carrier) in domain_layers {
            depth += 1;
            scope_path.push(name.clone());
            layers.push(ScopeLayer {
                kind: ScopeKind::Domain,
                depth,
                anchor: Some(carrier),
                domain: Some(name),
            });
        }

        depth += 1;
        layers.push(ScopeLayer {
            kind: ScopeKind::Global,
            depth,
            anchor: None,
            domain: None,
        });

        Ok(Self {
            anchor,
            layers,
            active_domains,
            scope_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::graph::{Edge, EdgeKind, Node};
    use crate::ident::make_uid;

    fn build_world() -> (Graph, Uid) {
        // scene (domain:tavern) ─hierarchy→ block
        let mut g = Graph::new();
        let scene =
            Node::new(Entity::labeled(make_uid("scene"), "scene").with_tag("domain:tavern"));
        let block = Node::new(Entity::labeled(make_uid("block"), "block"));
        let (us, ub) = (scene.uid(), block.uid());
        g.insert_node(scene).expect("scene");
        g.insert_node(block).expect("block");
        g.insert_edge(Edge::new(
            Entity::new(make_uid("scene->block")),
            us,
            ub,
            EdgeKind::Hierarchy,
        ))
        .expect("hierarchy");
        (g, ub)
    }

    #[test]
    fn layers_run_node_ancestor_domain_global() {
        let (g, block) = build_world();
        let scope = Scope::assemble(&g, block).expect("scope");
        let kinds: Vec<ScopeKind> = scope.layers.iter().map(|l| l.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ScopeKind::Node,
                ScopeKind::Ancestor,
                ScopeKind::Domain,
                ScopeKind::Global
            ]
        );
        let depths: Vec<u32> = scope.layers.iter().map(|l| l.depth).collect();
        assert_eq!(depths, vec![0, 1, 2, 3]);
    }

    #[test]
    fn domains_activate_through_the_ancestor_chain() {
        let (g, block) = build_world();
        let scope = Scope::assemble(&g, block).expect("scope");
        assert!(scope.active_domains.contains("tavern"));
        assert_eq!(scope.scope_path, vec!["scene".to_owned(), "tavern".to_owned()]);
    }

    #[test]
    fn missing_anchor_is_rejected() {
        let (g, _) = build_world();
        assert!(Scope::assemble(&g, make_uid("ghost")).is_err());
    }
}
