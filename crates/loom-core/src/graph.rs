// SPDX-License-Identifier: Apache-2.0
//! Typed story graph: nodes, edges, adjacency indexes, silent mutators.
//!
//! The graph is the surface model authors and handlers read. Observation is
//! free; mutation is only reachable through effects. The silent mutators at
//! the bottom of this module perform no validation and emit no effects —
//! they exist solely for the patch applier and the per-phase preview
//! rebuild.

use std::collections::{BTreeMap, BTreeSet};

use crate::entity::Entity;
use crate::errors::{EvalError, GraphError};
use crate::expr::{Expr, ExprEval};
use crate::ident::Uid;
use crate::ns::Ns;
use crate::phase::Phase;
use crate::provision::Requirement;
use crate::value::{Criteria, Value};

/// Logical kind of an edge.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Parent → child structure; hierarchy edges form a forest.
    Hierarchy,
    /// Symmetric association.
    Association,
    /// Requirement → provider binding (open edges).
    Provides,
    /// Structural successor offered to the cursor.
    Choice,
    /// Low-level bookkeeping (debug, annotations).
    Meta,
}

impl EdgeKind {
    /// Stable lowercase name used in effect arguments and DTOs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Hierarchy => "hierarchy",
            Self::Association => "association",
            Self::Provides => "provides",
            Self::Choice => "choice",
            Self::Meta => "meta",
        }
    }

    /// Parses the stable name produced by [`EdgeKind::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "hierarchy" => Some(Self::Hierarchy),
            "association" => Some(Self::Association),
            "provides" => Some(Self::Provides),
            "choice" => Some(Self::Choice),
            "meta" => Some(Self::Meta),
            _ => None,
        }
    }
}

/// Lifecycle state of an edge.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    /// Potential edge, not yet considered.
    Latent,
    /// Bound and active.
    Resolved,
    /// Open edge awaiting provisioning.
    Open,
    /// Followed at least once by the cursor.
    Visited,
}

impl EdgeState {
    /// Stable lowercase name used in effect arguments and DTOs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Latent => "latent",
            Self::Resolved => "resolved",
            Self::Open => "open",
            Self::Visited => "visited",
        }
    }

    /// Parses the stable name produced by [`EdgeState::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "latent" => Some(Self::Latent),
            "resolved" => Some(Self::Resolved),
            "open" => Some(Self::Open),
            "visited" => Some(Self::Visited),
            _ => None,
        }
    }
}

/// Traversal direction for adjacency queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Edges whose source is the query node.
    Out,
    /// Edges whose destination is the query node.
    In,
    /// Union of both directions.
    Both,
}

/// Which endpoint of an open edge is unbound.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenRole {
    /// Source bound, destination open; projects into the source's namespace.
    Dependency,
    /// Destination bound, source open; projects into the destination's
    /// namespace.
    Affordance,
}

/// A story node: base record plus author-writable locals and effect scripts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Identified base record.
    pub entity: Entity,
    /// Author-writable per-node state contributed to the namespace.
    pub locals: BTreeMap<String, Value>,
    /// Effect scripts run during UPDATE when the cursor rests here.
    pub entry_effects: Vec<Expr>,
    /// Effect scripts run during FINALIZE when the cursor rests here.
    pub final_effects: Vec<Expr>,
}

impl Node {
    /// Creates an empty node with the given identity.
    #[must_use]
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            locals: BTreeMap::new(),
            entry_effects: Vec::new(),
            final_effects: Vec::new(),
        }
    }

    /// Sets a local, returning `self` for fixture-style chaining.
    #[must_use]
    pub fn with_local(mut self, key: &str, value: Value) -> Self {
        self.locals.insert(key.to_owned(), value);
        self
    }

    /// Node identifier.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.entity.uid
    }

    /// Label when present, short uid otherwise.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.entity.display_name()
    }

    /// Matches base-record criteria plus equality on `locals` keys.
    #[must_use]
    pub fn matches(&self, criteria: &Criteria) -> bool {
        criteria.iter().all(|(key, want)| {
            if let Some(have) = self.locals.get(key) {
                return have == want;
            }
            self.entity.matches_one(key, want)
        })
    }

    pub(crate) fn set_path(&mut self, path: &[String], value: Value) -> Result<(), String> {
        let Some((head, rest)) = path.split_first() else {
            return Err("empty attribute path".to_owned());
        };
        match (head.as_str(), rest.is_empty()) {
            ("label", true) => {
                self.entity.label = match value {
                    Value::Null => None,
                    Value::Str(s) => Some(s),
                    other => return Err(format!("label expects string, got {other}")),
                };
                Ok(())
            }
            ("tags", true) => {
                let Value::List(items) = value else {
                    return Err("tags expects a list".to_owned());
                };
                let mut tags = BTreeSet::new();
                for item in items {
                    match item {
                        Value::Str(s) => {
                            tags.insert(s);
                        }
                        other => return Err(format!("tag expects string, got {other}")),
                    }
                }
                self.entity.tags = tags;
                Ok(())
            }
            ("entry_effects", true) => {
                self.entry_effects = value_to_exprs(&value)?;
                Ok(())
            }
            ("final_effects", true) => {
                self.final_effects = value_to_exprs(&value)?;
                Ok(())
            }
            ("locals", true) => match value {
                Value::Map(entries) => {
                    self.locals = entries;
                    Ok(())
                }
                other => Err(format!("locals expects a map, got {other}")),
            },
            ("locals", false) => set_map_path(&mut self.locals, rest, value),
            (other, _) => Err(format!("unknown node attribute: {other}")),
        }
    }
}

/// A typed, possibly open edge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Edge {
    /// Identified base record.
    pub entity: Entity,
    /// Source node id; [`crate::ident::NIL_UID`] for open affordances.
    pub src_id: Uid,
    /// Destination node id; [`crate::ident::NIL_UID`] for open dependencies.
    pub dst_id: Uid,
    /// Logical kind.
    pub kind: EdgeKind,
    /// Lifecycle state.
    pub state: EdgeState,
    /// When set, the edge is auto-followed during that phase if available.
    pub trigger_phase: Option<Phase>,
    /// Directed flag; association edges may be symmetric.
    pub directed: bool,
    /// Opaque availability conditions evaluated against the namespace.
    pub conditions: Vec<Expr>,
    /// Requirement carried by open (dependency/affordance) edges.
    pub requirement: Option<Requirement>,
}

impl Edge {
    /// Creates a resolved structural edge.
    #[must_use]
    pub fn new(entity: Entity, src_id: Uid, dst_id: Uid, kind: EdgeKind) -> Self {
        Self {
            entity,
            src_id,
            dst_id,
            kind,
            state: EdgeState::Resolved,
            trigger_phase: None,
            directed: true,
            conditions: Vec::new(),
            requirement: None,
        }
    }

    /// Creates an open dependency edge: source bound, destination read
    /// through the requirement's provider.
    #[must_use]
    pub fn dependency(entity: Entity, src_id: Uid, requirement: Requirement) -> Self {
        Self {
            entity,
            src_id,
            dst_id: crate::ident::NIL_UID,
            kind: EdgeKind::Provides,
            state: EdgeState::Open,
            trigger_phase: None,
            directed: true,
            conditions: Vec::new(),
            requirement: Some(requirement),
        }
    }

    /// Creates an open affordance edge: destination bound, source read
    /// through the requirement's provider.
    #[must_use]
    pub fn affordance(entity: Entity, dst_id: Uid, requirement: Requirement) -> Self {
        Self {
            entity,
            src_id: crate::ident::NIL_UID,
            dst_id,
            kind: EdgeKind::Provides,
            state: EdgeState::Open,
            trigger_phase: None,
            directed: true,
            conditions: Vec::new(),
            requirement: Some(requirement),
        }
    }

    /// Sets the auto-trigger phase, returning `self` for chaining.
    #[must_use]
    pub fn with_trigger(mut self, phase: Phase) -> Self {
        self.trigger_phase = Some(phase);
        self
    }

    /// Adds an availability condition, returning `self` for chaining.
    #[must_use]
    pub fn with_condition(mut self, expr: &str) -> Self {
        self.conditions.push(expr.to_owned());
        self
    }

    /// Edge identifier.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.entity.uid
    }

    /// Which endpoint is open, when this is an open edge.
    #[must_use]
    pub fn open_role(&self) -> Option<OpenRole> {
        self.requirement.as_ref()?;
        if self.dst_id.is_nil() {
            Some(OpenRole::Dependency)
        } else if self.src_id.is_nil() {
            Some(OpenRole::Affordance)
        } else {
            None
        }
    }

    /// Destination, reading open dependencies through their provider.
    #[must_use]
    pub fn destination(&self) -> Option<Uid> {
        match self.open_role() {
            Some(OpenRole::Dependency) => {
                self.requirement.as_ref().and_then(|r| r.provider_id)
            }
            _ => (!self.dst_id.is_nil()).then_some(self.dst_id),
        }
    }

    /// Source, reading open affordances through their provider.
    #[must_use]
    pub fn source(&self) -> Option<Uid> {
        match self.open_role() {
            Some(OpenRole::Affordance) => {
                self.requirement.as_ref().and_then(|r| r.provider_id)
            }
            _ => (!self.src_id.is_nil()).then_some(self.src_id),
        }
    }

    /// Whether the requirement (if any) is satisfied. Edges without a
    /// requirement are trivially satisfied.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        self.requirement.as_ref().is_none_or(|r| r.satisfied())
    }

    /// Evaluates the availability conditions against a namespace.
    pub fn available(&self, ns: &Ns, eval: &dyn ExprEval) -> Result<bool, EvalError> {
        for cond in &self.conditions {
            if !eval.eval_predicate(cond, ns)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Matches edge attributes plus base-record criteria.
    #[must_use]
    pub fn matches(&self, criteria: &Criteria) -> bool {
        criteria.iter().all(|(key, want)| match key.as_str() {
            "kind" => want.as_str() == Some(self.kind.name()),
            "state" => want.as_str() == Some(self.state.name()),
            "src_id" => want.as_uid() == Some(self.src_id),
            "dst_id" => want.as_uid() == Some(self.dst_id),
            "trigger_phase" => match want {
                Value::Null => self.trigger_phase.is_none(),
                Value::Str(s) => self.trigger_phase.map(Phase::name) == Some(s.as_str()),
                _ => false,
            },
            _ => self.entity.matches_one(key, want),
        })
    }

    pub(crate) fn set_path(&mut self, path: &[String], value: Value) -> Result<(), String> {
        let Some((head, rest)) = path.split_first() else {
            return Err("empty attribute path".to_owned());
        };
        match (head.as_str(), rest.is_empty()) {
            ("label", true) => {
                self.entity.label = match value {
                    Value::Null => None,
                    Value::Str(s) => Some(s),
                    other => return Err(format!("label expects string, got {other}")),
                };
                Ok(())
            }
            ("state", true) => {
                let name = value.as_str().ok_or("state expects string")?;
                self.state =
                    EdgeState::from_name(name).ok_or_else(|| format!("bad state {name:?}"))?;
                Ok(())
            }
            ("trigger_phase", true) => {
                self.trigger_phase = match value {
                    Value::Null => None,
                    Value::Str(s) => Some(
                        Phase::from_name(&s).ok_or_else(|| format!("bad phase {s:?}"))?,
                    ),
                    other => return Err(format!("trigger_phase expects string, got {other}")),
                };
                Ok(())
            }
            ("directed", true) => {
                self.directed = match value {
                    Value::Bool(b) => b,
                    other => return Err(format!("directed expects bool, got {other}")),
                };
                Ok(())
            }
            ("conditions", true) => {
                self.conditions = value_to_exprs(&value)?;
                Ok(())
            }
            ("requirement", false) => {
                let req = self
                    .requirement
                    .as_mut()
                    .ok_or("edge carries no requirement")?;
                req.set_path(rest, value)
            }
            (other, _) => Err(format!("unknown edge attribute: {other}")),
        }
    }
}

/// A reference to either item kind.
#[derive(Clone, Copy, Debug)]
pub enum ItemRef<'a> {
    /// Node reference.
    Node(&'a Node),
    /// Edge reference.
    Edge(&'a Edge),
}

impl ItemRef<'_> {
    /// The item's identifier.
    #[must_use]
    pub fn uid(&self) -> Uid {
        match self {
            Self::Node(n) => n.uid(),
            Self::Edge(e) => e.uid(),
        }
    }
}

/// An owned item, produced by DTO constructors and effect appliers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Item {
    /// Owned node.
    Node(Node),
    /// Owned edge.
    Edge(Edge),
}

/// The surface story graph.
///
/// Invariants
/// - `out_idx[u]` contains edge `e` iff `e.src_id == u`; symmetric for
///   `in_idx`. Open endpoints ([`crate::ident::NIL_UID`]) are not indexed.
/// - Deleting a node removes all incident edges.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Graph {
    nodes: BTreeMap<Uid, Node>,
    edges: BTreeMap<Uid, Edge>,
    out_idx: BTreeMap<Uid, BTreeSet<Uid>>,
    in_idx: BTreeMap<Uid, BTreeSet<Uid>>,
}

impl Graph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Number of edges.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Looks up an item by id.
    #[must_use]
    pub fn get(&self, uid: &Uid) -> Option<ItemRef<'_>> {
        if let Some(node) = self.nodes.get(uid) {
            return Some(ItemRef::Node(node));
        }
        self.edges.get(uid).map(ItemRef::Edge)
    }

    /// Returns `true` when any item carries this id.
    #[must_use]
    pub fn contains(&self, uid: &Uid) -> bool {
        self.nodes.contains_key(uid) || self.edges.contains_key(uid)
    }

    /// Looks up a node by id.
    #[must_use]
    pub fn node(&self, uid: &Uid) -> Option<&Node> {
        self.nodes.get(uid)
    }

    /// Looks up an edge by id.
    #[must_use]
    pub fn edge(&self, uid: &Uid) -> Option<&Edge> {
        self.edges.get(uid)
    }

    /// Iterates nodes in ascending uid order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Iterates edges in ascending uid order.
    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    /// Inserts a node, rejecting duplicate ids. World-setup API; running
    /// stories mutate through effects instead.
    pub fn insert_node(&mut self, node: Node) -> Result<(), GraphError> {
        if self.contains(&node.uid()) {
            return Err(GraphError::DuplicateUid(node.uid()));
        }
        self.nodes.insert(node.uid(), node);
        Ok(())
    }

    /// Inserts an edge, rejecting duplicate ids and dangling bound
    /// endpoints. Open (nil) endpoints are legal and left unindexed.
    pub fn insert_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        if self.contains(&edge.uid()) {
            return Err(GraphError::DuplicateUid(edge.uid()));
        }
        if !edge.src_id.is_nil() && !self.nodes.contains_key(&edge.src_id) {
            return Err(GraphError::MissingEndpoint(edge.src_id));
        }
        if !edge.dst_id.is_nil() && !self.nodes.contains_key(&edge.dst_id) {
            return Err(GraphError::MissingEndpoint(edge.dst_id));
        }
        self.index_edge(&edge);
        self.edges.insert(edge.uid(), edge);
        Ok(())
    }

    /// Edges whose source is `uid`, in ascending edge-uid order.
    pub fn edges_out(&self, uid: &Uid) -> impl Iterator<Item = &Edge> {
        self.out_idx
            .get(uid)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.edges.get(eid))
    }

    /// Edges whose destination is `uid`, in ascending edge-uid order.
    pub fn edges_in(&self, uid: &Uid) -> impl Iterator<Item = &Edge> {
        self.in_idx
            .get(uid)
            .into_iter()
            .flatten()
            .filter_map(|eid| self.edges.get(eid))
    }

    /// Adjacency-indexed traversal filtered by the edge matcher.
    #[must_use]
    pub fn find_edges(&self, node: &Uid, direction: Direction, criteria: &Criteria) -> Vec<&Edge> {
        let mut out: Vec<&Edge> = Vec::new();
        if matches!(direction, Direction::Out | Direction::Both) {
            out.extend(self.edges_out(node).filter(|e| e.matches(criteria)));
        }
        if matches!(direction, Direction::In | Direction::Both) {
            // In Both mode a self-loop is already in the outbound half.
            let skip_self_loops = direction == Direction::Both;
            out.extend(
                self.edges_in(node)
                    .filter(|e| e.matches(criteria) && !(skip_self_loops && e.src_id == *node)),
            );
        }
        out.sort_by_key(|e| e.uid());
        out
    }

    /// Uid-level edge filter used by effect builders.
    #[must_use]
    pub fn find_edge_ids(
        &self,
        src: Option<Uid>,
        dst: Option<Uid>,
        kind: Option<EdgeKind>,
    ) -> Vec<Uid> {
        self.edges
            .values()
            .filter(|e| src.is_none_or(|s| e.src_id == s))
            .filter(|e| dst.is_none_or(|d| e.dst_id == d))
            .filter(|e| kind.is_none_or(|k| e.kind == k))
            .map(Edge::uid)
            .collect()
    }

    /// Parent of a node along HIERARCHY edges (parent → child).
    #[must_use]
    pub fn parent_of(&self, uid: &Uid) -> Option<Uid> {
        self.edges_in(uid)
            .find(|e| e.kind == EdgeKind::Hierarchy)
            .map(|e| e.src_id)
    }

    /// Ancestor chain, nearest first. The walk is cycle-guarded; hierarchy
    /// edges are expected to form a forest.
    #[must_use]
    pub fn ancestors_of(&self, uid: &Uid) -> Vec<Uid> {
        let mut out = Vec::new();
        let mut seen: BTreeSet<Uid> = BTreeSet::new();
        seen.insert(*uid);
        let mut cur = *uid;
        while let Some(parent) = self.parent_of(&cur) {
            if !seen.insert(parent) {
                break;
            }
            out.push(parent);
            cur = parent;
        }
        out
    }

    /// Verifies the structural invariants: endpoint existence and index
    /// consistency in both directions.
    pub fn verify_invariants(&self) -> Result<(), GraphError> {
        for edge in self.edges.values() {
            for endpoint in [edge.src_id, edge.dst_id] {
                if !endpoint.is_nil() && !self.nodes.contains_key(&endpoint) {
                    return Err(GraphError::Corrupt(format!(
                        "edge {} references missing node {endpoint}",
                        edge.uid()
                    )));
                }
            }
            if !edge.src_id.is_nil()
                && !self
                    .out_idx
                    .get(&edge.src_id)
                    .is_some_and(|s| s.contains(&edge.uid()))
            {
                return Err(GraphError::Corrupt(format!(
                    "edge {} missing from out index",
                    edge.uid()
                )));
            }
            if !edge.dst_id.is_nil()
                && !self
                    .in_idx
                    .get(&edge.dst_id)
                    .is_some_and(|s| s.contains(&edge.uid()))
            {
                return Err(GraphError::Corrupt(format!(
                    "edge {} missing from in index",
                    edge.uid()
                )));
            }
        }
        for (node, eids) in &self.out_idx {
            for eid in eids {
                let Some(edge) = self.edges.get(eid) else {
                    return Err(GraphError::Corrupt(format!(
                        "out index references missing edge {eid}"
                    )));
                };
                if edge.src_id != *node {
                    return Err(GraphError::Corrupt(format!(
                        "out index bucket {node} holds edge {eid} with src {}",
                        edge.src_id
                    )));
                }
            }
        }
        for (node, eids) in &self.in_idx {
            for eid in eids {
                let Some(edge) = self.edges.get(eid) else {
                    return Err(GraphError::Corrupt(format!(
                        "in index references missing edge {eid}"
                    )));
                };
                if edge.dst_id != *node {
                    return Err(GraphError::Corrupt(format!(
                        "in index bucket {node} holds edge {eid} with dst {}",
                        edge.dst_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn index_edge(&mut self, edge: &Edge) {
        if !edge.src_id.is_nil() {
            self.out_idx.entry(edge.src_id).or_default().insert(edge.uid());
        }
        if !edge.dst_id.is_nil() {
            self.in_idx.entry(edge.dst_id).or_default().insert(edge.uid());
        }
    }

    fn unindex_edge(&mut self, edge: &Edge) {
        if let Some(bucket) = self.out_idx.get_mut(&edge.src_id) {
            bucket.remove(&edge.uid());
            if bucket.is_empty() {
                self.out_idx.remove(&edge.src_id);
            }
        }
        if let Some(bucket) = self.in_idx.get_mut(&edge.dst_id) {
            bucket.remove(&edge.uid());
            if bucket.is_empty() {
                self.in_idx.remove(&edge.dst_id);
            }
        }
    }

    // ── Silent mutators ──────────────────────────────────────────────
    // No validation, no effects. Invoked only by the patch applier and the
    // preview rebuild.

    pub(crate) fn insert_node_silent(&mut self, node: Node) {
        self.nodes.insert(node.uid(), node);
    }

    /// Cascades incident edge removal; idempotent.
    pub(crate) fn remove_node_silent(&mut self, uid: &Uid) -> bool {
        if self.nodes.remove(uid).is_none() {
            return false;
        }
        let incident: Vec<Uid> = self
            .out_idx
            .get(uid)
            .into_iter()
            .flatten()
            .chain(self.in_idx.get(uid).into_iter().flatten())
            .copied()
            .collect();
        for eid in incident {
            self.remove_edge_silent(&eid);
        }
        true
    }

    pub(crate) fn insert_edge_silent(&mut self, edge: Edge) {
        if let Some(prev) = self.edges.remove(&edge.uid()) {
            self.unindex_edge(&prev);
        }
        self.index_edge(&edge);
        self.edges.insert(edge.uid(), edge);
    }

    pub(crate) fn remove_edge_silent(&mut self, uid: &Uid) -> bool {
        let Some(edge) = self.edges.remove(uid) else {
            return false;
        };
        self.unindex_edge(&edge);
        true
    }

    pub(crate) fn set_path_silent(
        &mut self,
        uid: &Uid,
        path: &[String],
        value: Value,
    ) -> Result<(), String> {
        if let Some(node) = self.nodes.get_mut(uid) {
            return node.set_path(path, value);
        }
        if let Some(edge) = self.edges.get_mut(uid) {
            return edge.set_path(path, value);
        }
        Err(format!("attribute target {uid} does not exist"))
    }
}

fn value_to_exprs(value: &Value) -> Result<Vec<Expr>, String> {
    let Value::List(items) = value else {
        return Err("expected a list of expressions".to_owned());
    };
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| format!("expression expects string, got {item}"))
        })
        .collect()
}

fn set_map_path(
    map: &mut BTreeMap<String, Value>,
    path: &[String],
    value: Value,
) -> Result<(), String> {
    let Some((head, rest)) = path.split_first() else {
        return Err("empty map path".to_owned());
    };
    if rest.is_empty() {
        map.insert(head.clone(), value);
        return Ok(());
    }
    let slot = map
        .entry(head.clone())
        .or_insert_with(|| Value::Map(BTreeMap::new()));
    match slot {
        Value::Map(inner) => set_map_path(inner, rest, value),
        other => Err(format!("cannot descend into non-map value {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::make_uid;

    fn node(label: &str) -> Node {
        Node::new(Entity::labeled(make_uid(label), label))
    }

    fn edge(label: &str, src: Uid, dst: Uid, kind: EdgeKind) -> Edge {
        Edge::new(Entity::labeled(make_uid(label), label), src, dst, kind)
    }

    fn two_node_graph() -> (Graph, Uid, Uid, Uid) {
        let mut g = Graph::new();
        let a = node("a");
        let b = node("b");
        let (ua, ub) = (a.uid(), b.uid());
        g.insert_node(a).expect("insert a");
        g.insert_node(b).expect("insert b");
        let e = edge("a->b", ua, ub, EdgeKind::Choice);
        let eid = e.uid();
        g.insert_edge(e).expect("insert edge");
        (g, ua, ub, eid)
    }

    #[test]
    fn adjacency_indexes_match_edges() {
        let (g, a, b, eid) = two_node_graph();
        assert!(g.verify_invariants().is_ok());
        let out: Vec<Uid> = g.edges_out(&a).map(Edge::uid).collect();
        assert_eq!(out, vec![eid]);
        let inn: Vec<Uid> = g.edges_in(&b).map(Edge::uid).collect();
        assert_eq!(inn, vec![eid]);
        assert!(g.edges_out(&b).next().is_none());
    }

    #[test]
    fn insert_rejects_duplicates_and_dangling_endpoints() {
        let (mut g, a, _, _) = two_node_graph();
        let dup = Node::new(Entity::new(a));
        assert_eq!(g.insert_node(dup), Err(GraphError::DuplicateUid(a)));
        let ghost = make_uid("ghost");
        let bad = edge("a->ghost", a, ghost, EdgeKind::Choice);
        assert_eq!(g.insert_edge(bad), Err(GraphError::MissingEndpoint(ghost)));
    }

    #[test]
    fn node_deletion_cascades_and_is_idempotent() {
        let (mut g, a, b, eid) = two_node_graph();
        assert!(g.remove_node_silent(&b));
        assert!(g.node(&b).is_none());
        assert!(g.edge(&eid).is_none());
        assert!(g.edges_out(&a).next().is_none());
        assert!(!g.remove_node_silent(&b));
        assert!(g.verify_invariants().is_ok());
    }

    #[test]
    fn find_edges_filters_by_criteria() {
        let (mut g, a, b, _) = two_node_graph();
        let meta = edge("a->b meta", a, b, EdgeKind::Meta);
        g.insert_edge(meta).expect("insert meta edge");
        let mut criteria = Criteria::new();
        criteria.insert("kind".to_owned(), Value::from("choice"));
        let found = g.find_edges(&a, Direction::Out, &criteria);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, EdgeKind::Choice);
        let all = g.find_edges(&a, Direction::Out, &Criteria::new());
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn hierarchy_walk_is_cycle_guarded() {
        let mut g = Graph::new();
        let parent = node("parent");
        let child = node("child");
        let (up, uc) = (parent.uid(), child.uid());
        g.insert_node(parent).expect("insert parent");
        g.insert_node(child).expect("insert child");
        g.insert_edge(edge("p->c", up, uc, EdgeKind::Hierarchy))
            .expect("insert hierarchy");
        assert_eq!(g.parent_of(&uc), Some(up));
        assert_eq!(g.ancestors_of(&uc), vec![up]);
        // A hostile back edge must not loop the walk.
        g.insert_edge(edge("c->p", uc, up, EdgeKind::Hierarchy))
            .expect("insert back edge");
        assert_eq!(g.ancestors_of(&uc), vec![up]);
    }

    #[test]
    fn set_path_reaches_nested_locals() {
        let (mut g, a, _, eid) = two_node_graph();
        let path = vec!["locals".to_owned(), "stats".to_owned(), "hp".to_owned()];
        g.set_path_silent(&a, &path, Value::Int(9)).expect("set");
        let stats_path = vec!["hp".to_owned()];
        let node = g.node(&a).expect("node");
        let stats = node.locals.get("stats").expect("stats map");
        assert_eq!(stats.get_path(&stats_path), Some(&Value::Int(9)));

        let state_path = vec!["state".to_owned()];
        g.set_path_silent(&eid, &state_path, Value::from("visited"))
            .expect("set state");
        assert_eq!(g.edge(&eid).expect("edge").state, EdgeState::Visited);
    }
}
