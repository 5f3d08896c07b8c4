// SPDX-License-Identifier: Apache-2.0
//! Portable graph snapshots.
//!
//! A snapshot is a list of FQN-tagged item DTOs plus the adjacency indexes.
//! The FQN is an opaque string understood by a [`Resolver`] supplied at load
//! time; `CREATE_NODE` effects carry the same FQNs so patches stay portable.
//!
//! Determinism contract
//! - Items are emitted in ascending uid order, nodes before edges.
//! - The state hash is a BLAKE3 digest over a canonical byte stream with a
//!   leading version tag; all lengths are little-endian u64.

use std::collections::BTreeMap;

use blake3::Hasher;

use crate::entity::Entity;
use crate::errors::DtoError;
use crate::graph::{Edge, EdgeKind, EdgeState, Graph, Item, Node};
use crate::ident::{Hash, NIL_UID};
use crate::phase::Phase;
use crate::provision::{ProvisioningPolicy, Requirement, TemplateData, TemplateSpec};
use crate::value::Value;

/// FQN of the built-in node class.
pub const NODE_FQN: &str = "loom.graph:Node";
/// FQN of the built-in edge class.
pub const EDGE_FQN: &str = "loom.graph:Edge";

/// One serialized item: class FQN plus unstructured data.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ItemDto {
    /// Opaque class name resolved by a [`Resolver`].
    pub cls: String,
    /// Item payload in the unstructured value representation.
    pub data: Value,
}

/// Portable snapshot of a full graph.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GraphDto {
    /// FQN-tagged items, nodes before edges, ascending uid order.
    pub items: Vec<ItemDto>,
    /// Outbound adjacency: node uid hex → sorted edge uid hex list.
    pub out_idx: BTreeMap<String, Vec<String>>,
    /// Inbound adjacency: node uid hex → sorted edge uid hex list.
    pub in_idx: BTreeMap<String, Vec<String>>,
}

/// Constructor registered for one item class.
pub type ItemCtor = fn(&Value) -> Result<Item, DtoError>;

/// Registry mapping FQN strings to item constructors, populated at startup.
#[derive(Clone, Debug, Default)]
pub struct Resolver {
    ctors: BTreeMap<String, ItemCtor>,
}

impl Resolver {
    /// Creates a resolver that knows the built-in node and edge classes.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut resolver = Self::default();
        resolver.register(NODE_FQN, |data| node_from_value(data).map(Item::Node));
        resolver.register(EDGE_FQN, |data| edge_from_value(data).map(Item::Edge));
        resolver
    }

    /// Registers (or replaces) a constructor for `cls`.
    pub fn register(&mut self, cls: &str, ctor: ItemCtor) {
        self.ctors.insert(cls.to_owned(), ctor);
    }

    /// Constructs an item from its class name and payload.
    pub fn construct(&self, cls: &str, data: &Value) -> Result<Item, DtoError> {
        let ctor = self
            .ctors
            .get(cls)
            .ok_or_else(|| DtoError::UnknownClass(cls.to_owned()))?;
        ctor(data)
    }
}

impl Graph {
    /// Serializes the graph into a portable snapshot.
    #[must_use]
    pub fn to_dto(&self) -> GraphDto {
        let mut items = Vec::with_capacity(self.node_count() + self.edge_count());
        for node in self.nodes() {
            items.push(ItemDto {
                cls: NODE_FQN.to_owned(),
                data: node_to_value(node),
            });
        }
        for edge in self.edges() {
            items.push(ItemDto {
                cls: EDGE_FQN.to_owned(),
                data: edge_to_value(edge),
            });
        }
        let mut out_idx: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut in_idx: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for node in self.nodes() {
            let uid = node.uid();
            let out: Vec<String> = self.edges_out(&uid).map(|e| e.uid().to_hex()).collect();
            if !out.is_empty() {
                out_idx.insert(uid.to_hex(), out);
            }
            let inn: Vec<String> = self.edges_in(&uid).map(|e| e.uid().to_hex()).collect();
            if !inn.is_empty() {
                in_idx.insert(uid.to_hex(), inn);
            }
        }
        GraphDto {
            items,
            out_idx,
            in_idx,
        }
    }

    /// Reconstructs a graph from a snapshot.
    ///
    /// The recorded adjacency indexes are cross-checked against the indexes
    /// rebuilt from the decoded edges; a mismatch is a corrupt snapshot.
    pub fn from_dto(dto: &GraphDto, resolver: &Resolver) -> Result<Self, DtoError> {
        let mut graph = Graph::new();
        let mut edges: Vec<Edge> = Vec::new();
        for item in &dto.items {
            match resolver.construct(&item.cls, &item.data)? {
                Item::Node(node) => graph.insert_node_silent(node),
                Item::Edge(edge) => edges.push(edge),
            }
        }
        for edge in edges {
            graph.insert_edge_silent(edge);
        }
        let rebuilt = graph.to_dto();
        if rebuilt.out_idx != dto.out_idx {
            return Err(DtoError::IndexMismatch("out_idx".to_owned()));
        }
        if rebuilt.in_idx != dto.in_idx {
            return Err(DtoError::IndexMismatch("in_idx".to_owned()));
        }
        Ok(graph)
    }

    /// Canonical BLAKE3 hash of the full graph state.
    #[must_use]
    pub fn state_hash(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(b"loom-state:v1");
        hasher.update(&(self.node_count() as u64).to_le_bytes());
        for node in self.nodes() {
            hasher.update(node.uid().as_bytes());
            encode_value(&mut hasher, &node_to_value(node));
        }
        hasher.update(&(self.edge_count() as u64).to_le_bytes());
        for edge in self.edges() {
            hasher.update(edge.uid().as_bytes());
            encode_value(&mut hasher, &edge_to_value(edge));
        }
        hasher.finalize().into()
    }
}

/// Feeds a canonical byte encoding of `value` into `hasher`.
pub(crate) fn encode_value(hasher: &mut Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(&[0u8]);
        }
        Value::Bool(b) => {
            hasher.update(&[1u8, u8::from(*b)]);
        }
        Value::Int(i) => {
            hasher.update(&[2u8]);
            hasher.update(&i.to_le_bytes());
        }
        Value::Str(s) => {
            hasher.update(&[3u8]);
            hasher.update(&(s.len() as u64).to_le_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Uid(u) => {
            hasher.update(&[4u8]);
            hasher.update(u.as_bytes());
        }
        Value::List(items) => {
            hasher.update(&[5u8]);
            hasher.update(&(items.len() as u64).to_le_bytes());
            for item in items {
                encode_value(hasher, item);
            }
        }
        Value::Map(entries) => {
            hasher.update(&[6u8]);
            hasher.update(&(entries.len() as u64).to_le_bytes());
            for (k, v) in entries {
                hasher.update(&(k.len() as u64).to_le_bytes());
                hasher.update(k.as_bytes());
                encode_value(hasher, v);
            }
        }
    }
}

fn entity_fields(entity: &Entity, map: &mut BTreeMap<String, Value>) {
    map.insert("uid".to_owned(), Value::Uid(entity.uid));
    map.insert(
        "label".to_owned(),
        entity
            .label
            .clone()
            .map_or(Value::Null, Value::Str),
    );
    map.insert(
        "tags".to_owned(),
        Value::List(entity.tags.iter().cloned().map(Value::Str).collect()),
    );
}

fn entity_from_map(map: &BTreeMap<String, Value>) -> Result<Entity, DtoError> {
    let uid = map
        .get("uid")
        .and_then(Value::as_uid)
        .ok_or_else(|| DtoError::Malformed("missing uid".to_owned()))?;
    let label = match map.get("label") {
        None | Some(Value::Null) => None,
        Some(Value::Str(s)) => Some(s.clone()),
        Some(other) => return Err(DtoError::Malformed(format!("bad label: {other}"))),
    };
    let mut entity = Entity::new(uid);
    entity.label = label;
    if let Some(Value::List(tags)) = map.get("tags") {
        for tag in tags {
            let tag = tag
                .as_str()
                .ok_or_else(|| DtoError::Malformed("tag expects string".to_owned()))?;
            entity.tags.insert(tag.to_owned());
        }
    }
    Ok(entity)
}

fn exprs_to_value(exprs: &[String]) -> Value {
    Value::List(exprs.iter().cloned().map(Value::Str).collect())
}

fn exprs_from_value(value: Option<&Value>) -> Result<Vec<String>, DtoError> {
    let Some(value) = value else {
        return Ok(Vec::new());
    };
    let items = value
        .as_list()
        .ok_or_else(|| DtoError::Malformed("expected expression list".to_owned()))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| DtoError::Malformed("expression expects string".to_owned()))
        })
        .collect()
}

/// Encodes a node into the unstructured value representation.
#[must_use]
pub fn node_to_value(node: &Node) -> Value {
    let mut map = BTreeMap::new();
    entity_fields(&node.entity, &mut map);
    map.insert("locals".to_owned(), Value::Map(node.locals.clone()));
    map.insert("entry_effects".to_owned(), exprs_to_value(&node.entry_effects));
    map.insert("final_effects".to_owned(), exprs_to_value(&node.final_effects));
    Value::Map(map)
}

/// Decodes a node from the unstructured value representation.
pub fn node_from_value(value: &Value) -> Result<Node, DtoError> {
    let map = value
        .as_map()
        .ok_or_else(|| DtoError::Malformed("node expects a map".to_owned()))?;
    let mut node = Node::new(entity_from_map(map)?);
    if let Some(locals) = map.get("locals") {
        node.locals = locals
            .as_map()
            .ok_or_else(|| DtoError::Malformed("locals expects a map".to_owned()))?
            .clone();
    }
    node.entry_effects = exprs_from_value(map.get("entry_effects"))?;
    node.final_effects = exprs_from_value(map.get("final_effects"))?;
    Ok(node)
}

/// Encodes an edge into the unstructured value representation.
#[must_use]
pub fn edge_to_value(edge: &Edge) -> Value {
    let mut map = BTreeMap::new();
    entity_fields(&edge.entity, &mut map);
    map.insert("src_id".to_owned(), Value::Uid(edge.src_id));
    map.insert("dst_id".to_owned(), Value::Uid(edge.dst_id));
    map.insert("kind".to_owned(), Value::from(edge.kind.name()));
    map.insert("state".to_owned(), Value::from(edge.state.name()));
    map.insert(
        "trigger_phase".to_owned(),
        edge.trigger_phase
            .map_or(Value::Null, |p| Value::from(p.name())),
    );
    map.insert("directed".to_owned(), Value::Bool(edge.directed));
    map.insert("conditions".to_owned(), exprs_to_value(&edge.conditions));
    if let Some(req) = &edge.requirement {
        map.insert("requirement".to_owned(), requirement_to_value(req));
    }
    Value::Map(map)
}

/// Decodes an edge from the unstructured value representation.
pub fn edge_from_value(value: &Value) -> Result<Edge, DtoError> {
    let map = value
        .as_map()
        .ok_or_else(|| DtoError::Malformed("edge expects a map".to_owned()))?;
    let entity = entity_from_map(map)?;
    let src_id = map.get("src_id").and_then(Value::as_uid).unwrap_or(NIL_UID);
    let dst_id = map.get("dst_id").and_then(Value::as_uid).unwrap_or(NIL_UID);
    let kind = map
        .get("kind")
        .and_then(Value::as_str)
        .and_then(EdgeKind::from_name)
        .ok_or_else(|| DtoError::Malformed("missing edge kind".to_owned()))?;
    let mut edge = Edge::new(entity, src_id, dst_id, kind);
    if let Some(state) = map.get("state").and_then(Value::as_str) {
        edge.state = EdgeState::from_name(state)
            .ok_or_else(|| DtoError::Malformed(format!("bad state {state:?}")))?;
    }
    edge.trigger_phase = match map.get("trigger_phase") {
        None | Some(Value::Null) => None,
        Some(Value::Str(s)) => Some(
            Phase::from_name(s).ok_or_else(|| DtoError::Malformed(format!("bad phase {s:?}")))?,
        ),
        Some(other) => return Err(DtoError::Malformed(format!("bad trigger_phase: {other}"))),
    };
    if let Some(Value::Bool(directed)) = map.get("directed") {
        edge.directed = *directed;
    }
    edge.conditions = exprs_from_value(map.get("conditions"))?;
    if let Some(req) = map.get("requirement") {
        edge.requirement = Some(requirement_from_value(req)?);
    }
    Ok(edge)
}

/// Encodes a requirement into the unstructured value representation.
#[must_use]
pub fn requirement_to_value(req: &Requirement) -> Value {
    let mut map = BTreeMap::new();
    map.insert("uid".to_owned(), Value::Uid(req.uid));
    map.insert(
        "identifier".to_owned(),
        req.identifier
            .clone()
            .map_or(Value::Null, Value::Str),
    );
    map.insert("criteria".to_owned(), Value::Map(req.criteria.clone()));
    map.insert(
        "template".to_owned(),
        match &req.template {
            None => Value::Null,
            Some(TemplateSpec::Named(name)) => Value::from(name.as_str()),
            Some(TemplateSpec::Inline(data)) => {
                let mut t = BTreeMap::new();
                t.insert("cls".to_owned(), Value::from(data.cls.as_str()));
                t.insert("attributes".to_owned(), Value::Map(data.attributes.clone()));
                Value::Map(t)
            }
        },
    );
    map.insert("policy".to_owned(), Value::from(req.policy.name()));
    map.insert(
        "provider_id".to_owned(),
        req.provider_id.map_or(Value::Null, Value::Uid),
    );
    map.insert(
        "hard_requirement".to_owned(),
        Value::Bool(req.hard_requirement),
    );
    map.insert(
        "is_unresolvable".to_owned(),
        Value::Bool(req.is_unresolvable),
    );
    Value::Map(map)
}

/// Decodes a requirement from the unstructured value representation.
pub fn requirement_from_value(value: &Value) -> Result<Requirement, DtoError> {
    let map = value
        .as_map()
        .ok_or_else(|| DtoError::Malformed("requirement expects a map".to_owned()))?;
    let uid = map
        .get("uid")
        .and_then(Value::as_uid)
        .ok_or_else(|| DtoError::Malformed("requirement missing uid".to_owned()))?;
    let policy = map
        .get("policy")
        .and_then(Value::as_str)
        .and_then(ProvisioningPolicy::from_name)
        .ok_or_else(|| DtoError::Malformed("requirement missing policy".to_owned()))?;
    let mut req = Requirement::new(uid, policy);
    req.identifier = match map.get("identifier") {
        None | Some(Value::Null) => None,
        Some(Value::Str(s)) => Some(s.clone()),
        Some(other) => return Err(DtoError::Malformed(format!("bad identifier: {other}"))),
    };
    if let Some(Value::Map(criteria)) = map.get("criteria") {
        req.criteria = criteria.clone();
    }
    req.template = match map.get("template") {
        None | Some(Value::Null) => None,
        Some(Value::Str(name)) => Some(TemplateSpec::Named(name.clone())),
        Some(Value::Map(t)) => {
            let cls = t
                .get("cls")
                .and_then(Value::as_str)
                .unwrap_or(NODE_FQN)
                .to_owned();
            let attributes = t
                .get("attributes")
                .and_then(Value::as_map)
                .cloned()
                .unwrap_or_default();
            Some(TemplateSpec::Inline(TemplateData { cls, attributes }))
        }
        Some(other) => return Err(DtoError::Malformed(format!("bad template: {other}"))),
    };
    req.provider_id = map.get("provider_id").and_then(Value::as_uid);
    if let Some(Value::Bool(hard)) = map.get("hard_requirement") {
        req.hard_requirement = *hard;
    }
    if let Some(Value::Bool(unres)) = map.get("is_unresolvable") {
        req.is_unresolvable = *unres;
    }
    Ok(req)
}
