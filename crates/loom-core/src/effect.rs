// SPDX-License-Identifier: Apache-2.0
//! Primitive mutation effects and canonicalization.
//!
//! Every mutation produced during a tick is captured as an [`Effect`]. At
//! the patch boundary the emitted sequence is canonicalized: deletes sort
//! before creates, per-uid create/delete runs collapse, attribute mutations
//! coalesce, and the result is a minimal, replay-equivalent sequence whose
//! order no longer depends on emission order.
//!
//! The op set has no read op, so the rule that read events are discarded
//! during canonicalization holds vacuously.

use std::collections::{BTreeMap, BTreeSet};

use blake3::Hasher;

use crate::dto::{encode_value, Resolver};
use crate::graph::{Edge, EdgeKind, Graph, Item};
use crate::entity::Entity;
use crate::ident::{Hash, Uid};
use crate::phase::Phase;
use crate::value::Value;

/// Primitive mutation kind.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    /// Remove a node (cascades incident edges).
    DeleteNode,
    /// Remove an edge.
    DelEdge,
    /// Materialize an item from an FQN-tagged payload.
    CreateNode,
    /// Add a plain structural edge.
    AddEdge,
    /// Set an attribute at a dotted path.
    SetAttr,
    /// Set a map key at a dotted path.
    SetMapKey,
}

impl Op {
    /// Canonical apply order: deletes before creates before mutations.
    #[must_use]
    pub fn apply_order(self) -> u8 {
        match self {
            Self::DeleteNode => 0,
            Self::DelEdge => 1,
            Self::CreateNode => 2,
            Self::AddEdge => 3,
            Self::SetAttr => 4,
            Self::SetMapKey => 5,
        }
    }
}

/// Who emitted an effect: the phase and handler active at the call site.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Provenance {
    /// Phase that was running.
    pub phase: Phase,
    /// Name of the emitting handler.
    pub handler: String,
}

impl Provenance {
    /// Creates a provenance record.
    #[must_use]
    pub fn new(phase: Phase, handler: &str) -> Self {
        Self {
            phase,
            handler: handler.to_owned(),
        }
    }
}

/// Op-specific effect arguments.
///
/// Serialized with an `op` tag whose values are the six canonical op
/// strings of the patch-log contract.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EffectArgs {
    /// `[uid, cls_fqn, data]`
    CreateNode {
        /// Item id (pre-allocated from the tick RNG).
        uid: Uid,
        /// Class FQN resolved at apply time.
        cls: String,
        /// Unstructured item payload; `uid` is injected at apply time.
        data: Value,
    },
    /// `[uid]`
    DeleteNode {
        /// Node id.
        uid: Uid,
    },
    /// `[src, dst, kind, edge_uid]`
    AddEdge {
        /// Source node id.
        src: Uid,
        /// Destination node id.
        dst: Uid,
        /// Edge kind.
        kind: EdgeKind,
        /// Edge id (pre-allocated from the tick RNG).
        edge_uid: Uid,
    },
    /// `[edge_uid]`
    DelEdge {
        /// Edge id.
        edge_uid: Uid,
    },
    /// `[uid, path, value]`
    SetAttr {
        /// Target item id.
        uid: Uid,
        /// Dotted attribute path segments.
        path: Vec<String>,
        /// New value.
        value: Value,
    },
    /// `[uid, path, value]`
    SetMapKey {
        /// Target item id.
        uid: Uid,
        /// Dotted map path segments.
        path: Vec<String>,
        /// New value.
        value: Value,
    },
}

/// A single replay-safe mutation instruction.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Effect {
    /// Op-specific arguments (tagged with the op).
    pub args: EffectArgs,
    /// Emitting phase and handler.
    pub provenance: Provenance,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct EffectKey {
    op_order: u8,
    a: [u8; 16],
    b: String,
}

impl Effect {
    /// The effect's primitive op.
    #[must_use]
    pub fn op(&self) -> Op {
        match &self.args {
            EffectArgs::CreateNode { .. } => Op::CreateNode,
            EffectArgs::DeleteNode { .. } => Op::DeleteNode,
            EffectArgs::AddEdge { .. } => Op::AddEdge,
            EffectArgs::DelEdge { .. } => Op::DelEdge,
            EffectArgs::SetAttr { .. } => Op::SetAttr,
            EffectArgs::SetMapKey { .. } => Op::SetMapKey,
        }
    }

    /// The uid of the item this effect creates or deletes, when structural.
    #[must_use]
    pub fn structural_uid(&self) -> Option<Uid> {
        match &self.args {
            EffectArgs::CreateNode { uid, .. } | EffectArgs::DeleteNode { uid } => Some(*uid),
            EffectArgs::AddEdge { edge_uid, .. } | EffectArgs::DelEdge { edge_uid } => {
                Some(*edge_uid)
            }
            EffectArgs::SetAttr { .. } | EffectArgs::SetMapKey { .. } => None,
        }
    }

    fn is_create(&self) -> bool {
        matches!(
            self.args,
            EffectArgs::CreateNode { .. } | EffectArgs::AddEdge { .. }
        )
    }

    fn sort_key(&self) -> EffectKey {
        let (a, b) = match &self.args {
            EffectArgs::CreateNode { uid, cls, .. } => (*uid, cls.clone()),
            EffectArgs::DeleteNode { uid } => (*uid, String::new()),
            EffectArgs::AddEdge { src, dst, .. } => (*src, dst.to_hex()),
            EffectArgs::DelEdge { edge_uid } => (*edge_uid, String::new()),
            EffectArgs::SetAttr { uid, path, .. } | EffectArgs::SetMapKey { uid, path, .. } => {
                (*uid, path.join("."))
            }
        };
        EffectKey {
            op_order: self.op().apply_order(),
            a: a.0,
            b,
        }
    }

    /// Feeds a canonical byte encoding of this effect into `hasher`.
    pub fn hash_into(&self, hasher: &mut Hasher) {
        hasher.update(&[self.op().apply_order()]);
        match &self.args {
            EffectArgs::CreateNode { uid, cls, data } => {
                hasher.update(uid.as_bytes());
                hasher.update(&(cls.len() as u64).to_le_bytes());
                hasher.update(cls.as_bytes());
                encode_value(hasher, data);
            }
            EffectArgs::DeleteNode { uid } => {
                hasher.update(uid.as_bytes());
            }
            EffectArgs::AddEdge {
                src,
                dst,
                kind,
                edge_uid,
            } => {
                hasher.update(src.as_bytes());
                hasher.update(dst.as_bytes());
                hasher.update(kind.name().as_bytes());
                hasher.update(edge_uid.as_bytes());
            }
            EffectArgs::DelEdge { edge_uid } => {
                hasher.update(edge_uid.as_bytes());
            }
            EffectArgs::SetAttr { uid, path, value }
            | EffectArgs::SetMapKey { uid, path, value } => {
                hasher.update(uid.as_bytes());
                hasher.update(&(path.len() as u64).to_le_bytes());
                for seg in path {
                    hasher.update(&(seg.len() as u64).to_le_bytes());
                    hasher.update(seg.as_bytes());
                }
                encode_value(hasher, value);
            }
        }
    }
}

/// Canonical digest of an effect sequence.
#[must_use]
pub fn effects_digest(effects: &[Effect]) -> Hash {
    let mut hasher = Hasher::new();
    hasher.update(b"loom-effects:v1");
    hasher.update(&(effects.len() as u64).to_le_bytes());
    for effect in effects {
        effect.hash_into(&mut hasher);
    }
    hasher.finalize().into()
}

/// Canonicalizes an emitted effect sequence.
///
/// Per-uid collapse rules (uid = node uid or edge uid):
/// - `C…C` keep the last create; `C…D` drop both; `C…D…C` keep the last
///   create.
/// - `D…` (no trailing create) keep the first delete; `D…C` keep the first
///   delete and the last create.
/// - Attribute mutations on items whose final existence is false are
///   dropped; mutations at or before a kept create are dropped; the rest
///   coalesce per `(uid, path)`, last one wins.
///
/// The result is stably sorted by `(op_order, first-two-args)` with the
/// original causal index as the final tiebreaker. Canonicalization is
/// idempotent.
#[must_use]
pub fn canonicalize(effects: &[Effect]) -> Vec<Effect> {
    let mut creates: BTreeMap<Uid, Vec<usize>> = BTreeMap::new();
    let mut deletes: BTreeMap<Uid, Vec<usize>> = BTreeMap::new();
    for (idx, effect) in effects.iter().enumerate() {
        if let Some(uid) = effect.structural_uid() {
            if effect.is_create() {
                creates.entry(uid).or_default().push(idx);
            } else {
                deletes.entry(uid).or_default().push(idx);
            }
        }
    }

    let mut keep_struct: BTreeSet<usize> = BTreeSet::new();
    let mut last_kept_create: BTreeMap<Uid, usize> = BTreeMap::new();
    let mut final_exists: BTreeMap<Uid, bool> = BTreeMap::new();

    let uids: BTreeSet<Uid> = creates.keys().chain(deletes.keys()).copied().collect();
    for uid in uids {
        let c_list: &[usize] = creates.get(&uid).map_or(&[], Vec::as_slice);
        let d_list: &[usize] = deletes.get(&uid).map_or(&[], Vec::as_slice);

        let first_c = c_list.first().copied();
        let first_d = d_list.first().copied();
        let starts_with_delete = match (first_d, first_c) {
            (Some(d), Some(c)) => d < c,
            (Some(_), None) => true,
            _ => false,
        };
        let last_is_create = match (c_list.last(), d_list.last()) {
            (Some(c), Some(d)) => c > d,
            (Some(_), None) => true,
            _ => false,
        };

        if starts_with_delete {
            if let Some(d) = first_d {
                keep_struct.insert(d);
            }
            if last_is_create {
                if let Some(&c) = c_list.last() {
                    keep_struct.insert(c);
                    last_kept_create.insert(uid, c);
                }
                final_exists.insert(uid, true);
            } else {
                final_exists.insert(uid, false);
            }
        } else if last_is_create {
            if let Some(&c) = c_list.last() {
                keep_struct.insert(c);
                last_kept_create.insert(uid, c);
            }
            final_exists.insert(uid, true);
        } else {
            final_exists.insert(uid, false);
        }
    }

    let mut kept: Vec<(usize, &Effect)> = Vec::new();
    let mut attr_last: BTreeMap<(Uid, Vec<String>), usize> = BTreeMap::new();
    for (idx, effect) in effects.iter().enumerate() {
        match &effect.args {
            EffectArgs::SetAttr { uid, path, .. } | EffectArgs::SetMapKey { uid, path, .. } => {
                if final_exists.get(uid) == Some(&false) {
                    continue;
                }
                if last_kept_create.get(uid).is_some_and(|&c| idx <= c) {
                    continue;
                }
                attr_last.insert((*uid, path.clone()), idx);
            }
            _ => {
                if keep_struct.contains(&idx) {
                    kept.push((idx, effect));
                }
            }
        }
    }
    for idx in attr_last.into_values() {
        kept.push((idx, &effects[idx]));
    }

    kept.sort_by(|(ia, ea), (ib, eb)| {
        ea.sort_key()
            .cmp(&eb.sort_key())
            .then_with(|| ia.cmp(ib))
    });
    kept.into_iter().map(|(_, e)| e.clone()).collect()
}

/// Applies one effect to a graph through the silent mutators.
///
/// Structural deletes are idempotent (replaying a delete of a missing item
/// is a no-op); malformed effects are rejected with a reason string.
pub(crate) fn apply_effect(
    graph: &mut Graph,
    effect: &Effect,
    resolver: &Resolver,
) -> Result<(), String> {
    match &effect.args {
        EffectArgs::CreateNode { uid, cls, data } => {
            let data = inject_uid(data, *uid)?;
            match resolver.construct(cls, &data).map_err(|e| e.to_string())? {
                Item::Node(node) => graph.insert_node_silent(node),
                Item::Edge(edge) => {
                    for endpoint in [edge.src_id, edge.dst_id] {
                        if !endpoint.is_nil() && graph.node(&endpoint).is_none() {
                            return Err(format!("edge endpoint {endpoint} does not exist"));
                        }
                    }
                    graph.insert_edge_silent(edge);
                }
            }
            Ok(())
        }
        EffectArgs::DeleteNode { uid } => {
            graph.remove_node_silent(uid);
            Ok(())
        }
        EffectArgs::AddEdge {
            src,
            dst,
            kind,
            edge_uid,
        } => {
            for endpoint in [*src, *dst] {
                if !endpoint.is_nil() && graph.node(&endpoint).is_none() {
                    return Err(format!("edge endpoint {endpoint} does not exist"));
                }
            }
            let edge = Edge::new(Entity::new(*edge_uid), *src, *dst, *kind);
            graph.insert_edge_silent(edge);
            Ok(())
        }
        EffectArgs::DelEdge { edge_uid } => {
            graph.remove_edge_silent(edge_uid);
            Ok(())
        }
        EffectArgs::SetAttr { uid, path, value } | EffectArgs::SetMapKey { uid, path, value } => {
            graph.set_path_silent(uid, path, value.clone())
        }
    }
}

fn inject_uid(data: &Value, uid: Uid) -> Result<Value, String> {
    match data {
        Value::Map(entries) => {
            let mut entries = entries.clone();
            entries.insert("uid".to_owned(), Value::Uid(uid));
            Ok(Value::Map(entries))
        }
        other => Err(format!("item payload expects a map, got {other}")),
    }
}

/// Rebuilds a preview graph: base plus the in-progress effects, applied in
/// emission order for read-your-writes.
pub(crate) fn build_preview(
    base: &Graph,
    effects: &[Effect],
    resolver: &Resolver,
) -> Result<Graph, String> {
    let mut preview = base.clone();
    for effect in effects {
        apply_effect(&mut preview, effect, resolver)?;
    }
    Ok(preview)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::make_uid;

    fn prov() -> Provenance {
        Provenance::new(Phase::Update, "test")
    }

    fn create(uid: Uid) -> Effect {
        Effect {
            args: EffectArgs::CreateNode {
                uid,
                cls: crate::dto::NODE_FQN.to_owned(),
                data: Value::Map(BTreeMap::new()),
            },
            provenance: prov(),
        }
    }

    fn delete(uid: Uid) -> Effect {
        Effect {
            args: EffectArgs::DeleteNode { uid },
            provenance: prov(),
        }
    }

    fn set_local(uid: Uid, key: &str, v: i64) -> Effect {
        Effect {
            args: EffectArgs::SetAttr {
                uid,
                path: vec!["locals".to_owned(), key.to_owned()],
                value: Value::Int(v),
            },
            provenance: prov(),
        }
    }

    #[test]
    fn create_then_delete_cancels_out() {
        let u = make_uid("u");
        let effects = vec![
            create(u),
            set_local(u, "x", 1),
            set_local(u, "x", 2),
            delete(u),
        ];
        assert!(canonicalize(&effects).is_empty());
    }

    #[test]
    fn delete_then_create_nets_to_create_with_final_attributes() {
        let u = make_uid("u");
        let effects = vec![
            delete(u),
            set_local(u, "x", 1),
            create(u),
            set_local(u, "x", 2),
        ];
        let canonical = canonicalize(&effects);
        assert_eq!(canonical.len(), 3);
        assert_eq!(canonical[0].op(), Op::DeleteNode);
        assert_eq!(canonical[1].op(), Op::CreateNode);
        assert_eq!(canonical[2].op(), Op::SetAttr);
        let EffectArgs::SetAttr { value, .. } = &canonical[2].args else {
            unreachable!("attribute write expected after the kept create");
        };
        assert_eq!(value, &Value::Int(2));
    }

    #[test]
    fn repeated_creates_keep_the_last() {
        let u = make_uid("u");
        let effects = vec![create(u), create(u)];
        let canonical = canonicalize(&effects);
        assert_eq!(canonical.len(), 1);
        assert_eq!(canonical[0].op(), Op::CreateNode);
    }

    #[test]
    fn attr_mutations_coalesce_per_path() {
        let u = make_uid("existing");
        let effects = vec![
            set_local(u, "x", 1),
            set_local(u, "y", 5),
            set_local(u, "x", 3),
        ];
        let canonical = canonicalize(&effects);
        assert_eq!(canonical.len(), 2);
        let values: Vec<i64> = canonical
            .iter()
            .filter_map(|e| match &e.args {
                EffectArgs::SetAttr { value, .. } => value.as_int(),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![3, 5]);
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let u = make_uid("u");
        let v = make_uid("v");
        let effects = vec![
            delete(v),
            create(u),
            set_local(u, "x", 1),
            delete(u),
            create(u),
            set_local(u, "x", 4),
        ];
        let once = canonicalize(&effects);
        let twice = canonicalize(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn empty_input_yields_empty_canonical_sequence() {
        assert!(canonicalize(&[]).is_empty());
        assert_eq!(effects_digest(&[]), effects_digest(&[]));
    }
}
