// SPDX-License-Identifier: Apache-2.0
//! Property tests: canonicalization laws and DTO round-trips.

use std::collections::BTreeMap;

use proptest::prelude::*;

use loom_core::{
    canonicalize, make_uid, Edge, EdgeKind, Effect, EffectArgs, Entity, Graph, Node, Patch,
    Phase, Provenance, Resolver, Uid, Value, NODE_FQN,
};

const UIDS: [&str; 3] = ["u0", "u1", "u2"];
const KEYS: [&str; 2] = ["k0", "k1"];

fn pool_uid(idx: usize) -> Uid {
    make_uid(UIDS[idx % UIDS.len()])
}

/// Per-uid role within one generated sequence.
///
/// A uid either only gets created, only gets deleted (attribute writes on
/// it collapse away), or only gets attribute writes. Mixing creates with
/// attribute writes (or with deletes) makes emission order semantically
/// significant — the attr-before-create truncation rule and the
/// first-delete/last-create rules — so commutativity is only claimed for
/// sequences without such mixes.
#[derive(Clone, Copy, Debug)]
enum UidRole {
    CreateOnly,
    DeleteAndAttrs,
    AttrsOnly,
}

fn role_from(raw: u8) -> UidRole {
    match raw % 3 {
        0 => UidRole::CreateOnly,
        1 => UidRole::DeleteAndAttrs,
        _ => UidRole::AttrsOnly,
    }
}

fn effect_for(roles: [UidRole; 3], uid_idx: usize, op: u8, key_idx: usize) -> Effect {
    let uid_idx = uid_idx % UIDS.len();
    let uid = pool_uid(uid_idx);
    let provenance = Provenance::new(Phase::Update, "prop");
    let structural = op == 0;
    let args = match (roles[uid_idx], structural) {
        (UidRole::CreateOnly, _) => {
            let mut data = BTreeMap::new();
            data.insert("label".to_owned(), Value::from(format!("fresh-{uid_idx}")));
            EffectArgs::CreateNode {
                uid,
                cls: NODE_FQN.to_owned(),
                data: Value::Map(data),
            }
        }
        (UidRole::DeleteAndAttrs, true) => EffectArgs::DeleteNode { uid },
        (UidRole::DeleteAndAttrs | UidRole::AttrsOnly, _) => {
            // Values derive from the target so duplicate writes are
            // byte-identical and order-insensitive.
            const VALUES: [[i64; 2]; 3] = [[0, 1], [10, 11], [20, 21]];
            let key = KEYS[key_idx % KEYS.len()];
            EffectArgs::SetAttr {
                uid,
                path: vec!["locals".to_owned(), key.to_owned()],
                value: Value::Int(VALUES[uid_idx][key_idx % KEYS.len()]),
            }
        }
    };
    Effect { args, provenance }
}

fn effect_seq() -> impl Strategy<Value = Vec<Effect>> {
    (
        (0u8..3, 0u8..3, 0u8..3),
        prop::collection::vec((0usize..3, 0u8..3, 0usize..2), 0..20),
    )
        .prop_map(|((r0, r1, r2), raw)| {
            let roles = [role_from(r0), role_from(r1), role_from(r2)];
            raw.into_iter()
                .map(|(uid_idx, op, key_idx)| effect_for(roles, uid_idx, op, key_idx))
                .collect::<Vec<Effect>>()
        })
}

fn base_graph() -> Graph {
    let mut g = Graph::new();
    for label in UIDS {
        g.insert_node(Node::new(Entity::labeled(make_uid(label), label)))
            .expect("node");
    }
    g
}

fn apply_canonical(effects: &[Effect]) -> Graph {
    let mut g = base_graph();
    let patch = Patch::new(
        make_uid("prop-tick"),
        None,
        0,
        None,
        effects,
        Vec::new(),
        Vec::new(),
    );
    patch
        .apply(&mut g, &Resolver::with_builtins())
        .expect("apply");
    g
}

proptest! {
    #[test]
    fn canonicalization_is_idempotent(effects in effect_seq()) {
        let once = canonicalize(&effects);
        let twice = canonicalize(&once);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn permuting_emission_order_yields_the_same_applied_graph(
        (effects, shuffled) in effect_seq().prop_flat_map(|e| {
            let shuffled = Just(e.clone()).prop_shuffle();
            (Just(e), shuffled)
        })
    ) {
        let a = apply_canonical(&effects);
        let b = apply_canonical(&shuffled);
        prop_assert_eq!(a.to_dto(), b.to_dto());
        prop_assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn canonical_sequences_never_grow(effects in effect_seq()) {
        prop_assert!(canonicalize(&effects).len() <= effects.len());
    }
}

fn small_graph() -> impl Strategy<Value = Graph> {
    (
        prop::collection::vec(any::<bool>(), 4..8),
        prop::collection::vec((0usize..8, 0usize..8, 0usize..3), 0..10),
    )
        .prop_map(|(keep, raw_edges)| {
            let mut g = Graph::new();
            let mut present = Vec::new();
            for (i, keep) in keep.iter().enumerate() {
                if !*keep {
                    continue;
                }
                let label = format!("n{i}");
                let idx = i64::try_from(i).unwrap_or(0);
                let node = Node::new(Entity::labeled(make_uid(&label), &label))
                    .with_local("idx", Value::Int(idx));
                present.push(node.uid());
                g.insert_node(node).expect("node");
            }
            let kinds = [EdgeKind::Choice, EdgeKind::Hierarchy, EdgeKind::Association];
            for (i, (src, dst, kind)) in raw_edges.into_iter().enumerate() {
                if present.is_empty() {
                    break;
                }
                let src = present[src % present.len()];
                let dst = present[dst % present.len()];
                let label = format!("e{i}");
                let edge = Edge::new(
                    Entity::labeled(make_uid(&label), &label),
                    src,
                    dst,
                    kinds[kind % kinds.len()],
                );
                g.insert_edge(edge).expect("edge");
            }
            g
        })
}

proptest! {
    #[test]
    fn graph_dto_round_trips(g in small_graph()) {
        let dto = g.to_dto();
        let back = Graph::from_dto(&dto, &Resolver::with_builtins()).expect("decode");
        prop_assert_eq!(&back, &g);
        prop_assert_eq!(back.state_hash(), g.state_hash());
    }
}
