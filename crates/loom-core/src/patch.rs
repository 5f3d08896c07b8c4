// SPDX-License-Identifier: Apache-2.0
//! Patches and the snapshot + patch log.
//!
//! A patch is the atomic, durable boundary artifact of one tick: the
//! canonicalized effects, the journal, and the io transcript, pinned to
//! the tick's RNG seed. Applying a patch walks the canonical effects
//! through the graph's silent mutators; application is all-or-nothing.
//!
//! The log is append-only. Full snapshots (graph DTOs) are taken every
//! `snapshot_cadence` patches to bound replay cost; replay loads the
//! nearest snapshot at or before the target version and applies the
//! patches after it in order.

use std::collections::BTreeMap;

use blake3::Hasher;
use thiserror::Error;
use tracing::debug;

use crate::dto::{GraphDto, Resolver};
use crate::effect::{canonicalize, effects_digest, Effect};
use crate::errors::{PatchError, ReplayError};
use crate::frame::IoRecord;
use crate::graph::Graph;
use crate::ident::{Hash, Uid};
use crate::journal::Fragment;

/// An atomic, durable set of effects produced by one tick.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Patch {
    /// Tick identity.
    pub tick_id: Uid,
    /// Previous patch in the log, when any.
    pub parent_patch_id: Option<Uid>,
    /// Seed of the tick RNG, for replay of uid allocation.
    pub rng_seed: u64,
    /// State hash of the graph the patch was produced against; verified at
    /// apply time when present.
    pub base_hash: Option<Hash>,
    /// Canonicalized effects.
    pub effects: Vec<Effect>,
    /// Journal fragments of the tick.
    pub journal: Vec<Fragment>,
    /// External I/O transcript of the tick.
    pub io: Vec<IoRecord>,
}

impl Patch {
    /// Builds a patch, canonicalizing the effect sequence.
    #[must_use]
    pub fn new(
        tick_id: Uid,
        parent_patch_id: Option<Uid>,
        rng_seed: u64,
        base_hash: Option<Hash>,
        effects: &[Effect],
        journal: Vec<Fragment>,
        io: Vec<IoRecord>,
    ) -> Self {
        Self {
            tick_id,
            parent_patch_id,
            rng_seed,
            base_hash,
            effects: canonicalize(effects),
            journal,
            io,
        }
    }

    /// Returns `true` when the patch carries no effects.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Canonical digest of the patch contents.
    #[must_use]
    pub fn digest(&self) -> Hash {
        let mut hasher = Hasher::new();
        hasher.update(b"loom-patch:v1");
        hasher.update(self.tick_id.as_bytes());
        match &self.parent_patch_id {
            Some(parent) => hasher.update(parent.as_bytes()),
            None => hasher.update(&[0u8; 16]),
        };
        hasher.update(&self.rng_seed.to_le_bytes());
        hasher.update(&effects_digest(&self.effects));
        hasher.finalize().into()
    }

    /// Applies the patch to `graph` through the silent mutators.
    ///
    /// Application is all-or-nothing: on failure the graph is unchanged
    /// and the log must not advance.
    pub fn apply(&self, graph: &mut Graph, resolver: &Resolver) -> Result<(), PatchError> {
        if let Some(expected) = self.base_hash {
            let found = graph.state_hash();
            if expected != found {
                return Err(PatchError::BaseMismatch {
                    expected: hex::encode(expected),
                    found: hex::encode(found),
                });
            }
        }
        let mut next = graph.clone();
        for (index, effect) in self.effects.iter().enumerate() {
            crate::effect::apply_effect(&mut next, effect, resolver).map_err(|reason| {
                PatchError::ApplyFailed {
                    effect_index: index,
                    reason,
                }
            })?;
        }
        *graph = next;
        Ok(())
    }
}

/// Errors produced while persisting or loading a log.
#[derive(Debug, Error)]
pub enum LogIoError {
    /// Serialization failed.
    #[error("encode failed: {0}")]
    Encode(String),
    /// Deserialization failed.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Append-only patch log with interleaved snapshots.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PatchLog {
    snapshots: BTreeMap<u64, GraphDto>,
    patches: Vec<Patch>,
    cadence: usize,
}

impl PatchLog {
    /// Creates a log whose version 0 snapshot is `initial`.
    #[must_use]
    pub fn new(cadence: usize, initial: &Graph) -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(0, initial.to_dto());
        Self {
            snapshots,
            patches: Vec::new(),
            cadence: cadence.max(1),
        }
    }

    /// Number of recorded patches; also the current version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.patches.len() as u64
    }

    /// Recorded patches in append order.
    #[must_use]
    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    /// Versions at which snapshots were taken.
    pub fn snapshot_versions(&self) -> impl Iterator<Item = u64> + '_ {
        self.snapshots.keys().copied()
    }

    /// Appends a patch; `graph_after` is the surface graph after apply,
    /// snapshotted when the cadence strikes.
    pub fn append(&mut self, patch: Patch, graph_after: &Graph) {
        self.patches.push(patch);
        let version = self.version();
        if version % (self.cadence as u64) == 0 {
            debug!(version, "patch log: taking snapshot");
            self.snapshots.insert(version, graph_after.to_dto());
        }
    }

    /// Replays to `version`: nearest snapshot at or before it, plus the
    /// patches after it, in order.
    pub fn replay_to(&self, version: u64, resolver: &Resolver) -> Result<Graph, ReplayError> {
        if version > self.version() {
            return Err(ReplayError::VersionOutOfRange {
                version,
                len: self.version(),
            });
        }
        let (snap_version, dto) = self
            .snapshots
            .range(..=version)
            .next_back()
            .ok_or(ReplayError::MissingSnapshot { version })?;
        let mut graph = Graph::from_dto(dto, resolver)?;
        for (offset, patch) in self.patches.iter().enumerate() {
            let v = offset as u64;
            if v < *snap_version {
                continue;
            }
            if v >= version {
                break;
            }
            patch
                .apply(&mut graph, resolver)
                .map_err(|source| ReplayError::Patch { version: v, source })?;
        }
        Ok(graph)
    }

    /// Replays the full log.
    pub fn replay_all(&self, resolver: &Resolver) -> Result<Graph, ReplayError> {
        self.replay_to(self.version(), resolver)
    }

    /// Serializes the log as deterministic CBOR.
    pub fn save<W: std::io::Write>(&self, writer: W) -> Result<(), LogIoError> {
        ciborium::ser::into_writer(self, writer).map_err(|e| LogIoError::Encode(e.to_string()))
    }

    /// Loads a log from CBOR.
    pub fn load<R: std::io::Read>(reader: R) -> Result<Self, LogIoError> {
        ciborium::de::from_reader(reader).map_err(|e| LogIoError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::{EffectArgs, Provenance};
    use crate::entity::Entity;
    use crate::graph::Node;
    use crate::ident::{make_uid, Uid};
    use crate::phase::Phase;
    use crate::value::Value;

    fn base_graph() -> Graph {
        let mut g = Graph::new();
        g.insert_node(Node::new(Entity::labeled(make_uid("root"), "root")))
            .expect("root");
        g
    }

    fn set_effect(uid: Uid, key: &str, v: i64) -> Effect {
        Effect {
            args: EffectArgs::SetAttr {
                uid,
                path: vec!["locals".to_owned(), key.to_owned()],
                value: Value::Int(v),
            },
            provenance: Provenance::new(Phase::Update, "test"),
        }
    }

    #[test]
    fn empty_patch_apply_is_a_noop() {
        let mut g = base_graph();
        let before = g.state_hash();
        let patch = Patch::new(make_uid("t0"), None, 1, Some(before), &[], Vec::new(), Vec::new());
        assert!(patch.is_empty());
        patch
            .apply(&mut g, &Resolver::with_builtins())
            .expect("apply");
        assert_eq!(g.state_hash(), before);
    }

    #[test]
    fn base_mismatch_is_rejected_and_graph_unchanged() {
        let mut g = base_graph();
        let before = g.state_hash();
        let patch = Patch::new(
            make_uid("t0"),
            None,
            1,
            Some([9u8; 32]),
            &[set_effect(make_uid("root"), "x", 1)],
            Vec::new(),
            Vec::new(),
        );
        let err = patch.apply(&mut g, &Resolver::with_builtins());
        assert!(matches!(err, Err(PatchError::BaseMismatch { .. })));
        assert_eq!(g.state_hash(), before);
    }

    #[test]
    fn failed_apply_leaves_the_graph_untouched() {
        let mut g = base_graph();
        let before = g.state_hash();
        let patch = Patch::new(
            make_uid("t0"),
            None,
            1,
            None,
            &[
                set_effect(make_uid("root"), "x", 1),
                set_effect(make_uid("ghost"), "x", 1),
            ],
            Vec::new(),
            Vec::new(),
        );
        let err = patch.apply(&mut g, &Resolver::with_builtins());
        assert!(matches!(err, Err(PatchError::ApplyFailed { .. })));
        assert_eq!(g.state_hash(), before);
    }

    #[test]
    fn log_replay_matches_in_memory_application() {
        let resolver = Resolver::with_builtins();
        let mut g = base_graph();
        let mut log = PatchLog::new(2, &g);
        let root = make_uid("root");

        for (i, v) in [3i64, 5, 8].iter().enumerate() {
            let patch = Patch::new(
                make_uid(&format!("t{i}")),
                None,
                i as u64,
                Some(g.state_hash()),
                &[set_effect(root, "x", *v)],
                Vec::new(),
                Vec::new(),
            );
            patch.apply(&mut g, &resolver).expect("apply");
            log.append(patch, &g);
        }

        assert_eq!(log.version(), 3);
        let snapshot_versions: Vec<u64> = log.snapshot_versions().collect();
        assert_eq!(snapshot_versions, vec![0, 2]);

        let replayed = log.replay_all(&resolver).expect("replay");
        assert_eq!(replayed.to_dto(), g.to_dto());

        let midway = log.replay_to(2, &resolver).expect("replay to 2");
        let hit = midway.node(&root).expect("root");
        assert_eq!(hit.locals.get("x"), Some(&Value::Int(5)));
    }

    #[test]
    fn log_round_trips_through_cbor() {
        let resolver = Resolver::with_builtins();
        let mut g = base_graph();
        let mut log = PatchLog::new(10, &g);
        let patch = Patch::new(
            make_uid("t0"),
            None,
            7,
            Some(g.state_hash()),
            &[set_effect(make_uid("root"), "x", 1)],
            Vec::new(),
            Vec::new(),
        );
        patch.apply(&mut g, &resolver).expect("apply");
        log.append(patch, &g);

        let mut bytes = Vec::new();
        log.save(&mut bytes).expect("save");
        let loaded = PatchLog::load(bytes.as_slice()).expect("load");
        assert_eq!(loaded, log);
        assert_eq!(
            loaded.replay_all(&resolver).expect("replay").to_dto(),
            g.to_dto()
        );
    }
}
