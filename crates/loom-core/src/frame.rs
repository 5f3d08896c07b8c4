// SPDX-License-Identifier: Apache-2.0
//! Per-tick execution state.
//!
//! The frame is the tick's scoped resource: the effect buffer, receipt
//! list, journal, io transcript, and RNG are all bound to it and released
//! together when the tick ends, on success and on every error path alike.

use crate::effect::{Effect, EffectArgs, Provenance};
use crate::errors::EffectError;
use crate::graph::EdgeKind;
use crate::handler::{CallReceipt, HandlerId, HandlerOut, Service};
use crate::ident::Uid;
use crate::journal::{Fragment, FragmentType};
use crate::phase::Phase;
use crate::rng::TickRng;
use crate::value::Value;

/// Deterministic transcript entry for external I/O injected into a tick.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IoRecord {
    /// Kind of external interaction (e.g. `llm`, `media`).
    pub kind: String,
    /// Cache/lookup key.
    pub key: String,
    /// Recorded payload.
    pub payload: Value,
}

/// VM execution state for one tick.
#[derive(Debug)]
pub struct Frame {
    /// Node the tick is anchored on.
    pub cursor_uid: Uid,
    /// Monotonic tick counter.
    pub step: u64,
    /// Cursor positions visited during this tick (prereq restarts).
    pub cursor_history: Vec<Uid>,
    /// The choice edge the caller selected, when any.
    pub selected_edge: Option<Uid>,
    /// Receipts of every handler invocation this tick.
    pub call_receipts: Vec<CallReceipt>,
    /// Cursor handoff requested by a POSTREQS redirect.
    pub next_cursor_uid: Option<Uid>,
    /// External I/O transcript for this tick.
    pub io: Vec<IoRecord>,
    seed: u64,
    rng: TickRng,
    effects: Vec<Effect>,
    journal: Vec<Fragment>,
    max_effects: usize,
    current_phase: Phase,
    current_handler: String,
    receipt_seq: u32,
    pub(crate) ns_stack: Vec<Uid>,
}

impl Frame {
    /// Creates a frame for one tick.
    #[must_use]
    pub fn new(cursor_uid: Uid, step: u64, seed: u64, max_effects: usize) -> Self {
        Self {
            cursor_uid,
            step,
            cursor_history: vec![cursor_uid],
            selected_edge: None,
            call_receipts: Vec::new(),
            next_cursor_uid: None,
            io: Vec::new(),
            seed,
            rng: TickRng::from_seed_u64(seed),
            effects: Vec::new(),
            journal: Vec::new(),
            max_effects,
            current_phase: Phase::Validate,
            current_handler: String::new(),
            receipt_seq: 0,
            ns_stack: Vec::new(),
        }
    }

    /// The tick's RNG seed, persisted into the patch.
    #[must_use]
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Allocates a fresh id from the tick RNG (two 64-bit draws).
    pub fn allocate_uid(&mut self) -> Uid {
        self.rng.next_uid()
    }

    /// Effects emitted so far, in emission order.
    #[must_use]
    pub fn effects(&self) -> &[Effect] {
        &self.effects
    }

    /// The coerced journal for this tick.
    #[must_use]
    pub fn journal(&self) -> &[Fragment] {
        &self.journal
    }

    pub(crate) fn set_journal(&mut self, fragments: Vec<Fragment>) {
        self.journal = fragments;
    }

    pub(crate) fn set_current(&mut self, phase: Phase, handler: &str) {
        self.current_phase = phase;
        self.current_handler = handler.to_owned();
    }

    /// Phase currently dispatching.
    #[must_use]
    pub fn current_phase(&self) -> Phase {
        self.current_phase
    }

    fn provenance(&self) -> Provenance {
        Provenance {
            phase: self.current_phase,
            handler: self.current_handler.clone(),
        }
    }

    fn emit(&mut self, args: EffectArgs) -> Result<(), EffectError> {
        if self.effects.len() >= self.max_effects {
            return Err(EffectError::LimitExceeded {
                limit: self.max_effects,
            });
        }
        let provenance = self.provenance();
        self.effects.push(Effect { args, provenance });
        Ok(())
    }

    /// Emits a node creation; returns the allocated id.
    pub fn create_node(&mut self, cls: &str, data: Value) -> Result<Uid, EffectError> {
        let uid = self.allocate_uid();
        self.emit(EffectArgs::CreateNode {
            uid,
            cls: cls.to_owned(),
            data,
        })?;
        Ok(uid)
    }

    /// Emits a node deletion.
    pub fn delete_node(&mut self, uid: Uid) -> Result<(), EffectError> {
        self.emit(EffectArgs::DeleteNode { uid })
    }

    /// Emits a structural edge creation; returns the allocated edge id.
    pub fn add_edge(&mut self, src: Uid, dst: Uid, kind: EdgeKind) -> Result<Uid, EffectError> {
        let edge_uid = self.allocate_uid();
        self.emit(EffectArgs::AddEdge {
            src,
            dst,
            kind,
            edge_uid,
        })?;
        Ok(edge_uid)
    }

    /// Emits an edge deletion.
    pub fn del_edge(&mut self, edge_uid: Uid) -> Result<(), EffectError> {
        self.emit(EffectArgs::DelEdge { edge_uid })
    }

    /// Emits an attribute write at a dotted path.
    pub fn set_attr(
        &mut self,
        uid: Uid,
        path: Vec<String>,
        value: Value,
    ) -> Result<(), EffectError> {
        self.emit(EffectArgs::SetAttr { uid, path, value })
    }

    /// Emits a map-key write at a dotted path.
    pub fn set_mapkey(
        &mut self,
        uid: Uid,
        path: Vec<String>,
        value: Value,
    ) -> Result<(), EffectError> {
        self.emit(EffectArgs::SetMapKey { uid, path, value })
    }

    /// Allocates a fragment with an id from the tick RNG.
    pub fn fragment(&mut self, fragment_type: FragmentType, content: &str) -> Fragment {
        Fragment::new(self.allocate_uid(), fragment_type, content)
    }

    /// Records an external I/O transcript entry.
    pub fn record_io(&mut self, record: IoRecord) {
        self.io.push(record);
    }

    pub(crate) fn push_receipt(
        &mut self,
        handler_id: HandlerId,
        handler_name: &str,
        service: Service,
        result: HandlerOut,
    ) {
        let seq = self.receipt_seq;
        self.receipt_seq += 1;
        self.call_receipts.push(CallReceipt {
            handler_id,
            handler_name: handler_name.to_owned(),
            service,
            seq,
            result,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::effect::Op;
    use crate::ident::make_uid;

    #[test]
    fn effect_budget_is_enforced() {
        let mut frame = Frame::new(make_uid("cursor"), 0, 1, 2);
        assert!(frame.delete_node(make_uid("a")).is_ok());
        assert!(frame.delete_node(make_uid("b")).is_ok());
        assert_eq!(
            frame.delete_node(make_uid("c")),
            Err(EffectError::LimitExceeded { limit: 2 })
        );
        assert_eq!(frame.effects().len(), 2);
    }

    #[test]
    fn emitted_effects_carry_provenance() {
        let mut frame = Frame::new(make_uid("cursor"), 0, 1, 16);
        frame.set_current(Phase::Update, "update_entry_effects");
        frame
            .set_attr(
                make_uid("n"),
                vec!["locals".to_owned(), "hp".to_owned()],
                Value::Int(3),
            )
            .expect("emit");
        let effect = &frame.effects()[0];
        assert_eq!(effect.op(), Op::SetAttr);
        assert_eq!(effect.provenance.phase, Phase::Update);
        assert_eq!(effect.provenance.handler, "update_entry_effects");
    }

    #[test]
    fn uid_allocation_is_replayable_from_the_seed() {
        let mut a = Frame::new(make_uid("cursor"), 0, 99, 16);
        let mut b = Frame::new(make_uid("cursor"), 0, 99, 16);
        assert_eq!(a.allocate_uid(), b.allocate_uid());
        assert!(a
            .create_node(crate::dto::NODE_FQN, Value::Map(BTreeMap::new()))
            .is_ok());
        assert!(b
            .create_node(crate::dto::NODE_FQN, Value::Map(BTreeMap::new()))
            .is_ok());
        assert_eq!(a.effects(), b.effects());
    }
}
