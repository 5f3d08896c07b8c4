// SPDX-License-Identifier: Apache-2.0
//! The driver: outer loop around the VM.
//!
//! `step` runs one tick, commits the canonical patch, applies it to the
//! surface graph, appends it to the log, and follows POSTREQS handoffs
//! until no redirect is produced, the auto-traversal bound is hit, or a
//! fatal error occurs. A failed tick discards its effect buffer and the
//! log receives nothing — snapshot and version are unchanged; the failure
//! surfaces only in the step result, as a typed error plus an `error`
//! journal fragment.

use rustc_hash::FxHashSet;
use tracing::{debug, warn};

use crate::errors::{DriverError, TickError};
use crate::frame::{Frame, IoRecord};
use crate::graph::Graph;
use crate::ident::Uid;
use crate::journal::Fragment;
use crate::patch::{Patch, PatchLog};
use crate::rng::tick_seed;
use crate::vm::{ChoiceInfo, Vm};

/// Result of one driver step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickResult {
    /// Id of the last committed patch; `None` when the tick failed.
    pub patch_id: Option<Uid>,
    /// Journal of the step (all ticks of an auto-traversal chain).
    pub journal: Vec<Fragment>,
    /// The tick error, when the step failed.
    pub error: Option<TickError>,
}

/// Why `run_until_blocked` stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunReason {
    /// Enabled choices await the caller.
    Blocked,
    /// Dead end: no choices and no auto-traversal.
    NoChoice,
    /// A cursor/choice signature repeated, or the traversal bound was hit.
    Loop,
    /// The step budget ran out.
    MaxSteps,
}

/// Result of `run_until_blocked`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunResult {
    /// Patch ids committed during the run.
    pub patches: Vec<Uid>,
    /// Stop reason.
    pub reason: RunReason,
}

/// Owns the VM, the surface graph, and the patch log for one story.
#[derive(Debug)]
pub struct Driver {
    vm: Vm,
    graph: Graph,
    log: PatchLog,
    story_id: Uid,
    cursor_uid: Uid,
    step: u64,
    last_patch_id: Option<Uid>,
    pending_io: Vec<IoRecord>,
}

impl Driver {
    /// Creates a driver positioned at `cursor_uid`.
    pub fn new(vm: Vm, graph: Graph, story_id: Uid, cursor_uid: Uid) -> Result<Self, DriverError> {
        graph
            .verify_invariants()
            .map_err(|e| DriverError::InvariantViolation {
                what: e.to_string(),
            })?;
        if graph.node(&cursor_uid).is_none() {
            return Err(DriverError::InvariantViolation {
                what: format!("initial cursor {cursor_uid} is not a node"),
            });
        }
        let log = PatchLog::new(vm.config().snapshot_cadence, &graph);
        Ok(Self {
            vm,
            graph,
            log,
            story_id,
            cursor_uid,
            step: 0,
            last_patch_id: None,
            pending_io: Vec::new(),
        })
    }

    /// The surface graph.
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The patch log.
    #[must_use]
    pub fn log(&self) -> &PatchLog {
        &self.log
    }

    /// The VM.
    #[must_use]
    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    /// Mutable access to the VM (handler/template registration).
    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Current cursor position.
    #[must_use]
    pub fn cursor_uid(&self) -> Uid {
        self.cursor_uid
    }

    /// Monotonic tick counter.
    #[must_use]
    pub fn current_step(&self) -> u64 {
        self.step
    }

    /// Queues external I/O results for the next tick's transcript.
    pub fn inject_io(&mut self, records: Vec<IoRecord>) {
        self.pending_io.extend(records);
    }

    /// Enabled choices at the current cursor.
    pub fn get_choices(&self) -> Result<Vec<ChoiceInfo>, DriverError> {
        self.vm
            .get_choices(&self.graph, self.cursor_uid)
            .map_err(|e| DriverError::InvariantViolation {
                what: e.to_string(),
            })
    }

    /// Runs one step: a tick at the current cursor plus any POSTREQS
    /// auto-traversal chain. The selected choice must be enabled.
    pub fn step(&mut self, choice: Option<Uid>) -> Result<TickResult, DriverError> {
        if let Some(edge_uid) = choice {
            let enabled = self.get_choices()?;
            if !enabled.iter().any(|c| c.edge_uid == edge_uid) {
                return Err(DriverError::InvalidChoice(edge_uid));
            }
        }

        let bound = self.vm.config().auto_traversal_bound;
        let mut journal = Vec::new();
        let mut selected = choice;
        let mut hops = 0usize;
        let mut last_patch = None;

        loop {
            let base_hash = self.graph.state_hash();
            let seed = tick_seed(&self.story_id, self.step, selected.as_ref(), &base_hash);
            let mut frame = Frame::new(
                self.cursor_uid,
                self.step,
                seed,
                self.vm.config().max_effects_per_tick,
            );
            frame.selected_edge = selected;
            frame.io = std::mem::take(&mut self.pending_io);

            match self.vm.run_tick(&self.graph, &mut frame, hops) {
                Ok(new_hops) => {
                    hops = new_hops;
                    let tick_id = frame.allocate_uid();
                    let patch = Patch::new(
                        tick_id,
                        self.last_patch_id,
                        seed,
                        Some(base_hash),
                        frame.effects(),
                        frame.journal().to_vec(),
                        frame.io.clone(),
                    );
                    patch.apply(&mut self.graph, self.vm.resolver())?;
                    self.graph
                        .verify_invariants()
                        .map_err(|e| DriverError::InvariantViolation {
                            what: e.to_string(),
                        })?;
                    self.log.append(patch, &self.graph);
                    self.last_patch_id = Some(tick_id);
                    self.step += 1;
                    journal.extend(frame.journal().iter().cloned());
                    last_patch = Some(tick_id);
                    debug!(step = self.step, patch = %tick_id, "tick committed");

                    // Adopt in-tick PREREQS movement, then the selected
                    // choice, then any POSTREQS handoff.
                    self.cursor_uid = frame.cursor_uid;
                    if let Some(edge_uid) = frame.selected_edge {
                        if let Some(dst) = self
                            .graph
                            .edge(&edge_uid)
                            .and_then(|e| e.destination())
                            .filter(|dst| self.graph.node(dst).is_some())
                        {
                            self.cursor_uid = dst;
                        }
                    }

                    if let Some(next) = frame.next_cursor_uid {
                        if self.graph.node(&next).is_none() {
                            warn!(next = %next, "postreq handoff to missing node ignored");
                            return Ok(TickResult {
                                patch_id: last_patch,
                                journal,
                                error: None,
                            });
                        }
                        self.cursor_uid = next;
                        hops += 1;
                        if hops > bound {
                            return Ok(TickResult {
                                patch_id: last_patch,
                                journal,
                                error: Some(TickError::AutoTraversalExceeded {
                                    chain_length: hops,
                                }),
                            });
                        }
                        selected = None;
                        continue;
                    }

                    return Ok(TickResult {
                        patch_id: last_patch,
                        journal,
                        error: None,
                    });
                }
                Err(TickError::InvariantViolation { what }) => {
                    return Err(DriverError::InvariantViolation { what });
                }
                Err(err) => {
                    // The effect buffer is discarded and the log receives
                    // nothing; the failure travels only in the result.
                    let fragment =
                        Fragment::error(frame.allocate_uid(), err.code(), &err.to_string());
                    journal.push(fragment);
                    warn!(step = self.step, error = %err, "tick discarded");
                    return Ok(TickResult {
                        patch_id: None,
                        journal,
                        error: Some(err),
                    });
                }
            }
        }
    }

    /// Advances without caller input until enabled choices appear, a dead
    /// end or loop is hit, or the step budget runs out.
    ///
    /// Loop detection keys on `(cursor, enabled choice ids)`.
    pub fn run_until_blocked(&mut self, max_steps: usize) -> Result<RunResult, DriverError> {
        let mut patches = Vec::new();
        let mut seen: FxHashSet<(Uid, Vec<Uid>)> = FxHashSet::default();

        for _ in 0..max_steps {
            let choices = self.get_choices()?;
            let mut signature: Vec<Uid> = choices.iter().map(|c| c.edge_uid).collect();
            signature.sort_unstable();
            if !seen.insert((self.cursor_uid, signature)) {
                return Ok(RunResult {
                    patches,
                    reason: RunReason::Loop,
                });
            }
            if !choices.is_empty() {
                return Ok(RunResult {
                    patches,
                    reason: RunReason::Blocked,
                });
            }

            let before = self.cursor_uid;
            let result = self.step(None)?;
            if let Some(patch_id) = result.patch_id {
                patches.push(patch_id);
            }
            match result.error {
                Some(TickError::AutoTraversalExceeded { .. }) => {
                    return Ok(RunResult {
                        patches,
                        reason: RunReason::Loop,
                    });
                }
                Some(_) => {}
                None => {
                    if self.cursor_uid == before {
                        let now_enabled = self.get_choices()?;
                        if now_enabled.is_empty() {
                            return Ok(RunResult {
                                patches,
                                reason: RunReason::NoChoice,
                            });
                        }
                    }
                }
            }
        }
        Ok(RunResult {
            patches,
            reason: RunReason::MaxSteps,
        })
    }
}
