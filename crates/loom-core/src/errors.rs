// SPDX-License-Identifier: Apache-2.0
//! Typed error surface of the runtime.
//!
//! Tick-level failures never corrupt state: the effect buffer of a failed
//! tick is discarded and the surface graph and log version are unchanged.

use thiserror::Error;

use crate::ident::Uid;
use crate::phase::Phase;

/// Errors that abort or poison a single tick.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TickError {
    /// A VALIDATE handler returned false; the tick is discarded.
    #[error("validation failed: {reasons:?}")]
    ValidationFailed {
        /// Names of the handlers that vetoed the tick.
        reasons: Vec<String>,
    },
    /// A handler failed unexpectedly; the tick is discarded and the
    /// failure is surfaced through the step result.
    #[error("handler fault in {phase} ({handler}): {kind}")]
    HandlerFault {
        /// Phase that was dispatching when the fault occurred.
        phase: Phase,
        /// Name of the faulting handler.
        handler: String,
        /// Machine-readable fault kind.
        kind: String,
    },
    /// The auto-traversal chain bound was exceeded.
    #[error("auto-traversal bound exceeded after {chain_length} hops")]
    AutoTraversalExceeded {
        /// Number of cursor handoffs attempted.
        chain_length: usize,
    },
    /// A structural graph invariant no longer holds. Unrecoverable; callers
    /// should stop the session and surface the diagnostic.
    #[error("graph invariant violated: {what}")]
    InvariantViolation {
        /// Description of the broken invariant.
        what: String,
    },
}

impl TickError {
    /// Stable machine-readable code surfaced in error journal fragments.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::ValidationFailed { .. } => "validation_failed",
            Self::HandlerFault { .. } => "handler_fault",
            Self::AutoTraversalExceeded { .. } => "auto_traversal_exceeded",
            Self::InvariantViolation { .. } => "invariant_violation",
        }
    }
}

/// Failure raised by a handler body; dispatch maps it to
/// [`TickError::HandlerFault`] with phase and handler attribution.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}")]
pub struct HandlerError {
    /// Machine-readable fault kind.
    pub kind: String,
}

impl HandlerError {
    /// Creates a fault with the given kind string.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

impl From<EvalError> for HandlerError {
    fn from(err: EvalError) -> Self {
        Self::new(format!("eval: {err}"))
    }
}

impl From<EffectError> for HandlerError {
    fn from(err: EffectError) -> Self {
        Self::new(format!("effect: {err}"))
    }
}

/// Errors produced while emitting effects through the frame API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EffectError {
    /// The per-tick effect budget was exhausted.
    #[error("effect budget exceeded: {limit} effects per tick")]
    LimitExceeded {
        /// Configured maximum effect count.
        limit: usize,
    },
}

/// Errors produced while applying a patch to the surface graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PatchError {
    /// An effect was rejected at apply time; the log does not advance.
    #[error("patch apply failed at effect {effect_index}: {reason}")]
    ApplyFailed {
        /// Index of the offending effect in the canonical sequence.
        effect_index: usize,
        /// Human-readable rejection reason.
        reason: String,
    },
    /// Patch names a base state that does not match the target graph.
    #[error("patch base mismatch: expected {expected}, found {found}")]
    BaseMismatch {
        /// Hex of the recorded base state hash.
        expected: String,
        /// Hex of the actual graph state hash.
        found: String,
    },
}

/// Errors produced during snapshot/log replay.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplayError {
    /// The requested version is beyond the recorded history.
    #[error("version {version} exceeds log length {len}")]
    VersionOutOfRange {
        /// Requested version.
        version: u64,
        /// Number of recorded patches.
        len: u64,
    },
    /// No snapshot at or before the requested version.
    #[error("no snapshot at or before version {version}")]
    MissingSnapshot {
        /// Requested version.
        version: u64,
    },
    /// Snapshot decoding failed.
    #[error("snapshot decode failed: {0}")]
    Dto(#[from] DtoError),
    /// A recorded patch failed to apply.
    #[error("patch {version} failed to apply: {source}")]
    Patch {
        /// Version of the failing patch.
        version: u64,
        /// Underlying apply failure.
        #[source]
        source: PatchError,
    },
}

/// Errors produced while building graphs by hand (world setup) or
/// verifying their structural invariants.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphError {
    /// Item uid already present in the graph.
    #[error("duplicate uid: {0}")]
    DuplicateUid(Uid),
    /// Edge endpoint references a node that is not in the graph.
    #[error("missing endpoint node: {0}")]
    MissingEndpoint(Uid),
    /// A structural invariant does not hold.
    #[error("corrupt graph: {0}")]
    Corrupt(String),
}

/// Errors produced during DTO decoding.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DtoError {
    /// No constructor registered for the FQN.
    #[error("unknown item class: {0}")]
    UnknownClass(String),
    /// Item data did not have the expected shape.
    #[error("malformed item data: {0}")]
    Malformed(String),
    /// Recorded adjacency indexes disagree with the decoded edges.
    #[error("index mismatch: {0}")]
    IndexMismatch(String),
}

/// Errors produced by the pluggable expression evaluator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot evaluate {expr:?}: {reason}")]
pub struct EvalError {
    /// The offending expression text.
    pub expr: String,
    /// Why evaluation failed.
    pub reason: String,
}

impl EvalError {
    /// Creates an evaluation error for `expr`.
    #[must_use]
    pub fn new(expr: &str, reason: impl Into<String>) -> Self {
        Self {
            expr: expr.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Errors raised for caller misuse of the driver API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The supplied choice edge is not an enabled choice of the cursor.
    #[error("not an enabled choice: {0}")]
    InvalidChoice(Uid),
    /// The committed patch failed to apply to the surface graph.
    #[error(transparent)]
    Patch(#[from] PatchError),
    /// The graph violated a structural invariant after apply.
    #[error("graph invariant violated: {what}")]
    InvariantViolation {
        /// Description of the broken invariant.
        what: String,
    },
}
