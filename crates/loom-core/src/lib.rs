// SPDX-License-Identifier: Apache-2.0
//! loom-core: deterministic story-graph virtual machine.
//!
//! The runtime executes authored stories as a sequence of deterministic
//! ticks over a typed graph. Each tick runs seven resolution phases with
//! layered capability dispatch; handlers observe a preview graph and
//! mutate only through effects; every tick commits a canonical,
//! replayable patch into a snapshot + patch log.
#![forbid(unsafe_code)]

mod config;
mod dispatch;
mod driver;
mod dto;
mod effect;
mod entity;
mod errors;
mod expr;
mod frame;
mod graph;
mod handler;
mod ident;
mod journal;
mod ns;
mod patch;
mod phase;
mod planning;
mod provision;
mod registry;
mod rng;
mod scope;
mod value;
mod vm;

// Re-exports for a stable public API.
/// Runtime bounds and their environment overrides.
pub use config::RuntimeConfig;
/// Dispatch context and handler registration surface.
pub use dispatch::{CallSite, HandlerFn, HandlerRegistry, TickCtx};
/// Driver entry points.
pub use driver::{Driver, RunReason, RunResult, TickResult};
/// Portable snapshots and the FQN resolver.
pub use dto::{
    edge_from_value, edge_to_value, node_from_value, node_to_value, requirement_from_value,
    requirement_to_value, GraphDto, ItemCtor, ItemDto, Resolver, EDGE_FQN, NODE_FQN,
};
/// Effects and canonicalization.
pub use effect::{canonicalize, effects_digest, Effect, EffectArgs, Op, Provenance};
/// Identified base record and the domain tag prefix.
pub use entity::{Entity, DOMAIN_TAG_PREFIX};
/// Typed error surface.
pub use errors::{
    DriverError, DtoError, EffectError, EvalError, GraphError, HandlerError, PatchError,
    ReplayError, TickError,
};
/// Pluggable expression evaluation.
pub use expr::{Expr, ExprEval, LiteralEval, NsAssign, NullEval};
/// Per-tick execution state and io transcripts.
pub use frame::{Frame, IoRecord};
/// The typed story graph.
pub use graph::{
    Direction, Edge, EdgeKind, EdgeState, Graph, Item, ItemRef, Node, OpenRole,
};
/// Handler vocabulary: services, priorities, scope kinds, receipts.
pub use handler::{
    Aggregation, CallReceipt, CallerFilter, HandlerId, HandlerOut, HandlerPriority, HandlerScope,
    ScopeKind, Service,
};
/// Identifier types and constructors.
pub use ident::{make_uid, Hash, Uid, NIL_UID};
/// Journal fragments.
pub use journal::{Fragment, FragmentType};
/// Layered namespaces.
pub use ns::{Ns, NsLayer};
/// Patches and the snapshot + patch log.
pub use patch::{LogIoError, Patch, PatchLog};
/// Resolution phases.
pub use phase::Phase;
/// Provisioning: requirements, offers, policies, templates.
pub use provision::{
    BuildOp, BuildReceipt, Offer, OfferSeed, OfferSet, PlanningReceipt, ProvisionCtx,
    Provisioner, ProvisioningPolicy, Requirement, RequirementError, Template, TemplateData,
    TemplateRegistry, TemplateSpec,
};
/// Uid-keyed entity stores.
pub use registry::{chain_find_node, Keyed, Registry};
/// Deterministic per-tick RNG.
pub use rng::{tick_seed, TickRng};
/// Scope assembly.
pub use scope::{Scope, ScopeLayer};
/// Deterministic values and criteria.
pub use value::{Criteria, Value};
/// The resolution-phase VM.
pub use vm::{ChoiceInfo, Vm};
