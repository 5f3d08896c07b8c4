// SPDX-License-Identifier: Apache-2.0
//! Capability handler vocabulary: services, scope kinds, priorities,
//! receipts.
//!
//! Handlers are registered explicitly (no ambient decorator state); the
//! registration order is part of the dispatch contract and breaks priority
//! ties deterministically.

use crate::ident::Uid;
use crate::journal::Fragment;
use crate::ns::NsLayer;
use crate::phase::Phase;
use crate::provision::{BuildReceipt, OfferSet, PlanningReceipt};
use crate::value::Value;

/// Dispatchable services: one per phase plus the namespace, provisioner,
/// and choice queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Service {
    /// Phase dispatch for the given phase.
    Phase(Phase),
    /// Namespace layer contribution.
    GetNs,
    /// Choice enumeration hooks.
    GetChoices,
}

impl Service {
    /// Stable name for diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Phase(p) => p.name(),
            Self::GetNs => "get_ns",
            Self::GetChoices => "get_choices",
        }
    }
}

/// Which scope layer a handler binds to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScopeKind {
    /// Fires only when the anchor is the owning node.
    Node,
    /// Fires when the owning node is an ancestor of the anchor.
    Ancestor,
    /// Fires while the owning domain is active for the anchor.
    Domain,
    /// Always in scope.
    Global,
}

/// A handler's binding to the scope structure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerScope {
    /// Owned by a specific node.
    Node(Uid),
    /// Owned by an ancestor node; inherited by its subtree.
    Ancestor(Uid),
    /// Owned by a named domain.
    Domain(String),
    /// Process-global.
    Global,
}

impl HandlerScope {
    /// The layer kind this binding belongs to.
    #[must_use]
    pub fn kind(&self) -> ScopeKind {
        match self {
            Self::Node(_) => ScopeKind::Node,
            Self::Ancestor(_) => ScopeKind::Ancestor,
            Self::Domain(_) => ScopeKind::Domain,
            Self::Global => ScopeKind::Global,
        }
    }
}

/// Dispatch priority bands; ties break by scope depth, then registration
/// order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandlerPriority {
    /// Runs before everything else.
    First,
    /// Early band.
    Early,
    /// Default band.
    Normal,
    /// Late band.
    Late,
    /// Runs after everything else (coercers, receipt composers).
    Last,
}

impl HandlerPriority {
    /// Numeric rank used in sort keys.
    #[must_use]
    pub fn rank(self) -> u8 {
        match self {
            Self::First => 0,
            Self::Early => 25,
            Self::Normal => 50,
            Self::Late => 75,
            Self::Last => 100,
        }
    }
}

/// Restricts a handler to compatible callers.
#[derive(Clone, Debug, Default)]
pub enum CallerFilter {
    /// Applies to every caller.
    #[default]
    Any,
    /// Applies when the caller carries the tag.
    Tagged(String),
    /// Applies when the caller has the label.
    Labeled(String),
}

/// Opaque handler registration id; also usable for unregistration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub u32);

/// A handler's return value, wrapped into a call receipt by dispatch.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum HandlerOut {
    /// No-op; dropped by every aggregation strategy.
    #[default]
    None,
    /// Boolean vote (VALIDATE).
    Bool(bool),
    /// Arbitrary value.
    Value(Value),
    /// Edge selection (PREREQS/POSTREQS redirects).
    Edge(Uid),
    /// Namespace layer contribution (`get_ns`).
    Ns(NsLayer),
    /// Gathered offers (PLANNING collect pass).
    Offers(OfferSet),
    /// A single journal fragment.
    Fragment(Fragment),
    /// Multiple journal fragments; an explicit empty list suppresses
    /// marker-only output.
    Fragments(Vec<Fragment>),
    /// Plain text coerced into a `text` fragment by the journal coercer.
    Text(String),
    /// Build receipts (PLANNING link pass).
    Builds(Vec<BuildReceipt>),
    /// Planning summary (PLANNING compose pass).
    Planning(PlanningReceipt),
}

impl HandlerOut {
    /// Whether this output is the no-op marker.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

/// Record of a single handler invocation within a tick.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallReceipt {
    /// Registration id of the invoked handler.
    pub handler_id: HandlerId,
    /// Handler name, for provenance and diagnostics.
    pub handler_name: String,
    /// Service that was being dispatched.
    pub service: Service,
    /// Monotonic receipt sequence within the tick.
    pub seq: u32,
    /// The wrapped return value.
    pub result: HandlerOut,
}

/// How dispatch folds handler returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Collect every receipt.
    Gather,
    /// Merge mapping contributions (namespaces).
    Merge,
    /// Stop at the first non-`None` result.
    FirstResult,
    /// Short-circuit on the first `false`.
    AllTrue,
}

impl Service {
    /// The aggregation strategy used for this service.
    #[must_use]
    pub fn aggregation(self) -> Aggregation {
        match self {
            Self::Phase(Phase::Validate) => Aggregation::AllTrue,
            Self::Phase(Phase::Prereqs | Phase::Postreqs) => Aggregation::FirstResult,
            Self::GetNs => Aggregation::Merge,
            _ => Aggregation::Gather,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ranks_are_ordered() {
        let ranks: Vec<u8> = [
            HandlerPriority::First,
            HandlerPriority::Early,
            HandlerPriority::Normal,
            HandlerPriority::Late,
            HandlerPriority::Last,
        ]
        .into_iter()
        .map(HandlerPriority::rank)
        .collect();
        let mut sorted = ranks.clone();
        sorted.sort_unstable();
        assert_eq!(ranks, sorted);
    }

    #[test]
    fn service_aggregation_strategies() {
        assert_eq!(
            Service::Phase(Phase::Validate).aggregation(),
            Aggregation::AllTrue
        );
        assert_eq!(
            Service::Phase(Phase::Prereqs).aggregation(),
            Aggregation::FirstResult
        );
        assert_eq!(Service::GetNs.aggregation(), Aggregation::Merge);
        assert_eq!(
            Service::Phase(Phase::Journal).aggregation(),
            Aggregation::Gather
        );
    }
}
