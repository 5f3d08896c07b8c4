// SPDX-License-Identifier: Apache-2.0
//! Capability dispatch: provider collection, priority ordering, receipts.
//!
//! For `(caller, service)` dispatch collects handlers from every scope
//! layer, sorts them by `(priority, scope_depth, registration_order)` —
//! inner scopes override outer scopes of equal priority — and invokes them
//! in that fixed order, wrapping each return in a call receipt. The order
//! is fully deterministic for a fixed scope, service, and registration
//! history.

use rustc_hash::FxHashMap;

use crate::config::RuntimeConfig;
use crate::errors::{HandlerError, TickError};
use crate::expr::ExprEval;
use crate::frame::Frame;
use crate::graph::{Graph, Node};
use crate::handler::{
    Aggregation, CallerFilter, HandlerId, HandlerOut, HandlerPriority, HandlerScope, Service,
};
use crate::ident::Uid;
use crate::ns::{Ns, NsLayer};
use crate::provision::TemplateRegistry;
use crate::registry::Registry;
use crate::scope::{Scope, ScopeLayer};
use crate::value::Value;

/// Per-invocation call-site context handed to handler bodies.
#[derive(Clone, Debug)]
pub struct CallSite {
    /// The anchor node the dispatch is about.
    pub caller: Uid,
    /// Service being dispatched.
    pub service: Service,
    /// Registration id of the handler being invoked.
    pub handler_id: HandlerId,
    /// Name of the handler being invoked.
    pub handler_name: String,
}

/// A handler body.
pub type HandlerFn =
    Box<dyn Fn(&mut TickCtx<'_>, &CallSite) -> Result<HandlerOut, HandlerError> + Send + Sync>;

/// A registered handler.
pub struct HandlerEntry {
    /// Registration id.
    pub id: HandlerId,
    /// Diagnostic name; also the provenance handler id for effects.
    pub name: String,
    /// Service this handler answers.
    pub service: Service,
    /// Scope binding.
    pub scope: HandlerScope,
    /// Priority band.
    pub priority: HandlerPriority,
    /// Caller restriction.
    pub filter: CallerFilter,
    /// Registration sequence; the documented tie-breaker.
    pub order: u32,
    func: HandlerFn,
}

impl core::fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("service", &self.service)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Insertion-ordered handler store with a per-service index.
#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: Vec<HandlerEntry>,
    by_service: FxHashMap<Service, Vec<usize>>,
    next_id: u32,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler; the returned id can be used to unregister.
    pub fn register(
        &mut self,
        service: Service,
        scope: HandlerScope,
        priority: HandlerPriority,
        filter: CallerFilter,
        name: &str,
        func: HandlerFn,
    ) -> HandlerId {
        let id = HandlerId(self.next_id);
        let order = self.next_id;
        self.next_id += 1;
        self.by_service
            .entry(service)
            .or_default()
            .push(self.entries.len());
        self.entries.push(HandlerEntry {
            id,
            name: name.to_owned(),
            service,
            scope,
            priority,
            filter,
            order,
            func,
        });
        id
    }

    /// Unregisters a handler by id. Registration order of the remaining
    /// handlers is unchanged.
    pub fn unregister(&mut self, id: HandlerId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        self.entries.remove(pos);
        self.by_service.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_service.entry(entry.service).or_default().push(idx);
        }
        true
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` when no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn service_entries(&self, service: Service) -> impl Iterator<Item = &HandlerEntry> {
        self.by_service
            .get(&service)
            .into_iter()
            .flatten()
            .filter_map(|idx| self.entries.get(*idx))
    }
}

/// Shared read/write context for one dispatch pass.
///
/// Handlers observe the preview graph and namespace through this context
/// and mutate only via the frame's effect API.
pub struct TickCtx<'a> {
    /// Preview graph (base plus in-progress effects).
    pub graph: &'a Graph,
    /// Per-tick execution state.
    pub frame: &'a mut Frame,
    /// Handler registry.
    pub handlers: &'a HandlerRegistry,
    /// Scope of the current anchor.
    pub scope: &'a Scope,
    /// Namespace snapshot for the current phase.
    pub ns: Ns,
    /// Runtime bounds.
    pub config: &'a RuntimeConfig,
    /// Expression evaluator.
    pub eval: &'a dyn ExprEval,
    /// Template registry for provisioning.
    pub templates: &'a TemplateRegistry,
    /// Scope registries searched by EXISTING lookups.
    pub pools: &'a [Registry<Node>],
    /// Registered provisioners, in registration order.
    pub provisioners: &'a [Box<dyn crate::provision::Provisioner>],
    /// Process globals (lowest-precedence namespace layer).
    pub globals: &'a NsLayer,
}

impl TickCtx<'_> {
    /// Assembles the namespace for another anchor (e.g. a frontier node).
    ///
    /// Re-entrant assembly for the same anchor is a handler fault; layered
    /// contributions must not call back into `get_ns` for their own anchor.
    pub fn get_ns(&mut self, anchor: Uid) -> Result<Ns, TickError> {
        let scope = Scope::assemble(self.graph, anchor).map_err(|e| TickError::HandlerFault {
            phase: self.frame.current_phase(),
            handler: "get_ns".to_owned(),
            kind: e.to_string(),
        })?;
        assemble_ns(self, &scope)
    }
}

fn caller_matches(filter: &CallerFilter, caller: Option<&Node>) -> bool {
    match filter {
        CallerFilter::Any => true,
        CallerFilter::Tagged(tag) => {
            caller.is_some_and(|n| n.entity.tags.contains(tag))
        }
        CallerFilter::Labeled(label) => {
            caller.is_some_and(|n| n.entity.label.as_deref() == Some(label.as_str()))
        }
    }
}

/// Depth of the innermost scope layer a handler binding matches, if any.
fn binding_depth(scope: &Scope, binding: &HandlerScope) -> Option<u32> {
    scope
        .layers
        .iter()
        .find(|layer| layer_matches(layer, binding))
        .map(|layer| layer.depth)
}

fn layer_matches(layer: &ScopeLayer, binding: &HandlerScope) -> bool {
    match binding {
        HandlerScope::Node(uid) => {
            layer.kind == crate::handler::ScopeKind::Node && layer.anchor == Some(*uid)
        }
        HandlerScope::Ancestor(uid) => {
            layer.kind == crate::handler::ScopeKind::Ancestor && layer.anchor == Some(*uid)
        }
        HandlerScope::Domain(name) => {
            layer.kind == crate::handler::ScopeKind::Domain
                && layer.domain.as_deref() == Some(name.as_str())
        }
        HandlerScope::Global => layer.kind == crate::handler::ScopeKind::Global,
    }
}

/// Dispatches `service` for `caller`, returning `(name, result)` pairs in
/// invocation order. Receipts are appended to the frame as a side effect.
pub(crate) fn dispatch_service(
    ctx: &mut TickCtx<'_>,
    caller: Uid,
    service: Service,
) -> Result<Vec<(String, HandlerOut)>, TickError> {
    let handlers = ctx.handlers;
    let scope = ctx.scope;
    let caller_node = ctx.graph.node(&caller);

    let mut selected: Vec<(u8, u32, u32, &HandlerEntry)> = handlers
        .service_entries(service)
        .filter_map(|entry| {
            let depth = binding_depth(scope, &entry.scope)?;
            if !caller_matches(&entry.filter, caller_node) {
                return None;
            }
            Some((entry.priority.rank(), depth, entry.order, entry))
        })
        .collect();
    selected.sort_by_key(|(rank, depth, order, _)| (*rank, *depth, *order));

    let phase = ctx.frame.current_phase();
    let aggregation = service.aggregation();
    let mut results = Vec::with_capacity(selected.len());
    for (_, _, _, entry) in selected {
        let site = CallSite {
            caller,
            service,
            handler_id: entry.id,
            handler_name: entry.name.clone(),
        };
        ctx.frame.set_current(phase, &entry.name);
        let out = (entry.func)(ctx, &site).map_err(|err| TickError::HandlerFault {
            phase,
            handler: entry.name.clone(),
            kind: err.kind,
        })?;
        ctx.frame
            .push_receipt(entry.id, &entry.name, service, out.clone());
        let stop = match aggregation {
            Aggregation::AllTrue => matches!(out, HandlerOut::Bool(false)),
            Aggregation::FirstResult => !out.is_none(),
            Aggregation::Gather | Aggregation::Merge => false,
        };
        results.push((entry.name.clone(), out));
        if stop {
            break;
        }
    }
    Ok(results)
}

/// Assembles the layered namespace for `scope`.
///
/// Each layer contributes one mapping: custom `get_ns` handlers bound to
/// that layer (in priority order, first insertion wins), then the
/// satisfied open-edge projections, then the layer anchor's locals. The
/// global layer contributes process globals.
pub(crate) fn assemble_ns(ctx: &mut TickCtx<'_>, scope: &Scope) -> Result<Ns, TickError> {
    if ctx.frame.ns_stack.contains(&scope.anchor) {
        return Err(TickError::HandlerFault {
            phase: ctx.frame.current_phase(),
            handler: "get_ns".to_owned(),
            kind: format!("recursive get_ns for anchor {}", scope.anchor),
        });
    }
    ctx.frame.ns_stack.push(scope.anchor);
    let result = assemble_ns_inner(ctx, scope);
    ctx.frame.ns_stack.pop();
    result
}

fn assemble_ns_inner(ctx: &mut TickCtx<'_>, scope: &Scope) -> Result<Ns, TickError> {
    let mut ns = Ns::new();
    for layer in &scope.layers {
        let mut map = NsLayer::new();

        // Custom contributions bound to exactly this layer.
        let caller = layer.anchor.unwrap_or(scope.anchor);
        let receipts = dispatch_layer_ns(ctx, layer, caller)?;
        for contribution in receipts {
            for (k, v) in contribution {
                map.entry(k).or_insert(v);
            }
        }

        if let Some(anchor) = layer.anchor {
            if layer.kind != crate::handler::ScopeKind::Domain {
                for (k, v) in open_edge_projections(ctx.graph, anchor) {
                    map.entry(k).or_insert(v);
                }
            }
            if let Some(node) = ctx.graph.node(&anchor) {
                for (k, v) in &node.locals {
                    map.entry(k.clone()).or_insert_with(|| v.clone());
                }
            }
        } else {
            for (k, v) in ctx.globals {
                map.entry(k.clone()).or_insert_with(|| v.clone());
            }
        }

        ns.push_layer(map);
    }
    Ok(ns)
}

fn dispatch_layer_ns(
    ctx: &mut TickCtx<'_>,
    layer: &ScopeLayer,
    caller: Uid,
) -> Result<Vec<NsLayer>, TickError> {
    let handlers = ctx.handlers;
    let caller_node = ctx.graph.node(&caller);

    let mut selected: Vec<(u8, u32, &HandlerEntry)> = handlers
        .service_entries(Service::GetNs)
        .filter(|entry| layer_matches(layer, &entry.scope))
        .filter(|entry| caller_matches(&entry.filter, caller_node))
        .map(|entry| (entry.priority.rank(), entry.order, entry))
        .collect();
    selected.sort_by_key(|(rank, order, _)| (*rank, *order));

    let phase = ctx.frame.current_phase();
    let mut out = Vec::new();
    for (_, _, entry) in selected {
        let site = CallSite {
            caller,
            service: Service::GetNs,
            handler_id: entry.id,
            handler_name: entry.name.clone(),
        };
        ctx.frame.set_current(phase, &entry.name);
        let result = (entry.func)(ctx, &site).map_err(|err| TickError::HandlerFault {
            phase,
            handler: entry.name.clone(),
            kind: err.kind,
        })?;
        ctx.frame
            .push_receipt(entry.id, &entry.name, Service::GetNs, result.clone());
        match result {
            HandlerOut::Ns(map) => out.push(map),
            HandlerOut::None => {}
            other => {
                return Err(TickError::HandlerFault {
                    phase,
                    handler: entry.name.clone(),
                    kind: format!("get_ns handler returned non-namespace output: {other:?}"),
                })
            }
        }
    }
    Ok(out)
}

/// Projects satisfied open edges into a node's namespace: dependencies at
/// their source, affordances at their destination, keyed by edge label.
fn open_edge_projections(graph: &Graph, anchor: Uid) -> Vec<(String, Value)> {
    use crate::graph::OpenRole;

    let mut out = Vec::new();
    for edge in graph.edges_out(&anchor) {
        if edge.open_role() == Some(OpenRole::Dependency) {
            if let (Some(label), Some(provider)) = (
                edge.entity.label.clone(),
                edge.requirement.as_ref().and_then(|r| r.provider_id),
            ) {
                out.push((label, Value::Uid(provider)));
            }
        }
    }
    for edge in graph.edges_in(&anchor) {
        if edge.open_role() == Some(OpenRole::Affordance) {
            if let (Some(label), Some(provider)) = (
                edge.entity.label.clone(),
                edge.requirement.as_ref().and_then(|r| r.provider_id),
            ) {
                out.push((label, Value::Uid(provider)));
            }
        }
    }
    out
}
