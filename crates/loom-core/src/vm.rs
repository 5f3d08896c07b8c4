// SPDX-License-Identifier: Apache-2.0
//! The resolution-phase virtual machine.
//!
//! A tick runs the seven phases in strict order against a preview graph
//! that is rebuilt between phases from base + buffered effects
//! (read-your-writes). Handlers observe the preview and mutate only
//! through the frame's effect API. A PREREQS redirect restarts the phase
//! list on the new cursor within the same tick; a POSTREQS redirect
//! requests a cursor handoff that the driver turns into the next tick.

use tracing::debug;

use crate::config::RuntimeConfig;
use crate::dispatch::{
    assemble_ns, dispatch_service, CallSite, HandlerFn, HandlerRegistry, TickCtx,
};
use crate::dto::Resolver;
use crate::effect::build_preview;
use crate::errors::{EvalError, HandlerError, TickError};
use crate::expr::{ExprEval, NullEval};
use crate::frame::Frame;
use crate::graph::{EdgeKind, EdgeState, Graph, Node};
use crate::handler::{
    CallerFilter, HandlerId, HandlerOut, HandlerPriority, HandlerScope, Service,
};
use crate::ident::Uid;
use crate::journal::{Fragment, FragmentType};
use crate::ns::{Ns, NsLayer};
use crate::phase::Phase;
use crate::planning;
use crate::provision::{Provisioner, TemplateProvisioner, TemplateRegistry};
use crate::registry::Registry;
use crate::scope::Scope;
use crate::value::Value;

/// One enabled choice of the cursor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChoiceInfo {
    /// The choice edge.
    pub edge_uid: Uid,
    /// Destination node.
    pub dst: Uid,
    /// Edge label, when authored.
    pub label: Option<String>,
}

/// The story-graph virtual machine: handler registry, provisioners,
/// templates, globals, evaluator, and configuration.
#[derive(Debug)]
pub struct Vm {
    handlers: HandlerRegistry,
    provisioners: Vec<Box<dyn Provisioner>>,
    templates: TemplateRegistry,
    pools: Vec<Registry<Node>>,
    globals: NsLayer,
    eval: Box<dyn ExprEval>,
    config: RuntimeConfig,
    resolver: Resolver,
}

impl Vm {
    /// Creates a VM with the default handler set, the template
    /// provisioner, the null evaluator, and built-in item classes.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        let mut vm = Self {
            handlers: HandlerRegistry::new(),
            provisioners: vec![Box::new(TemplateProvisioner)],
            templates: TemplateRegistry::new(),
            pools: Vec::new(),
            globals: NsLayer::new(),
            eval: Box::new(NullEval),
            config,
            resolver: Resolver::with_builtins(),
        };
        vm.register_builtin_handlers();
        vm
    }

    /// Swaps the expression evaluator.
    #[must_use]
    pub fn with_eval(mut self, eval: Box<dyn ExprEval>) -> Self {
        self.eval = eval;
        self
    }

    /// Runtime configuration.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// FQN resolver used for previews and patch application.
    #[must_use]
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Mutable FQN resolver, for registering domain item classes.
    pub fn resolver_mut(&mut self) -> &mut Resolver {
        &mut self.resolver
    }

    /// Mutable template registry.
    pub fn templates_mut(&mut self) -> &mut TemplateRegistry {
        &mut self.templates
    }

    /// Registers an additional provisioner.
    pub fn add_provisioner(&mut self, provisioner: Box<dyn Provisioner>) {
        self.provisioners.push(provisioner);
    }

    /// Attaches a scope registry searched by EXISTING lookups.
    pub fn add_pool(&mut self, pool: Registry<Node>) {
        self.pools.push(pool);
    }

    /// Sets a process-global namespace entry.
    pub fn set_global(&mut self, key: &str, value: Value) {
        self.globals.insert(key.to_owned(), value);
    }

    /// Registers a handler; returns an id usable for unregistration.
    pub fn register_handler(
        &mut self,
        service: Service,
        scope: HandlerScope,
        priority: HandlerPriority,
        filter: CallerFilter,
        name: &str,
        func: HandlerFn,
    ) -> HandlerId {
        self.handlers
            .register(service, scope, priority, filter, name, func)
    }

    /// Unregisters a handler by id.
    pub fn unregister_handler(&mut self, id: HandlerId) -> bool {
        self.handlers.unregister(id)
    }

    fn register_builtin_handlers(&mut self) {
        use HandlerPriority as Prio;
        use HandlerScope::Global;

        let mut reg = |service, prio, name: &str, func: HandlerFn| {
            self.handlers
                .register(service, Global, prio, CallerFilter::Any, name, func);
        };

        reg(
            Service::Phase(Phase::Validate),
            Prio::Early,
            "validate_cursor",
            Box::new(validate_cursor),
        );
        reg(
            Service::Phase(Phase::Validate),
            Prio::Normal,
            "validate_selected_edge",
            Box::new(validate_selected_edge),
        );
        reg(
            Service::Phase(Phase::Prereqs),
            Prio::Late,
            "prereq_redirect",
            Box::new(prereq_redirect),
        );
        reg(
            Service::Phase(Phase::Planning),
            Prio::Early,
            "planning_collect_offers",
            Box::new(planning::planning_collect_offers),
        );
        reg(
            Service::Phase(Phase::Planning),
            Prio::Normal,
            "planning_link_affordances",
            Box::new(planning::planning_link_affordances),
        );
        reg(
            Service::Phase(Phase::Planning),
            Prio::Late,
            "planning_link_dependencies",
            Box::new(planning::planning_link_dependencies),
        );
        reg(
            Service::Phase(Phase::Planning),
            Prio::Last,
            "planning_compose_receipt",
            Box::new(planning::planning_compose_receipt),
        );
        reg(
            Service::Phase(Phase::Update),
            Prio::Normal,
            "update_entry_effects",
            Box::new(update_entry_effects),
        );
        reg(
            Service::Phase(Phase::Update),
            Prio::Late,
            "update_mark_progress",
            Box::new(update_mark_progress),
        );
        reg(
            Service::Phase(Phase::Postreqs),
            Prio::Late,
            "postreq_redirect",
            Box::new(postreq_redirect),
        );
        reg(
            Service::Phase(Phase::Journal),
            Prio::Early,
            "journal_marker",
            Box::new(journal_marker),
        );
        reg(
            Service::Phase(Phase::Journal),
            Prio::Early,
            "journal_block",
            Box::new(journal_block),
        );
        reg(
            Service::Phase(Phase::Journal),
            Prio::Early,
            "journal_choices",
            Box::new(journal_choices),
        );
        reg(
            Service::Phase(Phase::Journal),
            Prio::Last,
            "journal_coerce",
            Box::new(journal_coerce),
        );
        reg(
            Service::Phase(Phase::Finalize),
            Prio::Normal,
            "finalize_final_effects",
            Box::new(finalize_final_effects),
        );
    }

    /// Runs one tick. `prior_hops` carries the driver's handoff count into
    /// the shared auto-traversal budget; the return value is the updated
    /// count.
    pub(crate) fn run_tick(
        &self,
        base: &Graph,
        frame: &mut Frame,
        prior_hops: usize,
    ) -> Result<usize, TickError> {
        let mut hops = prior_hops;
        'restart: loop {
            for phase in Phase::ALL {
                frame.set_current(phase, "phase_runner");
                let cursor = frame.cursor_uid;
                let preview =
                    build_preview(base, frame.effects(), &self.resolver).map_err(|reason| {
                        TickError::HandlerFault {
                            phase,
                            handler: "preview".to_owned(),
                            kind: reason,
                        }
                    })?;
                let scope = Scope::assemble(&preview, cursor).map_err(|e| {
                    TickError::InvariantViolation {
                        what: e.to_string(),
                    }
                })?;
                let mut ctx = TickCtx {
                    graph: &preview,
                    frame: &mut *frame,
                    handlers: &self.handlers,
                    scope: &scope,
                    ns: Ns::new(),
                    config: &self.config,
                    eval: self.eval.as_ref(),
                    templates: &self.templates,
                    pools: &self.pools,
                    provisioners: &self.provisioners,
                    globals: &self.globals,
                };
                ctx.ns = assemble_ns(&mut ctx, &scope)?;

                let results = dispatch_service(&mut ctx, cursor, Service::Phase(phase))?;

                match phase {
                    Phase::Validate => {
                        let reasons: Vec<String> = results
                            .iter()
                            .filter(|(_, out)| matches!(out, HandlerOut::Bool(false)))
                            .map(|(name, _)| name.clone())
                            .collect();
                        if !reasons.is_empty() {
                            return Err(TickError::ValidationFailed { reasons });
                        }
                    }
                    Phase::Prereqs => {
                        if let Some(dst) = redirect_target(&ctx, &results)? {
                            hops += 1;
                            if hops > self.config.auto_traversal_bound {
                                return Err(TickError::AutoTraversalExceeded {
                                    chain_length: hops,
                                });
                            }
                            debug!(from = %cursor, to = %dst, "prereq redirect");
                            frame.cursor_uid = dst;
                            frame.cursor_history.push(dst);
                            continue 'restart;
                        }
                    }
                    Phase::Postreqs => {
                        if let Some(dst) = redirect_target(&ctx, &results)? {
                            debug!(from = %cursor, to = %dst, "postreq handoff");
                            frame.next_cursor_uid = Some(dst);
                        }
                    }
                    Phase::Journal => {
                        let coerced = results.iter().rev().find_map(|(_, out)| match out {
                            HandlerOut::Fragments(frags) => Some(frags.clone()),
                            _ => None,
                        });
                        frame.set_journal(coerced.unwrap_or_default());
                    }
                    Phase::Planning | Phase::Update | Phase::Finalize => {}
                }
            }
            return Ok(hops);
        }
    }

    /// Enabled choices of `cursor` against the given graph: manual CHOICE
    /// edges that are available and whose destinations carry no
    /// unsatisfied hard requirements.
    pub fn get_choices(&self, graph: &Graph, cursor: Uid) -> Result<Vec<ChoiceInfo>, TickError> {
        let mut scratch = Frame::new(cursor, 0, 0, self.config.max_effects_per_tick);
        let scope =
            Scope::assemble(graph, cursor).map_err(|e| TickError::InvariantViolation {
                what: e.to_string(),
            })?;
        let mut ctx = TickCtx {
            graph,
            frame: &mut scratch,
            handlers: &self.handlers,
            scope: &scope,
            ns: Ns::new(),
            config: &self.config,
            eval: self.eval.as_ref(),
            templates: &self.templates,
            pools: &self.pools,
            provisioners: &self.provisioners,
            globals: &self.globals,
        };
        ctx.ns = assemble_ns(&mut ctx, &scope)?;
        let extra = dispatch_service(&mut ctx, cursor, Service::GetChoices)?;
        let wrap = |e: EvalError| TickError::HandlerFault {
            phase: Phase::Validate,
            handler: "get_choices".to_owned(),
            kind: e.to_string(),
        };
        let mut choices =
            enabled_choices_in(graph, cursor, &ctx.ns, self.eval.as_ref()).map_err(wrap)?;
        // Capability handlers may contribute additional choice edges; they
        // pass through the same availability gate.
        for (_, out) in extra {
            let HandlerOut::Edge(edge_uid) = out else {
                continue;
            };
            if choices.iter().any(|c| c.edge_uid == edge_uid) {
                continue;
            }
            let Some(edge) = graph.edge(&edge_uid) else {
                continue;
            };
            let Some(dst) = edge.destination() else {
                continue;
            };
            if graph.node(&dst).is_none() {
                continue;
            }
            if edge.available(&ctx.ns, self.eval.as_ref()).map_err(wrap)? {
                choices.push(ChoiceInfo {
                    edge_uid,
                    dst,
                    label: edge.entity.label.clone(),
                });
            }
        }
        Ok(choices)
    }
}

/// Manual, available choices whose frontier requirements do not disqualify
/// them.
pub(crate) fn enabled_choices_in(
    graph: &Graph,
    cursor: Uid,
    ns: &Ns,
    eval: &dyn ExprEval,
) -> Result<Vec<ChoiceInfo>, EvalError> {
    let mut out = Vec::new();
    for edge in graph.edges_out(&cursor) {
        if edge.kind != EdgeKind::Choice || edge.trigger_phase.is_some() {
            continue;
        }
        let Some(dst) = edge.destination() else {
            continue;
        };
        if graph.node(&dst).is_none() {
            continue;
        }
        if !edge.available(ns, eval)? {
            continue;
        }
        let blocked = graph
            .edges_out(&dst)
            .filter(|e| e.open_role() == Some(crate::graph::OpenRole::Dependency))
            .any(|e| !e.satisfied());
        if blocked {
            continue;
        }
        out.push(ChoiceInfo {
            edge_uid: edge.uid(),
            dst,
            label: edge.entity.label.clone(),
        });
    }
    Ok(out)
}

fn redirect_target(
    ctx: &TickCtx<'_>,
    results: &[(String, HandlerOut)],
) -> Result<Option<Uid>, TickError> {
    let Some(edge_uid) = results.iter().find_map(|(_, out)| match out {
        HandlerOut::Edge(uid) => Some(*uid),
        _ => None,
    }) else {
        return Ok(None);
    };
    let Some(edge) = ctx.graph.edge(&edge_uid) else {
        return Ok(None);
    };
    let available = edge
        .available(&ctx.ns, ctx.eval)
        .map_err(|e| TickError::HandlerFault {
            phase: ctx.frame.current_phase(),
            handler: "redirect".to_owned(),
            kind: e.to_string(),
        })?;
    if !available {
        return Ok(None);
    }
    let Some(dst) = edge.destination() else {
        return Ok(None);
    };
    if ctx.graph.node(&dst).is_none() {
        return Ok(None);
    }
    Ok(Some(dst))
}

// ── Builtin handlers ─────────────────────────────────────────────────

fn validate_cursor(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    Ok(HandlerOut::Bool(ctx.graph.node(&site.caller).is_some()))
}

fn validate_selected_edge(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let Some(edge_uid) = ctx.frame.selected_edge else {
        return Ok(HandlerOut::None);
    };
    let Some(edge) = ctx.graph.edge(&edge_uid) else {
        return Ok(HandlerOut::Bool(false));
    };
    if edge.kind != EdgeKind::Choice || edge.src_id != site.caller {
        return Ok(HandlerOut::Bool(false));
    }
    Ok(HandlerOut::Bool(edge.available(&ctx.ns, ctx.eval)?))
}

fn auto_redirect(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
    phase: Phase,
) -> Result<HandlerOut, HandlerError> {
    let edges: Vec<Uid> = ctx
        .graph
        .edges_out(&site.caller)
        .filter(|e| e.kind == EdgeKind::Choice && e.trigger_phase == Some(phase))
        .map(crate::graph::Edge::uid)
        .collect();
    for edge_uid in edges {
        let Some(edge) = ctx.graph.edge(&edge_uid) else {
            continue;
        };
        if edge.destination().is_none() {
            continue;
        }
        if edge.available(&ctx.ns, ctx.eval)? {
            return Ok(HandlerOut::Edge(edge_uid));
        }
    }
    Ok(HandlerOut::None)
}

/// Follow auto-triggering choice edges during PREREQS.
fn prereq_redirect(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    auto_redirect(ctx, site, Phase::Prereqs)
}

/// Follow the first auto-triggering choice edge during POSTREQS.
fn postreq_redirect(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    auto_redirect(ctx, site, Phase::Postreqs)
}

fn run_effect_scripts(
    ctx: &mut TickCtx<'_>,
    caller: Uid,
    scripts: &[String],
) -> Result<(), HandlerError> {
    for script in scripts {
        let assigns = ctx.eval.exec_effect(script, &ctx.ns)?;
        for assign in assigns {
            let mut path = Vec::with_capacity(assign.path.len() + 1);
            path.push("locals".to_owned());
            path.extend(assign.path);
            ctx.frame.set_attr(caller, path, assign.value)?;
        }
    }
    Ok(())
}

/// Apply the cursor's entry effects.
fn update_entry_effects(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let Some(node) = ctx.graph.node(&site.caller) else {
        return Ok(HandlerOut::None);
    };
    let scripts = node.entry_effects.clone();
    run_effect_scripts(ctx, site.caller, &scripts)?;
    Ok(HandlerOut::None)
}

/// Mark the selected edge visited and bump the cursor's visit counter.
fn update_mark_progress(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    if let Some(edge_uid) = ctx.frame.selected_edge {
        if ctx
            .graph
            .edge(&edge_uid)
            .is_some_and(|e| e.state != EdgeState::Visited)
        {
            ctx.frame.set_attr(
                edge_uid,
                vec!["state".to_owned()],
                Value::from(EdgeState::Visited.name()),
            )?;
        }
    }
    let visits = ctx
        .graph
        .node(&site.caller)
        .and_then(|n| n.locals.get("visits"))
        .and_then(Value::as_int)
        .unwrap_or(0);
    ctx.frame.set_attr(
        site.caller,
        vec!["locals".to_owned(), "visits".to_owned()],
        Value::Int(visits + 1),
    )?;
    Ok(HandlerOut::None)
}

/// Emit a marker fragment for the current step.
fn journal_marker(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    let Some(node) = ctx.graph.node(&site.caller) else {
        return Ok(HandlerOut::None);
    };
    let label = node.display_name();
    let content = format!("[step {:04}]: cursor at {label}", ctx.frame.step);
    let fragment = ctx
        .frame
        .fragment(FragmentType::Marker, &content)
        .from_source(site.caller, Some(&label));
    Ok(HandlerOut::Fragment(fragment))
}

/// Emit the cursor's block content, when authored.
fn journal_block(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    let Some(node) = ctx.graph.node(&site.caller) else {
        return Ok(HandlerOut::None);
    };
    let Some(content) = node.locals.get("content").and_then(Value::as_str) else {
        return Ok(HandlerOut::None);
    };
    let label = node.display_name();
    let content = content.to_owned();
    let fragment = ctx
        .frame
        .fragment(FragmentType::Block, &content)
        .from_source(site.caller, Some(&label));
    Ok(HandlerOut::Fragment(fragment))
}

/// Emit one choice fragment per enabled choice.
fn journal_choices(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    let choices = enabled_choices_in(ctx.graph, site.caller, &ctx.ns, ctx.eval)?;
    if choices.is_empty() {
        return Ok(HandlerOut::None);
    }
    let mut fragments = Vec::with_capacity(choices.len());
    for choice in choices {
        let content = choice.label.clone().unwrap_or_else(|| {
            ctx.graph
                .node(&choice.dst)
                .map_or_else(|| choice.dst.short(), Node::display_name)
        });
        let fragment = ctx
            .frame
            .fragment(FragmentType::Choice, &content)
            .from_source(choice.edge_uid, choice.label.as_deref())
            .with_extra("edge_uid", Value::Uid(choice.edge_uid))
            .with_extra("dst", Value::Uid(choice.dst));
        fragments.push(fragment);
    }
    Ok(HandlerOut::Fragments(fragments))
}

/// LAST: coerce heterogeneous journal returns into the fragment list.
///
/// `None` is dropped, fragments pass through, strings wrap as `text`,
/// lists recurse. If only marker fragments remain and at least one handler
/// explicitly returned an empty list, the output is empty.
fn journal_coerce(ctx: &mut TickCtx<'_>, site: &CallSite) -> Result<HandlerOut, HandlerError> {
    let entries: Vec<HandlerOut> = ctx
        .frame
        .call_receipts
        .iter()
        .filter(|r| {
            r.service == Service::Phase(Phase::Journal) && r.handler_id != site.handler_id
        })
        .map(|r| r.result.clone())
        .collect();

    let mut fragments: Vec<Fragment> = Vec::new();
    let mut explicit_empty = false;
    for entry in &entries {
        match entry {
            HandlerOut::None => {}
            HandlerOut::Fragment(f) => fragments.push(f.clone()),
            HandlerOut::Fragments(list) => {
                if list.is_empty() {
                    explicit_empty = true;
                }
                fragments.extend(list.iter().cloned());
            }
            HandlerOut::Text(s) => {
                let f = ctx.frame.fragment(FragmentType::Text, s);
                fragments.push(f);
            }
            HandlerOut::Value(v) => coerce_value(ctx.frame, v, &mut fragments),
            _ => {}
        }
    }

    let non_marker = fragments
        .iter()
        .any(|f| f.fragment_type != FragmentType::Marker);
    if explicit_empty && !non_marker {
        return Ok(HandlerOut::Fragments(Vec::new()));
    }
    Ok(HandlerOut::Fragments(fragments))
}

fn coerce_value(frame: &mut Frame, value: &Value, out: &mut Vec<Fragment>) {
    match value {
        Value::Null => {}
        Value::Str(s) => {
            let f = frame.fragment(FragmentType::Text, s);
            out.push(f);
        }
        Value::List(items) => {
            for item in items {
                coerce_value(frame, item, out);
            }
        }
        other => {
            let text = other.to_string();
            let f = frame.fragment(FragmentType::Text, &text);
            out.push(f);
        }
    }
}

/// Apply the cursor's final effects.
fn finalize_final_effects(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let Some(node) = ctx.graph.node(&site.caller) else {
        return Ok(HandlerOut::None);
    };
    let scripts = node.final_effects.clone();
    run_effect_scripts(ctx, site.caller, &scripts)?;
    Ok(HandlerOut::None)
}
