// SPDX-License-Identifier: Apache-2.0
//! Default PLANNING handlers.
//!
//! The planning phase is wired in four steps:
//!
//! 1. `planning_collect_offers` (EARLY) — enumerate open frontier
//!    requirements and publish offers: broadcast affordance offers under
//!    the `*` bucket, responsive offers keyed by requirement uid.
//! 2. `planning_link_affordances` (NORMAL) — test broadcast offers against
//!    the frontier and bind accepted affordances.
//! 3. `planning_link_dependencies` (LATE) — per frontier node, try each
//!    unsatisfied dependency's offers in candidate order and accept the
//!    first available one.
//! 4. `planning_compose_receipt` (LAST) — summarize the build receipts
//!    into a planning receipt.
//!
//! Determinism: candidate offers sort by `(source_rank, priority, offer
//! uid)`; requirements evaluate in ascending requirement-uid order;
//! frontier nodes iterate in ascending choice-edge-uid order.

use std::collections::BTreeSet;

use tracing::debug;

use crate::dispatch::{CallSite, TickCtx};
use crate::errors::HandlerError;
use crate::graph::{Edge, EdgeKind, Graph, OpenRole};
use crate::handler::{HandlerOut, Service};
use crate::ident::Uid;
use crate::effect::EffectArgs;
use crate::frame::Frame;
use crate::phase::Phase;
use crate::provision::{
    BuildOp, BuildReceipt, Offer, OfferSet, PlanningReceipt, ProvisionCtx, Provisioner,
};
use crate::scope::Scope;
use crate::value::Value;

const PROVIDER_PATH: [&str; 2] = ["requirement", "provider_id"];
const UNRESOLVABLE_PATH: [&str; 2] = ["requirement", "is_unresolvable"];

fn path(segments: &[&str]) -> Vec<String> {
    segments.iter().map(|s| (*s).to_owned()).collect()
}

/// Choice edges out of the cursor and their bound destinations: the
/// structural frontier, in ascending edge-uid order.
pub(crate) fn choice_frontier(graph: &Graph, cursor: Uid) -> Vec<(Uid, Uid)> {
    graph
        .edges_out(&cursor)
        .filter(|e| e.kind == EdgeKind::Choice)
        .filter_map(|e| e.destination().map(|dst| (e.uid(), dst)))
        .filter(|(_, dst)| graph.node(dst).is_some())
        .collect()
}

/// Unsatisfied dependency edges of a node, in ascending requirement-uid
/// order.
pub(crate) fn open_dependencies(graph: &Graph, node: Uid) -> Vec<&Edge> {
    let mut deps: Vec<&Edge> = graph
        .edges_out(&node)
        .filter(|e| e.open_role() == Some(OpenRole::Dependency) && !e.satisfied())
        .collect();
    deps.sort_by_key(|e| e.requirement.as_ref().map(|r| r.uid));
    deps
}

/// Edge uids whose requirement was bound by effects emitted earlier in the
/// current tick (the preview does not refresh mid-phase).
fn bound_this_tick(frame: &Frame) -> BTreeSet<Uid> {
    frame
        .effects()
        .iter()
        .filter_map(|e| match &e.args {
            EffectArgs::SetAttr { uid, path, value } => {
                let is_bind = path.len() == 2
                    && path[0] == PROVIDER_PATH[0]
                    && path[1] == PROVIDER_PATH[1]
                    && !matches!(value, Value::Null);
                is_bind.then_some(*uid)
            }
            _ => None,
        })
        .collect()
}

fn active_provisioners<'a>(ctx: &TickCtx<'a>) -> Vec<&'a dyn Provisioner> {
    let domains = &ctx.scope.active_domains;
    ctx.provisioners
        .iter()
        .map(|boxed| &**boxed)
        .filter(|p| p.domain().is_none_or(|d| domains.contains(d)))
        .collect()
}

fn latest_offers(ctx: &TickCtx<'_>) -> OfferSet {
    ctx.frame
        .call_receipts
        .iter()
        .rev()
        .filter(|r| r.service == Service::Phase(Phase::Planning))
        .find_map(|r| match &r.result {
            HandlerOut::Offers(offers) => Some(offers.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

/// EARLY: collect affordance and responsive offers for the frontier.
pub(crate) fn planning_collect_offers(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let cursor = site.caller;
    let provisioners = active_provisioners(ctx);
    let mut offers = OfferSet::default();

    // Broadcast affordance offers, not tied to a specific frontier
    // requirement.
    for prov in &provisioners {
        for seed in prov.offers(ctx.graph, None) {
            let Some(edge) = ctx.graph.edge(&seed.edge_uid) else {
                continue;
            };
            let Some(req) = &edge.requirement else {
                continue;
            };
            offers.broadcast.push(Offer {
                uid: ctx.frame.allocate_uid(),
                edge_uid: seed.edge_uid,
                requirement_uid: req.uid,
                provisioner: prov.name().to_owned(),
                priority: seed.priority,
                hard: req.hard_requirement,
                source_rank: 0,
                criteria: seed.criteria,
            });
        }
    }

    // Responsive offers for each frontier node's open dependencies.
    for (_, frontier) in choice_frontier(ctx.graph, cursor) {
        for dep in open_dependencies(ctx.graph, frontier) {
            let dep_uid = dep.uid();
            let Some(req) = &dep.requirement else {
                continue;
            };
            let (req_uid, hard) = (req.uid, req.hard_requirement);
            for prov in &provisioners {
                for seed in prov.offers(ctx.graph, Some(&dep_uid)) {
                    offers.by_requirement.entry(req_uid).or_default().push(Offer {
                        uid: ctx.frame.allocate_uid(),
                        edge_uid: seed.edge_uid,
                        requirement_uid: req_uid,
                        provisioner: prov.name().to_owned(),
                        priority: seed.priority,
                        hard,
                        source_rank: 1,
                        criteria: seed.criteria,
                    });
                }
            }
        }
    }

    offers.broadcast.sort_by_key(Offer::sort_key);
    for bucket in offers.by_requirement.values_mut() {
        bucket.sort_by_key(Offer::sort_key);
    }
    debug!(count = offers.len(), "planning: collected offers");
    Ok(HandlerOut::Offers(offers))
}

/// NORMAL: link broadcast affordance offers against the frontier.
///
/// At most one affordance is accepted per `(requirement, destination)`
/// pair; an accepted affordance's bound resource may in turn satisfy open
/// dependencies of the same frontier node.
pub(crate) fn planning_link_affordances(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let cursor = site.caller;
    let offers = latest_offers(ctx);
    let frontier = choice_frontier(ctx.graph, cursor);
    let mut bound = bound_this_tick(ctx.frame);
    let mut builds = Vec::new();

    for offer in &offers.broadcast {
        let Some(aff) = ctx.graph.edge(&offer.edge_uid) else {
            continue;
        };
        let Some(req) = aff.requirement.as_ref() else {
            continue;
        };
        if req.provider_id.is_some() || bound.contains(&offer.edge_uid) {
            continue;
        }
        let resource = aff.dst_id;

        for (_, frontier_node) in &frontier {
            let Some(candidate) = ctx.graph.node(frontier_node) else {
                continue;
            };
            if !req.matches(candidate) {
                continue;
            }
            let ns = ctx
                .get_ns(*frontier_node)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            if !aff.available(&ns, ctx.eval)? {
                continue;
            }

            ctx.frame
                .set_attr(offer.edge_uid, path(&PROVIDER_PATH), Value::Uid(*frontier_node))?;
            bound.insert(offer.edge_uid);
            builds.push(BuildReceipt {
                requirement_uid: req.uid,
                provider_id: Some(*frontier_node),
                operation: BuildOp::Attach,
                accepted: true,
                hard: req.hard_requirement,
                reason: None,
            });
            debug!(
                affordance = %offer.edge_uid,
                source = %frontier_node,
                "planning: linked affordance"
            );

            // The afforded resource may satisfy open dependencies of the
            // same frontier node.
            if let Some(resource_node) = ctx.graph.node(&resource) {
                for dep in open_dependencies(ctx.graph, *frontier_node) {
                    let dep_uid = dep.uid();
                    if bound.contains(&dep_uid) {
                        continue;
                    }
                    let Some(dep_req) = &dep.requirement else {
                        continue;
                    };
                    if dep_req.matches(resource_node) {
                        ctx.frame
                            .set_attr(dep_uid, path(&PROVIDER_PATH), Value::Uid(resource))?;
                        bound.insert(dep_uid);
                        builds.push(BuildReceipt {
                            requirement_uid: dep_req.uid,
                            provider_id: Some(resource),
                            operation: BuildOp::Attach,
                            accepted: true,
                            hard: dep_req.hard_requirement,
                            reason: None,
                        });
                    }
                }
            }
            break;
        }
    }

    Ok(HandlerOut::Builds(builds))
}

/// LATE: bind each frontier node's unsatisfied dependencies from the
/// responsive offers, first available candidate wins.
pub(crate) fn planning_link_dependencies(
    ctx: &mut TickCtx<'_>,
    site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let cursor = site.caller;
    let offers = latest_offers(ctx);
    let frontier = choice_frontier(ctx.graph, cursor);
    let mut bound = bound_this_tick(ctx.frame);
    let mut builds = Vec::new();

    for (_, frontier_node) in &frontier {
        let ns = ctx
            .get_ns(*frontier_node)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        let scope_path = match Scope::assemble(ctx.graph, *frontier_node) {
            Ok(scope) => scope.scope_path,
            Err(_) => Vec::new(),
        };

        let deps: Vec<Edge> = open_dependencies(ctx.graph, *frontier_node)
            .into_iter()
            .cloned()
            .collect();
        for dep in deps {
            let dep_uid = dep.uid();
            if bound.contains(&dep_uid) {
                continue;
            }
            let Some(req) = dep.requirement.clone() else {
                continue;
            };
            if !dep.available(&ns, ctx.eval)? {
                continue;
            }

            let candidates = offers
                .by_requirement
                .get(&req.uid)
                .cloned()
                .unwrap_or_default();
            let mut provider = None;
            for offer in &candidates {
                let Some(prov) = ctx
                    .provisioners
                    .iter()
                    .map(|boxed| &**boxed)
                    .find(|p| p.name() == offer.provisioner)
                else {
                    continue;
                };
                let mut pctx = ProvisionCtx {
                    graph: ctx.graph,
                    frame: &mut *ctx.frame,
                    templates: ctx.templates,
                    pools: ctx.pools,
                    scope_path: &scope_path,
                };
                if let Some(found) = prov.resolve(&req, &mut pctx)? {
                    provider = Some(found);
                    break;
                }
            }

            match provider {
                Some(found) => {
                    ctx.frame
                        .set_attr(dep_uid, path(&PROVIDER_PATH), Value::Uid(found))?;
                    if req.is_unresolvable {
                        ctx.frame
                            .set_attr(dep_uid, path(&UNRESOLVABLE_PATH), Value::Bool(false))?;
                    }
                    bound.insert(dep_uid);
                    builds.push(BuildReceipt {
                        requirement_uid: req.uid,
                        provider_id: Some(found),
                        operation: BuildOp::from(req.policy),
                        accepted: true,
                        hard: req.hard_requirement,
                        reason: None,
                    });
                    debug!(dependency = %dep_uid, provider = %found, "planning: bound dependency");

                    // A fresh provider may satisfy further open
                    // dependencies of the same frontier node.
                    if let Some(provider_node) = ctx.graph.node(&found) {
                        for other in open_dependencies(ctx.graph, *frontier_node) {
                            let other_uid = other.uid();
                            if other_uid == dep_uid || bound.contains(&other_uid) {
                                continue;
                            }
                            let Some(other_req) = &other.requirement else {
                                continue;
                            };
                            if other_req.matches(provider_node) {
                                ctx.frame.set_attr(
                                    other_uid,
                                    path(&PROVIDER_PATH),
                                    Value::Uid(found),
                                )?;
                                bound.insert(other_uid);
                                builds.push(BuildReceipt {
                                    requirement_uid: other_req.uid,
                                    provider_id: Some(found),
                                    operation: BuildOp::Attach,
                                    accepted: true,
                                    hard: other_req.hard_requirement,
                                    reason: None,
                                });
                            }
                        }
                    }
                }
                None => {
                    if req.hard_requirement {
                        if !req.is_unresolvable {
                            ctx.frame.set_attr(
                                dep_uid,
                                path(&UNRESOLVABLE_PATH),
                                Value::Bool(true),
                            )?;
                        }
                        builds.push(BuildReceipt {
                            requirement_uid: req.uid,
                            provider_id: None,
                            operation: BuildOp::Noop,
                            accepted: false,
                            hard: true,
                            reason: Some("unresolvable".to_owned()),
                        });
                        debug!(dependency = %dep_uid, "planning: hard requirement unresolvable");
                    } else {
                        builds.push(BuildReceipt {
                            requirement_uid: req.uid,
                            provider_id: None,
                            operation: BuildOp::Noop,
                            accepted: false,
                            hard: false,
                            reason: Some("waived_soft".to_owned()),
                        });
                    }
                }
            }
        }
    }

    Ok(HandlerOut::Builds(builds))
}

/// LAST: summarize build receipts into a planning receipt.
pub(crate) fn planning_compose_receipt(
    ctx: &mut TickCtx<'_>,
    _site: &CallSite,
) -> Result<HandlerOut, HandlerError> {
    let mut builds = Vec::new();
    for receipt in &ctx.frame.call_receipts {
        if receipt.service != Service::Phase(Phase::Planning) {
            continue;
        }
        if let HandlerOut::Builds(b) = &receipt.result {
            builds.extend(b.iter().cloned());
        }
    }
    Ok(HandlerOut::Planning(PlanningReceipt::summarize(&builds)))
}
