// SPDX-License-Identifier: Apache-2.0
//! Provisioning: requirements, offers, policies, and the template registry.
//!
//! Open edges carry a [`Requirement`] describing what provider would satisfy
//! them. During PLANNING, provisioners publish [`Offer`]s against those
//! requirements; accepting an offer resolves a provider under one of four
//! policies and binds it through effects.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::errors::HandlerError;
use crate::frame::Frame;
use crate::graph::{Graph, Node};
use crate::ident::Uid;
use crate::registry::{chain_find_node, Registry};
use crate::value::{Criteria, Value};

/// How a requirement may be satisfied.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningPolicy {
    /// Find by identifier and/or criteria match.
    Existing,
    /// Create from template.
    Create,
    /// Find and update from template.
    Update,
    /// Find and evolve a copy from template.
    Clone,
}

impl ProvisioningPolicy {
    /// Stable lowercase name used in DTOs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Existing => "existing",
            Self::Create => "create",
            Self::Update => "update",
            Self::Clone => "clone",
        }
    }

    /// Parses the stable name produced by [`ProvisioningPolicy::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "existing" => Some(Self::Existing),
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "clone" => Some(Self::Clone),
            _ => None,
        }
    }
}

/// Inline template payload carried by a requirement.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TemplateData {
    /// Class FQN of the node to materialize.
    pub cls: String,
    /// Attribute overlay; `label` is special-cased, everything else lands in
    /// the provider's locals.
    pub attributes: BTreeMap<String, Value>,
}

/// Template reference: inline data or a named registry entry.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum TemplateSpec {
    /// Inline template payload.
    Inline(TemplateData),
    /// Name resolved through the [`TemplateRegistry`] with scope patterns.
    Named(String),
}

/// Validation failures for requirement construction.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequirementError {
    /// EXISTING/UPDATE/CLONE requires an identifier or match criteria.
    #[error("policy {0:?} requires an identifier or match criteria")]
    MissingSelector(ProvisioningPolicy),
    /// CREATE/UPDATE/CLONE requires a template.
    #[error("policy {0:?} requires a template")]
    MissingTemplate(ProvisioningPolicy),
}

/// The specification carried by an open edge.
///
/// Invariants
/// - EXISTING/UPDATE/CLONE: at least one of identifier/criteria is
///   non-empty.
/// - CREATE/UPDATE/CLONE: template present.
/// - `satisfied ⇔ provider_id.is_some() || !hard_requirement`.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Requirement {
    /// Requirement identifier; drives deterministic evaluation order.
    pub uid: Uid,
    /// Direct lookup key (label, uid hex, or short uid).
    pub identifier: Option<String>,
    /// Match filter over candidate providers.
    pub criteria: Criteria,
    /// Template used by CREATE/UPDATE/CLONE.
    pub template: Option<TemplateSpec>,
    /// Satisfaction policy.
    pub policy: ProvisioningPolicy,
    /// Bound provider; the requirement is satisfied when set.
    pub provider_id: Option<Uid>,
    /// Hard requirements gate the choices that consume them.
    pub hard_requirement: bool,
    /// Set when resolution was attempted and failed.
    pub is_unresolvable: bool,
}

impl Requirement {
    /// Creates an empty requirement for the given policy; callers populate
    /// selectors and templates, then [`validate`](Self::validate).
    #[must_use]
    pub fn new(uid: Uid, policy: ProvisioningPolicy) -> Self {
        Self {
            uid,
            identifier: None,
            criteria: Criteria::new(),
            template: None,
            policy,
            provider_id: None,
            hard_requirement: true,
            is_unresolvable: false,
        }
    }

    /// Sets the direct lookup identifier, returning `self` for chaining.
    #[must_use]
    pub fn with_identifier(mut self, ident: &str) -> Self {
        self.identifier = Some(ident.to_owned());
        self
    }

    /// Sets the inline template, returning `self` for chaining.
    #[must_use]
    pub fn with_template(mut self, data: TemplateData) -> Self {
        self.template = Some(TemplateSpec::Inline(data));
        self
    }

    /// Marks the requirement soft, returning `self` for chaining.
    #[must_use]
    pub fn soft(mut self) -> Self {
        self.hard_requirement = false;
        self
    }

    /// Checks the policy invariants.
    pub fn validate(&self) -> Result<(), RequirementError> {
        let needs_selector = matches!(
            self.policy,
            ProvisioningPolicy::Existing | ProvisioningPolicy::Update | ProvisioningPolicy::Clone
        );
        if needs_selector && self.identifier.is_none() && self.criteria.is_empty() {
            return Err(RequirementError::MissingSelector(self.policy));
        }
        let needs_template = matches!(
            self.policy,
            ProvisioningPolicy::Create | ProvisioningPolicy::Update | ProvisioningPolicy::Clone
        );
        if needs_template && self.template.is_none() {
            return Err(RequirementError::MissingTemplate(self.policy));
        }
        Ok(())
    }

    /// `satisfied ⇔ provider bound, or the requirement is soft`.
    #[must_use]
    pub fn satisfied(&self) -> bool {
        self.provider_id.is_some() || !self.hard_requirement
    }

    /// Whether `node` would satisfy this requirement's selectors.
    #[must_use]
    pub fn matches(&self, node: &Node) -> bool {
        if self.identifier.is_none() && self.criteria.is_empty() {
            return false;
        }
        if let Some(ident) = &self.identifier {
            if !node.entity.has_identifier(ident) {
                return false;
            }
        }
        node.matches(&self.criteria)
    }

    pub(crate) fn set_path(&mut self, path: &[String], value: Value) -> Result<(), String> {
        let [field] = path else {
            return Err(format!("bad requirement path: {path:?}"));
        };
        match field.as_str() {
            "provider_id" => {
                self.provider_id = match value {
                    Value::Null => None,
                    Value::Uid(u) => Some(u),
                    other => return Err(format!("provider_id expects uid, got {other}")),
                };
                Ok(())
            }
            "is_unresolvable" => {
                self.is_unresolvable = match value {
                    Value::Bool(b) => b,
                    other => return Err(format!("is_unresolvable expects bool, got {other}")),
                };
                Ok(())
            }
            "hard_requirement" => {
                self.hard_requirement = match value {
                    Value::Bool(b) => b,
                    other => return Err(format!("hard_requirement expects bool, got {other}")),
                };
                Ok(())
            }
            other => Err(format!("unknown requirement attribute: {other}")),
        }
    }
}

/// A registered template: label, class, attributes, and scope pattern.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Template {
    /// Lookup label.
    pub label: String,
    /// Class FQN of materialized providers.
    pub cls: String,
    /// Attribute payload.
    pub attributes: BTreeMap<String, Value>,
    /// `"*"` for global, `"<ancestor>.*"` to scope under an ancestor label
    /// or domain name.
    pub scope_pattern: String,
}

impl Template {
    fn in_scope(&self, scope_path: &[String]) -> bool {
        if self.scope_pattern == "*" {
            return true;
        }
        self.scope_pattern
            .strip_suffix(".*")
            .is_some_and(|anchor| scope_path.iter().any(|seg| seg == anchor))
    }
}

/// Insertion-ordered template store; lookup is by label filtered by scope
/// pattern, first hit wins.
#[derive(Clone, Debug, Default)]
pub struct TemplateRegistry {
    templates: Vec<Template>,
}

impl TemplateRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template.
    pub fn register(&mut self, template: Template) {
        self.templates.push(template);
    }

    /// Number of registered templates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.templates.len()
    }

    /// Returns `true` when no templates are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Looks up a template by label within the anchor's scope path
    /// (ancestor labels and active domain names).
    #[must_use]
    pub fn lookup(&self, label: &str, scope_path: &[String]) -> Option<&Template> {
        self.templates
            .iter()
            .find(|t| t.label == label && t.in_scope(scope_path))
    }
}

/// A provisioner's proposal to satisfy a requirement.
///
/// Broadcast offers (affordances, not tied to a specific requirement on the
/// frontier) carry `source_rank` 0; responsive dependency offers carry 1.
/// Candidate ordering is `(source_rank, priority, uid)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Offer {
    /// Offer identity, allocated from the tick RNG.
    pub uid: Uid,
    /// Open edge whose requirement this offer addresses.
    pub edge_uid: Uid,
    /// Requirement identity, for receipts.
    pub requirement_uid: Uid,
    /// Name of the publishing provisioner.
    pub provisioner: String,
    /// Lower runs earlier in selection.
    pub priority: i32,
    /// Mirrors the requirement's hardness.
    pub hard: bool,
    /// 0 = affordance (broadcast), 1 = dependency (responsive).
    pub source_rank: u8,
    /// Selection criteria snapshot used for matching.
    pub criteria: Criteria,
}

impl Offer {
    /// Deterministic candidate sort key.
    #[must_use]
    pub fn sort_key(&self) -> (u8, i32, Uid) {
        (self.source_rank, self.priority, self.uid)
    }
}

/// Offers gathered during one PLANNING pass: broadcast affordance offers
/// plus responsive offers keyed by requirement uid.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OfferSet {
    /// Broadcast (affordance) offers, the `*` bucket.
    pub broadcast: Vec<Offer>,
    /// Responsive offers per requirement uid.
    pub by_requirement: BTreeMap<Uid, Vec<Offer>>,
}

impl OfferSet {
    /// Total number of gathered offers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.broadcast.len() + self.by_requirement.values().map(Vec::len).sum::<usize>()
    }

    /// Returns `true` when no offers were gathered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What accepting an offer did.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum BuildOp {
    /// Bound an existing provider.
    Attach,
    /// Materialized a provider from a template.
    Create,
    /// Updated an existing provider from a template.
    Update,
    /// Cloned a provider and overlaid a template.
    Clone,
    /// Nothing happened.
    Noop,
}

impl From<ProvisioningPolicy> for BuildOp {
    fn from(policy: ProvisioningPolicy) -> Self {
        match policy {
            ProvisioningPolicy::Existing => Self::Attach,
            ProvisioningPolicy::Create => Self::Create,
            ProvisioningPolicy::Update => Self::Update,
            ProvisioningPolicy::Clone => Self::Clone,
        }
    }
}

/// Outcome of one offer acceptance attempt.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BuildReceipt {
    /// Requirement the attempt addressed.
    pub requirement_uid: Uid,
    /// Bound provider, when accepted.
    pub provider_id: Option<Uid>,
    /// Operation performed.
    pub operation: BuildOp,
    /// Whether a provider was bound.
    pub accepted: bool,
    /// Hardness of the requirement.
    pub hard: bool,
    /// Failure reason when not accepted.
    pub reason: Option<String>,
}

/// Summary of one PLANNING pass.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlanningReceipt {
    /// Providers materialized from templates.
    pub created: usize,
    /// Providers updated in place.
    pub updated: usize,
    /// Providers cloned.
    pub cloned: usize,
    /// Existing providers attached.
    pub attached: usize,
    /// Hard requirements left unresolved, by uid hex.
    pub unresolved_hard_requirements: Vec<String>,
}

impl PlanningReceipt {
    /// Summarizes build receipts into a planning receipt.
    #[must_use]
    pub fn summarize(builds: &[BuildReceipt]) -> Self {
        let mut receipt = Self::default();
        for b in builds {
            if !b.accepted {
                if b.hard {
                    receipt
                        .unresolved_hard_requirements
                        .push(b.requirement_uid.to_hex());
                }
                continue;
            }
            match b.operation {
                BuildOp::Create => receipt.created += 1,
                BuildOp::Update => receipt.updated += 1,
                BuildOp::Clone => receipt.cloned += 1,
                BuildOp::Attach => receipt.attached += 1,
                BuildOp::Noop => {}
            }
        }
        receipt
    }
}

/// Seed for an offer; the planning pass stamps identity, rank, and
/// provisioner attribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OfferSeed {
    /// Open edge whose requirement the seed addresses.
    pub edge_uid: Uid,
    /// Selection priority, lower first.
    pub priority: i32,
    /// Criteria snapshot.
    pub criteria: Criteria,
}

/// Mutable context handed to provisioners while resolving.
pub struct ProvisionCtx<'a> {
    /// Preview graph for lookups.
    pub graph: &'a Graph,
    /// Frame used to emit effects and allocate ids.
    pub frame: &'a mut Frame,
    /// Template registry for named templates.
    pub templates: &'a TemplateRegistry,
    /// Scope registries searched after the graph by EXISTING lookups.
    pub pools: &'a [Registry<Node>],
    /// Scope path of the anchor (ancestor labels + active domains), for
    /// template scope patterns.
    pub scope_path: &'a [String],
}

/// An object that emits offers during PLANNING and resolves accepted ones.
pub trait Provisioner: core::fmt::Debug + Send + Sync {
    /// Stable name used in receipts and offer attribution.
    fn name(&self) -> &str;

    /// Domain gate: when set, the provisioner is active only while the
    /// domain is active for the cursor.
    fn domain(&self) -> Option<&str> {
        None
    }

    /// Publishes offer seeds. With `None`, broadcast (affordance) seeds;
    /// with a dependency edge uid, responsive seeds for that requirement.
    fn offers(&self, graph: &Graph, dependency: Option<&Uid>) -> Vec<OfferSeed>;

    /// Resolves a provider for the requirement under its policy, emitting
    /// any materialization effects. `Ok(None)` means unresolvable.
    fn resolve(
        &self,
        req: &Requirement,
        ctx: &mut ProvisionCtx<'_>,
    ) -> Result<Option<Uid>, HandlerError>;
}

/// Default provisioner backed by the template registry and scope pools.
#[derive(Clone, Debug, Default)]
pub struct TemplateProvisioner;

impl TemplateProvisioner {
    fn template_for(
        req: &Requirement,
        ctx: &ProvisionCtx<'_>,
    ) -> Option<TemplateData> {
        match &req.template {
            Some(TemplateSpec::Inline(data)) => Some(data.clone()),
            Some(TemplateSpec::Named(name)) => ctx
                .templates
                .lookup(name, ctx.scope_path)
                .map(|t| TemplateData {
                    cls: t.cls.clone(),
                    attributes: t.attributes.clone(),
                }),
            None => None,
        }
    }

    fn lookup_criteria(req: &Requirement) -> Criteria {
        let mut criteria = req.criteria.clone();
        if let Some(ident) = &req.identifier {
            criteria.insert("has_identifier".to_owned(), Value::from(ident.as_str()));
        }
        criteria
    }

    fn resolve_existing(req: &Requirement, ctx: &ProvisionCtx<'_>) -> Option<Uid> {
        let criteria = Self::lookup_criteria(req);
        if criteria.is_empty() {
            return None;
        }
        chain_find_node(ctx.graph, ctx.pools, &criteria).map(Node::uid)
    }

    fn overlay_template(
        target: Uid,
        data: &TemplateData,
        ctx: &mut ProvisionCtx<'_>,
    ) -> Result<(), HandlerError> {
        for (key, value) in &data.attributes {
            let path = if key == "label" {
                vec!["label".to_owned()]
            } else {
                vec!["locals".to_owned(), key.clone()]
            };
            ctx.frame.set_attr(target, path, value.clone())?;
        }
        Ok(())
    }
}

impl Provisioner for TemplateProvisioner {
    fn name(&self) -> &str {
        "templates"
    }

    fn offers(&self, graph: &Graph, dependency: Option<&Uid>) -> Vec<OfferSeed> {
        match dependency {
            None => graph
                .edges()
                .filter(|e| {
                    e.open_role() == Some(crate::graph::OpenRole::Affordance)
                        && e.requirement.as_ref().is_some_and(|r| {
                            r.provider_id.is_none() && !r.is_unresolvable
                        })
                })
                .map(|e| OfferSeed {
                    edge_uid: e.uid(),
                    priority: 50,
                    criteria: e
                        .requirement
                        .as_ref()
                        .map_or_else(Criteria::new, |r| r.criteria.clone()),
                })
                .collect(),
            Some(edge_uid) => {
                let Some(edge) = graph.edge(edge_uid) else {
                    return Vec::new();
                };
                let Some(req) = &edge.requirement else {
                    return Vec::new();
                };
                let plausible = match req.policy {
                    ProvisioningPolicy::Create => req.template.is_some(),
                    _ => req.identifier.is_some() || !req.criteria.is_empty(),
                };
                if !plausible {
                    return Vec::new();
                }
                vec![OfferSeed {
                    edge_uid: *edge_uid,
                    priority: 50,
                    criteria: req.criteria.clone(),
                }]
            }
        }
    }

    fn resolve(
        &self,
        req: &Requirement,
        ctx: &mut ProvisionCtx<'_>,
    ) -> Result<Option<Uid>, HandlerError> {
        match req.policy {
            ProvisioningPolicy::Existing => Ok(Self::resolve_existing(req, ctx)),
            ProvisioningPolicy::Update => {
                let Some(data) = Self::template_for(req, ctx) else {
                    return Ok(None);
                };
                let Some(target) = Self::resolve_existing(req, ctx) else {
                    return Ok(None);
                };
                Self::overlay_template(target, &data, ctx)?;
                Ok(Some(target))
            }
            ProvisioningPolicy::Clone => {
                let Some(data) = Self::template_for(req, ctx) else {
                    return Ok(None);
                };
                let Some(reference) = Self::resolve_existing(req, ctx) else {
                    return Ok(None);
                };
                let Some(ref_node) = ctx.graph.node(&reference) else {
                    return Ok(None);
                };
                let seed = crate::dto::node_to_value(ref_node);
                let clone_uid = ctx.frame.create_node(&data.cls, seed)?;
                Self::overlay_template(clone_uid, &data, ctx)?;
                Ok(Some(clone_uid))
            }
            ProvisioningPolicy::Create => {
                let Some(data) = Self::template_for(req, ctx) else {
                    return Ok(None);
                };
                let mut body = BTreeMap::new();
                let mut locals = BTreeMap::new();
                let mut label = req.identifier.clone().map_or(Value::Null, Value::from);
                for (key, value) in &data.attributes {
                    if key == "label" {
                        label = value.clone();
                    } else {
                        locals.insert(key.clone(), value.clone());
                    }
                }
                body.insert("label".to_owned(), label);
                body.insert("locals".to_owned(), Value::Map(locals));
                let created = ctx.frame.create_node(&data.cls, Value::Map(body))?;
                Ok(Some(created))
            }
        }
    }
}
