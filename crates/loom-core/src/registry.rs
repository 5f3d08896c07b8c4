// SPDX-License-Identifier: Apache-2.0
//! Uid-keyed entity stores.
//!
//! Registries preserve insertion order: `find` scans in registration order
//! so that lookups are stable and "first hit wins" semantics are
//! deterministic across runs.

use std::collections::BTreeMap;

use crate::graph::{Graph, Node};
use crate::ident::Uid;
use crate::value::Criteria;

/// Items that can live in a registry.
pub trait Keyed {
    /// Stable identifier of the item.
    fn uid(&self) -> Uid;
    /// Criteria matcher used by `find`.
    fn matches(&self, criteria: &Criteria) -> bool;
}

impl Keyed for Node {
    fn uid(&self) -> Uid {
        Node::uid(self)
    }

    fn matches(&self, criteria: &Criteria) -> bool {
        Node::matches(self, criteria)
    }
}

/// An insertion-ordered, uid-keyed store.
#[derive(Clone, Debug, Default)]
pub struct Registry<T> {
    items: BTreeMap<Uid, T>,
    order: Vec<Uid>,
}

impl<T: Keyed> Registry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    /// Number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when the registry holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Adds or replaces an item; replacement keeps the original position.
    pub fn add(&mut self, item: T) {
        let uid = item.uid();
        if self.items.insert(uid, item).is_none() {
            self.order.push(uid);
        }
    }

    /// Removes an item by id.
    pub fn remove(&mut self, uid: &Uid) -> Option<T> {
        let removed = self.items.remove(uid);
        if removed.is_some() {
            self.order.retain(|u| u != uid);
        }
        removed
    }

    /// Looks up an item by id.
    #[must_use]
    pub fn get(&self, uid: &Uid) -> Option<&T> {
        self.items.get(uid)
    }

    /// Iterates items in insertion order.
    // Borrowing iteration only; there is no owned-iteration surface.
    #[allow(clippy::iter_without_into_iter)]
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.order.iter().filter_map(|uid| self.items.get(uid))
    }

    /// All items matching the criteria, in insertion order.
    pub fn find<'a, 'b>(&'a self, criteria: &'b Criteria) -> impl Iterator<Item = &'a T> + 'b
    where
        'a: 'b,
    {
        self.iter().filter(move |item| item.matches(criteria))
    }

    /// First item matching the criteria.
    #[must_use]
    pub fn find_one(&self, criteria: &Criteria) -> Option<&T> {
        self.find(criteria).next()
    }
}

/// Finds the first node matching `criteria` across the graph and then each
/// registry in order. Graph nodes are scanned in ascending uid order.
#[must_use]
pub fn chain_find_node<'a>(
    graph: &'a Graph,
    pools: &'a [Registry<Node>],
    criteria: &Criteria,
) -> Option<&'a Node> {
    if let Some(node) = graph.nodes().find(|n| n.matches(criteria)) {
        return Some(node);
    }
    pools.iter().find_map(|pool| pool.find_one(criteria))
}
