// SPDX-License-Identifier: Apache-2.0
//! Layered namespaces.
//!
//! A namespace is the chained mapping visible to expressions and handlers:
//! an ordered list of layers where the leftmost binding wins. Layer order is
//! fixed by scope assembly: node locals, then ancestor locals nearest-first,
//! then domain vars, then process globals.

use std::collections::BTreeMap;

use crate::value::Value;

/// One namespace layer.
pub type NsLayer = BTreeMap<String, Value>;

/// A chained mapping with leftmost-wins resolution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Ns {
    layers: Vec<NsLayer>,
}

impl Ns {
    /// Creates an empty namespace.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a layer with lower precedence than all existing layers.
    pub fn push_layer(&mut self, layer: NsLayer) {
        self.layers.push(layer);
    }

    /// Number of layers.
    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Resolves a name; the first layer that binds it wins.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.layers.iter().find_map(|layer| layer.get(name))
    }

    /// Returns `true` when any layer binds `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Flattens the chain into a single mapping, leftmost-wins.
    #[must_use]
    pub fn flatten(&self) -> NsLayer {
        let mut out = NsLayer::new();
        for layer in self.layers.iter().rev() {
            for (k, v) in layer {
                out.insert(k.clone(), v.clone());
            }
        }
        out
    }
}
