// SPDX-License-Identifier: Apache-2.0
//! Journal fragments: the ordered, renderable output of a tick.

use std::collections::BTreeMap;

use crate::ident::Uid;
use crate::value::Value;

/// Well-known fragment types.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    /// Narrative prose.
    Text,
    /// Step/cursor bookkeeping line.
    Marker,
    /// Block content at the cursor.
    Block,
    /// Supplementary concept content.
    Concept,
    /// An enabled choice presented to the caller.
    Choice,
    /// Media reference.
    Media,
    /// Tick-level failure with a stable machine-readable code.
    Error,
}

/// One renderable output fragment.
// Field names are part of the persisted patch-log contract.
#[allow(clippy::struct_field_names)]
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Fragment {
    /// Fragment identity, allocated from the tick RNG.
    pub fragment_id: Uid,
    /// Fragment type.
    pub fragment_type: FragmentType,
    /// Graph item the fragment was rendered from, when any.
    pub source_id: Option<Uid>,
    /// Label of the source item at render time.
    pub source_label: Option<String>,
    /// Rendered content.
    pub content: String,
    /// Renderer-specific extras (choice ids, media keys, error codes).
    pub extras: BTreeMap<String, Value>,
}

impl Fragment {
    /// Creates a fragment with no source attribution.
    #[must_use]
    pub fn new(fragment_id: Uid, fragment_type: FragmentType, content: &str) -> Self {
        Self {
            fragment_id,
            fragment_type,
            source_id: None,
            source_label: None,
            content: content.to_owned(),
            extras: BTreeMap::new(),
        }
    }

    /// Attributes the fragment to a source item, returning `self` for
    /// chaining.
    #[must_use]
    pub fn from_source(mut self, source_id: Uid, source_label: Option<&str>) -> Self {
        self.source_id = Some(source_id);
        self.source_label = source_label.map(str::to_owned);
        self
    }

    /// Adds an extras entry, returning `self` for chaining.
    #[must_use]
    pub fn with_extra(mut self, key: &str, value: Value) -> Self {
        self.extras.insert(key.to_owned(), value);
        self
    }

    /// Builds the error fragment recorded when a tick fails.
    #[must_use]
    pub fn error(fragment_id: Uid, code: &str, message: &str) -> Self {
        Self::new(fragment_id, FragmentType::Error, message)
            .with_extra("code", Value::from(code))
    }
}
