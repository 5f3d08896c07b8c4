// SPDX-License-Identifier: Apache-2.0
//! Base entity record shared by nodes and edges.

use std::collections::BTreeSet;

use crate::ident::Uid;
use crate::value::{Criteria, Value};

/// Reserved tag prefix that activates a domain for a subtree.
pub const DOMAIN_TAG_PREFIX: &str = "domain:";

/// The identified base record carried by every graph item.
///
/// Invariants
/// - `uid` is unique within a graph and immutable after creation.
/// - `tags` iterate in deterministic order (`BTreeSet`).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Entity {
    /// Stable identifier.
    pub uid: Uid,
    /// Optional human-readable label.
    pub label: Option<String>,
    /// Free-form tag set; `domain:<name>` tags activate domains.
    pub tags: BTreeSet<String>,
}

impl Entity {
    /// Creates an entity with the given id and no label or tags.
    #[must_use]
    pub fn new(uid: Uid) -> Self {
        Self {
            uid,
            label: None,
            tags: BTreeSet::new(),
        }
    }

    /// Creates a labeled entity.
    #[must_use]
    pub fn labeled(uid: Uid, label: &str) -> Self {
        Self {
            uid,
            label: Some(label.to_owned()),
            tags: BTreeSet::new(),
        }
    }

    /// Adds a tag, returning `self` for fixture-style chaining.
    #[must_use]
    pub fn with_tag(mut self, tag: &str) -> Self {
        self.tags.insert(tag.to_owned());
        self
    }

    /// Label when present, short uid otherwise.
    #[must_use]
    pub fn display_name(&self) -> String {
        self.label
            .clone()
            .unwrap_or_else(|| self.uid.short())
    }

    /// Returns `true` when `ident` names this entity by uid hex, short uid,
    /// or label.
    #[must_use]
    pub fn has_identifier(&self, ident: &str) -> bool {
        if self.uid.to_hex() == ident || self.uid.short() == ident {
            return true;
        }
        self.label.as_deref() == Some(ident)
    }

    /// Domain names activated by this entity's tags.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.tags
            .iter()
            .filter_map(|t| t.strip_prefix(DOMAIN_TAG_PREFIX))
    }

    /// Matches `attribute == value` and `has_<x>(value)` criteria against the
    /// base record. Unknown keys do not match.
    ///
    /// Supported keys: `uid`, `label`, `has_tag`, `has_label`,
    /// `has_identifier`.
    #[must_use]
    pub fn matches(&self, criteria: &Criteria) -> bool {
        criteria.iter().all(|(key, want)| self.matches_one(key, want))
    }

    pub(crate) fn matches_one(&self, key: &str, want: &Value) -> bool {
        match key {
            "uid" => match want {
                Value::Uid(u) => *u == self.uid,
                Value::Str(s) => self.uid.to_hex() == *s,
                _ => false,
            },
            "label" => match want {
                Value::Str(s) => self.label.as_deref() == Some(s),
                Value::Null => self.label.is_none(),
                _ => false,
            },
            "has_tag" => want
                .as_str()
                .is_some_and(|tag| self.tags.contains(tag)),
            "has_label" => want.as_str().is_some_and(|_| self.label.is_some()),
            "has_identifier" => want
                .as_str()
                .is_some_and(|ident| self.has_identifier(ident)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::make_uid;

    fn crit(key: &str, value: Value) -> Criteria {
        let mut c = Criteria::new();
        c.insert(key.to_owned(), value);
        c
    }

    #[test]
    fn matches_label_and_tags() {
        let e = Entity::labeled(make_uid("hero"), "hero").with_tag("actor");
        assert!(e.matches(&crit("label", Value::from("hero"))));
        assert!(e.matches(&crit("has_tag", Value::from("actor"))));
        assert!(!e.matches(&crit("has_tag", Value::from("prop"))));
        assert!(!e.matches(&crit("unknown_key", Value::from("x"))));
    }

    #[test]
    fn identifier_matches_uid_hex_short_and_label() {
        let e = Entity::labeled(make_uid("hero"), "hero");
        assert!(e.has_identifier("hero"));
        assert!(e.has_identifier(&e.uid.to_hex()));
        assert!(e.has_identifier(&e.uid.short()));
        assert!(!e.has_identifier("ghost"));
    }

    #[test]
    fn domain_tags_expose_suffixes() {
        let e = Entity::new(make_uid("scene")).with_tag("domain:tavern").with_tag("scene");
        let domains: Vec<&str> = e.domains().collect();
        assert_eq!(domains, vec!["tavern"]);
    }
}
