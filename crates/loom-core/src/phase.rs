// SPDX-License-Identifier: Apache-2.0
//! Resolution phases of the tick pipeline.

/// One stage of the seven-step tick pipeline, in strict execution order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Boolean gate; any `false` aborts the tick.
    Validate,
    /// Redirect handlers evaluated before planning; a returned available
    /// edge restarts the phase list on the new cursor.
    Prereqs,
    /// Provisioning: offers are collected, affordances linked, and
    /// dependencies bound.
    Planning,
    /// Entry effects and domain state transitions.
    Update,
    /// Redirect handlers evaluated after update; drives chained
    /// auto-traversal across ticks.
    Postreqs,
    /// Output fragment production.
    Journal,
    /// Final effects.
    Finalize,
}

impl Phase {
    /// All phases in execution order.
    pub const ALL: [Phase; 7] = [
        Phase::Validate,
        Phase::Prereqs,
        Phase::Planning,
        Phase::Update,
        Phase::Postreqs,
        Phase::Journal,
        Phase::Finalize,
    ];

    /// Stable lowercase name used in provenance records and diagnostics.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Validate => "validate",
            Self::Prereqs => "prereqs",
            Self::Planning => "planning",
            Self::Update => "update",
            Self::Postreqs => "postreqs",
            Self::Journal => "journal",
            Self::Finalize => "finalize",
        }
    }

    /// Parses the stable name produced by [`Phase::name`].
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.name() == name)
    }
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}
