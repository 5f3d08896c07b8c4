// SPDX-License-Identifier: Apache-2.0
//! Runtime configuration.

/// Tunable bounds of the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Full snapshots are taken every this many patches.
    pub snapshot_cadence: usize,
    /// Maximum cursor handoffs per driver step.
    pub auto_traversal_bound: usize,
    /// Maximum effects emitted per tick.
    pub max_effects_per_tick: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            snapshot_cadence: 100,
            auto_traversal_bound: 64,
            max_effects_per_tick: 10_000,
        }
    }
}

impl RuntimeConfig {
    /// Builds a config from defaults overridden by environment variables.
    ///
    /// Recognized variables: `LOOM_SNAPSHOT_CADENCE`,
    /// `LOOM_AUTO_TRAVERSAL_BOUND`, `LOOM_MAX_EFFECTS_PER_TICK`. Unparsable
    /// or zero values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_usize("LOOM_SNAPSHOT_CADENCE") {
            config.snapshot_cadence = v;
        }
        if let Some(v) = env_usize("LOOM_AUTO_TRAVERSAL_BOUND") {
            config.auto_traversal_bound = v;
        }
        if let Some(v) = env_usize("LOOM_MAX_EFFECTS_PER_TICK") {
            config.max_effects_per_tick = v;
        }
        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse::<usize>().ok())
        .filter(|v| *v > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_bounds() {
        let config = RuntimeConfig::default();
        assert_eq!(config.snapshot_cadence, 100);
        assert_eq!(config.auto_traversal_bound, 64);
        assert_eq!(config.max_effects_per_tick, 10_000);
    }
}
