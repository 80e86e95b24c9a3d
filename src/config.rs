//! Engine configuration.

use serde::Deserialize;

/// Tunables for the weaving engine.
///
/// All fields have defaults suitable for a production agent; the structure
/// deserializes from the agent's JSON config document with unknown fields
/// ignored, so catalogs can ship partial overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on distinct (class, loader) hierarchy entries kept
    /// resident. Transient loaders churn keys, so this is a hard cap, not a
    /// sizing hint.
    pub hierarchy_cache_capacity: usize,
    /// Upper bound on fully analyzed class snapshots kept resident.
    pub analysis_cache_capacity: usize,
    /// Internal (slash-form) name of the class the woven code dispatches
    /// into, e.g. `io/classweave/runtime/Dispatcher`.
    pub dispatch_class: String,
    /// Prefix for members injected by mixins, kept unlikely to collide with
    /// application identifiers.
    pub injected_member_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hierarchy_cache_capacity: 20_000,
            analysis_cache_capacity: 20_000,
            dispatch_class: "io/classweave/runtime/Dispatcher".to_string(),
            injected_member_prefix: "classweave$".to_string(),
        }
    }
}
