// Runtime configuration.
// Plain serde structs with defaults; the embedding application decides
// where the values come from (file, env, flags).

use serde::{Deserialize, Serialize};

fn default_candidate_limit() -> Option<usize> {
    None
}

fn default_conflict_retries() -> u32 {
    3
}

/// Knobs for candidate generation and commit behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Sample uniformly from the pre-limit candidate set instead of
    /// returning the deterministic ordering.
    #[serde(default)]
    pub randomize_allocation_candidates: bool,

    /// Applied when a request carries no limit of its own.
    #[serde(default = "default_candidate_limit")]
    pub default_candidate_limit: Option<usize>,

    /// Upper bound on internal transaction restarts a backend may
    /// perform on deadlock detection. The in-memory store never needs
    /// one; SQL backends honor it.
    #[serde(default = "default_conflict_retries")]
    pub max_commit_retries: u32,
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            randomize_allocation_candidates: false,
            default_candidate_limit: None,
            max_commit_retries: default_conflict_retries(),
        }
    }
}
