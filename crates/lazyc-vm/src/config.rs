//! Loader configuration

use serde::{Deserialize, Serialize};

/// Limits and switches for one hydration context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Maximum number of simultaneously active invocation records
    pub max_record_depth: usize,
    /// Largest private stack a construction record may declare
    pub max_stack_size: usize,
    /// Resolve two-instruction fragments by a direct decode during full
    /// hydration instead of running them
    pub direct_decode: bool,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_record_depth: 4096,
            max_stack_size: 1 << 16,
            direct_decode: true,
        }
    }
}

impl LoaderConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the record depth limit
    pub fn max_record_depth(mut self, depth: usize) -> Self {
        self.max_record_depth = depth;
        self
    }

    /// Set the per-record stack limit
    pub fn max_stack_size(mut self, size: usize) -> Self {
        self.max_stack_size = size;
        self
    }

    /// Enable or disable the direct-decode fast path
    pub fn direct_decode(mut self, enabled: bool) -> Self {
        self.direct_decode = enabled;
        self
    }
}
