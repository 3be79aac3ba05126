//! Configuration loading from environment variables.
//!
//! All values are loaded from `KILN_CORE_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `KILN_CORE_GPU_LARGE_BLOCK_THRESHOLD` | 1048576 | Pool size-class split (bytes) |
//! | `KILN_CORE_GPU_BLOCK_GRANULARITY` | 512 | Request round-up granularity (bytes) |
//! | `KILN_CORE_GPU_FREE_POOL_BUDGET` | 1073741824 | Resident free-block budget (bytes) |

/// Tuning knobs for the caching device allocator pools.
#[derive(Debug, Clone)]
pub struct CachingAllocatorConfig {
    /// Requests at or above this size go to the large-block pool.
    pub large_block_threshold: usize,
    /// Requested sizes are rounded up to a multiple of this before pooling.
    pub block_granularity: usize,
    /// Non-busy pooled bytes above this budget are physically freed on release.
    pub free_pool_budget: usize,
}

impl Default for CachingAllocatorConfig {
    fn default() -> Self {
        Self {
            large_block_threshold: 1024 * 1024,
            block_granularity: 512,
            free_pool_budget: 1024 * 1024 * 1024,
        }
    }
}

impl CachingAllocatorConfig {
    /// Load configuration from `KILN_CORE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            large_block_threshold: parse_usize(
                "KILN_CORE_GPU_LARGE_BLOCK_THRESHOLD",
                defaults.large_block_threshold,
            ),
            block_granularity: parse_usize(
                "KILN_CORE_GPU_BLOCK_GRANULARITY",
                defaults.block_granularity,
            )
            .max(1),
            free_pool_budget: parse_usize(
                "KILN_CORE_GPU_FREE_POOL_BUDGET",
                defaults.free_pool_budget,
            ),
        }
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}
